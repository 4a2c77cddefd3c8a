//! `server.properties` reader/writer that keeps comments and key order intact.

use std::collections::BTreeMap;
use std::path::Path;

use super::ServerInstance;

pub const PROPERTIES_FILE: &str = "server.properties";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry { key: String, value: String },
    Raw(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerProperties {
    lines: Vec<Line>,
}

impl ServerProperties {
    pub fn parse(content: &str) -> Self {
        let lines = content
            .lines()
            .map(|raw| {
                let trimmed = raw.trim_start();
                if trimmed.starts_with('#') || trimmed.starts_with('!') {
                    return Line::Raw(raw.to_string());
                }
                match raw.split_once('=') {
                    Some((k, v)) if !k.trim().is_empty() => Line::Entry {
                        key: k.trim().to_string(),
                        value: v.trim().to_string(),
                    },
                    _ => Line::Raw(raw.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    /// Missing file reads as empty.
    pub fn load(directory: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(directory.join(PROPERTIES_FILE)) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, directory: &Path) -> std::io::Result<()> {
        std::fs::write(directory.join(PROPERTIES_FILE), self.render())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|l| match l {
            Line::Entry { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for line in &mut self.lines {
            if let Line::Entry { key: k, value: v } = line {
                if k == key {
                    *v = value;
                    return;
                }
            }
        }
        self.lines.push(Line::Entry { key: key.to_string(), value });
    }

    pub fn entries(&self) -> BTreeMap<String, String> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Entry { key, value } => Some((key.clone(), value.clone())),
                Line::Raw(_) => None,
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { key, value } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
                Line::Raw(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    /// 인스턴스 설정(포트, 최대 인원)을 server.properties 에 반영
    pub fn sync_from_instance(directory: &Path, instance: &ServerInstance) -> std::io::Result<()> {
        let mut props = Self::load(directory)?;
        props.set("server-port", instance.port.to_string());
        props.set("max-players", instance.max_players.to_string());
        if props.get("motd").is_none() {
            props.set("motd", format!("{} ({})", instance.name, instance.engine));
        }
        props.save(directory)
    }
}
