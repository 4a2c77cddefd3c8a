use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::supervisor::error::SupervisorError;

pub mod properties;

pub use properties::ServerProperties;

/// 인스턴스 설정 파일 이름 (서버 디렉토리마다 하나)
pub const INSTANCE_FILE: &str = "server.json";
pub const EULA_FILE: &str = "eula.txt";
pub const DEFAULT_JAR: &str = "server.jar";

const MIN_RAM_MB: u32 = 256;
const MAX_PLAYERS_LIMIT: u32 = 1000;

/// Minecraft server implementation variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Vanilla,
    Paper,
    Fabric,
    Purpur,
}

impl EngineType {
    pub const ALL: [EngineType; 4] = [
        EngineType::Vanilla,
        EngineType::Paper,
        EngineType::Fabric,
        EngineType::Purpur,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineType::Vanilla => "vanilla",
            EngineType::Paper => "paper",
            EngineType::Fabric => "fabric",
            EngineType::Purpur => "purpur",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = SupervisorError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vanilla" => Ok(EngineType::Vanilla),
            "paper" => Ok(EngineType::Paper),
            "fabric" => Ok(EngineType::Fabric),
            "purpur" => Ok(EngineType::Purpur),
            other => Err(SupervisorError::InvalidSpec(format!("unknown server type '{}'", other))),
        }
    }
}

/// Creation request for a new server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub engine: EngineType,
    pub version: String,
    #[serde(default = "default_min_ram")]
    pub min_ram: u32,
    #[serde(default = "default_max_ram")]
    pub max_ram: u32,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
}

fn default_min_ram() -> u32 {
    1024
}

fn default_max_ram() -> u32 {
    2048
}

fn default_port() -> u16 {
    25565
}

fn default_max_players() -> u32 {
    20
}

fn default_jar() -> String {
    DEFAULT_JAR.to_string()
}

impl InstanceSpec {
    pub fn validate(&self) -> std::result::Result<(), SupervisorError> {
        validate_name(&self.name)?;
        if self.version.trim().is_empty() {
            return Err(SupervisorError::InvalidSpec("version must not be empty".into()));
        }
        validate_limits(self.port, self.max_players, self.min_ram, self.max_ram)
    }
}

/// 이름은 디렉토리 이름으로 그대로 쓰이므로 안전한 문자만 허용
pub fn validate_name(name: &str) -> std::result::Result<(), SupervisorError> {
    if name.is_empty() || name.len() > 64 {
        return Err(SupervisorError::InvalidSpec(
            "name must be between 1 and 64 characters".into(),
        ));
    }
    if name.starts_with('.') {
        return Err(SupervisorError::InvalidSpec("name must not start with '.'".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(SupervisorError::InvalidSpec(format!(
            "name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

fn validate_limits(
    port: u16,
    max_players: u32,
    min_ram: u32,
    max_ram: u32,
) -> std::result::Result<(), SupervisorError> {
    if port < 1024 {
        return Err(SupervisorError::InvalidSpec(format!("port {} is reserved", port)));
    }
    if max_players == 0 || max_players > MAX_PLAYERS_LIMIT {
        return Err(SupervisorError::InvalidSpec(format!(
            "maxPlayers must be between 1 and {}",
            MAX_PLAYERS_LIMIT
        )));
    }
    if min_ram < MIN_RAM_MB {
        return Err(SupervisorError::InvalidSpec(format!(
            "minRam must be at least {} MB",
            MIN_RAM_MB
        )));
    }
    if min_ram > max_ram {
        return Err(SupervisorError::InvalidSpec("minRam must not exceed maxRam".into()));
    }
    Ok(())
}

/// 서버 인스턴스 - 서버 디렉토리의 server.json 에 저장됨
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    pub name: String,                  // 고유 이름 (디렉토리 이름과 동일)
    #[serde(rename = "type")]
    pub engine: EngineType,            // vanilla / paper / fabric / purpur
    pub version: String,               // 마인크래프트 버전 (예: "1.20.4")
    pub port: u16,                     // server-port
    pub max_players: u32,              // max-players
    pub min_ram: u32,                  // -Xms (MB)
    pub max_ram: u32,                  // -Xmx (MB)
    #[serde(default = "default_jar")]
    pub jar_file: String,              // 실행할 jar 파일 (서버 디렉토리 기준)
    #[serde(default)]
    pub created_at: u64,
    #[serde(skip)]
    pub directory: PathBuf,            // 작업 디렉토리 (저장하지 않음)
}

/// Partial update for an offline server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub port: Option<u16>,
    pub max_players: Option<u32>,
    pub min_ram: Option<u32>,
    pub max_ram: Option<u32>,
}

impl ServerInstance {
    pub fn from_spec(spec: InstanceSpec, directory: PathBuf) -> Self {
        Self {
            name: spec.name,
            engine: spec.engine,
            version: spec.version.trim().to_string(),
            port: spec.port,
            max_players: spec.max_players,
            min_ram: spec.min_ram,
            max_ram: spec.max_ram,
            jar_file: default_jar(),
            created_at: crate::utils::current_timestamp(),
            directory,
        }
    }

    /// Read `server.json` from a server directory.
    pub fn load(directory: &Path) -> Result<Self> {
        let path = directory.join(INSTANCE_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut instance: Self = serde_json::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        instance.directory = directory.to_path_buf();
        Ok(instance)
    }

    /// Write `server.json` atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.directory)?;
        tmp.write_all(content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(self.directory.join(INSTANCE_FILE))
            .map_err(|e| anyhow::anyhow!("saving {}: {}", INSTANCE_FILE, e.error))?;
        tracing::debug!("Saved instance config for '{}'", self.name);
        Ok(())
    }

    pub fn jar_path(&self) -> PathBuf {
        self.directory.join(&self.jar_file)
    }

    /// Apply a patch, validating the merged result before mutating anything.
    pub fn apply(&mut self, patch: &SettingsPatch) -> std::result::Result<(), SupervisorError> {
        let port = patch.port.unwrap_or(self.port);
        let max_players = patch.max_players.unwrap_or(self.max_players);
        let min_ram = patch.min_ram.unwrap_or(self.min_ram);
        let max_ram = patch.max_ram.unwrap_or(self.max_ram);
        validate_limits(port, max_players, min_ram, max_ram)?;
        self.port = port;
        self.max_players = max_players;
        self.min_ram = min_ram;
        self.max_ram = max_ram;
        Ok(())
    }
}

// ─── EULA ────────────────────────────────────────────────────

/// `eula.txt` 에 `eula=true` 가 있는지 확인
pub fn eula_accepted(directory: &Path) -> bool {
    match std::fs::read_to_string(directory.join(EULA_FILE)) {
        Ok(content) => content
            .lines()
            .map(|l| l.trim().to_ascii_lowercase())
            .any(|l| l.replace(' ', "") == "eula=true"),
        Err(_) => false,
    }
}

pub fn accept_eula(directory: &Path) -> std::io::Result<()> {
    let content = format!(
        "#By changing the setting below to TRUE you are indicating your agreement to our EULA (https://aka.ms/MinecraftEULA).\n#Accepted via MineGimme at {}\neula=true\n",
        crate::utils::current_timestamp()
    );
    std::fs::write(directory.join(EULA_FILE), content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> InstanceSpec {
        InstanceSpec {
            name: name.to_string(),
            engine: EngineType::Paper,
            version: "1.20.4".to_string(),
            min_ram: 1024,
            max_ram: 2048,
            port: 25565,
            max_players: 20,
        }
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec("s1").validate().is_ok());
        assert!(spec("my_server-2.old").validate().is_ok());
        assert!(spec("").validate().is_err());
        assert!(spec("../evil").validate().is_err());
        assert!(spec(".hidden").validate().is_err());
        assert!(spec("with space").validate().is_err());

        let mut s = spec("s1");
        s.min_ram = 4096;
        assert!(matches!(s.validate(), Err(SupervisorError::InvalidSpec(_))));

        let mut s = spec("s1");
        s.port = 80;
        assert!(s.validate().is_err());

        let mut s = spec("s1");
        s.version = "  ".into();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let s: InstanceSpec =
            serde_json::from_str(r#"{"name":"s1","type":"fabric","version":"1.21"}"#).unwrap();
        assert_eq!(s.engine, EngineType::Fabric);
        assert_eq!(s.port, 25565);
        assert_eq!(s.max_ram, 2048);
        assert!(serde_json::from_str::<InstanceSpec>(
            r#"{"name":"s1","type":"forge","version":"1.21"}"#
        )
        .is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip_keeps_directory() {
        let dir = tempfile::tempdir().unwrap();
        let instance = ServerInstance::from_spec(spec("s1"), dir.path().to_path_buf());
        instance.save().unwrap();

        let raw = std::fs::read_to_string(dir.path().join(INSTANCE_FILE)).unwrap();
        assert!(raw.contains("\"maxPlayers\": 20"));
        assert!(raw.contains("\"type\": \"paper\""));

        let loaded = ServerInstance::load(dir.path()).unwrap();
        assert_eq!(loaded.name, "s1");
        assert_eq!(loaded.directory, dir.path());
        assert_eq!(loaded.jar_path(), dir.path().join("server.jar"));
    }

    #[test]
    fn test_apply_patch_is_all_or_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut instance = ServerInstance::from_spec(spec("s1"), dir.path().to_path_buf());
        let bad = SettingsPatch { port: Some(25570), min_ram: Some(8192), ..Default::default() };
        assert!(instance.apply(&bad).is_err());
        assert_eq!(instance.port, 25565);

        let good = SettingsPatch { port: Some(25570), max_players: Some(50), ..Default::default() };
        instance.apply(&good).unwrap();
        assert_eq!(instance.port, 25570);
        assert_eq!(instance.max_players, 50);
    }

    #[test]
    fn test_eula() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!eula_accepted(dir.path()));
        std::fs::write(dir.path().join(EULA_FILE), "eula=false\n").unwrap();
        assert!(!eula_accepted(dir.path()));
        accept_eula(dir.path()).unwrap();
        assert!(eula_accepted(dir.path()));
        std::fs::write(dir.path().join(EULA_FILE), "#comment\nEULA=TRUE\n").unwrap();
        assert!(eula_accepted(dir.path()));
    }
}
