use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

/// Daemon-wide settings, read from `config/global.toml` (or `$MINEGIMME_CONFIG`).
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    pub listen_addr: String,
    /// 서버 인스턴스 디렉토리들이 위치하는 루트
    pub servers_dir: PathBuf,
    /// Program plus leading args used in place of `java` (e.g. `["nice", "-n", "5", "java"]`).
    pub java_command: Vec<String>,
    pub console_backlog: usize,
    pub startup_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub file_scan_interval_secs: u64,
    pub file_debounce_ms: u64,
    /// Outbound queue depth per WebSocket connection.
    pub connection_queue: usize,
    /// Largest accepted `files/upload` body, in MiB.
    pub max_upload_mb: u64,
    /// Per-engine overrides keyed by engine name (`vanilla`, `paper`, ...).
    pub engines: HashMap<String, EngineOverrides>,
}

/// Console sentinels and launch tweaks for one engine type.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct EngineOverrides {
    pub ready_pattern: Option<String>,
    pub shutdown_pattern: Option<String>,
    pub stop_command: Option<String>,
    pub extra_args: Option<Vec<String>>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:25401".to_string(),
            servers_dir: PathBuf::from("./servers"),
            java_command: vec!["java".to_string()],
            console_backlog: 200,
            startup_timeout_secs: 120,
            shutdown_timeout_secs: 30,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            file_scan_interval_secs: 10,
            file_debounce_ms: 300,
            connection_queue: 512,
            max_upload_mb: 1024,
            engines: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load from `$MINEGIMME_CONFIG` or `config/global.toml`.
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("MINEGIMME_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn file_scan_interval(&self) -> Duration {
        Duration::from_secs(self.file_scan_interval_secs.max(1))
    }

    pub fn file_debounce(&self) -> Duration {
        Duration::from_millis(self.file_debounce_ms)
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn engine_overrides(&self, engine: &str) -> Option<&EngineOverrides> {
        self.engines.get(engine)
    }
}
