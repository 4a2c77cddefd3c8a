//! Engine profiles: how each server implementation is launched and how its
//! console output is read back.

use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::GlobalConfig;
use crate::instance::{EngineType, ServerInstance};
use crate::supervisor::error::SupervisorError;

pub mod versions;

pub use versions::VersionCatalog;

/// Start of a server-thread INFO line: vanilla `[12:00:00] [Server thread/INFO]: `
/// or Paper `[12:00:00 INFO]: `. Chat lines continue with `<name>` after it.
const LOG_PREFIX: &str = r"^(?:\[[^\]]+\] \[[^\]/]+/INFO\]|\[[^\] ]+ INFO\]): ";

const DEFAULT_READY_PATTERN: &str = r"Done \(\d+(?:\.\d+)?s\)!";
const DEFAULT_SHUTDOWN_PATTERN: &str = r"Stopping (?:the )?server\s*$";
const DEFAULT_STOP_COMMAND: &str = "stop";

/// Minecraft-style `[thread/LEVEL]` as well as Paper's `[HH:MM:SS LEVEL]`.
const LEVEL_PATTERN: &str =
    r"[/ ](?P<level>INFO|WARN|WARNING|ERROR|SEVERE|FATAL|DEBUG|TRACE)\]";
const JOIN_PATTERN: &str = r"(?P<name>[A-Za-z0-9_]{1,16}) joined the game\s*$";
const LEAVE_PATTERN: &str = r"(?P<name>[A-Za-z0-9_]{1,16}) left the game\s*$";
const LIST_PATTERN: &str =
    r"There are (?P<count>\d+) of a max(?: of)? (?P<max>\d+) players online:?(?P<names>.*)$";
const EULA_PATTERN: &str = r"(?i)agree to the eula";

/// Compiled console sentinels for one engine type.
#[derive(Debug, Clone)]
pub struct EngineProfile {
    pub engine: EngineType,
    pub ready: Regex,
    pub shutdown: Regex,
    pub level: Regex,
    pub join: Regex,
    pub leave: Regex,
    pub list: Regex,
    pub eula: Regex,
    pub stop_command: String,
    pub extra_args: Vec<String>,
}

impl EngineProfile {
    /// Build the profile for `engine`, applying `[engines.<type>]` overrides.
    pub fn resolve(engine: EngineType, config: &GlobalConfig) -> Result<Arc<Self>> {
        let overrides = config.engine_overrides(engine.as_str()).cloned().unwrap_or_default();
        // 설정에서 지정한 패턴은 그대로 사용, 기본값만 로그 접두사에 고정
        let ready = overrides.ready_pattern.clone().unwrap_or_else(|| anchored(DEFAULT_READY_PATTERN));
        let shutdown = overrides
            .shutdown_pattern
            .clone()
            .unwrap_or_else(|| anchored(DEFAULT_SHUTDOWN_PATTERN));

        Ok(Arc::new(Self {
            engine,
            ready: compile(&ready, "ready_pattern")?,
            shutdown: compile(&shutdown, "shutdown_pattern")?,
            level: compile(LEVEL_PATTERN, "level")?,
            join: compile(&anchored(JOIN_PATTERN), "join")?,
            leave: compile(&anchored(LEAVE_PATTERN), "leave")?,
            list: compile(&anchored(LIST_PATTERN), "list")?,
            eula: compile(EULA_PATTERN, "eula")?,
            stop_command: overrides
                .stop_command
                .unwrap_or_else(|| DEFAULT_STOP_COMMAND.to_string()),
            extra_args: overrides.extra_args.unwrap_or_default(),
        }))
    }
}

fn anchored(body: &str) -> String {
    format!("{}{}", LOG_PREFIX, body)
}

fn compile(pattern: &str, what: &str) -> Result<Regex> {
    Regex::new(pattern).with_context(|| format!("invalid {} regex '{}'", what, pattern))
}

/// A fully resolved command line, ready for `tokio::process::Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// `<java_command...> -Xms<min>M -Xmx<max>M <extra_args...> -jar <jar> nogui`
    pub fn build(
        config: &GlobalConfig,
        profile: &EngineProfile,
        instance: &ServerInstance,
    ) -> std::result::Result<Self, SupervisorError> {
        let (program, leading) = config
            .java_command
            .split_first()
            .ok_or_else(|| SupervisorError::SpawnFailed("java_command is empty".into()))?;

        let mut args: Vec<String> = leading.to_vec();
        args.push(format!("-Xms{}M", instance.min_ram));
        args.push(format!("-Xmx{}M", instance.max_ram));
        args.extend(profile.extra_args.iter().cloned());
        args.push("-jar".to_string());
        args.push(instance.jar_file.clone());
        args.push("nogui".to_string());

        Ok(Self { program: program.clone(), args })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOverrides;
    use crate::instance::InstanceSpec;
    use std::path::PathBuf;

    fn instance() -> ServerInstance {
        ServerInstance::from_spec(
            InstanceSpec {
                name: "s1".into(),
                engine: EngineType::Paper,
                version: "1.20.4".into(),
                min_ram: 1024,
                max_ram: 2048,
                port: 25565,
                max_players: 20,
            },
            PathBuf::from("/srv/s1"),
        )
    }

    #[test]
    fn default_sentinels_match_vanilla_output() {
        let profile = EngineProfile::resolve(EngineType::Vanilla, &GlobalConfig::default()).unwrap();
        assert!(profile
            .ready
            .is_match("[12:00:01] [Server thread/INFO]: Done (5.123s)! For help, type \"help\""));
        assert!(!profile.ready.is_match("[12:00:01] [Server thread/INFO]: Done preparing level"));
        assert!(profile.shutdown.is_match("[12:10:00] [Server thread/INFO]: Stopping server"));
        assert!(profile.shutdown.is_match("[12:10:00 INFO]: Stopping the server"));
        assert_eq!(profile.stop_command, "stop");
    }

    #[test]
    fn chat_lines_do_not_match_sentinels() {
        let profile = EngineProfile::resolve(EngineType::Paper, &GlobalConfig::default()).unwrap();
        for line in [
            "[12:00:02] [Server thread/INFO]: <Steve> Stopping server",
            "[12:00:02] [Server thread/INFO]: <Steve> Stopping server is a funny phrase",
            "[12:00:02 INFO]: <Steve> Stopping the server",
            "[12:00:02] [Server thread/INFO]: Stopping server now, said nobody",
        ] {
            assert!(!profile.shutdown.is_match(line), "{}", line);
        }
        assert!(!profile
            .ready
            .is_match("[12:00:02] [Async Chat Thread - #0/INFO]: <Steve> Done (1.0s)! For help"));
        assert!(!profile.ready.is_match("[12:00:02 INFO]: <Steve> Done (1.0s)!"));
        assert!(profile.ready.is_match("[12:00:01 INFO]: Done (3.456s)! For help, type \"help\""));
        assert!(!profile.join.is_match("[12:00:02] [Server thread/INFO]: <Bob> Steve joined the game"));
        assert!(!profile.leave.is_match("[12:00:02 INFO]: <Bob> Steve left the game"));
        assert!(profile.join.is_match("[12:00:02 INFO]: Steve joined the game"));
    }

    #[test]
    fn overrides_replace_sentinels() {
        let mut config = GlobalConfig::default();
        config.engines.insert(
            "fabric".into(),
            EngineOverrides {
                ready_pattern: Some("Server ready".into()),
                stop_command: Some("shutdown".into()),
                extra_args: Some(vec!["-XX:+UseG1GC".into()]),
                ..Default::default()
            },
        );
        let fabric = EngineProfile::resolve(EngineType::Fabric, &config).unwrap();
        assert!(fabric.ready.is_match("Server ready"));
        assert_eq!(fabric.stop_command, "shutdown");
        // 다른 엔진에는 영향 없음
        let paper = EngineProfile::resolve(EngineType::Paper, &config).unwrap();
        assert_eq!(paper.stop_command, "stop");
    }

    #[test]
    fn invalid_override_is_reported() {
        let mut config = GlobalConfig::default();
        config.engines.insert(
            "paper".into(),
            EngineOverrides { ready_pattern: Some("Done (".into()), ..Default::default() },
        );
        assert!(EngineProfile::resolve(EngineType::Paper, &config).is_err());
    }

    #[test]
    fn launch_command_layout() {
        let mut config = GlobalConfig::default();
        config.java_command = vec!["nice".into(), "-n".into(), "5".into(), "java".into()];
        let mut overrides = EngineOverrides::default();
        overrides.extra_args = Some(vec!["-XX:+UseG1GC".into()]);
        config.engines.insert("paper".into(), overrides);
        let profile = EngineProfile::resolve(EngineType::Paper, &config).unwrap();

        let cmd = LaunchCommand::build(&config, &profile, &instance()).unwrap();
        assert_eq!(cmd.program, "nice");
        assert_eq!(
            cmd.args,
            vec!["-n", "5", "java", "-Xms1024M", "-Xmx2048M", "-XX:+UseG1GC", "-jar", "server.jar", "nogui"]
        );
        assert!(cmd.display().starts_with("nice -n 5 java -Xms1024M"));
    }

    #[test]
    fn empty_java_command_fails() {
        let mut config = GlobalConfig::default();
        config.java_command.clear();
        let profile = EngineProfile::resolve(EngineType::Paper, &config).unwrap();
        assert!(matches!(
            LaunchCommand::build(&config, &profile, &instance()),
            Err(SupervisorError::SpawnFailed(_))
        ));
    }
}
