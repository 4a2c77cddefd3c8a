//! WebSocket message types. JSON text frames, tagged by `type` (server to
//! client) and `action` (client to server).

use serde::{Deserialize, Serialize};

use crate::files::{FileChange, FileEntry};
use crate::supervisor::console::ConsoleLine;
use crate::supervisor::error::SupervisorError;
use crate::supervisor::state_machine::{ProcessState, StatusChange, TransitionCause};
use crate::utils::current_timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    FileInit {
        files: Vec<FileEntry>,
    },
    FileUpdate {
        changes: Vec<FileChange>,
    },
    Console {
        #[serde(flatten)]
        line: ConsoleLine,
    },
    Status {
        status: ProcessState,
        /// Absent in the snapshot sent on attach.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous: Option<ProcessState>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<TransitionCause>,
        timestamp: u64,
    },
    PlayerUpdate {
        players: Vec<String>,
    },
    NeedEula {
        message: String,
    },
    Error {
        message: String,
        code: String,
    },
    Ping {
        timestamp: u64,
    },
}

impl ServerMessage {
    pub fn snapshot(status: ProcessState) -> Self {
        ServerMessage::Status {
            status,
            previous: None,
            cause: None,
            timestamp: current_timestamp(),
        }
    }

    pub fn error(message: impl Into<String>, code: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into(), code: code.into() }
    }

    pub fn ping() -> Self {
        ServerMessage::Ping { timestamp: current_timestamp() }
    }
}

impl From<StatusChange> for ServerMessage {
    fn from(change: StatusChange) -> Self {
        ServerMessage::Status {
            status: change.status,
            previous: Some(change.previous),
            cause: Some(change.cause),
            timestamp: change.timestamp,
        }
    }
}

impl From<ConsoleLine> for ServerMessage {
    fn from(line: ConsoleLine) -> Self {
        ServerMessage::Console { line }
    }
}

/// EULA 미동의는 `need_eula`, 나머지는 `error`
impl From<&SupervisorError> for ServerMessage {
    fn from(err: &SupervisorError) -> Self {
        match err {
            SupervisorError::EulaNotAccepted(_) => ServerMessage::NeedEula { message: err.to_string() },
            _ => ServerMessage::error(err.to_string(), err.error_code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Start,
    Stop,
    Restart,
    Command { command: String },
    Pong,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::console::{LineKind, LogSource};
    use serde_json::json;

    #[test]
    fn client_actions_parse() {
        let parse = |v: serde_json::Value| serde_json::from_value::<ClientAction>(v).unwrap();
        assert_eq!(parse(json!({"action": "start"})), ClientAction::Start);
        assert_eq!(parse(json!({"action": "stop"})), ClientAction::Stop);
        assert_eq!(parse(json!({"action": "restart"})), ClientAction::Restart);
        assert_eq!(
            parse(json!({"action": "command", "command": "list"})),
            ClientAction::Command { command: "list".into() }
        );
        assert_eq!(parse(json!({"action": "pong"})), ClientAction::Pong);
        assert_eq!(parse(json!({"action": "teleport"})), ClientAction::Unknown);
        assert!(serde_json::from_value::<ClientAction>(json!({"command": "list"})).is_err());
    }

    #[test]
    fn console_message_is_flat() {
        let msg = ServerMessage::from(ConsoleLine {
            id: 7,
            timestamp: 1700000000,
            source: LogSource::Stdout,
            classification: LineKind::Info,
            text: "hello".into(),
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "console",
                "id": 7,
                "timestamp": 1700000000,
                "source": "stdout",
                "classification": "info",
                "text": "hello"
            })
        );
    }

    #[test]
    fn status_messages() {
        let change = StatusChange {
            previous: ProcessState::Starting,
            status: ProcessState::Online,
            cause: TransitionCause::Ready,
            timestamp: 42,
        };
        assert_eq!(
            serde_json::to_value(ServerMessage::from(change)).unwrap(),
            json!({"type": "status", "status": "online", "previous": "starting", "cause": "ready", "timestamp": 42})
        );

        let snapshot = serde_json::to_value(ServerMessage::snapshot(ProcessState::Offline)).unwrap();
        assert_eq!(snapshot["type"], "status");
        assert_eq!(snapshot["status"], "offline");
        assert!(snapshot.get("previous").is_none());
    }

    #[test]
    fn errors_map_to_messages() {
        let eula = ServerMessage::from(&SupervisorError::EulaNotAccepted("s1".into()));
        assert!(matches!(eula, ServerMessage::NeedEula { .. }));

        let offline = serde_json::to_value(ServerMessage::from(&SupervisorError::ServerOffline("s1".into()))).unwrap();
        assert_eq!(offline["type"], "error");
        assert_eq!(offline["code"], "SERVER_OFFLINE");

        assert_eq!(serde_json::to_value(ServerMessage::ping()).unwrap()["type"], "ping");
        assert_eq!(
            serde_json::to_value(ServerMessage::PlayerUpdate { players: vec!["Steve".into()] }).unwrap(),
            json!({"type": "player_update", "players": ["Steve"]})
        );
    }
}
