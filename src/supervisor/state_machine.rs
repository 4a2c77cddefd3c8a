use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::current_timestamp;

/// Lifecycle state of one server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Offline,
    Starting,
    Online,
    Stopping,
    Crashed,
}

impl ProcessState {
    /// 사용자 입장에서 더 이상 진행 중인 작업이 없는 상태
    pub fn is_settled(self) -> bool {
        matches!(self, ProcessState::Offline | ProcessState::Crashed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Offline => "offline",
            ProcessState::Starting => "starting",
            ProcessState::Online => "online",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        }
    }
}

/// Why a transition happened. Lets clients tell "you stopped it" apart from "it died".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Requested,
    Ready,
    SpawnFailed,
    StartupTimeout,
    UnexpectedExit,
    ConsoleStop,
    Exited,
    Acknowledged,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(ProcessState, ProcessState),
}

/// One emitted status event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub previous: ProcessState,
    pub status: ProcessState,
    pub cause: TransitionCause,
    pub timestamp: u64,
}

#[derive(Debug)]
pub struct StateMachine {
    state: ProcessState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { state: ProcessState::Offline }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn can_transition(&self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self.state, to),
            (Offline, Starting)
                | (Starting, Online)
                | (Starting, Crashed)
                | (Starting, Offline)
                | (Online, Stopping)
                | (Online, Crashed)
                | (Stopping, Offline)
                | (Crashed, Offline)
        )
    }

    pub fn transition(
        &mut self,
        to: ProcessState,
        cause: TransitionCause,
    ) -> Result<StatusChange, TransitionError> {
        if !self.can_transition(to) {
            return Err(TransitionError::InvalidTransition(self.state, to));
        }
        let change = StatusChange {
            previous: self.state,
            status: to,
            cause,
            timestamp: current_timestamp(),
        };
        self.state = to;
        Ok(change)
    }
}
