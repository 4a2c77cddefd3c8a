//! Supervisor 전용 에러 타입: 에러 종류를 구분하여 IPC 핸들러와
//! WebSocket 연결에서 적절한 상태 코드/에러 코드를 반환할 수 있게 합니다.

use axum::http::StatusCode;

use super::state_machine::TransitionError;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to spawn server process: {0}")]
    SpawnFailed(String),

    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    #[error("Server '{0}' has no running process")]
    NotRunning(String),

    #[error("Server '{0}' is offline")]
    ServerOffline(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Server name '{0}' is already taken")]
    NameTaken(String),

    #[error("Invalid server spec: {0}")]
    InvalidSpec(String),

    #[error("Server '{0}' is running")]
    ServerRunning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Server '{0}' requires the EULA to be accepted before starting")]
    EulaNotAccepted(String),

    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),

    #[error("Payload too large: {0}")]
    TooLarge(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NameTaken(_)
            | Self::ServerRunning(_)
            | Self::ServerOffline(_)
            | Self::NotRunning(_)
            | Self::PortInUse(_)
            | Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::InvalidSpec(_) | Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
            Self::EulaNotAccepted(_) => StatusCode::PRECONDITION_REQUIRED,
            Self::MissingArtifact(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Download(_) => StatusCode::BAD_GATEWAY,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            Self::SpawnFailed(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::PortInUse(_) => "PORT_IN_USE",
            Self::MissingArtifact(_) => "MISSING_ARTIFACT",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::ServerOffline(_) => "SERVER_OFFLINE",
            Self::InvalidPath(_) => "INVALID_PATH",
            Self::NameTaken(_) => "NAME_TAKEN",
            Self::InvalidSpec(_) => "INVALID_SPEC",
            Self::ServerRunning(_) => "SERVER_RUNNING",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Timeout(_) => "TIMEOUT",
            Self::EulaNotAccepted(_) => "EULA_NOT_ACCEPTED",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::TooLarge(_) => "PAYLOAD_TOO_LARGE",
            Self::Download(_) => "DOWNLOAD_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
