pub mod handlers;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, patch, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::engine::VersionCatalog;
use crate::hub::ConnectionHub;
use crate::instance::{InstanceSpec, SettingsPatch};
use crate::supervisor::Supervisor;
use handlers::{console, files, server};

/// IPC 요청/응답 타입
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServerRequest {
    #[serde(flatten)]
    pub spec: InstanceSpec,
    /// Download the engine jar in the background after creating.
    #[serde(default)]
    pub download: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStopRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

pub type SettingsRequest = SettingsPatch;
pub type PropertiesRequest = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZipRequest {
    pub paths: Vec<String>,
    pub dest: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnzipRequest {
    pub archive: String,
    #[serde(default)]
    pub dest: String,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub hub: Arc<ConnectionHub>,
    pub catalog: Arc<VersionCatalog>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        hub: Arc<ConnectionHub>,
        catalog: Arc<VersionCatalog>,
        listen_addr: &str,
    ) -> Self {
        Self {
            supervisor,
            hub,
            catalog,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/servers", get(server::list_servers).post(server::create_server))
            .route("/api/versions", get(server::list_engine_types))
            .route("/api/versions/:type", get(server::list_versions))
            .route("/api/servers/:name", get(server::get_server).delete(server::delete_server))
            .route("/api/servers/:name/settings", patch(server::update_settings))
            .route(
                "/api/servers/:name/properties",
                get(server::get_properties).put(server::update_properties),
            )
            .route("/api/servers/:name/start", post(server::start_server))
            .route("/api/servers/:name/stop", post(server::stop_server))
            .route("/api/servers/:name/restart", post(server::restart_server))
            .route("/api/servers/:name/kill", post(server::kill_server))
            .route("/api/servers/:name/command", post(console::submit_command))
            .route("/api/servers/:name/console", get(console::console_lines))
            .route("/api/servers/:name/eula", get(server::get_eula))
            .route("/api/servers/:name/eula/accept", post(server::accept_eula))
            .route("/api/servers/:name/install", post(server::install_jar))
            .route("/api/servers/:name/files", get(files::list).delete(files::delete))
            .route("/api/servers/:name/files/content", get(files::read).put(files::write))
            .route("/api/servers/:name/files/create", post(files::create))
            .route("/api/servers/:name/files/folder", post(files::create_folder))
            .route("/api/servers/:name/files/copy", post(files::copy))
            .route("/api/servers/:name/files/move", post(files::rename))
            .route("/api/servers/:name/files/zip", post(files::zip))
            .route("/api/servers/:name/files/unzip", post(files::unzip))
            .route("/api/servers/:name/files/upload", put(files::upload))
            .route("/api/servers/:name/files/download", get(files::download))
            .route("/api/servers/:name/ws", get(console::ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);
        let router = self.router();

        // TCP 리스너
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}
