use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{CreateServerRequest, IPCServer, PropertiesRequest, ServerStopRequest, SettingsRequest};
use crate::instance::{self, EngineType};
use crate::supervisor::error::SupervisorError;

type ApiResult = Result<axum::response::Response, SupervisorError>;

/// GET /api/servers - 모든 서버 목록
pub async fn list_servers(State(state): State<IPCServer>) -> impl IntoResponse {
    let mut servers = Vec::new();
    for server in state.supervisor.list().await {
        servers.push(server.summary().await);
    }
    Json(json!({ "servers": servers }))
}

/// POST /api/servers - 서버 생성 (선택적으로 jar 다운로드)
pub async fn create_server(
    State(state): State<IPCServer>,
    Json(req): Json<CreateServerRequest>,
) -> ApiResult {
    let server = state.supervisor.create(req.spec).await?;

    if req.download {
        let server = server.clone();
        let catalog = state.catalog.clone();
        tokio::spawn(async move {
            if let Err(e) = server.install_jar(&catalog).await {
                tracing::warn!("[{}] Background jar download failed: {}", server.name(), e);
            }
        });
    }

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "server": server.summary().await }))).into_response())
}

/// GET /api/versions - 지원하는 서버 타입
pub async fn list_engine_types() -> impl IntoResponse {
    let types: Vec<&str> = EngineType::ALL.iter().map(|t| t.as_str()).collect();
    Json(json!({ "types": types }))
}

/// GET /api/versions/:type - 해당 타입의 릴리즈 버전 목록 (최신순)
pub async fn list_versions(Path(kind): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let engine: EngineType = kind.parse()?;
    let versions = state
        .catalog
        .list(engine)
        .await
        .map_err(|e| SupervisorError::Download(format!("{:#}", e)))?;
    Ok(Json(json!({ "type": engine, "versions": versions })).into_response())
}

/// GET /api/servers/:name
pub async fn get_server(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    Ok(Json(server.summary().await).into_response())
}

/// DELETE /api/servers/:name - 오프라인 상태에서만 삭제 가능
pub async fn delete_server(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    state.supervisor.delete(&name).await?;
    Ok(Json(json!({ "success": true })).into_response())
}

/// PATCH /api/servers/:name/settings
pub async fn update_settings(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(patch): Json<SettingsRequest>,
) -> ApiResult {
    let instance = state.supervisor.update_settings(&name, &patch).await?;
    Ok(Json(json!({ "success": true, "server": instance })).into_response())
}

/// GET /api/servers/:name/properties
pub async fn get_properties(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    Ok(Json(json!({ "properties": server.properties().await? })).into_response())
}

/// PUT /api/servers/:name/properties
pub async fn update_properties(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(values): Json<PropertiesRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    if let Some(port) = values.get("server-port").and_then(|p| p.parse::<u16>().ok()) {
        // 포트 중복 검사는 레지스트리 단위
        let patch = crate::instance::SettingsPatch { port: Some(port), ..Default::default() };
        state.supervisor.update_settings(&name, &patch).await?;
    }
    let properties = server.update_properties(&values).await?;
    Ok(Json(json!({ "success": true, "properties": properties })).into_response())
}

/// POST /api/servers/:name/start - 준비 완료(online) 또는 실패까지 대기
pub async fn start_server(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.request_start().await?;
    Ok(Json(json!({ "success": true, "status": server.state() })).into_response())
}

/// POST /api/servers/:name/stop
pub async fn stop_server(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    body: Option<Json<ServerStopRequest>>,
) -> ApiResult {
    let force = body.map(|Json(req)| req.force).unwrap_or(false);
    let server = state.supervisor.get(&name).await?;
    server.request_stop(force).await?;
    Ok(Json(json!({ "success": true, "status": server.state() })).into_response())
}

/// POST /api/servers/:name/restart
pub async fn restart_server(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.request_restart().await?;
    Ok(Json(json!({ "success": true, "status": server.state() })).into_response())
}

/// POST /api/servers/:name/kill - 유예 없이 강제 종료
pub async fn kill_server(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.request_stop(true).await?;
    Ok(Json(json!({ "success": true, "status": server.state() })).into_response())
}

/// GET /api/servers/:name/eula
pub async fn get_eula(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    let dir = server.instance().await.directory;
    Ok(Json(json!({ "accepted": instance::eula_accepted(&dir) })).into_response())
}

/// POST /api/servers/:name/eula/accept
pub async fn accept_eula(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.accept_eula().await?;
    Ok(Json(json!({ "success": true, "accepted": true })).into_response())
}

/// POST /api/servers/:name/install - 설정된 버전의 jar 를 (다시) 다운로드
pub async fn install_jar(Path(name): Path<String>, State(state): State<IPCServer>) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    let bytes = server.install_jar(&state.catalog).await?;
    Ok(Json(json!({ "success": true, "bytes": bytes })).into_response())
}
