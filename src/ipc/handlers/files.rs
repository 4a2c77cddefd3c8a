//! File manager routes. Every path is relative to the server directory.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{IPCServer, PathQuery, PathRequest, TransferRequest, UnzipRequest, WriteFileRequest, ZipRequest};
use crate::supervisor::error::SupervisorError;

type ApiResult = Result<axum::response::Response, SupervisorError>;

fn ok() -> axum::response::Response {
    Json(json!({ "success": true })).into_response()
}

/// GET /api/servers/:name/files?path=
pub async fn list(
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    State(state): State<IPCServer>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    let entries = server.files().list(&query.path).await?;
    Ok(Json(json!({ "path": query.path, "entries": entries })).into_response())
}

/// GET /api/servers/:name/files/content?path=
pub async fn read(
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    State(state): State<IPCServer>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    let content = server.files().read(&query.path).await?;
    Ok(Json(json!({ "path": query.path, "content": content })).into_response())
}

/// PUT /api/servers/:name/files/content
pub async fn write(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<WriteFileRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.files().write(&req.path, &req.content).await?;
    Ok(ok())
}

/// POST /api/servers/:name/files/create
pub async fn create(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<PathRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.files().create(&req.path).await?;
    Ok(ok())
}

/// POST /api/servers/:name/files/folder
pub async fn create_folder(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<PathRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.files().create_folder(&req.path).await?;
    Ok(ok())
}

/// DELETE /api/servers/:name/files?path=
pub async fn delete(
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    State(state): State<IPCServer>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.files().delete(&query.path).await?;
    Ok(ok())
}

/// POST /api/servers/:name/files/copy
pub async fn copy(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<TransferRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.files().copy(&req.from, &req.to).await?;
    Ok(ok())
}

/// POST /api/servers/:name/files/move
pub async fn rename(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<TransferRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.files().rename(&req.from, &req.to).await?;
    Ok(ok())
}

/// POST /api/servers/:name/files/zip
pub async fn zip(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<ZipRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    server.files().zip(&req.paths, &req.dest).await?;
    Ok(ok())
}

/// POST /api/servers/:name/files/unzip
pub async fn unzip(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<UnzipRequest>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    let extracted = server.files().unzip(&req.archive, &req.dest).await?;
    Ok(Json(json!({ "success": true, "extracted": extracted })).into_response())
}

/// PUT /api/servers/:name/files/upload?path= (raw body, streamed to disk)
pub async fn upload(
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    State(state): State<IPCServer>,
    body: Body,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    let limit = state.supervisor.config().max_upload_bytes();
    let bytes = server
        .files()
        .upload_stream(&query.path, body.into_data_stream(), limit)
        .await?;
    Ok(Json(json!({ "success": true, "bytes": bytes })).into_response())
}

/// GET /api/servers/:name/files/download?path= (raw bytes)
pub async fn download(
    Path(name): Path<String>,
    Query(query): Query<PathQuery>,
    State(state): State<IPCServer>,
) -> ApiResult {
    let server = state.supervisor.get(&name).await?;
    let bytes = server.files().download(&query.path).await?;
    let file_name = query.path.rsplit('/').next().unwrap_or("download").to_string();
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", file_name.replace('"', ""))),
        ],
        bytes,
    )
        .into_response())
}
