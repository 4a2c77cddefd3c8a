//! Console polling, command submission and the live WebSocket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;

use super::super::{CommandRequest, ConsoleQuery, IPCServer};
use crate::hub::{Attachment, ClientAction, ConnectionHub, ServerMessage};
use crate::supervisor::error::SupervisorError;

const DEFAULT_CONSOLE_COUNT: usize = 100;

/// POST /api/servers/:name/command
pub async fn submit_command(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    Json(req): Json<CommandRequest>,
) -> Result<axum::response::Response, SupervisorError> {
    let server = state.supervisor.get(&name).await?;
    server.submit_command(&req.command).await?;
    Ok(Json(json!({ "success": true })).into_response())
}

/// GET /api/servers/:name/console?since=<id>&count=<n>
pub async fn console_lines(
    Path(name): Path<String>,
    Query(query): Query<ConsoleQuery>,
    State(state): State<IPCServer>,
) -> Result<axum::response::Response, SupervisorError> {
    let server = state.supervisor.get(&name).await?;
    let console = server.console();
    let lines = match query.since {
        Some(since) => console.lines_since(since),
        None => console.recent(query.count.unwrap_or(DEFAULT_CONSOLE_COUNT)),
    };
    let last_id = lines.last().map(|l| l.id).or(query.since).unwrap_or(0);
    Ok(Json(json!({ "lines": lines, "last_id": last_id })).into_response())
}

/// GET /api/servers/:name/ws
pub async fn ws_handler(
    Path(name): Path<String>,
    State(state): State<IPCServer>,
    ws: WebSocketUpgrade,
) -> Result<axum::response::Response, SupervisorError> {
    // 없는 서버는 업그레이드 전에 404, 연결 등록은 핸드셰이크가 끝난 뒤에
    state.supervisor.get(&name).await?;
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        match hub.attach(&name).await {
            Ok(attachment) => run_socket(socket, hub, attachment).await,
            Err(e) => {
                tracing::warn!("[Hub] Could not attach to '{}': {}", name, e);
                let mut socket = socket;
                let message = ServerMessage::from(&e);
                let _ = send(&mut socket, &message).await;
                let _ = socket.send(Message::Close(None)).await;
            }
        }
    }))
}

async fn run_socket(socket: WebSocket, hub: std::sync::Arc<ConnectionHub>, attachment: Attachment) {
    let Attachment { id, mut outbound, closed } = attachment;
    let (mut sink, mut stream) = socket.split();
    let reader_closed = closed.clone();

    let mut writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = outbound.recv() => message,
                _ = closed.cancelled() => {
                    // 마지막 에러 메시지까지 보낸 뒤 닫음
                    while let Ok(message) = outbound.try_recv() {
                        if send(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    None
                }
            };
            let Some(message) = message else { break };
            if send(&mut sink, &message).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = reader_closed.cancelled() => break,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientAction>(&text) {
                Ok(action) => hub.dispatch(id, action).await,
                Err(e) => tracing::warn!("[Hub] Malformed message from client {}: {}", id, e),
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }

    hub.detach(id).await;
    // writer 가 남은 메시지를 비우고 Close 프레임을 보낼 시간을 줌
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer).await.is_err() {
        writer.abort();
    }
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> Result<(), axum::Error>
where
    S: SinkExt<Message, Error = axum::Error> + Unpin,
{
    match serde_json::to_string(message) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(e) => {
            tracing::warn!("Failed to encode outbound message: {}", e);
            Ok(())
        }
    }
}
