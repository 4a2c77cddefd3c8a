//! Connection Hub - live client connections per server
//!
//! Each attached connection gets a forwarder task that bootstraps the client
//! (`status`, `file_init`, console backlog) and then relays console lines and
//! server events into the connection's bounded outbound queue. Inbound client
//! actions are routed to the server here. A heartbeat task pings every
//! connection and reaps the silent ones.

pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::supervisor::error::Result;
use crate::supervisor::{ManagedServer, ServerEvent, Supervisor};
pub use protocol::{ClientAction, ServerMessage};

/// Handed to the transport (WebSocket) after a successful attach.
pub struct Attachment {
    pub id: Uuid,
    pub outbound: mpsc::Receiver<ServerMessage>,
    /// Cancelled when the forwarder ends (server deleted, detached, reaped).
    pub closed: CancellationToken,
}

struct Connection {
    server: Arc<ManagedServer>,
    outbound: mpsc::Sender<ServerMessage>,
    last_seen: Instant,
    forwarder: JoinHandle<()>,
}

pub struct ConnectionHub {
    supervisor: Arc<Supervisor>,
    connections: RwLock<HashMap<Uuid, Connection>>,
    queue: usize,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl ConnectionHub {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        let config = supervisor.config().clone();
        Self {
            supervisor,
            connections: RwLock::new(HashMap::new()),
            queue: config.connection_queue.max(16),
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
        }
    }

    /// Register a connection to `server_name` and start its forwarder.
    pub async fn attach(&self, server_name: &str) -> Result<Attachment> {
        let server = self.supervisor.get(server_name).await?;
        let (tx, rx) = mpsc::channel(self.queue);
        let closed = CancellationToken::new();
        let id = Uuid::new_v4();

        // 가드는 spawn 전에 만들어야 첫 poll 전에 abort 되어도 closed 가 취소됨
        let guard = closed.clone().drop_guard();
        let forwarder = tokio::spawn(forward(server.clone(), tx.clone(), guard));
        self.connections.write().await.insert(
            id,
            Connection {
                server,
                outbound: tx,
                last_seen: Instant::now(),
                forwarder,
            },
        );
        tracing::info!("[Hub] Client {} attached to '{}'", id, server_name);

        Ok(Attachment { id, outbound: rx, closed })
    }

    /// Remove a connection. Safe to call more than once.
    pub async fn detach(&self, id: Uuid) -> bool {
        match self.connections.write().await.remove(&id) {
            Some(conn) => {
                conn.forwarder.abort();
                tracing::info!("[Hub] Client {} detached from '{}'", id, conn.server.name());
                true
            }
            None => false,
        }
    }

    /// Refresh liveness and return what an action needs.
    async fn touch(&self, id: Uuid) -> Option<(Arc<ManagedServer>, mpsc::Sender<ServerMessage>)> {
        let mut connections = self.connections.write().await;
        let conn = connections.get_mut(&id)?;
        conn.last_seen = Instant::now();
        Some((conn.server.clone(), conn.outbound.clone()))
    }

    /// Route one inbound action. Lifecycle actions run in the background so a
    /// slow start never blocks the connection's reader; failures go back to
    /// this connection only.
    pub async fn dispatch(&self, id: Uuid, action: ClientAction) {
        let Some((server, outbound)) = self.touch(id).await else {
            tracing::debug!("[Hub] Action from unknown connection {}", id);
            return;
        };

        match action {
            ClientAction::Start => {
                tokio::spawn(async move {
                    if let Err(e) = server.request_start().await {
                        let _ = outbound.send(ServerMessage::from(&e)).await;
                    }
                });
            }
            ClientAction::Stop => {
                tokio::spawn(async move {
                    if let Err(e) = server.request_stop(false).await {
                        let _ = outbound.send(ServerMessage::from(&e)).await;
                    }
                });
            }
            ClientAction::Restart => {
                tokio::spawn(async move {
                    if let Err(e) = server.request_restart().await {
                        let _ = outbound.send(ServerMessage::from(&e)).await;
                    }
                });
            }
            ClientAction::Command { command } => {
                if let Err(e) = server.submit_command(&command).await {
                    let _ = outbound.send(ServerMessage::from(&e)).await;
                }
            }
            ClientAction::Pong => {}
            ClientAction::Unknown => {
                tracing::warn!("[Hub] Ignoring unknown action from client {}", id);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// One heartbeat pass: reap silent or finished connections, ping the rest.
    pub async fn heartbeat_tick(&self) -> Vec<Uuid> {
        let expired: Vec<Uuid> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(_, c)| c.last_seen.elapsed() > self.heartbeat_timeout || c.forwarder.is_finished())
                .map(|(id, _)| *id)
                .collect()
        };

        for id in &expired {
            tracing::warn!("[Heartbeat] Cleaning up expired client: {}", id);
            self.detach(*id).await;
        }

        let connections = self.connections.read().await;
        for conn in connections.values() {
            // 큐가 가득 찬 연결은 건너뜀 (다음 주기에 다시 시도)
            let _ = conn.outbound.try_send(ServerMessage::ping());
        }
        if !expired.is_empty() {
            tracing::info!(
                "[Heartbeat] Reap complete. Cleaned: {}, remaining clients: {}",
                expired.len(),
                connections.len()
            );
        }
        expired
    }

    /// Run [`heartbeat_tick`](Self::heartbeat_tick) every heartbeat interval until `shutdown`.
    pub async fn run_heartbeat(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.heartbeat_tick().await;
                }
            }
        }
    }
}

/// Bootstrap, then relay until the client goes away or the server is deleted.
async fn forward(server: Arc<ManagedServer>, tx: mpsc::Sender<ServerMessage>, _closed: DropGuard) {
    // 스냅샷보다 먼저 구독해야 그 사이의 이벤트를 놓치지 않음
    let mut events = server.subscribe();
    let mut console = server.console().subscribe();

    if tx.send(ServerMessage::snapshot(server.state())).await.is_err() {
        return;
    }
    let (files, seen_revision) = match server.files().watcher().refresh().await {
        Ok(listing) => (listing.entries, listing.revision),
        Err(e) => {
            tracing::warn!("[Hub] File listing for '{}' failed: {}", server.name(), e);
            (Vec::new(), 0)
        }
    };
    if tx.send(ServerMessage::FileInit { files }).await.is_err() {
        return;
    }
    while let Some(line) = console.take_buffered() {
        if tx.send(line.into()).await.is_err() {
            return;
        }
    }

    loop {
        let message = tokio::select! {
            line = console.next() => match line {
                Some(line) => ServerMessage::from(line),
                None => break,
            },
            event = events.recv() => match event {
                Ok(ServerEvent::Status(change)) => change.into(),
                // file_init 에 이미 반영된 diff 는 건너뜀
                Ok(ServerEvent::Files { revision, .. }) if revision <= seen_revision => continue,
                Ok(ServerEvent::Files { changes, .. }) => ServerMessage::FileUpdate { changes },
                Ok(ServerEvent::Players(players)) => ServerMessage::PlayerUpdate { players },
                Ok(ServerEvent::NeedEula(message)) => ServerMessage::NeedEula { message },
                Ok(ServerEvent::Error { message, code }) => ServerMessage::error(message, code),
                Ok(ServerEvent::Removed) => {
                    let _ = tx
                        .send(ServerMessage::error(
                            format!("Server '{}' was deleted", server.name()),
                            "NOT_FOUND",
                        ))
                        .await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("[Hub] Client of '{}' lagged by {} events, resyncing status", server.name(), skipped);
                    ServerMessage::snapshot(server.state())
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        if tx.send(message).await.is_err() {
            break;
        }
    }
}
