use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use minegimme::config::GlobalConfig;
use minegimme::engine::VersionCatalog;
use minegimme::hub::ConnectionHub;
use minegimme::ipc::IPCServer;
use minegimme::supervisor::Supervisor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("MineGimme core daemon starting");

    let config = match GlobalConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {:#}", e);
            GlobalConfig::default()
        }
    };
    let config = Arc::new(config);
    let listen_addr = config.listen_addr.clone();

    let supervisor = Arc::new(Supervisor::new(config.clone()));
    if let Err(e) = supervisor.load_all().await {
        tracing::warn!("Failed to load servers from {}: {}", config.servers_dir.display(), e);
    }

    let hub = Arc::new(ConnectionHub::new(supervisor.clone()));
    let shutdown = CancellationToken::new();

    // Heartbeat 태스크: ping 전송 및 응답 없는 연결 정리
    tokio::spawn(hub.clone().run_heartbeat(shutdown.clone()));

    // Graceful shutdown: Ctrl+C 시 실행 중인 서버를 모두 정상 종료
    let supervisor_shutdown = supervisor.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, stopping servers...");
        shutdown.cancel();
        supervisor_shutdown.shutdown_all().await;
        tracing::info!("Cleanup complete, exiting");
        std::process::exit(0);
    });

    let ipc_server = IPCServer::new(supervisor, hub, Arc::new(VersionCatalog::new()), &listen_addr);
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    tracing::info!("MineGimme core daemon shutting down");
    Ok(())
}
