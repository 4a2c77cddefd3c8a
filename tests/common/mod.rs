//! 통합 테스트 공용 헬퍼. `sh` 스크립트가 java 대신 서버 역할을 함

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use minegimme::config::GlobalConfig;
use minegimme::instance::{EngineType, InstanceSpec};
use minegimme::supervisor::state_machine::{ProcessState, StatusChange};
use minegimme::supervisor::{ManagedServer, ServerEvent, Supervisor};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Prints a startup banner, reports ready, then answers a few console commands.
pub const FAKE_SERVER: &str = r#"
echo "[12:00:00] [Server thread/INFO]: Starting minecraft server version 1.20.4"
sleep 0.2
echo '[12:00:01] [Server thread/INFO]: Done (0.201s)! For help, type "help"'
while IFS= read -r line; do
  case "$line" in
    stop)
      echo "[12:00:02] [Server thread/INFO]: Stopping server"
      exit 0
      ;;
    list)
      echo "[12:00:02] [Server thread/INFO]: There are 0 of a max of 20 players online: "
      ;;
    join)
      echo "[12:00:02] [Server thread/INFO]: Steve joined the game"
      ;;
    chat)
      echo "[12:00:02] [Server thread/INFO]: <Steve> Stopping server is a funny phrase"
      echo "[12:00:02] [Server thread/INFO]: <Bob> Alex joined the game"
      echo "[12:00:02] [Server thread/INFO]: <Steve> Stopping server"
      echo "[12:00:02] [Server thread/INFO]: Chat done"
      ;;
    crash)
      echo "[12:00:02] [Server thread/ERROR]: Encountered an unexpected exception" >&2
      exit 1
      ;;
    *)
      echo "[12:00:02] [Server thread/INFO]: Unknown or incomplete command"
      ;;
  esac
done
"#;

/// Never reports ready and ignores `stop`.
pub const HANGING_SERVER: &str = r#"
echo "[12:00:00] [Server thread/INFO]: Starting minecraft server version 1.20.4"
while true; do sleep 1; done
"#;

/// Reports ready, prints the shutdown banner on `stop` but never exits.
pub const STUBBORN_SERVER: &str = r#"
trap '' TERM INT
echo '[12:00:01] [Server thread/INFO]: Done (0.100s)! For help, type "help"'
while IFS= read -r line; do
  case "$line" in
    stop)
      echo "[12:00:02] [Server thread/INFO]: Stopping server"
      ;;
  esac
done
while true; do sleep 1; done
"#;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config(root: &TempDir, script: &str) -> GlobalConfig {
    GlobalConfig {
        servers_dir: root.path().join("servers"),
        java_command: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "fake-java".to_string(),
        ],
        startup_timeout_secs: 10,
        shutdown_timeout_secs: 5,
        file_scan_interval_secs: 1,
        file_debounce_ms: 20,
        ..GlobalConfig::default()
    }
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("0.0.0.0:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

pub fn spec(name: &str) -> InstanceSpec {
    InstanceSpec {
        name: name.to_string(),
        engine: EngineType::Paper,
        version: "1.20.4".to_string(),
        min_ram: 1024,
        max_ram: 2048,
        port: free_port(),
        max_players: 20,
    }
}

pub async fn supervisor(root: &TempDir, script: &str) -> Arc<Supervisor> {
    let supervisor = Arc::new(Supervisor::new(Arc::new(test_config(root, script))));
    supervisor.load_all().await.expect("load_all");
    supervisor
}

/// Create a server with a dummy jar and the EULA accepted.
pub async fn ready_server(supervisor: &Supervisor, name: &str) -> Arc<ManagedServer> {
    let server = supervisor.create(spec(name)).await.expect("create server");
    let dir = server.instance().await.directory;
    std::fs::write(dir.join("server.jar"), b"not really a jar").expect("write jar");
    server.accept_eula().await.expect("accept eula");
    server
}

pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Collect status changes until `target` is reached.
pub async fn statuses_until(
    rx: &mut broadcast::Receiver<ServerEvent>,
    target: ProcessState,
) -> Vec<StatusChange> {
    within(&format!("status {:?}", target), async {
        let mut seen = Vec::new();
        loop {
            match rx.recv().await {
                Ok(ServerEvent::Status(change)) => {
                    let done = change.status == target;
                    seen.push(change);
                    if done {
                        return seen;
                    }
                }
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
}

pub async fn wait_for_console(server: &ManagedServer, needle: &str) {
    within(&format!("console line '{}'", needle), async {
        loop {
            if server.console().recent(500).iter().any(|l| l.text.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
}

/// Collect error codes from `rx` until `target` status arrives.
pub async fn errors_until(
    rx: &mut broadcast::Receiver<ServerEvent>,
    target: ProcessState,
) -> (Vec<&'static str>, Vec<StatusChange>) {
    within(&format!("status {:?}", target), async {
        let mut codes = Vec::new();
        let mut changes = Vec::new();
        loop {
            match rx.recv().await {
                Ok(ServerEvent::Error { code, .. }) => codes.push(code),
                Ok(ServerEvent::Status(change)) => {
                    let done = change.status == target;
                    changes.push(change);
                    if done {
                        return (codes, changes);
                    }
                }
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
}

pub async fn wait_for_state(server: &ManagedServer, state: ProcessState) {
    within(&format!("state {:?}", state), async {
        while server.state() != state {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
}
