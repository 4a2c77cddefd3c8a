//! ConnectionHub 통합 테스트
#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::*;
use minegimme::hub::{Attachment, ClientAction, ConnectionHub, ServerMessage};
use minegimme::supervisor::error::SupervisorError;
use minegimme::supervisor::state_machine::ProcessState;

/// Next message, skipping background file rescans.
async fn next_message(attachment: &mut Attachment) -> ServerMessage {
    loop {
        let message = within("hub message", attachment.outbound.recv())
            .await
            .expect("outbound channel closed");
        if !matches!(message, ServerMessage::FileUpdate { .. }) {
            return message;
        }
    }
}

/// Status changes (not snapshots) until `target`.
async fn transitions_until(attachment: &mut Attachment, target: ProcessState) -> Vec<(ProcessState, ProcessState)> {
    let mut seen = Vec::new();
    loop {
        if let ServerMessage::Status { status, previous: Some(previous), .. } = next_message(attachment).await {
            seen.push((previous, status));
            if status == target {
                return seen;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_attach_bootstrap_order() {
    let root = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&root, FAKE_SERVER).await;
    let server = ready_server(&supervisor, "boot").await;
    server.console().system("hello from the past");
    let hub = ConnectionHub::new(supervisor.clone());

    let mut client = hub.attach("boot").await.unwrap();
    assert!(matches!(
        next_message(&mut client).await,
        ServerMessage::Status { status: ProcessState::Offline, previous: None, .. }
    ));
    match next_message(&mut client).await {
        ServerMessage::FileInit { files } => {
            let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
            assert!(paths.contains(&"server.json"));
            assert!(paths.contains(&"server.jar"));
            assert!(paths.contains(&"eula.txt"));
        }
        other => panic!("expected file_init, got {:?}", other),
    }
    // 백로그: EULA accepted, hello from the past
    let mut backlog = Vec::new();
    for _ in 0..2 {
        match next_message(&mut client).await {
            ServerMessage::Console { line } => backlog.push(line.text),
            other => panic!("expected console backlog, got {:?}", other),
        }
    }
    assert_eq!(backlog.last().map(String::as_str), Some("hello from the past"));

    assert!(matches!(hub.attach("missing").await, Err(SupervisorError::NotFound(_))));
    assert_eq!(hub.connection_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_clients_see_identical_status_sequences() {
    let root = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&root, FAKE_SERVER).await;
    ready_server(&supervisor, "shared").await;
    let hub = ConnectionHub::new(supervisor.clone());

    let mut a = hub.attach("shared").await.unwrap();
    let mut b = hub.attach("shared").await.unwrap();

    hub.dispatch(a.id, ClientAction::Start).await;
    let seen_a = transitions_until(&mut a, ProcessState::Online).await;
    let seen_b = transitions_until(&mut b, ProcessState::Online).await;
    assert_eq!(seen_a, seen_b);
    assert_eq!(
        seen_a,
        vec![
            (ProcessState::Offline, ProcessState::Starting),
            (ProcessState::Starting, ProcessState::Online),
        ]
    );

    hub.dispatch(b.id, ClientAction::Stop).await;
    let stop_a = transitions_until(&mut a, ProcessState::Offline).await;
    let stop_b = transitions_until(&mut b, ProcessState::Offline).await;
    assert_eq!(stop_a, stop_b);
    println!("✓ both clients observed {:?}", stop_a);
}

#[tokio::test]
async fn test_errors_go_to_the_requesting_connection() {
    let root = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&root, FAKE_SERVER).await;
    supervisor.create(spec("offline")).await.unwrap();
    let hub = ConnectionHub::new(supervisor.clone());

    let mut a = hub.attach("offline").await.unwrap();
    let mut b = hub.attach("offline").await.unwrap();
    // 부트스트랩 메시지 소비 (status, file_init)
    next_message(&mut a).await;
    next_message(&mut a).await;
    next_message(&mut b).await;
    next_message(&mut b).await;

    hub.dispatch(a.id, ClientAction::Command { command: "list".into() }).await;
    match next_message(&mut a).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, "SERVER_OFFLINE"),
        other => panic!("expected error, got {:?}", other),
    }

    // EULA 미동의 상태에서 start
    hub.dispatch(a.id, ClientAction::Start).await;
    let mut got_need_eula = false;
    for _ in 0..2 {
        if let ServerMessage::NeedEula { .. } = next_message(&mut a).await {
            got_need_eula = true;
        }
    }
    assert!(got_need_eula);

    hub.dispatch(a.id, ClientAction::Unknown).await;
    hub.dispatch(a.id, ClientAction::Pong).await;

    // b 에는 error 가 가지 않고 브로드캐스트 need_eula 만 도착
    match next_message(&mut b).await {
        ServerMessage::NeedEula { .. } => {}
        other => panic!("unexpected message for the other client: {:?}", other),
    }
    while let Ok(message) = b.outbound.try_recv() {
        assert!(!matches!(message, ServerMessage::Error { .. }), "error leaked to another client");
    }
}

#[tokio::test]
async fn test_detach_is_idempotent_and_heartbeat_reaps() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(&root, FAKE_SERVER);
    config.heartbeat_timeout_secs = 0;
    let supervisor = Arc::new(minegimme::supervisor::Supervisor::new(Arc::new(config)));
    supervisor.load_all().await.unwrap();
    supervisor.create(spec("beat")).await.unwrap();
    let hub = ConnectionHub::new(supervisor.clone());

    let first = hub.attach("beat").await.unwrap();
    assert!(hub.detach(first.id).await);
    assert!(!hub.detach(first.id).await);
    within("forwarder abort", first.closed.cancelled()).await;

    for _ in 0..10 {
        let attachment = hub.attach("beat").await.unwrap();
        hub.detach(attachment.id).await;
    }
    assert_eq!(hub.connection_count().await, 0);

    let silent = hub.attach("beat").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let reaped = hub.heartbeat_tick().await;
    assert_eq!(reaped, vec![silent.id]);
    assert_eq!(hub.connection_count().await, 0);
    within("reaped connection closes", silent.closed.cancelled()).await;
}

#[tokio::test]
async fn test_heartbeat_pings_live_connections() {
    let root = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&root, FAKE_SERVER).await;
    supervisor.create(spec("pinged")).await.unwrap();
    let hub = ConnectionHub::new(supervisor.clone());

    let mut client = hub.attach("pinged").await.unwrap();
    next_message(&mut client).await;
    next_message(&mut client).await;

    assert!(hub.heartbeat_tick().await.is_empty());
    let mut pinged = false;
    for _ in 0..3 {
        if let ServerMessage::Ping { .. } = next_message(&mut client).await {
            pinged = true;
            break;
        }
    }
    assert!(pinged);
}

#[tokio::test]
async fn test_deleted_server_closes_connections() {
    let root = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&root, FAKE_SERVER).await;
    supervisor.create(spec("doomed")).await.unwrap();
    let hub = ConnectionHub::new(supervisor.clone());
    let mut client = hub.attach("doomed").await.unwrap();
    next_message(&mut client).await;
    next_message(&mut client).await;

    supervisor.delete("doomed").await.unwrap();
    let code = within("removal notice", async {
        loop {
            match client.outbound.recv().await {
                Some(ServerMessage::Error { code, .. }) => return code,
                Some(_) => continue,
                None => panic!("closed without notice"),
            }
        }
    })
    .await;
    assert_eq!(code, "NOT_FOUND");
    within("connection closes", client.closed.cancelled()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fresh_attach_sends_no_redundant_file_update() {
    let root = tempfile::tempdir().unwrap();
    let supervisor = supervisor(&root, FAKE_SERVER).await;
    supervisor.create(spec("fresh")).await.unwrap();
    let hub = ConnectionHub::new(supervisor.clone());

    let mut client = hub.attach("fresh").await.unwrap();
    assert!(matches!(next_message(&mut client).await, ServerMessage::Status { .. }));
    assert!(matches!(next_message(&mut client).await, ServerMessage::FileInit { .. }));

    // file_init 이 이미 담고 있는 변경은 다시 오지 않아야 함
    let quiet = tokio::time::timeout(std::time::Duration::from_millis(1500), async {
        loop {
            match client.outbound.recv().await {
                Some(ServerMessage::FileUpdate { changes }) => return changes,
                Some(_) => continue,
                None => panic!("outbound channel closed"),
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "unexpected file_update: {:?}", quiet);
}
