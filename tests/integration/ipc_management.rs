//! Management over the Unix socket: keys, ports, reload and shutdown

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ss_relay::config::{IpcConfig, SsRelayConfig};
use ss_relay::error::IpcError;
use ss_relay::ipc::{ErrorCode, IpcClient, IpcCommand, IpcHandler, IpcResponse, IpcServer};

use super::common::{credential, free_port, key, read_exactly, ss_connect, tcp_echo_server, Harness};

struct Managed {
    harness: Harness,
    client: IpcClient,
    server: JoinHandle<Result<(), IpcError>>,
    config_path: std::path::PathBuf,
    _dir: TempDir,
}

async fn start(initial: SsRelayConfig) -> Managed {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("relay.sock");
    let config_path = dir.path().join("config.json");
    std::fs::write(&config_path, serde_json::to_string_pretty(&initial).unwrap()).unwrap();

    let harness = Harness::new();
    harness
        .reconciler
        .reconcile_from_config(&initial.keys)
        .await
        .unwrap();

    let (shutdown_tx, _) = broadcast::channel(4);
    let handler = Arc::new(IpcHandler::new(
        Arc::clone(&harness.reconciler),
        Arc::clone(&harness.stats),
        Some(config_path.clone()),
        shutdown_tx.clone(),
    ));
    let config = IpcConfig {
        enabled: true,
        socket_path: socket_path.clone(),
        ..IpcConfig::default()
    };
    let server = IpcServer::new(config, handler);
    let shutdown_rx = shutdown_tx.subscribe();
    let server = tokio::spawn(async move { server.run(shutdown_rx).await });

    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    Managed {
        harness,
        client: IpcClient::new(&socket_path),
        server,
        config_path,
        _dir: dir,
    }
}

fn config_with(keys: Vec<ss_relay::AccessKeyConfig>) -> SsRelayConfig {
    SsRelayConfig {
        keys,
        ..SsRelayConfig::default()
    }
}

#[tokio::test]
async fn test_added_key_carries_traffic() {
    let managed = start(config_with(vec![])).await;
    let port = free_port();
    let echo = tcp_echo_server().await;

    let actual = managed
        .client
        .add_access_key("alice", port, None, "alice-secret")
        .await
        .unwrap();
    assert_eq!(actual, port);
    assert!(managed.client.access_key_status("alice", port).await.unwrap());

    let cred = credential("alice", "alice-secret");
    let (mut reader, _writer) = ss_connect(port, &cred, echo, b"via ipc").await;
    assert_eq!(read_exactly(&mut reader, 7).await, b"via ipc");

    match managed.client.send(IpcCommand::CheckPort { port }).await.unwrap() {
        IpcResponse::PortCheck { accepting, .. } => assert!(accepting),
        other => panic!("unexpected response: {other:?}"),
    }

    match managed.client.send(IpcCommand::ListPorts).await.unwrap() {
        IpcResponse::PortList { ports } => {
            assert_eq!(ports.len(), 1);
            assert_eq!(ports[0].keys, vec!["alice".to_string()]);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    managed.harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_and_unknown_keys_report_errors() {
    let port = free_port();
    let managed = start(config_with(vec![key("alice", port, "s1")])).await;

    let response = managed
        .client
        .send(IpcCommand::AddAccessKey {
            id: "alice".into(),
            port,
            cipher: None,
            secret: "again".into(),
        })
        .await
        .unwrap();
    match response {
        IpcResponse::Error(e) => assert_eq!(e.code, ErrorCode::AlreadyExists),
        other => panic!("unexpected response: {other:?}"),
    }

    let response = managed
        .client
        .send(IpcCommand::AddAccessKey {
            id: "bob".into(),
            port,
            cipher: Some("rc4-md5".into()),
            secret: "s2".into(),
        })
        .await
        .unwrap();
    match response {
        IpcResponse::Error(e) => assert_eq!(e.code, ErrorCode::InvalidParameters),
        other => panic!("unexpected response: {other:?}"),
    }

    let other_port = free_port();
    let response = managed
        .client
        .send(IpcCommand::RemoveAccessKey {
            id: "alice".into(),
            port: other_port,
        })
        .await
        .unwrap();
    match response {
        IpcResponse::Error(e) => assert_eq!(e.code, ErrorCode::NotFound),
        other => panic!("unexpected response: {other:?}"),
    }

    match managed
        .client
        .send(IpcCommand::RemoveAccessKey {
            id: "alice".into(),
            port,
        })
        .await
        .unwrap()
    {
        IpcResponse::AccessKeyRemoved {
            existed,
            port_closed,
            ..
        } => {
            assert!(existed);
            assert!(port_closed);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    managed.harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_reload_applies_edited_config() {
    let (p1, p2) = (free_port(), free_port());
    let managed = start(config_with(vec![key("a", p1, "s1")])).await;

    let edited = config_with(vec![key("a", p2, "s1"), key("b", p2, "s2")]);
    std::fs::write(&managed.config_path, serde_json::to_string(&edited).unwrap()).unwrap();

    match managed
        .client
        .send(IpcCommand::Reload { config_path: None })
        .await
        .unwrap()
    {
        IpcResponse::Reloaded(summary) => {
            assert_eq!(summary.opened, vec![p2]);
            assert_eq!(summary.closed, vec![p1]);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    assert!(!managed.client.access_key_status("a", p1).await.unwrap());
    assert!(managed.client.access_key_status("b", p2).await.unwrap());

    match managed.client.send(IpcCommand::Status).await.unwrap() {
        IpcResponse::Status(status) => {
            assert_eq!(status.ports, 1);
            assert_eq!(status.access_keys, 2);
            assert!(status.last_reload_ms > 0);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // A broken file leaves the running set alone
    std::fs::write(&managed.config_path, "{ not json").unwrap();
    let response = managed
        .client
        .send(IpcCommand::Reload { config_path: None })
        .await
        .unwrap();
    assert!(response.is_error());
    assert!(managed.client.access_key_status("b", p2).await.unwrap());

    managed.harness.reconciler.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_command_stops_server() {
    let managed = start(config_with(vec![])).await;
    assert!(managed.client.ping().await.unwrap());

    let response = managed.client.send(IpcCommand::Shutdown).await.unwrap();
    assert!(!response.is_error());

    tokio::time::timeout(Duration::from_secs(2), managed.server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(managed.client.ping().await.is_err());
}
