//! Persistence integration tests.
//!
//! Verifies:
//! - Autosave writes edits made over the network to the storage directory
//! - Restart with restore brings saved documents back for new clients
//! - In-memory mode has no autosave and nothing to restore

use std::sync::Arc;

use linedit_collab::client::{ClientEvent, EditorClient};
use linedit_collab::protocol::WireFormat;
use linedit_collab::server::{CollabServer, ServerConfig};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn connect_client(
    port: u16,
    name: &str,
) -> (EditorClient, mpsc::Receiver<ClientEvent>) {
    let mut client = EditorClient::new(format!("ws://127.0.0.1:{port}"), WireFormat::Json);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.login(name).await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Users(_))).await;
    (client, events)
}

async fn wait_for(
    events: &mut mpsc::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    loop {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Poll until `path` holds `expected`.
async fn wait_for_file(path: &std::path::Path, expected: &str) {
    for _ in 0..100 {
        if std::fs::read_to_string(path).ok().as_deref() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "{} never reached {expected:?} (last: {:?})",
        path.display(),
        std::fs::read_to_string(path).ok()
    );
}

#[tokio::test]
async fn test_autosave_persists_network_edits() {
    let dir = tempdir().unwrap();
    let storage = dir.path().join("saved_files");
    let server = Arc::new(CollabServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        save_interval: Duration::from_millis(50),
        storage_dir: Some(storage.clone()),
        ..ServerConfig::default()
    }));
    let listener = server.listen().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let autosave = server.spawn_autosave().unwrap();
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });

    let (alice, mut events) = connect_client(port, "alice").await;
    alice.create_file("notes.txt").await.unwrap();
    wait_for(&mut events, |e| matches!(e, ClientEvent::Files(_))).await;
    alice.update_line("notes.txt", 3, "hello").await.unwrap();
    alice.update_line("notes.txt", 1, "first").await.unwrap();

    wait_for_file(&storage.join("notes.txt"), "first\n\nhello").await;
    autosave.abort();
}

#[tokio::test]
async fn test_restart_restores_saved_documents() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("plan.md"), "# Plan\n\n- ship it").unwrap();
    std::fs::write(dir.path().join(".plan.md.tmp"), "half written").unwrap();

    let port = free_port().await;
    let server = CollabServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_dir: Some(dir.path().to_path_buf()),
        restore_on_start: true,
        ..ServerConfig::default()
    });
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to restore and bind
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = EditorClient::new(format!("ws://127.0.0.1:{port}"), WireFormat::Legacy);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.login("bob").await.unwrap();

    let files = wait_for(&mut events, |e| matches!(e, ClientEvent::Files(_))).await;
    assert_eq!(files, ClientEvent::Files(vec!["plan.md".into()]));

    client.join_file("plan.md").await.unwrap();
    let synced = wait_for(&mut events, |e| matches!(e, ClientEvent::Synced { .. })).await;
    assert_eq!(
        synced,
        ClientEvent::Synced {
            filename: "plan.md".into(),
            lines: vec!["# Plan".into(), "".into(), "- ship it".into()],
        }
    );
}

#[tokio::test]
async fn test_in_memory_mode_has_no_persistence() {
    let server = CollabServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        storage_dir: None,
        restore_on_start: true,
        ..ServerConfig::default()
    });
    assert!(server.spawn_autosave().is_none());
    assert_eq!(server.restore().await.unwrap(), 0);
    assert!(server.hub().documents().is_empty().await);
}
