//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use collab_server::client::{ConnectionState, SyncClient, SyncEvent};
use collab_server::config::ServerConfig;
use collab_server::protocol::SyncMessage;
use collab_server::server::{SyncServer, HEALTH_BODY};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Arc<SyncServer>,
    url: String,
    addr: std::net::SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(WAIT, &mut self.handle)
            .await
            .expect("server should stop")
            .unwrap();
    }
}

/// Start a server on a free port.
async fn start_test_server(config: ServerConfig) -> TestServer {
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        ..config
    }));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn({
        let server = server.clone();
        async move {
            server
                .serve(listener, async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        }
    });
    TestServer {
        server,
        url: format!("ws://{addr}"),
        addr,
        stop: Some(stop),
        handle,
    }
}

/// Wait for the first event matching `pred`, skipping the others.
async fn wait_for<F>(events: &mut mpsc::Receiver<SyncEvent>, mut pred: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll `cond` until it holds.
async fn wait_until<F: FnMut() -> bool>(mut cond: F) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Connect a client and wait for its initial sync to finish.
async fn connect_synced(url: &str, room: &str, name: &str) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(url, room, name);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    wait_for(&mut events, |e| *e == SyncEvent::Synced).await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    (client, events)
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server(ServerConfig::default()).await;

    let mut stream = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    timeout(WAIT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Type: text/plain"));
    assert!(response.ends_with(HEALTH_BODY));
    assert_eq!(server.server.stats().total_connections, 0);
    server.stop().await;
}

#[tokio::test]
async fn test_late_joiner_receives_hello() {
    let server = start_test_server(ServerConfig::default()).await;

    let (a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    a.insert_text(0, "hello").await.unwrap();

    let registry = server.server.registry().clone();
    wait_until(|| {
        registry
            .room("doc1")
            .is_some_and(|room| room.document().content() == "hello")
    })
    .await;

    let (b, _b_events) = connect_synced(&server.url, "doc1", "B").await;
    assert_eq!(b.content(), "hello");
    server.stop().await;
}

#[tokio::test]
async fn test_live_update_reaches_other_peer() {
    let server = start_test_server(ServerConfig::default()).await;
    let (a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    let (b, mut b_events) = connect_synced(&server.url, "doc1", "B").await;

    a.insert_text(0, "typed live").await.unwrap();
    wait_for(&mut b_events, |e| matches!(e, SyncEvent::RemoteUpdate { .. })).await;
    assert_eq!(b.content(), "typed live");
    assert_eq!(a.content(), "typed live");
    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_disjoint_inserts_converge() {
    let server = start_test_server(ServerConfig::default()).await;
    let (a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    let (b, _b_events) = connect_synced(&server.url, "doc1", "B").await;

    let (ra, rb) = tokio::join!(a.insert_text(0, "foo"), b.insert_text(0, "bar"));
    ra.unwrap();
    rb.unwrap();

    wait_until(|| a.content().len() == 6 && a.content() == b.content()).await;
    let merged = a.content();
    assert!(merged.contains("foo"));
    assert!(merged.contains("bar"));

    let room = server.server.registry().room("doc1").unwrap();
    assert_eq!(room.document().content(), merged);
    server.stop().await;
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let server = start_test_server(ServerConfig::default()).await;
    let (a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    let (b, _b_events) = connect_synced(&server.url, "doc2", "B").await;

    a.insert_text(0, "only in doc1").await.unwrap();
    let registry = server.server.registry().clone();
    wait_until(|| registry.room("doc1").is_some_and(|r| !r.document().content().is_empty())).await;

    assert_eq!(b.content(), "");
    assert_eq!(registry.room("doc2").unwrap().document().content(), "");
    assert_eq!(registry.room_count(), 2);
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_within_grace_keeps_room() {
    let server = start_test_server(ServerConfig {
        grace_period: Duration::from_millis(5000),
        ..ServerConfig::default()
    })
    .await;
    let registry = server.server.registry().clone();

    let (mut a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    a.insert_text(0, "kept").await.unwrap();
    wait_until(|| registry.room("doc1").is_some_and(|r| r.document().content() == "kept")).await;
    assert_eq!(registry.connection_count("doc1"), Some(1));

    a.close().await.unwrap();
    wait_until(|| registry.connection_count("doc1") == Some(0)).await;
    assert!(registry.has_pending_teardown("doc1"));

    let (b, _b_events) = connect_synced(&server.url, "doc1", "B").await;
    assert_eq!(b.content(), "kept");
    assert_eq!(registry.connection_count("doc1"), Some(1));
    assert!(!registry.has_pending_teardown("doc1"));
    assert_eq!(server.server.stats().rooms_created, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_room_removed_after_grace() {
    let server = start_test_server(ServerConfig {
        grace_period: Duration::from_millis(100),
        ..ServerConfig::default()
    })
    .await;
    let registry = server.server.registry().clone();

    let (mut a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    a.insert_text(0, "gone soon").await.unwrap();
    a.close().await.unwrap();

    wait_until(|| registry.room_count() == 0).await;

    // A new room with the same id starts empty.
    let (b, _b_events) = connect_synced(&server.url, "doc1", "B").await;
    assert_eq!(b.content(), "");
    assert_eq!(server.server.stats().rooms_created, 2);
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let server = start_test_server(ServerConfig::default()).await;
    let (a, mut a_events) = connect_synced(&server.url, "doc1", "A").await;

    a.send_frame(vec![0xde, 0xad, 0xbe, 0xef]).await.unwrap();
    a.send_text("not a sync message").await.unwrap();
    // Decodable message carrying an undecodable Yrs update.
    let bad_update = SyncMessage::update(uuid::Uuid::nil(), 1, vec![0xFF, 0xFF, 0xFF]);
    a.send_frame(bad_update.encode().unwrap()).await.unwrap();

    a.send_ping().await.unwrap();
    wait_for(&mut a_events, |e| *e == SyncEvent::Pong).await;

    assert_eq!(a.connection_state(), ConnectionState::Connected);
    assert_eq!(server.server.stats().malformed_messages, 3);
    let room = server.server.registry().room("doc1").unwrap();
    assert_eq!(room.document().content(), "");

    // Still usable.
    a.insert_text(0, "ok").await.unwrap();
    wait_until(|| room.document().content() == "ok").await;
    server.stop().await;
}

#[tokio::test]
async fn test_hostile_updates_leave_server_running() {
    let server = start_test_server(ServerConfig::default()).await;
    let (a, mut a_events) = connect_synced(&server.url, "doc1", "A").await;
    a.insert_text(0, "intact").await.unwrap();
    let room = server.server.registry().room("doc1").unwrap();
    wait_until(|| room.document().content() == "intact").await;

    let hostile = [
        // Delete set claiming u32::MAX ranges.
        SyncMessage::update(uuid::Uuid::nil(), 2, vec![0x00, 0x01, 0x05, 0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
        // String item that is not UTF-8.
        SyncMessage::update(uuid::Uuid::nil(), 3, vec![1, 1, 7, 0, 4, 1, 1, b't', 2, 0xC3, 0x28, 0]),
        // State vector claiming u32::MAX entries.
        SyncMessage::sync_step1(uuid::Uuid::nil(), vec![0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
    ];
    for msg in &hostile {
        a.send_frame(msg.encode().unwrap()).await.unwrap();
    }

    a.send_ping().await.unwrap();
    wait_for(&mut a_events, |e| *e == SyncEvent::Pong).await;
    assert_eq!(server.server.stats().malformed_messages, 3);
    assert_eq!(room.document().content(), "intact");

    // The server still serves new peers.
    let (b, _b_events) = connect_synced(&server.url, "doc1", "B").await;
    assert_eq!(b.content(), "intact");
    server.stop().await;
}

#[tokio::test]
async fn test_lagging_peer_catches_up() {
    let server = start_test_server(ServerConfig {
        broadcast_capacity: 2,
        ..ServerConfig::default()
    })
    .await;
    let (a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    let (b, _b_events) = connect_synced(&server.url, "doc1", "B").await;

    for i in 0..200u32 {
        a.insert_text(i, "x").await.unwrap();
    }

    let room = server.server.registry().room("doc1").unwrap();
    wait_until(|| room.document().content().len() == 200).await;
    wait_until(|| b.content() == a.content()).await;
    assert_eq!(b.content(), "x".repeat(200));
    server.stop().await;
}

#[tokio::test]
async fn test_transport_ping_answered_once() {
    let server = start_test_server(ServerConfig::default()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{}/doc1", server.url))
        .await
        .unwrap();

    ws.send(Message::Ping(b"are you there".to_vec().into()))
        .await
        .unwrap();

    let mut pongs = 0;
    let deadline = Instant::now() + Duration::from_millis(500);
    while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, ws.next()).await {
        if let Message::Pong(data) = msg.unwrap() {
            assert_eq!(&data[..], b"are you there");
            pongs += 1;
        }
    }
    assert_eq!(pongs, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_empty_path_uses_default_room() {
    let server = start_test_server(ServerConfig {
        default_room: "lobby".into(),
        ..ServerConfig::default()
    })
    .await;
    let (_a, _a_events) = connect_synced(&server.url, "", "A").await;
    assert_eq!(server.server.registry().connection_count("lobby"), Some(1));
    server.stop().await;
}

#[tokio::test]
async fn test_oversized_room_id_rejected() {
    let server = start_test_server(ServerConfig::default()).await;
    let url = format!("{}/{}", server.url, "r".repeat(300));
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
    assert_eq!(server.server.registry().room_count(), 0);
    server.stop().await;
}

#[tokio::test]
async fn test_room_cap_refuses_extra_peer() {
    let server = start_test_server(ServerConfig {
        max_peers_per_room: Some(1),
        ..ServerConfig::default()
    })
    .await;
    let (_a, _a_events) = connect_synced(&server.url, "doc1", "A").await;

    let mut b = SyncClient::new(&server.url, "doc1", "B");
    let mut b_events = b.take_event_rx().unwrap();
    b.connect().await.unwrap();
    wait_for(&mut b_events, |e| *e == SyncEvent::Disconnected).await;

    assert_eq!(server.server.registry().connection_count("doc1"), Some(1));
    assert_eq!(server.server.stats().active_connections, 1);
    server.stop().await;
}

#[tokio::test]
async fn test_connection_stats() {
    let server = start_test_server(ServerConfig::default()).await;
    let (mut a, _a_events) = connect_synced(&server.url, "doc1", "A").await;
    let (_b, _b_events) = connect_synced(&server.url, "doc2", "B").await;

    let stats = server.server.stats();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.rooms_created, 2);

    a.close().await.unwrap();
    let srv = server.server.clone();
    wait_until(|| srv.stats().active_connections == 1).await;
    assert_eq!(server.server.stats().total_connections, 2);
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let server = start_test_server(ServerConfig::default()).await;
    let (a, mut a_events) = connect_synced(&server.url, "doc1", "A").await;

    server.stop().await;
    wait_for(&mut a_events, |e| *e == SyncEvent::Disconnected).await;
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
}
