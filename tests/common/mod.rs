//! Common test utilities for relay integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use mentor_relay::auth::{self, Authenticator};
use mentor_relay::bus::MemoryBus;
use mentor_relay::metrics::RelayMetrics;
use mentor_relay::server::{self, ServerDeps};
use mentor_relay::store::MemoryPlatformStore;

pub const TEST_SECRET: &str = "relay-test-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A relay running on an ephemeral port with shared test handles.
pub struct TestRelay {
    pub addr: SocketAddr,
    pub store: Arc<MemoryPlatformStore>,
    pub bus: Arc<MemoryBus>,
}

/// Starts a full relay (accept loop and all) on 127.0.0.1:0 with the memory
/// bus and memory store, and returns handles for seeding and inspection.
#[allow(dead_code)]
pub async fn start_relay() -> TestRelay {
    let store = Arc::new(MemoryPlatformStore::new());
    let bus = Arc::new(MemoryBus::new());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().unwrap();

    let deps = Arc::new(ServerDeps {
        store: store.clone(),
        bus: bus.clone(),
        auth: Arc::new(Authenticator::new(TEST_SECRET)),
        metrics: RelayMetrics::new(),
        history_limit: 50,
        max_content_len: 4000,
        handshake_timeout: Duration::from_secs(5),
        max_connections: 64,
    });
    tokio::spawn(server::run(listener, deps));

    TestRelay { addr, store, bus }
}

/// Mints a valid bearer token for a test user.
#[allow(dead_code)]
pub fn token_for(user_id: i64, role: &str) -> String {
    auth::issue_token(TEST_SECRET, user_id, role, 60)
}

/// Connects a WebSocket client to the relay at the given path and query.
#[allow(dead_code)]
pub async fn connect(addr: SocketAddr, path_and_query: &str) -> WsClient {
    let url = format!("ws://{addr}{path_and_query}");
    let (ws, _) = connect_async(url).await.expect("WebSocket connect failed");
    ws
}

/// Receives the next text frame as JSON, failing after two seconds.
#[allow(dead_code)]
pub async fn recv_json(ws: &mut WsClient) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timed out waiting for frame")
        .expect("Connection closed unexpectedly")
        .expect("WebSocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).expect("Frame is not JSON"),
        other => panic!("Expected text frame, got {:?}", other),
    }
}

/// Asserts that no frame arrives within the given window.
#[allow(dead_code)]
pub async fn assert_silent(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, ws.next()).await;
    assert!(result.is_err(), "Expected silence, got {:?}", result);
}

/// Reads frames until a close frame arrives; returns its close code.
#[allow(dead_code)]
pub async fn recv_close_code(ws: &mut WsClient) -> u16 {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Timed out waiting for close")
            .expect("Connection ended without close frame")
            .expect("WebSocket error");
        if let Message::Close(frame) = msg {
            return u16::from(frame.expect("Close frame carries no code").code);
        }
    }
}

/// Polls a condition until it holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_until<F: Fn() -> bool>(condition: F, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
