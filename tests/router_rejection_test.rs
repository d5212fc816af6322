//! Upgrade routing and resource teardown tests.

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use common::*;
use mentor_relay::routing::{community_key, TOPIC_EXCHANGE};

#[tokio::test]
async fn test_unknown_upgrade_path_destroyed_without_a_byte() {
    let relay = start_relay().await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    let request = format!(
        "GET /ws/admin?token=x HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        relay.addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    // No handshake response, no error body: the socket just closes.
    let mut buf = [0u8; 256];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("Server never closed the socket")
        .unwrap();
    assert_eq!(n, 0, "Expected EOF with zero bytes, got {:?}", &buf[..n]);
}

#[tokio::test]
async fn test_health_probe_on_websocket_port() {
    let relay = start_relay().await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains(r#""status":"healthy""#));
}

#[tokio::test]
async fn test_plain_get_receives_hint() {
    let relay = start_relay().await;

    let mut stream = TcpStream::connect(relay.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.contains("WebSocket relay"));
}

#[tokio::test]
async fn test_session_teardown_releases_broker_resources() {
    let relay = start_relay().await;
    relay.store.add_user(1, "Ada", "mentor");
    relay.store.add_membership(1, 1, "mentor");
    let token = token_for(1, "mentor");

    // Repeated connect/disconnect cycles must not leak queues or bindings.
    for _ in 0..5 {
        let mut ws = connect(
            relay.addr,
            &format!("/ws/community?token={token}&communityId=1"),
        )
        .await;
        assert_eq!(recv_json(&mut ws).await["type"], "community.history");
        assert_eq!(recv_json(&mut ws).await["type"], "system");
        assert_eq!(relay.bus.bound_queue_count_for(TOPIC_EXCHANGE, &community_key(1)), 1);

        ws.close(None).await.unwrap();
        let released = wait_until(|| relay.bus.bound_queue_count() == 0, Duration::from_secs(2)).await;
        assert!(released, "Queue still bound after session close");
    }
}

#[tokio::test]
async fn test_two_sessions_each_hold_one_queue() {
    let relay = start_relay().await;
    relay.store.add_user(1, "Ada", "mentor");
    relay.store.add_user(2, "Bo", "mentee");
    relay.store.add_membership(1, 1, "mentor");
    relay.store.add_membership(1, 2, "mentee");

    let token_a = token_for(1, "mentor");
    let token_b = token_for(2, "mentee");
    let mut ws_a = connect(
        relay.addr,
        &format!("/ws/community?token={token_a}&communityId=1"),
    )
    .await;
    let mut ws_b = connect(
        relay.addr,
        &format!("/ws/community?token={token_b}&communityId=1"),
    )
    .await;
    for ws in [&mut ws_a, &mut ws_b] {
        assert_eq!(recv_json(ws).await["type"], "community.history");
        assert_eq!(recv_json(ws).await["type"], "system");
    }

    // Same binding key, separate ephemeral queues.
    assert_eq!(relay.bus.bound_queue_count_for(TOPIC_EXCHANGE, &community_key(1)), 2);

    ws_a.close(None).await.unwrap();
    let down_to_one = wait_until(
        || relay.bus.bound_queue_count_for(TOPIC_EXCHANGE, &community_key(1)) == 1,
        Duration::from_secs(2),
    )
    .await;
    assert!(down_to_one, "First session's queue not released");
}
