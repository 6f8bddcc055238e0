//! Integration tests for the connect-relay WebSocket server
//!
//! These tests drive a real server bound to an ephemeral port:
//! - File uploads land in the download directory and are acknowledged
//! - Notifications are fanned out to every connected client
//! - Malformed frames get an error status without closing the socket
//! - Unsafe filenames never escape the download directory
//! - Silent peers are dropped, slow uploads are not

use futures::{SinkExt, StreamExt};
use k9::assert_equal;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use connect_relay::RelayConfig;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    downloads: tempfile::TempDir,
    _shutdown: oneshot::Sender<()>,
}

async fn spawn_relay(echo_to_sender: bool) -> TestRelay {
    spawn_relay_with(|config| config.echo_to_sender = echo_to_sender).await
}

async fn spawn_relay_with(tweak: impl FnOnce(&mut RelayConfig)) -> TestRelay {
    let downloads = tempfile::tempdir().expect("tempdir");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut config = RelayConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        download_dir: downloads.path().to_path_buf(),
        ..RelayConfig::default()
    };
    tweak(&mut config);
    let (addr, server) = connect_relay::bind(config, async {
        let _ = shutdown_rx.await;
    })
    .expect("bind relay");
    tokio::spawn(server);

    TestRelay {
        addr,
        downloads,
        _shutdown: shutdown_tx,
    }
}

fn fast_heartbeat(config: &mut RelayConfig) {
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_timeout = Duration::from_millis(250);
}

/// Waits for the next text frame, skipping ping/pong
async fn next_json<S>(ws: &mut WebSocketStream<S>) -> Value
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Connection closed")
            .expect("Failed to receive message");
        match msg {
            Message::Text(t) => return serde_json::from_str(&t).expect("server sent invalid json"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text message, got {:?}", other),
        }
    }
}

/// Reads (and so answers pings) for `period`, expecting no payload.
async fn keep_reading(ws: &mut Ws, period: Duration) {
    let deadline = tokio::time::Instant::now() + period;
    while let Ok(msg) = tokio::time::timeout_at(deadline, ws.next()).await {
        match msg {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            other => panic!("expected only heartbeats, got {:?}", other),
        }
    }
}

async fn assert_silent(ws: &mut Ws) {
    let got = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(got.is_err(), "expected no message, got {:?}", got);
}

/// Connects and completes one request/response round trip, which
/// guarantees the server has registered the socket.
async fn connect_ready(addr: SocketAddr, path: &str) -> Ws {
    let url = format!("ws://{}{}", addr, path);
    let (mut ws, _) = connect_async(&url).await.expect("Failed to connect");
    ws.send(Message::text("ready?")).await.unwrap();
    assert_equal!(next_json(&mut ws).await["status"], json!("error"));
    ws
}

fn notification_frame() -> String {
    connect_proto::encode_notification("com.example", "Hi", "there", "2024-01-01 00:00:00")
}

/// base64 of `inner` wrapped the way the phone wraps notifications.
fn raw_notification(inner: Value) -> String {
    let Value::Object(fields) = inner else {
        panic!("notification data must be an object");
    };
    connect_proto::Envelope::Notification(connect_proto::NotificationPayload::from_fields(fields))
        .to_json(connect_proto::WireFormat::Legacy)
}

/// A single client-to-server text frame with an all-zero mask.
fn masked_text_frame(payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 1 << 16);
    let mut frame = vec![0x81, 0x80 | 126];
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0, 0, 0]);
    frame.extend_from_slice(payload);
    frame
}

/// Performs the opening handshake by hand and returns the raw socket.
async fn raw_handshake(addr: SocketAddr) -> TcpStream {
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    tcp.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        head.push(tcp.read_u8().await.unwrap());
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 101"), "handshake failed: {head}");
    tcp
}

fn expected_broadcast() -> Value {
    json!({
        "type": "notification",
        "data": {
            "package": "com.example",
            "title": "Hi",
            "text": "there",
            "timestamp": "2024-01-01 00:00:00"
        }
    })
}

#[tokio::test]
async fn test_file_upload_is_written_and_acknowledged() {
    let relay = spawn_relay(true).await;
    let mut ws = connect_ready(relay.addr, "/").await;

    ws.send(Message::text(r#"{"filename":"a.txt","filedata":"aGVsbG8="}"#))
        .await
        .unwrap();

    assert_equal!(
        next_json(&mut ws).await,
        json!({"status": "success", "message": "File received"})
    );
    let written = std::fs::read(relay.downloads.path().join("a.txt")).unwrap();
    assert_equal!(written, b"hello".to_vec());
}

#[tokio::test]
async fn test_empty_filedata_writes_empty_file() {
    let relay = spawn_relay(true).await;
    let mut ws = connect_ready(relay.addr, "/").await;

    ws.send(Message::text(r#"{"filename":"empty.bin","filedata":""}"#))
        .await
        .unwrap();

    assert_equal!(next_json(&mut ws).await["status"], json!("success"));
    let meta = std::fs::metadata(relay.downloads.path().join("empty.bin")).unwrap();
    assert_equal!(meta.len(), 0);
}

#[tokio::test]
async fn test_upload_overwrites_existing_file() {
    let relay = spawn_relay(true).await;
    let mut ws = connect_ready(relay.addr, "/").await;

    for content in [&b"first version"[..], b"v2"] {
        ws.send(Message::text(connect_proto::encode_file_upload("notes.txt", content)))
            .await
            .unwrap();
        assert_equal!(next_json(&mut ws).await["status"], json!("success"));
    }
    let written = std::fs::read(relay.downloads.path().join("notes.txt")).unwrap();
    assert_equal!(written, b"v2".to_vec());
}

#[tokio::test]
async fn test_notification_is_broadcast_to_all_clients() {
    let relay = spawn_relay(true).await;
    let mut a = connect_ready(relay.addr, "/").await;
    let mut b = connect_ready(relay.addr, "/").await;

    a.send(Message::text(notification_frame())).await.unwrap();

    // The sender is included in the fan-out, ahead of its status reply.
    assert_equal!(next_json(&mut a).await, expected_broadcast());
    assert_equal!(
        next_json(&mut a).await,
        json!({"status": "success", "message": "Notification received"})
    );
    assert_equal!(next_json(&mut b).await, expected_broadcast());
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_sender_excluded_when_echo_disabled() {
    let relay = spawn_relay(false).await;
    let mut a = connect_ready(relay.addr, "/").await;
    let mut b = connect_ready(relay.addr, "/").await;

    a.send(Message::text(notification_frame())).await.unwrap();

    assert_equal!(
        next_json(&mut a).await,
        json!({"status": "success", "message": "Notification received"})
    );
    assert_equal!(next_json(&mut b).await, expected_broadcast());
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_repeated_notification_is_not_deduplicated() {
    let relay = spawn_relay(false).await;
    let mut a = connect_ready(relay.addr, "/").await;
    let mut b = connect_ready(relay.addr, "/").await;

    for _ in 0..2 {
        a.send(Message::text(notification_frame())).await.unwrap();
        assert_equal!(next_json(&mut a).await["status"], json!("success"));
    }

    assert_equal!(next_json(&mut b).await, expected_broadcast());
    assert_equal!(next_json(&mut b).await, expected_broadcast());
}

#[tokio::test]
async fn test_malformed_input_keeps_connection_open() {
    let relay = spawn_relay(true).await;
    let mut a = connect_ready(relay.addr, "/").await;
    let mut b = connect_ready(relay.addr, "/").await;

    a.send(Message::text("this is not json")).await.unwrap();
    let reply = next_json(&mut a).await;
    assert_equal!(reply["status"], json!("error"));
    assert!(reply["message"].as_str().unwrap().contains("invalid json"));
    assert_silent(&mut b).await;

    // Same socket still works.
    a.send(Message::text(connect_proto::encode_file_upload("after.txt", b"ok")))
        .await
        .unwrap();
    assert_equal!(next_json(&mut a).await["status"], json!("success"));

    // And the other client is unaffected.
    b.send(Message::text(notification_frame())).await.unwrap();
    assert_equal!(next_json(&mut a).await, expected_broadcast());
}

#[tokio::test]
async fn test_bad_notification_payload_is_reported() {
    let relay = spawn_relay(true).await;
    let mut a = connect_ready(relay.addr, "/").await;

    a.send(Message::text(r#"{"type":"notification","data":"%%%"}"#))
        .await
        .unwrap();
    let reply = next_json(&mut a).await;
    assert_equal!(reply["status"], json!("error"));
    assert!(reply["message"].as_str().unwrap().contains("base64"));
}

#[tokio::test]
async fn test_traversal_filename_is_rejected() {
    let relay = spawn_relay(true).await;
    let mut ws = connect_ready(relay.addr, "/").await;

    ws.send(Message::text(r#"{"filename":"../evil.txt","filedata":"aGVsbG8="}"#))
        .await
        .unwrap();

    let reply = next_json(&mut ws).await;
    assert_equal!(reply["status"], json!("error"));
    assert!(reply["message"].as_str().unwrap().starts_with("invalid filename"));
    assert!(!relay.downloads.path().join("evil.txt").exists());
    assert_equal!(std::fs::read_dir(relay.downloads.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_binary_frame_with_json_is_accepted() {
    let relay = spawn_relay(true).await;
    let mut ws = connect_ready(relay.addr, "/ws").await;

    ws.send(Message::Binary(
        br#"{"filename":"bin.txt","filedata":"aGVsbG8="}"#.to_vec(),
    ))
    .await
    .unwrap();
    assert_equal!(next_json(&mut ws).await["status"], json!("success"));

    ws.send(Message::Binary(vec![0xff, 0xfe, 0x00])).await.unwrap();
    assert_equal!(next_json(&mut ws).await["status"], json!("error"));
}

#[tokio::test]
async fn test_disconnected_client_does_not_break_broadcast() {
    let relay = spawn_relay(true).await;
    let mut a = connect_ready(relay.addr, "/").await;
    let mut b = connect_ready(relay.addr, "/").await;

    b.close(None).await.ok();
    drop(b);
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.send(Message::text(notification_frame())).await.unwrap();
    assert_equal!(next_json(&mut a).await, expected_broadcast());
    assert_equal!(next_json(&mut a).await["status"], json!("success"));
}

#[tokio::test]
async fn test_server_responds_to_healthz() {
    let relay = spawn_relay(true).await;

    let body = reqwest::get(format!("http://{}/healthz", relay.addr))
        .await
        .expect("Failed to send healthz request")
        .text()
        .await
        .expect("Failed to read response body");
    assert_equal!(body, "ok");
}

#[tokio::test]
async fn test_broadcast_carries_the_inner_object_unchanged() {
    let relay = spawn_relay(false).await;
    let mut a = connect_ready(relay.addr, "/").await;
    let mut b = connect_ready(relay.addr, "/").await;

    let inner = json!({
        "package": "p",
        "title": "t",
        "key": "k1",
        "extras": {"priority": 2}
    });
    a.send(Message::text(raw_notification(inner.clone()))).await.unwrap();
    assert_equal!(next_json(&mut a).await["status"], json!("success"));
    assert_equal!(
        next_json(&mut b).await,
        json!({"type": "notification", "data": inner})
    );

    // Nothing is filled in for keys the sender left out.
    a.send(Message::text(raw_notification(json!({})))).await.unwrap();
    assert_equal!(next_json(&mut a).await["status"], json!("success"));
    assert_equal!(
        next_json(&mut b).await,
        json!({"type": "notification", "data": {}})
    );
}

#[tokio::test]
async fn test_non_object_notification_data_is_an_error() {
    let relay = spawn_relay(true).await;
    let mut a = connect_ready(relay.addr, "/").await;

    // base64("[1,2]")
    a.send(Message::text(r#"{"type":"notification","data":"WzEsMl0="}"#))
        .await
        .unwrap();
    assert_equal!(
        next_json(&mut a).await,
        json!({"status": "error", "message": "invalid notification data: expected a json object"})
    );
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_oversized_message_gets_error_and_size_close() {
    let relay = spawn_relay_with(|config| config.max_message_size = 256).await;
    let mut ws = connect_ready(relay.addr, "/").await;

    ws.send(Message::text(connect_proto::encode_file_upload("big.bin", &[0u8; 1024])))
        .await
        .unwrap();

    let reply = next_json(&mut ws).await;
    assert_equal!(reply["status"], json!("error"));
    assert!(reply["message"].as_str().unwrap().starts_with("message too large"));
    match timeout(Duration::from_secs(5), ws.next()).await.expect("Timeout waiting for close") {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_equal!(frame.code, CloseCode::Size);
        }
        other => panic!("expected a 1009 close, got {:?}", other),
    }
    assert!(!relay.downloads.path().join("big.bin").exists());
}

#[tokio::test]
async fn test_silent_client_is_dropped_by_heartbeat() {
    let relay = spawn_relay_with(fast_heartbeat).await;
    let mut quiet = connect_ready(relay.addr, "/").await;
    let mut live = connect_ready(relay.addr, "/").await;

    // Only `live` reads, so only `live` answers pings.
    keep_reading(&mut live, Duration::from_millis(800)).await;

    live.send(Message::text(notification_frame())).await.unwrap();
    assert_equal!(next_json(&mut live).await, expected_broadcast());
    assert_equal!(next_json(&mut live).await["status"], json!("success"));

    // `quiet` has only heartbeats and the close waiting, never the broadcast.
    loop {
        match timeout(Duration::from_secs(5), quiet.next())
            .await
            .expect("Timeout waiting for close")
        {
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(other)) => panic!("timed-out client still received {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_slow_upload_is_not_cut_off_by_heartbeat() {
    let relay = spawn_relay_with(fast_heartbeat).await;
    let mut tcp = raw_handshake(relay.addr).await;

    let content = vec![b'x'; 3000];
    let frame = masked_text_frame(connect_proto::encode_file_upload("slow.txt", &content).as_bytes());
    // One frame spread over several heartbeat timeouts.
    for chunk in frame.chunks(frame.len() / 10 + 1) {
        tcp.write_all(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let mut ws = WebSocketStream::from_raw_socket(tcp, Role::Client, None).await;
    assert_equal!(
        next_json(&mut ws).await,
        json!({"status": "success", "message": "File received"})
    );
    assert_equal!(std::fs::read(relay.downloads.path().join("slow.txt")).unwrap(), content);
}
