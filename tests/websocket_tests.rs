//! Viewer tests: handshake, backlog delivery and ordering over real sockets

use bytes::BytesMut;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedRead;
use vizstream::config::ServerConfig;
use vizstream::server::http::read_head;
use vizstream::server::websocket::{FrameCodec, Opcode};
use vizstream::server::{Publisher, VizServer};
use vizstream::types::{Entry, CLEAR_SENTINEL};
use vizstream::Result;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

type Viewer = FramedRead<TcpStream, FrameCodec>;

async fn start_server() -> (Arc<VizServer>, String, JoinHandle<Result<()>>) {
    let mut config = ServerConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.show_url = false;

    let server = Arc::new(VizServer::new(config).unwrap());
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let running = Arc::clone(&server);
    let task = tokio::spawn(async move { running.serve(listener).await });
    (server, addr, task)
}

/// Perform the opening handshake and return the head and a frame reader
async fn connect_viewer(addr: &str) -> (String, Viewer) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        addr, SAMPLE_KEY
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = BytesMut::new();
    let end = timeout(Duration::from_secs(2), read_head(&mut stream, &mut buf, 64 * 1024))
        .await
        .expect("handshake timed out")
        .unwrap()
        .expect("handshake head incomplete");
    let head = String::from_utf8_lossy(&buf[..end]).into_owned();
    let leftover = buf.split_off(end + 4);

    let mut frames = FramedRead::new(stream, FrameCodec::default());
    frames.read_buffer_mut().extend_from_slice(&leftover);
    (head, frames)
}

async fn next_entry(viewer: &mut Viewer) -> Entry {
    let frame = timeout(Duration::from_secs(2), viewer.next())
        .await
        .expect("viewer read timed out")
        .expect("viewer stream closed")
        .unwrap();
    assert_eq!(frame.opcode, Opcode::Text);
    assert!(frame.fin);
    serde_json::from_slice(&frame.payload).unwrap()
}

async fn settle(publisher: &Publisher) {
    publisher.broadcaster().schedule_flush();
    assert!(
        publisher
            .wait_settled(Duration::from_millis(5), Duration::from_secs(2))
            .await
    );
}

#[tokio::test]
async fn test_handshake_accept_token() {
    let (server, addr, _task) = start_server().await;
    let (head, _viewer) = connect_viewer(&addr).await;

    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols"));
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {}", SAMPLE_ACCEPT)));
    server.shutdown();
}

#[tokio::test]
async fn test_missing_key_closes_connection() {
    let (server, addr, _task) = start_server().await;

    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
        .await
        .unwrap();
    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(2), stream.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // The listener is unaffected
    let (head, _viewer) = connect_viewer(&addr).await;
    assert!(head.starts_with("HTTP/1.1 101"));
    server.shutdown();
}

#[tokio::test]
async fn test_backlog_precedes_new_entries() {
    let (server, addr, _task) = start_server().await;
    let publisher = server.publisher();

    publisher.send(json!(1), Some("a".into()), Some("number".into()), false);
    publisher.send(json!([1]), Some("b".into()), Some("table".into()), false);
    publisher.send(json!([2]), Some("b".into()), None, true);
    publisher.send(json!("third"), Some("c".into()), None, false);
    settle(&publisher).await;

    let (_, mut viewer) = connect_viewer(&addr).await;
    publisher.send(json!("later"), Some("d".into()), None, false);

    let mut received = Vec::new();
    for _ in 0..4 {
        received.push(next_entry(&mut viewer).await);
    }

    let ids: Vec<&str> = received.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
    assert_eq!(received[1].data, json!([1, 2]));
    assert_eq!(received[1].view.as_deref(), Some("table"));
    assert_eq!(received[3].data, json!("later"));
    server.shutdown();
}

#[tokio::test]
async fn test_all_viewers_receive_updates_in_order() {
    let (server, addr, _task) = start_server().await;
    let publisher = server.publisher();

    let (_, mut first) = connect_viewer(&addr).await;
    let (_, mut second) = connect_viewer(&addr).await;
    sleep(Duration::from_millis(50)).await;

    for i in 0..25 {
        publisher.send(json!(i), Some(format!("k{}", i)), None, false);
    }

    for viewer in [&mut first, &mut second] {
        let mut values = Vec::new();
        for _ in 0..25 {
            values.push(next_entry(viewer).await.data);
        }
        let expected: Vec<Value> = (0..25).map(|i| json!(i)).collect();
        assert_eq!(values, expected);
    }
    server.shutdown();
}

#[tokio::test]
async fn test_clear_is_broadcast() {
    let (server, addr, _task) = start_server().await;
    let publisher = server.publisher();
    let (_, mut viewer) = connect_viewer(&addr).await;
    sleep(Duration::from_millis(50)).await;

    publisher.send(json!("x"), Some("x".into()), None, false);
    publisher.clear();

    assert_eq!(next_entry(&mut viewer).await.id, "x");
    let signal = next_entry(&mut viewer).await;
    assert_eq!(signal.data, json!(CLEAR_SENTINEL));
    assert!(publisher.snapshot().is_empty());
    server.shutdown();
}

#[tokio::test]
async fn test_disconnected_viewer_does_not_block_others() {
    let (server, addr, _task) = start_server().await;
    let publisher = server.publisher();

    let (_, mut gone) = connect_viewer(&addr).await;
    let (_, mut alive) = connect_viewer(&addr).await;
    sleep(Duration::from_millis(50)).await;

    // Masked close frame from the client
    gone.get_mut()
        .write_all(&[0x88, 0x80, 0x01, 0x02, 0x03, 0x04])
        .await
        .unwrap();
    drop(gone);
    sleep(Duration::from_millis(50)).await;

    publisher.send(json!("after"), Some("z".into()), None, false);
    assert_eq!(next_entry(&mut alive).await.data, json!("after"));
    settle(&publisher).await;
    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_sends_close_frame() {
    let (server, addr, task) = start_server().await;
    let (_, mut viewer) = connect_viewer(&addr).await;
    sleep(Duration::from_millis(50)).await;

    server.shutdown();
    server.shutdown();

    let frame = timeout(Duration::from_secs(2), viewer.next())
        .await
        .unwrap()
        .expect("expected a close frame")
        .unwrap();
    assert_eq!(frame.opcode, Opcode::Close);

    let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert!(result.is_ok());
}
