//! End-to-end tests for the gateway against mock WebSocket backends.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sisi_gateway_server::{GatewayConfig, GatewayServer, ShutdownHandle};
use sisi_proto::{now_ms, GatewayMessage};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ==================== Helpers ====================

/// Mock backend that reports every received data message and optionally
/// greets each connection with a binary frame.
async fn spawn_backend(greeting: Option<Vec<u8>>) -> (String, mpsc::UnboundedReceiver<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let greeting = greeting.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                if let Some(bytes) = greeting {
                    let _ = ws.send(Message::Binary(bytes)).await;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_text() || msg.is_binary() {
                        let _ = tx.send(msg);
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), rx)
}

async fn unused_backend_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

async fn start_gateway(config: GatewayConfig) -> (SocketAddr, GatewayServer, ShutdownHandle) {
    let server = GatewayServer::new(config).unwrap();
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (addr, server, handle)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    ws
}

async fn next_message(ws: &mut Client) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
}

async fn next_gateway_message(ws: &mut Client) -> GatewayMessage {
    let msg = next_message(ws).await;
    GatewayMessage::from_json(msg.to_text().unwrap()).unwrap()
}

async fn expect_close(ws: &mut Client, code: CloseCode, reason: &str) {
    match next_message(ws).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, code);
            assert_eq!(frame.reason, reason);
        }
        other => assert_eq!(other, Message::Close(None), "expected close frame"),
    }
}

/// Mock backend that sends `count` binary frames of `size` bytes to its
/// first connection and then closes it.
async fn spawn_burst_backend(count: usize, size: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = accept_async(stream).await else {
            return;
        };
        for i in 0..count {
            let _ = ws.send(Message::Binary(vec![(i % 251) as u8; size])).await;
        }
        let _ = ws.close(None).await;
        while let Some(Ok(_)) = ws.next().await {}
    });

    format!("ws://{addr}")
}

/// Mock backend that reports every message it receives, close frames
/// included.
async fn spawn_observed_backend() -> (String, mpsc::UnboundedReceiver<Message>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    let _ = tx.send(msg);
                }
            });
        }
    });

    (format!("ws://{addr}"), rx)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn base_config(media: &str, control: &str) -> GatewayConfig {
    GatewayConfig::new("127.0.0.1", 0)
        .with_media_backend(media)
        .with_control_backend(control)
}

// ==================== /device Tests ====================

#[tokio::test]
async fn test_device_session_and_commit_ack() {
    let (media_url, mut media_rx) = spawn_backend(None).await;
    let control_url = unused_backend_url().await;
    let (addr, server, handle) =
        start_gateway(base_config(&media_url, &control_url).with_access_token("T")).await;

    let mut client = connect(addr, "/device?device_id=d1&session_id=s1&token=T").await;

    match next_gateway_message(&mut client).await {
        GatewayMessage::GatewaySession {
            session_id,
            device_id,
            ts_ms,
        } => {
            assert_eq!(session_id, "s1");
            assert_eq!(device_id, "d1");
            assert!(ts_ms > 0);
        }
        other => assert_eq!(other, GatewayMessage::health(), "expected gateway_session"),
    }

    let frame = format!("<control>type=commit_turn;ts={}</control>", now_ms());
    client.send(Message::Text(frame.clone())).await.unwrap();

    match next_gateway_message(&mut client).await {
        GatewayMessage::ControlAck {
            ok,
            session_id,
            device_id,
            control_type,
            reason,
            ts_ms,
        } => {
            assert!(ok);
            assert_eq!(session_id, "s1");
            assert_eq!(device_id, "d1");
            assert_eq!(control_type, "commit_turn");
            assert!(reason.is_none());
            assert!(ts_ms.is_some());
        }
        other => assert_eq!(other, GatewayMessage::health(), "expected control_ack"),
    }

    let forwarded = tokio::time::timeout(RECV_TIMEOUT, media_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, Message::Text(frame));

    assert!(server.registry().get_active_by_device("d1").is_some());
    client.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.registry().get("s1").is_none());

    handle.shutdown();
}

#[tokio::test]
async fn test_device_pipes_backend_and_binary_audio() {
    let (media_url, mut media_rx) = spawn_backend(Some(vec![1, 2, 3])).await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/device?device_id=d2").await;
    let first = next_gateway_message(&mut client).await;
    assert!(matches!(first, GatewayMessage::GatewaySession { .. }));

    assert_eq!(next_message(&mut client).await, Message::Binary(vec![1, 2, 3]));

    client.send(Message::Binary(vec![9, 9])).await.unwrap();
    let forwarded = tokio::time::timeout(RECV_TIMEOUT, media_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, Message::Binary(vec![9, 9]));

    handle.shutdown();
}

#[tokio::test]
async fn test_device_plain_text_gets_no_ack() {
    let (media_url, mut media_rx) = spawn_backend(None).await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/device?device_id=d3&session_id=s3").await;
    let _ = next_gateway_message(&mut client).await;

    client.send(Message::Text("hello".to_string())).await.unwrap();
    let forwarded = tokio::time::timeout(RECV_TIMEOUT, media_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, Message::Text("hello".to_string()));

    let nothing = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(nothing.is_err());

    handle.shutdown();
}

#[tokio::test]
async fn test_device_media_backend_unavailable_closes_session() {
    let media_url = unused_backend_url().await;
    let control_url = unused_backend_url().await;
    let (addr, server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/device?device_id=d4&session_id=s4").await;
    let _ = next_gateway_message(&mut client).await;
    expect_close(&mut client, CloseCode::Error, "media_backend_unavailable").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.registry().get("s4").is_none());
    assert!(server.registry().get_active_by_device("d4").is_none());

    handle.shutdown();
}

#[tokio::test]
async fn test_device_backend_close_flushes_tail_and_closes_client() {
    const FRAMES: usize = 200;
    let media_url = spawn_burst_backend(FRAMES, 1024).await;
    let control_url = unused_backend_url().await;
    let (addr, server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/device?device_id=d5&session_id=s5").await;
    let first = next_gateway_message(&mut client).await;
    assert!(matches!(first, GatewayMessage::GatewaySession { .. }));

    let mut received = 0;
    let last = loop {
        match next_message(&mut client).await {
            Message::Binary(data) => {
                assert_eq!(data.len(), 1024);
                received += 1;
            }
            other => break other,
        }
    };

    assert_eq!(received, FRAMES);
    match last {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => assert_eq!(other, Message::Close(None), "expected close frame"),
    }

    let registry = server.registry();
    assert!(wait_until(|| registry.get_active_by_device("d5").is_none()).await);
    assert!(registry.get("s5").is_none());

    handle.shutdown();
}

#[tokio::test]
async fn test_device_client_close_closes_backend_and_session() {
    let (media_url, mut media_rx) = spawn_observed_backend().await;
    let control_url = unused_backend_url().await;
    let (addr, server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/device?device_id=d6&session_id=s6").await;
    let _ = next_gateway_message(&mut client).await;
    client.send(Message::Binary(vec![7, 7, 7])).await.unwrap();
    client.close(None).await.unwrap();

    let forwarded = tokio::time::timeout(RECV_TIMEOUT, media_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, Message::Binary(vec![7, 7, 7]));
    let closed = tokio::time::timeout(RECV_TIMEOUT, media_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(closed.is_close());

    let registry = server.registry();
    assert!(wait_until(|| registry.get_active_by_device("d6").is_none()).await);
    assert!(registry.get("s6").is_none());

    handle.shutdown();
}

#[tokio::test]
async fn test_device_keepalive_ping() {
    let (media_url, _media_rx) = spawn_backend(None).await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) = start_gateway(
        base_config(&media_url, &control_url).with_ping_interval(Duration::from_millis(100)),
    )
    .await;

    let mut client = connect(addr, "/device?device_id=d8&session_id=s8").await;
    let _ = next_gateway_message(&mut client).await;

    assert!(matches!(next_message(&mut client).await, Message::Ping(_)));

    handle.shutdown();
}

// ==================== Shutdown Tests ====================

#[tokio::test]
async fn test_shutdown_closes_device_sessions() {
    let (media_url, mut media_rx) = spawn_observed_backend().await;
    let control_url = unused_backend_url().await;
    let (addr, server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/device?device_id=d7&session_id=s7").await;
    let _ = next_gateway_message(&mut client).await;
    let registry = server.registry();
    assert!(registry.get_active_by_device("d7").is_some());

    handle.shutdown();

    match next_message(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Normal),
        other => assert_eq!(other, Message::Close(None), "expected close frame"),
    }
    let closed = tokio::time::timeout(RECV_TIMEOUT, media_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(closed.is_close());
    assert!(wait_until(|| registry.get_active_by_device("d7").is_none()).await);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_control_lane() {
    let media_url = unused_backend_url().await;
    let (control_url, _control_rx) = spawn_backend(None).await;
    let (addr, _server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/control?device_id=d1&session_id=s1").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.shutdown();

    expect_close(&mut client, CloseCode::Away, "gateway_shutdown").await;
}

// ==================== Auth Tests ====================

#[tokio::test]
async fn test_missing_token_rejected() {
    let media_url = unused_backend_url().await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) =
        start_gateway(base_config(&media_url, &control_url).with_access_token("T")).await;

    let mut client = connect(addr, "/device?device_id=d1").await;
    assert_eq!(
        next_gateway_message(&mut client).await,
        GatewayMessage::gateway_error("missing_token")
    );
    expect_close(&mut client, CloseCode::Policy, "missing_token").await;

    handle.shutdown();
}

#[tokio::test]
async fn test_invalid_header_token_rejected() {
    let media_url = unused_backend_url().await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) =
        start_gateway(base_config(&media_url, &control_url).with_access_token("T")).await;

    let mut request = format!("ws://{addr}/control")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-sisi-token", HeaderValue::from_static("wrong"));
    let (mut client, _) = connect_async(request).await.unwrap();

    assert_eq!(
        next_gateway_message(&mut client).await,
        GatewayMessage::gateway_error("invalid_token")
    );
    expect_close(&mut client, CloseCode::Policy, "invalid_token").await;

    handle.shutdown();
}

#[tokio::test]
async fn test_bearer_token_accepted_for_health() {
    let media_url = unused_backend_url().await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) =
        start_gateway(base_config(&media_url, &control_url).with_access_token("T")).await;

    let mut request = format!("ws://{addr}/health").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("authorization", HeaderValue::from_static("Bearer T"));
    let (mut client, _) = connect_async(request).await.unwrap();

    assert_eq!(next_gateway_message(&mut client).await, GatewayMessage::health());
    expect_close(&mut client, CloseCode::Normal, "ok").await;

    handle.shutdown();
}

// ==================== Routing Tests ====================

#[tokio::test]
async fn test_health_without_token_config() {
    let media_url = unused_backend_url().await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/health").await;
    assert_eq!(next_gateway_message(&mut client).await, GatewayMessage::health());
    expect_close(&mut client, CloseCode::Normal, "ok").await;

    handle.shutdown();
}

#[tokio::test]
async fn test_unknown_route_rejected() {
    let media_url = unused_backend_url().await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/nope").await;
    assert_eq!(
        next_gateway_message(&mut client).await,
        GatewayMessage::gateway_error("unknown_route")
    );
    expect_close(&mut client, CloseCode::Policy, "unknown_route").await;

    handle.shutdown();
}

// ==================== /control Tests ====================

#[tokio::test]
async fn test_control_forward_success() {
    let media_url = unused_backend_url().await;
    let (control_url, mut control_rx) = spawn_backend(None).await;
    let (addr, _server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/control?device_id=d1&session_id=s1").await;
    let payload = "<control>type=interrupt;seq=1</control>".to_string();
    client.send(Message::Text(payload.clone())).await.unwrap();

    match next_gateway_message(&mut client).await {
        GatewayMessage::ControlAck {
            ok,
            session_id,
            device_id,
            control_type,
            reason,
            ..
        } => {
            assert!(ok);
            assert_eq!(session_id, "s1");
            assert_eq!(device_id, "d1");
            assert_eq!(control_type, "interrupt");
            assert!(reason.is_none());
        }
        other => assert_eq!(other, GatewayMessage::health(), "expected control_ack"),
    }

    let forwarded = tokio::time::timeout(RECV_TIMEOUT, control_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(forwarded, Message::Text(payload));

    handle.shutdown();
}

#[tokio::test]
async fn test_control_forward_failure_reports_reason() {
    let media_url = unused_backend_url().await;
    let control_url = unused_backend_url().await;
    let (addr, _server, handle) = start_gateway(
        base_config(&media_url, &control_url)
            .with_control_connect_timeout(Duration::from_secs(2)),
    )
    .await;

    let mut client = connect(addr, "/control?device_id=d1&session_id=s1").await;
    client
        .send(Message::Text(r#"{"type":"Wake_Hit"}"#.to_string()))
        .await
        .unwrap();

    match next_gateway_message(&mut client).await {
        GatewayMessage::ControlAck {
            ok,
            control_type,
            reason,
            ..
        } => {
            assert!(!ok);
            assert_eq!(control_type, "wake_hit");
            assert!(reason.unwrap().starts_with("forward_failed:"));
        }
        other => assert_eq!(other, GatewayMessage::health(), "expected control_ack"),
    }

    handle.shutdown();
}

#[tokio::test]
async fn test_control_binary_rejected() {
    let media_url = unused_backend_url().await;
    let (control_url, _control_rx) = spawn_backend(None).await;
    let (addr, _server, handle) = start_gateway(base_config(&media_url, &control_url)).await;

    let mut client = connect(addr, "/control?device_id=d1&session_id=s1").await;
    client.send(Message::Binary(vec![0, 1])).await.unwrap();

    match next_gateway_message(&mut client).await {
        GatewayMessage::ControlAck {
            ok,
            session_id,
            device_id,
            control_type,
            reason,
            ts_ms,
        } => {
            assert!(!ok);
            assert_eq!(session_id, "s1");
            assert_eq!(device_id, "d1");
            assert_eq!(control_type, "unknown");
            assert_eq!(reason.as_deref(), Some("control_lane_text_only"));
            assert!(ts_ms.is_some());
        }
        other => assert_eq!(other, GatewayMessage::health(), "expected control_ack"),
    }

    handle.shutdown();
}
