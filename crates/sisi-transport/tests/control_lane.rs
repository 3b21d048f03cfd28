//! Control lane integration tests over real sockets.

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sisi_proto::{now_ms, GatewayMessage};
use sisi_transport::{
    BridgeConfig, ControlCoordinator, ControlLaneListener, SocketBridgeService, SupervisorOptions,
    TransportSupervisor, TransportTopology,
};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

fn loopback() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}

fn free_port() -> u16 {
    TcpListener::bind(loopback()).unwrap().local_addr().unwrap().port()
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn read_ack(reader: &mut BufReader<TcpStream>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    serde_json::from_str(&line).unwrap()
}

// ==================== Raw TCP Tests ====================

#[test]
fn test_stale_sequence_dropped_over_tcp() {
    let coordinator = Arc::new(ControlCoordinator::default());
    let listener = ControlLaneListener::start(loopback(), Arc::clone(&coordinator)).unwrap();

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut reader = BufReader::new(client.try_clone().unwrap());

    let ts = now_ms();
    writeln!(client, "type=commit_turn;stream=s1;epoch=3;seq=7;ts={ts}").unwrap();
    let first = read_ack(&mut reader);
    writeln!(client, "type=commit_turn;stream=s1;epoch=3;seq=7;ts={ts}").unwrap();
    let second = read_ack(&mut reader);
    writeln!(client, "type=commit_turn;stream=s1;epoch=4;seq=1;ts={ts}").unwrap();
    let third = read_ack(&mut reader);

    assert_eq!(first["ok"], true);
    assert_eq!(second["ok"], false);
    assert_eq!(second["reason"], "drop_stale_seq");
    assert_eq!(third["ok"], true);

    let snap = coordinator.snapshot();
    assert_eq!(snap.metrics.received, 3);
    assert_eq!(snap.metrics.drop_stale_seq, 1);
    listener.stop();
}

#[test]
fn test_capability_report_over_tcp() {
    let coordinator = Arc::new(ControlCoordinator::default());
    let listener = ControlLaneListener::start(loopback(), Arc::clone(&coordinator)).unwrap();

    let mut client = TcpStream::connect(listener.local_addr()).unwrap();
    client
        .write_all(b"<control>type=heartbeat;payload=source=android_capture_fx&aec_available=1&ns_available=0&agc_available=1</control>")
        .unwrap();

    assert!(wait_until(|| coordinator.capabilities().aec_available));
    let snap = coordinator.snapshot();
    assert!(snap.device_agc_available);
    assert!(!snap.device_ns_available);
    assert_eq!(snap.metrics.last_action, "heartbeat+capture_fx");
    listener.stop();
}

// ==================== Bridge Tests ====================

#[tokio::test]
async fn test_websocket_bridge_into_control_lane() {
    let coordinator = Arc::new(ControlCoordinator::default());
    let listener = ControlLaneListener::start(loopback(), Arc::clone(&coordinator)).unwrap();
    let bridge = SocketBridgeService::start(
        BridgeConfig::new("control_ws", loopback(), listener.local_addr().port())
            .with_text_suffix("\n"),
    )
    .unwrap();
    for _ in 0..100 {
        if bridge.is_ready() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let url = format!("ws://{}", bridge.local_addr());
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text(format!(
        "type=interrupt;stream=s1;priority=high;ts={}",
        now_ms()
    )))
    .await
    .unwrap();

    let reply = timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let bytes = match reply {
        Message::Binary(bytes) => bytes,
        other => std::panic::panic_any(format!("expected binary ack, got {other:?}")),
    };
    let ack: serde_json::Value = serde_json::from_slice(bytes.trim_ascii_end()).unwrap();
    assert_eq!(ack["type"], "control_ack");
    assert_eq!(ack["control_type"], "interrupt");
    assert_eq!(ack["ok"], true);

    let snap = coordinator.snapshot();
    assert_eq!(snap.metrics.interrupt, 1);
    assert_eq!(snap.metrics.last_source_lane, "control_lane");

    bridge.stop();
    listener.stop();
}

// ==================== Full Chain Tests ====================

#[tokio::test]
async fn test_gateway_control_reaches_coordinator() {
    let device_tcp_port = free_port();
    let gateway_port = free_port();
    let topology = TransportTopology {
        device_tcp_port,
        device_ws_port: free_port(),
        device_tcp_target_port: device_tcp_port,
        control_tcp_port: free_port(),
        control_ws_port: free_port(),
        gateway_host: "127.0.0.1".to_string(),
        gateway_port,
        gateway_access_token: "T".to_string(),
        ..TransportTopology::default()
    };
    let options = SupervisorOptions {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        media_settle: Duration::from_millis(50),
        control_settle: Duration::from_millis(100),
        ..SupervisorOptions::default()
    };
    let supervisor = TransportSupervisor::new(topology, Arc::new(ControlCoordinator::default()))
        .with_options(options);
    supervisor.start().unwrap();

    let url = format!("ws://127.0.0.1:{gateway_port}/control?device_id=d1&session_id=s1&token=T");
    let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
    ws.send(Message::Text(format!("<control>type=commit_turn;ts={}</control>", now_ms())))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(10), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = match reply {
        Message::Text(text) => text,
        other => std::panic::panic_any(format!("expected text ack, got {other:?}")),
    };
    match GatewayMessage::from_json(&text).unwrap() {
        GatewayMessage::ControlAck {
            ok,
            session_id,
            device_id,
            control_type,
            ..
        } => {
            assert!(ok);
            assert_eq!(session_id, "s1");
            assert_eq!(device_id, "d1");
            assert_eq!(control_type, "commit_turn");
        }
        other => std::panic::panic_any(format!("unexpected message {other:?}")),
    }

    let coordinator = supervisor.coordinator();
    let mut counted = false;
    for _ in 0..300 {
        if coordinator.snapshot().metrics.commit == 1 {
            counted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(counted);
    assert_eq!(coordinator.snapshot().metrics.last_source_lane, "control_lane");

    let _ = ws.close(None).await;
    supervisor.stop();
}
