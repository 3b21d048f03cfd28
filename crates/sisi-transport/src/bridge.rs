//! WebSocket to TCP socket bridge.
//!
//! Each WebSocket client gets its own TCP connection to the bridge target.
//! Text frames are written as UTF-8 plus an optional suffix, binary frames
//! verbatim; TCP bytes come back as binary frames. The service runs on its
//! own thread with a single-threaded runtime.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::listener::{join_with_timeout, spawn_worker, JOIN_TIMEOUT};

/// TCP read size for the return path.
pub const BRIDGE_READ_BYTES: usize = 4096;

/// Cadence of the per-client traffic log.
pub const TRAFFIC_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Service and thread name.
    pub name: &'static str,
    /// WebSocket listen address.
    pub ws_addr: SocketAddr,
    /// TCP target host.
    pub tcp_host: String,
    /// TCP target port.
    pub tcp_port: u16,
    /// Appended to every text frame, e.g. `"\n"` for the control lane.
    pub text_suffix: String,
}

impl BridgeConfig {
    /// Bridge `ws_addr` to `127.0.0.1:tcp_port` with no text suffix.
    #[must_use]
    pub fn new(name: &'static str, ws_addr: SocketAddr, tcp_port: u16) -> Self {
        Self {
            name,
            ws_addr,
            tcp_host: "127.0.0.1".to_string(),
            tcp_port,
            text_suffix: String::new(),
        }
    }

    /// Set the text frame suffix.
    #[must_use]
    pub fn with_text_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.text_suffix = suffix.into();
        self
    }
}

/// Lifetime traffic totals across all clients.
#[derive(Debug, Default)]
struct TrafficTotals {
    up_bytes: AtomicU64,
    up_msgs: AtomicU64,
    down_bytes: AtomicU64,
    down_msgs: AtomicU64,
    clients: AtomicU64,
}

/// Copy of the bridge traffic totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    /// Bytes written to TCP.
    pub up_bytes: u64,
    /// WebSocket messages forwarded to TCP.
    pub up_msgs: u64,
    /// Bytes read from TCP.
    pub down_bytes: u64,
    /// TCP reads forwarded to WebSocket.
    pub down_msgs: u64,
    /// Clients served.
    pub clients: u64,
}

/// Running WebSocket to TCP bridge.
pub struct SocketBridgeService {
    config: Arc<BridgeConfig>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    totals: Arc<TrafficTotals>,
    stop_tx: Arc<watch::Sender<bool>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SocketBridgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketBridgeService")
            .field("name", &self.config.name)
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SocketBridgeService {
    /// Bind the WebSocket address and start the bridge thread.
    ///
    /// # Errors
    ///
    /// Returns a bind error (address in use is reported distinctly) or a
    /// thread spawn error.
    pub fn start(config: BridgeConfig) -> TransportResult<Self> {
        let name = config.name;
        let std_listener = std::net::TcpListener::bind(config.ws_addr).map_err(|e| {
            let err = TransportError::bind(name, config.ws_addr.port(), e);
            error!(service = name, error = %err, "bridge bind failed");
            err
        })?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;

        let config = Arc::new(config);
        let running = Arc::new(AtomicBool::new(false));
        let totals = Arc::new(TrafficTotals::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let thread = {
            let config = Arc::clone(&config);
            let running = Arc::clone(&running);
            let totals = Arc::clone(&totals);
            spawn_worker(name, move || {
                run_bridge(std_listener, &config, &running, &totals, stop_rx);
            })?
        };

        Ok(Self {
            config,
            local_addr,
            running,
            totals,
            stop_tx: Arc::new(stop_tx),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Bound WebSocket address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the serve loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether the bridge thread has not exited.
    #[must_use]
    pub fn is_thread_alive(&self) -> bool {
        self.thread.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Whether the bridge thread is alive and serving.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.is_thread_alive() && self.is_running()
    }

    /// Traffic totals since start.
    #[must_use]
    pub fn traffic(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            up_bytes: self.totals.up_bytes.load(Ordering::Relaxed),
            up_msgs: self.totals.up_msgs.load(Ordering::Relaxed),
            down_bytes: self.totals.down_bytes.load(Ordering::Relaxed),
            down_msgs: self.totals.down_msgs.load(Ordering::Relaxed),
            clients: self.totals.clients.load(Ordering::Relaxed),
        }
    }

    /// Stop serving and join the thread. Idempotent.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(thread) = self.thread.lock().take() {
            join_with_timeout(self.config.name, thread, JOIN_TIMEOUT);
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for SocketBridgeService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_bridge(
    std_listener: std::net::TcpListener,
    config: &Arc<BridgeConfig>,
    running: &AtomicBool,
    totals: &Arc<TrafficTotals>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(service = config.name, error = %e, "failed to build bridge runtime");
            return;
        }
    };

    runtime.block_on(async {
        let listener = match TcpListener::from_std(std_listener) {
            Ok(l) => l,
            Err(e) => {
                error!(service = config.name, error = %e, "failed to register bridge listener");
                return;
            }
        };
        running.store(true, Ordering::SeqCst);
        info!(
            service = config.name,
            ws = ?listener.local_addr().ok(),
            tcp_port = config.tcp_port,
            "socket bridge started"
        );

        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        while clients.try_join_next().is_some() {}
                        clients.spawn(serve_client(
                            stream,
                            peer,
                            Arc::clone(config),
                            Arc::clone(totals),
                        ));
                    }
                    Err(e) => warn!(service = config.name, error = %e, "bridge accept failed"),
                },
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        running.store(false, Ordering::SeqCst);
        clients.shutdown().await;
        info!(service = config.name, "socket bridge stopped");
    });
}

#[derive(Debug, Default)]
struct ClientTraffic {
    up_bytes: u64,
    up_msgs: u64,
    down_bytes: u64,
    down_msgs: u64,
}

impl ClientTraffic {
    fn is_idle(&self) -> bool {
        self.up_msgs == 0 && self.down_msgs == 0
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<BridgeConfig>,
    totals: Arc<TrafficTotals>,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(service = config.name, peer = %peer, error = %e, "bridge handshake failed");
            return;
        }
    };

    let tcp = match TcpStream::connect((config.tcp_host.as_str(), config.tcp_port)).await {
        Ok(tcp) => tcp,
        Err(e) => {
            warn!(
                service = config.name,
                peer = %peer,
                target = %format!("{}:{}", config.tcp_host, config.tcp_port),
                error = %e,
                "bridge target connect failed, closing client"
            );
            let _ = ws.close(None).await;
            return;
        }
    };
    totals.clients.fetch_add(1, Ordering::Relaxed);
    info!(service = config.name, peer = %peer, "bridge client connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut tcp_rx, mut tcp_tx) = tcp.into_split();
    let mut buf = vec![0u8; BRIDGE_READ_BYTES];
    let mut traffic = ClientTraffic::default();
    let mut ticker = tokio::time::interval(TRAFFIC_LOG_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                let data = match msg {
                    Some(Ok(Message::Text(text))) => {
                        let mut data = text.into_bytes();
                        data.extend_from_slice(config.text_suffix.as_bytes());
                        data
                    }
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        debug!(service = config.name, error = %e, "bridge websocket read failed");
                        break;
                    }
                };
                if let Err(e) = tcp_tx.write_all(&data).await {
                    debug!(service = config.name, error = %e, "bridge tcp write failed");
                    break;
                }
                let n = data.len() as u64;
                traffic.up_bytes += n;
                traffic.up_msgs += 1;
                totals.up_bytes.fetch_add(n, Ordering::Relaxed);
                totals.up_msgs.fetch_add(1, Ordering::Relaxed);
            }
            read = tcp_rx.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(service = config.name, error = %e, "bridge tcp read failed");
                        break;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Binary(buf[..n].to_vec())).await {
                    debug!(service = config.name, error = %e, "bridge websocket write failed");
                    break;
                }
                traffic.down_bytes += n as u64;
                traffic.down_msgs += 1;
                totals.down_bytes.fetch_add(n as u64, Ordering::Relaxed);
                totals.down_msgs.fetch_add(1, Ordering::Relaxed);
            }
            _ = ticker.tick() => {
                if !traffic.is_idle() {
                    info!(
                        service = config.name,
                        peer = %peer,
                        up_bytes = traffic.up_bytes,
                        up_msgs = traffic.up_msgs,
                        down_bytes = traffic.down_bytes,
                        down_msgs = traffic.down_msgs,
                        "bridge traffic"
                    );
                }
                traffic = ClientTraffic::default();
            }
        }
    }

    let _ = tcp_tx.shutdown().await;
    let _ = ws_tx.close().await;
    info!(service = config.name, peer = %peer, "bridge client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    async fn wait_ready(bridge: &SocketBridgeService) {
        for _ in 0..100 {
            if bridge.is_ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ==================== Bridge Tests ====================

    #[tokio::test]
    async fn test_text_gets_suffix_and_tcp_returns_binary() {
        let target = TcpListener::bind(loopback()).await.unwrap();
        let target_port = target.local_addr().unwrap().port();
        let bridge = SocketBridgeService::start(
            BridgeConfig::new("test_bridge", loopback(), target_port).with_text_suffix("\n"),
        )
        .unwrap();
        wait_ready(&bridge).await;
        assert!(bridge.is_ready());

        let url = format!("ws://{}", bridge.local_addr());
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        let (mut upstream, _) = timeout(Duration::from_secs(5), target.accept())
            .await
            .unwrap()
            .unwrap();

        client
            .send(Message::Text("type=interrupt".to_string()))
            .await
            .unwrap();
        let mut got = vec![0u8; 15];
        timeout(Duration::from_secs(5), upstream.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"type=interrupt\n");

        upstream.write_all(b"pong").await.unwrap();
        let reply = timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::Binary(b"pong".to_vec()));

        let traffic = bridge.traffic();
        assert_eq!(traffic.up_msgs, 1);
        assert_eq!(traffic.up_bytes, 15);
        assert_eq!(traffic.clients, 1);

        bridge.stop();
        assert!(!bridge.is_ready());
    }

    #[tokio::test]
    async fn test_client_closed_when_target_unreachable() {
        let dead_port = {
            let l = std::net::TcpListener::bind(loopback()).unwrap();
            l.local_addr().unwrap().port()
        };
        let bridge = SocketBridgeService::start(BridgeConfig::new("test_bridge", loopback(), dead_port)).unwrap();
        wait_ready(&bridge).await;

        let url = format!("ws://{}", bridge.local_addr());
        let (mut client, _) = connect_async(url.as_str()).await.unwrap();

        let next = timeout(Duration::from_secs(5), client.next()).await.unwrap();
        assert!(matches!(next, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
        bridge.stop();
    }

    #[test]
    fn test_bind_conflict() {
        let taken = std::net::TcpListener::bind(loopback()).unwrap();
        let err = SocketBridgeService::start(BridgeConfig::new(
            "media_ws",
            taken.local_addr().unwrap(),
            9001,
        ))
        .unwrap_err();
        assert!(matches!(err, TransportError::AddrInUse { service: "media_ws", .. }));
    }
}
