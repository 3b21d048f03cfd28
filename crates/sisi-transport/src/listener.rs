//! Raw TCP listeners for devices.
//!
//! - [`DeviceMediaListener`] accepts device media connections. Control frames
//!   embedded in the stream go to the coordinator on the `mixed_audio` lane,
//!   metadata tags update the connection, and everything else reaches the
//!   [`MediaSink`]. A keep-alive thread writes [`HEARTBEAT`] to every
//!   connection and evicts the ones that fail.
//! - [`ControlLaneListener`] accepts dedicated control connections and acks
//!   each frame with one `control_ack` JSON line.
//!
//! Both run a blocking accept loop on its own thread plus one reader thread
//! per connection. `stop` sets a flag, wakes the accept loop with a loopback
//! connect and shuts down every open connection so blocked reads return.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sisi_proto::{build_control_ack, now_ms, ControlFields};
use tracing::{debug, error, info, warn};

use crate::coordinator::{ControlCoordinator, SourceLane};
use crate::error::{TransportError, TransportResult};
use crate::framing::{classify_media_chunk, ControlLaneExtractor, EmbeddedFrameExtractor, MediaChunk, Segment};

/// Read size for device connections.
pub const READ_CHUNK_BYTES: usize = 2048;

/// Out-of-band keep-alive written to device media connections.
pub const HEARTBEAT: [u8; 9] = [0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8];

/// Default keep-alive cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on waiting for a worker thread during stop.
pub const JOIN_TIMEOUT: Duration = Duration::from_millis(1500);

const POLL_SLICE: Duration = Duration::from_millis(50);

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives device audio bytes.
pub trait MediaSink: Send + Sync {
    /// Called for every audio chunk in stream order.
    fn on_audio(&self, connection: &DeviceConnectionInfo, data: &[u8]);
}

/// Sink that discards audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardMediaSink;

impl MediaSink for DiscardMediaSink {
    fn on_audio(&self, _connection: &DeviceConnectionInfo, _data: &[u8]) {}
}

/// Metadata of one device media connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceConnectionInfo {
    /// Listener-local connection id.
    pub id: u64,
    /// Remote address.
    pub peer: SocketAddr,
    /// Name reported by `<username>` tags.
    pub username: String,
    /// Whether the device plays output, from `<output>` tags.
    pub is_output: bool,
}

struct Connection {
    stream: TcpStream,
    info: DeviceConnectionInfo,
}

/// State shared by an accept loop, its readers and `stop`.
#[derive(Default)]
struct ListenerState {
    stop: AtomicBool,
    alive: AtomicBool,
    socket_open: AtomicBool,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Connection>>,
}

impl ListenerState {
    fn register(&self, stream: &TcpStream, peer: SocketAddr) -> Option<DeviceConnectionInfo> {
        let handle = match stream.try_clone() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to clone connection handle");
                return None;
            }
        };
        if let Err(e) = handle.set_write_timeout(Some(WRITE_TIMEOUT)) {
            debug!(peer = %peer, error = %e, "failed to set write timeout");
        }
        let info = DeviceConnectionInfo {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
            username: "User".to_string(),
            is_output: true,
        };
        self.connections.lock().insert(
            info.id,
            Connection {
                stream: handle,
                info: info.clone(),
            },
        );
        Some(info)
    }

    fn unregister(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    fn update_info(&self, id: u64, f: impl FnOnce(&mut DeviceConnectionInfo)) {
        if let Some(conn) = self.connections.lock().get_mut(&id) {
            f(&mut conn.info);
        }
    }

    fn close_all(&self) {
        for (_, conn) in self.connections.lock().drain() {
            let _ = conn.stream.shutdown(Shutdown::Both);
        }
    }
}

/// Clears the alive flag when a worker thread ends.
struct AliveGuard(Arc<ListenerState>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.alive.store(false, Ordering::SeqCst);
        self.0.socket_open.store(false, Ordering::SeqCst);
    }
}

/// Spawn a named worker thread.
pub(crate) fn spawn_worker<F>(name: &'static str, f: F) -> TransportResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| TransportError::Spawn { name, source })
}

/// Join a thread, giving up after `timeout`. Returns whether it finished.
pub(crate) fn join_with_timeout(name: &str, handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(thread = name, "worker did not stop in time, detaching");
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        warn!(thread = name, "worker panicked");
    }
    true
}

fn bind(service: &'static str, addr: SocketAddr) -> TransportResult<TcpListener> {
    TcpListener::bind(addr).map_err(|e| {
        let err = TransportError::bind(service, addr.port(), e);
        error!(service, port = addr.port(), error = %err, "listener bind failed");
        err
    })
}

/// A running accept loop.
struct Acceptor {
    service: &'static str,
    local_addr: SocketAddr,
    state: Arc<ListenerState>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    fn start<H>(
        service: &'static str,
        addr: SocketAddr,
        state: Arc<ListenerState>,
        on_connection: H,
    ) -> TransportResult<Self>
    where
        H: Fn(TcpStream, DeviceConnectionInfo) + Send + Sync + 'static,
    {
        let listener = bind(service, addr)?;
        let local_addr = listener.local_addr()?;
        state.socket_open.store(true, Ordering::SeqCst);
        state.alive.store(true, Ordering::SeqCst);

        let loop_state = Arc::clone(&state);
        let on_connection = Arc::new(on_connection);
        let thread = spawn_worker(service, move || {
            let _alive = AliveGuard(Arc::clone(&loop_state));
            info!(service, addr = %local_addr, "listener started");
            accept_loop(service, &listener, &loop_state, &on_connection);
            info!(service, "listener stopped");
        });
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                state.alive.store(false, Ordering::SeqCst);
                state.socket_open.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        Ok(Self {
            service,
            local_addr,
            state,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn is_thread_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.is_thread_alive() && self.state.socket_open.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        self.state.stop.store(true, Ordering::SeqCst);
        self.state.socket_open.store(false, Ordering::SeqCst);

        let wake_addr = if self.local_addr.ip().is_unspecified() {
            SocketAddr::from((Ipv4Addr::LOCALHOST, self.local_addr.port()))
        } else {
            self.local_addr
        };
        let _ = TcpStream::connect_timeout(&wake_addr, Duration::from_millis(250));

        self.state.close_all();
        join_with_timeout(self.service, thread, JOIN_TIMEOUT);
    }
}

fn accept_loop<H>(service: &'static str, listener: &TcpListener, state: &Arc<ListenerState>, on_connection: &Arc<H>)
where
    H: Fn(TcpStream, DeviceConnectionInfo) + Send + Sync + 'static,
{
    loop {
        let accepted = listener.accept();
        if state.stop.load(Ordering::SeqCst) {
            break;
        }
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(service, error = %e, "accept failed");
                thread::sleep(POLL_SLICE);
                continue;
            }
        };
        let Some(info) = state.register(&stream, peer) else {
            continue;
        };
        info!(service, peer = %peer, id = info.id, "device connected");

        let reader_state = Arc::clone(state);
        let handler = Arc::clone(on_connection);
        let id = info.id;
        let spawned = thread::Builder::new()
            .name(format!("{service}-conn-{id}"))
            .spawn(move || {
                handler(stream, info);
                reader_state.unregister(id);
                info!(service, peer = %peer, id, "device disconnected");
            });
        if let Err(e) = spawned {
            warn!(service, error = %e, "failed to spawn connection reader");
            state.unregister(id);
        }
    }
}

/// Read chunks until EOF, error or stop.
fn read_chunks(
    mut stream: TcpStream,
    state: &ListenerState,
    mut on_chunk: impl FnMut(&mut TcpStream, &[u8]),
) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    while !state.stop.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => on_chunk(&mut stream, &buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(error = %e, "connection read ended");
                break;
            }
        }
    }
}

/// Device media listener.
pub struct DeviceMediaListener {
    acceptor: Acceptor,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for DeviceMediaListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMediaListener")
            .field("local_addr", &self.acceptor.local_addr)
            .field("ready", &self.acceptor.is_ready())
            .finish_non_exhaustive()
    }
}

impl DeviceMediaListener {
    /// Bind `addr` and start accepting device media connections.
    ///
    /// # Errors
    ///
    /// Returns a bind error (address in use is reported distinctly) or a
    /// thread spawn error.
    pub fn start(
        addr: SocketAddr,
        coordinator: Arc<ControlCoordinator>,
        sink: Arc<dyn MediaSink>,
        heartbeat_interval: Duration,
    ) -> TransportResult<Self> {
        let state = Arc::new(ListenerState::default());
        let reader_state = Arc::clone(&state);
        let acceptor = Acceptor::start("media_tcp", addr, Arc::clone(&state), move |stream, info| {
            serve_media_connection(stream, info, &reader_state, &coordinator, sink.as_ref());
        })?;

        let hb_state = Arc::clone(&state);
        let heartbeat = spawn_worker("transport_media_heartbeat", move || {
            heartbeat_loop(&hb_state, heartbeat_interval);
        });
        let heartbeat = match heartbeat {
            Ok(h) => h,
            Err(e) => {
                acceptor.stop();
                return Err(e);
            }
        };

        Ok(Self {
            acceptor,
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr
    }

    /// Whether the accept thread is running.
    #[must_use]
    pub fn is_thread_alive(&self) -> bool {
        self.acceptor.is_thread_alive()
    }

    /// Whether the accept thread is running and the socket is open.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.acceptor.is_ready()
    }

    /// Currently connected devices, ordered by id.
    #[must_use]
    pub fn connections(&self) -> Vec<DeviceConnectionInfo> {
        let mut infos: Vec<_> = self
            .acceptor
            .state
            .connections
            .lock()
            .values()
            .map(|c| c.info.clone())
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Whether any device is connected.
    #[must_use]
    pub fn has_connections(&self) -> bool {
        !self.acceptor.state.connections.lock().is_empty()
    }

    /// Stop accepting, close connections and join workers. Idempotent.
    pub fn stop(&self) {
        self.acceptor.stop();
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            join_with_timeout("transport_media_heartbeat", heartbeat, JOIN_TIMEOUT);
        }
    }
}

impl Drop for DeviceMediaListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_media_connection(
    stream: TcpStream,
    info: DeviceConnectionInfo,
    state: &ListenerState,
    coordinator: &ControlCoordinator,
    sink: &dyn MediaSink,
) {
    let id = info.id;
    let mut current = info;
    let mut extractor = EmbeddedFrameExtractor::new();
    read_chunks(stream, state, |_, chunk| {
        for segment in extractor.feed(chunk) {
            match segment {
                Segment::Control(body) => {
                    coordinator.handle(&body, SourceLane::MixedAudio);
                }
                Segment::Media(bytes) => match classify_media_chunk(bytes) {
                    MediaChunk::Username(name) => {
                        info!(id, username = %name, "device username");
                        current.username.clone_from(&name);
                        state.update_info(id, |i| i.username = name);
                    }
                    MediaChunk::Output(is_output) => {
                        info!(id, is_output, "device output mode");
                        current.is_output = is_output;
                        state.update_info(id, |i| i.is_output = is_output);
                    }
                    MediaChunk::Audio(data) => sink.on_audio(&current, &data),
                },
            }
        }
    });
}

fn heartbeat_loop(state: &ListenerState, interval: Duration) {
    let mut next = Instant::now() + interval;
    while !state.stop.load(Ordering::SeqCst) {
        if Instant::now() < next {
            thread::sleep(POLL_SLICE.min(interval));
            continue;
        }
        next = Instant::now() + interval;
        send_heartbeats(state);
    }
}

/// Write one heartbeat to every device and evict the ones that fail.
///
/// Writes happen on cloned handles outside the connection lock, so a slow
/// device never stalls registration or removal. Returns the evicted ids.
fn send_heartbeats(state: &ListenerState) -> Vec<u64> {
    let targets: Vec<(u64, SocketAddr, std::io::Result<TcpStream>)> = state
        .connections
        .lock()
        .iter()
        .map(|(id, conn)| (*id, conn.info.peer, conn.stream.try_clone()))
        .collect();

    let failed: Vec<u64> = targets
        .into_iter()
        .filter_map(|(id, peer, stream)| {
            let result = stream.and_then(|mut s| s.write_all(&HEARTBEAT));
            result.err().map(|e| {
                warn!(id, peer = %peer, error = %e, "heartbeat failed, evicting device");
                id
            })
        })
        .collect();

    if !failed.is_empty() {
        let mut connections = state.connections.lock();
        for id in &failed {
            if let Some(conn) = connections.remove(id) {
                let _ = conn.stream.shutdown(Shutdown::Both);
            }
        }
    }
    failed
}

/// Dedicated control lane listener.
pub struct ControlLaneListener {
    acceptor: Acceptor,
}

impl std::fmt::Debug for ControlLaneListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlLaneListener")
            .field("local_addr", &self.acceptor.local_addr)
            .field("ready", &self.acceptor.is_ready())
            .finish_non_exhaustive()
    }
}

impl ControlLaneListener {
    /// Bind `addr` and start accepting control connections.
    ///
    /// # Errors
    ///
    /// Returns a bind error (address in use is reported distinctly) or a
    /// thread spawn error.
    pub fn start(addr: SocketAddr, coordinator: Arc<ControlCoordinator>) -> TransportResult<Self> {
        let state = Arc::new(ListenerState::default());
        let reader_state = Arc::clone(&state);
        let acceptor = Acceptor::start("control_tcp", addr, state, move |stream, _info| {
            serve_control_connection(stream, &reader_state, &coordinator);
        })?;
        Ok(Self { acceptor })
    }

    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr
    }

    /// Whether the accept thread is running.
    #[must_use]
    pub fn is_thread_alive(&self) -> bool {
        self.acceptor.is_thread_alive()
    }

    /// Whether the accept thread is running and the socket is open.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.acceptor.is_ready()
    }

    /// Number of open control connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.acceptor.state.connections.lock().len()
    }

    /// Stop accepting, close connections and join the accept thread.
    /// Idempotent.
    pub fn stop(&self) {
        self.acceptor.stop();
    }
}

impl Drop for ControlLaneListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_control_connection(stream: TcpStream, state: &ListenerState, coordinator: &ControlCoordinator) {
    let mut extractor = ControlLaneExtractor::new();
    read_chunks(stream, state, |stream, chunk| {
        for payload in extractor.feed(chunk) {
            let outcome = coordinator.handle(&payload, SourceLane::ControlLane);
            let fields = ControlFields::parse(&payload);
            let reason = (!outcome.ok).then_some(outcome.action.as_str());
            let ack = build_control_ack(
                outcome.ok,
                fields.get("session_id").unwrap_or_default(),
                fields.get("device_id").unwrap_or_default(),
                &outcome.control_type,
                reason,
                Some(now_ms()),
            );
            match ack {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(e) = stream.write_all(line.as_bytes()) {
                        debug!(error = %e, "control ack write failed");
                    }
                }
                Err(e) => warn!(error = %e, "control ack encode failed"),
            }
        }
    });
}
