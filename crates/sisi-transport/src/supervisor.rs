//! Transport supervisor: starts, samples and stops every service.
//!
//! Start order:
//!
//! 1. publish `running` with the topology summary and bind the wake handler
//! 2. resolve the media bridge target, start the media TCP listener and
//!    media WebSocket bridge
//! 3. if the control lane is enabled, start its TCP listener and WebSocket
//!    bridge; fail if it is required and the bridge is not ready
//! 4. if the gateway is enabled, start it on its own thread; fail if it
//!    does not stay up
//! 5. publish services, health and degrade, then start the health monitor
//!
//! A listener that cannot bind does not stop the start sequence; its
//! service simply reports not ready in the runtime status.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use sisi_gateway_server::{GatewayConfig, GatewayServer, ShutdownHandle};
use sisi_proto::ControlFields;
use tracing::{error, info, warn};

use crate::bridge::{BridgeConfig, SocketBridgeService};
use crate::coordinator::{ControlCoordinator, SourceLane, WakeHitHandler};
use crate::error::{TransportError, TransportResult};
use crate::listener::{
    join_with_timeout, spawn_worker, ControlLaneListener, DeviceMediaListener, DiscardMediaSink,
    MediaSink, DEFAULT_HEARTBEAT_INTERVAL, JOIN_TIMEOUT,
};
use crate::monitor::HealthMonitor;
use crate::status::{
    DegradeReport, HealthReport, RuntimeStatusStore, ServiceStatus, StatusSnapshot,
    REASON_CONTROL_LANE_REQUIRED_UNAVAILABLE, REASON_GATEWAY_UNAVAILABLE,
};
use crate::topology::{select_bridge_target_port, TransportTopology};

/// Gateway thread name.
pub const GATEWAY_THREAD: &str = "transport_gateway";

/// Supervisor timing and binding options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Address the device-facing listeners and bridges bind on.
    pub bind_ip: IpAddr,
    /// Keep-alive cadence on device media connections.
    pub heartbeat_interval: Duration,
    /// Wait after starting the media services.
    pub media_settle: Duration,
    /// Wait after starting the control lane.
    pub control_settle: Duration,
    /// Wait after starting the gateway.
    pub gateway_settle: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            media_settle: Duration::from_millis(350),
            control_settle: Duration::from_millis(250),
            gateway_settle: Duration::from_millis(200),
        }
    }
}

/// Gateway server running on its own thread.
pub struct GatewayRunner {
    port: u16,
    control_backend: String,
    shutdown: ShutdownHandle,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GatewayRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayRunner")
            .field("port", &self.port)
            .field("alive", &self.is_thread_alive())
            .finish_non_exhaustive()
    }
}

impl GatewayRunner {
    /// Start the gateway on a thread with a single-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid gateway config or a spawn failure.
    /// Bind failures happen on the thread and show up as a dead thread.
    pub fn start(config: GatewayConfig) -> TransportResult<Self> {
        let port = config.port;
        let control_backend = config.control_backend_url.clone();
        let server = GatewayServer::new(config)?;
        let shutdown = server.shutdown_handle();

        let thread = spawn_worker(GATEWAY_THREAD, move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "failed to build gateway runtime");
                    return;
                }
            };
            if let Err(e) = runtime.block_on(server.run_forever()) {
                error!(error = %e, "gateway front door exited");
            }
        })?;

        Ok(Self {
            port,
            control_backend,
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Whether the gateway thread is running.
    #[must_use]
    pub fn is_thread_alive(&self) -> bool {
        self.thread.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the gateway and join its thread. Idempotent.
    pub fn stop(&self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.lock().take() {
            join_with_timeout(GATEWAY_THREAD, thread, JOIN_TIMEOUT);
        }
    }
}

impl Drop for GatewayRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Services started by one `start` call. Absent entries failed to start or
/// are disabled.
#[derive(Debug, Default)]
struct Services {
    media_target_port: u16,
    media_tcp: Option<DeviceMediaListener>,
    media_ws: Option<SocketBridgeService>,
    control_tcp: Option<ControlLaneListener>,
    control_ws: Option<SocketBridgeService>,
    gateway: Option<GatewayRunner>,
}

impl Services {
    fn health(&self, topology: &TransportTopology) -> HealthReport {
        let control = topology.control_lane_enabled;
        HealthReport {
            media_tcp_ready: self.media_tcp.as_ref().is_some_and(DeviceMediaListener::is_ready),
            media_ws_ready: self.media_ws.as_ref().is_some_and(SocketBridgeService::is_ready),
            control_tcp_ready: control
                && self.control_tcp.as_ref().is_some_and(ControlLaneListener::is_ready),
            control_ws_ready: control
                && self.control_ws.as_ref().is_some_and(SocketBridgeService::is_ready),
            gateway_ready: topology.gateway_enabled
                && self.gateway.as_ref().is_some_and(GatewayRunner::is_thread_alive),
        }
    }

    fn table(&self, topology: &TransportTopology) -> BTreeMap<String, ServiceStatus> {
        let health = self.health(topology);
        let entry = |enabled: bool, thread_alive: bool, ready: bool, port: u16| ServiceStatus {
            enabled,
            thread_alive,
            ready,
            port,
            control_backend: None,
        };

        let mut table = BTreeMap::new();
        table.insert(
            "media_tcp".to_string(),
            entry(
                true,
                self.media_tcp.as_ref().is_some_and(DeviceMediaListener::is_thread_alive),
                health.media_tcp_ready,
                topology.device_tcp_port,
            ),
        );
        table.insert(
            "media_ws".to_string(),
            entry(
                true,
                self.media_ws.as_ref().is_some_and(SocketBridgeService::is_thread_alive),
                health.media_ws_ready,
                topology.device_ws_port,
            ),
        );
        table.insert(
            "control_tcp".to_string(),
            entry(
                topology.control_lane_enabled,
                self.control_tcp.as_ref().is_some_and(ControlLaneListener::is_thread_alive),
                health.control_tcp_ready,
                topology.control_tcp_port,
            ),
        );
        table.insert(
            "control_ws".to_string(),
            entry(
                topology.control_lane_enabled,
                self.control_ws.as_ref().is_some_and(SocketBridgeService::is_thread_alive),
                health.control_ws_ready,
                topology.control_ws_port,
            ),
        );
        table.insert(
            "gateway".to_string(),
            ServiceStatus {
                control_backend: Some(topology.resolved_gateway_control_backend()),
                ..entry(
                    topology.gateway_enabled,
                    health.gateway_ready,
                    health.gateway_ready,
                    topology.gateway_port,
                )
            },
        );
        table
    }

    fn stop(&self) {
        if let Some(s) = &self.media_tcp {
            s.stop();
        }
        if let Some(s) = &self.control_tcp {
            s.stop();
        }
        if let Some(s) = &self.media_ws {
            s.stop();
        }
        if let Some(s) = &self.control_ws {
            s.stop();
        }
        if let Some(s) = &self.gateway {
            s.stop();
        }
    }
}

struct Running {
    services: Arc<Services>,
    monitor: HealthMonitor,
}

/// Wake-hit handler used when none is supplied: a wake hit applies when a
/// device media connection is open.
fn device_wake_handler(media: Arc<Mutex<Option<Arc<Services>>>>) -> Arc<dyn WakeHitHandler> {
    Arc::new(move |fields: &ControlFields, lane: SourceLane| -> Result<bool, String> {
        let active = media
            .lock()
            .as_ref()
            .and_then(|s| s.media_tcp.as_ref().map(DeviceMediaListener::has_connections))
            .unwrap_or(false);
        if active {
            info!(
                lane = %lane,
                source = fields.get("source").unwrap_or(""),
                keyword = fields.get("keyword").unwrap_or(""),
                "wake hit applied to active device"
            );
        }
        Ok(active)
    })
}

/// Owns the transport services and their runtime status.
pub struct TransportSupervisor {
    topology: TransportTopology,
    options: SupervisorOptions,
    coordinator: Arc<ControlCoordinator>,
    status: Arc<RuntimeStatusStore>,
    sink: Arc<dyn MediaSink>,
    wake_handler: Option<Arc<dyn WakeHitHandler>>,
    active: Arc<Mutex<Option<Arc<Services>>>>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for TransportSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSupervisor")
            .field("topology", &self.topology)
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl TransportSupervisor {
    /// Create a stopped supervisor.
    #[must_use]
    pub fn new(topology: TransportTopology, coordinator: Arc<ControlCoordinator>) -> Self {
        Self {
            topology,
            options: SupervisorOptions::default(),
            coordinator,
            status: Arc::new(RuntimeStatusStore::new()),
            sink: Arc::new(DiscardMediaSink),
            wake_handler: None,
            active: Arc::new(Mutex::new(None)),
            running: Mutex::new(None),
        }
    }

    /// Override timing and binding options.
    #[must_use]
    pub fn with_options(mut self, options: SupervisorOptions) -> Self {
        self.options = options;
        self
    }

    /// Route device audio to `sink`.
    #[must_use]
    pub fn with_media_sink(mut self, sink: Arc<dyn MediaSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use `handler` for wake hits instead of the active-device check.
    #[must_use]
    pub fn with_wake_hit_handler(mut self, handler: Arc<dyn WakeHitHandler>) -> Self {
        self.wake_handler = Some(handler);
        self
    }

    /// Topology in use.
    #[must_use]
    pub fn topology(&self) -> &TransportTopology {
        &self.topology
    }

    /// Shared control coordinator.
    #[must_use]
    pub fn coordinator(&self) -> Arc<ControlCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Shared status store.
    #[must_use]
    pub fn status(&self) -> Arc<RuntimeStatusStore> {
        Arc::clone(&self.status)
    }

    /// Runtime status with control lane counters.
    #[must_use]
    pub fn runtime_status(&self) -> StatusSnapshot {
        self.status.snapshot_with(&self.coordinator)
    }

    /// Whether `start` succeeded and `stop` has not run.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// TCP port behind the media bridge, once started.
    #[must_use]
    pub fn media_target_port(&self) -> Option<u16> {
        self.running.lock().as_ref().map(|r| r.services.media_target_port)
    }

    fn addr(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.options.bind_ip, port)
    }

    /// Start every enabled service. Calling it while running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ControlLaneRequired`] or
    /// [`TransportError::GatewayUnavailable`] when a mandated service does
    /// not come up, and [`TransportError::InvalidPort`] for unusable media
    /// ports. Everything started so far is stopped again on error.
    pub fn start(&self) -> TransportResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let topology = &self.topology;

        self.status.publish_started(topology);
        let handler = self
            .wake_handler
            .clone()
            .unwrap_or_else(|| device_wake_handler(Arc::clone(&self.active)));
        self.coordinator.set_wake_hit_handler(Some(handler));
        self.coordinator.set_ignore_mixed_lane(topology.control_lane_enabled);

        let media_target_port =
            match select_bridge_target_port(topology.device_tcp_target_port, topology.device_tcp_port) {
                Ok(port) => port,
                Err(e) => {
                    self.abort_start(&Services::default(), "invalid_media_port");
                    return Err(e);
                }
            };
        let mut services = Services {
            media_target_port,
            ..Services::default()
        };

        services.media_tcp = self.start_service("media_tcp", || {
            DeviceMediaListener::start(
                self.addr(topology.device_tcp_port),
                Arc::clone(&self.coordinator),
                Arc::clone(&self.sink),
                self.options.heartbeat_interval,
            )
        });
        services.media_ws = self.start_service("media_ws", || {
            SocketBridgeService::start(BridgeConfig::new(
                "media_ws",
                self.addr(topology.device_ws_port),
                media_target_port,
            ))
        });
        thread::sleep(self.options.media_settle);
        let health = services.health(topology);
        if !health.media_tcp_ready || !health.media_ws_ready {
            warn!(
                media_tcp_ready = health.media_tcp_ready,
                media_ws_ready = health.media_ws_ready,
                "media services not ready"
            );
        }

        if topology.control_lane_enabled {
            services.control_tcp = self.start_service("control_tcp", || {
                ControlLaneListener::start(
                    self.addr(topology.control_tcp_port),
                    Arc::clone(&self.coordinator),
                )
            });
            services.control_ws = self.start_service("control_ws", || {
                SocketBridgeService::start(
                    BridgeConfig::new(
                        "control_ws",
                        self.addr(topology.control_ws_port),
                        topology.control_tcp_port,
                    )
                    .with_text_suffix("\n"),
                )
            });
            thread::sleep(self.options.control_settle);
            let health = services.health(topology);
            if !health.control_tcp_ready || !health.control_ws_ready {
                warn!(
                    control_tcp_ready = health.control_tcp_ready,
                    control_ws_ready = health.control_ws_ready,
                    "control lane not ready"
                );
            }
            if topology.control_lane_required && !health.control_ws_ready {
                error!("control lane required but its bridge is unavailable");
                self.abort_start(&services, REASON_CONTROL_LANE_REQUIRED_UNAVAILABLE);
                return Err(TransportError::ControlLaneRequired);
            }
        }

        if topology.gateway_enabled {
            services.gateway =
                self.start_service(GATEWAY_THREAD, || GatewayRunner::start(topology.gateway_config()));
            thread::sleep(self.options.gateway_settle);
            if !services.gateway.as_ref().is_some_and(GatewayRunner::is_thread_alive) {
                error!(port = topology.gateway_port, "gateway front door unavailable");
                self.abort_start(&services, REASON_GATEWAY_UNAVAILABLE);
                return Err(TransportError::GatewayUnavailable);
            }
        }

        let services = Arc::new(services);
        self.publish_sample(&services);
        *self.active.lock() = Some(Arc::clone(&services));

        let monitor = {
            let services = Arc::clone(&services);
            let status = Arc::clone(&self.status);
            let topology = topology.clone();
            HealthMonitor::start(topology.health_probe_interval(), move || {
                let health = services.health(&topology);
                status.publish_health(health, DegradeReport::derive(&topology, &health));
            })
        };
        let monitor = match monitor {
            Ok(m) => m,
            Err(e) => {
                *self.active.lock() = None;
                self.abort_start(&services, "health_monitor_unavailable");
                return Err(e);
            }
        };

        info!(
            media_tcp_port = topology.device_tcp_port,
            media_ws_port = topology.device_ws_port,
            media_target_port,
            control_lane = topology.control_lane_enabled,
            gateway = topology.gateway_enabled,
            "transport started"
        );
        *running = Some(Running { services, monitor });
        Ok(())
    }

    fn start_service<T>(
        &self,
        name: &'static str,
        start: impl FnOnce() -> TransportResult<T>,
    ) -> Option<T> {
        match start() {
            Ok(service) => Some(service),
            Err(e) => {
                error!(service = name, error = %e, "service failed to start");
                None
            }
        }
    }

    fn publish_sample(&self, services: &Services) {
        let health = services.health(&self.topology);
        self.status.publish_services(services.table(&self.topology));
        self.status
            .publish_health(health, DegradeReport::derive(&self.topology, &health));
    }

    fn abort_start(&self, services: &Services, reason: &str) {
        self.coordinator.set_wake_hit_handler(None);
        services.stop();
        self.status.publish_start_failed(reason);
    }

    /// Stop every service and publish `running=false`. Idempotent.
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        self.coordinator.set_wake_hit_handler(None);
        *self.active.lock() = None;
        running.monitor.stop();
        running.services.stop();
        self.status.publish_stopped();
        info!("transport stopped");
    }
}

impl Drop for TransportSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn local_topology() -> TransportTopology {
        let device_tcp_port = free_port();
        TransportTopology {
            device_tcp_port,
            device_ws_port: free_port(),
            device_tcp_target_port: device_tcp_port,
            control_tcp_port: free_port(),
            control_ws_port: free_port(),
            gateway_host: "127.0.0.1".to_string(),
            gateway_port: free_port(),
            health_probe_interval_ms: 500,
            ..TransportTopology::default()
        }
    }

    fn fast_options() -> SupervisorOptions {
        SupervisorOptions {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            media_settle: Duration::from_millis(50),
            control_settle: Duration::from_millis(100),
            gateway_settle: Duration::from_millis(200),
            ..SupervisorOptions::default()
        }
    }

    // ==================== Lifecycle Tests ====================

    #[test]
    fn test_start_and_stop_publish_status() {
        let supervisor = TransportSupervisor::new(local_topology(), Arc::new(ControlCoordinator::default()))
            .with_options(fast_options());

        supervisor.start().unwrap();
        supervisor.start().unwrap();

        let status = supervisor.status().snapshot();
        assert!(status.running);
        assert_eq!(status.services.len(), 5);
        assert!(status.services["media_tcp"].ready);
        assert!(status.services["control_ws"].ready);
        assert!(status.services["gateway"].thread_alive);
        assert_eq!(status.degrade.reason, "");
        assert!(supervisor.coordinator().has_wake_hit_handler());
        assert!(supervisor.coordinator().ignores_mixed_lane());

        supervisor.stop();
        supervisor.stop();

        let status = supervisor.status().snapshot();
        assert!(!status.running);
        assert!(status.services.is_empty());
        assert_eq!(status.degrade.reason, "stopped");
        assert!(!supervisor.coordinator().has_wake_hit_handler());
    }

    #[test]
    fn test_required_control_lane_unavailable_fails_start() {
        let topology = local_topology();
        let _taken = TcpListener::bind(("127.0.0.1", topology.control_ws_port)).unwrap();
        let supervisor = TransportSupervisor::new(topology, Arc::new(ControlCoordinator::default()))
            .with_options(fast_options());

        let err = supervisor.start().unwrap_err();

        assert!(matches!(err, TransportError::ControlLaneRequired));
        assert!(err.is_startup_fatal());
        let status = supervisor.status().snapshot();
        assert!(!status.running);
        assert_eq!(status.degrade.reason, "control_lane_required_unavailable");
        assert!(!supervisor.is_running());
    }

    #[test]
    fn test_optional_control_lane_degrades() {
        let topology = TransportTopology {
            control_lane_required: false,
            gateway_enabled: false,
            ..local_topology()
        };
        let _taken = TcpListener::bind(("127.0.0.1", topology.control_ws_port)).unwrap();
        let supervisor = TransportSupervisor::new(topology, Arc::new(ControlCoordinator::default()))
            .with_options(fast_options());

        supervisor.start().unwrap();

        let status = supervisor.status().snapshot();
        assert!(status.running);
        assert!(status.degrade.control_lane_degraded);
        assert_eq!(status.degrade.reason, "control_lane_unavailable");
        assert!(!status.services["gateway"].enabled);
        supervisor.stop();
    }

    #[test]
    fn test_gateway_bind_failure_fails_start() {
        let topology = local_topology();
        let _taken = TcpListener::bind(("127.0.0.1", topology.gateway_port)).unwrap();
        let supervisor = TransportSupervisor::new(topology, Arc::new(ControlCoordinator::default()))
            .with_options(fast_options());

        let err = supervisor.start().unwrap_err();

        assert!(matches!(err, TransportError::GatewayUnavailable));
        assert_eq!(
            supervisor.status().snapshot().degrade.reason,
            "gateway_front_door_unavailable"
        );
    }

    #[test]
    fn test_wake_hit_needs_connected_device() {
        let topology = TransportTopology {
            control_lane_enabled: false,
            gateway_enabled: false,
            ..local_topology()
        };
        let media_port = topology.device_tcp_port;
        let supervisor = TransportSupervisor::new(topology, Arc::new(ControlCoordinator::default()))
            .with_options(fast_options());
        supervisor.start().unwrap();
        let coordinator = supervisor.coordinator();

        let idle = coordinator.handle("type=wake_hit", SourceLane::ControlLane);
        assert_eq!(idle.action, "wake_hit_ignored");

        let _device = std::net::TcpStream::connect(("127.0.0.1", media_port)).unwrap();
        let mut applied = false;
        for _ in 0..100 {
            if coordinator.handle("type=wake_hit", SourceLane::ControlLane).action == "wake_hit_applied" {
                applied = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(applied);
        supervisor.stop();
    }

    #[test]
    fn test_runtime_status_includes_control_lane() {
        let supervisor = TransportSupervisor::new(local_topology(), Arc::new(ControlCoordinator::default()));
        supervisor.coordinator().handle("type=heartbeat", SourceLane::ControlLane);

        let json = serde_json::to_value(supervisor.runtime_status()).unwrap();

        assert_eq!(json["running"], false);
        assert_eq!(json["control_lane"]["heartbeat"], 1);
    }
}
