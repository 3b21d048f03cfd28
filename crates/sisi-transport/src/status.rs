//! Process-wide runtime status of the transport plane.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use sisi_proto::now_ms;

use crate::coordinator::{ControlCoordinator, CoordinatorSnapshot};
use crate::topology::TransportTopology;

/// Degrade reason when the control lane bridge is down.
pub const REASON_CONTROL_LANE_UNAVAILABLE: &str = "control_lane_unavailable";
/// Degrade reason when a required control lane failed to start.
pub const REASON_CONTROL_LANE_REQUIRED_UNAVAILABLE: &str = "control_lane_required_unavailable";
/// Degrade reason when the gateway is down.
pub const REASON_GATEWAY_UNAVAILABLE: &str = "gateway_front_door_unavailable";
/// Degrade reason after a stop.
pub const REASON_STOPPED: &str = "stopped";

/// State of one transport service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    /// Configured to run.
    pub enabled: bool,
    /// Worker thread is running.
    pub thread_alive: bool,
    /// Accepting traffic.
    pub ready: bool,
    /// Listening port.
    pub port: u16,
    /// Control backend URL, gateway only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_backend: Option<String>,
}

/// Readiness of each service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Media TCP listener.
    pub media_tcp_ready: bool,
    /// Media WebSocket bridge.
    pub media_ws_ready: bool,
    /// Control lane TCP listener.
    pub control_tcp_ready: bool,
    /// Control lane WebSocket bridge.
    pub control_ws_ready: bool,
    /// Gateway front door.
    pub gateway_ready: bool,
}

/// Derived degradation state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DegradeReport {
    /// Control lane enabled but its bridge is not ready.
    pub control_lane_degraded: bool,
    /// Gateway enabled but not ready.
    pub gateway_degraded: bool,
    /// Highest priority reason, empty when healthy.
    pub reason: String,
}

impl DegradeReport {
    /// Derive from a health report. The control lane takes priority.
    #[must_use]
    pub fn derive(topology: &TransportTopology, health: &HealthReport) -> Self {
        let control_lane_degraded = topology.control_lane_enabled && !health.control_ws_ready;
        let gateway_degraded = topology.gateway_enabled && !health.gateway_ready;
        let reason = if control_lane_degraded {
            REASON_CONTROL_LANE_UNAVAILABLE
        } else if gateway_degraded {
            REASON_GATEWAY_UNAVAILABLE
        } else {
            ""
        };
        Self {
            control_lane_degraded,
            gateway_degraded,
            reason: reason.to_string(),
        }
    }

    /// A report carrying only a reason.
    #[must_use]
    pub fn with_reason(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            ..Self::default()
        }
    }
}

/// Snapshot of the transport plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStatus {
    /// Supervisor is started.
    pub running: bool,
    /// Topology summary.
    pub topology: BTreeMap<String, String>,
    /// Per-service state, keyed by service name.
    pub services: BTreeMap<String, ServiceStatus>,
    /// Last health sample, absent before the first sample.
    pub health: Option<HealthReport>,
    /// Degradation state.
    pub degrade: DegradeReport,
    /// When the status last changed, in epoch milliseconds.
    pub updated_ts_ms: i64,
}

/// Runtime status plus control lane counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Runtime status.
    #[serde(flatten)]
    pub status: RuntimeStatus,
    /// Control coordinator counters and device capabilities.
    pub control_lane: CoordinatorSnapshot,
}

/// Shared, mutex-guarded [`RuntimeStatus`].
#[derive(Debug, Default)]
pub struct RuntimeStatusStore {
    inner: Mutex<RuntimeStatus>,
}

impl RuntimeStatusStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, f: impl FnOnce(&mut RuntimeStatus)) {
        let mut status = self.inner.lock();
        f(&mut status);
        status.updated_ts_ms = now_ms();
    }

    /// Record a start: running, topology summary, nothing sampled yet.
    pub fn publish_started(&self, topology: &TransportTopology) {
        self.update(|s| {
            s.running = true;
            s.topology = topology.summary_fields();
            s.services.clear();
            s.health = None;
            s.degrade = DegradeReport::default();
        });
    }

    /// Replace the service table.
    pub fn publish_services(&self, services: BTreeMap<String, ServiceStatus>) {
        self.update(|s| s.services = services);
    }

    /// Record a health sample and its degrade record together.
    pub fn publish_health(&self, health: HealthReport, degrade: DegradeReport) {
        self.update(|s| {
            s.health = Some(health);
            s.degrade = degrade;
        });
    }

    /// Replace the degrade record.
    pub fn publish_degrade(&self, degrade: DegradeReport) {
        self.update(|s| s.degrade = degrade);
    }

    /// Record a failed start. The reason says which mandated service did
    /// not come up.
    pub fn publish_start_failed(&self, reason: &str) {
        self.update(|s| {
            s.running = false;
            s.services.clear();
            s.health = None;
            s.degrade = DegradeReport::with_reason(reason);
        });
    }

    /// Record a stop.
    pub fn publish_stopped(&self) {
        self.update(|s| {
            s.running = false;
            s.services.clear();
            s.health = None;
            s.degrade = DegradeReport::with_reason(REASON_STOPPED);
        });
    }

    /// Copy of the current status.
    #[must_use]
    pub fn snapshot(&self) -> RuntimeStatus {
        self.inner.lock().clone()
    }

    /// Copy of the current status plus control lane counters.
    #[must_use]
    pub fn snapshot_with(&self, coordinator: &ControlCoordinator) -> StatusSnapshot {
        StatusSnapshot {
            status: self.snapshot(),
            control_lane: coordinator.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_ready() -> HealthReport {
        HealthReport {
            media_tcp_ready: true,
            media_ws_ready: true,
            control_tcp_ready: true,
            control_ws_ready: true,
            gateway_ready: true,
        }
    }

    // ==================== Degrade Tests ====================

    #[test]
    fn test_degrade_healthy() {
        let d = DegradeReport::derive(&TransportTopology::default(), &all_ready());
        assert_eq!(d, DegradeReport::default());
    }

    #[test]
    fn test_degrade_control_lane_has_priority() {
        let health = HealthReport {
            control_ws_ready: false,
            gateway_ready: false,
            ..all_ready()
        };
        let d = DegradeReport::derive(&TransportTopology::default(), &health);
        assert!(d.control_lane_degraded);
        assert!(d.gateway_degraded);
        assert_eq!(d.reason, REASON_CONTROL_LANE_UNAVAILABLE);
    }

    #[test]
    fn test_degrade_gateway_only() {
        let health = HealthReport {
            gateway_ready: false,
            ..all_ready()
        };
        let d = DegradeReport::derive(&TransportTopology::default(), &health);
        assert!(!d.control_lane_degraded);
        assert_eq!(d.reason, REASON_GATEWAY_UNAVAILABLE);
    }

    #[test]
    fn test_degrade_ignores_disabled_services() {
        let topology = TransportTopology {
            control_lane_enabled: false,
            gateway_enabled: false,
            ..TransportTopology::default()
        };
        let d = DegradeReport::derive(&topology, &HealthReport::default());
        assert_eq!(d, DegradeReport::default());
    }

    // ==================== Store Tests ====================

    #[test]
    fn test_store_lifecycle() {
        let store = RuntimeStatusStore::new();
        store.publish_started(&TransportTopology::default());

        let started = store.snapshot();
        assert!(started.running);
        assert_eq!(started.topology["tcp_port"], "9001");
        assert!(started.health.is_none());
        assert!(started.updated_ts_ms > 0);

        store.publish_health(all_ready(), DegradeReport::default());
        assert_eq!(store.snapshot().health, Some(all_ready()));

        store.publish_stopped();
        let stopped = store.snapshot();
        assert!(!stopped.running);
        assert!(stopped.services.is_empty());
        assert_eq!(stopped.degrade.reason, REASON_STOPPED);
    }

    #[test]
    fn test_start_failure_keeps_reason() {
        let store = RuntimeStatusStore::new();
        store.publish_started(&TransportTopology::default());
        store.publish_start_failed(REASON_CONTROL_LANE_REQUIRED_UNAVAILABLE);

        let status = store.snapshot();
        assert!(!status.running);
        assert_eq!(status.degrade.reason, "control_lane_required_unavailable");
    }

    #[test]
    fn test_snapshot_with_control_lane() {
        let store = RuntimeStatusStore::new();
        let coordinator = ControlCoordinator::default();
        coordinator.handle("type=heartbeat", crate::coordinator::SourceLane::ControlLane);

        let json = serde_json::to_value(store.snapshot_with(&coordinator)).unwrap();

        assert_eq!(json["running"], false);
        assert_eq!(json["control_lane"]["heartbeat"], 1);
        assert_eq!(json["control_lane"]["device_aec_available"], false);
    }

    #[test]
    fn test_gateway_service_serializes_backend() {
        let svc = ServiceStatus {
            enabled: true,
            thread_alive: true,
            ready: true,
            port: 9102,
            control_backend: Some("ws://127.0.0.1:9003".to_string()),
        };
        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["control_backend"], "ws://127.0.0.1:9003");

        let media = ServiceStatus {
            control_backend: None,
            ..svc
        };
        assert!(serde_json::to_value(&media).unwrap().get("control_backend").is_none());
    }
}
