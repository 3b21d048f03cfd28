//! Control coordinator: ordering, dispatch and bookkeeping for control frames.
//!
//! Every frame from either lane goes through [`ControlCoordinator::handle`]:
//! parse, ordering check, dispatch by type, capability update, counters.
//! Nothing a device sends can make `handle` return an error or unwind into
//! the socket loop that called it.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sisi_proto::{now_ms, ControlFields, ControlFrame};
use tracing::{debug, info, warn};

use crate::capability::{CapabilityCache, CapabilityFlags};
use crate::metrics::{ControlMetrics, MetricsRecorder, Observation};
use crate::ordering::{OrderingGuard, Verdict, DEFAULT_STALE_TTL_MS};

/// Minimum spacing between two background stop actions.
pub const DEFAULT_INTERRUPT_MIN_INTERVAL: Duration = Duration::from_millis(300);

/// Name of the background stop worker thread.
pub const STOP_WORKER_THREAD: &str = "transport-control-stopall";

/// Where a control frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceLane {
    /// Embedded in the device media stream.
    MixedAudio,
    /// The dedicated control connection.
    ControlLane,
    /// Anything else, e.g. a direct call.
    Unknown,
}

impl SourceLane {
    /// Wire name of the lane.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MixedAudio => "mixed_audio",
            Self::ControlLane => "control_lane",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SourceLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch class of a control type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// `interrupt`, `cancel_turn`, `cancel`.
    Interrupt,
    /// `commit_turn`, `commit`.
    Commit,
    /// `heartbeat`.
    Heartbeat,
    /// `wake_hit`, `wake`, `wake_trigger`.
    WakeHit,
    /// Anything else.
    Unknown,
}

impl ControlKind {
    /// Classify a lower-cased control type.
    #[must_use]
    pub fn of(control_type: &str) -> Self {
        match control_type {
            "interrupt" | "cancel_turn" | "cancel" => Self::Interrupt,
            "commit_turn" | "commit" => Self::Commit,
            "heartbeat" => Self::Heartbeat,
            "wake_hit" | "wake" | "wake_trigger" => Self::WakeHit,
            _ => Self::Unknown,
        }
    }
}

/// Handler for device wake-word hits.
pub trait WakeHitHandler: Send + Sync {
    /// Apply a wake hit. `Ok(true)` means it was acted on, `Ok(false)` that
    /// it was deliberately ignored.
    fn on_wake_hit(&self, fields: &ControlFields, lane: SourceLane) -> Result<bool, String>;
}

impl<F> WakeHitHandler for F
where
    F: Fn(&ControlFields, SourceLane) -> Result<bool, String> + Send + Sync,
{
    fn on_wake_hit(&self, fields: &ControlFields, lane: SourceLane) -> Result<bool, String> {
        self(fields, lane)
    }
}

/// Side effects of an interrupt.
pub trait InterruptHooks: Send + Sync {
    /// Cheap local stop run inline. Must not block. Returns a label when
    /// something was stopped.
    fn flush_local(&self) -> Option<String>;

    /// Heavier stop of playback. Runs on a background worker, never more
    /// than one at a time.
    fn stop_playback(&self) -> Result<(), String>;
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInterruptHooks;

impl InterruptHooks for NoopInterruptHooks {
    fn flush_local(&self) -> Option<String> {
        None
    }

    fn stop_playback(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Result of handling one control payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlOutcome {
    /// Whether the frame was applied.
    pub ok: bool,
    /// What was done, e.g. `commit_turn` or `drop_stale_seq`.
    pub action: String,
    /// Resolved control type.
    pub control_type: String,
    /// Whether the frame was dropped as stale.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dropped: bool,
    /// Failure detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlOutcome {
    fn applied(action: String, control_type: String) -> Self {
        Self {
            ok: true,
            action,
            control_type,
            dropped: false,
            error: None,
        }
    }

    fn failed(action: &str, control_type: String, error: String) -> Self {
        Self {
            ok: false,
            action: action.to_string(),
            control_type,
            dropped: false,
            error: Some(error),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Timestamp staleness TTL.
    pub stale_ttl_ms: i64,
    /// Minimum spacing between background stops.
    pub interrupt_min_interval: Duration,
    /// Ignore control frames embedded in the media stream.
    pub ignore_mixed_lane: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            stale_ttl_ms: DEFAULT_STALE_TTL_MS,
            interrupt_min_interval: DEFAULT_INTERRUPT_MIN_INTERVAL,
            ignore_mixed_lane: false,
        }
    }
}

/// Metrics plus current device capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorSnapshot {
    /// Counters.
    #[serde(flatten)]
    pub metrics: ControlMetrics,
    /// Device reports echo cancellation.
    pub device_aec_available: bool,
    /// Device reports noise suppression.
    pub device_ns_available: bool,
    /// Device reports gain control.
    pub device_agc_available: bool,
}

#[derive(Debug, Default)]
struct StopGate {
    running: bool,
    last_started_ms: i64,
}

/// Clears the running flag when the stop worker ends, even by unwinding.
struct StopGateRelease(Arc<Mutex<StopGate>>);

impl Drop for StopGateRelease {
    fn drop(&mut self) {
        self.0.lock().running = false;
    }
}

/// Applies control frames from every lane.
pub struct ControlCoordinator {
    config: CoordinatorConfig,
    guard: OrderingGuard,
    capabilities: CapabilityCache,
    metrics: MetricsRecorder,
    hooks: Arc<dyn InterruptHooks>,
    stop_gate: Arc<Mutex<StopGate>>,
    wake_handler: Mutex<Option<Arc<dyn WakeHitHandler>>>,
    ignore_mixed_lane: Mutex<bool>,
}

impl fmt::Debug for ControlCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlCoordinator")
            .field("config", &self.config)
            .field("guard", &self.guard)
            .field("capabilities", &self.capabilities)
            .field("wake_handler_bound", &self.wake_handler.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl Default for ControlCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default(), Arc::new(NoopInterruptHooks))
    }
}

impl ControlCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(config: CoordinatorConfig, hooks: Arc<dyn InterruptHooks>) -> Self {
        Self {
            guard: OrderingGuard::new(config.stale_ttl_ms),
            capabilities: CapabilityCache::new(),
            metrics: MetricsRecorder::new(),
            hooks,
            stop_gate: Arc::new(Mutex::new(StopGate::default())),
            wake_handler: Mutex::new(None),
            ignore_mixed_lane: Mutex::new(config.ignore_mixed_lane),
            config,
        }
    }

    /// Bind or clear the wake-hit handler.
    pub fn set_wake_hit_handler(&self, handler: Option<Arc<dyn WakeHitHandler>>) {
        *self.wake_handler.lock() = handler;
    }

    /// Whether a wake-hit handler is bound.
    #[must_use]
    pub fn has_wake_hit_handler(&self) -> bool {
        self.wake_handler.lock().is_some()
    }

    /// Ignore (or stop ignoring) frames from the mixed audio lane. Enabled
    /// while a dedicated control lane is authoritative.
    pub fn set_ignore_mixed_lane(&self, ignore: bool) {
        *self.ignore_mixed_lane.lock() = ignore;
    }

    /// Whether mixed audio lane frames are being ignored.
    #[must_use]
    pub fn ignores_mixed_lane(&self) -> bool {
        *self.ignore_mixed_lane.lock()
    }

    /// Handle one control payload body.
    pub fn handle(&self, payload: &str, lane: SourceLane) -> ControlOutcome {
        let frame = ControlFrame::parse(payload);

        if lane == SourceLane::MixedAudio && self.ignores_mixed_lane() {
            info!(
                control_type = %frame.control_type,
                "ignoring mixed_audio control payload, dedicated control lane is enabled"
            );
            return ControlOutcome {
                ok: false,
                action: "ignored_mixed_lane".to_string(),
                control_type: frame.control_type,
                dropped: false,
                error: None,
            };
        }

        let now = now_ms();
        let latency_ms = frame.latency_ms(now).unwrap_or(-1);
        let verdict = self.guard.check(&frame, lane.as_str(), now);

        info!(
            control_type = %frame.control_type,
            stream = %frame.stream_id,
            priority = frame.priority_or_normal(),
            lane = %lane,
            latency_ms,
            epoch = frame.epoch.unwrap_or(-1),
            seq = frame.sequence.unwrap_or(-1),
            "control received"
        );

        if let Verdict::Drop(reason) = verdict {
            let action = reason.action();
            self.metrics.record(Observation {
                control_type: &frame.control_type,
                source_lane: lane.as_str(),
                latency_ms,
                action,
                now_ms: now,
            });
            info!(
                control_type = %frame.control_type,
                lane = %lane,
                stream = %frame.stream_id,
                action,
                epoch = frame.epoch.unwrap_or(-1),
                seq = frame.sequence.unwrap_or(-1),
                "control dropped"
            );
            return ControlOutcome {
                ok: false,
                action: action.to_string(),
                control_type: frame.control_type,
                dropped: true,
                error: None,
            };
        }

        let dispatched =
            panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(&frame, lane, latency_ms, now)));
        match dispatched {
            Ok(outcome) => outcome,
            Err(cause) => {
                let error = panic_message(cause.as_ref());
                self.metrics.record_error(now_ms());
                warn!(control_type = %frame.control_type, error = %error, "control apply failed");
                ControlOutcome::failed("error", frame.control_type, error)
            }
        }
    }

    fn dispatch(
        &self,
        frame: &ControlFrame,
        lane: SourceLane,
        latency_ms: i64,
        now: i64,
    ) -> ControlOutcome {
        let capabilities_changed = self.capabilities.apply(frame).is_some();
        let record = |action: &str| {
            self.metrics.record(Observation {
                control_type: &frame.control_type,
                source_lane: lane.as_str(),
                latency_ms,
                action,
                now_ms: now,
            });
        };

        let mut action = match ControlKind::of(&frame.control_type) {
            ControlKind::Interrupt => {
                let fast_path = self.hooks.flush_local();
                let async_action = self.dispatch_stop();
                match fast_path {
                    Some(applied) => format!("{async_action}+{applied}"),
                    None => async_action.to_string(),
                }
            }
            ControlKind::Commit | ControlKind::Heartbeat => frame.control_type.clone(),
            ControlKind::WakeHit => match self.dispatch_wake_hit(&frame.raw_fields, lane) {
                Ok(action) => action.to_string(),
                Err(action) => {
                    record(action);
                    return ControlOutcome::failed(
                        action,
                        frame.control_type.clone(),
                        action.to_string(),
                    );
                }
            },
            ControlKind::Unknown => "unknown_type".to_string(),
        };

        if capabilities_changed {
            action.push_str("+capture_fx");
        }
        record(action.as_str());
        info!(control_type = %frame.control_type, lane = %lane, action = %action, "control applied");
        ControlOutcome::applied(action, frame.control_type.clone())
    }

    /// Start the background stop unless one is running or one started
    /// within the minimum interval.
    fn dispatch_stop(&self) -> &'static str {
        let now = now_ms();
        let min_interval_ms =
            i64::try_from(self.config.interrupt_min_interval.as_millis()).unwrap_or(i64::MAX);
        {
            let mut gate = self.stop_gate.lock();
            if gate.running {
                return "coalesced_running";
            }
            if now.saturating_sub(gate.last_started_ms) < min_interval_ms {
                return "coalesced_recent";
            }
            gate.running = true;
            gate.last_started_ms = now;
        }

        let hooks = Arc::clone(&self.hooks);
        let release = StopGateRelease(Arc::clone(&self.stop_gate));
        let spawned = thread::Builder::new()
            .name(STOP_WORKER_THREAD.to_string())
            .spawn(move || {
                let _release = release;
                if let Err(e) = hooks.stop_playback() {
                    warn!(error = %e, "interrupt stop failed");
                }
            });

        match spawned {
            Ok(_) => "stop_playback_async",
            Err(e) => {
                // The closure (and its release guard) was dropped with the error.
                warn!(error = %e, "failed to spawn stop worker");
                "stop_playback_spawn_failed"
            }
        }
    }

    fn dispatch_wake_hit(
        &self,
        fields: &ControlFields,
        lane: SourceLane,
    ) -> Result<&'static str, &'static str> {
        let handler = self.wake_handler.lock().clone();
        let Some(handler) = handler else {
            return Err("wake_hit_unbound");
        };
        match handler.on_wake_hit(fields, lane) {
            Ok(true) => Ok("wake_hit_applied"),
            Ok(false) => Ok("wake_hit_ignored"),
            Err(e) => {
                warn!(lane = %lane, error = %e, "wake hit handler failed");
                Err("wake_hit_error")
            }
        }
    }

    /// Whether a background stop is in flight.
    #[must_use]
    pub fn stop_in_flight(&self) -> bool {
        self.stop_gate.lock().running
    }

    /// Device capabilities last reported.
    #[must_use]
    pub fn capabilities(&self) -> CapabilityFlags {
        self.capabilities.flags()
    }

    /// Copy of the counters and device capabilities.
    #[must_use]
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let flags = self.capabilities.flags();
        CoordinatorSnapshot {
            metrics: self.metrics.snapshot(),
            device_aec_available: flags.aec_available,
            device_ns_available: flags.ns_available,
            device_agc_available: flags.agc_available,
        }
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        debug!("control dispatch panicked with a non-string payload");
        "dispatch panicked".to_string()
    }
}
