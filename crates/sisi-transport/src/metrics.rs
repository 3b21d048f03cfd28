//! Control lane counters.

use parking_lot::Mutex;
use serde::Serialize;

use crate::coordinator::ControlKind;

/// Counters and last-seen values for processed control frames.
///
/// Counters only grow; they are cleared by restarting the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMetrics {
    /// Frames counted, dropped or not.
    pub received: u64,
    /// Interrupt-class frames.
    pub interrupt: u64,
    /// Commit-class frames.
    pub commit: u64,
    /// Heartbeats.
    pub heartbeat: u64,
    /// Wake-hit-class frames.
    pub wake_hit: u64,
    /// Frames of any other type.
    pub unknown: u64,
    /// Frames dropped as stale.
    pub dropped: u64,
    /// Drops for an old timestamp.
    pub drop_stale_ts: u64,
    /// Drops for an old epoch.
    pub drop_stale_epoch: u64,
    /// Drops for an old sequence.
    pub drop_stale_seq: u64,
    /// Dispatch failures.
    pub errors: u64,
    /// Type of the last counted frame.
    pub last_control_type: String,
    /// Latency of the last counted frame, -1 when unknown.
    pub last_latency_ms: i64,
    /// Lane of the last counted frame.
    pub last_source_lane: String,
    /// Action of the last counted frame.
    pub last_action: String,
    /// When the counters last changed, in epoch milliseconds.
    pub last_ts_ms: i64,
}

impl Default for ControlMetrics {
    fn default() -> Self {
        Self {
            received: 0,
            interrupt: 0,
            commit: 0,
            heartbeat: 0,
            wake_hit: 0,
            unknown: 0,
            dropped: 0,
            drop_stale_ts: 0,
            drop_stale_epoch: 0,
            drop_stale_seq: 0,
            errors: 0,
            last_control_type: String::new(),
            last_latency_ms: -1,
            last_source_lane: String::new(),
            last_action: String::new(),
            last_ts_ms: 0,
        }
    }
}

/// One counted frame.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// Resolved control type.
    pub control_type: &'a str,
    /// Lane name.
    pub source_lane: &'a str,
    /// Latency, -1 when unknown.
    pub latency_ms: i64,
    /// Action taken.
    pub action: &'a str,
    /// Observation time.
    pub now_ms: i64,
}

/// Mutex-guarded [`ControlMetrics`].
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    inner: Mutex<ControlMetrics>,
}

impl MetricsRecorder {
    /// Create zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a processed frame.
    pub fn record(&self, obs: Observation<'_>) {
        let mut m = self.inner.lock();
        m.received += 1;
        match obs.action {
            "drop_stale_ts" => {
                m.dropped += 1;
                m.drop_stale_ts += 1;
            }
            "drop_stale_epoch" => {
                m.dropped += 1;
                m.drop_stale_epoch += 1;
            }
            "drop_stale_seq" => {
                m.dropped += 1;
                m.drop_stale_seq += 1;
            }
            _ => {}
        }
        match ControlKind::of(obs.control_type) {
            ControlKind::Interrupt => m.interrupt += 1,
            ControlKind::Commit => m.commit += 1,
            ControlKind::Heartbeat => m.heartbeat += 1,
            ControlKind::WakeHit => m.wake_hit += 1,
            ControlKind::Unknown => m.unknown += 1,
        }
        m.last_control_type = obs.control_type.to_string();
        m.last_latency_ms = obs.latency_ms;
        m.last_source_lane = obs.source_lane.to_string();
        m.last_action = obs.action.to_string();
        m.last_ts_ms = obs.now_ms;
    }

    /// Count a dispatch failure. Only `errors` and `last_ts_ms` change.
    pub fn record_error(&self, now_ms: i64) {
        let mut m = self.inner.lock();
        m.errors += 1;
        m.last_ts_ms = now_ms;
    }

    /// Copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> ControlMetrics {
        self.inner.lock().clone()
    }
}
