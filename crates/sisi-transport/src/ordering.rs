//! Staleness and ordering checks for control frames.
//!
//! Three independent checks run for every frame:
//!
//! 1. **Timestamp**: a `ts` older than the TTL is stale. Nothing else is
//!    consulted and no cursor moves.
//! 2. **Epoch**: each lane keeps an epoch high-water mark. A lower epoch is
//!    stale, a higher one advances the mark.
//! 3. **Sequence**: each `(lane, stream, epoch)` keeps the last accepted
//!    sequence. A sequence that is not strictly greater is stale.
//!
//! Frames with neither epoch nor sequence are always accepted.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use sisi_proto::ControlFrame;

/// Default staleness TTL for frame timestamps.
pub const DEFAULT_STALE_TTL_MS: i64 = 15_000;

/// Why a frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Timestamp older than the TTL.
    StaleTs,
    /// Epoch lower than the lane's high-water mark.
    StaleEpoch,
    /// Sequence not greater than the last accepted one.
    StaleSeq,
}

impl DropReason {
    /// Short reason, e.g. `stale_seq`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StaleTs => "stale_ts",
            Self::StaleEpoch => "stale_epoch",
            Self::StaleSeq => "stale_seq",
        }
    }

    /// Action reported for the drop, e.g. `drop_stale_seq`.
    #[must_use]
    pub const fn action(self) -> &'static str {
        match self {
            Self::StaleTs => "drop_stale_ts",
            Self::StaleEpoch => "drop_stale_epoch",
            Self::StaleSeq => "drop_stale_seq",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an ordering check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The frame is fresh; any cursors it carries were recorded.
    Accept,
    /// The frame is stale and must have no side effects.
    Drop(DropReason),
}

impl Verdict {
    /// Whether the frame was accepted.
    #[must_use]
    pub const fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }
}

#[derive(Debug, Default)]
struct Cursors {
    /// Highest epoch seen per lane.
    lane_epochs: HashMap<String, i64>,
    /// Last accepted sequence per `(lane, stream, epoch)`.
    sequences: HashMap<(String, String, i64), i64>,
}

/// Per-lane epoch and per-stream sequence tracking.
#[derive(Debug)]
pub struct OrderingGuard {
    stale_ttl_ms: i64,
    cursors: Mutex<Cursors>,
}

impl Default for OrderingGuard {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_TTL_MS)
    }
}

impl OrderingGuard {
    /// Create a guard with the given timestamp TTL.
    #[must_use]
    pub fn new(stale_ttl_ms: i64) -> Self {
        Self {
            stale_ttl_ms,
            cursors: Mutex::new(Cursors::default()),
        }
    }

    /// Timestamp TTL in milliseconds.
    #[must_use]
    pub const fn stale_ttl_ms(&self) -> i64 {
        self.stale_ttl_ms
    }

    /// Check a frame received on `lane` at `now_ms`, recording its cursors if
    /// it is fresh.
    pub fn check(&self, frame: &ControlFrame, lane: &str, now_ms: i64) -> Verdict {
        if let Some(ts) = frame.timestamp_ms {
            // Timestamps from the future are never stale.
            if ts > 0 && now_ms >= ts && now_ms - ts > self.stale_ttl_ms {
                return Verdict::Drop(DropReason::StaleTs);
            }
        }

        if frame.epoch.is_none() && frame.sequence.is_none() {
            return Verdict::Accept;
        }

        let mut cursors = self.cursors.lock();

        if let Some(epoch) = frame.epoch {
            let previous = cursors.lane_epochs.get(lane).copied().unwrap_or(-1);
            if previous > epoch {
                return Verdict::Drop(DropReason::StaleEpoch);
            }
            if epoch > previous {
                cursors.lane_epochs.insert(lane.to_string(), epoch);
            }
        }

        if let Some(sequence) = frame.sequence {
            let scope_epoch = frame
                .epoch
                .or_else(|| cursors.lane_epochs.get(lane).copied())
                .unwrap_or(-1);
            let key = (lane.to_string(), frame.stream_id.clone(), scope_epoch);
            if cursors.sequences.get(&key).is_some_and(|last| sequence <= *last) {
                return Verdict::Drop(DropReason::StaleSeq);
            }
            cursors.sequences.insert(key, sequence);
        }

        Verdict::Accept
    }

    /// Current epoch high-water mark of a lane.
    #[must_use]
    pub fn lane_epoch(&self, lane: &str) -> Option<i64> {
        self.cursors.lock().lane_epochs.get(lane).copied()
    }

    /// Last accepted sequence for a `(lane, stream, epoch)` scope.
    #[must_use]
    pub fn last_sequence(&self, lane: &str, stream: &str, epoch: i64) -> Option<i64> {
        self.cursors
            .lock()
            .sequences
            .get(&(lane.to_string(), stream.to_string(), epoch))
            .copied()
    }
}
