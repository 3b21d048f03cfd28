//! Device capture-effects capability cache.

use parking_lot::Mutex;
use serde::Serialize;
use sisi_proto::{parse_bool, ControlFrame};
use tracing::info;

/// Signal-processing capabilities a device reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityFlags {
    /// Acoustic echo cancellation is available on the device.
    pub aec_available: bool,
    /// Noise suppression is available on the device.
    pub ns_available: bool,
    /// Automatic gain control is available on the device.
    pub agc_available: bool,
}

impl CapabilityFlags {
    /// Change-detection signature, e.g. `aec=1|ns=0|agc=1`.
    #[must_use]
    pub fn signature(&self) -> String {
        format!(
            "aec={}|ns={}|agc={}",
            u8::from(self.aec_available),
            u8::from(self.ns_available),
            u8::from(self.agc_available)
        )
    }
}

#[derive(Debug, Default)]
struct CacheState {
    flags: CapabilityFlags,
    signature: String,
}

/// Last known device capabilities.
#[derive(Debug, Default)]
pub struct CapabilityCache {
    state: Mutex<CacheState>,
}

impl CapabilityCache {
    /// Create an empty cache. No signature is recorded until the first report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a frame's capability fields.
    ///
    /// Only keys present in the frame update their flag. Returns the new
    /// flags when the signature changed, and logs once per change.
    pub fn apply(&self, frame: &ControlFrame) -> Option<CapabilityFlags> {
        if !frame.is_capability_report() {
            return None;
        }
        let fields = &frame.raw_fields;

        let mut state = self.state.lock();
        if let Some(v) = fields.get("aec_available") {
            state.flags.aec_available = parse_bool(v);
        }
        if let Some(v) = fields.get("ns_available") {
            state.flags.ns_available = parse_bool(v);
        }
        if let Some(v) = fields.get("agc_available") {
            state.flags.agc_available = parse_bool(v);
        }

        let signature = state.flags.signature();
        if signature == state.signature {
            return None;
        }
        state.signature = signature;
        let flags = state.flags;
        drop(state);

        info!(
            aec_available = flags.aec_available,
            ns_available = flags.ns_available,
            agc_available = flags.agc_available,
            aec_arch = "device_primary",
            "capture fx capabilities changed"
        );
        Some(flags)
    }

    /// Current flags.
    #[must_use]
    pub fn flags(&self) -> CapabilityFlags {
        self.state.lock().flags
    }

    /// Signature of the last applied report, empty before any report.
    #[must_use]
    pub fn signature(&self) -> String {
        self.state.lock().signature.clone()
    }
}
