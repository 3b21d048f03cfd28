//! # sisi-proto
//!
//! Wire formats shared by the Sisi device transport plane:
//!
//! - **Control frames**: `key=value;…` bodies, embedded in the media stream as
//!   `<control>…</control>` or sent one per line on the dedicated control lane
//! - **Gateway messages**: the JSON envelopes (`control_ack`,
//!   `gateway_session`, `gateway_error`, `health`) sent to gateway clients
//!
//! Nothing in this crate performs I/O.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod control;
pub mod error;
pub mod messages;

pub use control::{
    extract_control_type, is_control_payload, parse_bool, parse_int, strip_control_markers,
    wrap_control_frame, ControlFields, ControlFrame, CAPABILITY_KEYS, CAPTURE_FX_SOURCE,
    CONTROL_END, CONTROL_START,
};
pub use error::{ProtoError, ProtoResult};
pub use messages::{build_control_ack, GatewayMessage};

/// Current wall-clock time in epoch milliseconds, the unit of every `ts`,
/// `ts_ms` and `*_ms` field on the wire.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
