//! JSON messages the gateway and control lane send to their clients.

use serde::{Deserialize, Serialize};

use crate::error::ProtoResult;

/// Messages sent from the transport plane to a device or gateway client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Acknowledgement of a control payload.
    ControlAck {
        /// Whether the control payload was accepted.
        ok: bool,
        /// Session the payload belongs to.
        session_id: String,
        /// Device the payload came from.
        device_id: String,
        /// Resolved control type.
        control_type: String,
        /// Rejection or failure reason.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Acknowledgement time in epoch milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ts_ms: Option<i64>,
    },
    /// Session opened on the `/device` route.
    GatewaySession {
        /// Session ID.
        session_id: String,
        /// Device ID.
        device_id: String,
        /// Open time in epoch milliseconds.
        ts_ms: i64,
    },
    /// Connection-level rejection.
    GatewayError {
        /// Machine-readable reason.
        reason: String,
    },
    /// Health probe response.
    Health {
        /// Always true when the gateway answers.
        ok: bool,
    },
}

impl GatewayMessage {
    /// Create a control acknowledgement.
    ///
    /// An empty `control_type` is reported as `"unknown"` and an empty
    /// `reason` is omitted from the wire form.
    #[must_use]
    pub fn control_ack(
        ok: bool,
        session_id: impl Into<String>,
        device_id: impl Into<String>,
        control_type: &str,
        reason: Option<&str>,
        ts_ms: Option<i64>,
    ) -> Self {
        let control_type = if control_type.is_empty() {
            "unknown".to_string()
        } else {
            control_type.to_string()
        };
        Self::ControlAck {
            ok,
            session_id: session_id.into(),
            device_id: device_id.into(),
            control_type,
            reason: reason.filter(|r| !r.is_empty()).map(str::to_string),
            ts_ms,
        }
    }

    /// Create a session acknowledgement.
    #[must_use]
    pub fn gateway_session(
        session_id: impl Into<String>,
        device_id: impl Into<String>,
        ts_ms: i64,
    ) -> Self {
        Self::GatewaySession {
            session_id: session_id.into(),
            device_id: device_id.into(),
            ts_ms,
        }
    }

    /// Create a gateway error.
    #[must_use]
    pub fn gateway_error(reason: impl Into<String>) -> Self {
        Self::GatewayError {
            reason: reason.into(),
        }
    }

    /// Create a health probe response.
    #[must_use]
    pub const fn health() -> Self {
        Self::Health { ok: true }
    }

    /// Serialize to compact JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> ProtoResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a known gateway message.
    pub fn from_json(json: &str) -> ProtoResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Build the `control_ack` JSON text shared by the control lane and gateway.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn build_control_ack(
    ok: bool,
    session_id: &str,
    device_id: &str,
    control_type: &str,
    reason: Option<&str>,
    ts_ms: Option<i64>,
) -> ProtoResult<String> {
    GatewayMessage::control_ack(ok, session_id, device_id, control_type, reason, ts_ms).to_json()
}
