//! Control frame codec.
//!
//! Control frames are small `key=value` bodies separated by `;`, optionally
//! carrying one nested `payload=` body whose pairs are joined with `&`:
//!
//! ```text
//! <control>type=interrupt;stream=s1;epoch=3;seq=12;payload=priority=high&ts=1000</control>
//! ```
//!
//! Parsing is total. Devices and gateway clients are untrusted, so malformed
//! segments are dropped instead of surfacing an error.

use std::collections::BTreeMap;
use std::fmt;

/// Opening marker of an embedded control frame.
pub const CONTROL_START: &str = "<control>";

/// Closing marker of an embedded control frame.
pub const CONTROL_END: &str = "</control>";

/// Capability keys a device may report on any frame.
pub const CAPABILITY_KEYS: [&str; 3] = ["aec_available", "ns_available", "agc_available"];

/// `source` value marking a capture-effects capability report.
pub const CAPTURE_FX_SOURCE: &str = "android_capture_fx";

const STREAM_KEYS: [&str; 2] = ["stream", "stream_id"];
const EPOCH_KEYS: [&str; 3] = ["epoch", "session_epoch", "wake_epoch"];
const SEQUENCE_KEYS: [&str; 3] = ["seq", "frame_seq", "control_seq"];

/// Normalized key/value fields of a control frame body.
///
/// Top-level keys are written last-wins; pairs from the nested `payload`
/// body are merged afterwards and never overwrite a key that already exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlFields(BTreeMap<String, String>);

impl ControlFields {
    /// Create an empty field set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Parse a control frame body. Never fails.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut fields = BTreeMap::new();

        for (key, value) in split_pairs(text, ';') {
            fields.insert(key, value);
        }

        let nested = fields
            .get("payload")
            .filter(|payload| !payload.is_empty())
            .map(|payload| split_pairs(payload, '&'))
            .unwrap_or_default();

        for (key, value) in nested {
            fields.entry(key).or_insert(value);
        }

        Self(fields)
    }

    /// Get a field by its normalized key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Check whether a key is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Value of the first key in `keys` that is present, even if empty.
    #[must_use]
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no fields were parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn split_pairs(text: &str, separator: char) -> Vec<(String, String)> {
    text.split(separator)
        .filter_map(|segment| segment.split_once('='))
        .filter_map(|(key, value)| {
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return None;
            }
            Some((key, value.trim().to_string()))
        })
        .collect()
}

/// Parse an integer field the way devices send them: surrounding whitespace is
/// ignored and anything unparseable is treated as absent.
#[must_use]
pub fn parse_int(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    value.parse::<i64>().ok()
}

/// Parse a boolean field: `1`, `true`, `yes` and `on` (any case) are true.
#[must_use]
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// A parsed control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// Lower-cased frame type, `"unknown"` when absent.
    pub control_type: String,
    /// Stream identifier, `"default"` when absent.
    pub stream_id: String,
    /// Lower-cased priority, empty when absent.
    pub priority: String,
    /// Sender timestamp in epoch milliseconds.
    pub timestamp_ms: Option<i64>,
    /// Session/wake generation. Negative values count as unspecified.
    pub epoch: Option<i64>,
    /// Per-epoch sequence number. Negative values count as unspecified.
    pub sequence: Option<i64>,
    /// All normalized fields, including merged payload pairs.
    pub raw_fields: ControlFields,
}

impl ControlFrame {
    /// Parse a control frame body (the text between the markers, or one line
    /// of the dedicated control lane). Never fails.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Self::from_fields(ControlFields::parse(text))
    }

    /// Build a frame from already parsed fields.
    #[must_use]
    pub fn from_fields(fields: ControlFields) -> Self {
        let control_type = fields
            .get("type")
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let stream_id = fields
            .first_of(&STREAM_KEYS)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("default")
            .to_string();

        let priority = fields
            .get("priority")
            .map(|p| p.trim().to_lowercase())
            .unwrap_or_default();

        let timestamp_ms = fields.get("ts").and_then(parse_int);
        let epoch = fields
            .first_of(&EPOCH_KEYS)
            .and_then(parse_int)
            .filter(|e| *e >= 0);
        let sequence = fields
            .first_of(&SEQUENCE_KEYS)
            .and_then(parse_int)
            .filter(|s| *s >= 0);

        Self {
            control_type,
            stream_id,
            priority,
            timestamp_ms,
            epoch,
            sequence,
            raw_fields: fields,
        }
    }

    /// Whether the frame carries a device capability report.
    #[must_use]
    pub fn is_capability_report(&self) -> bool {
        let from_capture_fx = self
            .raw_fields
            .get("source")
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(CAPTURE_FX_SOURCE));
        from_capture_fx || CAPABILITY_KEYS.iter().any(|k| self.raw_fields.contains(k))
    }

    /// Delivery latency against `now_ms`, when `ts` is a plain digit string.
    #[must_use]
    pub fn latency_ms(&self, now_ms: i64) -> Option<i64> {
        let raw = self.raw_fields.get("ts")?.trim();
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let ts = raw.parse::<i64>().ok()?;
        Some(now_ms.saturating_sub(ts).max(0))
    }

    /// Priority for display, `"normal"` when unset.
    #[must_use]
    pub fn priority_or_normal(&self) -> &str {
        if self.priority.is_empty() {
            "normal"
        } else {
            &self.priority
        }
    }
}

impl fmt::Display for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type={} stream={} priority={}",
            self.control_type,
            self.stream_id,
            self.priority_or_normal()
        )
    }
}

/// Wrap a frame body in control markers.
#[must_use]
pub fn wrap_control_frame(body: &str) -> String {
    format!("{CONTROL_START}{body}{CONTROL_END}")
}

/// Body of a `<control>…</control>` text, if the trimmed text is one.
#[must_use]
pub fn strip_control_markers(text: &str) -> Option<&str> {
    text.trim()
        .strip_prefix(CONTROL_START)
        .and_then(|rest| rest.strip_suffix(CONTROL_END))
}

fn json_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    let text = text.trim();
    if !(text.starts_with('{') && text.ends_with('}')) {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Whether a text message is a control payload: either a marker-wrapped
/// frame or a JSON object with a `type` key.
#[must_use]
pub fn is_control_payload(message: &str) -> bool {
    if message.trim().is_empty() {
        return false;
    }
    if strip_control_markers(message).is_some() {
        return true;
    }
    json_object(message).is_some_and(|obj| obj.contains_key("type"))
}

/// Lower-cased control type of a marker-wrapped or JSON control payload,
/// `"unknown"` otherwise.
#[must_use]
pub fn extract_control_type(message: &str) -> String {
    if let Some(body) = strip_control_markers(message) {
        return split_pairs(body, ';')
            .into_iter()
            .find(|(key, _)| key == "type")
            .map_or_else(|| "unknown".to_string(), |(_, value)| value.to_lowercase());
    }

    match json_object(message).and_then(|mut obj| obj.remove("type")) {
        Some(serde_json::Value::String(s)) => s.trim().to_lowercase(),
        Some(serde_json::Value::Null) | None => "unknown".to_string(),
        Some(other) => other.to_string().to_lowercase(),
    }
}
