//! Transport topology: ports, lanes and gateway settings.
//!
//! Loaded from a JSON object using the system config key names. Every key is
//! optional and an unusable value falls back to its default, so a partial or
//! hand-edited config never stops the plane from starting.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sisi_gateway_server::GatewayConfig;
use tracing::{info, warn};

use crate::error::{TransportError, TransportResult};

/// Default device media TCP port.
pub const DEFAULT_DEVICE_TCP_PORT: u16 = 9001;
/// Default device media WebSocket bridge port.
pub const DEFAULT_DEVICE_WS_PORT: u16 = 9002;
/// Default media bridge target TCP port.
pub const DEFAULT_DEVICE_TCP_TARGET_PORT: u16 = 10001;
/// Default control lane WebSocket bridge port.
pub const DEFAULT_CONTROL_WS_PORT: u16 = 9003;
/// Default control lane TCP port.
pub const DEFAULT_CONTROL_TCP_PORT: u16 = 9004;
/// Default gateway bind host.
pub const DEFAULT_GATEWAY_HOST: &str = "0.0.0.0";
/// Default gateway port.
pub const DEFAULT_GATEWAY_PORT: u16 = 9102;
/// Default gateway message size limit.
pub const DEFAULT_GATEWAY_MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;
/// Default health probe interval.
pub const DEFAULT_HEALTH_PROBE_INTERVAL_MS: u64 = 5000;
/// Lower bound for the health probe interval.
pub const MIN_HEALTH_PROBE_INTERVAL_MS: u64 = 500;
/// Connect timeout for the bridge target reachability probe.
pub const TARGET_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Effective transport layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct TransportTopology {
    /// Device media TCP listener port.
    pub device_tcp_port: u16,
    /// Media WebSocket bridge port.
    pub device_ws_port: u16,
    /// Preferred TCP port behind the media bridge.
    pub device_tcp_target_port: u16,
    /// Run the dedicated control lane.
    pub control_lane_enabled: bool,
    /// Refuse to start without a working control lane.
    pub control_lane_required: bool,
    /// Control lane TCP listener port.
    pub control_tcp_port: u16,
    /// Control lane WebSocket bridge port.
    pub control_ws_port: u16,
    /// Health monitor cadence.
    #[serde(rename = "transport_health_probe_interval_ms")]
    pub health_probe_interval_ms: u64,
    /// Run the gateway front door.
    #[serde(rename = "gateway_front_door_enabled")]
    pub gateway_enabled: bool,
    /// Gateway bind host.
    #[serde(rename = "gateway_front_door_host")]
    pub gateway_host: String,
    /// Gateway port.
    #[serde(rename = "gateway_front_door_port")]
    pub gateway_port: u16,
    /// Media backend override, empty for the local media bridge.
    pub gateway_media_backend: String,
    /// Control backend override, empty for the local control bridge.
    pub gateway_control_backend: String,
    /// Gateway access token, empty for no auth.
    pub gateway_access_token: String,
    /// Gateway WebSocket message size limit.
    pub gateway_max_message_bytes: usize,
}

impl Default for TransportTopology {
    fn default() -> Self {
        Self {
            device_tcp_port: DEFAULT_DEVICE_TCP_PORT,
            device_ws_port: DEFAULT_DEVICE_WS_PORT,
            device_tcp_target_port: DEFAULT_DEVICE_TCP_TARGET_PORT,
            control_lane_enabled: true,
            control_lane_required: true,
            control_tcp_port: DEFAULT_CONTROL_TCP_PORT,
            control_ws_port: DEFAULT_CONTROL_WS_PORT,
            health_probe_interval_ms: DEFAULT_HEALTH_PROBE_INTERVAL_MS,
            gateway_enabled: true,
            gateway_host: DEFAULT_GATEWAY_HOST.to_string(),
            gateway_port: DEFAULT_GATEWAY_PORT,
            gateway_media_backend: String::new(),
            gateway_control_backend: String::new(),
            gateway_access_token: String::new(),
            gateway_max_message_bytes: DEFAULT_GATEWAY_MAX_MESSAGE_BYTES,
        }
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => Some(matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )),
        Value::Null => Some(false),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn to_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

struct Lookup<'a>(&'a Map<String, Value>);

impl Lookup<'_> {
    fn get<T>(&self, key: &str, default: T, convert: impl FnOnce(&Value) -> Option<T>) -> T {
        match self.0.get(key) {
            None => default,
            Some(value) => convert(value).unwrap_or_else(|| {
                warn!(key, value = %value, "unusable topology value, using default");
                default
            }),
        }
    }

    fn port(&self, key: &str, default: u16) -> u16 {
        self.get(key, default, |v| to_i64(v).and_then(|n| u16::try_from(n).ok()))
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        self.get(key, default, to_bool)
    }

    fn text(&self, key: &str, default: &str) -> String {
        let text = self.get(key, default.to_string(), to_text);
        if text.is_empty() { default.to_string() } else { text }
    }
}

impl From<Map<String, Value>> for TransportTopology {
    fn from(map: Map<String, Value>) -> Self {
        let d = Self::default();
        let v = Lookup(&map);
        Self {
            device_tcp_port: v.port("device_tcp_port", d.device_tcp_port),
            device_ws_port: v.port("device_ws_port", d.device_ws_port),
            device_tcp_target_port: v.port("device_tcp_target_port", d.device_tcp_target_port),
            control_lane_enabled: v.flag("control_lane_enabled", d.control_lane_enabled),
            control_lane_required: v.flag("control_lane_required", d.control_lane_required),
            control_tcp_port: v.port("control_tcp_port", d.control_tcp_port),
            control_ws_port: v.port("control_ws_port", d.control_ws_port),
            health_probe_interval_ms: v.get(
                "transport_health_probe_interval_ms",
                d.health_probe_interval_ms,
                |v| to_i64(v).and_then(|n| u64::try_from(n).ok()),
            ),
            gateway_enabled: v.flag("gateway_front_door_enabled", d.gateway_enabled),
            gateway_host: v.text("gateway_front_door_host", &d.gateway_host),
            gateway_port: v.port("gateway_front_door_port", d.gateway_port),
            gateway_media_backend: v.text("gateway_media_backend", ""),
            gateway_control_backend: v.text("gateway_control_backend", ""),
            gateway_access_token: v.text("gateway_access_token", ""),
            gateway_max_message_bytes: v.get(
                "gateway_max_message_bytes",
                d.gateway_max_message_bytes,
                |v| to_i64(v).and_then(|n| usize::try_from(n).ok()),
            ),
        }
    }
}

impl TransportTopology {
    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not a JSON object, or
    /// fails validation.
    pub fn from_file(path: impl AsRef<Path>) -> TransportResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TransportError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse from a JSON object string.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a JSON object or the result fails
    /// validation.
    pub fn from_json(content: &str) -> TransportResult<Self> {
        let map: Map<String, Value> = serde_json::from_str(content)
            .map_err(|e| TransportError::Config(format!("invalid JSON: {e}")))?;
        let topology = Self::from(map);
        topology.validate()?;
        Ok(topology)
    }

    /// Load from `path`, or use defaults when no path is given.
    ///
    /// # Errors
    ///
    /// See [`TransportTopology::from_file`].
    pub fn load(path: Option<&Path>) -> TransportResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate the topology.
    ///
    /// # Errors
    ///
    /// Returns an error for a zero port or a zero message size limit.
    pub fn validate(&self) -> TransportResult<()> {
        let ports = [
            ("device_tcp_port", self.device_tcp_port),
            ("device_ws_port", self.device_ws_port),
            ("device_tcp_target_port", self.device_tcp_target_port),
            ("control_tcp_port", self.control_tcp_port),
            ("control_ws_port", self.control_ws_port),
            ("gateway_front_door_port", self.gateway_port),
        ];
        if let Some((name, _)) = ports.iter().find(|(_, port)| *port == 0) {
            return Err(TransportError::Config(format!("{name} must be greater than 0")));
        }

        if self.gateway_max_message_bytes == 0 {
            return Err(TransportError::Config(
                "gateway_max_message_bytes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Media backend the gateway pipes `/device` clients to.
    #[must_use]
    pub fn resolved_gateway_media_backend(&self) -> String {
        if self.gateway_media_backend.is_empty() {
            format!("ws://127.0.0.1:{}", self.device_ws_port)
        } else {
            self.gateway_media_backend.clone()
        }
    }

    /// Local control lane WebSocket bridge URL.
    #[must_use]
    pub fn resolved_control_ws_backend(&self) -> String {
        format!("ws://127.0.0.1:{}", self.control_ws_port)
    }

    /// Control backend the gateway forwards `/control` messages to.
    #[must_use]
    pub fn resolved_gateway_control_backend(&self) -> String {
        if self.gateway_control_backend.is_empty() {
            self.resolved_control_ws_backend()
        } else {
            self.gateway_control_backend.clone()
        }
    }

    /// Health monitor cadence, never below 500 ms.
    #[must_use]
    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health_probe_interval_ms.max(MIN_HEALTH_PROBE_INTERVAL_MS))
    }

    /// Gateway settings derived from this topology.
    #[must_use]
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig::new(self.gateway_host.clone(), self.gateway_port)
            .with_media_backend(self.resolved_gateway_media_backend())
            .with_control_backend(self.resolved_gateway_control_backend())
            .with_access_token(self.gateway_access_token.clone())
            .with_max_message_bytes(self.gateway_max_message_bytes)
    }

    /// String view published as the runtime status topology.
    #[must_use]
    pub fn summary_fields(&self) -> BTreeMap<String, String> {
        [
            ("tcp_port", self.device_tcp_port.to_string()),
            ("ws_port", self.device_ws_port.to_string()),
            ("target_tcp", self.device_tcp_target_port.to_string()),
            ("control_lane_enabled", self.control_lane_enabled.to_string()),
            ("control_lane_required", self.control_lane_required.to_string()),
            ("control_tcp_port", self.control_tcp_port.to_string()),
            ("control_ws_port", self.control_ws_port.to_string()),
            ("health_probe_interval_ms", self.health_probe_interval_ms.to_string()),
            ("gateway_enabled", self.gateway_enabled.to_string()),
            ("gateway_host", self.gateway_host.clone()),
            ("gateway_port", self.gateway_port.to_string()),
            ("gateway_media_backend", self.resolved_gateway_media_backend()),
            ("gateway_control_backend", self.resolved_gateway_control_backend()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
#[must_use]
pub fn probe_local_port(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

/// Pick the TCP port behind the media WebSocket bridge.
///
/// `target` is used only when it equals `fallback` or answers a short
/// connect probe; otherwise the substitution is logged and `fallback` is
/// returned.
///
/// # Errors
///
/// Returns [`TransportError::InvalidPort`] if either port is zero.
pub fn select_bridge_target_port(target: u16, fallback: u16) -> TransportResult<u16> {
    if target == 0 || fallback == 0 {
        return Err(TransportError::InvalidPort(format!(
            "target={target} fallback={fallback}"
        )));
    }
    if target == fallback {
        return Ok(target);
    }
    if probe_local_port(target, TARGET_PROBE_TIMEOUT) {
        return Ok(target);
    }
    info!(
        target_port = target,
        fallback_port = fallback,
        "bridge target unreachable, falling back to device tcp port"
    );
    Ok(fallback)
}
