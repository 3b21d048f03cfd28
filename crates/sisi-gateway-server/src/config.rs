//! Gateway configuration.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::error::{ServerError, ServerResult};

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 9102;

/// Default media backend (the media WS bridge).
pub const DEFAULT_MEDIA_BACKEND: &str = "ws://127.0.0.1:9002";

/// Default control backend (the control WS bridge).
pub const DEFAULT_CONTROL_BACKEND: &str = "ws://127.0.0.1:9003";

/// Default maximum WebSocket message size: 2MB.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;

/// Default connect timeout for one-shot control forwards.
pub const DEFAULT_CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum number of concurrent client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Default keep-alive ping cadence on `/device` clients.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Default time open connections get to finish after shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Configuration for the gateway server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind. Zero lets the OS choose.
    pub port: u16,
    /// WebSocket URL of the media backend used by `/device`.
    pub media_backend_url: String,
    /// WebSocket URL of the control backend used by `/control`.
    pub control_backend_url: String,
    /// Required access token. Empty means no token is required.
    pub access_token: String,
    /// Maximum inbound and outbound message size in bytes.
    pub max_message_bytes: usize,
    /// Connect timeout for each control forward.
    pub control_connect_timeout: Duration,
    /// Maximum number of concurrent client connections.
    pub max_connections: usize,
    /// Keep-alive ping cadence on `/device` clients. Zero disables pings.
    pub ping_interval: Duration,
    /// How long open connections may take to wind down on shutdown before
    /// they are aborted.
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    /// Create a configuration with default backends and no access token.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            media_backend_url: DEFAULT_MEDIA_BACKEND.to_string(),
            control_backend_url: DEFAULT_CONTROL_BACKEND.to_string(),
            access_token: String::new(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            control_connect_timeout: DEFAULT_CONTROL_CONNECT_TIMEOUT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ping_interval: DEFAULT_PING_INTERVAL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// Set the media backend URL.
    #[must_use]
    pub fn with_media_backend(mut self, url: impl Into<String>) -> Self {
        self.media_backend_url = url.into().trim().to_string();
        self
    }

    /// Set the control backend URL.
    #[must_use]
    pub fn with_control_backend(mut self, url: impl Into<String>) -> Self {
        self.control_backend_url = url.into().trim().to_string();
        self
    }

    /// Set the required access token.
    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = token.into().trim().to_string();
        self
    }

    /// Set the maximum message size.
    #[must_use]
    pub const fn with_max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Set the control forward connect timeout.
    #[must_use]
    pub const fn with_control_connect_timeout(mut self, timeout: Duration) -> Self {
        self.control_connect_timeout = timeout;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the keep-alive ping cadence.
    #[must_use]
    pub const fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Address string passed to the listener.
    #[must_use]
    pub fn bind_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether clients must present a token.
    #[must_use]
    pub fn token_required(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// WebSocket protocol limits derived from `max_message_bytes`.
    #[must_use]
    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_bytes);
        config.max_frame_size = Some(self.max_message_bytes);
        config
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the control backend is missing or the message
    /// limit is zero.
    pub fn validate(&self) -> ServerResult<()> {
        if self.control_backend_url.is_empty() {
            return Err(ServerError::Config(
                "control backend url is required".to_string(),
            ));
        }
        if self.media_backend_url.is_empty() {
            return Err(ServerError::Config(
                "media backend url is required".to_string(),
            ));
        }
        if self.max_message_bytes == 0 {
            return Err(ServerError::Config(
                "max message bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}
