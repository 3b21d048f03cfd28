//! Error types for the transport plane.

use thiserror::Error;

/// Errors that can occur while running the transport plane.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A listener port is already taken by another process.
    #[error("{service} port {port} is already in use")]
    AddrInUse {
        /// Service that tried to bind.
        service: &'static str,
        /// Port that was requested.
        port: u16,
    },

    /// A listener failed to bind for any other reason.
    #[error("{service} failed to bind port {port}: {source}")]
    Bind {
        /// Service that tried to bind.
        service: &'static str,
        /// Port that was requested.
        port: u16,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configured port is unusable.
    #[error("invalid port: {0}")]
    InvalidPort(String),

    /// Invalid or unreadable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The control lane is required but its bridge did not come up.
    #[error("control lane required but unavailable")]
    ControlLaneRequired,

    /// The gateway is enabled but did not come up.
    #[error("gateway front door enabled but unavailable")]
    GatewayUnavailable,

    /// A worker thread could not be spawned.
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        /// Thread name.
        name: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Gateway setup failed.
    #[error("gateway error: {0}")]
    Gateway(#[from] sisi_gateway_server::ServerError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Classify a bind failure, separating "address in use" from the rest.
    #[must_use]
    pub fn bind(service: &'static str, port: u16, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::AddrInUse {
            Self::AddrInUse { service, port }
        } else {
            Self::Bind {
                service,
                port,
                source,
            }
        }
    }

    /// Whether this error must stop the whole process from claiming
    /// readiness.
    #[must_use]
    pub const fn is_startup_fatal(&self) -> bool {
        matches!(self, Self::ControlLaneRequired | Self::GatewayUnavailable)
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
