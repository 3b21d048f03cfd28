//! Error types for the gateway server.

use thiserror::Error;

/// Errors that can occur in the gateway server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to the configured address.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        /// Address that could not be bound.
        addr: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Invalid gateway configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// WebSocket error occurred.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Failed to serialize a message.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A backend could not be reached.
    #[error("backend {url} unavailable: {reason}")]
    BackendUnavailable {
        /// Backend URL.
        url: String,
        /// Failure reason.
        reason: String,
    },

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ServerError {
    /// Whether a bind failure was caused by the port already being in use.
    #[must_use]
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            Self::BindFailed { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

impl From<sisi_proto::ProtoError> for ServerError {
    fn from(err: sisi_proto::ProtoError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_failed_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err = ServerError::BindFailed {
            addr: "127.0.0.1:9102".to_string(),
            source: io_err,
        };

        let msg = err.to_string();
        assert!(msg.contains("127.0.0.1:9102"));
        assert!(msg.contains("address in use"));
        assert!(err.is_addr_in_use());
    }

    #[test]
    fn test_other_bind_failure_is_not_addr_in_use() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ServerError::BindFailed {
            addr: "0.0.0.0:1".to_string(),
            source: io_err,
        };
        assert!(!err.is_addr_in_use());
    }

    #[test]
    fn test_backend_unavailable_display() {
        let err = ServerError::BackendUnavailable {
            url: "ws://127.0.0.1:9002".to_string(),
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "backend ws://127.0.0.1:9002 unavailable: connection refused"
        );
    }

    #[test]
    fn test_from_proto_error() {
        let err: ServerError = sisi_proto::ProtoError::Encoding("x".to_string()).into();
        assert!(matches!(err, ServerError::Serialization(_)));
    }

    #[test]
    fn test_connection_closed_display() {
        assert_eq!(ServerError::ConnectionClosed.to_string(), "connection closed");
    }
}
