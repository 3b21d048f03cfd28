//! Error types for the sisi-proto crate.

use thiserror::Error;

/// Errors that can occur while encoding or decoding gateway messages.
///
/// Control frame parsing is total and never produces one of these; they are
/// reserved for the JSON envelopes exchanged with gateway clients.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Failed to encode a message.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Failed to decode a message.
    #[error("decoding error: {0}")]
    Decoding(String),
}

impl From<serde_json::Error> for ProtoError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            Self::Decoding(err.to_string())
        } else {
            Self::Encoding(err.to_string())
        }
    }
}

/// Result type for protocol operations.
pub type ProtoResult<T> = Result<T, ProtoError>;
