//! Error types for protocol encoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ProtocolError {
    /// Creates an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode(message.into())
    }

    /// Creates a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}
