//! Error types for local store operations.

use fieldsync_protocol::{AttachmentId, ProtocolError, RecordId};
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the local store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Tables could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record content could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The record does not exist.
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    /// The attachment does not exist.
    #[error("attachment not found: {0}")]
    AttachmentNotFound(AttachmentId),

    /// The write would break a store invariant.
    #[error("invalid state for {id}: {message}")]
    InvalidState {
        /// Entity id.
        id: String,
        /// What was wrong.
        message: String,
    },

    /// Another process holds the store directory.
    #[error("store locked: another process has exclusive access")]
    Locked,

    /// The backend refused the write.
    #[error("write rejected: {0}")]
    WriteRejected(String),
}

impl StoreError {
    /// Creates an invalid-state error.
    pub fn invalid_state(id: impl ToString, message: impl Into<String>) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }
}
