//! Error types for the sync engine.

use fieldsync_protocol::{
    AttachmentId, ContentHash, ProtocolError, RecordId, RecordSnapshot, RejectionKind,
};
use fieldsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A request exceeded the request timeout.
    #[error("operation timed out")]
    Timeout,

    /// The server refused a record push.
    #[error("server rejected the change ({kind:?}): {message}")]
    ServerRejection {
        /// Rejection kind.
        kind: RejectionKind,
        /// Reason given by the server.
        message: String,
        /// Server's current snapshot, sent with version conflicts.
        current: Option<Box<RecordSnapshot>>,
    },

    /// Local store error.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Uploaded content does not match the local digest.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// Digest computed on the device.
        expected: ContentHash,
        /// Digest reported by the server.
        actual: ContentHash,
    },

    /// The server rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The record does not exist locally.
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    /// The attachment does not exist locally.
    #[error("attachment not found: {0}")]
    AttachmentNotFound(AttachmentId),

    /// A coalesced caller observed the active pass fail.
    #[error("sync pass failed: {message}")]
    PassFailed {
        /// Failure reported by the active pass.
        message: String,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a validation rejection.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ServerRejection {
            kind: RejectionKind::Validation,
            message: message.into(),
            current: None,
        }
    }

    /// Creates a version-conflict rejection.
    pub fn version_conflict(message: impl Into<String>, current: Option<RecordSnapshot>) -> Self {
        Self::ServerRejection {
            kind: RejectionKind::VersionConflict,
            message: message.into(),
            current: current.map(Box::new),
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Integrity { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error ends the pass and puts the engine in `error`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::AuthenticationFailed(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}
