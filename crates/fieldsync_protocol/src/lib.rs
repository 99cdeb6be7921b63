//! # FieldSync Protocol
//!
//! Wire types for the FieldSync server contract.
//!
//! This crate provides:
//! - Identifiers (`RecordId`, `AttachmentId`, `ServerId`) and timestamps
//! - `RecordSnapshot`, the unit exchanged with the server and retained in conflicts
//! - Request/response messages for changes-since, record push and attachment upload
//! - Content hashing (SHA-256) for convergence checks and upload verification
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod hash;
mod ids;
mod messages;
mod snapshot;

pub use error::{ProtocolError, ProtocolResult};
pub use hash::{content_hash, ContentHash, ContentHasher};
pub use ids::{now_millis, AttachmentId, RecordId, ServerId, Timestamp};
pub use messages::{
    ChangesRequest, ChangesResponse, CborMessage, PushRecordRequest, PushRecordResponse,
    PushRejection, RejectionKind, UploadRequest, UploadResponse,
};
pub use snapshot::{FieldTimestamps, Fields, RecordSnapshot};
