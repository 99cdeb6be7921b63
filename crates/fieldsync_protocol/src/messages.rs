//! Protocol messages for the server contract.
//!
//! | Operation                | Request             | Response              |
//! |--------------------------|---------------------|-----------------------|
//! | changes since a cursor   | `ChangesRequest`    | `ChangesResponse`     |
//! | create/update a record   | `PushRecordRequest` | `PushRecordResponse` or `PushRejection` |
//! | upload attachment binary | `UploadRequest`     | `UploadResponse`      |

use crate::error::{ProtocolError, ProtocolResult};
use crate::hash::ContentHash;
use crate::ids::{AttachmentId, RecordId, ServerId, Timestamp};
use crate::snapshot::RecordSnapshot;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// CBOR encoding for protocol messages.
pub trait CborMessage: Serialize + DeserializeOwned {
    /// Encodes to CBOR bytes.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ProtocolError::encode(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes from CBOR bytes.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::decode(e.to_string()))
    }
}

/// Request for server-side changes since the last successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// User whose owned/assigned records are requested.
    pub user_id: String,
    /// Last successful sync time; `None` requests everything.
    pub since: Option<Timestamp>,
}

impl ChangesRequest {
    /// Creates a new changes request.
    pub fn new(user_id: impl Into<String>, since: Option<Timestamp>) -> Self {
        Self {
            user_id: user_id.into(),
            since,
        }
    }
}

/// Server-side changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Changed records, each with a server-authoritative `updated_at`.
    pub records: Vec<RecordSnapshot>,
    /// Server clock at the time the change set was computed.
    pub server_time: Timestamp,
}

impl ChangesResponse {
    /// Creates a new changes response.
    pub fn new(records: Vec<RecordSnapshot>, server_time: Timestamp) -> Self {
        Self {
            records,
            server_time,
        }
    }
}

/// Create or update one record.
///
/// A record without a server id is a create. `base_updated_at` is the
/// precondition: the server version this edit was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRecordRequest {
    /// User performing the push.
    pub user_id: String,
    /// Record content to store.
    pub record: RecordSnapshot,
    /// Server version the local edit is based on.
    pub base_updated_at: Option<Timestamp>,
}

impl PushRecordRequest {
    /// Creates a new push request.
    pub fn new(
        user_id: impl Into<String>,
        record: RecordSnapshot,
        base_updated_at: Option<Timestamp>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            record,
            base_updated_at,
        }
    }

    /// Returns true if this push creates the record on the server.
    pub fn is_create(&self) -> bool {
        self.record.server_id.is_none()
    }
}

/// Accepted record push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRecordResponse {
    /// Server id of the record.
    pub id: ServerId,
    /// New server version.
    pub updated_at: Timestamp,
}

/// Why the server refused a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Business-rule validation failed.
    Validation,
    /// The precondition did not match the server's current version.
    VersionConflict,
}

/// Rejected record push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRejection {
    /// Rejection kind.
    pub kind: RejectionKind,
    /// Human-readable reason.
    pub message: String,
    /// Server's current snapshot, sent with version conflicts.
    #[serde(default)]
    pub current: Option<RecordSnapshot>,
}

impl PushRejection {
    /// Creates a version-conflict rejection carrying the server snapshot.
    pub fn version_conflict(current: RecordSnapshot) -> Self {
        Self {
            kind: RejectionKind::VersionConflict,
            message: "record was modified on the server".into(),
            current: Some(current),
        }
    }

    /// Creates a validation rejection.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::Validation,
            message: message.into(),
            current: None,
        }
    }
}

/// Attachment binary upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Attachment id.
    pub attachment_id: AttachmentId,
    /// Owning record.
    pub record_id: RecordId,
    /// MIME type of the content.
    pub content_type: String,
    /// Digest computed on the device.
    pub content_hash: ContentHash,
    /// Raw content.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

/// Stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Remote URL of the stored object.
    pub url: String,
    /// Digest computed by the server over the received bytes.
    pub hash: ContentHash,
}

impl CborMessage for ChangesRequest {}
impl CborMessage for ChangesResponse {}
impl CborMessage for PushRecordRequest {}
impl CborMessage for PushRecordResponse {}
impl CborMessage for PushRejection {}
impl CborMessage for UploadRequest {}
impl CborMessage for UploadResponse {}
