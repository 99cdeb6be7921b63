//! Record snapshots.

use crate::error::{ProtocolError, ProtocolResult};
use crate::hash::{content_hash, ContentHash};
use crate::ids::{AttachmentId, RecordId, ServerId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Domain fields of a record, keyed by field name.
///
/// A `BTreeMap` keeps the encoding deterministic, which content comparison
/// relies on.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Per-field change timestamps (field provenance).
pub type FieldTimestamps = BTreeMap<String, Timestamp>;

/// A point-in-time copy of one record.
///
/// Snapshots are what the server sends on pull, what the device sends on
/// push, and what a conflict retains for both sides until resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Client-generated record id.
    pub id: RecordId,
    /// Server-assigned id, if the record has ever been accepted.
    #[serde(default)]
    pub server_id: Option<ServerId>,
    /// Domain fields.
    #[serde(default)]
    pub fields: Fields,
    /// When each field last changed, if known.
    #[serde(default)]
    pub field_updated_at: FieldTimestamps,
    /// Whole-record timestamp (server-authoritative on pulled snapshots).
    pub updated_at: Timestamp,
    /// Tombstone flag.
    #[serde(default)]
    pub deleted: bool,
    /// Uploaded attachments referenced by this record (id to remote URL).
    #[serde(default)]
    pub attachment_refs: BTreeMap<AttachmentId, String>,
}

#[derive(Serialize)]
struct Content<'a> {
    fields: &'a Fields,
    deleted: bool,
    attachment_refs: &'a BTreeMap<AttachmentId, String>,
}

impl RecordSnapshot {
    /// Creates a live snapshot with the given fields.
    pub fn new(id: impl Into<RecordId>, fields: Fields, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            server_id: None,
            fields,
            field_updated_at: FieldTimestamps::new(),
            updated_at,
            deleted: false,
            attachment_refs: BTreeMap::new(),
        }
    }

    /// Sets the server id.
    pub fn with_server_id(mut self, server_id: impl Into<ServerId>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    /// Sets one field and its change timestamp.
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: serde_json::Value,
        changed_at: Timestamp,
    ) -> Self {
        let name = name.into();
        self.field_updated_at.insert(name.clone(), changed_at);
        self.fields.insert(name, value);
        self
    }

    /// Marks the snapshot as a tombstone.
    pub fn into_tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Returns a field value.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    /// Canonical CBOR bytes of the record content.
    ///
    /// Content is the fields, the tombstone flag and the attachment
    /// references. Ids and timestamps are excluded.
    pub fn content_bytes(&self) -> ProtocolResult<Vec<u8>> {
        let content = Content {
            fields: &self.fields,
            deleted: self.deleted,
            attachment_refs: &self.attachment_refs,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&content, &mut bytes)
            .map_err(|e| ProtocolError::encode(e.to_string()))?;
        Ok(bytes)
    }

    /// SHA-256 digest of [`content_bytes`](Self::content_bytes).
    pub fn content_digest(&self) -> ProtocolResult<ContentHash> {
        Ok(content_hash(&self.content_bytes()?))
    }

    /// Returns true if both snapshots carry byte-identical content.
    pub fn same_content(&self, other: &RecordSnapshot) -> bool {
        match (self.content_bytes(), other.content_bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => {
                self.fields == other.fields
                    && self.deleted == other.deleted
                    && self.attachment_refs == other.attachment_refs
            }
        }
    }
}
