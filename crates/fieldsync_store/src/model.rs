//! Persisted data model: records, attachments, audit entries, metadata.

use fieldsync_protocol::{
    AttachmentId, ContentHash, FieldTimestamps, Fields, RecordId, RecordSnapshot, ServerId,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Metadata key holding the time of the last fully successful sync pass.
pub const LAST_SYNC_AT: &str = "last_sync_at";

/// Sync status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Local content matches the last accepted server version.
    Clean,
    /// A local mutation awaits confirmation by the server.
    Pending,
    /// A push for this record is in flight.
    Syncing,
    /// A pending local mutation diverged from a newer server snapshot.
    Conflict,
    /// Retries exhausted or the server refused the change.
    Error,
}

impl SyncStatus {
    /// All statuses, in display order.
    pub const ALL: [SyncStatus; 5] = [
        SyncStatus::Clean,
        SyncStatus::Pending,
        SyncStatus::Syncing,
        SyncStatus::Conflict,
        SyncStatus::Error,
    ];

    /// Returns true if the record carries a local change the server has not accepted.
    pub fn has_unconfirmed_change(&self) -> bool {
        matches!(
            self,
            SyncStatus::Pending | SyncStatus::Syncing | SyncStatus::Error
        )
    }

    /// Status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Clean => "clean",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown sync status: {s}"))
    }
}

/// Sync status of an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStatus {
    /// Uploaded and verified.
    Clean,
    /// Waiting for upload.
    PendingUpload,
    /// Upload in flight.
    Uploading,
    /// Retries exhausted or integrity check failed repeatedly.
    Error,
}

impl AttachmentStatus {
    /// Status name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentStatus::Clean => "clean",
            AttachmentStatus::PendingUpload => "pending_upload",
            AttachmentStatus::Uploading => "uploading",
            AttachmentStatus::Error => "error",
        }
    }
}

impl fmt::Display for AttachmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy used to collapse a conflict into one canonical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Keep the local snapshot and push it as an overwrite.
    KeepLocal,
    /// Adopt the server snapshot, discarding local edits.
    KeepServer,
    /// Field-by-field merge.
    Merge,
}

impl ResolutionPolicy {
    /// Policy name as stored.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionPolicy::KeepLocal => "keep_local",
            ResolutionPolicy::KeepServer => "keep_server",
            ResolutionPolicy::Merge => "merge",
        }
    }
}

impl fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep_local" => Ok(ResolutionPolicy::KeepLocal),
            "keep_server" => Ok(ResolutionPolicy::KeepServer),
            "merge" => Ok(ResolutionPolicy::Merge),
            other => Err(format!("unknown resolution policy: {other}")),
        }
    }
}

/// Both sides of a diverged record, retained verbatim until resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPayload {
    /// Local snapshot at the time the divergence was detected.
    pub local: RecordSnapshot,
    /// Last-fetched server snapshot.
    pub server: RecordSnapshot,
    /// When the divergence was detected.
    pub detected_at: Timestamp,
}

/// A record as mirrored on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Client-generated id.
    pub id: RecordId,
    /// Server-assigned id, absent until the first accepted push.
    pub server_id: Option<ServerId>,
    /// Domain fields.
    pub fields: Fields,
    /// Per-field change timestamps.
    pub field_updated_at: FieldTimestamps,
    /// Time of the last local mutation.
    pub local_updated_at: Timestamp,
    /// Version of the last accepted server snapshot.
    pub server_updated_at: Option<Timestamp>,
    /// Tombstone flag.
    pub deleted: bool,
    /// Uploaded attachments (id to remote URL).
    pub attachment_refs: BTreeMap<AttachmentId, String>,
    /// Sync status.
    pub sync_status: SyncStatus,
    /// Consecutive failed push attempts.
    pub retry_count: u32,
    /// Earliest time the next push may be attempted.
    pub next_attempt_at: Option<Timestamp>,
    /// Last push failure.
    pub last_error: Option<String>,
    /// Retained snapshots while in conflict.
    pub conflict: Option<ConflictPayload>,
}

impl StoredRecord {
    /// Creates a record authored on the device, pending its first push.
    pub fn new_local(id: RecordId, fields: Fields, now: Timestamp) -> Self {
        let field_updated_at = fields.keys().map(|name| (name.clone(), now)).collect();
        Self {
            id,
            server_id: None,
            fields,
            field_updated_at,
            local_updated_at: now,
            server_updated_at: None,
            deleted: false,
            attachment_refs: BTreeMap::new(),
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            conflict: None,
        }
    }

    /// Hydrates a clean record from a server snapshot.
    pub fn from_server(snapshot: RecordSnapshot) -> Self {
        let mut record = Self::new_local(snapshot.id.clone(), Fields::new(), snapshot.updated_at);
        record.apply_server_snapshot(&snapshot);
        record
    }

    /// Local view of the record as a snapshot.
    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.id.clone(),
            server_id: self.server_id.clone(),
            fields: self.fields.clone(),
            field_updated_at: self.field_updated_at.clone(),
            updated_at: self.local_updated_at,
            deleted: self.deleted,
            attachment_refs: self.attachment_refs.clone(),
        }
    }

    /// Overwrites local content with an accepted server snapshot and marks the record clean.
    pub fn apply_server_snapshot(&mut self, snapshot: &RecordSnapshot) {
        if snapshot.server_id.is_some() {
            self.server_id = snapshot.server_id.clone();
        }
        self.fields = snapshot.fields.clone();
        self.field_updated_at = snapshot.field_updated_at.clone();
        self.deleted = snapshot.deleted;
        self.attachment_refs = snapshot.attachment_refs.clone();
        self.local_updated_at = snapshot.updated_at;
        self.server_updated_at = Some(snapshot.updated_at);
        self.mark_clean();
    }

    /// Adopts a resolved snapshot as local content without touching status.
    pub fn apply_content(&mut self, snapshot: &RecordSnapshot) {
        self.fields = snapshot.fields.clone();
        self.field_updated_at = snapshot.field_updated_at.clone();
        self.deleted = snapshot.deleted;
        self.attachment_refs = snapshot.attachment_refs.clone();
        if snapshot.server_id.is_some() {
            self.server_id = snapshot.server_id.clone();
        }
    }

    /// Flags the record as conflicted, retaining both snapshots.
    pub fn enter_conflict(&mut self, server: RecordSnapshot, now: Timestamp) {
        self.conflict = Some(ConflictPayload {
            local: self.snapshot(),
            server,
            detected_at: now,
        });
        self.sync_status = SyncStatus::Conflict;
        self.next_attempt_at = None;
    }

    /// Clears retry bookkeeping and marks the record clean.
    pub fn mark_clean(&mut self) {
        self.sync_status = SyncStatus::Clean;
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.last_error = None;
        self.conflict = None;
    }

    /// Queues the record for push and clears retry bookkeeping.
    pub fn mark_pending(&mut self) {
        self.sync_status = SyncStatus::Pending;
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.last_error = None;
    }

    /// Returns true if a push may be attempted at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Binary evidence captured on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment id.
    pub id: AttachmentId,
    /// Owning record (lookup only).
    pub record_id: RecordId,
    /// Path of the device-owned binary.
    pub local_ref: PathBuf,
    /// MIME type.
    pub content_type: String,
    /// Digest computed at capture.
    pub content_hash: ContentHash,
    /// Size at capture.
    pub size_bytes: u64,
    /// Remote URL, set once uploaded and verified.
    pub remote_url: Option<String>,
    /// Sync status.
    pub sync_status: AttachmentStatus,
    /// Consecutive failed upload attempts.
    pub retry_count: u32,
    /// Earliest time the next upload may be attempted.
    pub next_attempt_at: Option<Timestamp>,
    /// Last upload failure.
    pub last_error: Option<String>,
    /// Capture time.
    pub created_at: Timestamp,
}

impl Attachment {
    /// Returns true if an upload may be attempted at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Record of one conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Resolved record.
    pub record_id: RecordId,
    /// Policy applied.
    pub policy: ResolutionPolicy,
    /// Who resolved it.
    pub actor: String,
    /// When.
    pub at: Timestamp,
}

/// Record and attachment counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Clean records.
    pub clean: usize,
    /// Pending records.
    pub pending: usize,
    /// Records with a push in flight.
    pub syncing: usize,
    /// Conflicted records.
    pub conflict: usize,
    /// Errored records.
    pub error: usize,
    /// Attachments waiting for upload.
    pub pending_uploads: usize,
    /// Attachments uploading.
    pub uploading: usize,
    /// Attachments in error.
    pub failed_uploads: usize,
}

impl StatusCounts {
    fn record_slot(&mut self, status: SyncStatus) -> &mut usize {
        match status {
            SyncStatus::Clean => &mut self.clean,
            SyncStatus::Pending => &mut self.pending,
            SyncStatus::Syncing => &mut self.syncing,
            SyncStatus::Conflict => &mut self.conflict,
            SyncStatus::Error => &mut self.error,
        }
    }

    fn attachment_slot(&mut self, status: AttachmentStatus) -> Option<&mut usize> {
        match status {
            AttachmentStatus::Clean => None,
            AttachmentStatus::PendingUpload => Some(&mut self.pending_uploads),
            AttachmentStatus::Uploading => Some(&mut self.uploading),
            AttachmentStatus::Error => Some(&mut self.failed_uploads),
        }
    }

    /// Applies a record status transition.
    pub fn apply_record(&mut self, from: Option<SyncStatus>, to: SyncStatus) {
        if let Some(from) = from {
            let slot = self.record_slot(from);
            *slot = slot.saturating_sub(1);
        }
        *self.record_slot(to) += 1;
    }

    /// Applies an attachment status transition.
    pub fn apply_attachment(&mut self, from: Option<AttachmentStatus>, to: AttachmentStatus) {
        if let Some(slot) = from.and_then(|from| self.attachment_slot(from)) {
            *slot = slot.saturating_sub(1);
        }
        if let Some(slot) = self.attachment_slot(to) {
            *slot += 1;
        }
    }

    /// Returns the record count for a status.
    pub fn records(&self, status: SyncStatus) -> usize {
        match status {
            SyncStatus::Clean => self.clean,
            SyncStatus::Pending => self.pending,
            SyncStatus::Syncing => self.syncing,
            SyncStatus::Conflict => self.conflict,
            SyncStatus::Error => self.error,
        }
    }
}
