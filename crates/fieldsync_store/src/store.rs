//! The local store contract and its reference implementation.

use crate::backend::{FileBackend, MemoryBackend, StoreBackend};
use crate::error::{StoreError, StoreResult};
use crate::feed::{ChangeFeed, StoreEvent};
use crate::model::{
    Attachment, AttachmentStatus, AuditEntry, StatusCounts, StoredRecord, SyncStatus,
};
use crate::query::StatusQuery;
use crate::tables::{check_record, Tables};
use fieldsync_protocol::{AttachmentId, RecordId};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::mpsc::Receiver;
use tokio::sync::watch;

/// Local persistence contract used by the sync engine.
///
/// All calls are synchronous and each write is atomic: it is either fully
/// persisted and published to subscribers, or it fails with no effect.
pub trait LocalStore: Send + Sync {
    /// Reads one record.
    fn get_record(&self, id: &RecordId) -> StoreResult<Option<StoredRecord>>;

    /// Inserts or replaces one record.
    fn put_record(&self, record: StoredRecord) -> StoreResult<()>;

    /// Atomically reads, mutates and writes one record.
    ///
    /// Returns the record as written. If `f` fails nothing is written.
    fn modify_record(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut StoredRecord) -> StoreResult<()>,
    ) -> StoreResult<StoredRecord>;

    /// Atomically reads, mutates and writes one record, appending the audit
    /// entry returned by `f` in the same commit.
    fn modify_record_with_audit(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut StoredRecord) -> StoreResult<AuditEntry>,
    ) -> StoreResult<StoredRecord>;

    /// Returns up to `limit` record ids with `status`, ordered by id, after `after`.
    fn record_ids_with_status(
        &self,
        status: SyncStatus,
        after: Option<&RecordId>,
        limit: usize,
    ) -> StoreResult<Vec<RecordId>>;

    /// Returns every record, ordered by id.
    fn all_records(&self) -> StoreResult<Vec<StoredRecord>>;

    /// Reads one attachment.
    fn get_attachment(&self, id: &AttachmentId) -> StoreResult<Option<Attachment>>;

    /// Inserts or replaces one attachment.
    fn put_attachment(&self, attachment: Attachment) -> StoreResult<()>;

    /// Atomically reads, mutates and writes one attachment.
    fn modify_attachment(
        &self,
        id: &AttachmentId,
        f: &mut dyn FnMut(&mut Attachment) -> StoreResult<()>,
    ) -> StoreResult<Attachment>;

    /// Returns up to `limit` attachment ids with `status`, ordered by id, after `after`.
    fn attachment_ids_with_status(
        &self,
        status: AttachmentStatus,
        after: Option<&AttachmentId>,
        limit: usize,
    ) -> StoreResult<Vec<AttachmentId>>;

    /// Returns the attachments owned by a record.
    fn attachments_for_record(&self, record_id: &RecordId) -> StoreResult<Vec<Attachment>>;

    /// Appends an audit entry.
    fn append_audit(&self, entry: AuditEntry) -> StoreResult<()>;

    /// Returns audit entries, optionally for one record, oldest first.
    fn audit_entries(&self, record_id: Option<&RecordId>) -> StoreResult<Vec<AuditEntry>>;

    /// Reads a metadata value.
    fn get_metadata(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes a metadata value.
    fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Current record and attachment counts per status.
    fn status_counts(&self) -> StatusCounts;

    /// Subscribes to committed changes.
    fn subscribe(&self) -> Receiver<StoreEvent>;

    /// Returns a receiver of live status counts.
    fn watch_counts(&self) -> watch::Receiver<StatusCounts>;

    /// Shorthand for [`modify_record`](Self::modify_record) with a closure.
    fn update_record<F>(&self, id: &RecordId, mut f: F) -> StoreResult<StoredRecord>
    where
        Self: Sized,
        F: FnMut(&mut StoredRecord) -> StoreResult<()>,
    {
        self.modify_record(id, &mut f)
    }

    /// Shorthand for [`modify_attachment`](Self::modify_attachment) with a closure.
    fn update_attachment<F>(&self, id: &AttachmentId, mut f: F) -> StoreResult<Attachment>
    where
        Self: Sized,
        F: FnMut(&mut Attachment) -> StoreResult<()>,
    {
        self.modify_attachment(id, &mut f)
    }

    /// Lazy, restartable iterator over records with `status`.
    fn query_records(&self, status: SyncStatus) -> StatusQuery<'_, Self, StoredRecord>
    where
        Self: Sized,
    {
        StatusQuery::new(self, status)
    }

    /// Lazy, restartable iterator over attachments with `status`.
    fn query_attachments(&self, status: AttachmentStatus) -> StatusQuery<'_, Self, Attachment>
    where
        Self: Sized,
    {
        StatusQuery::new(self, status)
    }
}

/// A store over a persistence backend.
///
/// Tables live in memory behind a `RwLock`; every commit encodes the full
/// table image and hands it to the backend before the in-memory state is
/// replaced, so a failed save has no visible effect.
pub struct Store<B: StoreBackend> {
    backend: B,
    tables: RwLock<Tables>,
    feed: ChangeFeed,
}

/// In-memory store.
pub type MemoryStore = Store<MemoryBackend>;

/// Single-directory file store.
pub type FileStore = Store<FileBackend>;

impl MemoryStore {
    /// Creates an empty in-memory store.
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl FileStore {
    /// Opens (creating if missing) a store directory.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Locked` if another process holds the directory,
    /// or `StoreError::Serialization` if the table file is corrupted.
    pub fn open_dir(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open(FileBackend::open(path)?)
    }
}

impl<B: StoreBackend> Store<B> {
    /// Creates a store over a fresh backend, ignoring any saved image.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            tables: RwLock::new(Tables::new()),
            feed: ChangeFeed::default(),
        }
    }

    /// Opens a store, loading the backend's saved image.
    pub fn open(backend: B) -> StoreResult<Self> {
        let tables = match backend.load()? {
            Some(image) => Tables::decode(&image)?,
            None => Tables::new(),
        };
        tracing::debug!(
            records = tables.records.len(),
            attachments = tables.attachments.len(),
            "opened local store"
        );
        let feed = ChangeFeed::new(tables.counts());
        Ok(Self {
            backend,
            tables: RwLock::new(tables),
            feed,
        })
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.tables.read())
    }

    /// Applies `f` to a copy of the tables, persists it, then publishes.
    fn commit<R>(
        &self,
        f: impl FnOnce(&mut Tables, &mut Vec<StoreEvent>) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let mut tables = self.tables.write();
        let mut next = tables.clone();
        let mut events = Vec::new();
        let out = f(&mut next, &mut events)?;

        let image = next.encode()?;
        if let Err(err) = self.backend.save(&image) {
            tracing::warn!(error = %err, "store write failed");
            return Err(err);
        }
        *tables = next;

        // Emit while still holding the lock so subscribers see commit order
        self.feed.emit_batch(events);
        Ok(out)
    }
}

fn write_record(tables: &mut Tables, events: &mut Vec<StoreEvent>, record: StoredRecord) {
    let id = record.id.clone();
    let to = record.sync_status;
    let from = tables.insert_record(record);
    events.push(StoreEvent::Record { id, from, to });
}

fn write_attachment(tables: &mut Tables, events: &mut Vec<StoreEvent>, attachment: Attachment) {
    let id = attachment.id.clone();
    let to = attachment.sync_status;
    let from = tables.insert_attachment(attachment);
    events.push(StoreEvent::Attachment { id, from, to });
}

impl<B: StoreBackend> LocalStore for Store<B> {
    fn get_record(&self, id: &RecordId) -> StoreResult<Option<StoredRecord>> {
        Ok(self.read(|t| t.records.get(id).cloned()))
    }

    fn put_record(&self, record: StoredRecord) -> StoreResult<()> {
        check_record(&record)?;
        self.commit(|tables, events| {
            write_record(tables, events, record);
            Ok(())
        })
    }

    fn modify_record(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut StoredRecord) -> StoreResult<()>,
    ) -> StoreResult<StoredRecord> {
        self.commit(|tables, events| {
            let mut record = tables
                .records
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::RecordNotFound(id.clone()))?;
            f(&mut record)?;
            if &record.id != id {
                return Err(StoreError::invalid_state(id, "record id cannot change"));
            }
            check_record(&record)?;
            write_record(tables, events, record.clone());
            Ok(record)
        })
    }

    fn modify_record_with_audit(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut StoredRecord) -> StoreResult<AuditEntry>,
    ) -> StoreResult<StoredRecord> {
        self.commit(|tables, events| {
            let mut record = tables
                .records
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::RecordNotFound(id.clone()))?;
            let entry = f(&mut record)?;
            if &record.id != id || &entry.record_id != id {
                return Err(StoreError::invalid_state(id, "record id cannot change"));
            }
            check_record(&record)?;
            write_record(tables, events, record.clone());
            events.push(StoreEvent::Audit {
                record_id: entry.record_id.clone(),
            });
            tables.audit.push(entry);
            Ok(record)
        })
    }

    fn record_ids_with_status(
        &self,
        status: SyncStatus,
        after: Option<&RecordId>,
        limit: usize,
    ) -> StoreResult<Vec<RecordId>> {
        Ok(self.read(|t| t.record_ids_with_status(status, after, limit)))
    }

    fn all_records(&self) -> StoreResult<Vec<StoredRecord>> {
        Ok(self.read(|t| t.records.values().cloned().collect()))
    }

    fn get_attachment(&self, id: &AttachmentId) -> StoreResult<Option<Attachment>> {
        Ok(self.read(|t| t.attachments.get(id).cloned()))
    }

    fn put_attachment(&self, attachment: Attachment) -> StoreResult<()> {
        self.commit(|tables, events| {
            write_attachment(tables, events, attachment);
            Ok(())
        })
    }

    fn modify_attachment(
        &self,
        id: &AttachmentId,
        f: &mut dyn FnMut(&mut Attachment) -> StoreResult<()>,
    ) -> StoreResult<Attachment> {
        self.commit(|tables, events| {
            let mut attachment = tables
                .attachments
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::AttachmentNotFound(id.clone()))?;
            f(&mut attachment)?;
            if &attachment.id != id {
                return Err(StoreError::invalid_state(id, "attachment id cannot change"));
            }
            write_attachment(tables, events, attachment.clone());
            Ok(attachment)
        })
    }

    fn attachment_ids_with_status(
        &self,
        status: AttachmentStatus,
        after: Option<&AttachmentId>,
        limit: usize,
    ) -> StoreResult<Vec<AttachmentId>> {
        Ok(self.read(|t| t.attachment_ids_with_status(status, after, limit)))
    }

    fn attachments_for_record(&self, record_id: &RecordId) -> StoreResult<Vec<Attachment>> {
        Ok(self.read(|t| t.attachments_of(record_id)))
    }

    fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.commit(|tables, events| {
            events.push(StoreEvent::Audit {
                record_id: entry.record_id.clone(),
            });
            tables.audit.push(entry);
            Ok(())
        })
    }

    fn audit_entries(&self, record_id: Option<&RecordId>) -> StoreResult<Vec<AuditEntry>> {
        Ok(self.read(|t| {
            t.audit
                .iter()
                .filter(|e| record_id.map_or(true, |id| &e.record_id == id))
                .cloned()
                .collect()
        }))
    }

    fn get_metadata(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.read(|t| t.metadata.get(key).cloned()))
    }

    fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        self.commit(|tables, events| {
            tables.metadata.insert(key.to_string(), value.to_string());
            events.push(StoreEvent::Metadata {
                key: key.to_string(),
            });
            Ok(())
        })
    }

    fn status_counts(&self) -> StatusCounts {
        self.feed.counts()
    }

    fn subscribe(&self) -> Receiver<StoreEvent> {
        self.feed.subscribe()
    }

    fn watch_counts(&self) -> watch::Receiver<StatusCounts> {
        self.feed.watch_counts()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResolutionPolicy;
    use fieldsync_protocol::{ContentHash, Fields, RecordSnapshot};
    use serde_json::json;
    use std::path::PathBuf;

    fn record(id: &str, status: SyncStatus) -> StoredRecord {
        let mut fields = Fields::new();
        fields.insert("address".into(), json!("12 Main St"));
        let mut record = StoredRecord::new_local(RecordId::new(id), fields, 100);
        record.sync_status = status;
        record
    }

    fn attachment(id: &str, record_id: &str) -> Attachment {
        Attachment {
            id: AttachmentId::new(id),
            record_id: RecordId::new(record_id),
            local_ref: PathBuf::from(format!("/photos/{id}.jpg")),
            content_type: "image/jpeg".into(),
            content_hash: ContentHash::from_hex("00"),
            size_bytes: 1,
            remote_url: None,
            sync_status: AttachmentStatus::PendingUpload,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: 100,
        }
    }

    #[test]
    fn put_and_get_record() {
        let store = MemoryStore::in_memory();
        store.put_record(record("r1", SyncStatus::Pending)).unwrap();

        let loaded = store.get_record(&RecordId::new("r1")).unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
        assert!(store.get_record(&RecordId::new("nope")).unwrap().is_none());
    }

    #[test]
    fn conflict_without_payload_is_rejected() {
        let store = MemoryStore::in_memory();
        let result = store.put_record(record("r1", SyncStatus::Conflict));
        assert!(matches!(result, Err(StoreError::InvalidState { .. })));
        assert!(store.get_record(&RecordId::new("r1")).unwrap().is_none());
    }

    #[test]
    fn status_index_pages_in_id_order() {
        let store = MemoryStore::in_memory();
        for id in ["r3", "r1", "r4", "r2"] {
            store.put_record(record(id, SyncStatus::Pending)).unwrap();
        }
        store.put_record(record("r0", SyncStatus::Clean)).unwrap();

        let first = store
            .record_ids_with_status(SyncStatus::Pending, None, 2)
            .unwrap();
        assert_eq!(first, vec![RecordId::new("r1"), RecordId::new("r2")]);

        let rest = store
            .record_ids_with_status(SyncStatus::Pending, first.last(), 10)
            .unwrap();
        assert_eq!(rest, vec![RecordId::new("r3"), RecordId::new("r4")]);
    }

    #[test]
    fn modify_failure_writes_nothing() {
        let store = MemoryStore::in_memory();
        store.put_record(record("r1", SyncStatus::Pending)).unwrap();

        let result = store.update_record(&RecordId::new("r1"), |r| {
            r.sync_status = SyncStatus::Clean;
            Err(StoreError::invalid_state(&r.id, "refused"))
        });

        assert!(result.is_err());
        let loaded = store.get_record(&RecordId::new("r1")).unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn modify_missing_record_fails() {
        let store = MemoryStore::in_memory();
        let result = store.update_record(&RecordId::new("ghost"), |_| Ok(()));
        assert!(matches!(result, Err(StoreError::RecordNotFound(_))));
    }

    #[test]
    fn failed_save_has_no_visible_effect() {
        let store = MemoryStore::in_memory();
        store.put_record(record("r1", SyncStatus::Pending)).unwrap();
        let rx = store.subscribe();

        store.backend().set_fail_writes(true);
        let result = store.update_record(&RecordId::new("r1"), |r| {
            r.sync_status = SyncStatus::Clean;
            Ok(())
        });

        assert!(matches!(result, Err(StoreError::WriteRejected(_))));
        let loaded = store.get_record(&RecordId::new("r1")).unwrap().unwrap();
        assert_eq!(loaded.sync_status, SyncStatus::Pending);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.status_counts().pending, 1);
    }

    #[test]
    fn subscribers_see_transitions() {
        let store = MemoryStore::in_memory();
        let rx = store.subscribe();

        store.put_record(record("r1", SyncStatus::Pending)).unwrap();
        store
            .update_record(&RecordId::new("r1"), |r| {
                r.mark_clean();
                Ok(())
            })
            .unwrap();

        assert_eq!(
            rx.recv().unwrap(),
            StoreEvent::Record {
                id: RecordId::new("r1"),
                from: None,
                to: SyncStatus::Pending
            }
        );
        assert_eq!(
            rx.recv().unwrap(),
            StoreEvent::Record {
                id: RecordId::new("r1"),
                from: Some(SyncStatus::Pending),
                to: SyncStatus::Clean
            }
        );
    }

    #[test]
    fn counts_follow_writes() {
        let store = MemoryStore::in_memory();
        let watch = store.watch_counts();

        store.put_record(record("r1", SyncStatus::Pending)).unwrap();
        store.put_record(record("r2", SyncStatus::Error)).unwrap();
        store.put_attachment(attachment("p1", "r1")).unwrap();

        let counts = *watch.borrow();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.error, 1);
        assert_eq!(counts.pending_uploads, 1);
        assert_eq!(store.status_counts(), counts);
    }

    #[test]
    fn attachments_by_record_and_status() {
        let store = MemoryStore::in_memory();
        store.put_attachment(attachment("p1", "r1")).unwrap();
        store.put_attachment(attachment("p2", "r2")).unwrap();
        store
            .update_attachment(&AttachmentId::new("p2"), |a| {
                a.sync_status = AttachmentStatus::Clean;
                Ok(())
            })
            .unwrap();

        let owned = store.attachments_for_record(&RecordId::new("r1")).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, AttachmentId::new("p1"));

        let pending = store
            .attachment_ids_with_status(AttachmentStatus::PendingUpload, None, 10)
            .unwrap();
        assert_eq!(pending, vec![AttachmentId::new("p1")]);
    }

    #[test]
    fn audit_is_written_with_record() {
        let store = MemoryStore::in_memory();
        let mut conflicted = record("r1", SyncStatus::Pending);
        conflicted.enter_conflict(RecordSnapshot::new("r1", Fields::new(), 500), 600);
        store.put_record(conflicted).unwrap();

        let entry = AuditEntry {
            record_id: RecordId::new("r1"),
            policy: ResolutionPolicy::KeepServer,
            actor: "inspector-7".into(),
            at: 700,
        };
        let written = entry.clone();
        store
            .modify_record_with_audit(&RecordId::new("r1"), &mut |record: &mut StoredRecord| {
                record.mark_clean();
                Ok(written.clone())
            })
            .unwrap();

        assert_eq!(store.audit_entries(Some(&RecordId::new("r1"))).unwrap(), vec![entry]);
        assert!(store.audit_entries(Some(&RecordId::new("r2"))).unwrap().is_empty());
        assert_eq!(store.status_counts().conflict, 0);
    }

    #[test]
    fn metadata_roundtrip() {
        let store = MemoryStore::in_memory();
        assert!(store.get_metadata("last_sync_at").unwrap().is_none());
        store.set_metadata("last_sync_at", "1700000000000").unwrap();
        assert_eq!(
            store.get_metadata("last_sync_at").unwrap().as_deref(),
            Some("1700000000000")
        );
    }

    #[test]
    fn reopen_from_saved_image() {
        let store = MemoryStore::in_memory();
        store.put_record(record("r1", SyncStatus::Pending)).unwrap();
        let image = store.backend().image().unwrap();

        let reopened = Store::open(MemoryBackend::with_image(image)).unwrap();
        assert!(reopened.get_record(&RecordId::new("r1")).unwrap().is_some());
        assert_eq!(reopened.status_counts().pending, 1);
    }
}
