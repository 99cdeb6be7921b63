//! Local write failures while applying pulled changes.

use fieldsync_engine::{MockTransport, SyncEngine};
use fieldsync_protocol::{AttachmentId, RecordId};
use fieldsync_store::{
    Attachment, AttachmentStatus, AuditEntry, LocalStore, MemoryStore, StatusCounts, StoreError,
    StoreEvent, StoreResult, StoredRecord, SyncStatus, LAST_SYNC_AT,
};
use fieldsync_testkit::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tokio::sync::watch;

/// Memory store that rejects the next `n` writes to one record.
struct RejectingStore {
    inner: MemoryStore,
    target: RecordId,
    remaining: AtomicUsize,
}

impl RejectingStore {
    fn new(inner: MemoryStore, target: &str, rejections: usize) -> Self {
        Self {
            inner,
            target: RecordId::new(target),
            remaining: AtomicUsize::new(rejections),
        }
    }

    fn admit(&self, id: &RecordId) -> StoreResult<()> {
        if *id != self.target {
            return Ok(());
        }
        let rejected = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            Err(StoreError::WriteRejected(format!("disk full writing {id}")))
        } else {
            Ok(())
        }
    }
}

impl LocalStore for RejectingStore {
    fn get_record(&self, id: &RecordId) -> StoreResult<Option<StoredRecord>> {
        self.inner.get_record(id)
    }

    fn put_record(&self, record: StoredRecord) -> StoreResult<()> {
        self.admit(&record.id)?;
        self.inner.put_record(record)
    }

    fn modify_record(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut StoredRecord) -> StoreResult<()>,
    ) -> StoreResult<StoredRecord> {
        self.admit(id)?;
        self.inner.modify_record(id, f)
    }

    fn modify_record_with_audit(
        &self,
        id: &RecordId,
        f: &mut dyn FnMut(&mut StoredRecord) -> StoreResult<AuditEntry>,
    ) -> StoreResult<StoredRecord> {
        self.admit(id)?;
        self.inner.modify_record_with_audit(id, f)
    }

    fn record_ids_with_status(
        &self,
        status: SyncStatus,
        after: Option<&RecordId>,
        limit: usize,
    ) -> StoreResult<Vec<RecordId>> {
        self.inner.record_ids_with_status(status, after, limit)
    }

    fn all_records(&self) -> StoreResult<Vec<StoredRecord>> {
        self.inner.all_records()
    }

    fn get_attachment(&self, id: &AttachmentId) -> StoreResult<Option<Attachment>> {
        self.inner.get_attachment(id)
    }

    fn put_attachment(&self, attachment: Attachment) -> StoreResult<()> {
        self.inner.put_attachment(attachment)
    }

    fn modify_attachment(
        &self,
        id: &AttachmentId,
        f: &mut dyn FnMut(&mut Attachment) -> StoreResult<()>,
    ) -> StoreResult<Attachment> {
        self.inner.modify_attachment(id, f)
    }

    fn attachment_ids_with_status(
        &self,
        status: AttachmentStatus,
        after: Option<&AttachmentId>,
        limit: usize,
    ) -> StoreResult<Vec<AttachmentId>> {
        self.inner.attachment_ids_with_status(status, after, limit)
    }

    fn attachments_for_record(&self, record_id: &RecordId) -> StoreResult<Vec<Attachment>> {
        self.inner.attachments_for_record(record_id)
    }

    fn append_audit(&self, entry: AuditEntry) -> StoreResult<()> {
        self.inner.append_audit(entry)
    }

    fn audit_entries(&self, record_id: Option<&RecordId>) -> StoreResult<Vec<AuditEntry>> {
        self.inner.audit_entries(record_id)
    }

    fn get_metadata(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get_metadata(key)
    }

    fn set_metadata(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.set_metadata(key, value)
    }

    fn status_counts(&self) -> StatusCounts {
        self.inner.status_counts()
    }

    fn subscribe(&self) -> Receiver<StoreEvent> {
        self.inner.subscribe()
    }

    fn watch_counts(&self) -> watch::Receiver<StatusCounts> {
        self.inner.watch_counts()
    }
}

fn engine_over(
    store: RejectingStore,
) -> (
    SyncEngine<MockTransport, RejectingStore>,
    Arc<MockTransport>,
    Arc<RejectingStore>,
) {
    let store = Arc::new(store);
    let transport = Arc::new(MockTransport::new());
    let engine = SyncEngine::new(test_config(), Arc::clone(&transport), Arc::clone(&store)).unwrap();
    (engine, transport, store)
}

fn record(store: &RejectingStore, id: &str) -> StoredRecord {
    store.get_record(&RecordId::new(id)).unwrap().unwrap()
}

#[tokio::test]
async fn failed_local_write_marks_record_and_pass_continues() {
    let inner = MemoryStore::in_memory();
    inner
        .put_record(pending_report("r1", "12 Main St", at(10, 0), Some(at(9, 0))))
        .unwrap();
    inner
        .put_record(pending_report("r3", "3 Elm St", at(10, 1), None))
        .unwrap();
    let (engine, transport, store) = engine_over(RejectingStore::new(inner, "r1", 1));
    transport.put_server_record(server_report("r1", "14 Main St", at(10, 5)));
    transport.put_server_record(server_report("r2", "7 Oak Ave", at(10, 2)));

    let report = engine.full_sync().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.pulled, 1);
    assert_eq!(report.pushed, 1);
    let r1 = record(&store, "r1");
    assert_eq!(r1.sync_status, SyncStatus::Error);
    assert!(r1.last_error.as_deref().unwrap().contains("disk full"));
    assert_eq!(r1.fields.get("address"), Some(&json!("12 Main St")));
    assert_eq!(record(&store, "r2").sync_status, SyncStatus::Clean);
    assert_eq!(record(&store, "r3").sync_status, SyncStatus::Clean);
    assert!(engine.last_sync_at().is_none());
    assert!(store.get_metadata(LAST_SYNC_AT).unwrap().is_none());

    // The same window is pulled again and the divergence is detected.
    let report = engine.full_sync().await.unwrap();

    assert_eq!(report.failed, 0);
    assert_eq!(report.conflicts, 1);
    let r1 = record(&store, "r1");
    assert_eq!(r1.sync_status, SyncStatus::Conflict);
    assert_eq!(r1.conflict.unwrap().server.field("address"), Some(&json!("14 Main St")));
    assert!(engine.last_sync_at().is_some());
}

#[tokio::test]
async fn failed_insert_is_fetched_again() {
    let (engine, transport, store) =
        engine_over(RejectingStore::new(MemoryStore::in_memory(), "r2", 1));
    transport.put_server_record(server_report("r1", "12 Main St", at(10, 0)));
    transport.put_server_record(server_report("r2", "7 Oak Ave", at(10, 2)));

    let report = engine.full_sync().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.pulled, 1);
    assert!(store.get_record(&RecordId::new("r2")).unwrap().is_none());
    assert!(engine.last_sync_at().is_none());

    engine.full_sync().await.unwrap();

    let r2 = record(&store, "r2");
    assert_eq!(r2.sync_status, SyncStatus::Clean);
    assert_eq!(r2.fields.get("address"), Some(&json!("7 Oak Ave")));
    assert!(engine.last_sync_at().is_some());
}
