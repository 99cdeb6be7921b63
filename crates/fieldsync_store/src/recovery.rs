//! Repair of transfers interrupted by a crash.

use crate::error::StoreResult;
use crate::model::{Attachment, AttachmentStatus, StoredRecord, SyncStatus};
use crate::store::LocalStore;

const RECOVERY_BATCH: usize = 256;

/// What recovery repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records moved from `syncing` back to `pending`.
    pub records: usize,
    /// Attachments moved from `uploading` back to `pending_upload`.
    pub attachments: usize,
}

impl RecoveryReport {
    /// Returns true if nothing needed repair.
    pub fn is_empty(&self) -> bool {
        self.records == 0 && self.attachments == 0
    }
}

/// Requeues records and attachments left in flight by an interrupted pass.
///
/// A record in `syncing` has no response persisted, so the push is assumed
/// lost and repeated. Retry counters are left unchanged.
pub fn recover_interrupted<S: LocalStore + ?Sized>(store: &S) -> StoreResult<RecoveryReport> {
    let mut report = RecoveryReport::default();

    loop {
        let ids = store.record_ids_with_status(SyncStatus::Syncing, None, RECOVERY_BATCH)?;
        if ids.is_empty() {
            break;
        }
        for id in ids {
            store.modify_record(&id, &mut |record: &mut StoredRecord| {
                record.sync_status = SyncStatus::Pending;
                Ok(())
            })?;
            report.records += 1;
        }
    }

    loop {
        let ids =
            store.attachment_ids_with_status(AttachmentStatus::Uploading, None, RECOVERY_BATCH)?;
        if ids.is_empty() {
            break;
        }
        for id in ids {
            store.modify_attachment(&id, &mut |attachment: &mut Attachment| {
                attachment.sync_status = AttachmentStatus::PendingUpload;
                Ok(())
            })?;
            report.attachments += 1;
        }
    }

    if !report.is_empty() {
        tracing::info!(
            records = report.records,
            attachments = report.attachments,
            "recovered interrupted transfers"
        );
    }
    Ok(report)
}
