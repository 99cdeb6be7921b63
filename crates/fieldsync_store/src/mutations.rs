//! Local edits made by the capture UI.
//!
//! Every edit stamps `local_updated_at` and the per-field timestamps of the
//! fields it touched, then queues the record for push. Stamps are strictly
//! increasing per record even if the device clock steps backwards.

use crate::error::{StoreError, StoreResult};
use crate::model::{Attachment, AttachmentStatus, StoredRecord, SyncStatus};
use crate::store::LocalStore;
use fieldsync_protocol::{
    now_millis, AttachmentId, ContentHasher, Fields, RecordId, Timestamp,
};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Edit operations available on every [`LocalStore`].
pub trait LocalMutations {
    /// Creates a record with a generated id.
    fn create_record(&self, fields: Fields) -> StoreResult<StoredRecord>;

    /// Creates a record with a caller-chosen id.
    fn create_record_with_id(&self, id: RecordId, fields: Fields) -> StoreResult<StoredRecord>;

    /// Applies field changes to a record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidState` if the record is in conflict or
    /// deleted.
    fn update_fields(&self, id: &RecordId, changes: Fields) -> StoreResult<StoredRecord>;

    /// Marks a record deleted (tombstone).
    fn delete_record(&self, id: &RecordId) -> StoreResult<StoredRecord>;

    /// Registers a photo stored at `local_ref` for upload.
    fn capture_attachment(
        &self,
        record_id: &RecordId,
        local_ref: &Path,
        content_type: &str,
    ) -> StoreResult<Attachment>;
}

fn edit_stamp(previous: Timestamp) -> Timestamp {
    now_millis().max(previous + 1)
}

fn ensure_editable(record: &StoredRecord) -> StoreResult<()> {
    if record.sync_status == SyncStatus::Conflict {
        return Err(StoreError::invalid_state(
            &record.id,
            "record is in conflict; resolve it before editing",
        ));
    }
    if record.deleted {
        return Err(StoreError::invalid_state(&record.id, "record is deleted"));
    }
    Ok(())
}

fn hash_file(path: &Path) -> StoreResult<(fieldsync_protocol::ContentHash, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = ContentHasher::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

impl<S: LocalStore + ?Sized> LocalMutations for S {
    fn create_record(&self, fields: Fields) -> StoreResult<StoredRecord> {
        self.create_record_with_id(RecordId::generate(), fields)
    }

    fn create_record_with_id(&self, id: RecordId, fields: Fields) -> StoreResult<StoredRecord> {
        if self.get_record(&id)?.is_some() {
            return Err(StoreError::invalid_state(&id, "record already exists"));
        }
        let record = StoredRecord::new_local(id, fields, now_millis());
        self.put_record(record.clone())?;
        tracing::debug!(record_id = %record.id, "record created");
        Ok(record)
    }

    fn update_fields(&self, id: &RecordId, changes: Fields) -> StoreResult<StoredRecord> {
        let current = self
            .get_record(id)?
            .ok_or_else(|| StoreError::RecordNotFound(id.clone()))?;
        ensure_editable(&current)?;
        if changes
            .iter()
            .all(|(name, value)| current.fields.get(name) == Some(value))
        {
            return Ok(current);
        }

        self.modify_record(id, &mut |record: &mut StoredRecord| {
            ensure_editable(record)?;
            let stamp = edit_stamp(record.local_updated_at);
            for (name, value) in &changes {
                if record.fields.get(name) != Some(value) {
                    record.fields.insert(name.clone(), value.clone());
                    record.field_updated_at.insert(name.clone(), stamp);
                }
            }
            record.local_updated_at = stamp;
            record.mark_pending();
            Ok(())
        })
    }

    fn delete_record(&self, id: &RecordId) -> StoreResult<StoredRecord> {
        self.modify_record(id, &mut |record: &mut StoredRecord| {
            if record.sync_status == SyncStatus::Conflict {
                return Err(StoreError::invalid_state(
                    &record.id,
                    "record is in conflict; resolve it before deleting",
                ));
            }
            if record.deleted {
                return Ok(());
            }
            record.deleted = true;
            record.local_updated_at = edit_stamp(record.local_updated_at);
            record.mark_pending();
            Ok(())
        })
    }

    fn capture_attachment(
        &self,
        record_id: &RecordId,
        local_ref: &Path,
        content_type: &str,
    ) -> StoreResult<Attachment> {
        if self.get_record(record_id)?.is_none() {
            return Err(StoreError::RecordNotFound(record_id.clone()));
        }
        let (content_hash, size_bytes) = hash_file(local_ref)?;
        let attachment = Attachment {
            id: AttachmentId::generate(),
            record_id: record_id.clone(),
            local_ref: local_ref.to_path_buf(),
            content_type: content_type.to_string(),
            content_hash,
            size_bytes,
            remote_url: None,
            sync_status: AttachmentStatus::PendingUpload,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: now_millis(),
        };
        self.put_attachment(attachment.clone())?;
        tracing::debug!(
            attachment_id = %attachment.id,
            record_id = %record_id,
            size = size_bytes,
            "attachment captured"
        );
        Ok(attachment)
    }
}
