//! In-memory table set and its persisted image.

use crate::error::{StoreError, StoreResult};
use crate::model::{
    Attachment, AttachmentStatus, AuditEntry, StatusCounts, StoredRecord, SyncStatus,
};
use fieldsync_protocol::{AttachmentId, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

/// Current image format version.
const FORMAT_VERSION: u16 = 1;

/// All persisted tables.
///
/// `records` and `attachments` are written through [`Tables::insert_record`]
/// and [`Tables::insert_attachment`] so the secondary indexes stay in step.
/// The indexes are not persisted; they are rebuilt on decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct Tables {
    #[serde(default)]
    pub format_version: u16,
    #[serde(default)]
    pub records: BTreeMap<RecordId, StoredRecord>,
    #[serde(default)]
    pub attachments: BTreeMap<AttachmentId, Attachment>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
    #[serde(skip)]
    records_by_status: HashMap<SyncStatus, BTreeSet<RecordId>>,
    #[serde(skip)]
    attachments_by_status: HashMap<AttachmentStatus, BTreeSet<AttachmentId>>,
    #[serde(skip)]
    attachments_by_owner: HashMap<RecordId, BTreeSet<AttachmentId>>,
}

impl Tables {
    pub fn new() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            ..Self::default()
        }
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| StoreError::serialization(e.to_string()))?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let mut tables: Tables = ciborium::from_reader(bytes)
            .map_err(|e| StoreError::serialization(format!("corrupted table image: {e}")))?;
        if tables.format_version > FORMAT_VERSION {
            return Err(StoreError::serialization(format!(
                "unsupported table format version {}",
                tables.format_version
            )));
        }
        tables.reindex();
        Ok(tables)
    }

    fn reindex(&mut self) {
        self.records_by_status.clear();
        self.attachments_by_status.clear();
        self.attachments_by_owner.clear();
        for (id, record) in &self.records {
            self.records_by_status
                .entry(record.sync_status)
                .or_default()
                .insert(id.clone());
        }
        for (id, attachment) in &self.attachments {
            self.attachments_by_status
                .entry(attachment.sync_status)
                .or_default()
                .insert(id.clone());
            self.attachments_by_owner
                .entry(attachment.record_id.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    /// Inserts or replaces a record. Returns the previous status.
    pub fn insert_record(&mut self, record: StoredRecord) -> Option<SyncStatus> {
        let id = record.id.clone();
        let status = record.sync_status;
        let previous = self.records.insert(id.clone(), record).map(|r| r.sync_status);
        if let Some(from) = previous {
            unindex(&mut self.records_by_status, &from, &id);
        }
        self.records_by_status.entry(status).or_default().insert(id);
        previous
    }

    /// Inserts or replaces an attachment. Returns the previous status.
    pub fn insert_attachment(&mut self, attachment: Attachment) -> Option<AttachmentStatus> {
        let id = attachment.id.clone();
        let status = attachment.sync_status;
        let owner = attachment.record_id.clone();
        let previous = self.attachments.insert(id.clone(), attachment);
        if let Some(old) = &previous {
            unindex(&mut self.attachments_by_status, &old.sync_status, &id);
            unindex(&mut self.attachments_by_owner, &old.record_id, &id);
        }
        self.attachments_by_status.entry(status).or_default().insert(id.clone());
        self.attachments_by_owner.entry(owner).or_default().insert(id);
        previous.map(|a| a.sync_status)
    }

    /// Up to `limit` record ids with `status`, ordered by id, after `after`.
    pub fn record_ids_with_status(
        &self,
        status: SyncStatus,
        after: Option<&RecordId>,
        limit: usize,
    ) -> Vec<RecordId> {
        page(self.records_by_status.get(&status), after, limit)
    }

    /// Up to `limit` attachment ids with `status`, ordered by id, after `after`.
    pub fn attachment_ids_with_status(
        &self,
        status: AttachmentStatus,
        after: Option<&AttachmentId>,
        limit: usize,
    ) -> Vec<AttachmentId> {
        page(self.attachments_by_status.get(&status), after, limit)
    }

    /// Attachments owned by `record_id`, ordered by id.
    pub fn attachments_of(&self, record_id: &RecordId) -> Vec<Attachment> {
        self.attachments_by_owner
            .get(record_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.attachments.get(id).cloned())
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for record in self.records.values() {
            counts.apply_record(None, record.sync_status);
        }
        for attachment in self.attachments.values() {
            counts.apply_attachment(None, attachment.sync_status);
        }
        counts
    }
}

fn unindex<K, V>(index: &mut HashMap<K, BTreeSet<V>>, key: &K, id: &V)
where
    K: std::hash::Hash + Eq,
    V: Ord,
{
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

fn page<K: Ord + Clone>(ids: Option<&BTreeSet<K>>, after: Option<&K>, limit: usize) -> Vec<K> {
    let Some(ids) = ids else {
        return Vec::new();
    };
    let lower = match after {
        Some(key) => Bound::Excluded(key),
        None => Bound::Unbounded,
    };
    ids.range((lower, Bound::Unbounded))
        .take(limit)
        .cloned()
        .collect()
}

/// Checks the conflict invariant: status `conflict` iff a payload is retained.
pub(crate) fn check_record(record: &StoredRecord) -> StoreResult<()> {
    let in_conflict = record.sync_status == SyncStatus::Conflict;
    match (in_conflict, record.conflict.is_some()) {
        (true, false) => Err(StoreError::invalid_state(
            &record.id,
            "conflict status without retained snapshots",
        )),
        (false, true) => Err(StoreError::invalid_state(
            &record.id,
            "retained conflict snapshots on a non-conflicted record",
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::{Fields, RecordSnapshot};

    #[test]
    fn image_roundtrip() {
        let mut tables = Tables::new();
        let record = StoredRecord::new_local(RecordId::new("r1"), Fields::new(), 10);
        tables.insert_record(record);
        tables.metadata.insert("last_sync_at".into(), "10".into());

        let decoded = Tables::decode(&tables.encode().unwrap()).unwrap();
        assert_eq!(decoded, tables);
        assert_eq!(decoded.counts().pending, 1);
    }

    fn record(id: &str, status: SyncStatus) -> StoredRecord {
        let mut record = StoredRecord::new_local(RecordId::new(id), Fields::new(), 10);
        record.sync_status = status;
        record
    }

    #[test]
    fn status_index_follows_transitions() {
        let mut tables = Tables::new();
        for id in ["r3", "r1", "r2"] {
            tables.insert_record(record(id, SyncStatus::Pending));
        }
        assert_eq!(
            tables.insert_record(record("r2", SyncStatus::Clean)),
            Some(SyncStatus::Pending)
        );

        let pending = tables.record_ids_with_status(SyncStatus::Pending, None, 10);
        assert_eq!(pending, vec![RecordId::new("r1"), RecordId::new("r3")]);
        let after = tables.record_ids_with_status(SyncStatus::Pending, Some(&RecordId::new("r1")), 10);
        assert_eq!(after, vec![RecordId::new("r3")]);
        assert_eq!(
            tables.record_ids_with_status(SyncStatus::Clean, None, 10),
            vec![RecordId::new("r2")]
        );
        assert!(tables.record_ids_with_status(SyncStatus::Error, None, 10).is_empty());
    }

    #[test]
    fn indexes_are_rebuilt_on_decode() {
        let mut tables = Tables::new();
        tables.insert_record(record("r1", SyncStatus::Conflict));
        tables.insert_record(record("r2", SyncStatus::Pending));

        let decoded = Tables::decode(&tables.encode().unwrap()).unwrap();

        assert_eq!(
            decoded.record_ids_with_status(SyncStatus::Pending, None, 10),
            vec![RecordId::new("r2")]
        );
        assert_eq!(decoded, tables);
    }

    #[test]
    fn garbage_image_is_rejected() {
        assert!(matches!(
            Tables::decode(b"\xff\xff"),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn conflict_invariant() {
        let mut record = StoredRecord::new_local(RecordId::new("r1"), Fields::new(), 10);
        assert!(check_record(&record).is_ok());

        record.sync_status = SyncStatus::Conflict;
        assert!(check_record(&record).is_err());

        record.enter_conflict(RecordSnapshot::new("r1", Fields::new(), 20), 30);
        assert!(check_record(&record).is_ok());
    }
}
