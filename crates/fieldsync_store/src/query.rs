//! Lazy, restartable status queries.

use crate::error::StoreResult;
use crate::model::{Attachment, AttachmentStatus, StoredRecord, SyncStatus};
use crate::store::LocalStore;
use fieldsync_protocol::{AttachmentId, RecordId};
use std::collections::VecDeque;

const DEFAULT_PAGE_SIZE: usize = 64;

/// An entity reachable through a status index.
pub trait Indexed: Sized {
    /// Identifier type.
    type Id: Clone;
    /// Status type.
    type Status: Copy + PartialEq;

    /// Reads one page of ids with `status` after `after`.
    fn page<S: LocalStore>(
        store: &S,
        status: Self::Status,
        after: Option<&Self::Id>,
        limit: usize,
    ) -> StoreResult<Vec<Self::Id>>;

    /// Reads one entity.
    fn fetch<S: LocalStore>(store: &S, id: &Self::Id) -> StoreResult<Option<Self>>;

    /// Current status.
    fn status(&self) -> Self::Status;
}

impl Indexed for StoredRecord {
    type Id = RecordId;
    type Status = SyncStatus;

    fn page<S: LocalStore>(
        store: &S,
        status: SyncStatus,
        after: Option<&RecordId>,
        limit: usize,
    ) -> StoreResult<Vec<RecordId>> {
        store.record_ids_with_status(status, after, limit)
    }

    fn fetch<S: LocalStore>(store: &S, id: &RecordId) -> StoreResult<Option<Self>> {
        store.get_record(id)
    }

    fn status(&self) -> SyncStatus {
        self.sync_status
    }
}

impl Indexed for Attachment {
    type Id = AttachmentId;
    type Status = AttachmentStatus;

    fn page<S: LocalStore>(
        store: &S,
        status: AttachmentStatus,
        after: Option<&AttachmentId>,
        limit: usize,
    ) -> StoreResult<Vec<AttachmentId>> {
        store.attachment_ids_with_status(status, after, limit)
    }

    fn fetch<S: LocalStore>(store: &S, id: &AttachmentId) -> StoreResult<Option<Self>> {
        store.get_attachment(id)
    }

    fn status(&self) -> AttachmentStatus {
        self.sync_status
    }
}

/// Iterator over entities with one status, ordered by id.
///
/// Pages are read lazily from the status index. An entity that left the
/// status between the page read and the fetch is skipped. After an error
/// the iterator yields it once and then stops; [`restart`](Self::restart)
/// rewinds to the first id.
pub struct StatusQuery<'a, S: LocalStore, T: Indexed> {
    store: &'a S,
    status: T::Status,
    page_size: usize,
    cursor: Option<T::Id>,
    buffer: VecDeque<T::Id>,
    exhausted: bool,
}

impl<'a, S: LocalStore, T: Indexed> StatusQuery<'a, S, T> {
    /// Creates a query over `status`.
    pub fn new(store: &'a S, status: T::Status) -> Self {
        Self {
            store,
            status,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Sets the page size (minimum 1).
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Rewinds to the first id.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> StoreResult<()> {
        let ids = T::page(self.store, self.status, self.cursor.as_ref(), self.page_size)?;
        if ids.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = ids.last() {
            self.cursor = Some(last.clone());
        }
        self.buffer.extend(ids);
        Ok(())
    }
}

impl<S: LocalStore, T: Indexed> Iterator for StatusQuery<'_, S, T> {
    type Item = StoreResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.buffer.is_empty() {
                if self.exhausted {
                    return None;
                }
                if let Err(err) = self.fill() {
                    self.exhausted = true;
                    return Some(Err(err));
                }
                continue;
            }

            let id = self.buffer.pop_front()?;
            match T::fetch(self.store, &id) {
                Ok(Some(entity)) if entity.status() == self.status => return Some(Ok(entity)),
                Ok(_) => continue,
                Err(err) => {
                    self.buffer.clear();
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
    }
}
