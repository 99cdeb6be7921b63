//! # FieldSync Store
//!
//! Local persistence for the FieldSync engine.
//!
//! This crate provides:
//! - The [`LocalStore`] contract the engine runs against
//! - The data model: records, attachments, conflict payloads, audit entries
//! - A [`ChangeFeed`] of committed status transitions and live [`StatusCounts`]
//! - [`MemoryStore`] and [`FileStore`] reference stores
//! - [`LocalMutations`], the edit operations used by the capture UI
//! - [`recover_interrupted`], the crash repair run before every engine start
//!
//! ## Example
//!
//! ```rust
//! use fieldsync_store::{LocalMutations, LocalStore, MemoryStore, SyncStatus};
//! use fieldsync_protocol::Fields;
//!
//! let store = MemoryStore::in_memory();
//! let record = store.create_record(Fields::new()).unwrap();
//! assert_eq!(record.sync_status, SyncStatus::Pending);
//! assert_eq!(store.status_counts().pending, 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod feed;
mod model;
mod mutations;
mod query;
mod recovery;
mod store;
mod tables;

pub use backend::{FileBackend, MemoryBackend, StoreBackend};
pub use error::{StoreError, StoreResult};
pub use feed::{ChangeFeed, StoreEvent};
pub use model::{
    Attachment, AttachmentStatus, AuditEntry, ConflictPayload, ResolutionPolicy, StatusCounts,
    StoredRecord, SyncStatus, LAST_SYNC_AT,
};
pub use mutations::LocalMutations;
pub use query::{Indexed, StatusQuery};
pub use recovery::{recover_interrupted, RecoveryReport};
pub use store::{FileStore, LocalStore, MemoryStore, Store};
