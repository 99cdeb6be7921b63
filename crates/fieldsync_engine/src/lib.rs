//! # FieldSync Engine
//!
//! Offline-first synchronization for field data capture.
//!
//! This crate provides:
//! - The sync engine (idle → syncing → idle | error) with pass coalescing
//!   and cooperative cancellation
//! - Conflict detection on pull and policy-driven resolution
//!   (keep local, keep server, field-level merge) with an audit trail
//! - A bounded-concurrency attachment upload pipeline with digest verification
//! - Retry with exponential backoff per record and per attachment
//! - A network monitor that turns stable reconnects into sync triggers
//! - A typed event bus for UI consumers
//! - Transport abstraction with an HTTP/CBOR implementation and an in-memory mock
//!
//! ## Architecture
//!
//! Each pass follows a **pull-then-push** model:
//! 1. Pull server changes since the last successful pass
//! 2. Apply them locally, flagging diverged pending records as conflicts
//! 3. Push pending records while uploading pending attachments
//!
//! ## Key Invariants
//!
//! - At most one pass runs at a time
//! - At most one request is in flight per record or attachment
//! - A conflict is only ever cleared by an explicit resolution
//! - Statuses change only after the server response is committed locally
//! - The sync cursor advances only after a fully successful pass
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use fieldsync_engine::{MockTransport, SyncConfig, SyncEngine};
//! use fieldsync_store::{LocalMutations, LocalStore, MemoryStore, SyncStatus};
//! use fieldsync_protocol::Fields;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::in_memory());
//! let transport = Arc::new(MockTransport::new());
//! let engine = SyncEngine::new(SyncConfig::new("inspector-7"), transport, Arc::clone(&store))
//!     .unwrap();
//!
//! let record = store.create_record(Fields::new()).unwrap();
//! let report = engine.full_sync().await.unwrap();
//!
//! assert_eq!(report.pushed, 1);
//! let record = store.get_record(&record.id).unwrap().unwrap();
//! assert_eq!(record.sync_status, SyncStatus::Clean);
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod events;
mod http;
mod network;
mod resolver;
mod transport;
mod upload;

pub use config::{RetryConfig, SyncConfig, MAX_UPLOAD_CONCURRENCY, MIN_UPLOAD_CONCURRENCY};
pub use engine::{requeue_attachment, requeue_record, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use events::{EngineState, EventBus, EventKind, Subscription, SyncEvent, SyncReport};
pub use fieldsync_store::ResolutionPolicy;
pub use http::{HttpClient, HttpResponse, HttpTransport, LoopbackClient, LoopbackServer};
pub use network::{NetworkEvent, NetworkMonitor};
pub use resolver::{
    apply_resolution, resolve, resolve_all, BatchResolution, ConflictResolver, ResolutionOutcome,
    ResolvedRecord, DEFAULT_IDENTITY_FIELD,
};
pub use transport::{MockTransport, SyncTransport};
pub use upload::{UploadPipeline, UploadedAttachment, DEFAULT_CHUNK_SIZE};

/// Engine crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
