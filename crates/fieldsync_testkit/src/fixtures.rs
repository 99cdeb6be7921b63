//! Test fixtures and engine helpers.
//!
//! Provides a ready-wired engine over a memory store and a mock server,
//! plus builders for the inspection reports the scenarios revolve around.

use chrono::{TimeZone, Utc};
use fieldsync_engine::{
    EventKind, MockTransport, RetryConfig, Subscription, SyncConfig, SyncEngine, SyncEvent,
};
use fieldsync_protocol::{Fields, RecordId, RecordSnapshot, Timestamp};
use fieldsync_store::{Attachment, LocalMutations, LocalStore, MemoryStore, StoredRecord};
use parking_lot::Mutex;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// User id used by every fixture.
pub const TEST_USER: &str = "inspector-7";

/// Engine type used by [`TestEnv`].
pub type TestEngine = SyncEngine<MockTransport, MemoryStore>;

/// Unix milliseconds for `hour:minute` UTC on a fixed inspection day.
pub fn at(hour: u32, minute: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 5, 14, hour, minute, 0)
        .single()
        .expect("valid fixture time")
        .timestamp_millis()
}

/// Configuration with fast, deterministic retries.
pub fn test_config() -> SyncConfig {
    SyncConfig::new(TEST_USER)
        .with_retry(RetryConfig::immediate(3))
        .with_request_timeout(Duration::from_secs(5))
}

/// Fields of a minimal inspection report.
pub fn report_fields(address: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("address".into(), json!(address));
    fields
}

/// A server-side inspection report.
pub fn server_report(id: &str, address: &str, updated_at: Timestamp) -> RecordSnapshot {
    RecordSnapshot::new(id, Fields::new(), updated_at)
        .with_server_id(format!("srv-{id}"))
        .with_field("address", json!(address), updated_at)
}

/// A report edited on the device at `edited_at`, based on server version
/// `base` (if any), pending push.
pub fn pending_report(
    id: &str,
    address: &str,
    edited_at: Timestamp,
    base: Option<Timestamp>,
) -> StoredRecord {
    let mut record = StoredRecord::new_local(RecordId::new(id), report_fields(address), edited_at);
    record.server_updated_at = base;
    if base.is_some() {
        record.server_id = Some(format!("srv-{id}").into());
    }
    record
}

/// Collects every event emitted by an engine.
pub struct EventLog {
    events: Arc<Mutex<Vec<SyncEvent>>>,
    _subscription: Subscription,
}

impl EventLog {
    /// Starts recording the engine's events.
    pub fn attach(engine: &TestEngine) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = engine.subscribe(move |event| sink.lock().push(event.clone()));
        Self {
            events,
            _subscription: subscription,
        }
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Kinds of the events recorded so far.
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(SyncEvent::kind).collect()
    }

    /// Number of recorded events of `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Progress values of the recorded `sync:progress` events.
    pub fn progress(&self) -> Vec<f32> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SyncEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

/// A memory store, a mock server and an engine wired together.
pub struct TestEnv {
    /// The local store.
    pub store: Arc<MemoryStore>,
    /// The mock server.
    pub transport: Arc<MockTransport>,
    /// The engine under test.
    pub engine: TestEngine,
    config: SyncConfig,
    photos: TempDir,
}

impl TestEnv {
    /// Creates an environment with [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates an environment with a custom configuration.
    pub fn with_config(config: SyncConfig) -> Self {
        let store = Arc::new(MemoryStore::in_memory());
        let transport = Arc::new(MockTransport::new());
        let engine = SyncEngine::new(config.clone(), Arc::clone(&transport), Arc::clone(&store))
            .expect("Failed to create engine");
        Self {
            store,
            transport,
            engine,
            config,
            photos: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Replaces the engine with a fresh one over the same store and server,
    /// as after an app restart.
    pub fn restart(&mut self) {
        self.engine = SyncEngine::new(
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.store),
        )
        .expect("Failed to restart engine");
    }

    /// Starts recording engine events.
    pub fn event_log(&self) -> EventLog {
        EventLog::attach(&self.engine)
    }

    /// Creates a new pending report on the device.
    pub fn create_report(&self, address: &str) -> StoredRecord {
        self.store
            .create_record(report_fields(address))
            .expect("Failed to create report")
    }

    /// Stores a record as-is.
    pub fn put(&self, record: StoredRecord) {
        self.store.put_record(record).expect("Failed to store record");
    }

    /// Reads a record that must exist.
    pub fn record(&self, id: &str) -> StoredRecord {
        self.store
            .get_record(&RecordId::new(id))
            .expect("Failed to read record")
            .expect("record should exist")
    }

    /// Reads an attachment that must exist.
    pub fn attachment(&self, attachment: &Attachment) -> Attachment {
        self.store
            .get_attachment(&attachment.id)
            .expect("Failed to read attachment")
            .expect("attachment should exist")
    }

    /// Writes a photo file into the environment's temp directory.
    pub fn photo_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.photos.path().join(name);
        std::fs::write(&path, bytes).expect("Failed to write photo");
        path
    }

    /// Writes a photo and captures it for `record_id`.
    pub fn capture_photo(&self, record_id: &RecordId, name: &str, bytes: &[u8]) -> Attachment {
        let path = self.photo_file(name, bytes);
        self.store
            .capture_attachment(record_id, &path, "image/jpeg")
            .expect("Failed to capture photo")
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
