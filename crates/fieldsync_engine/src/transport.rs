//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use fieldsync_protocol::{
    content_hash, now_millis, AttachmentId, ChangesRequest, ChangesResponse, PushRecordRequest,
    PushRecordResponse, RecordId, RecordSnapshot, ServerId, Timestamp, UploadRequest,
    UploadResponse,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// A sync transport handles network communication with the sync server.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, mock for testing, etc.). Implementations report
/// version and validation refusals as [`SyncError::ServerRejection`] and
/// credential refusals as [`SyncError::AuthenticationFailed`].
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches records changed since the request cursor.
    async fn changes_since(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse>;

    /// Creates or updates one record, subject to its precondition.
    async fn push_record(&self, request: &PushRecordRequest) -> SyncResult<PushRecordResponse>;

    /// Uploads one attachment binary.
    async fn upload_attachment(&self, request: &UploadRequest) -> SyncResult<UploadResponse>;
}

#[derive(Debug, Default)]
struct MockServer {
    records: BTreeMap<RecordId, RecordSnapshot>,
    attachments: BTreeMap<AttachmentId, Vec<u8>>,
    clock: Timestamp,
    next_server_id: u64,
    writes: HashMap<RecordId, u32>,
    push_log: Vec<PushRecordRequest>,
    validation_failures: HashSet<RecordId>,
}

impl MockServer {
    fn tick(&mut self) -> Timestamp {
        self.clock = (self.clock + 1).max(now_millis());
        self.clock
    }
}

/// An in-memory sync server for testing.
///
/// Records are versioned by a server clock; a push whose precondition does
/// not match the stored version is refused with a version conflict carrying
/// the current snapshot. Failures, latency and integrity faults can be
/// injected, and every request is counted.
#[derive(Debug, Default)]
pub struct MockTransport {
    server: Mutex<MockServer>,
    connected: AtomicBool,
    reject_auth: AtomicBool,
    fail_changes: AtomicBool,
    fail_next_pushes: AtomicU32,
    fail_next_uploads: AtomicU32,
    corrupt_upload_hash: AtomicBool,
    latency: Mutex<Duration>,
    changes_calls: AtomicU32,
    in_flight: Mutex<HashSet<String>>,
    duplicate_in_flight: AtomicBool,
    uploads_in_flight: AtomicUsize,
    max_uploads_in_flight: AtomicUsize,
}

struct InFlight<'a> {
    transport: &'a MockTransport,
    key: String,
    upload: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.lock().remove(&self.key);
        if self.upload {
            self.transport.uploads_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl MockTransport {
    /// Creates a new, empty, connected mock server.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Stores a snapshot as-is, advancing the server clock past it.
    pub fn put_server_record(&self, snapshot: RecordSnapshot) {
        let mut server = self.server.lock();
        server.clock = server.clock.max(snapshot.updated_at);
        server.records.insert(snapshot.id.clone(), snapshot);
    }

    /// Applies a server-side edit, stamping a new version.
    pub fn edit_server_record<F>(&self, id: &RecordId, edit: F) -> Option<RecordSnapshot>
    where
        F: FnOnce(&mut RecordSnapshot),
    {
        let mut server = self.server.lock();
        let stamp = server.tick();
        let snapshot = server.records.get_mut(id)?;
        edit(snapshot);
        snapshot.updated_at = stamp;
        Some(snapshot.clone())
    }

    /// Returns the stored snapshot of a record.
    pub fn server_record(&self, id: &RecordId) -> Option<RecordSnapshot> {
        self.server.lock().records.get(id).cloned()
    }

    /// Returns the stored bytes of an attachment.
    pub fn uploaded(&self, id: &AttachmentId) -> Option<Vec<u8>> {
        self.server.lock().attachments.get(id).cloned()
    }

    /// Number of accepted writes for one record.
    pub fn write_count(&self, id: &RecordId) -> u32 {
        self.server.lock().writes.get(id).copied().unwrap_or(0)
    }

    /// Number of accepted record writes in total.
    pub fn total_writes(&self) -> u32 {
        self.server.lock().writes.values().sum()
    }

    /// Every push request received, accepted or not.
    pub fn push_log(&self) -> Vec<PushRecordRequest> {
        self.server.lock().push_log.clone()
    }

    /// Number of changes-since requests received.
    pub fn changes_calls(&self) -> u32 {
        self.changes_calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent uploads observed.
    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_uploads_in_flight.load(Ordering::SeqCst)
    }

    /// Returns true if two requests for the same id were ever in flight at once.
    pub fn saw_duplicate_in_flight(&self) -> bool {
        self.duplicate_in_flight.load(Ordering::SeqCst)
    }

    /// Current server clock.
    pub fn server_time(&self) -> Timestamp {
        self.server.lock().clock
    }

    /// Sets the connected state. Requests fail with a retryable error while disconnected.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes every request fail authentication.
    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Makes changes-since requests fail with a retryable error.
    pub fn set_fail_changes(&self, fail: bool) {
        self.fail_changes.store(fail, Ordering::SeqCst);
    }

    /// Fails the next `count` record pushes with a retryable error.
    pub fn fail_next_pushes(&self, count: u32) {
        self.fail_next_pushes.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` uploads with a retryable error.
    pub fn fail_next_uploads(&self, count: u32) {
        self.fail_next_uploads.store(count, Ordering::SeqCst);
    }

    /// Makes uploads report a digest that does not match the content.
    pub fn set_corrupt_upload_hash(&self, corrupt: bool) {
        self.corrupt_upload_hash.store(corrupt, Ordering::SeqCst);
    }

    /// Refuses pushes of one record with a validation error.
    pub fn reject_validation(&self, id: impl Into<RecordId>) {
        self.server.lock().validation_failures.insert(id.into());
    }

    /// Delays every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    fn check_access(&self) -> SyncResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("connection refused"));
        }
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(SyncError::AuthenticationFailed("token expired".into()));
        }
        Ok(())
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn enter(&self, key: String, upload: bool) -> InFlight<'_> {
        if !self.in_flight.lock().insert(key.clone()) {
            self.duplicate_in_flight.store(true, Ordering::SeqCst);
        }
        if upload {
            let now = self.uploads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_uploads_in_flight.fetch_max(now, Ordering::SeqCst);
        }
        InFlight {
            transport: self,
            key,
            upload,
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn changes_since(&self, request: &ChangesRequest) -> SyncResult<ChangesResponse> {
        self.changes_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.check_access()?;
        if self.fail_changes.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("injected changes failure"));
        }

        let server = self.server.lock();
        let mut records: Vec<RecordSnapshot> = server
            .records
            .values()
            .filter(|r| request.since.map_or(true, |since| r.updated_at > since))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(ChangesResponse::new(records, server.clock))
    }

    async fn push_record(&self, request: &PushRecordRequest) -> SyncResult<PushRecordResponse> {
        let _guard = self.enter(format!("record:{}", request.record.id), false);
        self.simulate_latency().await;
        self.check_access()?;

        let mut server = self.server.lock();
        server.push_log.push(request.clone());

        if Self::take_failure(&self.fail_next_pushes) {
            return Err(SyncError::transport_retryable("injected push failure"));
        }
        let id = request.record.id.clone();
        if server.validation_failures.contains(&id) {
            return Err(SyncError::validation("record failed server validation"));
        }

        let existing = server.records.get(&id).cloned();
        if let Some(current) = &existing {
            if request.base_updated_at != Some(current.updated_at) {
                return Err(SyncError::version_conflict(
                    "record was modified on the server",
                    Some(current.clone()),
                ));
            }
        }

        let server_id = match existing.and_then(|r| r.server_id) {
            Some(server_id) => server_id,
            None => {
                server.next_server_id += 1;
                ServerId::new(format!("srv-{}", server.next_server_id))
            }
        };
        let updated_at = server.tick();

        let mut stored = request.record.clone();
        stored.server_id = Some(server_id.clone());
        stored.updated_at = updated_at;
        server.records.insert(id.clone(), stored);
        *server.writes.entry(id).or_insert(0) += 1;

        Ok(PushRecordResponse {
            id: server_id,
            updated_at,
        })
    }

    async fn upload_attachment(&self, request: &UploadRequest) -> SyncResult<UploadResponse> {
        let _guard = self.enter(format!("attachment:{}", request.attachment_id), true);
        self.simulate_latency().await;
        self.check_access()?;

        if Self::take_failure(&self.fail_next_uploads) {
            return Err(SyncError::transport_retryable("injected upload failure"));
        }

        let mut hash = content_hash(&request.content);
        if self.corrupt_upload_hash.load(Ordering::SeqCst) {
            let mut damaged = request.content.clone();
            damaged.push(0);
            hash = content_hash(&damaged);
        }

        self.server
            .lock()
            .attachments
            .insert(request.attachment_id.clone(), request.content.clone());

        Ok(UploadResponse {
            url: format!("mock://attachments/{}", request.attachment_id),
            hash,
        })
    }
}
