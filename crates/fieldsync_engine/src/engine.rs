//! Sync engine.
//!
//! One pass pulls server changes, then pushes pending records while the
//! upload pipeline drains pending attachments. Passes never overlap: a
//! `full_sync` issued while a pass runs joins it and receives its outcome.
//!
//! Record and attachment statuses only flip after the matching network
//! response has been received and committed, so an interrupted pass leaves
//! at most `syncing`/`uploading` entries behind. Those are repaired by
//! [`recover_interrupted`] when the next engine is constructed.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EngineState, EventBus, Subscription, SyncEvent, SyncReport};
use crate::network::{NetworkEvent, NetworkMonitor};
use crate::resolver::{
    apply_resolution, resolve_all, BatchResolution, ConflictResolver, ResolutionOutcome,
};
use crate::transport::SyncTransport;
use crate::upload::UploadPipeline;
use fieldsync_protocol::{
    now_millis, AttachmentId, ChangesRequest, PushRecordRequest, PushRecordResponse, RecordId,
    RecordSnapshot, RejectionKind, Timestamp,
};
use fieldsync_store::{
    recover_interrupted, Attachment, AttachmentStatus, AuditEntry, LocalStore, ResolutionPolicy,
    StoreError, StoredRecord, SyncStatus, LAST_SYNC_AT,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

type PassOutcome = Result<SyncReport, String>;

/// What a pulled snapshot does to the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullAction {
    /// Nothing to do.
    Skip,
    /// Replace local content with the snapshot.
    Overwrite,
    /// Local pending content already matches the server.
    Converge,
    /// Local pending content diverged from a newer server version.
    Conflict,
    /// Replace the retained server side of an existing conflict.
    RefreshConflict,
}

/// Decides how a pulled snapshot applies to the local copy.
pub(crate) fn plan_pull(local: Option<&StoredRecord>, server: &RecordSnapshot) -> PullAction {
    let Some(local) = local else {
        return PullAction::Overwrite;
    };
    let newer = local
        .server_updated_at
        .map_or(true, |seen| server.updated_at > seen);

    match local.sync_status {
        SyncStatus::Clean if newer => PullAction::Overwrite,
        SyncStatus::Clean => PullAction::Skip,
        SyncStatus::Pending | SyncStatus::Error => {
            if local.snapshot().same_content(server) {
                PullAction::Converge
            } else if newer {
                PullAction::Conflict
            } else {
                PullAction::Skip
            }
        }
        SyncStatus::Conflict => match &local.conflict {
            Some(payload) if server.updated_at > payload.server.updated_at => {
                PullAction::RefreshConflict
            }
            _ => PullAction::Skip,
        },
        SyncStatus::Syncing => PullAction::Skip,
    }
}

fn apply_pull(record: &mut StoredRecord, server: &RecordSnapshot, action: PullAction, now: Timestamp) {
    match action {
        PullAction::Skip => {}
        PullAction::Overwrite | PullAction::Converge => record.apply_server_snapshot(server),
        PullAction::Conflict => record.enter_conflict(server.clone(), now),
        PullAction::RefreshConflict => {
            if let Some(payload) = record.conflict.as_mut() {
                payload.server = server.clone();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferOutcome {
    Done,
    Conflict,
    Failed,
    Requeued,
}

/// Per-pass bookkeeping shared by the concurrent push branches.
struct Pass {
    report: Mutex<SyncReport>,
    pull_weight: f32,
    push_total: AtomicUsize,
    push_done: AtomicUsize,
}

impl Pass {
    fn new(pull_weight: f32) -> Self {
        Self {
            report: Mutex::new(SyncReport::default()),
            pull_weight,
            push_total: AtomicUsize::new(0),
            push_done: AtomicUsize::new(0),
        }
    }

    fn record(&self, outcome: TransferOutcome, uploaded: bool) {
        let mut report = self.report.lock();
        match outcome {
            TransferOutcome::Done if uploaded => report.uploaded += 1,
            TransferOutcome::Done => report.pushed += 1,
            TransferOutcome::Conflict => report.conflicts += 1,
            TransferOutcome::Failed => report.failed += 1,
            TransferOutcome::Requeued => {}
        }
    }

    fn pull_progress(&self, done: usize, total: usize) -> f32 {
        if total == 0 {
            return self.pull_weight;
        }
        self.pull_weight * done as f32 / total as f32
    }

    fn push_progress(&self) -> f32 {
        let done = self.push_done.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.push_total.load(Ordering::SeqCst).max(done);
        self.pull_weight + (1.0 - self.pull_weight) * done as f32 / total as f32
    }
}

/// Clears the active-pass slot when a pass ends, however it ends.
struct ActivePass<'a> {
    slot: &'a Mutex<Option<broadcast::Sender<PassOutcome>>>,
    state: &'a RwLock<EngineState>,
}

impl ActivePass<'_> {
    fn finish(self, outcome: PassOutcome) {
        if let Some(tx) = self.slot.lock().take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for ActivePass<'_> {
    fn drop(&mut self) {
        if self.slot.lock().take().is_some() {
            // The pass future was dropped mid-flight
            let mut state = self.state.write();
            if *state == EngineState::Syncing {
                *state = EngineState::Idle;
            }
        }
    }
}

/// Marks an entity as having a request in flight.
struct InFlight<'a> {
    registry: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.key);
    }
}

enum AutoTrigger {
    Reconnect,
    Interval,
    Ignore,
    Stop,
}

/// The sync engine reconciles a local store with the server.
pub struct SyncEngine<T: SyncTransport, S: LocalStore> {
    config: SyncConfig,
    transport: Arc<T>,
    store: Arc<S>,
    bus: EventBus,
    resolver: ConflictResolver,
    uploads: UploadPipeline<T>,
    monitor: Option<Arc<NetworkMonitor>>,
    state: RwLock<EngineState>,
    cancelled: AtomicBool,
    halted: AtomicBool,
    active: Mutex<Option<broadcast::Sender<PassOutcome>>>,
    last_sync_at: RwLock<Option<Timestamp>>,
    in_flight: Mutex<HashSet<String>>,
}

impl<T: SyncTransport, S: LocalStore> SyncEngine<T, S> {
    /// Creates an engine over `store`.
    ///
    /// Repairs entries left `syncing`/`uploading` by an interrupted pass and
    /// loads the persisted `last_sync_at` cursor.
    pub fn new(config: SyncConfig, transport: Arc<T>, store: Arc<S>) -> SyncResult<Self> {
        let recovered = recover_interrupted(store.as_ref())?;
        if !recovered.is_empty() {
            tracing::info!(
                records = recovered.records,
                attachments = recovered.attachments,
                "requeued transfers interrupted by a previous run"
            );
        }

        let last_sync_at = match store.get_metadata(LAST_SYNC_AT)? {
            Some(value) => match value.parse::<Timestamp>() {
                Ok(at) => Some(at),
                Err(err) => {
                    tracing::warn!(value = %value, error = %err, "ignoring unreadable sync cursor");
                    None
                }
            },
            None => None,
        };

        let bus = EventBus::new();
        let uploads = UploadPipeline::new(Arc::clone(&transport), bus.clone(), &config);

        Ok(Self {
            config,
            transport,
            store,
            bus,
            resolver: ConflictResolver::new(),
            uploads,
            monitor: None,
            state: RwLock::new(EngineState::Idle),
            cancelled: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            active: Mutex::new(None),
            last_sync_at: RwLock::new(last_sync_at),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Attaches a network monitor; passes fail fast while it reports offline.
    pub fn with_network_monitor(mut self, monitor: Arc<NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The local store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The event bus events are emitted on.
    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Registers an event listener.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(callback)
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Returns true while a pass runs.
    pub fn is_syncing(&self) -> bool {
        self.state().is_active()
    }

    /// Server time of the last fully successful pass.
    pub fn last_sync_at(&self) -> Option<Timestamp> {
        *self.last_sync_at.read()
    }

    /// Requests cancellation of the running pass.
    ///
    /// Transfers already in flight complete; no new transfer starts. Returns
    /// false if no pass was running.
    pub fn cancel_sync(&self) -> bool {
        if !self.is_syncing() {
            return false;
        }
        tracing::info!("sync cancellation requested");
        self.cancelled.store(true, Ordering::SeqCst);
        self.halted.store(true, Ordering::SeqCst);
        true
    }

    /// Runs one pass, or joins the pass already running.
    pub async fn full_sync(&self) -> SyncResult<SyncReport> {
        if let Some(monitor) = &self.monitor {
            if !monitor.is_online() {
                return Err(SyncError::NotConnected);
            }
        }

        let joined = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    *active = Some(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = joined {
            tracing::debug!("joining the running sync pass");
            return match rx.recv().await {
                Ok(Ok(report)) => Ok(report),
                Ok(Err(message)) => Err(SyncError::PassFailed { message }),
                Err(_) => Err(SyncError::PassFailed {
                    message: "pass ended without an outcome".into(),
                }),
            };
        }

        let guard = ActivePass {
            slot: &self.active,
            state: &self.state,
        };
        let result = self.run_pass().await;
        guard.finish(match &result {
            Ok(report) => Ok(report.clone()),
            Err(err) => Err(err.to_string()),
        });
        result
    }

    async fn run_pass(&self) -> SyncResult<SyncReport> {
        self.cancelled.store(false, Ordering::SeqCst);
        self.halted.store(false, Ordering::SeqCst);
        *self.state.write() = EngineState::Syncing;

        let started = Instant::now();
        tracing::info!(user_id = %self.config.user_id, "sync pass started");
        self.bus.emit(&SyncEvent::Start);

        let pass = Pass::new(self.config.effective_pull_weight());
        let result = self.run_phases(&pass).await;
        let mut report = pass.report.into_inner();
        report.duration = started.elapsed();

        match result {
            Ok(()) => {
                *self.state.write() = EngineState::Idle;
                tracing::info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    uploaded = report.uploaded,
                    conflicts = report.conflicts,
                    failed = report.failed,
                    duration_ms = report.duration.as_millis() as u64,
                    "sync pass complete"
                );
                self.bus.emit(&SyncEvent::Complete(report.clone()));
                Ok(report)
            }
            Err(err) => {
                let state = if err.is_fatal() {
                    EngineState::Error
                } else {
                    EngineState::Idle
                };
                *self.state.write() = state;
                if matches!(err, SyncError::Cancelled) {
                    tracing::info!("sync pass cancelled");
                } else {
                    tracing::error!(error = %err, ?state, "sync pass aborted");
                }
                self.bus.emit(&SyncEvent::Error {
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn run_phases(&self, pass: &Pass) -> SyncResult<()> {
        let pulled = self.pull(pass).await?;
        self.check_cancelled()?;
        self.push(pass).await?;
        self.check_cancelled()?;

        // A snapshot that could not be applied is fetched again next pass.
        let Some(server_time) = pulled else {
            tracing::warn!("pull incomplete, keeping previous cursor");
            return Ok(());
        };
        self.store
            .set_metadata(LAST_SYNC_AT, &server_time.to_string())?;
        *self.last_sync_at.write() = Some(server_time);
        Ok(())
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Returns false once the pass should stop starting transfers.
    fn keep_going(&self) -> SyncResult<bool> {
        self.check_cancelled()?;
        Ok(!self.halted.load(Ordering::SeqCst))
    }

    fn claim(&self, key: String) -> Option<InFlight<'_>> {
        if !self.in_flight.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlight {
            registry: &self.in_flight,
            key,
        })
    }

    async fn request<R>(&self, fut: impl Future<Output = SyncResult<R>>) -> SyncResult<R> {
        tokio::time::timeout(self.config.request_timeout, fut)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    fn progress(&self, progress: f32, message: String) {
        self.bus.emit(&SyncEvent::Progress {
            state: EngineState::Syncing,
            message,
            progress,
        });
    }

    /// Earliest next attempt after `failures` consecutive failures, or
    /// `None` once the retry budget is spent.
    fn next_attempt(&self, failures: u32, now: Timestamp) -> Option<Timestamp> {
        let retry = &self.config.retry;
        if retry.is_exhausted(failures) {
            return None;
        }
        let delay = i64::try_from(retry.delay_for_attempt(failures).as_millis()).unwrap_or(i64::MAX);
        Some(now.saturating_add(delay))
    }

    // Pull

    /// Applies server changes. Returns the new cursor, or `None` if any
    /// snapshot could not be applied.
    async fn pull(&self, pass: &Pass) -> SyncResult<Option<Timestamp>> {
        let request = ChangesRequest::new(self.config.user_id.clone(), self.last_sync_at());
        tracing::debug!(since = ?request.since, "pulling changes");
        let response = self.request(self.transport.changes_since(&request)).await?;

        let total = response.records.len();
        let mut complete = true;
        for (index, snapshot) in response.records.iter().enumerate() {
            self.check_cancelled()?;
            let action = match self.apply_pulled(snapshot) {
                Ok(action) => action,
                Err(err) => {
                    complete = false;
                    self.fail_pulled(pass, snapshot, &err);
                    self.progress(
                        pass.pull_progress(index + 1, total),
                        format!("failed to apply record {}", snapshot.id),
                    );
                    continue;
                }
            };
            if action != PullAction::Skip {
                let mut report = pass.report.lock();
                report.pulled += 1;
                if action == PullAction::Conflict {
                    report.conflicts += 1;
                }
            }
            tracing::debug!(record_id = %snapshot.id, ?action, "applied pulled snapshot");
            self.progress(
                pass.pull_progress(index + 1, total),
                format!("pulled record {}", snapshot.id),
            );
        }
        if total == 0 {
            self.progress(pass.pull_progress(0, 0), "no server changes".into());
        }

        Ok(complete.then_some(response.server_time))
    }

    /// Records a snapshot that could not be applied on its local record.
    fn fail_pulled(&self, pass: &Pass, snapshot: &RecordSnapshot, err: &SyncError) {
        tracing::warn!(record_id = %snapshot.id, error = %err, "failed to apply pulled snapshot");
        pass.report.lock().failed += 1;

        let message = format!("failed to apply server change: {err}");
        let marked = self
            .store
            .modify_record(&snapshot.id, &mut |record: &mut StoredRecord| {
                if record.sync_status.has_unconfirmed_change() {
                    record.sync_status = SyncStatus::Error;
                    record.next_attempt_at = None;
                }
                record.last_error = Some(message.clone());
                Ok(())
            });
        match marked {
            Ok(_) | Err(StoreError::RecordNotFound(_)) => {}
            Err(store_err) => {
                tracing::warn!(record_id = %snapshot.id, error = %store_err, "failed to record pull error");
            }
        }
    }

    fn apply_pulled(&self, snapshot: &RecordSnapshot) -> SyncResult<PullAction> {
        let existing = self.store.get_record(&snapshot.id)?;
        let planned = plan_pull(existing.as_ref(), snapshot);
        if planned == PullAction::Skip {
            return Ok(planned);
        }
        if existing.is_none() {
            self.store
                .put_record(StoredRecord::from_server(snapshot.clone()))?;
            return Ok(planned);
        }

        let now = now_millis();
        let mut applied = PullAction::Skip;
        self.store
            .modify_record(&snapshot.id, &mut |record: &mut StoredRecord| {
                applied = plan_pull(Some(&*record), snapshot);
                apply_pull(record, snapshot, applied, now);
                Ok(())
            })?;
        if applied == PullAction::Conflict {
            tracing::warn!(record_id = %snapshot.id, "record diverged from server");
        }
        Ok(applied)
    }

    // Push

    async fn push(&self, pass: &Pass) -> SyncResult<()> {
        let now = now_millis();

        let mut attachments: Vec<Attachment> = self
            .store
            .attachment_ids_with_status(AttachmentStatus::PendingUpload, None, usize::MAX)?
            .into_iter()
            .filter_map(|id| self.store.get_attachment(&id).transpose())
            .collect::<Result<_, _>>()?;
        attachments.retain(|a| a.is_due(now));
        attachments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let owners: BTreeSet<RecordId> = attachments.iter().map(|a| a.record_id.clone()).collect();

        let mut records: Vec<StoredRecord> = self
            .store
            .record_ids_with_status(SyncStatus::Pending, None, usize::MAX)?
            .into_iter()
            .filter_map(|id| self.store.get_record(&id).transpose())
            .collect::<Result<_, _>>()?;
        records.retain(|r| r.is_due(now) && !owners.contains(&r.id));
        records.sort_by(|a, b| {
            a.local_updated_at
                .cmp(&b.local_updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let independent: Vec<RecordId> = records.into_iter().map(|r| r.id).collect();

        pass.push_total.store(
            independent.len() + attachments.len() + owners.len(),
            Ordering::SeqCst,
        );
        tracing::debug!(
            records = independent.len(),
            attachments = attachments.len(),
            dependent = owners.len(),
            "pushing local changes"
        );

        let attachment_ids: Vec<AttachmentId> = attachments.into_iter().map(|a| a.id).collect();
        let (pushed, uploaded) = tokio::join!(
            self.push_records(pass, independent),
            self.upload_attachments(pass, attachment_ids),
        );
        match (pushed, uploaded) {
            (Err(a), Err(b)) if b.is_fatal() && !a.is_fatal() => return Err(b),
            (Err(err), _) | (_, Err(err)) => return Err(err),
            _ => {}
        }

        // Owners go last so the push carries the new attachment references
        let mut dependent = Vec::with_capacity(owners.len());
        for id in owners {
            if let Some(record) = self.store.get_record(&id)? {
                dependent.push(record);
            } else {
                pass.push_progress();
            }
        }
        dependent.sort_by(|a, b| {
            a.local_updated_at
                .cmp(&b.local_updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.push_records(pass, dependent.into_iter().map(|r| r.id).collect())
            .await
    }

    async fn push_records(&self, pass: &Pass, ids: Vec<RecordId>) -> SyncResult<()> {
        for id in ids {
            if !self.keep_going()? {
                break;
            }
            if let Err(err) = self.push_one(pass, &id).await {
                self.halted.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn push_one(&self, pass: &Pass, id: &RecordId) -> SyncResult<()> {
        let Some(_in_flight) = self.claim(format!("record:{id}")) else {
            tracing::debug!(record_id = %id, "push already in flight");
            return Ok(());
        };

        let now = now_millis();
        let claimed = self
            .store
            .modify_record(id, &mut |record: &mut StoredRecord| {
                if record.sync_status != SyncStatus::Pending || !record.is_due(now) {
                    return Err(StoreError::invalid_state(&record.id, "not queued for push"));
                }
                record.sync_status = SyncStatus::Syncing;
                Ok(())
            });
        let record = match claimed {
            Ok(record) => record,
            Err(StoreError::InvalidState { .. }) | Err(StoreError::RecordNotFound(_)) => {
                self.progress(pass.push_progress(), format!("skipped record {id}"));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let sent = record.snapshot();
        let request =
            PushRecordRequest::new(self.config.user_id.clone(), sent.clone(), record.server_updated_at);
        tracing::debug!(
            record_id = %id,
            attempt = record.retry_count + 1,
            create = request.is_create(),
            "pushing record"
        );
        let result = self.request(self.transport.push_record(&request)).await;

        let now = now_millis();
        let mut outcome = TransferOutcome::Done;
        let written = match &result {
            Ok(response) => self
                .store
                .modify_record(id, &mut |record: &mut StoredRecord| {
                    accept_push(record, response, &sent);
                    Ok(())
                }),
            Err(err) => self
                .store
                .modify_record(id, &mut |record: &mut StoredRecord| {
                    outcome = self.reject_push(record, err, now);
                    Ok(())
                }),
        };

        if let Err(store_err) = written {
            tracing::error!(record_id = %id, error = %store_err, "failed to record push outcome");
            let message = format!("failed to record push outcome: {store_err}");
            self.store
                .modify_record(id, &mut |record: &mut StoredRecord| {
                    record.sync_status = SyncStatus::Error;
                    record.next_attempt_at = None;
                    record.last_error = Some(message.clone());
                    Ok(())
                })?;
            outcome = TransferOutcome::Failed;
        }

        pass.record(outcome, false);
        let message = match outcome {
            TransferOutcome::Done => format!("pushed record {id}"),
            TransferOutcome::Conflict => format!("record {id} conflicts with the server"),
            TransferOutcome::Failed => format!("failed to push record {id}"),
            TransferOutcome::Requeued => format!("requeued record {id}"),
        };
        self.progress(pass.push_progress(), message);

        match result {
            Err(err) if err.is_fatal() => Err(err),
            _ => Ok(()),
        }
    }

    fn reject_push(&self, record: &mut StoredRecord, err: &SyncError, now: Timestamp) -> TransferOutcome {
        match err {
            SyncError::AuthenticationFailed(_) => {
                if record.sync_status == SyncStatus::Syncing {
                    record.sync_status = SyncStatus::Pending;
                }
                TransferOutcome::Requeued
            }
            SyncError::ServerRejection {
                kind: RejectionKind::VersionConflict,
                current: Some(server),
                ..
            } => {
                tracing::warn!(record_id = %record.id, "push rejected as stale, entering conflict");
                record.enter_conflict((**server).clone(), now);
                TransferOutcome::Conflict
            }
            // Edited while the request was out; the edit already requeued it
            _ if record.sync_status != SyncStatus::Syncing => TransferOutcome::Requeued,
            _ => {
                record.last_error = Some(err.to_string());
                record.retry_count += 1;
                let next = if err.is_retryable() {
                    self.next_attempt(record.retry_count, now)
                } else {
                    None
                };
                match next {
                    Some(at) => {
                        tracing::warn!(
                            record_id = %record.id,
                            attempt = record.retry_count,
                            error = %err,
                            "push failed, will retry"
                        );
                        record.sync_status = SyncStatus::Pending;
                        record.next_attempt_at = Some(at);
                    }
                    None => {
                        tracing::warn!(
                            record_id = %record.id,
                            attempt = record.retry_count,
                            error = %err,
                            "push failed permanently"
                        );
                        record.sync_status = SyncStatus::Error;
                        record.next_attempt_at = None;
                    }
                }
                TransferOutcome::Failed
            }
        }
    }

    async fn upload_attachments(&self, pass: &Pass, ids: Vec<AttachmentId>) -> SyncResult<()> {
        let results =
            futures::future::join_all(ids.iter().map(|id| self.upload_one(pass, id))).await;
        let mut first_error: Option<SyncError> = None;
        for result in results {
            if let Err(err) = result {
                match &first_error {
                    Some(current) if current.is_fatal() || !err.is_fatal() => {}
                    _ => first_error = Some(err),
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn upload_one(&self, pass: &Pass, id: &AttachmentId) -> SyncResult<()> {
        let Some(_in_flight) = self.claim(format!("attachment:{id}")) else {
            tracing::debug!(attachment_id = %id, "upload already in flight");
            return Ok(());
        };
        if !self.keep_going()? {
            return Ok(());
        }

        let now = now_millis();
        let claimed = self
            .store
            .modify_attachment(id, &mut |attachment: &mut Attachment| {
                if attachment.sync_status != AttachmentStatus::PendingUpload
                    || !attachment.is_due(now)
                {
                    return Err(StoreError::invalid_state(&attachment.id, "not queued for upload"));
                }
                attachment.sync_status = AttachmentStatus::Uploading;
                Ok(())
            });
        let attachment = match claimed {
            Ok(attachment) => attachment,
            Err(StoreError::InvalidState { .. }) | Err(StoreError::AttachmentNotFound(_)) => {
                self.progress(pass.push_progress(), format!("skipped attachment {id}"));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let result = self.uploads.upload(&attachment, &self.halted).await;

        let now = now_millis();
        let mut outcome = TransferOutcome::Done;
        let written = match &result {
            Ok(uploaded) => self
                .store
                .modify_attachment(id, &mut |attachment: &mut Attachment| {
                    attachment.remote_url = Some(uploaded.url.clone());
                    attachment.content_hash = uploaded.hash.clone();
                    attachment.sync_status = AttachmentStatus::Clean;
                    attachment.retry_count = 0;
                    attachment.next_attempt_at = None;
                    attachment.last_error = None;
                    Ok(())
                }),
            Err(err) => self
                .store
                .modify_attachment(id, &mut |attachment: &mut Attachment| {
                    outcome = self.reject_upload(attachment, err, now);
                    Ok(())
                }),
        };

        match written {
            Ok(_) => {
                if let Ok(uploaded) = &result {
                    self.link_attachment(&attachment, &uploaded.url)?;
                }
            }
            Err(store_err) => {
                tracing::error!(attachment_id = %id, error = %store_err, "failed to record upload outcome");
                let message = format!("failed to record upload outcome: {store_err}");
                self.store
                    .modify_attachment(id, &mut |attachment: &mut Attachment| {
                        attachment.sync_status = AttachmentStatus::Error;
                        attachment.next_attempt_at = None;
                        attachment.last_error = Some(message.clone());
                        Ok(())
                    })?;
                outcome = TransferOutcome::Failed;
            }
        }

        pass.record(outcome, true);
        let message = match outcome {
            TransferOutcome::Done => format!("uploaded attachment {id}"),
            TransferOutcome::Failed | TransferOutcome::Conflict => {
                format!("failed to upload attachment {id}")
            }
            TransferOutcome::Requeued => format!("requeued attachment {id}"),
        };
        self.progress(pass.push_progress(), message);

        match result {
            Err(SyncError::Cancelled) => self.check_cancelled(),
            Err(err) if err.is_fatal() => {
                self.halted.store(true, Ordering::SeqCst);
                Err(err)
            }
            _ => Ok(()),
        }
    }

    fn reject_upload(
        &self,
        attachment: &mut Attachment,
        err: &SyncError,
        now: Timestamp,
    ) -> TransferOutcome {
        if matches!(err, SyncError::Cancelled | SyncError::AuthenticationFailed(_)) {
            attachment.sync_status = AttachmentStatus::PendingUpload;
            return TransferOutcome::Requeued;
        }

        attachment.last_error = Some(err.to_string());
        attachment.retry_count += 1;
        let next = if err.is_retryable() {
            self.next_attempt(attachment.retry_count, now)
        } else {
            None
        };
        match next {
            Some(at) => {
                tracing::warn!(
                    attachment_id = %attachment.id,
                    attempt = attachment.retry_count,
                    error = %err,
                    "upload failed, will retry"
                );
                attachment.sync_status = AttachmentStatus::PendingUpload;
                attachment.next_attempt_at = Some(at);
            }
            None => {
                tracing::warn!(
                    attachment_id = %attachment.id,
                    attempt = attachment.retry_count,
                    error = %err,
                    "upload failed permanently"
                );
                attachment.sync_status = AttachmentStatus::Error;
                attachment.next_attempt_at = None;
            }
        }
        TransferOutcome::Failed
    }

    /// Records the remote URL on the owning record and queues it for push.
    fn link_attachment(&self, attachment: &Attachment, url: &str) -> SyncResult<()> {
        let now = now_millis();
        let linked = self
            .store
            .modify_record(&attachment.record_id, &mut |record: &mut StoredRecord| {
                record
                    .attachment_refs
                    .insert(attachment.id.clone(), url.to_string());
                match record.sync_status {
                    SyncStatus::Clean => {
                        record.local_updated_at = now.max(record.local_updated_at + 1);
                        record.mark_pending();
                    }
                    SyncStatus::Conflict => {
                        if let Some(payload) = record.conflict.as_mut() {
                            payload
                                .local
                                .attachment_refs
                                .insert(attachment.id.clone(), url.to_string());
                        }
                    }
                    _ => {}
                }
                Ok(())
            });
        match linked {
            Ok(_) => Ok(()),
            Err(StoreError::RecordNotFound(_)) => {
                tracing::warn!(
                    attachment_id = %attachment.id,
                    record_id = %attachment.record_id,
                    "uploaded attachment has no owning record"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    // Operator actions

    /// Requeues a record in `error` (or resets the backoff of a pending one).
    pub fn retry_record(&self, id: &RecordId) -> SyncResult<StoredRecord> {
        requeue_record(self.store.as_ref(), id)
    }

    /// Requeues an attachment in `error` (or resets its backoff).
    pub fn retry_attachment(&self, id: &AttachmentId) -> SyncResult<Attachment> {
        requeue_attachment(self.store.as_ref(), id)
    }

    /// Records awaiting conflict resolution, ordered by id.
    pub fn conflicted_records(&self) -> SyncResult<Vec<StoredRecord>> {
        Ok(self
            .store
            .query_records(SyncStatus::Conflict)
            .collect::<Result<_, _>>()?)
    }

    /// Records whose push failed permanently, ordered by id.
    pub fn errored_records(&self) -> SyncResult<Vec<StoredRecord>> {
        Ok(self
            .store
            .query_records(SyncStatus::Error)
            .collect::<Result<_, _>>()?)
    }

    /// Attachments whose upload failed permanently, ordered by id.
    pub fn errored_attachments(&self) -> SyncResult<Vec<Attachment>> {
        Ok(self
            .store
            .query_attachments(AttachmentStatus::Error)
            .collect::<Result<_, _>>()?)
    }

    /// Resolves one conflict with `policy`, audited under the configured actor.
    pub fn resolve_record_conflict(
        &self,
        id: &RecordId,
        policy: ResolutionPolicy,
    ) -> SyncResult<ResolutionOutcome> {
        apply_resolution(
            self.store.as_ref(),
            &self.resolver,
            id,
            policy,
            &self.config.actor,
        )
    }

    /// Resolves every conflict with `policy`.
    pub fn resolve_all_conflicts(&self, policy: ResolutionPolicy) -> SyncResult<BatchResolution> {
        resolve_all(self.store.as_ref(), &self.resolver, policy, &self.config.actor)
    }

    /// Resolution history of one record.
    pub fn audit_trail(&self, id: &RecordId) -> SyncResult<Vec<AuditEntry>> {
        Ok(self.store.audit_entries(Some(id))?)
    }
}

impl<T, S> SyncEngine<T, S>
where
    T: SyncTransport + 'static,
    S: LocalStore + 'static,
{
    /// Runs passes automatically on reconnect and on the configured interval.
    ///
    /// Interval ticks are skipped while `monitor` reports offline. Abort the
    /// returned handle to stop.
    pub fn spawn_auto_sync(engine: Arc<Self>, monitor: Arc<NetworkMonitor>) -> JoinHandle<()> {
        let mut events = monitor.subscribe();
        let period = engine.config.sync_interval;

        tokio::spawn(async move {
            let mut ticker = period.map(|period| {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker
            });

            loop {
                let trigger = tokio::select! {
                    event = events.recv() => match event {
                        Ok(NetworkEvent::SyncEligible) => AutoTrigger::Reconnect,
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => AutoTrigger::Ignore,
                        Err(broadcast::error::RecvError::Closed) => AutoTrigger::Stop,
                    },
                    _ = next_tick(&mut ticker) => {
                        if monitor.is_online() {
                            AutoTrigger::Interval
                        } else {
                            AutoTrigger::Ignore
                        }
                    }
                };

                let reason = match trigger {
                    AutoTrigger::Reconnect => "reconnect",
                    AutoTrigger::Interval => "interval",
                    AutoTrigger::Ignore => continue,
                    AutoTrigger::Stop => break,
                };
                tracing::debug!(reason, "automatic sync triggered");
                if let Err(err) = engine.full_sync().await {
                    tracing::debug!(reason, error = %err, "automatic sync did not complete");
                }
            }
        })
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Requeues a record in `error`, or resets the backoff of a pending one.
pub fn requeue_record<S: LocalStore + ?Sized>(
    store: &S,
    id: &RecordId,
) -> SyncResult<StoredRecord> {
    store
        .modify_record(id, &mut |record: &mut StoredRecord| match record.sync_status {
            SyncStatus::Error | SyncStatus::Pending => {
                record.mark_pending();
                Ok(())
            }
            status => Err(StoreError::invalid_state(
                &record.id,
                format!("cannot retry a {status} record"),
            )),
        })
        .map_err(|err| match err {
            StoreError::RecordNotFound(id) => SyncError::RecordNotFound(id),
            other => other.into(),
        })
}

/// Requeues an attachment in `error`, or resets the backoff of a pending one.
pub fn requeue_attachment<S: LocalStore + ?Sized>(
    store: &S,
    id: &AttachmentId,
) -> SyncResult<Attachment> {
    store
        .modify_attachment(id, &mut |attachment: &mut Attachment| {
            match attachment.sync_status {
                AttachmentStatus::Error | AttachmentStatus::PendingUpload => {
                    attachment.sync_status = AttachmentStatus::PendingUpload;
                    attachment.retry_count = 0;
                    attachment.next_attempt_at = None;
                    attachment.last_error = None;
                    Ok(())
                }
                status => Err(StoreError::invalid_state(
                    &attachment.id,
                    format!("cannot retry a {status} attachment"),
                )),
            }
        })
        .map_err(|err| match err {
            StoreError::AttachmentNotFound(id) => SyncError::AttachmentNotFound(id),
            other => other.into(),
        })
}

fn accept_push(record: &mut StoredRecord, response: &PushRecordResponse, sent: &RecordSnapshot) {
    record.server_id = Some(response.id.clone());
    record.server_updated_at = Some(response.updated_at);
    if record.sync_status == SyncStatus::Syncing {
        if record.snapshot().same_content(sent) {
            record.mark_clean();
        } else {
            record.mark_pending();
        }
    }
}

impl<T: SyncTransport, S: LocalStore> std::fmt::Debug for SyncEngine<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("user_id", &self.config.user_id)
            .field("state", &self.state())
            .field("last_sync_at", &self.last_sync_at())
            .finish()
    }
}
