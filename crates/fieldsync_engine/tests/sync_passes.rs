//! End-to-end sync passes against the mock server.

use fieldsync_engine::{
    EngineState, EventKind, ResolutionOutcome, ResolutionPolicy, RetryConfig, SyncError,
    SyncEvent,
};
use fieldsync_protocol::{Fields, RecordId, RecordSnapshot};
use fieldsync_store::{LocalMutations, LocalStore, StoredRecord, SyncStatus, LAST_SYNC_AT};
use fieldsync_testkit::prelude::*;
use serde_json::json;
use std::time::Duration;

/// Scenario A: r1 edited offline at 10:00, server changed it at 10:05.
fn diverged_env() -> TestEnv {
    let env = TestEnv::new();
    env.transport
        .put_server_record(server_report("r1", "14 Main St", at(10, 5)));
    env.put(pending_report("r1", "12 Main St", at(10, 0), Some(at(9, 0))));
    env
}

#[tokio::test]
async fn new_report_is_pushed_and_cleaned() {
    let env = TestEnv::new();
    let record = env.create_report("12 Main St");

    let report = env.engine.full_sync().await.unwrap();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.failed, 0);
    let stored = env.record(record.id.as_str());
    let server = env.transport.server_record(&record.id).unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Clean);
    assert_eq!(stored.server_id, server.server_id);
    assert_eq!(stored.server_updated_at, Some(server.updated_at));
    assert_eq!(server.field("address"), Some(&json!("12 Main St")));
    assert!(env.engine.last_sync_at().is_some());
    assert_eq!(env.engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn second_pass_without_changes_writes_nothing() {
    let env = TestEnv::new();
    for address in ["1 Elm St", "2 Elm St", "3 Elm St"] {
        env.create_report(address);
    }
    env.engine.full_sync().await.unwrap();
    let before: Vec<StoredRecord> = env.store.all_records().unwrap();
    let writes = env.transport.total_writes();

    let report = env.engine.full_sync().await.unwrap();

    assert_eq!(report.pulled, 0);
    assert_eq!(report.pushed, 0);
    assert_eq!(env.transport.total_writes(), writes);
    assert_eq!(env.store.all_records().unwrap(), before);
}

#[tokio::test]
async fn diverged_edit_becomes_conflict() {
    let env = diverged_env();
    let id = RecordId::new("r1");

    let report = env.engine.full_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    let stored = env.record("r1");
    assert_eq!(stored.sync_status, SyncStatus::Conflict);
    assert_eq!(stored.fields, report_fields("12 Main St"));

    let payload = stored.conflict.unwrap();
    assert_eq!(payload.local.fields, report_fields("12 Main St"));
    assert_eq!(payload.local.updated_at, at(10, 0));
    assert_eq!(payload.server, env.transport.server_record(&id).unwrap());

    assert!(env.transport.push_log().is_empty());
    assert_eq!(env.engine.conflicted_records().unwrap().len(), 1);
}

#[tokio::test]
async fn keep_server_resolution_cleans_record() {
    let env = diverged_env();
    let id = RecordId::new("r1");
    env.engine.full_sync().await.unwrap();

    let outcome = env
        .engine
        .resolve_record_conflict(&id, ResolutionPolicy::KeepServer)
        .unwrap();

    assert!(outcome.is_resolved());
    let stored = env.record("r1");
    assert_eq!(stored.fields.get("address"), Some(&json!("14 Main St")));
    assert_eq!(stored.sync_status, SyncStatus::Clean);
    assert!(stored.conflict.is_none());

    let audit = env.engine.audit_trail(&id).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].policy, ResolutionPolicy::KeepServer);
    assert_eq!(audit[0].actor, TEST_USER);

    env.engine.full_sync().await.unwrap();
    assert_eq!(env.transport.total_writes(), 0);
    assert_eq!(env.record("r1").sync_status, SyncStatus::Clean);
}

#[tokio::test]
async fn resolving_twice_is_a_noop() {
    let env = diverged_env();
    let id = RecordId::new("r1");
    env.engine.full_sync().await.unwrap();

    env.engine
        .resolve_record_conflict(&id, ResolutionPolicy::Merge)
        .unwrap();
    let after_first = env.record("r1");
    let second = env
        .engine
        .resolve_record_conflict(&id, ResolutionPolicy::Merge)
        .unwrap();

    assert_eq!(second, ResolutionOutcome::AlreadyResolved);
    assert_eq!(env.record("r1"), after_first);
    assert_eq!(env.engine.audit_trail(&id).unwrap().len(), 1);
}

#[tokio::test]
async fn keep_local_overwrites_server_on_next_pass() {
    let env = diverged_env();
    let id = RecordId::new("r1");
    env.engine.full_sync().await.unwrap();

    env.engine
        .resolve_record_conflict(&id, ResolutionPolicy::KeepLocal)
        .unwrap();
    assert_eq!(env.record("r1").sync_status, SyncStatus::Pending);

    let report = env.engine.full_sync().await.unwrap();

    assert_eq!(report.pushed, 1);
    assert_eq!(report.conflicts, 0);
    let server = env.transport.server_record(&id).unwrap();
    assert_eq!(server.field("address"), Some(&json!("12 Main St")));
    assert_eq!(env.record("r1").sync_status, SyncStatus::Clean);
}

#[tokio::test]
async fn merge_keeps_each_sides_newer_fields() {
    let env = TestEnv::new();
    let id = RecordId::new("r1");
    env.transport.put_server_record(
        RecordSnapshot::new("r1", Fields::new(), at(10, 5))
            .with_server_id("srv-r1")
            .with_field("address", json!("12 Main St"), at(9, 0))
            .with_field("floors", json!(3), at(10, 5))
            .with_field("inspector_notes", json!(""), at(9, 0)),
    );

    let mut local = StoredRecord::new_local(id.clone(), Fields::new(), at(10, 0));
    local.server_id = Some("srv-r1".into());
    local.server_updated_at = Some(at(9, 0));
    for (name, value, stamp) in [
        ("address", json!("12 Main St"), at(9, 0)),
        ("floors", json!(2), at(9, 0)),
        ("inspector_notes", json!("cracked beam"), at(10, 0)),
    ] {
        local.fields.insert(name.into(), value);
        local.field_updated_at.insert(name.into(), stamp);
    }
    env.put(local);

    env.engine.full_sync().await.unwrap();
    env.engine
        .resolve_record_conflict(&id, ResolutionPolicy::Merge)
        .unwrap();

    let merged = env.record("r1");
    assert_eq!(merged.sync_status, SyncStatus::Pending);
    assert_eq!(merged.fields.get("inspector_notes"), Some(&json!("cracked beam")));
    assert_eq!(merged.fields.get("floors"), Some(&json!(3)));

    env.engine.full_sync().await.unwrap();
    let server = env.transport.server_record(&id).unwrap();
    assert_eq!(server.field("inspector_notes"), Some(&json!("cracked beam")));
    assert_eq!(server.field("floors"), Some(&json!(3)));
    assert_eq!(env.record("r1").sync_status, SyncStatus::Clean);
}

#[tokio::test]
async fn identical_content_converges_without_push() {
    let env = TestEnv::new();
    env.transport
        .put_server_record(server_report("r1", "12 Main St", at(10, 5)));
    env.put(pending_report("r1", "12 Main St", at(10, 0), Some(at(9, 0))));

    env.engine.full_sync().await.unwrap();

    let stored = env.record("r1");
    assert_eq!(stored.sync_status, SyncStatus::Clean);
    assert_eq!(stored.server_updated_at, Some(at(10, 5)));
    assert!(env.transport.push_log().is_empty());
}

#[tokio::test]
async fn later_pull_refreshes_only_server_side_of_conflict() {
    let env = diverged_env();
    let id = RecordId::new("r1");
    env.engine.full_sync().await.unwrap();
    let local_before = env.record("r1").conflict.unwrap().local;

    let edited = env
        .transport
        .edit_server_record(&id, |snapshot| {
            snapshot.fields.insert("address".into(), json!("16 Main St"));
        })
        .unwrap();
    env.engine.full_sync().await.unwrap();

    let stored = env.record("r1");
    let payload = stored.conflict.unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Conflict);
    assert_eq!(payload.local, local_before);
    assert_eq!(payload.server, edited);
}

#[tokio::test]
async fn stale_push_rejection_enters_conflict() {
    let mut env = TestEnv::new();
    let server = server_report("r1", "14 Main St", at(10, 5));
    env.transport.put_server_record(server.clone());
    env.put(pending_report("r1", "12 Main St", at(10, 0), Some(at(9, 0))));
    // Cursor already past the server edit, so only the push can notice it
    env.store
        .set_metadata(LAST_SYNC_AT, &env.transport.server_time().to_string())
        .unwrap();
    env.restart();

    let report = env.engine.full_sync().await.unwrap();

    assert_eq!(report.conflicts, 1);
    assert_eq!(env.transport.push_log().len(), 1);
    let stored = env.record("r1");
    assert_eq!(stored.sync_status, SyncStatus::Conflict);
    assert_eq!(stored.conflict.unwrap().server, server);
}

#[tokio::test]
async fn server_edit_flows_into_clean_record() {
    let env = TestEnv::new();
    let record = env.create_report("12 Main St");
    env.engine.full_sync().await.unwrap();

    env.transport.edit_server_record(&record.id, |snapshot| {
        snapshot.fields.insert("address".into(), json!("12 Main Street"));
    });
    let report = env.engine.full_sync().await.unwrap();

    assert_eq!(report.pulled, 1);
    let stored = env.record(record.id.as_str());
    assert_eq!(stored.sync_status, SyncStatus::Clean);
    assert_eq!(stored.fields.get("address"), Some(&json!("12 Main Street")));
}

#[tokio::test]
async fn tombstone_syncs_like_any_change() {
    let env = TestEnv::new();
    let record = env.create_report("12 Main St");
    env.engine.full_sync().await.unwrap();

    env.store.delete_record(&record.id).unwrap();
    env.engine.full_sync().await.unwrap();

    assert!(env.transport.server_record(&record.id).unwrap().deleted);
    assert_eq!(env.record(record.id.as_str()).sync_status, SyncStatus::Clean);
}

#[tokio::test]
async fn pull_failure_aborts_pass_and_returns_to_idle() {
    let env = TestEnv::new();
    let log = env.event_log();
    let record = env.create_report("12 Main St");
    env.transport.set_fail_changes(true);

    let err = env.engine.full_sync().await.unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(env.engine.state(), EngineState::Idle);
    assert_eq!(log.kinds(), vec![EventKind::Start, EventKind::Error]);
    assert_eq!(env.record(record.id.as_str()).sync_status, SyncStatus::Pending);
    assert!(env.transport.push_log().is_empty());
    assert!(env.engine.last_sync_at().is_none());
    assert!(env.store.get_metadata(LAST_SYNC_AT).unwrap().is_none());
}

#[tokio::test]
async fn authentication_failure_puts_engine_in_error() {
    let env = TestEnv::new();
    env.create_report("12 Main St");
    env.transport.set_reject_auth(true);

    let err = env.engine.full_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::AuthenticationFailed(_)));
    assert_eq!(env.engine.state(), EngineState::Error);

    env.transport.set_reject_auth(false);
    env.engine.full_sync().await.unwrap();
    assert_eq!(env.engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn validation_rejection_marks_record_error() {
    let env = TestEnv::new();
    let record = env.create_report("");
    env.transport.reject_validation(record.id.clone());

    let report = env.engine.full_sync().await.unwrap();

    assert_eq!(report.failed, 1);
    let stored = env.record(record.id.as_str());
    assert_eq!(stored.sync_status, SyncStatus::Error);
    assert!(stored.last_error.unwrap().contains("validation"));
    assert_eq!(env.engine.errored_records().unwrap().len(), 1);

    // Terminal until an explicit retry
    env.engine.full_sync().await.unwrap();
    assert_eq!(env.transport.push_log().len(), 1);
}

#[tokio::test]
async fn transient_failures_exhaust_retries_then_error() {
    let env = TestEnv::new();
    let record = env.create_report("12 Main St");
    env.transport.fail_next_pushes(10);

    for attempt in 1..=2 {
        env.engine.full_sync().await.unwrap();
        let stored = env.record(record.id.as_str());
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.retry_count, attempt);
    }
    env.engine.full_sync().await.unwrap();
    let stored = env.record(record.id.as_str());
    assert_eq!(stored.sync_status, SyncStatus::Error);
    assert_eq!(stored.retry_count, 3);

    env.transport.fail_next_pushes(0);
    let retried = env.engine.retry_record(&record.id).unwrap();
    assert_eq!(retried.sync_status, SyncStatus::Pending);
    assert_eq!(retried.retry_count, 0);

    env.engine.full_sync().await.unwrap();
    assert_eq!(env.record(record.id.as_str()).sync_status, SyncStatus::Clean);
}

#[tokio::test]
async fn backoff_defers_the_next_attempt() {
    let config = test_config().with_retry(
        RetryConfig::new(5)
            .with_initial_delay(Duration::from_secs(60))
            .with_jitter(false),
    );
    let env = TestEnv::with_config(config);
    let record = env.create_report("12 Main St");
    env.transport.fail_next_pushes(1);

    env.engine.full_sync().await.unwrap();
    let stored = env.record(record.id.as_str());
    assert_eq!(stored.sync_status, SyncStatus::Pending);
    assert!(stored.next_attempt_at.unwrap() > fieldsync_protocol::now_millis() + 50_000);

    env.engine.full_sync().await.unwrap();
    assert_eq!(env.transport.push_log().len(), 1);

    env.engine.retry_record(&record.id).unwrap();
    env.engine.full_sync().await.unwrap();
    assert_eq!(env.record(record.id.as_str()).sync_status, SyncStatus::Clean);
}

#[tokio::test]
async fn retrying_unknown_record_is_reported() {
    let env = TestEnv::new();
    let err = env.engine.retry_record(&RecordId::new("ghost")).unwrap_err();
    assert!(matches!(err, SyncError::RecordNotFound(_)));
}

#[tokio::test]
async fn batch_resolution_clears_every_conflict() {
    let env = TestEnv::new();
    for id in ["r1", "r2", "r3"] {
        env.transport
            .put_server_record(server_report(id, "server", at(10, 5)));
        env.put(pending_report(id, "device", at(10, 0), Some(at(9, 0))));
    }
    env.engine.full_sync().await.unwrap();
    assert_eq!(env.store.status_counts().conflict, 3);

    let batch = env
        .engine
        .resolve_all_conflicts(ResolutionPolicy::KeepLocal)
        .unwrap();

    assert_eq!(batch.resolved.len(), 3);
    assert!(batch.failed.is_empty());
    assert_eq!(env.store.status_counts().pending, 3);
    assert_eq!(env.store.audit_entries(None).unwrap().len(), 3);
}

#[tokio::test]
async fn events_follow_the_pass_lifecycle() {
    let env = TestEnv::new();
    let log = env.event_log();
    env.create_report("1 Elm St");
    env.create_report("2 Elm St");

    env.engine.full_sync().await.unwrap();

    let kinds = log.kinds();
    assert_eq!(kinds.first(), Some(&EventKind::Start));
    assert_eq!(kinds.last(), Some(&EventKind::Complete));
    assert_eq!(log.count(EventKind::Progress), 3);

    let progress = log.progress();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!((progress.last().unwrap() - 1.0).abs() < 1e-6);

    match log.events().last().unwrap() {
        SyncEvent::Complete(report) => assert_eq!(report.pushed, 2),
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn restart_requeues_interrupted_push() {
    let mut env = TestEnv::new();
    let record = env.create_report("12 Main St");
    env.store
        .update_record(&record.id, |record| {
            record.sync_status = SyncStatus::Syncing;
            Ok(())
        })
        .unwrap();

    env.restart();

    assert_eq!(env.record(record.id.as_str()).sync_status, SyncStatus::Pending);
    env.engine.full_sync().await.unwrap();
    assert_eq!(env.record(record.id.as_str()).sync_status, SyncStatus::Clean);
    assert_eq!(env.transport.write_count(&record.id), 1);
}

#[tokio::test]
async fn cursor_survives_restart() {
    let mut env = TestEnv::new();
    env.create_report("12 Main St");
    env.engine.full_sync().await.unwrap();
    let cursor = env.engine.last_sync_at();

    env.restart();

    assert_eq!(env.engine.last_sync_at(), cursor);
}
