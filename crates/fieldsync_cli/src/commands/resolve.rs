//! Resolve commands implementation.

use super::{open_store, parse_arg, print_json, CliResult, OutputFormat};
use fieldsync_engine::{
    apply_resolution, resolve_all, ConflictResolver, ResolutionOutcome, ResolutionPolicy,
};
use fieldsync_protocol::RecordId;
use fieldsync_store::SyncStatus;
use serde::Serialize;
use std::path::Path;

/// Outcome of resolving one record.
#[derive(Debug, Serialize)]
pub struct ResolveResult {
    /// Record id.
    pub id: RecordId,
    /// Policy applied.
    pub policy: ResolutionPolicy,
    /// False if the record was not in conflict.
    pub resolved: bool,
    /// Status after resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SyncStatus>,
}

/// Outcome of a batch resolution.
#[derive(Debug, Serialize)]
pub struct ResolveAllResult {
    /// Policy applied.
    pub policy: ResolutionPolicy,
    /// Records whose conflict was cleared.
    pub resolved: Vec<RecordId>,
    /// Records that could not be resolved.
    pub failed: Vec<FailedResolution>,
}

/// A record the batch could not resolve.
#[derive(Debug, Serialize)]
pub struct FailedResolution {
    /// Record id.
    pub id: RecordId,
    /// Reason.
    pub error: String,
}

/// Runs the resolve command.
pub fn run(
    path: &Path,
    id: &str,
    policy: &str,
    actor: &str,
    format: OutputFormat,
) -> CliResult<()> {
    let policy: ResolutionPolicy = parse_arg(policy)?;
    let store = open_store(path)?;
    let id = RecordId::new(id);

    let outcome = apply_resolution(&store, &ConflictResolver::new(), &id, policy, actor)?;
    let result = ResolveResult {
        id,
        policy,
        resolved: outcome.is_resolved(),
        status: match &outcome {
            ResolutionOutcome::Resolved(record) => Some(record.sync_status),
            ResolutionOutcome::AlreadyResolved => None,
        },
    };

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => match result.status {
            Some(status) => println!("Resolved {} with {} ({})", result.id, policy, status),
            None => println!("Record {} is not in conflict; nothing to do", result.id),
        },
    }
    Ok(())
}

/// Runs the resolve-all command.
pub fn run_all(path: &Path, policy: &str, actor: &str, format: OutputFormat) -> CliResult<()> {
    let policy: ResolutionPolicy = parse_arg(policy)?;
    let store = open_store(path)?;

    let batch = resolve_all(&store, &ConflictResolver::new(), policy, actor)?;
    let result = ResolveAllResult {
        policy,
        resolved: batch.resolved,
        failed: batch
            .failed
            .into_iter()
            .map(|(id, err)| FailedResolution {
                id,
                error: err.to_string(),
            })
            .collect(),
    };

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => {
            println!("Resolved {} record(s) with {}", result.resolved.len(), policy);
            for failure in &result.failed {
                println!("  ✗ {}: {}", failure.id, failure.error);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CliError;
    use fieldsync_store::{FileStore, LocalStore};
    use fieldsync_testkit::{at, pending_report, server_report};

    fn conflicted_store(dir: &Path, ids: &[&str]) {
        let store = FileStore::open_dir(dir).unwrap();
        for id in ids {
            let mut record = pending_report(id, "12 Main St", at(10, 0), Some(at(9, 0)));
            record.enter_conflict(server_report(id, "14 Main St", at(10, 5)), at(10, 6));
            store.put_record(record).unwrap();
        }
    }

    #[test]
    fn resolve_writes_audit_entry() {
        let dir = tempfile::tempdir().unwrap();
        conflicted_store(dir.path(), &["r1"]);

        run(dir.path(), "r1", "keep_server", "supervisor", OutputFormat::Json).unwrap();

        let store = FileStore::open_dir(dir.path()).unwrap();
        let record = store.get_record(&RecordId::new("r1")).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Clean);
        let audit = store.audit_entries(None).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].actor, "supervisor");
    }

    #[test]
    fn unknown_policy_is_rejected_before_opening() {
        let dir = tempfile::tempdir().unwrap();
        let err = run(dir.path(), "r1", "newest", "op", OutputFormat::Text).unwrap_err();
        assert!(matches!(err, CliError::InvalidArgument(_)));
    }

    #[test]
    fn resolve_all_clears_every_conflict() {
        let dir = tempfile::tempdir().unwrap();
        conflicted_store(dir.path(), &["r1", "r2"]);

        run_all(dir.path(), "merge", "op", OutputFormat::Text).unwrap();

        let store = FileStore::open_dir(dir.path()).unwrap();
        let counts = store.status_counts();
        assert_eq!(counts.conflict, 0);
        assert_eq!(counts.pending, 2);
    }
}
