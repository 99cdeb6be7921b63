//! Conflict resolution.
//!
//! [`ConflictResolver::resolve`] is pure: it collapses the two snapshots
//! retained by a conflict into one canonical snapshot and the status the
//! record should take. [`apply_resolution`] applies that outcome to the store
//! together with an audit entry.
//!
//! # Merge rules
//!
//! Per field:
//! - equal values pass through;
//! - if both sides carry a field timestamp, the later one wins (local on ties);
//! - if only one side carries a field timestamp, that side wins;
//! - otherwise the whole-record timestamps decide (local on ties).
//!
//! Identity fields are never merged: the server value is kept. The tombstone
//! flag follows the whole-record rule. Attachment references are united.
//!
//! Every resolved snapshot adopts the server's `updated_at`, so the follow-up
//! push is based on the version the server currently holds.

use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::{now_millis, RecordId, RecordSnapshot, Timestamp};
use fieldsync_store::{
    AuditEntry, LocalStore, ResolutionPolicy, StoreError, StoredRecord, SyncStatus,
};
use std::collections::{BTreeMap, BTreeSet};

/// Field holding the human-facing record number.
pub const DEFAULT_IDENTITY_FIELD: &str = "record_number";

/// Result of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    /// Canonical content.
    pub snapshot: RecordSnapshot,
    /// Status the record takes.
    pub status: SyncStatus,
}

/// Outcome of applying a resolution to the store.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// The conflict was cleared.
    Resolved(StoredRecord),
    /// The record was not in conflict; nothing changed.
    AlreadyResolved,
}

impl ResolutionOutcome {
    /// Returns true if this call cleared a conflict.
    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolutionOutcome::Resolved(_))
    }
}

/// Outcome of a batch resolution.
#[derive(Debug, Default)]
pub struct BatchResolution {
    /// Records whose conflict was cleared.
    pub resolved: Vec<RecordId>,
    /// Records that could not be resolved, with the reason.
    pub failed: Vec<(RecordId, SyncError)>,
}

/// Resolves conflicts according to a policy.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    identity_fields: BTreeSet<String>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

enum Side {
    Local,
    Server,
}

impl ConflictResolver {
    /// Creates a resolver treating `record_number` as an identity field.
    pub fn new() -> Self {
        Self::with_identity_fields([DEFAULT_IDENTITY_FIELD])
    }

    /// Creates a resolver with a custom identity field list.
    pub fn with_identity_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identity_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if `field` is never merged.
    pub fn is_identity_field(&self, field: &str) -> bool {
        self.identity_fields.contains(field)
    }

    /// Resolves a conflict between `local` and `server`.
    pub fn resolve(
        &self,
        local: &RecordSnapshot,
        server: &RecordSnapshot,
        policy: ResolutionPolicy,
    ) -> ResolvedRecord {
        match policy {
            ResolutionPolicy::KeepLocal => {
                let mut snapshot = local.clone();
                snapshot.server_id = server.server_id.clone().or_else(|| local.server_id.clone());
                snapshot.updated_at = server.updated_at;
                ResolvedRecord {
                    snapshot,
                    status: SyncStatus::Pending,
                }
            }
            ResolutionPolicy::KeepServer => {
                let mut snapshot = server.clone();
                snapshot.id = local.id.clone();
                if snapshot.server_id.is_none() {
                    snapshot.server_id = local.server_id.clone();
                }
                ResolvedRecord {
                    snapshot,
                    status: SyncStatus::Clean,
                }
            }
            ResolutionPolicy::Merge => ResolvedRecord {
                snapshot: self.merge(local, server),
                status: SyncStatus::Pending,
            },
        }
    }

    /// Field-by-field merge of two snapshots.
    ///
    /// A field without its own stamp is dated by its snapshot's `updated_at`.
    /// A field missing from one side with no stamp there was never known to
    /// that side, so the side holding it wins.
    pub fn merge(&self, local: &RecordSnapshot, server: &RecordSnapshot) -> RecordSnapshot {
        let local_newer = local.updated_at >= server.updated_at;
        let names: BTreeSet<&String> = local.fields.keys().chain(server.fields.keys()).collect();

        let mut fields = BTreeMap::new();
        let mut field_updated_at = BTreeMap::new();

        for name in names {
            let local_value = local.fields.get(name);
            let server_value = server.fields.get(name);
            let local_stamp = local.field_updated_at.get(name).copied();
            let server_stamp = server.field_updated_at.get(name).copied();
            let local_at = local_stamp.unwrap_or(local.updated_at);
            let server_at = server_stamp.unwrap_or(server.updated_at);

            let side = if self.is_identity_field(name) {
                if server_value.is_some() {
                    Side::Server
                } else {
                    Side::Local
                }
            } else if local_value == server_value {
                Side::Server
            } else if local_value.is_none() && local_stamp.is_none() {
                Side::Server
            } else if server_value.is_none() && server_stamp.is_none() {
                Side::Local
            } else if local_at >= server_at {
                Side::Local
            } else {
                Side::Server
            };

            let (value, stamp) = match side {
                Side::Local => (local_value, local_at),
                Side::Server => (server_value, server_at),
            };
            if let Some(value) = value {
                fields.insert(name.clone(), value.clone());
                field_updated_at.insert(name.clone(), stamp);
            }
        }

        let mut attachment_refs = local.attachment_refs.clone();
        attachment_refs.extend(server.attachment_refs.clone());

        RecordSnapshot {
            id: local.id.clone(),
            server_id: server.server_id.clone().or_else(|| local.server_id.clone()),
            fields,
            field_updated_at,
            updated_at: server.updated_at,
            deleted: if local_newer {
                local.deleted
            } else {
                server.deleted
            },
            attachment_refs,
        }
    }
}

/// Convenience wrapper resolving with the default identity fields.
pub fn resolve(
    local: &RecordSnapshot,
    server: &RecordSnapshot,
    policy: ResolutionPolicy,
) -> ResolvedRecord {
    ConflictResolver::new().resolve(local, server, policy)
}

fn next_local_stamp(previous: Timestamp) -> Timestamp {
    now_millis().max(previous + 1)
}

/// Resolves one conflicted record in the store.
///
/// Clears the retained snapshots, adopts the resolved content, sets the
/// status (`clean` for keep-server, `pending` otherwise) and appends an
/// audit entry, all in one commit. A record that is not in conflict is left
/// untouched and reported as [`ResolutionOutcome::AlreadyResolved`].
pub fn apply_resolution<S: LocalStore + ?Sized>(
    store: &S,
    resolver: &ConflictResolver,
    id: &RecordId,
    policy: ResolutionPolicy,
    actor: &str,
) -> SyncResult<ResolutionOutcome> {
    let record = store
        .get_record(id)?
        .ok_or_else(|| SyncError::RecordNotFound(id.clone()))?;
    if record.sync_status != SyncStatus::Conflict {
        return Ok(ResolutionOutcome::AlreadyResolved);
    }

    let result = store.modify_record_with_audit(id, &mut |record: &mut StoredRecord| {
        let payload = match (&record.sync_status, record.conflict.take()) {
            (SyncStatus::Conflict, Some(payload)) => payload,
            _ => return Err(StoreError::invalid_state(&record.id, "not in conflict")),
        };
        let resolved = resolver.resolve(&payload.local, &payload.server, policy);

        record.apply_content(&resolved.snapshot);
        record.server_updated_at = Some(payload.server.updated_at);
        match resolved.status {
            SyncStatus::Clean => {
                record.local_updated_at = payload.server.updated_at;
                record.mark_clean();
            }
            _ => {
                record.local_updated_at = next_local_stamp(record.local_updated_at);
                record.mark_pending();
            }
        }

        Ok(AuditEntry {
            record_id: record.id.clone(),
            policy,
            actor: actor.to_string(),
            at: now_millis(),
        })
    });

    match result {
        Ok(record) => {
            tracing::info!(
                record_id = %id,
                policy = %policy,
                actor,
                status = %record.sync_status,
                "conflict resolved"
            );
            Ok(ResolutionOutcome::Resolved(record))
        }
        // Lost a race with another resolution
        Err(StoreError::InvalidState { .. }) => Ok(ResolutionOutcome::AlreadyResolved),
        Err(err) => Err(err.into()),
    }
}

/// Applies one policy to every conflicted record independently.
///
/// Failures are collected; they never stop the remaining records.
pub fn resolve_all<S: LocalStore + ?Sized>(
    store: &S,
    resolver: &ConflictResolver,
    policy: ResolutionPolicy,
    actor: &str,
) -> SyncResult<BatchResolution> {
    let mut batch = BatchResolution::default();
    let mut after: Option<RecordId> = None;

    loop {
        let ids = store.record_ids_with_status(SyncStatus::Conflict, after.as_ref(), 64)?;
        let Some(last) = ids.last().cloned() else {
            break;
        };
        for id in ids {
            match apply_resolution(store, resolver, &id, policy, actor) {
                Ok(ResolutionOutcome::Resolved(_)) => batch.resolved.push(id),
                Ok(ResolutionOutcome::AlreadyResolved) => {}
                Err(err) => {
                    tracing::warn!(record_id = %id, error = %err, "resolution failed");
                    batch.failed.push((id, err));
                }
            }
        }
        after = Some(last);
    }

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_protocol::{AttachmentId, Fields};
    use fieldsync_store::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn snap(updated_at: Timestamp) -> RecordSnapshot {
        RecordSnapshot::new("r1", Fields::new(), updated_at)
    }

    #[test]
    fn keep_local_adopts_server_base() {
        let local = snap(100).with_field("address", json!("12 Main St"), 100);
        let server = snap(500)
            .with_server_id("s1")
            .with_field("address", json!("14 Main St"), 500);

        let resolved = resolve(&local, &server, ResolutionPolicy::KeepLocal);

        assert_eq!(resolved.status, SyncStatus::Pending);
        assert_eq!(resolved.snapshot.field("address"), Some(&json!("12 Main St")));
        assert_eq!(resolved.snapshot.updated_at, 500);
        assert_eq!(resolved.snapshot.server_id.as_ref().unwrap().as_str(), "s1");
    }

    #[test]
    fn keep_server_is_clean() {
        let local = snap(100).with_field("address", json!("12 Main St"), 100);
        let server = snap(500).with_field("address", json!("14 Main St"), 500);

        let resolved = resolve(&local, &server, ResolutionPolicy::KeepServer);

        assert_eq!(resolved.status, SyncStatus::Clean);
        assert!(resolved.snapshot.same_content(&server));
    }

    #[test]
    fn merge_takes_each_side_newest_field() {
        let local = snap(100)
            .with_field("inspector_notes", json!("cracked beam"), 100)
            .with_field("floors", json!(2), 10);
        let server = snap(500)
            .with_field("inspector_notes", json!(""), 10)
            .with_field("floors", json!(3), 500);
        let (local_before, server_before) = (local.clone(), server.clone());

        let merged = resolve(&local, &server, ResolutionPolicy::Merge);

        assert_eq!(merged.status, SyncStatus::Pending);
        assert_eq!(
            merged.snapshot.field("inspector_notes"),
            Some(&json!("cracked beam"))
        );
        assert_eq!(merged.snapshot.field("floors"), Some(&json!(3)));
        assert_eq!(merged.snapshot.updated_at, 500);
        assert_eq!(local, local_before);
        assert_eq!(server, server_before);
    }

    #[test]
    fn merge_falls_back_to_record_timestamps() {
        let mut local = snap(700);
        local.fields.insert("weather".into(), json!("rain"));
        let mut server = snap(500);
        server.fields.insert("weather".into(), json!("sun"));

        let merged = ConflictResolver::new().merge(&local, &server);
        assert_eq!(merged.field("weather"), Some(&json!("rain")));

        let merged = ConflictResolver::new().merge(&snap(100), &server);
        assert_eq!(merged.field("weather"), Some(&json!("sun")));
    }

    #[test]
    fn unstamped_side_is_dated_by_record_time() {
        let local = snap(200)
            .with_field("a", json!(2), 200)
            .with_field("b", json!(1), 100);
        let mut server = snap(300);
        server.fields.insert("a".into(), json!(1));
        server.fields.insert("b".into(), json!(2));

        let merged = ConflictResolver::new().merge(&local, &server);

        assert_eq!(merged.field("a"), Some(&json!(1)));
        assert_eq!(merged.field("b"), Some(&json!(2)));
        assert_eq!(merged.field_updated_at.get("b"), Some(&300));
    }

    #[test]
    fn stamped_field_newer_than_other_record_wins() {
        let mut local = snap(900);
        local.fields.insert("weather".into(), json!("rain"));
        let server = snap(100).with_field("weather", json!("sun"), 950);

        let merged = ConflictResolver::new().merge(&local, &server);
        assert_eq!(merged.field("weather"), Some(&json!("sun")));

        let server = snap(100).with_field("weather", json!("sun"), 100);
        let merged = ConflictResolver::new().merge(&local, &server);
        assert_eq!(merged.field("weather"), Some(&json!("rain")));
    }

    #[test]
    fn field_unknown_to_one_side_is_kept() {
        let local = snap(100).with_field("gps", json!("51.5,-0.1"), 100);
        let mut server = snap(500);
        server.fields.insert("floors".into(), json!(3));

        let merged = ConflictResolver::new().merge(&local, &server);

        assert_eq!(merged.field("gps"), Some(&json!("51.5,-0.1")));
        assert_eq!(merged.field("floors"), Some(&json!(3)));
    }

    #[test]
    fn local_wins_timestamp_ties() {
        let local = snap(500).with_field("floors", json!(2), 300);
        let server = snap(500).with_field("floors", json!(3), 300);

        let merged = ConflictResolver::new().merge(&local, &server);
        assert_eq!(merged.field("floors"), Some(&json!(2)));
    }

    #[test]
    fn identity_fields_keep_server_value() {
        let local = snap(900).with_field("record_number", json!("INS-0001"), 900);
        let server = snap(100).with_field("record_number", json!("INS-0042"), 100);

        let merged = ConflictResolver::new().merge(&local, &server);
        assert_eq!(merged.field("record_number"), Some(&json!("INS-0042")));

        let custom = ConflictResolver::with_identity_fields(["permit_id"]);
        let merged = custom.merge(&local, &server);
        assert_eq!(merged.field("record_number"), Some(&json!("INS-0001")));
    }

    #[test]
    fn merge_unites_attachment_refs() {
        let mut local = snap(100);
        local
            .attachment_refs
            .insert(AttachmentId::new("p1"), "https://cdn/p1".into());
        let mut server = snap(500);
        server
            .attachment_refs
            .insert(AttachmentId::new("p2"), "https://cdn/p2".into());

        let merged = ConflictResolver::new().merge(&local, &server);
        assert_eq!(merged.attachment_refs.len(), 2);
    }

    fn conflicted_store() -> MemoryStore {
        let store = MemoryStore::in_memory();
        let local = snap(100).with_field("address", json!("12 Main St"), 100);
        let mut record = StoredRecord::new_local(RecordId::new("r1"), local.fields.clone(), 100);
        record.server_updated_at = Some(50);
        let server = snap(500)
            .with_server_id("s1")
            .with_field("address", json!("14 Main St"), 500);
        record.enter_conflict(server, 600);
        store.put_record(record).unwrap();
        store
    }

    #[test]
    fn apply_keep_server_cleans_and_audits() {
        let store = conflicted_store();
        let resolver = ConflictResolver::new();

        let outcome = apply_resolution(
            &store,
            &resolver,
            &RecordId::new("r1"),
            ResolutionPolicy::KeepServer,
            "inspector-7",
        )
        .unwrap();

        let ResolutionOutcome::Resolved(record) = outcome else {
            panic!("expected a resolution");
        };
        assert_eq!(record.sync_status, SyncStatus::Clean);
        assert_eq!(record.fields.get("address"), Some(&json!("14 Main St")));
        assert_eq!(record.server_updated_at, Some(500));
        assert!(record.conflict.is_none());

        let audit = store.audit_entries(Some(&RecordId::new("r1"))).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].policy, ResolutionPolicy::KeepServer);
        assert_eq!(audit[0].actor, "inspector-7");
    }

    #[test]
    fn resolution_is_idempotent() {
        let store = conflicted_store();
        let resolver = ConflictResolver::new();
        let id = RecordId::new("r1");

        apply_resolution(&store, &resolver, &id, ResolutionPolicy::Merge, "a").unwrap();
        let after_first = store.get_record(&id).unwrap();

        let second =
            apply_resolution(&store, &resolver, &id, ResolutionPolicy::Merge, "a").unwrap();

        assert_eq!(second, ResolutionOutcome::AlreadyResolved);
        assert_eq!(store.get_record(&id).unwrap(), after_first);
        assert_eq!(store.audit_entries(None).unwrap().len(), 1);
    }

    #[test]
    fn missing_record_is_reported() {
        let store = MemoryStore::in_memory();
        let err = apply_resolution(
            &store,
            &ConflictResolver::new(),
            &RecordId::new("ghost"),
            ResolutionPolicy::Merge,
            "a",
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::RecordNotFound(_)));
    }

    #[test]
    fn batch_resolves_every_conflict() {
        let store = MemoryStore::in_memory();
        for i in 0..70 {
            let mut record =
                StoredRecord::new_local(RecordId::new(format!("r{i:02}")), Fields::new(), 1);
            record.enter_conflict(snap(5), 6);
            store.put_record(record).unwrap();
        }

        let batch =
            resolve_all(&store, &ConflictResolver::new(), ResolutionPolicy::KeepLocal, "a").unwrap();

        assert_eq!(batch.resolved.len(), 70);
        assert!(batch.failed.is_empty());
        assert_eq!(store.status_counts().conflict, 0);
        assert_eq!(store.status_counts().pending, 70);
    }

    fn field_map() -> impl Strategy<Value = BTreeMap<String, (i64, Timestamp)>> {
        prop::collection::btree_map("[a-d]", (0i64..5, 0i64..1000), 0..4)
    }

    fn to_snapshot(map: &BTreeMap<String, (i64, Timestamp)>, updated_at: Timestamp) -> RecordSnapshot {
        map.iter().fold(snap(updated_at), |s, (k, (v, t))| {
            s.with_field(k.clone(), json!(v), *t)
        })
    }

    proptest! {
        #[test]
        fn merge_is_deterministic(
            local in field_map(),
            server in field_map(),
            lt in 0i64..1000,
            st in 0i64..1000,
        ) {
            let local = to_snapshot(&local, lt);
            let server = to_snapshot(&server, st);
            let resolver = ConflictResolver::new();

            let a = resolver.merge(&local, &server);
            let b = resolver.merge(&local, &server);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.updated_at, server.updated_at);

            for (name, value) in &a.fields {
                prop_assert!(
                    local.fields.get(name) == Some(value) || server.fields.get(name) == Some(value)
                );
            }
        }
    }
}
