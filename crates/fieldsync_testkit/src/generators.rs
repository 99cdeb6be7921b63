//! Property-based test generators using proptest.
//!
//! Provides strategies for generating records and snapshots that maintain
//! the invariants the engine relies on (every stamped field exists, ids are
//! shared between the two sides of a conflict).

use fieldsync_protocol::{Fields, RecordSnapshot, Timestamp};
use fieldsync_store::ResolutionPolicy;
use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for generating field names, including the identity field.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("address".to_string()),
        Just("floors".to_string()),
        Just("inspector_notes".to_string()),
        Just("record_number".to_string()),
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
    ]
}

/// Strategy for generating JSON field values.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        (-1000i64..1000).prop_map(|n| json!(n)),
        prop::string::string_regex("[A-Za-z0-9 ]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::String),
        Just(Value::Null),
    ]
}

/// Strategy for generating timestamps within one day.
pub fn timestamp_strategy() -> impl Strategy<Value = Timestamp> {
    1_715_680_800_000i64..1_715_767_200_000i64
}

/// Strategy for generating a field map.
pub fn fields_strategy() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map(field_name_strategy(), field_value_strategy(), 0..6)
}

/// Strategy for generating a snapshot of record `id`.
///
/// Each field is stamped with probability one half, so snapshots with and
/// without field provenance are both covered.
pub fn snapshot_strategy(id: &'static str) -> impl Strategy<Value = RecordSnapshot> {
    (
        prop::collection::btree_map(
            field_name_strategy(),
            (field_value_strategy(), prop::option::of(timestamp_strategy())),
            0..6,
        ),
        timestamp_strategy(),
        any::<bool>(),
    )
        .prop_map(move |(fields, updated_at, deleted)| {
            let mut snapshot = RecordSnapshot::new(id, Fields::new(), updated_at);
            for (name, (value, stamp)) in fields {
                if let Some(stamp) = stamp {
                    snapshot.field_updated_at.insert(name.clone(), stamp);
                }
                snapshot.fields.insert(name, value);
            }
            snapshot.deleted = deleted;
            snapshot
        })
}

/// Strategy for generating the local and server sides of one record.
pub fn conflict_pair_strategy() -> impl Strategy<Value = (RecordSnapshot, RecordSnapshot)> {
    (snapshot_strategy("r1"), snapshot_strategy("r1"))
}

/// Strategy for generating resolution policies.
pub fn policy_strategy() -> impl Strategy<Value = ResolutionPolicy> {
    prop_oneof![
        Just(ResolutionPolicy::KeepLocal),
        Just(ResolutionPolicy::KeepServer),
        Just(ResolutionPolicy::Merge),
    ]
}
