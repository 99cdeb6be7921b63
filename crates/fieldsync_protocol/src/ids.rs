//! Identifiers and timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unix time in milliseconds.
///
/// Server snapshots carry server-authoritative timestamps; local mutations
/// are stamped with the device clock.
pub type Timestamp = i64;

/// Returns the current wall-clock time in Unix milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Stable client-generated record identifier.
    ///
    /// Records are created offline, so the id is assigned on the device and
    /// never changes. Status queries order records by this id.
    RecordId
);

string_id!(
    /// Stable client-generated attachment identifier.
    AttachmentId
);

string_id!(
    /// Identifier assigned by the server on the first accepted push.
    ServerId
);

impl RecordId {
    /// Generates a fresh random record id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl AttachmentId {
    /// Generates a fresh random attachment id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
