//! # FieldSync Testkit
//!
//! Test utilities for FieldSync.
//!
//! This crate provides:
//! - [`TestEnv`]: a memory store, a mock server and an engine wired together
//! - Inspection report fixtures and wall-clock helpers
//! - Temporary photo files for the upload pipeline
//! - An [`EventLog`] recording everything the engine emits
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fieldsync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_new_report() {
//!     let env = TestEnv::new();
//!     let record = env.create_report("12 Main St");
//!     env.engine.full_sync().await.unwrap();
//!     assert!(env.transport.server_record(&record.id).is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
