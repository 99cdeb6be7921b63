//! CLI command implementations.

pub mod audit;
pub mod records;
pub mod resolve;
pub mod retry;
pub mod status;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use fieldsync_engine::SyncError;
use fieldsync_protocol::Timestamp;
use fieldsync_store::{FileStore, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// Pretty-printed JSON
    Json,
}

/// Errors reported by commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No store directory at the given path.
    #[error("No store found at {0:?}")]
    NoStore(PathBuf),

    /// Invalid command argument.
    #[error("{0}")]
    InvalidArgument(String),

    /// Store error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Engine error.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// JSON output error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result type for commands.
pub type CliResult<T> = Result<T, CliError>;

/// Opens an existing store directory.
pub fn open_store(path: &Path) -> CliResult<FileStore> {
    if !path.is_dir() {
        return Err(CliError::NoStore(path.to_path_buf()));
    }
    tracing::debug!(path = %path.display(), "opening store");
    Ok(FileStore::open_dir(path)?)
}

/// Parses a `FromStr` argument, mapping the error to [`CliError::InvalidArgument`].
pub fn parse_arg<T>(value: &str) -> CliResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(CliError::InvalidArgument)
}

/// Prints a value as pretty JSON.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Formats unix milliseconds as RFC 3339.
pub fn format_time(ts: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
