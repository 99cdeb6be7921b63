//! Retry command implementation.

use super::{open_store, print_json, CliResult, OutputFormat};
use fieldsync_engine::{requeue_attachment, requeue_record};
use fieldsync_protocol::{AttachmentId, RecordId};
use serde::Serialize;
use std::path::Path;

/// Outcome of a retry.
#[derive(Debug, Serialize)]
pub struct RetryResult {
    /// Requeued id.
    pub id: String,
    /// `record` or `attachment`.
    pub kind: &'static str,
    /// Status after the retry.
    pub status: String,
}

/// Runs the retry command.
pub fn run(path: &Path, id: &str, attachment: bool, format: OutputFormat) -> CliResult<()> {
    let store = open_store(path)?;

    let result = if attachment {
        let requeued = requeue_attachment(&store, &AttachmentId::new(id))?;
        RetryResult {
            id: requeued.id.to_string(),
            kind: "attachment",
            status: requeued.sync_status.to_string(),
        }
    } else {
        let requeued = requeue_record(&store, &RecordId::new(id))?;
        RetryResult {
            id: requeued.id.to_string(),
            kind: "record",
            status: requeued.sync_status.to_string(),
        }
    };

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => println!(
            "Requeued {} {} ({}); it will be sent on the next sync",
            result.kind, result.id, result.status
        ),
    }
    Ok(())
}
