//! Status command implementation.

use super::{format_time, open_store, print_json, CliResult, OutputFormat};
use fieldsync_protocol::Timestamp;
use fieldsync_store::{LocalStore, StatusCounts, LAST_SYNC_AT};
use serde::Serialize;
use std::path::Path;

/// Store status summary.
#[derive(Debug, Serialize)]
pub struct StatusResult {
    /// Store path.
    pub path: String,
    /// Counts per status.
    pub counts: StatusCounts,
    /// Server time of the last successful pass.
    pub last_sync_at: Option<Timestamp>,
}

/// Collects the status summary of an open store.
pub fn collect<S: LocalStore + ?Sized>(path: &Path, store: &S) -> CliResult<StatusResult> {
    let last_sync_at = store
        .get_metadata(LAST_SYNC_AT)?
        .and_then(|value| value.parse().ok());
    Ok(StatusResult {
        path: path.display().to_string(),
        counts: store.status_counts(),
        last_sync_at,
    })
}

/// Runs the status command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let store = open_store(path)?;
    let result = collect(path, &store)?;

    match format {
        OutputFormat::Json => print_json(&result)?,
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &StatusResult) {
    let counts = &result.counts;
    println!("FieldSync Store Status");
    println!("======================");
    println!();
    println!("Path:      {}", result.path);
    match result.last_sync_at {
        Some(at) => println!("Last sync: {}", format_time(at)),
        None => println!("Last sync: never"),
    }
    println!();
    println!("Records:");
    println!("  Clean:    {}", counts.clean);
    println!("  Pending:  {}", counts.pending);
    println!("  Syncing:  {}", counts.syncing);
    println!("  Conflict: {}", counts.conflict);
    println!("  Error:    {}", counts.error);
    println!();
    println!("Attachments:");
    println!("  Pending upload: {}", counts.pending_uploads);
    println!("  Uploading:      {}", counts.uploading);
    println!("  Failed:         {}", counts.failed_uploads);

    if counts.conflict > 0 {
        println!();
        println!("{} record(s) need a resolution; see `fieldsync conflicts`", counts.conflict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_store::{FileStore, LocalMutations};
    use fieldsync_testkit::report_fields;

    #[test]
    fn summarizes_counts_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open_dir(dir.path()).unwrap();
        store.create_record(report_fields("12 Main St")).unwrap();
        store.create_record(report_fields("14 Main St")).unwrap();
        store.set_metadata(LAST_SYNC_AT, "1715680800000").unwrap();

        let result = collect(dir.path(), &store).unwrap();

        assert_eq!(result.counts.pending, 2);
        assert_eq!(result.last_sync_at, Some(1_715_680_800_000));
    }

    #[test]
    fn unparseable_cursor_reads_as_never() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open_dir(dir.path()).unwrap();
        store.set_metadata(LAST_SYNC_AT, "yesterday").unwrap();

        assert_eq!(collect(dir.path(), &store).unwrap().last_sync_at, None);
    }
}
