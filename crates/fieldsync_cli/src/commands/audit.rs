//! Audit command implementation.

use super::{format_time, open_store, print_json, CliResult, OutputFormat};
use fieldsync_protocol::RecordId;
use fieldsync_store::LocalStore;
use std::path::Path;

/// Runs the audit command.
pub fn run(path: &Path, id: Option<&str>, format: OutputFormat) -> CliResult<()> {
    let store = open_store(path)?;
    let id = id.map(RecordId::new);
    let entries = store.audit_entries(id.as_ref())?;

    match format {
        OutputFormat::Json => print_json(&entries)?,
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No resolutions recorded");
            }
            for entry in &entries {
                println!(
                    "{}  {:<38} {:<11} by {}",
                    format_time(entry.at),
                    entry.record_id.as_str(),
                    entry.policy.as_str(),
                    entry.actor
                );
            }
        }
    }
    Ok(())
}
