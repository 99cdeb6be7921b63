//! Record listing commands: `list`, `show` and `conflicts`.

use super::{format_time, open_store, parse_arg, print_json, CliError, CliResult, OutputFormat};
use fieldsync_protocol::{RecordId, RecordSnapshot};
use fieldsync_store::{Attachment, LocalStore, StoredRecord, SyncStatus};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

/// Returns records with `status`, or every record.
pub fn select<S: LocalStore>(
    store: &S,
    status: Option<SyncStatus>,
) -> CliResult<Vec<StoredRecord>> {
    match status {
        Some(status) => Ok(store.query_records(status).collect::<Result<_, _>>()?),
        None => Ok(store.all_records()?),
    }
}

/// Runs the list command.
pub fn list(path: &Path, status: Option<&str>, format: OutputFormat) -> CliResult<()> {
    let status = status.map(parse_arg::<SyncStatus>).transpose()?;
    let store = open_store(path)?;
    let records = select(&store, status)?;

    match format {
        OutputFormat::Json => print_json(&records)?,
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No records");
            }
            for record in &records {
                print!(
                    "{:<38} {:<9} edited {}",
                    record.id.as_str(),
                    record.sync_status.as_str(),
                    format_time(record.local_updated_at)
                );
                if record.retry_count > 0 {
                    print!("  retries {}", record.retry_count);
                }
                if let Some(error) = &record.last_error {
                    print!("  [{error}]");
                }
                println!();
            }
        }
    }
    Ok(())
}

/// One record with its attachments.
#[derive(Debug, Serialize)]
pub struct RecordDetail {
    /// The record.
    pub record: StoredRecord,
    /// Attachments owned by the record.
    pub attachments: Vec<Attachment>,
}

/// Loads one record with its attachments.
pub fn detail<S: LocalStore>(store: &S, id: &RecordId) -> CliResult<RecordDetail> {
    let record = store
        .get_record(id)?
        .ok_or_else(|| CliError::InvalidArgument(format!("record not found: {id}")))?;
    let attachments = store.attachments_for_record(id)?;
    Ok(RecordDetail {
        record,
        attachments,
    })
}

/// Runs the show command.
pub fn show(path: &Path, id: &str, format: OutputFormat) -> CliResult<()> {
    let store = open_store(path)?;
    let detail = detail(&store, &RecordId::new(id))?;

    match format {
        OutputFormat::Json => print_json(&detail)?,
        OutputFormat::Text => print_detail(&detail),
    }
    Ok(())
}

fn print_detail(detail: &RecordDetail) {
    let record = &detail.record;
    println!("Record {}", record.id);
    println!("  Status:      {}", record.sync_status);
    if let Some(server_id) = &record.server_id {
        println!("  Server id:   {server_id}");
    }
    println!("  Edited:      {}", format_time(record.local_updated_at));
    match record.server_updated_at {
        Some(at) => println!("  Server base: {}", format_time(at)),
        None => println!("  Server base: never pushed"),
    }
    if record.deleted {
        println!("  Deleted");
    }
    if record.retry_count > 0 {
        println!("  Retries:     {}", record.retry_count);
    }
    if let Some(error) = &record.last_error {
        println!("  Last error:  {error}");
    }

    println!();
    println!("Fields:");
    for (name, value) in &record.fields {
        println!("  {name}: {value}");
    }

    if !detail.attachments.is_empty() {
        println!();
        println!("Attachments:");
        for attachment in &detail.attachments {
            println!(
                "  {} {} {} bytes ({})",
                attachment.id,
                attachment.sync_status,
                attachment.size_bytes,
                attachment.content_type
            );
        }
    }
}

/// A field whose value differs between the two sides of a conflict.
#[derive(Debug, PartialEq, Serialize)]
pub struct FieldDiff {
    /// Field name.
    pub name: String,
    /// Local value, if present.
    pub local: Option<Value>,
    /// Server value, if present.
    pub server: Option<Value>,
}

/// Fields that differ between two snapshots, ordered by name.
pub fn diff(local: &RecordSnapshot, server: &RecordSnapshot) -> Vec<FieldDiff> {
    let names: BTreeSet<&String> = local.fields.keys().chain(server.fields.keys()).collect();
    names
        .into_iter()
        .filter_map(|name| {
            let l = local.fields.get(name);
            let s = server.fields.get(name);
            (l != s).then(|| FieldDiff {
                name: name.clone(),
                local: l.cloned(),
                server: s.cloned(),
            })
        })
        .collect()
}

/// Runs the conflicts command.
pub fn conflicts(path: &Path, format: OutputFormat) -> CliResult<()> {
    let store = open_store(path)?;
    let records = select(&store, Some(SyncStatus::Conflict))?;

    if format == OutputFormat::Json {
        return print_json(&records);
    }

    if records.is_empty() {
        println!("No conflicts");
        return Ok(());
    }
    for record in &records {
        let Some(payload) = &record.conflict else {
            continue;
        };
        println!(
            "Record {} (detected {})",
            record.id,
            format_time(payload.detected_at)
        );
        println!(
            "  local edited {}, server version {}",
            format_time(payload.local.updated_at),
            format_time(payload.server.updated_at)
        );
        for change in diff(&payload.local, &payload.server) {
            println!(
                "  {}: local {} | server {}",
                change.name,
                render(change.local.as_ref()),
                render(change.server.as_ref())
            );
        }
        if payload.local.deleted != payload.server.deleted {
            println!(
                "  deleted: local {} | server {}",
                payload.local.deleted, payload.server.deleted
            );
        }
        println!();
    }
    println!("{} conflict(s)", records.len());
    Ok(())
}

fn render(value: Option<&Value>) -> String {
    value.map_or_else(|| "(absent)".to_string(), Value::to_string)
}
