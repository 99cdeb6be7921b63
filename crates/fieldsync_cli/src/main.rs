//! FieldSync CLI
//!
//! Operator tools for a device's FieldSync store.
//!
//! # Commands
//!
//! - `status` - Record and attachment counts per status, last sync time
//! - `list` - List records, optionally filtered by status
//! - `show` - Show one record with its attachments
//! - `conflicts` - List conflicted records with both retained snapshots
//! - `resolve` / `resolve-all` - Apply a resolution policy
//! - `retry` - Requeue a record or attachment in error
//! - `audit` - Show the resolution audit trail

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// FieldSync command-line store tools.
#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format
    #[arg(global = true, short, long, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show counts per status and the last successful sync
    Status,

    /// List records
    List {
        /// Only records with this status (clean, pending, syncing, conflict, error)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one record
    Show {
        /// Record id
        id: String,
    },

    /// List conflicted records
    Conflicts,

    /// Resolve one conflicted record
    Resolve {
        /// Record id
        id: String,

        /// Resolution policy (keep_local, keep_server, merge)
        #[arg(long)]
        policy: String,

        /// Who is resolving, recorded in the audit trail
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Resolve every conflicted record with one policy
    ResolveAll {
        /// Resolution policy (keep_local, keep_server, merge)
        #[arg(long)]
        policy: String,

        /// Who is resolving, recorded in the audit trail
        #[arg(long, default_value = "operator")]
        actor: String,
    },

    /// Requeue a record (or attachment) in error
    Retry {
        /// Record or attachment id
        id: String,

        /// Treat the id as an attachment id
        #[arg(short, long)]
        attachment: bool,
    },

    /// Show the resolution audit trail
    Audit {
        /// Only entries for this record
        id: Option<String>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let format = cli.format;
    match cli.command {
        Commands::Status => {
            let path = cli.path.ok_or("Store path required for status")?;
            commands::status::run(&path, format)?;
        }
        Commands::List { status } => {
            let path = cli.path.ok_or("Store path required for list")?;
            commands::records::list(&path, status.as_deref(), format)?;
        }
        Commands::Show { id } => {
            let path = cli.path.ok_or("Store path required for show")?;
            commands::records::show(&path, &id, format)?;
        }
        Commands::Conflicts => {
            let path = cli.path.ok_or("Store path required for conflicts")?;
            commands::records::conflicts(&path, format)?;
        }
        Commands::Resolve { id, policy, actor } => {
            let path = cli.path.ok_or("Store path required for resolve")?;
            commands::resolve::run(&path, &id, &policy, &actor, format)?;
        }
        Commands::ResolveAll { policy, actor } => {
            let path = cli.path.ok_or("Store path required for resolve-all")?;
            commands::resolve::run_all(&path, &policy, &actor, format)?;
        }
        Commands::Retry { id, attachment } => {
            let path = cli.path.ok_or("Store path required for retry")?;
            commands::retry::run(&path, &id, attachment, format)?;
        }
        Commands::Audit { id } => {
            let path = cli.path.ok_or("Store path required for audit")?;
            commands::audit::run(&path, id.as_deref(), format)?;
        }
        Commands::Version => {
            println!("FieldSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("FieldSync Engine v{}", fieldsync_engine::VERSION);
        }
    }

    Ok(())
}
