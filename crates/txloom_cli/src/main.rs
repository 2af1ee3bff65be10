//! Audit trail inspection CLI.
//!
//! # Commands
//!
//! - `transactions` - newest transaction headers
//! - `changes` - change details of one transaction, in call order
//! - `history` - every change recorded for one record

use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use std::error::Error;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use txloom_core::{
    default_log_level, init_logging, open_db, AuditLog, AuditTables, SchemaManifest,
};

/// Reads the audit tables of a txloom SQLite database.
#[derive(Parser)]
#[command(name = "txloom")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite database file
    #[arg(global = true, long)]
    db: Option<PathBuf>,

    /// JSON schema manifest declaring custom audit tables
    #[arg(global = true, long)]
    schema: Option<PathBuf>,

    /// Directory for rotating log files; logging is off when absent
    #[arg(global = true, long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List transaction headers, newest first
    Transactions {
        /// Maximum number of headers to print
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },

    /// List the change details of one transaction
    Changes {
        /// Transaction log id
        #[arg(long)]
        tx: String,
    },

    /// List every change recorded for one record
    History {
        /// Logical entity name
        #[arg(long)]
        entity: String,

        /// Record id
        #[arg(long)]
        id: String,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if let Some(dir) = &cli.log_dir {
        let dir = absolute(dir)?;
        init_logging(default_log_level(), &dir.to_string_lossy())?;
    }

    let path = cli.db.ok_or("--db is required")?;
    let tables = audit_tables(cli.schema.as_deref())?;
    let db = open_db(&path)?;
    let audit = AuditLog::new(&db, tables);

    match cli.command {
        Command::Transactions { limit } => print_lines(&audit.transactions(limit)?)?,
        Command::Changes { tx } => print_lines(&audit.changes(&tx)?)?,
        Command::History { entity, id } => print_lines(&audit.history(&entity, &id)?)?,
    }
    info!("event=cli_done module=cli status=ok");
    Ok(())
}

fn audit_tables(manifest: Option<&Path>) -> Result<AuditTables, Box<dyn Error>> {
    let Some(manifest) = manifest else {
        return Ok(AuditTables::default_layout());
    };
    let raw = std::fs::read_to_string(manifest)?;
    let manifest = SchemaManifest::from_json_str(&raw)?;
    Ok(manifest
        .audit_tables()
        .ok_or("schema manifest declares no audit tables")?)
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn print_lines<T: Serialize>(entries: &[T]) -> Result<(), Box<dyn Error>> {
    let mut out = BufWriter::new(io::stdout().lock());
    for entry in entries {
        serde_json::to_writer(&mut out, entry)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
