use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use idres_core::{ContactId, Observation};
use idres_store_sqlite::SqliteStore;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "idres")]
#[command(about = "Contact identity resolution CLI")]
struct Cli {
    #[arg(long, default_value = "./idres.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone_number: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    List,
    Show(ContactShowArgs),
}

#[derive(Debug, Args)]
struct ContactShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Identify(args) => run_identify(&args, &mut store),
        Command::Contact { command } => run_contact(command, &mut store),
        Command::Db { command } => run_db(command, &mut store),
    }
}

fn run_identify(args: &IdentifyArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let observation = Observation::new(args.email.clone(), args.phone_number.clone());
    let contact = store.reconcile(&observation)?;
    emit_json(serde_json::json!({ "contact": contact }))
}

fn run_contact(command: ContactCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ContactCommand::List => {
            let contacts = store.list_contacts()?;
            emit_json(serde_json::json!({
                "count": contacts.len(),
                "contacts": contacts
            }))
        }
        ContactCommand::Show(args) => {
            let view = store
                .cluster_view(ContactId(args.id))?
                .ok_or_else(|| anyhow!("contact not found: {}", args.id))?;
            emit_json(serde_json::json!({ "contact": view }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Export(args) => {
            store.migrate()?;
            let manifest = store.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = store.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in": args.input,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({ "out": args.out }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            emit_json(serde_json::json!({ "in": args.input }))
        }
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(serde_json::json!({
                "ok": report.quick_check_ok
                    && report.foreign_key_violations.is_empty()
                    && report.link_violations.is_empty(),
                "report": report
            }))
        }
    }
}
