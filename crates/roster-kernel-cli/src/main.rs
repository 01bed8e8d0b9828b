use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use roster_kernel_core::KernelConfig;
use roster_kernel_store_sqlite::{
    IntegrityAuditor, Migration, MigrationExecutor, QueryHints, Store,
};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLI_CONTRACT_VERSION: &str = "rk.v1";

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Roster kernel administration: schema, integrity audits, migrations")]
struct Cli {
    /// Database path; overrides `store.path` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,

    /// YAML or JSON kernel configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Migration {
        #[command(subcommand)]
        command: MigrationCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Status,
    Migrate,
    IntegrityCheck,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    /// Constraints referencing a column.
    ForeignKeys(ColumnArgs),
    Orphans(OrphanArgs),
    UnusedColumn(UnusedColumnArgs),
    /// Orphan scan over every declared foreign key.
    Scan,
}

#[derive(Debug, Args)]
struct ColumnArgs {
    #[arg(long)]
    table: String,
    #[arg(long)]
    column: String,
}

#[derive(Debug, Args)]
struct OrphanArgs {
    #[arg(long)]
    child_table: String,
    #[arg(long)]
    child_column: String,
    #[arg(long)]
    parent_table: String,
    #[arg(long)]
    parent_column: String,
}

#[derive(Debug, Args)]
struct UnusedColumnArgs {
    #[command(flatten)]
    target: ColumnArgs,
    /// Application query that must keep working; repeatable.
    #[arg(long = "hint")]
    hints: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum MigrationCommand {
    Plan(MigrationFileArgs),
    Run(MigrationFileArgs),
    /// Clear a lock left by a crashed run.
    Unlock,
}

#[derive(Debug, Args)]
struct MigrationFileArgs {
    #[arg(long)]
    file: PathBuf,
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

fn emit<T: Serialize>(what: &str, value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value).with_context(|| format!("failed to serialize {what}"))?)
}

fn init_tracing() {
    // Logs go to stderr; stdout carries exactly one JSON document.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(cli: &Cli) -> Result<KernelConfig> {
    let mut config = match &cli.config {
        Some(path) => KernelConfig::from_path(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => KernelConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.store.path.clone_from(db);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn open_store(config: &KernelConfig) -> Result<Store> {
    Store::open(&config.store)
        .with_context(|| format!("failed to open database {}", config.store.path.display()))
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = open_store(&config)?;
    match cli.command {
        Command::Db { command } => run_db(command, &store),
        Command::Audit { command } => {
            store.migrate()?;
            run_audit(command, &store)
        }
        Command::Migration { command } => {
            store.migrate()?;
            run_migration(command, &store, &config)
        }
    }
}

fn run_db(command: DbCommand, store: &Store) -> Result<()> {
    match command {
        DbCommand::Status => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate => {
            let before = store.schema_status()?;
            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::IntegrityCheck => emit("integrity report", &store.integrity_check()?),
        DbCommand::Backup(args) => run_db_backup(&args.out, store),
    }
}

fn run_db_backup(out: &Path, store: &Store) -> Result<()> {
    store.backup_to(out)?;
    emit_json(serde_json::json!({ "backup_path": out, "status": "ok" }))
}

fn run_audit(command: AuditCommand, store: &Store) -> Result<()> {
    let auditor = IntegrityAuditor::new();
    let conn = store.conn();
    match command {
        AuditCommand::ForeignKeys(args) => {
            let foreign_keys = auditor.list_foreign_keys(conn, &args.table, &args.column)?;
            emit_json(serde_json::json!({
                "table": args.table,
                "column": args.column,
                "foreign_keys": foreign_keys
            }))
        }
        AuditCommand::Orphans(args) => {
            let orphans = auditor.find_orphans(
                conn,
                &args.child_table,
                &args.child_column,
                &args.parent_table,
                &args.parent_column,
            )?;
            emit_json(serde_json::json!({
                "child": format!("{}.{}", args.child_table, args.child_column),
                "parent": format!("{}.{}", args.parent_table, args.parent_column),
                "orphan_count": orphans.len(),
                "orphans": orphans
            }))
        }
        AuditCommand::UnusedColumn(args) => {
            let hints: QueryHints = args.hints.into_iter().collect();
            let table = &args.target.table;
            let column = &args.target.column;
            let dependencies = auditor.column_dependencies(conn, table, column, &hints)?;
            emit_json(serde_json::json!({
                "table": table,
                "column": column,
                "unused": dependencies.is_empty(),
                "dependencies": dependencies
            }))
        }
        AuditCommand::Scan => emit("audit report", &auditor.scan(conn)?),
    }
}

fn run_migration(command: MigrationCommand, store: &Store, config: &KernelConfig) -> Result<()> {
    let executor = MigrationExecutor::new(store, config);
    match command {
        MigrationCommand::Plan(args) => {
            let migration = read_migration(&args.file)?;
            emit("migration plan", &executor.plan(&migration)?)
        }
        MigrationCommand::Run(args) => {
            let migration = read_migration(&args.file)?;
            let report = executor.run(&migration)?;
            emit("migration report", &report)?;
            match report.failed_step() {
                Some((index, error)) => {
                    Err(anyhow!("migration {} failed at step {index}: {error}", report.migration))
                }
                None => Ok(()),
            }
        }
        MigrationCommand::Unlock => {
            let released = MigrationExecutor::release_lock(store)?;
            emit_json(serde_json::json!({ "released": released }))
        }
    }
}

fn read_migration(path: &Path) -> Result<Migration> {
    Migration::from_path(path)
        .with_context(|| format!("failed to read migration file {}", path.display()))
}
