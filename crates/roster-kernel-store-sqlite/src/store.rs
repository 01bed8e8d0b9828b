use std::fs;
use std::path::Path;
use std::time::Duration;

use roster_kernel_core::{KernelError, KernelResult, StoreConfig};
use rusqlite::{params, Connection, DatabaseName, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreResultExt;
use crate::schema::{
    now_rfc3339, table_exists, CREATE_SCHEMA_MIGRATIONS_SQL, LATEST_SCHEMA_VERSION,
    MIGRATION_001_SQL,
};

/// Scoped handle on one SQLite connection.
///
/// The connection is opened with foreign keys enforced and closed when the
/// store is dropped; nothing about it is process-global.
pub struct Store {
    conn: Connection,
    config: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl Store {
    /// Open the database named by `config` and apply connection pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(config: &StoreConfig) -> KernelResult<Self> {
        let conn = if config.is_in_memory() {
            Connection::open_in_memory().map_store("open in-memory database")?
        } else {
            Connection::open(&config.path)
                .map_store(&format!("open sqlite database at {}", config.path.display()))?
        };

        conn.pragma_update(None, "foreign_keys", true).map_store("enable foreign keys")?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_store("set busy_timeout")?;
        if !config.is_in_memory() {
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
                .map_store("enable WAL journal")?;
        }

        debug!(path = %config.path.display(), "opened store");
        Ok(Self { conn, config: config.clone() })
    }

    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory() -> KernelResult<Self> {
        Self::open(&StoreConfig::in_memory())
    }

    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Begin a `BEGIN IMMEDIATE` transaction so the write lock is taken up
    /// front and validation reads cannot be invalidated before commit.
    ///
    /// # Errors
    /// Returns `TransientStore` when the write lock is unavailable.
    pub fn write_transaction(&self) -> KernelResult<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .map_store("begin immediate transaction")
    }

    /// Begin a deferred transaction: reads inside it share one snapshot, so
    /// a row resolved by business identifier cannot vanish before it loads.
    ///
    /// # Errors
    /// Returns `TransientStore` when the database is locked.
    pub fn read_transaction(&self) -> KernelResult<Transaction<'_>> {
        Transaction::new_unchecked(&self.conn, TransactionBehavior::Deferred)
            .map_store("begin deferred transaction")
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> KernelResult<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_store("apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect()
        } else {
            Vec::new()
        };
        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply the base schema when it is missing. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error when bootstrapping fails or the database carries an
    /// unknown newer version.
    pub fn migrate(&self) -> KernelResult<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_store("apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == LATEST_SCHEMA_VERSION {
            return Ok(());
        }
        if version > LATEST_SCHEMA_VERSION {
            return Err(KernelError::storage(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        let tx = self.write_transaction()?;
        let preexisting = table_exists(&tx, "users")?;
        tx.execute_batch(MIGRATION_001_SQL).map_store("apply base schema")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![1_i64, now_rfc3339()?],
        )
        .map_store("record schema version 1")?;
        tx.commit().map_store("commit base schema")?;

        info!(version = LATEST_SCHEMA_VERSION, preexisting, "base schema applied");
        Ok(())
    }

    /// Copy the main database to `out_file` with the online backup API.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the backup fails.
    pub fn backup_to(&self, out_file: &Path) -> KernelResult<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                KernelError::storage(format!(
                    "failed to create backup directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .map_store(&format!("create sqlite backup at {}", out_file.display()))?;
        info!(path = %out_file.display(), "database backup written");
        Ok(())
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> KernelResult<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_store("run PRAGMA quick_check")?;

        let mut stmt =
            self.conn.prepare("PRAGMA foreign_key_check").map_store("prepare foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .map_store("run foreign_key_check")?;
        let foreign_key_violations =
            rows.collect::<Result<Vec<_>, _>>().map_store("read foreign_key_check")?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }
}

fn current_schema_version(conn: &Connection) -> KernelResult<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_store("read current schema version")
}
