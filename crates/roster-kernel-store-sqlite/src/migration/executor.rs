//! Serialized, journaled execution of migration plans.

use std::path::PathBuf;

use roster_kernel_core::{KernelConfig, KernelError, KernelResult, MigrationConfig, RetryPolicy};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auditor::IntegrityAuditor;
use crate::error::StoreResultExt;
use crate::migration::apply::apply_step;
use crate::migration::planner::{MigrationPlan, MigrationPlanner, StepPlan};
use crate::migration::step::Migration;
use crate::schema::now_rfc3339;
use crate::store::Store;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    PreconditionChecked,
    Applied,
    Skipped,
    Failed { error: KernelError },
}

impl StepStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PreconditionChecked => "precondition_checked",
            Self::Applied => "applied",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepReport {
    pub index: usize,
    pub kind: String,
    pub description: String,
    #[serde(flatten)]
    pub status: StepStatus,
    pub rows_affected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationReport {
    pub migration: String,
    pub steps: Vec<StepReport>,
}

impl MigrationReport {
    #[must_use]
    pub fn failed_step(&self) -> Option<(usize, &KernelError)> {
        self.steps.iter().find_map(|step| match &step.status {
            StepStatus::Failed { error } => Some((step.index, error)),
            _ => None,
        })
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed_step().is_none()
    }

    /// Surface the failing step's error, if any.
    ///
    /// # Errors
    /// Returns the error attached to the first failed step.
    pub fn into_result(self) -> KernelResult<Self> {
        match self.failed_step() {
            Some((_, error)) => Err(error.clone()),
            None => Ok(self),
        }
    }
}

/// Holds the single `migration_lock` row; released on every exit path.
struct MigrationLock<'c> {
    conn: &'c Connection,
    holder: String,
}

impl<'c> MigrationLock<'c> {
    fn acquire(conn: &'c Connection, holder: &str) -> KernelResult<Self> {
        let inserted = conn.execute(
            "INSERT INTO migration_lock(id, holder, acquired_at) VALUES (1, ?1, ?2)",
            params![holder, now_rfc3339()?],
        );
        match inserted.map_store("acquire migration lock") {
            Ok(_) => Ok(Self { conn, holder: holder.to_string() }),
            Err(KernelError::Conflict { .. }) => {
                let current: Option<(String, String)> = conn
                    .query_row("SELECT holder, acquired_at FROM migration_lock WHERE id = 1", [], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .optional()
                    .map_store("read migration lock")?;
                let (current, since) = current.unwrap_or_default();
                Err(KernelError::conflict(
                    "migration_lock",
                    current,
                    format!("another migration run holds the lock since {since}"),
                ))
            }
            Err(err) => Err(err),
        }
    }
}

impl Drop for MigrationLock<'_> {
    fn drop(&mut self) {
        let released = self
            .conn
            .execute("DELETE FROM migration_lock WHERE id = 1 AND holder = ?1", params![self.holder]);
        if let Err(err) = released {
            tracing::error!(holder = %self.holder, error = %err, "failed to release migration lock");
        }
    }
}

/// Applies migrations against one store, one step per transaction.
pub struct MigrationExecutor<'s> {
    store: &'s Store,
    planner: MigrationPlanner,
    retry: RetryPolicy,
    config: MigrationConfig,
}

impl<'s> MigrationExecutor<'s> {
    #[must_use]
    pub fn new(store: &'s Store, config: &KernelConfig) -> Self {
        Self {
            store,
            planner: MigrationPlanner::new(IntegrityAuditor::new()),
            retry: config.retry,
            config: config.migration.clone(),
        }
    }

    /// Dry run: evaluate every step without applying anything.
    ///
    /// # Errors
    /// Returns a storage error when the catalog cannot be read.
    pub fn plan(&self, migration: &Migration) -> KernelResult<MigrationPlan> {
        self.planner.plan(self.store.conn(), migration)
    }

    /// Plan, then apply each step after a point-in-time re-check.
    ///
    /// A step blocked at plan time aborts the run before anything is
    /// applied. Failures during application stop the run; earlier steps
    /// stay committed. The outcome is reported per step rather than as an
    /// `Err`, see [`MigrationReport::into_result`].
    ///
    /// # Errors
    /// Returns `Conflict` when another run holds the migration lock, or a
    /// storage error when the plan or backup cannot be produced.
    pub fn run(&self, migration: &Migration) -> KernelResult<MigrationReport> {
        let conn = self.store.conn();
        let _lock = MigrationLock::acquire(conn, &migration.name)?;
        info!(migration = %migration.name, steps = migration.steps.len(), "migration run started");

        let plan = self.planner.plan(conn, migration)?;
        let mut steps: Vec<StepReport> = plan
            .steps
            .iter()
            .map(|planned| StepReport {
                index: planned.index,
                kind: planned.kind.clone(),
                description: planned.description.clone(),
                status: StepStatus::Pending,
                rows_affected: 0,
            })
            .collect();

        if let Some((blocked_at, error)) = plan.first_blocker() {
            for report in steps.iter_mut().take(blocked_at) {
                report.status = StepStatus::PreconditionChecked;
            }
            steps[blocked_at].status = StepStatus::Failed { error: error.clone() };
            warn!(migration = %migration.name, step = blocked_at, %error, "migration aborted before applying any step");
            self.journal(conn, &migration.name, &steps[blocked_at]);
            return Ok(MigrationReport { migration: migration.name.clone(), steps });
        }

        if let Some(path) = self.backup_path(&migration.name)? {
            self.store.backup_to(&path)?;
        }

        for (index, step) in migration.steps.iter().enumerate() {
            let report = &mut steps[index];
            let status = match self.planner.check_now(conn, index, step, &migration.query_hints) {
                Ok(StepPlan::AlreadyApplied { reason }) => {
                    info!(migration = %migration.name, index, step = step.kind(), %reason, "step skipped");
                    StepStatus::Skipped
                }
                Ok(StepPlan::Blocked { error }) => StepStatus::Failed { error },
                Ok(StepPlan::Ready) => {
                    report.status = StepStatus::PreconditionChecked;
                    match apply_step(conn, step, &self.retry, self.config.backfill_batch_size) {
                        Ok(rows) => {
                            report.rows_affected = rows;
                            info!(migration = %migration.name, index, step = step.kind(), rows, "step applied");
                            StepStatus::Applied
                        }
                        Err(error) => StepStatus::Failed { error: error.at_step(index) },
                    }
                }
                Err(error) => StepStatus::Failed { error },
            };
            report.status = status;
            let failed = matches!(report.status, StepStatus::Failed { .. });
            if let StepStatus::Failed { error } = &report.status {
                warn!(migration = %migration.name, index, step = step.kind(), %error, "step failed");
            }
            self.journal(conn, &migration.name, &steps[index]);
            if failed {
                break;
            }
        }

        Ok(MigrationReport { migration: migration.name.clone(), steps })
    }

    /// Clear a lock left behind by a crashed run.
    ///
    /// # Errors
    /// Returns a storage error when the lock table cannot be written.
    pub fn release_lock(store: &Store) -> KernelResult<bool> {
        let removed = store
            .conn()
            .execute("DELETE FROM migration_lock WHERE id = 1", [])
            .map_store("release migration lock")?;
        if removed > 0 {
            warn!("stale migration lock released");
        }
        Ok(removed > 0)
    }

    fn backup_path(&self, migration: &str) -> KernelResult<Option<PathBuf>> {
        let Some(dir) = &self.config.backup_dir else {
            return Ok(None);
        };
        if self.store.config().is_in_memory() {
            return Ok(None);
        }
        let stem: String = migration
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Ok(Some(dir.join(format!("{stem}-{}.db", ulid::Ulid::new()))))
    }

    fn journal(&self, conn: &Connection, migration: &str, report: &StepReport) {
        let detail = match &report.status {
            StepStatus::Failed { error } => Some(error.to_string()),
            _ => None,
        };
        let recorded = now_rfc3339().and_then(|now| {
            conn.execute(
                "INSERT INTO migration_journal(migration_name, step_index, step_kind, status, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    migration,
                    i64::try_from(report.index).unwrap_or(i64::MAX),
                    report.kind,
                    report.status.as_str(),
                    detail,
                    now
                ],
            )
            .map_store("write migration journal")
        });
        if let Err(error) = recorded {
            warn!(migration, index = report.index, %error, "migration journal write failed");
        }
    }
}
