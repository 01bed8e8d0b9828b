//! Precondition evaluation for migration steps.
//!
//! The planner walks a migration against the live schema plus an overlay of
//! what earlier steps in the same migration will have done, so a plan can
//! drop a foreign key and then the column it guarded. The executor reuses
//! the same evaluation with an empty overlay for its point-in-time re-check.

use std::collections::{HashMap, HashSet};

use roster_kernel_core::{KernelError, KernelResult};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auditor::{foreign_key_name, ColumnDependency, ForeignKeyRef, IntegrityAuditor, QueryHints};
use crate::error::StoreResultExt;
use crate::migration::step::{ConstraintDef, Migration, MigrationStep, OnDelete};
use crate::schema::{index_list, primary_key_columns, quote, require_table, table_has_column};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepPlan {
    Ready,
    AlreadyApplied { reason: String },
    Blocked { error: KernelError },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedStep {
    pub index: usize,
    pub kind: String,
    pub description: String,
    pub plan: StepPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationPlan {
    pub migration: String,
    pub steps: Vec<PlannedStep>,
}

impl MigrationPlan {
    /// First blocking error, which aborts the whole run before any step applies.
    #[must_use]
    pub fn first_blocker(&self) -> Option<(usize, &KernelError)> {
        self.steps.iter().find_map(|step| match &step.plan {
            StepPlan::Blocked { error } => Some((step.index, error)),
            _ => None,
        })
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.first_blocker().is_none()
    }
}

/// Effects of earlier steps not yet visible in the catalog. Names are
/// lower-cased; SQLite identifiers are case-insensitive.
#[derive(Debug, Default)]
pub(crate) struct Overlay {
    /// Added columns with their non-NULL default, if any.
    added_columns: HashMap<(String, String), Option<String>>,
    dropped_columns: HashSet<(String, String)>,
    added_constraints: HashSet<(String, String)>,
    dropped_constraints: HashSet<(String, String)>,
    /// Constraints added earlier, keyed by each column they pin.
    pinned: Vec<((String, String), ColumnDependency)>,
}

fn key(table: &str, name: &str) -> (String, String) {
    (table.to_ascii_lowercase(), name.to_ascii_lowercase())
}

impl Overlay {
    fn column_exists(&self, conn: &Connection, table: &str, column: &str) -> KernelResult<bool> {
        let key = key(table, column);
        if self.added_columns.contains_key(&key) {
            return Ok(true);
        }
        if self.dropped_columns.contains(&key) {
            return Ok(false);
        }
        table_has_column(conn, table, column)
    }

    fn column_is_live(&self, conn: &Connection, table: &str, column: &str) -> KernelResult<bool> {
        let key = key(table, column);
        Ok(!self.added_columns.contains_key(&key)
            && !self.dropped_columns.contains(&key)
            && table_has_column(conn, table, column)?)
    }

    fn is_added(&self, table: &str, column: &str) -> bool {
        self.added_columns.contains_key(&key(table, column))
    }

    /// SQL for the value every row holds in `table.column` once earlier steps
    /// ran: the column itself when live, the default of a pending column, or
    /// `None` when a pending column is NULL throughout.
    fn value_sql(&self, table: &str, column: &str) -> Option<String> {
        match self.added_columns.get(&key(table, column)) {
            Some(default) => default.as_ref().map(|value| format!("({value})")),
            None => Some(quote(column)),
        }
    }

    fn constraint_dropped(&self, table: &str, name: &str) -> bool {
        self.dropped_constraints.contains(&key(table, name))
    }

    fn constraint_added(&self, table: &str, name: &str) -> bool {
        self.added_constraints.contains(&key(table, name))
    }

    fn pinned_on<'o>(&'o self, table: &str, column: &str) -> impl Iterator<Item = &'o ColumnDependency> {
        let wanted = key(table, column);
        self.pinned.iter().filter(move |(pinned, _)| *pinned == wanted).map(|(_, dep)| dep)
    }

    fn pin_foreign_key(&mut self, foreign_key: ForeignKeyRef) {
        self.pinned.push((
            key(&foreign_key.target_table, &foreign_key.target_column),
            ColumnDependency::InboundForeignKey { foreign_key: foreign_key.clone() },
        ));
        self.pinned.push((
            key(&foreign_key.source_table, &foreign_key.source_column),
            ColumnDependency::OutboundForeignKey { foreign_key },
        ));
    }

    fn record(&mut self, step: &MigrationStep) {
        match step {
            MigrationStep::AddColumn { table, column } => {
                self.dropped_columns.remove(&key(table, &column.name));
                let default =
                    column.default.clone().filter(|value| !value.trim().eq_ignore_ascii_case("NULL"));
                self.added_columns.insert(key(table, &column.name), default);
                if let Some(reference) = &column.references {
                    let name = foreign_key_name(table, &column.name);
                    self.added_constraints.insert(key(table, &name));
                    self.pin_foreign_key(ForeignKeyRef {
                        source_table: table.clone(),
                        source_column: column.name.clone(),
                        target_table: reference.table.clone(),
                        target_column: reference.column.clone(),
                        constraint_name: name,
                        on_delete: OnDelete::NoAction.as_sql().to_string(),
                    });
                }
            }
            MigrationStep::DropColumn { table, column } => {
                self.added_columns.remove(&key(table, column));
                self.dropped_columns.insert(key(table, column));
            }
            MigrationStep::AddConstraint { constraint } => {
                let name = constraint.name();
                self.dropped_constraints.remove(&key(constraint.table(), &name));
                self.added_constraints.insert(key(constraint.table(), &name));
                match constraint {
                    ConstraintDef::Unique { table, columns, .. } => {
                        for column in columns {
                            self.pinned.push((
                                key(table, column),
                                ColumnDependency::Index {
                                    name: name.clone(),
                                    unique: true,
                                    origin: "c".to_string(),
                                },
                            ));
                        }
                    }
                    ConstraintDef::ForeignKey { table, column, references, on_delete } => {
                        self.pin_foreign_key(ForeignKeyRef {
                            source_table: table.clone(),
                            source_column: column.clone(),
                            target_table: references.table.clone(),
                            target_column: references.column.clone(),
                            constraint_name: name,
                            on_delete: on_delete.as_sql().to_string(),
                        });
                    }
                }
            }
            MigrationStep::DropConstraint { table, name } => {
                self.added_constraints.remove(&key(table, name));
                self.dropped_constraints.insert(key(table, name));
            }
            MigrationStep::Backfill { .. } => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrationPlanner {
    auditor: IntegrityAuditor,
}

impl MigrationPlanner {
    #[must_use]
    pub fn new(auditor: IntegrityAuditor) -> Self {
        Self { auditor }
    }

    /// Evaluate every step in order without touching the schema.
    ///
    /// Blocked steps are reported in the plan rather than as an `Err`; only
    /// failures to read the store surface as errors.
    ///
    /// # Errors
    /// Returns a storage or transient error when the catalog cannot be read.
    pub fn plan(&self, conn: &Connection, migration: &Migration) -> KernelResult<MigrationPlan> {
        let mut overlay = Overlay::default();
        let mut steps = Vec::with_capacity(migration.steps.len());
        for (index, step) in migration.steps.iter().enumerate() {
            let plan = self.evaluate(conn, index, step, &migration.query_hints, &overlay)?;
            if plan == StepPlan::Ready {
                overlay.record(step);
            }
            if let StepPlan::Blocked { error } = &plan {
                warn!(migration = %migration.name, index, step = step.kind(), %error, "step blocked");
            }
            steps.push(PlannedStep {
                index,
                kind: step.kind().to_string(),
                description: step.describe(),
                plan,
            });
        }
        Ok(MigrationPlan { migration: migration.name.clone(), steps })
    }

    /// Point-in-time precondition check of a single step.
    pub(crate) fn check_now(
        &self,
        conn: &Connection,
        index: usize,
        step: &MigrationStep,
        hints: &QueryHints,
    ) -> KernelResult<StepPlan> {
        self.evaluate(conn, index, step, hints, &Overlay::default())
    }

    fn evaluate(
        &self,
        conn: &Connection,
        index: usize,
        step: &MigrationStep,
        hints: &QueryHints,
        overlay: &Overlay,
    ) -> KernelResult<StepPlan> {
        let outcome = step
            .validate_syntax()
            .and_then(|()| require_table(conn, step.table()))
            .and_then(|()| self.evaluate_step(conn, index, step, hints, overlay));
        match outcome {
            Ok(plan) => {
                debug!(index, step = step.kind(), ?plan, "step evaluated");
                Ok(plan)
            }
            Err(err) if is_store_failure(&err) => Err(err),
            Err(err) => Ok(StepPlan::Blocked { error: err.at_step(index) }),
        }
    }

    fn evaluate_step(
        &self,
        conn: &Connection,
        index: usize,
        step: &MigrationStep,
        hints: &QueryHints,
        overlay: &Overlay,
    ) -> KernelResult<StepPlan> {
        match step {
            MigrationStep::AddColumn { table, column } => {
                if overlay.column_exists(conn, table, &column.name)? {
                    return Ok(already(format!("column {table}.{} exists", column.name)));
                }
                if let Some(reference) = &column.references {
                    require_table(conn, &reference.table)?;
                    if !overlay.column_exists(conn, &reference.table, &reference.column)? {
                        return Err(KernelError::not_found(
                            "column",
                            format!("{}.{}", reference.table, reference.column),
                        ));
                    }
                }
                Ok(StepPlan::Ready)
            }
            MigrationStep::DropColumn { table, column } => {
                if !overlay.column_exists(conn, table, column)? {
                    return Ok(already(format!("column {table}.{column} is absent")));
                }
                let mut blocking = if overlay.column_is_live(conn, table, column)? {
                    self.auditor.column_dependencies(conn, table, column, hints)?
                } else {
                    hints
                        .using(table, column)
                        .map(|sql| ColumnDependency::QueryHint { sql: sql.to_string() })
                        .collect()
                };
                blocking.extend(overlay.pinned_on(table, column).cloned());
                blocking.retain(|dep| !self.discounted(dep, overlay));
                match blocking.first() {
                    None => Ok(StepPlan::Ready),
                    Some(dep) => Err(KernelError::precondition(
                        index,
                        dep.constraint_name(),
                        format!(
                            "cannot drop {table}.{column}: {}",
                            blocking.iter().map(ColumnDependency::describe).collect::<Vec<_>>().join("; ")
                        ),
                    )),
                }
            }
            MigrationStep::AddConstraint { constraint } => {
                self.evaluate_add_constraint(conn, index, constraint, overlay)
            }
            MigrationStep::DropConstraint { table, name } => {
                self.evaluate_drop_constraint(conn, index, table, name, overlay)
            }
            MigrationStep::Backfill { table, column, expression, .. } => {
                if !overlay.column_exists(conn, table, column)? {
                    return Err(KernelError::not_found("column", format!("{table}.{column}")));
                }
                let evaluable = check_expression(conn, table, expression, overlay)?;
                if overlay.is_added(table, column) && overlay.value_sql(table, column).is_some() {
                    return Ok(already(format!("{table}.{column} is added with a default")));
                }
                if !evaluable || !overlay.column_is_live(conn, table, column)? {
                    return Ok(StepPlan::Ready);
                }
                let pending = fillable_count(conn, table, column, expression)?;
                if pending == 0 {
                    Ok(already(format!("no NULL cell in {table}.{column} that {expression} can fill")))
                } else {
                    Ok(StepPlan::Ready)
                }
            }
        }
    }

    fn evaluate_add_constraint(
        &self,
        conn: &Connection,
        index: usize,
        constraint: &ConstraintDef,
        overlay: &Overlay,
    ) -> KernelResult<StepPlan> {
        let name = constraint.name();
        match constraint {
            ConstraintDef::Unique { table, columns, .. } => {
                if overlay.constraint_added(table, &name) {
                    return Ok(already(format!("{name} added by an earlier step")));
                }
                let live = index_list(conn, table)?;
                let equivalent = live.iter().find(|idx| {
                    !overlay.constraint_dropped(table, &idx.name)
                        && (idx.name.eq_ignore_ascii_case(&name)
                            || (idx.unique && same_columns(&idx.columns, columns)))
                });
                if let Some(existing) = equivalent {
                    return Ok(already(format!("unique index {} already covers it", existing.name)));
                }
                let mut values = Vec::with_capacity(columns.len());
                for column in columns {
                    if !overlay.column_exists(conn, table, column)? {
                        return Err(KernelError::not_found("column", format!("{table}.{column}")));
                    }
                    values.push(overlay.value_sql(table, column));
                }
                // A column that is NULL throughout cannot collide. Values
                // written by earlier backfills are checked when the step runs.
                if let Some(values) = values.into_iter().collect::<Option<Vec<_>>>() {
                    let duplicates = duplicate_groups(conn, table, &values)?;
                    if duplicates > 0 {
                        return Err(KernelError::precondition(
                            index,
                            name,
                            format!("{duplicates} duplicate value group(s) in {table}"),
                        ));
                    }
                }
                Ok(StepPlan::Ready)
            }
            ConstraintDef::ForeignKey { table, column, references, .. } => {
                let existing = self
                    .auditor
                    .outbound_foreign_keys(conn, table)?
                    .into_iter()
                    .find(|fk| {
                        fk.source_column.eq_ignore_ascii_case(column)
                            && !overlay.constraint_dropped(table, &fk.constraint_name)
                    });
                if let Some(fk) = existing {
                    if fk.target_table.eq_ignore_ascii_case(&references.table)
                        && fk.target_column.eq_ignore_ascii_case(&references.column)
                    {
                        return Ok(already(format!("{name} already present")));
                    }
                    return Err(KernelError::invalid(
                        "column",
                        format!(
                            "{table}.{column} already references {}.{}",
                            fk.target_table, fk.target_column
                        ),
                    ));
                }
                if overlay.constraint_added(table, &name) {
                    return Ok(already(format!("{name} added by an earlier step")));
                }
                require_table(conn, &references.table)?;
                if !overlay.column_exists(conn, table, column)? {
                    return Err(KernelError::not_found("column", format!("{table}.{column}")));
                }
                if !overlay.column_exists(conn, &references.table, &references.column)? {
                    return Err(KernelError::not_found(
                        "column",
                        format!("{}.{}", references.table, references.column),
                    ));
                }
                if !is_parent_key(conn, &references.table, &references.column, overlay)? {
                    return Err(KernelError::precondition(
                        index,
                        name,
                        format!(
                            "{}.{} is neither a primary key nor uniquely indexed",
                            references.table, references.column
                        ),
                    ));
                }
                if !overlay.column_is_live(conn, &references.table, &references.column)? {
                    return Ok(StepPlan::Ready);
                }
                if overlay.is_added(table, column) {
                    if let Some(value) = overlay.value_sql(table, column) {
                        if default_dangles(conn, table, &value, &references.table, &references.column)? {
                            return Err(KernelError::precondition(
                                index,
                                name,
                                format!(
                                    "default {value} of {table}.{column} matches no {}.{} row",
                                    references.table, references.column
                                ),
                            ));
                        }
                    }
                } else {
                    let orphans = self.auditor.find_orphans(
                        conn,
                        table,
                        column,
                        &references.table,
                        &references.column,
                    )?;
                    if !orphans.is_empty() {
                        return Err(KernelError::precondition(
                            index,
                            name,
                            format!(
                                "{} orphan row(s) in {table}.{column}, first rowid {}",
                                orphans.len(),
                                orphans[0].rowid
                            ),
                        ));
                    }
                }
                Ok(StepPlan::Ready)
            }
        }
    }

    fn evaluate_drop_constraint(
        &self,
        conn: &Connection,
        index: usize,
        table: &str,
        name: &str,
        overlay: &Overlay,
    ) -> KernelResult<StepPlan> {
        if overlay.constraint_dropped(table, name) {
            return Ok(already(format!("{name} dropped by an earlier step")));
        }
        if overlay.constraint_added(table, name) {
            return Ok(StepPlan::Ready);
        }

        if let Some(idx) =
            index_list(conn, table)?.into_iter().find(|idx| idx.name.eq_ignore_ascii_case(name))
        {
            if idx.origin != "c" {
                return Err(KernelError::invalid(
                    "name",
                    format!("{name} is declared inline in the table definition and has no index to drop"),
                ));
            }
            if idx.unique {
                if let [column] = idx.columns.as_slice() {
                    let pk = primary_key_columns(conn, table)?;
                    let other_unique = index_list(conn, table)?.into_iter().any(|other| {
                        other.unique
                            && !other.name.eq_ignore_ascii_case(name)
                            && same_columns(&other.columns, std::slice::from_ref(column))
                    });
                    let is_pk = pk.len() == 1 && pk[0].eq_ignore_ascii_case(column);
                    if !is_pk && !other_unique {
                        let dependants = self
                            .auditor
                            .list_foreign_keys(conn, table, column)?
                            .into_iter()
                            .filter(|fk| !overlay.constraint_dropped(&fk.source_table, &fk.constraint_name))
                            .collect::<Vec<_>>();
                        if let Some(fk) = dependants.first() {
                            return Err(KernelError::precondition(
                                index,
                                fk.constraint_name.clone(),
                                format!("{name} is the parent key of {}", fk.constraint_name),
                            ));
                        }
                    }
                }
            }
            return Ok(StepPlan::Ready);
        }

        let is_foreign_key = self
            .auditor
            .outbound_foreign_keys(conn, table)?
            .iter()
            .any(|fk| fk.constraint_name.eq_ignore_ascii_case(name));
        if is_foreign_key {
            Ok(StepPlan::Ready)
        } else {
            Ok(already(format!("constraint {name} is absent on {table}")))
        }
    }

    /// Dependencies removed by earlier steps of the same migration.
    fn discounted(&self, dep: &ColumnDependency, overlay: &Overlay) -> bool {
        match dep {
            ColumnDependency::InboundForeignKey { foreign_key } => {
                overlay.constraint_dropped(&foreign_key.source_table, &foreign_key.constraint_name)
                    || overlay.dropped_columns.contains(&key(
                        &foreign_key.source_table,
                        &foreign_key.source_column,
                    ))
            }
            ColumnDependency::OutboundForeignKey { foreign_key } => {
                overlay.constraint_dropped(&foreign_key.source_table, &foreign_key.constraint_name)
            }
            ColumnDependency::Index { .. } => {
                // Index names are schema-global; table is irrelevant for the lookup.
                overlay.dropped_constraints.iter().any(|(_, name)| {
                    dep.constraint_name().eq_ignore_ascii_case(name)
                })
            }
            ColumnDependency::PrimaryKey
            | ColumnDependency::Check { .. }
            | ColumnDependency::QueryHint { .. } => false,
        }
    }
}

fn already(reason: String) -> StepPlan {
    StepPlan::AlreadyApplied { reason }
}

fn is_store_failure(err: &KernelError) -> bool {
    matches!(err, KernelError::TransientStore { .. } | KernelError::Storage { .. })
}

fn same_columns(left: &[String], right: &[String]) -> bool {
    left.len() == right.len() && left.iter().zip(right).all(|(l, r)| l.eq_ignore_ascii_case(r))
}

fn is_parent_key(
    conn: &Connection,
    table: &str,
    column: &str,
    overlay: &Overlay,
) -> KernelResult<bool> {
    let pk = primary_key_columns(conn, table)?;
    if pk.len() == 1 && pk[0].eq_ignore_ascii_case(column) {
        return Ok(true);
    }
    let wanted = [column.to_string()];
    Ok(index_list(conn, table)?.iter().any(|idx| {
        idx.unique && !overlay.constraint_dropped(table, &idx.name) && same_columns(&idx.columns, &wanted)
    }))
}

/// NULL cells a backfill would change; rows where the expression is NULL too
/// stay as they are.
fn fillable_count(conn: &Connection, table: &str, column: &str, expression: &str) -> KernelResult<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} IS NULL AND ({expression}) IS NOT NULL",
        quote(table),
        quote(column)
    );
    conn.query_row(&sql, [], |row| row.get(0)).map_store("count fillable cells")
}

/// Duplicate groups over `values`, SQL expressions evaluated per row.
fn duplicate_groups(conn: &Connection, table: &str, values: &[String]) -> KernelResult<i64> {
    let not_null = values.iter().map(|v| format!("{v} IS NOT NULL")).collect::<Vec<_>>();
    let sql = format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} GROUP BY {} HAVING COUNT(*) > 1)",
        quote(table),
        not_null.join(" AND "),
        values.join(", ")
    );
    conn.query_row(&sql, [], |row| row.get(0)).map_store("count duplicate values")
}

/// True when `table` has rows and the default they would all reference has
/// no parent row.
fn default_dangles(
    conn: &Connection,
    table: &str,
    value: &str,
    parent_table: &str,
    parent_column: &str,
) -> KernelResult<bool> {
    let sql = format!(
        "SELECT EXISTS (SELECT 1 FROM {}) AND NOT EXISTS (SELECT 1 FROM {} WHERE {} = {value})",
        quote(table),
        quote(parent_table),
        quote(parent_column)
    );
    conn.query_row(&sql, [], |row| row.get(0)).map_store("check default against parent")
}

/// Whether `expression` can be evaluated against `table` right now. It may
/// name a column an earlier step adds; anything else unknown is invalid.
fn check_expression(
    conn: &Connection,
    table: &str,
    expression: &str,
    overlay: &Overlay,
) -> KernelResult<bool> {
    let probe = format!("SELECT {expression} FROM {} LIMIT 0", quote(table));
    match conn.prepare(&probe) {
        Ok(_) => Ok(true),
        Err(err) => {
            let message = err.to_string();
            let pending = message
                .strip_prefix("no such column: ")
                .is_some_and(|name| overlay.is_added(table, name.trim()));
            if pending {
                Ok(false)
            } else {
                Err(KernelError::invalid("expression", message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::step::{ColumnDef, ColumnRef, OnDelete};
    use crate::store::Store;

    fn migrated() -> KernelResult<Store> {
        let store = Store::open_in_memory()?;
        store.migrate()?;
        Ok(store)
    }

    fn migration(steps: Vec<MigrationStep>) -> Migration {
        Migration { name: "test".to_string(), query_hints: QueryHints::default(), steps }
    }

    fn drop_column(table: &str, column: &str) -> MigrationStep {
        MigrationStep::DropColumn { table: table.to_string(), column: column.to_string() }
    }

    #[test]
    fn drop_of_referenced_column_is_blocked_with_constraint_name() -> KernelResult<()> {
        let store = migrated()?;
        let plan =
            MigrationPlanner::default().plan(store.conn(), &migration(vec![drop_column("classes", "id")]))?;
        match plan.first_blocker() {
            Some((0, KernelError::PreconditionFailed { step, constraint, .. })) => {
                assert_eq!(*step, 0);
                assert_eq!(constraint, "fk_students_class_id");
            }
            other => panic!("expected precondition failure, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn earlier_drops_clear_later_dependencies() -> KernelResult<()> {
        let store = migrated()?;
        let steps = vec![
            MigrationStep::DropConstraint {
                table: "students".to_string(),
                name: "fk_students_class_id".to_string(),
            },
            MigrationStep::DropConstraint {
                table: "students".to_string(),
                name: "idx_students_class_id".to_string(),
            },
            drop_column("students", "class_id"),
        ];
        let plan = MigrationPlanner::default().plan(store.conn(), &migration(steps))?;
        assert!(plan.is_executable(), "{plan:?}");
        assert!(plan.steps.iter().all(|step| step.plan == StepPlan::Ready));
        Ok(())
    }

    #[test]
    fn missing_columns_are_already_applied_drops() -> KernelResult<()> {
        let store = migrated()?;
        let plan = MigrationPlanner::default()
            .plan(store.conn(), &migration(vec![drop_column("users", "nickname")]))?;
        assert!(matches!(plan.steps[0].plan, StepPlan::AlreadyApplied { .. }));
        Ok(())
    }

    #[test]
    fn added_column_is_visible_to_later_steps() -> KernelResult<()> {
        let store = migrated()?;
        let steps = vec![
            MigrationStep::AddColumn {
                table: "students".to_string(),
                column: ColumnDef {
                    name: "mentor_id".to_string(),
                    sql_type: "INTEGER".to_string(),
                    nullable: true,
                    default: None,
                    references: None,
                },
            },
            MigrationStep::AddConstraint {
                constraint: ConstraintDef::ForeignKey {
                    table: "students".to_string(),
                    column: "mentor_id".to_string(),
                    references: ColumnRef { table: "users".to_string(), column: "id".to_string() },
                    on_delete: OnDelete::SetNull,
                },
            },
        ];
        let plan = MigrationPlanner::default().plan(store.conn(), &migration(steps))?;
        assert!(plan.is_executable(), "{plan:?}");
        Ok(())
    }

    #[test]
    fn reference_declared_by_an_added_column_blocks_its_drop() -> KernelResult<()> {
        let store = migrated()?;
        let add = |name: &str, references: Option<ColumnRef>| MigrationStep::AddColumn {
            table: "students".to_string(),
            column: ColumnDef {
                name: name.to_string(),
                sql_type: "INTEGER".to_string(),
                nullable: true,
                default: None,
                references,
            },
        };
        let mentor = ColumnRef { table: "users".to_string(), column: "id".to_string() };
        let steps = vec![
            add("scratch", None),
            drop_column("students", "scratch"),
            add("mentor_id", Some(mentor)),
            drop_column("students", "mentor_id"),
        ];
        let plan = MigrationPlanner::default().plan(store.conn(), &migration(steps))?;
        assert_eq!(plan.steps[1].plan, StepPlan::Ready);
        match plan.first_blocker() {
            Some((3, KernelError::PreconditionFailed { constraint, .. })) => {
                assert_eq!(constraint, "fk_students_mentor_id");
            }
            other => panic!("expected the added foreign key to block, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn unique_index_added_earlier_blocks_a_column_drop() -> KernelResult<()> {
        let store = migrated()?;
        let steps = vec![
            MigrationStep::AddConstraint {
                constraint: ConstraintDef::Unique {
                    name: "idx_users_email".to_string(),
                    table: "users".to_string(),
                    columns: vec!["email".to_string()],
                },
            },
            drop_column("users", "email"),
        ];
        let plan = MigrationPlanner::default().plan(store.conn(), &migration(steps))?;
        assert!(matches!(
            plan.first_blocker(),
            Some((1, KernelError::PreconditionFailed { constraint, .. })) if constraint == "idx_users_email"
        ), "{plan:?}");
        Ok(())
    }

    #[test]
    fn backfill_with_unknown_expression_column_is_blocked() -> KernelResult<()> {
        let store = migrated()?;
        let step = MigrationStep::Backfill {
            table: "users".to_string(),
            column: "email".to_string(),
            expression: "nickname".to_string(),
            batch_size: None,
        };
        let plan = MigrationPlanner::default().plan(store.conn(), &migration(vec![step]))?;
        assert!(matches!(plan.first_blocker(), Some((0, KernelError::InvalidArgument { .. }))), "{plan:?}");
        Ok(())
    }

    #[test]
    fn unique_constraint_over_duplicates_is_blocked() -> KernelResult<()> {
        let store = migrated()?;
        store
            .conn()
            .execute_batch(
                "INSERT INTO classes(class_code, name, grade_level, school_code, created_at)
                 VALUES ('CLS-2025-001', '7A', 7, 'SCH-01', '2025-01-01T00:00:00Z'),
                        ('CLS-2025-002', '7A', 7, 'SCH-01', '2025-01-01T00:00:00Z');",
            )
            .map_store("seed classes")?;
        let step = MigrationStep::AddConstraint {
            constraint: ConstraintDef::Unique {
                name: "idx_classes_school_name".to_string(),
                table: "classes".to_string(),
                columns: vec!["school_code".to_string(), "name".to_string()],
            },
        };
        let plan = MigrationPlanner::default().plan(store.conn(), &migration(vec![step]))?;
        assert!(matches!(
            plan.first_blocker(),
            Some((0, KernelError::PreconditionFailed { constraint, .. })) if constraint == "idx_classes_school_name"
        ));
        Ok(())
    }

    #[test]
    fn unknown_table_blocks_with_not_found() -> KernelResult<()> {
        let store = migrated()?;
        let plan = MigrationPlanner::default()
            .plan(store.conn(), &migration(vec![drop_column("pupils", "name")]))?;
        assert!(matches!(plan.first_blocker(), Some((0, KernelError::NotFound { .. }))));
        Ok(())
    }
}
