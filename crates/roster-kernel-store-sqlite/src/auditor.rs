//! Read-only referential integrity inspection.
//!
//! Nothing here writes. Each call reads the catalog and data as of the
//! moment it runs; results are advisory input for the migration planner and
//! the repository's delete policy.

use roster_kernel_core::KernelResult;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreResultExt;
use crate::ddl::split_definitions;
use crate::schema::{
    declared_foreign_keys, index_list, primary_key_columns, quote, require_column, require_table,
    table_columns, table_exists, table_has_column, table_sql, user_tables,
};

/// Stable name for a foreign key, which SQLite does not record.
#[must_use]
pub fn foreign_key_name(source_table: &str, source_column: &str) -> String {
    format!("fk_{source_table}_{source_column}")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ForeignKeyRef {
    pub source_table: String,
    pub source_column: String,
    pub target_table: String,
    pub target_column: String,
    pub constraint_name: String,
    pub on_delete: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrphanRow {
    pub table: String,
    pub rowid: i64,
    pub column: String,
    /// Dangling value rendered as text.
    pub value: String,
}

/// Something that would break, or be silently invalidated, if a column went away.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ColumnDependency {
    /// Another column references this one.
    InboundForeignKey { foreign_key: ForeignKeyRef },
    /// This column references another table.
    OutboundForeignKey { foreign_key: ForeignKeyRef },
    Index { name: String, unique: bool, origin: String },
    PrimaryKey,
    /// Table-level CHECK constraint mentioning the column.
    Check { definition: String },
    /// Registered application query that still reads or writes the column.
    QueryHint { sql: String },
}

impl ColumnDependency {
    /// Constraint, index or hint name reported in precondition failures.
    #[must_use]
    pub fn constraint_name(&self) -> String {
        match self {
            Self::InboundForeignKey { foreign_key } | Self::OutboundForeignKey { foreign_key } => {
                foreign_key.constraint_name.clone()
            }
            Self::Index { name, .. } => name.clone(),
            Self::PrimaryKey => "primary_key".to_string(),
            Self::Check { .. } => "check".to_string(),
            Self::QueryHint { .. } => "query_hint".to_string(),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::InboundForeignKey { foreign_key } => format!(
                "referenced by {}.{} ({})",
                foreign_key.source_table, foreign_key.source_column, foreign_key.constraint_name
            ),
            Self::OutboundForeignKey { foreign_key } => format!(
                "references {}.{} ({})",
                foreign_key.target_table, foreign_key.target_column, foreign_key.constraint_name
            ),
            Self::Index { name, unique: true, .. } => format!("covered by unique index {name}"),
            Self::Index { name, .. } => format!("covered by index {name}"),
            Self::PrimaryKey => "part of the primary key".to_string(),
            Self::Check { definition } => format!("used by check constraint {definition}"),
            Self::QueryHint { sql } => format!("used by registered query: {sql}"),
        }
    }
}

/// SQL texts the application still issues.
///
/// A hint uses `table.column` when it mentions both as whole identifier
/// tokens, compared case-insensitively.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct QueryHints(Vec<String>);

impl QueryHints {
    #[must_use]
    pub fn new(hints: Vec<String>) -> Self {
        Self(hints)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn using<'h>(&'h self, table: &'h str, column: &'h str) -> impl Iterator<Item = &'h str> {
        self.iter().filter(move |sql| mentions(sql, table) && mentions(sql, column))
    }
}

impl<S: Into<String>> FromIterator<S> for QueryHints {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

fn mentions(sql: &str, identifier: &str) -> bool {
    sql.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token.eq_ignore_ascii_case(identifier))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyAudit {
    pub foreign_key: ForeignKeyRef,
    pub orphans: Vec<OrphanRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub foreign_keys_checked: usize,
    pub orphan_count: usize,
    /// Only foreign keys with at least one orphan.
    pub findings: Vec<ForeignKeyAudit>,
}

impl AuditReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.orphan_count == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityAuditor;

impl IntegrityAuditor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Every foreign key whose parent side is `target_table.target_column`.
    ///
    /// # Errors
    /// `InvalidArgument`/`NotFound` for a malformed or absent target.
    pub fn list_foreign_keys(
        &self,
        conn: &Connection,
        target_table: &str,
        target_column: &str,
    ) -> KernelResult<Vec<ForeignKeyRef>> {
        require_column(conn, target_table, target_column)?;
        Ok(self
            .all_foreign_keys(conn)?
            .into_iter()
            .filter(|fk| {
                fk.target_table.eq_ignore_ascii_case(target_table)
                    && fk.target_column.eq_ignore_ascii_case(target_column)
            })
            .collect())
    }

    /// Foreign keys declared by `table` itself.
    ///
    /// # Errors
    /// `InvalidArgument`/`NotFound` for a malformed or absent table.
    pub fn outbound_foreign_keys(
        &self,
        conn: &Connection,
        table: &str,
    ) -> KernelResult<Vec<ForeignKeyRef>> {
        require_table(conn, table)?;
        let mut out = Vec::new();
        for declared in declared_foreign_keys(conn, table)? {
            let target_column = match declared.target_column {
                Some(column) => column,
                // `REFERENCES parent` without a column targets the parent's primary key.
                None => primary_key_columns(conn, &declared.target_table)?
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| "rowid".to_string()),
            };
            out.push(ForeignKeyRef {
                constraint_name: foreign_key_name(table, &declared.source_column),
                source_table: table.to_string(),
                source_column: declared.source_column,
                target_table: declared.target_table,
                target_column,
                on_delete: declared.on_delete,
            });
        }
        Ok(out)
    }

    /// # Errors
    /// Returns a storage error when the catalog cannot be read.
    pub fn all_foreign_keys(&self, conn: &Connection) -> KernelResult<Vec<ForeignKeyRef>> {
        let mut out = Vec::new();
        for table in user_tables(conn)? {
            out.extend(self.outbound_foreign_keys(conn, &table)?);
        }
        Ok(out)
    }

    /// Child rows whose non-NULL reference matches no parent row.
    ///
    /// # Errors
    /// `InvalidArgument`/`NotFound` when any named table or column is
    /// malformed or absent.
    pub fn find_orphans(
        &self,
        conn: &Connection,
        child_table: &str,
        child_column: &str,
        parent_table: &str,
        parent_column: &str,
    ) -> KernelResult<Vec<OrphanRow>> {
        require_column(conn, child_table, child_column)?;
        require_column(conn, parent_table, parent_column)?;

        let sql = format!(
            "SELECT c.rowid, c.{cc} FROM {ct} AS c
             WHERE c.{cc} IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM {pt} AS p WHERE p.{pc} = c.{cc})
             ORDER BY c.rowid",
            cc = quote(child_column),
            ct = quote(child_table),
            pt = quote(parent_table),
            pc = quote(parent_column),
        );
        let orphans = collect_orphans(conn, &sql, child_table, child_column)?;

        if orphans.is_empty() {
            debug!(child_table, child_column, parent_table, parent_column, "no orphans");
        } else {
            warn!(
                child_table,
                child_column,
                parent_table,
                parent_column,
                count = orphans.len(),
                "orphan rows detected"
            );
        }
        Ok(orphans)
    }

    /// Every dependency that blocks removing `table.column`.
    ///
    /// # Errors
    /// `InvalidArgument`/`NotFound` for a malformed or absent column.
    pub fn column_dependencies(
        &self,
        conn: &Connection,
        table: &str,
        column: &str,
        hints: &QueryHints,
    ) -> KernelResult<Vec<ColumnDependency>> {
        require_column(conn, table, column)?;
        let mut deps = Vec::new();

        for foreign_key in self.list_foreign_keys(conn, table, column)? {
            deps.push(ColumnDependency::InboundForeignKey { foreign_key });
        }
        for foreign_key in self.outbound_foreign_keys(conn, table)? {
            if foreign_key.source_column.eq_ignore_ascii_case(column) {
                deps.push(ColumnDependency::OutboundForeignKey { foreign_key });
            }
        }
        for index in index_list(conn, table)? {
            if index.columns.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                deps.push(ColumnDependency::Index {
                    name: index.name,
                    unique: index.unique,
                    origin: index.origin,
                });
            }
        }
        if table_columns(conn, table)?
            .iter()
            .any(|info| info.primary_key > 0 && info.name.eq_ignore_ascii_case(column))
        {
            deps.push(ColumnDependency::PrimaryKey);
        }
        for definition in table_checks(conn, table)? {
            if mentions(&definition, column) {
                deps.push(ColumnDependency::Check { definition });
            }
        }
        for sql in hints.using(table, column) {
            deps.push(ColumnDependency::QueryHint { sql: sql.to_string() });
        }
        Ok(deps)
    }

    /// True only when nothing depends on `table.column`.
    ///
    /// # Errors
    /// As [`Self::column_dependencies`].
    pub fn find_unused_column(
        &self,
        conn: &Connection,
        table: &str,
        column: &str,
        hints: &QueryHints,
    ) -> KernelResult<bool> {
        Ok(self.column_dependencies(conn, table, column, hints)?.is_empty())
    }

    /// Surrogate keys of `child_table` rows whose `child_column` equals `key`.
    ///
    /// # Errors
    /// `InvalidArgument`/`NotFound` for a malformed or absent column.
    pub fn dependents(
        &self,
        conn: &Connection,
        child_table: &str,
        child_column: &str,
        key: i64,
    ) -> KernelResult<Vec<i64>> {
        require_column(conn, child_table, child_column)?;
        let sql = format!(
            "SELECT rowid FROM {} WHERE {} = ?1 ORDER BY rowid",
            quote(child_table),
            quote(child_column)
        );
        let mut stmt = conn.prepare(&sql).map_store("prepare dependents query")?;
        let rows =
            stmt.query_map(params![key], |row| row.get::<_, i64>(0)).map_store("query dependents")?;
        rows.collect::<Result<Vec<_>, _>>().map_store("query dependents")
    }

    /// Run [`Self::find_orphans`] for every declared foreign key. A foreign
    /// key whose parent table or column no longer exists reports every
    /// non-NULL reference as an orphan.
    ///
    /// # Errors
    /// Returns a storage error when the catalog or data cannot be read.
    pub fn scan(&self, conn: &Connection) -> KernelResult<AuditReport> {
        let foreign_keys = self.all_foreign_keys(conn)?;
        let foreign_keys_checked = foreign_keys.len();
        let mut findings = Vec::new();
        for foreign_key in foreign_keys {
            let parent_present = table_exists(conn, &foreign_key.target_table)?
                && table_has_column(conn, &foreign_key.target_table, &foreign_key.target_column)?;
            let orphans = if parent_present {
                self.find_orphans(
                    conn,
                    &foreign_key.source_table,
                    &foreign_key.source_column,
                    &foreign_key.target_table,
                    &foreign_key.target_column,
                )?
            } else {
                warn!(
                    constraint = %foreign_key.constraint_name,
                    target = %format!("{}.{}", foreign_key.target_table, foreign_key.target_column),
                    "foreign key targets a missing parent; every reference dangles"
                );
                every_reference(conn, &foreign_key.source_table, &foreign_key.source_column)?
            };
            if !orphans.is_empty() {
                findings.push(ForeignKeyAudit { foreign_key, orphans });
            }
        }
        let orphan_count = findings.iter().map(|finding| finding.orphans.len()).sum();
        Ok(AuditReport { foreign_keys_checked, orphan_count, findings })
    }
}

/// Every non-NULL value of `table.column`, all of which dangle once the
/// parent side of its foreign key is gone.
fn every_reference(conn: &Connection, table: &str, column: &str) -> KernelResult<Vec<OrphanRow>> {
    require_column(conn, table, column)?;
    let sql = format!(
        "SELECT rowid, {c} FROM {t} WHERE {c} IS NOT NULL ORDER BY rowid",
        c = quote(column),
        t = quote(table),
    );
    collect_orphans(conn, &sql, table, column)
}

fn collect_orphans(
    conn: &Connection,
    sql: &str,
    table: &str,
    column: &str,
) -> KernelResult<Vec<OrphanRow>> {
    let mut stmt = conn.prepare(sql).map_store("prepare orphan scan")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(OrphanRow {
                table: table.to_string(),
                rowid: row.get(0)?,
                column: column.to_string(),
                value: render_value(row.get_ref(1)?),
            })
        })
        .map_store("scan orphans")?;
    rows.collect::<Result<Vec<_>, _>>().map_store("scan orphans")
}

/// Table-level CHECK clauses, as written in the table definition.
fn table_checks(conn: &Connection, table: &str) -> KernelResult<Vec<String>> {
    let definitions = split_definitions(&table_sql(conn, table)?)?;
    Ok(definitions
        .items
        .into_iter()
        .filter(|item| {
            let upper = item.trim_start().to_ascii_uppercase();
            upper.starts_with("CHECK")
                || (upper.starts_with("CONSTRAINT")
                    && upper.split_whitespace().nth(2).is_some_and(|word| word.starts_with("CHECK")))
        })
        .collect())
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        ValueRef::Blob(bytes) => format!("<{} byte blob>", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use roster_kernel_core::KernelError;

    fn seeded() -> KernelResult<Store> {
        let store = Store::open_in_memory()?;
        store.migrate()?;
        store
            .conn()
            .execute_batch(
                "INSERT INTO users(id, user_code, role, display_name, created_at)
                   VALUES (1, 'STU-2025-0001', 'student', 'Ana', '2025-01-01T00:00:00Z'),
                          (2, 'CNS-2025-001', 'counselor', 'Ben', '2025-01-01T00:00:00Z');
                 INSERT INTO classes(id, class_code, name, grade_level, school_code, created_at)
                   VALUES (1, 'CLS-2025-001', '7A', 7, 'SCH-01', '2025-01-01T00:00:00Z');
                 INSERT INTO students(id, student_code, user_id, class_id, full_name, created_at)
                   VALUES (1, 'SID-2025-0001', 1, 1, 'Ana', '2025-01-01T00:00:00Z'),
                          (2, 'SID-2025-0002', 1, NULL, 'Ana B', '2025-01-01T00:00:00Z');",
            )
            .map_store("seed")?;
        Ok(store)
    }

    #[test]
    fn lists_every_reference_to_a_column() -> KernelResult<()> {
        let store = seeded()?;
        let refs = IntegrityAuditor::new().list_foreign_keys(store.conn(), "users", "id")?;
        let mut names: Vec<_> = refs.iter().map(|fk| fk.constraint_name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec![
                "fk_behavior_records_reporter_id",
                "fk_counseling_sessions_counselor_id",
                "fk_students_user_id",
            ]
        );
        Ok(())
    }

    #[test]
    fn orphan_scan_returns_exactly_the_dangling_row() -> KernelResult<()> {
        let store = seeded()?;
        let conn = store.conn();
        conn.pragma_update(None, "foreign_keys", false).map_store("disable fks")?;
        conn.execute(
            "INSERT INTO students(id, student_code, user_id, class_id, full_name, created_at)
             VALUES (3, 'SID-2025-0003', 1, 77, 'Ghost', '2025-01-01T00:00:00Z')",
            [],
        )
        .map_store("seed orphan")?;
        conn.pragma_update(None, "foreign_keys", true).map_store("enable fks")?;

        let auditor = IntegrityAuditor::new();
        let orphans = auditor.find_orphans(conn, "students", "class_id", "classes", "id")?;
        assert_eq!(
            orphans,
            vec![OrphanRow {
                table: "students".to_string(),
                rowid: 3,
                column: "class_id".to_string(),
                value: "77".to_string(),
            }]
        );

        let report = auditor.scan(conn)?;
        assert_eq!(report.orphan_count, 1);
        assert_eq!(report.findings[0].foreign_key.constraint_name, "fk_students_class_id");
        Ok(())
    }

    #[test]
    fn references_to_a_missing_parent_table_are_all_orphans() -> KernelResult<()> {
        let store = seeded()?;
        let conn = store.conn();
        conn.execute_batch(
            "CREATE TABLE notes(id INTEGER PRIMARY KEY, guardian_id INTEGER REFERENCES guardians(id));
             PRAGMA foreign_keys = OFF;
             INSERT INTO notes(id, guardian_id) VALUES (1, 10), (2, NULL), (3, 11);
             PRAGMA foreign_keys = ON;",
        )
        .map_store("seed dangling table")?;

        let report = IntegrityAuditor::new().scan(conn)?;
        assert!(!report.is_clean());
        assert_eq!(report.orphan_count, 2);
        let finding = report
            .findings
            .iter()
            .find(|finding| finding.foreign_key.constraint_name == "fk_notes_guardian_id")
            .unwrap_or_else(|| panic!("missing finding for notes: {report:?}"));
        let rowids: Vec<i64> = finding.orphans.iter().map(|orphan| orphan.rowid).collect();
        assert_eq!(rowids, vec![1, 3]);

        let violations = store.integrity_check()?.foreign_key_violations.len();
        assert_eq!(violations, report.orphan_count);
        Ok(())
    }

    #[test]
    fn null_references_are_not_orphans() -> KernelResult<()> {
        let store = seeded()?;
        let orphans =
            IntegrityAuditor::new().find_orphans(store.conn(), "students", "class_id", "classes", "id")?;
        assert!(orphans.is_empty());
        assert!(IntegrityAuditor::new().scan(store.conn())?.is_clean());
        Ok(())
    }

    #[test]
    fn unknown_tables_are_rejected_before_querying() -> KernelResult<()> {
        let store = seeded()?;
        let auditor = IntegrityAuditor::new();
        assert!(matches!(
            auditor.find_orphans(store.conn(), "students", "class_id", "klasses", "id"),
            Err(KernelError::NotFound { .. })
        ));
        assert!(matches!(
            auditor.find_orphans(store.conn(), "students;--", "class_id", "classes", "id"),
            Err(KernelError::InvalidArgument { .. })
        ));
        Ok(())
    }

    #[test]
    fn unused_column_honours_constraints_indexes_and_hints() -> KernelResult<()> {
        let store = seeded()?;
        let auditor = IntegrityAuditor::new();
        let conn = store.conn();
        let none = QueryHints::default();

        assert!(auditor.find_unused_column(conn, "users", "email", &none)?);
        assert!(!auditor.find_unused_column(conn, "students", "class_id", &none)?);
        assert!(!auditor.find_unused_column(conn, "users", "user_code", &none)?);

        let hints: QueryHints =
            ["SELECT Email FROM Users WHERE id = ?1"].into_iter().collect();
        assert!(!auditor.find_unused_column(conn, "users", "email", &hints)?);

        let unrelated: QueryHints = ["SELECT email_verified FROM users"].into_iter().collect();
        assert!(auditor.find_unused_column(conn, "users", "email", &unrelated)?);
        Ok(())
    }

    #[test]
    fn dependency_list_names_blocking_constraints() -> KernelResult<()> {
        let store = seeded()?;
        let deps = IntegrityAuditor::new().column_dependencies(
            store.conn(),
            "classes",
            "id",
            &QueryHints::default(),
        )?;
        assert!(deps.iter().any(|dep| dep.constraint_name() == "fk_students_class_id"));
        assert!(deps.contains(&ColumnDependency::PrimaryKey));
        Ok(())
    }

    #[test]
    fn dependents_lists_child_keys() -> KernelResult<()> {
        let store = seeded()?;
        let keys = IntegrityAuditor::new().dependents(store.conn(), "students", "user_id", 1)?;
        assert_eq!(keys, vec![1, 2]);
        Ok(())
    }
}
