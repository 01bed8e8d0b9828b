//! Base schema, catalog introspection, and identifier hygiene.
//!
//! Table and column names arriving from migrations or the CLI are checked
//! with [`validate_identifier`] and [`require_column`] before they are ever
//! interpolated into SQL; values always travel as bound parameters.

use roster_kernel_core::{KernelError, KernelResult};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::StoreResultExt;

pub const LATEST_SCHEMA_VERSION: i64 = 1;

pub(crate) const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

pub(crate) const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY,
  user_code TEXT NOT NULL UNIQUE,
  role TEXT NOT NULL CHECK (role IN ('student', 'counselor', 'admin')),
  display_name TEXT NOT NULL,
  email TEXT,
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS classes (
  id INTEGER PRIMARY KEY,
  class_code TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  grade_level INTEGER NOT NULL CHECK (grade_level BETWEEN 1 AND 12),
  school_code TEXT NOT NULL,
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS students (
  id INTEGER PRIMARY KEY,
  student_code TEXT NOT NULL UNIQUE,
  user_id INTEGER NOT NULL REFERENCES users(id),
  class_id INTEGER REFERENCES classes(id),
  full_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS counseling_sessions (
  id INTEGER PRIMARY KEY,
  session_code TEXT NOT NULL UNIQUE,
  student_id INTEGER NOT NULL REFERENCES students(id),
  counselor_id INTEGER NOT NULL REFERENCES users(id),
  scheduled_at TEXT NOT NULL,
  topic TEXT NOT NULL,
  notes TEXT,
  status TEXT NOT NULL DEFAULT 'scheduled'
    CHECK (status IN ('scheduled', 'completed', 'cancelled')),
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS behavior_records (
  id INTEGER PRIMARY KEY,
  record_ref TEXT NOT NULL UNIQUE,
  student_id INTEGER NOT NULL REFERENCES students(id),
  reporter_id INTEGER NOT NULL REFERENCES users(id),
  category TEXT NOT NULL CHECK (category IN ('positive', 'concern', 'incident')),
  description TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  created_at TEXT NOT NULL,
  deleted_at TEXT
);

CREATE TABLE IF NOT EXISTS id_sequences (
  prefix TEXT NOT NULL,
  year INTEGER NOT NULL,
  last_value INTEGER NOT NULL,
  PRIMARY KEY (prefix, year)
);

CREATE TABLE IF NOT EXISTS retired_identifiers (
  entity TEXT NOT NULL,
  business_id TEXT NOT NULL,
  retired_at TEXT NOT NULL,
  PRIMARY KEY (entity, business_id)
);

CREATE TABLE IF NOT EXISTS migration_lock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  holder TEXT NOT NULL,
  acquired_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS migration_journal (
  id INTEGER PRIMARY KEY,
  migration_name TEXT NOT NULL,
  step_index INTEGER NOT NULL,
  step_kind TEXT NOT NULL,
  status TEXT NOT NULL,
  detail TEXT,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_students_user_id ON students(user_id);
CREATE INDEX IF NOT EXISTS idx_students_class_id ON students(class_id);
CREATE INDEX IF NOT EXISTS idx_counseling_sessions_student_id ON counseling_sessions(student_id);
CREATE INDEX IF NOT EXISTS idx_counseling_sessions_counselor_id ON counseling_sessions(counselor_id);
CREATE INDEX IF NOT EXISTS idx_behavior_records_student_id ON behavior_records(student_id);
CREATE INDEX IF NOT EXISTS idx_behavior_records_reporter_id ON behavior_records(reporter_id);
CREATE INDEX IF NOT EXISTS idx_migration_journal_name ON migration_journal(migration_name);
";

const MAX_IDENTIFIER_LEN: usize = 64;

/// Accept `[A-Za-z_][A-Za-z0-9_]*`, at most 64 bytes.
///
/// # Errors
/// Returns `InvalidArgument` naming `field` otherwise.
pub fn validate_identifier(field: &str, name: &str) -> KernelResult<()> {
    let mut bytes = name.bytes();
    let valid_start = bytes.next().is_some_and(|b| b.is_ascii_alphabetic() || b == b'_');
    let valid_rest = bytes.all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(KernelError::invalid(field, format!("not a plain SQL identifier: {name:?}")))
    }
}

/// Double-quote an identifier that already passed [`validate_identifier`].
#[must_use]
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    /// 1-based position in the primary key, 0 when not part of it.
    pub primary_key: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    /// `c` for CREATE INDEX, `u` for inline UNIQUE, `pk` for PRIMARY KEY.
    pub origin: String,
    pub columns: Vec<String>,
}

/// Raw row from `pragma_foreign_key_list`, target column unresolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeclaredForeignKey {
    pub target_table: String,
    pub source_column: String,
    pub target_column: Option<String>,
    pub on_delete: String,
}

pub(crate) fn user_tables(conn: &Connection) -> KernelResult<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
             ORDER BY name",
        )
        .map_store("list tables")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0)).map_store("list tables")?;
    rows.collect::<Result<Vec<_>, _>>().map_store("list tables")
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> KernelResult<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .map_store("check table existence")?;
    Ok(exists == 1)
}

pub(crate) fn table_columns(conn: &Connection, table: &str) -> KernelResult<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")
        .map_store("inspect table_info")?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok(ColumnInfo {
                name: row.get(0)?,
                decl_type: row.get(1)?,
                not_null: row.get::<_, i64>(2)? != 0,
                primary_key: row.get(3)?,
            })
        })
        .map_store("inspect table_info")?;
    rows.collect::<Result<Vec<_>, _>>().map_store("inspect table_info")
}

pub(crate) fn table_has_column(conn: &Connection, table: &str, column: &str) -> KernelResult<bool> {
    Ok(table_columns(conn, table)?.iter().any(|info| info.name.eq_ignore_ascii_case(column)))
}

/// # Errors
/// `InvalidArgument` for a malformed name, `NotFound` for an absent table.
pub(crate) fn require_table(conn: &Connection, table: &str) -> KernelResult<()> {
    validate_identifier("table", table)?;
    if table_exists(conn, table)? {
        Ok(())
    } else {
        Err(KernelError::not_found("table", table))
    }
}

/// # Errors
/// As [`require_table`], plus `NotFound` for an absent column.
pub(crate) fn require_column(conn: &Connection, table: &str, column: &str) -> KernelResult<()> {
    require_table(conn, table)?;
    validate_identifier("column", column)?;
    if table_has_column(conn, table, column)? {
        Ok(())
    } else {
        Err(KernelError::not_found("column", format!("{table}.{column}")))
    }
}

pub(crate) fn primary_key_columns(conn: &Connection, table: &str) -> KernelResult<Vec<String>> {
    let mut columns = table_columns(conn, table)?
        .into_iter()
        .filter(|info| info.primary_key > 0)
        .collect::<Vec<_>>();
    columns.sort_by_key(|info| info.primary_key);
    Ok(columns.into_iter().map(|info| info.name).collect())
}

pub(crate) fn index_list(conn: &Connection, table: &str) -> KernelResult<Vec<IndexInfo>> {
    let indexes = {
        let mut stmt = conn
            .prepare("SELECT name, \"unique\", origin FROM pragma_index_list(?1) ORDER BY name")
            .map_store("inspect index_list")?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? != 0, row.get::<_, String>(2)?))
            })
            .map_store("inspect index_list")?;
        rows.collect::<Result<Vec<_>, _>>().map_store("inspect index_list")?
    };

    let mut stmt = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .map_store("inspect index_info")?;
    let mut out = Vec::with_capacity(indexes.len());
    for (name, unique, origin) in indexes {
        let columns = stmt
            .query_map(params![name], |row| row.get::<_, Option<String>>(0))
            .map_store("inspect index_info")?
            .collect::<Result<Vec<_>, _>>()
            .map_store("inspect index_info")?
            .into_iter()
            .flatten()
            .collect();
        out.push(IndexInfo { name, unique, origin, columns });
    }
    Ok(out)
}

pub(crate) fn declared_foreign_keys(
    conn: &Connection,
    table: &str,
) -> KernelResult<Vec<DeclaredForeignKey>> {
    let mut stmt = conn
        .prepare(
            "SELECT \"table\", \"from\", \"to\", on_delete FROM pragma_foreign_key_list(?1)
             ORDER BY id, seq",
        )
        .map_store("inspect foreign_key_list")?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok(DeclaredForeignKey {
                target_table: row.get(0)?,
                source_column: row.get(1)?,
                target_column: row.get(2)?,
                on_delete: row.get(3)?,
            })
        })
        .map_store("inspect foreign_key_list")?;
    rows.collect::<Result<Vec<_>, _>>().map_store("inspect foreign_key_list")
}

pub(crate) fn table_sql(conn: &Connection, table: &str) -> KernelResult<String> {
    conn.query_row(
        "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_store("read table definition")?
    .ok_or_else(|| KernelError::not_found("table", table))
}

/// Every catalog entry's SQL, ordered, for schema comparisons.
///
/// # Errors
/// Returns a storage error when `sqlite_master` cannot be read.
pub fn schema_fingerprint(conn: &Connection) -> KernelResult<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT type || ' ' || name || ': ' || COALESCE(sql, '') FROM sqlite_master
             ORDER BY type, name",
        )
        .map_store("read schema")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0)).map_store("read schema")?;
    rows.collect::<Result<Vec<_>, _>>().map_store("read schema")
}

pub(crate) fn now_rfc3339() -> KernelResult<String> {
    rfc3339(OffsetDateTime::now_utc())
}

pub(crate) fn rfc3339(value: OffsetDateTime) -> KernelResult<String> {
    value
        .format(&Rfc3339)
        .map_err(|err| KernelError::invalid("timestamp", format!("cannot format RFC3339: {err}")))
}

pub(crate) fn parse_rfc3339(value: &str) -> KernelResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| KernelError::storage(format!("invalid RFC3339 timestamp {value:?}: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> KernelResult<Connection> {
        let conn = Connection::open_in_memory().map_store("open")?;
        conn.execute_batch(MIGRATION_001_SQL).map_store("schema")?;
        Ok(conn)
    }

    #[test]
    fn identifiers_must_be_plain() {
        assert!(validate_identifier("table", "students").is_ok());
        assert!(validate_identifier("table", "_tmp2").is_ok());
        assert!(validate_identifier("table", "2fast").is_err());
        assert!(validate_identifier("table", "users; DROP TABLE users").is_err());
        assert!(validate_identifier("column", "").is_err());
    }

    #[test]
    fn require_column_distinguishes_missing_from_malformed() -> KernelResult<()> {
        let conn = base()?;
        require_column(&conn, "students", "class_id")?;
        assert!(matches!(
            require_column(&conn, "students", "nickname"),
            Err(KernelError::NotFound { .. })
        ));
        assert!(matches!(
            require_column(&conn, "students", "class id"),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(matches!(require_table(&conn, "pupils"), Err(KernelError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn catalog_reports_indexes_and_foreign_keys() -> KernelResult<()> {
        let conn = base()?;
        let indexes = index_list(&conn, "students")?;
        assert!(indexes
            .iter()
            .any(|index| index.name == "idx_students_class_id" && index.columns == ["class_id"]));
        assert!(indexes.iter().any(|index| index.unique && index.origin == "u"));

        let fks = declared_foreign_keys(&conn, "counseling_sessions")?;
        let targets: Vec<_> =
            fks.iter().map(|fk| (fk.source_column.as_str(), fk.target_table.as_str())).collect();
        assert!(targets.contains(&("student_id", "students")));
        assert!(targets.contains(&("counselor_id", "users")));
        assert_eq!(primary_key_columns(&conn, "id_sequences")?, vec!["prefix", "year"]);
        Ok(())
    }
}
