use std::fs;
use std::path::Path;

use roster_kernel_core::{KernelError, KernelResult};
use serde::{Deserialize, Serialize};

use crate::auditor::QueryHints;
use crate::schema::validate_identifier;

/// An ordered list of schema steps applied as one administrative run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Migration {
    pub name: String,
    /// Application queries that must keep working; consulted before drops.
    #[serde(default)]
    pub query_hints: QueryHints,
    pub steps: Vec<MigrationStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MigrationStep {
    AddColumn {
        table: String,
        column: ColumnDef,
    },
    DropColumn {
        table: String,
        column: String,
    },
    AddConstraint {
        constraint: ConstraintDef,
    },
    DropConstraint {
        table: String,
        name: String,
    },
    /// Fill NULL cells of `column` with `expression`, batch by batch.
    Backfill {
        table: String,
        column: String,
        /// SQL expression evaluated per row, e.g. `upper(name)`.
        expression: String,
        #[serde(default)]
        batch_size: Option<u32>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// SQL literal used as the column default.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub references: Option<ColumnRef>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintDef {
    /// Named unique index.
    Unique { name: String, table: String, columns: Vec<String> },
    ForeignKey {
        table: String,
        column: String,
        references: ColumnRef,
        #[serde(default)]
        on_delete: OnDelete,
    },
}

impl ConstraintDef {
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Unique { table, .. } | Self::ForeignKey { table, .. } => table,
        }
    }

    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Unique { name, .. } => name.clone(),
            Self::ForeignKey { table, column, .. } => {
                crate::auditor::foreign_key_name(table, column)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    NoAction,
    Restrict,
    Cascade,
    SetNull,
}

impl OnDelete {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
        }
    }
}

impl MigrationStep {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddColumn { .. } => "add_column",
            Self::DropColumn { .. } => "drop_column",
            Self::AddConstraint { .. } => "add_constraint",
            Self::DropConstraint { .. } => "drop_constraint",
            Self::Backfill { .. } => "backfill",
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::AddColumn { table, .. }
            | Self::DropColumn { table, .. }
            | Self::DropConstraint { table, .. }
            | Self::Backfill { table, .. } => table,
            Self::AddConstraint { constraint } => constraint.table(),
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::AddColumn { table, column } => {
                format!("add column {table}.{} {}", column.name, column.sql_type)
            }
            Self::DropColumn { table, column } => format!("drop column {table}.{column}"),
            Self::AddConstraint { constraint: ConstraintDef::Unique { name, table, columns } } => {
                format!("add unique {name} on {table}({})", columns.join(", "))
            }
            Self::AddConstraint {
                constraint: ConstraintDef::ForeignKey { table, column, references, .. },
            } => format!(
                "add foreign key {table}.{column} -> {}.{}",
                references.table, references.column
            ),
            Self::DropConstraint { table, name } => format!("drop constraint {name} on {table}"),
            Self::Backfill { table, column, expression, .. } => {
                format!("backfill {table}.{column} = {expression}")
            }
        }
    }

    /// Syntax-level checks that need no database access.
    ///
    /// # Errors
    /// Returns `InvalidArgument` naming the offending field.
    pub fn validate_syntax(&self) -> KernelResult<()> {
        validate_identifier("table", self.table())?;
        match self {
            Self::AddColumn { column, .. } => {
                validate_identifier("column", &column.name)?;
                validate_type(&column.sql_type)?;
                if let Some(default) = &column.default {
                    validate_fragment("default", default)?;
                }
                if !column.nullable && column.default.is_none() {
                    return Err(KernelError::invalid(
                        "nullable",
                        "a NOT NULL column added to an existing table needs a default",
                    ));
                }
                if let Some(reference) = &column.references {
                    validate_identifier("references.table", &reference.table)?;
                    validate_identifier("references.column", &reference.column)?;
                    if column.default.as_deref().is_some_and(|d| !d.eq_ignore_ascii_case("NULL")) {
                        return Err(KernelError::invalid(
                            "default",
                            "a referencing column can only be added with a NULL default",
                        ));
                    }
                }
                Ok(())
            }
            Self::DropColumn { column, .. } => validate_identifier("column", column),
            Self::AddConstraint { constraint: ConstraintDef::Unique { name, columns, .. } } => {
                validate_identifier("name", name)?;
                if columns.is_empty() {
                    return Err(KernelError::invalid("columns", "at least one column is required"));
                }
                columns.iter().try_for_each(|column| validate_identifier("columns", column))
            }
            Self::AddConstraint {
                constraint: ConstraintDef::ForeignKey { column, references, .. },
            } => {
                validate_identifier("column", column)?;
                validate_identifier("references.table", &references.table)?;
                validate_identifier("references.column", &references.column)
            }
            Self::DropConstraint { name, .. } => validate_identifier("name", name),
            Self::Backfill { column, expression, batch_size, .. } => {
                validate_identifier("column", column)?;
                validate_fragment("expression", expression)?;
                if *batch_size == Some(0) {
                    return Err(KernelError::invalid("batch_size", "must be positive"));
                }
                Ok(())
            }
        }
    }
}

fn validate_type(sql_type: &str) -> KernelResult<()> {
    let ok = !sql_type.trim().is_empty()
        && sql_type.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '(' | ')' | ',' | '_'));
    if ok {
        Ok(())
    } else {
        Err(KernelError::invalid("sql_type", format!("unsupported column type {sql_type:?}")))
    }
}

/// Operator-supplied SQL fragments may not carry statement separators or comments.
fn validate_fragment(field: &str, fragment: &str) -> KernelResult<()> {
    if fragment.trim().is_empty() {
        return Err(KernelError::invalid(field, "must not be blank"));
    }
    if fragment.contains(';') || fragment.contains("--") || fragment.contains("/*") {
        return Err(KernelError::invalid(field, "must be a single SQL expression"));
    }
    Ok(())
}

impl Migration {
    /// # Errors
    /// Returns `InvalidArgument` on malformed YAML.
    pub fn from_yaml(raw: &str) -> KernelResult<Self> {
        serde_yaml::from_str(raw).map_err(|err| KernelError::invalid("migration", err.to_string()))
    }

    /// # Errors
    /// Returns `InvalidArgument` on malformed JSON.
    pub fn from_json(raw: &str) -> KernelResult<Self> {
        serde_json::from_str(raw).map_err(|err| KernelError::invalid("migration", err.to_string()))
    }

    /// `.json` files are parsed as JSON, everything else as YAML.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> KernelResult<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            KernelError::invalid("migration", format!("cannot read {}: {err}", path.display()))
        })?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&raw)
        } else {
            Self::from_yaml(&raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_migration_parses_every_step_kind() -> KernelResult<()> {
        let raw = r"
name: 2025_09_nicknames
query_hints:
  - SELECT nickname FROM students WHERE id = ?1
steps:
  - kind: add_column
    table: students
    column: { name: nickname, sql_type: TEXT }
  - kind: backfill
    table: students
    column: nickname
    expression: full_name
    batch_size: 100
  - kind: add_constraint
    constraint: { type: unique, name: idx_students_nickname, table: students, columns: [nickname] }
  - kind: drop_constraint
    table: students
    name: idx_students_nickname
  - kind: add_constraint
    constraint:
      type: foreign_key
      table: students
      column: class_id
      references: { table: classes, column: id }
      on_delete: set_null
  - kind: drop_column
    table: users
    column: email
";
        let migration = Migration::from_yaml(raw)?;
        let kinds: Vec<_> = migration.steps.iter().map(MigrationStep::kind).collect();
        assert_eq!(
            kinds,
            vec![
                "add_column",
                "backfill",
                "add_constraint",
                "drop_constraint",
                "add_constraint",
                "drop_column"
            ]
        );
        assert!(!migration.query_hints.is_empty());
        for step in &migration.steps {
            step.validate_syntax()?;
        }
        match &migration.steps[0] {
            MigrationStep::AddColumn { column, .. } => assert!(column.nullable),
            other => panic!("unexpected step {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn syntax_validation_rejects_unsafe_fragments() {
        let step = MigrationStep::Backfill {
            table: "students".to_string(),
            column: "nickname".to_string(),
            expression: "1; DROP TABLE users".to_string(),
            batch_size: None,
        };
        assert!(matches!(step.validate_syntax(), Err(KernelError::InvalidArgument { .. })));

        let not_null = MigrationStep::AddColumn {
            table: "students".to_string(),
            column: ColumnDef {
                name: "house".to_string(),
                sql_type: "TEXT".to_string(),
                nullable: false,
                default: None,
                references: None,
            },
        };
        assert!(not_null.validate_syntax().is_err());
    }

    #[test]
    fn foreign_key_constraint_uses_derived_name() {
        let constraint = ConstraintDef::ForeignKey {
            table: "students".to_string(),
            column: "class_id".to_string(),
            references: ColumnRef { table: "classes".to_string(), column: "id".to_string() },
            on_delete: OnDelete::SetNull,
        };
        assert_eq!(constraint.name(), "fk_students_class_id");
        assert_eq!(OnDelete::SetNull.as_sql(), "SET NULL");
    }
}
