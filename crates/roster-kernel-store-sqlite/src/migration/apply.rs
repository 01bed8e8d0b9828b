use roster_kernel_core::{KernelError, KernelResult, RetryPolicy};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::debug;

use crate::auditor::IntegrityAuditor;
use crate::error::StoreResultExt;
use crate::migration::rebuild;
use crate::migration::step::{ColumnDef, ConstraintDef, MigrationStep};
use crate::schema::{index_list, quote};

/// Apply one step that already passed its precondition check.
///
/// Returns the number of rows touched (backfills and rebuilds) or zero for
/// pure schema changes.
pub(crate) fn apply_step(
    conn: &Connection,
    step: &MigrationStep,
    retry: &RetryPolicy,
    default_batch_size: u32,
) -> KernelResult<u64> {
    match step {
        MigrationStep::AddColumn { table, column } => {
            let sql = format!("ALTER TABLE {} ADD COLUMN {}", quote(table), column_sql(column));
            retry.execute("add_column", || in_transaction(conn, &sql))
        }
        MigrationStep::DropColumn { table, column } => {
            let sql = format!("ALTER TABLE {} DROP COLUMN {}", quote(table), quote(column));
            retry.execute("drop_column", || in_transaction(conn, &sql))
        }
        MigrationStep::AddConstraint { constraint: ConstraintDef::Unique { name, table, columns } } => {
            let sql = format!(
                "CREATE UNIQUE INDEX {} ON {} ({})",
                quote(name),
                quote(table),
                columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", ")
            );
            retry.execute("add_unique", || in_transaction(conn, &sql))
        }
        MigrationStep::AddConstraint {
            constraint: ConstraintDef::ForeignKey { table, column, references, on_delete },
        } => retry.execute("add_foreign_key", || {
            rebuild::add_foreign_key(conn, table, column, references, *on_delete).map(|()| 0)
        }),
        MigrationStep::DropConstraint { table, name } => {
            let is_index =
                index_list(conn, table)?.iter().any(|idx| idx.name.eq_ignore_ascii_case(name));
            if is_index {
                let sql = format!("DROP INDEX {}", quote(name));
                return retry.execute("drop_index", || in_transaction(conn, &sql));
            }
            let foreign_key = IntegrityAuditor::new()
                .outbound_foreign_keys(conn, table)?
                .into_iter()
                .find(|fk| fk.constraint_name.eq_ignore_ascii_case(name))
                .ok_or_else(|| KernelError::not_found("constraint", format!("{table}.{name}")))?;
            retry.execute("drop_foreign_key", || {
                rebuild::drop_foreign_key(conn, table, &foreign_key.source_column).map(|()| 0)
            })
        }
        MigrationStep::Backfill { table, column, expression, batch_size } => {
            let batch_size = batch_size.unwrap_or(default_batch_size).max(1);
            backfill(conn, table, column, expression, batch_size, retry)
        }
    }
}

fn column_sql(column: &ColumnDef) -> String {
    let mut sql = format!("{} {}", quote(&column.name), column.sql_type);
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    if let Some(reference) = &column.references {
        sql.push_str(&format!(
            " REFERENCES {}({})",
            quote(&reference.table),
            quote(&reference.column)
        ));
    }
    sql
}

fn in_transaction(conn: &Connection, sql: &str) -> KernelResult<u64> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_store("begin step transaction")?;
    tx.execute_batch(sql).map_store(sql)?;
    tx.commit().map_store("commit step")?;
    Ok(0)
}

/// Fill NULL cells in rowid order, one transaction per batch.
///
/// Only rows where `expression` yields a value are visited, so the count
/// is of cells actually filled and a rerun finds nothing left to do.
/// Committed batches survive a later failure.
fn backfill(
    conn: &Connection,
    table: &str,
    column: &str,
    expression: &str,
    batch_size: u32,
    retry: &RetryPolicy,
) -> KernelResult<u64> {
    let select = format!(
        "SELECT rowid FROM {t} WHERE {c} IS NULL AND ({expression}) IS NOT NULL AND rowid > ?1
         ORDER BY rowid LIMIT ?2",
        t = quote(table),
        c = quote(column)
    );
    let update = format!(
        "UPDATE {t} SET {c} = ({expression})
         WHERE rowid BETWEEN ?1 AND ?2 AND {c} IS NULL AND ({expression}) IS NOT NULL",
        t = quote(table),
        c = quote(column)
    );

    let mut cursor = 0_i64;
    let mut total = 0_u64;
    let mut batch = 0_usize;
    loop {
        let step = retry.execute("backfill_batch", || {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
                .map_store("begin backfill batch")?;
            let rowids = {
                let mut stmt = tx.prepare(&select).map_store("prepare backfill cursor")?;
                let rows = stmt
                    .query_map(params![cursor, batch_size], |row| row.get::<_, i64>(0))
                    .map_store("read backfill cursor")?;
                rows.collect::<Result<Vec<_>, _>>().map_store("read backfill cursor")?
            };
            let (Some(first), Some(last)) = (rowids.first().copied(), rowids.last().copied())
            else {
                return Ok(None);
            };
            let updated = tx.execute(&update, params![first, last]).map_store("backfill batch")?;
            tx.commit().map_store("commit backfill batch")?;
            Ok(Some((last, updated)))
        })?;

        let Some((last, updated)) = step else { break };
        batch += 1;
        cursor = last;
        total += u64::try_from(updated).unwrap_or(u64::MAX);
        debug!(table, column, batch, rows = updated, cursor, "backfill batch committed");
    }
    Ok(total)
}
