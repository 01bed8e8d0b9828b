//! Table rebuilds for foreign-key changes SQLite cannot `ALTER` in place.
//!
//! Follows the documented sequence: foreign keys off, create the new shape,
//! copy rows, drop, rename, restore indexes and triggers, verify with
//! `foreign_key_check`, commit, foreign keys back on.

use roster_kernel_core::{KernelError, KernelResult};
use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::ddl::{
    column_name, split_definitions, strip_inline_reference, table_foreign_key_columns,
};
use crate::error::StoreResultExt;
use crate::migration::step::{ColumnRef, OnDelete};
use crate::schema::{quote, table_columns, table_sql};

const REBUILD_PREFIX: &str = "__rk_rebuild_";

/// Re-enables foreign key enforcement on every exit path.
struct ForeignKeysSuspended<'c> {
    conn: &'c Connection,
}

impl<'c> ForeignKeysSuspended<'c> {
    fn new(conn: &'c Connection) -> KernelResult<Self> {
        conn.pragma_update(None, "foreign_keys", false).map_store("suspend foreign keys")?;
        let enforced: bool = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .map_store("read foreign_keys pragma")?;
        if enforced {
            // The pragma is a no-op inside an open transaction.
            conn.pragma_update(None, "foreign_keys", true).map_store("restore foreign keys")?;
            return Err(KernelError::storage(
                "cannot rebuild a table while another transaction is open",
            ));
        }
        Ok(Self { conn })
    }
}

impl Drop for ForeignKeysSuspended<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.conn.pragma_update(None, "foreign_keys", true) {
            tracing::error!(error = %err, "failed to re-enable foreign keys after rebuild");
        }
    }
}

pub(crate) fn add_foreign_key(
    conn: &Connection,
    table: &str,
    column: &str,
    references: &ColumnRef,
    on_delete: OnDelete,
) -> KernelResult<()> {
    let clause = format!(
        "FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {}",
        quote(column),
        quote(&references.table),
        quote(&references.column),
        on_delete.as_sql()
    );
    rebuild_table(conn, table, |items| {
        items.push(clause);
        Ok(())
    })
}

pub(crate) fn drop_foreign_key(conn: &Connection, table: &str, column: &str) -> KernelResult<()> {
    rebuild_table(conn, table, |items| {
        let before = items.len();
        items.retain(|item| {
            !table_foreign_key_columns(item)
                .is_some_and(|cols| cols.len() == 1 && cols[0].eq_ignore_ascii_case(column))
        });
        let mut removed = before - items.len();

        for item in items.iter_mut() {
            let is_target = column_name(item).is_some_and(|name| name.eq_ignore_ascii_case(column));
            if is_target {
                if let Some(stripped) = strip_inline_reference(item) {
                    *item = stripped;
                    removed += 1;
                }
            }
        }

        if removed == 0 {
            return Err(KernelError::not_found("constraint", format!("foreign key on {table}.{column}")));
        }
        Ok(())
    })
}

fn rebuild_table(
    conn: &Connection,
    table: &str,
    transform: impl FnOnce(&mut Vec<String>) -> KernelResult<()>,
) -> KernelResult<()> {
    let _suspended = ForeignKeysSuspended::new(conn)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
        .map_store("begin rebuild transaction")?;

    let mut definition = split_definitions(&table_sql(&tx, table)?)?;
    transform(&mut definition.items)?;

    let companions = companion_sql(&tx, table)?;
    let columns = table_columns(&tx, table)?
        .into_iter()
        .map(|info| quote(&info.name))
        .collect::<Vec<_>>()
        .join(", ");
    let scratch = format!("{REBUILD_PREFIX}{table}");

    tx.execute_batch(&definition.render(&quote(&scratch))).map_store("create rebuilt table")?;
    let copied = tx
        .execute(
            &format!(
                "INSERT INTO {} ({columns}) SELECT {columns} FROM {}",
                quote(&scratch),
                quote(table)
            ),
            [],
        )
        .map_store("copy rows into rebuilt table")?;
    tx.execute_batch(&format!("DROP TABLE {}", quote(table))).map_store("drop old table")?;
    tx.execute_batch(&format!("ALTER TABLE {} RENAME TO {}", quote(&scratch), quote(table)))
        .map_store("rename rebuilt table")?;
    for sql in &companions {
        tx.execute_batch(sql).map_store("restore index or trigger")?;
    }

    let violations = foreign_key_violations(&tx, table)?;
    if violations > 0 {
        return Err(KernelError::integrity(
            format!("{table} foreign keys"),
            format!("{violations} row(s) violate foreign keys after rebuild"),
        ));
    }

    tx.commit().map_store("commit rebuild")?;
    info!(table, rows = copied, "table rebuilt");
    Ok(())
}

/// Explicit indexes and triggers attached to `table`, which `DROP TABLE` removes.
fn companion_sql(conn: &Connection, table: &str) -> KernelResult<Vec<String>> {
    let mut stmt = conn
        .prepare(
            "SELECT sql FROM sqlite_master
             WHERE tbl_name = ?1 AND type IN ('index', 'trigger') AND sql IS NOT NULL
             ORDER BY type, name",
        )
        .map_store("read index definitions")?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0)).map_store("read index definitions")?;
    let sql = rows.collect::<Result<Vec<_>, _>>().map_store("read index definitions")?;
    debug!(table, count = sql.len(), "captured companion definitions");
    Ok(sql)
}

fn foreign_key_violations(conn: &Connection, table: &str) -> KernelResult<usize> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA foreign_key_check({})", quote(table)))
        .map_store("prepare foreign_key_check")?;
    let mut rows = stmt.query([]).map_store("run foreign_key_check")?;
    let mut count = 0;
    while rows.next().map_store("read foreign_key_check")?.is_some() {
        count += 1;
    }
    Ok(count)
}
