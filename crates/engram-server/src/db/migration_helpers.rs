// crates/engram-server/src/db/migration_helpers.rs
// Shared helpers for idempotent schema migrations

use anyhow::Result;
use rusqlite::Connection;

/// Check whether a table exists.
pub fn table_exists(conn: &Connection, name: &str) -> bool {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
        [name],
        |_| Ok(true),
    )
    .unwrap_or(false)
}

/// Check whether a column exists on a table.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let sql = format!("SELECT 1 FROM pragma_table_info('{table}') WHERE name = ?1");
    conn.query_row(&sql, [column], |_| Ok(true)).unwrap_or(false)
}

/// Add a column if it is not already present.
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    if !column_exists(conn, table, column) {
        tracing::info!("Adding column {table}.{column}");
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"), [])?;
    }
    Ok(())
}
