// crates/engram-server/src/db/locators.rs
// Stream locator rows: cross-node pointers to live recordings

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::utils::now_ts;

/// Register (or take over) the locator for a conversation. A stale locator
/// is simply overwritten; opening a new recorder wins.
pub fn put_locator_sync(
    conn: &Connection,
    conversation_id: &str,
    locator: &str,
    expires_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO stream_locators (conversation_id, locator, expires_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(conversation_id)
         DO UPDATE SET locator = excluded.locator, expires_at = excluded.expires_at",
        params![conversation_id, locator, expires_at],
    )?;
    Ok(())
}

/// Extend the TTL of a locator this node still owns.
pub fn refresh_locator_sync(
    conn: &Connection,
    conversation_id: &str,
    locator: &str,
    expires_at: &str,
) -> Result<bool> {
    let n = conn.execute(
        "UPDATE stream_locators SET expires_at = ?3
         WHERE conversation_id = ?1 AND locator = ?2",
        params![conversation_id, locator, expires_at],
    )?;
    Ok(n > 0)
}

/// The unexpired locator for a conversation, if any.
pub fn get_locator_sync(conn: &Connection, conversation_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT locator FROM stream_locators
         WHERE conversation_id = ?1 AND expires_at > ?2",
        params![conversation_id, now_ts()],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/// Remove the locator only if this node still owns it (completion path).
pub fn delete_locator_sync(conn: &Connection, conversation_id: &str, locator: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM stream_locators WHERE conversation_id = ?1 AND locator = ?2",
        params![conversation_id, locator],
    )?;
    Ok(())
}

/// Drop expired locator rows (periodic sweep).
pub fn delete_expired_locators_sync(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM stream_locators WHERE expires_at <= ?1",
        params![now_ts()],
    )?;
    Ok(n)
}
