// crates/engram-server/src/db/attachments.rs
// Attachment record operations (the byte payloads live in the sink)

use rusqlite::{Connection, OptionalExtension, params};

use super::types::AttachmentRow;
use crate::error::Result;
use crate::utils::now_ts;

pub fn parse_attachment_row(row: &rusqlite::Row) -> rusqlite::Result<AttachmentRow> {
    Ok(AttachmentRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        storage_key: row.get(2)?,
        filename: row.get(3)?,
        content_type: row.get(4)?,
        size: row.get(5)?,
        sha256: row.get(6)?,
        entry_id: row.get(7)?,
        created_at: row.get(8)?,
        expires_at: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

const ATTACHMENT_COLS: &str = "id, user_id, storage_key, filename, content_type, size, \
    sha256, entry_id, created_at, expires_at, deleted_at";

/// Create an unlinked attachment with a short TTL.
pub fn create_attachment_sync(
    conn: &Connection,
    id: &str,
    user_id: &str,
    storage_key: &str,
    filename: Option<&str>,
    content_type: &str,
    expires_at: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO attachments (id, user_id, storage_key, filename, content_type, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![id, user_id, storage_key, filename, content_type, now_ts(), expires_at],
    )?;
    Ok(())
}

pub fn get_attachment_sync(conn: &Connection, id: &str) -> Result<Option<AttachmentRow>> {
    let sql = format!(
        "SELECT {ATTACHMENT_COLS} FROM attachments WHERE id = ?1 AND deleted_at IS NULL"
    );
    conn.query_row(&sql, [id], parse_attachment_row)
        .optional()
        .map_err(Into::into)
}

/// Record the finalized upload (size and digest known once bytes landed).
pub fn finalize_attachment_sync(conn: &Connection, id: &str, size: i64, sha256: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE attachments SET size = ?2, sha256 = ?3 WHERE id = ?1 AND deleted_at IS NULL",
        params![id, size, sha256],
    )?;
    Ok(n > 0)
}

/// Extend an unlinked attachment's TTL (capped by the service layer).
pub fn refresh_attachment_ttl_sync(conn: &Connection, id: &str, expires_at: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE attachments SET expires_at = ?2
         WHERE id = ?1 AND entry_id IS NULL AND deleted_at IS NULL",
        params![id, expires_at],
    )?;
    Ok(n > 0)
}

/// Link an attachment to a persisted entry, clearing the expiry.
pub fn link_attachment_sync(conn: &Connection, id: &str, entry_id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE attachments SET entry_id = ?2, expires_at = NULL
         WHERE id = ?1 AND deleted_at IS NULL",
        params![id, entry_id],
    )?;
    Ok(n > 0)
}

pub fn delete_attachment_sync(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE attachments SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        params![id, now_ts()],
    )?;
    Ok(n > 0)
}

/// Expired unlinked attachments due for the cleanup sweep.
pub fn expired_attachments_sync(
    conn: &Connection,
    now: &str,
    limit: usize,
) -> Result<Vec<AttachmentRow>> {
    let sql = format!(
        "SELECT {ATTACHMENT_COLS} FROM attachments
         WHERE entry_id IS NULL AND deleted_at IS NULL
           AND expires_at IS NOT NULL AND expires_at < ?1
         ORDER BY expires_at LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now, limit as i64], parse_attachment_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}
