// crates/engram-server/src/db/memberships.rs
// Conversation group membership operations

use rusqlite::{Connection, OptionalExtension, params};

use super::types::MembershipRow;
use crate::error::Result;
use crate::utils::now_ts;

pub fn parse_membership_row(row: &rusqlite::Row) -> rusqlite::Result<MembershipRow> {
    Ok(MembershipRow {
        group_id: row.get(0)?,
        user_id: row.get(1)?,
        access_level: row.get(2)?,
    })
}

/// List explicit memberships of a group, highest level first.
pub fn list_memberships_sync(conn: &Connection, group_id: &str) -> Result<Vec<MembershipRow>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, user_id, access_level FROM conversation_memberships
         WHERE group_id = ?1 ORDER BY access_level DESC, user_id",
    )?;
    let rows = stmt.query_map([group_id], parse_membership_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Explicit membership level of a user on a group, if any.
pub fn membership_level_sync(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT access_level FROM conversation_memberships WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, user_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

/// Grant or change a membership. The level caps (§ sharing rules) are
/// enforced by the service layer; this is the raw upsert.
pub fn upsert_membership_sync(
    conn: &Connection,
    group_id: &str,
    user_id: &str,
    access_level: i64,
) -> Result<()> {
    let now = now_ts();
    conn.execute(
        "INSERT INTO conversation_memberships (group_id, user_id, access_level, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT(group_id, user_id)
         DO UPDATE SET access_level = excluded.access_level, updated_at = excluded.updated_at",
        params![group_id, user_id, access_level, now],
    )?;
    Ok(())
}

pub fn delete_membership_sync(conn: &Connection, group_id: &str, user_id: &str) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM conversation_memberships WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, user_id],
    )?;
    Ok(n > 0)
}

/// The single OWNER of a group.
pub fn group_owner_sync(conn: &Connection, group_id: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT user_id FROM conversation_memberships WHERE group_id = ?1 AND access_level = 4",
        [group_id],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}
