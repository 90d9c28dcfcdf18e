// crates/engram-server/src/db/conversations.rs
// Conversation and group storage operations

use rusqlite::{Connection, OptionalExtension, params};

use super::types::ConversationRow;
use crate::error::Result;
use crate::utils::now_ts;

/// Groups visible to a user: explicit memberships plus derived org-admin
/// and team-member access. Bind the user id as ?1.
pub const VISIBLE_GROUPS_SQL: &str = "\
    SELECT group_id FROM conversation_memberships WHERE user_id = ?1 \
    UNION \
    SELECT g.id FROM conversation_groups g \
      JOIN org_members om ON om.organization_id = g.organization_id \
     WHERE om.user_id = ?1 AND om.role IN ('owner', 'admin') \
    UNION \
    SELECT g.id FROM conversation_groups g \
      JOIN team_members tm ON tm.team_id = g.team_id \
     WHERE tm.user_id = ?1";

/// Parse ConversationRow from a rusqlite Row with standard column order:
/// (id, group_id, title, owner_user_id, forked_from_conversation_id,
///  forked_at_entry_id, created_at, updated_at, deleted_at)
pub fn parse_conversation_row(row: &rusqlite::Row) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get(0)?,
        group_id: row.get(1)?,
        title: row.get(2)?,
        owner_user_id: row.get(3)?,
        forked_from_conversation_id: row.get(4)?,
        forked_at_entry_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        deleted_at: row.get(8)?,
    })
}

const CONVERSATION_COLS: &str = "id, group_id, title, owner_user_id, \
    forked_from_conversation_id, forked_at_entry_id, created_at, updated_at, deleted_at";

/// Create a root conversation: allocates the group, the conversation, and
/// the OWNER membership in one transaction.
pub fn create_conversation_sync(
    conn: &Connection,
    conversation_id: &str,
    group_id: &str,
    title: Option<&str>,
    owner_user_id: &str,
    organization_id: Option<&str>,
    team_id: Option<&str>,
) -> Result<ConversationRow> {
    let now = now_ts();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO conversation_groups (id, organization_id, team_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![group_id, organization_id, team_id, now],
    )?;
    tx.execute(
        "INSERT INTO conversations (id, group_id, title, owner_user_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![conversation_id, group_id, title, owner_user_id, now],
    )?;
    tx.execute(
        "INSERT INTO conversation_memberships (group_id, user_id, access_level, created_at, updated_at)
         VALUES (?1, ?2, 4, ?3, ?3)",
        params![group_id, owner_user_id, now],
    )?;
    tx.commit()?;

    Ok(ConversationRow {
        id: conversation_id.to_string(),
        group_id: group_id.to_string(),
        title: title.map(str::to_string),
        owner_user_id: owner_user_id.to_string(),
        forked_from_conversation_id: None,
        forked_at_entry_id: None,
        created_at: now.clone(),
        updated_at: now,
        deleted_at: None,
    })
}

/// Fetch a conversation. Soft-deleted rows are invisible unless
/// `include_deleted`.
pub fn get_conversation_sync(
    conn: &Connection,
    id: &str,
    include_deleted: bool,
) -> Result<Option<ConversationRow>> {
    let sql = if include_deleted {
        format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1")
    } else {
        format!("SELECT {CONVERSATION_COLS} FROM conversations WHERE id = ?1 AND deleted_at IS NULL")
    };
    conn.query_row(&sql, [id], parse_conversation_row)
        .optional()
        .map_err(Into::into)
}

/// List conversations visible to a user.
///
/// `owned` = conversations the user owns; `shared` = visible but not
/// owned; `all` = both. Results page newest-first on (created_at, id)
/// with an exclusive cursor.
pub fn list_conversations_sync(
    conn: &Connection,
    user_id: &str,
    mode: engram_types::ListMode,
    after: Option<(String, String)>,
    limit: usize,
) -> Result<Vec<ConversationRow>> {
    let mode_clause = match mode {
        engram_types::ListMode::Owned => "AND c.owner_user_id = ?1",
        engram_types::ListMode::Shared => "AND c.owner_user_id != ?1",
        engram_types::ListMode::All => "",
    };
    let sql = format!(
        "SELECT {cols} FROM conversations c
         WHERE c.deleted_at IS NULL
           AND c.group_id IN ({visible})
           {mode_clause}
           AND (?2 IS NULL OR (c.created_at, c.id) < (?2, ?3))
         ORDER BY c.created_at DESC, c.id DESC
         LIMIT ?4",
        cols = "c.id, c.group_id, c.title, c.owner_user_id, c.forked_from_conversation_id, \
                c.forked_at_entry_id, c.created_at, c.updated_at, c.deleted_at",
        visible = VISIBLE_GROUPS_SQL,
    );
    let (after_ts, after_id) = match after {
        Some((ts, id)) => (Some(ts), Some(id)),
        None => (None, None),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![user_id, after_ts, after_id, limit as i64],
        parse_conversation_row,
    )?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Soft-delete a single conversation. Forks sharing the group survive.
pub fn delete_conversation_sync(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE conversations SET deleted_at = ?2, updated_at = ?2
         WHERE id = ?1 AND deleted_at IS NULL",
        params![id, now_ts()],
    )?;
    Ok(n > 0)
}

/// Restore a soft-deleted conversation (admin).
pub fn restore_conversation_sync(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE conversations SET deleted_at = NULL, updated_at = ?2 WHERE id = ?1",
        params![id, now_ts()],
    )?;
    Ok(n > 0)
}

/// Soft-delete a whole group: every conversation and entry in it. The
/// entries delete is a single statement against the denormalized
/// group_id; the group's index rows are purged separately through the
/// task queue (no FK ties them together).
pub fn delete_group_sync(conn: &Connection, group_id: &str) -> Result<()> {
    let now = now_ts();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE conversation_groups SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        params![group_id, now],
    )?;
    tx.execute(
        "UPDATE conversations SET deleted_at = ?2, updated_at = ?2
         WHERE group_id = ?1 AND deleted_at IS NULL",
        params![group_id, now],
    )?;
    tx.execute("DELETE FROM entries WHERE group_id = ?1", params![group_id])?;
    tx.commit()?;
    Ok(())
}

/// Create a fork: a new conversation in the parent's group, diverging at
/// `at_entry_id`. Entry validation happens in the service layer.
pub fn fork_conversation_sync(
    conn: &Connection,
    parent: &ConversationRow,
    at_entry_id: &str,
    fork_id: &str,
    title: Option<&str>,
    owner_user_id: &str,
) -> Result<ConversationRow> {
    let now = now_ts();
    conn.execute(
        "INSERT INTO conversations (id, group_id, title, owner_user_id,
            forked_from_conversation_id, forked_at_entry_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![fork_id, parent.group_id, title, owner_user_id, parent.id, at_entry_id, now],
    )?;
    Ok(ConversationRow {
        id: fork_id.to_string(),
        group_id: parent.group_id.clone(),
        title: title.map(str::to_string),
        owner_user_id: owner_user_id.to_string(),
        forked_from_conversation_id: Some(parent.id.clone()),
        forked_at_entry_id: Some(at_entry_id.to_string()),
        created_at: now.clone(),
        updated_at: now,
        deleted_at: None,
    })
}

/// List live forks of a conversation.
pub fn list_forks_sync(conn: &Connection, conversation_id: &str) -> Result<Vec<ConversationRow>> {
    let sql = format!(
        "SELECT {CONVERSATION_COLS} FROM conversations
         WHERE forked_from_conversation_id = ?1 AND deleted_at IS NULL
         ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([conversation_id], parse_conversation_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Admin listing with optional title/owner filter.
pub fn admin_list_conversations_sync(
    conn: &Connection,
    filter: Option<&str>,
    include_deleted: bool,
    limit: usize,
) -> Result<Vec<ConversationRow>> {
    let deleted_clause = if include_deleted { "" } else { "AND deleted_at IS NULL" };
    let sql = format!(
        "SELECT {CONVERSATION_COLS} FROM conversations
         WHERE (?1 IS NULL OR title LIKE '%' || ?1 || '%' OR owner_user_id = ?1)
           {deleted_clause}
         ORDER BY created_at DESC, id DESC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![filter, limit as i64], parse_conversation_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Bump updated_at, e.g. after an entry append.
pub fn touch_conversation_sync(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        params![id, now_ts()],
    )?;
    Ok(())
}

/// Opaque pagination cursor over the (created_at, id) ordering key.
pub mod cursor {
    use base64::Engine as _;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use crate::error::{EngramError, Result};

    pub fn encode(created_at: &str, id: &str) -> String {
        URL_SAFE_NO_PAD.encode(format!("{created_at}|{id}"))
    }

    pub fn decode(cursor: &str) -> Result<(String, String)> {
        let raw = URL_SAFE_NO_PAD
            .decode(cursor)
            .map_err(|_| EngramError::BadRequest("malformed cursor".to_string()))?;
        let s = String::from_utf8(raw)
            .map_err(|_| EngramError::BadRequest("malformed cursor".to_string()))?;
        match s.split_once('|') {
            Some((ts, id)) if !ts.is_empty() && !id.is_empty() => {
                Ok((ts.to_string(), id.to_string()))
            }
            _ => Err(EngramError::BadRequest("malformed cursor".to_string())),
        }
    }
}
