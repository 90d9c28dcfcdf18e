// crates/engram-server/src/db/entries.rs
// Entry storage: append-only streams, memory epochs, fork-aware transcripts

use rusqlite::{Connection, OptionalExtension, params};

use super::conversations::get_conversation_sync;
use super::types::{ConversationRow, EntryRow};
use crate::error::{EngramError, Result};

/// Parse EntryRow from a rusqlite Row with standard column order:
/// (id, conversation_id, group_id, user_id, client_id, channel,
///  memory_epoch, content, content_type, created_at)
pub fn parse_entry_row(row: &rusqlite::Row) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        group_id: row.get(2)?,
        user_id: row.get(3)?,
        client_id: row.get(4)?,
        channel: row.get(5)?,
        memory_epoch: row.get(6)?,
        content: row.get(7)?,
        content_type: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const ENTRY_COLS: &str = "id, conversation_id, group_id, user_id, client_id, channel, \
    memory_epoch, content, content_type, created_at";

/// Append a single entry and bump the conversation's updated_at.
pub fn append_entry_sync(conn: &Connection, entry: &EntryRow) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO entries (id, conversation_id, group_id, user_id, client_id,
            channel, memory_epoch, content, content_type, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            entry.id,
            entry.conversation_id,
            entry.group_id,
            entry.user_id,
            entry.client_id,
            entry.channel,
            entry.memory_epoch,
            entry.content,
            entry.content_type,
            entry.created_at,
        ],
    )?;
    tx.execute(
        "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
        params![entry.conversation_id, entry.created_at],
    )?;
    tx.commit()?;
    Ok(())
}

/// Fetch one entry by id within a conversation.
pub fn get_entry_sync(
    conn: &Connection,
    conversation_id: &str,
    entry_id: &str,
) -> Result<Option<EntryRow>> {
    let sql = format!(
        "SELECT {ENTRY_COLS} FROM entries WHERE id = ?1 AND conversation_id = ?2"
    );
    conn.query_row(&sql, params![entry_id, conversation_id], parse_entry_row)
        .optional()
        .map_err(Into::into)
}

/// Fetch one entry by id alone (attachment linking).
pub fn get_entry_by_id_sync(conn: &Connection, entry_id: &str) -> Result<Option<EntryRow>> {
    let sql = format!("SELECT {ENTRY_COLS} FROM entries WHERE id = ?1");
    conn.query_row(&sql, [entry_id], parse_entry_row)
        .optional()
        .map_err(Into::into)
}

/// Replace an entry's content blob (streaming partial flushes only; each
/// flush is one atomic row update of a complete serialization, so readers
/// never observe a torn write).
pub fn update_entry_content_sync(conn: &Connection, entry_id: &str, content: &[u8]) -> Result<()> {
    conn.execute(
        "UPDATE entries SET content = ?2 WHERE id = ?1",
        params![entry_id, content],
    )?;
    Ok(())
}

/// Latest MEMORY epoch for a (conversation, client) pair.
pub fn latest_epoch_sync(
    conn: &Connection,
    conversation_id: &str,
    client_id: &str,
) -> Result<Option<i64>> {
    conn.query_row(
        "SELECT MAX(memory_epoch) FROM entries
         WHERE conversation_id = ?1 AND client_id = ?2 AND channel = 'MEMORY'",
        params![conversation_id, client_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}

/// Atomically replace the working memory for a (conversation, client):
/// allocate latest+1 and insert every entry under that epoch. Readers of
/// `epoch=None` observe the new epoch; prior epochs stay queryable.
///
/// Returns the allocated epoch. An empty `entries` slice still allocates
/// (the empty-epoch clear mode); the caller decides whether to tombstone.
pub fn sync_memory_sync(
    conn: &Connection,
    conversation_id: &str,
    group_id: &str,
    client_id: &str,
    entries: &[(String, Vec<u8>, Option<String>, String)],
) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;
    let latest: Option<i64> = tx.query_row(
        "SELECT MAX(memory_epoch) FROM entries
         WHERE conversation_id = ?1 AND client_id = ?2 AND channel = 'MEMORY'",
        params![conversation_id, client_id],
        |row| row.get(0),
    )?;
    let epoch = latest.unwrap_or(0) + 1;
    for (id, content, content_type, created_at) in entries {
        tx.execute(
            "INSERT INTO entries (id, conversation_id, group_id, client_id,
                channel, memory_epoch, content, content_type, created_at)
             VALUES (?1, ?2, ?3, ?4, 'MEMORY', ?5, ?6, ?7, ?8)",
            params![id, conversation_id, group_id, client_id, epoch, content, content_type, created_at],
        )?;
    }
    if let Some((_, _, _, last_created)) = entries.last() {
        tx.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![conversation_id, last_created],
        )?;
    }
    tx.commit()?;
    Ok(epoch)
}

/// Filters for entry listings.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub channel: Option<String>,
    pub client_id: Option<String>,
    /// MEMORY channel only; None resolves to the latest epoch.
    pub epoch: Option<i64>,
    /// Exclusive start: entries strictly after this entry id.
    pub after: Option<String>,
    pub limit: usize,
}

/// List a conversation's entries in `(created_at, id)` order, honoring the
/// fork read-time merge: a fork's transcript is the parent's prefix up to
/// and including the fork point, then the fork's own entries. No copying.
pub fn list_entries_sync(
    conn: &Connection,
    conversation: &ConversationRow,
    filter: &EntryFilter,
) -> Result<Vec<EntryRow>> {
    // Resolve the MEMORY epoch before assembling: `epoch=None` means the
    // latest epoch for the (conversation, client) pair.
    let mut filter = filter.clone();
    if filter.channel.as_deref() == Some("MEMORY") && filter.epoch.is_none() {
        if let Some(client) = filter.client_id.as_deref() {
            filter.epoch = latest_epoch_sync(conn, &conversation.id, client)?;
            if filter.epoch.is_none() {
                return Ok(Vec::new()); // no memory synced yet
            }
        }
    }

    let mut out = Vec::new();
    collect_transcript(conn, conversation, None, &filter, &mut out)?;

    // The exclusive `after` bound and the limit apply to the merged
    // transcript, not per segment.
    if let Some(after_id) = filter.after.as_deref() {
        if let Some(pos) = out.iter().position(|e| e.id == after_id) {
            out.drain(..=pos);
        }
    }
    if filter.limit > 0 && out.len() > filter.limit {
        out.truncate(filter.limit);
    }
    Ok(out)
}

/// Recursively assemble the transcript. `up_to` bounds the segment at the
/// given entry (inclusive); forks of forks recurse naturally.
fn collect_transcript(
    conn: &Connection,
    conversation: &ConversationRow,
    up_to: Option<&str>,
    filter: &EntryFilter,
    out: &mut Vec<EntryRow>,
) -> Result<()> {
    // Locate the bound within this conversation's own entries. A bound
    // that is absent here lies in an ancestor segment (or nowhere).
    let bound = match up_to {
        Some(entry_id) => {
            let sql = "SELECT created_at, id FROM entries WHERE id = ?1 AND conversation_id = ?2";
            conn.query_row(sql, params![entry_id, conversation.id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?
        }
        None => None,
    };

    if let (Some(parent_id), Some(fork_entry)) = (
        conversation.forked_from_conversation_id.as_deref(),
        conversation.forked_at_entry_id.as_deref(),
    ) {
        let parent = get_conversation_sync(conn, parent_id, true)?.ok_or_else(|| {
            EngramError::NotFound(format!("fork parent {parent_id} missing"))
        })?;
        if up_to.is_some() && bound.is_none() {
            // The bound sits in an ancestor segment, tighter than the fork
            // point; this segment contributes nothing.
            return collect_transcript(conn, &parent, up_to, filter, out);
        }
        collect_transcript(conn, &parent, Some(fork_entry), filter, out)?;
    } else if up_to.is_some() && bound.is_none() {
        // Unknown bound on a root conversation: contribute nothing rather
        // than leaking entries past a bound the caller asked for.
        return Ok(());
    }

    let sql = format!(
        "SELECT {ENTRY_COLS} FROM entries
         WHERE conversation_id = ?1
           AND (?2 IS NULL OR channel = ?2)
           AND (?3 IS NULL OR client_id = ?3)
           AND (?4 IS NULL OR memory_epoch = ?4)
           AND (?5 IS NULL OR (created_at, id) <= (?5, ?6))
         ORDER BY created_at, id"
    );
    let (bound_ts, bound_id) = match &bound {
        Some((ts, id)) => (Some(ts.as_str()), Some(id.as_str())),
        None => (None, None),
    };
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![
            conversation.id,
            filter.channel,
            filter.client_id,
            filter.epoch,
            bound_ts,
            bound_id
        ],
        parse_entry_row,
    )?;
    for row in rows {
        out.push(row?);
    }
    Ok(())
}

/// Count entries pending vector indexing (admin observability).
pub fn count_entries_sync(conn: &Connection, conversation_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM entries WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )
    .map_err(Into::into)
}
