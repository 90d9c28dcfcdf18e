// crates/engram-server/src/db/transfers.rs
// Ownership transfer operations

use rusqlite::{Connection, OptionalExtension, params};

use super::types::TransferRow;
use crate::error::{EngramError, Result};
use crate::utils::now_ts;

pub fn parse_transfer_row(row: &rusqlite::Row) -> rusqlite::Result<TransferRow> {
    Ok(TransferRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        from_user_id: row.get(2)?,
        to_user_id: row.get(3)?,
        status: row.get(4)?,
        created_at: row.get(5)?,
    })
}

const TRANSFER_COLS: &str = "id, conversation_id, from_user_id, to_user_id, status, created_at";

/// Record a PENDING transfer. The partial unique index on
/// (conversation_id) WHERE status='PENDING' turns a double-request into a
/// Conflict.
pub fn request_transfer_sync(
    conn: &Connection,
    transfer_id: &str,
    conversation_id: &str,
    from_user_id: &str,
    to_user_id: &str,
) -> Result<TransferRow> {
    let now = now_ts();
    let inserted = conn.execute(
        "INSERT INTO ownership_transfers (id, conversation_id, from_user_id, to_user_id, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 'PENDING', ?5)",
        params![transfer_id, conversation_id, from_user_id, to_user_id, now],
    );
    match inserted {
        Ok(_) => Ok(TransferRow {
            id: transfer_id.to_string(),
            conversation_id: conversation_id.to_string(),
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            status: "PENDING".to_string(),
            created_at: now,
        }),
        Err(e) if is_unique_violation(&e) => Err(EngramError::Conflict(format!(
            "conversation {conversation_id} already has a pending transfer"
        ))),
        Err(e) => Err(e.into()),
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ffi::ErrorCode::ConstraintViolation,
                ..
            },
            _,
        )
    )
}

pub fn get_transfer_sync(conn: &Connection, id: &str) -> Result<Option<TransferRow>> {
    let sql = format!("SELECT {TRANSFER_COLS} FROM ownership_transfers WHERE id = ?1");
    conn.query_row(&sql, [id], parse_transfer_row)
        .optional()
        .map_err(Into::into)
}

/// List transfers the user initiated or is the recipient of.
pub fn list_transfers_sync(
    conn: &Connection,
    user_id: &str,
    role: engram_types::TransferRole,
) -> Result<Vec<TransferRow>> {
    let column = match role {
        engram_types::TransferRole::Initiator => "from_user_id",
        engram_types::TransferRole::Recipient => "to_user_id",
    };
    let sql = format!(
        "SELECT {TRANSFER_COLS} FROM ownership_transfers
         WHERE {column} = ?1 ORDER BY created_at DESC, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([user_id], parse_transfer_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Accept a transfer. Atomically: the recipient becomes OWNER, the
/// initiator demotes to MANAGER, the transfer resolves ACCEPTED. A second
/// accept (or accepting a cancelled transfer) is a Conflict.
pub fn accept_transfer_sync(conn: &Connection, id: &str, group_id: &str) -> Result<TransferRow> {
    let now = now_ts();
    let tx = conn.unchecked_transaction()?;

    let sql = format!("SELECT {TRANSFER_COLS} FROM ownership_transfers WHERE id = ?1");
    let transfer = tx
        .query_row(&sql, [id], parse_transfer_row)
        .optional()?
        .ok_or_else(|| EngramError::NotFound(format!("transfer {id} not found")))?;
    if transfer.status != "PENDING" {
        return Err(EngramError::Conflict(format!(
            "transfer {id} is {}, not PENDING",
            transfer.status
        )));
    }

    tx.execute(
        "INSERT INTO conversation_memberships (group_id, user_id, access_level, created_at, updated_at)
         VALUES (?1, ?2, 4, ?3, ?3)
         ON CONFLICT(group_id, user_id)
         DO UPDATE SET access_level = 4, updated_at = excluded.updated_at",
        params![group_id, transfer.to_user_id, now],
    )?;
    tx.execute(
        "UPDATE conversation_memberships SET access_level = 3, updated_at = ?3
         WHERE group_id = ?1 AND user_id = ?2",
        params![group_id, transfer.from_user_id, now],
    )?;
    tx.execute(
        "UPDATE conversations SET owner_user_id = ?2, updated_at = ?3 WHERE group_id = ?1",
        params![group_id, transfer.to_user_id, now],
    )?;
    tx.execute(
        "UPDATE ownership_transfers SET status = 'ACCEPTED', resolved_at = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    tx.commit()?;

    Ok(TransferRow { status: "ACCEPTED".to_string(), ..transfer })
}

/// Cancel a pending transfer (either side may).
pub fn cancel_transfer_sync(conn: &Connection, id: &str) -> Result<TransferRow> {
    let now = now_ts();
    let tx = conn.unchecked_transaction()?;
    let sql = format!("SELECT {TRANSFER_COLS} FROM ownership_transfers WHERE id = ?1");
    let transfer = tx
        .query_row(&sql, [id], parse_transfer_row)
        .optional()?
        .ok_or_else(|| EngramError::NotFound(format!("transfer {id} not found")))?;
    if transfer.status != "PENDING" {
        return Err(EngramError::Conflict(format!(
            "transfer {id} is {}, not PENDING",
            transfer.status
        )));
    }
    tx.execute(
        "UPDATE ownership_transfers SET status = 'CANCELLED', resolved_at = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    tx.commit()?;
    Ok(TransferRow { status: "CANCELLED".to_string(), ..transfer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memberships::{membership_level_sync, upsert_membership_sync};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::run_all_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_accept_swaps_roles() {
        let conn = test_conn();
        upsert_membership_sync(&conn, "g1", "alice", 4).unwrap();
        conn.execute(
            "INSERT INTO conversations (id, group_id, owner_user_id, created_at, updated_at)
             VALUES ('c1', 'g1', 'alice', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        request_transfer_sync(&conn, "t1", "c1", "alice", "bob").unwrap();
        // Requesting does not change ownership
        assert_eq!(membership_level_sync(&conn, "g1", "alice").unwrap(), Some(4));
        assert_eq!(membership_level_sync(&conn, "g1", "bob").unwrap(), None);

        let accepted = accept_transfer_sync(&conn, "t1", "g1").unwrap();
        assert_eq!(accepted.status, "ACCEPTED");
        assert_eq!(membership_level_sync(&conn, "g1", "bob").unwrap(), Some(4));
        assert_eq!(membership_level_sync(&conn, "g1", "alice").unwrap(), Some(3));

        // Second accept conflicts
        let second = accept_transfer_sync(&conn, "t1", "g1");
        assert!(matches!(second, Err(EngramError::Conflict(_))));
    }

    #[test]
    fn test_double_pending_conflicts() {
        let conn = test_conn();
        request_transfer_sync(&conn, "t1", "c1", "alice", "bob").unwrap();
        let dup = request_transfer_sync(&conn, "t2", "c1", "alice", "carol");
        assert!(matches!(dup, Err(EngramError::Conflict(_))));

        // Cancelling unblocks a new request
        cancel_transfer_sync(&conn, "t1").unwrap();
        request_transfer_sync(&conn, "t3", "c1", "alice", "carol").unwrap();
    }

    #[test]
    fn test_list_by_role() {
        let conn = test_conn();
        request_transfer_sync(&conn, "t1", "c1", "alice", "bob").unwrap();
        request_transfer_sync(&conn, "t2", "c2", "bob", "alice").unwrap();

        let initiated =
            list_transfers_sync(&conn, "alice", engram_types::TransferRole::Initiator).unwrap();
        assert_eq!(initiated.len(), 1);
        assert_eq!(initiated[0].id, "t1");

        let received =
            list_transfers_sync(&conn, "alice", engram_types::TransferRole::Recipient).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, "t2");
    }
}
