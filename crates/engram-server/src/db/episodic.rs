// crates/engram-server/src/db/episodic.rs
// Episodic memory item storage

use rusqlite::{Connection, OptionalExtension, params};

use super::types::MemoryRow;
use crate::error::Result;
use crate::utils::now_ts;

pub fn parse_memory_row(row: &rusqlite::Row) -> rusqlite::Result<MemoryRow> {
    Ok(MemoryRow {
        id: row.get(0)?,
        encoded_namespace: row.get(1)?,
        key: row.get(2)?,
        value_ciphertext: row.get(3)?,
        attributes_ciphertext: row.get(4)?,
        policy_attributes: row.get(5)?,
        index_fields: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        expires_at: row.get(9)?,
        deleted_at: row.get(10)?,
        last_indexed_at: row.get(11)?,
    })
}

const MEMORY_COLS: &str = "id, encoded_namespace, key, value_ciphertext, attributes_ciphertext, \
    policy_attributes, index_fields, created_at, updated_at, expires_at, deleted_at, last_indexed_at";

/// Parameters for an episodic upsert.
pub struct UpsertMemoryParams {
    pub id: String,
    pub encoded_namespace: String,
    pub key: String,
    pub value_ciphertext: Vec<u8>,
    pub attributes_ciphertext: Option<Vec<u8>>,
    pub policy_attributes: Option<String>,
    pub index_fields: Option<String>,
    pub expires_at: Option<String>,
}

/// Upsert the unique active record for (encodedNamespace, key).
///
/// Returns `(row, was_update)`. An update keeps the existing id and
/// created_at and resets `last_indexed_at` so the indexer picks it up.
pub fn upsert_memory_sync(conn: &Connection, p: &UpsertMemoryParams) -> Result<(MemoryRow, bool)> {
    let now = now_ts();
    let tx = conn.unchecked_transaction()?;
    let existing: Option<(String, String)> = tx
        .query_row(
            "SELECT id, created_at FROM memories
             WHERE encoded_namespace = ?1 AND key = ?2 AND deleted_at IS NULL",
            params![p.encoded_namespace, p.key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (id, created_at, was_update) = match existing {
        Some((id, created_at)) => {
            tx.execute(
                "UPDATE memories SET value_ciphertext = ?2, attributes_ciphertext = ?3,
                    policy_attributes = ?4, index_fields = ?5, updated_at = ?6,
                    expires_at = ?7, last_indexed_at = NULL
                 WHERE id = ?1",
                params![
                    id,
                    p.value_ciphertext,
                    p.attributes_ciphertext,
                    p.policy_attributes,
                    p.index_fields,
                    now,
                    p.expires_at
                ],
            )?;
            (id, created_at, true)
        }
        None => {
            tx.execute(
                "INSERT INTO memories (id, encoded_namespace, key, value_ciphertext,
                    attributes_ciphertext, policy_attributes, index_fields,
                    created_at, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, ?9)",
                params![
                    p.id,
                    p.encoded_namespace,
                    p.key,
                    p.value_ciphertext,
                    p.attributes_ciphertext,
                    p.policy_attributes,
                    p.index_fields,
                    now,
                    p.expires_at
                ],
            )?;
            (p.id.clone(), now.clone(), false)
        }
    };
    tx.commit()?;

    Ok((
        MemoryRow {
            id,
            encoded_namespace: p.encoded_namespace.clone(),
            key: p.key.clone(),
            value_ciphertext: p.value_ciphertext.clone(),
            attributes_ciphertext: p.attributes_ciphertext.clone(),
            policy_attributes: p.policy_attributes.clone(),
            index_fields: p.index_fields.clone(),
            created_at,
            updated_at: now,
            expires_at: p.expires_at.clone(),
            deleted_at: None,
            last_indexed_at: None,
        },
        was_update,
    ))
}

/// Fetch the active record for (encodedNamespace, key).
pub fn get_memory_sync(
    conn: &Connection,
    encoded_namespace: &str,
    key: &str,
) -> Result<Option<MemoryRow>> {
    let sql = format!(
        "SELECT {MEMORY_COLS} FROM memories
         WHERE encoded_namespace = ?1 AND key = ?2 AND deleted_at IS NULL"
    );
    conn.query_row(&sql, params![encoded_namespace, key], parse_memory_row)
        .optional()
        .map_err(Into::into)
}

pub fn get_memory_by_id_sync(conn: &Connection, id: &str) -> Result<Option<MemoryRow>> {
    let sql = format!("SELECT {MEMORY_COLS} FROM memories WHERE id = ?1 AND deleted_at IS NULL");
    conn.query_row(&sql, [id], parse_memory_row)
        .optional()
        .map_err(Into::into)
}

/// Soft-delete the active record; returns the row it tombstoned.
pub fn delete_memory_sync(
    conn: &Connection,
    encoded_namespace: &str,
    key: &str,
) -> Result<Option<MemoryRow>> {
    let tx = conn.unchecked_transaction()?;
    let sql = format!(
        "SELECT {MEMORY_COLS} FROM memories
         WHERE encoded_namespace = ?1 AND key = ?2 AND deleted_at IS NULL"
    );
    let row = tx
        .query_row(&sql, params![encoded_namespace, key], parse_memory_row)
        .optional()?;
    if let Some(ref found) = row {
        tx.execute(
            "UPDATE memories SET deleted_at = ?2 WHERE id = ?1",
            params![found.id, now_ts()],
        )?;
    }
    tx.commit()?;
    Ok(row)
}

/// Hard-delete every record under a namespace prefix (admin force-delete).
/// Returns the ids removed so vector rows can be purged too.
pub fn force_delete_memories_sync(conn: &Connection, prefix_clause: &str) -> Result<Vec<String>> {
    let tx = conn.unchecked_transaction()?;
    let mut ids = Vec::new();
    {
        let mut stmt = tx.prepare(
            "SELECT id FROM memories WHERE encoded_namespace = ?1 OR encoded_namespace LIKE ?1 || ?2 || '%'",
        )?;
        let rows = stmt.query_map(params![prefix_clause, "\u{1e}"], |row| row.get::<_, String>(0))?;
        for row in rows {
            ids.push(row?);
        }
    }
    tx.execute(
        "DELETE FROM memories WHERE encoded_namespace = ?1 OR encoded_namespace LIKE ?1 || ?2 || '%'",
        params![prefix_clause, "\u{1e}"],
    )?;
    tx.commit()?;
    Ok(ids)
}

/// Active records under a namespace prefix, newest-updated first. Attribute
/// filtering happens in the engine after decryption of policy attributes
/// is unnecessary (they are plaintext) but comparison semantics live there.
pub fn list_memories_by_prefix_sync(
    conn: &Connection,
    encoded_prefix: &str,
    limit: usize,
) -> Result<Vec<MemoryRow>> {
    let sql = format!(
        "SELECT {MEMORY_COLS} FROM memories
         WHERE (encoded_namespace = ?1 OR encoded_namespace LIKE ?1 || ?2 || '%')
           AND deleted_at IS NULL
           AND (expires_at IS NULL OR expires_at >= ?3)
         ORDER BY updated_at DESC, id
         LIMIT ?4"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        params![encoded_prefix, "\u{1e}", now_ts(), limit as i64],
        parse_memory_row,
    )?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Distinct namespaces under a prefix.
pub fn list_namespaces_sync(
    conn: &Connection,
    encoded_prefix: Option<&str>,
    limit: usize,
) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT encoded_namespace FROM memories
         WHERE deleted_at IS NULL
           AND (?1 IS NULL OR encoded_namespace = ?1 OR encoded_namespace LIKE ?1 || ?2 || '%')
         ORDER BY encoded_namespace
         LIMIT ?3",
    )?;
    let rows = stmt.query_map(params![encoded_prefix, "\u{1e}", limit as i64], |row| {
        row.get::<_, String>(0)
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

/// Active records whose TTL has lapsed.
pub fn expired_memories_sync(conn: &Connection, now: &str, limit: usize) -> Result<Vec<MemoryRow>> {
    let sql = format!(
        "SELECT {MEMORY_COLS} FROM memories
         WHERE expires_at IS NOT NULL AND expires_at < ?1 AND deleted_at IS NULL
         ORDER BY expires_at LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![now, limit as i64], parse_memory_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn soft_delete_memory_by_id_sync(conn: &Connection, id: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE memories SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
        params![id, now_ts()],
    )?;
    Ok(n > 0)
}

/// Items the indexer should (re)embed: updated since last indexed, with
/// index fields, alive.
pub fn pending_index_memories_sync(
    conn: &Connection,
    limit: usize,
) -> Result<Vec<MemoryRow>> {
    let sql = format!(
        "SELECT {MEMORY_COLS} FROM memories
         WHERE deleted_at IS NULL
           AND index_fields IS NOT NULL
           AND (last_indexed_at IS NULL OR last_indexed_at < updated_at)
         ORDER BY updated_at
         LIMIT ?1"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([limit as i64], parse_memory_row)?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn mark_memory_indexed_sync(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE memories SET last_indexed_at = ?2 WHERE id = ?1",
        params![id, now_ts()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::run_all_migrations(&conn).unwrap();
        conn
    }

    fn put(conn: &Connection, id: &str, ns: &str, key: &str) -> (MemoryRow, bool) {
        upsert_memory_sync(
            conn,
            &UpsertMemoryParams {
                id: id.to_string(),
                encoded_namespace: ns.to_string(),
                key: key.to_string(),
                value_ciphertext: b"v".to_vec(),
                attributes_ciphertext: None,
                policy_attributes: None,
                index_fields: None,
                expires_at: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_upsert_keeps_identity() {
        let conn = test_conn();
        let (first, was_update) = put(&conn, "m1", "user\u{1e}alice", "tip");
        assert!(!was_update);

        let (second, was_update) = put(&conn, "m2", "user\u{1e}alice", "tip");
        assert!(was_update);
        assert_eq!(second.id, first.id, "update keeps the original id");
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_prefix_listing_is_separator_safe() {
        let conn = test_conn();
        put(&conn, "m1", "user\u{1e}alice", "a");
        put(&conn, "m2", "user\u{1e}aliced", "b");
        let rows = list_memories_by_prefix_sync(&conn, "user\u{1e}alice", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "a");
    }

    #[test]
    fn test_delete_then_reinsert() {
        let conn = test_conn();
        put(&conn, "m1", "ns", "k");
        let deleted = delete_memory_sync(&conn, "ns", "k").unwrap();
        assert!(deleted.is_some());
        assert!(get_memory_sync(&conn, "ns", "k").unwrap().is_none());
        // A fresh insert under the same key is a new record
        let (row, was_update) = put(&conn, "m3", "ns", "k");
        assert!(!was_update);
        assert_eq!(row.id, "m3");
    }

    #[test]
    fn test_pending_index_cycle() {
        let conn = test_conn();
        upsert_memory_sync(
            &conn,
            &UpsertMemoryParams {
                id: "m1".into(),
                encoded_namespace: "ns".into(),
                key: "k".into(),
                value_ciphertext: b"v".to_vec(),
                attributes_ciphertext: None,
                policy_attributes: None,
                index_fields: Some("[\"text\"]".into()),
                expires_at: None,
            },
        )
        .unwrap();
        let pending = pending_index_memories_sync(&conn, 10).unwrap();
        assert_eq!(pending.len(), 1);
        mark_memory_indexed_sync(&conn, "m1").unwrap();
        assert!(pending_index_memories_sync(&conn, 10).unwrap().is_empty());
    }
}
