// crates/engram-server/src/db/deks.rs
// Wrapped data-encryption key rows
//
// Runtime reads this table once at startup and holds unwrapped DEKs in
// process memory. Inserts happen through admin tooling (key rotation).

use rusqlite::{Connection, params};

use super::types::DekRow;
use crate::error::Result;
use crate::utils::now_ts;

/// All wrapped DEKs for a provider, newest first. The newest row encrypts;
/// the rest decrypt.
pub fn load_deks_sync(conn: &Connection, provider_id: &str) -> Result<Vec<DekRow>> {
    let mut stmt = conn.prepare(
        "SELECT provider_id, created_at, wrapped_dek FROM encryption_deks
         WHERE provider_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([provider_id], |row| {
        Ok(DekRow {
            provider_id: row.get(0)?,
            created_at: row.get(1)?,
            wrapped_dek: row.get(2)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
}

pub fn insert_dek_sync(conn: &Connection, provider_id: &str, wrapped_dek: &[u8]) -> Result<String> {
    let created_at = now_ts();
    conn.execute(
        "INSERT INTO encryption_deks (provider_id, created_at, wrapped_dek) VALUES (?1, ?2, ?3)",
        params![provider_id, created_at, wrapped_dek],
    )?;
    Ok(created_at)
}
