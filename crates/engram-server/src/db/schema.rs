// crates/engram-server/src/db/schema.rs
// Database schema and migrations

use anyhow::Result;
use rusqlite::Connection;

use super::migration_helpers::{add_column_if_missing, table_exists};

/// Base schema. Timestamps are RFC 3339 UTC text with microsecond
/// precision, so lexicographic order is chronological order. IDs are
/// canonical UUID strings.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_groups (
    id              TEXT PRIMARY KEY,
    organization_id TEXT,
    team_id         TEXT,
    created_at      TEXT NOT NULL,
    deleted_at      TEXT
);

CREATE TABLE IF NOT EXISTS conversations (
    id                          TEXT PRIMARY KEY,
    group_id                    TEXT NOT NULL,
    title                       TEXT,
    owner_user_id               TEXT NOT NULL,
    forked_from_conversation_id TEXT,
    forked_at_entry_id          TEXT,
    created_at                  TEXT NOT NULL,
    updated_at                  TEXT NOT NULL,
    deleted_at                  TEXT
);
CREATE INDEX IF NOT EXISTS idx_conversations_group ON conversations(group_id);
CREATE INDEX IF NOT EXISTS idx_conversations_owner ON conversations(owner_user_id, deleted_at);
CREATE INDEX IF NOT EXISTS idx_conversations_fork ON conversations(forked_from_conversation_id);

-- group_id is denormalized onto entries so a group's entries delete with
-- one indexed statement. Index tables carry no FK to this table; their
-- referential integrity is enforced in application code.
CREATE TABLE IF NOT EXISTS entries (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    group_id        TEXT NOT NULL,
    user_id         TEXT,
    client_id       TEXT,
    channel         TEXT NOT NULL,
    memory_epoch    INTEGER,
    content         BLOB NOT NULL,
    content_type    TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_entries_order ON entries(conversation_id, created_at, id);
CREATE INDEX IF NOT EXISTS idx_entries_group ON entries(group_id);
CREATE INDEX IF NOT EXISTS idx_entries_epoch ON entries(conversation_id, client_id, memory_epoch);

CREATE TABLE IF NOT EXISTS conversation_memberships (
    group_id     TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    access_level INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    PRIMARY KEY (group_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_memberships_user ON conversation_memberships(user_id);

CREATE TABLE IF NOT EXISTS ownership_transfers (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    from_user_id    TEXT NOT NULL,
    to_user_id      TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    resolved_at     TEXT
);
-- At most one PENDING transfer per conversation
CREATE UNIQUE INDEX IF NOT EXISTS idx_transfers_pending
    ON ownership_transfers(conversation_id) WHERE status = 'PENDING';
CREATE INDEX IF NOT EXISTS idx_transfers_from ON ownership_transfers(from_user_id);
CREATE INDEX IF NOT EXISTS idx_transfers_to ON ownership_transfers(to_user_id);

CREATE TABLE IF NOT EXISTS organizations (
    id         TEXT PRIMARY KEY,
    name       TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS teams (
    id              TEXT PRIMARY KEY,
    organization_id TEXT,
    name            TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS org_members (
    organization_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL,
    PRIMARY KEY (organization_id, user_id)
);

CREATE TABLE IF NOT EXISTS team_members (
    team_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    PRIMARY KEY (team_id, user_id)
);

CREATE TABLE IF NOT EXISTS attachments (
    id           TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL,
    storage_key  TEXT NOT NULL,
    filename     TEXT,
    content_type TEXT NOT NULL,
    size         INTEGER NOT NULL DEFAULT 0,
    sha256       TEXT,
    entry_id     TEXT,
    created_at   TEXT NOT NULL,
    expires_at   TEXT,
    deleted_at   TEXT
);
CREATE INDEX IF NOT EXISTS idx_attachments_expiry ON attachments(expires_at)
    WHERE entry_id IS NULL AND deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS memories (
    id                     TEXT PRIMARY KEY,
    encoded_namespace      TEXT NOT NULL,
    key                    TEXT NOT NULL,
    value_ciphertext       BLOB NOT NULL,
    attributes_ciphertext  BLOB,
    policy_attributes      TEXT,
    index_fields           TEXT,
    created_at             TEXT NOT NULL,
    updated_at             TEXT NOT NULL,
    expires_at             TEXT,
    deleted_at             TEXT,
    last_indexed_at        TEXT
);
-- Unique active record per (encodedNamespace, key)
CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_active
    ON memories(encoded_namespace, key) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_memories_expiry ON memories(expires_at)
    WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS memory_events (
    id                  TEXT PRIMARY KEY,
    encoded_namespace   TEXT NOT NULL,
    key                 TEXT NOT NULL,
    kind                TEXT NOT NULL,
    occurred_at         TEXT NOT NULL,
    value_snapshot      BLOB,
    attributes_snapshot BLOB
);
CREATE INDEX IF NOT EXISTS idx_memory_events_order
    ON memory_events(occurred_at, id);
CREATE INDEX IF NOT EXISTS idx_memory_events_ns ON memory_events(encoded_namespace);

CREATE TABLE IF NOT EXISTS tasks (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type   TEXT NOT NULL,
    task_body   TEXT NOT NULL,
    retry_at    TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error  TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_due ON tasks(retry_at);

-- Wrapped data-encryption keys. Write path is admin tooling only; the
-- runtime reads this table once at startup.
CREATE TABLE IF NOT EXISTS encryption_deks (
    provider_id TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    wrapped_dek BLOB NOT NULL,
    PRIMARY KEY (provider_id, created_at)
);

-- Resumer locators: which node owns the live recording of a conversation.
CREATE TABLE IF NOT EXISTS stream_locators (
    conversation_id TEXT PRIMARY KEY,
    locator         TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);
"#;

/// Run all schema setup and migrations.
///
/// Called during pool initialization. Idempotent - existing tables and
/// columns are left alone.
pub fn run_all_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;

    migrate_entries_fts(conn)?;
    migrate_tasks_unique_body(conn)?;
    migrate_memories_last_updated(conn)?;

    Ok(())
}

/// Full-text index over entry content. Entry/group ids ride along
/// unindexed so deletes and authorization joins don't touch the
/// entries table.
pub fn migrate_entries_fts(conn: &Connection) -> Result<()> {
    if !table_exists(conn, "entries_fts") {
        tracing::info!("Creating entries_fts full-text index");
        conn.execute_batch(
            "CREATE VIRTUAL TABLE entries_fts USING fts5(
                content,
                entry_id UNINDEXED,
                group_id UNINDEXED,
                conversation_id UNINDEXED,
                created_at UNINDEXED
            );",
        )?;
    }
    Ok(())
}

/// Dedupe guard for enqueue-once task bodies (e.g. one index task per
/// entry). Retries update the existing row instead of inserting twins.
pub fn migrate_tasks_unique_body(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_dedupe ON tasks(task_type, task_body)",
        [],
    )?;
    Ok(())
}

/// Older databases predate the indexer bookkeeping column.
pub fn migrate_memories_last_updated(conn: &Connection) -> Result<()> {
    add_column_if_missing(conn, "memories", "last_indexed_at", "TEXT")?;
    Ok(())
}

/// Create (or recreate on dimension change) the vec0 virtual tables.
///
/// Called by the vector index at startup once the embedder's dimension is
/// known, mirroring how vec0 tables cannot be ALTERed: a dimension change
/// drops and recreates, and embeddings regenerate through the task queue.
pub fn ensure_vec_tables(conn: &Connection, dimensions: usize) -> Result<()> {
    for (table, ddl) in [
        (
            "vec_entries",
            format!(
                "CREATE VIRTUAL TABLE vec_entries USING vec0(
                    embedding float[{dimensions}],
                    +entry_id TEXT,
                    +group_id TEXT,
                    +conversation_id TEXT,
                    +created_at TEXT,
                    +model TEXT
                )"
            ),
        ),
        (
            "vec_memories",
            format!(
                "CREATE VIRTUAL TABLE vec_memories USING vec0(
                    embedding float[{dimensions}],
                    +memory_id TEXT,
                    +encoded_namespace TEXT,
                    +prefixes TEXT
                )"
            ),
        ),
    ] {
        let info_table = format!("{table}_info");
        if table_exists(conn, table) {
            let current_dim: std::result::Result<i64, _> = conn.query_row(
                &format!(
                    "SELECT vector_column_size FROM {info_table} WHERE vector_column_name = 'embedding'"
                ),
                [],
                |row| row.get(0),
            );
            match current_dim {
                Ok(dim) if dim as usize == dimensions => continue,
                Ok(dim) => {
                    tracing::info!(
                        "Recreating {table}: dimension change {} -> {}",
                        dim,
                        dimensions
                    );
                    conn.execute(&format!("DROP TABLE {table}"), [])?;
                }
                Err(_) => {
                    // Info table unreadable; recreate from scratch
                    conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])?;
                }
            }
        }
        conn.execute(&ddl, [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        run_all_migrations(&conn).unwrap();
        assert!(table_exists(&conn, "conversations"));
        assert!(table_exists(&conn, "entries"));
        assert!(table_exists(&conn, "memories"));
        assert!(table_exists(&conn, "entries_fts"));
    }

    #[test]
    fn test_pending_transfer_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO ownership_transfers (id, conversation_id, from_user_id, to_user_id, status, created_at)
             VALUES ('t1', 'c1', 'alice', 'bob', 'PENDING', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO ownership_transfers (id, conversation_id, from_user_id, to_user_id, status, created_at)
             VALUES ('t2', 'c1', 'alice', 'carol', 'PENDING', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(dup.is_err());
        // A resolved transfer does not block a new pending one
        conn.execute(
            "UPDATE ownership_transfers SET status = 'CANCELLED' WHERE id = 't1'",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO ownership_transfers (id, conversation_id, from_user_id, to_user_id, status, created_at)
             VALUES ('t3', 'c1', 'alice', 'carol', 'PENDING', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_active_memory_unique_allows_soft_deleted() {
        let conn = Connection::open_in_memory().unwrap();
        run_all_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO memories (id, encoded_namespace, key, value_ciphertext, created_at, updated_at, deleted_at)
             VALUES ('m1', 'user\u{1e}alice', 'k', x'00', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', '2026-01-02T00:00:00Z')",
            [],
        )
        .unwrap();
        // Active row with the same (namespace, key) is allowed alongside a tombstone
        conn.execute(
            "INSERT INTO memories (id, encoded_namespace, key, value_ciphertext, created_at, updated_at)
             VALUES ('m2', 'user\u{1e}alice', 'k', x'00', '2026-01-03T00:00:00Z', '2026-01-03T00:00:00Z')",
            [],
        )
        .unwrap();
    }
}
