// crates/engram-server/src/search/fulltext.rs
// FTS5 keyword search over entry content

use std::sync::Arc;

use rusqlite::params;

use crate::db::VISIBLE_GROUPS_SQL;
use crate::db::pool::DatabasePool;
use crate::error::Result;

/// A keyword hit with its matched snippet.
#[derive(Debug, Clone)]
pub struct FullTextHit {
    pub entry_id: String,
    pub conversation_id: String,
    pub snippet: String,
}

/// Full-text index over the shared SQLite database (FTS5).
pub struct FullTextIndex {
    pool: Arc<DatabasePool>,
}

impl FullTextIndex {
    pub fn new(pool: Arc<DatabasePool>) -> Self {
        Self { pool }
    }

    /// Index one entry's extracted text (replacing any previous row).
    pub async fn index_entry(
        &self,
        entry_id: String,
        group_id: String,
        conversation_id: String,
        created_at: String,
        text: String,
    ) -> Result<()> {
        self.pool
            .run(move |conn| -> Result<()> {
                conn.execute("DELETE FROM entries_fts WHERE entry_id = ?1", [&entry_id])?;
                conn.execute(
                    "INSERT INTO entries_fts (content, entry_id, group_id, conversation_id, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![text, entry_id, group_id, conversation_id, created_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete_group(&self, group_id: String) -> Result<()> {
        self.pool
            .run(move |conn| -> Result<()> {
                conn.execute("DELETE FROM entries_fts WHERE group_id = ?1", [&group_id])?;
                Ok(())
            })
            .await
    }

    /// Keyword search over entries the user can see.
    pub async fn search_by_user(
        &self,
        user_id: String,
        query: String,
        top_k: usize,
        before: Option<String>,
    ) -> Result<Vec<FullTextHit>> {
        let fts_query = sanitize_query(&query);
        if fts_query.is_empty() {
            return Ok(Vec::new());
        }
        self.pool
            .run(move |conn| -> Result<Vec<FullTextHit>> {
                let sql = format!(
                    "SELECT entry_id, conversation_id,
                            snippet(entries_fts, 0, '[', ']', '…', 12)
                     FROM entries_fts
                     WHERE entries_fts MATCH ?2
                       AND group_id IN ({VISIBLE_GROUPS_SQL})
                       AND (?3 IS NULL OR created_at < ?3)
                     ORDER BY rank
                     LIMIT ?4"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![user_id, fts_query, before, top_k as i64],
                    |row| {
                        Ok(FullTextHit {
                            entry_id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            snippet: row.get(2)?,
                        })
                    },
                )?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }
}

/// Quote each term so user input can't hit FTS5 query syntax. Terms AND
/// together, matching FTS5's implicit conjunction.
fn sanitize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::upsert_membership_sync;

    #[test]
    fn test_sanitize_strips_operators() {
        assert_eq!(sanitize_query("hello OR world"), "\"hello\" \"OR\" \"world\"");
        assert_eq!(sanitize_query("a\"b"), "\"ab\"");
        assert_eq!(sanitize_query("  "), "");
    }

    #[tokio::test]
    async fn test_index_and_search() {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        pool.run(|conn| upsert_membership_sync(conn, "g1", "alice", 1))
            .await
            .unwrap();

        let index = FullTextIndex::new(pool);
        index
            .index_entry(
                "e1".into(),
                "g1".into(),
                "c1".into(),
                "2026-01-01T00:00:00Z".into(),
                "alice prefers list comprehensions".into(),
            )
            .await
            .unwrap();

        let hits = index
            .search_by_user("alice".into(), "comprehensions".into(), 10, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry_id, "e1");
        assert!(hits[0].snippet.contains("[comprehensions]"));

        // bob sees nothing
        let hits = index
            .search_by_user("bob".into(), "comprehensions".into(), 10, None)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
