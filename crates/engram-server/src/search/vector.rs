// crates/engram-server/src/search/vector.rs
// ANN index over sqlite-vec vec0 tables

use std::sync::Arc;

use rusqlite::params;

use super::{distance_to_score, embedding_to_bytes};
use crate::db::VISIBLE_GROUPS_SQL;
use crate::db::pool::DatabasePool;
use crate::db::schema::ensure_vec_tables;
use crate::error::{EngramError, Result};

/// Separator for the ancestor-prefix list stored beside each memory
/// vector. Namespace encodings use RS (\x1e); joining the list with US
/// (\x1f) keeps list membership checks exact.
const PREFIX_LIST_SEP: char = '\u{1f}';

/// Filters for entry vector search.
#[derive(Debug, Clone, Default)]
pub struct EntrySearchFilter {
    pub conversation_ids: Option<Vec<String>>,
    /// Only entries created strictly before this timestamp.
    pub before: Option<String>,
}

/// One ANN hit over entries.
#[derive(Debug, Clone)]
pub struct EntryHit {
    pub entry_id: String,
    pub conversation_id: String,
    pub score: f32,
}

/// A memory vector ready for upsert.
#[derive(Debug, Clone)]
pub struct MemoryVector {
    pub memory_id: String,
    pub encoded_namespace: String,
    /// Cumulative ancestor prefixes of the namespace, innermost last.
    pub prefixes: Vec<String>,
    pub embedding: Vec<f32>,
}

/// Vector index over the shared SQLite database. The dimension is pinned
/// to the embedder's model at startup; writes with any other dimension
/// are rejected rather than silently truncated.
pub struct SqliteVectorIndex {
    pool: Arc<DatabasePool>,
    dimensions: usize,
    model: String,
}

impl SqliteVectorIndex {
    pub async fn new(pool: Arc<DatabasePool>, dimensions: usize, model: String) -> Result<Self> {
        pool.run(move |conn| ensure_vec_tables(conn, dimensions).map_err(EngramError::from))
            .await?;
        Ok(Self { pool, dimensions, model })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(EngramError::BadRequest(format!(
                "embedding dimension {} does not match index dimension {} (model {})",
                embedding.len(),
                self.dimensions,
                self.model
            )));
        }
        Ok(())
    }

    /// Index one entry's embedding (replacing any previous row).
    pub async fn index_entry(
        &self,
        entry_id: String,
        group_id: String,
        conversation_id: String,
        created_at: String,
        embedding: Vec<f32>,
    ) -> Result<()> {
        self.check_dimensions(&embedding)?;
        let model = self.model.clone();
        self.pool
            .run(move |conn| -> Result<()> {
                let bytes = embedding_to_bytes(&embedding);
                conn.execute("DELETE FROM vec_entries WHERE entry_id = ?1", [&entry_id])?;
                conn.execute(
                    "INSERT INTO vec_entries (embedding, entry_id, group_id, conversation_id, created_at, model)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![bytes, entry_id, group_id, conversation_id, created_at, model],
                )?;
                Ok(())
            })
            .await
    }

    /// Drop every entry vector belonging to a group (group deletion).
    pub async fn delete_group(&self, group_id: String) -> Result<()> {
        self.pool
            .run(move |conn| -> Result<()> {
                conn.execute("DELETE FROM vec_entries WHERE group_id = ?1", [&group_id])?;
                Ok(())
            })
            .await
    }

    /// ANN search over entries the user can see. Authorization happens by
    /// joining the caller's visible groups; the index itself is
    /// identity-blind.
    pub async fn search_by_user(
        &self,
        user_id: String,
        embedding: Vec<f32>,
        top_k: usize,
        filter: EntrySearchFilter,
    ) -> Result<Vec<EntryHit>> {
        self.check_dimensions(&embedding)?;
        self.pool
            .run(move |conn| -> Result<Vec<EntryHit>> {
                let bytes = embedding_to_bytes(&embedding);

                let conversation_clause = match &filter.conversation_ids {
                    Some(ids) if !ids.is_empty() => {
                        let placeholders = (0..ids.len())
                            .map(|i| format!("?{}", i + 5))
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!("AND conversation_id IN ({placeholders})")
                    }
                    _ => String::new(),
                };

                let sql = format!(
                    "SELECT entry_id, conversation_id,
                            vec_distance_cosine(embedding, ?2) AS distance
                     FROM vec_entries
                     WHERE group_id IN ({VISIBLE_GROUPS_SQL})
                       AND (?3 IS NULL OR created_at < ?3)
                       {conversation_clause}
                     ORDER BY distance
                     LIMIT ?4"
                );

                let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
                    Box::new(user_id.clone()),
                    Box::new(bytes),
                    Box::new(filter.before.clone()),
                    Box::new(top_k as i64),
                ];
                if let Some(ids) = &filter.conversation_ids {
                    for id in ids {
                        values.push(Box::new(id.clone()));
                    }
                }

                let mut stmt = conn.prepare(&sql)?;
                let params_ref: Vec<&dyn rusqlite::ToSql> =
                    values.iter().map(|v| v.as_ref()).collect();
                let rows = stmt.query_map(params_ref.as_slice(), |row| {
                    Ok(EntryHit {
                        entry_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        score: distance_to_score(row.get(2)?),
                    })
                })?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }

    /// Upsert episodic memory vectors.
    pub async fn upsert_memory_vectors(&self, items: Vec<MemoryVector>) -> Result<()> {
        for item in &items {
            self.check_dimensions(&item.embedding)?;
        }
        self.pool
            .run(move |conn| -> Result<()> {
                for item in &items {
                    let bytes = embedding_to_bytes(&item.embedding);
                    let prefixes = item
                        .prefixes
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(&PREFIX_LIST_SEP.to_string());
                    conn.execute(
                        "DELETE FROM vec_memories WHERE memory_id = ?1",
                        [&item.memory_id],
                    )?;
                    conn.execute(
                        "INSERT INTO vec_memories (embedding, memory_id, encoded_namespace, prefixes)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![bytes, item.memory_id, item.encoded_namespace, prefixes],
                    )?;
                }
                Ok(())
            })
            .await
    }

    pub async fn delete_memory_vectors(&self, memory_id: String) -> Result<()> {
        self.pool
            .run(move |conn| -> Result<()> {
                conn.execute("DELETE FROM vec_memories WHERE memory_id = ?1", [&memory_id])?;
                Ok(())
            })
            .await
    }

    /// ANN search over memory vectors under a namespace prefix. The
    /// ancestor-prefix list makes the prefix test an exact membership
    /// match (or equality with the full namespace).
    pub async fn search_memory_vectors(
        &self,
        encoded_prefix: String,
        embedding: Vec<f32>,
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        self.check_dimensions(&embedding)?;
        self.pool
            .run(move |conn| -> Result<Vec<(String, f32)>> {
                let bytes = embedding_to_bytes(&embedding);
                let sep = PREFIX_LIST_SEP.to_string();
                let mut stmt = conn.prepare(
                    "SELECT memory_id, vec_distance_cosine(embedding, ?1) AS distance
                     FROM vec_memories
                     WHERE encoded_namespace = ?2
                        OR instr(?3 || prefixes || ?3, ?3 || ?2 || ?3) > 0
                     ORDER BY distance
                     LIMIT ?4",
                )?;
                let rows = stmt.query_map(
                    params![bytes, encoded_prefix, sep, limit as i64],
                    |row| {
                        Ok((row.get::<_, String>(0)?, distance_to_score(row.get(1)?)))
                    },
                )?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::upsert_membership_sync;

    async fn index(dimensions: usize) -> (Arc<DatabasePool>, SqliteVectorIndex) {
        let pool = Arc::new(DatabasePool::open_in_memory().await.unwrap());
        let index = SqliteVectorIndex::new(pool.clone(), dimensions, "test-model".into())
            .await
            .unwrap();
        (pool, index)
    }

    fn unit(dimensions: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dimensions];
        v[hot] = 1.0;
        v
    }

    #[tokio::test]
    async fn test_rejects_mixed_dimensions() {
        let (_pool, index) = index(4).await;
        let result = index
            .index_entry("e1".into(), "g1".into(), "c1".into(), "t".into(), vec![1.0; 8])
            .await;
        assert!(matches!(result, Err(EngramError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_entry_search_respects_visibility() {
        let (pool, index) = index(4).await;
        pool.run(|conn| {
            upsert_membership_sync(conn, "g1", "alice", 1)
        })
        .await
        .unwrap();

        index
            .index_entry("e1".into(), "g1".into(), "c1".into(), "t1".into(), unit(4, 0))
            .await
            .unwrap();
        index
            .index_entry("e2".into(), "g2".into(), "c2".into(), "t2".into(), unit(4, 0))
            .await
            .unwrap();

        let hits = index
            .search_by_user("alice".into(), unit(4, 0), 10, EntrySearchFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1, "only the visible group's entry surfaces");
        assert_eq!(hits[0].entry_id, "e1");
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn test_memory_prefix_search() {
        let (_pool, index) = index(4).await;
        let ns_alice = "user\u{1e}alice\u{1e}notes";
        index
            .upsert_memory_vectors(vec![MemoryVector {
                memory_id: "m1".into(),
                encoded_namespace: ns_alice.into(),
                prefixes: vec![
                    "user".into(),
                    "user\u{1e}alice".into(),
                    ns_alice.into(),
                ],
                embedding: unit(4, 1),
            }])
            .await
            .unwrap();

        // Prefix hit via ancestor list
        let hits = index
            .search_memory_vectors("user\u{1e}alice".into(), unit(4, 1), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        // A sibling namespace is not a prefix
        let misses = index
            .search_memory_vectors("user\u{1e}aliced".into(), unit(4, 1), 10)
            .await
            .unwrap();
        assert!(misses.is_empty());

        index.delete_memory_vectors("m1".into()).await.unwrap();
        let after_delete = index
            .search_memory_vectors("user\u{1e}alice".into(), unit(4, 1), 10)
            .await
            .unwrap();
        assert!(after_delete.is_empty());
    }
}
