// crates/engram-server/src/episodic/engine.rs
// The episodic memory engine: policy-gated namespaced KV with search

use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use engram_types::{
    MemoryEventDto, MemoryEventKind, MemoryEventsPage, MemoryItemDto, MemoryPutRequest,
    MemorySearchRequest,
};

use super::{filter, namespace};
use crate::authz::Principal;
use crate::authz::policy::{PolicyAction, PolicyBundle, PolicyInput};
use crate::crypto::ProviderChain;
use crate::db::pool::DatabasePool;
use crate::db::types::{MemoryEventRow, MemoryRow};
use crate::db::{self, EventFilter, UpsertMemoryParams};
use crate::embeddings::EmbeddingClient;
use crate::error::{EngramError, Result};
use crate::search::{MemoryVector, SqliteVectorIndex};
use crate::utils::{monotonic_now_ts, now_ts, to_storage_ts};

/// Task type for asynchronous memory embedding.
pub const TASK_INDEX_MEMORY: &str = "index-memory";
/// Task type for vector cleanup after delete/expiry.
pub const TASK_DELETE_MEMORY_VECTORS: &str = "delete-memory-vectors";

pub struct EpisodicEngine {
    pool: Arc<DatabasePool>,
    chain: Arc<ProviderChain>,
    policy: Arc<PolicyBundle>,
    vector: Option<Arc<SqliteVectorIndex>>,
    embedder: Option<Arc<EmbeddingClient>>,
    max_namespace_depth: usize,
}

impl EpisodicEngine {
    pub fn new(
        pool: Arc<DatabasePool>,
        chain: Arc<ProviderChain>,
        policy: Arc<PolicyBundle>,
        vector: Option<Arc<SqliteVectorIndex>>,
        embedder: Option<Arc<EmbeddingClient>>,
        max_namespace_depth: usize,
    ) -> Self {
        Self { pool, chain, policy, vector, embedder, max_namespace_depth }
    }

    /// Store (or replace) the item at (namespace, key).
    pub async fn put(&self, principal: &Principal, req: MemoryPutRequest) -> Result<MemoryItemDto> {
        namespace::validate(&req.namespace, self.max_namespace_depth)?;
        namespace::validate_key(&req.key)?;

        self.policy.authorize(&PolicyInput {
            action: PolicyAction::Write,
            namespace: &req.namespace,
            key: Some(&req.key),
            principal,
            value: Some(&req.value),
            attributes: req.attributes.as_ref(),
            filter: None,
        })?;
        let policy_attrs = self.policy.attributes(&PolicyInput {
            action: PolicyAction::Write,
            namespace: &req.namespace,
            key: Some(&req.key),
            principal,
            value: Some(&req.value),
            attributes: req.attributes.as_ref(),
            filter: None,
        })?;

        let encoded = namespace::encode(&req.namespace);
        let value_ciphertext = self.chain.encrypt(&serde_json::to_vec(&req.value)?)?;
        let attributes_ciphertext = match &req.attributes {
            Some(attrs) => Some(self.chain.encrypt(&serde_json::to_vec(attrs)?)?),
            None => None,
        };

        // Only fields that actually resolve to strings feed the indexer.
        let index_fields = req.index_fields.as_ref().map(|fields| {
            fields
                .iter()
                .filter(|path| resolve_field(&req.value, path).is_some())
                .cloned()
                .collect::<Vec<_>>()
        });
        let index_fields_json = match &index_fields {
            Some(fields) if !fields.is_empty() => Some(serde_json::to_string(fields)?),
            _ => None,
        };

        let expires_at = req.ttl_seconds.map(|ttl| {
            to_storage_ts(chrono::Utc::now() + chrono::Duration::seconds(ttl.max(0)))
        });

        let params = UpsertMemoryParams {
            id: Uuid::new_v4().to_string(),
            encoded_namespace: encoded.clone(),
            key: req.key.clone(),
            value_ciphertext: value_ciphertext.clone(),
            attributes_ciphertext: attributes_ciphertext.clone(),
            policy_attributes: policy_attrs
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            index_fields: index_fields_json.clone(),
            expires_at,
        };
        let should_index = index_fields_json.is_some();
        let (row, was_update) = self
            .pool
            .run(move |conn| db::upsert_memory_sync(conn, &params))
            .await?;

        let kind = if was_update { MemoryEventKind::Update } else { MemoryEventKind::Add };
        let event = MemoryEventRow {
            id: Uuid::new_v4().to_string(),
            encoded_namespace: encoded,
            key: req.key.clone(),
            kind: kind.as_str().to_string(),
            occurred_at: monotonic_now_ts(),
            value_snapshot: Some(value_ciphertext),
            attributes_snapshot: attributes_ciphertext,
        };
        let memory_id = row.id.clone();
        self.pool
            .run(move |conn| -> Result<()> {
                db::append_event_sync(conn, &event)?;
                if should_index {
                    db::enqueue_task_sync(
                        conn,
                        TASK_INDEX_MEMORY,
                        &serde_json::json!({ "memory_id": memory_id }).to_string(),
                    )?;
                }
                Ok(())
            })
            .await?;

        self.row_to_dto(row, None)
    }

    /// Fetch and decrypt the item at (namespace, key).
    pub async fn get(
        &self,
        principal: &Principal,
        namespace_segments: &[String],
        key: &str,
    ) -> Result<MemoryItemDto> {
        namespace::validate(namespace_segments, self.max_namespace_depth)?;
        namespace::validate_key(key)?;
        self.policy.authorize(&PolicyInput {
            action: PolicyAction::Read,
            namespace: namespace_segments,
            key: Some(key),
            principal,
            value: None,
            attributes: None,
            filter: None,
        })?;

        let encoded = namespace::encode(namespace_segments);
        let key = key.to_string();
        let row = self
            .pool
            .run(move |conn| db::get_memory_sync(conn, &encoded, &key))
            .await?
            .filter(|row| !is_expired(row))
            .ok_or_else(|| EngramError::NotFound("memory not found".to_string()))?;

        self.row_to_dto(row, None)
    }

    /// Soft-delete the item, logging a `delete` event with null snapshots.
    pub async fn delete(
        &self,
        principal: &Principal,
        namespace_segments: &[String],
        key: &str,
    ) -> Result<()> {
        namespace::validate(namespace_segments, self.max_namespace_depth)?;
        namespace::validate_key(key)?;
        self.policy.authorize(&PolicyInput {
            action: PolicyAction::Delete,
            namespace: namespace_segments,
            key: Some(key),
            principal,
            value: None,
            attributes: None,
            filter: None,
        })?;

        let encoded = namespace::encode(namespace_segments);
        let key_owned = key.to_string();
        let deleted = self
            .pool
            .run(move |conn| db::delete_memory_sync(conn, &encoded, &key_owned))
            .await?
            .ok_or_else(|| EngramError::NotFound("memory not found".to_string()))?;

        let event = MemoryEventRow {
            id: Uuid::new_v4().to_string(),
            encoded_namespace: deleted.encoded_namespace.clone(),
            key: deleted.key.clone(),
            kind: MemoryEventKind::Delete.as_str().to_string(),
            occurred_at: monotonic_now_ts(),
            value_snapshot: None,
            attributes_snapshot: None,
        };
        let memory_id = deleted.id.clone();
        self.pool
            .run(move |conn| -> Result<()> {
                db::append_event_sync(conn, &event)?;
                db::enqueue_task_sync(
                    conn,
                    TASK_DELETE_MEMORY_VECTORS,
                    &serde_json::json!({ "memory_id": memory_id }).to_string(),
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Search under a namespace prefix: ANN when a query and embedder are
    /// available, attribute-filtered listing otherwise. The `filter`
    /// policy narrows the prefix and filter before either path runs.
    pub async fn search(
        &self,
        principal: &Principal,
        req: MemorySearchRequest,
    ) -> Result<Vec<MemoryItemDto>> {
        namespace::validate(&req.namespace_prefix, self.max_namespace_depth)?;

        let requested_filter = req.filter.clone().map(Value::Object);
        let narrowed = self.policy.filter(&PolicyInput {
            action: PolicyAction::Search,
            namespace: &req.namespace_prefix,
            key: None,
            principal,
            value: None,
            attributes: None,
            filter: requested_filter.as_ref(),
        })?;
        self.policy.authorize(&PolicyInput {
            action: PolicyAction::Search,
            namespace: &narrowed.namespace_prefix,
            key: None,
            principal,
            value: None,
            attributes: None,
            filter: requested_filter.as_ref(),
        })?;

        let effective_filter = narrowed.filter.or(req.filter);
        let encoded_prefix = namespace::encode(&narrowed.namespace_prefix);
        let limit = req.limit.unwrap_or(20).clamp(1, 100);

        match (&req.query, &self.embedder, &self.vector) {
            (Some(query), Some(embedder), Some(vector)) if !query.trim().is_empty() => {
                let embedding = embedder
                    .embed_query(query)
                    .await
                    .map_err(|e| EngramError::Embedding(e.to_string()))?;
                let hits = vector
                    .search_memory_vectors(encoded_prefix, embedding, limit * 4)
                    .await?;

                let mut items = Vec::new();
                for (memory_id, score) in hits {
                    let id = memory_id.clone();
                    let row = self
                        .pool
                        .run(move |conn| db::get_memory_by_id_sync(conn, &id))
                        .await?;
                    // Vector rows have no FK; a vanished or expired item
                    // simply drops out of the result set.
                    let Some(row) = row.filter(|r| !is_expired(r)) else {
                        continue;
                    };
                    if let Some(dto) =
                        self.hydrate_filtered(row, effective_filter.as_ref(), Some(score))?
                    {
                        items.push(dto);
                        if items.len() >= limit {
                            break;
                        }
                    }
                }
                items.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                Ok(items)
            }
            _ => {
                let fetch = limit * 4;
                let rows = self
                    .pool
                    .run(move |conn| db::list_memories_by_prefix_sync(conn, &encoded_prefix, fetch))
                    .await?;
                let mut items = Vec::new();
                for row in rows {
                    if let Some(dto) = self.hydrate_filtered(row, effective_filter.as_ref(), None)? {
                        items.push(dto);
                        if items.len() >= limit {
                            break;
                        }
                    }
                }
                Ok(items)
            }
        }
    }

    /// Distinct namespaces under an authorized prefix.
    pub async fn list_namespaces(
        &self,
        principal: &Principal,
        prefix: Option<Vec<String>>,
    ) -> Result<Vec<Vec<String>>> {
        let requested = prefix.unwrap_or_default();
        let narrowed = self.policy.filter(&PolicyInput {
            action: PolicyAction::Search,
            namespace: &requested,
            key: None,
            principal,
            value: None,
            attributes: None,
            filter: None,
        })?;
        self.policy.authorize(&PolicyInput {
            action: PolicyAction::Read,
            namespace: &narrowed.namespace_prefix,
            key: None,
            principal,
            value: None,
            attributes: None,
            filter: None,
        })?;

        // An empty narrowed prefix (admin, unscoped) lists everything.
        let encoded = (!narrowed.namespace_prefix.is_empty())
            .then(|| namespace::encode(&narrowed.namespace_prefix));
        let namespaces = self
            .pool
            .run(move |conn| db::list_namespaces_sync(conn, encoded.as_deref(), 1000))
            .await?;
        Ok(namespaces.iter().map(|ns| namespace::decode(ns)).collect())
    }

    /// The event log under an authorized prefix, oldest first, with an
    /// opaque (occurred_at, id) cursor.
    pub async fn list_events(
        &self,
        principal: &Principal,
        prefix: Option<Vec<String>>,
        kinds: Option<Vec<MemoryEventKind>>,
        before: Option<String>,
        after: Option<String>,
        after_cursor: Option<String>,
        limit: usize,
    ) -> Result<MemoryEventsPage> {
        let requested = prefix.unwrap_or_default();
        let narrowed = self.policy.filter(&PolicyInput {
            action: PolicyAction::Search,
            namespace: &requested,
            key: None,
            principal,
            value: None,
            attributes: None,
            filter: None,
        })?;
        self.policy.authorize(&PolicyInput {
            action: PolicyAction::Read,
            namespace: &narrowed.namespace_prefix,
            key: None,
            principal,
            value: None,
            attributes: None,
            filter: None,
        })?;

        let cursor = after_cursor.map(|c| db::cursor::decode(&c)).transpose()?;
        let event_filter = EventFilter {
            encoded_prefix: (!narrowed.namespace_prefix.is_empty())
                .then(|| namespace::encode(&narrowed.namespace_prefix)),
            kinds: kinds.map(|ks| ks.iter().map(|k| k.as_str().to_string()).collect()),
            before,
            after,
            after_cursor: cursor,
            limit: limit.clamp(1, 500),
        };
        let rows = self
            .pool
            .run(move |conn| db::list_events_sync(conn, &event_filter))
            .await?;

        let next_cursor = rows
            .last()
            .map(|row| db::cursor::encode(&row.occurred_at, &row.id));
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(self.event_to_dto(row)?);
        }
        Ok(MemoryEventsPage { events, next_cursor })
    }

    /// Soft-delete items whose TTL lapsed, emitting `expired` events and
    /// queueing their vector cleanup. Returns how many expired.
    pub async fn expire_due(&self, batch: usize) -> Result<usize> {
        let now = now_ts();
        let rows = self
            .pool
            .run(move |conn| db::expired_memories_sync(conn, &now, batch))
            .await?;
        let count = rows.len();
        for row in rows {
            let event = MemoryEventRow {
                id: Uuid::new_v4().to_string(),
                encoded_namespace: row.encoded_namespace.clone(),
                key: row.key.clone(),
                kind: MemoryEventKind::Expired.as_str().to_string(),
                occurred_at: monotonic_now_ts(),
                value_snapshot: None,
                attributes_snapshot: None,
            };
            let id = row.id.clone();
            self.pool
                .run(move |conn| -> Result<()> {
                    if db::soft_delete_memory_by_id_sync(conn, &id)? {
                        db::append_event_sync(conn, &event)?;
                        db::enqueue_task_sync(
                            conn,
                            TASK_DELETE_MEMORY_VECTORS,
                            &serde_json::json!({ "memory_id": id }).to_string(),
                        )?;
                    }
                    Ok(())
                })
                .await?;
        }
        Ok(count)
    }

    /// Embed and upsert one item's vector. Returns false when the item
    /// vanished or has nothing to index.
    pub async fn index_memory(&self, memory_id: &str) -> Result<bool> {
        let id = memory_id.to_string();
        let Some(row) = self
            .pool
            .run(move |conn| db::get_memory_by_id_sync(conn, &id))
            .await?
        else {
            return Ok(false);
        };

        let Some(fields_json) = row.index_fields.as_deref() else {
            return self.mark_indexed(&row.id).await.map(|_| false);
        };
        let fields: Vec<String> = serde_json::from_str(fields_json)?;
        let value: Value = serde_json::from_slice(&self.chain.decrypt(&row.value_ciphertext)?)?;
        let texts: Vec<String> = fields
            .iter()
            .filter_map(|path| resolve_field(&value, path))
            .collect();
        if texts.is_empty() {
            return self.mark_indexed(&row.id).await.map(|_| false);
        }

        let (embedder, vector) = match (&self.embedder, &self.vector) {
            (Some(e), Some(v)) => (e, v),
            _ => {
                return Err(EngramError::Embedding(
                    "no embedder configured for memory indexing".to_string(),
                ));
            }
        };

        let embedding = embedder
            .embed(&texts.join("\n"))
            .await
            .map_err(|e| EngramError::Embedding(e.to_string()))?;
        vector
            .upsert_memory_vectors(vec![MemoryVector {
                memory_id: row.id.clone(),
                encoded_namespace: row.encoded_namespace.clone(),
                prefixes: namespace::ancestor_prefixes(&row.encoded_namespace),
                embedding,
            }])
            .await?;
        self.mark_indexed(&row.id).await?;
        Ok(true)
    }

    /// Remove an item's vector rows (delete/expiry cleanup).
    pub async fn delete_memory_vectors(&self, memory_id: &str) -> Result<()> {
        if let Some(vector) = &self.vector {
            vector.delete_memory_vectors(memory_id.to_string()).await?;
        }
        Ok(())
    }

    /// One indexer tick: claim items whose content moved past their last
    /// indexing and embed them. Returns how many were processed.
    pub async fn index_pending(&self, batch: usize) -> Result<usize> {
        if self.embedder.is_none() || self.vector.is_none() {
            return Ok(0);
        }
        let rows = self
            .pool
            .run(move |conn| db::pending_index_memories_sync(conn, batch))
            .await?;
        let mut processed = 0;
        for row in rows {
            match self.index_memory(&row.id).await {
                Ok(_) => processed += 1,
                Err(e) => {
                    tracing::warn!(memory_id = %row.id, "memory indexing failed: {e}");
                }
            }
        }
        Ok(processed)
    }

    /// Admin force-delete: hard-remove every record under a namespace
    /// prefix, vectors included. Bypasses the policy bundle but not the
    /// admin role.
    pub async fn admin_force_delete(
        &self,
        principal: &Principal,
        prefix: &[String],
    ) -> Result<usize> {
        if !principal.admin {
            return Err(EngramError::Forbidden("admin role required".to_string()));
        }
        namespace::validate(prefix, self.max_namespace_depth)?;
        let encoded = namespace::encode(prefix);
        let ids = self
            .pool
            .run(move |conn| db::force_delete_memories_sync(conn, &encoded))
            .await?;
        let count = ids.len();
        for id in ids {
            self.delete_memory_vectors(&id).await?;
        }
        Ok(count)
    }

    async fn mark_indexed(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.pool
            .run(move |conn| db::mark_memory_indexed_sync(conn, &id))
            .await
    }

    /// Decrypt a row into its DTO, dropping it when the attribute filter
    /// rejects it. Filters see the user attributes overlaid with the
    /// plaintext policy attributes.
    fn hydrate_filtered(
        &self,
        row: MemoryRow,
        attr_filter: Option<&Map<String, Value>>,
        score: Option<f32>,
    ) -> Result<Option<MemoryItemDto>> {
        let policy_attrs: Option<Map<String, Value>> = row
            .policy_attributes
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let dto = self.row_to_dto(row, score)?;
        if let Some(wanted) = attr_filter {
            if wanted.is_empty() {
                return Ok(Some(dto));
            }
            let mut merged = match &dto.attributes {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            if let Some(policy_map) = policy_attrs {
                merged.extend(policy_map);
            }
            if !filter::matches(&merged, wanted) {
                return Ok(None);
            }
        }
        Ok(Some(dto))
    }

    fn row_to_dto(&self, row: MemoryRow, score: Option<f32>) -> Result<MemoryItemDto> {
        let value: Value = serde_json::from_slice(&self.chain.decrypt(&row.value_ciphertext)?)?;
        let attributes = match &row.attributes_ciphertext {
            Some(ciphertext) => Some(serde_json::from_slice(&self.chain.decrypt(ciphertext)?)?),
            None => None,
        };
        Ok(MemoryItemDto {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| EngramError::Other(format!("malformed memory id: {e}")))?,
            namespace: namespace::decode(&row.encoded_namespace),
            key: row.key,
            value: Some(value),
            attributes,
            created_at: row.created_at,
            expires_at: row.expires_at,
            score,
        })
    }

    fn event_to_dto(&self, row: MemoryEventRow) -> Result<MemoryEventDto> {
        let value = match &row.value_snapshot {
            Some(ciphertext) => Some(serde_json::from_slice(&self.chain.decrypt(ciphertext)?)?),
            None => None,
        };
        let attributes = match &row.attributes_snapshot {
            Some(ciphertext) => Some(serde_json::from_slice(&self.chain.decrypt(ciphertext)?)?),
            None => None,
        };
        Ok(MemoryEventDto {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| EngramError::Other(format!("malformed event id: {e}")))?,
            namespace: namespace::decode(&row.encoded_namespace),
            key: row.key,
            kind: MemoryEventKind::parse(&row.kind)
                .ok_or_else(|| EngramError::Other(format!("unknown event kind {:?}", row.kind)))?,
            occurred_at: row.occurred_at,
            value,
            attributes,
        })
    }
}

fn is_expired(row: &MemoryRow) -> bool {
    match &row.expires_at {
        Some(expiry) => expiry.as_str() < now_ts().as_str(),
        None => false,
    }
}

/// Resolve a dotted path inside a JSON value to a string.
fn resolve_field(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    current.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_field_paths() {
        let value = serde_json::json!({"text": "hello", "meta": {"note": "deep"}});
        assert_eq!(resolve_field(&value, "text").as_deref(), Some("hello"));
        assert_eq!(resolve_field(&value, "meta.note").as_deref(), Some("deep"));
        assert_eq!(resolve_field(&value, "missing"), None);
        // Non-string leaves don't index
        let numeric = serde_json::json!({"n": 42});
        assert_eq!(resolve_field(&numeric, "n"), None);
    }
}
