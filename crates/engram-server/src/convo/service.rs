// crates/engram-server/src/convo/service.rs
// Conversation core: append, list, fork, share, transfer, stream, search

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use engram_types::{
    AccessLevel, AppendEntryRequest, Channel, ConversationDto, CreateConversationRequest,
    EntryDto, ForkRequest, ListMode, MembershipDto, SearchHit, SearchRequest, SearchResponse,
    ShareRequest, SyncMemoryRequest, TransferDto, TransferRole, TransferStatus,
};

use super::stream::{self, StreamOutcome};
use crate::authz::{Principal, effective_level_sync, require_level};
use crate::cache::{ByteCache, conversation_key, epoch_key};
use crate::config::{Config, MemoryClearMode, PartialPersistence, SearchMergeMode};
use crate::crypto::ProviderChain;
use crate::db::pool::DatabasePool;
use crate::db::types::{ConversationRow, EntryRow};
use crate::db::{self, EntryFilter};
use crate::embeddings::EmbeddingClient;
use crate::error::{EngramError, Result};
use crate::resume::{Replay, Resumer};
use crate::search::{EntrySearchFilter, FullTextIndex, SqliteVectorIndex};
use crate::utils::monotonic_now_ts;

/// Task type for asynchronous entry indexing.
pub const TASK_INDEX_ENTRY: &str = "index-entry";
/// Task type for purging a deleted group's index rows.
pub const TASK_DELETE_GROUP_INDEX: &str = "delete-group-index";

const CACHE_TTL: Duration = Duration::from_secs(60);

pub struct ConversationService {
    pool: Arc<DatabasePool>,
    cache: Arc<dyn ByteCache>,
    chain: Arc<ProviderChain>,
    vector: Option<Arc<SqliteVectorIndex>>,
    fulltext: Option<Arc<FullTextIndex>>,
    embedder: Option<Arc<EmbeddingClient>>,
    resumer: Arc<Resumer>,
    cfg: Arc<Config>,
}

impl ConversationService {
    pub fn new(
        pool: Arc<DatabasePool>,
        cache: Arc<dyn ByteCache>,
        chain: Arc<ProviderChain>,
        vector: Option<Arc<SqliteVectorIndex>>,
        fulltext: Option<Arc<FullTextIndex>>,
        embedder: Option<Arc<EmbeddingClient>>,
        resumer: Arc<Resumer>,
        cfg: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self { pool, cache, chain, vector, fulltext, embedder, resumer, cfg })
    }

    // ───────────────────────────────────────
    // Conversations
    // ───────────────────────────────────────

    pub async fn create_conversation(
        &self,
        principal: &Principal,
        req: CreateConversationRequest,
    ) -> Result<ConversationDto> {
        let conversation_id = Uuid::new_v4().to_string();
        let group_id = Uuid::new_v4().to_string();
        let owner = principal.user_id.clone();
        let title = req.title.clone();
        let org = req.organization_id.map(|id| id.to_string());
        let team = req.team_id.map(|id| id.to_string());
        let row = self
            .pool
            .run_with_retry(move |conn| {
                db::create_conversation_sync(
                    conn,
                    &conversation_id,
                    &group_id,
                    title.as_deref(),
                    &owner,
                    org.as_deref(),
                    team.as_deref(),
                )
            })
            .await?;
        convo_row_to_dto(&row)
    }

    /// Cache-aside conversation fetch; READER access required.
    pub async fn get_conversation(
        &self,
        principal: &Principal,
        conversation_id: &str,
    ) -> Result<ConversationDto> {
        let row = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;

        let key = conversation_key(conversation_id);
        if let Some(cached) = self.cache.get(&key).await {
            if let Ok(dto) = serde_json::from_slice::<ConversationDto>(&cached) {
                return Ok(dto);
            }
        }
        let dto = convo_row_to_dto(&row)?;
        self.cache
            .put(key, serde_json::to_vec(&dto)?, CACHE_TTL)
            .await;
        Ok(dto)
    }

    pub async fn list_conversations(
        &self,
        principal: &Principal,
        mode: ListMode,
        after_cursor: Option<String>,
        limit: usize,
        query: Option<String>,
    ) -> Result<(Vec<ConversationDto>, Option<String>)> {
        // A query routes through search and hydrates the hit conversations.
        if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
            let response = self
                .search(
                    principal,
                    SearchRequest {
                        query,
                        limit: Some(limit),
                        conversation_ids: None,
                        before: None,
                    },
                )
                .await?;
            let mut seen = std::collections::HashSet::new();
            let mut out = Vec::new();
            for hit in response.hits {
                let conversation_id = hit.conversation_id.to_string();
                if !seen.insert(conversation_id.clone()) {
                    continue;
                }
                if let Ok(dto) = self.get_conversation(principal, &conversation_id).await {
                    out.push(dto);
                }
            }
            return Ok((out, None));
        }

        let cursor = after_cursor.map(|c| db::cursor::decode(&c)).transpose()?;
        let user = principal.user_id.clone();
        let limit = limit.clamp(1, 200);
        let rows = self
            .pool
            .run(move |conn| db::list_conversations_sync(conn, &user, mode, cursor, limit))
            .await?;
        let next_cursor = (rows.len() == limit)
            .then(|| rows.last().map(|row| db::cursor::encode(&row.created_at, &row.id)))
            .flatten();
        let dtos = rows.iter().map(convo_row_to_dto).collect::<Result<Vec<_>>>()?;
        Ok((dtos, next_cursor))
    }

    /// Soft-delete one conversation (owner only). Forks survive; the
    /// shared group stays intact.
    pub async fn delete_conversation(&self, principal: &Principal, conversation_id: &str) -> Result<()> {
        self.authorized_conversation(principal, conversation_id, AccessLevel::Owner)
            .await?;
        let id = conversation_id.to_string();
        self.pool
            .run(move |conn| db::delete_conversation_sync(conn, &id))
            .await?;
        self.cache.remove(&conversation_key(conversation_id)).await;
        Ok(())
    }

    pub async fn fork(
        &self,
        principal: &Principal,
        conversation_id: &str,
        at_entry_id: &str,
        req: ForkRequest,
    ) -> Result<ConversationDto> {
        let parent = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;

        // The fork point must be an entry of the parent conversation.
        let parent_id = parent.id.clone();
        let entry_id = at_entry_id.to_string();
        let entry = self
            .pool
            .run(move |conn| db::get_entry_sync(conn, &parent_id, &entry_id))
            .await?;
        if entry.is_none() {
            return Err(EngramError::BadRequest(format!(
                "entry {at_entry_id} does not belong to conversation {conversation_id}"
            )));
        }

        let fork_id = Uuid::new_v4().to_string();
        let owner = principal.user_id.clone();
        let title = req.title.clone();
        let at_entry = at_entry_id.to_string();
        let row = self
            .pool
            .run(move |conn| {
                db::fork_conversation_sync(conn, &parent, &at_entry, &fork_id, title.as_deref(), &owner)
            })
            .await?;
        convo_row_to_dto(&row)
    }

    pub async fn list_forks(
        &self,
        principal: &Principal,
        conversation_id: &str,
    ) -> Result<Vec<ConversationDto>> {
        self.authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;
        let id = conversation_id.to_string();
        let rows = self.pool.run(move |conn| db::list_forks_sync(conn, &id)).await?;
        rows.iter().map(convo_row_to_dto).collect()
    }

    // ───────────────────────────────────────
    // Entries
    // ───────────────────────────────────────

    pub async fn append_entry(
        &self,
        principal: &Principal,
        conversation_id: &str,
        req: AppendEntryRequest,
    ) -> Result<EntryDto> {
        let convo = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Writer)
            .await?;

        let memory_epoch = match req.channel {
            Channel::Memory => {
                let client = req.client_id.clone().ok_or_else(|| {
                    EngramError::BadRequest(
                        "MEMORY entries require a client_id".to_string(),
                    )
                })?;
                let convo_id = convo.id.clone();
                let latest = self
                    .pool
                    .run(move |conn| db::latest_epoch_sync(conn, &convo_id, &client))
                    .await?;
                Some(latest.unwrap_or(1))
            }
            _ => None,
        };

        let row = EntryRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: convo.id.clone(),
            group_id: convo.group_id.clone(),
            user_id: Some(principal.user_id.clone()),
            client_id: req.client_id.clone(),
            channel: req.channel.as_str().to_string(),
            memory_epoch,
            content: self.encode_content(&req.content)?,
            content_type: req.content_type.clone(),
            created_at: monotonic_now_ts(),
        };
        self.persist_entry(row.clone(), req.channel != Channel::Memory).await?;
        self.cache.remove(&conversation_key(conversation_id)).await;
        if let Some(client) = &req.client_id {
            self.cache.remove(&epoch_key(conversation_id, client)).await;
        }
        self.entry_row_to_dto(&row)
    }

    pub async fn list_entries(
        &self,
        principal: &Principal,
        conversation_id: &str,
        channel: Option<Channel>,
        client_id: Option<String>,
        epoch: Option<i64>,
        after: Option<String>,
        limit: usize,
    ) -> Result<Vec<EntryDto>> {
        let convo = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;

        let filter = EntryFilter {
            channel: channel.map(|c| c.as_str().to_string()),
            client_id,
            epoch,
            after,
            limit: limit.clamp(1, 1000),
        };
        let rows = self
            .pool
            .run(move |conn| db::list_entries_sync(conn, &convo, &filter))
            .await?;
        rows.iter().map(|row| self.entry_row_to_dto(row)).collect()
    }

    /// Atomic memory-window replace for a (conversation, client) pair.
    pub async fn sync_memory(
        &self,
        principal: &Principal,
        conversation_id: &str,
        req: SyncMemoryRequest,
    ) -> Result<i64> {
        let convo = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Writer)
            .await?;
        if req.client_id.trim().is_empty() {
            return Err(EngramError::BadRequest("client_id must not be empty".to_string()));
        }

        let mut entries = Vec::with_capacity(req.entries.len());
        for entry in &req.entries {
            entries.push((
                Uuid::new_v4().to_string(),
                self.encode_content(&entry.content)?,
                entry.content_type.clone(),
                monotonic_now_ts(),
            ));
        }
        // An empty sync is a memory clear; tombstone mode marks the epoch
        // with a single empty entry instead of leaving it bare.
        if entries.is_empty() && self.cfg.memory_clear_mode == MemoryClearMode::Tombstone {
            entries.push((
                Uuid::new_v4().to_string(),
                self.encode_content(&[])?,
                None,
                monotonic_now_ts(),
            ));
        }

        let convo_id = convo.id.clone();
        let group_id = convo.group_id.clone();
        let client = req.client_id.clone();
        let epoch = self
            .pool
            .run_with_retry(move |conn| {
                db::sync_memory_sync(conn, &convo_id, &group_id, &client, &entries)
            })
            .await?;

        self.cache
            .put(
                epoch_key(conversation_id, &req.client_id),
                epoch.to_be_bytes().to_vec(),
                CACHE_TTL,
            )
            .await;
        Ok(epoch)
    }

    /// Latest memory epoch, cache-aside.
    pub async fn latest_memory_epoch(
        &self,
        principal: &Principal,
        conversation_id: &str,
        client_id: &str,
    ) -> Result<Option<i64>> {
        self.authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;
        let key = epoch_key(conversation_id, client_id);
        if let Some(bytes) = self.cache.get(&key).await {
            if let Ok(raw) = <[u8; 8]>::try_from(bytes.as_slice()) {
                return Ok(Some(i64::from_be_bytes(raw)));
            }
        }
        let convo = conversation_id.to_string();
        let client = client_id.to_string();
        let epoch = self
            .pool
            .run(move |conn| db::latest_epoch_sync(conn, &convo, &client))
            .await?;
        if let Some(value) = epoch {
            self.cache.put(key, value.to_be_bytes().to_vec(), CACHE_TTL).await;
        }
        Ok(epoch)
    }

    // ───────────────────────────────────────
    // Sharing
    // ───────────────────────────────────────

    pub async fn list_memberships(
        &self,
        principal: &Principal,
        conversation_id: &str,
    ) -> Result<Vec<MembershipDto>> {
        let convo = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;
        let group = convo.group_id.clone();
        let rows = self
            .pool
            .run(move |conn| db::list_memberships_sync(conn, &group))
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(MembershipDto {
                    group_id: parse_uuid(&row.group_id)?,
                    user_id: row.user_id,
                    access_level: AccessLevel::from_rank(row.access_level).ok_or_else(|| {
                        EngramError::Other(format!("bad access level rank {}", row.access_level))
                    })?,
                })
            })
            .collect()
    }

    /// Grant access. The caller's level must be strictly greater than the
    /// granted level and within their grant ceiling: OWNER grants up to
    /// MANAGER, MANAGER up to WRITER.
    pub async fn share(
        &self,
        principal: &Principal,
        conversation_id: &str,
        req: ShareRequest,
    ) -> Result<MembershipDto> {
        let convo = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;
        let caller_level = self.level_on(&convo.group_id, &principal.user_id).await?;
        check_grant(caller_level, req.access_level)?;
        if req.user_id == principal.user_id {
            return Err(EngramError::BadRequest("cannot share with yourself".to_string()));
        }

        // Never touch the OWNER membership through sharing.
        let group = convo.group_id.clone();
        let target = req.user_id.clone();
        let existing = self
            .pool
            .run(move |conn| db::membership_level_sync(conn, &group, &target))
            .await?;
        if existing == Some(AccessLevel::Owner.rank()) {
            return Err(EngramError::Conflict(
                "ownership moves via transfer, not sharing".to_string(),
            ));
        }

        let group = convo.group_id.clone();
        let target = req.user_id.clone();
        let rank = req.access_level.rank();
        self.pool
            .run(move |conn| db::upsert_membership_sync(conn, &group, &target, rank))
            .await?;

        Ok(MembershipDto {
            group_id: parse_uuid(&convo.group_id)?,
            user_id: req.user_id,
            access_level: req.access_level,
        })
    }

    pub async fn update_membership(
        &self,
        principal: &Principal,
        conversation_id: &str,
        user_id: &str,
        new_level: AccessLevel,
    ) -> Result<MembershipDto> {
        self.share(
            principal,
            conversation_id,
            ShareRequest { user_id: user_id.to_string(), access_level: new_level },
        )
        .await
    }

    pub async fn delete_membership(
        &self,
        principal: &Principal,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let convo = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;
        let caller_level = self.level_on(&convo.group_id, &principal.user_id).await?;

        let group = convo.group_id.clone();
        let target = user_id.to_string();
        let existing = self
            .pool
            .run(move |conn| db::membership_level_sync(conn, &group, &target))
            .await?
            .and_then(AccessLevel::from_rank)
            .ok_or_else(|| EngramError::NotFound(format!("no membership for {user_id}")))?;
        if existing == AccessLevel::Owner {
            return Err(EngramError::Conflict("the OWNER membership cannot be removed".to_string()));
        }
        // Removal obeys the same ceiling as granting.
        check_grant(caller_level, existing)?;

        let group = convo.group_id.clone();
        let target = user_id.to_string();
        self.pool
            .run(move |conn| db::delete_membership_sync(conn, &group, &target))
            .await?;
        Ok(())
    }

    // ───────────────────────────────────────
    // Ownership transfers
    // ───────────────────────────────────────

    pub async fn request_transfer(
        &self,
        principal: &Principal,
        conversation_id: &str,
        to_user_id: &str,
    ) -> Result<TransferDto> {
        self.authorized_conversation(principal, conversation_id, AccessLevel::Owner)
            .await?;
        if to_user_id == principal.user_id {
            return Err(EngramError::BadRequest(
                "cannot transfer ownership to yourself".to_string(),
            ));
        }
        let transfer_id = Uuid::new_v4().to_string();
        let convo = conversation_id.to_string();
        let from = principal.user_id.clone();
        let to = to_user_id.to_string();
        let row = self
            .pool
            .run(move |conn| db::request_transfer_sync(conn, &transfer_id, &convo, &from, &to))
            .await?;
        transfer_row_to_dto(&row)
    }

    pub async fn list_transfers(
        &self,
        principal: &Principal,
        role: TransferRole,
    ) -> Result<Vec<TransferDto>> {
        let user = principal.user_id.clone();
        let rows = self
            .pool
            .run(move |conn| db::list_transfers_sync(conn, &user, role))
            .await?;
        rows.iter().map(transfer_row_to_dto).collect()
    }

    pub async fn get_transfer(&self, principal: &Principal, transfer_id: &str) -> Result<TransferDto> {
        let row = self.transfer_row(transfer_id).await?;
        if row.from_user_id != principal.user_id
            && row.to_user_id != principal.user_id
            && !principal.admin
        {
            return Err(EngramError::NotFound(format!("transfer {transfer_id} not found")));
        }
        transfer_row_to_dto(&row)
    }

    pub async fn accept_transfer(
        &self,
        principal: &Principal,
        transfer_id: &str,
    ) -> Result<TransferDto> {
        let row = self.transfer_row(transfer_id).await?;
        if row.to_user_id != principal.user_id {
            return Err(EngramError::Forbidden(
                "only the recipient may accept a transfer".to_string(),
            ));
        }
        let convo_id = row.conversation_id.clone();
        let convo = self
            .pool
            .run(move |conn| db::get_conversation_sync(conn, &convo_id, false))
            .await?
            .ok_or_else(|| {
                EngramError::NotFound(format!("conversation {} not found", row.conversation_id))
            })?;

        let id = transfer_id.to_string();
        let group = convo.group_id.clone();
        let accepted = self
            .pool
            .run_with_retry(move |conn| db::accept_transfer_sync(conn, &id, &group))
            .await?;
        self.cache.remove(&conversation_key(&row.conversation_id)).await;
        transfer_row_to_dto(&accepted)
    }

    pub async fn cancel_transfer(
        &self,
        principal: &Principal,
        transfer_id: &str,
    ) -> Result<TransferDto> {
        let row = self.transfer_row(transfer_id).await?;
        if row.from_user_id != principal.user_id && row.to_user_id != principal.user_id {
            return Err(EngramError::Forbidden(
                "only a transfer participant may cancel it".to_string(),
            ));
        }
        let id = transfer_id.to_string();
        let cancelled = self
            .pool
            .run(move |conn| db::cancel_transfer_sync(conn, &id))
            .await?;
        transfer_row_to_dto(&cancelled)
    }

    // ───────────────────────────────────────
    // Search
    // ───────────────────────────────────────

    pub async fn search(&self, principal: &Principal, req: SearchRequest) -> Result<SearchResponse> {
        let limit = req.limit.unwrap_or(20).clamp(1, 100);
        let semantic = match (&self.embedder, &self.vector) {
            (Some(embedder), Some(vector)) => Some((embedder, vector)),
            _ => None,
        };
        if semantic.is_none() && self.fulltext.is_none() {
            return Err(EngramError::SearchUnavailable(Vec::new()));
        }

        let mut hits: Vec<SearchHit> = Vec::new();
        let mut search_type = "semantic";

        if let Some((embedder, vector)) = semantic {
            let embedding = embedder
                .embed_query(&req.query)
                .await
                .map_err(|e| EngramError::Embedding(e.to_string()))?;
            let filter = EntrySearchFilter {
                conversation_ids: req
                    .conversation_ids
                    .as_ref()
                    .map(|ids| ids.iter().map(|id| id.to_string()).collect()),
                before: req.before.clone(),
            };
            hits = vector
                .search_by_user(principal.user_id.clone(), embedding, limit, filter)
                .await?
                .into_iter()
                .map(|hit| {
                    Ok(SearchHit {
                        entry_id: parse_uuid(&hit.entry_id)?,
                        conversation_id: parse_uuid(&hit.conversation_id)?,
                        score: Some(hit.score),
                        snippet: None,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }

        let use_fulltext = match self.cfg.search_merge_mode {
            SearchMergeMode::Fallback => hits.is_empty(),
            SearchMergeMode::RankMerge => true,
        };
        if use_fulltext {
            if let Some(fulltext) = &self.fulltext {
                let keyword_hits = fulltext
                    .search_by_user(
                        principal.user_id.clone(),
                        req.query.clone(),
                        limit,
                        req.before.clone(),
                    )
                    .await?;
                if hits.is_empty() {
                    search_type = "fulltext";
                } else {
                    search_type = "hybrid";
                }
                let known: std::collections::HashSet<Uuid> =
                    hits.iter().map(|h| h.entry_id).collect();
                for hit in keyword_hits {
                    let entry_id = parse_uuid(&hit.entry_id)?;
                    if known.contains(&entry_id) {
                        continue;
                    }
                    hits.push(SearchHit {
                        entry_id,
                        conversation_id: parse_uuid(&hit.conversation_id)?,
                        score: None,
                        snippet: Some(hit.snippet),
                    });
                }
                hits.truncate(limit);
            }
        }

        Ok(SearchResponse { hits, search_type: search_type.to_string() })
    }

    // ───────────────────────────────────────
    // Streaming responses
    // ───────────────────────────────────────

    /// Run an agent's token stream through the adapter: every token goes
    /// to the returned client stream, the in-memory buffer, and the
    /// resumable recording. One materialized entry persists at the end,
    /// whatever the end looks like.
    pub async fn stream_response<S>(
        self: Arc<Self>,
        principal: &Principal,
        conversation_id: &str,
        client_id: Option<String>,
        content_type: Option<String>,
        upstream: S,
    ) -> Result<ReceiverStream<String>>
    where
        S: Stream<Item = Result<String>> + Unpin + Send + 'static,
    {
        let convo = self
            .authorized_conversation(principal, conversation_id, AccessLevel::Writer)
            .await?;
        let recording = self
            .resumer
            .recorder_with_address(&convo.id, &self.cfg.advertised_address)
            .await?;

        // In always-persist mode the entry row exists from the first
        // token and its content refreshes as the stream progresses.
        let progressive_entry = if self.cfg.partial_persistence == PartialPersistence::Always {
            let row = self.agent_entry_row(&convo, client_id.clone(), content_type.clone(), "")?;
            self.persist_entry(row.clone(), false).await?;
            Some(row.id)
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(256);
        let service = Arc::clone(&self);
        let flush_target = progressive_entry.clone();
        let on_progress: Option<Box<dyn FnMut(&str) + Send>> = match flush_target.clone() {
            Some(entry_id) => {
                let (progress_tx, progress_rx) = watch::channel(String::new());
                self.spawn_partial_flusher(entry_id, progress_rx);
                Some(Box::new(move |text: &str| {
                    let _ = progress_tx.send(text.to_string());
                }))
            }
            None => None,
        };

        let convo_clone = convo.clone();
        tokio::spawn(async move {
            let outcome =
                stream::pump(upstream, recording.clone(), tx, on_progress).await;
            if let Err(e) = service
                .finish_streamed(convo_clone, client_id, content_type, outcome, flush_target)
                .await
            {
                tracing::error!("persisting streamed response failed: {e}");
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Resume the live (or recently completed) response stream.
    pub async fn replay_response(
        &self,
        principal: &Principal,
        conversation_id: &str,
    ) -> Result<Replay> {
        self.authorized_conversation(principal, conversation_id, AccessLevel::Reader)
            .await?;
        self.resumer
            .replay_with_address(conversation_id, &self.cfg.advertised_address)
            .await
    }

    /// Route a cancel to the stream's owner.
    pub async fn cancel_response(&self, principal: &Principal, conversation_id: &str) -> Result<()> {
        self.authorized_conversation(principal, conversation_id, AccessLevel::Writer)
            .await?;
        self.resumer.request_cancel(conversation_id).await
    }

    async fn finish_streamed(
        &self,
        convo: ConversationRow,
        client_id: Option<String>,
        content_type: Option<String>,
        outcome: StreamOutcome,
        progressive_entry: Option<String>,
    ) -> Result<()> {
        if let Some(reason) = &outcome.failed {
            tracing::warn!(
                conversation_id = %convo.id,
                "stream ended with failure, persisting partial: {reason}"
            );
        }
        match progressive_entry {
            Some(entry_id) => {
                let content = self.encode_content(&[text_block(&outcome.text)])?;
                let id = entry_id.clone();
                self.pool
                    .run(move |conn| db::update_entry_content_sync(conn, &id, &content))
                    .await?;
                self.enqueue_index(&entry_id, &convo.id).await?;
            }
            None => {
                let row = self.agent_entry_row(&convo, client_id, content_type, &outcome.text)?;
                self.persist_entry(row, true).await?;
            }
        }
        self.cache.remove(&conversation_key(&convo.id)).await;
        Ok(())
    }

    fn agent_entry_row(
        &self,
        convo: &ConversationRow,
        client_id: Option<String>,
        content_type: Option<String>,
        text: &str,
    ) -> Result<EntryRow> {
        Ok(EntryRow {
            id: Uuid::new_v4().to_string(),
            conversation_id: convo.id.clone(),
            group_id: convo.group_id.clone(),
            user_id: None,
            client_id,
            channel: Channel::History.as_str().to_string(),
            memory_epoch: None,
            content: self.encode_content(&[text_block(text)])?,
            content_type,
            created_at: monotonic_now_ts(),
        })
    }

    fn spawn_partial_flusher(&self, entry_id: String, mut progress: watch::Receiver<String>) {
        let pool = self.pool.clone();
        let chain = self.chain.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let text = progress.borrow_and_update().clone();
                let Ok(serialized) = serde_json::to_vec(&vec![text_block(&text)]) else {
                    continue;
                };
                let Ok(content) = chain.encrypt(&serialized) else { continue };
                let id = entry_id.clone();
                pool.best_effort("partial entry flush", move |conn| {
                    db::update_entry_content_sync(conn, &id, &content)
                })
                .await;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        });
    }

    // ───────────────────────────────────────
    // Index task handlers (invoked by the background worker)
    // ───────────────────────────────────────

    /// Index one entry into the full-text and vector indices.
    pub async fn index_entry(&self, entry_id: &str) -> Result<()> {
        let id = entry_id.to_string();
        let Some(row) = self
            .pool
            .run(move |conn| db::get_entry_by_id_sync(conn, &id))
            .await?
        else {
            return Ok(()); // deleted since enqueue
        };
        let blocks = self.decode_content(&row.content)?;
        let text = extract_text(&blocks);
        if text.is_empty() {
            return Ok(());
        }

        if let Some(fulltext) = &self.fulltext {
            fulltext
                .index_entry(
                    row.id.clone(),
                    row.group_id.clone(),
                    row.conversation_id.clone(),
                    row.created_at.clone(),
                    text.clone(),
                )
                .await?;
        }
        if let (Some(embedder), Some(vector)) = (&self.embedder, &self.vector) {
            let embedding = embedder
                .embed(&text)
                .await
                .map_err(|e| EngramError::Embedding(e.to_string()))?;
            vector
                .index_entry(
                    row.id.clone(),
                    row.group_id.clone(),
                    row.conversation_id.clone(),
                    row.created_at.clone(),
                    embedding,
                )
                .await?;
        }
        Ok(())
    }

    /// Purge a deleted group's index rows (no FK ties them to entries).
    pub async fn delete_group_index(&self, group_id: &str) -> Result<()> {
        if let Some(vector) = &self.vector {
            vector.delete_group(group_id.to_string()).await?;
        }
        if let Some(fulltext) = &self.fulltext {
            fulltext.delete_group(group_id.to_string()).await?;
        }
        Ok(())
    }

    // ───────────────────────────────────────
    // Admin surface
    // ───────────────────────────────────────

    pub async fn admin_list_conversations(
        &self,
        principal: &Principal,
        filter: Option<String>,
        include_deleted: bool,
        limit: usize,
    ) -> Result<Vec<ConversationDto>> {
        require_admin(principal)?;
        let rows = self
            .pool
            .run(move |conn| {
                db::admin_list_conversations_sync(
                    conn,
                    filter.as_deref(),
                    include_deleted,
                    limit.clamp(1, 500),
                )
            })
            .await?;
        rows.iter().map(convo_row_to_dto).collect()
    }

    /// Purge an entire group: soft-delete its conversations, hard-delete
    /// its entries, and queue index cleanup.
    pub async fn admin_delete(&self, principal: &Principal, conversation_id: &str) -> Result<()> {
        require_admin(principal)?;
        let id = conversation_id.to_string();
        let convo = self
            .pool
            .run(move |conn| db::get_conversation_sync(conn, &id, true))
            .await?
            .ok_or_else(|| {
                EngramError::NotFound(format!("conversation {conversation_id} not found"))
            })?;
        let group = convo.group_id.clone();
        let group_for_task = group.clone();
        self.pool
            .run(move |conn| -> Result<()> {
                db::delete_group_sync(conn, &group)?;
                db::enqueue_task_sync(
                    conn,
                    TASK_DELETE_GROUP_INDEX,
                    &serde_json::json!({ "group_id": group_for_task }).to_string(),
                )?;
                Ok(())
            })
            .await?;
        self.cache.remove(&conversation_key(conversation_id)).await;
        Ok(())
    }

    pub async fn admin_restore(&self, principal: &Principal, conversation_id: &str) -> Result<()> {
        require_admin(principal)?;
        let id = conversation_id.to_string();
        let restored = self
            .pool
            .run(move |conn| db::restore_conversation_sync(conn, &id))
            .await?;
        if !restored {
            return Err(EngramError::NotFound(format!(
                "conversation {conversation_id} not found"
            )));
        }
        Ok(())
    }

    /// Admin search runs without the visibility join.
    pub async fn admin_search(
        &self,
        principal: &Principal,
        query: String,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        require_admin(principal)?;
        let limit = limit.clamp(1, 100);
        let pattern = format!("%{}%", query);
        let rows = self
            .pool
            .run(move |conn| -> Result<Vec<(String, String)>> {
                let mut stmt = conn.prepare(
                    "SELECT entry_id, conversation_id FROM entries_fts
                     WHERE content LIKE ?1 LIMIT ?2",
                )?;
                let rows = stmt.query_map(
                    rusqlite::params![pattern, limit as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
            })
            .await?;
        rows.into_iter()
            .map(|(entry_id, conversation_id)| {
                Ok(SearchHit {
                    entry_id: parse_uuid(&entry_id)?,
                    conversation_id: parse_uuid(&conversation_id)?,
                    score: None,
                    snippet: None,
                })
            })
            .collect()
    }

    /// Index backlog size (entries and memories awaiting embedding).
    pub async fn admin_count_pending_indexing(&self, principal: &Principal) -> Result<i64> {
        require_admin(principal)?;
        self.pool
            .run(|conn| -> Result<i64> {
                let tasks = db::count_pending_tasks_sync(conn, "index-")?;
                let memories = db::pending_index_memories_sync(conn, 10_000)?.len() as i64;
                Ok(tasks.max(memories))
            })
            .await
    }

    // ───────────────────────────────────────
    // Internals
    // ───────────────────────────────────────

    async fn authorized_conversation(
        &self,
        principal: &Principal,
        conversation_id: &str,
        needed: AccessLevel,
    ) -> Result<ConversationRow> {
        let id = conversation_id.to_string();
        let convo = self
            .pool
            .run(move |conn| db::get_conversation_sync(conn, &id, false))
            .await?
            .ok_or_else(|| {
                EngramError::NotFound(format!("conversation {conversation_id} not found"))
            })?;
        let level = self.level_on(&convo.group_id, &principal.user_id).await?;
        require_level(level, needed, &format!("conversation {conversation_id}"))?;
        Ok(convo)
    }

    async fn level_on(&self, group_id: &str, user_id: &str) -> Result<Option<AccessLevel>> {
        let group = group_id.to_string();
        let user = user_id.to_string();
        self.pool
            .run(move |conn| effective_level_sync(conn, &group, &user))
            .await
    }

    async fn transfer_row(&self, transfer_id: &str) -> Result<crate::db::types::TransferRow> {
        let id = transfer_id.to_string();
        self.pool
            .run(move |conn| db::get_transfer_sync(conn, &id))
            .await?
            .ok_or_else(|| EngramError::NotFound(format!("transfer {transfer_id} not found")))
    }

    async fn persist_entry(&self, row: EntryRow, index: bool) -> Result<()> {
        let row_clone = row.clone();
        self.pool
            .run_with_retry(move |conn| db::append_entry_sync(conn, &row_clone))
            .await?;
        if index {
            self.enqueue_index(&row.id, &row.conversation_id).await?;
        }
        Ok(())
    }

    async fn enqueue_index(&self, entry_id: &str, conversation_id: &str) -> Result<()> {
        if self.fulltext.is_none() && (self.embedder.is_none() || self.vector.is_none()) {
            return Ok(());
        }
        let body =
            serde_json::json!({ "entry_id": entry_id, "conversation_id": conversation_id })
                .to_string();
        self.pool
            .run(move |conn| db::enqueue_task_sync(conn, TASK_INDEX_ENTRY, &body))
            .await
    }

    fn encode_content(&self, blocks: &[Value]) -> Result<Vec<u8>> {
        self.chain.encrypt(&serde_json::to_vec(blocks)?)
    }

    fn decode_content(&self, blob: &[u8]) -> Result<Vec<Value>> {
        Ok(serde_json::from_slice(&self.chain.decrypt(blob)?)?)
    }

    fn entry_row_to_dto(&self, row: &EntryRow) -> Result<EntryDto> {
        Ok(EntryDto {
            id: parse_uuid(&row.id)?,
            conversation_id: parse_uuid(&row.conversation_id)?,
            group_id: parse_uuid(&row.group_id)?,
            user_id: row.user_id.clone(),
            client_id: row.client_id.clone(),
            channel: Channel::parse(&row.channel)
                .ok_or_else(|| EngramError::Other(format!("unknown channel {:?}", row.channel)))?,
            memory_epoch: row.memory_epoch,
            content: self.decode_content(&row.content)?,
            content_type: row.content_type.clone(),
            created_at: row.created_at.clone(),
        })
    }
}

fn require_admin(principal: &Principal) -> Result<()> {
    if principal.admin {
        Ok(())
    } else {
        Err(EngramError::Forbidden("admin role required".to_string()))
    }
}

/// Grant/revoke rule: strictly below the caller, within the ceiling.
fn check_grant(caller: Option<AccessLevel>, granted: AccessLevel) -> Result<()> {
    let caller = caller.ok_or_else(|| {
        EngramError::NotFound("no such resource (or no access)".to_string())
    })?;
    let ceiling = caller
        .grant_ceiling()
        .ok_or_else(|| EngramError::Forbidden("no authority to share".to_string()))?;
    if granted > ceiling {
        return Err(EngramError::Forbidden(format!(
            "{caller:?} may grant at most {ceiling:?}"
        )));
    }
    Ok(())
}

fn text_block(text: &str) -> Value {
    serde_json::json!({ "type": "text", "text": text })
}

/// Best-effort text extraction from opaque content blocks: bare strings
/// and `text` fields contribute; everything else stays opaque.
fn extract_text(blocks: &[Value]) -> String {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            Value::String(s) => parts.push(s.clone()),
            Value::Object(map) => {
                if let Some(Value::String(s)) = map.get("text") {
                    parts.push(s.clone());
                }
            }
            _ => {}
        }
    }
    parts.join("\n")
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| EngramError::Other(format!("malformed UUID {s:?}: {e}")))
}

fn convo_row_to_dto(row: &ConversationRow) -> Result<ConversationDto> {
    Ok(ConversationDto {
        id: parse_uuid(&row.id)?,
        group_id: parse_uuid(&row.group_id)?,
        title: row.title.clone(),
        owner_user_id: row.owner_user_id.clone(),
        forked_from_conversation_id: row
            .forked_from_conversation_id
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        forked_at_entry_id: row.forked_at_entry_id.as_deref().map(parse_uuid).transpose()?,
        created_at: row.created_at.clone(),
        updated_at: row.updated_at.clone(),
        deleted_at: row.deleted_at.clone(),
    })
}

fn transfer_row_to_dto(row: &crate::db::types::TransferRow) -> Result<TransferDto> {
    Ok(TransferDto {
        id: parse_uuid(&row.id)?,
        conversation_id: parse_uuid(&row.conversation_id)?,
        from_user_id: row.from_user_id.clone(),
        to_user_id: row.to_user_id.clone(),
        status: TransferStatus::parse(&row.status)
            .ok_or_else(|| EngramError::Other(format!("unknown transfer status {:?}", row.status)))?,
        created_at: row.created_at.clone(),
    })
}
