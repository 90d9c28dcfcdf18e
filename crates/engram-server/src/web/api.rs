// crates/engram-server/src/web/api.rs
// REST handlers for the conversation surface

use std::convert::Infallible;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures::StreamExt;
use serde::Deserialize;
use uuid::Uuid;

use engram_types::{
    AppendEntryRequest, Channel, CreateConversationRequest, ForkRequest, ListMode,
    SearchRequest, ShareRequest, SyncMemoryRequest, TransferRequest, TransferRole,
    UpdateMembershipRequest,
};

use super::state::AppState;
use crate::authz::Principal;
use crate::error::Result;
use crate::resume::Replay;

// ───────────────────────────────────────
// Conversations
// ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListConversationsQuery {
    #[serde(default)]
    pub mode: Option<ListMode>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub query: Option<String>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListConversationsQuery>,
) -> Result<impl IntoResponse> {
    let (conversations, next_cursor) = state
        .conversations
        .list_conversations(
            &principal,
            query.mode.unwrap_or_default(),
            query.cursor,
            query.limit.unwrap_or(50),
            query.query,
        )
        .await?;
    Ok(Json(serde_json::json!({
        "conversations": conversations,
        "next_cursor": next_cursor,
    })))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse> {
    let dto = state.conversations.create_conversation(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(dto)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let dto = state
        .conversations
        .get_conversation(&principal, &id.to_string())
        .await?;
    Ok(Json(dto))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .conversations
        .delete_conversation(&principal, &id.to_string())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ───────────────────────────────────────
// Entries
// ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListEntriesQuery {
    pub channel: Option<Channel>,
    pub client_id: Option<String>,
    pub epoch: Option<i64>,
    pub after: Option<Uuid>,
    pub limit: Option<usize>,
}

pub async fn list_entries(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Query(query): Query<ListEntriesQuery>,
) -> Result<impl IntoResponse> {
    let entries = state
        .conversations
        .list_entries(
            &principal,
            &id.to_string(),
            query.channel,
            query.client_id,
            query.epoch,
            query.after.map(|a| a.to_string()),
            query.limit.unwrap_or(200),
        )
        .await?;
    Ok(Json(serde_json::json!({ "entries": entries })))
}

pub async fn append_entry(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<AppendEntryRequest>,
) -> Result<impl IntoResponse> {
    let entry = state
        .conversations
        .append_entry(&principal, &id.to_string(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

pub async fn fork_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, entry_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ForkRequest>,
) -> Result<impl IntoResponse> {
    let fork = state
        .conversations
        .fork(&principal, &id.to_string(), &entry_id.to_string(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(fork)))
}

pub async fn list_forks(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let forks = state
        .conversations
        .list_forks(&principal, &id.to_string())
        .await?;
    Ok(Json(serde_json::json!({ "forks": forks })))
}

pub async fn sync_memory(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<SyncMemoryRequest>,
) -> Result<impl IntoResponse> {
    let epoch = state
        .conversations
        .sync_memory(&principal, &id.to_string(), req)
        .await?;
    Ok(Json(serde_json::json!({ "epoch": epoch })))
}

// ───────────────────────────────────────
// Sharing
// ───────────────────────────────────────

pub async fn list_memberships(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let memberships = state
        .conversations
        .list_memberships(&principal, &id.to_string())
        .await?;
    Ok(Json(serde_json::json!({ "memberships": memberships })))
}

pub async fn share_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<ShareRequest>,
) -> Result<impl IntoResponse> {
    let membership = state
        .conversations
        .share(&principal, &id.to_string(), req)
        .await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

pub async fn update_membership(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, user_id)): Path<(Uuid, String)>,
    Json(req): Json<UpdateMembershipRequest>,
) -> Result<impl IntoResponse> {
    let membership = state
        .conversations
        .update_membership(&principal, &id.to_string(), &user_id, req.access_level)
        .await?;
    Ok(Json(membership))
}

pub async fn delete_membership(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path((id, user_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse> {
    state
        .conversations
        .delete_membership(&principal, &id.to_string(), &user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ───────────────────────────────────────
// Ownership transfers
// ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListTransfersQuery {
    pub role: Option<TransferRole>,
}

pub async fn request_transfer(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<TransferRequest>,
) -> Result<impl IntoResponse> {
    let transfer = state
        .conversations
        .request_transfer(&principal, &req.conversation_id.to_string(), &req.to_user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(transfer)))
}

pub async fn list_transfers(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListTransfersQuery>,
) -> Result<impl IntoResponse> {
    let transfers = state
        .conversations
        .list_transfers(&principal, query.role.unwrap_or(TransferRole::Recipient))
        .await?;
    Ok(Json(serde_json::json!({ "transfers": transfers })))
}

pub async fn get_transfer(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let transfer = state
        .conversations
        .get_transfer(&principal, &id.to_string())
        .await?;
    Ok(Json(transfer))
}

pub async fn accept_transfer(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let transfer = state
        .conversations
        .accept_transfer(&principal, &id.to_string())
        .await?;
    Ok(Json(transfer))
}

pub async fn cancel_transfer(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let transfer = state
        .conversations
        .cancel_transfer(&principal, &id.to_string())
        .await?;
    Ok(Json(transfer))
}

// ───────────────────────────────────────
// Search
// ───────────────────────────────────────

pub async fn search(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<SearchRequest>,
) -> Result<impl IntoResponse> {
    let response = state.conversations.search(&principal, req).await?;
    Ok(Json(response))
}

// ───────────────────────────────────────
// Streaming responses
// ───────────────────────────────────────

/// Transport-level body for driving an agent response through the stream
/// adapter. The token producer is normally an upstream LLM; over REST it
/// arrives as the token list itself.
#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub tokens: Vec<String>,
    pub client_id: Option<String>,
    pub content_type: Option<String>,
    /// Emission gap between tokens, for producers that pace themselves.
    #[serde(default)]
    pub token_interval_ms: Option<u64>,
}

pub async fn stream_response(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<StreamRequest>,
) -> Result<Response> {
    let interval = req.token_interval_ms.unwrap_or(0);
    let tokens = req.tokens;
    let upstream: futures::stream::BoxStream<'static, Result<String>> = if interval == 0 {
        Box::pin(futures::stream::iter(tokens.into_iter().map(Ok)))
    } else {
        Box::pin(async_stream::stream! {
            for token in tokens {
                tokio::time::sleep(std::time::Duration::from_millis(interval)).await;
                yield Ok(token);
            }
        })
    };

    let stream = state
        .conversations
        .clone()
        .stream_response(
            &principal,
            &id.to_string(),
            req.client_id,
            req.content_type,
            upstream,
        )
        .await?;
    Ok(sse_of(stream).into_response())
}

pub async fn replay_response(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Response> {
    match state
        .conversations
        .replay_response(&principal, &id.to_string())
        .await?
    {
        Replay::Stream(stream) => Ok(sse_of(stream).into_response()),
        Replay::Redirect(address) => Ok((
            StatusCode::TEMPORARY_REDIRECT,
            [(LOCATION, format!("http://{address}/v1/conversations/{id}/response"))],
        )
            .into_response()),
        Replay::Empty => {
            Ok(sse_of(futures::stream::empty::<String>()).into_response())
        }
    }
}

pub async fn cancel_response(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .conversations
        .cancel_response(&principal, &id.to_string())
        .await?;
    Ok(StatusCode::ACCEPTED)
}

fn sse_of<S>(stream: S) -> Sse<impl futures::Stream<Item = std::result::Result<Event, Infallible>>>
where
    S: futures::Stream<Item = String> + Send + 'static,
{
    Sse::new(stream.map(|token| Ok(Event::default().data(token))))
}

// ───────────────────────────────────────
// Attachments
// ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateAttachmentRequest {
    pub filename: Option<String>,
    pub content_type: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkAttachmentRequest {
    pub entry_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct DownloadUrlQuery {
    pub ttl_seconds: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SignedDownloadQuery {
    pub exp: i64,
    pub sig: String,
}

pub async fn create_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<CreateAttachmentRequest>,
) -> Result<impl IntoResponse> {
    let dto = state
        .attachments
        .create(&principal, req.filename, req.content_type)
        .await?;
    Ok((StatusCode::CREATED, Json(dto)))
}

pub async fn get_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let dto = state.attachments.get(&principal, &id.to_string()).await?;
    Ok(Json(dto))
}

pub async fn upload_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse> {
    let dto = state
        .attachments
        .upload(&principal, &id.to_string(), body.to_vec())
        .await?;
    Ok(Json(dto))
}

pub async fn link_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(req): Json<LinkAttachmentRequest>,
) -> Result<impl IntoResponse> {
    let dto = state
        .attachments
        .link(&principal, &id.to_string(), &req.entry_id.to_string())
        .await?;
    Ok(Json(dto))
}

pub async fn refresh_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let dto = state.attachments.refresh_ttl(&principal, &id.to_string()).await?;
    Ok(Json(dto))
}

pub async fn attachment_download_url(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadUrlQuery>,
) -> Result<impl IntoResponse> {
    let url = state
        .attachments
        .download_url(&principal, &id.to_string(), query.ttl_seconds.unwrap_or(300))
        .await?;
    Ok(Json(serde_json::json!({ "url": url })))
}

/// Signed download: authenticated by the URL signature, not by API keys.
pub async fn download_attachment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<SignedDownloadQuery>,
) -> Result<Response> {
    let (row, bytes) = state
        .attachments
        .download_signed(&id.to_string(), query.exp, &query.sig)
        .await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, row.content_type)],
        bytes,
    )
        .into_response())
}

pub async fn delete_attachment(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state.attachments.delete(&principal, &id.to_string()).await?;
    Ok(StatusCode::NO_CONTENT)
}
