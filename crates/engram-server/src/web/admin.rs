// crates/engram-server/src/web/admin.rs
// Role-gated admin surface

use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use uuid::Uuid;

use super::state::AppState;
use crate::authz::Principal;
use crate::error::Result;

#[derive(Debug, Deserialize)]
pub struct AdminListQuery {
    pub filter: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<AdminListQuery>,
) -> Result<impl IntoResponse> {
    let conversations = state
        .conversations
        .admin_list_conversations(
            &principal,
            query.filter,
            query.include_deleted,
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(serde_json::json!({ "conversations": conversations })))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .conversations
        .admin_delete(&principal, &id.to_string())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn restore_conversation(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .conversations
        .admin_restore(&principal, &id.to_string())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AdminSearchRequest {
    pub query: String,
    pub limit: Option<usize>,
}

pub async fn search(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<AdminSearchRequest>,
) -> Result<impl IntoResponse> {
    let hits = state
        .conversations
        .admin_search(&principal, req.query, req.limit.unwrap_or(50))
        .await?;
    Ok(Json(serde_json::json!({ "hits": hits })))
}

#[derive(Debug, Deserialize)]
pub struct ForceDeleteMemoryRequest {
    pub namespace_prefix: Vec<String>,
}

pub async fn force_delete_memories(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<ForceDeleteMemoryRequest>,
) -> Result<impl IntoResponse> {
    let removed = state
        .episodic
        .admin_force_delete(&principal, &req.namespace_prefix)
        .await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}

pub async fn count_pending_indexing(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Result<impl IntoResponse> {
    let pending = state
        .conversations
        .admin_count_pending_indexing(&principal)
        .await?;
    Ok(Json(serde_json::json!({ "pending": pending })))
}
