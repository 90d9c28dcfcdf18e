// crates/engram-server/src/web/memories.rs
// REST handlers for the episodic memory surface
//
// Namespaces travel in query strings as '/'-joined, percent-encoded
// segments (a segment containing '/' arrives as %2F); request bodies
// carry them as plain JSON arrays.

use axum::Extension;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use engram_types::{MemoryEventKind, MemoryPutRequest, MemorySearchRequest};

use super::state::AppState;
use crate::authz::Principal;
use crate::error::{EngramError, Result};

/// Split a '/'-joined query namespace into decoded segments.
fn parse_namespace(raw: &str) -> Result<Vec<String>> {
    if raw.is_empty() {
        return Err(EngramError::BadRequest("namespace must not be empty".to_string()));
    }
    raw.split('/')
        .map(|segment| {
            urlencoding::decode(segment)
                .map(|s| s.into_owned())
                .map_err(|_| EngramError::BadRequest(format!("bad namespace segment {segment:?}")))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
pub struct MemoryKeyQuery {
    pub namespace: String,
    pub key: String,
}

pub async fn put_memory(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<MemoryPutRequest>,
) -> Result<impl IntoResponse> {
    let dto = state.episodic.put(&principal, req).await?;
    Ok(Json(dto))
}

pub async fn get_memory(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<MemoryKeyQuery>,
) -> Result<impl IntoResponse> {
    let namespace = parse_namespace(&query.namespace)?;
    let dto = state.episodic.get(&principal, &namespace, &query.key).await?;
    Ok(Json(dto))
}

pub async fn delete_memory(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<MemoryKeyQuery>,
) -> Result<impl IntoResponse> {
    let namespace = parse_namespace(&query.namespace)?;
    state.episodic.delete(&principal, &namespace, &query.key).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn search_memories(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Json(req): Json<MemorySearchRequest>,
) -> Result<impl IntoResponse> {
    let items = state.episodic.search(&principal, req).await?;
    Ok(Json(serde_json::json!({ "items": items })))
}

#[derive(Debug, Deserialize)]
pub struct NamespacesQuery {
    pub prefix: Option<String>,
}

pub async fn list_namespaces(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<NamespacesQuery>,
) -> Result<impl IntoResponse> {
    let prefix = query.prefix.as_deref().map(parse_namespace).transpose()?;
    let namespaces = state.episodic.list_namespaces(&principal, prefix).await?;
    Ok(Json(serde_json::json!({ "namespaces": namespaces })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub prefix: Option<String>,
    /// CSV of event kinds (add, update, delete, expired).
    pub kinds: Option<String>,
    pub before: Option<String>,
    pub after: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse> {
    let prefix = query.prefix.as_deref().map(parse_namespace).transpose()?;
    let kinds = query
        .kinds
        .as_deref()
        .map(|csv| {
            csv.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    MemoryEventKind::parse(s).ok_or_else(|| {
                        EngramError::BadRequest(format!("unknown event kind {s:?}"))
                    })
                })
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?;

    let page = state
        .episodic
        .list_events(
            &principal,
            prefix,
            kinds,
            query.before,
            query.after,
            query.cursor,
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_namespace_decodes_segments() {
        let parsed = parse_namespace("user/alice%20smith/notes%2F2026").unwrap();
        assert_eq!(parsed, vec!["user", "alice smith", "notes/2026"]);
        assert!(parse_namespace("").is_err());
    }
}
