// crates/engram-server/src/web/mod.rs
// Web server layer: the /v1 REST surface over the conversation core

pub mod admin;
pub mod api;
pub mod auth;
pub mod memories;
pub mod state;

use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::EngramError;
use state::AppState;

impl IntoResponse for EngramError {
    fn into_response(self) -> Response {
        match &self {
            EngramError::Redirect(address) => {
                (StatusCode::TEMPORARY_REDIRECT, [(LOCATION, address.clone())]).into_response()
            }
            EngramError::SearchUnavailable(available) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": self.to_string(),
                    "available": available,
                })),
            )
                .into_response(),
            _ => {
                let status = StatusCode::from_u16(self.http_status())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                if self.is_client_facing() {
                    (status, Json(serde_json::json!({ "error": self.to_string() })))
                        .into_response()
                } else {
                    // Provider internals never reach the client
                    tracing::error!("internal error: {self}");
                    (status, Json(serde_json::json!({ "error": "internal error" })))
                        .into_response()
                }
            }
        }
    }
}

pub async fn health(axum::extract::State(state): axum::extract::State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": &*state.providers,
    }))
}

/// Create the web server router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let v1 = Router::new()
        .route(
            "/conversations",
            get(api::list_conversations).post(api::create_conversation),
        )
        .route(
            "/conversations/{id}",
            get(api::get_conversation).delete(api::delete_conversation),
        )
        .route(
            "/conversations/{id}/entries",
            get(api::list_entries).post(api::append_entry),
        )
        .route(
            "/conversations/{id}/entries/{entry_id}/fork",
            post(api::fork_conversation),
        )
        .route("/conversations/{id}/forks", get(api::list_forks))
        .route(
            "/conversations/{id}/memberships",
            get(api::list_memberships).post(api::share_conversation),
        )
        .route(
            "/conversations/{id}/memberships/{user_id}",
            axum::routing::patch(api::update_membership).delete(api::delete_membership),
        )
        .route("/conversations/{id}/sync-memory", post(api::sync_memory))
        .route(
            "/conversations/{id}/response",
            get(api::replay_response)
                .post(api::stream_response)
                .delete(api::cancel_response),
        )
        .route(
            "/ownership-transfers",
            get(api::list_transfers).post(api::request_transfer),
        )
        .route("/ownership-transfers/{id}", get(api::get_transfer))
        .route("/ownership-transfers/{id}/accept", post(api::accept_transfer))
        .route("/ownership-transfers/{id}/cancel", post(api::cancel_transfer))
        .route("/search", post(api::search))
        .route("/attachments", post(api::create_attachment))
        .route(
            "/attachments/{id}",
            get(api::get_attachment).delete(api::delete_attachment),
        )
        .route("/attachments/{id}/data", put(api::upload_attachment))
        .route("/attachments/{id}/link", post(api::link_attachment))
        .route("/attachments/{id}/refresh", post(api::refresh_attachment))
        .route("/attachments/{id}/url", get(api::attachment_download_url))
        .route(
            "/memories",
            put(memories::put_memory)
                .get(memories::get_memory)
                .delete(memories::delete_memory),
        )
        .route("/memories/search", post(memories::search_memories))
        .route("/memories/namespaces", get(memories::list_namespaces))
        .route("/memories/events", get(memories::list_events));

    let admin_v1 = Router::new()
        .route("/conversations", get(admin::list_conversations))
        .route(
            "/conversations/{id}",
            delete(admin::delete_conversation),
        )
        .route("/conversations/{id}/restore", post(admin::restore_conversation))
        .route("/search", post(admin::search))
        .route("/memories", delete(admin::force_delete_memories))
        .route("/indexing/pending", get(admin::count_pending_indexing));

    let authenticated = Router::new()
        .nest("/v1", v1)
        .nest("/admin/v1", admin_v1)
        .layer(middleware::from_fn_with_state(state.clone(), auth::authenticate));

    // Signed downloads and health authenticate themselves
    Router::new()
        .route("/q/health", get(health))
        .route("/v1/attachments/{id}/data", get(api::download_attachment))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
