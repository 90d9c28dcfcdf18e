// crates/engram-server/src/web/auth.rs
// Per-client API key authentication and principal resolution
//
// Clients authenticate with (x-client-id, x-api-key) pairs checked
// against ENGRAM_API_KEYS_{CLIENT_ID}; the acting user arrives in
// x-user-id (clients are trusted to assert their users, mirroring the
// token-claim mapping an OIDC deployment would do upstream). The admin
// role comes from the static allow-lists.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use super::state::AppState;
use crate::authz::Principal;
use crate::error::EngramError;

pub const HEADER_CLIENT_ID: &str = "x-client-id";
pub const HEADER_API_KEY: &str = "x-api-key";
pub const HEADER_USER_ID: &str = "x-user-id";

/// Resolve the caller into a Principal, or fail Unauthenticated.
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, EngramError> {
    let headers = request.headers();
    let client_id = header(headers, HEADER_CLIENT_ID);
    let api_key = header(headers, HEADER_API_KEY).or_else(|| {
        headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string)
    });

    let config = &state.config;
    if !config.api_keys.is_empty() {
        let client = client_id.clone().ok_or_else(|| {
            EngramError::Unauthenticated(format!("missing {HEADER_CLIENT_ID} header"))
        })?;
        let key = api_key.ok_or_else(|| {
            EngramError::Unauthenticated(format!("missing {HEADER_API_KEY} header"))
        })?;
        let accepted = config
            .api_keys
            .get(&client.to_lowercase())
            .map(|keys| keys.iter().any(|candidate| candidate == &key))
            .unwrap_or(false);
        if !accepted {
            return Err(EngramError::Unauthenticated(format!(
                "unknown client or bad API key for {client:?}"
            )));
        }
    }

    let user_id = header(headers, HEADER_USER_ID).ok_or_else(|| {
        EngramError::Unauthenticated(format!("missing {HEADER_USER_ID} header"))
    })?;

    let admin = config.admin_users.iter().any(|u| u == &user_id)
        || client_id
            .as_ref()
            .map(|c| config.admin_clients.iter().any(|allowed| allowed == c))
            .unwrap_or(false);

    request
        .extensions_mut()
        .insert(Principal { user_id, client_id, admin });
    Ok(next.run(request).await)
}

fn header(headers: &axum::http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
