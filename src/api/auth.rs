// =============================================================================
// Session Authentication — Axum extractor
// =============================================================================
//
// Resolves the caller's broker session from either the `api_session` query
// parameter or an `Authorization: Bearer <token>` header, in that order.
//
//   async fn handler(SessionAuth(session): SessionAuth, ...) { ... }
//
// A missing, unknown or expired token short-circuits with 401 before the
// handler body runs.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use tracing::debug;

use crate::app_state::AppState;
use crate::error::HubError;
use crate::session::Session;
use crate::types::token_prefix;

pub struct SessionAuth(pub Session);

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for SessionAuth {
    type Rejection = HubError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let Some(token) = session_token(parts) else {
            debug!(path = %parts.uri.path(), "request without session token");
            return Err(HubError::Auth);
        };
        state.session(&token).await.map(SessionAuth).map_err(|e| {
            debug!(token = %token_prefix(&token), "unknown or expired session token");
            e
        })
    }
}

/// Session token carried by the request, if any.
pub fn session_token(parts: &Parts) -> Option<String> {
    let from_query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(params)| params.get("api_session").cloned());

    from_query
        .or_else(|| {
            parts
                .headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        })
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

// =============================================================================
// Tests
// =============================================================================
