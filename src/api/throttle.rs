// =============================================================================
// Per-client request limiter
// =============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::warn;

use crate::app_state::AppState;

/// Reject with 429 once a client address exhausts its window.
pub async fn limit_by_client(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let client = client_key(&request);
    if !state.client_limiter.admit(&client) {
        warn!(client = %client, path = %request.uri().path(), "client rate limit exceeded");
        let body = serde_json::json!({ "detail": "Rate limit exceeded. Try again later." });
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }
    next.run(request).await
}

/// Peer IP when the server was started with connect info; a shared bucket
/// otherwise.
fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn client_key_prefers_peer_ip() {
        let mut request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(client_key(&request), "unknown");

        let addr: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        assert_eq!(client_key(&request), "10.1.2.3");
    }
}
