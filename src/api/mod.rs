// =============================================================================
// HTTP surface — Axum 0.7
// =============================================================================
//
// REST endpoints, server-sent event streams and the raw market-data socket
// share one router. Every request passes the per-client limiter first; CORS
// origins come from the runtime config.
// =============================================================================

pub mod auth;
pub mod rest;
pub mod stream;
pub mod throttle;
pub mod ws;

use std::sync::Arc;

use axum::{http::HeaderValue, middleware, routing::get, Router};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::app_state::AppState;

/// Build the full router with limiter, CORS and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .merge(rest::routes())
        .merge(stream::routes())
        .route("/ws/marketdata", get(ws::ws_handler))
        .layer(middleware::from_fn_with_state(state.clone(), throttle::limit_by_client))
        .layer(cors)
        .with_state(state)
}

/// `*` allows any origin; otherwise only the listed, well-formed origins.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o.trim() == "*") {
        return base.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o.trim()) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring malformed CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(parsed))
}
