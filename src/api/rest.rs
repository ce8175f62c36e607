// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Public: /health, /market/status, /screener, /login, /logout.
// Session-bound (api_session query or Bearer token): /account/details,
// /market/indices, /market/historical, /screener/refresh.
//
// Failures are returned as `{"status":"error","detail":...}` via HubError.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::api::auth::SessionAuth;
use crate::app_state::{AppState, LimiterStatus};
use crate::broker::{SeriesRequest, SeriesRow};
use crate::calendar::{parse_date_str, MarketStatus};
use crate::error::{HubError, HubResult};
use crate::market_data::hub::HubStatus;
use crate::screener::{ScreenerPage, ScreenerQuery};
use crate::types::{token_prefix, Credentials};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/health", get(health))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/market/status", get(market_status))
        .route("/screener", get(screener))
        // ── Session-bound ───────────────────────────────────────────
        .route("/account/details", get(account_details))
        .route("/market/indices", get(market_indices))
        .route("/market/historical", get(historical))
        .route("/screener/refresh", post(screener_refresh))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
struct ScreenerHealth {
    snapshot_date: Option<chrono::NaiveDate>,
    rows: usize,
    running: bool,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    active_sessions: usize,
    session_expiry_hours: i64,
    uptime_secs: u64,
    hub: HubStatus,
    limiters: LimiterStatus,
    screener: ScreenerHealth,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.sessions.summary();
    let cache = state.screener.store().load();
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        active_sessions: sessions.active_sessions,
        session_expiry_hours: sessions.session_expiry_hours,
        uptime_secs: state.uptime_secs(),
        hub: state.hub.status(),
        limiters: state.limiter_status(),
        screener: ScreenerHealth {
            snapshot_date: cache.snapshot_date,
            rows: cache.rows.len(),
            running: state.screener.is_running(),
        },
    })
}

// =============================================================================
// Session lifecycle
// =============================================================================

#[derive(Deserialize)]
struct LoginRequest {
    #[serde(default)]
    api_key: String,
    #[serde(default)]
    api_secret: String,
    #[serde(default)]
    session_token: String,
}

async fn login(State(state): State<Arc<AppState>>, Json(body): Json<LoginRequest>) -> HubResult<Json<Value>> {
    let credentials = Credentials {
        api_key: body.api_key,
        api_secret: body.api_secret,
        session_token: body.session_token,
    }
    .normalized()
    .ok_or_else(|| HubError::InvalidRequest("api_key, api_secret and session_token are required".into()))?;

    info!(api_key = %token_prefix(&credentials.api_key), "login attempt");
    let session = state.sessions.create(credentials).await.map_err(|e| {
        warn!(error = %e, "login failed");
        e
    })?;

    Ok(Json(json!({
        "status": "session initialized",
        "expires_at": session.expires_at.to_rfc3339(),
    })))
}

#[derive(Deserialize)]
struct LogoutRequest {
    #[serde(default)]
    api_session: String,
}

async fn logout(State(state): State<Arc<AppState>>, Json(body): Json<LogoutRequest>) -> impl IntoResponse {
    let token = body.api_session.trim();
    if state.end_session(token).await {
        info!(token = %token_prefix(token), "logged out");
    }
    Json(json!({ "status": "logged out successfully" }))
}

async fn account_details(
    SessionAuth(session): SessionAuth,
    State(state): State<Arc<AppState>>,
) -> HubResult<Json<Value>> {
    if let Some(profile) = session.profile {
        return Ok(Json(json!({ "status": "success", "customer": profile })));
    }
    let handle = session.upstream.clone();
    let details = state.gate.call(move || handle.customer_details()).await?;
    state.sessions.set_profile(&session.token, details.clone());
    Ok(Json(json!({ "status": "success", "customer": details })))
}

// =============================================================================
// Market
// =============================================================================

async fn market_status(State(state): State<Arc<AppState>>) -> HubResult<Json<MarketStatus>> {
    Ok(Json(state.calendar.market_status(state.calendar.local_now())?))
}

async fn market_indices(
    SessionAuth(session): SessionAuth,
    State(state): State<Arc<AppState>>,
) -> HubResult<Json<Value>> {
    let rows = state.indices.snapshot(session.upstream, Utc::now()).await?;
    Ok(Json(json!({ "status": "success", "data": rows })))
}

#[derive(Deserialize)]
struct HistoricalQuery {
    symbol: String,
    exchange: String,
    from_date: String,
    to_date: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HistoricalResponse {
    error: Option<String>,
    status: u16,
    #[serde(rename = "CloseAt1530")]
    close_at_1530: Option<f64>,
    candles: Vec<SeriesRow>,
}

async fn historical(
    SessionAuth(session): SessionAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoricalQuery>,
) -> HubResult<Json<HistoricalResponse>> {
    let id = state
        .hub
        .symbols()
        .resolve(&q.symbol, Some(&q.exchange))
        .ok_or_else(|| HubError::InvalidRequest(format!("unknown symbol {}", q.symbol)))?;

    let request = SeriesRequest {
        interval: "30minute".to_string(),
        from: series_bound(&q.from_date, false),
        to: series_bound(&q.to_date, true),
        code: id.code,
        exchange: id.exchange,
    };
    let handle = session.upstream.clone();
    let candles = state.gate.call(move || handle.get_series(&request)).await?;

    Ok(Json(HistoricalResponse {
        error: None,
        status: 200,
        close_at_1530: close_at_cutoff(&candles),
        candles,
    }))
}

/// A bare date becomes the broker's start/end-of-day timestamp; anything
/// else is passed through untouched.
fn series_bound(raw: &str, end: bool) -> String {
    let raw = raw.trim();
    match (raw.len() == 10, parse_date_str(raw)) {
        (true, Some(day)) if end => format!("{day}T23:59:59.000Z"),
        (true, Some(day)) => format!("{day}T00:00:01.000Z"),
        _ => raw.to_string(),
    }
}

/// Close of the 15:30 candle, else of the first candle after 15:xx, else of
/// the last candle.
fn close_at_cutoff(rows: &[SeriesRow]) -> Option<f64> {
    rows.iter()
        .find_map(|row| {
            let t = row.timestamp()?.time();
            ((t.hour() == 15 && t.minute() == 30) || t.hour() > 15).then_some(row.close)
        })
        .or_else(|| rows.last().map(|row| row.close))
}

// =============================================================================
// Screener
// =============================================================================

async fn screener(State(state): State<Arc<AppState>>, Query(q): Query<ScreenerQuery>) -> HubResult<Json<ScreenerPage>> {
    q.validate()?;
    Ok(Json(state.screener.store().load().query(&q)))
}

async fn screener_refresh(
    SessionAuth(session): SessionAuth,
    State(state): State<Arc<AppState>>,
) -> HubResult<impl IntoResponse> {
    if state.screener.is_running() {
        return Err(HubError::InvalidRequest("screener run already in progress".into()));
    }
    let engine = state.screener.clone();
    tokio::spawn(async move {
        match engine.run(session.upstream, Utc::now()).await {
            Ok(summary) => info!(rows = summary.rows, failures = summary.failures, "manual screener refresh done"),
            Err(e) => warn!(error = %e, "manual screener refresh failed"),
        }
    });
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "refresh started", "universe": state.screener.universe_size() })),
    ))
}

// =============================================================================
// Tests
// =============================================================================
