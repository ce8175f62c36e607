// =============================================================================
// Server-Sent Event streams
// =============================================================================
//
//   GET /stream/indices?api_session=&symbols=   {status, data[], ts}
//   GET /stream/screener?<screener query>       {status, items[], total, ts}
//
// Index events fire on every matching quote update and at least once a
// second. Until a live quote arrives for a symbol its row comes from the
// polled board taken when the stream opened.
// =============================================================================

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use chrono::Utc;
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::auth::SessionAuth;
use crate::app_state::AppState;
use crate::error::HubResult;
use crate::indices::{IndexRow, INDEX_SYMBOLS};
use crate::market_data::hub::QuoteSnapshot;
use crate::market_data::{CandleKey, HubMessage, QuoteHub, SubscriberFilter, Subscription};
use crate::screener::ScreenerQuery;

/// Longest gap between two index events.
const SNAPSHOT_FALLBACK: Duration = Duration::from_secs(1);
const SCREENER_CADENCE: Duration = Duration::from_secs(1);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/stream/indices", get(indices_stream))
        .route("/stream/screener", get(screener_stream))
}

// =============================================================================
// Hub lease
// =============================================================================

/// A hub subscription that unregisters itself, and releases the candle
/// series and symbol registrations it holds, when dropped. Streaming
/// handlers hold one for the life of the connection, so cleanup runs on
/// every exit path.
pub struct HubLease {
    hub: Arc<QuoteHub>,
    sub: Subscription,
    candles: Option<CandleKey>,
    symbols: Vec<String>,
}

impl HubLease {
    pub fn snapshots(hub: Arc<QuoteHub>, symbols: Vec<String>) -> Self {
        let sub = hub.add_subscriber(SubscriberFilter::snapshots(symbols));
        Self {
            hub,
            sub,
            candles: None,
            symbols: Vec::new(),
        }
    }

    /// Raw tick and candle feed for one symbol at `interval`.
    pub fn feed(hub: Arc<QuoteHub>, symbol: &str, interval: &str) -> Self {
        let key = hub.track_candles(symbol, interval);
        let sub = hub.add_subscriber(SubscriberFilter::feed(symbol, interval));
        Self {
            hub,
            sub,
            candles: Some(key),
            symbols: Vec::new(),
        }
    }

    /// Subscribe upstream on behalf of this lease. The live symbols stay
    /// registered until the lease is dropped.
    pub async fn subscribe(&mut self, symbols: &[String], exchange_hint: Option<&str>) -> HubResult<Vec<String>> {
        let live = self.hub.subscribe(symbols, exchange_hint).await?;
        self.symbols.extend(live.iter().cloned());
        Ok(live)
    }

    pub async fn next(&mut self, fallback: Duration) -> Option<HubMessage> {
        self.hub.next_message(&mut self.sub, fallback).await
    }
}

impl Drop for HubLease {
    fn drop(&mut self) {
        self.hub.remove_subscriber(self.sub.id);
        if let Some(key) = self.candles.take() {
            self.hub.untrack_candles(&key);
        }
        self.hub.release_symbols(&self.symbols);
        debug!(subscriber = %self.sub.id, "hub lease released");
    }
}

// =============================================================================
// Indices
// =============================================================================

#[derive(Deserialize)]
struct IndexStreamQuery {
    #[serde(default)]
    symbols: Option<String>,
}

struct IndexStream {
    state: Arc<AppState>,
    lease: HubLease,
    wanted: HashSet<String>,
    baseline: Vec<IndexRow>,
}

impl IndexStream {
    fn payload(&self, snapshot: &QuoteSnapshot) -> Value {
        match self.state.indices.live_rows(&snapshot.quotes, Utc::now()) {
            Ok(live) => json!({
                "status": "success",
                "data": merge_rows(&self.baseline, live, &self.wanted),
                "ts": snapshot.ts.to_rfc3339(),
            }),
            Err(e) => json!({
                "status": "error",
                "detail": e.to_string(),
                "ts": snapshot.ts.to_rfc3339(),
            }),
        }
    }
}

async fn indices_stream(
    SessionAuth(session): SessionAuth,
    State(state): State<Arc<AppState>>,
    Query(q): Query<IndexStreamQuery>,
) -> HubResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    state.hub.ensure_connected(&session).await?;
    let symbols = requested_symbols(q.symbols.as_deref());
    let mut lease = HubLease::snapshots(state.hub.clone(), symbols.clone());

    match lease.subscribe(&symbols, None).await {
        Ok(live) => debug!(?live, "index stream subscribed"),
        Err(e) => warn!(error = %e, "index stream subscription failed; serving polled rows"),
    }
    let baseline = state
        .indices
        .snapshot(session.upstream.clone(), Utc::now())
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "index board unavailable for stream baseline");
            Vec::new()
        });

    let init = IndexStream {
        state,
        lease,
        wanted: symbols.into_iter().collect(),
        baseline,
    };
    let events = stream::unfold(init, |mut s| async move {
        loop {
            if let HubMessage::Snapshot(snapshot) = s.lease.next(SNAPSHOT_FALLBACK).await? {
                let event = json_event(&s.payload(&snapshot));
                return Some((Ok(event), s));
            }
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Comma-separated client symbols, or every tracked index.
fn requested_symbols(raw: Option<&str>) -> Vec<String> {
    let parsed: Vec<String> = raw
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if parsed.is_empty() {
        INDEX_SYMBOLS.iter().map(|s| s.to_string()).collect()
    } else {
        parsed
    }
}

/// Live rows win; polled baseline rows fill in for wanted symbols without
/// a live quote.
fn merge_rows(baseline: &[IndexRow], live: Vec<IndexRow>, wanted: &HashSet<String>) -> Vec<IndexRow> {
    let mut rows: Vec<IndexRow> = baseline
        .iter()
        .filter(|b| b.symbol.as_ref().is_some_and(|s| wanted.contains(s)))
        .filter(|b| !live.iter().any(|l| l.symbol == b.symbol))
        .cloned()
        .collect();
    rows.extend(live);
    rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    rows
}

// =============================================================================
// Screener
// =============================================================================

async fn screener_stream(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ScreenerQuery>,
) -> HubResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    q.validate()?;
    let ticker = tokio::time::interval(SCREENER_CADENCE);
    let events = stream::unfold((state, q, ticker), |(state, q, mut ticker)| async move {
        ticker.tick().await;
        let cache = state.screener.store().load();
        let page = cache.query(&q);
        let payload = json!({
            "status": "success",
            "items": page.items,
            "total": page.total,
            "snapshot_date": cache.snapshot_date,
            "ts": Utc::now().to_rfc3339(),
        });
        Some((Ok(json_event(&payload)), (state, q, ticker)))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn json_event(payload: &Value) -> Event {
    Event::default().json_data(payload).unwrap_or_else(|e| {
        warn!(error = %e, "failed to encode stream event");
        Event::default().comment("encode error")
    })
}

// =============================================================================
// Tests
// =============================================================================
