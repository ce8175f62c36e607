// =============================================================================
// Quote Hub — single upstream stream, live quotes, subscriber fan-out
// =============================================================================
//
// Ticks arrive on a broker-owned thread through the installed callback, which
// only does a non-blocking `try_send` into a bounded channel. One consumer
// task drains that channel, so per-symbol quote and candle updates are
// applied strictly in arrival order.
//
// Fan-out never blocks the consumer: a subscriber whose queue is full simply
// misses that message and a subscriber whose receiver is gone is pruned.
//
// `ensure_connected` is the only path that replaces the upstream stream, and
// it holds the async slot lock for the whole swap so concurrent callers
// cannot double-connect.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::aggregator::{Candle, CandleKey, Ingest, TickAggregator};
use super::symbols::SymbolTable;
use super::tick::{decode_tick, Tick};
use crate::broker::{TickCallback, UpstreamGate, UpstreamHandle};
use crate::error::{HubError, HubResult};
use crate::session::Session;
use crate::types::{price_change, token_prefix, UpstreamId};

/// Same underlying connection; compares data pointers only.
fn same_handle(a: &Arc<dyn UpstreamHandle>, b: &Arc<dyn UpstreamHandle>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Latest price state for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveQuote {
    pub symbol: String,
    pub display_name: String,
    pub last_price: f64,
    pub previous_close: Option<f64>,
    pub change: Option<f64>,
    pub percent_change: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl LiveQuote {
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.updated_at <= threshold
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuoteSnapshot {
    pub quotes: Vec<LiveQuote>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickEvent {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub time: chrono::NaiveDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct CandleUpdate {
    pub key: CandleKey,
    pub candle: Candle,
    pub closed: bool,
}

#[derive(Debug, Clone)]
pub enum HubMessage {
    Snapshot(QuoteSnapshot),
    Tick(TickEvent),
    Candle(CandleUpdate),
}

/// What a subscriber wants to hear about.
///
/// Snapshot subscribers (`feed == None`) get a full filtered snapshot on
/// every matching update. Feed subscribers get raw tick events plus candle
/// updates for their interval.
#[derive(Debug, Clone, Default)]
pub struct SubscriberFilter {
    pub symbols: HashSet<String>,
    pub feed: Option<String>,
}

impl SubscriberFilter {
    pub fn snapshots<I: IntoIterator<Item = String>>(symbols: I) -> Self {
        Self {
            symbols: symbols.into_iter().map(|s| s.to_ascii_uppercase()).collect(),
            feed: None,
        }
    }

    pub fn feed(symbol: &str, interval: &str) -> Self {
        Self {
            symbols: HashSet::from([symbol.to_ascii_uppercase()]),
            feed: Some(interval.to_string()),
        }
    }

    pub fn matches(&self, symbol: &str) -> bool {
        self.symbols.is_empty() || self.symbols.contains(symbol)
    }
}

struct Subscriber {
    filter: SubscriberFilter,
    tx: mpsc::Sender<HubMessage>,
}

/// Receiving side handed to a streaming client.
pub struct Subscription {
    pub id: Uuid,
    pub filter: SubscriberFilter,
    rx: mpsc::Receiver<HubMessage>,
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub subscriber_queue: usize,
    pub tick_buffer: usize,
    pub staleness: chrono::Duration,
    pub max_closed_candles: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            subscriber_queue: 64,
            tick_buffer: 4_096,
            staleness: chrono::Duration::seconds(120),
            max_closed_candles: 500,
        }
    }
}

#[derive(Default)]
struct HubCounters {
    connected: AtomicBool,
    ticks_received: AtomicU64,
    ticks_dropped: AtomicU64,
    malformed: AtomicU64,
    unrouted: AtomicU64,
    fanout_dropped: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStatus {
    pub connected: bool,
    pub subscribers: usize,
    pub live_quotes: usize,
    pub candle_series: usize,
    pub ticks_received: u64,
    pub ticks_dropped: u64,
    pub malformed_ticks: u64,
    pub unrouted_ticks: u64,
    pub fanout_dropped: u64,
}

struct ActiveUpstream {
    token: String,
    handle: Arc<dyn UpstreamHandle>,
    subscribed: HashSet<UpstreamId>,
}

pub struct QuoteHub {
    symbols: Arc<SymbolTable>,
    gate: Arc<UpstreamGate>,
    settings: HubSettings,
    aggregator: TickAggregator,
    quotes: RwLock<HashMap<String, LiveQuote>>,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    candle_keys: Mutex<HashMap<CandleKey, usize>>,
    wanted: Mutex<HashSet<UpstreamId>>,
    upstream: tokio::sync::Mutex<Option<ActiveUpstream>>,
    tick_tx: mpsc::Sender<Value>,
    tick_rx: Mutex<Option<mpsc::Receiver<Value>>>,
    counters: Arc<HubCounters>,
}

impl QuoteHub {
    pub fn new(symbols: Arc<SymbolTable>, gate: Arc<UpstreamGate>, settings: HubSettings) -> Self {
        let (tick_tx, tick_rx) = mpsc::channel(settings.tick_buffer.max(1));
        Self {
            symbols,
            gate,
            aggregator: TickAggregator::new(settings.max_closed_candles),
            settings,
            quotes: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            candle_keys: Mutex::new(HashMap::new()),
            wanted: Mutex::new(HashSet::new()),
            upstream: tokio::sync::Mutex::new(None),
            tick_tx,
            tick_rx: Mutex::new(Some(tick_rx)),
            counters: Arc::new(HubCounters::default()),
        }
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn aggregator(&self) -> &TickAggregator {
        &self.aggregator
    }

    // -- upstream lifecycle -------------------------------------------------

    /// Make `session`'s broker handle the active stream. A no-op when it
    /// already is; otherwise the previous stream is torn down (errors are
    /// logged and ignored) and every symbol subscribed so far is re-issued on
    /// the new one.
    pub async fn ensure_connected(&self, session: &Session) -> HubResult<()> {
        let mut slot = self.upstream.lock().await;
        if slot
            .as_ref()
            .is_some_and(|a| a.token == session.token && same_handle(&a.handle, &session.upstream))
        {
            return Ok(());
        }

        if let Some(prev) = slot.take() {
            self.counters.connected.store(false, Ordering::SeqCst);
            let handle = prev.handle;
            if let Err(e) = self.gate.offload(move || handle.stream_disconnect()).await {
                warn!(token = %token_prefix(&prev.token), error = %e, "previous stream disconnect failed");
            }
        }

        let handle = session.upstream.clone();
        handle.set_tick_callback(self.tick_callback());
        let connecting = handle.clone();
        self.gate.offload(move || connecting.stream_connect()).await?;

        let mut active = ActiveUpstream {
            token: session.token.clone(),
            handle,
            subscribed: HashSet::new(),
        };
        let wanted: Vec<UpstreamId> = self.wanted.lock().iter().cloned().collect();
        for id in wanted {
            self.subscribe_one(&mut active, id).await;
        }

        *slot = Some(active);
        self.counters.connected.store(true, Ordering::SeqCst);
        info!(token = %token_prefix(&session.token), "upstream stream connected");
        Ok(())
    }

    /// Disconnect the active stream if it belongs to `token`.
    pub async fn release(&self, token: &str) {
        let mut slot = self.upstream.lock().await;
        if slot.as_ref().map_or(true, |a| a.token != token) {
            return;
        }
        if let Some(prev) = slot.take() {
            self.counters.connected.store(false, Ordering::SeqCst);
            let handle = prev.handle;
            if let Err(e) = self.gate.offload(move || handle.stream_disconnect()).await {
                warn!(error = %e, "stream disconnect on release failed");
            }
            info!(token = %token_prefix(token), "upstream stream released");
        }
    }

    /// Subscribe the active stream to `symbols`. Returns the symbols that
    /// are now live; unresolvable ones are skipped with a warning.
    ///
    /// Each returned symbol holds a registration in the symbol table until
    /// it is handed back through [`release_symbols`](Self::release_symbols).
    pub async fn subscribe(&self, symbols: &[String], exchange_hint: Option<&str>) -> HubResult<Vec<String>> {
        let mut slot = self.upstream.lock().await;
        let active = slot
            .as_mut()
            .ok_or_else(|| HubError::UpstreamUnavailable("no upstream stream connected".into()))?;

        let mut live = Vec::new();
        for symbol in symbols {
            let symbol = symbol.trim().to_ascii_uppercase();
            let Some(id) = self.symbols.register(&symbol, exchange_hint) else {
                warn!(symbol = %symbol, "cannot resolve symbol to an upstream code; skipping");
                continue;
            };
            self.wanted.lock().insert(id.clone());
            if self.subscribe_one(active, id).await {
                live.push(symbol);
            } else {
                self.release_symbols(std::slice::from_ref(&symbol));
            }
        }
        Ok(live)
    }

    /// Hand back registrations taken by [`subscribe`](Self::subscribe).
    /// Symbols nobody holds any more stop being routed and are not
    /// re-issued on the next reconnect.
    pub fn release_symbols(&self, symbols: &[String]) {
        for symbol in symbols {
            if let Some(id) = self.symbols.unregister(symbol) {
                self.wanted.lock().remove(&id);
                debug!(symbol = %symbol, upstream = %id, "symbol released");
            }
        }
    }

    async fn subscribe_one(&self, active: &mut ActiveUpstream, id: UpstreamId) -> bool {
        if active.subscribed.contains(&id) {
            return true;
        }
        let handle = active.handle.clone();
        let (exchange, code) = (id.exchange.clone(), id.code.clone());
        match self.gate.offload(move || handle.subscribe(&exchange, &code)).await {
            Ok(()) => {
                debug!(upstream = %id, "subscribed");
                active.subscribed.insert(id);
                true
            }
            Err(e) => {
                warn!(upstream = %id, error = %e, "upstream subscription failed");
                false
            }
        }
    }

    fn tick_callback(&self) -> TickCallback {
        let tx = self.tick_tx.clone();
        let counters = self.counters.clone();
        Arc::new(move |tick| {
            counters.ticks_received.fetch_add(1, Ordering::Relaxed);
            if tx.try_send(tick).is_err() {
                counters.ticks_dropped.fetch_add(1, Ordering::Relaxed);
            }
        })
    }

    // -- tick processing ----------------------------------------------------

    /// Start the task that drains the tick channel. Only the first call
    /// spawns anything.
    pub fn spawn_consumer(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.tick_rx.lock().take()?;
        let hub = self.clone();
        Some(tokio::spawn(async move {
            info!("tick consumer started");
            while let Some(raw) = rx.recv().await {
                hub.process_tick(&raw, Utc::now());
            }
            warn!("tick channel closed; consumer exiting");
        }))
    }

    pub fn process_tick(&self, raw: &Value, now: DateTime<Utc>) {
        let tick = match decode_tick(raw) {
            Ok(t) => t,
            Err(e) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "dropping malformed tick");
                return;
            }
        };
        let Some((symbol, strategy)) = self.symbols.match_tick(&tick) else {
            self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(name = ?tick.name, code = ?tick.code, "tick matched no instrument");
            return;
        };
        debug!(symbol = %symbol, ?strategy, price = tick.close, "tick routed");

        self.update_quote(&symbol, &tick, now);

        let keys: Vec<CandleKey> = self
            .candle_keys
            .lock()
            .keys()
            .filter(|k| k.symbol == symbol)
            .cloned()
            .collect();
        let mut updates = Vec::new();
        for key in keys {
            match self.aggregator.ingest(&key, &tick) {
                Ingest::Opened(candle) | Ingest::Updated(candle) => updates.push(CandleUpdate {
                    key,
                    candle,
                    closed: false,
                }),
                Ingest::Rolled { closed, opened } => {
                    updates.push(CandleUpdate {
                        key: key.clone(),
                        candle: closed,
                        closed: true,
                    });
                    updates.push(CandleUpdate {
                        key,
                        candle: opened,
                        closed: false,
                    });
                }
                Ingest::Late { .. } => {}
            }
        }

        let event = TickEvent {
            symbol: symbol.clone(),
            price: tick.close,
            volume: tick.volume,
            time: tick.time,
        };
        self.publish(&symbol, event, &updates);
    }

    fn update_quote(&self, symbol: &str, tick: &Tick, now: DateTime<Utc>) {
        let display_name = self.symbols.display_name(symbol);
        let mut quotes = self.quotes.write();
        let previous_close = tick
            .previous_close
            .or_else(|| quotes.get(symbol).and_then(|q| q.previous_close));
        let (change, percent_change) = price_change(previous_close, Some(tick.close));
        quotes.insert(
            symbol.to_string(),
            LiveQuote {
                symbol: symbol.to_string(),
                display_name,
                last_price: tick.close,
                previous_close,
                change,
                percent_change,
                updated_at: now,
            },
        );
    }

    fn publish(&self, symbol: &str, event: TickEvent, updates: &[CandleUpdate]) {
        let mut subs = self.subscribers.lock();
        let mut gone = Vec::new();

        for (id, sub) in subs.iter() {
            if !sub.filter.matches(symbol) {
                continue;
            }
            let messages = match &sub.filter.feed {
                None => vec![HubMessage::Snapshot(self.build_snapshot(&sub.filter))],
                Some(interval) => std::iter::once(HubMessage::Tick(event.clone()))
                    .chain(
                        updates
                            .iter()
                            .filter(|u| &u.key.interval == interval)
                            .cloned()
                            .map(HubMessage::Candle),
                    )
                    .collect(),
            };
            for msg in messages {
                match sub.tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.counters.fanout_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        gone.push(*id);
                        break;
                    }
                }
            }
        }

        for id in gone {
            subs.remove(&id);
            debug!(subscriber = %id, "pruned closed subscriber");
        }
    }

    // -- subscribers --------------------------------------------------------

    /// Register a subscriber. Its queue already holds a current snapshot.
    pub fn add_subscriber(&self, filter: SubscriberFilter) -> Subscription {
        let (tx, rx) = mpsc::channel(self.settings.subscriber_queue.max(1));
        let _ = tx.try_send(HubMessage::Snapshot(self.build_snapshot(&filter)));
        let id = Uuid::new_v4();
        self.subscribers.lock().insert(
            id,
            Subscriber {
                filter: filter.clone(),
                tx,
            },
        );
        debug!(subscriber = %id, symbols = filter.symbols.len(), "subscriber added");
        Subscription { id, filter, rx }
    }

    pub fn remove_subscriber(&self, id: Uuid) -> bool {
        let removed = self.subscribers.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber removed");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Next message for `sub`, or a fresh snapshot when nothing arrived
    /// within `fallback`. `None` once the hub has dropped the subscriber.
    pub async fn next_message(&self, sub: &mut Subscription, fallback: Duration) -> Option<HubMessage> {
        match tokio::time::timeout(fallback, sub.rx.recv()).await {
            Ok(msg) => msg,
            Err(_) => Some(HubMessage::Snapshot(self.build_snapshot(&sub.filter))),
        }
    }

    /// Current quotes matching `filter`, sorted by symbol.
    pub fn build_snapshot(&self, filter: &SubscriberFilter) -> QuoteSnapshot {
        let mut quotes: Vec<LiveQuote> = self
            .quotes
            .read()
            .values()
            .filter(|q| filter.matches(&q.symbol))
            .cloned()
            .collect();
        quotes.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        QuoteSnapshot { quotes, ts: Utc::now() }
    }

    /// Live quote for `symbol` if it is within the staleness threshold.
    pub fn fresh_quote(&self, symbol: &str, now: DateTime<Utc>) -> Option<LiveQuote> {
        self.quotes
            .read()
            .get(symbol)
            .filter(|q| q.is_fresh(now, self.settings.staleness))
            .cloned()
    }

    // -- candle series ------------------------------------------------------

    /// Start aggregating `symbol` at `interval`. Reference counted per key.
    pub fn track_candles(&self, symbol: &str, interval: &str) -> CandleKey {
        let key = CandleKey::new(symbol.to_ascii_uppercase(), interval);
        *self.candle_keys.lock().entry(key.clone()).or_insert(0) += 1;
        key
    }

    pub fn untrack_candles(&self, key: &CandleKey) {
        let mut keys = self.candle_keys.lock();
        let last = match keys.get_mut(key) {
            Some(n) if *n > 1 => {
                *n -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if last {
            keys.remove(key);
            self.aggregator.remove(key);
        }
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            connected: self.counters.connected.load(Ordering::SeqCst),
            subscribers: self.subscriber_count(),
            live_quotes: self.quotes.read().len(),
            candle_series: self.candle_keys.lock().len(),
            ticks_received: self.counters.ticks_received.load(Ordering::Relaxed),
            ticks_dropped: self.counters.ticks_dropped.load(Ordering::Relaxed),
            malformed_ticks: self.counters.malformed.load(Ordering::Relaxed),
            unrouted_ticks: self.counters.unrouted.load(Ordering::Relaxed),
            fanout_dropped: self.counters.fanout_dropped.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
