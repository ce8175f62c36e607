// =============================================================================
// Index Board — previous/current close for the tracked indices
// =============================================================================
//
// Source order per index:
//   1. a live quote no older than the staleness threshold;
//   2. the last 30-minute candle of the snapshot day and of the previous
//      trading day, polled through the upstream gate.
//
// While the market is closed the polled pair cannot change, so it is cached
// per index for the rest of the local calendar day. An index that cannot be
// resolved yields a row of nulls instead of failing the board.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::broker::{SeriesRequest, UpstreamGate, UpstreamHandle};
use crate::calendar::TradingCalendar;
use crate::error::HubResult;
use crate::market_data::{LiveQuote, QuoteHub};
use crate::types::{price_change, UpstreamId};

pub const INDEX_SYMBOLS: [&str; 4] = ["NIFTY", "BANKNIFTY", "SENSEX", "FINNIFTY"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRow {
    pub symbol: Option<String>,
    pub display_name: Option<String>,
    pub previous_close: Option<f64>,
    pub current_close: Option<f64>,
    pub change: Option<f64>,
    pub percent_change: Option<f64>,
    pub is_positive: Option<bool>,
    pub market_closed: Option<bool>,
    pub last_trading_day: Option<String>,
}

impl IndexRow {
    fn build(
        symbol: &str,
        display_name: String,
        previous: Option<f64>,
        current: Option<f64>,
        market_closed: bool,
        last_trading_day: NaiveDate,
    ) -> Self {
        let (change, percent_change) = price_change(previous, current);
        Self {
            symbol: Some(symbol.to_string()),
            display_name: Some(display_name),
            previous_close: previous,
            current_close: current,
            change,
            percent_change,
            is_positive: Some(change.is_some_and(|c| c >= 0.0)),
            market_closed: Some(market_closed),
            last_trading_day: market_closed.then(|| last_trading_day.to_string()),
        }
    }

    /// Row straight from a live quote, for the index stream.
    pub fn from_quote(q: &LiveQuote, market_closed: bool, last_trading_day: NaiveDate) -> Self {
        Self::build(
            &q.symbol,
            q.display_name.clone(),
            q.previous_close,
            Some(q.last_price),
            market_closed,
            last_trading_day,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct ClosedPair {
    cached_on: NaiveDate,
    previous: f64,
    current: f64,
}

/// Calendar facts shared by every index in one board request.
#[derive(Debug, Clone, Copy)]
struct BoardDay {
    today: NaiveDate,
    closed: bool,
    last: NaiveDate,
    snapshot: NaiveDate,
    previous: NaiveDate,
}

pub struct IndexBoard {
    hub: Arc<QuoteHub>,
    gate: Arc<UpstreamGate>,
    calendar: Arc<TradingCalendar>,
    closed_cache: Mutex<HashMap<String, ClosedPair>>,
}

impl IndexBoard {
    pub fn new(hub: Arc<QuoteHub>, gate: Arc<UpstreamGate>, calendar: Arc<TradingCalendar>) -> Self {
        Self {
            hub,
            gate,
            calendar,
            closed_cache: Mutex::new(HashMap::new()),
        }
    }

    fn board_day(&self, now: DateTime<Utc>) -> HubResult<BoardDay> {
        let local = self.calendar.to_local(now);
        let today = local.date();
        let closed = self.calendar.market_closed_at(local);
        let last = self.calendar.last_trading_day(today)?;
        Ok(BoardDay {
            today,
            closed,
            last,
            snapshot: if closed { last } else { today },
            previous: self.calendar.previous_trading_day(last)?,
        })
    }

    /// One row per tracked index, in a fixed order.
    pub async fn snapshot(&self, upstream: Arc<dyn UpstreamHandle>, now: DateTime<Utc>) -> HubResult<Vec<IndexRow>> {
        let day = self.board_day(now)?;
        let rows = join_all(
            INDEX_SYMBOLS
                .iter()
                .map(|symbol| self.index_row(upstream.clone(), symbol, day, now)),
        )
        .await;
        Ok(rows)
    }

    /// Rows built only from live quotes, one per quote.
    pub fn live_rows(&self, quotes: &[LiveQuote], now: DateTime<Utc>) -> HubResult<Vec<IndexRow>> {
        let day = self.board_day(now)?;
        Ok(quotes
            .iter()
            .map(|q| IndexRow::from_quote(q, day.closed, day.last))
            .collect())
    }

    async fn index_row(
        &self,
        upstream: Arc<dyn UpstreamHandle>,
        symbol: &str,
        day: BoardDay,
        now: DateTime<Utc>,
    ) -> IndexRow {
        let Some(inst) = self.hub.symbols().instrument(symbol) else {
            warn!(symbol, "index missing from symbol table");
            return IndexRow::default();
        };
        let id = UpstreamId {
            exchange: inst.exchange.clone(),
            code: inst.code.clone(),
        };

        if let Some(quote) = self.hub.fresh_quote(symbol, now) {
            let previous = match quote.previous_close {
                Some(p) => Some(p),
                None => self.last_close(&upstream, &id, day.previous).await,
            };
            return IndexRow::build(symbol, inst.display_name, previous, Some(quote.last_price), day.closed, day.last);
        }

        if day.closed {
            let cached = self.closed_cache.lock().get(symbol).copied();
            if let Some(pair) = cached.filter(|p| p.cached_on == day.today) {
                debug!(symbol, "index served from closed-market cache");
                return IndexRow::build(
                    symbol,
                    inst.display_name,
                    Some(pair.previous),
                    Some(pair.current),
                    true,
                    day.last,
                );
            }
        }

        let (current, previous) = tokio::join!(
            self.last_close(&upstream, &id, day.snapshot),
            self.last_close(&upstream, &id, day.previous),
        );
        if current.is_none() || previous.is_none() {
            warn!(
                symbol,
                current = current.is_some(),
                previous = previous.is_some(),
                "missing candle data for index"
            );
        }
        if let (true, Some(current), Some(previous)) = (day.closed, current, previous) {
            self.closed_cache.lock().insert(
                symbol.to_string(),
                ClosedPair {
                    cached_on: day.today,
                    previous,
                    current,
                },
            );
        }
        IndexRow::build(symbol, inst.display_name, previous, current, day.closed, day.last)
    }

    /// Close of the last 30-minute candle on `day`.
    async fn last_close(&self, upstream: &Arc<dyn UpstreamHandle>, id: &UpstreamId, day: NaiveDate) -> Option<f64> {
        let handle = upstream.clone();
        let request = SeriesRequest::for_day("30minute", day, &id.code, &id.exchange);
        match self.gate.call(move || handle.get_series(&request)).await {
            Ok(rows) => rows.last().map(|r| r.close),
            Err(e) => {
                warn!(upstream = %id, %day, error = %e, "last-candle fetch failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{row, FakeHandle};
    use crate::market_data::{HubSettings, SymbolTable};
    use chrono::{FixedOffset, NaiveTime};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    fn calendar() -> Arc<TradingCalendar> {
        Arc::new(TradingCalendar::new(
            HashSet::new(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 31, 0).unwrap(),
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
        ))
    }

    fn board() -> (IndexBoard, Arc<QuoteHub>) {
        let gate = Arc::new(UpstreamGate::new(1_000, Duration::from_secs(60), 4));
        let hub = Arc::new(QuoteHub::new(
            Arc::new(SymbolTable::with_indices()),
            gate.clone(),
            HubSettings::default(),
        ));
        (IndexBoard::new(hub.clone(), gate, calendar()), hub)
    }

    fn at(d: u32, h: u32, m: u32) -> DateTime<Utc> {
        calendar().to_utc(
            NaiveDate::from_ymd_opt(2025, 3, d)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap(),
        )
    }

    fn seed_nifty(handle: &FakeHandle) {
        handle.with_series("NIFTY", "30minute", vec![]);
        handle.with_series("CNXBAN", "30minute", vec![row("2025-03-13 15:00:00", 48_000.0, 0.0)]);
    }

    #[tokio::test]
    async fn closed_market_polls_and_caches() {
        let (board, _hub) = board();
        let handle = FakeHandle::new();
        seed_nifty(&handle);

        let rows = board.snapshot(handle.clone(), at(13, 18, 0)).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].symbol.as_deref(), Some("NIFTY"));
        assert_eq!(rows[0].current_close, None);
        assert_eq!(rows[0].is_positive, Some(false));

        let bank = &rows[1];
        assert_eq!(bank.display_name.as_deref(), Some("NIFTY BANK"));
        assert_eq!(bank.current_close, Some(48_000.0));
        // Both days read the same fake series, so the change is flat.
        assert_eq!(bank.change, Some(0.0));
        assert_eq!(bank.is_positive, Some(true));
        assert_eq!(bank.market_closed, Some(true));
        assert_eq!(bank.last_trading_day.as_deref(), Some("2025-03-13"));

        let calls = handle.series_calls.lock().len();
        board.snapshot(handle.clone(), at(13, 19, 0)).await.unwrap();
        // Only the indices without a cached pair are polled again.
        assert_eq!(handle.series_calls.lock().len() - calls, 6);
    }

    #[tokio::test]
    async fn fresh_quote_wins_while_open() {
        let (board, hub) = board();
        let handle = FakeHandle::new();
        let now = at(13, 11, 0);
        hub.process_tick(
            &json!({
                "stock_name": "NIFTY 50", "open": 1, "high": 1, "low": 1,
                "close": 22_500.0, "volume": 0, "datetime": "2025-03-13 11:00:00",
                "previous_close": 22_000.0
            }),
            now,
        );

        let rows = board.snapshot(handle.clone(), now).await.unwrap();
        let nifty = &rows[0];
        assert_eq!(nifty.current_close, Some(22_500.0));
        assert_eq!(nifty.previous_close, Some(22_000.0));
        assert_eq!(nifty.percent_change, Some(2.27));
        assert_eq!(nifty.market_closed, Some(false));
        assert_eq!(nifty.last_trading_day, None);
        assert!(handle
            .series_calls
            .lock()
            .iter()
            .all(|c| c.code != "NIFTY"));
    }

    #[tokio::test]
    async fn upstream_failure_yields_nulls_not_error() {
        let (board, _hub) = board();
        let handle = FakeHandle::new();
        handle.fail_code("BSESEN");
        let rows = board.snapshot(handle.clone(), at(13, 18, 0)).await.unwrap();
        let sensex = &rows[2];
        assert_eq!(sensex.symbol.as_deref(), Some("SENSEX"));
        assert_eq!(sensex.current_close, None);
        assert_eq!(sensex.change, None);
    }

    #[test]
    fn live_rows_carry_quote_change() {
        let (board, _hub) = board();
        let now = at(13, 11, 0);
        let quote = |symbol: &str| LiveQuote {
            symbol: symbol.into(),
            display_name: symbol.into(),
            last_price: 10.0,
            previous_close: Some(8.0),
            change: None,
            percent_change: None,
            updated_at: now,
        };
        let rows = board.live_rows(&[quote("NIFTY"), quote("TCS")], now).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].change, Some(2.0));
        assert_eq!(rows[0].percent_change, Some(25.0));
        assert_eq!(rows[1].symbol.as_deref(), Some("TCS"));
        assert_eq!(rows[1].market_closed, Some(false));
    }
}
