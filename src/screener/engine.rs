// =============================================================================
// Screener Engine — batch EOD computation over the tracked universe
// =============================================================================
//
// For every tracked instrument: pull about a year of daily rows plus the
// snapshot day's 30-minute rows through the upstream gate, derive the row,
// and collect. At most `concurrency` instruments are in flight; the gate
// separately enforces the upstream quota on each call.
//
// One instrument failing only costs that instrument. The finished row set
// replaces the cache in a single swap.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::{ScreenerCache, ScreenerRow, ScreenerStore, SparkPoint};
use super::TrackedInstrument;
use crate::broker::{SeriesRequest, SeriesRow, UpstreamGate, UpstreamHandle};
use crate::calendar::TradingCalendar;
use crate::error::{HubError, HubResult};
use crate::indicators::{calculate_macd, rsi_14};
use crate::market_data::SymbolTable;
use crate::types::{price_change, round2, UpstreamId};

/// Daily points used for the 52-week range.
const YEAR_POINTS: usize = 252;
/// Calendar days of daily history requested; comfortably more than a
/// trading year.
const HISTORY_DAYS: i64 = 400;
/// Volume average window (the "week" average).
const VOLUME_WINDOW: usize = 5;
/// Daily closes used for the sparkline when no intraday rows exist.
const SPARK_FALLBACK_POINTS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub snapshot_date: NaiveDate,
    pub rows: usize,
    pub skipped: usize,
    pub failures: usize,
    pub elapsed_ms: u128,
}

pub struct ScreenerEngine {
    symbols: Arc<SymbolTable>,
    gate: Arc<UpstreamGate>,
    calendar: Arc<TradingCalendar>,
    universe: Vec<TrackedInstrument>,
    concurrency: usize,
    store: ScreenerStore,
    running: AtomicBool,
}

/// Clears the running flag however the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Outcome {
    Row(ScreenerRow),
    NoData,
    Failed,
}

impl ScreenerEngine {
    pub fn new(
        symbols: Arc<SymbolTable>,
        gate: Arc<UpstreamGate>,
        calendar: Arc<TradingCalendar>,
        universe: Vec<TrackedInstrument>,
        concurrency: usize,
    ) -> Self {
        Self {
            symbols,
            gate,
            calendar,
            universe,
            concurrency: concurrency.max(1),
            store: ScreenerStore::new(),
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &ScreenerStore {
        &self.store
    }

    pub fn universe_size(&self) -> usize {
        self.universe.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Compute a fresh cache and swap it in. Rejected while another run is
    /// in progress.
    pub async fn run(&self, upstream: Arc<dyn UpstreamHandle>, now: DateTime<Utc>) -> HubResult<RunSummary> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(HubError::InvalidRequest("screener run already in progress".into()));
        }
        let _guard = RunGuard(&self.running);

        let started = std::time::Instant::now();
        let day = self.calendar.snapshot_day(self.calendar.to_local(now))?;
        info!(snapshot_date = %day, instruments = self.universe.len(), "screener run started");

        let outcomes: Vec<Outcome> = stream::iter(self.universe.clone())
            .map(|inst| {
                let upstream = upstream.clone();
                async move {
                    match self.build_row(upstream, &inst, day).await {
                        Ok(Some(row)) => Outcome::Row(row),
                        Ok(None) => {
                            debug!(symbol = %inst.symbol, "no series data; skipped");
                            Outcome::NoData
                        }
                        Err(e) => {
                            warn!(symbol = %inst.symbol, error = %e, "screener row failed");
                            Outcome::Failed
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut rows = Vec::with_capacity(outcomes.len());
        let (mut skipped, mut failures) = (0, 0);
        for outcome in outcomes {
            match outcome {
                Outcome::Row(row) => rows.push(row),
                Outcome::NoData => skipped += 1,
                Outcome::Failed => failures += 1,
            }
        }
        rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let summary = RunSummary {
            snapshot_date: day,
            rows: rows.len(),
            skipped,
            failures,
            elapsed_ms: started.elapsed().as_millis(),
        };
        self.store.swap(Arc::new(ScreenerCache {
            snapshot_date: Some(day),
            built_at: Some(Utc::now()),
            rows,
            failures,
        }));
        info!(
            snapshot_date = %day,
            rows = summary.rows,
            skipped,
            failures,
            elapsed_ms = summary.elapsed_ms as u64,
            "screener cache swapped"
        );
        Ok(summary)
    }

    /// Try each candidate identifier until one returns daily rows.
    async fn build_row(
        &self,
        upstream: Arc<dyn UpstreamHandle>,
        inst: &TrackedInstrument,
        day: NaiveDate,
    ) -> HubResult<Option<ScreenerRow>> {
        let mut last_err = None;
        for id in self.symbols.candidates(&inst.symbol, &inst.exchange) {
            let request = SeriesRequest::for_range("1day", day - Duration::days(HISTORY_DAYS), day, &id.code, &id.exchange);
            let daily = match self.fetch(&upstream, request).await {
                Ok(rows) if !rows.is_empty() => rows,
                Ok(_) => continue,
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            };

            let intraday = self
                .fetch(&upstream, SeriesRequest::for_day("30minute", day, &id.code, &id.exchange))
                .await
                .unwrap_or_else(|e| {
                    debug!(upstream = %id, error = %e, "intraday series unavailable");
                    Vec::new()
                });

            return Ok(compute_row(inst, &id, day, &daily, &intraday));
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn fetch(&self, upstream: &Arc<dyn UpstreamHandle>, request: SeriesRequest) -> HubResult<Vec<SeriesRow>> {
        let handle = upstream.clone();
        self.gate.call(move || handle.get_series(&request)).await
    }
}

/// Derive one screener row from daily history and the day's intraday rows.
/// `None` when no usable daily close exists on or before `day`.
pub fn compute_row(
    inst: &TrackedInstrument,
    id: &UpstreamId,
    day: NaiveDate,
    daily: &[SeriesRow],
    intraday: &[SeriesRow],
) -> Option<ScreenerRow> {
    let mut days: Vec<(NaiveDate, &SeriesRow)> = daily
        .iter()
        .filter_map(|r| r.timestamp().map(|t| (t.date(), r)))
        .filter(|(d, _)| *d <= day)
        .collect();
    days.sort_by_key(|(d, _)| *d);
    days.dedup_by_key(|(d, _)| *d);

    let mut closes: Vec<f64> = days.iter().map(|(_, r)| r.close).collect();
    let mut volumes: Vec<f64> = days.iter().map(|(_, r)| r.volume).collect();
    let mut highs: Vec<f64> = days.iter().map(|(_, r)| r.high).collect();
    let mut lows: Vec<f64> = days.iter().map(|(_, r)| r.low).collect();

    // Daily bar for the snapshot day not published yet: build it from the
    // intraday rows.
    let session: Vec<&SeriesRow> = intraday
        .iter()
        .filter(|r| r.timestamp().is_some_and(|t| t.date() == day))
        .collect();
    let has_daily_today = days.last().is_some_and(|(d, _)| *d == day);
    if !has_daily_today {
        if let Some(last) = session.last() {
            closes.push(last.close);
            volumes.push(session.iter().map(|r| r.volume).sum());
            highs.push(session.iter().map(|r| r.high).fold(f64::MIN, f64::max));
            lows.push(session.iter().map(|r| r.low).fold(f64::MAX, f64::min));
        }
    }

    let close = *closes.last()?;
    let prev_close = closes.len().checked_sub(2).map(|i| closes[i]);
    let (change_abs, change_pct) = price_change(prev_close, Some(close));

    let volume = volumes.last().copied();
    let week_avg_volume = (volumes.len() > VOLUME_WINDOW).then(|| {
        let prior = &volumes[volumes.len() - 1 - VOLUME_WINDOW..volumes.len() - 1];
        prior.iter().sum::<f64>() / VOLUME_WINDOW as f64
    });
    let week_volume_diff_pct = match (volume, week_avg_volume) {
        (Some(v), Some(avg)) if avg > 0.0 => Some(round2((v - avg) / avg * 100.0)),
        _ => None,
    };

    let year_start = highs.len().saturating_sub(YEAR_POINTS);
    let fifty_two_week_high = highs[year_start..].iter().copied().reduce(f64::max);
    let fifty_two_week_low = lows[year_start..].iter().copied().reduce(f64::min);

    let macd = calculate_macd(&closes);

    let sparkline = if session.is_empty() {
        let start = days.len().saturating_sub(SPARK_FALLBACK_POINTS);
        days[start..]
            .iter()
            .map(|(d, r)| SparkPoint {
                time: d.to_string(),
                close: r.close,
            })
            .collect()
    } else {
        session
            .iter()
            .map(|r| SparkPoint {
                time: r.datetime.clone(),
                close: r.close,
            })
            .collect()
    };

    Some(ScreenerRow {
        symbol: inst.symbol.clone(),
        company_name: inst.display_name().to_string(),
        exchange_code: id.exchange.clone(),
        stock_code: id.code.clone(),
        trade_date: day,
        close_price: close,
        prev_close_price: prev_close,
        change_abs,
        change_pct,
        volume,
        week_avg_volume: week_avg_volume.map(f64::round),
        week_volume_diff_pct,
        rsi_14: rsi_14(&closes).map(round2),
        macd: macd.map(|m| round2(m.macd)),
        macd_signal: macd.and_then(|m| m.signal).map(round2),
        macd_histogram: macd.and_then(|m| m.histogram).map(round2),
        fifty_two_week_high,
        fifty_two_week_low,
        sparkline,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{row, FakeHandle};
    use chrono::{FixedOffset, NaiveTime};
    use std::collections::HashSet;

    fn calendar() -> Arc<TradingCalendar> {
        Arc::new(TradingCalendar::new(
            HashSet::new(),
            NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(15, 31, 0).unwrap(),
            FixedOffset::east_opt(5 * 3600 + 1800).unwrap(),
        ))
    }

    fn tracked(symbol: &str) -> TrackedInstrument {
        TrackedInstrument {
            symbol: symbol.into(),
            exchange: "NSE".into(),
            name: None,
        }
    }

    /// `n` consecutive daily rows ending on 2025-03-13 with closes 1..=n.
    fn daily(n: usize) -> Vec<SeriesRow> {
        let end = NaiveDate::from_ymd_opt(2025, 3, 13).unwrap();
        (0..n)
            .map(|i| {
                let d = end - Duration::days((n - 1 - i) as i64);
                row(&format!("{d} 00:00:00"), (i + 1) as f64, 100.0 + i as f64)
            })
            .collect()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 13).unwrap()
    }

    fn nse(code: &str) -> UpstreamId {
        UpstreamId {
            exchange: "NSE".into(),
            code: code.into(),
        }
    }

    #[test]
    fn row_from_daily_history() {
        let r = compute_row(&tracked("TCS"), &nse("TCS"), day(), &daily(40), &[]).unwrap();
        assert_eq!(r.close_price, 40.0);
        assert_eq!(r.prev_close_price, Some(39.0));
        assert_eq!(r.change_abs, Some(1.0));
        assert_eq!(r.change_pct, Some(2.56));
        assert_eq!(r.rsi_14, Some(100.0));
        assert!(r.macd.is_some());
        assert!(r.macd_signal.is_some());
        assert_eq!(r.fifty_two_week_high, Some(41.0));
        assert_eq!(r.fifty_two_week_low, Some(0.0));
        assert_eq!(r.sparkline.len(), 20);
    }

    #[test]
    fn volume_average_uses_five_prior_days() {
        // Volumes are 100..=139; the five before the last are 134..=138.
        let r = compute_row(&tracked("TCS"), &nse("TCS"), day(), &daily(40), &[]).unwrap();
        assert_eq!(r.volume, Some(139.0));
        assert_eq!(r.week_avg_volume, Some(136.0));
        assert_eq!(r.week_volume_diff_pct, Some(2.21));
    }

    #[test]
    fn short_history_leaves_indicators_empty() {
        let r = compute_row(&tracked("TCS"), &nse("TCS"), day(), &daily(5), &[]).unwrap();
        assert!(r.rsi_14.is_none());
        assert!(r.macd.is_none());
        assert!(r.week_avg_volume.is_none());
    }

    #[test]
    fn intraday_fills_missing_daily_bar() {
        let mut hist = daily(20);
        hist.pop();
        let intraday = vec![
            row("2025-03-13 09:15:00", 50.0, 10.0),
            row("2025-03-13 15:00:00", 52.0, 15.0),
        ];
        let r = compute_row(&tracked("TCS"), &nse("TCS"), day(), &hist, &intraday).unwrap();
        assert_eq!(r.close_price, 52.0);
        assert_eq!(r.prev_close_price, Some(19.0));
        assert_eq!(r.volume, Some(25.0));
        assert_eq!(r.sparkline.len(), 2);
    }

    #[test]
    fn rows_after_snapshot_day_are_ignored() {
        let mut hist = daily(10);
        hist.push(row("2025-03-14 00:00:00", 999.0, 1.0));
        let r = compute_row(&tracked("TCS"), &nse("TCS"), day(), &hist, &[]).unwrap();
        assert_eq!(r.close_price, 10.0);
    }

    #[test]
    fn empty_history_is_no_row() {
        assert!(compute_row(&tracked("TCS"), &nse("TCS"), day(), &[], &[]).is_none());
    }

    fn engine(universe: Vec<TrackedInstrument>) -> ScreenerEngine {
        ScreenerEngine::new(
            Arc::new(SymbolTable::with_indices()),
            Arc::new(UpstreamGate::new(1_000, std::time::Duration::from_secs(60), 4)),
            calendar(),
            universe,
            3,
        )
    }

    /// 2025-03-13 18:00 IST: after the close, so the snapshot day is the 13th.
    fn after_close() -> DateTime<Utc> {
        calendar().to_utc(day().and_hms_opt(18, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_the_run() {
        let handle = FakeHandle::new();
        handle.with_series("TCS", "1day", daily(40));
        handle.with_series("INFY", "1day", daily(40));
        handle.fail_code("WIPRO");

        let engine = engine(vec![tracked("TCS"), tracked("WIPRO"), tracked("INFY"), tracked("NODATA")]);
        let summary = engine.run(handle.clone(), after_close()).await.unwrap();

        assert_eq!(summary.rows, 2);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.skipped, 1);
        let cache = engine.store().load();
        assert_eq!(cache.snapshot_date, Some(day()));
        let symbols: Vec<&str> = cache.rows.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["INFY", "TCS"]);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn primary_exchange_answer_skips_alternate() {
        let handle = FakeHandle::new();
        handle.with_series("SBIN", "1day", daily(30));
        let engine = engine(vec![tracked("SBIN")]);
        engine.run(handle.clone(), after_close()).await.unwrap();

        // NSE:SBIN answers first, so BSE is never asked.
        let calls = handle.series_calls.lock();
        assert!(calls.iter().all(|c| c.exchange == "NSE"));
        assert_eq!(engine.store().load().rows[0].exchange_code, "NSE");
    }

    #[tokio::test]
    async fn empty_primary_falls_back_to_alternate_exchange() {
        let handle = FakeHandle::new();
        handle.with_exchange_series("BSE", "SBIN", "1day", daily(30));
        let engine = engine(vec![tracked("SBIN")]);
        let summary = engine.run(handle.clone(), after_close()).await.unwrap();

        assert_eq!((summary.rows, summary.failures), (1, 0));
        let cache = engine.store().load();
        assert_eq!(cache.rows[0].exchange_code, "BSE");
        assert_eq!(cache.rows[0].close_price, 30.0);
        let daily_exchanges: Vec<String> = handle
            .series_calls
            .lock()
            .iter()
            .filter(|c| c.interval == "1day")
            .map(|c| c.exchange.clone())
            .collect();
        assert_eq!(daily_exchanges, vec!["NSE", "BSE"]);
    }

    #[tokio::test]
    async fn failing_primary_falls_back_to_alternate_exchange() {
        let handle = FakeHandle::new();
        handle.fail_code("NSE:SBIN");
        handle.with_exchange_series("BSE", "SBIN", "1day", daily(30));
        let engine = engine(vec![tracked("SBIN")]);
        let summary = engine.run(handle.clone(), after_close()).await.unwrap();

        assert_eq!((summary.rows, summary.failures), (1, 0));
        assert_eq!(engine.store().load().rows[0].exchange_code, "BSE");
    }

    #[tokio::test]
    async fn index_uses_override_code() {
        let handle = FakeHandle::new();
        handle.with_series("CNXBAN", "1day", daily(30));
        let engine = engine(vec![tracked("BANKNIFTY")]);
        engine.run(handle.clone(), after_close()).await.unwrap();
        let cache = engine.store().load();
        assert_eq!(cache.rows[0].stock_code, "CNXBAN");
    }
}
