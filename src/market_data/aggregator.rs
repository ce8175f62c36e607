use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::tick::Tick;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One OHLCV candle built from live ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, seconds since the epoch.
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub updated_at: i64,
}

impl Candle {
    fn seed(bucket: i64, tick: &Tick) -> Self {
        Self {
            time: bucket,
            open: tick.close,
            high: tick.close,
            low: tick.close,
            close: tick.close,
            volume: tick.volume,
            updated_at: tick.epoch_secs(),
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.close);
        self.low = self.low.min(tick.close);
        self.close = tick.close;
        self.volume += tick.volume;
        self.updated_at = tick.epoch_secs();
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }

    pub fn interval_secs(&self) -> i64 {
        interval_seconds(&self.interval)
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Bucket length for an interval name. Unknown names fall back to one minute.
pub fn interval_seconds(interval: &str) -> i64 {
    match interval {
        "1second" => 1,
        "1minute" => 60,
        "5minute" => 300,
        "30minute" => 1_800,
        "1day" => 86_400,
        other => {
            warn!(interval = other, "unknown candle interval; using 1minute");
            60
        }
    }
}

pub fn bucket_start(epoch_secs: i64, interval_secs: i64) -> i64 {
    epoch_secs.div_euclid(interval_secs) * interval_secs
}

/// What a single tick did to its series.
#[derive(Debug, Clone, PartialEq)]
pub enum Ingest {
    /// First tick for the key.
    Opened(Candle),
    /// Same bucket as the open candle.
    Updated(Candle),
    /// A later bucket arrived: `closed` is final, `opened` is the new live candle.
    Rolled { closed: Candle, opened: Candle },
    /// Tick for a bucket that already closed; dropped.
    Late { bucket: i64 },
}

// ---------------------------------------------------------------------------
// TickAggregator -- per-key bucket state plus a ring of closed candles
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Series {
    open: Option<Candle>,
    closed: VecDeque<Candle>,
    dropped_late: u64,
}

/// Thread-safe tick-to-candle aggregator.
///
/// Each key holds at most one open candle. Buckets only move forward: a tick
/// older than the open bucket is counted and discarded rather than merged
/// back into history. Closed candles are kept in a ring trimmed to
/// `max_closed`.
pub struct TickAggregator {
    series: RwLock<HashMap<CandleKey, Series>>,
    max_closed: usize,
}

impl TickAggregator {
    pub fn new(max_closed: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_closed: max_closed.max(1),
        }
    }

    pub fn ingest(&self, key: &CandleKey, tick: &Tick) -> Ingest {
        let bucket = bucket_start(tick.epoch_secs(), key.interval_secs());
        let mut map = self.series.write();
        let series = map.entry(key.clone()).or_default();

        let current = match series.open.as_mut() {
            None => {
                let candle = Candle::seed(bucket, tick);
                series.open = Some(candle.clone());
                return Ingest::Opened(candle);
            }
            Some(c) => c,
        };

        if bucket == current.time {
            current.absorb(tick);
            return Ingest::Updated(current.clone());
        }

        if bucket < current.time {
            series.dropped_late += 1;
            debug!(key = %key, bucket, open_bucket = current.time, "late tick dropped");
            return Ingest::Late { bucket };
        }

        let opened = Candle::seed(bucket, tick);
        let closed = std::mem::replace(current, opened.clone());
        series.closed.push_back(closed.clone());
        while series.closed.len() > self.max_closed {
            series.closed.pop_front();
        }
        Ingest::Rolled { closed, opened }
    }

    /// The live (unclosed) candle for a key.
    pub fn current(&self, key: &CandleKey) -> Option<Candle> {
        self.series.read().get(key).and_then(|s| s.open.clone())
    }

    /// Most recent `count` closed candles, oldest first.
    pub fn closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.series.read();
        match map.get(key) {
            Some(s) => {
                let start = s.closed.len().saturating_sub(count);
                s.closed.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn dropped_late(&self, key: &CandleKey) -> u64 {
        self.series.read().get(key).map_or(0, |s| s.dropped_late)
    }

    /// Forget a key entirely (last interested subscriber went away).
    pub fn remove(&self, key: &CandleKey) {
        self.series.write().remove(key);
    }

    pub fn key_count(&self) -> usize {
        self.series.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn tick_at(epoch: i64, close: f64, volume: f64) -> Tick {
        let time = chrono::DateTime::from_timestamp(epoch, 0).unwrap().naive_utc();
        Tick {
            name: Some("NIFTY 50".into()),
            code: None,
            exchange: None,
            open: close,
            high: close,
            low: close,
            close,
            volume,
            time,
            previous_close: None,
        }
    }

    fn minute_key() -> CandleKey {
        CandleKey::new("NIFTY", "1minute")
    }

    #[test]
    fn two_buckets_produce_closed_and_open_candle() {
        let agg = TickAggregator::new(10);
        let key = minute_key();
        let b = 1_741_860_000;

        assert!(matches!(agg.ingest(&key, &tick_at(b, 10.0, 1.0)), Ingest::Opened(_)));
        assert!(matches!(agg.ingest(&key, &tick_at(b + 30, 12.0, 2.0)), Ingest::Updated(_)));
        let rolled = agg.ingest(&key, &tick_at(b + 60, 15.0, 4.0));

        let Ingest::Rolled { closed, opened } = rolled else {
            panic!("expected a bucket roll");
        };
        assert_eq!((closed.open, closed.high, closed.low, closed.close), (10.0, 12.0, 10.0, 12.0));
        assert_eq!(closed.volume, 3.0);
        assert_eq!(closed.time, b);
        assert_eq!(opened.close, 15.0);
        assert_eq!(opened.open, 15.0);
        assert_eq!(opened.volume, 4.0);
        assert_eq!(agg.current(&key).unwrap().time, b + 60);
        assert_eq!(agg.closed(&key, 5), vec![closed]);
    }

    #[test]
    fn low_tracks_minimum_within_bucket() {
        let agg = TickAggregator::new(10);
        let key = minute_key();
        let b = 1_741_860_000;
        agg.ingest(&key, &tick_at(b, 10.0, 1.0));
        agg.ingest(&key, &tick_at(b + 1, 8.0, 1.0));
        agg.ingest(&key, &tick_at(b + 2, 9.0, 1.0));
        let c = agg.current(&key).unwrap();
        assert_eq!((c.open, c.high, c.low, c.close), (10.0, 10.0, 8.0, 9.0));
    }

    #[test]
    fn late_tick_is_dropped_and_counted() {
        let agg = TickAggregator::new(10);
        let key = minute_key();
        let b = 1_741_860_000;
        agg.ingest(&key, &tick_at(b, 10.0, 1.0));
        agg.ingest(&key, &tick_at(b + 60, 11.0, 1.0));

        let before = agg.closed(&key, 10);
        assert_eq!(agg.ingest(&key, &tick_at(b + 5, 99.0, 1.0)), Ingest::Late { bucket: b });
        assert_eq!(agg.closed(&key, 10), before);
        assert_eq!(agg.current(&key).unwrap().close, 11.0);
        assert_eq!(agg.dropped_late(&key), 1);
    }

    #[test]
    fn closed_ring_is_bounded() {
        let agg = TickAggregator::new(3);
        let key = CandleKey::new("TCS", "1second");
        for i in 0..10 {
            agg.ingest(&key, &tick_at(1_000 + i, i as f64, 1.0));
        }
        let closed = agg.closed(&key, 100);
        assert_eq!(closed.len(), 3);
        assert_eq!(closed.first().unwrap().time, 1_006);
    }

    #[test]
    fn keys_are_independent() {
        let agg = TickAggregator::new(10);
        let a = CandleKey::new("NIFTY", "1minute");
        let b = CandleKey::new("NIFTY", "5minute");
        agg.ingest(&a, &tick_at(600, 1.0, 1.0));
        agg.ingest(&b, &tick_at(600, 1.0, 1.0));
        agg.ingest(&a, &tick_at(660, 2.0, 1.0));
        assert_eq!(agg.closed(&a, 10).len(), 1);
        assert!(agg.closed(&b, 10).is_empty());
        agg.remove(&a);
        assert_eq!(agg.key_count(), 1);
    }

    #[test]
    fn daily_bucket_uses_exchange_wall_clock() {
        let t = NaiveDate::from_ymd_opt(2025, 3, 13)
            .unwrap()
            .and_hms_opt(15, 29, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        let midnight = NaiveDate::from_ymd_opt(2025, 3, 13)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        assert_eq!(bucket_start(t, interval_seconds("1day")), midnight);
    }

    #[test]
    fn interval_table() {
        assert_eq!(interval_seconds("1second"), 1);
        assert_eq!(interval_seconds("5minute"), 300);
        assert_eq!(interval_seconds("30minute"), 1_800);
        assert_eq!(interval_seconds("fortnight"), 60);
    }
}
