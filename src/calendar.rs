// =============================================================================
// Trading Calendar — weekends, holidays, and the market-open window
// =============================================================================
//
// Every query takes the date or local time it is asked about, so the whole
// module is deterministic and testable without a wall clock. Only
// `local_now` touches the system time.
//
// The holiday set is loaded once at startup and never mutated afterwards.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{HubError, HubResult};

/// Upper bound on how far a day-by-day walk may go (about ten years).
const MAX_WALK_DAYS: u32 = 3650;

/// Keys tried, in order, when a holiday list entry is an object.
const DATE_KEYS: &[&str] = &["date", "date_iso", "holiday_date", "Date"];

#[derive(Debug, Clone)]
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
    open: NaiveTime,
    close: NaiveTime,
    utc_offset: FixedOffset,
}

/// Human-facing market status, as served by `/market/status`.
#[derive(Debug, Clone, Serialize)]
pub struct MarketStatus {
    pub status: &'static str,
    pub is_market_open: bool,
    pub current_time: String,
    pub market_open_time: String,
    pub market_close_time: String,
    pub current_day: String,
    pub is_weekend: bool,
    pub is_holiday: bool,
    pub last_trading_day: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_close_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_market_open: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_to_open_secs: Option<i64>,
}

impl TradingCalendar {
    pub fn new(
        holidays: HashSet<NaiveDate>,
        open: NaiveTime,
        close: NaiveTime,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            holidays,
            open,
            close,
            utc_offset,
        }
    }

    pub fn open_time(&self) -> NaiveTime {
        self.open
    }

    pub fn close_time(&self) -> NaiveTime {
        self.close
    }

    pub fn holiday_count(&self) -> usize {
        self.holidays.len()
    }

    // -------------------------------------------------------------------------
    // Day classification
    // -------------------------------------------------------------------------

    pub fn is_weekend(&self, d: NaiveDate) -> bool {
        matches!(d.weekday(), Weekday::Sat | Weekday::Sun)
    }

    pub fn is_holiday(&self, d: NaiveDate) -> bool {
        self.holidays.contains(&d)
    }

    pub fn is_closed(&self, d: NaiveDate) -> bool {
        self.is_weekend(d) || self.is_holiday(d)
    }

    // -------------------------------------------------------------------------
    // Day walks
    // -------------------------------------------------------------------------

    /// Most recent trading day on or before `d`.
    pub fn last_trading_day(&self, d: NaiveDate) -> HubResult<NaiveDate> {
        self.walk(d, -1)
    }

    /// Trading day strictly before `last`.
    pub fn previous_trading_day(&self, last: NaiveDate) -> HubResult<NaiveDate> {
        self.walk(last - Duration::days(1), -1)
    }

    /// Trading day strictly after `d`.
    pub fn next_trading_day(&self, d: NaiveDate) -> HubResult<NaiveDate> {
        self.walk(d + Duration::days(1), 1)
    }

    fn walk(&self, start: NaiveDate, step: i64) -> HubResult<NaiveDate> {
        let mut day = start;
        for _ in 0..=MAX_WALK_DAYS {
            if !self.is_closed(day) {
                return Ok(day);
            }
            day += Duration::days(step);
        }
        Err(HubError::Configuration(format!(
            "no trading day within {MAX_WALK_DAYS} days of {start}; holiday set is implausibly dense"
        )))
    }

    // -------------------------------------------------------------------------
    // Intraday window
    // -------------------------------------------------------------------------

    /// `true` when today is closed, or `now` is before the open or at/after
    /// the close cutoff. `now` is exchange-local time.
    pub fn market_closed_at(&self, now: NaiveDateTime) -> bool {
        if self.is_closed(now.date()) {
            return true;
        }
        let t = now.time();
        t < self.open || t >= self.close
    }

    /// Day whose data represents "now": today while the market is open,
    /// otherwise the last trading day on or before today.
    pub fn snapshot_day(&self, now: NaiveDateTime) -> HubResult<NaiveDate> {
        if self.market_closed_at(now) {
            self.last_trading_day(now.date())
        } else {
            Ok(now.date())
        }
    }

    /// Exchange-local wall-clock time.
    pub fn local_now(&self) -> NaiveDateTime {
        self.to_local(Utc::now())
    }

    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.utc_offset).naive_local()
    }

    /// Exchange-local wall-clock time back to an instant.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        (local - Duration::seconds(i64::from(self.utc_offset.local_minus_utc()))).and_utc()
    }

    pub fn market_status(&self, now: NaiveDateTime) -> HubResult<MarketStatus> {
        let today = now.date();
        let is_open = !self.market_closed_at(now);
        let mut status = MarketStatus {
            status: if is_open { "open" } else { "closed" },
            is_market_open: is_open,
            current_time: now.format("%Y-%m-%dT%H:%M:%S").to_string(),
            market_open_time: self.open.format("%H:%M").to_string(),
            market_close_time: self.close.format("%H:%M").to_string(),
            current_day: today.format("%A").to_string(),
            is_weekend: self.is_weekend(today),
            is_holiday: self.is_holiday(today),
            last_trading_day: self.last_trading_day(today)?.to_string(),
            time_to_close_secs: None,
            next_market_open: None,
            time_to_open_secs: None,
        };

        if is_open {
            let close_at = today.and_time(self.close);
            status.time_to_close_secs = Some((close_at - now).num_seconds());
        } else {
            let open_day = if !self.is_closed(today) && now.time() < self.open {
                today
            } else {
                self.next_trading_day(today)?
            };
            let next_open = open_day.and_time(self.open);
            status.next_market_open = Some(next_open.format("%Y-%m-%dT%H:%M:%S").to_string());
            status.time_to_open_secs = Some((next_open - now).num_seconds());
        }
        Ok(status)
    }
}

// =============================================================================
// Holiday document loading
// =============================================================================

/// Load the holiday set from a JSON file. A missing or unreadable file yields
/// an empty set with a warning; the service still runs on weekends-only rules.
pub fn load_holidays(path: impl AsRef<Path>) -> HashSet<NaiveDate> {
    let path = path.as_ref();
    let holidays = match std::fs::read_to_string(path) {
        Ok(text) => match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(doc) => parse_holiday_document(&doc),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "holiday file is not valid JSON");
                HashSet::new()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "holiday file not readable; no holidays loaded");
            HashSet::new()
        }
    };
    info!(count = holidays.len(), path = %path.display(), "holidays loaded");
    holidays
}

/// Accepts either a list (of strings or of objects with a date field) or an
/// object with `weekday_trading_holidays` / `weekend_non_trading_days` lists.
pub fn parse_holiday_document(doc: &serde_json::Value) -> HashSet<NaiveDate> {
    let mut out = HashSet::new();
    match doc {
        serde_json::Value::Array(items) => collect_entries(items, &mut out),
        serde_json::Value::Object(map) => {
            for key in ["weekday_trading_holidays", "weekend_non_trading_days"] {
                if let Some(serde_json::Value::Array(items)) = map.get(key) {
                    collect_entries(items, &mut out);
                }
            }
        }
        _ => warn!("unexpected holiday document shape; expected a list or an object"),
    }
    out
}

fn collect_entries(items: &[serde_json::Value], out: &mut HashSet<NaiveDate>) {
    for item in items {
        let raw = match item {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => DATE_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(|v| v.as_str())),
            _ => None,
        };
        match raw.and_then(parse_date_str) {
            Some(d) => {
                out.insert(d);
            }
            None => warn!(entry = %item, "skipping unparseable holiday entry"),
        }
    }
}

/// Parse the date formats seen in exchange holiday lists.
pub fn parse_date_str(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if let Some(head) = s.get(..10) {
        if let Ok(d) = NaiveDate::parse_from_str(head, "%Y-%m-%d") {
            return Some(d);
        }
    }
    ["%Y-%m-%d", "%d-%m-%Y", "%d/%m/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}

// =============================================================================
// Tests
// =============================================================================
