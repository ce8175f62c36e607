// =============================================================================
// Broker seam
// =============================================================================
//
// The broker SDK is synchronous. Everything here is a blocking call that the
// rest of the service only reaches through `UpstreamGate`, which offloads it to
// the bounded worker pool (and charges the upstream quota where applicable).
// =============================================================================

pub mod client;
pub mod gate;
#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::Credentials;

pub use gate::UpstreamGate;

/// Callback installed on a handle; invoked from the stream reader with each
/// raw tick payload.
pub type TickCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Opens authenticated upstream sessions.
pub trait BrokerGateway: Send + Sync {
    /// Perform the session handshake. No session exists if this fails.
    fn create_session(&self, credentials: &Credentials) -> Result<Arc<dyn UpstreamHandle>>;
}

/// One authenticated upstream connection.
pub trait UpstreamHandle: Send + Sync {
    fn customer_details(&self) -> Result<serde_json::Value>;

    fn stream_connect(&self) -> Result<()>;

    fn stream_disconnect(&self) -> Result<()>;

    fn set_tick_callback(&self, callback: TickCallback);

    fn subscribe(&self, exchange: &str, code: &str) -> Result<()>;

    fn get_series(&self, request: &SeriesRequest) -> Result<Vec<SeriesRow>>;
}

/// Historical series query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesRequest {
    pub interval: String,
    pub from: String,
    pub to: String,
    pub code: String,
    pub exchange: String,
}

impl SeriesRequest {
    /// Whole-day window for `day`, in the broker's ISO format.
    pub fn for_day(interval: &str, day: chrono::NaiveDate, code: &str, exchange: &str) -> Self {
        Self {
            interval: interval.to_string(),
            from: format!("{day}T00:00:01.000Z"),
            to: format!("{day}T23:59:59.000Z"),
            code: code.to_string(),
            exchange: exchange.to_string(),
        }
    }

    /// Window spanning `from` through `to`, inclusive.
    pub fn for_range(
        interval: &str,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
        code: &str,
        exchange: &str,
    ) -> Self {
        Self {
            interval: interval.to_string(),
            from: format!("{from}T00:00:01.000Z"),
            to: format!("{to}T23:59:59.000Z"),
            code: code.to_string(),
            exchange: exchange.to_string(),
        }
    }
}

/// One OHLCV row of a historical series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRow {
    pub datetime: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl SeriesRow {
    /// Exchange-local timestamp of the row, if it parses.
    pub fn timestamp(&self) -> Option<chrono::NaiveDateTime> {
        parse_row_datetime(&self.datetime)
    }
}

/// Broker timestamps arrive as `YYYY-MM-DD HH:MM:SS`, ISO with `T`, or a bare
/// date; a trailing `Z` or offset is ignored (rows are already exchange-local).
pub fn parse_row_datetime(raw: &str) -> Option<chrono::NaiveDateTime> {
    let s = raw.trim().replace('T', " ");
    let s = s.trim_end_matches('Z');
    let core = s.get(..19).unwrap_or(s);
    chrono::NaiveDateTime::parse_from_str(core, "%Y-%m-%d %H:%M:%S")
        .ok()
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s.get(..10).unwrap_or(s), "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn day_request_spans_whole_day() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 13).unwrap();
        let req = SeriesRequest::for_day("30minute", day, "NIFTY", "NSE");
        assert_eq!(req.from, "2025-03-13T00:00:01.000Z");
        assert_eq!(req.to, "2025-03-13T23:59:59.000Z");
    }

    #[test]
    fn row_datetime_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 3, 13)
            .unwrap()
            .and_hms_opt(15, 30, 0)
            .unwrap();
        assert_eq!(parse_row_datetime("2025-03-13 15:30:00"), Some(expected));
        assert_eq!(parse_row_datetime("2025-03-13T15:30:00.000Z"), Some(expected));
        assert_eq!(
            parse_row_datetime("2025-03-13"),
            NaiveDate::from_ymd_opt(2025, 3, 13).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_row_datetime("yesterday"), None);
    }
}
