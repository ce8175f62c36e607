// =============================================================================
// Raw tick decoding
// =============================================================================
//
// The broker feed identifies instruments inconsistently (display name, code,
// exchange-qualified code) and sends numbers either as JSON numbers or as
// strings. Decoding normalises all of that into a `Tick`; anything missing a
// price, volume or timestamp is rejected here and never reaches the hub.
// =============================================================================

use chrono::NaiveDateTime;
use serde_json::Value;
use thiserror::Error;

use crate::broker::parse_row_datetime;

#[derive(Debug, Error, PartialEq)]
#[error("malformed tick: {0}")]
pub struct MalformedTick(pub String);

/// One decoded price update.
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub name: Option<String>,
    pub code: Option<String>,
    pub exchange: Option<String>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub time: NaiveDateTime,
    pub previous_close: Option<f64>,
}

impl Tick {
    /// Tick time as seconds since the epoch (exchange-local wall clock).
    pub fn epoch_secs(&self) -> i64 {
        self.time.and_utc().timestamp()
    }
}

/// Decode a raw JSON tick.
pub fn decode_tick(raw: &Value) -> Result<Tick, MalformedTick> {
    if !raw.is_object() {
        return Err(MalformedTick(format!("expected object, got {raw}")));
    }

    let open = number(raw, &["open"])?;
    let high = number(raw, &["high"])?;
    let low = number(raw, &["low"])?;
    let close = number(raw, &["close", "last"])?;
    let volume = number(raw, &["volume", "ttq"])?;
    let time = timestamp(raw, &["datetime", "ltt", "time"])?;

    Ok(Tick {
        name: text(raw, &["stock_name", "symbol", "name"]),
        code: text(raw, &["stock_code", "code"]),
        exchange: text(raw, &["exchange", "exchange_code"]),
        open,
        high,
        low,
        close,
        volume,
        time,
        previous_close: number(raw, &["previous_close", "prev_close"]).ok(),
    })
}

fn text(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| raw.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn number(raw: &Value, keys: &[&str]) -> Result<f64, MalformedTick> {
    let value = keys
        .iter()
        .find_map(|k| raw.get(*k).filter(|v| !v.is_null()))
        .ok_or_else(|| MalformedTick(format!("missing {}", keys[0])))?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| MalformedTick(format!("{} is not a number: {value}", keys[0])))
}

fn timestamp(raw: &Value, keys: &[&str]) -> Result<NaiveDateTime, MalformedTick> {
    let value = keys
        .iter()
        .find_map(|k| raw.get(*k).filter(|v| !v.is_null()))
        .ok_or_else(|| MalformedTick(format!("missing {}", keys[0])))?;
    let parsed = match value {
        Value::String(s) => parse_row_datetime(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .map(|dt| dt.naive_utc()),
        _ => None,
    };
    parsed.ok_or_else(|| MalformedTick(format!("unparseable time: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_string_and_numeric_fields() {
        let tick = decode_tick(&json!({
            "stock_name": "NIFTY 50", "exchange": "NSE Equity",
            "open": "22400", "high": 22480.5, "low": "22390", "close": 22470,
            "volume": "1200", "datetime": "2025-03-13 10:15:02"
        }))
        .unwrap();
        assert_eq!(tick.name.as_deref(), Some("NIFTY 50"));
        assert_eq!(tick.high, 22480.5);
        assert_eq!(tick.volume, 1200.0);
        assert_eq!(tick.previous_close, None);
    }

    #[test]
    fn accepts_alternate_field_names() {
        let tick = decode_tick(&json!({
            "symbol": "NSE:RELIANCE", "open": 1, "high": 2, "low": 0.5,
            "last": 1.5, "ttq": 10, "ltt": "2025-03-13T10:15:02", "prev_close": 1.2
        }))
        .unwrap();
        assert_eq!(tick.close, 1.5);
        assert_eq!(tick.previous_close, Some(1.2));
    }

    #[test]
    fn epoch_time_is_accepted() {
        let tick = decode_tick(&json!({
            "code": "TCS", "open": 1, "high": 1, "low": 1, "close": 1,
            "volume": 1, "time": 1_741_860_902
        }))
        .unwrap();
        assert_eq!(tick.epoch_secs(), 1_741_860_902);
    }

    #[test]
    fn missing_fields_are_malformed() {
        for missing in ["open", "high", "low", "close", "volume", "datetime"] {
            let mut raw = json!({
                "open": 1, "high": 1, "low": 1, "close": 1,
                "volume": 1, "datetime": "2025-03-13 10:00:00"
            });
            raw.as_object_mut().unwrap().remove(missing);
            assert!(decode_tick(&raw).is_err(), "{missing} should be required");
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(decode_tick(&json!("tick")).is_err());
        assert!(decode_tick(&json!({
            "open": "x", "high": 1, "low": 1, "close": 1,
            "volume": 1, "datetime": "2025-03-13 10:00:00"
        }))
        .is_err());
    }
}
