// =============================================================================
// Runtime Configuration — file defaults, env overrides, validation
// =============================================================================
//
// Settings come from an optional JSON file and are then overridden by
// environment variables (a `.env` file is loaded first by `main`). Every field
// carries a serde default so a partial or missing file still yields a
// complete configuration.
//
// =============================================================================

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{HubError, HubResult};
use crate::market_data::HubSettings;
use crate::screener::{default_universe, TrackedInstrument};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_session_expiry_hours() -> i64 {
    24
}

fn default_rate_limit_requests() -> usize {
    100
}

fn default_rate_limit_window() -> u64 {
    3_600
}

fn default_broker_limit_requests() -> usize {
    100
}

fn default_broker_limit_window() -> u64 {
    60
}

fn default_upstream_workers() -> usize {
    8
}

fn default_open_hour() -> u32 {
    9
}

fn default_open_minute() -> u32 {
    30
}

fn default_close_hour() -> u32 {
    15
}

fn default_close_minute() -> u32 {
    31
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_subscriber_queue_capacity() -> usize {
    64
}

fn default_tick_buffer() -> usize {
    4_096
}

fn default_max_closed_candles() -> usize {
    500
}

fn default_quote_staleness_secs() -> i64 {
    120
}

fn default_holidays_path() -> String {
    "holidays.json".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_broker_base_url() -> String {
    "https://api.icicidirect.com/breezeapi/api/v1".to_string()
}

fn default_broker_stream_url() -> String {
    "wss://livestream.icicidirect.com/ws".to_string()
}

fn default_screener_concurrency() -> usize {
    10
}

fn default_screener_delay_minutes() -> i64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    300
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Server -------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    // --- Sessions & throttling ----------------------------------------------

    #[serde(default = "default_session_expiry_hours")]
    pub session_expiry_hours: i64,

    /// Per-client-IP admissions per window.
    #[serde(default = "default_rate_limit_requests")]
    pub rate_limit_requests: usize,

    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,

    /// Upstream broker calls per window, shared by the whole process.
    #[serde(default = "default_broker_limit_requests")]
    pub broker_limit_requests: usize,

    #[serde(default = "default_broker_limit_window")]
    pub broker_limit_window_secs: u64,

    /// Blocking broker calls allowed in flight at once.
    #[serde(default = "default_upstream_workers")]
    pub upstream_workers: usize,

    /// How often idle limiter keys and expired sessions are swept.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    // --- Trading calendar ---------------------------------------------------

    #[serde(default = "default_open_hour")]
    pub market_open_hour: u32,

    #[serde(default = "default_open_minute")]
    pub market_open_minute: u32,

    /// Close cutoff: at or after this local time the day counts as closed.
    #[serde(default = "default_close_hour")]
    pub market_close_hour: u32,

    #[serde(default = "default_close_minute")]
    pub market_close_minute: u32,

    /// Exchange offset from UTC (IST = +330).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    #[serde(default = "default_holidays_path")]
    pub holidays_path: String,

    // --- Streaming ----------------------------------------------------------

    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,

    #[serde(default = "default_tick_buffer")]
    pub tick_buffer: usize,

    #[serde(default = "default_max_closed_candles")]
    pub max_closed_candles: usize,

    #[serde(default = "default_quote_staleness_secs")]
    pub quote_staleness_secs: i64,

    // --- Broker -------------------------------------------------------------

    #[serde(default = "default_broker_base_url")]
    pub broker_base_url: String,

    #[serde(default = "default_broker_stream_url")]
    pub broker_stream_url: String,

    // --- Screener -----------------------------------------------------------

    #[serde(default = "default_screener_concurrency")]
    pub screener_concurrency: usize,

    /// Minutes after the close cutoff at which the daily run fires.
    #[serde(default = "default_screener_delay_minutes")]
    pub screener_delay_minutes: i64,

    #[serde(default = "default_universe")]
    pub screener_universe: Vec<TrackedInstrument>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors_origins: default_cors_origins(),
            session_expiry_hours: default_session_expiry_hours(),
            rate_limit_requests: default_rate_limit_requests(),
            rate_limit_window_secs: default_rate_limit_window(),
            broker_limit_requests: default_broker_limit_requests(),
            broker_limit_window_secs: default_broker_limit_window(),
            upstream_workers: default_upstream_workers(),
            sweep_interval_secs: default_sweep_interval_secs(),
            market_open_hour: default_open_hour(),
            market_open_minute: default_open_minute(),
            market_close_hour: default_close_hour(),
            market_close_minute: default_close_minute(),
            utc_offset_minutes: default_utc_offset_minutes(),
            holidays_path: default_holidays_path(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            tick_buffer: default_tick_buffer(),
            max_closed_candles: default_max_closed_candles(),
            quote_staleness_secs: default_quote_staleness_secs(),
            broker_base_url: default_broker_base_url(),
            broker_stream_url: default_broker_stream_url(),
            screener_concurrency: default_screener_concurrency(),
            screener_delay_minutes: default_screener_delay_minutes(),
            screener_universe: default_universe(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            universe = config.screener_universe.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// File (if present) + environment, validated.
    pub fn resolve(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            Self::load(path).map_err(|e| HubError::Configuration(format!("{e:#}")))?
        } else {
            warn!(path = %path.display(), "runtime config file not found; using defaults");
            Self::default()
        };
        config.apply_env_from(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn set<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, name: &str, slot: &mut T) {
            if let Some(raw) = lookup(name) {
                match raw.trim().parse::<T>() {
                    Ok(v) => *slot = v,
                    Err(_) => warn!(var = name, value = %raw, "ignoring unparseable env override"),
                }
            }
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        set(lookup, "BIND_ADDR", &mut self.bind_addr);
        set(lookup, "SESSION_EXPIRY_HOURS", &mut self.session_expiry_hours);
        set(lookup, "RATE_LIMIT_REQUESTS", &mut self.rate_limit_requests);
        set(lookup, "RATE_LIMIT_WINDOW", &mut self.rate_limit_window_secs);
        set(lookup, "BROKER_LIMIT_REQUESTS", &mut self.broker_limit_requests);
        set(lookup, "BROKER_LIMIT_WINDOW", &mut self.broker_limit_window_secs);
        set(lookup, "MARKET_OPEN_HOUR", &mut self.market_open_hour);
        set(lookup, "MARKET_OPEN_MINUTE", &mut self.market_open_minute);
        set(lookup, "MARKET_CLOSE_HOUR", &mut self.market_close_hour);
        set(lookup, "MARKET_CLOSE_MINUTE", &mut self.market_close_minute);
        set(lookup, "SUBSCRIBER_QUEUE_CAPACITY", &mut self.subscriber_queue_capacity);
        set(lookup, "QUOTE_STALENESS_SECS", &mut self.quote_staleness_secs);
        set(lookup, "HOLIDAYS_PATH", &mut self.holidays_path);
        set(lookup, "BROKER_BASE_URL", &mut self.broker_base_url);
        set(lookup, "BROKER_STREAM_URL", &mut self.broker_stream_url);

        if let Some(raw) = lookup("CORS_ORIGINS") {
            self.cors_origins = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    pub fn validate(&self) -> HubResult<()> {
        let positive = [
            ("rate_limit_requests", self.rate_limit_requests as u64),
            ("rate_limit_window_secs", self.rate_limit_window_secs),
            ("broker_limit_requests", self.broker_limit_requests as u64),
            ("broker_limit_window_secs", self.broker_limit_window_secs),
            ("upstream_workers", self.upstream_workers as u64),
            ("subscriber_queue_capacity", self.subscriber_queue_capacity as u64),
            ("tick_buffer", self.tick_buffer as u64),
            ("screener_concurrency", self.screener_concurrency as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(HubError::Configuration(format!("{name} must be greater than zero")));
        }
        if self.session_expiry_hours < 0 {
            return Err(HubError::Configuration("session_expiry_hours must not be negative".into()));
        }
        if self.quote_staleness_secs <= 0 {
            return Err(HubError::Configuration("quote_staleness_secs must be greater than zero".into()));
        }
        let (open, close) = (self.market_open()?, self.market_close()?);
        if open >= close {
            return Err(HubError::Configuration(format!(
                "market open {open} must be before close cutoff {close}"
            )));
        }
        self.utc_offset()?;
        Ok(())
    }

    pub fn market_open(&self) -> HubResult<NaiveTime> {
        NaiveTime::from_hms_opt(self.market_open_hour, self.market_open_minute, 0).ok_or_else(|| {
            HubError::Configuration(format!(
                "invalid market open {}:{}",
                self.market_open_hour, self.market_open_minute
            ))
        })
    }

    pub fn market_close(&self) -> HubResult<NaiveTime> {
        NaiveTime::from_hms_opt(self.market_close_hour, self.market_close_minute, 0).ok_or_else(|| {
            HubError::Configuration(format!(
                "invalid market close {}:{}",
                self.market_close_hour, self.market_close_minute
            ))
        })
    }

    pub fn utc_offset(&self) -> HubResult<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            HubError::Configuration(format!("invalid utc offset {} minutes", self.utc_offset_minutes))
        })
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.session_expiry_hours)
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            subscriber_queue: self.subscriber_queue_capacity,
            tick_buffer: self.tick_buffer,
            staleness: chrono::Duration::seconds(self.quote_staleness_secs),
            max_closed_candles: self.max_closed_candles,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.session_expiry_hours, 24);
        assert_eq!((cfg.rate_limit_requests, cfg.rate_limit_window_secs), (100, 3_600));
        assert_eq!((cfg.broker_limit_requests, cfg.broker_limit_window_secs), (100, 60));
        assert_eq!(cfg.market_open().unwrap(), NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(cfg.market_close().unwrap(), NaiveTime::from_hms_opt(15, 31, 0).unwrap());
        assert_eq!(cfg.subscriber_queue_capacity, 64);
        assert_eq!(cfg.quote_staleness_secs, 120);
        assert_eq!(cfg.screener_concurrency, 10);
        assert!(!cfg.screener_universe.is_empty());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "session_expiry_hours": 6, "screener_universe": [{ "symbol": "TCS" }] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.session_expiry_hours, 6);
        assert_eq!(cfg.screener_universe.len(), 1);
        assert_eq!(cfg.screener_universe[0].exchange, "NSE");
        assert_eq!(cfg.rate_limit_requests, 100);
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SESSION_EXPIRY_HOURS", "2"),
            ("RATE_LIMIT_REQUESTS", "5"),
            ("MARKET_CLOSE_MINUTE", "30"),
            ("CORS_ORIGINS", "http://a.example, http://b.example"),
            ("BROKER_LIMIT_WINDOW", "not-a-number"),
        ]);
        let mut cfg = RuntimeConfig::default();
        cfg.apply_env_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.session_expiry_hours, 2);
        assert_eq!(cfg.rate_limit_requests, 5);
        assert_eq!(cfg.market_close_minute, 30);
        assert_eq!(cfg.cors_origins, vec!["http://a.example", "http://b.example"]);
        assert_eq!(cfg.broker_limit_window_secs, 60);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.broker_limit_requests = 0;
        assert!(matches!(cfg.validate(), Err(HubError::Configuration(_))));

        let mut cfg = RuntimeConfig::default();
        cfg.market_open_hour = 16;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.market_close_minute = 75;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn hub_settings_follow_config() {
        let mut cfg = RuntimeConfig::default();
        cfg.subscriber_queue_capacity = 8;
        let s = cfg.hub_settings();
        assert_eq!(s.subscriber_queue, 8);
        assert_eq!(s.staleness, chrono::Duration::seconds(120));
    }
}
