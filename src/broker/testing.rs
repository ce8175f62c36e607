//! In-memory broker used by unit tests across the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;

use super::{BrokerGateway, SeriesRequest, SeriesRow, TickCallback, UpstreamHandle};
use crate::types::Credentials;

#[derive(Default)]
pub struct FakeHandle {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub connected: AtomicBool,
    pub fail_details: AtomicBool,
    pub subscriptions: Mutex<Vec<(String, String)>>,
    pub series_calls: Mutex<Vec<SeriesRequest>>,
    callback: Mutex<Option<TickCallback>>,
    /// Rows keyed by `(code, interval)`.
    series: Mutex<HashMap<(String, String), Vec<SeriesRow>>>,
    /// Rows keyed by `(exchange, code, interval)`; checked first.
    exchange_series: Mutex<HashMap<(String, String, String), Vec<SeriesRow>>>,
    failing_codes: Mutex<Vec<String>>,
}

impl FakeHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_series(&self, code: &str, interval: &str, rows: Vec<SeriesRow>) {
        self.series
            .lock()
            .insert((code.to_string(), interval.to_string()), rows);
    }

    pub fn with_exchange_series(&self, exchange: &str, code: &str, interval: &str, rows: Vec<SeriesRow>) {
        self.exchange_series.lock().insert(
            (exchange.to_string(), code.to_string(), interval.to_string()),
            rows,
        );
    }

    /// Fail every series call for `code`, or only on one exchange when given
    /// as `EXCHANGE:CODE`.
    pub fn fail_code(&self, code: &str) {
        self.failing_codes.lock().push(code.to_string());
    }

    /// Deliver a raw tick through the installed callback, as the stream
    /// reader would.
    pub fn emit(&self, tick: serde_json::Value) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(tick);
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().is_some()
    }
}

impl UpstreamHandle for FakeHandle {
    fn customer_details(&self) -> Result<serde_json::Value> {
        if self.fail_details.load(Ordering::SeqCst) {
            bail!("customer details unavailable");
        }
        Ok(serde_json::json!({ "idirect_user_name": "TEST USER" }))
    }

    fn stream_connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stream_disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_tick_callback(&self, callback: TickCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn subscribe(&self, exchange: &str, code: &str) -> Result<()> {
        // The callback must be installed before the first subscription.
        if !self.has_callback() {
            bail!("subscribe issued before tick callback was installed");
        }
        self.subscriptions
            .lock()
            .push((exchange.to_string(), code.to_string()));
        Ok(())
    }

    fn get_series(&self, request: &SeriesRequest) -> Result<Vec<SeriesRow>> {
        self.series_calls.lock().push(request.clone());
        let qualified = format!("{}:{}", request.exchange, request.code);
        let failing = self.failing_codes.lock();
        if failing.contains(&request.code) || failing.contains(&qualified) {
            bail!("upstream rejected {qualified}");
        }
        drop(failing);
        let on_exchange = self
            .exchange_series
            .lock()
            .get(&(request.exchange.clone(), request.code.clone(), request.interval.clone()))
            .cloned();
        if let Some(rows) = on_exchange {
            return Ok(rows);
        }
        Ok(self
            .series
            .lock()
            .get(&(request.code.clone(), request.interval.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeBroker {
    pub fail_login: AtomicBool,
    pub fail_details: AtomicBool,
    pub logins: AtomicUsize,
    pub handles: Mutex<Vec<Arc<FakeHandle>>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last_handle(&self) -> Option<Arc<FakeHandle>> {
        self.handles.lock().last().cloned()
    }
}

impl BrokerGateway for FakeBroker {
    fn create_session(&self, _credentials: &Credentials) -> Result<Arc<dyn UpstreamHandle>> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.fail_login.load(Ordering::SeqCst) {
            bail!("invalid session token");
        }
        let handle = FakeHandle::new();
        handle
            .fail_details
            .store(self.fail_details.load(Ordering::SeqCst), Ordering::SeqCst);
        self.handles.lock().push(handle.clone());
        Ok(handle)
    }
}

/// Daily row helper: `day` is `YYYY-MM-DD`.
pub fn row(datetime: &str, close: f64, volume: f64) -> SeriesRow {
    SeriesRow {
        datetime: datetime.to_string(),
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume,
    }
}

pub fn credentials(token: &str) -> Credentials {
    Credentials {
        api_key: "key".into(),
        api_secret: "secret".into(),
        session_token: token.into(),
    }
}
