// =============================================================================
// Broker REST + Stream Client — HMAC-SHA256 checksummed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Every authenticated
// request carries X-AppKey, X-SessionToken, X-Timestamp and an X-Checksum
// header holding HMAC-SHA256(secret, timestamp + body).
//
// The client is synchronous on purpose: it is only ever called from the
// upstream gate's worker pool. The tick stream runs as two tasks on the
// service runtime (socket reader and frame writer); the reader hands every
// decoded JSON tick to the installed callback.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use sha2::Sha256;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, instrument, warn};

use super::{BrokerGateway, SeriesRequest, SeriesRow, TickCallback, UpstreamHandle};
use crate::types::{token_prefix, Credentials};

type HmacSha256 = Hmac<Sha256>;

/// Per-request timeout for REST calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Gateway
// =============================================================================

/// Opens broker sessions against a REST base URL and a tick-stream URL.
pub struct RestBroker {
    base_url: String,
    stream_url: String,
    runtime: tokio::runtime::Handle,
    client: Client,
}

impl RestBroker {
    /// `runtime` is the service runtime; stream tasks are spawned onto it.
    pub fn new(
        base_url: impl Into<String>,
        stream_url: impl Into<String>,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build broker HTTP client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "RestBroker initialised");
        Ok(Self {
            base_url,
            stream_url: stream_url.into(),
            runtime,
            client,
        })
    }
}

impl BrokerGateway for RestBroker {
    #[instrument(skip_all, name = "broker::create_session")]
    fn create_session(&self, credentials: &Credentials) -> Result<Arc<dyn UpstreamHandle>> {
        let session = BrokerSession {
            api_key: credentials.api_key.clone(),
            secret: credentials.api_secret.clone(),
            session_token: credentials.session_token.clone(),
            base_url: self.base_url.clone(),
            stream_url: self.stream_url.clone(),
            runtime: self.runtime.clone(),
            client: self.client.clone(),
            stream: Mutex::new(None),
            callback: Arc::new(Mutex::new(None)),
        };

        // The handshake is the customer-details call: it fails on a bad token.
        session
            .customer_details()
            .context("session handshake failed")?;
        info!(
            api_key = %token_prefix(&credentials.api_key),
            "broker session established"
        );
        Ok(Arc::new(session))
    }
}

// =============================================================================
// Session handle
// =============================================================================

struct StreamTasks {
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// One authenticated broker session.
pub struct BrokerSession {
    api_key: String,
    secret: String,
    session_token: String,
    base_url: String,
    stream_url: String,
    runtime: tokio::runtime::Handle,
    client: Client,
    stream: Mutex<Option<StreamTasks>>,
    callback: Arc<Mutex<Option<TickCallback>>>,
}

impl BrokerSession {
    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex checksum of `timestamp + body`.
    fn checksum(&self, timestamp: &str, body: &str) -> String {
        sign(&self.secret, timestamp, body)
    }

    fn timestamp() -> String {
        chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S.000Z")
            .to_string()
    }

    /// GET with a JSON body, checksummed. Returns the `Success` payload.
    fn signed_get(
        &self,
        path: &str,
        query: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, path);
        let body_text = body.to_string();
        let ts = Self::timestamp();
        let checksum = self.checksum(&ts, &body_text);

        let resp = self
            .client
            .get(&url)
            .query(query)
            .header("Content-Type", "application/json")
            .header("X-Checksum", format!("token {checksum}"))
            .header("X-Timestamp", &ts)
            .header("X-AppKey", &self.api_key)
            .header("X-SessionToken", &self.session_token)
            .body(body_text)
            .send()
            .with_context(|| format!("GET /{path} request failed"))?;

        let status = resp.status();
        let payload: serde_json::Value = resp
            .json()
            .with_context(|| format!("failed to parse /{path} response"))?;

        if !status.is_success() {
            bail!("broker GET /{path} returned {status}: {payload}");
        }
        if let Some(err) = payload.get("Error").filter(|e| !e.is_null()) {
            bail!("broker GET /{path} reported error: {err}");
        }
        Ok(payload
            .get("Success")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.trim()
                .parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            bail!("expected string or number, got: {val}")
        }
    }

    fn parse_row(raw: &serde_json::Value) -> Result<SeriesRow> {
        Ok(SeriesRow {
            datetime: raw["datetime"]
                .as_str()
                .context("missing field datetime")?
                .to_string(),
            open: Self::parse_str_f64(&raw["open"]).context("field open")?,
            high: Self::parse_str_f64(&raw["high"]).context("field high")?,
            low: Self::parse_str_f64(&raw["low"]).context("field low")?,
            close: Self::parse_str_f64(&raw["close"]).context("field close")?,
            volume: Self::parse_str_f64(&raw["volume"]).unwrap_or(0.0),
        })
    }
}

impl UpstreamHandle for BrokerSession {
    #[instrument(skip(self), name = "broker::customer_details")]
    fn customer_details(&self) -> Result<serde_json::Value> {
        let body = serde_json::json!({
            "SessionToken": self.session_token,
            "AppKey": self.api_key,
        });
        self.signed_get("customerdetails", &[], &body)
    }

    #[instrument(skip(self), name = "broker::stream_connect")]
    fn stream_connect(&self) -> Result<()> {
        let mut slot = self.stream.lock();
        if slot.is_some() {
            return Ok(());
        }

        let url = format!("{}?token={}", self.stream_url, self.session_token);
        let (ws, _response) = self
            .runtime
            .block_on(connect_async(url.as_str()))
            .context("failed to connect to tick stream")?;
        info!(stream_url = %self.stream_url, "tick stream connected");

        let (mut write, mut read) = ws.split();
        let (outbound, mut frames) = mpsc::unbounded_channel::<String>();

        let writer = self.runtime.spawn(async move {
            while let Some(frame) = frames.recv().await {
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!(error = %e, "tick stream write failed");
                    break;
                }
            }
        });

        let callback = self.callback.clone();
        let reader = self.runtime.spawn(async move {
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let cb = callback.lock().clone();
                        let Some(cb) = cb else { continue };
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(serde_json::Value::Array(items)) => {
                                for tick in items {
                                    cb(tick);
                                }
                            }
                            Ok(tick) => cb(tick),
                            Err(e) => warn!(error = %e, "undecodable tick frame"),
                        }
                    }
                    // tungstenite answers pings itself.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "tick stream read error");
                        break;
                    }
                    None => {
                        warn!("tick stream ended");
                        break;
                    }
                }
            }
        });

        *slot = Some(StreamTasks {
            outbound,
            reader,
            writer,
        });
        Ok(())
    }

    #[instrument(skip(self), name = "broker::stream_disconnect")]
    fn stream_disconnect(&self) -> Result<()> {
        if let Some(tasks) = self.stream.lock().take() {
            drop(tasks.outbound);
            tasks.reader.abort();
            tasks.writer.abort();
            info!("tick stream disconnected");
        }
        Ok(())
    }

    fn set_tick_callback(&self, callback: TickCallback) {
        *self.callback.lock() = Some(callback);
    }

    #[instrument(skip(self), name = "broker::subscribe")]
    fn subscribe(&self, exchange: &str, code: &str) -> Result<()> {
        let slot = self.stream.lock();
        let tasks = slot.as_ref().context("tick stream is not connected")?;
        let frame = serde_json::json!({
            "action": "subscribe",
            "exchange_code": exchange,
            "stock_code": code,
        });
        tasks
            .outbound
            .send(frame.to_string())
            .context("tick stream writer has stopped")?;
        debug!(exchange, code, "subscription requested");
        Ok(())
    }

    #[instrument(skip(self), name = "broker::get_series")]
    fn get_series(&self, request: &SeriesRequest) -> Result<Vec<SeriesRow>> {
        let query = [
            ("interval", request.interval.as_str()),
            ("from_date", request.from.as_str()),
            ("to_date", request.to.as_str()),
            ("stock_code", request.code.as_str()),
            ("exch_code", request.exchange.as_str()),
            ("product_type", "cash"),
        ];
        let success = self.signed_get("historicalcharts", &query, &serde_json::json!({}))?;

        let raw = match success {
            serde_json::Value::Array(rows) => rows,
            serde_json::Value::Null => Vec::new(),
            other => bail!("historicalcharts payload is not an array: {other}"),
        };

        let mut rows = Vec::with_capacity(raw.len());
        for entry in &raw {
            match Self::parse_row(entry) {
                Ok(row) => rows.push(row),
                Err(e) => warn!(error = %e, "skipping malformed series row"),
            }
        }
        debug!(code = %request.code, interval = %request.interval, count = rows.len(), "series fetched");
        Ok(rows)
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        if let Some(tasks) = self.stream.get_mut().take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("streaming", &self.stream.lock().is_some())
            .finish()
    }
}

/// HMAC-SHA256 hex signature of `timestamp + body` keyed by `secret`.
fn sign(secret: &str, timestamp: &str, body: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(timestamp.as_bytes());
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
