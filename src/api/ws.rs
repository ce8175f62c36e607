// =============================================================================
// WebSocket Handler — raw tick / candle feed
// =============================================================================
//
// Clients connect to `/ws/marketdata` and send one JSON frame:
//
//   {"session_token": "...", "symbol": "NIFTY", "exchange": "NSE", "interval": "1minute"}
//
// and then receive:
//   1. `subscription_status` once the upstream subscription is live.
//   2. `tick` for every routed tick and `ohlcv` for every candle change at
//      the requested interval.
//   3. `heartbeat` every 30 s.
//
// Problems are reported as `{"type":"error","message":...}` frames. The hub
// lease is held for the whole connection, so subscriber removal and candle
// untracking happen however the loop exits.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::stream::HubLease;
use crate::app_state::AppState;
use crate::error::{HubError, HubResult};
use crate::market_data::hub::{CandleUpdate, TickEvent};
use crate::market_data::HubMessage;
use crate::types::token_prefix;

const HEARTBEAT: Duration = Duration::from_secs(30);
/// How long a client may take to send its subscription frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle wait on the hub queue; feed subscribers ignore the fallback snapshot.
const FEED_IDLE: Duration = Duration::from_secs(30);

// =============================================================================
// Subscription frame
// =============================================================================

fn default_interval() -> String {
    "1minute".to_string()
}

#[derive(Debug, Deserialize)]
struct FeedRequest {
    #[serde(default)]
    session_token: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    exchange: Option<String>,
    #[serde(default = "default_interval")]
    interval: String,
}

fn parse_feed_request(text: &str) -> Result<FeedRequest, String> {
    let mut req: FeedRequest =
        serde_json::from_str(text).map_err(|e| format!("invalid subscription frame: {e}"))?;
    req.session_token = req.session_token.trim().to_string();
    req.symbol = req.symbol.trim().to_ascii_uppercase();
    if req.session_token.is_empty() || req.symbol.is_empty() {
        return Err("session_token and symbol are required".to_string());
    }
    Ok(req)
}

// =============================================================================
// WebSocket upgrade handler
// =============================================================================

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // ── Handshake ───────────────────────────────────────────────────────
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, receiver.next()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(Some(Ok(_))) => {
            let _ = send_json(&mut sender, &error_frame("expected a JSON subscription frame")).await;
            return;
        }
        Ok(_) => {
            debug!("WebSocket closed before subscribing");
            return;
        }
        Err(_) => {
            let _ = send_json(&mut sender, &error_frame("no subscription frame received")).await;
            return;
        }
    };
    let request = match parse_feed_request(&text) {
        Ok(r) => r,
        Err(msg) => {
            let _ = send_json(&mut sender, &error_frame(&msg)).await;
            return;
        }
    };

    let mut lease = match open_feed(&state, &request).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(symbol = %request.symbol, error = %e, "WebSocket feed rejected");
            let _ = send_json(&mut sender, &error_frame(&e.to_string())).await;
            return;
        }
    };
    info!(
        symbol = %request.symbol,
        interval = %request.interval,
        token = %token_prefix(&request.session_token),
        "WebSocket feed opened"
    );

    let status = json!({
        "type": "subscription_status",
        "status": "subscribed",
        "symbol": request.symbol,
        "exchange": request.exchange,
        "interval": request.interval,
    });
    if send_json(&mut sender, &status).await.is_err() {
        return;
    }

    // ── Feed loop ───────────────────────────────────────────────────────
    let mut heartbeat = interval(HEARTBEAT);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if send_json(&mut sender, &heartbeat_frame(Utc::now())).await.is_err() {
                    break;
                }
            }

            msg = lease.next(FEED_IDLE) => {
                let frame = match msg {
                    Some(HubMessage::Tick(tick)) => tick_frame(&tick),
                    Some(HubMessage::Candle(update)) => ohlcv_frame(&update),
                    Some(HubMessage::Snapshot(_)) => continue,
                    None => {
                        debug!("hub dropped the feed subscriber");
                        break;
                    }
                };
                if send_json(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => debug!("ignoring client frame after subscription"),
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    drop(lease);
    info!(symbol = %request.symbol, "WebSocket feed closed");
}

/// Register the feed, then bind the session's stream and subscribe.
async fn open_feed(state: &Arc<AppState>, request: &FeedRequest) -> HubResult<HubLease> {
    state.streaming_session(&request.session_token).await?;
    let mut lease = HubLease::feed(state.hub.clone(), &request.symbol, &request.interval);
    let live = lease
        .subscribe(std::slice::from_ref(&request.symbol), request.exchange.as_deref())
        .await?;
    if live.is_empty() {
        return Err(HubError::InvalidRequest(format!(
            "cannot subscribe to {}",
            request.symbol
        )));
    }
    Ok(lease)
}

// =============================================================================
// Frames
// =============================================================================

fn error_frame(message: &str) -> Value {
    json!({ "type": "error", "message": message })
}

fn heartbeat_frame(now: DateTime<Utc>) -> Value {
    json!({ "type": "heartbeat", "timestamp": now.to_rfc3339() })
}

fn tick_frame(tick: &TickEvent) -> Value {
    json!({
        "type": "tick",
        "symbol": tick.symbol,
        "price": tick.price,
        "volume": tick.volume,
        "datetime": tick.time.format("%Y-%m-%dT%H:%M:%S").to_string(),
    })
}

fn ohlcv_frame(update: &CandleUpdate) -> Value {
    let c = &update.candle;
    let datetime = DateTime::from_timestamp(c.time, 0)
        .map(|t| t.naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string());
    json!({
        "type": "ohlcv",
        "symbol": update.key.symbol,
        "interval": update.key.interval,
        "time": c.time,
        "datetime": datetime,
        "open": c.open,
        "high": c.high,
        "low": c.low,
        "close": c.close,
        "volume": c.volume,
        "closed": update.closed,
    })
}

async fn send_json<S>(sender: &mut S, frame: &Value) -> Result<(), axum::Error>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    sender.send(Message::Text(frame.to_string())).await
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::tests::test_state;
    use crate::broker::testing::{credentials, FakeBroker};
    use crate::market_data::{Candle, CandleKey};
    use crate::runtime_config::RuntimeConfig;
    use chrono::NaiveDate;

    #[test]
    fn feed_request_defaults_interval_and_normalises() {
        let req = parse_feed_request(r#"{"session_token":" tok ","symbol":"nifty"}"#).unwrap();
        assert_eq!(req.session_token, "tok");
        assert_eq!(req.symbol, "NIFTY");
        assert_eq!(req.interval, "1minute");
        assert_eq!(req.exchange, None);
    }

    #[test]
    fn feed_request_rejects_missing_fields() {
        assert!(parse_feed_request(r#"{"symbol":"NIFTY"}"#).is_err());
        assert!(parse_feed_request("not json").is_err());
    }

    #[test]
    fn frames_carry_their_type() {
        let time = NaiveDate::from_ymd_opt(2025, 3, 13)
            .unwrap()
            .and_hms_opt(10, 0, 5)
            .unwrap();
        let tick = tick_frame(&TickEvent {
            symbol: "NIFTY".into(),
            price: 22_500.0,
            volume: 10.0,
            time,
        });
        assert_eq!(tick["type"], "tick");
        assert_eq!(tick["datetime"], "2025-03-13T10:00:05");

        let candle = ohlcv_frame(&CandleUpdate {
            key: CandleKey::new("NIFTY", "1minute"),
            candle: Candle {
                time: 60,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 3.0,
                updated_at: 61,
            },
            closed: true,
        });
        assert_eq!(candle["type"], "ohlcv");
        assert_eq!(candle["datetime"], "1970-01-01T00:01:00");
        assert_eq!(candle["closed"], true);

        assert_eq!(heartbeat_frame(Utc::now())["type"], "heartbeat");
        assert_eq!(error_frame("boom")["message"], "boom");
    }

    #[tokio::test]
    async fn open_feed_subscribes_upstream() {
        let broker = FakeBroker::new();
        let state = test_state(broker.clone(), RuntimeConfig::default());
        state.sessions.create(credentials("tok-1")).await.unwrap();

        let req = parse_feed_request(r#"{"session_token":"tok-1","symbol":"BANKNIFTY","interval":"5minute"}"#).unwrap();
        let lease = open_feed(&state, &req).await.unwrap();

        let handle = broker.last_handle().unwrap();
        assert_eq!(
            handle.subscriptions.lock().as_slice(),
            &[("NSE".to_string(), "CNXBAN".to_string())]
        );
        assert_eq!(state.hub.subscriber_count(), 1);
        drop(lease);
        assert_eq!(state.hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn open_feed_rejects_unknown_session() {
        let state = test_state(FakeBroker::new(), RuntimeConfig::default());
        let req = parse_feed_request(r#"{"session_token":"ghost","symbol":"NIFTY"}"#).unwrap();
        assert!(matches!(open_feed(&state, &req).await, Err(HubError::Auth)));
        assert_eq!(state.hub.subscriber_count(), 0);
    }
}
