// =============================================================================
// Central Application State — Market Pulse
// =============================================================================
//
// Ties the long-lived components together for the HTTP layer and the
// background loops. Every component owns its own interior locking; AppState
// only hands out Arc references.
//
// Ownership:
//   - `gate` is shared by sessions, hub, screener and index board so the
//     upstream quota is enforced across all of them.
//   - `hub` owns the single upstream streaming connection.
//   - `client_limiter` guards the HTTP surface per client address.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::{BrokerGateway, UpstreamGate};
use crate::calendar::TradingCalendar;
use crate::error::{HubError, HubResult};
use crate::indices::IndexBoard;
use crate::market_data::{QuoteHub, SymbolTable};
use crate::rate_limit::{RateLimitSnapshot, SlidingWindowLimiter};
use crate::runtime_config::RuntimeConfig;
use crate::screener::ScreenerEngine;
use crate::session::{Session, SessionStore};

pub struct AppState {
    pub config: RuntimeConfig,
    pub calendar: Arc<TradingCalendar>,
    pub gate: Arc<UpstreamGate>,
    pub sessions: Arc<SessionStore>,
    pub hub: Arc<QuoteHub>,
    pub screener: Arc<ScreenerEngine>,
    pub indices: IndexBoard,
    pub client_limiter: SlidingWindowLimiter,
    pub start_time: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub clients: RateLimitSnapshot,
    pub upstream: RateLimitSnapshot,
}

impl AppState {
    pub fn new(config: RuntimeConfig, calendar: TradingCalendar, gateway: Arc<dyn BrokerGateway>) -> Self {
        let calendar = Arc::new(calendar);
        let gate = Arc::new(UpstreamGate::new(
            config.broker_limit_requests,
            Duration::from_secs(config.broker_limit_window_secs),
            config.upstream_workers,
        ));
        let symbols = Arc::new(SymbolTable::with_indices());

        let sessions = Arc::new(SessionStore::new(gateway, gate.clone(), config.session_ttl()));
        let hub = Arc::new(QuoteHub::new(symbols.clone(), gate.clone(), config.hub_settings()));
        let screener = Arc::new(ScreenerEngine::new(
            symbols,
            gate.clone(),
            calendar.clone(),
            config.screener_universe.clone(),
            config.screener_concurrency,
        ));
        let indices = IndexBoard::new(hub.clone(), gate.clone(), calendar.clone());
        let client_limiter = SlidingWindowLimiter::new(
            "clients",
            config.rate_limit_requests,
            Duration::from_secs(config.rate_limit_window_secs),
        );

        Self {
            config,
            calendar,
            gate,
            sessions,
            hub,
            screener,
            indices,
            client_limiter,
            start_time: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Live session for `token`. Expired sessions are swept first, and on a
    /// miss any stream the token still owns is released, so an expired
    /// session never keeps streaming.
    pub async fn session(&self, token: &str) -> HubResult<Session> {
        self.session_at(token, Utc::now()).await
    }

    pub async fn session_at(&self, token: &str, now: DateTime<Utc>) -> HubResult<Session> {
        self.expire_sessions_at(now).await;
        match self.sessions.get_at(token, now) {
            Some(session) => Ok(session),
            None => {
                self.hub.release(token).await;
                Err(HubError::Auth)
            }
        }
    }

    /// Resolve `token` to a live session and make its broker connection the
    /// hub's active stream.
    pub async fn streaming_session(&self, token: &str) -> HubResult<Session> {
        let session = self.session(token).await?;
        self.hub.ensure_connected(&session).await?;
        Ok(session)
    }

    /// Sweep expired sessions and release the stream of any that owned it.
    /// Returns how many sessions expired.
    pub async fn expire_sessions(&self) -> usize {
        self.expire_sessions_at(Utc::now()).await
    }

    pub async fn expire_sessions_at(&self, now: DateTime<Utc>) -> usize {
        let expired = self.sessions.sweep_at(now);
        for token in &expired {
            self.hub.release(token).await;
        }
        expired.len()
    }

    /// Drop a session and, if it owned the stream, release it.
    pub async fn end_session(&self, token: &str) -> bool {
        let removed = self.sessions.remove(token);
        self.hub.release(token).await;
        removed
    }

    pub fn limiter_status(&self) -> LimiterStatus {
        LimiterStatus {
            clients: self.client_limiter.snapshot(),
            upstream: self.gate.limiter().snapshot(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
