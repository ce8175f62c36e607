// =============================================================================
// Market Pulse — Main Entry Point
// =============================================================================
//
// Broker-backed market-data service: session handling, a shared live quote
// hub with candle aggregation, the index board and a daily screener, served
// over REST, SSE and WebSocket.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod calendar;
mod error;
mod indicators;
mod indices;
mod market_data;
mod rate_limit;
mod runtime_config;
mod screener;
mod session;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::client::RestBroker;
use crate::calendar::{load_holidays, TradingCalendar};
use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Market Pulse starting up");

    let config_path =
        std::env::var("MARKET_PULSE_CONFIG").unwrap_or_else(|_| "market_pulse.json".into());
    let config = RuntimeConfig::resolve(&config_path)?;

    // ── 2. Calendar ──────────────────────────────────────────────────────
    let calendar = TradingCalendar::new(
        load_holidays(&config.holidays_path),
        config.market_open()?,
        config.market_close()?,
        config.utc_offset()?,
    );
    info!(
        holidays = calendar.holiday_count(),
        open = %calendar.open_time(),
        close = %calendar.close_time(),
        "trading calendar ready"
    );

    // ── 3. Broker client & shared state ──────────────────────────────────
    let broker = Arc::new(
        RestBroker::new(
            config.broker_base_url.clone(),
            config.broker_stream_url.clone(),
            tokio::runtime::Handle::current(),
        )
        .context("failed to build broker client")?,
    );
    let state = Arc::new(AppState::new(config, calendar, broker));

    // ── 4. Tick consumer ─────────────────────────────────────────────────
    if state.hub.spawn_consumer().is_none() {
        warn!("tick consumer already running");
    }

    // ── 5. Housekeeping: idle limiter keys and expired sessions ──────────
    let sweep_state = state.clone();
    let sweep_every = std::time::Duration::from_secs(state.config.sweep_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            let now = std::time::Instant::now();
            let evicted = sweep_state.client_limiter.sweep_idle_at(now)
                + sweep_state.gate.limiter().sweep_idle_at(now);
            let expired = sweep_state.expire_sessions().await;
            if evicted > 0 || expired > 0 {
                info!(evicted, expired, "housekeeping sweep");
            }
        }
    });

    // ── 6. Screener schedule ─────────────────────────────────────────────
    tokio::spawn(screener::schedule::run_schedule(
        state.screener.clone(),
        state.sessions.clone(),
        state.calendar.clone(),
        chrono::Duration::minutes(state.config.screener_delay_minutes),
    ));

    // ── 7. API server ────────────────────────────────────────────────────
    let bind_addr = state.config.bind_addr.clone();
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        warn!("shutdown signal received; stopping");
    })
    .await
    .context("API server failed")?;

    info!("Market Pulse shut down complete.");
    Ok(())
}
