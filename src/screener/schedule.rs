// =============================================================================
// Screener schedule — one run per trading day, after the close
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use super::engine::ScreenerEngine;
use crate::calendar::TradingCalendar;
use crate::error::HubResult;
use crate::session::SessionStore;

/// Next instant the screener should run: close cutoff + `delay` today if
/// today trades and that moment is still ahead, otherwise on the next
/// trading day.
pub fn next_run(calendar: &TradingCalendar, now: DateTime<Utc>, delay: Duration) -> HubResult<DateTime<Utc>> {
    let local = calendar.to_local(now);
    let today = local.date();
    let today_run = today.and_time(calendar.close_time()) + delay;
    if !calendar.is_closed(today) && local < today_run {
        return Ok(calendar.to_utc(today_run));
    }
    let next_day = calendar.next_trading_day(today)?;
    Ok(calendar.to_utc(next_day.and_time(calendar.close_time()) + delay))
}

/// Sleep until each scheduled run and execute it against the newest live
/// session's broker connection. Never returns.
pub async fn run_schedule(
    engine: Arc<ScreenerEngine>,
    sessions: Arc<SessionStore>,
    calendar: Arc<TradingCalendar>,
    delay: Duration,
) {
    loop {
        let now = Utc::now();
        let at = match next_run(&calendar, now, delay) {
            Ok(at) => at,
            Err(e) => {
                error!(error = %e, "cannot compute next screener run; retrying in an hour");
                tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
                continue;
            }
        };
        info!(next_run = %at, "screener run scheduled");
        tokio::time::sleep((at - now).to_std().unwrap_or_default()).await;

        let Some(session) = sessions.newest() else {
            warn!("no live session to borrow a broker connection from; screener run skipped");
            continue;
        };
        if let Err(e) = engine.run(session.upstream, Utc::now()).await {
            warn!(error = %e, "scheduled screener run failed");
        }
    }
}
