// =============================================================================
// Upstream Gate — quota-aware offload of blocking broker calls
// =============================================================================
//
// `call` charges the shared upstream window (waiting for a reserved slot when
// it is full) and then runs the closure on the blocking pool. `offload` skips
// the quota and is used for stream control (connect, subscribe, disconnect).
//
// The number of broker calls in flight is bounded by a semaphore so a burst of
// screener work cannot exhaust the blocking pool.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::error::{HubError, HubResult};
use crate::rate_limit::{SlidingWindowLimiter, UPSTREAM_KEY};

pub struct UpstreamGate {
    limiter: SlidingWindowLimiter,
    workers: Arc<Semaphore>,
}

impl UpstreamGate {
    pub fn new(capacity: usize, window: Duration, workers: usize) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new("upstream", capacity, window),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    /// Rate-limited blocking call. Delays when over quota, never rejects.
    pub async fn call<F, T>(&self, f: F) -> HubResult<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.limiter.acquire(UPSTREAM_KEY).await;
        self.offload(f).await
    }

    /// Blocking call on the worker pool without charging the quota.
    pub async fn offload<F, T>(&self, f: F) -> HubResult<T>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| HubError::UpstreamUnavailable("worker pool closed".into()))?;

        match tokio::task::spawn_blocking(f).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let err = HubError::upstream(e);
                warn!(error = %err, "upstream call failed");
                Err(err)
            }
            Err(join) => {
                error!(error = %join, "upstream worker panicked or was cancelled");
                Err(HubError::UpstreamUnavailable(join.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for UpstreamGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamGate")
            .field("limiter", &self.limiter)
            .field("idle_workers", &self.workers.available_permits())
            .finish()
    }
}
