// =============================================================================
// Sliding-Window Rate Limiter
// =============================================================================
//
// One instance guards inbound clients (keyed by IP, over-limit requests are
// rejected) and another guards the broker quota (a single fixed key, over-limit
// calls are delayed, never rejected).
//
// Each key owns a queue of admission timestamps. Every check first prunes
// timestamps older than the window from the front, so the queue is always
// ordered oldest-first and never longer than `capacity`.
//
// Waiting callers take turns: `acquire` holds an async lock across
// compute-wait, sleep and re-check, so concurrent callers queue behind each
// other instead of all waking on the same expiry. Nothing is ever recorded
// without a free slot.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// Floor for a computed wait so that a caller never spins on a zero sleep.
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Key used for the broker quota window.
pub const UPSTREAM_KEY: &str = "upstream";

/// Thread-safe sliding-window limiter keyed by an arbitrary string.
pub struct SlidingWindowLimiter {
    name: &'static str,
    capacity: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    /// Held by the caller currently waiting in [`acquire`](Self::acquire).
    turn: tokio::sync::Mutex<()>,
}

/// Serialisable view of a limiter for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub name: &'static str,
    pub capacity: usize,
    pub window_secs: u64,
    pub tracked_keys: usize,
}

impl SlidingWindowLimiter {
    pub fn new(name: &'static str, capacity: usize, window: Duration) -> Self {
        Self {
            name,
            capacity,
            window,
            windows: Mutex::new(HashMap::new()),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Admit `key` now if it is under capacity.
    pub fn admit(&self, key: &str) -> bool {
        self.admit_at(key, Instant::now())
    }

    /// Admit `key` at `now`: prune, then record `now` and return `true` iff
    /// the remaining count is below capacity. Rejections record nothing.
    pub fn admit_at(&self, key: &str, now: Instant) -> bool {
        self.admit_or_wait_at(key, now).is_none()
    }

    /// Like [`admit_at`](Self::admit_at) but, when over capacity, returns how
    /// long the caller must wait before the oldest timestamp ages out.
    ///
    /// `None` means the call was admitted and recorded.
    pub fn admit_or_wait_at(&self, key: &str, now: Instant) -> Option<Duration> {
        let mut map = self.windows.lock();
        let queue = map.entry(key.to_string()).or_default();
        prune(queue, now, self.window);

        if queue.len() < self.capacity {
            queue.push_back(now);
            return None;
        }

        let oldest = queue.front().copied().unwrap_or(now);
        Some(wait_duration(oldest, now, self.window))
    }

    /// Wait-then-proceed admission for the upstream quota. Never rejects.
    ///
    /// Callers are served one at a time; each sleeps until the oldest
    /// timestamp ages out and re-checks before recording. Returns the time
    /// this caller spent sleeping (zero when admitted immediately).
    pub async fn acquire(&self, key: &str) -> Duration {
        let _turn = self.turn.lock().await;
        let mut waited = Duration::ZERO;
        loop {
            let now = tokio::time::Instant::now().into_std();
            let Some(wait) = self.admit_or_wait_at(key, now) else {
                return waited;
            };
            info!(
                limiter = self.name,
                wait_ms = wait.as_millis() as u64,
                "rate limit reached; delaying call"
            );
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    // -------------------------------------------------------------------------
    // Housekeeping
    // -------------------------------------------------------------------------

    /// Number of timestamps currently held for `key` (after pruning at `now`).
    pub fn in_window(&self, key: &str, now: Instant) -> usize {
        let mut map = self.windows.lock();
        match map.get_mut(key) {
            Some(queue) => {
                prune(queue, now, self.window);
                queue.len()
            }
            None => 0,
        }
    }

    /// Drop every key whose window is empty at `now`. Returns how many keys
    /// were evicted.
    pub fn sweep_idle_at(&self, now: Instant) -> usize {
        let mut map = self.windows.lock();
        let before = map.len();
        map.retain(|_, queue| {
            prune(queue, now, self.window);
            !queue.is_empty()
        });
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(limiter = self.name, evicted, "evicted idle rate-limit keys");
        }
        evicted
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            name: self.name,
            capacity: self.capacity,
            window_secs: self.window.as_secs(),
            tracked_keys: self.windows.lock().len(),
        }
    }
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("window", &self.window)
            .finish()
    }
}

/// Remove timestamps that have aged out of the window, oldest first.
fn prune(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = queue.front() {
        if now.saturating_duration_since(front) >= window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

/// Time until `oldest` leaves the window, clamped to `[MIN_WAIT, window]`.
pub fn wait_duration(oldest: Instant, now: Instant, window: Duration) -> Duration {
    let elapsed = now.saturating_duration_since(oldest);
    window
        .saturating_sub(elapsed)
        .max(MIN_WAIT)
        .min(window.max(MIN_WAIT))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn rejects_after_capacity_then_recovers() {
        let limiter = SlidingWindowLimiter::new("test", 2, secs(60));
        let t0 = Instant::now();

        assert!(limiter.admit_at("1.2.3.4", t0));
        assert!(limiter.admit_at("1.2.3.4", t0 + secs(1)));
        assert!(!limiter.admit_at("1.2.3.4", t0 + secs(2)));
        assert!(limiter.admit_at("1.2.3.4", t0 + secs(61)));
    }

    #[test]
    fn rejection_records_nothing() {
        let limiter = SlidingWindowLimiter::new("test", 1, secs(10));
        let t0 = Instant::now();
        assert!(limiter.admit_at("k", t0));
        for i in 1..5 {
            assert!(!limiter.admit_at("k", t0 + secs(i)));
        }
        assert_eq!(limiter.in_window("k", t0 + secs(5)), 1);
        // Only the first admission has to age out.
        assert!(limiter.admit_at("k", t0 + secs(10)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = SlidingWindowLimiter::new("test", 1, secs(60));
        let t0 = Instant::now();
        assert!(limiter.admit_at("a", t0));
        assert!(limiter.admit_at("b", t0));
        assert!(!limiter.admit_at("a", t0));
    }

    #[test]
    fn wait_is_time_until_oldest_expires() {
        let limiter = SlidingWindowLimiter::new("test", 2, secs(60));
        let t0 = Instant::now();
        assert!(limiter.admit_or_wait_at(UPSTREAM_KEY, t0).is_none());
        assert!(limiter.admit_or_wait_at(UPSTREAM_KEY, t0 + secs(5)).is_none());
        let wait = limiter.admit_or_wait_at(UPSTREAM_KEY, t0 + secs(20)).unwrap();
        assert_eq!(wait, secs(40));
    }

    #[test]
    fn wait_is_clamped_to_minimum() {
        let t0 = Instant::now();
        let wait = wait_duration(t0, t0 + secs(60), secs(60));
        assert_eq!(wait, MIN_WAIT);
    }

    #[test]
    fn sweep_evicts_idle_keys_only() {
        let limiter = SlidingWindowLimiter::new("test", 5, secs(10));
        let t0 = Instant::now();
        limiter.admit_at("old", t0);
        limiter.admit_at("fresh", t0 + secs(8));
        assert_eq!(limiter.sweep_idle_at(t0 + secs(12)), 1);
        assert_eq!(limiter.snapshot().tracked_keys, 1);
        assert_eq!(limiter.in_window("fresh", t0 + secs(12)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_once_and_proceeds() {
        let limiter = SlidingWindowLimiter::new("upstream", 1, secs(60));
        assert_eq!(limiter.acquire(UPSTREAM_KEY).await, Duration::ZERO);

        let started = tokio::time::Instant::now();
        let waited = limiter.acquire(UPSTREAM_KEY).await;
        assert_eq!(waited, secs(60));
        assert!(started.elapsed() >= secs(60));
        assert_eq!(
            limiter.in_window(UPSTREAM_KEY, tokio::time::Instant::now().into_std()),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_never_overrun_a_window() {
        let limiter = SlidingWindowLimiter::new("upstream", 2, secs(60));
        let start = tokio::time::Instant::now();
        limiter.acquire(UPSTREAM_KEY).await;
        limiter.acquire(UPSTREAM_KEY).await;

        let limiter = &limiter;
        let waiters = (0..6).map(|_| async move {
            limiter.acquire(UPSTREAM_KEY).await;
            tokio::time::Instant::now()
        });
        let mut admitted = futures_util::future::join_all(waiters).await;
        admitted.sort();

        let offsets: Vec<u64> = admitted.iter().map(|t| (*t - start).as_secs()).collect();
        assert_eq!(offsets, vec![60, 60, 120, 120, 180, 180]);

        let mut calls = vec![start, start];
        calls.extend(admitted);
        for pair in calls.windows(3) {
            assert!(pair[2] - pair[0] >= secs(60), "three calls inside one window");
        }
        assert_eq!(
            limiter.in_window(UPSTREAM_KEY, tokio::time::Instant::now().into_std()),
            2
        );
    }
}
