// =============================================================================
// Session Store — broker sessions keyed by opaque token, each with a TTL
// =============================================================================
//
// Only map mutation happens under the lock. The broker handshake and the
// profile fetch are awaited before the lock is taken so a slow login never
// blocks unrelated lookups.
//
// A session is valid while `now < expires_at`; reads past that point evict it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::broker::{BrokerGateway, UpstreamGate, UpstreamHandle};
use crate::error::HubResult;
use crate::types::{token_prefix, Credentials};

/// One authenticated client session and its broker connection.
#[derive(Clone)]
pub struct Session {
    pub token: String,
    pub credentials: Credentials,
    pub upstream: Arc<dyn UpstreamHandle>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub profile: Option<serde_json::Value>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &token_prefix(&self.token))
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("has_profile", &self.profile.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub active_sessions: usize,
    pub session_expiry_hours: i64,
}

pub struct SessionStore {
    gateway: Arc<dyn BrokerGateway>,
    gate: Arc<UpstreamGate>,
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new(gateway: Arc<dyn BrokerGateway>, gate: Arc<UpstreamGate>, ttl: Duration) -> Self {
        Self {
            gateway,
            gate,
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Handshake with the broker and store a new session under the
    /// credentials' session token. Profile details are best-effort.
    pub async fn create(&self, credentials: Credentials) -> HubResult<Session> {
        let token = credentials.session_token.clone();
        info!(api_key = %token_prefix(&credentials.api_key), "creating session");

        let gateway = self.gateway.clone();
        let creds = credentials.clone();
        let upstream = self
            .gate
            .offload(move || gateway.create_session(&creds))
            .await?;

        let created_at = Utc::now();
        let expires_at = created_at + self.ttl;

        let handle = upstream.clone();
        let profile = match self.gate.call(move || handle.customer_details()).await {
            Ok(details) => Some(details),
            Err(e) => {
                warn!(error = %e, "profile fetch failed during login; continuing without it");
                None
            }
        };

        let session = Session {
            token: token.clone(),
            credentials,
            upstream,
            created_at,
            expires_at,
            profile,
        };
        self.sessions.lock().insert(token.clone(), session.clone());
        info!(token = %token_prefix(&token), expires_at = %expires_at, "session stored");
        Ok(session)
    }

    /// Look up a session, evicting expired entries first.
    pub fn get(&self, token: &str) -> Option<Session> {
        self.get_at(token, Utc::now())
    }

    pub fn get_at(&self, token: &str, now: DateTime<Utc>) -> Option<Session> {
        let mut map = self.sessions.lock();
        match map.get(token) {
            Some(s) if s.is_expired_at(now) => {
                map.remove(token);
                None
            }
            Some(s) => Some(s.clone()),
            None => None,
        }
    }

    pub fn remove(&self, token: &str) -> bool {
        let removed = self.sessions.lock().remove(token).is_some();
        if removed {
            info!(token = %token_prefix(token), "session removed");
        }
        removed
    }

    /// Remove every expired session. Returns the tokens that were dropped so
    /// the caller can release whatever they still hold upstream.
    pub fn sweep(&self) -> Vec<String> {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut map = self.sessions.lock();
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, s)| s.is_expired_at(now))
            .map(|(token, _)| token.clone())
            .collect();
        for token in &expired {
            map.remove(token);
        }
        if !expired.is_empty() {
            debug!(dropped = expired.len(), "expired sessions swept");
        }
        expired
    }

    /// Replace the cached profile of a live session.
    pub fn set_profile(&self, token: &str, profile: serde_json::Value) {
        if let Some(s) = self.sessions.lock().get_mut(token) {
            s.profile = Some(profile);
        }
    }

    /// Most recently created live session; background jobs borrow its
    /// broker connection.
    pub fn newest(&self) -> Option<Session> {
        let now = Utc::now();
        self.sessions
            .lock()
            .values()
            .filter(|s| !s.is_expired_at(now))
            .max_by_key(|s| s.created_at)
            .cloned()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            active_sessions: self.sessions.lock().len(),
            session_expiry_hours: self.ttl.num_hours(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::{credentials, FakeBroker};
    use crate::error::HubError;
    use std::sync::atomic::Ordering;

    fn store(broker: Arc<FakeBroker>, ttl: Duration) -> SessionStore {
        let gate = Arc::new(UpstreamGate::new(100, std::time::Duration::from_secs(60), 4));
        SessionStore::new(broker, gate, ttl)
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = store(FakeBroker::new(), Duration::hours(24));
        let created = store.create(credentials("tok-1")).await.unwrap();
        assert_eq!(created.expires_at - created.created_at, Duration::hours(24));
        assert!(created.profile.is_some());

        let found = store.get("tok-1").unwrap();
        assert_eq!(found.token, "tok-1");
        assert!(store.get("tok-2").is_none());
    }

    #[tokio::test]
    async fn zero_ttl_is_absent_on_next_get() {
        let store = store(FakeBroker::new(), Duration::zero());
        store.create(credentials("tok")).await.unwrap();
        assert!(store.get("tok").is_none());
        assert_eq!(store.summary().active_sessions, 0);
    }

    #[tokio::test]
    async fn expired_session_is_evicted_on_read() {
        let store = store(FakeBroker::new(), Duration::hours(1));
        let s = store.create(credentials("tok")).await.unwrap();
        assert!(store.get_at("tok", s.created_at + Duration::minutes(59)).is_some());
        assert!(store.get_at("tok", s.created_at + Duration::hours(2)).is_none());
        assert_eq!(store.summary().active_sessions, 0);
    }

    #[tokio::test]
    async fn failed_handshake_stores_nothing() {
        let broker = FakeBroker::new();
        broker.fail_login.store(true, Ordering::SeqCst);
        let store = store(broker, Duration::hours(1));
        let err = store.create(credentials("tok")).await.unwrap_err();
        assert!(matches!(err, HubError::UpstreamUnavailable(_)));
        assert!(store.get("tok").is_none());
    }

    #[tokio::test]
    async fn profile_failure_does_not_fail_login() {
        let broker = FakeBroker::new();
        broker.fail_details.store(true, Ordering::SeqCst);
        let store = store(broker, Duration::hours(1));
        let s = store.create(credentials("tok")).await.unwrap();
        assert!(s.profile.is_none());
        assert!(store.get("tok").is_some());
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let store = store(FakeBroker::new(), Duration::hours(1));
        let a = store.create(credentials("a")).await.unwrap();
        store.create(credentials("b")).await.unwrap();
        assert!(store.sweep_at(a.created_at + Duration::minutes(1)).is_empty());
        let mut swept = store.sweep_at(a.created_at + Duration::hours(3));
        swept.sort();
        assert_eq!(swept, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn removed_session_is_gone() {
        let store = store(FakeBroker::new(), Duration::hours(1));
        store.create(credentials("tok")).await.unwrap();
        assert!(store.get("tok").is_some());
        assert!(store.remove("tok"));
        assert!(store.get("tok").is_none());
        assert!(!store.remove("tok"));
    }
}
