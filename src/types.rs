// =============================================================================
// Shared types used across the market-pulse service
// =============================================================================

use serde::{Deserialize, Serialize};

/// Broker credentials supplied at login.
///
/// The secret and session token are never logged; see the `Debug` impl.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub session_token: String,
}

impl Credentials {
    /// Trim every field and reject empty ones.
    pub fn normalized(self) -> Option<Self> {
        let api_key = self.api_key.trim().to_string();
        let api_secret = self.api_secret.trim().to_string();
        let session_token = self.session_token.trim().to_string();
        if api_key.is_empty() || api_secret.is_empty() || session_token.is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            api_secret,
            session_token,
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &token_prefix(&self.api_key))
            .field("api_secret", &"<redacted>")
            .field("session_token", &token_prefix(&self.session_token))
            .finish()
    }
}

/// First eight characters of a token followed by an ellipsis, for logs.
pub fn token_prefix(token: &str) -> String {
    if token.chars().count() > 8 {
        let head: String = token.chars().take(8).collect();
        format!("{head}...")
    } else {
        token.to_string()
    }
}

/// Identifier the broker needs to address an instrument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpstreamId {
    pub exchange: String,
    pub code: String,
}

impl std::fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.code)
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Absolute and percent change between two closes.
///
/// Both are `None` when either close is missing; the percent is `None` when
/// the previous close is zero.
pub fn price_change(previous: Option<f64>, current: Option<f64>) -> (Option<f64>, Option<f64>) {
    match (previous, current) {
        (Some(prev), Some(curr)) => {
            let change = round2(curr - prev);
            let percent = if prev != 0.0 {
                Some(round2(change / prev * 100.0))
            } else {
                None
            };
            (Some(change), percent)
        }
        _ => (None, None),
    }
}
