// =============================================================================
// Error taxonomy
// =============================================================================
//
// Only failures a caller can act on are represented here. Missing market data
// travels as `Option::None`, malformed ticks are dropped at the decoder, and
// upstream quota pressure is an internal delay inside the gate.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HubError {
    /// Session token absent or expired.
    #[error("invalid or expired session token")]
    Auth,

    /// The broker could not be reached or rejected the call.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Startup data or settings are unusable (e.g. an implausible holiday set).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The client sent something we cannot act on.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HubError {
    /// Wrap an upstream failure, keeping the full `anyhow` context chain.
    pub fn upstream(err: anyhow::Error) -> Self {
        Self::UpstreamUnavailable(format!("{err:#}"))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "error",
            "detail": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

pub type HubResult<T> = Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(HubError::Auth.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            HubError::UpstreamUnavailable("down".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            HubError::InvalidRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn upstream_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("GET /historicalcharts failed");
        let msg = HubError::upstream(err).to_string();
        assert!(msg.contains("GET /historicalcharts failed"));
        assert!(msg.contains("connection refused"));
    }
}
