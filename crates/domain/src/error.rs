//! Shared error type and warning codes used across all chorus crates.

use std::time::Duration;

/// Shared error type used across all chorus crates.
///
/// Variants are error *kinds*: every provider adapter maps its wire-level
/// failures onto these so callers can match on behavior, not on vendor.
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    /// Missing or invalid credentials (HTTP 401/403).
    #[error("auth: {0}")]
    Auth(String),

    /// Unusable request or configuration (HTTP 400/404/422, bad config,
    /// schema violations at request build time).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// HTTP 429. Carries the server's retry-after hint when present.
    #[error("rate limited{}", retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimit { retry_after: Option<Duration> },

    /// Provider-side failure: 5xx, "overloaded", or a provider-reported error.
    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Local deadline exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Caller-initiated cancellation.
    #[error("cancelled{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled { reason: Option<String> },

    /// Malformed JSON, schema validation failure, or an unexpected stream shape.
    #[error("response format: {0}")]
    ResponseFormat(String),

    /// The builder requested a capability the resolved provider lacks.
    #[error("unsupported capability: {0}")]
    UnsupportedCapability(String),

    /// Transport-level failure not mapped above (DNS, TLS, connection).
    #[error("http: {0}")]
    Http(String),

    /// JSON (de)serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// Fallback.
    #[error("{0}")]
    Generic(String),
}

impl LlmError {
    /// A cancellation error carrying the token's reason, if any.
    pub fn cancelled(reason: Option<String>) -> Self {
        Self::Cancelled { reason }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Warnings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A non-fatal degradation attached to a response.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Warning {
    /// Stable machine-readable code (see the `codes` module).
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
}

impl Warning {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Stable warning codes.
pub mod codes {
    /// A content part could not be represented on the wire and was replaced
    /// with a textual placeholder.
    pub const UNSUPPORTED_PART: &str = "UNSUPPORTED_PART";
    /// The tool loop hit its iteration bound while the model still wanted
    /// tools; the last assistant message was returned as final.
    pub const TOOL_LOOP_MAX_ITERATIONS: &str = "TOOL_LOOP_MAX_ITERATIONS";
    /// A tool executor exceeded its per-call timeout.
    pub const TOOL_TIMEOUT: &str = "TOOL_TIMEOUT";
}
