//! Shared HTTP plumbing for provider adapters: error mapping, credential
//! resolution, and cancellation-aware request dispatch.

use std::time::Duration;

use chorus_domain::cancel::CancellationToken;
use chorus_domain::config::LlmConfig;
use chorus_domain::error::{LlmError, Result};

/// Convert a [`reqwest::Error`] into the domain error type.
///
/// Timeout errors map to `Timeout`; everything else is transport-level.
pub(crate) fn from_reqwest(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout(e.to_string())
    } else {
        LlmError::Http(e.to_string())
    }
}

/// Map a non-success HTTP status to the error taxonomy.
///
/// 401/403 → Auth; 429 → RateLimit (with retry-after when parseable);
/// 400/404/422 and other 4xx → InvalidRequest; everything else → Provider.
pub(crate) fn map_status(
    provider_id: &str,
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    let message = error_body_message(body);
    match status {
        401 | 403 => LlmError::Auth(format!("{provider_id}: HTTP {status} - {message}")),
        429 => LlmError::RateLimit { retry_after },
        400..=499 => {
            LlmError::InvalidRequest(format!("{provider_id}: HTTP {status} - {message}"))
        }
        _ => LlmError::Provider {
            provider: provider_id.to_string(),
            message: format!("HTTP {status} - {message}"),
        },
    }
}

/// Parse a `retry-after` header value: either delta-seconds or an HTTP-date.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.signed_duration_since(chrono::Utc::now());
    delta.to_std().ok()
}

/// Pull a human-readable message out of a provider error body.
///
/// Tries the common `{"error": {"message": ...}}` and `{"error": "..."}`
/// shapes, then `{"message": ...}`, then falls back to the truncated raw body.
pub(crate) fn error_body_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = v
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = v.get("error").and_then(|e| e.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = v.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
    }
    truncate(body.trim(), 300)
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &s[..cut])
}

/// Resolve the API key: explicit config value first, then the provider's
/// conventional environment variable.
pub(crate) fn resolve_api_key(
    config: &LlmConfig,
    env_var: &str,
    provider_id: &str,
) -> Result<String> {
    if let Some(ref key) = config.api_key {
        return Ok(key.clone());
    }
    std::env::var(env_var).map_err(|_| {
        LlmError::Auth(format!(
            "no API key for '{provider_id}': set one on the builder or export {env_var}"
        ))
    })
}

/// Dispatch a request with cancellation: the in-flight future is dropped
/// (aborting the connection) when the token fires. Non-success statuses are
/// mapped to the error taxonomy with the body consumed for the message.
pub(crate) async fn send_checked(
    provider_id: &str,
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<reqwest::Response> {
    cancel.check()?;

    let response = tokio::select! {
        r = request.send() => r.map_err(from_reqwest)?,
        _ = cancel.cancelled() => return Err(cancel.as_error()),
    };

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(response.headers());
    let body = tokio::select! {
        b = response.text() => b.unwrap_or_default(),
        _ = cancel.cancelled() => return Err(cancel.as_error()),
    };
    Err(map_status(provider_id, status.as_u16(), retry_after, &body))
}

/// `send_checked` + parse the body as JSON.
pub(crate) async fn send_json(
    provider_id: &str,
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<serde_json::Value> {
    let response = send_checked(provider_id, request, cancel).await?;
    let body = tokio::select! {
        b = response.text() => b.map_err(from_reqwest)?,
        _ = cancel.cancelled() => return Err(cancel.as_error()),
    };
    serde_json::from_str(&body).map_err(|e| {
        LlmError::ResponseFormat(format!("{provider_id}: response is not valid JSON: {e}"))
    })
}
