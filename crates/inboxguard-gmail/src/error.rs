//! Provider error types.
//!
//! Every Gmail call surfaces errors through [`ProviderError`]. The retry
//! handler decides what to do with a failure by asking
//! [`ProviderError::is_retryable`], never by inspecting strings.

use std::time::Duration;

use inboxguard_auth::AuthError;

use crate::traits::ProviderState;

/// Unified error type for the Gmail provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// No access token could be obtained for the account.
    #[error("authentication error: {0}")]
    Authentication(#[from] AuthError),

    /// The API rejected the token or the account lacks permission (401/403).
    #[error("unauthorized (HTTP {status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// HTTP 429, or a 403 whose reason is a rate limit.
    #[error("rate limited{}", .retry_after.map(|d| format!(", retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx.
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Any other non-success status.
    #[error("api error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("message not found: {id}")]
    NotFound { id: String },

    /// Transport failure talking to the API.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The batch endpoint answered with something we could not parse.
    #[error("malformed batch response: {reason}")]
    MalformedBatch { reason: String },

    /// The operation is not allowed in the provider's current state.
    #[error("cannot {operation} while provider is {state}")]
    InvalidState {
        state: ProviderState,
        operation: &'static str,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl ProviderError {
    /// Whether trying the same call again later may succeed.
    ///
    /// Throttling, server errors and transport failures are transient.
    /// 401/403 and other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Server { .. } => true,
            Self::Network(e) => !e.is_builder() && !e.is_decode(),
            Self::Authentication(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the user must reconnect the account before calls can work.
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            Self::Authentication(e) => e.requires_reauthentication(),
            Self::Unauthorized { .. } => true,
            _ => false,
        }
    }

    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Message suitable for display in the application UI.
    pub fn user_message(&self) -> &'static str {
        if self.requires_reauthentication() {
            return "Please re-connect this provider.";
        }
        match self {
            Self::Authentication(e) => e.user_message(),
            _ if self.is_retryable() => {
                "Gmail is busy or unreachable. InboxGuard will retry automatically; try again later if this persists."
            }
            Self::InvalidConfig { .. } => "InboxGuard is not configured for Gmail.",
            Self::NotFound { .. } => "The message no longer exists.",
            _ => "Gmail returned an unexpected response. Please try again.",
        }
    }

    /// Map a non-success HTTP status to the matching variant.
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        let message = api_error_message(body);
        match status {
            429 => Self::RateLimited { retry_after },
            403 if is_rate_limit_reason(body) => Self::RateLimited { retry_after },
            401 | 403 => Self::Unauthorized { status, message },
            s if s >= 500 => Self::Server { status, message },
            _ => Self::Api { status, message },
        }
    }
}

/// Pull `error.message` out of a Google API error body, falling back to the
/// raw (truncated) body.
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.chars().take(256).collect())
}

/// Google reports per-user quota exhaustion as 403 with one of these reasons.
fn is_rate_limit_reason(body: &str) -> bool {
    let Ok(v) = serde_json::from_str::<serde_json::Value>(body) else {
        return false;
    };
    v.pointer("/error/errors")
        .and_then(|e| e.as_array())
        .is_some_and(|errors| {
            errors.iter().any(|e| {
                matches!(
                    e.get("reason").and_then(|r| r.as_str()),
                    Some("rateLimitExceeded" | "userRateLimitExceeded")
                )
            })
        })
}

/// Convenience alias used throughout the provider crate.
pub type Result<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(ProviderError::from_status(429, None, "").is_retryable());
        assert!(ProviderError::from_status(500, None, "").is_retryable());
        assert!(ProviderError::from_status(503, None, "").is_retryable());
        assert!(!ProviderError::from_status(401, None, "").is_retryable());
        assert!(!ProviderError::from_status(403, None, "").is_retryable());
        assert!(!ProviderError::from_status(400, None, "").is_retryable());
        assert!(ProviderError::from_status(401, None, "").requires_reauthentication());
    }

    #[test]
    fn user_rate_limit_403_is_throttling() {
        let body = r#"{"error":{"code":403,"message":"User-rate limit exceeded","errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        let err = ProviderError::from_status(403, Some(Duration::from_secs(7)), body);
        assert!(matches!(err, ProviderError::RateLimited { .. }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.to_string(), "rate limited, retry after 7s");
    }

    #[test]
    fn api_message_is_extracted() {
        let body = r#"{"error":{"code":400,"message":"Invalid id value"}}"#;
        let err = ProviderError::from_status(400, None, body);
        assert_eq!(err.to_string(), "api error (HTTP 400): Invalid id value");
    }

    #[test]
    fn auth_errors_ask_for_reconnect() {
        let err = ProviderError::from(AuthError::InvalidGrant {
            reason: "revoked".into(),
        });
        assert!(err.requires_reauthentication());
        assert_eq!(err.user_message(), "Please re-connect this provider.");
    }
}
