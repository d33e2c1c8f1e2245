//! Error types for the auth crate.
//!
//! All OAuth and rotation operations surface errors through [`AuthError`].
//! Vault failures convert with `#[from]` so callers can still reach the
//! underlying [`VaultError`](inboxguard_vault::VaultError).

use inboxguard_vault::VaultError;

/// Unified error type for InboxGuard authentication.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No usable token: never signed in, expired without a refresh token,
    /// or the refresh token was rejected.
    #[error("authentication required for {provider}: {reason}")]
    AuthenticationRequired {
        /// The token prefix / provider that needs a sign-in.
        provider: String,
        /// Why the stored tokens cannot be used.
        reason: String,
    },

    /// The authorization server rejected a code or refresh grant.
    #[error("invalid grant: {reason}")]
    InvalidGrant {
        /// Explanation from the authorization server.
        reason: String,
    },

    /// The token or revocation endpoint answered with an unexpected status.
    #[error("token endpoint returned HTTP {status}: {body}")]
    TokenEndpoint {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },

    /// An HTTP request to the authorization server failed in transport.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// An error propagated from the vault.
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),

    /// Configuration is missing or malformed.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The interactive flow failed (state mismatch, user denied, ...).
    #[error("authentication flow failed: {reason}")]
    FlowFailed {
        /// Details about why the flow failed.
        reason: String,
    },

    /// The local callback server timed out waiting for the redirect.
    #[error("callback timed out after {timeout_secs} seconds")]
    CallbackTimeout {
        /// How many seconds we waited before giving up.
        timeout_secs: u64,
    },

    /// The user completed the flow but did not grant everything requested.
    #[error("scopes not granted: {}", .missing.join(" "))]
    ScopeNotGranted {
        /// Requested scopes absent from the grant.
        missing: Vec<String>,
    },

    /// Not a single stored token entry could be removed.
    #[error("token removal failed for {provider}: {reason}")]
    RevocationFailed {
        /// The token prefix being signed out.
        provider: String,
        /// Aggregated per-entry errors.
        reason: String,
    },

    /// Stored token metadata could not be parsed.
    #[error("corrupt token data for {key}: {reason}")]
    CorruptTokenData {
        /// Storage key of the unreadable field.
        key: String,
        /// Parse failure.
        reason: String,
    },

    /// JSON serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error (e.g. from the callback TCP listener).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl AuthError {
    pub(crate) fn auth_required(provider: &str, reason: impl Into<String>) -> Self {
        Self::AuthenticationRequired {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the operation may succeed if tried again later.
    ///
    /// Transport failures, throttling (429) and server errors (5xx) are
    /// transient; rejected grants and configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => !e.is_builder() && !e.is_decode(),
            Self::TokenEndpoint { status, .. } => *status == 429 || *status >= 500,
            Self::CallbackTimeout { .. } => true,
            Self::Vault(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the user must go through the interactive sign-in again.
    pub fn requires_reauthentication(&self) -> bool {
        match self {
            Self::AuthenticationRequired { .. }
            | Self::InvalidGrant { .. }
            | Self::ScopeNotGranted { .. }
            | Self::CorruptTokenData { .. } => true,
            Self::Vault(e) => e.requires_reauthentication(),
            _ => false,
        }
    }

    /// Message suitable for display in the application UI.
    pub fn user_message(&self) -> &'static str {
        if self.requires_reauthentication() {
            return "Please re-connect this provider.";
        }
        match self {
            Self::Vault(e) => e.user_message(),
            _ if self.is_retryable() => {
                "The provider could not be reached. InboxGuard will retry automatically; try again later if this persists."
            }
            Self::InvalidConfig { .. } => "InboxGuard is not configured for this provider.",
            _ => "Sign-in did not complete. Please try again.",
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AuthError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_auth_required() {
        let err = AuthError::auth_required("gmail", "no refresh token");
        assert_eq!(
            err.to_string(),
            "authentication required for gmail: no refresh token"
        );
    }

    #[test]
    fn error_display_callback_timeout() {
        let err = AuthError::CallbackTimeout { timeout_secs: 120 };
        assert_eq!(err.to_string(), "callback timed out after 120 seconds");
    }

    #[test]
    fn error_display_scope_not_granted() {
        let err = AuthError::ScopeNotGranted {
            missing: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "scopes not granted: a b");
    }

    #[test]
    fn throttling_and_server_errors_are_retryable() {
        for status in [429, 500, 503] {
            let err = AuthError::TokenEndpoint {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "{status}");
        }
        let err = AuthError::TokenEndpoint {
            status: 400,
            body: String::new(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn rejected_grants_need_reconnect() {
        let err = AuthError::InvalidGrant {
            reason: "Token has been expired or revoked.".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.requires_reauthentication());
        assert_eq!(err.user_message(), "Please re-connect this provider.");
    }

    #[test]
    fn vault_errors_keep_their_classification() {
        let err: AuthError = VaultError::CredentialNotFound {
            key: "gmail_refresh_token".into(),
        }
        .into();
        assert!(err.requires_reauthentication());

        let err: AuthError = VaultError::EncryptionFailed {
            reason: "keychain locked".into(),
        }
        .into();
        assert!(!err.requires_reauthentication());
        assert!(err.user_message().starts_with("Security subsystem unavailable"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AuthError>();
    }
}
