//! Core provider trait and supporting types.
//!
//! The application talks to a mail account only through [`EmailProvider`].
//! Where the access token comes from is abstracted by [`AccessTokenSource`],
//! which the OAuth service implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use inboxguard_auth::OAuthService;

use crate::error::Result;
use crate::models::{EmailMessage, MessageBatch, MessageQuery, Profile};

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Lifecycle of a provider connection.
///
/// ```text
/// Uninitialized -> Initialized -> Connected -> Shutdown
///                                  |   ^
///                                  v   |
///                          Degraded / Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    Uninitialized,
    Initialized,
    Connected,
    /// Calls are still attempted but keep failing.
    Degraded,
    /// Too many failures, or the account needs to be reconnected.
    /// Only [`EmailProvider::connect`] leaves this state.
    Disconnected,
    Shutdown,
}

impl ProviderState {
    /// Whether remote operations may be attempted.
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initialized => write!(f, "initialized"),
            Self::Connected => write!(f, "connected"),
            Self::Degraded => write!(f, "degraded"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Coarse health of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The provider is fully operational.
    Healthy,
    /// Working, but recent calls have failed.
    Degraded,
    /// Not functional.
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health report. Contains no secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub state: ProviderState,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub email_address: Option<String>,
    /// Quota units spent by this process, retries included.
    pub quota_units_used: u64,
}

// ---------------------------------------------------------------------------
// Token source
// ---------------------------------------------------------------------------

/// Supplies a live access token for every API call.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Return a currently valid access token for `provider`, refreshing it
    /// if needed.
    async fn access_token(
        &self,
        scopes: &[String],
        provider: &str,
    ) -> inboxguard_auth::Result<Zeroizing<String>>;
}

#[async_trait]
impl AccessTokenSource for OAuthService {
    async fn access_token(
        &self,
        scopes: &[String],
        provider: &str,
    ) -> inboxguard_auth::Result<Zeroizing<String>> {
        self.get_access_token(scopes, provider).await
    }
}

// ---------------------------------------------------------------------------
// Core trait
// ---------------------------------------------------------------------------

/// A remote mailbox.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Unique identifier, also the token prefix in the vault.
    fn id(&self) -> &str;

    fn state(&self) -> ProviderState;

    /// Validate configuration. `Uninitialized -> Initialized`.
    async fn initialize(&self) -> Result<()>;

    /// Verify the account is reachable. Also recovers from `Degraded` and
    /// `Disconnected`.
    async fn connect(&self) -> Result<()>;

    /// Stop accepting calls for good.
    async fn shutdown(&self) -> Result<()>;

    /// Query the account and report health. Never fails.
    async fn health_check(&self) -> ProviderHealth;

    async fn profile(&self) -> Result<Profile>;

    /// Message ids matching `query`, following pagination up to its limit.
    async fn list_message_ids(&self, query: &MessageQuery) -> Result<Vec<String>>;

    async fn get_message(&self, id: &str) -> Result<EmailMessage>;

    /// Fetch many messages with network-level batching. Per-message
    /// failures are reported in the batch outcome, not as an error.
    async fn get_messages(&self, ids: &[String]) -> Result<MessageBatch>;
}
