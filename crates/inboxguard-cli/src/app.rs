//! Composition root: wires the vault, OAuth, rotation and Gmail provider
//! from an [`AppConfig`] and implements the subcommands on top of them.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use inboxguard_auth::{
    AuthError, AuthorizationProvider, OAuthConfig, OAuthService, PartialOutcome, PkceAuthorizer,
    RotationEvent, RotationStatistics, TokenResponse, TokenRotationService,
};
use inboxguard_gmail::{EmailProvider, GmailProvider, Profile, ProviderHealth};
use inboxguard_vault::{
    EncryptionStatus, SecuritySummary, StorageHealthReport, StorageStatus, Vault,
};

use crate::config::{AppConfig, ENV_CLIENT_ID};

/// Window of the security summary in `status`.
const SUMMARY_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Authorizer selection
// ---------------------------------------------------------------------------

/// Stands in for the PKCE authorizer while no OAuth client is configured.
/// Stored tokens stay readable; anything that needs the token endpoint fails
/// with a hint.
struct UnconfiguredAuthorizer {
    reason: String,
}

impl UnconfiguredAuthorizer {
    fn error(&self) -> AuthError {
        AuthError::InvalidConfig {
            reason: format!("{} (set {ENV_CLIENT_ID} or [oauth].client_id)", self.reason),
        }
    }
}

#[async_trait]
impl AuthorizationProvider for UnconfiguredAuthorizer {
    async fn authorize_interactive(
        &self,
        _scopes: &BTreeSet<String>,
    ) -> inboxguard_auth::Result<TokenResponse> {
        Err(self.error())
    }

    async fn refresh(&self, _refresh_token: &str) -> inboxguard_auth::Result<TokenResponse> {
        Err(self.error())
    }

    async fn revoke(&self, _token: &str) -> inboxguard_auth::Result<()> {
        Err(self.error())
    }
}

/// The PKCE authorizer, printing the consent URL for the user, or a
/// placeholder when the OAuth client is not configured.
pub fn authorizer_for(config: &OAuthConfig) -> Arc<dyn AuthorizationProvider> {
    match PkceAuthorizer::new(config.clone()) {
        Ok(authorizer) => Arc::new(authorizer.with_url_handler(Box::new(|url| {
            eprintln!();
            eprintln!("  Open this URL in your browser to connect your account:");
            eprintln!();
            eprintln!("  {url}");
            eprintln!();
        }))),
        Err(e) => {
            tracing::debug!(error = %e, "OAuth client not configured");
            Arc::new(UnconfiguredAuthorizer {
                reason: e.to_string(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Status report
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct AccountStatus {
    pub provider: String,
    pub authenticated: bool,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: BTreeSet<String>,
}

/// Everything `status` prints. Contains no secret material.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub encryption: EncryptionStatus,
    pub storage: StorageStatus,
    pub storage_health: StorageHealthReport,
    pub account: AccountStatus,
    pub rotation: RotationStatistics,
    pub security: SecuritySummary,
    pub gmail: ProviderHealth,
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct App {
    pub config: AppConfig,
    pub vault: Vault,
    pub oauth: Arc<OAuthService>,
    pub rotation: Arc<TokenRotationService>,
    pub gmail: Arc<GmailProvider>,
}

impl App {
    /// Open the vault under the configured data directory and wire the rest.
    pub async fn build(config: AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!("failed to create data directory {}", config.data_dir.display())
        })?;
        let vault = Vault::open(&config.vault, &config.data_dir)
            .await
            .context("failed to open vault")?;
        let authorizer = authorizer_for(&config.oauth);
        Self::assemble(config, vault, authorizer).await
    }

    /// Wire the services around an opened vault.
    pub async fn assemble(
        config: AppConfig,
        vault: Vault,
        authorizer: Arc<dyn AuthorizationProvider>,
    ) -> Result<Self> {
        let oauth = Arc::new(OAuthService::new(
            vault.storage.clone(),
            authorizer,
            vault.audit.clone(),
        ));

        // The configured account is always part of the sweep.
        let mut rotation_config = config.rotation.clone();
        rotation_config
            .providers
            .entry(config.gmail.provider.clone())
            .or_default();
        let rotation = Arc::new(
            TokenRotationService::new(oauth.clone(), vault.audit.clone(), &rotation_config)
                .context("invalid [rotation] section")?,
        );

        let gmail = Arc::new(
            GmailProvider::with_http(config.gmail.clone(), oauth.clone())
                .context("failed to create Gmail provider")?,
        );
        gmail.initialize().await.context("failed to initialize Gmail provider")?;

        Ok(Self {
            config,
            vault,
            oauth,
            rotation,
            gmail,
        })
    }

    fn provider_id(&self) -> &str {
        &self.config.gmail.provider
    }

    // -----------------------------------------------------------------------
    // Subcommands
    // -----------------------------------------------------------------------

    /// Collect health and status from every component.
    ///
    /// With stored tokens the account is contacted once, so the Gmail
    /// section reflects reachability.
    pub async fn status(&self) -> Result<StatusReport> {
        let provider = self.provider_id();
        let authenticated = self.oauth.is_authenticated(provider).await?;
        if authenticated
            && !self.gmail.state().accepts_calls()
            && let Err(e) = self.gmail.connect().await
        {
            warn!(provider, error = %e, "account not reachable");
        }

        Ok(StatusReport {
            encryption: self.vault.encryption.status(),
            storage: self.vault.storage.status().await,
            storage_health: self.vault.storage.health_check().await,
            account: AccountStatus {
                provider: provider.to_string(),
                authenticated,
                token_expires_at: self.oauth.token_expiry(provider).await?,
                scopes: self.oauth.granted_scopes(provider).await?,
            },
            rotation: self.rotation.get_rotation_statistics().await,
            security: self
                .vault
                .audit
                .get_security_summary(chrono::Duration::hours(SUMMARY_HOURS)),
            gmail: self.gmail.health_check().await,
        })
    }

    /// Sign in if needed, then verify the account and return its profile.
    ///
    /// `extra_scopes` are added to the existing grant with one consent
    /// flow; nothing granted before is dropped.
    pub async fn connect(&self, force: bool, extra_scopes: &[String]) -> Result<Profile> {
        let provider = self.provider_id();
        let scopes = &self.config.gmail.scopes;

        if force || !self.oauth.has_valid_tokens(scopes, provider).await? {
            let wanted: Vec<&String> = scopes.iter().chain(extra_scopes).collect();
            self.oauth
                .authenticate_interactive(&wanted, provider)
                .await
                .context("sign-in failed")?;
            info!(provider, "account connected");
        } else if !extra_scopes.is_empty() {
            let expanded = self
                .oauth
                .expand_scopes(provider, extra_scopes, provider)
                .await
                .context("scope expansion failed")?;
            if !expanded {
                info!(provider, "requested scopes already granted");
            }
        }

        self.gmail.connect().await.context("account not reachable")?;
        Ok(self.gmail.profile().await?)
    }

    /// Revoke the grant and remove its stored tokens.
    pub async fn disconnect(&self) -> Result<PartialOutcome> {
        let provider = self.provider_id();
        let outcome = self
            .oauth
            .sign_out(provider)
            .await
            .context("sign-out failed")?;
        self.gmail.shutdown().await?;
        Ok(outcome)
    }

    /// Keep tokens fresh until `shutdown` resolves, logging every rotation.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let provider = self.provider_id();
        let mut events = self.rotation.subscribe();

        if self.config.rotation.enabled {
            self.rotation.start().await;
        } else {
            info!("token rotation disabled");
        }

        if self.oauth.is_authenticated(provider).await? {
            match self.gmail.connect().await {
                Ok(()) => info!(provider, "account reachable"),
                Err(e) => warn!(provider, error = %e, "account not reachable"),
            }
        } else {
            warn!(provider, "no account connected, run `inboxguard connect`");
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                event = events.recv() => match event {
                    Ok(RotationEvent::TokenRotated { provider, expires_at, attempts, .. }) => {
                        info!(%provider, ?expires_at, attempts, "token rotated");
                    }
                    Ok(RotationEvent::TokenRotationFailed {
                        provider,
                        error,
                        requires_reauthentication,
                        ..
                    }) => {
                        warn!(%provider, %error, "token rotation failed");
                        if requires_reauthentication {
                            warn!(%provider, "sign-in expired, run `inboxguard connect`");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "rotation events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        info!("shutting down");
        self.rotation.stop().await;
        self.gmail.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inboxguard_auth::RotationState;
    use inboxguard_gmail::{GMAIL_READONLY_SCOPE, GmailConfig, HealthStatus, ProviderState, RetryPolicy};
    use inboxguard_vault::VaultConfig;

    struct FakeGoogle;

    #[async_trait]
    impl AuthorizationProvider for FakeGoogle {
        async fn authorize_interactive(
            &self,
            scopes: &BTreeSet<String>,
        ) -> inboxguard_auth::Result<TokenResponse> {
            let scope = scopes.iter().cloned().collect::<Vec<_>>().join(" ");
            Ok(serde_json::from_value(serde_json::json!({
                "access_token": "ya29.app-test",
                "refresh_token": "1//app-test",
                "expires_in": 3599,
                "scope": scope,
            }))?)
        }

        async fn refresh(&self, _refresh_token: &str) -> inboxguard_auth::Result<TokenResponse> {
            Ok(serde_json::from_value(serde_json::json!({
                "access_token": "ya29.app-refreshed",
                "expires_in": 3599,
            }))?)
        }

        async fn revoke(&self, _token: &str) -> inboxguard_auth::Result<()> {
            Ok(())
        }
    }

    async fn test_app(dir: &tempfile::TempDir) -> App {
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            vault: VaultConfig::ephemeral(),
            gmail: GmailConfig {
                // Nothing listens on the discard port.
                api_base: "http://127.0.0.1:9".to_string(),
                request_timeout_secs: 2,
                retry: RetryPolicy::none(),
                ..GmailConfig::default()
            },
            ..AppConfig::default()
        };
        let vault = Vault::open(&config.vault, &config.data_dir).await.unwrap();
        App::assemble(config, vault, Arc::new(FakeGoogle)).await.unwrap()
    }

    #[tokio::test]
    async fn status_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;

        let report = app.status().await.unwrap();
        assert!(!report.account.authenticated);
        assert!(report.account.token_expires_at.is_none());
        assert!(report.account.scopes.is_empty());
        assert_eq!(report.gmail.status, HealthStatus::Unhealthy);
        assert_eq!(report.gmail.state, ProviderState::Initialized);
        assert!(report.rotation.providers.contains_key("gmail"));
        assert_eq!(report.rotation.state, RotationState::Stopped);
        serde_json::to_string_pretty(&report).unwrap();
    }

    #[tokio::test]
    async fn status_after_sign_in_hides_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        app.oauth
            .authenticate_interactive(&[GMAIL_READONLY_SCOPE], "gmail")
            .await
            .unwrap();

        let report = app.status().await.unwrap();
        assert!(report.account.authenticated);
        assert!(report.account.token_expires_at.is_some());
        assert!(report.account.scopes.contains(GMAIL_READONLY_SCOPE));
        // The API is unreachable, which shows up in the provider section.
        assert_ne!(report.gmail.status, HealthStatus::Healthy);
        assert!(report.gmail.last_error.is_some());

        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("ya29"));
        assert!(!json.contains("1//app-test"));
    }

    #[tokio::test]
    async fn disconnect_forgets_the_account() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;
        app.oauth
            .authenticate_interactive(&[GMAIL_READONLY_SCOPE], "gmail")
            .await
            .unwrap();

        let outcome = app.disconnect().await.unwrap();
        assert!(outcome.is_success(), "{outcome}");
        assert!(!app.oauth.is_authenticated("gmail").await.unwrap());
        assert_eq!(app.gmail.state(), ProviderState::Shutdown);
    }

    #[tokio::test]
    async fn run_returns_when_shutdown_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir).await;

        app.run(async {}).await.unwrap();
        assert_eq!(app.rotation.state().await, RotationState::Stopped);
        assert_eq!(app.gmail.state(), ProviderState::Shutdown);
    }

    #[tokio::test]
    async fn missing_client_id_is_reported_on_use() {
        let authorizer = authorizer_for(&OAuthConfig::default());
        let scopes = BTreeSet::from([GMAIL_READONLY_SCOPE.to_string()]);

        let err = authorizer.authorize_interactive(&scopes).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidConfig { .. }));
        assert!(err.to_string().contains(ENV_CLIENT_ID));
        assert!(authorizer.refresh("1//x").await.is_err());
    }
}
