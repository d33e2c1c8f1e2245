//! The network side of OAuth, behind a trait.
//!
//! [`OAuthService`](crate::OAuthService) talks to the authorization server
//! only through [`AuthorizationProvider`], so tests can count and script
//! grants without a browser or an HTTP server.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::callback::CallbackServer;
use crate::error::{AuthError, Result};
use crate::oauth::{
    OAuthConfig, OAuthFlow, TokenResponse, generate_pkce_verifier, generate_state, pkce_challenge,
};

/// Obtains, refreshes and revokes grants at an authorization server.
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Run the interactive consent flow for `scopes`.
    async fn authorize_interactive(&self, scopes: &BTreeSet<String>) -> Result<TokenResponse>;

    /// Exchange a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;

    /// Revoke a token at the server.
    async fn revoke(&self, token: &str) -> Result<()>;
}

/// Callback invoked with the authorization URL the user must open.
pub type UrlHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Authorization code + PKCE through a loopback redirect.
pub struct PkceAuthorizer {
    flow: OAuthFlow,
    on_url: Option<UrlHandler>,
}

impl PkceAuthorizer {
    pub fn new(config: OAuthConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            flow: OAuthFlow::new(config)?,
            on_url: None,
        })
    }

    /// Hand the authorization URL to `handler` (typically: open a browser)
    /// instead of only logging it.
    pub fn with_url_handler(mut self, handler: UrlHandler) -> Self {
        self.on_url = Some(handler);
        self
    }
}

#[async_trait]
impl AuthorizationProvider for PkceAuthorizer {
    async fn authorize_interactive(&self, scopes: &BTreeSet<String>) -> Result<TokenResponse> {
        let config = self.flow.config();
        let server =
            CallbackServer::bind(&config.redirect_host, config.redirect_port, &config.redirect_path)
                .await?;
        let redirect_uri = server.redirect_uri();

        let verifier = generate_pkce_verifier()?;
        let challenge = pkce_challenge(&verifier);
        let state = generate_state()?;
        let url = self
            .flow
            .authorization_url(&redirect_uri, scopes, &state, &challenge)?;

        tracing::info!(url = %url, "open this URL in a browser to connect the account");
        if let Some(on_url) = &self.on_url {
            on_url(&url);
        }

        let callback = server
            .wait(Duration::from_secs(config.callback_timeout_secs))
            .await?;
        if callback.state != state {
            return Err(AuthError::FlowFailed {
                reason: "state mismatch in OAuth callback".to_string(),
            });
        }

        self.flow
            .exchange_code(&callback.code, &verifier, &redirect_uri)
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        self.flow.refresh_token(refresh_token).await
    }

    async fn revoke(&self, token: &str) -> Result<()> {
        self.flow.revoke_token(token).await
    }
}
