//! OAuth 2.0 Authorization Code Flow with PKCE.
//!
//! Implements the RFC 6749 authorization code and refresh grants with
//! Proof Key for Code Exchange (RFC 7636), plus RFC 7009 token revocation.
//! PKCE is mandatory for every interactive flow.
//!
//! # Flow Overview
//!
//! 1. Generate a PKCE code verifier and code challenge.
//! 2. Build an authorization URL and send the user to it.
//! 3. Receive the authorization code via the loopback callback.
//! 4. Exchange the code + verifier for tokens.
//! 5. Refresh with the `refresh_token` grant; revoke on sign-out.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AuthError, Result};

/// Length of the PKCE code verifier in bytes (before base64 encoding).
const PKCE_VERIFIER_BYTES: usize = 32;

/// Length of the CSRF `state` value in bytes (before base64 encoding).
const STATE_BYTES: usize = 16;

/// Response bodies kept in error messages are cut to this many characters.
const MAX_ERROR_BODY_CHARS: usize = 512;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The `[oauth]` configuration section. Defaults target Google.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// The OAuth client ID.
    pub client_id: String,

    /// The OAuth client secret. Installed-app clients at Google still
    /// carry one even though it is not confidential.
    pub client_secret: Option<String>,

    /// The authorization endpoint URL.
    pub auth_url: String,

    /// The token endpoint URL.
    pub token_url: String,

    /// RFC 7009 revocation endpoint. Remote revocation is skipped when unset.
    pub revocation_url: Option<String>,

    /// Loopback host for the redirect listener.
    pub redirect_host: String,

    /// Loopback port for the redirect listener; `0` picks a free port.
    pub redirect_port: u16,

    /// Path component of the redirect URI.
    pub redirect_path: String,

    /// How long to wait for the browser redirect.
    pub callback_timeout_secs: u64,

    /// Timeout applied to every token endpoint request.
    pub request_timeout_secs: u64,

    /// Extra query parameters for the authorization URL.
    pub extra_auth_params: BTreeMap<String, String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        let extra_auth_params = [
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            client_id: String::new(),
            client_secret: None,
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            revocation_url: Some("https://oauth2.googleapis.com/revoke".to_string()),
            redirect_host: "127.0.0.1".to_string(),
            redirect_port: 0,
            redirect_path: "/callback".to_string(),
            callback_timeout_secs: 300,
            request_timeout_secs: 30,
            extra_auth_params,
        }
    }
}

impl OAuthConfig {
    /// Reject configurations that cannot possibly complete a flow.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(AuthError::InvalidConfig {
                reason: "oauth.client_id is empty".to_string(),
            });
        }
        Url::parse(&self.auth_url)?;
        Url::parse(&self.token_url)?;
        if let Some(revocation_url) = &self.revocation_url {
            Url::parse(revocation_url)?;
        }
        if !self.redirect_path.starts_with('/') {
            return Err(AuthError::InvalidConfig {
                reason: format!(
                    "oauth.redirect_path must start with '/': {}",
                    self.redirect_path
                ),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Raw token response from the authorization server.
///
/// Mapped into a [`TokenSet`](crate::tokens::TokenSet) by the caller, which
/// knows what to keep from the previous set.
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub token_type: Option<String>,
    /// Space-delimited granted scopes.
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Granted scopes, if the server reported them.
    pub fn granted_scopes(&self) -> Option<BTreeSet<String>> {
        self.scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
    }
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Raw error response from the authorization server.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

// ---------------------------------------------------------------------------
// PKCE helpers
// ---------------------------------------------------------------------------

fn random_urlsafe(len: usize, what: &str) -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes).map_err(|_| AuthError::FlowFailed {
        reason: format!("failed to generate {what}: CSPRNG error"),
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate a PKCE code verifier (random 32 bytes, base64url encoded).
///
/// # Errors
///
/// Returns an error if the system CSPRNG fails.
pub fn generate_pkce_verifier() -> Result<String> {
    random_urlsafe(PKCE_VERIFIER_BYTES, "PKCE verifier")
}

/// Generate an unguessable CSRF `state` value.
pub fn generate_state() -> Result<String> {
    random_urlsafe(STATE_BYTES, "state")
}

/// Derive the PKCE code challenge from a code verifier using SHA-256.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn pkce_challenge(verifier: &str) -> String {
    let hash = digest::digest(&digest::SHA256, verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

// ---------------------------------------------------------------------------
// OAuth flow
// ---------------------------------------------------------------------------

/// HTTP side of the OAuth protocol: URL building, code exchange, refresh and
/// revocation.
///
/// Stateless apart from the configuration and a pooled `reqwest` client;
/// per-flow values (redirect URI, verifier, state) are passed explicitly.
pub struct OAuthFlow {
    config: OAuthConfig,
    client: reqwest::Client,
}

impl OAuthFlow {
    /// Create a new OAuth flow with the given configuration.
    pub fn new(config: OAuthConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Build the authorization URL the user should visit.
    ///
    /// Includes the PKCE `code_challenge` (S256), the CSRF `state` and any
    /// configured extra parameters.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UrlParse`] if `auth_url` is not a valid URL.
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        scopes: &BTreeSet<String>,
        state: &str,
        code_challenge: &str,
    ) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_url)?;

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &self.config.client_id);
            params.append_pair("redirect_uri", redirect_uri);
            params.append_pair("state", state);
            params.append_pair("code_challenge", code_challenge);
            params.append_pair("code_challenge_method", "S256");

            if !scopes.is_empty() {
                let joined: Vec<&str> = scopes.iter().map(String::as_str).collect();
                params.append_pair("scope", &joined.join(" "));
            }

            for (key, value) in &self.config.extra_auth_params {
                params.append_pair(key, value);
            }
        }

        Ok(url.to_string())
    }

    /// Exchange an authorization code for tokens.
    ///
    /// `redirect_uri` must match the one sent in the authorization URL.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        tracing::debug!(token_url = %self.config.token_url, "exchanging authorization code");

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        Self::parse_token_response(response).await
    }

    /// Refresh an access token using a refresh token.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidGrant`] if the refresh token is invalid or
    /// revoked, [`AuthError::TokenEndpoint`] for throttling or server errors.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        tracing::debug!(token_url = %self.config.token_url, "refreshing access token");

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await?;

        Self::parse_token_response(response).await
    }

    /// Revoke a token at the RFC 7009 endpoint.
    ///
    /// A token the server no longer recognises counts as revoked. Without a
    /// configured endpoint this is a no-op.
    pub async fn revoke_token(&self, token: &str) -> Result<()> {
        let Some(revocation_url) = &self.config.revocation_url else {
            tracing::debug!("no revocation endpoint configured, skipping remote revocation");
            return Ok(());
        };

        let mut params = vec![("token", token), ("client_id", self.config.client_id.as_str())];
        if let Some(secret) = &self.config.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self.client.post(revocation_url).form(&params).send().await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!("token revoked remotely");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 400
            && let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body)
            && err.error == "invalid_token"
        {
            tracing::debug!("token already invalid at the revocation endpoint");
            return Ok(());
        }

        Err(AuthError::TokenEndpoint {
            status: status.as_u16(),
            body: truncate_body(&body),
        })
    }

    /// Parse the HTTP response from the token endpoint.
    ///
    /// Throttling and server errors keep their status so callers can retry;
    /// other OAuth error bodies become [`AuthError::InvalidGrant`].
    async fn parse_token_response(response: reqwest::Response) -> Result<TokenResponse> {
        let status = response.status();

        if status.is_success() {
            let token_response: TokenResponse = response.json().await?;
            tracing::debug!("token endpoint call successful");
            return Ok(token_response);
        }

        let body = response.text().await.unwrap_or_default();
        let code = status.as_u16();
        if code == 429 || status.is_server_error() {
            return Err(AuthError::TokenEndpoint {
                status: code,
                body: truncate_body(&body),
            });
        }

        match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(error_response) => {
                let reason = match error_response.error_description {
                    Some(description) => format!("{}: {description}", error_response.error),
                    None => error_response.error,
                };
                Err(AuthError::InvalidGrant { reason })
            }
            Err(_) => Err(AuthError::TokenEndpoint {
                status: code,
                body: truncate_body(&body),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
