//! OAuth token lifecycle for InboxGuard.
//!
//! This crate connects mail accounts and keeps their tokens alive:
//!
//! - **Authorization Code Flow with PKCE** (RFC 7636) through a loopback
//!   redirect listener.
//! - **Token storage** in the [`inboxguard_vault`] credential store, one
//!   entry per token field under a provider prefix.
//! - **Silent refresh**, incremental **scope expansion** and **sign-out**
//!   with RFC 7009 revocation.
//! - **Scheduled rotation** of tokens nearing expiry.
//!
//! # Architecture
//!
//! ```text
//! TokenRotationService ── RecurringTask
//!          │
//!     OAuthService ── CredentialStore (vault)
//!          │
//!  AuthorizationProvider
//!          └── PkceAuthorizer ── OAuthFlow + CallbackServer
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use inboxguard_auth::{OAuthConfig, OAuthService, PkceAuthorizer};
//! use inboxguard_vault::{Vault, VaultConfig};
//!
//! # async fn example() -> inboxguard_auth::Result<()> {
//! let vault = Vault::open(&VaultConfig::default(), std::path::Path::new("data")).await?;
//! let authorizer = PkceAuthorizer::new(OAuthConfig {
//!     client_id: "1234.apps.googleusercontent.com".to_string(),
//!     ..OAuthConfig::default()
//! })?;
//! let oauth = OAuthService::new(vault.storage.clone(), Arc::new(authorizer), vault.audit.clone());
//!
//! let scopes = ["https://www.googleapis.com/auth/gmail.readonly"];
//! if !oauth.has_valid_tokens(&scopes, "gmail").await? {
//!     oauth.authenticate_interactive(&scopes, "gmail").await?;
//! }
//! let token = oauth.get_access_token(&scopes, "gmail").await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```

pub mod authorizer;
pub mod callback;
pub mod error;
pub mod oauth;
pub mod outcome;
pub mod rotation;
pub mod scheduler;
pub mod service;
pub mod tokens;

#[cfg(test)]
mod testing;

pub use authorizer::{AuthorizationProvider, PkceAuthorizer};
pub use callback::{CallbackParams, CallbackServer};
pub use error::{AuthError, Result};
pub use oauth::{OAuthConfig, OAuthFlow, TokenResponse};
pub use outcome::PartialOutcome;
pub use rotation::{
    RotationConfig, RotationEvent, RotationResult, RotationSettings, RotationState,
    RotationStatistics, TokenRotationService,
};
pub use scheduler::RecurringTask;
pub use service::OAuthService;
pub use tokens::{TokenKeys, TokenSet};
