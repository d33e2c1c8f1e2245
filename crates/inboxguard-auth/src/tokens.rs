//! OAuth token sets and their layout in the credential store.
//!
//! A token set for a prefix (usually the provider name) is spread over six
//! vault entries so each stays a plain string:
//!
//! | key                     | value                          |
//! |-------------------------|--------------------------------|
//! | `<prefix>_access_token` | access token                   |
//! | `<prefix>_refresh_token`| refresh token, when granted    |
//! | `<prefix>_expires_in`   | lifetime in seconds            |
//! | `<prefix>_issued_at`    | unix seconds at issuance       |
//! | `<prefix>_token_type`   | usually `Bearer`               |
//! | `<prefix>_scopes`       | granted scopes, comma joined   |

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use inboxguard_vault::{CredentialStore, VaultError};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{AuthError, Result};
use crate::oauth::TokenResponse;

/// Tokens are treated as expired this long before their real expiry.
pub const EXPIRY_SKEW_SECS: i64 = 300;

/// Lifetime assumed when the server omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Build a scope set from any list of scope strings.
pub fn scope_set<S: AsRef<str>>(scopes: &[S]) -> BTreeSet<String> {
    scopes.iter().map(|s| s.as_ref().to_string()).collect()
}

/// An access token with its refresh token and metadata.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, counted from `issued_at`.
    pub expires_in: i64,
    /// Unix seconds.
    pub issued_at: i64,
    #[zeroize(skip)]
    pub scopes: BTreeSet<String>,
    pub token_type: String,
}

impl TokenSet {
    /// Map a fresh grant. Without a `scope` field the server granted what
    /// was requested.
    pub fn from_response(
        response: &TokenResponse,
        requested: &BTreeSet<String>,
        now: i64,
    ) -> Self {
        Self {
            access_token: response.access_token.clone(),
            refresh_token: response.refresh_token.clone(),
            expires_in: response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
            issued_at: now,
            scopes: response
                .granted_scopes()
                .unwrap_or_else(|| requested.clone()),
            token_type: response
                .token_type
                .clone()
                .unwrap_or_else(|| "Bearer".to_string()),
        }
    }

    /// Apply a refresh grant on top of this set. An absent refresh token or
    /// scope keeps the previous value.
    pub fn refreshed(&self, response: &TokenResponse, now: i64) -> Self {
        Self {
            access_token: response.access_token.clone(),
            refresh_token: response
                .refresh_token
                .clone()
                .or_else(|| self.refresh_token.clone()),
            expires_in: response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS),
            issued_at: now,
            scopes: response
                .granted_scopes()
                .unwrap_or_else(|| self.scopes.clone()),
            token_type: response
                .token_type
                .clone()
                .unwrap_or_else(|| self.token_type.clone()),
        }
    }

    /// Unix seconds at which the server stops accepting the access token.
    pub fn expires_at(&self) -> i64 {
        self.issued_at.saturating_add(self.expires_in)
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at(), 0)
    }

    /// Usable at `now` (unix seconds), keeping the five minute margin.
    pub fn is_valid_at(&self, now: i64) -> bool {
        now < self.expires_at() - EXPIRY_SKEW_SECS
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now().timestamp())
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Whether every scope in `requested` was granted.
    pub fn covers(&self, requested: &BTreeSet<String>) -> bool {
        requested.is_subset(&self.scopes)
    }

    /// Requested scopes that were not granted.
    pub fn missing_scopes(&self, requested: &BTreeSet<String>) -> Vec<String> {
        requested.difference(&self.scopes).cloned().collect()
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .field("scopes", &self.scopes)
            .field("token_type", &self.token_type)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Storage layout
// ---------------------------------------------------------------------------

/// The six credential keys for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenKeys {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: String,
    pub issued_at: String,
    pub token_type: String,
    pub scopes: String,
}

impl TokenKeys {
    /// Field names, in the order [`all`](Self::all) returns their keys.
    pub const FIELDS: [&'static str; 6] = [
        "access_token",
        "refresh_token",
        "expires_in",
        "issued_at",
        "token_type",
        "scopes",
    ];

    pub fn new(prefix: &str) -> Self {
        Self {
            access_token: format!("{prefix}_access_token"),
            refresh_token: format!("{prefix}_refresh_token"),
            expires_in: format!("{prefix}_expires_in"),
            issued_at: format!("{prefix}_issued_at"),
            token_type: format!("{prefix}_token_type"),
            scopes: format!("{prefix}_scopes"),
        }
    }

    pub fn all(&self) -> [&str; 6] {
        [
            self.access_token.as_str(),
            self.refresh_token.as_str(),
            self.expires_in.as_str(),
            self.issued_at.as_str(),
            self.token_type.as_str(),
            self.scopes.as_str(),
        ]
    }
}

/// Absent keys are checked with `exists` first so they do not show up as
/// failed retrievals in the audit log.
async fn retrieve_optional(
    store: &dyn CredentialStore,
    key: &str,
) -> Result<Option<Zeroizing<String>>> {
    if !store.exists(key).await? {
        return Ok(None);
    }
    match store.retrieve(key).await {
        Ok(value) => Ok(Some(value)),
        Err(VaultError::CredentialNotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_i64(key: &str, value: Option<Zeroizing<String>>, default: i64) -> Result<i64> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e: std::num::ParseIntError| {
            AuthError::CorruptTokenData {
                key: key.to_string(),
                reason: e.to_string(),
            }
        }),
    }
}

/// Load the token set stored under `keys`, or `None` if there is no access
/// token.
///
/// A missing `issued_at` makes the set look expired so it gets refreshed
/// rather than trusted.
pub async fn load(store: &dyn CredentialStore, keys: &TokenKeys) -> Result<Option<TokenSet>> {
    let Some(access_token) = retrieve_optional(store, &keys.access_token).await? else {
        return Ok(None);
    };

    let refresh_token = retrieve_optional(store, &keys.refresh_token)
        .await?
        .map(|t| t.to_string());
    let expires_in = parse_i64(
        &keys.expires_in,
        retrieve_optional(store, &keys.expires_in).await?,
        DEFAULT_EXPIRES_IN_SECS,
    )?;
    let issued_at = parse_i64(
        &keys.issued_at,
        retrieve_optional(store, &keys.issued_at).await?,
        0,
    )?;
    let token_type = retrieve_optional(store, &keys.token_type)
        .await?
        .map(|t| t.to_string())
        .unwrap_or_else(|| "Bearer".to_string());
    let scopes = retrieve_optional(store, &keys.scopes)
        .await?
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(Some(TokenSet {
        access_token: access_token.to_string(),
        refresh_token,
        expires_in,
        issued_at,
        scopes,
        token_type,
    }))
}

/// Write every field of `tokens`. The access token goes last so a reader
/// never sees a new access token next to stale metadata.
pub async fn save(store: &dyn CredentialStore, keys: &TokenKeys, tokens: &TokenSet) -> Result<()> {
    store
        .store(&keys.expires_in, &tokens.expires_in.to_string())
        .await?;
    store
        .store(&keys.issued_at, &tokens.issued_at.to_string())
        .await?;
    store.store(&keys.token_type, &tokens.token_type).await?;
    let scopes: Vec<&str> = tokens.scopes.iter().map(String::as_str).collect();
    store.store(&keys.scopes, &scopes.join(",")).await?;
    match &tokens.refresh_token {
        Some(refresh_token) => store.store(&keys.refresh_token, refresh_token).await?,
        None => store.remove(&keys.refresh_token).await?,
    }
    store.store(&keys.access_token, &tokens.access_token).await?;
    Ok(())
}
