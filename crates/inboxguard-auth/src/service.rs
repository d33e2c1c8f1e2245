//! The OAuth service: sign-in, token validity, refresh, scope expansion and
//! sign-out on top of the credential store.
//!
//! Tokens never leave the vault except as the short-lived return value of
//! [`OAuthService::get_access_token`]. Refreshes are serialized by one lock
//! so concurrent callers that find an expired token refresh it once.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use inboxguard_vault::{AuditEventType, CredentialStore, SecurityAuditLogger, SecurityEvent};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use crate::authorizer::AuthorizationProvider;
use crate::error::{AuthError, Result};
use crate::outcome::PartialOutcome;
use crate::tokens::{self, TokenKeys, TokenSet, scope_set};

pub struct OAuthService {
    store: Arc<dyn CredentialStore>,
    authorizer: Arc<dyn AuthorizationProvider>,
    audit: Arc<SecurityAuditLogger>,
    refresh_lock: Mutex<()>,
}

impl OAuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        authorizer: Arc<dyn AuthorizationProvider>,
        audit: Arc<SecurityAuditLogger>,
    ) -> Self {
        Self {
            store,
            authorizer,
            audit,
            refresh_lock: Mutex::new(()),
        }
    }

    fn record(&self, operation: &str, prefix: &str, error: Option<&AuthError>, details: Option<String>) {
        let details = match details {
            Some(details) => format!("provider={prefix} {details}"),
            None => format!("provider={prefix}"),
        };
        let mut event =
            SecurityEvent::new(AuditEventType::Authentication, operation).with_details(details);
        if let Some(error) = error {
            event = event.failed(error);
        }
        self.audit.log_security_event(event);
    }

    async fn load(&self, keys: &TokenKeys) -> Result<Option<TokenSet>> {
        tokens::load(self.store.as_ref(), keys).await
    }

    async fn load_required(&self, prefix: &str, keys: &TokenKeys) -> Result<TokenSet> {
        self.load(keys)
            .await?
            .ok_or_else(|| AuthError::auth_required(prefix, "not signed in"))
    }

    // -----------------------------------------------------------------------
    // Access tokens
    // -----------------------------------------------------------------------

    /// A currently valid access token for `prefix`, refreshing silently if
    /// the stored one is expired and a refresh token exists.
    ///
    /// # Errors
    ///
    /// [`AuthError::AuthenticationRequired`] if there are no tokens or they
    /// cannot be renewed without the user.
    pub async fn get_access_token<S: AsRef<str>>(
        &self,
        scopes: &[S],
        prefix: &str,
    ) -> Result<Zeroizing<String>> {
        let requested = scope_set(scopes);
        let tokens = self.usable_tokens(prefix, &TokenKeys::new(prefix)).await?;
        if !tokens.covers(&requested) {
            tracing::debug!(
                provider = prefix,
                missing = ?tokens.missing_scopes(&requested),
                "stored grant lacks requested scopes"
            );
        }
        Ok(Zeroizing::new(tokens.access_token.clone()))
    }

    /// Valid tokens whose scopes include every requested scope. Refreshes
    /// like [`get_access_token`](Self::get_access_token); anything that
    /// needs the user again reads as `false`.
    pub async fn has_valid_tokens<S: AsRef<str>>(&self, scopes: &[S], prefix: &str) -> Result<bool> {
        let requested = scope_set(scopes);
        match self.usable_tokens(prefix, &TokenKeys::new(prefix)).await {
            Ok(tokens) => Ok(tokens.covers(&requested)),
            Err(e) if e.requires_reauthentication() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Tokens exist and are either valid or renewable. No network traffic.
    pub async fn is_authenticated(&self, prefix: &str) -> Result<bool> {
        Ok(self
            .load(&TokenKeys::new(prefix))
            .await?
            .is_some_and(|t| t.is_valid() || t.can_refresh()))
    }

    /// When the stored access token expires, if there is one.
    pub async fn token_expiry(&self, prefix: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .load(&TokenKeys::new(prefix))
            .await?
            .and_then(|t| t.expiry()))
    }

    /// Scopes granted to `prefix`; empty when not signed in.
    pub async fn granted_scopes(&self, prefix: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .load(&TokenKeys::new(prefix))
            .await?
            .map(|t| t.scopes.clone())
            .unwrap_or_default())
    }

    async fn usable_tokens(&self, prefix: &str, keys: &TokenKeys) -> Result<TokenSet> {
        let tokens = self.load_required(prefix, keys).await?;
        if tokens.is_valid() {
            return Ok(tokens);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        let tokens = self.load_required(prefix, keys).await?;
        if tokens.is_valid() {
            return Ok(tokens);
        }
        self.refresh_locked(prefix, keys, &tokens).await
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// Refresh now, regardless of the current token's remaining lifetime.
    pub async fn refresh_tokens(&self, prefix: &str) -> Result<TokenSet> {
        let keys = TokenKeys::new(prefix);
        let _guard = self.refresh_lock.lock().await;
        let tokens = self.load_required(prefix, &keys).await?;
        self.refresh_locked(prefix, &keys, &tokens).await
    }

    /// Refresh if the token expires within `threshold`.
    ///
    /// The check is repeated under the refresh lock, so a token another
    /// caller has just refreshed is not refreshed again. Returns `Ok(None)`
    /// in that case.
    pub async fn refresh_if_expiring(
        &self,
        prefix: &str,
        threshold: chrono::Duration,
    ) -> Result<Option<TokenSet>> {
        let keys = TokenKeys::new(prefix);
        let _guard = self.refresh_lock.lock().await;
        let tokens = self.load_required(prefix, &keys).await?;
        if tokens.expiry().is_some_and(|at| Utc::now() + threshold < at) {
            tracing::debug!(provider = prefix, "token already fresh, refresh skipped");
            return Ok(None);
        }
        self.refresh_locked(prefix, &keys, &tokens).await.map(Some)
    }

    /// Caller holds `refresh_lock`.
    async fn refresh_locked(
        &self,
        prefix: &str,
        keys: &TokenKeys,
        current: &TokenSet,
    ) -> Result<TokenSet> {
        let Some(refresh_token) = current.refresh_token.as_deref().filter(|t| !t.is_empty()) else {
            let err = AuthError::auth_required(prefix, "access token expired and no refresh token is stored");
            self.record("token_refresh", prefix, Some(&err), None);
            return Err(err);
        };

        match self.authorizer.refresh(refresh_token).await {
            Ok(response) => {
                let next = current.refreshed(&response, Utc::now().timestamp());
                tokens::save(self.store.as_ref(), keys, &next).await?;
                tracing::info!(provider = prefix, expires_at = ?next.expiry(), "access token refreshed");
                self.record("token_refresh", prefix, None, None);
                Ok(next)
            }
            Err(e) => {
                tracing::warn!(provider = prefix, error = %e, "token refresh failed");
                self.record("token_refresh", prefix, Some(&e), None);
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Interactive sign-in
    // -----------------------------------------------------------------------

    /// Run the consent flow for `scopes` and store the grant under `prefix`.
    ///
    /// # Errors
    ///
    /// [`AuthError::ScopeNotGranted`] if the user unticked a requested scope.
    pub async fn authenticate_interactive<S: AsRef<str>>(
        &self,
        scopes: &[S],
        prefix: &str,
    ) -> Result<TokenSet> {
        self.authenticate_scopes(&scope_set(scopes), prefix).await
    }

    async fn authenticate_scopes(&self, requested: &BTreeSet<String>, prefix: &str) -> Result<TokenSet> {
        tracing::info!(provider = prefix, scopes = requested.len(), "starting interactive authorization");
        let result = self.run_interactive(requested, prefix).await;
        match &result {
            Ok(tokens) => {
                tracing::info!(provider = prefix, "account connected");
                self.record(
                    "authenticate",
                    prefix,
                    None,
                    Some(format!("scopes={}", tokens.scopes.len())),
                );
            }
            Err(e) => {
                tracing::warn!(provider = prefix, error = %e, "interactive authorization failed");
                self.record("authenticate", prefix, Some(e), None);
            }
        }
        result
    }

    async fn run_interactive(&self, requested: &BTreeSet<String>, prefix: &str) -> Result<TokenSet> {
        let response = self.authorizer.authorize_interactive(requested).await?;
        let mut tokens = TokenSet::from_response(&response, requested, Utc::now().timestamp());

        let missing = tokens.missing_scopes(requested);
        if !missing.is_empty() {
            return Err(AuthError::ScopeNotGranted { missing });
        }

        let keys = TokenKeys::new(prefix);
        let _guard = self.refresh_lock.lock().await;
        if !tokens.can_refresh() {
            // Re-consent can omit the refresh token; keep the stored one.
            if let Ok(Some(previous)) = self.load(&keys).await {
                tokens.refresh_token = previous.refresh_token.clone();
            }
        }
        tokens::save(self.store.as_ref(), &keys, &tokens).await?;
        Ok(tokens)
    }

    /// Make sure `new_prefix` holds a grant covering `new_scopes`.
    ///
    /// Returns `Ok(false)` without any user interaction when the target
    /// grant already covers them. Otherwise runs one consent flow for the
    /// union of the scopes held by `existing_prefix`, those already held by
    /// `new_prefix` and `new_scopes`, so nothing granted earlier is dropped,
    /// and returns `Ok(true)`.
    pub async fn expand_scopes<S: AsRef<str>>(
        &self,
        existing_prefix: &str,
        new_scopes: &[S],
        new_prefix: &str,
    ) -> Result<bool> {
        let wanted = scope_set(new_scopes);

        if let Some(target) = self.load(&TokenKeys::new(new_prefix)).await?
            && target.covers(&wanted)
            && (target.is_valid() || target.can_refresh())
        {
            tracing::debug!(provider = new_prefix, "requested scopes already granted");
            return Ok(false);
        }

        let mut union = self.granted_scopes(existing_prefix).await?;
        union.extend(self.granted_scopes(new_prefix).await?);
        union.extend(wanted);
        self.authenticate_scopes(&union, new_prefix).await?;
        self.record(
            "scope_expansion",
            new_prefix,
            None,
            Some(format!("from={existing_prefix} scopes={}", union.len())),
        );
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Revocation
    // -----------------------------------------------------------------------

    /// Revoke the grant remotely (best effort) and remove all six stored
    /// entries for `prefix`.
    ///
    /// Removal failures are aggregated; at least one removed entry counts as
    /// success.
    ///
    /// # Errors
    ///
    /// [`AuthError::RevocationFailed`] if no entry could be removed.
    pub async fn revoke_tokens(&self, prefix: &str) -> Result<PartialOutcome> {
        let keys = TokenKeys::new(prefix);
        let _guard = self.refresh_lock.lock().await;

        match self.load(&keys).await {
            Ok(Some(tokens)) => {
                // Revoking the refresh token ends the whole grant.
                let token = tokens
                    .refresh_token
                    .clone()
                    .unwrap_or_else(|| tokens.access_token.clone());
                let token = Zeroizing::new(token);
                if let Err(e) = self.authorizer.revoke(&token).await {
                    tracing::warn!(provider = prefix, error = %e, "remote token revocation failed");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(provider = prefix, error = %e, "could not read tokens for remote revocation");
            }
        }

        let mut outcome = PartialOutcome::new();
        for (field, key) in TokenKeys::FIELDS.iter().zip(keys.all()) {
            outcome.record(field, self.store.remove(key).await);
        }

        if !outcome.is_success() {
            let err = AuthError::RevocationFailed {
                provider: prefix.to_string(),
                reason: outcome.errors.join("; "),
            };
            self.record("token_revocation", prefix, Some(&err), None);
            return Err(err);
        }

        if outcome.is_partial() {
            tracing::warn!(provider = prefix, %outcome, "tokens only partially removed");
            self.record(
                "token_revocation_partial",
                prefix,
                None,
                Some(outcome.to_string()),
            );
        } else {
            self.record("token_revocation", prefix, None, None);
        }
        Ok(outcome)
    }

    /// Revoke and forget everything stored for `prefix`.
    ///
    /// A partial removal still returns `Ok`, but is audited as
    /// `sign_out_partial`.
    pub async fn sign_out(&self, prefix: &str) -> Result<PartialOutcome> {
        match self.revoke_tokens(prefix).await {
            Ok(outcome) if outcome.is_complete() => {
                tracing::info!(provider = prefix, "signed out");
                self.record("sign_out", prefix, None, None);
                Ok(outcome)
            }
            Ok(outcome) => {
                tracing::warn!(provider = prefix, %outcome, "signed out with leftover entries");
                self.record("sign_out_partial", prefix, None, Some(outcome.to_string()));
                Ok(outcome)
            }
            Err(e) => {
                self.record("sign_out", prefix, Some(&e), None);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;
    use inboxguard_vault::VaultError;

    use crate::testing::{Harness, ScriptedAuthorizer};

    const READONLY: &str = "https://www.googleapis.com/auth/gmail.readonly";
    const MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";

    #[tokio::test]
    async fn valid_token_is_returned_without_network() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 3600, true).await;

        let token = h.service.get_access_token(&[READONLY], "gmail").await.unwrap();
        assert_eq!(token.as_str(), "ya29.seeded-gmail");
        assert_eq!(h.authorizer.refreshes(), 0);
        assert!(h.service.has_valid_tokens(&[READONLY], "gmail").await.unwrap());
    }

    #[tokio::test]
    async fn near_expiry_token_is_refreshed_silently() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        // Inside the five minute margin.
        h.seed("gmail", &[READONLY], 300, true).await;

        let token = h.service.get_access_token(&[READONLY], "gmail").await.unwrap();
        assert_eq!(token.as_str(), "ya29.refreshed-1");
        assert_eq!(h.authorizer.refreshes(), 1);

        // Refresh response had neither refresh token nor scope.
        let store = h.store();
        assert_eq!(store.retrieve("gmail_refresh_token").await.unwrap().as_str(), "1//seeded");
        assert_eq!(h.service.granted_scopes("gmail").await.unwrap(), scope_set(&[READONLY]));
    }

    #[tokio::test]
    async fn expired_without_refresh_token_requires_sign_in() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 60, false).await;

        let err = h.service.get_access_token(&[READONLY], "gmail").await.unwrap_err();
        assert!(matches!(err, AuthError::AuthenticationRequired { .. }));
        assert_eq!(err.user_message(), "Please re-connect this provider.");
        assert!(!h.service.has_valid_tokens(&[READONLY], "gmail").await.unwrap());
        assert!(!h.service.is_authenticated("gmail").await.unwrap());
        assert_eq!(h.authorizer.refreshes(), 0);
    }

    #[tokio::test]
    async fn missing_tokens_require_sign_in() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        let err = h.service.get_access_token(&[READONLY], "gmail").await.unwrap_err();
        assert!(err.requires_reauthentication());
        assert_eq!(h.service.token_expiry("gmail").await.unwrap(), None);
    }

    #[tokio::test]
    async fn has_valid_tokens_requires_scope_superset() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 3600, true).await;
        assert!(!h.service.has_valid_tokens(&[READONLY, MODIFY], "gmail").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_callers_refresh_once() {
        let h = Harness::new(ScriptedAuthorizer::with_refresh_delay(Duration::from_millis(50))).await;
        h.seed("gmail", &[READONLY], 0, true).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = h.service.clone();
            handles.push(tokio::spawn(async move {
                service.get_access_token(&[READONLY], "gmail").await.map(|t| t.to_string())
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "ya29.refreshed-1");
        }
        assert_eq!(h.authorizer.refreshes(), 1);
    }

    #[tokio::test]
    async fn rejected_refresh_is_audited() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 0, true).await;
        h.authorizer.fail_next_refresh(AuthError::InvalidGrant {
            reason: "invalid_grant".into(),
        });

        assert!(!h.service.has_valid_tokens(&[READONLY], "gmail").await.unwrap());

        let summary = h.vault.audit.get_security_summary(ChronoDuration::hours(1));
        let failure = summary
            .recent_failures
            .iter()
            .find(|e| e.operation == "token_refresh")
            .expect("refresh failure audited");
        assert_eq!(failure.event_type, AuditEventType::Authentication);
    }

    #[tokio::test]
    async fn interactive_sign_in_stores_grant() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        let tokens = h
            .service
            .authenticate_interactive(&[READONLY], "gmail")
            .await
            .unwrap();
        assert!(tokens.is_valid());
        assert!(h.service.is_authenticated("gmail").await.unwrap());
        assert!(h.service.token_expiry("gmail").await.unwrap().is_some());
        assert_eq!(
            h.service.get_access_token(&[READONLY], "gmail").await.unwrap().as_str(),
            "ya29.interactive-1"
        );
    }

    #[tokio::test]
    async fn partial_consent_is_rejected() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        *h.authorizer.granted_override.lock().unwrap() = Some(READONLY.to_string());

        let err = h
            .service
            .authenticate_interactive(&[READONLY, MODIFY], "gmail")
            .await
            .unwrap_err();
        match err {
            AuthError::ScopeNotGranted { missing } => assert_eq!(missing, vec![MODIFY]),
            other => panic!("expected ScopeNotGranted, got {other:?}"),
        }
        assert!(!h.service.is_authenticated("gmail").await.unwrap());
    }

    #[tokio::test]
    async fn scope_expansion_is_noop_when_already_granted() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY, MODIFY], 3600, true).await;

        let expanded = h
            .service
            .expand_scopes("gmail", &[MODIFY], "gmail")
            .await
            .unwrap();
        assert!(!expanded);
        assert_eq!(h.authorizer.interactive(), 0);
    }

    #[tokio::test]
    async fn scope_expansion_requests_union() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 3600, true).await;

        let expanded = h
            .service
            .expand_scopes("gmail", &[MODIFY], "gmail_modify")
            .await
            .unwrap();
        assert!(expanded);
        assert_eq!(h.authorizer.interactive(), 1);
        assert_eq!(
            h.service.granted_scopes("gmail_modify").await.unwrap(),
            scope_set(&[READONLY, MODIFY])
        );
        // The original grant is untouched.
        assert_eq!(h.service.granted_scopes("gmail").await.unwrap(), scope_set(&[READONLY]));
    }

    #[tokio::test]
    async fn scope_expansion_keeps_scopes_of_existing_target() {
        const LABELS: &str = "https://www.googleapis.com/auth/gmail.labels";
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 3600, true).await;
        h.seed("gmail_ext", &[LABELS], 3600, true).await;

        let expanded = h
            .service
            .expand_scopes("gmail", &[MODIFY], "gmail_ext")
            .await
            .unwrap();
        assert!(expanded);
        assert_eq!(
            h.service.granted_scopes("gmail_ext").await.unwrap(),
            scope_set(&[READONLY, MODIFY, LABELS])
        );
    }

    #[tokio::test]
    async fn sign_out_removes_everything() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 3600, true).await;

        let outcome = h.service.sign_out("gmail").await.unwrap();
        assert_eq!(outcome.attempted, 6);
        assert_eq!(outcome.succeeded, 6);
        assert!(outcome.is_complete());
        assert_eq!(h.authorizer.revoke_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        for key in TokenKeys::new("gmail").all() {
            assert!(!h.store().exists(key).await.unwrap(), "{key} left behind");
        }
        let trail = h
            .vault
            .audit
            .get_audit_trail(Utc::now() - ChronoDuration::minutes(1), Utc::now());
        assert!(trail.iter().any(|e| e.operation == "sign_out" && e.success));
        assert!(!trail.iter().any(|e| e.operation == "sign_out_partial"));
    }

    /// Store whose removal of one key always fails.
    struct FlakyStore {
        inner: Arc<dyn CredentialStore>,
        broken_key: String,
    }

    #[async_trait::async_trait]
    impl CredentialStore for FlakyStore {
        async fn store(&self, key: &str, value: &str) -> inboxguard_vault::Result<()> {
            self.inner.store(key, value).await
        }
        async fn retrieve(&self, key: &str) -> inboxguard_vault::Result<Zeroizing<String>> {
            self.inner.retrieve(key).await
        }
        async fn remove(&self, key: &str) -> inboxguard_vault::Result<()> {
            if key == self.broken_key {
                return Err(VaultError::EncryptionFailed {
                    reason: "keychain locked".into(),
                });
            }
            self.inner.remove(key).await
        }
        async fn exists(&self, key: &str) -> inboxguard_vault::Result<bool> {
            self.inner.exists(key).await
        }
    }

    #[tokio::test]
    async fn partial_sign_out_is_success_but_audited_as_partial() {
        let h = Harness::new(ScriptedAuthorizer::default()).await;
        h.seed("gmail", &[READONLY], 3600, true).await;
        let flaky = Arc::new(FlakyStore {
            inner: h.store(),
            broken_key: "gmail_refresh_token".to_string(),
        });
        let service = OAuthService::new(flaky, h.authorizer.clone(), h.vault.audit.clone());

        let outcome = service.sign_out("gmail").await.unwrap();
        assert!(outcome.is_partial());
        assert_eq!(outcome.succeeded, 5);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("refresh_token:"));

        let trail = h
            .vault
            .audit
            .get_audit_trail(Utc::now() - ChronoDuration::minutes(1), Utc::now());
        assert!(trail.iter().any(|e| e.operation == "sign_out_partial"));
        assert!(!trail.iter().any(|e| e.operation == "sign_out"));
    }

    #[tokio::test]
    async fn sign_out_fails_when_nothing_can_be_removed() {
        struct LockedStore;

        #[async_trait::async_trait]
        impl CredentialStore for LockedStore {
            async fn store(&self, _: &str, _: &str) -> inboxguard_vault::Result<()> {
                Ok(())
            }
            async fn retrieve(&self, key: &str) -> inboxguard_vault::Result<Zeroizing<String>> {
                Err(VaultError::CredentialNotFound { key: key.into() })
            }
            async fn remove(&self, _: &str) -> inboxguard_vault::Result<()> {
                Err(VaultError::KeychainUnavailable {
                    reason: "locked".into(),
                })
            }
            async fn exists(&self, _: &str) -> inboxguard_vault::Result<bool> {
                Ok(false)
            }
        }

        let h = Harness::new(ScriptedAuthorizer::default()).await;
        let service = OAuthService::new(Arc::new(LockedStore), h.authorizer.clone(), h.vault.audit.clone());
        let err = service.sign_out("gmail").await.unwrap_err();
        assert!(matches!(err, AuthError::RevocationFailed { .. }));
    }
}
