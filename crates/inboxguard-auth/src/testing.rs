//! Scripted authorization server for unit tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use inboxguard_vault::{CredentialStore, Vault, VaultConfig};

use crate::authorizer::AuthorizationProvider;
use crate::error::{AuthError, Result};
use crate::oauth::TokenResponse;
use crate::service::OAuthService;
use crate::tokens::{self, TokenKeys, TokenSet, scope_set};

#[derive(Default)]
pub(crate) struct ScriptedAuthorizer {
    pub interactive_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub revoke_calls: AtomicUsize,
    /// Held inside `refresh` to widen race windows.
    pub refresh_delay: Duration,
    /// Errors returned by the next refresh calls, in order.
    pub refresh_failures: Mutex<VecDeque<AuthError>>,
    /// Scope string to report instead of the requested scopes.
    pub granted_override: Mutex<Option<String>>,
}

impl ScriptedAuthorizer {
    pub fn with_refresh_delay(delay: Duration) -> Self {
        Self {
            refresh_delay: delay,
            ..Self::default()
        }
    }

    pub fn fail_next_refresh(&self, err: AuthError) {
        self.refresh_failures.lock().unwrap().push_back(err);
    }

    pub fn interactive(&self) -> usize {
        self.interactive_calls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

fn response(json: serde_json::Value) -> TokenResponse {
    serde_json::from_value(json).unwrap()
}

#[async_trait]
impl AuthorizationProvider for ScriptedAuthorizer {
    async fn authorize_interactive(&self, scopes: &BTreeSet<String>) -> Result<TokenResponse> {
        let n = self.interactive_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let granted = self
            .granted_override
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| scopes.iter().cloned().collect::<Vec<_>>().join(" "));
        Ok(response(serde_json::json!({
            "access_token": format!("ya29.interactive-{n}"),
            "refresh_token": format!("1//refresh-{n}"),
            "expires_in": 3599,
            "token_type": "Bearer",
            "scope": granted,
        })))
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenResponse> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }
        let failure = self.refresh_failures.lock().unwrap().pop_front();
        if let Some(err) = failure {
            return Err(err);
        }
        Ok(response(serde_json::json!({
            "access_token": format!("ya29.refreshed-{n}"),
            "expires_in": 3599,
        })))
    }

    async fn revoke(&self, _token: &str) -> Result<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct Harness {
    pub vault: Vault,
    pub authorizer: Arc<ScriptedAuthorizer>,
    pub service: Arc<OAuthService>,
}

impl Harness {
    pub async fn new(authorizer: ScriptedAuthorizer) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(&VaultConfig::ephemeral(), dir.path())
            .await
            .unwrap();
        let authorizer = Arc::new(authorizer);
        let service = Arc::new(OAuthService::new(
            vault.storage.clone(),
            authorizer.clone(),
            vault.audit.clone(),
        ));
        Self {
            vault,
            authorizer,
            service,
        }
    }

    pub fn store(&self) -> Arc<dyn CredentialStore> {
        self.vault.storage.clone()
    }

    /// Seed a token set that expires `expires_in_secs` from now.
    pub async fn seed(&self, prefix: &str, scopes: &[&str], expires_in_secs: i64, refresh: bool) {
        let tokens = TokenSet {
            access_token: format!("ya29.seeded-{prefix}"),
            refresh_token: refresh.then(|| "1//seeded".to_string()),
            expires_in: expires_in_secs,
            issued_at: chrono::Utc::now().timestamp(),
            scopes: scope_set(scopes),
            token_type: "Bearer".to_string(),
        };
        tokens::save(self.store().as_ref(), &TokenKeys::new(prefix), &tokens)
            .await
            .unwrap();
    }
}
