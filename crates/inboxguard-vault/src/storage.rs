//! Secure storage manager: the vault proper.
//!
//! Maps string keys to encrypted credential blobs. Values are encrypted by
//! the [`CredentialEncryptionService`] with the key as associated data,
//! cached in encrypted form for the session, and optionally persisted to a
//! [`VaultDatabase`]. Every store/retrieve/remove is audited with the key
//! masked.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::audit::{AuditEventType, CredentialOperation, SecurityAuditLogger, SecurityEvent};
use crate::db::VaultDatabase;
use crate::encryption::{CredentialEncryptionService, EncryptionHealthReport};
use crate::error::{Result, VaultError};

const MAX_KEY_LEN: usize = 256;
/// Keys under this prefix belong to the manager itself and are rejected
/// for callers.
const RESERVED_PREFIX: &str = "__inboxguard_";
const HEALTH_KEY_PREFIX: &str = "__inboxguard_health_";
const HEALTH_VALUE: &str = "storage-health-check-value";

// ---------------------------------------------------------------------------
// Credential contract
// ---------------------------------------------------------------------------

/// Provider-agnostic credential contract.
///
/// Keys follow `<provider>_access_token`, `<provider>_refresh_token`, and so
/// on. Implementations keep values encrypted at rest.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn store(&self, key: &str, value: &str) -> Result<()>;

    /// Fails with [`VaultError::CredentialNotFound`] when absent.
    async fn retrieve(&self, key: &str) -> Result<Zeroizing<String>>;

    /// Idempotent.
    async fn remove(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle of the storage manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    Uninitialized,
    Initializing,
    Ready,
}

struct CachedCredential {
    ciphertext: Vec<u8>,
    cached_at: DateTime<Utc>,
}

/// Outcome of [`SecureStorageManager::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageHealthReport {
    pub healthy: bool,
    pub can_store: bool,
    pub can_retrieve: bool,
    pub can_remove: bool,
    pub failed_stages: Vec<String>,
    pub encryption: EncryptionHealthReport,
    pub checked_at: DateTime<Utc>,
}

/// Point-in-time view of the storage manager. Contains no secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatus {
    pub state: StorageState,
    pub persistent: bool,
    pub cached_credentials: usize,
    pub stored_credentials: usize,
    pub oldest_cache_entry: Option<DateTime<Utc>>,
    pub stores: u64,
    pub retrievals: u64,
    pub removals: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    stores: AtomicU64,
    retrievals: AtomicU64,
    removals: AtomicU64,
    failures: AtomicU64,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Encrypted key/value vault with a session cache and audit trail.
pub struct SecureStorageManager {
    encryption: Arc<CredentialEncryptionService>,
    audit: Arc<SecurityAuditLogger>,
    db: Option<Arc<VaultDatabase>>,
    state: RwLock<StorageState>,
    cache: RwLock<HashMap<String, CachedCredential>>,
    counters: Counters,
}

impl SecureStorageManager {
    /// A manager that keeps credentials in memory only.
    pub fn new(encryption: Arc<CredentialEncryptionService>, audit: Arc<SecurityAuditLogger>) -> Self {
        Self {
            encryption,
            audit,
            db: None,
            state: RwLock::new(StorageState::Uninitialized),
            cache: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Persist credentials to `db` as well as caching them.
    pub fn with_database(mut self, db: Arc<VaultDatabase>) -> Self {
        self.db = Some(db);
        self
    }

    /// Bring the manager to `Ready`. Safe to call more than once.
    pub async fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                StorageState::Ready => return Ok(()),
                StorageState::Initializing => {
                    return Err(VaultError::Configuration {
                        reason: "storage initialization already in progress".into(),
                    });
                }
                StorageState::Uninitialized => *state = StorageState::Initializing,
            }
        }

        let result = self.encryption.initialize();
        let mut state = self.state.write().await;
        match result {
            Ok(()) => {
                *state = StorageState::Ready;
                tracing::info!(persistent = self.db.is_some(), "secure storage ready");
                self.audit.log_security_event(SecurityEvent::new(
                    AuditEventType::Configuration,
                    "storage_initialize",
                ));
                Ok(())
            }
            Err(e) => {
                *state = StorageState::Uninitialized;
                tracing::error!(error = %e, "secure storage failed to initialize");
                self.audit.log_security_event(
                    SecurityEvent::new(AuditEventType::Configuration, "storage_initialize").failed(&e),
                );
                Err(e)
            }
        }
    }

    pub async fn state(&self) -> StorageState {
        *self.state.read().await
    }

    async fn ensure_ready(&self) -> Result<()> {
        match *self.state.read().await {
            StorageState::Ready => Ok(()),
            other => Err(VaultError::Configuration {
                reason: format!("secure storage is not ready (state: {other:?})"),
            }),
        }
    }

    fn validate_key(key: &str) -> Result<()> {
        if key.trim().is_empty() {
            return Err(VaultError::Validation {
                reason: "credential key must not be empty".into(),
            });
        }
        if key.len() > MAX_KEY_LEN {
            return Err(VaultError::Validation {
                reason: format!("credential key longer than {MAX_KEY_LEN} bytes"),
            });
        }
        if key.starts_with(RESERVED_PREFIX) {
            return Err(VaultError::Validation {
                reason: format!("credential keys starting with {RESERVED_PREFIX} are reserved"),
            });
        }
        Ok(())
    }

    /// Readiness and key checks for a caller's operation; a rejection is
    /// audited like any other failure.
    async fn admit(&self, op: CredentialOperation, key: &str) -> Result<()> {
        if let Err(e) = self.ensure_ready().await {
            return Err(self.fail(op, key, e));
        }
        Self::validate_key(key).map_err(|e| self.fail(op, key, e))
    }

    fn fail(&self, op: CredentialOperation, key: &str, err: VaultError) -> VaultError {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        self.audit.log_credential_operation(op, key, Some(&err.to_string()));
        err
    }

    // -- Operations ---------------------------------------------------------

    /// Encrypt and store `value` under `key`, replacing any previous value.
    ///
    /// The value is fully encrypted before the single upsert, so readers see
    /// either the old or the new value.
    pub async fn store_credential(&self, key: &str, value: &str) -> Result<()> {
        self.admit(CredentialOperation::Store, key).await?;
        self.put(key, value).await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let op = CredentialOperation::Store;

        let ciphertext = self
            .encryption
            .encrypt(value, Some(key))
            .map_err(|e| self.fail(op, key, e))?;

        if let Some(db) = &self.db {
            db.upsert_credential(key, &ciphertext)
                .map_err(|e| self.fail(op, key, e))?;
        }

        self.cache.write().await.insert(
            key.to_string(),
            CachedCredential {
                ciphertext,
                cached_at: Utc::now(),
            },
        );

        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        self.audit.log_credential_operation(op, key, None);
        Ok(())
    }

    /// Decrypt and return the value under `key`.
    ///
    /// A value that no longer decrypts is evicted from cache and database
    /// and reported as [`VaultError::CredentialNotFound`].
    pub async fn retrieve_credential(&self, key: &str) -> Result<Zeroizing<String>> {
        self.admit(CredentialOperation::Retrieve, key).await?;
        self.get(key).await
    }

    async fn get(&self, key: &str) -> Result<Zeroizing<String>> {
        let op = CredentialOperation::Retrieve;

        let cached = self
            .cache
            .read()
            .await
            .get(key)
            .map(|c| c.ciphertext.clone());

        let ciphertext = match cached {
            Some(ciphertext) => ciphertext,
            None => {
                let persisted = match &self.db {
                    Some(db) => db.load_credential(key).map_err(|e| self.fail(op, key, e))?,
                    None => None,
                };
                match persisted {
                    Some(ciphertext) => {
                        self.cache.write().await.insert(
                            key.to_string(),
                            CachedCredential {
                                ciphertext: ciphertext.clone(),
                                cached_at: Utc::now(),
                            },
                        );
                        ciphertext
                    }
                    None => {
                        return Err(self.fail(op, key, VaultError::CredentialNotFound { key: key.into() }));
                    }
                }
            }
        };

        match self.encryption.decrypt(&ciphertext, Some(key)) {
            Ok(value) => {
                self.counters.retrievals.fetch_add(1, Ordering::Relaxed);
                self.audit.log_credential_operation(op, key, None);
                Ok(value)
            }
            Err(e) => {
                self.evict(key).await;
                self.audit.log_security_event(
                    SecurityEvent::new(AuditEventType::Security, "evict_undecryptable")
                        .with_key(key)
                        .failed(&e),
                );
                Err(self.fail(op, key, VaultError::CredentialNotFound { key: key.into() }))
            }
        }
    }

    async fn evict(&self, key: &str) {
        self.cache.write().await.remove(key);
        if let Some(db) = &self.db {
            if let Err(e) = db.delete_credential(key) {
                tracing::warn!(error = %e, "failed to evict undecryptable credential from database");
            }
        }
        tracing::warn!(
            key = %crate::audit::mask_credential_key(key),
            "evicted credential that failed to decrypt"
        );
    }

    /// Remove `key`. Removing an absent key succeeds.
    pub async fn remove_credential(&self, key: &str) -> Result<()> {
        self.admit(CredentialOperation::Remove, key).await?;
        self.delete(key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let op = CredentialOperation::Remove;

        if let Some(db) = &self.db {
            db.delete_credential(key).map_err(|e| self.fail(op, key, e))?;
        }
        if let Some(mut old) = self.cache.write().await.remove(key) {
            crate::crypto::secure_clear(&mut old.ciphertext);
        }

        self.counters.removals.fetch_add(1, Ordering::Relaxed);
        self.audit.log_credential_operation(op, key, None);
        Ok(())
    }

    /// Whether a value is stored under `key`. Does not decrypt.
    pub async fn credential_exists(&self, key: &str) -> Result<bool> {
        self.ensure_ready().await?;
        Self::validate_key(key)?;
        self.contains(key).await
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        if self.cache.read().await.contains_key(key) {
            return Ok(true);
        }
        match &self.db {
            Some(db) => db.credential_exists(key),
            None => Ok(false),
        }
    }

    /// All stored keys, sorted.
    pub async fn list_keys(&self) -> Result<Vec<String>> {
        self.ensure_ready().await?;

        let mut keys: BTreeSet<String> = self.cache.read().await.keys().cloned().collect();
        if let Some(db) = &self.db {
            keys.extend(db.list_keys()?);
        }
        Ok(keys
            .into_iter()
            .filter(|k| !k.starts_with(RESERVED_PREFIX))
            .collect())
    }

    /// Store, retrieve and remove a literal value, reporting every stage
    /// that failed, plus the encryption service's own health.
    pub async fn health_check(&self) -> StorageHealthReport {
        let encryption = self.encryption.health_check();
        let mut failed_stages = Vec::new();

        let ready = self.ensure_ready().await.is_ok();
        if !ready {
            failed_stages.push("initialize".to_string());
        }

        // Unique per check, so concurrent checks never share an entry.
        let key = format!("{HEALTH_KEY_PREFIX}{}", uuid::Uuid::new_v4().simple());

        let can_store = ready && self.put(&key, HEALTH_VALUE).await.is_ok();
        if ready && !can_store {
            failed_stages.push("store".to_string());
        }

        let can_retrieve = can_store
            && matches!(
                self.get(&key).await,
                Ok(v) if v.as_str() == HEALTH_VALUE
            );
        if ready && !can_retrieve {
            failed_stages.push("retrieve".to_string());
        }

        let can_remove = ready
            && self.delete(&key).await.is_ok()
            && !self.contains(&key).await.unwrap_or(true);
        if ready && !can_remove {
            failed_stages.push("remove".to_string());
        }

        let healthy = failed_stages.is_empty() && encryption.healthy;
        let mut event = SecurityEvent::new(AuditEventType::HealthCheck, "storage_health_check");
        if !healthy {
            event = event.failed(format!("failed stages: {}", failed_stages.join(", ")));
            tracing::warn!(stages = ?failed_stages, "storage health check failed");
        }
        self.audit.log_security_event(event);

        StorageHealthReport {
            healthy,
            can_store,
            can_retrieve,
            can_remove,
            failed_stages,
            encryption,
            checked_at: Utc::now(),
        }
    }

    pub async fn status(&self) -> StorageStatus {
        let state = *self.state.read().await;
        let (cached_credentials, oldest_cache_entry) = {
            let cache = self.cache.read().await;
            (cache.len(), cache.values().map(|c| c.cached_at).min())
        };
        let stored_credentials = match &self.db {
            Some(db) => db.credential_count().unwrap_or(0),
            None => cached_credentials,
        };

        StorageStatus {
            state,
            persistent: self.db.is_some(),
            cached_credentials,
            stored_credentials,
            oldest_cache_entry,
            stores: self.counters.stores.load(Ordering::Relaxed),
            retrievals: self.counters.retrievals.load(Ordering::Relaxed),
            removals: self.counters.removals.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl CredentialStore for SecureStorageManager {
    async fn store(&self, key: &str, value: &str) -> Result<()> {
        self.store_credential(key, value).await
    }

    async fn retrieve(&self, key: &str) -> Result<Zeroizing<String>> {
        self.retrieve_credential(key).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.remove_credential(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.credential_exists(key).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
