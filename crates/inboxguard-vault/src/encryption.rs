//! Credential encryption service.
//!
//! Puts one contract in front of whichever [`PlatformCryptoBackend`] the
//! vault was built with. Callers pass the credential key as `context`; it is
//! bound into the ciphertext as associated data, so a value sealed for
//! `gmail_access_token` cannot be opened as `openai_api_key`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::platform::PlatformCryptoBackend;

const HEALTH_SAMPLE: &str = "inboxguard-encryption-health-sample";
const HEALTH_CONTEXT: &str = "inboxguard_health_check";

/// Outcome of [`CredentialEncryptionService::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionHealthReport {
    pub healthy: bool,
    pub can_encrypt: bool,
    pub can_decrypt: bool,
    pub key_generation_works: bool,
    pub backend: String,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Point-in-time view of the service. Contains no secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionStatus {
    pub initialized: bool,
    pub backend: String,
    pub platform: String,
    pub encrypt_operations: u64,
    pub decrypt_operations: u64,
    pub failed_operations: u64,
}

/// Encrypts and decrypts credential values through a platform backend.
pub struct CredentialEncryptionService {
    backend: Arc<dyn PlatformCryptoBackend>,
    initialized: AtomicBool,
    encrypts: AtomicU64,
    decrypts: AtomicU64,
    failures: AtomicU64,
}

impl CredentialEncryptionService {
    pub fn new(backend: Arc<dyn PlatformCryptoBackend>) -> Self {
        Self {
            backend,
            initialized: AtomicBool::new(false),
            encrypts: AtomicU64::new(0),
            decrypts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Prove the backend works with one round trip. Idempotent.
    pub fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let sealed = self.backend.protect(HEALTH_SAMPLE.as_bytes(), HEALTH_CONTEXT.as_bytes())?;
        let mut opened = self.backend.unprotect(&sealed, HEALTH_CONTEXT.as_bytes())?;
        let matches = opened == HEALTH_SAMPLE.as_bytes();
        crypto::secure_clear(&mut opened);
        if !matches {
            return Err(VaultError::EncryptionFailed {
                reason: "backend round trip returned different data".into(),
            });
        }

        self.initialized.store(true, Ordering::Release);
        tracing::info!(backend = self.backend.name(), "credential encryption ready");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(VaultError::Configuration {
                reason: "credential encryption service is not initialized".into(),
            })
        }
    }

    /// Encrypt `plain_text`, binding `context` (usually the credential key).
    pub fn encrypt(&self, plain_text: &str, context: Option<&str>) -> Result<Vec<u8>> {
        self.ensure_initialized()?;
        let aad = context.unwrap_or_default().as_bytes();
        match self.backend.protect(plain_text.as_bytes(), aad) {
            Ok(sealed) => {
                self.encrypts.fetch_add(1, Ordering::Relaxed);
                Ok(sealed)
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(backend = self.backend.name(), error = %e, "encryption failed");
                Err(e)
            }
        }
    }

    /// Decrypt a value produced by [`encrypt`](Self::encrypt) under the same
    /// `context`.
    pub fn decrypt(&self, cipher_text: &[u8], context: Option<&str>) -> Result<Zeroizing<String>> {
        self.ensure_initialized()?;
        let aad = context.unwrap_or_default().as_bytes();
        let opened = self.backend.unprotect(cipher_text, aad).and_then(|bytes| {
            String::from_utf8(bytes).map_err(|e| {
                let mut bytes = e.into_bytes();
                crypto::secure_clear(&mut bytes);
                VaultError::DecryptionFailed {
                    reason: "decrypted credential is not UTF-8".into(),
                }
            })
        });

        match opened {
            Ok(text) => {
                self.decrypts.fetch_add(1, Ordering::Relaxed);
                Ok(Zeroizing::new(text))
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(backend = self.backend.name(), error = %e, "decryption failed");
                Err(e)
            }
        }
    }

    /// 32 fresh random bytes, cleared on drop.
    pub fn generate_master_key(&self) -> Result<Zeroizing<[u8; crypto::KEY_LEN]>> {
        let mut bytes = crypto::random_bytes(crypto::KEY_LEN)?;
        let mut key = Zeroizing::new([0u8; crypto::KEY_LEN]);
        key.copy_from_slice(&bytes);
        crypto::secure_clear(&mut bytes);
        Ok(key)
    }

    /// Full encrypt/decrypt round trip with a literal sample. Each capability
    /// is reported on its own; this never fails.
    pub fn health_check(&self) -> EncryptionHealthReport {
        let mut error = None;

        let sealed = match self.backend.protect(HEALTH_SAMPLE.as_bytes(), HEALTH_CONTEXT.as_bytes()) {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                error = Some(format!("encrypt: {e}"));
                None
            }
        };
        let can_encrypt = sealed.is_some();

        let can_decrypt = match sealed {
            Some(sealed) => match self.backend.unprotect(&sealed, HEALTH_CONTEXT.as_bytes()) {
                Ok(mut opened) => {
                    let ok = opened == HEALTH_SAMPLE.as_bytes();
                    crypto::secure_clear(&mut opened);
                    if !ok {
                        error = Some("decrypt: round trip returned different data".into());
                    }
                    ok
                }
                Err(e) => {
                    error = Some(format!("decrypt: {e}"));
                    false
                }
            },
            None => false,
        };

        let key_generation_works = match self.generate_master_key() {
            Ok(key) => key.iter().any(|b| *b != 0),
            Err(e) => {
                error.get_or_insert_with(|| format!("key generation: {e}"));
                false
            }
        };

        let healthy = can_encrypt && can_decrypt && key_generation_works;
        if !healthy {
            tracing::warn!(backend = self.backend.name(), error = ?error, "encryption health check failed");
        }

        EncryptionHealthReport {
            healthy,
            can_encrypt,
            can_decrypt,
            key_generation_works,
            backend: self.backend.name().to_string(),
            error,
            checked_at: Utc::now(),
        }
    }

    pub fn status(&self) -> EncryptionStatus {
        EncryptionStatus {
            initialized: self.is_initialized(),
            backend: self.backend.name().to_string(),
            platform: std::env::consts::OS.to_string(),
            encrypt_operations: self.encrypts.load(Ordering::Relaxed),
            decrypt_operations: self.decrypts.load(Ordering::Relaxed),
            failed_operations: self.failures.load(Ordering::Relaxed),
        }
    }
}
