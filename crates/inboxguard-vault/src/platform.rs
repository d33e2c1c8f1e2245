//! Per-OS encryption primitive.
//!
//! A [`PlatformCryptoBackend`] encrypts opaque blobs so that only the current
//! user session can read them back. The native backend keeps a random 256-bit
//! wrapping key inside the OS keychain (see [`crate::keychain`]) and seals
//! data with AES-256-GCM, binding the caller's context as associated data.
//! The wrapping key is created lazily on first use and never leaves the
//! keychain except in a zeroizing buffer.
//!
//! [`DerivedKeyBackend`] is the keychain-independent fallback: it seals with
//! a master key produced by [`crate::master_key::MasterKeyManager`].

use std::sync::{Arc, Mutex};

use zeroize::Zeroizing;

use crate::config::BackendKind;
use crate::crypto;
use crate::error::{Result, VaultError};
use crate::keychain::KeychainProvider;
use crate::master_key::{self, MasterKeyManager};

/// Keychain entry holding the wrapping key.
pub const WRAPPING_KEY_ENTRY: &str = "wrapping-key";

/// Encrypt/decrypt primitive bound to the current user session.
pub trait PlatformCryptoBackend: Send + Sync {
    /// Encrypt `plaintext`, binding `context` into the integrity check.
    fn protect(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>>;

    /// Reverse [`protect`](Self::protect). Fails if `context` differs.
    fn unprotect(&self, ciphertext: &[u8], context: &[u8]) -> Result<Vec<u8>>;

    /// Identifier reported in status objects.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Keychain-wrapped backend
// ---------------------------------------------------------------------------

/// Native backend: AES-256-GCM under a wrapping key held by a keychain.
pub struct KeychainBackend {
    keychain: Arc<dyn KeychainProvider>,
    key: Mutex<Option<Zeroizing<Vec<u8>>>>,
}

impl KeychainBackend {
    pub fn new(keychain: Arc<dyn KeychainProvider>) -> Self {
        Self {
            keychain,
            key: Mutex::new(None),
        }
    }

    /// Run `f` with the wrapping key, loading or creating it on first use.
    fn with_key<T>(&self, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let mut slot = self
            .key
            .lock()
            .map_err(|_| VaultError::Internal("wrapping key lock poisoned".into()))?;

        if slot.is_none() {
            let key = match self.keychain.get_secret(WRAPPING_KEY_ENTRY) {
                Ok(existing) if existing.len() == crypto::KEY_LEN => Zeroizing::new(existing),
                Ok(existing) => {
                    return Err(VaultError::InvalidKeyLength {
                        expected: crypto::KEY_LEN,
                        actual: existing.len(),
                    });
                }
                Err(VaultError::KeyNotFound { .. }) => {
                    let fresh = Zeroizing::new(crypto::random_bytes(crypto::KEY_LEN)?);
                    self.keychain.set_secret(WRAPPING_KEY_ENTRY, fresh.as_slice())?;
                    tracing::info!(
                        keychain = self.keychain.backend_name(),
                        "created platform wrapping key"
                    );
                    fresh
                }
                Err(e) => return Err(e),
            };
            *slot = Some(key);
        }

        match slot.as_ref() {
            Some(key) => f(key.as_slice()),
            None => Err(VaultError::Internal("wrapping key missing after load".into())),
        }
    }
}

impl PlatformCryptoBackend for KeychainBackend {
    fn protect(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        self.with_key(|key| crypto::seal(plaintext, key, context))
    }

    fn unprotect(&self, ciphertext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        self.with_key(|key| crypto::open(ciphertext, key, context))
    }

    fn name(&self) -> &'static str {
        self.keychain.backend_name()
    }
}

// ---------------------------------------------------------------------------
// Master-key-derived fallback
// ---------------------------------------------------------------------------

/// Fallback backend sealing with a caller-supplied 256-bit master key.
pub struct DerivedKeyBackend {
    key: Zeroizing<Vec<u8>>,
}

impl DerivedKeyBackend {
    /// Build from raw key bytes, which must be exactly 32 bytes long.
    pub fn new(key: Vec<u8>) -> Result<Self> {
        let key = Zeroizing::new(key);
        if key.len() != crypto::KEY_LEN {
            return Err(VaultError::InvalidKeyLength {
                expected: crypto::KEY_LEN,
                actual: key.len(),
            });
        }
        Ok(Self { key })
    }
}

impl PlatformCryptoBackend for DerivedKeyBackend {
    fn protect(&self, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        crypto::seal(plaintext, self.key.as_slice(), context)
    }

    fn unprotect(&self, ciphertext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        crypto::open(ciphertext, self.key.as_slice(), context)
    }

    fn name(&self) -> &'static str {
        "derived-master-key"
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build the backend selected by `kind`.
///
/// `Platform` wraps with a key held by `keychain`; on the native keychain
/// that is macOS Keychain Services, the Linux Secret Service or the Windows
/// Credential Manager, and any other OS has already failed with
/// [`VaultError::PlatformNotSupported`]. `Derived` seals with the master key
/// derived by `master_keys`.
pub fn select_backend(
    kind: BackendKind,
    keychain: Arc<dyn KeychainProvider>,
    master_keys: &MasterKeyManager,
) -> Result<Arc<dyn PlatformCryptoBackend>> {
    Ok(match kind {
        BackendKind::Platform => Arc::new(KeychainBackend::new(keychain)),
        BackendKind::Derived => {
            let encoded = master_keys.derive_master_key()?;
            let raw = master_key::decode_key(&encoded)?;
            Arc::new(DerivedKeyBackend::new(raw.to_vec())?)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keychain::MemoryKeychain;

    #[test]
    fn keychain_backend_creates_key_once() {
        let keychain = Arc::new(MemoryKeychain::new());
        let backend = KeychainBackend::new(keychain.clone());

        let sealed = backend.protect(b"token", b"gmail_access_token").unwrap();
        let stored = keychain.get_secret(WRAPPING_KEY_ENTRY).unwrap();
        assert_eq!(stored.len(), crypto::KEY_LEN);

        // A second backend over the same keychain reuses the key.
        let other = KeychainBackend::new(keychain.clone());
        assert_eq!(
            other.unprotect(&sealed, b"gmail_access_token").unwrap(),
            b"token"
        );
        assert_eq!(keychain.get_secret(WRAPPING_KEY_ENTRY).unwrap(), stored);
    }

    #[test]
    fn context_is_bound() {
        let backend = KeychainBackend::new(Arc::new(MemoryKeychain::new()));
        let sealed = backend.protect(b"secret", b"providerA").unwrap();
        assert!(matches!(
            backend.unprotect(&sealed, b"providerB"),
            Err(VaultError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn rejects_corrupt_wrapping_key() {
        let keychain = Arc::new(MemoryKeychain::new());
        keychain.set_secret(WRAPPING_KEY_ENTRY, &[1, 2, 3]).unwrap();
        let backend = KeychainBackend::new(keychain);
        assert!(matches!(
            backend.protect(b"x", b"ctx"),
            Err(VaultError::InvalidKeyLength { expected: 32, actual: 3 })
        ));
    }

    #[test]
    fn derived_backend_requires_32_bytes() {
        assert!(DerivedKeyBackend::new(vec![0u8; 16]).is_err());
        let backend = DerivedKeyBackend::new(vec![7u8; 32]).unwrap();
        let sealed = backend.protect(b"hello", b"ctx").unwrap();
        assert_eq!(backend.unprotect(&sealed, b"ctx").unwrap(), b"hello");
    }
}
