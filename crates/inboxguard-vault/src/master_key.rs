//! Master key generation, derivation and direct encryption.
//!
//! A master key is 32 random or derived bytes, carried around as canonical
//! padded base64 (44 characters). It protects data that has to outlive the
//! platform backend (exports, backups) and seeds the [`DerivedKeyBackend`]
//! fallback.
//!
//! Direct encryption uses AES-256-GCM with a 16-byte IV. The wire format is
//! `base64(IV || ciphertext || tag)`.
//!
//! [`DerivedKeyBackend`]: crate::platform::DerivedKeyBackend

use std::sync::Arc;

use aes_gcm::AesGcm;
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{Result, VaultError};
use crate::keychain::{self, KeychainProvider};

/// AES-256-GCM with a 128-bit IV.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// IV length of the master-key wire format.
pub const IV_LEN: usize = 16;

/// Length of a canonical base64 encoding of a 32-byte key.
pub const ENCODED_KEY_LEN: usize = 44;

/// Keychain entry holding the random per-install seed.
pub const INSTALL_SEED_ENTRY: &str = "install-seed";

const INSTALL_SEED_LEN: usize = 32;
const DERIVATION_LABEL: &[u8] = b"inboxguard-master-key-v1";
const VALIDATION_SAMPLE: &str = "inboxguard master key validation";

/// Fill `buf` from the OS random source, falling back to the thread-local
/// CSPRNG if the OS source fails.
fn fill_random(buf: &mut [u8]) {
    if SystemRandom::new().fill(buf).is_err() {
        tracing::warn!("system random source failed, falling back to thread_rng");
        rand::thread_rng().fill_bytes(buf);
    }
}

/// Generates, derives and validates master keys.
pub struct MasterKeyManager {
    keychain: Arc<dyn KeychainProvider>,
}

impl MasterKeyManager {
    /// `keychain` persists the install seed used by
    /// [`derive_master_key`](Self::derive_master_key).
    pub fn new(keychain: Arc<dyn KeychainProvider>) -> Self {
        Self { keychain }
    }

    /// A fresh random key. Irreproducible: store it or lose it.
    pub fn generate_master_key(&self) -> Result<String> {
        let mut raw = Zeroizing::new([0u8; crypto::KEY_LEN]);
        fill_random(raw.as_mut_slice());
        Ok(BASE64.encode(raw.as_slice()))
    }

    /// Deterministically derive the master key for this install.
    ///
    /// Layers a random install seed (created once, kept in the keychain)
    /// with machine identifiers, then hashes twice with SHA-256. The same
    /// key comes back on every call until the seed is deleted.
    pub fn derive_master_key(&self) -> Result<String> {
        let seed = Zeroizing::new(self.install_seed()?);

        let host = keychain::hostname();
        let user = keychain::username();
        let machine = machine_id();

        let mut material = Zeroizing::new(Vec::with_capacity(256));
        material.extend_from_slice(DERIVATION_LABEL);
        for layer in [
            seed.as_slice(),
            host.as_bytes(),
            user.as_bytes(),
            machine.as_bytes(),
            std::env::consts::OS.as_bytes(),
            std::env::consts::ARCH.as_bytes(),
        ] {
            // Length-prefix each layer so adjacent layers cannot bleed into
            // each other.
            material.extend_from_slice(&(layer.len() as u32).to_be_bytes());
            material.extend_from_slice(layer);
        }

        let mut key = crypto::double_sha256(&material);
        let encoded = BASE64.encode(key);
        crypto::secure_clear(&mut key);

        tracing::debug!("derived master key from install seed and machine identity");
        Ok(encoded)
    }

    fn install_seed(&self) -> Result<Vec<u8>> {
        match self.keychain.get_secret(INSTALL_SEED_ENTRY) {
            Ok(seed) if seed.len() == INSTALL_SEED_LEN => Ok(seed),
            Ok(seed) => Err(VaultError::InvalidKeyLength {
                expected: INSTALL_SEED_LEN,
                actual: seed.len(),
            }),
            Err(VaultError::KeyNotFound { .. }) => {
                let mut seed = vec![0u8; INSTALL_SEED_LEN];
                fill_random(&mut seed);
                self.keychain
                    .set_secret(INSTALL_SEED_ENTRY, &seed)
                    .map_err(|e| VaultError::KeyGenerationFailed {
                        reason: format!("failed to persist install seed: {e}"),
                    })?;
                tracing::info!(
                    keychain = self.keychain.backend_name(),
                    "created master key install seed"
                );
                Ok(seed)
            }
            Err(e) => Err(e),
        }
    }

    /// Check that `key` is a usable master key.
    ///
    /// Format errors are reported with a length-specific error; a
    /// well-formed key must then survive an encrypt/decrypt round trip.
    pub fn validate_master_key(&self, key: &str) -> Result<bool> {
        let raw = decode_key(key)?;
        drop(raw);

        let sealed = encrypt_with_master_key(VALIDATION_SAMPLE, key)?;
        let opened = decrypt_with_master_key(&sealed, key)?;
        Ok(opened.as_str() == VALIDATION_SAMPLE)
    }

    pub fn encrypt_with_master_key(&self, plain_text: &str, key: &str) -> Result<String> {
        encrypt_with_master_key(plain_text, key)
    }

    pub fn decrypt_with_master_key(&self, cipher_text: &str, key: &str) -> Result<Zeroizing<String>> {
        decrypt_with_master_key(cipher_text, key)
    }
}

/// Strictly decode a base64 master key into its 32 raw bytes.
pub fn decode_key(key: &str) -> Result<Zeroizing<Vec<u8>>> {
    if key.len() != ENCODED_KEY_LEN {
        return Err(VaultError::InvalidKeyEncoding {
            expected: ENCODED_KEY_LEN,
            actual: key.len(),
        });
    }
    let raw = Zeroizing::new(BASE64.decode(key.as_bytes()).map_err(|e| {
        VaultError::Validation {
            reason: format!("master key is not canonical base64: {e}"),
        }
    })?);
    if raw.len() != crypto::KEY_LEN {
        return Err(VaultError::InvalidKeyLength {
            expected: crypto::KEY_LEN,
            actual: raw.len(),
        });
    }
    Ok(raw)
}

fn cipher_for(key: &str) -> Result<Aes256Gcm16> {
    let raw = decode_key(key)?;
    Aes256Gcm16::new_from_slice(raw.as_slice()).map_err(|_| VaultError::InvalidKeyLength {
        expected: crypto::KEY_LEN,
        actual: raw.len(),
    })
}

/// Encrypt `plain_text` under a base64 master key.
pub fn encrypt_with_master_key(plain_text: &str, key: &str) -> Result<String> {
    let cipher = cipher_for(key)?;

    let mut iv = [0u8; IV_LEN];
    fill_random(&mut iv);

    let ciphertext = cipher
        .encrypt(aes_gcm::Nonce::<U16>::from_slice(&iv), plain_text.as_bytes())
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "AES-GCM encryption with master key failed".into(),
        })?;

    let mut wire = Vec::with_capacity(IV_LEN + ciphertext.len());
    wire.extend_from_slice(&iv);
    wire.extend_from_slice(&ciphertext);
    crypto::secure_clear(&mut iv);

    Ok(BASE64.encode(wire))
}

/// Decrypt a value produced by [`encrypt_with_master_key`].
pub fn decrypt_with_master_key(cipher_text: &str, key: &str) -> Result<Zeroizing<String>> {
    let wire = BASE64
        .decode(cipher_text.trim().as_bytes())
        .map_err(|e| VaultError::DecryptionFailed {
            reason: format!("ciphertext is not valid base64: {e}"),
        })?;
    if wire.len() < IV_LEN {
        return Err(VaultError::DecryptionFailed {
            reason: format!("ciphertext is {} bytes, shorter than the IV", wire.len()),
        });
    }

    let cipher = cipher_for(key)?;
    let (iv, body) = wire.split_at(IV_LEN);
    let plain = Zeroizing::new(
        cipher
            .decrypt(aes_gcm::Nonce::<U16>::from_slice(iv), body)
            .map_err(|_| VaultError::DecryptionFailed {
                reason: "wrong master key or corrupted ciphertext".into(),
            })?,
    );

    let text = std::str::from_utf8(plain.as_slice()).map_err(|_| VaultError::DecryptionFailed {
        reason: "decrypted data is not UTF-8".into(),
    })?;
    Ok(Zeroizing::new(text.to_string()))
}

/// Stable machine identifier where the OS exposes one.
fn machine_id() -> String {
    #[cfg(target_os = "linux")]
    {
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            if let Ok(id) = std::fs::read_to_string(path) {
                let id = id.trim();
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }
    }
    String::new()
}
