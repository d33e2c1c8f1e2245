//! AES-256-GCM sealing, hashing and buffer hygiene using the `ring` crate.
//!
//! This module provides the low-level primitives the rest of the vault is
//! built from:
//!
//! - **Sealing/opening**: AES-256-GCM with a random 96-bit nonce and
//!   caller-supplied associated data.  The sealed layout is
//!   `nonce (12) || ciphertext || tag (16)`.
//! - **Key stretching**: PBKDF2-HMAC-SHA256 for the file keychain's
//!   device-derived key.
//! - **Hashing**: SHA-256 and the double SHA-256 used by master key
//!   derivation.
//! - **Hygiene**: [`secure_clear`] overwrites a buffer with random bytes and
//!   then zeros.
//!
//! # Security Notes
//!
//! - The associated data is authenticated but not encrypted.  Opening with
//!   different associated data fails, which is what binds a ciphertext to
//!   the credential key it was stored under.
//! - With random 96-bit nonces the collision probability is negligible for
//!   far more encryptions than a desktop vault will ever perform.

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::digest;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroize;

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the GCM authentication tag in bytes.
pub const TAG_LEN: usize = 16;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 32;

/// PBKDF2 iteration count, 600,000 per OWASP 2023 for HMAC-SHA256.
const PBKDF2_ITERATIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(600_000) {
    Some(n) => n,
    None => unreachable!(),
};

static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations; each sealing
/// key built here is used exactly once with a fresh random nonce.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` under `key`, authenticating `aad` alongside it.
///
/// Returns `nonce || ciphertext || tag`.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] if the key length is wrong or
/// `ring` reports a failure.
pub fn seal(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(VaultError::EncryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::EncryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    let mut in_out = plaintext.to_vec();
    let sealed = sealing_key.seal_in_place_append_tag(Aad::from(aad), &mut in_out);
    if sealed.is_err() {
        secure_clear(&mut in_out);
        return Err(VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        });
    }

    let mut out = Vec::with_capacity(NONCE_LEN_BYTES + in_out.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&in_out);

    tracing::trace!(
        plaintext_len = plaintext.len(),
        sealed_len = out.len(),
        "sealed data"
    );

    Ok(out)
}

/// Decrypt a `nonce || ciphertext || tag` blob produced by [`seal`].
///
/// # Errors
///
/// Returns [`VaultError::DecryptionFailed`] if the blob is truncated, the key
/// is wrong, the data was tampered with, or `aad` differs from the value
/// used when sealing.
pub fn open(sealed: &[u8], key: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
    if key.len() != KEY_LEN {
        return Err(VaultError::DecryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }
    if sealed.len() < NONCE_LEN_BYTES + TAG_LEN {
        return Err(VaultError::DecryptionFailed {
            reason: format!(
                "sealed data is {} bytes, shorter than nonce and tag",
                sealed.len()
            ),
        });
    }

    let (nonce_part, ciphertext) = sealed.split_at(NONCE_LEN_BYTES);
    let mut nonce = [0u8; NONCE_LEN_BYTES];
    nonce.copy_from_slice(nonce_part);

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::DecryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;
    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = ciphertext.to_vec();
    let opened = opening_key
        .open_in_place(Aad::from(aad), &mut in_out)
        .map(|plaintext| plaintext.len());
    let plaintext_len = match opened {
        Ok(len) => len,
        Err(_) => {
            secure_clear(&mut in_out);
            return Err(VaultError::DecryptionFailed {
                reason: "authentication failed: wrong key, wrong context or corrupted data"
                    .into(),
            });
        }
    };

    // Drop the tag bytes in place so no copy of the plaintext is left behind.
    secure_clear(&mut in_out[plaintext_len..]);
    in_out.truncate(plaintext_len);

    tracing::trace!(
        sealed_len = sealed.len(),
        plaintext_len = plaintext_len,
        "opened data"
    );

    Ok(in_out)
}

// ---------------------------------------------------------------------------
// Key stretching and hashing
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from `password` and a known `salt` with PBKDF2.
pub fn derive_key_with_salt(password: &[u8], salt: &[u8], out: &mut [u8; KEY_LEN]) {
    pbkdf2::derive(PBKDF2_ALG, PBKDF2_ITERATIONS, salt, password, out);
}

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let hash = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_ref());
    out
}

/// `SHA-256(SHA-256(data))`, clearing the intermediate hash.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let mut first = sha256(data);
    let second = sha256(&first);
    secure_clear(&mut first);
    second
}

// ---------------------------------------------------------------------------
// Random bytes and hygiene
// ---------------------------------------------------------------------------

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`VaultError::KeyGenerationFailed`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::KeyGenerationFailed {
            reason: "system random source failed".into(),
        })?;
    Ok(buf)
}

/// Overwrite `buf` with random bytes, then with zeros.
///
/// Call this on every buffer that held key material or plaintext secrets
/// before it is dropped.  If the random source is unavailable the buffer is
/// still zeroed.
pub fn secure_clear(buf: &mut [u8]) {
    if buf.is_empty() {
        return;
    }
    let _ = SystemRandom::new().fill(buf);
    buf.zeroize();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
