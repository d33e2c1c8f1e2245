//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], which is the
//! single error type returned by every public API in this crate.  Platform
//! and cryptographic failures are wrapped into these variants at the point
//! where they occur, so raw platform error types never leak upward.

/// Unified error type for the InboxGuard credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Lifecycle / input errors -------------------------------------------
    /// The component is not initialized or its settings are invalid.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Caller-supplied input is malformed.
    #[error("validation error: {reason}")]
    Validation { reason: String },

    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (platform backend unavailable, bad key, ...).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed (wrong key, wrong context, corrupted ciphertext).
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// A master or wrapping key could not be generated or derived.
    #[error("key generation failed: {reason}")]
    KeyGenerationFailed { reason: String },

    /// A base64 master key does not have the canonical encoded length.
    #[error("master key must be {expected} base64 characters, got {actual}")]
    InvalidKeyEncoding { expected: usize, actual: usize },

    /// A master key decoded to the wrong number of bytes.
    #[error("master key must decode to {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// The running operating system has no supported crypto backend.
    #[error("platform not supported: {platform}")]
    PlatformNotSupported { platform: String },

    // -- Keychain errors ----------------------------------------------------
    /// The requested key is not present in the keychain.
    #[error("key not found in keychain: {name}")]
    KeyNotFound { name: String },

    /// The keychain backend refused or failed the operation.
    #[error("keychain unavailable: {reason}")]
    KeychainUnavailable { reason: String },

    // -- Store errors -------------------------------------------------------
    /// The requested credential does not exist (or was evicted as corrupt).
    #[error("credential not found: {key}")]
    CredentialNotFound { key: String },

    /// Database schema migration failed.
    #[error("migration failed: {reason}")]
    MigrationFailed { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem (keychain file operations, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl VaultError {
    /// Whether the operation may succeed if simply tried again.
    ///
    /// Vault failures signal corruption, misconfiguration or an unavailable
    /// platform, never transience, so nothing here is retried blindly.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Whether the caller should route the user back through the
    /// provider's sign-in flow.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(
            self,
            Self::DecryptionFailed { .. } | Self::CredentialNotFound { .. }
        )
    }

    /// Message suitable for display in the application UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::CredentialNotFound { .. } | Self::DecryptionFailed { .. } => {
                "Please re-connect this provider."
            }
            Self::Validation { .. }
            | Self::InvalidKeyEncoding { .. }
            | Self::InvalidKeyLength { .. } => "The supplied value is not valid.",
            _ => "Security subsystem unavailable. Restart the application or check platform configuration.",
        }
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_length_error_mentions_sizes() {
        let err = VaultError::InvalidKeyLength {
            expected: 32,
            actual: 31,
        };
        assert_eq!(err.to_string(), "master key must decode to 32 bytes, got 31");
    }

    #[test]
    fn nothing_is_retryable() {
        let err = VaultError::EncryptionFailed {
            reason: "backend gone".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn decryption_failures_ask_for_reconnect() {
        let err = VaultError::DecryptionFailed {
            reason: "tag mismatch".into(),
        };
        assert!(err.requires_reauthentication());
        assert_eq!(err.user_message(), "Please re-connect this provider.");

        let err = VaultError::PlatformNotSupported {
            platform: "solaris".into(),
        };
        assert!(!err.requires_reauthentication());
        assert!(err.user_message().starts_with("Security subsystem unavailable"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<VaultError>();
    }
}
