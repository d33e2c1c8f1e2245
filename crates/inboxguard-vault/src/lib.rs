//! Encrypted credential vault for InboxGuard.
//!
//! Credentials (OAuth tokens, API keys) are encrypted with AES-256-GCM under
//! a key the OS protects for the current user, cached in encrypted form, and
//! optionally persisted to SQLite. Every access is audited with the
//! credential key masked.
//!
//! # Modules
//!
//! - [`crypto`]: AES-256-GCM sealing, PBKDF2, SHA-256, buffer clearing.
//! - [`keychain`]: named secrets in the OS keychain (or fallbacks).
//! - [`platform`]: per-OS encryption backend and its factory.
//! - [`master_key`]: master key generation, derivation, validation.
//! - [`encryption`]: the credential encryption service.
//! - [`storage`]: the secure storage manager and [`CredentialStore`].
//! - [`audit`]: the security audit logger.
//! - [`db`]: SQLite persistence for credentials and audit entries.
//! - [`vault`]: wiring all of the above from a [`VaultConfig`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use inboxguard_vault::{Vault, VaultConfig};
//!
//! # async fn example() -> inboxguard_vault::Result<()> {
//! let vault = Vault::open(&VaultConfig::default(), std::path::Path::new("data")).await?;
//!
//! vault.storage.store_credential("gmail_access_token", "ya29....").await?;
//! let token = vault.storage.retrieve_credential("gmail_access_token").await?;
//! assert!(token.starts_with("ya29"));
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod crypto;
pub mod db;
pub mod encryption;
pub mod error;
pub mod keychain;
pub mod master_key;
pub mod platform;
pub mod storage;
pub mod vault;

pub use audit::{
    AuditContext, AuditEntry, AuditEventType, SecurityAuditLogger, SecurityEvent, SecuritySummary,
    mask_credential_key,
};
pub use config::{BackendKind, KeychainKind, VaultConfig};
pub use db::VaultDatabase;
pub use encryption::{CredentialEncryptionService, EncryptionHealthReport, EncryptionStatus};
pub use error::{Result, VaultError};
pub use keychain::{FileKeychain, KeychainProvider, MemoryKeychain};
pub use master_key::MasterKeyManager;
pub use platform::PlatformCryptoBackend;
pub use storage::{CredentialStore, SecureStorageManager, StorageHealthReport, StorageState, StorageStatus};
pub use vault::Vault;
