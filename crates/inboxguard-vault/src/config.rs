//! `[vault]` configuration section.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::audit::DEFAULT_CAPACITY;

/// Which primitive encrypts credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Wrapping key held by the OS keychain.
    #[default]
    Platform,
    /// Key derived by the master key manager from the install seed and
    /// machine identity.
    Derived,
}

/// Where the vault keeps its own small secrets (wrapping key, install seed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeychainKind {
    /// macOS Keychain, Secret Service or Windows Credential Manager.
    #[default]
    Native,
    /// Encrypted files under `<data_dir>/keys`.
    File,
    /// Process memory; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Mirror entries to the `audit_log` table (needs a database).
    pub persist: bool,
    /// Entries kept in memory.
    pub capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            persist: true,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub backend: BackendKind,
    pub keychain: KeychainKind,
    /// SQLite file. Relative paths resolve against the data directory;
    /// `None` keeps credentials in memory only.
    pub database: Option<PathBuf>,
    pub audit: AuditConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Platform,
            keychain: KeychainKind::Native,
            database: Some(PathBuf::from("vault.db")),
            audit: AuditConfig::default(),
        }
    }
}

impl VaultConfig {
    /// Fully in-memory configuration, for tests.
    pub fn ephemeral() -> Self {
        Self {
            backend: BackendKind::Platform,
            keychain: KeychainKind::Memory,
            database: None,
            audit: AuditConfig {
                persist: false,
                capacity: DEFAULT_CAPACITY,
            },
        }
    }

    /// Absolute database path, if persistence is configured.
    pub fn database_path(&self, data_dir: &Path) -> Option<PathBuf> {
        self.database.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                data_dir.join(p)
            }
        })
    }
}
