//! Assembles the vault components from a [`VaultConfig`].

use std::path::Path;
use std::sync::Arc;

use crate::audit::{AuditContext, AuditEventType, SecurityAuditLogger, SecurityEvent};
use crate::config::{KeychainKind, VaultConfig};
use crate::db::VaultDatabase;
use crate::encryption::CredentialEncryptionService;
use crate::error::Result;
use crate::keychain::{self, FileKeychain, KeychainProvider, MemoryKeychain};
use crate::master_key::MasterKeyManager;
use crate::platform;
use crate::storage::SecureStorageManager;

/// The wired-up vault: storage, its encryption, the audit log and master
/// key management, sharing one keychain and one database.
pub struct Vault {
    pub storage: Arc<SecureStorageManager>,
    pub encryption: Arc<CredentialEncryptionService>,
    pub audit: Arc<SecurityAuditLogger>,
    pub master_keys: Arc<MasterKeyManager>,
    pub database: Option<Arc<VaultDatabase>>,
}

impl Vault {
    /// Build every component and initialize storage.
    ///
    /// `data_dir` anchors relative database paths and the file keychain.
    pub async fn open(config: &VaultConfig, data_dir: &Path) -> Result<Self> {
        let keychain: Arc<dyn KeychainProvider> = match config.keychain {
            KeychainKind::Native => Arc::from(keychain::platform_keychain()?),
            KeychainKind::File => Arc::new(FileKeychain::new(FileKeychain::default_dir(data_dir))),
            KeychainKind::Memory => Arc::new(MemoryKeychain::new()),
        };
        let master_keys = Arc::new(MasterKeyManager::new(keychain.clone()));

        let backend = platform::select_backend(config.backend, keychain.clone(), &master_keys)?;
        tracing::info!(
            backend = backend.name(),
            keychain = keychain.backend_name(),
            "vault crypto backend selected"
        );

        let database = match config.database_path(data_dir) {
            Some(path) => Some(Arc::new(VaultDatabase::open(path)?)),
            None => None,
        };

        let mut audit = SecurityAuditLogger::new(config.audit.capacity, AuditContext::current());
        if config.audit.persist {
            if let Some(db) = &database {
                audit = audit.with_sink(db.clone());
            }
        }
        let audit = Arc::new(audit);

        let encryption = Arc::new(CredentialEncryptionService::new(backend));
        let mut storage = SecureStorageManager::new(encryption.clone(), audit.clone());
        if let Some(db) = &database {
            storage = storage.with_database(db.clone());
        }
        let storage = Arc::new(storage);
        storage.initialize().await?;

        audit.log_security_event(
            SecurityEvent::new(AuditEventType::Configuration, "vault_open")
                .with_details(format!("backend={}", encryption.status().backend)),
        );

        Ok(Self {
            storage,
            encryption,
            audit,
            master_keys,
            database,
        })
    }
}
