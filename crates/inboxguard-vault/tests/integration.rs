//! Integration tests for the inboxguard-vault crate.
//!
//! These exercise the vault through its public API: the credential
//! lifecycle, context binding, persistence across reopen, auditing, and
//! master key handling.

use std::sync::Arc;

use chrono::{Duration, Utc};
use inboxguard_vault::config::AuditConfig;
use inboxguard_vault::platform::KeychainBackend;
use inboxguard_vault::{
    AuditContext, AuditEventType, BackendKind, CredentialEncryptionService, CredentialStore,
    KeychainKind, MasterKeyManager, MemoryKeychain, SecureStorageManager, SecurityAuditLogger,
    Vault, VaultConfig, VaultError,
};

async fn memory_vault() -> Vault {
    let dir = tempfile::tempdir().unwrap();
    Vault::open(&VaultConfig::ephemeral(), dir.path()).await.unwrap()
}

// ═══════════════════════════════════════════════════════════════════════
//  Credential lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn credential_store_retrieve_remove() {
    let vault = memory_vault().await;
    let store: Arc<dyn CredentialStore> = vault.storage.clone();

    store.store("gmail_access_token", "ya29.token").await.unwrap();
    assert!(store.exists("gmail_access_token").await.unwrap());
    assert_eq!(
        store.retrieve("gmail_access_token").await.unwrap().as_str(),
        "ya29.token"
    );

    store.remove("gmail_access_token").await.unwrap();
    assert!(!store.exists("gmail_access_token").await.unwrap());
    assert!(matches!(
        store.retrieve("gmail_access_token").await,
        Err(VaultError::CredentialNotFound { .. })
    ));

    // Removing again still succeeds.
    store.remove("gmail_access_token").await.unwrap();
}

#[tokio::test]
async fn many_providers_are_independent() {
    let vault = memory_vault().await;
    for provider in ["gmail", "outlook", "openai"] {
        vault
            .storage
            .store_credential(&format!("{provider}_access_token"), &format!("{provider}-secret"))
            .await
            .unwrap();
    }

    vault.storage.remove_credential("outlook_access_token").await.unwrap();

    assert_eq!(
        vault.storage.list_keys().await.unwrap(),
        vec!["gmail_access_token", "openai_access_token"]
    );
    assert_eq!(
        vault
            .storage
            .retrieve_credential("openai_access_token")
            .await
            .unwrap()
            .as_str(),
        "openai-secret"
    );
}

#[tokio::test]
async fn concurrent_stores_all_land() {
    let vault = memory_vault().await;
    let mut handles = Vec::new();
    for i in 0..20 {
        let storage = vault.storage.clone();
        handles.push(tokio::spawn(async move {
            storage
                .store_credential(&format!("p{i}_access_token"), &format!("v{i}"))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(vault.storage.list_keys().await.unwrap().len(), 20);
    assert_eq!(vault.storage.status().await.stores, 20);
}

// ═══════════════════════════════════════════════════════════════════════
//  Context binding
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn ciphertext_is_bound_to_its_key() {
    let backend = Arc::new(KeychainBackend::new(Arc::new(MemoryKeychain::new())));
    let encryption = CredentialEncryptionService::new(backend);
    encryption.initialize().unwrap();

    let sealed = encryption.encrypt("secret", Some("providerA")).unwrap();
    assert_eq!(
        encryption.decrypt(&sealed, Some("providerA")).unwrap().as_str(),
        "secret"
    );
    let err = encryption.decrypt(&sealed, Some("providerB")).unwrap_err();
    assert!(matches!(err, VaultError::DecryptionFailed { .. }));
    assert!(!err.is_retryable());
    assert_eq!(err.user_message(), "Please re-connect this provider.");
}

// ═══════════════════════════════════════════════════════════════════════
//  Persistence
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn credentials_and_audit_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = VaultConfig {
        backend: BackendKind::Platform,
        keychain: KeychainKind::File,
        database: Some(dir.path().join("vault.db")),
        audit: AuditConfig::default(),
    };

    {
        let vault = Vault::open(&config, dir.path()).await.unwrap();
        vault
            .storage
            .store_credential("gmail_refresh_token", "1//refresh")
            .await
            .unwrap();
    }

    let vault = Vault::open(&config, dir.path()).await.unwrap();
    assert_eq!(
        vault
            .storage
            .retrieve_credential("gmail_refresh_token")
            .await
            .unwrap()
            .as_str(),
        "1//refresh"
    );

    let db = vault.database.as_ref().unwrap();
    let persisted = db
        .query_audit(Utc::now() - Duration::minutes(5), Utc::now())
        .unwrap();
    assert!(
        persisted
            .iter()
            .any(|e| e.operation == "store" && e.credential_key.as_deref() == Some("gmai***ken"))
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Auditing
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn failures_show_up_in_summary() {
    let backend = Arc::new(KeychainBackend::new(Arc::new(MemoryKeychain::new())));
    let audit = Arc::new(SecurityAuditLogger::new(100, AuditContext::default()));
    let storage = SecureStorageManager::new(
        Arc::new(CredentialEncryptionService::new(backend)),
        audit.clone(),
    );
    storage.initialize().await.unwrap();

    storage.store_credential("gmail_access_token", "v").await.unwrap();
    let _ = storage.retrieve_credential("missing_access_token").await;

    let summary = audit.get_security_summary(Duration::hours(1));
    assert_eq!(summary.failed_events, 1);
    assert_eq!(summary.recent_failures.len(), 1);
    assert_eq!(summary.recent_failures[0].event_type, AuditEventType::Credential);
    assert_eq!(summary.recent_failures[0].operation, "retrieve");
    assert_eq!(
        summary.recent_failures[0].credential_key.as_deref(),
        Some("miss***ken")
    );
}

// ═══════════════════════════════════════════════════════════════════════
//  Master keys
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn master_key_validation_scenarios() {
    let mgr = MasterKeyManager::new(Arc::new(MemoryKeychain::new()));

    let good = mgr.generate_master_key().unwrap();
    assert_eq!(good.len(), 44);
    assert!(mgr.validate_master_key(&good).unwrap());

    let err = mgr.validate_master_key(&good[..43]).unwrap_err();
    assert!(matches!(
        err,
        VaultError::InvalidKeyEncoding {
            expected: 44,
            actual: 43
        }
    ));
    assert!(err.to_string().contains("44"));
}

#[test]
fn master_key_export_roundtrip() {
    let mgr = MasterKeyManager::new(Arc::new(MemoryKeychain::new()));
    let key = mgr.derive_master_key().unwrap();

    let exported = mgr
        .encrypt_with_master_key(r#"{"gmail_refresh_token":"1//x"}"#, &key)
        .unwrap();
    let imported = mgr.decrypt_with_master_key(&exported, &key).unwrap();
    assert_eq!(imported.as_str(), r#"{"gmail_refresh_token":"1//x"}"#);
}
