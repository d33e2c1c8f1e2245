//! Named secret storage backed by the operating system.
//!
//! The vault never writes its own key material to disk in the clear. Small
//! secrets (the platform wrapping key, the master-key install seed) are kept
//! in a [`KeychainProvider`]:
//!
//! - **macOS**: Keychain Services via `security-framework`
//! - **Linux**: Secret Service (GNOME Keyring / KWallet) via `keyring`
//! - **Windows**: Credential Manager via `keyring`
//! - **Fallback**: [`FileKeychain`], one encrypted file per secret
//! - **Tests**: [`MemoryKeychain`]
//!
//! # Security Notes
//!
//! - The file fallback encrypts with a device-derived key. Anyone with access
//!   to the same machine account can reconstruct that key; it only keeps the
//!   secrets out of plaintext backups.
//! - Key files are restricted to the owner (mode 0600 on Unix).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::crypto;
use crate::error::{Result, VaultError};

/// Service name under which all InboxGuard keychain entries are filed.
pub const DEFAULT_SERVICE: &str = "com.inboxguard.vault";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over platform-specific secure storage of small named secrets.
///
/// Implementations must be `Send + Sync` so the vault can be shared across
/// async tasks.
pub trait KeychainProvider: Send + Sync {
    /// Retrieve the secret stored under `name`.
    ///
    /// Returns [`VaultError::KeyNotFound`] if nothing is stored there.
    fn get_secret(&self, name: &str) -> Result<Vec<u8>>;

    /// Store (or overwrite) the secret under `name`.
    fn set_secret(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Check whether a secret is stored under `name`.
    fn has_secret(&self, name: &str) -> Result<bool>;

    /// Delete the secret under `name`. Deleting a missing entry is a no-op.
    fn delete_secret(&self, name: &str) -> Result<()>;

    /// Short identifier for status reports ("macos-keychain", "file", ...).
    fn backend_name(&self) -> &'static str;
}

/// Entry names become file names and keychain accounts, so keep them tame.
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(VaultError::Validation {
            reason: format!("invalid keychain entry name: {name:?}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Machine identity
// ---------------------------------------------------------------------------

/// Best-effort hostname, without reaching for libc.
pub(crate) fn hostname() -> String {
    #[cfg(unix)]
    {
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .or_else(|_| std::env::var("HOSTNAME"))
            .or_else(|_| std::env::var("HOST"))
            .unwrap_or_else(|_| "unknown-host".into())
    }

    #[cfg(not(unix))]
    {
        std::env::var("COMPUTERNAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "unknown-host".into())
    }
}

/// Name of the account running the process.
pub(crate) fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown-user".into())
}

// ---------------------------------------------------------------------------
// File-based fallback
// ---------------------------------------------------------------------------

/// Application salt mixed into the device-derived key. Changing this
/// invalidates every stored key file. Must be exactly [`crypto::SALT_LEN`]
/// bytes.
const APP_SALT: &[u8; crypto::SALT_LEN] = b"inboxguard-vault-keychain-v1\x00\x00\x00\x00";

/// File-based keychain: one file per entry, each sealed with a
/// device-derived key and the entry name as associated data.
///
/// File layout (binary):
/// ```text
/// [12 bytes: AES-256-GCM nonce]
/// [remaining: AES-256-GCM ciphertext + 16-byte tag]
/// ```
pub struct FileKeychain {
    dir: PathBuf,
    device_key: OnceLock<[u8; crypto::KEY_LEN]>,
}

impl FileKeychain {
    /// Create a file keychain that keeps its entries under `dir`.
    ///
    /// The directory is created on the first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            device_key: OnceLock::new(),
        }
    }

    /// Default location: `<data_dir>/keys`.
    pub fn default_dir(data_dir: &Path) -> PathBuf {
        data_dir.join("keys")
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.key")))
    }

    /// PBKDF2 over hostname, username and the application salt. Derived
    /// once per instance.
    fn device_key(&self) -> &[u8; crypto::KEY_LEN] {
        self.device_key.get_or_init(|| {
            let host = hostname();
            let user = username();

            let mut material = Vec::with_capacity(host.len() + user.len() + APP_SALT.len());
            material.extend_from_slice(host.as_bytes());
            material.extend_from_slice(user.as_bytes());
            material.extend_from_slice(APP_SALT);

            let mut key = [0u8; crypto::KEY_LEN];
            crypto::derive_key_with_salt(&material, APP_SALT, &mut key);
            crypto::secure_clear(&mut material);
            key
        })
    }
}

impl KeychainProvider for FileKeychain {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.entry_path(name)?;
        if !path.exists() {
            return Err(VaultError::KeyNotFound { name: name.into() });
        }

        let data = std::fs::read(&path)?;
        let secret = crypto::open(&data, self.device_key(), name.as_bytes()).map_err(|_| {
            VaultError::DecryptionFailed {
                reason: format!("key file for {name} is corrupted or from another machine"),
            }
        })?;

        tracing::debug!(entry = name, "read secret from file keychain");
        Ok(secret)
    }

    fn set_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        let path = self.entry_path(name)?;
        let sealed = crypto::seal(value, self.device_key(), name.as_bytes())?;

        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, &sealed)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::info!(entry = name, path = %path.display(), "stored secret in file keychain");
        Ok(())
    }

    fn has_secret(&self, name: &str) -> Result<bool> {
        Ok(self.entry_path(name)?.exists())
    }

    fn delete_secret(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name)?;
        if path.exists() {
            std::fs::remove_file(&path)?;
            tracing::info!(entry = name, "deleted secret from file keychain");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local keychain. Nothing survives a restart; meant for tests and
/// ephemeral sessions.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries.lock().map_err(|_| VaultError::KeychainUnavailable {
            reason: "memory keychain lock poisoned".into(),
        })
    }
}

impl KeychainProvider for MemoryKeychain {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        validate_name(name)?;
        self.entries()?
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::KeyNotFound { name: name.into() })
    }

    fn set_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        validate_name(name)?;
        self.entries()?.insert(name.to_string(), value.to_vec());
        Ok(())
    }

    fn has_secret(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.entries()?.contains_key(name))
    }

    fn delete_secret(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        if let Some(mut old) = self.entries()?.remove(name) {
            crypto::secure_clear(&mut old);
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// macOS Keychain Services
// ---------------------------------------------------------------------------

/// `errSecItemNotFound`.
#[cfg(target_os = "macos")]
const MACOS_ERR_SEC_ITEM_NOT_FOUND: i32 = -25300;

/// macOS Keychain Services via the generic password APIs. Each entry name
/// becomes the account of a generic password under the service name.
#[cfg(target_os = "macos")]
pub struct MacOSKeychain {
    service_name: String,
}

#[cfg(target_os = "macos")]
impl MacOSKeychain {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE)
    }

    /// Use a custom service name, e.g. to isolate test runs.
    pub fn with_service(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
        }
    }
}

#[cfg(target_os = "macos")]
impl Default for MacOSKeychain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "macos")]
impl KeychainProvider for MacOSKeychain {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        use security_framework::passwords::get_generic_password;

        validate_name(name)?;
        match get_generic_password(&self.service_name, name) {
            Ok(data) => {
                tracing::debug!(service = %self.service_name, entry = name, "read secret from macOS keychain");
                Ok(data.to_vec())
            }
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => {
                Err(VaultError::KeyNotFound { name: name.into() })
            }
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("macOS keychain read failed: {e}"),
            }),
        }
    }

    fn set_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        use security_framework::passwords::set_generic_password;

        validate_name(name)?;
        set_generic_password(&self.service_name, name, value).map_err(|e| {
            VaultError::KeychainUnavailable {
                reason: format!("macOS keychain write failed: {e}"),
            }
        })?;

        tracing::info!(service = %self.service_name, entry = name, "stored secret in macOS keychain");
        Ok(())
    }

    fn has_secret(&self, name: &str) -> Result<bool> {
        match self.get_secret(name) {
            Ok(_) => Ok(true),
            Err(VaultError::KeyNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn delete_secret(&self, name: &str) -> Result<()> {
        use security_framework::passwords::delete_generic_password;

        validate_name(name)?;
        match delete_generic_password(&self.service_name, name) {
            Ok(()) => {
                tracing::info!(service = %self.service_name, entry = name, "deleted secret from macOS keychain");
                Ok(())
            }
            Err(e) if e.code() == MACOS_ERR_SEC_ITEM_NOT_FOUND => Ok(()),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("macOS keychain delete failed: {e}"),
            }),
        }
    }

    fn backend_name(&self) -> &'static str {
        "macos-keychain"
    }
}

// ---------------------------------------------------------------------------
// Linux Secret Service / Windows Credential Manager
// ---------------------------------------------------------------------------

/// OS credential store reached through the `keyring` crate: the D-Bus
/// Secret Service on Linux, Credential Manager on Windows.
///
/// `keyring` stores UTF-8 passwords, so binary secrets are base64-encoded.
#[cfg(any(target_os = "linux", target_os = "windows"))]
pub struct OsKeyring {
    service_name: String,
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl OsKeyring {
    pub fn new() -> Self {
        Self::with_service(DEFAULT_SERVICE)
    }

    pub fn with_service(service: &str) -> Self {
        Self {
            service_name: service.to_string(),
        }
    }

    fn entry(&self, name: &str) -> Result<keyring::Entry> {
        validate_name(name)?;
        keyring::Entry::new(&self.service_name, name).map_err(|e| VaultError::KeychainUnavailable {
            reason: format!("failed to open keyring entry: {e}"),
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl Default for OsKeyring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(target_os = "linux", target_os = "windows"))]
impl KeychainProvider for OsKeyring {
    fn get_secret(&self, name: &str) -> Result<Vec<u8>> {
        use base64::Engine as _;

        match self.entry(name)?.get_password() {
            Ok(encoded) => {
                let secret = base64::engine::general_purpose::STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|e| VaultError::DecryptionFailed {
                        reason: format!("keyring entry {name} is not valid base64: {e}"),
                    })?;
                tracing::debug!(service = %self.service_name, entry = name, "read secret from OS keyring");
                Ok(secret)
            }
            Err(keyring::Error::NoEntry) => Err(VaultError::KeyNotFound { name: name.into() }),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("keyring read failed: {e}"),
            }),
        }
    }

    fn set_secret(&self, name: &str, value: &[u8]) -> Result<()> {
        use base64::Engine as _;

        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        self.entry(name)?
            .set_password(&encoded)
            .map_err(|e| VaultError::KeychainUnavailable {
                reason: format!("keyring write failed: {e}"),
            })?;

        tracing::info!(service = %self.service_name, entry = name, "stored secret in OS keyring");
        Ok(())
    }

    fn has_secret(&self, name: &str) -> Result<bool> {
        match self.entry(name)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("keyring check failed: {e}"),
            }),
        }
    }

    fn delete_secret(&self, name: &str) -> Result<()> {
        match self.entry(name)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(VaultError::KeychainUnavailable {
                reason: format!("keyring delete failed: {e}"),
            }),
        }
    }

    fn backend_name(&self) -> &'static str {
        if cfg!(target_os = "windows") {
            "windows-credential-manager"
        } else {
            "secret-service"
        }
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// The native keychain for the running OS.
///
/// Fails with [`VaultError::PlatformNotSupported`] when the OS has no
/// supported secure-storage primitive; it never degrades silently.
pub fn platform_keychain() -> Result<Box<dyn KeychainProvider>> {
    #[cfg(target_os = "macos")]
    {
        tracing::info!("using macOS Keychain Services");
        Ok(Box::new(MacOSKeychain::new()))
    }
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    {
        let keyring = OsKeyring::new();
        tracing::info!(backend = keyring.backend_name(), "using OS keyring");
        Ok(Box::new(keyring))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(VaultError::PlatformNotSupported {
            platform: std::env::consts::OS.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_keychain_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path());

        assert!(!keychain.has_secret("wrapping-key").unwrap());

        let secret = crypto::random_bytes(crypto::KEY_LEN).unwrap();
        keychain.set_secret("wrapping-key", &secret).unwrap();
        assert!(keychain.has_secret("wrapping-key").unwrap());
        assert_eq!(keychain.get_secret("wrapping-key").unwrap(), secret);

        keychain.delete_secret("wrapping-key").unwrap();
        assert!(!keychain.has_secret("wrapping-key").unwrap());
        // Second delete is a no-op.
        keychain.delete_secret("wrapping-key").unwrap();
    }

    #[test]
    fn file_keychain_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path());

        let result = keychain.get_secret("install-seed");
        assert!(matches!(result, Err(VaultError::KeyNotFound { .. })));
    }

    #[test]
    fn file_keychain_entries_are_bound_to_their_name() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path());
        keychain.set_secret("a", b"first").unwrap();

        // Move a's file over b: the name is associated data, so it must not open.
        std::fs::copy(dir.path().join("a.key"), dir.path().join("b.key")).unwrap();
        let result = keychain.get_secret("b");
        assert!(matches!(result, Err(VaultError::DecryptionFailed { .. })));
    }

    #[test]
    fn file_keychain_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path().join("nested"));

        keychain.set_secret("seed", b"one").unwrap();
        keychain.set_secret("seed", b"two").unwrap();
        assert_eq!(keychain.get_secret("seed").unwrap(), b"two");
    }

    #[cfg(unix)]
    #[test]
    fn file_keychain_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let keychain = FileKeychain::new(dir.path());
        keychain.set_secret("seed", b"x").unwrap();

        let mode = std::fs::metadata(dir.path().join("seed.key"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn rejects_path_like_names() {
        let keychain = MemoryKeychain::new();
        for bad in ["", "../etc/passwd", "a/b", ".hidden", "with space"] {
            assert!(
                matches!(keychain.set_secret(bad, b"x"), Err(VaultError::Validation { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn memory_keychain_roundtrip() {
        let keychain = MemoryKeychain::new();
        assert!(!keychain.has_secret("k").unwrap());
        keychain.set_secret("k", b"value").unwrap();
        assert_eq!(keychain.get_secret("k").unwrap(), b"value");
        keychain.delete_secret("k").unwrap();
        assert!(matches!(
            keychain.get_secret("k"),
            Err(VaultError::KeyNotFound { .. })
        ));
        assert_eq!(keychain.backend_name(), "memory");
    }

    #[cfg(target_os = "macos")]
    #[test]
    #[ignore = "requires unlocked macOS Keychain, run manually with --ignored"]
    fn macos_keychain_roundtrip() {
        let service = format!("com.inboxguard.vault.test.{}", std::process::id());
        let kc = MacOSKeychain::with_service(&service);
        let _ = kc.delete_secret("test-entry");

        assert!(!kc.has_secret("test-entry").unwrap());
        kc.set_secret("test-entry", b"secret").unwrap();
        assert_eq!(kc.get_secret("test-entry").unwrap(), b"secret");
        kc.delete_secret("test-entry").unwrap();
        assert!(!kc.has_secret("test-entry").unwrap());
    }

    #[cfg(any(target_os = "linux", target_os = "windows"))]
    #[test]
    #[ignore = "requires a running secret service / credential manager"]
    fn os_keyring_roundtrip() {
        let service = format!("com.inboxguard.vault.test.{}", std::process::id());
        let kc = OsKeyring::with_service(&service);
        let _ = kc.delete_secret("test-entry");

        kc.set_secret("test-entry", &[0, 159, 146, 150]).unwrap();
        assert_eq!(kc.get_secret("test-entry").unwrap(), vec![0, 159, 146, 150]);
        kc.delete_secret("test-entry").unwrap();
        assert!(!kc.has_secret("test-entry").unwrap());
    }
}
