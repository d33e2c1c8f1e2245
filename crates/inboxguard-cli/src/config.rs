//! Application configuration.
//!
//! Read from `config/default.toml`; every section falls back to the owning
//! crate's defaults. `.env` and the process environment override the OAuth
//! client credentials and the data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use inboxguard_auth::{OAuthConfig, RotationConfig};
use inboxguard_gmail::GmailConfig;
use inboxguard_vault::VaultConfig;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

pub const ENV_CLIENT_ID: &str = "INBOXGUARD_OAUTH_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "INBOXGUARD_OAUTH_CLIENT_SECRET";
pub const ENV_DATA_DIR: &str = "INBOXGUARD_DATA_DIR";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// The `[log]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Anchors the vault database and the file keychain.
    pub data_dir: PathBuf,
    pub log: LogConfig,
    pub vault: VaultConfig,
    pub oauth: OAuthConfig,
    pub rotation: RotationConfig,
    pub gmail: GmailConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log: LogConfig::default(),
            vault: VaultConfig::default(),
            oauth: OAuthConfig::default(),
            rotation: RotationConfig::default(),
            gmail: GmailConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load the configuration file and apply environment overrides.
    ///
    /// A missing file at the default path yields the defaults; a missing
    /// file the user named explicitly is an error.
    pub fn load(path: &Path, explicit: bool) -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            tracing::warn!(error = %e, "failed to load .env");
        }

        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Override file values with non-empty variables from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(id) = get(ENV_CLIENT_ID) {
            self.oauth.client_id = id;
        }
        if let Some(secret) = get(ENV_CLIENT_SECRET) {
            self.oauth.client_secret = Some(secret);
        }
        if let Some(dir) = get(ENV_DATA_DIR) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Check the sections that can be checked without OAuth credentials.
    ///
    /// The OAuth client is only validated when an interactive flow needs it,
    /// so `status` and `disconnect` work before one is configured.
    pub fn validate(&self) -> Result<()> {
        self.gmail.validate().context("invalid [gmail] section")?;
        for (name, settings) in &self.rotation.providers {
            settings
                .validate()
                .with_context(|| format!("invalid [rotation.providers.{name}] section"))?;
        }
        Ok(())
    }
}
