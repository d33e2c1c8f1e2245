//! `[gmail]` configuration section.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::batch::MAX_BATCH_SIZE;
use crate::error::{ProviderError, Result};
use crate::retry::RetryPolicy;

/// Scope needed for every read operation of the provider.
pub const GMAIL_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Largest `maxResults` accepted by `messages.list`.
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    /// Token prefix in the vault.
    pub provider: String,
    pub api_base: String,
    /// Path of the batch endpoint on `api_base`.
    pub batch_path: String,
    pub user_id: String,
    pub scopes: Vec<String>,
    /// Requests per batch, at most 100.
    pub batch_size: usize,
    /// `maxResults` for list calls.
    pub page_size: u32,
    /// `format` for message fetches: `minimal`, `metadata`, `full` or `raw`.
    pub message_format: String,
    pub request_timeout_secs: u64,
    /// Consecutive failed operations before the provider reports `Degraded`.
    pub degraded_after_failures: u32,
    /// Consecutive failed operations before it gives up and disconnects.
    pub disconnected_after_failures: u32,
    pub retry: RetryPolicy,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            provider: "gmail".to_string(),
            api_base: "https://gmail.googleapis.com".to_string(),
            batch_path: "/batch/gmail/v1".to_string(),
            user_id: "me".to_string(),
            scopes: vec![GMAIL_READONLY_SCOPE.to_string()],
            batch_size: MAX_BATCH_SIZE,
            page_size: 100,
            message_format: "metadata".to_string(),
            request_timeout_secs: 30,
            degraded_after_failures: 3,
            disconnected_after_failures: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl GmailConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(ProviderError::InvalidConfig { reason });

        if self.provider.is_empty() {
            return invalid("provider must not be empty".into());
        }
        Url::parse(&self.api_base)?;
        if !self.batch_path.starts_with('/') {
            return invalid(format!("batch_path must start with '/', got {:?}", self.batch_path));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return invalid(format!(
                "batch_size must be in 1..={MAX_BATCH_SIZE}, got {}",
                self.batch_size
            ));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return invalid(format!(
                "page_size must be in 1..={MAX_PAGE_SIZE}, got {}",
                self.page_size
            ));
        }
        if !matches!(self.message_format.as_str(), "minimal" | "metadata" | "full" | "raw") {
            return invalid(format!("unknown message_format {:?}", self.message_format));
        }
        if self.degraded_after_failures == 0
            || self.disconnected_after_failures < self.degraded_after_failures
        {
            return invalid(format!(
                "failure thresholds must satisfy 0 < degraded ({}) <= disconnected ({})",
                self.degraded_after_failures, self.disconnected_after_failures
            ));
        }
        self.retry.validate()
    }

    /// `{api_base}/gmail/v1/users/{user_id}/{path}`.
    pub(crate) fn user_url(&self, path: &str) -> Result<Url> {
        Ok(Url::parse(&self.api_base)?.join(&self.user_path(path))?)
    }

    /// Path of a user resource relative to the host, as batch parts need it.
    pub(crate) fn user_path(&self, path: &str) -> String {
        let user: String = url::form_urlencoded::byte_serialize(self.user_id.as_bytes()).collect();
        format!("/gmail/v1/users/{user}/{path}")
    }

    pub(crate) fn batch_url(&self) -> Result<Url> {
        Ok(Url::parse(&self.api_base)?.join(&self.batch_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = GmailConfig::default();
        cfg.validate().unwrap();
        assert_eq!(
            cfg.user_url("profile").unwrap().as_str(),
            "https://gmail.googleapis.com/gmail/v1/users/me/profile"
        );
        assert_eq!(
            cfg.batch_url().unwrap().as_str(),
            "https://gmail.googleapis.com/batch/gmail/v1"
        );
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: GmailConfig = toml::from_str(
            r#"
            batch_size = 50
            message_format = "full"

            [retry]
            max_retries = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.batch_size, 50);
        assert_eq!(cfg.retry.max_retries, 2);
        assert_eq!(cfg.retry.max_delay_secs, 120);
        assert_eq!(cfg.page_size, 100);
    }

    #[test]
    fn rejects_out_of_range_values() {
        for cfg in [
            GmailConfig {
                batch_size: 101,
                ..GmailConfig::default()
            },
            GmailConfig {
                page_size: 0,
                ..GmailConfig::default()
            },
            GmailConfig {
                message_format: "html".into(),
                ..GmailConfig::default()
            },
            GmailConfig {
                degraded_after_failures: 5,
                disconnected_after_failures: 2,
                ..GmailConfig::default()
            },
        ] {
            assert!(cfg.validate().is_err(), "{cfg:?}");
        }
    }
}
