//! Scheduled token rotation.
//!
//! [`TokenRotationService`] periodically walks the configured providers and
//! refreshes tokens that are close to expiry, so the mail provider rarely
//! meets an expired token mid-request. Outcomes are counted per provider,
//! audited, and broadcast as [`RotationEvent`]s.
//!
//! At most one rotation runs at a time in the process. The scheduled sweep
//! waits for a manual rotation to finish; a manual rotation that finds one
//! in flight returns immediately with "rotation already in progress".

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use inboxguard_vault::{AuditEventType, SecurityAuditLogger, SecurityEvent};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, broadcast};

use crate::error::{AuthError, Result};
use crate::scheduler::RecurringTask;
use crate::service::OAuthService;

/// Default sweep interval: six hours.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 6 * 60 * 60;

/// A provider is due if its last check is at most this much younger than
/// its interval, so sweep jitter does not skip a whole cycle.
const CHECK_SLACK_SECS: i64 = 60;

const MAX_RETRIES_LIMIT: u32 = 10;

const MAX_THRESHOLD_SECS: u64 = 30 * 24 * 60 * 60;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub const IN_PROGRESS_REASON: &str = "rotation already in progress";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-provider rotation policy (`[rotation.providers.<name>]`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub enabled: bool,
    /// Rotate once the token expires within this many seconds.
    pub expiry_threshold_secs: u64,
    /// Minimum time between two checks of this provider.
    pub check_interval_secs: u64,
    /// Extra attempts after a retryable refresh failure.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry_threshold_secs: 30 * 60,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            max_retries: 3,
            retry_delay_secs: 30,
        }
    }
}

impl RotationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.expiry_threshold_secs == 0 || self.expiry_threshold_secs > MAX_THRESHOLD_SECS {
            return Err(AuthError::InvalidConfig {
                reason: format!(
                    "rotation expiry_threshold_secs must be between 1 and {MAX_THRESHOLD_SECS}, got {}",
                    self.expiry_threshold_secs
                ),
            });
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(AuthError::InvalidConfig {
                reason: format!(
                    "rotation max_retries must be at most {MAX_RETRIES_LIMIT}, got {}",
                    self.max_retries
                ),
            });
        }
        Ok(())
    }

    fn expiry_threshold(&self) -> chrono::Duration {
        let secs = self.expiry_threshold_secs.min(MAX_THRESHOLD_SECS);
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(0))
    }
}

/// The `[rotation]` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Run the background sweep at all.
    pub enabled: bool,
    pub check_interval_secs: u64,
    /// Sweep once right after `start`.
    pub run_on_start: bool,
    pub providers: BTreeMap<String, RotationSettings>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            run_on_start: true,
            providers: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results, statistics, events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    Stopped,
    Running,
}

/// What one rotation attempt did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationResult {
    pub provider: String,
    pub was_rotated: bool,
    /// Human-readable explanation.
    pub reason: String,
    pub new_expiry: Option<DateTime<Utc>>,
}

impl RotationResult {
    fn skipped(provider: &str, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            was_rotated: false,
            reason: reason.into(),
            new_expiry: None,
        }
    }
}

/// Cumulative counters for one provider. Never reset while the process runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderRotationStats {
    pub successful_rotations: u64,
    pub failed_rotations: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationStatistics {
    pub state: RotationState,
    pub check_interval_secs: u64,
    pub last_sweep: Option<DateTime<Utc>>,
    pub total_successful: u64,
    pub total_failed: u64,
    pub providers: BTreeMap<String, ProviderRotationStats>,
}

/// Broadcast after every rotation that reached the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RotationEvent {
    TokenRotated {
        provider: String,
        expires_at: Option<DateTime<Utc>>,
        attempts: u32,
        at: DateTime<Utc>,
    },
    TokenRotationFailed {
        provider: String,
        error: String,
        attempts: u32,
        requires_reauthentication: bool,
        at: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct TokenRotationService {
    oauth: Arc<OAuthService>,
    audit: Arc<SecurityAuditLogger>,
    check_interval: Duration,
    run_on_start: bool,
    settings: RwLock<BTreeMap<String, RotationSettings>>,
    stats: RwLock<BTreeMap<String, ProviderRotationStats>>,
    last_sweep: RwLock<Option<DateTime<Utc>>>,
    /// Held for the whole of a rotation or sweep.
    in_flight: Mutex<()>,
    events: broadcast::Sender<RotationEvent>,
    task: Mutex<Option<RecurringTask>>,
}

impl TokenRotationService {
    pub fn new(
        oauth: Arc<OAuthService>,
        audit: Arc<SecurityAuditLogger>,
        config: &RotationConfig,
    ) -> Result<Self> {
        if config.check_interval_secs == 0 {
            return Err(AuthError::InvalidConfig {
                reason: "rotation check_interval_secs must be positive".to_string(),
            });
        }
        for settings in config.providers.values() {
            settings.validate()?;
        }
        let stats = config
            .providers
            .keys()
            .map(|p| (p.clone(), ProviderRotationStats::default()))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            oauth,
            audit,
            check_interval: Duration::from_secs(config.check_interval_secs),
            run_on_start: config.run_on_start,
            settings: RwLock::new(config.providers.clone()),
            stats: RwLock::new(stats),
            last_sweep: RwLock::new(None),
            in_flight: Mutex::new(()),
            events,
            task: Mutex::new(None),
        })
    }

    /// Receive [`RotationEvent`]s from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the background sweep. Calling it while running does nothing.
    pub async fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(RecurringTask::is_running) {
            tracing::warn!("token rotation already running");
            return;
        }

        // The task must not keep the service alive.
        let service: Weak<Self> = Arc::downgrade(self);
        *task = Some(RecurringTask::spawn(
            "token-rotation",
            self.check_interval,
            self.run_on_start,
            move || {
                let service = service.clone();
                async move {
                    if let Some(service) = service.upgrade() {
                        service.check_all_providers().await;
                    }
                }
            },
        ));
        tracing::info!(
            interval_secs = self.check_interval.as_secs(),
            "token rotation started"
        );
    }

    /// Stop the sweep, letting a running one finish.
    pub async fn stop(&self) {
        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            task.stop().await;
            tracing::info!("token rotation stopped");
        }
    }

    pub async fn state(&self) -> RotationState {
        match self.task.lock().await.as_ref() {
            Some(task) if task.is_running() => RotationState::Running,
            _ => RotationState::Stopped,
        }
    }

    // -----------------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------------

    /// Set the policy for `provider`, adding it to the sweep.
    pub async fn configure_provider_rotation(
        &self,
        provider: &str,
        settings: RotationSettings,
    ) -> Result<()> {
        settings.validate()?;
        tracing::info!(
            provider,
            enabled = settings.enabled,
            threshold_secs = settings.expiry_threshold_secs,
            "rotation settings updated"
        );
        self.audit.log_security_event(
            SecurityEvent::new(AuditEventType::Configuration, "rotation_configured").with_details(
                format!(
                    "provider={provider} enabled={} threshold_secs={}",
                    settings.enabled, settings.expiry_threshold_secs
                ),
            ),
        );
        self.settings
            .write()
            .await
            .insert(provider.to_string(), settings);
        self.stats
            .write()
            .await
            .entry(provider.to_string())
            .or_default();
        Ok(())
    }

    async fn settings_for(&self, provider: &str) -> RotationSettings {
        self.settings
            .read()
            .await
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Rotation
    // -----------------------------------------------------------------------

    /// Whether `provider`'s token expires within its rotation threshold.
    /// `false` when there is no token.
    pub async fn is_token_near_expiry(&self, provider: &str) -> Result<bool> {
        let settings = self.settings_for(provider).await;
        let expiry = self.oauth.token_expiry(provider).await?;
        Ok(expiry.is_some_and(|at| Self::near(at, &settings)))
    }

    fn near(expiry: DateTime<Utc>, settings: &RotationSettings) -> bool {
        Utc::now() + settings.expiry_threshold() >= expiry
    }

    /// Rotate `provider` now if its token is near expiry.
    ///
    /// Returns immediately with [`IN_PROGRESS_REASON`] when another
    /// rotation holds the lock.
    pub async fn rotate_tokens(&self, provider: &str) -> Result<RotationResult> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            tracing::debug!(provider, "rotation skipped, another one is in flight");
            return Ok(RotationResult::skipped(provider, IN_PROGRESS_REASON));
        };
        self.rotate_locked(provider).await
    }

    /// The sweep: check every configured provider that is due, each
    /// independently of the others' outcome.
    pub async fn check_all_providers(&self) -> Vec<RotationResult> {
        let _guard = self.in_flight.lock().await;
        let now = Utc::now();
        *self.last_sweep.write().await = Some(now);

        let providers: Vec<(String, RotationSettings)> = self
            .settings
            .read()
            .await
            .iter()
            .map(|(p, s)| (p.clone(), s.clone()))
            .collect();

        let mut results = Vec::with_capacity(providers.len());
        for (provider, settings) in providers {
            if !self.is_due(&provider, &settings, now).await {
                results.push(RotationResult::skipped(&provider, "checked recently"));
                continue;
            }
            let result = match self.rotate_locked(&provider).await {
                Ok(result) => result,
                Err(e) => RotationResult::skipped(&provider, format!("rotation failed: {e}")),
            };
            results.push(result);
        }

        let rotated = results.iter().filter(|r| r.was_rotated).count();
        tracing::info!(providers = results.len(), rotated, "rotation sweep complete");
        results
    }

    async fn is_due(&self, provider: &str, settings: &RotationSettings, now: DateTime<Utc>) -> bool {
        let last_checked = self
            .stats
            .read()
            .await
            .get(provider)
            .and_then(|s| s.last_checked);
        match last_checked {
            None => true,
            Some(at) => {
                let interval = i64::try_from(settings.check_interval_secs).unwrap_or(i64::MAX);
                (now - at).num_seconds().saturating_add(CHECK_SLACK_SECS) >= interval
            }
        }
    }

    /// Caller holds `in_flight`.
    async fn rotate_locked(&self, provider: &str) -> Result<RotationResult> {
        let settings = self.settings_for(provider).await;
        if !settings.enabled {
            return Ok(RotationResult::skipped(provider, "rotation disabled"));
        }

        self.stats
            .write()
            .await
            .entry(provider.to_string())
            .or_default()
            .last_checked = Some(Utc::now());

        let Some(expiry) = self.oauth.token_expiry(provider).await? else {
            return Ok(RotationResult::skipped(provider, "not signed in"));
        };
        if !Self::near(expiry, &settings) {
            return Ok(RotationResult::skipped(
                provider,
                format!("token valid until {}", expiry.to_rfc3339()),
            ));
        }

        tracing::info!(provider, expires_at = %expiry, "rotating token near expiry");
        let max_attempts = settings.max_retries + 1;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self
                .oauth
                .refresh_if_expiring(provider, settings.expiry_threshold())
                .await
            {
                Ok(None) => {
                    return Ok(RotationResult::skipped(provider, "token not near expiry"));
                }
                Ok(Some(tokens)) => {
                    let new_expiry = tokens.expiry();
                    self.record_success(provider, new_expiry, attempts).await;
                    return Ok(RotationResult {
                        provider: provider.to_string(),
                        was_rotated: true,
                        reason: format!("token expiring at {} refreshed", expiry.to_rfc3339()),
                        new_expiry,
                    });
                }
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    tracing::warn!(provider, attempt = attempts, error = %e, "token rotation attempt failed, retrying");
                    tokio::time::sleep(Duration::from_secs(settings.retry_delay_secs)).await;
                }
                Err(e) => {
                    self.record_failure(provider, &e, attempts).await;
                    return Err(e);
                }
            }
        }
    }

    async fn record_success(&self, provider: &str, expires_at: Option<DateTime<Utc>>, attempts: u32) {
        let at = Utc::now();
        {
            let mut stats = self.stats.write().await;
            let entry = stats.entry(provider.to_string()).or_default();
            entry.successful_rotations += 1;
            entry.last_success = Some(at);
        }

        tracing::info!(provider, attempts, "token rotated");
        self.audit.log_security_event(
            SecurityEvent::new(AuditEventType::TokenRotation, "token_rotation")
                .with_details(format!("provider={provider} attempts={attempts}")),
        );
        self.publish(RotationEvent::TokenRotated {
            provider: provider.to_string(),
            expires_at,
            attempts,
            at,
        });
    }

    async fn record_failure(&self, provider: &str, error: &AuthError, attempts: u32) {
        let at = Utc::now();
        {
            let mut stats = self.stats.write().await;
            let entry = stats.entry(provider.to_string()).or_default();
            entry.failed_rotations += 1;
            entry.last_failure = Some(at);
            entry.last_error = Some(error.to_string());
        }

        tracing::error!(provider, attempts, error = %error, "token rotation failed");
        self.audit.log_security_event(
            SecurityEvent::new(AuditEventType::TokenRotation, "token_rotation")
                .with_details(format!("provider={provider} attempts={attempts}"))
                .failed(error),
        );
        self.publish(RotationEvent::TokenRotationFailed {
            provider: provider.to_string(),
            error: error.to_string(),
            attempts,
            requires_reauthentication: error.requires_reauthentication(),
            at,
        });
    }

    fn publish(&self, event: RotationEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("no rotation event subscribers");
        }
    }

    /// Snapshot of the cumulative counters.
    pub async fn get_rotation_statistics(&self) -> RotationStatistics {
        let providers = self.stats.read().await.clone();
        RotationStatistics {
            state: self.state().await,
            check_interval_secs: self.check_interval.as_secs(),
            last_sweep: *self.last_sweep.read().await,
            total_successful: providers.values().map(|s| s.successful_rotations).sum(),
            total_failed: providers.values().map(|s| s.failed_rotations).sum(),
            providers,
        }
    }
}
