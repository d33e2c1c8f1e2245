//! Retry with exponential backoff for Gmail API calls.
//!
//! The delay before retry `n` (1-based) is `base * multiplier^(n-1)`, capped
//! at `max_delay`, then spread by ±`jitter`. A server-supplied
//! `Retry-After` replaces the computed delay.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};

/// Backoff configuration, the `[gmail.retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    /// Fraction of the delay added or removed at random (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_secs: 120,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 || !self.multiplier.is_finite() {
            return Err(ProviderError::InvalidConfig {
                reason: format!("retry multiplier must be >= 1, got {}", self.multiplier),
            });
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ProviderError::InvalidConfig {
                reason: format!("retry jitter must be in [0, 1), got {}", self.jitter),
            });
        }
        Ok(())
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let cap = self.max_delay().as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// [`backoff`](Self::backoff) spread by the configured jitter.
    pub fn jittered_backoff(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        delay.mul_f64(factor)
    }

    /// How long to wait before retry `retry` after `error`, or `None` to
    /// give up.
    ///
    /// A `Retry-After` longer than `max_delay` gives up instead of stalling
    /// the caller; the error still carries the hint.
    pub fn delay_for(&self, retry: u32, error: &ProviderError) -> Option<Duration> {
        if retry > self.max_retries || !error.is_retryable() {
            return None;
        }
        match error.retry_after() {
            Some(wait) if wait > self.max_delay() => None,
            Some(wait) => Some(wait),
            None => Some(self.jittered_backoff(retry)),
        }
    }
}

/// Parse a `Retry-After` header: delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `op` until it succeeds, fails permanently, or retries run out.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => {
                    if retry > 0 {
                        tracing::debug!(operation, retries = retry, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    retry += 1;
                    let Some(delay) = self.policy.delay_for(retry, &e) else {
                        if e.is_retryable() {
                            tracing::warn!(operation, attempts = retry, error = %e, "giving up after retries");
                        }
                        return Err(e);
                    };
                    tracing::warn!(
                        operation,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn throttled(retry_after: Option<u64>) -> ProviderError {
        ProviderError::RateLimited {
            retry_after: retry_after.map(Duration::from_secs),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(7), Duration::from_secs(64));
        assert_eq!(policy.backoff(8), Duration::from_secs(120));
        assert_eq!(policy.backoff(40), Duration::from_secs(120));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = RetryPolicy::default();
        for _ in 0..200 {
            let d = policy.jittered_backoff(3);
            assert!(d >= Duration::from_millis(3_599) && d <= Duration::from_millis(4_401), "{d:?}");
        }
    }

    #[test]
    fn retry_after_overrides_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, &throttled(Some(17))), Some(Duration::from_secs(17)));
        assert_eq!(policy.delay_for(1, &throttled(Some(3600))), None);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let policy = RetryPolicy::default();
        let err = ProviderError::from_status(401, None, "");
        assert_eq!(policy.delay_for(1, &err), None);
        assert_eq!(policy.delay_for(6, &throttled(None)), None);
    }

    #[test]
    fn parses_retry_after_forms() {
        let now = DateTime::parse_from_rfc2822("Wed, 21 Oct 2026 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_retry_after(" 30 ", now), Some(Duration::from_secs(30)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:29:30 GMT", now),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2026 07:00:00 GMT", now),
            Some(Duration::ZERO)
        );
        assert_eq!(parse_retry_after("soon", now), None);
    }

    #[test]
    fn policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        let bad = RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let handler = RetryHandler::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = tokio::time::Instant::now();

        let value = handler
            .execute("test", move || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(throttled(Some(5))),
                    1 => Err(ProviderError::from_status(503, None, "")),
                    _ => Ok(42),
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        // 5s from Retry-After, then about 2s of backoff.
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(6_800), "{waited:?}");
        assert!(waited <= Duration::from_millis(7_300), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_max_retries() {
        let handler = RetryHandler::new(RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        });
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = handler
            .execute("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::from_status(500, None, ""))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Server { status: 500, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn forbidden_fails_immediately() {
        let handler = RetryHandler::default();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = handler
            .execute("test", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(ProviderError::from_status(403, None, "{}"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unauthorized { status: 403, .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
