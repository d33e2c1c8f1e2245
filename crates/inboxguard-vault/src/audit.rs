//! Security audit log.
//!
//! Every credential operation and security-relevant event becomes an
//! immutable [`AuditEntry`]. Entries live in a bounded in-memory buffer
//! (oldest pruned first) and are optionally mirrored to the append-only
//! `audit_log` table of a [`VaultDatabase`].
//!
//! Credential keys are masked with [`mask_credential_key`] before they enter
//! an entry; raw keys and values are never recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::VaultDatabase;
use crate::error::{Result, VaultError};

/// Default number of entries kept in memory.
pub const DEFAULT_CAPACITY: usize = 10_000;

const TOP_OPERATIONS: usize = 5;
const RECENT_FAILURES: usize = 10;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Broad category of an audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Store, retrieve, remove of a vault credential.
    Credential,
    /// Interactive sign-in, sign-out, scope expansion.
    Authentication,
    /// Token refresh, scheduled or on demand.
    TokenRotation,
    /// Health checks of vault components.
    HealthCheck,
    /// Component lifecycle and configuration changes.
    Configuration,
    /// Anything else security relevant (corrupt data evicted, ...).
    Security,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Authentication => "authentication",
            Self::TokenRotation => "token_rotation",
            Self::HealthCheck => "health_check",
            Self::Configuration => "configuration",
            Self::Security => "security",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential" => Some(Self::Credential),
            "authentication" => Some(Self::Authentication),
            "token_rotation" => Some(Self::TokenRotation),
            "health_check" => Some(Self::HealthCheck),
            "configuration" => Some(Self::Configuration),
            "security" => Some(Self::Security),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential operations recorded by the storage manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOperation {
    Store,
    Retrieve,
    Remove,
}

impl CredentialOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Retrieve => "retrieve",
            Self::Remove => "remove",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub operation: String,
    /// Already masked.
    pub credential_key: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<String>,
    pub user: Option<String>,
    pub session_id: Option<String>,
}

impl AuditEntry {
    /// A successful entry stamped now with a time-ordered id.
    pub fn new(event_type: AuditEventType, operation: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            timestamp: Utc::now(),
            event_type,
            operation: operation.into(),
            credential_key: None,
            success: true,
            error: None,
            details: None,
            user: None,
            session_id: None,
        }
    }
}

/// A security event as submitted by a caller, before masking and stamping.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub event_type: AuditEventType,
    pub operation: String,
    pub credential_key: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub details: Option<String>,
}

impl SecurityEvent {
    pub fn new(event_type: AuditEventType, operation: impl Into<String>) -> Self {
        Self {
            event_type,
            operation: operation.into(),
            credential_key: None,
            success: true,
            error: None,
            details: None,
        }
    }

    /// Attach a raw credential key; it is masked when logged.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.credential_key = Some(key.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn failed(mut self, error: impl std::fmt::Display) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }
}

/// Count of entries for one operation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCount {
    pub operation: String,
    pub count: usize,
}

/// Aggregate over a time window, from [`SecurityAuditLogger::get_security_summary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySummary {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_events: usize,
    pub successful_events: usize,
    pub failed_events: usize,
    pub top_operations: Vec<OperationCount>,
    pub recent_failures: Vec<AuditEntry>,
}

/// Who the process acts for, stamped on every entry.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    pub user: Option<String>,
    pub session_id: Option<String>,
}

impl AuditContext {
    /// Current OS user and a fresh session id.
    pub fn current() -> Self {
        Self {
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .ok(),
            session_id: Some(Uuid::new_v4().to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Masking
// ---------------------------------------------------------------------------

/// Mask a credential key for display.
///
/// Up to 6 characters become `***`; up to 10 keep the first 3 and last 2;
/// longer keys keep the first 4 and last 3.
pub fn mask_credential_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let n = chars.len();
    let (head, tail) = match n {
        0..=6 => return "***".to_string(),
        7..=10 => (3, 2),
        _ => (4, 3),
    };
    let mut masked: String = chars[..head].iter().collect();
    masked.push_str("***");
    masked.extend(&chars[n - tail..]);
    masked
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Bounded, append-only audit log.
pub struct SecurityAuditLogger {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    context: AuditContext,
    sink: Option<Arc<VaultDatabase>>,
}

impl SecurityAuditLogger {
    /// In-memory logger holding at most `capacity` entries.
    pub fn new(capacity: usize, context: AuditContext) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            context,
            sink: None,
        }
    }

    /// Also mirror every entry into the database's `audit_log` table.
    pub fn with_sink(mut self, db: Arc<VaultDatabase>) -> Self {
        self.sink = Some(db);
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.sink.is_some()
    }

    fn entries(&self) -> Result<MutexGuard<'_, VecDeque<AuditEntry>>> {
        self.entries
            .lock()
            .map_err(|_| VaultError::Internal("audit log lock poisoned".into()))
    }

    /// Record a store/retrieve/remove. `error` marks the operation failed.
    pub fn log_credential_operation(
        &self,
        operation: CredentialOperation,
        key: &str,
        error: Option<&str>,
    ) {
        let mut event = SecurityEvent::new(AuditEventType::Credential, operation.as_str()).with_key(key);
        if let Some(error) = error {
            event = event.failed(error);
        }
        self.log_security_event(event);
    }

    /// Record any event. Logging never fails the caller: a poisoned lock or
    /// a failed durable write is reported through `tracing` instead.
    pub fn log_security_event(&self, event: SecurityEvent) {
        let entry = AuditEntry {
            credential_key: event.credential_key.as_deref().map(mask_credential_key),
            success: event.success,
            error: event.error,
            details: event.details,
            user: self.context.user.clone(),
            session_id: self.context.session_id.clone(),
            ..AuditEntry::new(event.event_type, event.operation)
        };

        if let Err(e) = self.append(entry) {
            tracing::error!(error = %e, "failed to record audit entry");
        }
    }

    fn append(&self, entry: AuditEntry) -> Result<()> {
        // Lock held across the durable write so both orders agree.
        let mut entries = self.entries()?;

        if let Some(db) = &self.sink {
            if let Err(e) = db.append_audit(&entry) {
                tracing::warn!(error = %e, "audit entry not persisted");
            }
        }

        tracing::debug!(
            event_type = %entry.event_type,
            operation = %entry.operation,
            key = entry.credential_key.as_deref().unwrap_or("-"),
            success = entry.success,
            "audit"
        );

        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        Ok(())
    }

    /// Entries with `from <= timestamp <= to`, newest first.
    pub fn get_audit_trail(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<AuditEntry> {
        let entries = match self.entries() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "audit trail unavailable");
                return Vec::new();
            }
        };

        // Newest appended first; the stable sort keeps that order for ties.
        let mut trail: Vec<AuditEntry> = entries
            .iter()
            .rev()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect();
        trail.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        trail
    }

    /// Totals for the last `period`, with the five busiest operations and
    /// the ten most recent failures.
    pub fn get_security_summary(&self, period: Duration) -> SecuritySummary {
        let period_end = Utc::now();
        let period_start = period_end - period;
        let trail = self.get_audit_trail(period_start, period_end);

        let successful_events = trail.iter().filter(|e| e.success).count();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for entry in &trail {
            *counts.entry(entry.operation.as_str()).or_default() += 1;
        }
        let mut top_operations: Vec<OperationCount> = counts
            .into_iter()
            .map(|(operation, count)| OperationCount {
                operation: operation.to_string(),
                count,
            })
            .collect();
        top_operations.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.operation.cmp(&b.operation)));
        top_operations.truncate(TOP_OPERATIONS);

        let recent_failures: Vec<AuditEntry> = trail
            .iter()
            .filter(|e| !e.success)
            .take(RECENT_FAILURES)
            .cloned()
            .collect();

        SecuritySummary {
            period_start,
            period_end,
            total_events: trail.len(),
            successful_events,
            failed_events: trail.len() - successful_events,
            top_operations,
            recent_failures,
        }
    }

    /// Number of entries currently buffered.
    pub fn len(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SecurityAuditLogger {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, AuditContext::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masking_rules() {
        assert_eq!(mask_credential_key(""), "***");
        assert_eq!(mask_credential_key("abc"), "***");
        assert_eq!(mask_credential_key("abcdef"), "***");
        assert_eq!(mask_credential_key("abcdefg"), "abc***fg");
        assert_eq!(mask_credential_key("abcdefghij"), "abc***ij");
        assert_eq!(mask_credential_key("abcdefghijk"), "abcd***ijk");
        assert_eq!(mask_credential_key("gmail_access_token"), "gmai***ken");
        // Deterministic.
        assert_eq!(
            mask_credential_key("gmail_refresh_token"),
            mask_credential_key("gmail_refresh_token")
        );
    }

    #[test]
    fn masking_counts_characters_not_bytes() {
        assert_eq!(mask_credential_key("ключ_доступа"), "ключ***упа");
    }

    #[test]
    fn entries_are_masked_and_stamped() {
        let logger = SecurityAuditLogger::new(
            10,
            AuditContext {
                user: Some("alice".into()),
                session_id: Some("s-1".into()),
            },
        );
        logger.log_credential_operation(CredentialOperation::Store, "gmail_access_token", None);

        let trail = logger.get_audit_trail(Utc::now() - Duration::minutes(1), Utc::now());
        assert_eq!(trail.len(), 1);
        let entry = &trail[0];
        assert_eq!(entry.operation, "store");
        assert_eq!(entry.credential_key.as_deref(), Some("gmai***ken"));
        assert_eq!(entry.user.as_deref(), Some("alice"));
        assert_eq!(entry.session_id.as_deref(), Some("s-1"));
        assert!(entry.success);
    }

    #[test]
    fn buffer_is_bounded() {
        let logger = SecurityAuditLogger::new(3, AuditContext::default());
        for i in 0..5 {
            logger.log_security_event(SecurityEvent::new(AuditEventType::Security, format!("op{i}")));
        }
        assert_eq!(logger.len(), 3);
        let trail = logger.get_audit_trail(Utc::now() - Duration::minutes(1), Utc::now());
        let ops: Vec<&str> = trail.iter().map(|e| e.operation.as_str()).collect();
        assert_eq!(ops, vec!["op4", "op3", "op2"]);
    }

    #[test]
    fn trail_bounds_are_inclusive() {
        let logger = SecurityAuditLogger::default();
        logger.log_security_event(SecurityEvent::new(AuditEventType::Configuration, "initialize"));
        let ts = logger.get_audit_trail(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC)[0].timestamp;

        assert_eq!(logger.get_audit_trail(ts, ts).len(), 1);
        assert!(logger.get_audit_trail(ts + Duration::nanoseconds(1), DateTime::<Utc>::MAX_UTC).is_empty());
    }

    #[test]
    fn summary_counts_and_ranks() {
        let logger = SecurityAuditLogger::default();
        for _ in 0..3 {
            logger.log_credential_operation(CredentialOperation::Retrieve, "gmail_access_token", None);
        }
        logger.log_credential_operation(CredentialOperation::Store, "gmail_access_token", None);
        for i in 0..12 {
            logger.log_credential_operation(
                CredentialOperation::Remove,
                "gmail_access_token",
                Some(&format!("failure {i}")),
            );
        }
        for op in ["a", "b", "c", "d"] {
            logger.log_security_event(SecurityEvent::new(AuditEventType::Security, op));
        }

        let summary = logger.get_security_summary(Duration::hours(1));
        assert_eq!(summary.total_events, 20);
        assert_eq!(summary.failed_events, 12);
        assert_eq!(summary.successful_events, 8);

        assert_eq!(summary.top_operations.len(), 5);
        assert_eq!(summary.top_operations[0].operation, "remove");
        assert_eq!(summary.top_operations[0].count, 12);
        assert_eq!(summary.top_operations[1].operation, "retrieve");

        assert_eq!(summary.recent_failures.len(), 10);
        assert_eq!(summary.recent_failures[0].error.as_deref(), Some("failure 11"));
    }

    #[test]
    fn concurrent_writers_lose_nothing() {
        let logger = Arc::new(SecurityAuditLogger::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let logger = Arc::clone(&logger);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        logger.log_security_event(SecurityEvent::new(
                            AuditEventType::Security,
                            format!("t{t}-{i}"),
                        ));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(logger.len(), 400);
    }

    #[test]
    fn entries_mirror_to_database() {
        let db = Arc::new(VaultDatabase::open_in_memory().unwrap());
        let logger = SecurityAuditLogger::new(10, AuditContext::default()).with_sink(db.clone());
        assert!(logger.is_persistent());

        logger.log_security_event(
            SecurityEvent::new(AuditEventType::Authentication, "sign_out_partial")
                .with_key("gmail_refresh_token")
                .with_details("5 of 6 entries removed"),
        );

        let rows = db
            .query_audit(Utc::now() - Duration::minutes(1), Utc::now())
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].operation, "sign_out_partial");
        assert_eq!(rows[0].details.as_deref(), Some("5 of 6 entries removed"));
    }
}
