//! SQLite persistence for encrypted credentials and the audit log.
//!
//! # Schema
//!
//! - `credentials`: one row per credential key. `ciphertext` is the opaque
//!   output of the encryption service; plaintext never reaches this file.
//! - `audit_log`: append-only mirror of the in-memory audit buffer.
//!   Triggers reject `UPDATE` and `DELETE`.
//!
//! Migrations run automatically in [`VaultDatabase::open`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::audit::{AuditEntry, AuditEventType};
use crate::error::{Result, VaultError};

/// Shared handle to the vault database.
pub struct VaultDatabase {
    conn: Mutex<Connection>,
}

impl VaultDatabase {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening vault database");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::configure_connection(&conn)?;
        Self::run_migrations(&conn)?;

        tracing::info!("vault database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn)?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        tracing::debug!("running vault schema migrations");

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                key              TEXT PRIMARY KEY,
                ciphertext       BLOB NOT NULL,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL,
                last_accessed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id             TEXT PRIMARY KEY,
                timestamp      INTEGER NOT NULL,
                event_type     TEXT NOT NULL,
                operation      TEXT NOT NULL,
                credential_key TEXT,
                success        INTEGER NOT NULL,
                error          TEXT,
                details        TEXT,
                user_name      TEXT,
                session_id     TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);

            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END;",
        )
        .map_err(|e| VaultError::MigrationFailed {
            reason: e.to_string(),
        })?;

        tracing::debug!("vault schema migrations complete");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Internal("vault database lock poisoned".into()))
    }

    // -- Credentials --------------------------------------------------------

    /// Insert or replace the ciphertext for `key` in a single statement.
    pub fn upsert_credential(&self, key: &str, ciphertext: &[u8]) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        self.conn()?.execute(
            "INSERT INTO credentials (key, ciphertext, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(key) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                updated_at = excluded.updated_at",
            params![key, ciphertext, now],
        )?;
        Ok(())
    }

    /// Ciphertext for `key`, if present. Updates `last_accessed_at`.
    pub fn load_credential(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT ciphertext FROM credentials WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;

        if row.is_some() {
            conn.execute(
                "UPDATE credentials SET last_accessed_at = ?1 WHERE key = ?2",
                params![Utc::now().timestamp_millis(), key],
            )?;
        }
        Ok(row)
    }

    /// Delete `key`. Returns whether a row was removed.
    pub fn delete_credential(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn()?
            .execute("DELETE FROM credentials WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    pub fn credential_exists(&self, key: &str) -> Result<bool> {
        let exists = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM credentials WHERE key = ?1)",
            params![key],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// All credential keys, sorted.
    pub fn list_keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM credentials ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn credential_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    // -- Audit log ----------------------------------------------------------

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO audit_log
                (id, timestamp, event_type, operation, credential_key, success,
                 error, details, user_name, session_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.id.to_string(),
                entry.timestamp.timestamp_millis(),
                entry.event_type.as_str(),
                entry.operation,
                entry.credential_key,
                entry.success,
                entry.error,
                entry.details,
                entry.user,
                entry.session_id,
            ],
        )?;
        Ok(())
    }

    /// Persisted audit entries with `from <= timestamp <= to`, newest first.
    pub fn query_audit(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_type, operation, credential_key, success,
                    error, details, user_name, session_id
             FROM audit_log
             WHERE timestamp >= ?1 AND timestamp <= ?2
             ORDER BY timestamp DESC",
        )?;
        let entries = stmt
            .query_map(
                params![from.timestamp_millis(), to.timestamp_millis()],
                map_audit_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn map_audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let id: String = row.get(0)?;
    let ts: i64 = row.get(1)?;
    let event_type: String = row.get(2)?;

    Ok(AuditEntry {
        id: uuid::Uuid::parse_str(&id).unwrap_or_default(),
        timestamp: Utc
            .timestamp_millis_opt(ts)
            .single()
            .unwrap_or_default(),
        event_type: AuditEventType::parse(&event_type).unwrap_or(AuditEventType::Security),
        operation: row.get(3)?,
        credential_key: row.get(4)?,
        success: row.get(5)?,
        error: row.get(6)?,
        details: row.get(7)?,
        user: row.get(8)?,
        session_id: row.get(9)?,
    })
}
