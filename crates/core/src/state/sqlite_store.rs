//! # SQLite Session Store
//!
//! Relational fallback backend. One table of versioned JSON records; the version check
//! and the write happen inside one immediate transaction so several processes can share
//! the database file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::store::{check_version, expiry, PutOutcome, SessionStore, StoreBackend, StoredRecord};
use crate::error::{ForgeError, ForgeResult};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Open or create the store at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path.as_ref()).context("Failed to open session database")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        let purged = store.purge_expired()?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired session records");
        }
        Ok(store)
    }

    fn lock(&self) -> ForgeResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ForgeError::store(format!("Lock error: {}", e)))
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS session_records (
                    key TEXT PRIMARY KEY,
                    version INTEGER NOT NULL,
                    data TEXT NOT NULL,
                    expires_at TEXT,
                    updated_at TEXT NOT NULL
                )
                "#,
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_session_records_expires ON session_records(expires_at)",
                [],
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
            tracing::debug!("Session store migrated to schema v{}", SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Delete records whose TTL has passed
    pub fn purge_expired(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let purged = conn.execute(
            "DELETE FROM session_records WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![Utc::now().to_rfc3339()],
        )?;
        Ok(purged)
    }

    fn read_record(conn: &Connection, key: &str) -> ForgeResult<Option<StoredRecord>> {
        let row = conn
            .query_row(
                "SELECT version, data, expires_at FROM session_records WHERE key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(version, data, expires_at)| {
            let expires_at = expires_at
                .map(|s| {
                    DateTime::parse_from_rfc3339(&s)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| ForgeError::store(format!("Bad expiry '{}': {}", s, e)))
                })
                .transpose()?;
            Ok(StoredRecord {
                version: version as u64,
                data,
                expires_at,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Sqlite
    }

    async fn get(&self, key: &str) -> ForgeResult<Option<StoredRecord>> {
        let conn = self.lock()?;
        let now = Utc::now();
        Ok(Self::read_record(&conn, key)?.filter(|r| r.is_live(now)))
    }

    async fn put(
        &self,
        key: &str,
        data: &str,
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> ForgeResult<PutOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();

        let existing = Self::read_record(&tx, key)?;
        let version = match check_version(existing.as_ref(), expected_version, now) {
            Ok(version) => version,
            Err(conflict) => return Ok(conflict),
        };

        tx.execute(
            r#"
            INSERT INTO session_records (key, version, data, expires_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key) DO UPDATE SET
                version = excluded.version,
                data = excluded.data,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
            params![
                key,
                version as i64,
                data,
                expiry(ttl, now).map(|t| t.to_rfc3339()),
                now.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(key, version, "Stored session record");
        Ok(PutOutcome::Stored { version })
    }

    async fn delete(&self, key: &str) -> ForgeResult<bool> {
        let conn = self.lock()?;
        let affected = conn.execute("DELETE FROM session_records WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    async fn ping(&self) -> ForgeResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versioned_put() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        assert_eq!(
            store.put("k", "a", 0, None).await.unwrap(),
            PutOutcome::Stored { version: 1 }
        );
        assert_eq!(
            store.put("k", "again", 0, None).await.unwrap(),
            PutOutcome::Conflict { current: Some(1) }
        );
        assert_eq!(
            store.put("k", "b", 1, None).await.unwrap(),
            PutOutcome::Stored { version: 2 }
        );
        assert_eq!(store.get("k").await.unwrap().unwrap().data, "b");
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SqliteSessionStore::open_at(&path).unwrap();
            store
                .put("session:1", r#"{"x":1}"#, 0, Some(Duration::from_secs(60)))
                .await
                .unwrap();
        }
        let store = SqliteSessionStore::open_at(&path).unwrap();
        let record = store.get("session:1").await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.data, r#"{"x":1}"#);
        assert!(record.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_reads_absent() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store
            .put("k", "a", 0, Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_ping() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.ping().await.unwrap();
        store.put("k", "a", 0, None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }
}
