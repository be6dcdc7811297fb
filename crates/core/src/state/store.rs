//! # Session Store
//!
//! Versioned key/value contract shared by every backend, and backend selection.
//!
//! `put` takes the version the caller last read. `0` means "create; must not exist".
//! A mismatch is reported as [`PutOutcome::Conflict`] and nothing is written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::memory_store::MemorySessionStore;
use super::remote_store::RemoteSessionStore;
use super::sqlite_store::SqliteSessionStore;
use crate::error::{ForgeError, ForgeResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub version: u64,
    pub data: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { version: u64 },
    /// Expected version did not match; `current` is the live version, if any
    Conflict { current: Option<u64> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Remote,
    Sqlite,
    InMemory,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Live record for `key`; expired records read as absent
    async fn get(&self, key: &str) -> ForgeResult<Option<StoredRecord>>;

    async fn put(
        &self,
        key: &str,
        data: &str,
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> ForgeResult<PutOutcome>;

    /// Returns whether a record was removed
    async fn delete(&self, key: &str) -> ForgeResult<bool>;

    async fn ping(&self) -> ForgeResult<()> {
        Ok(())
    }
}

/// Version check shared by the local backends
pub(crate) fn check_version(
    existing: Option<&StoredRecord>,
    expected_version: u64,
    now: DateTime<Utc>,
) -> Result<u64, PutOutcome> {
    let live = existing.filter(|r| r.is_live(now));
    match (live, expected_version) {
        (None, 0) => Ok(existing.map_or(1, |stale| stale.version + 1)),
        (None, _) => Err(PutOutcome::Conflict { current: None }),
        (Some(record), expected) if record.version == expected => Ok(expected + 1),
        (Some(record), _) => Err(PutOutcome::Conflict {
            current: Some(record.version),
        }),
    }
}

pub(crate) fn expiry(ttl: Option<Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
        .map(|ttl| now + ttl)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    #[default]
    SingleProcess,
    MultiProcess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the networked key/value service
    pub remote_url: Option<String>,
    pub sqlite_path: Option<String>,
    /// In-memory is only ever used for single-process deployments
    pub allow_in_memory: bool,
    pub deployment: Deployment,
    /// Lifetime of stored records, independent of session idle expiry
    pub record_ttl_secs: u64,
    pub max_put_retries: u32,
    pub request_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            sqlite_path: Some(".storyforge/sessions.db".to_string()),
            allow_in_memory: true,
            deployment: Deployment::SingleProcess,
            record_ttl_secs: 7 * 24 * 3600,
            max_put_retries: 3,
            request_timeout_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn record_ttl(&self) -> Option<Duration> {
        (self.record_ttl_secs > 0).then(|| Duration::from_secs(self.record_ttl_secs))
    }
}

/// Pick the first configured backend that answers, in priority order remote, sqlite, memory.
pub async fn open_session_store(config: &StoreConfig) -> ForgeResult<Arc<dyn SessionStore>> {
    if let Some(url) = &config.remote_url {
        match RemoteSessionStore::new(url, Duration::from_secs(config.request_timeout_secs)) {
            Ok(store) => match store.ping().await {
                Ok(()) => {
                    tracing::info!(url = %url, "Using remote session store");
                    return Ok(Arc::new(store));
                }
                Err(e) => tracing::warn!(url = %url, "Remote session store unreachable: {}", e),
            },
            Err(e) => tracing::warn!(url = %url, "Remote session store misconfigured: {}", e),
        }
    }

    if let Some(path) = &config.sqlite_path {
        match SqliteSessionStore::open_at(path) {
            Ok(store) => {
                tracing::info!(path = %path, "Using SQLite session store");
                return Ok(Arc::new(store));
            }
            Err(e) => tracing::warn!(path = %path, "SQLite session store unavailable: {}", e),
        }
    }

    if config.deployment == Deployment::MultiProcess {
        return Err(ForgeError::store(
            "No durable session store is reachable; multi-process deployments require the remote or SQLite backend",
        ));
    }
    if !config.allow_in_memory {
        return Err(ForgeError::store(
            "No session store is reachable and the in-memory fallback is disabled",
        ));
    }
    tracing::warn!("Using in-memory session store; sessions will not survive a restart");
    Ok(Arc::new(MemorySessionStore::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_version_create() {
        let now = Utc::now();
        assert_eq!(check_version(None, 0, now), Ok(1));
        assert_eq!(
            check_version(None, 3, now),
            Err(PutOutcome::Conflict { current: None })
        );
    }

    #[test]
    fn test_check_version_update() {
        let now = Utc::now();
        let record = StoredRecord {
            version: 2,
            data: "{}".into(),
            expires_at: None,
        };
        assert_eq!(check_version(Some(&record), 2, now), Ok(3));
        assert_eq!(
            check_version(Some(&record), 1, now),
            Err(PutOutcome::Conflict { current: Some(2) })
        );
        assert_eq!(
            check_version(Some(&record), 0, now),
            Err(PutOutcome::Conflict { current: Some(2) })
        );
    }

    #[test]
    fn test_expired_record_can_be_recreated() {
        let now = Utc::now();
        let stale = StoredRecord {
            version: 5,
            data: "{}".into(),
            expires_at: Some(now - chrono::Duration::seconds(1)),
        };
        assert_eq!(check_version(Some(&stale), 0, now), Ok(6));
        assert_eq!(
            check_version(Some(&stale), 5, now),
            Err(PutOutcome::Conflict { current: None })
        );
    }

    #[tokio::test]
    async fn test_single_process_falls_back_to_memory() {
        let config = StoreConfig {
            remote_url: Some("http://127.0.0.1:1".into()),
            sqlite_path: None,
            request_timeout_secs: 1,
            ..StoreConfig::default()
        };
        let store = open_session_store(&config).await.unwrap();
        assert_eq!(store.backend(), StoreBackend::InMemory);
    }

    #[tokio::test]
    async fn test_multi_process_requires_durable_store() {
        let config = StoreConfig {
            remote_url: None,
            sqlite_path: None,
            deployment: Deployment::MultiProcess,
            ..StoreConfig::default()
        };
        let err = open_session_store(&config).await.err().unwrap();
        assert_eq!(err.code(), "store_error");
    }

    #[tokio::test]
    async fn test_sqlite_preferred_over_memory() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            sqlite_path: Some(dir.path().join("s.db").to_string_lossy().into_owned()),
            ..StoreConfig::default()
        };
        let store = open_session_store(&config).await.unwrap();
        assert_eq!(store.backend(), StoreBackend::Sqlite);
    }
}
