//! In-process session store. Single-process deployments only.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use super::store::{check_version, expiry, PutOutcome, SessionStore, StoreBackend, StoredRecord};
use crate::error::ForgeResult;

#[derive(Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::InMemory
    }

    async fn get(&self, key: &str) -> ForgeResult<Option<StoredRecord>> {
        let now = Utc::now();
        Ok(self
            .records
            .read()
            .await
            .get(key)
            .filter(|r| r.is_live(now))
            .cloned())
    }

    async fn put(
        &self,
        key: &str,
        data: &str,
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> ForgeResult<PutOutcome> {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let version = match check_version(records.get(key), expected_version, now) {
            Ok(version) => version,
            Err(conflict) => return Ok(conflict),
        };
        records.insert(
            key.to_string(),
            StoredRecord {
                version,
                data: data.to_string(),
                expires_at: expiry(ttl, now),
            },
        );
        Ok(PutOutcome::Stored { version })
    }

    async fn delete(&self, key: &str) -> ForgeResult<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_update() {
        let store = MemorySessionStore::new();
        assert_eq!(
            store.put("k", "a", 0, None).await.unwrap(),
            PutOutcome::Stored { version: 1 }
        );
        assert_eq!(
            store.put("k", "b", 1, None).await.unwrap(),
            PutOutcome::Stored { version: 2 }
        );
        let record = store.get("k").await.unwrap().unwrap();
        assert_eq!(record.data, "b");
        assert_eq!(record.version, 2);
    }

    #[tokio::test]
    async fn test_stale_writer_rejected() {
        let store = MemorySessionStore::new();
        store.put("k", "a", 0, None).await.unwrap();
        store.put("k", "b", 1, None).await.unwrap();
        assert_eq!(
            store.put("k", "stale", 1, None).await.unwrap(),
            PutOutcome::Conflict { current: Some(2) }
        );
        assert_eq!(store.get("k").await.unwrap().unwrap().data, "b");
    }

    #[tokio::test]
    async fn test_ttl_expires_record() {
        let store = MemorySessionStore::new();
        store
            .put("k", "a", 0, Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemorySessionStore::new();
        store.put("k", "a", 0, None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
