//! # Remote Session Store
//!
//! Client for a networked key/value service speaking a small versioned-record protocol:
//!
//! - `GET    /records/{key}` - `200 {version, data, expires_at}` or `404`
//! - `PUT    /records/{key}` - body `{data, expected_version, ttl_secs}`; `200 {version}` or `409 {current}`
//! - `DELETE /records/{key}` - `200`/`204`, or `404` when absent
//! - `GET    /health`

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::store::{PutOutcome, SessionStore, StoreBackend, StoredRecord};
use crate::error::{ForgeError, ForgeResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub data: String,
    pub expected_version: u64,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConflictResponse {
    #[serde(default)]
    pub current: Option<u64>,
}

pub struct RemoteSessionStore {
    client: reqwest::Client,
    base_url: String,
}

fn store_err(e: reqwest::Error) -> ForgeError {
    ForgeError::store(format!("Remote store request failed: {}", e))
}

impl RemoteSessionStore {
    pub fn new(base_url: &str, timeout: Duration) -> ForgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(store_err)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn record_url(&self, key: &str) -> String {
        format!("{}/records/{}", self.base_url, key)
    }
}

#[async_trait]
impl SessionStore for RemoteSessionStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Remote
    }

    async fn get(&self, key: &str) -> ForgeResult<Option<StoredRecord>> {
        let response = self
            .client
            .get(self.record_url(key))
            .send()
            .await
            .map_err(store_err)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                Ok(Some(response.json::<StoredRecord>().await.map_err(store_err)?))
            }
            status => Err(ForgeError::store(format!(
                "Remote store GET {} returned {}",
                key, status
            ))),
        }
    }

    async fn put(
        &self,
        key: &str,
        data: &str,
        expected_version: u64,
        ttl: Option<Duration>,
    ) -> ForgeResult<PutOutcome> {
        let body = PutRequest {
            data: data.to_string(),
            expected_version,
            ttl_secs: ttl.map(|t| t.as_secs().max(1)),
        };
        let response = self
            .client
            .put(self.record_url(key))
            .json(&body)
            .send()
            .await
            .map_err(store_err)?;
        match response.status() {
            StatusCode::CONFLICT => {
                let conflict = response
                    .json::<ConflictResponse>()
                    .await
                    .unwrap_or(ConflictResponse { current: None });
                Ok(PutOutcome::Conflict {
                    current: conflict.current,
                })
            }
            status if status.is_success() => {
                let stored = response.json::<PutResponse>().await.map_err(store_err)?;
                Ok(PutOutcome::Stored {
                    version: stored.version,
                })
            }
            status => Err(ForgeError::store(format!(
                "Remote store PUT {} returned {}",
                key, status
            ))),
        }
    }

    async fn delete(&self, key: &str) -> ForgeResult<bool> {
        let response = self
            .client
            .delete(self.record_url(key))
            .send()
            .await
            .map_err(store_err)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(ForgeError::store(format!(
                "Remote store DELETE {} returned {}",
                key, status
            ))),
        }
    }

    async fn ping(&self) -> ForgeResult<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(store_err)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ForgeError::store(format!(
                "Remote store health check returned {}",
                response.status()
            )))
        }
    }
}
