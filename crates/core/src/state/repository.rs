//! # Session Repository
//!
//! Typed access to sessions on top of any [`SessionStore`]. Every mutation is a
//! read-modify-write guarded by the record version; on conflict the repository re-reads
//! and re-applies the mutation, a bounded number of times, before giving up.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use super::session::GenerationSession;
use super::store::{PutOutcome, SessionStore};
use crate::error::{ForgeError, ForgeResult};

pub fn session_key(id: &str) -> String {
    format!("session:{}", id)
}

#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn SessionStore>,
    record_ttl: Option<Duration>,
    max_retries: u32,
}

impl SessionRepository {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            record_ttl: Some(Duration::from_secs(7 * 24 * 3600)),
            max_retries: 3,
        }
    }

    pub fn with_record_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.record_ttl = ttl;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.store)
    }

    pub fn record_ttl(&self) -> Option<Duration> {
        self.record_ttl
    }

    pub async fn find(&self, id: &str) -> ForgeResult<Option<GenerationSession>> {
        let Some(record) = self.store.get(&session_key(id)).await? else {
            return Ok(None);
        };
        let mut session: GenerationSession = serde_json::from_str(&record.data)?;
        session.version = record.version;
        Ok(Some(session))
    }

    pub async fn load(&self, id: &str) -> ForgeResult<GenerationSession> {
        self.find(id)
            .await?
            .ok_or_else(|| ForgeError::session_not_found(id))
    }

    /// Persist a new session; fails if the id is already taken
    pub async fn create(&self, mut session: GenerationSession) -> ForgeResult<GenerationSession> {
        let data = serde_json::to_string(&session)?;
        match self
            .store
            .put(&session_key(&session.id), &data, 0, self.record_ttl)
            .await?
        {
            PutOutcome::Stored { version } => {
                session.version = version;
                tracing::debug!(session_id = %session.id, "Created session");
                Ok(session)
            }
            PutOutcome::Conflict { .. } => Err(ForgeError::Conflict(session.id)),
        }
    }

    /// Write `session` if nobody else has written since it was read
    pub async fn save(&self, session: &mut GenerationSession) -> ForgeResult<()> {
        let previous = session.updated_at;
        session.updated_at = Utc::now();
        let data = serde_json::to_string(&session)?;
        match self
            .store
            .put(&session_key(&session.id), &data, session.version, self.record_ttl)
            .await?
        {
            PutOutcome::Stored { version } => {
                session.version = version;
                Ok(())
            }
            PutOutcome::Conflict { current } => {
                session.updated_at = previous;
                tracing::debug!(
                    session_id = %session.id,
                    expected = session.version,
                    ?current,
                    "Session write conflict"
                );
                Err(ForgeError::Conflict(session.id.clone()))
            }
        }
    }

    /// Read-modify-write with conflict retries. A mutation that changes nothing is not written.
    pub async fn update<T, F>(&self, id: &str, mut mutate: F) -> ForgeResult<(GenerationSession, T)>
    where
        F: FnMut(&mut GenerationSession) -> ForgeResult<T>,
    {
        for attempt in 0..=self.max_retries {
            let mut session = self.load(id).await?;
            let before = serde_json::to_string(&session)?;
            let output = mutate(&mut session)?;
            if serde_json::to_string(&session)? == before {
                return Ok((session, output));
            }
            match self.save(&mut session).await {
                Ok(()) => return Ok((session, output)),
                Err(ForgeError::Conflict(_)) => {
                    tracing::debug!(session_id = id, attempt, "Retrying session update after conflict");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::warn!(session_id = id, retries = self.max_retries, "Session update kept conflicting");
        Err(ForgeError::Conflict(id.to_string()))
    }

    pub async fn delete(&self, id: &str) -> ForgeResult<bool> {
        self.store.delete(&session_key(id)).await
    }
}
