//! # Seed Controller
//!
//! One seed per session, generated on first use and persisted through the versioned
//! session repository so concurrent first calls agree on the same value.

use rand::Rng;
use std::future::Future;

use crate::error::{ForgeResult, GenerationError};
use crate::state::SessionRepository;

/// Random seed in `[0, 2^32)`
pub fn fresh_seed() -> u64 {
    rand::thread_rng().gen_range(0..(1u64 << 32))
}

/// Run `call` with `seed`; if the model rejects seeding, retry once without it.
pub async fn with_seed_fallback<T, F, Fut>(seed: Option<u64>, mut call: F) -> Result<T, GenerationError>
where
    F: FnMut(Option<u64>) -> Fut,
    Fut: Future<Output = Result<T, GenerationError>>,
{
    match call(seed).await {
        Err(GenerationError::SeedUnsupported { model }) if seed.is_some() => {
            tracing::warn!(model = %model, "Model rejected seed parameter; retrying without seed");
            call(None).await
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct SeedController {
    sessions: SessionRepository,
}

impl SeedController {
    pub fn new(sessions: SessionRepository) -> Self {
        Self { sessions }
    }

    /// Seed for the session's next generation call. Idempotent: only the first call for a
    /// session writes. `None` when seed control is disabled for the session.
    pub async fn get_seed_for_generation(&self, session_id: &str) -> ForgeResult<Option<u64>> {
        let session = self.sessions.load(session_id).await?;
        if session.coherence.latent_reuse {
            tracing::info!(session_id, "Latent reuse requested; not supported, ignoring");
        }
        if !session.coherence.seed_control {
            return Ok(None);
        }
        if let Some(seed) = session.coherence.seed {
            return Ok(Some(seed));
        }

        let (_, seed) = self
            .sessions
            .update(session_id, |session| Ok(session.coherence.assign_seed_once()))
            .await?;
        tracing::info!(session_id, ?seed, "Assigned session seed");
        Ok(seed)
    }
}
