//! # Scripted Adapter
//!
//! Deterministic, network-free generation backend. Backs `--offline` mode and the test
//! suite. Outputs are derived from the prompt and a call counter, scores from a hash of
//! the artifact URI, so runs are reproducible but every call produces a distinct artifact.
//!
//! Failure injection is done through `&self` setters so a shared `Arc<ScriptedAdapter>`
//! can be reconfigured while sessions run.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{ArtifactKind, ArtifactRef, Candidate, GenerationAdapter, ScoreBreakdown};
use crate::error::GenerationError;

const IMAGE_COST: f64 = 1.0;
const VIDEO_COST: f64 = 4.0;

/// Record of one adapter invocation
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterCall {
    pub kind: ArtifactKind,
    pub prompt: String,
    pub seed: Option<u64>,
    pub conditioning: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedAdapter {
    counter: AtomicUsize,
    text_failures: AtomicUsize,
    image_failures: AtomicUsize,
    reject_seeds: AtomicBool,
    delay_ms: AtomicUsize,
    fail_markers: Mutex<Vec<String>>,
    scores: Mutex<VecDeque<ScoreBreakdown>>,
    calls: Mutex<Vec<AdapterCall>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn unit_from_hash(seed: &str, salt: &str) -> f32 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    salt.hash(&mut hasher);
    (hasher.finish() % 10_000) as f32 / 10_000.0
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` text generations
    pub fn fail_next_text(&self, n: usize) {
        self.text_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` image or video generations
    pub fn fail_next_media(&self, n: usize) {
        self.image_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every call whose prompt contains `marker`
    pub fn fail_when_prompt_contains(&self, marker: impl Into<String>) {
        lock(&self.fail_markers).push(marker.into());
    }

    /// Behave like a model without seed support
    pub fn reject_seeds(&self, reject: bool) {
        self.reject_seeds.store(reject, Ordering::SeqCst);
    }

    /// Sleep before every generation call
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Queue explicit scores, consumed in call order before hash-derived scores
    pub fn push_scores(&self, scores: impl IntoIterator<Item = ScoreBreakdown>) {
        lock(&self.scores).extend(scores);
    }

    /// All generation calls made so far
    pub fn calls(&self) -> Vec<AdapterCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_of(&self, kind: ArtifactKind) -> Vec<AdapterCall> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    fn next_id(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn enter(
        &self,
        kind: ArtifactKind,
        prompt: &str,
        conditioning: &[ArtifactRef],
        seed: Option<u64>,
    ) -> Result<(), GenerationError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        lock(&self.calls).push(AdapterCall {
            kind,
            prompt: prompt.to_string(),
            seed,
            conditioning: conditioning.iter().map(|a| a.uri.clone()).collect(),
        });

        if lock(&self.fail_markers)
            .iter()
            .any(|marker| prompt.contains(marker.as_str()))
        {
            return Err(GenerationError::Backend(format!(
                "scripted failure for prompt '{}'",
                prompt
            )));
        }
        let counter = match kind {
            ArtifactKind::Text => &self.text_failures,
            ArtifactKind::Image | ArtifactKind::Video => &self.image_failures,
        };
        if Self::take_failure(counter) {
            return Err(GenerationError::Backend("scripted upstream failure".into()));
        }
        if seed.is_some() && kind != ArtifactKind::Text && self.reject_seeds.load(Ordering::SeqCst)
        {
            return Err(GenerationError::SeedUnsupported {
                model: "scripted".into(),
            });
        }
        Ok(())
    }

    fn compose_text(prompt: &str, draft: usize) -> String {
        let subject = prompt.lines().next().unwrap_or(prompt).trim();
        let mut paragraphs = vec![
            format!("Draft {}. It begins: {}.", draft, subject),
            format!("The middle of the tale follows {} through a turn of fortune.", subject),
            format!("It ends with {} changed for good.", subject),
        ];
        let notes: Vec<&str> = prompt
            .lines()
            .filter_map(|line| line.trim().strip_prefix("- "))
            .collect();
        if !notes.is_empty() {
            paragraphs.push(format!("Revised to be {}.", notes.join(" and ")));
        }
        paragraphs.join("\n\n")
    }
}

#[async_trait]
impl GenerationAdapter for ScriptedAdapter {
    async fn generate_text(&self, prompt: &str, _context: &str) -> Result<String, GenerationError> {
        self.enter(ArtifactKind::Text, prompt, &[], None).await?;
        Ok(Self::compose_text(prompt, self.next_id()))
    }

    async fn generate_image_variants(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        k: usize,
        seed: Option<u64>,
    ) -> Result<Vec<Candidate>, GenerationError> {
        self.enter(ArtifactKind::Image, prompt, conditioning, seed)
            .await?;
        Ok((0..k.max(1))
            .map(|_| Candidate {
                artifact: ArtifactRef::image(format!("mem://image/{}", self.next_id())),
                prompt: prompt.to_string(),
                text: None,
                seed,
                model: Some("scripted-image".into()),
                cost: IMAGE_COST,
            })
            .collect())
    }

    async fn generate_video(
        &self,
        prompt: &str,
        conditioning: &[ArtifactRef],
        seed: Option<u64>,
    ) -> Result<Candidate, GenerationError> {
        self.enter(ArtifactKind::Video, prompt, conditioning, seed)
            .await?;
        Ok(Candidate {
            artifact: ArtifactRef::video(format!("mem://video/{}", self.next_id())),
            prompt: prompt.to_string(),
            text: None,
            seed,
            model: Some("scripted-video".into()),
            cost: VIDEO_COST,
        })
    }

    async fn score_variant(&self, candidate: &Candidate) -> Result<ScoreBreakdown, GenerationError> {
        if let Some(queued) = lock(&self.scores).pop_front() {
            return Ok(queued);
        }
        let uri = &candidate.artifact.uri;
        Ok(ScoreBreakdown::new(
            unit_from_hash(uri, "preference"),
            unit_from_hash(uri, "alignment"),
            unit_from_hash(uri, "aesthetic"),
        ))
    }
}
