//! # Generation Session
//!
//! The persisted unit of work: one user prompt travelling through the stage graph.
//! Sessions are stored as JSON; the record version lives alongside in the store and is
//! copied into `version` on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::coherence::CoherenceSettings;
use crate::error::ErrorReport;
use crate::generation::ArtifactRef;
use crate::pipeline::stage::{state_label, SessionStatus, Stage, FIRST_STAGE};
use crate::quality::{GateDecision, VariantCandidate};

/// What the user asked for
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInput {
    pub prompt: String,
    /// Optional user-supplied anchor image
    #[serde(default)]
    pub reference: Option<ArtifactRef>,
}

impl SessionInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: ArtifactRef) -> Self {
        self.reference = Some(reference);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRole {
    /// Original prompt
    User,
    /// Revision request against a stage
    Feedback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: EntryRole,
    pub content: String,
    pub stage: Stage,
    pub timestamp: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(role: EntryRole, stage: Stage, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            stage,
            timestamp: Utc::now(),
        }
    }
}

/// Per-session overrides of the global ranking configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityProfile {
    pub text_variants: Option<usize>,
    pub image_variants: Option<usize>,
    pub video_variants: Option<usize>,
    pub quality_threshold: Option<f32>,
    pub refine_prompts: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryboardFrame {
    pub index: usize,
    pub caption: String,
    pub image: ArtifactRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoClip {
    pub index: usize,
    pub clip: ArtifactRef,
}

/// Selected output of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StagePayload {
    Story { text: String },
    ReferenceImage { image: ArtifactRef, prompt: String },
    Storyboard { frames: Vec<StoryboardFrame> },
    Video { clips: Vec<VideoClip> },
}

/// Ranked candidates for one generated slot (the story, one frame, one clip)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedSelection {
    pub slot: String,
    /// Best first; only the selected candidate survives a commit
    pub candidates: Vec<VariantCandidate>,
    pub decision: GateDecision,
}

impl RankedSelection {
    pub fn selected(&self) -> Option<&VariantCandidate> {
        self.candidates.first()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub payload: StagePayload,
    pub selections: Vec<RankedSelection>,
    pub cost: f64,
    #[serde(default)]
    pub committed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub committed_at: Option<DateTime<Utc>>,
}

impl StageResult {
    pub fn new(stage: Stage, payload: StagePayload, selections: Vec<RankedSelection>) -> Self {
        let cost = selections
            .iter()
            .flat_map(|s| s.candidates.iter())
            .map(|c| c.candidate.cost)
            .sum();
        Self {
            stage,
            payload,
            selections,
            cost,
            committed: false,
            created_at: Utc::now(),
            committed_at: None,
        }
    }

    /// Freeze the result and drop every non-selected candidate
    pub fn commit(&mut self) {
        if self.committed {
            return;
        }
        for selection in &mut self.selections {
            selection.candidates.truncate(1);
        }
        self.committed = true;
        self.committed_at = Some(Utc::now());
    }

    /// Mean selected score across slots
    pub fn selected_score(&self) -> f32 {
        let scores: Vec<f32> = self
            .selections
            .iter()
            .filter_map(|s| s.selected().map(|c| c.overall))
            .collect();
        if scores.is_empty() {
            return 0.0;
        }
        scores.iter().sum::<f32>() / scores.len() as f32
    }

    pub fn below_threshold(&self) -> bool {
        self.selections.iter().any(|s| s.decision.below_threshold())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSession {
    pub id: String,
    pub owner_id: String,
    #[serde(default)]
    pub group_id: Option<String>,
    /// Display label inside a comparison group
    #[serde(default)]
    pub label: Option<String>,
    pub input: SessionInput,
    pub stage: Stage,
    pub status: SessionStatus,
    #[serde(default)]
    pub outputs: BTreeMap<Stage, StageResult>,
    #[serde(default)]
    pub history: Vec<ConversationEntry>,
    #[serde(default)]
    pub coherence: CoherenceSettings,
    #[serde(default)]
    pub quality: QualityProfile,
    #[serde(default)]
    pub last_error: Option<ErrorReport>,
    #[serde(default)]
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Store record version, refreshed on every load and save
    #[serde(default)]
    pub version: u64,
}

impl GenerationSession {
    pub fn new(owner_id: impl Into<String>, input: SessionInput) -> Self {
        let now = Utc::now();
        let history = vec![ConversationEntry::new(
            EntryRole::User,
            FIRST_STAGE,
            input.prompt.clone(),
        )];
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            group_id: None,
            label: None,
            input,
            stage: FIRST_STAGE,
            status: SessionStatus::Created,
            outputs: BTreeMap::new(),
            history,
            coherence: CoherenceSettings::default(),
            quality: QualityProfile::default(),
            last_error: None,
            cost: 0.0,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// e.g. `storyboard_paused`
    pub fn state(&self) -> String {
        state_label(self.stage, self.status)
    }

    pub fn current_result(&self) -> Option<&StageResult> {
        self.outputs.get(&self.stage)
    }

    /// Feedback entries recorded against `stage`, oldest first
    pub fn feedback_for(&self, stage: Stage) -> Vec<&str> {
        self.history
            .iter()
            .filter(|e| e.role == EntryRole::Feedback && e.stage == stage)
            .map(|e| e.content.as_str())
            .collect()
    }

    pub fn story_text(&self) -> Option<&str> {
        match self.outputs.get(&Stage::Story).map(|r| &r.payload) {
            Some(StagePayload::Story { text }) => Some(text),
            _ => None,
        }
    }

    /// Anchor for sequential conditioning: the user reference, else the reference image
    pub fn anchor(&self) -> Option<ArtifactRef> {
        if let Some(reference) = &self.input.reference {
            return Some(reference.clone());
        }
        match self.outputs.get(&Stage::ReferenceImage).map(|r| &r.payload) {
            Some(StagePayload::ReferenceImage { image, .. }) => Some(image.clone()),
            _ => None,
        }
    }

    pub fn storyboard_frames(&self) -> &[StoryboardFrame] {
        match self.outputs.get(&Stage::Storyboard).map(|r| &r.payload) {
            Some(StagePayload::Storyboard { frames }) => frames,
            _ => &[],
        }
    }

    /// Idle past `ttl` since the last persisted change
    pub fn idle_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match now.signed_duration_since(self.updated_at).to_std() {
            Ok(elapsed) => elapsed > ttl,
            Err(_) => false,
        }
    }
}
