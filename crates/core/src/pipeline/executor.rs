//! # Stage Executor
//!
//! Turns a session snapshot into the [`StageResult`] for its current stage. Pure with
//! respect to the store: nothing here persists, the session actor does that.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::stage::Stage;
use crate::coherence::SequentialChain;
use crate::error::{ForgeError, ForgeResult};
use crate::generation::{prompts, ArtifactKind, ArtifactRef, GenerationAdapter};
use crate::quality::{
    PromptRefiner, QualityGate, RankedBatch, RankingConfig, VariantKind, VariantRanker,
    VariantRequest,
};
use crate::state::{
    GenerationSession, RankedSelection, StagePayload, StageResult, StoryboardFrame, VideoClip,
};

/// Ranking knobs after applying the session's quality profile
#[derive(Debug, Clone, PartialEq)]
struct EffectiveQuality {
    text_variants: usize,
    image_variants: usize,
    video_variants: usize,
    gate: QualityGate,
    refine: bool,
}

pub struct StageExecutor {
    ranker: VariantRanker,
    refiner: Option<PromptRefiner>,
    ranking: RankingConfig,
    storyboard_frames: usize,
}

impl StageExecutor {
    pub fn new(adapter: Arc<dyn GenerationAdapter>, ranking: RankingConfig) -> Self {
        Self {
            ranker: VariantRanker::new(adapter, &ranking),
            refiner: None,
            ranking,
            storyboard_frames: 4,
        }
    }

    /// Refine image-stage prompts before ranking
    pub fn with_refiner(mut self, refiner: PromptRefiner) -> Self {
        self.refiner = Some(refiner);
        self
    }

    /// Upper bound on storyboard frames taken from the story
    pub fn with_storyboard_frames(mut self, frames: usize) -> Self {
        self.storyboard_frames = frames.max(1);
        self
    }

    pub fn adapter(&self) -> Arc<dyn GenerationAdapter> {
        self.ranker.adapter()
    }

    fn effective_quality(&self, session: &GenerationSession) -> EffectiveQuality {
        let profile = &session.quality;
        EffectiveQuality {
            text_variants: profile.text_variants.unwrap_or(self.ranking.text_variants).max(1),
            image_variants: profile.image_variants.unwrap_or(self.ranking.image_variants).max(1),
            video_variants: profile.video_variants.unwrap_or(self.ranking.video_variants).max(1),
            gate: QualityGate::new(
                profile
                    .quality_threshold
                    .unwrap_or(self.ranking.quality_threshold),
            ),
            refine: profile.refine_prompts.unwrap_or(true),
        }
    }

    /// Generate the session's current stage
    #[tracing::instrument(skip_all, fields(session_id = %session.id, stage = %session.stage))]
    pub async fn execute(
        &self,
        session: &GenerationSession,
        cancel: &CancellationToken,
    ) -> ForgeResult<StageResult> {
        let quality = self.effective_quality(session);
        match session.stage {
            Stage::Story => self.story(session, &quality, cancel).await,
            Stage::ReferenceImage => self.reference_image(session, &quality, cancel).await,
            Stage::Storyboard => self.storyboard(session, &quality, cancel).await,
            Stage::Video => self.video(session, &quality, cancel).await,
            Stage::Complete => Err(ForgeError::validation(
                "Session is complete; there is no stage to run",
            )),
        }
    }

    async fn story(
        &self,
        session: &GenerationSession,
        quality: &EffectiveQuality,
        cancel: &CancellationToken,
    ) -> ForgeResult<StageResult> {
        let prompt = with_revision_notes(&session.input.prompt, &session.feedback_for(Stage::Story));
        let batch = self
            .ranker
            .rank(
                VariantRequest {
                    kind: VariantKind::Text {
                        instructions: prompts::WRITER.to_string(),
                    },
                    prompt,
                    conditioning: Vec::new(),
                    k: quality.text_variants,
                    seed: None,
                },
                &quality.gate,
                cancel,
            )
            .await?;

        let (selection, selected) = selection("story", batch)?;
        let text = selected
            .text
            .ok_or_else(|| ForgeError::upstream("Story candidate carried no text"))?;
        Ok(StageResult::new(
            Stage::Story,
            StagePayload::Story { text },
            vec![selection],
        ))
    }

    async fn reference_image(
        &self,
        session: &GenerationSession,
        quality: &EffectiveQuality,
        cancel: &CancellationToken,
    ) -> ForgeResult<StageResult> {
        let story = session
            .story_text()
            .ok_or_else(|| ForgeError::validation("Reference image needs a story"))?;
        let opening = paragraphs(story).into_iter().next().unwrap_or(story);
        let draft = with_revision_notes(
            &format!("{}\n\nKey scene: {}", session.input.prompt, opening),
            &session.feedback_for(Stage::ReferenceImage),
        );

        let prompt = match &self.refiner {
            Some(refiner) if quality.refine => {
                let refined = refiner.refine(&draft, &session.input.prompt).await;
                tracing::debug!(
                    rounds = refined.rounds,
                    score = refined.score,
                    stop = ?refined.stop_reason,
                    "Refined reference prompt"
                );
                refined.prompt
            }
            _ => draft,
        };

        let conditioning: Vec<ArtifactRef> = session.input.reference.iter().cloned().collect();
        let batch = self
            .ranker
            .rank(
                VariantRequest {
                    kind: VariantKind::Image,
                    prompt: prompt.clone(),
                    conditioning,
                    k: quality.image_variants,
                    seed: session.coherence.effective_seed(),
                },
                &quality.gate,
                cancel,
            )
            .await?;

        let (selection, selected) = selection("reference", batch)?;
        Ok(StageResult::new(
            Stage::ReferenceImage,
            StagePayload::ReferenceImage {
                image: selected.artifact,
                prompt,
            },
            vec![selection],
        ))
    }

    async fn storyboard(
        &self,
        session: &GenerationSession,
        quality: &EffectiveQuality,
        cancel: &CancellationToken,
    ) -> ForgeResult<StageResult> {
        let story = session
            .story_text()
            .ok_or_else(|| ForgeError::validation("Storyboard needs a story"))?;
        let captions: Vec<&str> = paragraphs(story)
            .into_iter()
            .take(self.storyboard_frames)
            .collect();
        if captions.is_empty() {
            return Err(ForgeError::validation("Story has no paragraphs to storyboard"));
        }
        let notes = session.feedback_for(Stage::Storyboard);
        let total = captions.len();

        // frames are strictly sequential: each one conditions on the previous pick
        let mut chain = SequentialChain::new(session.anchor());
        let mut frames = Vec::with_capacity(total);
        let mut selections = Vec::with_capacity(total);
        for (index, caption) in captions.into_iter().enumerate() {
            let prompt = with_revision_notes(
                &format!("Storyboard frame {} of {}: {}", index + 1, total, caption),
                &notes,
            );
            let batch = self
                .ranker
                .rank(
                    VariantRequest {
                        kind: VariantKind::Image,
                        prompt,
                        conditioning: chain.conditioning(),
                        k: quality.image_variants,
                        seed: session.coherence.effective_seed(),
                    },
                    &quality.gate,
                    cancel,
                )
                .await?;
            let (selection, selected) = selection(&format!("frame-{}", index + 1), batch)?;
            chain.accept(selected.artifact.clone());
            frames.push(StoryboardFrame {
                index,
                caption: caption.to_string(),
                image: selected.artifact,
            });
            selections.push(selection);
        }

        Ok(StageResult::new(
            Stage::Storyboard,
            StagePayload::Storyboard { frames },
            selections,
        ))
    }

    async fn video(
        &self,
        session: &GenerationSession,
        quality: &EffectiveQuality,
        cancel: &CancellationToken,
    ) -> ForgeResult<StageResult> {
        let frames = session.storyboard_frames();
        if frames.is_empty() {
            return Err(ForgeError::validation("Video needs storyboard frames"));
        }
        let notes = session.feedback_for(Stage::Video);

        let mut chain = SequentialChain::new(session.anchor());
        let mut clips = Vec::with_capacity(frames.len());
        let mut selections = Vec::with_capacity(frames.len());
        for frame in frames {
            let mut conditioning = chain.conditioning();
            conditioning.push(frame.image.clone());
            let prompt = with_revision_notes(
                &format!("Animate frame {}: {}", frame.index + 1, frame.caption),
                &notes,
            );
            let batch = self
                .ranker
                .rank(
                    VariantRequest {
                        kind: VariantKind::Video,
                        prompt,
                        conditioning,
                        k: quality.video_variants,
                        seed: session.coherence.effective_seed(),
                    },
                    &quality.gate,
                    cancel,
                )
                .await?;
            let (selection, selected) = selection(&format!("clip-{}", frame.index + 1), batch)?;
            if selected.artifact.kind != ArtifactKind::Video {
                return Err(ForgeError::upstream("Video backend returned a non-video artifact"));
            }
            chain.accept(selected.artifact.clone());
            clips.push(VideoClip {
                index: frame.index,
                clip: selected.artifact,
            });
            selections.push(selection);
        }

        Ok(StageResult::new(
            Stage::Video,
            StagePayload::Video { clips },
            selections,
        ))
    }
}

fn selection(
    slot: &str,
    batch: RankedBatch,
) -> ForgeResult<(RankedSelection, crate::generation::Candidate)> {
    let selected = batch
        .selected()
        .map(|c| c.candidate.clone())
        .ok_or_else(|| ForgeError::upstream(format!("No candidate survived for {}", slot)))?;
    Ok((
        RankedSelection {
            slot: slot.to_string(),
            candidates: batch.candidates,
            decision: batch.decision,
        },
        selected,
    ))
}

/// Fold accumulated feedback into a prompt
fn with_revision_notes(prompt: &str, notes: &[&str]) -> String {
    if notes.is_empty() {
        return prompt.to_string();
    }
    let mut out = format!("{}\n\nRevision notes:", prompt);
    for note in notes {
        out.push_str("\n- ");
        out.push_str(note.trim());
    }
    out
}

fn paragraphs(text: &str) -> Vec<&str> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}
