//! # Parallel Group Coordinator
//!
//! Runs 2-5 sibling sessions side by side so their outputs can be compared. Siblings
//! share nothing but the group record: each is an ordinary session with its own actor,
//! and one sibling's failure never touches another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::quota::QuotaLedger;
use crate::coherence::CoherenceSettings;
use crate::error::{ErrorReport, ForgeError, ForgeResult};
use crate::generation::ArtifactRef;
use crate::pipeline::{Orchestrator, SessionStatus, Stage};
use crate::state::{GenerationSession, PutOutcome, QualityProfile, SessionInput};

pub const MIN_SIBLINGS: usize = 2;
pub const MAX_SIBLINGS: usize = 5;

const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

pub fn group_key(id: &str) -> String {
    format!("group:{}", id)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Opt-in cap on siblings of one group generating at the same time. Unset, every
    /// sibling starts as soon as the group is created.
    pub max_concurrent_siblings: Option<usize>,
}

/// Settings one sibling runs with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiblingProfile {
    pub label: Option<String>,
    pub coherence: CoherenceSettings,
    pub quality: QualityProfile,
}

impl SiblingProfile {
    fn same_settings(&self, other: &SiblingProfile) -> bool {
        self.coherence.seed_control == other.coherence.seed_control
            && self.coherence.latent_reuse == other.coherence.latent_reuse
            && self.quality == other.quality
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonType {
    Settings,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupComparison {
    /// One prompt, different settings
    Settings {
        prompt: String,
        #[serde(default)]
        reference: Option<ArtifactRef>,
        profiles: Vec<SiblingProfile>,
    },
    /// Different prompts, one set of settings
    Prompt {
        prompts: Vec<String>,
        #[serde(default)]
        reference: Option<ArtifactRef>,
        #[serde(default)]
        profile: SiblingProfile,
    },
}

struct PlannedMember {
    label: String,
    input: SessionInput,
    profile: SiblingProfile,
}

fn check_count(n: usize) -> ForgeResult<()> {
    if !(MIN_SIBLINGS..=MAX_SIBLINGS).contains(&n) {
        return Err(ForgeError::validation(format!(
            "A group needs {} to {} members, got {}",
            MIN_SIBLINGS, MAX_SIBLINGS, n
        )));
    }
    Ok(())
}

fn default_label(index: usize) -> String {
    format!("variant-{}", index + 1)
}

impl GroupComparison {
    pub fn comparison_type(&self) -> ComparisonType {
        match self {
            GroupComparison::Settings { .. } => ComparisonType::Settings,
            GroupComparison::Prompt { .. } => ComparisonType::Prompt,
        }
    }

    fn members(&self) -> ForgeResult<Vec<PlannedMember>> {
        match self {
            GroupComparison::Settings {
                prompt,
                reference,
                profiles,
            } => {
                check_count(profiles.len())?;
                for (i, a) in profiles.iter().enumerate() {
                    if profiles[i + 1..].iter().any(|b| a.same_settings(b)) {
                        return Err(ForgeError::validation(
                            "Settings comparison profiles must be pairwise distinct",
                        ));
                    }
                }
                Ok(profiles
                    .iter()
                    .enumerate()
                    .map(|(i, profile)| PlannedMember {
                        label: profile.label.clone().unwrap_or_else(|| default_label(i)),
                        input: SessionInput {
                            prompt: prompt.clone(),
                            reference: reference.clone(),
                        },
                        profile: profile.clone(),
                    })
                    .collect())
            }
            GroupComparison::Prompt {
                prompts,
                reference,
                profile,
            } => {
                check_count(prompts.len())?;
                for (i, a) in prompts.iter().enumerate() {
                    if prompts[i + 1..].iter().any(|b| a.trim() == b.trim()) {
                        return Err(ForgeError::validation(
                            "Prompt comparison prompts must be pairwise distinct",
                        ));
                    }
                }
                Ok(prompts
                    .iter()
                    .enumerate()
                    .map(|(i, prompt)| PlannedMember {
                        label: default_label(i),
                        input: SessionInput {
                            prompt: prompt.clone(),
                            reference: reference.clone(),
                        },
                        profile: profile.clone(),
                    })
                    .collect())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartGroupRequest {
    pub owner_id: String,
    pub comparison: GroupComparison,
    /// Drive every sibling to completion without human checkpoints
    #[serde(default)]
    pub auto_approve: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationGroup {
    pub id: String,
    pub owner_id: String,
    pub comparison_type: ComparisonType,
    pub member_ids: Vec<String>,
    pub labels: Vec<String>,
    pub auto_approve: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Running,
    Complete,
    Failed,
    /// Some members failed, others did not
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberReport {
    pub session_id: String,
    pub label: String,
    pub stage: Stage,
    pub status: SessionStatus,
    pub cost: f64,
    pub error: Option<ErrorReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub group: GenerationGroup,
    pub members: Vec<MemberReport>,
    pub aggregate_cost: f64,
    pub status: GroupStatus,
    pub error: Option<ErrorReport>,
}

struct SiblingTracker {
    session_id: String,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
}

struct CoordinatorInner {
    orchestrator: Orchestrator,
    quota: QuotaLedger,
    config: GroupConfig,
    trackers: Mutex<HashMap<String, Vec<SiblingTracker>>>,
}

#[derive(Clone)]
pub struct GroupCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl GroupCoordinator {
    pub fn new(orchestrator: Orchestrator, quota: QuotaLedger, config: GroupConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                orchestrator,
                quota,
                config,
                trackers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<String, Vec<SiblingTracker>>> {
        self.inner
            .trackers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Validate, charge quota once, create every member plus the group record, then
    /// start driving the siblings.
    #[tracing::instrument(skip_all, fields(owner_id = %request.owner_id))]
    pub async fn start_group(&self, request: StartGroupRequest) -> ForgeResult<GenerationGroup> {
        let orch = &self.inner.orchestrator;
        let planned = request.comparison.members()?;
        for member in &planned {
            orch.validate_input(&request.owner_id, &member.input)?;
        }

        let units = planned.len() as u32;
        self.inner
            .quota
            .try_consume(&request.owner_id, units)
            .await?;

        let group_id = uuid::Uuid::new_v4().to_string();
        let group = match self.create_members(&group_id, &request, planned).await {
            Ok(group) => group,
            Err(e) => {
                self.inner.quota.refund(&request.owner_id, units).await;
                return Err(e);
            }
        };
        tracing::info!(
            group_id = %group.id,
            members = group.member_ids.len(),
            "Group created"
        );

        self.spawn_drivers(&group);
        Ok(group)
    }

    /// All members and the group record, or none of them
    async fn create_members(
        &self,
        group_id: &str,
        request: &StartGroupRequest,
        planned: Vec<PlannedMember>,
    ) -> ForgeResult<GenerationGroup> {
        let orch = &self.inner.orchestrator;
        let repo = orch.repository();
        let mut created: Vec<String> = Vec::with_capacity(planned.len());
        let mut labels = Vec::with_capacity(planned.len());

        let outcome = async {
            for member in planned {
                let mut session = GenerationSession::new(&request.owner_id, member.input);
                session.group_id = Some(group_id.to_string());
                session.label = Some(member.label.clone());
                session.coherence = member.profile.coherence;
                session.quality = member.profile.quality;
                let session = orch.create_session(session).await?;
                created.push(session.id);
                labels.push(member.label);
            }

            let group = GenerationGroup {
                id: group_id.to_string(),
                owner_id: request.owner_id.clone(),
                comparison_type: request.comparison.comparison_type(),
                member_ids: created.clone(),
                labels: labels.clone(),
                auto_approve: request.auto_approve,
                created_at: Utc::now(),
            };
            let data = serde_json::to_string(&group)?;
            match repo
                .store()
                .put(&group_key(group_id), &data, 0, repo.record_ttl())
                .await?
            {
                PutOutcome::Stored { .. } => Ok(group),
                PutOutcome::Conflict { .. } => Err(ForgeError::Conflict(group_key(group_id))),
            }
        }
        .await;

        if outcome.is_err() {
            tracing::warn!(group_id, created = created.len(), "Rolling back partial group");
            for id in &created {
                if let Err(e) = repo.delete(id).await {
                    tracing::warn!(session_id = %id, "Rollback delete failed: {}", e);
                }
            }
        }
        outcome
    }

    fn spawn_drivers(&self, group: &GenerationGroup) {
        let permits = self
            .inner
            .config
            .max_concurrent_siblings
            .unwrap_or(group.member_ids.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut drivers = JoinSet::new();
        let mut trackers = Vec::with_capacity(group.member_ids.len());

        for session_id in &group.member_ids {
            let state = Arc::new(AtomicU8::new(PENDING));
            let cancel = CancellationToken::new();
            trackers.push(SiblingTracker {
                session_id: session_id.clone(),
                state: Arc::clone(&state),
                cancel: cancel.clone(),
            });
            drivers.spawn(drive_sibling(
                self.inner.orchestrator.clone(),
                session_id.clone(),
                group.auto_approve,
                Arc::clone(&semaphore),
                state,
                cancel,
            ));
        }
        self.trackers().insert(group.id.clone(), trackers);

        let this = self.clone();
        let group_id = group.id.clone();
        tokio::spawn(async move {
            while let Some(joined) = drivers.join_next().await {
                if let Err(e) = joined {
                    tracing::warn!(group_id = %group_id, "Sibling driver panicked: {}", e);
                }
            }
            this.trackers().remove(&group_id);
            tracing::debug!(group_id = %group_id, "All sibling drivers finished");
        });
    }

    pub async fn load_group(&self, group_id: &str) -> ForgeResult<GenerationGroup> {
        let store = self.inner.orchestrator.repository().store();
        let record = store
            .get(&group_key(group_id))
            .await?
            .ok_or_else(|| ForgeError::group_not_found(group_id))?;
        Ok(serde_json::from_str(&record.data)?)
    }

    pub async fn group_status(&self, group_id: &str) -> ForgeResult<GroupReport> {
        let group = self.load_group(group_id).await?;
        let repo = self.inner.orchestrator.repository();

        let mut members = Vec::with_capacity(group.member_ids.len());
        for (index, session_id) in group.member_ids.iter().enumerate() {
            let session = repo.load(session_id).await?;
            members.push(MemberReport {
                session_id: session_id.clone(),
                label: group
                    .labels
                    .get(index)
                    .cloned()
                    .unwrap_or_else(|| default_label(index)),
                stage: session.stage,
                status: session.status,
                cost: session.cost,
                error: session.last_error,
            });
        }

        let aggregate_cost = members.iter().map(|m| m.cost).sum();
        let failed: Vec<String> = members
            .iter()
            .filter(|m| matches!(m.status, SessionStatus::Failed | SessionStatus::Expired))
            .map(|m| m.session_id.clone())
            .collect();
        let (status, error) = if members.iter().all(|m| m.status == SessionStatus::Complete) {
            (GroupStatus::Complete, None)
        } else if failed.len() == members.len() {
            (GroupStatus::Failed, None)
        } else if !failed.is_empty() {
            let err = ForgeError::PartialGroupFailure {
                group_id: group.id.clone(),
                failed,
            };
            (GroupStatus::Mixed, Some(err.report()))
        } else {
            (GroupStatus::Running, None)
        };

        Ok(GroupReport {
            group,
            members,
            aggregate_cost,
            status,
            error,
        })
    }

    /// Fail siblings that have not started yet; running and finished ones are left alone
    #[tracing::instrument(skip(self))]
    pub async fn cancel_group(&self, group_id: &str) -> ForgeResult<GroupReport> {
        let group = self.load_group(group_id).await?;
        let orch = &self.inner.orchestrator;

        let pending: Option<Vec<String>> = self.trackers().get(group_id).map(|trackers| {
            trackers
                .iter()
                .filter(|t| {
                    t.state
                        .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                })
                .map(|t| {
                    t.cancel.cancel();
                    t.session_id.clone()
                })
                .collect()
        });

        // no local drivers (another process or a restart): never-started members are pending
        let pending = match pending {
            Some(pending) => pending,
            None => {
                let mut pending = Vec::new();
                for id in &group.member_ids {
                    if orch.repository().load(id).await?.status == SessionStatus::Created {
                        pending.push(id.clone());
                    }
                }
                pending
            }
        };

        for id in &pending {
            orch.fail(id, ForgeError::Cancelled).await?;
        }
        tracing::info!(cancelled = pending.len(), "Group cancelled");
        self.group_status(group_id).await
    }
}

async fn drive_sibling(
    orch: Orchestrator,
    session_id: String,
    auto_approve: bool,
    semaphore: Arc<Semaphore>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
) {
    let _permit = tokio::select! {
        _ = cancel.cancelled() => return,
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };
    if state
        .compare_exchange(PENDING, STARTED, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    let outcome: Result<(), ForgeError> = async {
        loop {
            let result = orch.run_stage_with_pause(&session_id).await?;
            if !auto_approve {
                return Ok(());
            }
            let session = orch.approve(&session_id, Some(result.stage)).await?;
            if session.status == SessionStatus::Complete {
                return Ok(());
            }
        }
    }
    .await;

    match outcome {
        Ok(()) => {}
        // the session is paused with the error; a human regenerates it like any other session
        Err(e) if e.recoverable() && !auto_approve => {
            tracing::info!(session_id = %session_id, "Sibling paused on recoverable error: {}", e);
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, "Sibling failed: {}", e);
            if let Err(fail_err) = orch.fail(&session_id, e).await {
                tracing::warn!(session_id = %session_id, "Could not mark sibling failed: {}", fail_err);
            }
        }
    }
}
