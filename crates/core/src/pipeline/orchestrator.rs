//! # Stage Orchestrator
//!
//! Public face of the pipeline. Every operation is routed to the session's owning actor
//! (spawned on demand) and answered over a oneshot reply.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::actor::{Reply, SessionActor, SessionCommand};
use super::executor::StageExecutor;
use super::stage::Stage;
use crate::channel::{FeedbackHandler, NotificationHub, StatusSource, Subscription};
use crate::coherence::SeedController;
use crate::error::{ForgeError, ForgeResult};
use crate::generation::ArtifactKind;
use crate::state::{GenerationSession, SessionInput, SessionRepository, StageResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Sessions idle longer than this expire on next access
    pub idle_ttl_secs: u64,
    /// Extra attempts after an upstream failure
    pub stage_retries: u32,
    /// A session actor with nothing to do exits after this long
    pub actor_idle_ms: u64,
    pub mailbox: usize,
    pub storyboard_frames: usize,
    pub max_prompt_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 3600,
            stage_retries: 1,
            actor_idle_ms: 300_000,
            mailbox: 32,
            storyboard_frames: 4,
            max_prompt_chars: 4000,
        }
    }
}

impl OrchestratorConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn actor_idle(&self) -> Duration {
        Duration::from_millis(self.actor_idle_ms.max(1))
    }
}

struct ActorHandle {
    actor_id: u64,
    tx: mpsc::Sender<SessionCommand>,
}

struct OrchestratorInner {
    repo: SessionRepository,
    seeds: SeedController,
    executor: Arc<StageExecutor>,
    hub: NotificationHub,
    config: OrchestratorConfig,
    actors: Mutex<HashMap<String, ActorHandle>>,
    next_actor_id: AtomicU64,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        repo: SessionRepository,
        executor: StageExecutor,
        hub: NotificationHub,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                seeds: SeedController::new(repo.clone()),
                repo,
                executor: Arc::new(executor),
                hub,
                config,
                actors: Mutex::new(HashMap::new()),
                next_actor_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn repository(&self) -> &SessionRepository {
        &self.inner.repo
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.inner.hub
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub(crate) fn seeds(&self) -> &SeedController {
        &self.inner.seeds
    }

    pub(crate) fn executor(&self) -> Arc<StageExecutor> {
        Arc::clone(&self.inner.executor)
    }

    /// Sessions that currently have an owning task in this process
    pub fn live_actors(&self) -> usize {
        self.actors().len()
    }

    fn actors(&self) -> MutexGuard<'_, HashMap<String, ActorHandle>> {
        self.inner
            .actors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn validate_input(&self, owner_id: &str, input: &SessionInput) -> ForgeResult<()> {
        if owner_id.trim().is_empty() {
            return Err(ForgeError::validation("Owner id must not be empty"));
        }
        let prompt = input.prompt.trim();
        if prompt.is_empty() {
            return Err(ForgeError::validation("Prompt must not be empty"));
        }
        let max = self.inner.config.max_prompt_chars;
        if prompt.chars().count() > max {
            return Err(ForgeError::validation(format!(
                "Prompt is longer than {} characters",
                max
            )));
        }
        if let Some(reference) = &input.reference {
            if reference.kind != ArtifactKind::Image {
                return Err(ForgeError::validation("Reference must be an image"));
            }
        }
        Ok(())
    }

    /// Validate and persist a session in `created`, without running it
    pub async fn create_session(&self, mut session: GenerationSession) -> ForgeResult<GenerationSession> {
        self.validate_input(&session.owner_id, &session.input)?;
        // seeds are only ever generated here
        if session.coherence.seed.take().is_some() {
            tracing::debug!("Ignoring caller-supplied seed");
        }
        session.coherence.assign_seed_once();
        let session = self.inner.repo.create(session).await?;
        tracing::info!(
            session_id = %session.id,
            owner_id = %session.owner_id,
            seed = ?session.coherence.seed,
            "Session created"
        );
        Ok(session)
    }

    /// Hand a created session to its actor, which starts the first stage
    pub async fn launch(&self, session_id: &str) -> ForgeResult<()> {
        self.dispatch(session_id, SessionCommand::Run { reply: None })
            .await
    }

    /// Create a session from a prompt and start its first stage; returns immediately
    pub async fn start(&self, owner_id: &str, input: SessionInput) -> ForgeResult<String> {
        self.start_session(GenerationSession::new(owner_id, input))
            .await
    }

    /// Like [`Orchestrator::start`] for a fully configured session
    pub async fn start_session(&self, session: GenerationSession) -> ForgeResult<String> {
        let session = self.create_session(session).await?;
        self.launch(&session.id).await?;
        Ok(session.id)
    }

    /// Run the current stage to its checkpoint, or attach to the run in flight
    pub async fn run_stage_with_pause(&self, session_id: &str) -> ForgeResult<StageResult> {
        self.request(session_id, |reply| SessionCommand::Run { reply: Some(reply) })
            .await
    }

    pub async fn approve(
        &self,
        session_id: &str,
        expected_stage: Option<Stage>,
    ) -> ForgeResult<GenerationSession> {
        self.request(session_id, |reply| SessionCommand::Approve {
            expected_stage,
            reply,
        })
        .await
    }

    pub async fn regenerate(
        &self,
        session_id: &str,
        feedback: impl Into<String>,
    ) -> ForgeResult<GenerationSession> {
        let feedback = feedback.into();
        self.request(session_id, |reply| SessionCommand::Regenerate { feedback, reply })
            .await
    }

    pub async fn status(&self, session_id: &str) -> ForgeResult<GenerationSession> {
        self.request(session_id, |reply| SessionCommand::Status { reply })
            .await
    }

    pub async fn fail(&self, session_id: &str, reason: ForgeError) -> ForgeResult<GenerationSession> {
        self.request(session_id, |reply| SessionCommand::Fail { reason, reply })
            .await
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        self.inner.hub.connect(session_id)
    }

    async fn request<T>(
        &self,
        session_id: &str,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> ForgeResult<T> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(session_id, make(tx)).await?;
        rx.await
            .map_err(|_| ForgeError::internal("Session actor dropped the request"))?
    }

    pub(crate) async fn dispatch(&self, session_id: &str, command: SessionCommand) -> ForgeResult<()> {
        // only sessions that exist get an owning task
        if !self.has_actor(session_id) && self.inner.repo.find(session_id).await?.is_none() {
            return Err(ForgeError::session_not_found(session_id));
        }
        let mut command = command;
        for _ in 0..3 {
            let (actor_id, tx) = self.actor_for(session_id);
            match tx.send(command).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => {
                    // the actor retired between lookup and send
                    self.forget_actor(session_id, actor_id);
                    command = returned;
                }
            }
        }
        Err(ForgeError::internal(format!(
            "No session actor accepted commands for '{}'",
            session_id
        )))
    }

    fn has_actor(&self, session_id: &str) -> bool {
        self.actors()
            .get(session_id)
            .map_or(false, |handle| !handle.tx.is_closed())
    }

    fn actor_for(&self, session_id: &str) -> (u64, mpsc::Sender<SessionCommand>) {
        let mut actors = self.actors();
        if let Some(handle) = actors.get(session_id) {
            if !handle.tx.is_closed() {
                return (handle.actor_id, handle.tx.clone());
            }
        }

        let actor_id = self.inner.next_actor_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.config.mailbox.max(1));
        let actor = SessionActor::new(session_id.to_string(), actor_id, rx, self.clone());
        tokio::spawn(actor.run());
        actors.insert(
            session_id.to_string(),
            ActorHandle {
                actor_id,
                tx: tx.clone(),
            },
        );
        (actor_id, tx)
    }

    pub(crate) fn forget_actor(&self, session_id: &str, actor_id: u64) {
        let mut actors = self.actors();
        if actors
            .get(session_id)
            .map_or(false, |h| h.actor_id == actor_id)
        {
            actors.remove(session_id);
        }
    }
}

#[async_trait]
impl FeedbackHandler for Orchestrator {
    async fn on_feedback(&self, session_id: &str, content: String) -> ForgeResult<()> {
        self.regenerate(session_id, content).await.map(|_| ())
    }
}

#[async_trait]
impl StatusSource for Orchestrator {
    async fn fetch_status(&self, session_id: &str) -> ForgeResult<GenerationSession> {
        self.status(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelMessage;
    use crate::generation::{ArtifactRef, ScriptedAdapter};
    use crate::pipeline::stage::SessionStatus;
    use crate::quality::RankingConfig;
    use crate::state::{session_key, MemorySessionStore, SessionStore, StagePayload};

    fn orchestrator_with(adapter: Arc<ScriptedAdapter>, config: OrchestratorConfig) -> Orchestrator {
        let repo = SessionRepository::new(Arc::new(MemorySessionStore::new()));
        let executor = StageExecutor::new(adapter, RankingConfig::default())
            .with_storyboard_frames(config.storyboard_frames);
        Orchestrator::new(repo, executor, NotificationHub::default(), config)
    }

    fn orchestrator(adapter: Arc<ScriptedAdapter>) -> Orchestrator {
        orchestrator_with(
            adapter,
            OrchestratorConfig {
                storyboard_frames: 2,
                ..OrchestratorConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_start_runs_story_and_pauses() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let id = orch.start("u1", SessionInput::new("a brave snail")).await.unwrap();

        let result = orch.run_stage_with_pause(&id).await.unwrap();
        assert_eq!(result.stage, Stage::Story);

        let session = orch.status(&id).await.unwrap();
        assert_eq!(session.state(), "story_paused");
        assert!(session.coherence.seed.is_some());
        assert!(session.cost > 0.0);
        assert!(!session.outputs[&Stage::Story].committed);
    }

    #[tokio::test]
    async fn test_walks_the_graph_without_skipping() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let id = orch.start("u1", SessionInput::new("a kite")).await.unwrap();

        let mut visited = Vec::new();
        loop {
            let result = orch.run_stage_with_pause(&id).await.unwrap();
            visited.push(result.stage);
            let session = orch.approve(&id, Some(result.stage)).await.unwrap();
            if session.status == SessionStatus::Complete {
                break;
            }
        }
        assert_eq!(visited, Stage::executable());

        let session = orch.status(&id).await.unwrap();
        assert_eq!(session.stage, Stage::Complete);
        assert!(session.outputs.values().all(|r| r.committed));
        assert!(session
            .outputs
            .values()
            .flat_map(|r| r.selections.iter())
            .all(|s| s.candidates.len() == 1));
    }

    #[tokio::test]
    async fn test_approve_is_idempotent_with_expected_stage() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let id = orch.start("u1", SessionInput::new("a kite")).await.unwrap();
        orch.run_stage_with_pause(&id).await.unwrap();

        let first = orch.approve(&id, Some(Stage::Story)).await.unwrap();
        assert_eq!(first.stage, Stage::ReferenceImage);
        let again = orch.approve(&id, Some(Stage::Story)).await.unwrap();
        assert_eq!(again.stage, Stage::ReferenceImage);

        orch.run_stage_with_pause(&id).await.unwrap();
        let session = orch.status(&id).await.unwrap();
        assert_eq!(session.state(), "reference_image_paused");
    }

    #[tokio::test]
    async fn test_approve_while_running_is_rejected() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.set_delay(Duration::from_millis(200));
        let orch = orchestrator(adapter);
        let id = orch.start("u1", SessionInput::new("a kite")).await.unwrap();

        let err = orch.approve(&id, None).await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(err.recoverable());
    }

    #[tokio::test]
    async fn test_upstream_failure_retried_once() {
        let adapter = Arc::new(ScriptedAdapter::new());
        // both story variants fail on the first attempt
        adapter.fail_next_text(2);
        let orch = orchestrator(adapter.clone());
        let id = orch.start("u1", SessionInput::new("a kite")).await.unwrap();

        let result = orch.run_stage_with_pause(&id).await.unwrap();
        assert_eq!(result.stage, Stage::Story);
        assert!(orch.status(&id).await.unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_persistent_failure_leaves_recoverable_error() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.fail_when_prompt_contains("doomed");
        let orch = orchestrator(adapter.clone());
        let id = orch.start("u1", SessionInput::new("doomed voyage")).await.unwrap();

        let err = orch.run_stage_with_pause(&id).await.unwrap_err();
        assert_eq!(err.code(), "upstream_generation_error");

        let session = orch.status(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Paused);
        let report = session.last_error.unwrap();
        assert!(report.recoverable);
        // one attempt plus one retry, two variants each
        assert_eq!(adapter.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_stage_complete_and_llm_response_published() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let session = orch
            .create_session(GenerationSession::new("u1", SessionInput::new("an owl")))
            .await
            .unwrap();
        let mut sub = orch.subscribe(&session.id);
        orch.launch(&session.id).await.unwrap();
        orch.run_stage_with_pause(&session.id).await.unwrap();

        let first = sub.receiver.recv().await.unwrap();
        assert_eq!(first.kind(), "llm_response");
        match sub.receiver.recv().await.unwrap() {
            ChannelMessage::StageComplete { stage, status, .. } => {
                assert_eq!(stage, Stage::Story);
                assert_eq!(status, SessionStatus::Paused);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_regenerate_with_feedback_keeps_stage() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let id = orch.start("u1", SessionInput::new("a cat")).await.unwrap();
        orch.run_stage_with_pause(&id).await.unwrap();

        let session = orch.regenerate(&id, "make it funnier").await.unwrap();
        assert_eq!(session.stage, Stage::Story);
        assert_eq!(session.status, SessionStatus::Running);

        let result = orch.run_stage_with_pause(&id).await.unwrap();
        match result.payload {
            StagePayload::Story { text } => assert!(text.contains("funnier")),
            other => panic!("unexpected {:?}", other),
        }
        let session = orch.status(&id).await.unwrap();
        assert_eq!(session.history.len(), 2);
        assert_eq!(session.state(), "story_paused");
    }

    #[tokio::test]
    async fn test_regenerate_cancels_in_flight_run() {
        let adapter = Arc::new(ScriptedAdapter::new());
        adapter.set_delay(Duration::from_millis(100));
        let orch = orchestrator(adapter.clone());
        let id = orch.start("u1", SessionInput::new("a cat")).await.unwrap();

        let waiter = {
            let orch = orch.clone();
            let id = id.clone();
            tokio::spawn(async move { orch.run_stage_with_pause(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        orch.regenerate(&id, "shorter").await.unwrap();

        // the waiter is carried over to the replacement run
        let result = waiter.await.unwrap().unwrap();
        match result.payload {
            StagePayload::Story { text } => assert!(text.contains("shorter")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idle_session_expires_on_access() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let id = orch.start("u1", SessionInput::new("a kite")).await.unwrap();
        orch.run_stage_with_pause(&id).await.unwrap();

        // backdate the record as if it had been idle for two hours
        let mut session = orch.repository().load(&id).await.unwrap();
        session.updated_at = chrono::Utc::now() - chrono::Duration::hours(2);
        let store = orch.repository().store();
        store
            .put(
                &session_key(&id),
                &serde_json::to_string(&session).unwrap(),
                session.version,
                None,
            )
            .await
            .unwrap();

        let err = orch.status(&id).await.unwrap_err();
        assert_eq!(err.code(), "session_expired");
        assert!(!err.recoverable());
        assert_eq!(
            orch.repository().load(&id).await.unwrap().status,
            SessionStatus::Expired
        );
        assert!(orch.approve(&id, None).await.is_err());
        assert!(orch.regenerate(&id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_fail_marks_failed_once() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let session = orch
            .create_session(GenerationSession::new("u1", SessionInput::new("a kite")))
            .await
            .unwrap();
        let failed = orch
            .fail(&session.id, ForgeError::upstream("boom"))
            .await
            .unwrap();
        assert_eq!(failed.status, SessionStatus::Failed);
        assert!(!failed.last_error.as_ref().unwrap().recoverable);

        let again = orch.fail(&session.id, ForgeError::Cancelled).await.unwrap();
        assert_eq!(again.version, failed.version);
    }

    #[tokio::test]
    async fn test_invalid_input_rejected() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        assert_eq!(
            orch.start("u1", SessionInput::new("   ")).await.unwrap_err().code(),
            "validation_error"
        );
        let video_ref = SessionInput::new("x").with_reference(ArtifactRef::video("v"));
        assert!(orch.start("u1", video_ref).await.is_err());
    }

    #[tokio::test]
    async fn test_idle_actor_exits_and_session_rehydrates() {
        let orch = orchestrator_with(
            Arc::new(ScriptedAdapter::new()),
            OrchestratorConfig {
                actor_idle_ms: 50,
                storyboard_frames: 2,
                ..OrchestratorConfig::default()
            },
        );
        let id = orch.start("u1", SessionInput::new("a kite")).await.unwrap();
        orch.run_stage_with_pause(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(orch.live_actors(), 0);

        let session = orch.approve(&id, Some(Stage::Story)).await.unwrap();
        assert_eq!(session.stage, Stage::ReferenceImage);
        assert_eq!(orch.live_actors(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_not_found() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        assert_eq!(orch.status("missing").await.unwrap_err().code(), "not_found");
        assert_eq!(orch.live_actors(), 0);
        for _ in 0..5 {
            assert!(orch.approve("missing", None).await.is_err());
        }
        assert_eq!(orch.live_actors(), 0);
    }

    #[tokio::test]
    async fn test_caller_supplied_seed_is_replaced() {
        let orch = orchestrator(Arc::new(ScriptedAdapter::new()));
        let mut session = GenerationSession::new("u1", SessionInput::new("a tin drum"));
        session.coherence.seed = Some(u64::MAX);
        let created = orch.create_session(session).await.unwrap();

        let seed = created.coherence.seed.unwrap();
        // generated seeds live in [0, 2^32)
        assert!(seed < 1 << 32);
        assert_eq!(orch.status(&created.id).await.unwrap().coherence.seed, Some(seed));

        let mut unseeded = GenerationSession::new("u1", SessionInput::new("a tin drum"));
        unseeded.coherence.seed_control = false;
        unseeded.coherence.seed = Some(5);
        let created = orch.create_session(unseeded).await.unwrap();
        assert_eq!(created.coherence.seed, None);
    }
}
