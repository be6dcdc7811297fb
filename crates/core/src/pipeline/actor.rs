//! # Session Actor
//!
//! One task owns each live session. Every mutation arrives as a [`SessionCommand`] over
//! the actor's mailbox, so a session never has two stage runs in flight and only the
//! actor writes stage outcomes. The actor exits after a quiet period; the session stays
//! in the store and the next command spawns a fresh actor that re-hydrates it.

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::orchestrator::Orchestrator;
use super::stage::{next_stage, SessionStatus, Stage};
use crate::channel::ChannelMessage;
use crate::error::{ErrorReport, ForgeError, ForgeResult};
use crate::state::{ConversationEntry, EntryRole, GenerationSession, StagePayload, StageResult};

pub(crate) type Reply<T> = oneshot::Sender<ForgeResult<T>>;

pub(crate) enum SessionCommand {
    /// Run (or attach to) the current stage; `reply` fires when it pauses
    Run { reply: Option<Reply<StageResult>> },
    Approve {
        expected_stage: Option<Stage>,
        reply: Reply<GenerationSession>,
    },
    Regenerate {
        feedback: String,
        reply: Reply<GenerationSession>,
    },
    Status { reply: Reply<GenerationSession> },
    Fail {
        reason: ForgeError,
        reply: Reply<GenerationSession>,
    },
}

struct RunningStage {
    stage: Stage,
    cancel: CancellationToken,
    handle: JoinHandle<ForgeResult<StageResult>>,
    waiters: Vec<Reply<StageResult>>,
}

impl RunningStage {
    /// Stop the run and hand back whoever was waiting on it
    fn abort(self) -> Vec<Reply<StageResult>> {
        self.cancel.cancel();
        self.handle.abort();
        self.waiters
    }
}

enum ActorEvent {
    Command(SessionCommand),
    StageFinished(Result<ForgeResult<StageResult>, JoinError>),
    Idle,
    Closed,
}

fn reply_all(waiters: Vec<Reply<StageResult>>, result: &ForgeResult<StageResult>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

async fn join_running(
    running: &mut Option<RunningStage>,
) -> Result<ForgeResult<StageResult>, JoinError> {
    match running {
        Some(run) => (&mut run.handle).await,
        None => std::future::pending().await,
    }
}

pub(crate) struct SessionActor {
    session_id: String,
    actor_id: u64,
    mailbox: mpsc::Receiver<SessionCommand>,
    orchestrator: Orchestrator,
    running: Option<RunningStage>,
}

impl SessionActor {
    pub(crate) fn new(
        session_id: String,
        actor_id: u64,
        mailbox: mpsc::Receiver<SessionCommand>,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            session_id,
            actor_id,
            mailbox,
            orchestrator,
            running: None,
        }
    }

    #[tracing::instrument(name = "session_actor", skip(self), fields(session_id = %self.session_id, actor_id = self.actor_id))]
    pub(crate) async fn run(mut self) {
        let idle = self.orchestrator.config().actor_idle();
        tracing::debug!("Session actor started");
        loop {
            let idle_armed = self.running.is_none();
            let event = tokio::select! {
                command = self.mailbox.recv() => match command {
                    Some(command) => ActorEvent::Command(command),
                    None => ActorEvent::Closed,
                },
                finished = join_running(&mut self.running) => ActorEvent::StageFinished(finished),
                _ = sleep(idle), if idle_armed => ActorEvent::Idle,
            };

            match event {
                ActorEvent::Command(command) => self.handle(command).await,
                ActorEvent::StageFinished(outcome) => {
                    if let Some(running) = self.running.take() {
                        self.finish_stage(running, outcome).await;
                    }
                }
                ActorEvent::Idle => {
                    self.retire().await;
                    return;
                }
                ActorEvent::Closed => {
                    if let Some(running) = self.running.take() {
                        reply_all(running.abort(), &Err(ForgeError::Cancelled));
                    }
                    tracing::debug!("Session actor mailbox closed");
                    return;
                }
            }
        }
    }

    /// Leave the registry, then hand any commands that raced in to a successor
    async fn retire(mut self) {
        self.orchestrator
            .forget_actor(&self.session_id, self.actor_id);
        self.mailbox.close();
        let mut leftovers = Vec::new();
        while let Ok(command) = self.mailbox.try_recv() {
            leftovers.push(command);
        }
        tracing::debug!(leftovers = leftovers.len(), "Session actor idle, exiting");
        for command in leftovers {
            if let Err(e) = self.orchestrator.dispatch(&self.session_id, command).await {
                tracing::warn!("Could not re-dispatch command: {}", e);
            }
        }
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Run { reply } => self.on_run(reply).await,
            SessionCommand::Approve {
                expected_stage,
                reply,
            } => {
                let _ = reply.send(self.on_approve(expected_stage).await);
            }
            SessionCommand::Regenerate { feedback, reply } => {
                let _ = reply.send(self.on_regenerate(feedback).await);
            }
            SessionCommand::Status { reply } => {
                let result = if self.running.is_some() {
                    self.orchestrator.repository().load(&self.session_id).await
                } else {
                    self.load_owned().await
                };
                let _ = reply.send(result);
            }
            SessionCommand::Fail { reason, reply } => {
                let _ = reply.send(self.on_fail(reason).await);
            }
        }
    }

    /// Load the session, expiring it first if it sat idle past the TTL
    async fn load_live(&self) -> ForgeResult<GenerationSession> {
        let repo = self.orchestrator.repository();
        let session = repo.load(&self.session_id).await?;
        if session.status == SessionStatus::Expired {
            return Err(ForgeError::SessionExpired(self.session_id.clone()));
        }
        if session.status.is_terminal()
            || !session.idle_expired(self.orchestrator.config().idle_ttl(), Utc::now())
        {
            return Ok(session);
        }

        let expired = ForgeError::SessionExpired(self.session_id.clone());
        let report = expired.report();
        repo.update(&self.session_id, |s| {
            if !s.status.is_terminal() {
                s.status = SessionStatus::Expired;
                s.last_error = Some(report.clone());
            }
            Ok(())
        })
        .await?;
        tracing::info!("Session expired after idling past its TTL");
        self.publish(ChannelMessage::error(Some(&self.session_id), &expired));
        Err(expired)
    }

    /// [`Self::load_live`], restarting a stage the store says is running but that no task
    /// in this actor owns. That happens when the process that ran it went away, or when a
    /// stage outcome could not be persisted.
    async fn load_owned(&mut self) -> ForgeResult<GenerationSession> {
        let session = self.load_live().await?;
        if session.status != SessionStatus::Running || self.running.is_some() {
            return Ok(session);
        }
        tracing::info!(stage = %session.stage, "Resuming stage left running without an owner");
        self.start_stage(session, Vec::new()).await;
        self.orchestrator.repository().load(&self.session_id).await
    }

    async fn on_run(&mut self, reply: Option<Reply<StageResult>>) {
        if let Some(running) = self.running.as_mut() {
            if let Some(reply) = reply {
                running.waiters.push(reply);
            }
            return;
        }

        let session = match self.load_live().await {
            Ok(session) => session,
            Err(e) => {
                reply_all(reply.into_iter().collect(), &Err(e));
                return;
            }
        };

        match session.status {
            SessionStatus::Paused if session.last_error.is_none() => {
                if let Some(result) = session.current_result() {
                    reply_all(reply.into_iter().collect(), &Ok(result.clone()));
                    return;
                }
            }
            SessionStatus::Complete | SessionStatus::Failed | SessionStatus::Expired => {
                let err = ForgeError::validation(format!(
                    "Session is {}; there is nothing to run",
                    session.status.as_str()
                ));
                reply_all(reply.into_iter().collect(), &Err(err));
                return;
            }
            _ => {}
        }

        self.start_stage(session, reply.into_iter().collect()).await;
    }

    /// Mark the session running and spawn the stage computation
    async fn start_stage(&mut self, session: GenerationSession, waiters: Vec<Reply<StageResult>>) {
        let repo = self.orchestrator.repository();
        let prepared = async {
            self.orchestrator
                .seeds()
                .get_seed_for_generation(&self.session_id)
                .await?;
            let (session, ()) = repo
                .update(&session.id, |s| {
                    s.status = SessionStatus::Running;
                    s.last_error = None;
                    Ok(())
                })
                .await?;
            Ok::<_, ForgeError>(session)
        }
        .await;

        let session = match prepared {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Could not start stage {}: {}", session.stage, e);
                self.publish(ChannelMessage::error(Some(&self.session_id), &e));
                reply_all(waiters, &Err(e));
                return;
            }
        };

        let stage = session.stage;
        let cancel = CancellationToken::new();
        let executor = self.orchestrator.executor();
        let retries = self.orchestrator.config().stage_retries;
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut attempt = 0;
            loop {
                match executor.execute(&session, &token).await {
                    Err(ForgeError::UpstreamGeneration(msg)) if attempt < retries => {
                        attempt += 1;
                        tracing::warn!(
                            session_id = %session.id,
                            stage = %session.stage,
                            attempt,
                            "Stage failed upstream, retrying: {}",
                            msg
                        );
                    }
                    outcome => return outcome,
                }
            }
        });
        tracing::info!(stage = %stage, "Stage running");
        self.running = Some(RunningStage {
            stage,
            cancel,
            handle,
            waiters,
        });
    }

    async fn finish_stage(
        &mut self,
        running: RunningStage,
        outcome: Result<ForgeResult<StageResult>, JoinError>,
    ) {
        let stage = running.stage;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(ForgeError::Cancelled),
            Err(e) => Err(ForgeError::internal(format!("Stage task panicked: {}", e))),
        };
        let repo = self.orchestrator.repository();

        match &outcome {
            Ok(result) => {
                let persisted = repo
                    .update(&self.session_id, |s| {
                        if s.stage != stage || s.status.is_terminal() {
                            return Err(ForgeError::Conflict(format!(
                                "session moved to {} while {} was running",
                                s.state(),
                                stage
                            )));
                        }
                        s.outputs.insert(stage, result.clone());
                        s.status = SessionStatus::Paused;
                        s.cost += result.cost;
                        s.last_error = None;
                        Ok(())
                    })
                    .await;

                match persisted {
                    Ok((session, ())) => {
                        tracing::info!(
                            stage = %stage,
                            score = result.selected_score(),
                            cost = result.cost,
                            "Stage paused for review"
                        );
                        if let StagePayload::Story { text } = &result.payload {
                            self.publish(ChannelMessage::LlmResponse {
                                session_id: self.session_id.clone(),
                                stage,
                                content: text.clone(),
                            });
                        }
                        self.publish(ChannelMessage::StageComplete {
                            session_id: self.session_id.clone(),
                            stage,
                            status: session.status,
                            version: session.version,
                            selected_score: result.selected_score(),
                            below_threshold: result.below_threshold(),
                        });
                        reply_all(running.waiters, &outcome);
                    }
                    Err(e) => {
                        tracing::warn!(stage = %stage, "Could not persist stage result: {}", e);
                        self.publish(ChannelMessage::error(Some(&self.session_id), &e));
                        reply_all(running.waiters, &Err(e));
                    }
                }
            }
            Err(ForgeError::Cancelled) => {
                reply_all(running.waiters, &outcome);
            }
            Err(e) => {
                let status = if e.recoverable() {
                    SessionStatus::Paused
                } else {
                    SessionStatus::Failed
                };
                let report = e.report();
                tracing::warn!(stage = %stage, ?status, "Stage failed: {}", e);
                if let Err(store_err) = repo
                    .update(&self.session_id, |s| {
                        if !s.status.is_terminal() {
                            s.status = status;
                            s.last_error = Some(report.clone());
                        }
                        Ok(())
                    })
                    .await
                {
                    tracing::warn!("Could not record stage failure: {}", store_err);
                }
                self.publish(ChannelMessage::error(Some(&self.session_id), e));
                reply_all(running.waiters, &outcome);
            }
        }
    }

    async fn on_approve(&mut self, expected_stage: Option<Stage>) -> ForgeResult<GenerationSession> {
        if let Some(running) = &self.running {
            return Err(ForgeError::validation(format!(
                "Stage {} is still running",
                running.stage
            )));
        }
        let session = self.load_owned().await?;

        if let Some(expected) = expected_stage {
            let committed = session
                .outputs
                .get(&expected)
                .map_or(false, |r| r.committed);
            if committed {
                tracing::debug!(stage = %expected, "Stage already approved");
                return Ok(session);
            }
            if expected != session.stage {
                return Err(ForgeError::validation(format!(
                    "Expected to approve {} but the session is at {}",
                    expected, session.stage
                )));
            }
        }

        match session.status {
            SessionStatus::Paused => {}
            SessionStatus::Created | SessionStatus::Running => {
                return Err(ForgeError::validation(format!(
                    "Stage {} has not finished generating",
                    session.stage
                )))
            }
            status => {
                return Err(ForgeError::validation(format!(
                    "Session is {}; nothing to approve",
                    status.as_str()
                )))
            }
        }
        if session.current_result().is_none() {
            return Err(ForgeError::validation(format!(
                "Stage {} has no result to approve",
                session.stage
            )));
        }

        let repo = self.orchestrator.repository();
        let (session, approved) = repo
            .update(&self.session_id, |s| {
                let stage = s.stage;
                let result = s.outputs.get_mut(&stage).ok_or_else(|| {
                    ForgeError::validation(format!("Stage {} has no result to approve", stage))
                })?;
                result.commit();
                let next = next_stage(stage).unwrap_or(Stage::Complete);
                s.stage = next;
                s.last_error = None;
                s.status = if next.is_terminal() {
                    SessionStatus::Complete
                } else {
                    SessionStatus::Running
                };
                Ok(stage)
            })
            .await?;
        tracing::info!(approved = %approved, next = %session.stage, "Stage approved");

        if session.status == SessionStatus::Complete {
            let last_score = session
                .outputs
                .get(&approved)
                .map(|r| r.selected_score())
                .unwrap_or(0.0);
            self.publish(ChannelMessage::StageComplete {
                session_id: self.session_id.clone(),
                stage: Stage::Complete,
                status: SessionStatus::Complete,
                version: session.version,
                selected_score: last_score,
                below_threshold: false,
            });
            return Ok(session);
        }

        self.start_stage(session.clone(), Vec::new()).await;
        Ok(session)
    }

    async fn on_regenerate(&mut self, feedback: String) -> ForgeResult<GenerationSession> {
        let feedback = feedback.trim().to_string();
        if feedback.is_empty() {
            return Err(ForgeError::validation("Feedback must not be empty"));
        }
        let session = if self.running.is_some() {
            self.orchestrator.repository().load(&self.session_id).await?
        } else {
            self.load_live().await?
        };
        if session.status.is_terminal() {
            return Err(ForgeError::validation(format!(
                "Session is {}; it cannot be regenerated",
                session.status.as_str()
            )));
        }

        let carried = match self.running.take() {
            Some(running) => {
                tracing::info!(stage = %running.stage, "Cancelling in-flight stage for regeneration");
                running.abort()
            }
            None => Vec::new(),
        };

        let updated = self
            .orchestrator
            .repository()
            .update(&self.session_id, |s| {
                s.history
                    .push(ConversationEntry::new(EntryRole::Feedback, s.stage, feedback.clone()));
                s.status = SessionStatus::Running;
                s.last_error = None;
                Ok(())
            })
            .await;
        let session = match updated {
            Ok((session, ())) => session,
            Err(e) => {
                reply_all(carried, &Err(e.clone()));
                return Err(e);
            }
        };
        tracing::info!(stage = %session.stage, "Regenerating stage with feedback");

        self.start_stage(session.clone(), carried).await;
        Ok(session)
    }

    async fn on_fail(&mut self, reason: ForgeError) -> ForgeResult<GenerationSession> {
        let repo = self.orchestrator.repository();
        let session = repo.load(&self.session_id).await?;
        if session.status.is_terminal() {
            return Ok(session);
        }
        if let Some(running) = self.running.take() {
            reply_all(running.abort(), &Err(reason.clone()));
        }

        let report = ErrorReport {
            recoverable: false,
            ..reason.report()
        };
        let (session, ()) = repo
            .update(&self.session_id, |s| {
                if !s.status.is_terminal() {
                    s.status = SessionStatus::Failed;
                    s.last_error = Some(report.clone());
                }
                Ok(())
            })
            .await?;
        tracing::warn!(reason = %reason, "Session failed");
        self.publish(ChannelMessage::Error {
            session_id: Some(self.session_id.clone()),
            code: report.code,
            message: report.message,
            recoverable: false,
        });
        Ok(session)
    }

    fn publish(&self, message: ChannelMessage) {
        self.orchestrator.hub().publish(&self.session_id, message);
    }
}
