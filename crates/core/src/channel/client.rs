//! # Channel Client
//!
//! Keeps one session's notification stream alive. The connection is treated as lossy:
//! after every connect the client pulls the authoritative session snapshot from the
//! status endpoint, then consumes pushed messages until the connection drops. Reconnects
//! follow a [`ReconnectPolicy`]; the failure count resets whenever a connect succeeds.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

use super::backoff::ReconnectPolicy;
use super::driver::{FrameSink, FrameStream, TransportError};
use super::message::ChannelMessage;
use crate::error::{ErrorReport, ForgeError, ForgeResult};
use crate::pipeline::stage::SessionStatus;
use crate::state::GenerationSession;

/// Opens a transport to the server for one session
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        session_id: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError>;
}

/// Authoritative session snapshot, used for resync
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, session_id: &str) -> ForgeResult<GenerationSession>;
}

/// Reads `GET {base}/api/v1/sessions/{id}`
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub fn new(base_url: &str, timeout: Duration) -> ForgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ForgeError::internal(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch_status(&self, session_id: &str) -> ForgeResult<GenerationSession> {
        let url = format!("{}/api/v1/sessions/{}", self.base_url, session_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ForgeError::store(format!("Status request failed: {}", e)))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ForgeError::session_not_found(session_id)),
            StatusCode::GONE => Err(ForgeError::SessionExpired(session_id.to_string())),
            status if status.is_success() => response
                .json::<GenerationSession>()
                .await
                .map_err(|e| ForgeError::store(format!("Bad status payload: {}", e))),
            status => Err(ForgeError::store(format!(
                "Status endpoint returned {}",
                status
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Fresh snapshot taken right after a connect
    Resynced(Box<GenerationSession>),
    Message(ChannelMessage),
    Disconnected { reason: String },
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientExit {
    Cancelled,
    GaveUp { attempts: u32 },
    SessionTerminal(SessionStatus),
    Failed(ErrorReport),
}

enum Pumped {
    Closed(String),
    Exit(ClientExit),
}

pub struct ChannelClient {
    connector: Arc<dyn Connector>,
    status: Arc<dyn StatusSource>,
    policy: ReconnectPolicy,
    heartbeat_interval: Option<Duration>,
}

impl ChannelClient {
    pub fn new(connector: Arc<dyn Connector>, status: Arc<dyn StatusSource>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            status,
            policy,
            heartbeat_interval: None,
        }
    }

    /// Send heartbeats so the server keeps an otherwise quiet connection open
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Follow `session_id` until it reaches a terminal status, reconnects run out, or
    /// `cancel` fires. Events are delivered to `events`.
    #[tracing::instrument(skip(self, events, cancel))]
    pub async fn run(
        &self,
        session_id: &str,
        events: mpsc::Sender<ClientEvent>,
        cancel: CancellationToken,
    ) -> ClientExit {
        let mut failures: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return ClientExit::Cancelled;
            }

            match self.connector.connect(session_id).await {
                Ok((mut sink, stream)) => {
                    failures = 0;
                    match self.resync(session_id, &events).await {
                        Ok(Some(exit)) => {
                            sink.close("session finished").await;
                            return exit;
                        }
                        Ok(None) => match self.pump(sink, stream, &events, &cancel).await {
                            Pumped::Exit(exit) => return exit,
                            Pumped::Closed(reason) => {
                                tracing::info!(%reason, "Channel disconnected");
                                let _ = events.send(ClientEvent::Disconnected { reason }).await;
                            }
                        },
                        Err(e) => {
                            tracing::warn!("Resync failed: {}", e);
                            sink.close("resync failed").await;
                        }
                    }
                }
                Err(e) => tracing::warn!(attempt = failures + 1, "Connect failed: {}", e),
            }

            failures += 1;
            let Some(delay) = self.policy.delay_for(failures) else {
                let attempts = failures - 1;
                tracing::warn!(attempts, "Giving up on channel reconnects");
                let _ = events.send(ClientEvent::GaveUp { attempts }).await;
                return ClientExit::GaveUp { attempts };
            };
            tracing::debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => return ClientExit::Cancelled,
                _ = sleep(delay) => {}
            }
        }
    }

    /// `Ok(Some(exit))` when nothing more can happen on this session
    async fn resync(
        &self,
        session_id: &str,
        events: &mpsc::Sender<ClientEvent>,
    ) -> ForgeResult<Option<ClientExit>> {
        match self.status.fetch_status(session_id).await {
            Ok(session) => {
                let status = session.status;
                let _ = events.send(ClientEvent::Resynced(Box::new(session))).await;
                Ok(status
                    .is_terminal()
                    .then_some(ClientExit::SessionTerminal(status)))
            }
            Err(e) if !e.recoverable() => Ok(Some(ClientExit::Failed(e.report()))),
            Err(e) => Err(e),
        }
    }

    async fn pump(
        &self,
        mut sink: Box<dyn FrameSink>,
        mut stream: Box<dyn FrameStream>,
        events: &mpsc::Sender<ClientEvent>,
        cancel: &CancellationToken,
    ) -> Pumped {
        let every = self.heartbeat_interval.unwrap_or(Duration::from_secs(3600));
        let mut heartbeat = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    sink.close("client cancelled").await;
                    return Pumped::Exit(ClientExit::Cancelled);
                }
                _ = heartbeat.tick(), if self.heartbeat_interval.is_some() => {
                    if let Err(e) = sink.send(&ChannelMessage::heartbeat()).await {
                        return Pumped::Closed(e.to_string());
                    }
                }
                frame = stream.next_frame() => {
                    let message = match frame {
                        None => return Pumped::Closed("server closed the connection".into()),
                        Some(Err(TransportError::Decode(detail))) => {
                            tracing::warn!(%detail, "Skipping unreadable frame");
                            continue;
                        }
                        Some(Err(e)) => return Pumped::Closed(e.to_string()),
                        Some(Ok(message)) => message,
                    };
                    let exit = match &message {
                        ChannelMessage::StageComplete { status, .. } if status.is_terminal() => {
                            Some(ClientExit::SessionTerminal(*status))
                        }
                        ChannelMessage::Error { code, message: text, recoverable: false, .. } => {
                            Some(ClientExit::Failed(ErrorReport {
                                code: code.clone(),
                                message: text.clone(),
                                recoverable: false,
                            }))
                        }
                        _ => None,
                    };
                    if events.send(ClientEvent::Message(message)).await.is_err() {
                        sink.close("listener gone").await;
                        return Pumped::Exit(ClientExit::Cancelled);
                    }
                    if let Some(exit) = exit {
                        sink.close("session finished").await;
                        return Pumped::Exit(exit);
                    }
                }
            }
        }
    }
}
