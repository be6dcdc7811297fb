//! # Connection Driver
//!
//! Server side of one channel connection: forwards hub messages to the client, sends
//! heartbeats, routes inbound feedback to the orchestrator, and closes the connection
//! after `idle_timeout` without client activity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant};

use super::message::ChannelMessage;
use super::registry::NotificationHub;
use crate::error::{ForgeError, ForgeResult};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection closed")]
    Closed,
    #[error("Transport error: {0}")]
    Io(String),
    #[error("Invalid frame: {0}")]
    Decode(String),
}

/// Outbound half of a connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, message: &ChannelMessage) -> Result<(), TransportError>;
    async fn close(&mut self, reason: &str);
}

/// Inbound half of a connection; `None` once the peer has gone
#[async_trait]
pub trait FrameStream: Send {
    async fn next_frame(&mut self) -> Option<Result<ChannelMessage, TransportError>>;
}

/// Receives client feedback frames
#[async_trait]
pub trait FeedbackHandler: Send + Sync {
    async fn on_feedback(&self, session_id: &str, content: String) -> ForgeResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub heartbeat_interval_ms: u64,
    pub idle_timeout_ms: u64,
    /// Per-connection outbound queue depth
    pub buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 300_000,
            buffer: 64,
        }
    }
}

impl ChannelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    IdleTimeout,
    ClientClosed,
    Transport(String),
    HubClosed,
}

/// Drive one connection until it closes
#[tracing::instrument(skip(hub, sink, stream, config, handler))]
pub async fn serve_connection(
    hub: NotificationHub,
    session_id: String,
    mut sink: Box<dyn FrameSink>,
    mut stream: Box<dyn FrameStream>,
    config: ChannelConfig,
    handler: Arc<dyn FeedbackHandler>,
) -> CloseReason {
    let mut subscription = hub.connect(&session_id);

    let (inbound_tx, mut inbound_rx) = mpsc::channel(16);
    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next_frame().await {
            if inbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_every = config.heartbeat_interval();
    let idle_timeout = config.idle_timeout();
    let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            _ = &mut idle => {
                tracing::info!("Closing idle channel connection");
                sink.close("idle timeout").await;
                break CloseReason::IdleTimeout;
            }
            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(&ChannelMessage::heartbeat()).await {
                    break CloseReason::Transport(e.to_string());
                }
            }
            outbound = subscription.receiver.recv() => {
                let Some(message) = outbound else {
                    break CloseReason::HubClosed;
                };
                if let Err(e) = sink.send(&message).await {
                    break CloseReason::Transport(e.to_string());
                }
            }
            inbound = inbound_rx.recv() => {
                match inbound {
                    Some(Ok(message)) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        match message {
                            ChannelMessage::Feedback { content } => {
                                if let Err(e) = handler.on_feedback(&session_id, content).await {
                                    tracing::warn!("Feedback rejected: {}", e);
                                    let reply = ChannelMessage::error(Some(&session_id), &e);
                                    if let Err(e) = sink.send(&reply).await {
                                        break CloseReason::Transport(e.to_string());
                                    }
                                }
                            }
                            ChannelMessage::Heartbeat { .. } => {}
                            other => tracing::debug!(kind = other.kind(), "Ignoring client frame"),
                        }
                    }
                    Some(Err(TransportError::Decode(detail))) => {
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        let err = ForgeError::validation(format!("Unreadable frame: {}", detail));
                        if let Err(e) = sink.send(&ChannelMessage::error(Some(&session_id), &err)).await {
                            break CloseReason::Transport(e.to_string());
                        }
                    }
                    Some(Err(TransportError::Closed)) | None => break CloseReason::ClientClosed,
                    Some(Err(e)) => break CloseReason::Transport(e.to_string()),
                }
            }
        }
    };

    reader.abort();
    hub.disconnect(&session_id, subscription.id);
    tracing::info!(?reason, "Channel connection closed");
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::local::memory_pipe;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingHandler {
        received: Mutex<Vec<(String, String)>>,
        reject: bool,
    }

    #[async_trait]
    impl FeedbackHandler for RecordingHandler {
        async fn on_feedback(&self, session_id: &str, content: String) -> ForgeResult<()> {
            if self.reject {
                return Err(ForgeError::validation("not now"));
            }
            self.received
                .lock()
                .unwrap()
                .push((session_id.to_string(), content));
            Ok(())
        }
    }

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            heartbeat_interval_ms: 20,
            idle_timeout_ms: 200,
            buffer: 8,
        }
    }

    #[tokio::test]
    async fn test_idle_connection_closed_after_heartbeats() {
        let hub = NotificationHub::default();
        let ((server_sink, server_stream), (_client_sink, mut client_stream)) = memory_pipe(32);
        let server = tokio::spawn(serve_connection(
            hub.clone(),
            "s1".into(),
            Box::new(server_sink),
            Box::new(server_stream),
            fast_config(),
            Arc::new(RecordingHandler::default()),
        ));

        let mut heartbeats = 0;
        while let Some(frame) = client_stream.next_frame().await {
            if let Ok(ChannelMessage::Heartbeat { .. }) = frame {
                heartbeats += 1;
            }
        }
        assert!(heartbeats >= 2);
        assert_eq!(server.await.unwrap(), CloseReason::IdleTimeout);
        assert_eq!(hub.connection_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_feedback_routed_and_published_messages_forwarded() {
        let hub = NotificationHub::default();
        let handler = Arc::new(RecordingHandler::default());
        let ((server_sink, server_stream), (mut client_sink, mut client_stream)) = memory_pipe(32);
        let server = tokio::spawn(serve_connection(
            hub.clone(),
            "s1".into(),
            Box::new(server_sink),
            Box::new(server_stream),
            fast_config(),
            handler.clone(),
        ));

        client_sink
            .send(&ChannelMessage::Feedback {
                content: "funnier".into(),
            })
            .await
            .unwrap();

        // wait until the connection is registered, then publish
        while hub.connection_count("s1") == 0 {
            tokio::task::yield_now().await;
        }
        hub.publish(
            "s1",
            ChannelMessage::LlmResponse {
                session_id: "s1".into(),
                stage: crate::pipeline::stage::Stage::Story,
                content: "once upon a time".into(),
            },
        );

        loop {
            match client_stream.next_frame().await {
                Some(Ok(ChannelMessage::LlmResponse { content, .. })) => {
                    assert_eq!(content, "once upon a time");
                    break;
                }
                Some(_) => continue,
                None => panic!("connection closed early"),
            }
        }

        client_sink.close("done").await;
        assert_eq!(server.await.unwrap(), CloseReason::ClientClosed);
        assert_eq!(
            handler.received.lock().unwrap().as_slice(),
            &[("s1".to_string(), "funnier".to_string())]
        );
    }

    #[tokio::test]
    async fn test_rejected_feedback_answered_with_error() {
        let hub = NotificationHub::default();
        let handler = Arc::new(RecordingHandler {
            reject: true,
            ..RecordingHandler::default()
        });
        let ((server_sink, server_stream), (mut client_sink, mut client_stream)) = memory_pipe(32);
        tokio::spawn(serve_connection(
            hub,
            "s1".into(),
            Box::new(server_sink),
            Box::new(server_stream),
            fast_config(),
            handler,
        ));

        client_sink
            .send(&ChannelMessage::Feedback {
                content: "x".into(),
            })
            .await
            .unwrap();
        loop {
            match client_stream.next_frame().await {
                Some(Ok(ChannelMessage::Error {
                    code, recoverable, ..
                })) => {
                    assert_eq!(code, "validation_error");
                    assert!(recoverable);
                    break;
                }
                Some(_) => continue,
                None => panic!("connection closed early"),
            }
        }
    }
}
