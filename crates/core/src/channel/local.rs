//! In-process transport: a pair of bounded queues standing in for a socket. Used by the
//! CLI runner and by tests that exercise the full connect, resync, and reconnect cycle.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::client::Connector;
use super::driver::{serve_connection, ChannelConfig, FeedbackHandler, FrameSink, FrameStream, TransportError};
use super::message::ChannelMessage;
use super::registry::NotificationHub;

pub struct MemorySink {
    tx: Option<mpsc::Sender<ChannelMessage>>,
}

pub struct MemoryStream {
    rx: mpsc::Receiver<ChannelMessage>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, message: &ChannelMessage) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(message.clone())
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self, _reason: &str) {
        self.tx.take();
    }
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next_frame(&mut self) -> Option<Result<ChannelMessage, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Two connected endpoints: `(server, client)`
pub fn memory_pipe(capacity: usize) -> ((MemorySink, MemoryStream), (MemorySink, MemoryStream)) {
    let (to_client, client_rx) = mpsc::channel(capacity.max(1));
    let (to_server, server_rx) = mpsc::channel(capacity.max(1));
    (
        (
            MemorySink { tx: Some(to_client) },
            MemoryStream { rx: server_rx },
        ),
        (
            MemorySink { tx: Some(to_server) },
            MemoryStream { rx: client_rx },
        ),
    )
}

/// Connects clients to a hub in the same process
#[derive(Clone)]
pub struct LocalConnector {
    hub: NotificationHub,
    handler: Arc<dyn FeedbackHandler>,
    config: ChannelConfig,
    connections: Arc<AtomicUsize>,
}

impl LocalConnector {
    pub fn new(hub: NotificationHub, handler: Arc<dyn FeedbackHandler>, config: ChannelConfig) -> Self {
        Self {
            hub,
            handler,
            config,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Connections opened so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        session_id: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameStream>), TransportError> {
        let ((server_sink, server_stream), (client_sink, client_stream)) =
            memory_pipe(self.config.buffer);
        self.connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve_connection(
            self.hub.clone(),
            session_id.to_string(),
            Box::new(server_sink),
            Box::new(server_stream),
            self.config.clone(),
            Arc::clone(&self.handler),
        ));
        Ok((Box::new(client_sink), Box::new(client_stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_carries_frames_both_ways() {
        let ((mut server_sink, mut server_stream), (mut client_sink, mut client_stream)) =
            memory_pipe(4);
        server_sink.send(&ChannelMessage::heartbeat()).await.unwrap();
        assert_eq!(
            client_stream.next_frame().await.unwrap().unwrap().kind(),
            "heartbeat"
        );

        client_sink
            .send(&ChannelMessage::Feedback {
                content: "hi".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            server_stream.next_frame().await.unwrap().unwrap().kind(),
            "feedback"
        );
    }

    #[tokio::test]
    async fn test_closed_sink_ends_peer_stream() {
        let ((mut server_sink, _server_stream), (_client_sink, mut client_stream)) = memory_pipe(4);
        server_sink.close("bye").await;
        assert!(client_stream.next_frame().await.is_none());
        assert_eq!(
            server_sink.send(&ChannelMessage::heartbeat()).await,
            Err(TransportError::Closed)
        );
    }
}
