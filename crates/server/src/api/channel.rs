//! WebSocket transport for the per-session notification channel.

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use std::sync::Arc;
use storyforge_core::channel::{serve_connection, ChannelMessage, FrameSink, FrameStream, TransportError};

use super::ApiError;
use crate::SharedState;

pub struct WsSink {
    inner: SplitSink<WebSocket, Message>,
}

pub struct WsStream {
    inner: SplitStream<WebSocket>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, message: &ChannelMessage) -> Result<(), TransportError> {
        let text = message
            .to_json()
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&mut self, reason: &str) {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: reason.to_string().into(),
        };
        if let Err(e) = self.inner.send(Message::Close(Some(frame))).await {
            tracing::debug!("Close frame not delivered: {}", e);
        }
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<ChannelMessage, TransportError>> {
        loop {
            let frame = match self.inner.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            };
            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                // pongs are answered by axum; neither counts as channel traffic
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => return None,
            };
            return Some(ChannelMessage::from_json(&text).map_err(|e| TransportError::Decode(e.to_string())));
        }
    }
}

/// Upgrade to the session's notification channel. Unknown or expired sessions are
/// refused before the upgrade.
pub async fn channel_socket(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.runtime.orchestrator.status(&id).await?;

    let hub = state.runtime.orchestrator.hub().clone();
    let handler = Arc::new(state.runtime.orchestrator.clone());
    let config = state.runtime.config.channel.clone();

    Ok(ws.on_upgrade(move |socket| async move {
        let (sink, stream) = socket.split();
        let reason = serve_connection(
            hub,
            id.clone(),
            Box::new(WsSink { inner: sink }),
            Box::new(WsStream { inner: stream }),
            config,
            handler,
        )
        .await;
        tracing::info!(session_id = %id, reason = ?reason, "Channel closed");
    }))
}
