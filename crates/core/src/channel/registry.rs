//! # Connection Registry
//!
//! In-memory, per-process map of session id to live connections. Publishing fans out to
//! every connection of the session; a connection whose receiver is gone is pruned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::message::ChannelMessage;

/// Receiving end of one connection
pub struct Subscription {
    pub id: u64,
    pub session_id: String,
    pub receiver: mpsc::Receiver<ChannelMessage>,
}

#[derive(Default)]
struct ConnectionRegistry {
    sessions: HashMap<String, HashMap<u64, mpsc::Sender<ChannelMessage>>>,
}

struct HubInner {
    registry: Mutex<ConnectionRegistry>,
    next_id: AtomicU64,
    buffer: usize,
}

#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(64)
    }
}

impl NotificationHub {
    /// `buffer` is the per-connection queue depth; a full queue drops messages
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(ConnectionRegistry::default()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, ConnectionRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connect(&self, session_id: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.registry()
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id, tx);
        tracing::debug!(session_id, connection_id = id, "Channel connected");
        Subscription {
            id,
            session_id: session_id.to_string(),
            receiver: rx,
        }
    }

    pub fn disconnect(&self, session_id: &str, connection_id: u64) {
        let mut registry = self.registry();
        if let Some(connections) = registry.sessions.get_mut(session_id) {
            connections.remove(&connection_id);
            if connections.is_empty() {
                registry.sessions.remove(session_id);
            }
        }
        tracing::debug!(session_id, connection_id, "Channel disconnected");
    }

    /// Deliver to every connection of the session; returns how many accepted it
    pub fn publish(&self, session_id: &str, message: ChannelMessage) -> usize {
        let mut registry = self.registry();
        let Some(connections) = registry.sessions.get_mut(session_id) else {
            return 0;
        };

        let mut delivered = 0;
        connections.retain(|connection_id, tx| match tx.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    session_id,
                    connection_id,
                    kind = message.kind(),
                    "Connection queue full, dropping message"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if connections.is_empty() {
            registry.sessions.remove(session_id);
        }
        delivered
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.registry()
            .sessions
            .get(session_id)
            .map_or(0, |c| c.len())
    }
}
