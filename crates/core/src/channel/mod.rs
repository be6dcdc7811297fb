//! # Notification Channel
//!
//! Real-time, per-session push of pipeline progress to any number of connected clients.
//! The channel is not authoritative: clients resync from the status endpoint after every
//! (re)connect, so delivery only needs to be at-least-once.

pub mod backoff;
pub mod client;
pub mod driver;
pub mod local;
pub mod message;
pub mod registry;

pub use backoff::ReconnectPolicy;
pub use client::{ChannelClient, ClientEvent, ClientExit, Connector, HttpStatusSource, StatusSource};
pub use driver::{serve_connection, ChannelConfig, CloseReason, FeedbackHandler, FrameSink, FrameStream, TransportError};
pub use local::{memory_pipe, LocalConnector, MemorySink, MemoryStream};
pub use message::ChannelMessage;
pub use registry::{NotificationHub, Subscription};
