//! Cross-process fanout over publish/subscribe.
//!
//! ```text
//! Gateway A ── publish("canvas:c1") ──► broker ──► Gateway B (pattern "canvas:")
//!                                          │            │
//!                                          │            └─► local room c1 only
//!                                          └──► Gateway A: senderId == self, dropped
//! ```
//!
//! Implementations:
//! - [`LocalPubSub`]: single instance, publish returns immediately, no peers
//! - [`MemoryPubSub`]: several gateways in one process share a [`MemoryBroker`]
//! - [`RedisPubSub`]: distributed, backed by Redis PUBLISH/PSUBSCRIBE
//!
//! Pattern subscriptions are plain channel-prefix matches; each backend maps
//! the prefix onto its own syntax.

pub mod memory;
pub mod redis;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::TransportError;
use crate::protocol::now_millis;

pub use self::memory::{LocalPubSub, MemoryBroker, MemoryPubSub};
pub use self::redis::RedisPubSub;

/// Envelope carried over the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PubSubMessage {
    pub channel: String,
    /// Encoded JSON frame
    pub data: String,
    /// Identity of the publishing process (self-echo suppression)
    pub sender_id: String,
    /// Epoch milliseconds.
    pub published_at: u64,
}

impl PubSubMessage {
    pub fn new(
        channel: impl Into<String>,
        data: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
            sender_id: sender_id.into(),
            published_at: now_millis(),
        }
    }

    /// Serialize to the broker wire format (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TransportError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(msg)
    }
}

/// Callback invoked for every delivered message.
pub type MessageHandler = Arc<dyn Fn(PubSubMessage) + Send + Sync>;

/// Publish/subscribe fanout.
///
/// Handlers may run on a background task; they should hand work off
/// rather than block.
pub trait PubSubAdapter: Send + Sync {
    /// Short adapter name for stats.
    fn name(&self) -> &'static str;

    fn publish<'a>(
        &'a self,
        channel: &'a str,
        data: String,
        sender_id: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Deliver messages published on exactly `channel`.
    fn subscribe<'a>(
        &'a self,
        channel: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Deliver messages on every channel starting with `prefix`.
    fn pattern_subscribe<'a>(
        &'a self,
        prefix: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Drop all subscriptions and refuse further publishes.
    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Canvas-scoped channel name.
pub fn canvas_channel(prefix: &str, canvas_id: &str) -> String {
    format!("{prefix}{canvas_id}")
}

/// Canvas id of a canvas-scoped channel.
pub fn canvas_from_channel<'a>(prefix: &str, channel: &'a str) -> Option<&'a str> {
    channel.strip_prefix(prefix).filter(|id| !id.is_empty())
}
