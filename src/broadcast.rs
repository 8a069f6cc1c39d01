//! Fan-out of oracle events to subscribers.
//!
//! The transport (WebSocket, pub/sub, ...) lives outside the oracle; it
//! subscribes to a [`ChannelBroadcaster`] and forwards what it needs.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use consensus_oracle_types::OracleEvent;

/// Default capacity of the broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// An event with the topic it was published on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicMessage {
    pub topic: String,
    pub event: OracleEvent,
}

/// Fire-and-forget publisher.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, topic: &str, event: OracleEvent);
}

/// Broadcaster backed by a `tokio::sync::broadcast` channel.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<TopicMessage>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Receive every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TopicMessage> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, topic: &str, event: OracleEvent) {
        let message = TopicMessage {
            topic: topic.to_string(),
            event,
        };
        // No subscribers is not an error.
        if self.tx.send(message).is_err() {
            debug!("No subscribers for {}", topic);
        }
    }
}
