//! Cross-instance broker + KV store.
//!
//! [`SharedStore`] is the narrow surface the gateway needs from a Redis-like
//! system: string keys with TTLs, counters, sets, capped lists, and
//! prefix-subscribed pub/sub channels. Every gateway instance talks to the
//! same store; no instance knows about another instance's sockets.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::errors::Result;

pub use memory::MemoryStore;

/// One message received on a broker channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Message body.
    pub payload: String,
}

/// Broker + KV operations.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Read a string key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string key, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key of any kind. Returns whether it existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Reset a key's TTL. Returns whether it existed.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Increment a counter, creating it with `ttl` on first use.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Add a set member. Returns whether it was new.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a set member. Returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    /// All members of a set.
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Push to the head of a list, trimming it to `cap` entries.
    async fn lpush_capped(&self, key: &str, value: &str, cap: usize) -> Result<()>;

    /// Up to `limit` entries from the head of a list.
    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>>;

    /// Publish on a channel. Returns the number of live receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Receive every message whose channel starts with `prefix`.
    fn psubscribe(&self, prefix: &str) -> BrokerSubscription;

    /// Round-trip liveness check.
    async fn ping(&self) -> Result<()>;
}

/// Receiving half of a prefix subscription.
pub struct BrokerSubscription {
    prefix: String,
    rx: broadcast::Receiver<BrokerMessage>,
}

impl BrokerSubscription {
    /// Wrap a broadcast receiver with a channel-prefix filter.
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<BrokerMessage>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// Next matching message, or `None` once the broker is gone.
    ///
    /// A slow receiver that falls behind skips the lost messages with a
    /// warning; fan-out is at-most-once.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) if msg.channel.starts_with(&self.prefix) => return Some(msg),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "broker subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
