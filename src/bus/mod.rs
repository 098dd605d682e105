//! Shared queue, registry and pub/sub: the only channels between hosts.
//!
//! Every dispatcher host and every runner process talks exclusively through
//! these traits. Two backends implement them:
//! - `RedisBus`: the production service
//! - `MemoryBus`: in-process, for tests and single-machine runs

pub mod keys;
pub mod memory;
pub mod redis_bus;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::BusError;

pub use keys::JobQueue;
pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Stream of messages from a subscription.
pub type BusStream = Pin<Box<dyn Stream<Item = BusMessage> + Send>>;

/// FIFO job queues shared by all hosts.
///
/// `pop` must be atomic across hosts: two hosts never receive the same item.
#[async_trait]
pub trait SharedQueue: Send + Sync {
    /// Remove and return the oldest item, or `None` when the queue is empty.
    async fn pop(&self, queue: JobQueue) -> Result<Option<String>, BusError>;

    /// Current number of queued items.
    async fn length(&self, queue: JobQueue) -> Result<usize, BusError>;

    /// Append an item (producer side; used by the tick driver and tests).
    async fn push(&self, queue: JobQueue, item: &str) -> Result<(), BusError>;
}

/// Shared key-value registry.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), BusError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BusError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BusError>;

    /// Atomically add `by` to an integer key, returning the new value.
    async fn increment_by(&self, key: &str, by: i64) -> Result<i64, BusError>;
}

/// Fire-and-forget publishing onto a named channel.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;
}

/// Channel subscriptions.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to every channel in `channels`, merged into one stream.
    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, BusError>;
}

/// Everything a dispatcher host needs from the shared service.
pub trait Bus: SharedQueue + Registry + Publisher + Subscriber {}

impl<T: SharedQueue + Registry + Publisher + Subscriber> Bus for T {}
