//! In-process bus with queues, registry and broadcast fan-out.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use super::{BusMessage, BusStream, JobQueue, Publisher, Registry, SharedQueue, Subscriber};
use crate::error::BusError;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// In-memory implementation of every bus trait.
pub struct MemoryBus {
    queues: Mutex<HashMap<JobQueue, VecDeque<String>>>,
    strings: RwLock<HashMap<String, String>>,
    hashes: RwLock<HashMap<String, HashMap<String, String>>>,
    tx: broadcast::Sender<BusMessage>,
    /// Every message ever published, in order.
    published: RwLock<Vec<BusMessage>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            strings: RwLock::new(HashMap::new()),
            hashes: RwLock::new(HashMap::new()),
            tx,
            published: RwLock::new(Vec::new()),
        })
    }

    /// Payloads published on `channel` so far.
    pub async fn published_on(&self, channel: &str) -> Vec<String> {
        self.published
            .read()
            .await
            .iter()
            .filter(|m| m.channel == channel)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Total number of messages published on any channel.
    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }
}

#[async_trait]
impl SharedQueue for MemoryBus {
    async fn pop(&self, queue: JobQueue) -> Result<Option<String>, BusError> {
        Ok(self
            .queues
            .lock()
            .await
            .get_mut(&queue)
            .and_then(VecDeque::pop_front))
    }

    async fn length(&self, queue: JobQueue) -> Result<usize, BusError> {
        Ok(self.queues.lock().await.get(&queue).map_or(0, VecDeque::len))
    }

    async fn push(&self, queue: JobQueue, item: &str) -> Result<(), BusError> {
        self.queues
            .lock()
            .await
            .entry(queue)
            .or_default()
            .push_back(item.to_string());
        Ok(())
    }
}

#[async_trait]
impl Registry for MemoryBus {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        Ok(self.strings.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BusError> {
        self.strings
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        self.hashes
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError> {
        Ok(self
            .hashes
            .read()
            .await
            .get(key)
            .and_then(|h| h.get(field))
            .cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BusError> {
        if let Some(hash) = self.hashes.write().await.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn increment_by(&self, key: &str, by: i64) -> Result<i64, BusError> {
        let mut strings = self.strings.write().await;
        let current = match strings.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| BusError::NotAnInteger {
                key: key.to_string(),
                value: raw.clone(),
            })?,
            None => 0,
        };
        let next = current + by;
        strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let msg = BusMessage::new(channel, payload);
        self.published.write().await.push(msg.clone());
        // No subscribers is fine, same as a real pub/sub service.
        let _ = self.tx.send(msg);
        Ok(())
    }
}

#[async_trait]
impl Subscriber for MemoryBus {
    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, BusError> {
        let channels = channels.to_vec();
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let keep = match item {
                Ok(msg) if channels.contains(&msg.channel) => Some(msg),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Memory bus subscriber lagged");
                    None
                }
            };
            futures::future::ready(keep)
        });
        Ok(Box::pin(stream))
    }
}
