//! Redis-backed bus: lists for job queues, strings and hashes for the
//! registry, PUBLISH/SUBSCRIBE for channels.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::{debug, warn};

use super::{BusMessage, BusStream, JobQueue, Publisher, Registry, SharedQueue, Subscriber};
use crate::error::BusError;

/// Bus client over one multiplexed command connection.
///
/// Subscriptions open their own dedicated connection, since a connection in
/// subscriber mode cannot issue commands.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisBus {
    /// Connect to the service at `url`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!(url, "Connected to redis");
        Ok(Self { client, conn })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl SharedQueue for RedisBus {
    async fn pop(&self, queue: JobQueue) -> Result<Option<String>, BusError> {
        // LPOP is atomic server-side, so no two hosts get the same job.
        let item: Option<String> = self.conn().lpop(queue.key(), None).await?;
        Ok(item)
    }

    async fn length(&self, queue: JobQueue) -> Result<usize, BusError> {
        let len: usize = self.conn().llen(queue.key()).await?;
        Ok(len)
    }

    async fn push(&self, queue: JobQueue, item: &str) -> Result<(), BusError> {
        let _: () = self.conn().rpush(queue.key(), item).await?;
        Ok(())
    }
}

#[async_trait]
impl Registry for RedisBus {
    async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let value: Option<String> = self.conn().get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), BusError> {
        let _: () = self.conn().set(key, value).await?;
        Ok(())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        let _: () = self.conn().hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, BusError> {
        let value: Option<String> = self.conn().hget(key, field).await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), BusError> {
        let _: () = self.conn().hdel(key, field).await?;
        Ok(())
    }

    async fn increment_by(&self, key: &str, by: i64) -> Result<i64, BusError> {
        let value: i64 = self.conn().incr(key, by).await?;
        Ok(value)
    }
}

#[async_trait]
impl Publisher for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let _: () = self.conn().publish(channel, payload).await?;
        Ok(())
    }
}

#[async_trait]
impl Subscriber for RedisBus {
    async fn subscribe(&self, channels: &[String]) -> Result<BusStream, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(?channels, "Subscribed");

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let channel = msg.get_channel_name().to_string();
            let decoded = match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { channel, payload }),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Dropping undecodable message");
                    None
                }
            };
            futures::future::ready(decoded)
        });
        Ok(Box::pin(stream))
    }
}
