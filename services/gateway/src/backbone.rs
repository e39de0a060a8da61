//! Backbone adapter: the pub/sub bus the gateway fans out from.
//!
//! The backbone gives ordered per-channel broadcast with no persistence;
//! anything that must survive a miss goes through the offline log instead.
//! The router holds exactly one live subscription whose channel set is the
//! union of all endpoint subscriptions, and swaps it wholesale when the
//! union changes.

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackboneError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Publish side + subscription factory.
#[async_trait]
pub trait Backbone: Send + Sync {
    /// Broadcast `payload` to `channel`. Delivery is fire-and-forget.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BackboneError>;

    /// Open a subscription covering exactly `channels`.
    ///
    /// The previous subscription (if any) is simply dropped by the caller;
    /// messages in flight across the swap may be lost — the offline log is
    /// the safety net.
    async fn subscribe(&self, channels: &[String])
    -> Result<Box<dyn BackboneStream>, BackboneError>;
}

/// A live subscription's message stream.
#[async_trait]
pub trait BackboneStream: Send {
    /// Next `(channel, payload)` message, or `None` when the subscription
    /// is closed on the broker side.
    async fn next_message(&mut self) -> Option<(String, Vec<u8>)>;
}

/// A stream that never yields; used while no channel is subscribed.
pub struct IdleStream;

#[async_trait]
impl BackboneStream for IdleStream {
    async fn next_message(&mut self) -> Option<(String, Vec<u8>)> {
        std::future::pending().await
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis pub/sub backbone.
///
/// Publishing uses a multiplexed connection; each `subscribe` call opens a
/// dedicated pub/sub connection, which the dispatcher drops when the channel
/// union changes.
pub struct RedisBackbone {
    client: redis::Client,
    publisher: redis::aio::MultiplexedConnection,
}

impl RedisBackbone {
    pub async fn connect(url: &str) -> Result<Self, BackboneError> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Backbone for RedisBackbone {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BackboneError> {
        let mut conn = self.publisher.clone();
        let _: () = redis::AsyncCommands::publish(&mut conn, channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn BackboneStream>, BackboneError> {
        // SUBSCRIBE with zero channels is a protocol error; an idle stream
        // keeps the dispatcher parked until the union becomes non-empty.
        if channels.is_empty() {
            return Ok(Box::new(IdleStream));
        }
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channels).await?;
        Ok(Box::new(RedisBackboneStream {
            messages: pubsub.into_on_message().boxed(),
        }))
    }
}

struct RedisBackboneStream {
    messages: BoxStream<'static, redis::Msg>,
}

#[async_trait]
impl BackboneStream for RedisBackboneStream {
    async fn next_message(&mut self) -> Option<(String, Vec<u8>)> {
        let msg = self.messages.next().await?;
        Some((
            msg.get_channel_name().to_owned(),
            msg.get_payload_bytes().to_vec(),
        ))
    }
}
