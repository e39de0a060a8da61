//! Store adapter: the KV primitives the delivery engine runs on.
//!
//! The gateway only ever needs five shapes from its store — sorted-set
//! add/range-by-score, hash set/get/getall/del, string get/set, and TTL
//! refresh — so that is the whole trait. Production uses Redis; tests swap
//! in an in-memory implementation of the same trait.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

/// The KV surface the delivery engine is written against.
///
/// Implementations must be safe for concurrent use; the engine issues calls
/// from the dispatcher, read loops, and resend monitors without any
/// in-process locking of its own.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Add `member` to the sorted set at `key` with the given score.
    /// Re-adding an existing member updates its score.
    async fn zadd(&self, key: &str, score: i64, member: &[u8]) -> Result<(), StoreError>;

    /// Members of the sorted set at `key` with score in `[min, max]`,
    /// ascending by score.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// All (field, value) pairs of the hash at `key`, in no particular order.
    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Refresh `key`'s time-to-live. A key that outlives its TTL is evicted
    /// by the store; the engine relies on this for garbage collection.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Redis-backed [`DeliveryStore`].
///
/// Holds one multiplexed connection; clones of it share the underlying
/// pipeline, so per-call cloning is cheap.
pub struct RedisStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DeliveryStore for RedisStore {
    async fn zadd(&self, key: &str, score: i64, member: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let members: Vec<Vec<u8>> = conn.zrangebyscore(key, min, max).await?;
        Ok(members)
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(String, Vec<u8>)> = conn.hgetall(key).await?;
        Ok(pairs)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }
}
