//! Store key layout.
//!
//! The keyspace is shared with every other gateway instance pointed at the
//! same store, so the shapes here are load-bearing:
//!
//! - `redissub:offline:zset:<channel>` — per-channel offline log
//! - `redissub:online:waiter:hash:<channel>:<id>` — delivered, un-acked
//! - `redissub:online:receiver:hash:<channel>:<id>` — acked
//! - `redissub:online:offset:<channel>:<id>` — acked-time high-water mark

/// Per-channel offline log (sorted set scored by event time).
pub fn offline_key(channel: &str) -> String {
    format!("redissub:offline:zset:{channel}")
}

/// Delivered-but-unacked hash for one (channel, subscriber).
pub fn waiter_key(channel: &str, subscriber: &str) -> String {
    format!("redissub:online:waiter:hash:{channel}:{subscriber}")
}

/// Acked-id hash for one (channel, subscriber), used to dedupe replay.
pub fn receiver_key(channel: &str, subscriber: &str) -> String {
    format!("redissub:online:receiver:hash:{channel}:{subscriber}")
}

/// Acked-time high-water mark for one (channel, subscriber).
pub fn offset_key(channel: &str, subscriber: &str) -> String {
    format!("redissub:online:offset:{channel}:{subscriber}")
}
