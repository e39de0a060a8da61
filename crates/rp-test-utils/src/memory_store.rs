//! In-memory [`DeliveryStore`] with TTL simulation.
//!
//! Keys expire lazily: an entry whose deadline has passed is treated as
//! absent (and removed) on the next access. `force_expire` lets tests
//! collapse a TTL without waiting.

use async_trait::async_trait;
use gateway::store::{DeliveryStore, StoreError};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

enum Value {
    Zset(Vec<(i64, Vec<u8>)>),
    Hash(Vec<(String, Vec<u8>)>),
    Str(String),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= Instant::now())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop `key` as if its TTL had elapsed.
    pub fn force_expire(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Whether `key` exists and carries a TTL.
    pub fn has_ttl(&self, key: &str) -> bool {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        entries
            .get(key)
            .is_some_and(|entry| entry.expires_at.is_some())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("store lock poisoned")
    }

    fn purge(entries: &mut HashMap<String, Entry>, key: &str) {
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl DeliveryStore for MemoryStore {
    async fn zadd(&self, key: &str, score: i64, member: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Value::Zset(Vec::new())));
        let Value::Zset(members) = &mut entry.value else {
            return Ok(());
        };
        match members.iter_mut().find(|(_, m)| m == member) {
            Some(existing) => existing.0 = score,
            None => members.push((score, member.to_vec())),
        }
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let Some(Entry {
            value: Value::Zset(members),
            ..
        }) = entries.get(key)
        else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<(i64, Vec<u8>)> = members
            .iter()
            .filter(|(score, _)| (min..=max).contains(score))
            .cloned()
            .collect();
        // Score order, member order for ties, matching the real store.
        hits.sort();
        Ok(hits.into_iter().map(|(_, member)| member).collect())
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let entry = entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Value::Hash(Vec::new())));
        let Value::Hash(fields) = &mut entry.value else {
            return Ok(());
        };
        match fields.iter_mut().find(|(f, _)| f == field) {
            Some(existing) => existing.1 = value.to_vec(),
            None => fields.push((field.to_owned(), value.to_vec())),
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let Some(Entry {
            value: Value::Hash(fields),
            ..
        }) = entries.get(key)
        else {
            return Ok(None);
        };
        Ok(fields
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.clone()))
    }

    async fn hgetall(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let Some(Entry {
            value: Value::Hash(fields),
            ..
        }) = entries.get(key)
        else {
            return Ok(Vec::new());
        };
        Ok(fields.clone())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let emptied = match entries.get_mut(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => {
                fields.retain(|(f, _)| f != field);
                fields.is_empty()
            }
            _ => false,
        };
        // An emptied hash disappears, like in the real store.
        if emptied {
            entries.remove(key);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        let Some(Entry {
            value: Value::Str(value),
            ..
        }) = entries.get(key)
        else {
            return Ok(None);
        };
        Ok(Some(value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        // Plain SET discards any previous TTL, matching the real store; the
        // engine refreshes the TTL right after every write.
        entries.insert(key.to_owned(), Entry::new(Value::Str(value.to_owned())));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.lock();
        Self::purge(&mut entries, key);
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_ops_round_trip() {
        let store = MemoryStore::new();
        store.hset("h", "a", b"1").await.expect("hset");
        store.hset("h", "b", b"2").await.expect("hset");
        assert_eq!(store.hget("h", "a").await.expect("hget"), Some(b"1".to_vec()));
        assert_eq!(store.hgetall("h").await.expect("hgetall").len(), 2);

        store.hdel("h", "a").await.expect("hdel");
        assert_eq!(store.hget("h", "a").await.expect("hget"), None);
    }

    #[tokio::test]
    async fn zrange_filters_and_orders_by_score() {
        let store = MemoryStore::new();
        store.zadd("z", 30, b"c").await.expect("zadd");
        store.zadd("z", 10, b"a").await.expect("zadd");
        store.zadd("z", 20, b"b").await.expect("zadd");

        let hits = store.zrange_by_score("z", 10, 20).await.expect("zrange");
        assert_eq!(hits, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let store = MemoryStore::new();
        store.set("k", "v").await.expect("set");
        store
            .expire("k", Duration::from_millis(0))
            .await
            .expect("expire");
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn force_expire_drops_the_key() {
        let store = MemoryStore::new();
        store.hset("h", "a", b"1").await.expect("hset");
        store.force_expire("h");
        assert!(store.hgetall("h").await.expect("hgetall").is_empty());
    }
}
