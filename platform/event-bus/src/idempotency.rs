//! Idempotency cache for effectively-once consumption
//!
//! At-least-once delivery plus this cache yields single-effect outcomes:
//! before a handler runs, the bus checks `(group, event_id)`; after a
//! successful run it marks the pair. The mark is first-write-wins: once an
//! entry exists it is never overwritten.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::{BusError, BusResult};

/// Tracks whether a `(group, event_id)` pair has been processed.
///
/// Contract: if `seen` returns true the event must be treated as already
/// processed. Entries persist at least their TTL, which must outlive
/// `max_attempts × visibility_timeout × backoff_ceiling`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn seen(&self, group: &str, event_id: &str) -> BusResult<bool>;

    /// Record the pair. Returns true when this call created the entry
    /// (atomic first sight); false when it already existed.
    async fn mark(&self, group: &str, event_id: &str, ttl: Duration) -> BusResult<bool>;
}

/// In-memory store for tests and single-process development.
pub struct InMemoryIdempotencyStore {
    seen: Mutex<HashMap<(String, String), Instant>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn seen(&self, group: &str, event_id: &str) -> BusResult<bool> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        seen.retain(|_, expires| *expires > now);
        Ok(seen.contains_key(&(group.to_string(), event_id.to_string())))
    }

    async fn mark(&self, group: &str, event_id: &str, ttl: Duration) -> BusResult<bool> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let key = (group.to_string(), event_id.to_string());
        let now = Instant::now();
        match seen.get(&key) {
            Some(expires) if *expires > now => Ok(false),
            _ => {
                seen.insert(key, now + ttl);
                Ok(true)
            }
        }
    }
}

/// Durable store backed by Redis keys.
pub struct RedisIdempotencyStore {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub fn new(conn: MultiplexedConnection, key_prefix: &str) -> Self {
        Self {
            conn,
            prefix: key_prefix.trim_end_matches(':').to_string(),
        }
    }

    fn key(&self, group: &str, event_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, group, event_id)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn seen(&self, group: &str, event_id: &str) -> BusResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(self.key(group, event_id))
            .await
            .map_err(|e| BusError::StoreUnavailable(e.to_string()))?;
        Ok(exists)
    }

    async fn mark(&self, group: &str, event_id: &str, ttl: Duration) -> BusResult<bool> {
        // SET NX EX prevents concurrent duplicates from double-processing.
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.key(group, event_id))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::StoreUnavailable(e.to_string()))?;
        Ok(set.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_then_seen() {
        let store = InMemoryIdempotencyStore::new();
        assert!(!store.seen("g", "e1").await.unwrap());
        assert!(store.mark("g", "e1", Duration::from_secs(60)).await.unwrap());
        assert!(store.seen("g", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_is_first_write_wins() {
        let store = InMemoryIdempotencyStore::new();
        assert!(store.mark("g", "e1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.mark("g", "e1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_groups_are_isolated() {
        let store = InMemoryIdempotencyStore::new();
        store.mark("g1", "e1", Duration::from_secs(60)).await.unwrap();
        assert!(!store.seen("g2", "e1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_are_forgotten() {
        let store = InMemoryIdempotencyStore::new();
        store.mark("g", "e1", Duration::ZERO).await.unwrap();
        assert!(!store.seen("g", "e1").await.unwrap());
    }
}
