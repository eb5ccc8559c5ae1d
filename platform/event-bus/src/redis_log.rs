//! Redis Streams implementation of the stream log
//!
//! Production backend. Entries are stored as a single `event` field per
//! stream entry (`XADD <stream> * event <bytes>`); consumer-group semantics
//! map directly onto XREADGROUP / XACK / XPENDING+XCLAIM.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;

use crate::log::{GroupStart, LogEntry, Offset, StreamLog};
use crate::{BusError, BusResult};

const EVENT_FIELD: &str = "event";

/// Stream log backed by Redis Streams.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{RedisLog, StreamLog};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = RedisLog::connect("redis://localhost:6379").await?;
/// log.append("perception.heartbeat.v1", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisLog {
    conn: MultiplexedConnection,
}

impl RedisLog {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| BusError::StoreUnavailable(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::StoreUnavailable(e.to_string()))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::StoreUnavailable(e.to_string()))?;

        tracing::info!(url = %url, "connected to redis stream store");
        Ok(Self { conn })
    }

    /// Clone of the underlying connection, for co-located stores (e.g. the
    /// idempotency cache) that share the same Redis instance.
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    fn entry_from_stream_id(id: &StreamId, delivery_count: u32) -> BusResult<LogEntry> {
        let offset = Offset::from_str(&id.id).map_err(BusError::Internal)?;
        let bytes = match id.map.get(EVENT_FIELD) {
            Some(value) => redis::from_redis_value::<Vec<u8>>(value)
                .map_err(|e| BusError::Serialization(e.to_string()))?,
            None => Vec::new(),
        };
        Ok(LogEntry {
            offset,
            bytes,
            delivery_count,
        })
    }
}

fn store_err(e: redis::RedisError) -> BusError {
    BusError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl StreamLog for RedisLog {
    async fn append(&self, stream: &str, bytes: Vec<u8>) -> BusResult<Offset> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(stream, "*", &[(EVENT_FIELD, bytes)])
            .await
            .map_err(store_err)?;
        Offset::from_str(&id).map_err(BusError::Internal)
    }

    async fn read_range(
        &self,
        stream: &str,
        from: Offset,
        limit: usize,
    ) -> BusResult<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, from.to_string(), "+", limit)
            .await
            .map_err(store_err)?;
        reply
            .ids
            .iter()
            .map(|id| Self::entry_from_stream_id(id, 0))
            .collect()
    }

    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> BusResult<()> {
        let start_id = match start {
            GroupStart::Beginning => "0".to_string(),
            GroupStart::End => "$".to_string(),
            GroupStart::After(offset) => offset.to_string(),
        };
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, start_id).await;
        match result {
            Ok(_) => Ok(()),
            // Re-creating an existing group is fine.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[stream], &[">"], &options)
            .await
            .map_err(store_err)?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in &key.ids {
                entries.push(Self::entry_from_stream_id(id, 1)?);
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, offset: Offset) -> BusResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, &[offset.to_string()])
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BusResult<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(store_err)?;

        let min_idle_ms = min_idle.as_millis() as usize;
        let stale: Vec<&redis::streams::StreamPendingId> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = stale.iter().map(|p| p.id.clone()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids)
            .await
            .map_err(store_err)?;

        let mut entries = Vec::new();
        for id in &claimed.ids {
            let delivery_count = stale
                .iter()
                .find(|p| p.id == id.id)
                .map(|p| (p.times_delivered + 1) as u32)
                .unwrap_or(2);
            entries.push(Self::entry_from_stream_id(id, delivery_count)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // For CI, use InMemoryLog tests instead.
    // For manual testing: docker run -p 6379:6379 redis:7-alpine

    #[tokio::test]
    #[ignore] // Requires Redis server
    async fn test_redis_log_round_trip() {
        let log = RedisLog::connect("redis://localhost:6379")
            .await
            .expect("Redis server must be running on localhost:6379");

        let stream = format!("test.redis_log.{}", uuid::Uuid::new_v4());
        log.create_group(&stream, "g", GroupStart::Beginning)
            .await
            .unwrap();

        let offset = log.append(&stream, b"payload".to_vec()).await.unwrap();
        let entries = log
            .group_read(&stream, "g", "c1", 10, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, offset);
        assert_eq!(entries[0].bytes, b"payload".to_vec());

        log.ack(&stream, "g", offset).await.unwrap();
        let claimed = log
            .claim_stale(&stream, "g", "c2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }
}
