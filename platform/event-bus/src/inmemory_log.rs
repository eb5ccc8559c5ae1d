//! In-memory implementation of the stream log for testing and development

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::log::{GroupStart, LogEntry, Offset, StreamLog};
use crate::{BusError, BusResult};

/// Stream log backed by process memory.
///
/// Suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that need a fast, isolated store
///
/// Offsets are `0-<n>` where `n` is the append index, so they stay
/// orderable and parseable exactly like the Redis-backed log.
///
/// # Example
/// ```rust
/// use event_bus::{GroupStart, InMemoryLog, StreamLog};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryLog::new();
/// log.create_group("ticks", "readers", GroupStart::Beginning).await?;
/// log.append("ticks", b"hello".to_vec()).await?;
///
/// let entries = log
///     .group_read("ticks", "readers", "reader-1", 10, Duration::ZERO)
///     .await?;
/// assert_eq!(entries.len(), 1);
/// log.ack("ticks", "readers", entries[0].offset).await?;
/// # Ok(())
/// # }
/// ```
pub struct InMemoryLog {
    inner: Mutex<HashMap<String, StreamState>>,
    appended: Arc<Notify>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<Vec<u8>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    /// Index of the next never-delivered entry.
    next: usize,
    pending: BTreeMap<u64, Pending>,
}

struct Pending {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            appended: Arc::new(Notify::new()),
        }
    }

    /// All raw entries currently on a stream (test helper).
    pub fn entries(&self, stream: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    /// Names of all streams that have at least one entry (test helper).
    pub fn stream_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .iter()
            .filter(|(_, s)| !s.entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn try_group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BusResult<Vec<LogEntry>> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = inner.entry(stream.to_string()).or_default();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BusError::Internal(format!("no such group {group} on {stream}")))?;

        let mut delivered = Vec::new();
        while group_state.next < state.entries.len() && delivered.len() < count {
            let seq = group_state.next as u64;
            group_state.pending.insert(
                seq,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    delivery_count: 1,
                },
            );
            delivered.push(LogEntry {
                offset: Offset::new(0, seq),
                bytes: state.entries[group_state.next].clone(),
                delivery_count: 1,
            });
            group_state.next += 1;
        }
        Ok(delivered)
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamLog for InMemoryLog {
    async fn append(&self, stream: &str, bytes: Vec<u8>) -> BusResult<Offset> {
        let offset = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let state = inner.entry(stream.to_string()).or_default();
            state.entries.push(bytes);
            Offset::new(0, (state.entries.len() - 1) as u64)
        };
        self.appended.notify_waiters();
        Ok(offset)
    }

    async fn read_range(
        &self,
        stream: &str,
        from: Offset,
        limit: usize,
    ) -> BusResult<Vec<LogEntry>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = inner.get(stream) else {
            return Ok(Vec::new());
        };
        let start = from.seq as usize;
        Ok(state
            .entries
            .iter()
            .enumerate()
            .skip(start)
            .take(limit)
            .map(|(i, bytes)| LogEntry {
                offset: Offset::new(0, i as u64),
                bytes: bytes.clone(),
                delivery_count: 0,
            })
            .collect())
    }

    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> BusResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = inner.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(());
        }
        let next = match start {
            GroupStart::Beginning => 0,
            GroupStart::End => state.entries.len(),
            GroupStart::After(offset) => (offset.seq as usize + 1).min(state.entries.len()),
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                next,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let delivered = self.try_group_read(stream, group, consumer, count)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let notified = self.appended.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, offset: Offset) -> BusResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = inner.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.pending.remove(&offset.seq);
            }
        }
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
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = inner.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for (&seq, pending) in group_state.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            pending.consumer = consumer.to_string();
            pending.delivered_at = now;
            pending.delivery_count += 1;
            claimed.push(LogEntry {
                offset: Offset::new(0, seq),
                bytes: state.entries[seq as usize].clone(),
                delivery_count: pending.delivery_count,
            });
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read_range() {
        let log = InMemoryLog::new();
        for i in 0..5u8 {
            log.append("s", vec![i]).await.unwrap();
        }
        let entries = log.read_range("s", Offset::new(0, 2), 10).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].bytes, vec![2]);
        assert_eq!(entries[0].offset, Offset::new(0, 2));
    }

    #[tokio::test]
    async fn test_group_read_marks_pending_until_ack() {
        let log = InMemoryLog::new();
        log.create_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        log.append("s", b"a".to_vec()).await.unwrap();

        let first = log
            .group_read("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].delivery_count, 1);

        // Not redelivered to normal reads while pending.
        let again = log
            .group_read("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(again.is_empty());

        // Claimable once idle.
        let claimed = log
            .claim_stale("s", "g", "c2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].delivery_count, 2);

        log.ack("s", "g", claimed[0].offset).await.unwrap();
        let after_ack = log
            .claim_stale("s", "g", "c3", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(after_ack.is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_min_idle() {
        let log = InMemoryLog::new();
        log.create_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();
        log.append("s", b"a".to_vec()).await.unwrap();
        log.group_read("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();

        let claimed = log
            .claim_stale("s", "g", "c2", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty(), "fresh pending entry must not be stolen");
    }

    #[tokio::test]
    async fn test_group_created_at_end_skips_history() {
        let log = InMemoryLog::new();
        log.append("s", b"old".to_vec()).await.unwrap();
        log.create_group("s", "g", GroupStart::End).await.unwrap();
        log.append("s", b"new".to_vec()).await.unwrap();

        let entries = log
            .group_read("s", "g", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bytes, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let log = std::sync::Arc::new(InMemoryLog::new());
        log.create_group("s", "g", GroupStart::Beginning)
            .await
            .unwrap();

        let reader = log.clone();
        let handle = tokio::spawn(async move {
            reader
                .group_read("s", "g", "c1", 1, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append("s", b"wake".to_vec()).await.unwrap();

        let entries = handle.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }
}
