//! # Stream Log Abstraction
//!
//! A narrow port over a log-structured store: append, range read, and
//! consumer-group reads with pending-entry tracking. Nothing else; the
//! abstraction hides the concrete backing store so the runtime can swap
//! Redis Streams for the in-memory log in tests.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::BusResult;

/// Per-stream position, opaque to callers but orderable within a stream.
///
/// Shaped like a Redis stream ID (`<epoch_ms>-<seq>`); the in-memory log
/// uses `0-<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset {
    pub epoch_ms: u64,
    pub seq: u64,
}

impl Offset {
    pub const ZERO: Offset = Offset {
        epoch_ms: 0,
        seq: 0,
    };

    pub fn new(epoch_ms: u64, seq: u64) -> Self {
        Self { epoch_ms, seq }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.epoch_ms, self.seq)
    }
}

impl FromStr for Offset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("invalid offset: {s}"))?;
        Ok(Offset {
            epoch_ms: ms.parse().map_err(|_| format!("invalid offset: {s}"))?,
            seq: seq.parse().map_err(|_| format!("invalid offset: {s}"))?,
        })
    }
}

/// One stored entry handed to a reader.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub offset: Offset,
    pub bytes: Vec<u8>,
    /// How many times a consumer group has been handed this entry. 1 on
    /// first delivery; incremented by [`StreamLog::claim_stale`].
    pub delivery_count: u32,
}

/// Where a freshly created consumer group starts reading.
#[derive(Debug, Clone, Copy)]
pub enum GroupStart {
    Beginning,
    End,
    /// Deliver entries strictly after this offset (Redis last-delivered-id
    /// semantics).
    After(Offset),
}

/// The port every backing store implements.
///
/// `group_read` is the only routinely blocking call; everything else
/// completes without waiting on new data.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Durable single-entry append; returns the assigned offset.
    async fn append(&self, stream: &str, bytes: Vec<u8>) -> BusResult<Offset>;

    /// Range read starting at `from` (inclusive). Never touches
    /// consumer-group state; used for replay.
    async fn read_range(&self, stream: &str, from: Offset, limit: usize)
        -> BusResult<Vec<LogEntry>>;

    /// Idempotently create a consumer group on a stream.
    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> BusResult<()>;

    /// Read new entries for `consumer` within `group`; delivered entries
    /// become pending until acked. Blocks up to `block` when no data is
    /// available.
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<LogEntry>>;

    /// Remove an entry from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, offset: Offset) -> BusResult<()>;

    /// Steal pending entries whose owning consumer has been idle beyond
    /// `min_idle`, reassigning them to `consumer`.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> BusResult<Vec<LogEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_display_round_trip() {
        let offset = Offset::new(1735689600000, 7);
        let parsed: Offset = offset.to_string().parse().unwrap();
        assert_eq!(parsed, offset);
    }

    #[test]
    fn test_offset_ordering() {
        assert!(Offset::new(1, 0) > Offset::new(0, 99));
        assert!(Offset::new(5, 2) > Offset::new(5, 1));
        assert_eq!(Offset::ZERO, Offset::new(0, 0));
    }

    #[test]
    fn test_offset_parse_rejects_garbage() {
        assert!("not-an-offset".parse::<Offset>().is_err());
        assert!("12".parse::<Offset>().is_err());
    }
}
