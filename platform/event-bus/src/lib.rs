//! # Event Bus
//!
//! A platform-level abstraction for stream-based messaging between pipeline
//! stages.
//!
//! ## Why This Lives in Tier 1
//!
//! The event bus is a **shared runtime capability** that every stage depends
//! on. Placing it in `platform/` (Tier 1) allows:
//! - Stage modules to depend on platform crates without circular dependencies
//! - Plug-and-play stage development (stages don't depend on each other)
//! - Config-driven swap between Redis Streams (production) and InMemory
//!   (dev/test)
//!
//! ## Layers
//!
//! - **Contracts** ([`envelope`], [`registry`], [`streams`]): the envelope
//!   shape every event carries and the strict v1 payload rules per schema.
//! - **Log** ([`log`], [`InMemoryLog`], [`RedisLog`]): a narrow port over an
//!   append-only log with consumer-group semantics.
//! - **Runtime** ([`bus`], [`idempotency`], [`dlq`], [`retry`]): producer
//!   whitelisting, at-least-once consumption with idempotent dispatch, retry
//!   with attempt caps, and dead-letter routing.
//! - **Processor** ([`processor`]): the reusable host every pipeline stage
//!   wires its transform into.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{Envelope, InMemoryLog, Producer, SchemaRegistry, StreamLog};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log: Arc<dyn StreamLog> = Arc::new(InMemoryLog::new());
//! let registry = Arc::new(SchemaRegistry::with_core_streams());
//!
//! let producer = Producer::new(
//!     log.clone(),
//!     registry.clone(),
//!     ["perception.heartbeat.v1".to_string()],
//! );
//!
//! let event = Envelope::new(
//!     "perception.heartbeat.v1",
//!     "trace-1",
//!     serde_json::json!({"status": "OK"}),
//! );
//! producer.publish("perception.heartbeat.v1", &event).await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod dlq;
pub mod envelope;
pub mod idempotency;
pub mod inmemory_log;
pub mod log;
pub mod processor;
pub mod redis_log;
pub mod registry;
pub mod retry;
pub mod streams;

pub use bus::{Consumer, ConsumerConfig, EventHandler, HandlerOutcome, Producer};
pub use dlq::{dlq_stream, is_dlq_stream, wrap_dlq};
pub use envelope::{new_event_id, new_trace_id, Envelope, ValidationError};
pub use idempotency::{IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore};
pub use inmemory_log::InMemoryLog;
pub use log::{GroupStart, LogEntry, Offset, StreamLog};
pub use processor::{ProcessorBinding, StageContext, StageHandler, StageProcessor};
pub use redis_log::RedisLog;
pub use registry::{FieldKind, PayloadRules, SchemaRegistry};
pub use retry::{retry_with_backoff, RetryPolicy};

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The envelope or payload violates a registered contract. Surfaced to
    /// publishers synchronously; on the consumer side this routes to the DLQ.
    #[error("contract violation: {0}")]
    Contract(#[from] ValidationError),

    /// A producer attempted to write to a stream it never declared.
    #[error("stream not declared for this producer: {0}")]
    UnauthorizedStream(String),

    /// The backing store could not be reached. Transient; callers retry with
    /// backoff and exit with code 3 once the threshold is exceeded.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid stream name: {0}")]
    InvalidStream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Exit code for an unreachable store, so an orchestrator restarts the
/// process.
pub const EXIT_STORE_UNREACHABLE: i32 = 3;
