//! # Message Bus Runtime
//!
//! Producer and consumer sides of the bus.
//!
//! Producers validate against the registry before every append and may only
//! write to streams they declared up front. Consumers read through consumer
//! groups with at-least-once delivery; the idempotency cache turns that into
//! effectively-once handler invocation. Handler outcomes are explicit values
//! (`Ok | Retryable | Fatal`); the runtime never relies on unwinding to
//! distinguish retriable from fatal.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;

use crate::dlq::{is_dlq_stream, wrap_dlq, wrap_validation_failure};
use crate::envelope::{Envelope, ValidationError};
use crate::idempotency::IdempotencyStore;
use crate::log::{GroupStart, LogEntry, Offset, StreamLog};
use crate::registry::SchemaRegistry;
use crate::retry::RetryPolicy;
use crate::{BusError, BusResult};

/// Create a shutdown signal pair shared by all long-running bus tasks.
pub fn shutdown_pair() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Publishing half of the bus.
///
/// A producer is constructed with the set of streams its owner declared; a
/// publish to any other stream is a configuration bug surfaced as
/// [`BusError::UnauthorizedStream`].
#[derive(Clone)]
pub struct Producer {
    log: Arc<dyn StreamLog>,
    registry: Arc<SchemaRegistry>,
    declared: Arc<HashSet<String>>,
}

impl Producer {
    pub fn new(
        log: Arc<dyn StreamLog>,
        registry: Arc<SchemaRegistry>,
        declared: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            log,
            registry,
            declared: Arc::new(declared.into_iter().collect()),
        }
    }

    pub fn declared_streams(&self) -> &HashSet<String> {
        &self.declared
    }

    /// Validate and append one envelope.
    ///
    /// Contract violations are raised to the caller, never silently
    /// swallowed; nothing is appended on failure.
    pub async fn publish(&self, stream: &str, envelope: &Envelope) -> BusResult<Offset> {
        if !self.declared.contains(stream) {
            return Err(BusError::UnauthorizedStream(stream.to_string()));
        }
        if envelope.schema != stream {
            return Err(BusError::Contract(ValidationError::StreamMismatch {
                stream: stream.to_string(),
                schema: envelope.schema.clone(),
            }));
        }

        let value = envelope.to_value()?;
        self.registry.validate(&value)?;
        let bytes =
            serde_json::to_vec(&value).map_err(|e| BusError::Serialization(e.to_string()))?;

        let offset = self.log.append(stream, bytes).await?;
        tracing::debug!(
            stream = %stream,
            event_id = %envelope.event_id,
            trace_id = %envelope.trace_id,
            offset = %offset,
            "event published"
        );
        Ok(offset)
    }

    /// Publish a batch. No all-or-nothing promise: each envelope gets its
    /// own result and partial appends can occur.
    pub async fn publish_batch(
        &self,
        stream: &str,
        envelopes: &[Envelope],
    ) -> Vec<BusResult<Offset>> {
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            results.push(self.publish(stream, envelope).await);
        }
        results
    }
}

/// Result of one handler invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    Ok,
    /// Transient failure; the bus redelivers up to `max_attempts`.
    Retryable(String),
    /// Permanent failure; the event goes straight to the DLQ.
    Fatal(String),
}

/// A consumer-side event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome;
}

/// Per-consumer configuration. Defaults follow the platform config keys.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    /// Total deliveries before an event is dead-lettered.
    pub max_attempts: u32,
    /// Pending entries idle beyond this are claimable by other consumers.
    pub visibility_timeout: Duration,
    /// Block time for one `group_read` call.
    pub block: Duration,
    /// Max entries fetched per read.
    pub batch: usize,
    /// Parallel handler invocations per consumer instance.
    pub concurrency: usize,
    pub handler_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub backoff: RetryPolicy,
}

impl ConsumerConfig {
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(30),
            block: Duration::from_secs(1),
            batch: 16,
            concurrency: 4,
            handler_timeout: Duration::from_secs(30),
            idempotency_ttl: Duration::from_secs(604_800),
            backoff: RetryPolicy::default(),
        }
    }
}

/// Consumer runtime: group reads, idempotent dispatch, retry accounting and
/// DLQ routing for one stream.
pub struct Consumer {
    log: Arc<dyn StreamLog>,
    registry: Arc<SchemaRegistry>,
    idempotency: Arc<dyn IdempotencyStore>,
    handler: Arc<dyn EventHandler>,
    cfg: ConsumerConfig,
    in_flight: Mutex<HashSet<String>>,
    shutdown: watch::Receiver<bool>,
}

impl Consumer {
    pub fn new(
        log: Arc<dyn StreamLog>,
        registry: Arc<SchemaRegistry>,
        idempotency: Arc<dyn IdempotencyStore>,
        handler: Arc<dyn EventHandler>,
        cfg: ConsumerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            log,
            registry,
            idempotency,
            handler,
            cfg,
            in_flight: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    /// Run until the shutdown signal flips.
    ///
    /// On shutdown the consumer stops reading; in-flight handlers complete
    /// (the service applies the grace period when joining the task) and
    /// anything still pending is claimed by a future worker.
    pub async fn run(mut self) -> BusResult<()> {
        self.log
            .create_group(&self.cfg.stream, &self.cfg.group, GroupStart::Beginning)
            .await?;
        tracing::info!(
            stream = %self.cfg.stream,
            group = %self.cfg.group,
            consumer = %self.cfg.consumer,
            "consumer started"
        );

        while !*self.shutdown.borrow() {
            let entries = self.next_batch().await?;
            if entries.is_empty() {
                continue;
            }

            let retry_backoff: Mutex<u32> = Mutex::new(0);
            let this = &self;
            futures::stream::iter(entries)
                .for_each_concurrent(this.cfg.concurrency.max(1), |entry| {
                    let retry_backoff = &retry_backoff;
                    async move {
                        if let Some(attempt) = this.process_entry(entry).await {
                            let mut hint =
                                retry_backoff.lock().unwrap_or_else(|e| e.into_inner());
                            *hint = (*hint).max(attempt);
                        }
                    }
                })
                .await;

            // Advisory backoff before the next claim when something failed
            // retryably this round.
            let failed_attempt = *retry_backoff.lock().unwrap_or_else(|e| e.into_inner());
            if failed_attempt > 0 {
                let delay = self.cfg.backoff.delay_for(failed_attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.changed() => {}
                }
            }
        }

        tracing::info!(
            stream = %self.cfg.stream,
            group = %self.cfg.group,
            "consumer stopped"
        );
        Ok(())
    }

    /// Stale claims first (redeliveries), then fresh reads.
    async fn next_batch(&self) -> BusResult<Vec<LogEntry>> {
        let claimed = self
            .log
            .claim_stale(
                &self.cfg.stream,
                &self.cfg.group,
                &self.cfg.consumer,
                self.cfg.visibility_timeout,
                self.cfg.batch,
            )
            .await?;
        if !claimed.is_empty() {
            return Ok(claimed);
        }
        self.log
            .group_read(
                &self.cfg.stream,
                &self.cfg.group,
                &self.cfg.consumer,
                self.cfg.batch,
                self.cfg.block,
            )
            .await
    }

    /// Process one delivery. Returns `Some(delivery_count)` when the entry
    /// was left pending for redelivery.
    async fn process_entry(&self, entry: LogEntry) -> Option<u32> {
        let envelope = match self.registry.validate_bytes(&entry.bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.route_invalid(&entry, &error).await;
                return None;
            }
        };

        match self
            .idempotency
            .seen(&self.cfg.group, &envelope.event_id)
            .await
        {
            Ok(true) => {
                tracing::debug!(
                    event_id = %envelope.event_id,
                    group = %self.cfg.group,
                    "duplicate event ignored (already processed)"
                );
                self.try_ack(entry.offset).await;
                return None;
            }
            Ok(false) => {}
            Err(error) => {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    error = %error,
                    "idempotency check failed, leaving entry pending"
                );
                return Some(entry.delivery_count);
            }
        }

        // Atomic per event_id: a concurrent delivery of the same event to
        // this consumer never reaches the handler twice.
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(envelope.event_id.clone()) {
                return None;
            }
        }

        let outcome = match tokio::time::timeout(
            self.cfg.handler_timeout,
            self.handler.handle(&envelope),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => HandlerOutcome::Retryable("handler timeout".to_string()),
        };

        let result = match outcome {
            HandlerOutcome::Ok => {
                if let Err(error) = self
                    .idempotency
                    .mark(&self.cfg.group, &envelope.event_id, self.cfg.idempotency_ttl)
                    .await
                {
                    // At-least-once still holds; worst case is one re-run.
                    tracing::warn!(
                        event_id = %envelope.event_id,
                        error = %error,
                        "failed to record idempotency mark"
                    );
                }
                self.try_ack(entry.offset).await;
                None
            }
            HandlerOutcome::Retryable(reason) if entry.delivery_count < self.cfg.max_attempts => {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    attempt = entry.delivery_count,
                    max_attempts = self.cfg.max_attempts,
                    reason = %reason,
                    "handler failed, awaiting redelivery"
                );
                Some(entry.delivery_count)
            }
            HandlerOutcome::Retryable(reason) => {
                self.route_failed(&entry, "HandlerRetryable", &reason).await;
                None
            }
            HandlerOutcome::Fatal(reason) => {
                self.route_failed(&entry, "HandlerFatal", &reason).await;
                None
            }
        };

        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&envelope.event_id);
        result
    }

    async fn route_invalid(&self, entry: &LogEntry, error: &ValidationError) {
        if is_dlq_stream(&self.cfg.stream) {
            // DLQ streams have no DLQ: log and drop.
            tracing::warn!(
                stream = %self.cfg.stream,
                offset = %entry.offset,
                error = %error,
                "invalid event on DLQ stream dropped"
            );
            self.try_ack(entry.offset).await;
            return;
        }
        let wrapped = wrap_validation_failure(
            &self.cfg.stream,
            entry.offset,
            &entry.bytes,
            error,
            entry.delivery_count,
        );
        self.publish_dlq(wrapped, entry.offset, error.kind()).await;
    }

    async fn route_failed(&self, entry: &LogEntry, error_kind: &str, detail: &str) {
        if is_dlq_stream(&self.cfg.stream) {
            tracing::warn!(
                stream = %self.cfg.stream,
                offset = %entry.offset,
                error = %detail,
                "failed event on DLQ stream dropped"
            );
            self.try_ack(entry.offset).await;
            return;
        }
        let wrapped = wrap_dlq(
            &self.cfg.stream,
            entry.offset,
            &entry.bytes,
            error_kind,
            detail,
            entry.delivery_count,
        );
        self.publish_dlq(wrapped, entry.offset, error_kind).await;
    }

    /// Append the wrapper, then ACK the original. If the DLQ append fails
    /// the original stays pending so nothing is lost.
    async fn publish_dlq(&self, wrapped: Envelope, original_offset: Offset, error_kind: &str) {
        let bytes = match wrapped.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                tracing::error!(
                    stream = %self.cfg.stream,
                    offset = %original_offset,
                    error = %error,
                    "could not encode DLQ envelope - leaving original pending"
                );
                return;
            }
        };
        match self.log.append(&wrapped.schema, bytes).await {
            Ok(_) => {
                tracing::error!(
                    stream = %self.cfg.stream,
                    dlq = %wrapped.schema,
                    offset = %original_offset,
                    trace_id = %wrapped.trace_id,
                    error_kind = %error_kind,
                    "event moved to DLQ"
                );
                self.try_ack(original_offset).await;
            }
            Err(error) => {
                tracing::error!(
                    stream = %self.cfg.stream,
                    offset = %original_offset,
                    error = %error,
                    "failed to write to DLQ - leaving original pending"
                );
            }
        }
    }

    async fn try_ack(&self, offset: Offset) {
        if let Err(error) = self.log.ack(&self.cfg.stream, &self.cfg.group, offset).await {
            tracing::warn!(
                stream = %self.cfg.stream,
                offset = %offset,
                error = %error,
                "ack failed; entry will be redelivered and deduplicated"
            );
        }
    }
}

/// Test helper: an [`EventHandler`] that replays a scripted queue of
/// outcomes and records every envelope it saw.
pub struct ScriptedHandler {
    outcomes: Mutex<VecDeque<HandlerOutcome>>,
    pub seen: Mutex<Vec<Envelope>>,
    default: HandlerOutcome,
}

impl ScriptedHandler {
    pub fn new(outcomes: impl IntoIterator<Item = HandlerOutcome>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
            default: HandlerOutcome::Ok,
        }
    }

    pub fn always_ok() -> Self {
        Self::new([])
    }

    pub fn invocations(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl EventHandler for ScriptedHandler {
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(envelope.clone());
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}
