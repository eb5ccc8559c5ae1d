//! The one-way forwarder.
//!
//! Reads whitelisted approval streams from the compute plane as consumer
//! group `trade-bridge`, re-validates every envelope against the shared
//! registry, and appends verbatim (event_id preserved) to the identically
//! named stream on the trade plane. The bridge is the only component that
//! holds both planes' credentials; it keeps no state beyond its
//! consumer-group cursor.

use std::sync::Arc;
use std::time::Duration;

use event_bus::{
    dlq, retry_with_backoff, GroupStart, LogEntry, RetryPolicy, SchemaRegistry, StreamLog,
    ValidationError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::metrics::Metrics;

#[derive(Clone)]
pub struct BridgeSettings {
    pub group: String,
    pub consumer: String,
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub block: Duration,
    pub batch: usize,
    pub backoff: RetryPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            group: "trade-bridge".to_string(),
            consumer: "trade-bridge-1".to_string(),
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(30),
            block: Duration::from_secs(1),
            batch: 16,
            backoff: RetryPolicy::default(),
        }
    }
}

pub struct TradeBridge {
    compute: Arc<dyn StreamLog>,
    trade: Arc<dyn StreamLog>,
    registry: Arc<SchemaRegistry>,
    whitelist: Vec<String>,
    metrics: Metrics,
    settings: BridgeSettings,
}

impl TradeBridge {
    pub fn new(
        compute: Arc<dyn StreamLog>,
        trade: Arc<dyn StreamLog>,
        registry: Arc<SchemaRegistry>,
        whitelist: Vec<String>,
        metrics: Metrics,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            compute,
            trade,
            registry,
            whitelist,
            metrics,
            settings,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// One read-validate-forward round over a single stream. Returns the
    /// number of entries handled.
    pub async fn forward_once(&self, stream: &str) -> event_bus::BusResult<usize> {
        let claimed = self
            .compute
            .claim_stale(
                stream,
                &self.settings.group,
                &self.settings.consumer,
                self.settings.visibility_timeout,
                self.settings.batch,
            )
            .await?;
        let entries = if claimed.is_empty() {
            self.compute
                .group_read(
                    stream,
                    &self.settings.group,
                    &self.settings.consumer,
                    self.settings.batch,
                    self.settings.block,
                )
                .await?
        } else {
            claimed
        };

        let handled = entries.len();
        for entry in entries {
            self.forward_entry(stream, entry).await;
        }
        Ok(handled)
    }

    async fn forward_entry(&self, stream: &str, entry: LogEntry) {
        // Defense in depth: the bridge trusts nothing the compute plane
        // hands it, even on a whitelisted stream.
        let verdict = self
            .registry
            .validate_bytes(&entry.bytes)
            .and_then(|envelope| {
                if envelope.schema == stream {
                    Ok(envelope)
                } else {
                    Err(ValidationError::StreamMismatch {
                        stream: stream.to_string(),
                        schema: envelope.schema,
                    })
                }
            });

        let envelope = match verdict {
            Ok(envelope) => envelope,
            Err(error) => {
                self.reject_entry(stream, &entry, &error).await;
                return;
            }
        };

        // Belt and braces; streams outside the whitelist are never read.
        if !self.whitelist.iter().any(|s| s == stream) {
            self.metrics
                .bridge_skipped_total
                .with_label_values(&[stream])
                .inc();
            self.ack(stream, entry.offset).await;
            return;
        }

        let attempts = std::sync::atomic::AtomicU32::new(0);
        let append = retry_with_backoff(
            || {
                if attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed) > 0 {
                    self.metrics
                        .bridge_append_retry_total
                        .with_label_values(&[stream])
                        .inc();
                }
                self.trade.append(stream, entry.bytes.clone())
            },
            &self.settings.backoff,
            self.settings.max_attempts,
            "bridge_forward",
        )
        .await;

        match append {
            Ok(offset) => {
                self.metrics
                    .bridge_forwarded_total
                    .with_label_values(&[stream])
                    .inc();
                tracing::info!(
                    stream = %stream,
                    event_id = %envelope.event_id,
                    trace_id = %envelope.trace_id,
                    trade_offset = %offset,
                    "event forwarded to trade plane"
                );
                self.ack(stream, entry.offset).await;
            }
            Err(error) => {
                if entry.delivery_count >= self.settings.max_attempts {
                    // Persistent trade-plane failure: dead-letter on the
                    // compute plane so the entry is never lost.
                    self.reject_entry(
                        stream,
                        &entry,
                        &ValidationError::Malformed(format!(
                            "trade plane append failed: {error}"
                        )),
                    )
                    .await;
                } else {
                    tracing::warn!(
                        stream = %stream,
                        offset = %entry.offset,
                        error = %error,
                        "trade plane unavailable, entry stays pending"
                    );
                }
            }
        }
    }

    async fn reject_entry(&self, stream: &str, entry: &LogEntry, error: &ValidationError) {
        self.metrics
            .bridge_rejected_total
            .with_label_values(&[stream, error.kind()])
            .inc();

        let wrapped = dlq::wrap_validation_failure(
            stream,
            entry.offset,
            &entry.bytes,
            error,
            entry.delivery_count,
        );
        let bytes = match wrapped.encode() {
            Ok(bytes) => bytes,
            Err(encode_error) => {
                tracing::error!(
                    stream = %stream,
                    offset = %entry.offset,
                    error = %encode_error,
                    "could not encode bridge DLQ envelope"
                );
                return;
            }
        };
        match self.compute.append(&wrapped.schema, bytes).await {
            Ok(_) => {
                tracing::error!(
                    stream = %stream,
                    offset = %entry.offset,
                    error = %error,
                    "event rejected at the bridge, moved to compute-plane DLQ"
                );
                self.ack(stream, entry.offset).await;
            }
            Err(dlq_error) => {
                tracing::error!(
                    stream = %stream,
                    offset = %entry.offset,
                    error = %error,
                    dlq_error = %dlq_error,
                    "failed to write bridge DLQ, entry stays pending"
                );
            }
        }
    }

    async fn ack(&self, stream: &str, offset: event_bus::Offset) {
        if let Err(error) = self
            .compute
            .ack(stream, &self.settings.group, offset)
            .await
        {
            tracing::warn!(
                stream = %stream,
                offset = %offset,
                error = %error,
                "bridge ack failed; entry will be redelivered"
            );
        }
    }

    /// Spawn one forwarding task per whitelisted stream.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for stream in self.whitelist.clone() {
            let bridge = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                if let Err(error) = bridge
                    .compute
                    .create_group(&stream, &bridge.settings.group, GroupStart::Beginning)
                    .await
                {
                    tracing::error!(stream = %stream, error = %error, "bridge group create failed");
                    return;
                }
                tracing::info!(stream = %stream, "bridge forwarding started");
                while !*shutdown.borrow() {
                    if let Err(error) = bridge.forward_once(&stream).await {
                        tracing::warn!(stream = %stream, error = %error, "bridge round failed");
                        tokio::time::sleep(bridge.settings.backoff.base).await;
                    }
                }
                tracing::info!(stream = %stream, "bridge forwarding stopped");
            }));
        }
        handles
    }
}
