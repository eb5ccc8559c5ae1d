//! Outbox relay.
//!
//! Lifecycle events are written to the outbox inside the same transaction
//! as the state change that caused them; this relay drains pending rows to
//! the stream log. Appends go through a whitelisting producer, so even
//! execution's own events are re-validated on the way out.

use std::sync::Arc;
use std::time::Duration;

use event_bus::{BusError, Envelope, Producer};
use tokio::sync::watch;

use crate::store::{StoreError, SubmissionStore};

const DRAIN_BATCH: usize = 100;

pub struct OutboxRelay {
    store: Arc<dyn SubmissionStore>,
    producer: Producer,
    period: Duration,
}

impl OutboxRelay {
    pub fn new(store: Arc<dyn SubmissionStore>, producer: Producer, period: Duration) -> Self {
        Self {
            store,
            producer,
            period,
        }
    }

    /// Drain one batch. Returns how many events were published.
    pub async fn drain_once(&self) -> Result<usize, StoreError> {
        let pending = self.store.outbox_pending(DRAIN_BATCH).await?;
        let mut published = 0usize;

        for record in pending {
            let envelope: Envelope = match serde_json::from_value(record.envelope.clone()) {
                Ok(envelope) => envelope,
                Err(error) => {
                    // An unparseable outbox row can never succeed; drop it
                    // rather than poison the relay.
                    tracing::error!(
                        outbox_id = record.id,
                        stream = %record.stream,
                        error = %error,
                        "unreadable outbox row dropped"
                    );
                    self.store.outbox_mark_published(record.id).await?;
                    continue;
                }
            };

            match self.producer.publish(&record.stream, &envelope).await {
                Ok(_) => {
                    self.store.outbox_mark_published(record.id).await?;
                    published += 1;
                }
                Err(BusError::StoreUnavailable(error)) => {
                    // Transient: stop the batch so ordering is preserved
                    // and retry on the next tick.
                    tracing::warn!(
                        outbox_id = record.id,
                        stream = %record.stream,
                        error = %error,
                        "outbox drain paused, store unavailable"
                    );
                    break;
                }
                Err(error) => {
                    tracing::error!(
                        outbox_id = record.id,
                        stream = %record.stream,
                        event_id = %envelope.event_id,
                        error = %error,
                        "outbox event rejected by contract, dropped"
                    );
                    self.store.outbox_mark_published(record.id).await?;
                }
            }
        }
        Ok(published)
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(period_ms = self.period.as_millis() as u64, "outbox relay started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(error) = self.drain_once().await {
                tracing::warn!(error = %error, "outbox drain failed");
            }
        }
        tracing::info!("outbox relay stopped");
    }
}
