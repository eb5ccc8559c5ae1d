//! Reconciliation worker.
//!
//! The only way out of `SUBMIT_UNKNOWN` is a decision made here: the broker
//! either has the order (backfill and advance) or confirms it never arrived
//! (re-queue for submission). Anything else stays put and escalates through
//! a rate-limited `trade.reconcile.ambiguous.v1` event, never a timer-based
//! guess.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::broker::{BrokerAdapter, BrokerOrder};
use crate::domain::{Intent, IntentState, Order};
use crate::store::SubmissionStore;
use crate::submission::{SubmissionError, SubmissionMachine};

#[derive(Debug)]
enum Decision {
    Found(BrokerOrder),
    Absent,
    Ambiguous(String),
}

/// Suppresses repeated escalation events per intent.
struct AlertRateLimiter {
    min_interval: Duration,
    last: Mutex<HashMap<String, Instant>>,
}

impl AlertRateLimiter {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(HashMap::new()),
        }
    }

    fn allow(&self, intent_id: &str) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        match last.get(intent_id) {
            Some(previous) if now.duration_since(*previous) < self.min_interval => false,
            _ => {
                last.insert(intent_id.to_string(), now);
                true
            }
        }
    }
}

pub struct Reconciler {
    store: Arc<dyn SubmissionStore>,
    broker: Arc<dyn BrokerAdapter>,
    machine: Arc<SubmissionMachine>,
    period: Duration,
    alerts: AlertRateLimiter,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        broker: Arc<dyn BrokerAdapter>,
        machine: Arc<SubmissionMachine>,
        period: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            machine,
            period,
            alerts: AlertRateLimiter::new(Duration::from_secs(60)),
        }
    }

    pub fn with_alert_interval(mut self, min_interval: Duration) -> Self {
        self.alerts = AlertRateLimiter::new(min_interval);
        self
    }

    /// One reconciliation pass: decide every `SUBMIT_UNKNOWN` intent, then
    /// sweep broker fills into `SUBMITTED`/`PARTIALLY_FILLED` intents.
    pub async fn pass(&self) -> Result<(), SubmissionError> {
        let unknown = self
            .store
            .intents_in(&[IntentState::SubmitUnknown])
            .await?;

        if !unknown.is_empty() {
            let open = self.broker.open_orders().await;
            for intent in unknown {
                if intent.halted {
                    continue;
                }
                let order = self.store.order_for_intent(&intent.intent_id).await?;
                let decision = match &open {
                    Ok(orders) => self.decide(&intent, order.as_ref(), orders),
                    Err(error) => Decision::Ambiguous(format!("broker query failed: {error}")),
                };
                self.act(&intent, decision).await?;
            }
        }

        // Sweep: backfill fills the normal poll may have missed.
        self.machine.poll_fills().await
    }

    fn decide(
        &self,
        intent: &Intent,
        order: Option<&Order>,
        broker_orders: &[BrokerOrder],
    ) -> Decision {
        let remark_tag = format!("intent:{}", intent.intent_id);

        // Already-mapped broker orders belong to other intents.
        let candidates: Vec<&BrokerOrder> = broker_orders
            .iter()
            .filter(|b| {
                order
                    .and_then(|o| o.broker_order_id.as_deref())
                    .map(|mapped| mapped == b.broker_order_id)
                    .unwrap_or(true)
            })
            .collect();

        let strong: Vec<&&BrokerOrder> = candidates
            .iter()
            .filter(|b| b.remark.contains(&remark_tag))
            .collect();
        match strong.len() {
            1 => return Decision::Found((*strong[0]).clone()),
            n if n > 1 => {
                return Decision::Ambiguous(format!(
                    "{n} broker orders carry remark {remark_tag}"
                ))
            }
            _ => {}
        }

        // Weak match on the order's observable shape.
        let weak: Vec<&&BrokerOrder> = candidates
            .iter()
            .filter(|b| {
                b.symbol == intent.symbol
                    && b.side == intent.side
                    && (b.qty - intent.target_qty).abs() < 1e-9
            })
            .collect();
        match weak.len() {
            0 => Decision::Absent,
            1 => Decision::Found((*weak[0]).clone()),
            n => Decision::Ambiguous(format!(
                "{n} broker orders match symbol/side/qty for {}",
                intent.intent_id
            )),
        }
    }

    async fn act(&self, intent: &Intent, decision: Decision) -> Result<(), SubmissionError> {
        match decision {
            Decision::Found(broker_order) => {
                tracing::info!(
                    intent_id = %intent.intent_id,
                    broker_order_id = %broker_order.broker_order_id,
                    "reconciler matched broker order"
                );
                self.machine
                    .reconcile_found(&intent.intent_id, &broker_order)
                    .await
            }
            Decision::Absent => {
                tracing::info!(
                    intent_id = %intent.intent_id,
                    "reconciler confirmed order absent"
                );
                self.machine.reconcile_absent(&intent.intent_id).await
            }
            Decision::Ambiguous(reason) => {
                if self.alerts.allow(&intent.intent_id) {
                    tracing::warn!(
                        intent_id = %intent.intent_id,
                        reason = %reason,
                        "reconciliation ambiguous, escalating"
                    );
                    self.machine
                        .reconcile_ambiguous(&intent.intent_id, &reason)
                        .await?;
                }
                Ok(())
            }
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            period_ms = self.period.as_millis() as u64,
            "reconciler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.period) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(error) = self.pass().await {
                tracing::warn!(error = %error, "reconciliation pass failed");
            }
        }
        tracing::info!("reconciler stopped");
    }
}
