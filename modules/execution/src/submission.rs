//! Submission state machine.
//!
//! Consumes approved intents from `risk.order.approved.v1` and drives each
//! through `RISK_APPROVED → SUBMITTING → SUBMITTED → (PARTIALLY_)FILLED`
//! with branches for rejection, cancellation and the ambiguous-send state
//! `SUBMIT_UNKNOWN`. Every transition is one store transaction covering
//! state, order/fill rows, outbox events and the inbox record.
//!
//! Duplicate deliveries stop at the inbox: an `intent_id` at or beyond
//! `RISK_APPROVED` never re-enters the machine; callers get the recorded
//! `(status, digest)` back instead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use event_bus::{streams, Envelope, EventHandler, HandlerOutcome};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::broker::{BrokerAdapter, BrokerError, BrokerFill, BrokerOrder, OrderRequest};
use crate::contracts::RiskOrderDecisionV1;
use crate::domain::{Fill, Intent, IntentState, Order};
use crate::store::{CommitOutcome, StoreError, SubmissionStore, Transition};

const QTY_EPSILON: f64 = 1e-9;

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid approval payload: {0}")]
    InvalidApproval(String),
}

/// What happened to one ingested approval event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Approved,
    Rejected,
    /// The inbox already held an outcome for this intent; nothing ran.
    Duplicate {
        status: IntentState,
        result_digest: String,
    },
}

/// Digest of an approval payload or terminal outcome, recorded in the inbox.
fn payload_digest(payload: &Value) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn outcome_digest(state: IntentState, detail: &str) -> String {
    format!(
        "{:x}",
        Sha256::digest(format!("{}|{detail}", state.as_str()).as_bytes())
    )
}

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

pub struct SubmissionMachine {
    store: Arc<dyn SubmissionStore>,
    broker: Arc<dyn BrokerAdapter>,
    worker_id: String,
    lease_ttl: Duration,
    max_submit_attempts: u32,
}

impl SubmissionMachine {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        broker: Arc<dyn BrokerAdapter>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            broker,
            worker_id: worker_id.into(),
            lease_ttl: Duration::from_millis(10_000),
            max_submit_attempts: 3,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_max_submit_attempts(mut self, attempts: u32) -> Self {
        self.max_submit_attempts = attempts;
        self
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }

    fn event(&self, schema: &str, trace_id: &str, payload: Value) -> Envelope {
        Envelope::new(schema, trace_id, payload).with_source_service("execution-service")
    }

    /// First contact with an approval event. Idempotent at the boundary:
    /// the inbox short-circuits repeated deliveries of the same intent.
    pub async fn ingest_approval(
        &self,
        envelope: &Envelope,
    ) -> Result<IngestOutcome, SubmissionError> {
        let decision: RiskOrderDecisionV1 = serde_json::from_value(envelope.payload.clone())
            .map_err(|e| SubmissionError::InvalidApproval(e.to_string()))?;
        let intent_id = decision.order.order_id.clone();
        if intent_id.trim().is_empty() {
            return Err(SubmissionError::InvalidApproval(
                "order.order_id must be non-empty".to_string(),
            ));
        }

        if let Some(existing) = self.store.inbox_get(&intent_id).await? {
            tracing::info!(
                intent_id = %intent_id,
                status = %existing.status.as_str(),
                "duplicate intent ignored, returning inbox outcome"
            );
            return Ok(IngestOutcome::Duplicate {
                status: existing.status,
                result_digest: existing.result_digest,
            });
        }

        let digest = payload_digest(&envelope.payload);
        let ts = now_ts();

        if !decision.can_trade {
            let intent = Intent {
                intent_id: intent_id.clone(),
                symbol: decision.symbol.clone(),
                side: decision.order.side,
                target_qty: decision.order.qty,
                approval: envelope.payload.clone(),
                state: IntentState::Rejected,
                attempt: 0,
                submit_attempt_id: None,
                lease_owner: None,
                lease_expires_at: None,
                halted: false,
                trace_id: envelope.trace_id.clone(),
            };
            let events = vec![self.event(
                streams::TRADE_INTENT_REJECTED_V1,
                &envelope.trace_id,
                json!({
                    "intent_id": intent_id,
                    "symbol": decision.symbol,
                    "ts": ts,
                    "reason": decision.reason,
                }),
            )];
            let inserted = self.store.insert_approved(&intent, &digest, &events).await?;
            return Ok(if inserted {
                IngestOutcome::Rejected
            } else {
                IngestOutcome::Duplicate {
                    status: IntentState::Rejected,
                    result_digest: digest,
                }
            });
        }

        let intent = Intent {
            intent_id: intent_id.clone(),
            symbol: decision.symbol.clone(),
            side: decision.order.side,
            target_qty: decision.order.qty,
            approval: envelope.payload.clone(),
            state: IntentState::RiskApproved,
            attempt: 0,
            submit_attempt_id: None,
            lease_owner: None,
            lease_expires_at: None,
            halted: false,
            trace_id: envelope.trace_id.clone(),
        };
        let events = vec![self.event(
            streams::TRADE_INTENT_APPROVED_V1,
            &envelope.trace_id,
            json!({
                "intent_id": intent_id,
                "symbol": decision.symbol,
                "ts": ts,
                "approval": envelope.payload,
            }),
        )];
        let inserted = self.store.insert_approved(&intent, &digest, &events).await?;
        Ok(if inserted {
            IngestOutcome::Approved
        } else {
            IngestOutcome::Duplicate {
                status: IntentState::RiskApproved,
                result_digest: digest,
            }
        })
    }

    /// One submit pass over everything in `RISK_APPROVED`.
    pub async fn submit_ready(&self) -> Result<(), SubmissionError> {
        for intent in self
            .store
            .intents_in(&[IntentState::RiskApproved])
            .await?
        {
            if intent.halted {
                continue;
            }
            if let Err(error) = self.submit_intent(&intent.intent_id).await {
                match &error {
                    SubmissionError::Store(StoreError::LeaseLost(_)) => {
                        tracing::debug!(intent_id = %intent.intent_id, "lease lost mid-submit")
                    }
                    _ => tracing::warn!(
                        intent_id = %intent.intent_id,
                        error = %error,
                        "submit pass failed for intent"
                    ),
                }
            }
        }
        Ok(())
    }

    /// Drive one intent from `RISK_APPROVED` through the broker send.
    pub async fn submit_intent(&self, intent_id: &str) -> Result<(), SubmissionError> {
        let Some(intent) = self
            .store
            .acquire_lease(intent_id, &self.worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(());
        };
        if intent.halted || intent.state != IntentState::RiskApproved {
            return Ok(());
        }

        let attempt = intent.attempt + 1;
        if attempt > self.max_submit_attempts {
            return self.reject_intent(
                &intent,
                "MAX_SUBMIT_ATTEMPTS",
                &format!("gave up after {} submit attempts", intent.attempt),
            )
            .await;
        }

        let order_id = format!("ord-{intent_id}");
        let limit_price = intent
            .approval
            .get("order")
            .and_then(|o| o.get("limit_price"))
            .and_then(Value::as_f64);
        let request = OrderRequest {
            intent_id: intent.intent_id.clone(),
            order_id: order_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            qty: intent.target_qty,
            limit_price,
            remark: format!("intent:{intent_id}"),
        };
        let request_hash = request.request_hash();
        let submit_attempt_id = event_bus::new_event_id();

        let existing = self.store.order_for_intent(intent_id).await?;
        let order = Order {
            order_id: order_id.clone(),
            intent_id: intent.intent_id.clone(),
            broker_order_id: existing.as_ref().and_then(|o| o.broker_order_id.clone()),
            request_hash: request_hash.clone(),
            cum_qty: existing.as_ref().map(|o| o.cum_qty).unwrap_or(0.0),
            target_qty: intent.target_qty,
            avg_price: existing.as_ref().map(|o| o.avg_price).unwrap_or(0.0),
        };

        let mut to_submitting =
            Transition::new(intent_id, &self.worker_id, IntentState::Submitting);
        to_submitting.attempt = Some(attempt);
        to_submitting.submit_attempt_id = Some(submit_attempt_id.clone());
        to_submitting.order = Some(order.clone());
        to_submitting.events.push(self.event(
            streams::TRADE_SUBMIT_STARTED_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent_id,
                "ts": now_ts(),
                "attempt": attempt,
                "submit_attempt_id": submit_attempt_id,
            }),
        ));
        self.store.commit(to_submitting).await?;

        match self.broker.place_order(&request).await {
            Ok(ack) => {
                let mut t = Transition::new(intent_id, &self.worker_id, IntentState::Submitted);
                t.order = Some(Order {
                    broker_order_id: Some(ack.broker_order_id.clone()),
                    ..order
                });
                t.events.push(self.event(
                    streams::TRADE_ORDER_SUBMITTED_V1,
                    &intent.trace_id,
                    json!({
                        "intent_id": intent_id,
                        "ts": now_ts(),
                        "order_id": order_id,
                        "broker_order_id": ack.broker_order_id,
                    }),
                ));
                self.store.commit(t).await?;
                tracing::info!(
                    intent_id = %intent_id,
                    broker_order_id = %ack.broker_order_id,
                    attempt = attempt,
                    "order submitted"
                );
            }
            Err(BrokerError::Rejected { code, message }) => {
                self.broker_reject(&intent, &order_id, &code, &message).await?;
            }
            Err(BrokerError::Unreachable(reason)) => {
                // The send is ambiguous: the order may exist broker-side.
                // Only the reconciler may move the intent out of this state.
                let mut t =
                    Transition::new(intent_id, &self.worker_id, IntentState::SubmitUnknown);
                t.events.push(self.event(
                    streams::TRADE_SUBMIT_UNKNOWN_V1,
                    &intent.trace_id,
                    json!({
                        "intent_id": intent_id,
                        "ts": now_ts(),
                        "order_id": order_id,
                        "request_hash": request_hash,
                        "reason": reason,
                    }),
                ));
                self.store.commit(t).await?;
                tracing::warn!(
                    intent_id = %intent_id,
                    reason = %reason,
                    "submit outcome unknown, awaiting reconciliation"
                );
            }
        }
        Ok(())
    }

    async fn broker_reject(
        &self,
        intent: &Intent,
        order_id: &str,
        code: &str,
        message: &str,
    ) -> Result<(), SubmissionError> {
        let ts = now_ts();
        let mut t = Transition::new(&intent.intent_id, &self.worker_id, IntentState::Rejected);
        t.clear_lease = true;
        t.inbox_digest = Some(outcome_digest(IntentState::Rejected, code));
        t.events.push(self.event(
            streams::TRADE_ORDER_REJECTED_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent.intent_id,
                "ts": ts,
                "order_id": order_id,
                "code": code,
                "message": message,
            }),
        ));
        t.events.push(self.event(
            streams::EXECUTION_ORDER_FAILED_V1,
            &intent.trace_id,
            json!({
                "order_id": order_id,
                "symbol": intent.symbol,
                "ts": ts,
                "status": "REJECTED",
                "filled_qty": 0.0,
                "avg_price": 0.0,
                "broker": self.broker.name(),
            }),
        ));
        self.store.commit(t).await?;
        tracing::warn!(
            intent_id = %intent.intent_id,
            code = %code,
            message = %message,
            "broker rejected order"
        );
        Ok(())
    }

    async fn reject_intent(
        &self,
        intent: &Intent,
        code: &str,
        message: &str,
    ) -> Result<(), SubmissionError> {
        self.broker_reject(intent, &format!("ord-{}", intent.intent_id), code, message)
            .await
    }

    /// Fill/cancel sweep over every broker-visible intent. Also used by the
    /// reconciler as its missed-fill backfill.
    pub async fn poll_fills(&self) -> Result<(), SubmissionError> {
        let intents = self
            .store
            .intents_in(&[
                IntentState::Submitted,
                IntentState::PartiallyFilled,
                IntentState::CancelPending,
            ])
            .await?;
        if intents.is_empty() {
            return Ok(());
        }

        let fills = match self.broker.fills_today().await {
            Ok(fills) => fills,
            Err(error) => {
                tracing::warn!(error = %error, "fill poll skipped, broker unreachable");
                return Ok(());
            }
        };
        let open = match self.broker.open_orders().await {
            Ok(open) => open,
            Err(error) => {
                tracing::warn!(error = %error, "order poll skipped, broker unreachable");
                return Ok(());
            }
        };

        for intent in intents {
            if intent.halted {
                continue;
            }
            if let Err(error) = self.poll_intent(&intent, &fills, &open).await {
                match &error {
                    SubmissionError::Store(StoreError::LeaseLost(_)) => {
                        tracing::debug!(intent_id = %intent.intent_id, "lease lost mid-poll")
                    }
                    _ => tracing::warn!(
                        intent_id = %intent.intent_id,
                        error = %error,
                        "fill poll failed for intent"
                    ),
                }
            }
        }
        Ok(())
    }

    async fn poll_intent(
        &self,
        intent: &Intent,
        fills: &[BrokerFill],
        open: &[BrokerOrder],
    ) -> Result<(), SubmissionError> {
        let Some(_) = self
            .store
            .acquire_lease(&intent.intent_id, &self.worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(());
        };
        let Some(order) = self.store.order_for_intent(&intent.intent_id).await? else {
            return Ok(());
        };
        let Some(broker_order_id) = order.broker_order_id.clone() else {
            return Ok(());
        };

        for fill in fills.iter().filter(|f| f.broker_order_id == broker_order_id) {
            self.apply_broker_fill(&intent.intent_id, fill).await?;
        }

        let Some(current) = self.store.intent(&intent.intent_id).await? else {
            return Ok(());
        };
        if current.state == IntentState::CancelPending {
            let cancelled = open
                .iter()
                .find(|o| o.broker_order_id == broker_order_id)
                .map(|o| o.status == "CANCELLED")
                .unwrap_or(false);
            if cancelled {
                self.finish_cancel(&current).await?;
            }
        }
        Ok(())
    }

    /// Record one broker fill, deduplicated by natural key. Caller must
    /// hold the intent lease.
    pub async fn apply_broker_fill(
        &self,
        intent_id: &str,
        fill: &BrokerFill,
    ) -> Result<(), SubmissionError> {
        let Some(intent) = self.store.intent(intent_id).await? else {
            return Ok(());
        };
        let Some(order) = self.store.order_for_intent(intent_id).await? else {
            return Ok(());
        };
        let Some(broker_order_id) = order.broker_order_id.clone() else {
            return Ok(());
        };

        let fill_key = Fill::natural_key(
            fill.fill_id.as_deref(),
            &broker_order_id,
            &fill.ts,
            fill.price,
            fill.qty,
        );

        if intent.state.is_terminal() {
            let known = self
                .store
                .fills_for_order(&order.order_id)
                .await?
                .iter()
                .any(|f| f.fill_key == fill_key);
            if !known {
                // A brand-new fill against a closed intent needs a human.
                // Terminal transitions released the lease, so take it back
                // for the escalation commit.
                if self
                    .store
                    .acquire_lease(intent_id, &self.worker_id, self.lease_ttl)
                    .await?
                    .is_some()
                {
                    self.raise_ambiguous(
                        &intent,
                        &format!("fill {fill_key} reported for terminal intent"),
                    )
                    .await?;
                }
            }
            return Ok(());
        }

        let new_cum = order.cum_qty + fill.qty;
        let filled = new_cum + QTY_EPSILON >= order.target_qty;
        let new_state = if filled {
            IntentState::Filled
        } else {
            IntentState::PartiallyFilled
        };
        let new_avg = if new_cum > 0.0 {
            (order.cum_qty * order.avg_price + fill.qty * fill.price) / new_cum
        } else {
            0.0
        };

        let ts = now_ts();
        let mut t = Transition::new(intent_id, &self.worker_id, new_state);
        t.fill = Some(Fill {
            fill_key: fill_key.clone(),
            order_id: order.order_id.clone(),
            qty: fill.qty,
            price: fill.price,
            ts: fill.ts.clone(),
        });
        t.order = Some(Order {
            cum_qty: new_cum,
            avg_price: new_avg,
            ..order.clone()
        });
        t.events.push(self.event(
            streams::TRADE_FILL_RECORDED_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent_id,
                "ts": ts,
                "order_id": order.order_id,
                "fill_key": fill_key,
                "qty": fill.qty,
                "price": fill.price,
                "cum_qty": new_cum,
            }),
        ));
        if filled {
            t.clear_lease = true;
            t.inbox_digest = Some(outcome_digest(
                IntentState::Filled,
                &format!("{new_cum}@{new_avg}"),
            ));
            t.events.push(self.event(
                streams::TRADE_ORDER_FILLED_V1,
                &intent.trace_id,
                json!({
                    "intent_id": intent_id,
                    "ts": ts,
                    "order_id": order.order_id,
                    "cum_qty": new_cum,
                    "avg_price": new_avg,
                }),
            ));
            t.events.push(self.event(
                streams::EXECUTION_ORDER_EXECUTED_V1,
                &intent.trace_id,
                json!({
                    "order_id": order.order_id,
                    "symbol": intent.symbol,
                    "ts": ts,
                    "status": "EXECUTED",
                    "filled_qty": new_cum,
                    "avg_price": new_avg,
                    "broker": self.broker.name(),
                }),
            ));
        }

        match self.store.commit(t).await {
            Ok(CommitOutcome::Applied) => {
                tracing::info!(
                    intent_id = %intent_id,
                    fill_key = %fill_key,
                    cum_qty = new_cum,
                    filled = filled,
                    "fill recorded"
                );
                Ok(())
            }
            Ok(CommitOutcome::DuplicateFill) => {
                tracing::debug!(
                    intent_id = %intent_id,
                    fill_key = %fill_key,
                    "duplicate fill discarded"
                );
                Ok(())
            }
            Err(StoreError::FillConflict(key)) => {
                self.raise_ambiguous(
                    &intent,
                    &format!("fill conflict on key {key}: qty/price mismatch"),
                )
                .await?;
                let mut halt = Transition::new(intent_id, &self.worker_id, intent.state);
                halt.halt = true;
                self.store.commit(halt).await?;
                tracing::error!(
                    intent_id = %intent_id,
                    fill_key = %key,
                    "fill conflict, intent halted for manual attention"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn raise_ambiguous(&self, intent: &Intent, reason: &str) -> Result<(), SubmissionError> {
        let mut t = Transition::new(&intent.intent_id, &self.worker_id, intent.state);
        t.events.push(self.event(
            streams::TRADE_RECONCILE_AMBIGUOUS_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent.intent_id,
                "ts": now_ts(),
                "reason": reason,
            }),
        ));
        self.store.commit(t).await?;
        Ok(())
    }

    /// Ask the broker to cancel a working order. Completion is observed by
    /// the fill poll when the broker reports the order cancelled.
    pub async fn request_cancel(&self, intent_id: &str) -> Result<bool, SubmissionError> {
        let Some(intent) = self
            .store
            .acquire_lease(intent_id, &self.worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(false);
        };
        if intent.halted
            || !matches!(
                intent.state,
                IntentState::Submitted | IntentState::PartiallyFilled
            )
        {
            return Ok(false);
        }
        let Some(order) = self.store.order_for_intent(intent_id).await? else {
            return Ok(false);
        };
        let Some(broker_order_id) = order.broker_order_id.clone() else {
            return Ok(false);
        };

        let cancel_request_id = event_bus::new_event_id();
        let mut t = Transition::new(intent_id, &self.worker_id, IntentState::CancelPending);
        t.events.push(self.event(
            streams::TRADE_CANCEL_REQUESTED_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent_id,
                "ts": now_ts(),
                "order_id": order.order_id,
                "cancel_request_id": cancel_request_id,
            }),
        ));
        self.store.commit(t).await?;

        if let Err(error) = self.broker.cancel_order(&broker_order_id).await {
            // Stay in CANCEL_PENDING; the poll/reconciler keeps watching.
            tracing::warn!(
                intent_id = %intent_id,
                error = %error,
                "cancel request not confirmed by broker"
            );
        }
        Ok(true)
    }

    async fn finish_cancel(&self, intent: &Intent) -> Result<(), SubmissionError> {
        let Some(order) = self.store.order_for_intent(&intent.intent_id).await? else {
            return Ok(());
        };
        let ts = now_ts();
        let mut t = Transition::new(&intent.intent_id, &self.worker_id, IntentState::Cancelled);
        t.clear_lease = true;
        t.inbox_digest = Some(outcome_digest(IntentState::Cancelled, &order.order_id));
        t.events.push(self.event(
            streams::TRADE_ORDER_CANCELLED_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent.intent_id,
                "ts": ts,
                "order_id": order.order_id,
            }),
        ));
        t.events.push(self.event(
            streams::EXECUTION_ORDER_FAILED_V1,
            &intent.trace_id,
            json!({
                "order_id": order.order_id,
                "symbol": intent.symbol,
                "ts": ts,
                "status": "CANCELLED",
                "filled_qty": order.cum_qty,
                "avg_price": order.avg_price,
                "broker": self.broker.name(),
            }),
        ));
        self.store.commit(t).await?;
        tracing::info!(intent_id = %intent.intent_id, "order cancelled");
        Ok(())
    }

    /// Reconciler decision: the broker does have our order. Backfill the
    /// mapping and advance; fills then flow through the normal dedup path.
    pub async fn reconcile_found(
        &self,
        intent_id: &str,
        broker_order: &BrokerOrder,
    ) -> Result<(), SubmissionError> {
        let Some(intent) = self
            .store
            .acquire_lease(intent_id, &self.worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(());
        };
        if intent.state != IntentState::SubmitUnknown {
            return Ok(());
        }
        let Some(order) = self.store.order_for_intent(intent_id).await? else {
            return Ok(());
        };

        // A broker id already mapped to a different order is an anomaly,
        // not a new order.
        if let Some(existing) = self
            .store
            .order_by_broker_id(&broker_order.broker_order_id)
            .await?
        {
            if existing.order_id != order.order_id {
                self.raise_ambiguous(
                    &intent,
                    &format!(
                        "broker order {} already mapped to {}",
                        broker_order.broker_order_id, existing.order_id
                    ),
                )
                .await?;
                return Ok(());
            }
        }

        let mut t = Transition::new(intent_id, &self.worker_id, IntentState::Submitted);
        t.order = Some(Order {
            broker_order_id: Some(broker_order.broker_order_id.clone()),
            ..order.clone()
        });
        t.events.push(self.event(
            streams::TRADE_RECONCILE_COMPLETED_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent_id,
                "ts": now_ts(),
                "order_id": order.order_id,
                "broker_order_id": broker_order.broker_order_id,
            }),
        ));
        self.store.commit(t).await?;
        tracing::info!(
            intent_id = %intent_id,
            broker_order_id = %broker_order.broker_order_id,
            "submit-unknown intent reconciled to broker order"
        );
        Ok(())
    }

    /// Reconciler decision: the broker confirmed the order never arrived.
    /// Re-queue for submission; the next submit pass increments the attempt.
    pub async fn reconcile_absent(&self, intent_id: &str) -> Result<(), SubmissionError> {
        let Some(intent) = self
            .store
            .acquire_lease(intent_id, &self.worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(());
        };
        if intent.state != IntentState::SubmitUnknown {
            return Ok(());
        }

        let mut t = Transition::new(intent_id, &self.worker_id, IntentState::RiskApproved);
        t.clear_lease = true;
        t.events.push(self.event(
            streams::TRADE_SUBMIT_RETRY_V1,
            &intent.trace_id,
            json!({
                "intent_id": intent_id,
                "ts": now_ts(),
                "attempt": intent.attempt + 1,
            }),
        ));
        self.store.commit(t).await?;
        tracing::info!(
            intent_id = %intent_id,
            next_attempt = intent.attempt + 1,
            "submit confirmed absent, re-queued for submission"
        );
        Ok(())
    }

    /// Reconciler escalation; leaves the state untouched.
    pub async fn reconcile_ambiguous(
        &self,
        intent_id: &str,
        reason: &str,
    ) -> Result<(), SubmissionError> {
        let Some(intent) = self
            .store
            .acquire_lease(intent_id, &self.worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(());
        };
        self.raise_ambiguous(&intent, reason).await
    }
}

/// Bus-facing adapter: turns approval deliveries into machine calls.
pub struct ApprovalHandler {
    machine: Arc<SubmissionMachine>,
}

impl ApprovalHandler {
    pub fn new(machine: Arc<SubmissionMachine>) -> Self {
        Self { machine }
    }
}

#[async_trait]
impl EventHandler for ApprovalHandler {
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        match self.machine.ingest_approval(envelope).await {
            Ok(IngestOutcome::Approved) => {
                // First submit attempt runs inline; the submit worker picks
                // up anything this pass leaves behind.
                if let Err(error) = self.machine.submit_ready().await {
                    tracing::warn!(error = %error, "inline submit pass failed");
                }
                HandlerOutcome::Ok
            }
            Ok(_) => HandlerOutcome::Ok,
            Err(SubmissionError::Store(error)) => HandlerOutcome::Retryable(error.to_string()),
            Err(error @ SubmissionError::InvalidApproval(_)) => {
                HandlerOutcome::Fatal(error.to_string())
            }
        }
    }
}

/// Background driver for submits, fills and cancel completion.
pub async fn run_submission_worker(
    machine: Arc<SubmissionMachine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(period_ms = period.as_millis() as u64, "submission worker started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = shutdown.changed() => {}
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(error) = machine.submit_ready().await {
            tracing::warn!(error = %error, "submit pass failed");
        }
        if let Err(error) = machine.poll_fills().await {
            tracing::warn!(error = %error, "fill poll failed");
        }
    }
    tracing::info!("submission worker stopped");
}
