//! Submission store port and the in-memory implementation.
//!
//! Every state transition is one atomic commit covering the intent row, the
//! order/fill rows it touches, the outbox rows for its lifecycle events and
//! the inbox update. There are no cross-intent transactions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_bus::Envelope;

use crate::domain::{Fill, InboxRecord, Intent, IntentState, Order, OutboxRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The caller's lease no longer covers the intent. Abort without
    /// mutation; the next lease holder picks the work up.
    #[error("lease lost for intent {0}")]
    LeaseLost(String),

    /// A fill with an existing natural key but different `(qty, price)`.
    #[error("conflicting fill for key {0}")]
    FillConflict(String),

    #[error("constraint violation: {0}")]
    Conflict(String),

    #[error("unknown intent {0}")]
    UnknownIntent(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One atomic state transition.
pub struct Transition {
    pub intent_id: String,
    /// Must match the current lease holder.
    pub lease_owner: String,
    pub state: IntentState,
    pub attempt: Option<u32>,
    pub submit_attempt_id: Option<String>,
    /// Upsert of the intent's order row.
    pub order: Option<Order>,
    /// Fill insert, deduplicated by natural key.
    pub fill: Option<Fill>,
    /// Halt the intent (fill conflict); state is left as-is by callers that
    /// set this.
    pub halt: bool,
    /// Lifecycle events enqueued to the outbox within the same commit.
    pub events: Vec<Envelope>,
    /// New inbox digest, when the externally observable outcome changed.
    pub inbox_digest: Option<String>,
    /// Release the lease as part of the commit (terminal transitions).
    pub clear_lease: bool,
}

impl Transition {
    pub fn new(intent_id: &str, lease_owner: &str, state: IntentState) -> Self {
        Self {
            intent_id: intent_id.to_string(),
            lease_owner: lease_owner.to_string(),
            state,
            attempt: None,
            submit_attempt_id: None,
            order: None,
            fill: None,
            halt: false,
            events: Vec::new(),
            inbox_digest: None,
            clear_lease: false,
        }
    }
}

/// What a commit did with its fill, when it carried one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied,
    /// The fill's natural key already existed with matching `(qty, price)`;
    /// the whole transition was skipped.
    DuplicateFill,
}

/// Transactional persistence port for the submission state machine.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn inbox_get(&self, intent_id: &str) -> Result<Option<InboxRecord>, StoreError>;

    /// First-time ingestion: intent + inbox + outbox in one transaction.
    /// Returns false (and writes nothing) when the intent already exists.
    async fn insert_approved(
        &self,
        intent: &Intent,
        digest: &str,
        events: &[Envelope],
    ) -> Result<bool, StoreError>;

    /// Conditional lease acquisition: succeeds when the lease is free,
    /// expired, or already held by `owner`. Returns the current intent row
    /// under the fresh lease, or None when another worker holds it.
    async fn acquire_lease(
        &self,
        intent_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Intent>, StoreError>;

    /// Apply one transition atomically. Verifies the lease, deduplicates
    /// the fill, upserts the order, appends outbox rows and updates the
    /// inbox.
    async fn commit(&self, transition: Transition) -> Result<CommitOutcome, StoreError>;

    async fn intent(&self, intent_id: &str) -> Result<Option<Intent>, StoreError>;

    async fn intents_in(&self, states: &[IntentState]) -> Result<Vec<Intent>, StoreError>;

    async fn order_for_intent(&self, intent_id: &str) -> Result<Option<Order>, StoreError>;

    async fn order_by_broker_id(&self, broker_order_id: &str)
        -> Result<Option<Order>, StoreError>;

    async fn fills_for_order(&self, order_id: &str) -> Result<Vec<Fill>, StoreError>;

    async fn outbox_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError>;

    async fn outbox_mark_published(&self, id: i64) -> Result<(), StoreError>;
}

/// In-memory store for tests and single-process development. A single
/// mutex makes every operation trivially atomic.
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    intents: HashMap<String, Intent>,
    orders: HashMap<String, Order>,
    order_by_intent: HashMap<String, String>,
    order_by_broker: HashMap<String, String>,
    fills: HashMap<String, Fill>,
    fills_by_order: HashMap<String, Vec<String>>,
    inbox: HashMap<String, InboxRecord>,
    outbox: Vec<OutboxRecord>,
    next_outbox_id: i64,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_outbox_id: 1,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lease_valid(intent: &Intent, owner: &str, now: DateTime<Utc>) -> bool {
    intent.lease_owner.as_deref() == Some(owner)
        && intent.lease_expires_at.map(|at| at > now).unwrap_or(false)
}

#[async_trait]
impl SubmissionStore for MemStore {
    async fn inbox_get(&self, intent_id: &str) -> Result<Option<InboxRecord>, StoreError> {
        Ok(self.lock().inbox.get(intent_id).cloned())
    }

    async fn insert_approved(
        &self,
        intent: &Intent,
        digest: &str,
        events: &[Envelope],
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        if inner.intents.contains_key(&intent.intent_id) {
            return Ok(false);
        }
        inner
            .intents
            .insert(intent.intent_id.clone(), intent.clone());
        inner.inbox.insert(
            intent.intent_id.clone(),
            InboxRecord {
                intent_id: intent.intent_id.clone(),
                status: intent.state,
                result_digest: digest.to_string(),
            },
        );
        for event in events {
            push_outbox(&mut inner, event)?;
        }
        Ok(true)
    }

    async fn acquire_lease(
        &self,
        intent_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Intent>, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let intent = inner
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| StoreError::UnknownIntent(intent_id.to_string()))?;

        let free = match (&intent.lease_owner, intent.lease_expires_at) {
            (Some(current), Some(expires)) => current == owner || expires <= now,
            _ => true,
        };
        if !free {
            return Ok(None);
        }
        intent.lease_owner = Some(owner.to_string());
        intent.lease_expires_at = Some(
            now + chrono::Duration::from_std(ttl)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        );
        Ok(Some(intent.clone()))
    }

    async fn commit(&self, transition: Transition) -> Result<CommitOutcome, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();

        let current = inner
            .intents
            .get(&transition.intent_id)
            .ok_or_else(|| StoreError::UnknownIntent(transition.intent_id.clone()))?;
        if !lease_valid(current, &transition.lease_owner, now) {
            return Err(StoreError::LeaseLost(transition.intent_id.clone()));
        }

        // Fill dedup decides whether the transition applies at all.
        if let Some(fill) = &transition.fill {
            if let Some(existing) = inner.fills.get(&fill.fill_key) {
                if existing.qty == fill.qty && existing.price == fill.price {
                    return Ok(CommitOutcome::DuplicateFill);
                }
                return Err(StoreError::FillConflict(fill.fill_key.clone()));
            }
        }

        if let Some(order) = &transition.order {
            if let Some(broker_id) = &order.broker_order_id {
                if let Some(other) = inner.order_by_broker.get(broker_id) {
                    if other != &order.order_id {
                        return Err(StoreError::Conflict(format!(
                            "broker_order_id {broker_id} already mapped to order {other}"
                        )));
                    }
                }
                inner
                    .order_by_broker
                    .insert(broker_id.clone(), order.order_id.clone());
            }
            inner
                .order_by_intent
                .insert(order.intent_id.clone(), order.order_id.clone());
            inner.orders.insert(order.order_id.clone(), order.clone());
        }

        if let Some(fill) = transition.fill {
            inner.fills.insert(fill.fill_key.clone(), fill.clone());
            inner
                .fills_by_order
                .entry(fill.order_id.clone())
                .or_default()
                .push(fill.fill_key);
        }

        for event in &transition.events {
            push_outbox(&mut inner, event)?;
        }

        if let Some(digest) = &transition.inbox_digest {
            inner.inbox.insert(
                transition.intent_id.clone(),
                InboxRecord {
                    intent_id: transition.intent_id.clone(),
                    status: transition.state,
                    result_digest: digest.clone(),
                },
            );
        } else if let Some(record) = inner.inbox.get_mut(&transition.intent_id) {
            record.status = transition.state;
        }

        let intent = inner
            .intents
            .get_mut(&transition.intent_id)
            .ok_or_else(|| StoreError::UnknownIntent(transition.intent_id.clone()))?;
        intent.state = transition.state;
        if let Some(attempt) = transition.attempt {
            intent.attempt = attempt;
        }
        if let Some(id) = transition.submit_attempt_id {
            intent.submit_attempt_id = Some(id);
        }
        if transition.halt {
            intent.halted = true;
        }
        if transition.clear_lease {
            intent.lease_owner = None;
            intent.lease_expires_at = None;
        }

        Ok(CommitOutcome::Applied)
    }

    async fn intent(&self, intent_id: &str) -> Result<Option<Intent>, StoreError> {
        Ok(self.lock().intents.get(intent_id).cloned())
    }

    async fn intents_in(&self, states: &[IntentState]) -> Result<Vec<Intent>, StoreError> {
        let inner = self.lock();
        let mut intents: Vec<Intent> = inner
            .intents
            .values()
            .filter(|i| states.contains(&i.state))
            .cloned()
            .collect();
        intents.sort_by(|a, b| a.intent_id.cmp(&b.intent_id));
        Ok(intents)
    }

    async fn order_for_intent(&self, intent_id: &str) -> Result<Option<Order>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .order_by_intent
            .get(intent_id)
            .and_then(|order_id| inner.orders.get(order_id))
            .cloned())
    }

    async fn order_by_broker_id(
        &self,
        broker_order_id: &str,
    ) -> Result<Option<Order>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .order_by_broker
            .get(broker_order_id)
            .and_then(|order_id| inner.orders.get(order_id))
            .cloned())
    }

    async fn fills_for_order(&self, order_id: &str) -> Result<Vec<Fill>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .fills_by_order
            .get(order_id)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| inner.fills.get(key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn outbox_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .outbox
            .iter()
            .filter(|record| record.published_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn outbox_mark_published(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(record) = inner.outbox.iter_mut().find(|r| r.id == id) {
            record.published_at = Some(Utc::now());
        }
        Ok(())
    }
}

fn push_outbox(inner: &mut Inner, event: &Envelope) -> Result<(), StoreError> {
    let envelope = event
        .to_value()
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let id = inner.next_outbox_id;
    inner.next_outbox_id += 1;
    inner.outbox.push(OutboxRecord {
        id,
        stream: event.schema.clone(),
        envelope,
        created_at: Utc::now(),
        published_at: None,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Side;
    use serde_json::json;

    fn intent(id: &str) -> Intent {
        Intent {
            intent_id: id.to_string(),
            symbol: "600000.SH".to_string(),
            side: Side::Buy,
            target_qty: 100.0,
            approval: json!({}),
            state: IntentState::RiskApproved,
            attempt: 0,
            submit_attempt_id: None,
            lease_owner: None,
            lease_expires_at: None,
            halted: false,
            trace_id: "trace-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_approved_is_idempotent() {
        let store = MemStore::new();
        assert!(store.insert_approved(&intent("i1"), "d1", &[]).await.unwrap());
        assert!(!store.insert_approved(&intent("i1"), "d1", &[]).await.unwrap());
        let inbox = store.inbox_get("i1").await.unwrap().unwrap();
        assert_eq!(inbox.result_digest, "d1");
    }

    #[tokio::test]
    async fn test_lease_exclusivity() {
        let store = MemStore::new();
        store.insert_approved(&intent("i1"), "d1", &[]).await.unwrap();

        let ttl = Duration::from_secs(30);
        assert!(store.acquire_lease("i1", "w1", ttl).await.unwrap().is_some());
        assert!(
            store.acquire_lease("i1", "w2", ttl).await.unwrap().is_none(),
            "second worker must not steal a live lease"
        );
        // Re-entrant for the same owner.
        assert!(store.acquire_lease("i1", "w1", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_is_acquirable() {
        let store = MemStore::new();
        store.insert_approved(&intent("i1"), "d1", &[]).await.unwrap();
        store
            .acquire_lease("i1", "w1", Duration::ZERO)
            .await
            .unwrap();
        assert!(store
            .acquire_lease("i1", "w2", Duration::from_secs(30))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_commit_without_lease_is_rejected() {
        let store = MemStore::new();
        store.insert_approved(&intent("i1"), "d1", &[]).await.unwrap();

        let result = store
            .commit(Transition::new("i1", "nobody", IntentState::Submitting))
            .await;
        assert!(matches!(result, Err(StoreError::LeaseLost(_))));

        // The failed commit must not have mutated the intent.
        let stored = store.intent("i1").await.unwrap().unwrap();
        assert_eq!(stored.state, IntentState::RiskApproved);
    }

    #[tokio::test]
    async fn test_fill_dedup_and_conflict() {
        let store = MemStore::new();
        store.insert_approved(&intent("i1"), "d1", &[]).await.unwrap();
        store
            .acquire_lease("i1", "w1", Duration::from_secs(30))
            .await
            .unwrap();

        let fill = Fill {
            fill_key: "F-1".to_string(),
            order_id: "ord-i1".to_string(),
            qty: 50.0,
            price: 10.5,
            ts: "2026-01-01T10:00:00+08:00".to_string(),
        };

        let mut first = Transition::new("i1", "w1", IntentState::PartiallyFilled);
        first.fill = Some(fill.clone());
        assert_eq!(store.commit(first).await.unwrap(), CommitOutcome::Applied);

        // Same key, same (qty, price): silently discarded.
        let mut duplicate = Transition::new("i1", "w1", IntentState::Filled);
        duplicate.fill = Some(fill.clone());
        assert_eq!(
            store.commit(duplicate).await.unwrap(),
            CommitOutcome::DuplicateFill
        );
        assert_eq!(
            store.intent("i1").await.unwrap().unwrap().state,
            IntentState::PartiallyFilled,
            "duplicate fill must not advance state"
        );

        // Same key, conflicting quantities: FillConflict.
        let mut conflicting = Transition::new("i1", "w1", IntentState::Filled);
        conflicting.fill = Some(Fill { qty: 60.0, ..fill });
        assert!(matches!(
            store.commit(conflicting).await,
            Err(StoreError::FillConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_broker_order_id_is_a_conflict() {
        let store = MemStore::new();
        store.insert_approved(&intent("i1"), "d1", &[]).await.unwrap();
        store.insert_approved(&intent("i2"), "d2", &[]).await.unwrap();
        store
            .acquire_lease("i1", "w1", Duration::from_secs(30))
            .await
            .unwrap();
        store
            .acquire_lease("i2", "w1", Duration::from_secs(30))
            .await
            .unwrap();

        let order = |order_id: &str, intent_id: &str| Order {
            order_id: order_id.to_string(),
            intent_id: intent_id.to_string(),
            broker_order_id: Some("B-1".to_string()),
            request_hash: "h".to_string(),
            cum_qty: 0.0,
            target_qty: 100.0,
            avg_price: 0.0,
        };

        let mut first = Transition::new("i1", "w1", IntentState::Submitted);
        first.order = Some(order("ord-i1", "i1"));
        store.commit(first).await.unwrap();

        let mut second = Transition::new("i2", "w1", IntentState::Submitted);
        second.order = Some(order("ord-i2", "i2"));
        assert!(matches!(
            store.commit(second).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_outbox_drain_cycle() {
        let store = MemStore::new();
        let event = Envelope::new(
            event_bus::streams::TRADE_INTENT_APPROVED_V1,
            "trace-1",
            json!({
                "intent_id": "i1",
                "symbol": "600000.SH",
                "ts": "2026-01-01T10:00:00+08:00",
                "approval": {}
            }),
        );
        store
            .insert_approved(&intent("i1"), "d1", &[event])
            .await
            .unwrap();

        let pending = store.outbox_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].stream, event_bus::streams::TRADE_INTENT_APPROVED_V1);

        store.outbox_mark_published(pending[0].id).await.unwrap();
        assert!(store.outbox_pending(10).await.unwrap().is_empty());
    }
}
