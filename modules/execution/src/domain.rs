//! Trade-domain entities: intent, order, fill, inbox and outbox records.
//!
//! Entities are rows keyed by stable IDs; the only links between them are
//! those IDs. State lives in the store, never in an in-memory object graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::contracts::Side;

/// Intent lifecycle states.
///
/// `Filled`, `Cancelled` and `Rejected` are terminal; nothing transitions
/// out of them. `SubmitUnknown` may only be left by a reconciliation
/// decision, never by a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentState {
    New,
    RiskApproved,
    Submitting,
    SubmitUnknown,
    Submitted,
    PartiallyFilled,
    Filled,
    CancelPending,
    Cancelled,
    Rejected,
}

impl IntentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Filled | IntentState::Cancelled | IntentState::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::New => "NEW",
            IntentState::RiskApproved => "RISK_APPROVED",
            IntentState::Submitting => "SUBMITTING",
            IntentState::SubmitUnknown => "SUBMIT_UNKNOWN",
            IntentState::Submitted => "SUBMITTED",
            IntentState::PartiallyFilled => "PARTIALLY_FILLED",
            IntentState::Filled => "FILLED",
            IntentState::CancelPending => "CANCEL_PENDING",
            IntentState::Cancelled => "CANCELLED",
            IntentState::Rejected => "REJECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<IntentState> {
        match raw {
            "NEW" => Some(IntentState::New),
            "RISK_APPROVED" => Some(IntentState::RiskApproved),
            "SUBMITTING" => Some(IntentState::Submitting),
            "SUBMIT_UNKNOWN" => Some(IntentState::SubmitUnknown),
            "SUBMITTED" => Some(IntentState::Submitted),
            "PARTIALLY_FILLED" => Some(IntentState::PartiallyFilled),
            "FILLED" => Some(IntentState::Filled),
            "CANCEL_PENDING" => Some(IntentState::CancelPending),
            "CANCELLED" => Some(IntentState::Cancelled),
            "REJECTED" => Some(IntentState::Rejected),
            _ => None,
        }
    }
}

/// An approved trade working its way to the broker.
#[derive(Debug, Clone)]
pub struct Intent {
    pub intent_id: String,
    pub symbol: String,
    pub side: Side,
    pub target_qty: f64,
    /// Full risk decision payload at approval time.
    pub approval: Value,
    pub state: IntentState,
    /// Number of submit attempts performed so far.
    pub attempt: u32,
    pub submit_attempt_id: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Set on `FillConflict`; a halted intent is skipped by every worker
    /// until a human intervenes.
    pub halted: bool,
    /// Trace inherited from the approval event, propagated to every
    /// lifecycle event this intent emits.
    pub trace_id: String,
}

/// Broker-visible instance of an intent.
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub intent_id: String,
    pub broker_order_id: Option<String>,
    /// SHA-256 over the canonical order request; the reconciler's match key.
    pub request_hash: String,
    pub cum_qty: f64,
    pub target_qty: f64,
    pub avg_price: f64,
}

/// One (partial) execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Fill {
    pub fill_key: String,
    pub order_id: String,
    pub qty: f64,
    pub price: f64,
    pub ts: String,
}

impl Fill {
    /// Natural key: the broker fill id when present, otherwise
    /// `(broker_order_id, ts, px, qty)`.
    pub fn natural_key(
        broker_fill_id: Option<&str>,
        broker_order_id: &str,
        ts: &str,
        price: f64,
        qty: f64,
    ) -> String {
        match broker_fill_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("{broker_order_id}|{ts}|{price}|{qty}"),
        }
    }
}

/// Inbox row: the single source of truth for what the outside world has
/// been told about an intent. Every externally observable outcome for an
/// `intent_id` derives from exactly one of these.
#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub intent_id: String,
    pub status: IntentState,
    pub result_digest: String,
}

/// Outbox row: a lifecycle event awaiting reliable append to its stream.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: i64,
    pub stream: String,
    pub envelope: Value,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(IntentState::Filled.is_terminal());
        assert!(IntentState::Cancelled.is_terminal());
        assert!(IntentState::Rejected.is_terminal());
        assert!(!IntentState::SubmitUnknown.is_terminal());
        assert!(!IntentState::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            IntentState::New,
            IntentState::RiskApproved,
            IntentState::Submitting,
            IntentState::SubmitUnknown,
            IntentState::Submitted,
            IntentState::PartiallyFilled,
            IntentState::Filled,
            IntentState::CancelPending,
            IntentState::Cancelled,
            IntentState::Rejected,
        ] {
            assert_eq!(IntentState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_fill_natural_key_prefers_broker_fill_id() {
        assert_eq!(
            Fill::natural_key(Some("F-1"), "B-1", "2026-01-01T10:00:00+08:00", 10.5, 100.0),
            "F-1"
        );
        assert_eq!(
            Fill::natural_key(None, "B-1", "2026-01-01T10:00:00+08:00", 10.5, 100.0),
            "B-1|2026-01-01T10:00:00+08:00|10.5|100"
        );
        // Empty broker fill id falls back to the composite key too.
        assert_eq!(
            Fill::natural_key(Some(""), "B-1", "t", 1.0, 2.0),
            "B-1|t|1|2"
        );
    }
}
