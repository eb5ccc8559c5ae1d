//! Broker adapter port.
//!
//! Execution is purely mechanical: it sends exactly what risk approved and
//! reports exactly what the broker answered. No additional risk logic lives
//! behind this trait.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::contracts::Side;

/// The canonical outbound order. Hashed for reconciliation before send.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub intent_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    /// Carries `intent:<intent_id>` so the reconciler can match broker
    /// orders back after an ambiguous send.
    pub remark: String,
}

impl OrderRequest {
    /// SHA-256 over the canonical JSON rendering. serde_json orders object
    /// keys deterministically, so equal requests hash equally across
    /// processes.
    pub fn request_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }
}

#[derive(Debug, Clone)]
pub struct BrokerAck {
    pub broker_order_id: String,
}

/// A broker-side view of an order, as returned by open-order queries.
#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub broker_order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub cum_qty: f64,
    pub avg_price: f64,
    /// OPEN / FILLED / CANCELLED, broker-normalized.
    pub status: String,
    pub remark: String,
}

#[derive(Debug, Clone)]
pub struct BrokerFill {
    /// Broker fill id when the venue provides one.
    pub fill_id: Option<String>,
    pub broker_order_id: String,
    pub qty: f64,
    pub price: f64,
    pub ts: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Explicit, unambiguous rejection.
    #[error("broker rejected order: {code}: {message}")]
    Rejected { code: String, message: String },

    /// Send timeout or connection loss: the order may or may not exist on
    /// the broker side. Only reconciliation may decide.
    #[error("broker unreachable: {0}")]
    Unreachable(String),
}

#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn place_order(&self, request: &OrderRequest) -> Result<BrokerAck, BrokerError>;

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError>;

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError>;

    async fn fills_today(&self) -> Result<Vec<BrokerFill>, BrokerError>;
}

/// Deterministic sandbox broker: acknowledges and fully fills every valid
/// order at its limit price (or zero for market orders), with running
/// counters for reproducible IDs.
pub struct DryRunBroker {
    state: Mutex<DryRunState>,
}

#[derive(Default)]
struct DryRunState {
    next_order: u64,
    next_fill: u64,
    orders: Vec<BrokerOrder>,
    fills: Vec<BrokerFill>,
}

impl DryRunBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DryRunState::default()),
        }
    }
}

impl Default for DryRunBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for DryRunBroker {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<BrokerAck, BrokerError> {
        if request.symbol.is_empty() || request.qty <= 0.0 {
            return Err(BrokerError::Rejected {
                code: "INVALID_ORDER".to_string(),
                message: "symbol and positive qty required".to_string(),
            });
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.next_order += 1;
        state.next_fill += 1;
        let broker_order_id = format!("B-{:06}", state.next_order);
        let fill_id = format!("F-{:06}", state.next_fill);
        let price = request.limit_price.unwrap_or(0.0);
        let ts = chrono::Utc::now().to_rfc3339();

        state.orders.push(BrokerOrder {
            broker_order_id: broker_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            qty: request.qty,
            cum_qty: request.qty,
            avg_price: price,
            status: "FILLED".to_string(),
            remark: request.remark.clone(),
        });
        state.fills.push(BrokerFill {
            fill_id: Some(fill_id),
            broker_order_id: broker_order_id.clone(),
            qty: request.qty,
            price,
            ts,
        });

        Ok(BrokerAck { broker_order_id })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for order in state.orders.iter_mut() {
            if order.broker_order_id == broker_order_id {
                order.status = "CANCELLED".to_string();
                return Ok(());
            }
        }
        Err(BrokerError::Rejected {
            code: "UNKNOWN_ORDER".to_string(),
            message: format!("no such broker order {broker_order_id}"),
        })
    }

    async fn open_orders(&self) -> Result<Vec<BrokerOrder>, BrokerError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.orders.clone())
    }

    async fn fills_today(&self) -> Result<Vec<BrokerFill>, BrokerError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state.fills.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(qty: f64) -> OrderRequest {
        OrderRequest {
            intent_id: "i1".to_string(),
            order_id: "ord-i1".to_string(),
            symbol: "600000.SH".to_string(),
            side: Side::Buy,
            qty,
            limit_price: Some(10.5),
            remark: "intent:i1".to_string(),
        }
    }

    #[test]
    fn test_request_hash_is_stable_and_sensitive() {
        let a = request(100.0);
        let b = request(100.0);
        let c = request(200.0);
        assert_eq!(a.request_hash(), b.request_hash());
        assert_ne!(a.request_hash(), c.request_hash());
    }

    #[tokio::test]
    async fn test_dry_run_fills_valid_order() {
        let broker = DryRunBroker::new();
        let ack = broker.place_order(&request(100.0)).await.unwrap();
        assert_eq!(ack.broker_order_id, "B-000001");

        let fills = broker.fills_today().await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].qty, 100.0);
        assert_eq!(fills[0].price, 10.5);
    }

    #[tokio::test]
    async fn test_dry_run_rejects_zero_qty() {
        let broker = DryRunBroker::new();
        let err = broker.place_order(&request(0.0)).await.unwrap_err();
        assert!(matches!(err, BrokerError::Rejected { .. }));
    }
}
