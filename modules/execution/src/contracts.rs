//! Contract types for events the execution service consumes
//!
//! These types match the payload rules registered for
//! `risk.order.approved.v1` / `risk.order.rejected.v1`.
//!
//! IMPORTANT: field names must match the wire contract exactly. The `order`
//! object is free-form at the contract level; the fields below are the ones
//! execution relies on, everything else is preserved in the approval
//! snapshot.

use serde::{Deserialize, Serialize};

/// Payload of a risk decision event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskOrderDecisionV1 {
    pub symbol: String,

    /// Decision timestamp (RFC 3339, offset-carrying)
    pub ts: String,

    pub can_trade: bool,

    /// Final sized position as a fraction of NAV, -1..1
    pub final_position_frac: f64,

    /// Capital at risk for this trade, >= 0
    pub risk_per_trade: f64,

    /// Human-readable decision reason (e.g. "within_limits")
    pub reason: String,

    pub order: OrderSpec,
}

/// The broker-facing order embedded in a risk decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderSpec {
    pub order_id: String,

    pub symbol: String,

    pub side: Side,

    pub qty: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,

    /// Free-form broker remark; execution embeds the intent id here so the
    /// reconciler can match orders after an ambiguous send.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    pub fn parse(raw: &str) -> Option<Side> {
        match raw {
            "BUY" => Some(Side::Buy),
            "SELL" => Some(Side::Sell),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_approved_payload() {
        let json = r#"{
            "symbol": "600000.SH",
            "ts": "2026-01-01T09:31:00+08:00",
            "can_trade": true,
            "final_position_frac": 0.1,
            "risk_per_trade": 0.01,
            "reason": "within_limits",
            "order": {
                "order_id": "ord-1",
                "symbol": "600000.SH",
                "side": "BUY",
                "qty": 100
            }
        }"#;

        let decision: RiskOrderDecisionV1 = serde_json::from_str(json).unwrap();
        assert!(decision.can_trade);
        assert_eq!(decision.order.side, Side::Buy);
        assert_eq!(decision.order.qty, 100.0);
        assert_eq!(decision.order.limit_price, None);
    }

    #[test]
    fn test_side_wire_format() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), r#""BUY""#);
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), r#""SELL""#);
        assert_eq!(Side::parse("SELL"), Some(Side::Sell));
        assert_eq!(Side::parse("SHORT"), None);
    }
}
