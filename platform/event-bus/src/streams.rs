//! # Stream Registry (v1)
//!
//! Stream names are schema names: one stream per versioned schema, frozen
//! semantics for v1. New semantics get a `v2` stream, never an in-place
//! change.

use crate::registry::{FieldKind, PayloadRules, SchemaRegistry};

pub const PERCEPTION_HEARTBEAT_V1: &str = "perception.heartbeat.v1";
pub const PERCEPTION_MARKET_DATA_COLLECTED_V1: &str = "perception.market_data.collected.v1";

pub const VARIABLES_MARKET_COMPUTED_V1: &str = "variables.market.computed.v1";
pub const VARIABLES_STOCK_COMPUTED_V1: &str = "variables.stock.computed.v1";

pub const SIGNALS_REGIME_DETECTED_V1: &str = "signals.regime.detected.v1";
pub const SIGNALS_OPPORTUNITY_SCORED_V1: &str = "signals.opportunity.scored.v1";

pub const STRATEGY_CANDIDATE_ACTION_GENERATED_V1: &str = "strategy.candidate_action.generated.v1";

pub const RISK_ORDER_APPROVED_V1: &str = "risk.order.approved.v1";
pub const RISK_ORDER_REJECTED_V1: &str = "risk.order.rejected.v1";

pub const EXECUTION_ORDER_EXECUTED_V1: &str = "execution.order.executed.v1";
pub const EXECUTION_ORDER_FAILED_V1: &str = "execution.order.failed.v1";

pub const POSTMORTEM_TRADE_RECORD_CREATED_V1: &str = "postmortem.trade_record.created.v1";

pub const EVOLUTION_BACKTEST_COMPLETED_V1: &str = "evolution.backtest.completed.v1";
pub const EVOLUTION_PARAMETER_PROPOSED_V1: &str = "evolution.parameter.proposed.v1";

// Trade-plane lifecycle streams emitted by the submission state machine.
pub const TRADE_INTENT_APPROVED_V1: &str = "trade.intent.approved.v1";
pub const TRADE_INTENT_REJECTED_V1: &str = "trade.intent.rejected.v1";
pub const TRADE_SUBMIT_STARTED_V1: &str = "trade.submit.started.v1";
pub const TRADE_ORDER_SUBMITTED_V1: &str = "trade.order.submitted.v1";
pub const TRADE_SUBMIT_UNKNOWN_V1: &str = "trade.submit.unknown.v1";
pub const TRADE_ORDER_REJECTED_V1: &str = "trade.order.rejected.v1";
pub const TRADE_RECONCILE_COMPLETED_V1: &str = "trade.reconcile.completed.v1";
pub const TRADE_SUBMIT_RETRY_V1: &str = "trade.submit.retry.v1";
pub const TRADE_FILL_RECORDED_V1: &str = "trade.fill.recorded.v1";
pub const TRADE_ORDER_FILLED_V1: &str = "trade.order.filled.v1";
pub const TRADE_CANCEL_REQUESTED_V1: &str = "trade.cancel.requested.v1";
pub const TRADE_ORDER_CANCELLED_V1: &str = "trade.order.cancelled.v1";
pub const TRADE_RECONCILE_AMBIGUOUS_V1: &str = "trade.reconcile.ambiguous.v1";

/// Every stream the submission state machine may append to.
pub fn trade_lifecycle_streams() -> Vec<String> {
    [
        TRADE_INTENT_APPROVED_V1,
        TRADE_INTENT_REJECTED_V1,
        TRADE_SUBMIT_STARTED_V1,
        TRADE_ORDER_SUBMITTED_V1,
        TRADE_SUBMIT_UNKNOWN_V1,
        TRADE_ORDER_REJECTED_V1,
        TRADE_RECONCILE_COMPLETED_V1,
        TRADE_SUBMIT_RETRY_V1,
        TRADE_FILL_RECORDED_V1,
        TRADE_ORDER_FILLED_V1,
        TRADE_CANCEL_REQUESTED_V1,
        TRADE_ORDER_CANCELLED_V1,
        TRADE_RECONCILE_AMBIGUOUS_V1,
        EXECUTION_ORDER_EXECUTED_V1,
        EXECUTION_ORDER_FAILED_V1,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn ohlcv_rules() -> PayloadRules {
    PayloadRules::new()
        .field("symbol", FieldKind::str())
        .field("ts", FieldKind::Timestamp)
        .field("timeframe", FieldKind::str())
        .field("open", FieldKind::number_min(f64::MIN_POSITIVE))
        .field("high", FieldKind::number_min(f64::MIN_POSITIVE))
        .field("low", FieldKind::number_min(f64::MIN_POSITIVE))
        .field("close", FieldKind::number_min(f64::MIN_POSITIVE))
        .field("volume", FieldKind::number_min(0.0))
        .field("source", FieldKind::str())
}

fn variables_rules() -> PayloadRules {
    PayloadRules::new()
        .field("symbol", FieldKind::str())
        .field("ts", FieldKind::Timestamp)
        .field("variables", FieldKind::object())
        .field("quality", FieldKind::object())
}

fn risk_decision_rules() -> PayloadRules {
    PayloadRules::new()
        .field("symbol", FieldKind::str())
        .field("ts", FieldKind::Timestamp)
        .field("can_trade", FieldKind::Bool)
        .field("final_position_frac", FieldKind::number_range(-1.0, 1.0))
        .field("risk_per_trade", FieldKind::number_min(0.0))
        .field("reason", FieldKind::str())
        .field("order", FieldKind::object())
}

fn execution_result_rules() -> PayloadRules {
    PayloadRules::new()
        .field("order_id", FieldKind::str())
        .field("symbol", FieldKind::str())
        .field("ts", FieldKind::Timestamp)
        .field("status", FieldKind::str())
        .field("filled_qty", FieldKind::number_min(0.0))
        .field("avg_price", FieldKind::number_min(0.0))
        .field("broker", FieldKind::str())
}

fn intent_event_rules() -> PayloadRules {
    PayloadRules::new()
        .field("intent_id", FieldKind::str())
        .field("ts", FieldKind::Timestamp)
}

/// Register the payload rules for every core pipeline stream.
///
/// Registration is idempotent, so calling this on an already-populated
/// registry is harmless.
pub fn register_core_streams(registry: &SchemaRegistry) {
    let register = |schema: &str, rules: PayloadRules| {
        // The built-in catalog is internally consistent; a conflict here is
        // a programming error caught by tests.
        if let Err(e) = registry.register(schema, rules) {
            tracing::error!(schema = %schema, error = %e, "core stream registration failed");
        }
    };

    register(
        PERCEPTION_HEARTBEAT_V1,
        PayloadRules::new().field("status", FieldKind::str()),
    );
    register(PERCEPTION_MARKET_DATA_COLLECTED_V1, ohlcv_rules());

    register(VARIABLES_MARKET_COMPUTED_V1, variables_rules());
    register(VARIABLES_STOCK_COMPUTED_V1, variables_rules());

    register(
        SIGNALS_REGIME_DETECTED_V1,
        PayloadRules::new()
            .field("symbol", FieldKind::str())
            .field("ts", FieldKind::Timestamp)
            .field("regime", FieldKind::str()),
    );
    register(
        SIGNALS_OPPORTUNITY_SCORED_V1,
        PayloadRules::new()
            .field("symbol", FieldKind::str())
            .field("ts", FieldKind::Timestamp)
            .field("opportunity_score", FieldKind::number_range(0.0, 100.0))
            .field("confidence", FieldKind::number_range(0.0, 100.0))
            .field("regime", FieldKind::str())
            .field("components", FieldKind::object()),
    );

    register(
        STRATEGY_CANDIDATE_ACTION_GENERATED_V1,
        PayloadRules::new()
            .field("symbol", FieldKind::str())
            .field("ts", FieldKind::Timestamp)
            .field("action", FieldKind::Enum(vec!["BUY", "SELL", "HOLD"]))
            .field("strategy", FieldKind::str())
            .field("target_position_frac", FieldKind::number_range(-1.0, 1.0))
            .field("rationale", FieldKind::str()),
    );

    register(RISK_ORDER_APPROVED_V1, risk_decision_rules());
    register(RISK_ORDER_REJECTED_V1, risk_decision_rules());

    register(EXECUTION_ORDER_EXECUTED_V1, execution_result_rules());
    register(EXECUTION_ORDER_FAILED_V1, execution_result_rules());

    register(
        POSTMORTEM_TRADE_RECORD_CREATED_V1,
        PayloadRules::new()
            .field("trade_id", FieldKind::str())
            .field("symbol", FieldKind::str())
            .field("ts", FieldKind::Timestamp)
            .field(
                "status",
                FieldKind::Enum(vec!["EXECUTED", "FAILED", "PARTIAL"]),
            )
            .field("order", FieldKind::object())
            .field("decision_snapshot", FieldKind::object()),
    );

    register(
        EVOLUTION_BACKTEST_COMPLETED_V1,
        PayloadRules::new()
            .field("backtest_id", FieldKind::str())
            .field("strategy", FieldKind::str())
            .field("start_date", FieldKind::str())
            .field("end_date", FieldKind::str())
            .field("metrics", FieldKind::object())
            .field("parameters", FieldKind::object()),
    );
    register(
        EVOLUTION_PARAMETER_PROPOSED_V1,
        PayloadRules::new()
            .field("proposal_id", FieldKind::str())
            .field("strategy", FieldKind::str())
            .field("current_parameters", FieldKind::object())
            .field("proposed_parameters", FieldKind::object())
            .field("rationale", FieldKind::str()),
    );

    register(
        TRADE_INTENT_APPROVED_V1,
        intent_event_rules()
            .field("symbol", FieldKind::str())
            .field("approval", FieldKind::object()),
    );
    register(
        TRADE_INTENT_REJECTED_V1,
        intent_event_rules()
            .field("symbol", FieldKind::str())
            .field("reason", FieldKind::str()),
    );
    register(
        TRADE_SUBMIT_STARTED_V1,
        intent_event_rules()
            .field("attempt", FieldKind::Int)
            .field("submit_attempt_id", FieldKind::str()),
    );
    register(
        TRADE_ORDER_SUBMITTED_V1,
        intent_event_rules()
            .field("order_id", FieldKind::str())
            .field("broker_order_id", FieldKind::str()),
    );
    register(
        TRADE_SUBMIT_UNKNOWN_V1,
        intent_event_rules()
            .field("order_id", FieldKind::str())
            .field("request_hash", FieldKind::str())
            .field("reason", FieldKind::str()),
    );
    register(
        TRADE_ORDER_REJECTED_V1,
        intent_event_rules()
            .field("order_id", FieldKind::str())
            .field("code", FieldKind::str())
            .field("message", FieldKind::str()),
    );
    register(
        TRADE_RECONCILE_COMPLETED_V1,
        intent_event_rules()
            .field("order_id", FieldKind::str())
            .field("broker_order_id", FieldKind::str()),
    );
    register(
        TRADE_SUBMIT_RETRY_V1,
        intent_event_rules().field("attempt", FieldKind::Int),
    );
    register(
        TRADE_FILL_RECORDED_V1,
        intent_event_rules()
            .field("order_id", FieldKind::str())
            .field("fill_key", FieldKind::str())
            .field("qty", FieldKind::number_min(0.0))
            .field("price", FieldKind::number_min(0.0))
            .field("cum_qty", FieldKind::number_min(0.0)),
    );
    register(
        TRADE_ORDER_FILLED_V1,
        intent_event_rules()
            .field("order_id", FieldKind::str())
            .field("cum_qty", FieldKind::number_min(0.0))
            .field("avg_price", FieldKind::number_min(0.0)),
    );
    register(
        TRADE_CANCEL_REQUESTED_V1,
        intent_event_rules()
            .field("order_id", FieldKind::str())
            .field("cancel_request_id", FieldKind::str()),
    );
    register(
        TRADE_ORDER_CANCELLED_V1,
        intent_event_rules().field("order_id", FieldKind::str()),
    );
    register(
        TRADE_RECONCILE_AMBIGUOUS_V1,
        intent_event_rules().field("reason", FieldKind::str()),
    );
}
