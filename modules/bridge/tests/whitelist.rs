//! Plane-isolation tests: only whitelisted, re-validated approval events
//! may ever appear on the trade plane.

use std::sync::Arc;
use std::time::Duration;

use event_bus::{
    streams, Envelope, GroupStart, InMemoryLog, Offset, RetryPolicy, SchemaRegistry, StreamLog,
};
use serde_json::json;

use trade_bridge_rs::{validate_whitelist, BridgeSettings, Metrics, TradeBridge, DEFAULT_WHITELIST};

fn settings() -> BridgeSettings {
    BridgeSettings {
        block: Duration::from_millis(20),
        visibility_timeout: Duration::from_millis(50),
        backoff: RetryPolicy::new(1, 2, 10),
        max_attempts: 3,
        ..BridgeSettings::default()
    }
}

struct Planes {
    compute: Arc<InMemoryLog>,
    trade: Arc<InMemoryLog>,
    bridge: TradeBridge,
}

fn planes() -> Planes {
    let compute = Arc::new(InMemoryLog::new());
    let trade = Arc::new(InMemoryLog::new());
    let registry = Arc::new(SchemaRegistry::with_core_streams());
    let bridge = TradeBridge::new(
        compute.clone(),
        trade.clone(),
        registry,
        DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect(),
        Metrics::new(),
        settings(),
    );
    Planes {
        compute,
        trade,
        bridge,
    }
}

fn approval_envelope(event_id: &str) -> Envelope {
    Envelope::new(
        streams::RISK_ORDER_APPROVED_V1,
        "trace-bridge",
        json!({
            "symbol": "600000.SH",
            "ts": "2026-01-01T09:31:00+08:00",
            "can_trade": true,
            "final_position_frac": 0.1,
            "risk_per_trade": 0.01,
            "reason": "within_limits",
            "order": {"order_id": "ord-1", "symbol": "600000.SH", "side": "BUY", "qty": 100}
        }),
    )
    .with_event_id(event_id)
    .with_source_service("risk-service")
}

fn candidate_envelope(event_id: &str) -> Envelope {
    Envelope::new(
        streams::STRATEGY_CANDIDATE_ACTION_GENERATED_V1,
        "trace-bridge",
        json!({
            "symbol": "600000.SH",
            "ts": "2026-01-01T09:31:00+08:00",
            "action": "BUY",
            "strategy": "trend_following",
            "target_position_frac": 0.1,
            "rationale": "test"
        }),
    )
    .with_event_id(event_id)
}

async fn setup_group(planes: &Planes) {
    planes
        .compute
        .create_group(
            streams::RISK_ORDER_APPROVED_V1,
            "trade-bridge",
            GroupStart::Beginning,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_valid_approval_is_forwarded_verbatim() {
    let planes = planes();
    setup_group(&planes).await;

    let envelope = approval_envelope("evt-fwd");
    planes
        .compute
        .append(
            streams::RISK_ORDER_APPROVED_V1,
            envelope.encode().unwrap(),
        )
        .await
        .unwrap();

    planes
        .bridge
        .forward_once(streams::RISK_ORDER_APPROVED_V1)
        .await
        .unwrap();

    let forwarded = planes.trade.entries(streams::RISK_ORDER_APPROVED_V1);
    assert_eq!(forwarded.len(), 1);
    // event_id preserved byte-for-byte; downstream idempotency depends on it.
    let decoded = Envelope::decode(&forwarded[0]).unwrap();
    assert_eq!(decoded, envelope);
    assert_eq!(
        planes
            .bridge
            .metrics()
            .forwarded(streams::RISK_ORDER_APPROVED_V1),
        1
    );
}

#[tokio::test]
async fn test_non_whitelisted_stream_never_reaches_trade_plane() {
    let planes = planes();
    setup_group(&planes).await;

    // A perfectly valid candidate event lands on the compute plane. The
    // bridge does not even subscribe to its stream.
    planes
        .compute
        .append(
            streams::STRATEGY_CANDIDATE_ACTION_GENERATED_V1,
            candidate_envelope("evt-cand").encode().unwrap(),
        )
        .await
        .unwrap();

    planes
        .bridge
        .forward_once(streams::RISK_ORDER_APPROVED_V1)
        .await
        .unwrap();

    assert!(planes.trade.stream_names().is_empty());
    assert_eq!(
        planes
            .bridge
            .metrics()
            .forwarded(streams::RISK_ORDER_APPROVED_V1),
        0,
        "non-forward count visible as zero forwards"
    );
}

#[tokio::test]
async fn test_invalid_event_goes_to_compute_dlq_not_trade_plane() {
    let planes = planes();
    setup_group(&planes).await;

    // Candidate-schema envelope smuggled onto the approval stream.
    planes
        .compute
        .append(
            streams::RISK_ORDER_APPROVED_V1,
            candidate_envelope("evt-smuggled").encode().unwrap(),
        )
        .await
        .unwrap();
    // Structurally broken bytes.
    planes
        .compute
        .append(streams::RISK_ORDER_APPROVED_V1, b"{garbage".to_vec())
        .await
        .unwrap();

    planes
        .bridge
        .forward_once(streams::RISK_ORDER_APPROVED_V1)
        .await
        .unwrap();

    assert!(planes.trade.stream_names().is_empty());
    let dlq = planes
        .compute
        .entries(&event_bus::dlq_stream(streams::RISK_ORDER_APPROVED_V1));
    assert_eq!(dlq.len(), 2);
    let wrapped: serde_json::Value = serde_json::from_slice(&dlq[0]).unwrap();
    assert_eq!(
        wrapped["payload"]["original_stream"],
        streams::RISK_ORDER_APPROVED_V1
    );
}

#[tokio::test]
async fn test_fuzzed_mixed_schemas_keep_trade_plane_confined() {
    let planes = planes();
    setup_group(&planes).await;

    // A mixed bag on the approval stream: valid approvals, foreign
    // schemas, corrupt bytes, version mismatches.
    for i in 0..8 {
        let bytes = match i % 4 {
            0 => approval_envelope(&format!("evt-ok-{i}")).encode().unwrap(),
            1 => candidate_envelope(&format!("evt-foreign-{i}"))
                .encode()
                .unwrap(),
            2 => format!("{{\"broken\": {i}").into_bytes(),
            _ => {
                let mut envelope = approval_envelope(&format!("evt-ver-{i}"));
                envelope.schema_version = 3;
                envelope.encode().unwrap()
            }
        };
        planes
            .compute
            .append(streams::RISK_ORDER_APPROVED_V1, bytes)
            .await
            .unwrap();
    }

    for _ in 0..4 {
        planes
            .bridge
            .forward_once(streams::RISK_ORDER_APPROVED_V1)
            .await
            .unwrap();
    }

    // Invariant: every non-DLQ schema on the trade plane is whitelisted.
    for stream in planes.trade.stream_names() {
        assert!(
            DEFAULT_WHITELIST.contains(&stream.as_str()),
            "unexpected trade-plane stream {stream}"
        );
        for bytes in planes.trade.entries(&stream) {
            let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["schema"], stream);
        }
    }
    assert_eq!(
        planes.trade.entries(streams::RISK_ORDER_APPROVED_V1).len(),
        2,
        "only the two valid approvals cross"
    );
}

#[tokio::test]
async fn test_unavailable_trade_plane_leaves_entry_pending() {
    // A trade plane that always fails.
    struct DownLog;
    #[async_trait::async_trait]
    impl StreamLog for DownLog {
        async fn append(&self, _: &str, _: Vec<u8>) -> event_bus::BusResult<Offset> {
            Err(event_bus::BusError::StoreUnavailable("down".to_string()))
        }
        async fn read_range(
            &self,
            _: &str,
            _: Offset,
            _: usize,
        ) -> event_bus::BusResult<Vec<event_bus::LogEntry>> {
            Ok(Vec::new())
        }
        async fn create_group(
            &self,
            _: &str,
            _: &str,
            _: GroupStart,
        ) -> event_bus::BusResult<()> {
            Ok(())
        }
        async fn group_read(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: usize,
            _: Duration,
        ) -> event_bus::BusResult<Vec<event_bus::LogEntry>> {
            Ok(Vec::new())
        }
        async fn ack(&self, _: &str, _: &str, _: Offset) -> event_bus::BusResult<()> {
            Ok(())
        }
        async fn claim_stale(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: Duration,
            _: usize,
        ) -> event_bus::BusResult<Vec<event_bus::LogEntry>> {
            Ok(Vec::new())
        }
    }

    let compute = Arc::new(InMemoryLog::new());
    let registry = Arc::new(SchemaRegistry::with_core_streams());
    let bridge = TradeBridge::new(
        compute.clone(),
        Arc::new(DownLog),
        registry,
        DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect(),
        Metrics::new(),
        settings(),
    );
    compute
        .create_group(
            streams::RISK_ORDER_APPROVED_V1,
            "trade-bridge",
            GroupStart::Beginning,
        )
        .await
        .unwrap();
    compute
        .append(
            streams::RISK_ORDER_APPROVED_V1,
            approval_envelope("evt-down").encode().unwrap(),
        )
        .await
        .unwrap();

    bridge
        .forward_once(streams::RISK_ORDER_APPROVED_V1)
        .await
        .unwrap();

    // First delivery failed all inline retries but is below the DLQ
    // threshold: the entry must remain claimable, not acked, not lost.
    let pending = compute
        .claim_stale(
            streams::RISK_ORDER_APPROVED_V1,
            "trade-bridge",
            "probe",
            Duration::ZERO,
            10,
        )
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].delivery_count, 2);
}

#[test]
fn test_whitelist_validation_rejects_non_approval_streams() {
    assert!(validate_whitelist(&["risk.order.approved.v1".to_string()]).is_ok());
    assert!(validate_whitelist(&["risk.order.approved.v2".to_string()]).is_ok());
    assert!(validate_whitelist(&["execution.order.executed.v1".to_string()]).is_err());
}
