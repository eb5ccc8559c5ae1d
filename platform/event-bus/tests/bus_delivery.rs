//! Delivery-semantics tests for the bus runtime: effectively-once dispatch,
//! retry accounting and DLQ routing against the in-memory log.

use std::sync::Arc;
use std::time::Duration;

use event_bus::bus::{shutdown_pair, ScriptedHandler};
use event_bus::{
    dlq_stream, streams, Consumer, ConsumerConfig, Envelope, HandlerOutcome, InMemoryIdempotencyStore,
    InMemoryLog, Producer, RetryPolicy, SchemaRegistry, StreamLog,
};
use serde_json::json;

fn market_data_payload() -> serde_json::Value {
    json!({
        "symbol": "600000.SH",
        "ts": "2026-01-01T09:30:00+08:00",
        "timeframe": "1d",
        "open": 10.0, "high": 10.8, "low": 9.9, "close": 10.5,
        "volume": 10000,
        "source": "sandbox"
    })
}

fn market_data_envelope(event_id: &str, trace_id: &str) -> Envelope {
    Envelope::new(
        streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
        trace_id,
        market_data_payload(),
    )
    .with_event_id(event_id)
}

fn fast_config(stream: &str, group: &str) -> ConsumerConfig {
    let mut cfg = ConsumerConfig::new(stream, group, "test-consumer");
    cfg.visibility_timeout = Duration::from_millis(30);
    cfg.block = Duration::from_millis(20);
    cfg.backoff = RetryPolicy::new(1, 2, 10);
    cfg.max_attempts = 3;
    cfg
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within timeout");
}

struct Fixture {
    log: Arc<InMemoryLog>,
    registry: Arc<SchemaRegistry>,
    idempotency: Arc<InMemoryIdempotencyStore>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            log: Arc::new(InMemoryLog::new()),
            registry: Arc::new(SchemaRegistry::with_core_streams()),
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }

    fn producer(&self, streams: &[&str]) -> Producer {
        Producer::new(
            self.log.clone(),
            self.registry.clone(),
            streams.iter().map(|s| s.to_string()),
        )
    }

    fn spawn_consumer(
        &self,
        handler: Arc<ScriptedHandler>,
        cfg: ConsumerConfig,
    ) -> (
        tokio::sync::watch::Sender<bool>,
        tokio::task::JoinHandle<event_bus::BusResult<()>>,
    ) {
        let (tx, rx) = shutdown_pair();
        let consumer = Consumer::new(
            self.log.clone(),
            self.registry.clone(),
            self.idempotency.clone(),
            handler,
            cfg,
            rx,
        );
        (tx, tokio::spawn(consumer.run()))
    }
}

#[tokio::test]
async fn test_publish_to_undeclared_stream_is_rejected() {
    let fx = Fixture::new();
    let producer = fx.producer(&[streams::PERCEPTION_HEARTBEAT_V1]);

    let result = producer
        .publish(
            streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
            &market_data_envelope("e1", "t1"),
        )
        .await;
    assert!(matches!(
        result,
        Err(event_bus::BusError::UnauthorizedStream(_))
    ));
    assert!(fx
        .log
        .entries(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1)
        .is_empty());
}

#[tokio::test]
async fn test_contract_violation_surfaces_and_appends_nothing() {
    let fx = Fixture::new();
    let producer = fx.producer(&[streams::PERCEPTION_MARKET_DATA_COLLECTED_V1]);

    let mut envelope = market_data_envelope("e1", "t1");
    envelope.payload["volume"] = json!(-1);

    let result = producer
        .publish(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1, &envelope)
        .await;
    assert!(matches!(result, Err(event_bus::BusError::Contract(_))));
    assert!(fx
        .log
        .entries(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1)
        .is_empty());
}

#[tokio::test]
async fn test_duplicate_event_id_invokes_handler_once() {
    let fx = Fixture::new();
    let producer = fx.producer(&[streams::PERCEPTION_MARKET_DATA_COLLECTED_V1]);
    let handler = Arc::new(ScriptedHandler::always_ok());
    let (shutdown, task) = fx.spawn_consumer(
        handler.clone(),
        fast_config(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1, "vars-group"),
    );

    // Same event_id delivered twice: at-least-once transport, one effect.
    for _ in 0..2 {
        producer
            .publish(
                streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
                &market_data_envelope("E2", "T2"),
            )
            .await
            .unwrap();
    }

    wait_until(|| handler.invocations() >= 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handler.invocations(), 1, "duplicate must be silently acked");

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dirty_event_routes_to_dlq_with_error_kind() {
    let fx = Fixture::new();
    let handler = Arc::new(ScriptedHandler::always_ok());
    let (shutdown, task) = fx.spawn_consumer(
        handler.clone(),
        fast_config(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1, "vars-group"),
    );

    // Missing trace_id, appended behind the producer's back.
    let dirty = json!({
        "event_id": "evt-dirty",
        "produced_at": "2026-01-01T09:30:00+08:00",
        "schema": streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
        "schema_version": 1,
        "payload": market_data_payload()
    });
    fx.log
        .append(
            streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
            serde_json::to_vec(&dirty).unwrap(),
        )
        .await
        .unwrap();

    let dlq = dlq_stream(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1);
    wait_until(|| !fx.log.entries(&dlq).is_empty()).await;

    let entries = fx.log.entries(&dlq);
    assert_eq!(entries.len(), 1);
    let wrapped: serde_json::Value = serde_json::from_slice(&entries[0]).unwrap();
    assert_eq!(wrapped["schema"], format!("dlq.{}", streams::PERCEPTION_MARKET_DATA_COLLECTED_V1));
    assert_eq!(
        wrapped["payload"]["original_stream"],
        streams::PERCEPTION_MARKET_DATA_COLLECTED_V1
    );
    assert_eq!(wrapped["payload"]["error_kind"], "MissingField");
    assert!(wrapped["payload"]["error_detail"]
        .as_str()
        .unwrap()
        .contains("trace_id"));
    assert_eq!(handler.invocations(), 0, "handler never sees invalid events");

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_retryable_failure_redelivers_then_dead_letters() {
    let fx = Fixture::new();
    let producer = fx.producer(&[streams::PERCEPTION_MARKET_DATA_COLLECTED_V1]);
    let handler = Arc::new(ScriptedHandler::new([
        HandlerOutcome::Retryable("db down".to_string()),
        HandlerOutcome::Retryable("db down".to_string()),
        HandlerOutcome::Retryable("db down".to_string()),
    ]));
    let (shutdown, task) = fx.spawn_consumer(
        handler.clone(),
        fast_config(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1, "vars-group"),
    );

    producer
        .publish(
            streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
            &market_data_envelope("evt-retry", "t-retry"),
        )
        .await
        .unwrap();

    let dlq = dlq_stream(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1);
    wait_until(|| !fx.log.entries(&dlq).is_empty()).await;

    // max_attempts = 3: three invocations, then the wrapper.
    assert_eq!(handler.invocations(), 3);
    let wrapped: serde_json::Value =
        serde_json::from_slice(&fx.log.entries(&dlq)[0]).unwrap();
    assert_eq!(wrapped["payload"]["error_kind"], "HandlerRetryable");
    assert_eq!(wrapped["payload"]["attempts"], 3);
    assert_eq!(wrapped["trace_id"], "t-retry");

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_fatal_failure_dead_letters_immediately() {
    let fx = Fixture::new();
    let producer = fx.producer(&[streams::PERCEPTION_MARKET_DATA_COLLECTED_V1]);
    let handler = Arc::new(ScriptedHandler::new([HandlerOutcome::Fatal(
        "poison event".to_string(),
    )]));
    let (shutdown, task) = fx.spawn_consumer(
        handler.clone(),
        fast_config(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1, "vars-group"),
    );

    producer
        .publish(
            streams::PERCEPTION_MARKET_DATA_COLLECTED_V1,
            &market_data_envelope("evt-fatal", "t-fatal"),
        )
        .await
        .unwrap();

    let dlq = dlq_stream(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1);
    wait_until(|| !fx.log.entries(&dlq).is_empty()).await;

    assert_eq!(handler.invocations(), 1);
    let wrapped: serde_json::Value =
        serde_json::from_slice(&fx.log.entries(&dlq)[0]).unwrap();
    assert_eq!(wrapped["payload"]["error_kind"], "HandlerFatal");

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_invalid_event_on_dlq_stream_is_dropped_not_rewrapped() {
    let fx = Fixture::new();
    let handler = Arc::new(ScriptedHandler::always_ok());
    let dlq = dlq_stream(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1);
    let (shutdown, task) = fx.spawn_consumer(handler.clone(), fast_config(&dlq, "dlq-audit"));

    fx.log.append(&dlq, b"corrupt bytes".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // No dlq.dlq.* stream may ever appear.
    for name in fx.log.stream_names() {
        assert!(
            !name.starts_with("dlq.dlq."),
            "unexpected second-level DLQ stream {name}"
        );
    }
    assert_eq!(handler.invocations(), 0);

    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_publish_batch_returns_individual_results() {
    let fx = Fixture::new();
    let producer = fx.producer(&[streams::PERCEPTION_MARKET_DATA_COLLECTED_V1]);

    let good = market_data_envelope("b1", "t1");
    let mut bad = market_data_envelope("b2", "t1");
    bad.payload["open"] = json!(0.0);

    let results = producer
        .publish_batch(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1, &[good, bad])
        .await;
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert_eq!(
        fx.log
            .entries(streams::PERCEPTION_MARKET_DATA_COLLECTED_V1)
            .len(),
        1
    );
}
