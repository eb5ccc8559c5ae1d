use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use event_bus::bus::shutdown_pair;
use event_bus::{
    retry_with_backoff, streams, Consumer, ConsumerConfig, IdempotencyStore,
    InMemoryIdempotencyStore, InMemoryLog, Producer, RedisIdempotencyStore, RedisLog, RetryPolicy,
    SchemaRegistry, StreamLog, EXIT_STORE_UNREACHABLE,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use execution_rs::{
    broker::BrokerAdapter, run_submission_worker, ApprovalHandler, Config, DryRunBroker, MemStore,
    OutboxRelay, PgStore, Reconciler, SubmissionMachine, SubmissionStore,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting execution service...");

    let config = Config::from_env().expect("Failed to load configuration from environment");
    tracing::info!(
        host = %config.host,
        port = config.port,
        store_backend = %config.store_backend,
        dry_run = config.execution_dry_run,
        "Configuration loaded"
    );

    // Trade-plane stream store. This service holds trade-plane credentials
    // only; the compute plane is unreachable from here by construction.
    let retry = RetryPolicy::new(
        config.retry_backoff_base_ms,
        config.retry_backoff_factor,
        config.retry_backoff_cap_ms,
    );
    let (log, idempotency): (Arc<dyn StreamLog>, Arc<dyn IdempotencyStore>) =
        match config.store_backend.as_str() {
            "memory" => {
                tracing::warn!("using in-memory stream store; state dies with this process");
                (
                    Arc::new(InMemoryLog::new()),
                    Arc::new(InMemoryIdempotencyStore::new()),
                )
            }
            _ => {
                let redis = match retry_with_backoff(
                    || RedisLog::connect(&config.store_url_trade),
                    &retry,
                    config.max_attempts,
                    "trade_store_connect",
                )
                .await
                {
                    Ok(redis) => redis,
                    Err(error) => {
                        tracing::error!(error = %error, "trade-plane store unreachable, exiting");
                        std::process::exit(EXIT_STORE_UNREACHABLE);
                    }
                };
                let idempotency =
                    RedisIdempotencyStore::new(redis.connection(), "idempotency:execution");
                (Arc::new(redis), Arc::new(idempotency))
            }
        };

    let registry = Arc::new(SchemaRegistry::with_core_streams());

    let store: Arc<dyn SubmissionStore> = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            match PgStore::connect(database_url).await {
                Ok(store) => Arc::new(store),
                Err(error) => {
                    tracing::error!(error = %error, "submission store unreachable, exiting");
                    std::process::exit(EXIT_STORE_UNREACHABLE);
                }
            }
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory submission store");
            Arc::new(MemStore::new())
        }
    };

    if !config.execution_dry_run {
        tracing::warn!("EXECUTION_DRY_RUN=false but no live broker adapter is configured");
    }
    let broker: Arc<dyn BrokerAdapter> = Arc::new(DryRunBroker::new());

    let worker_id = format!(
        "execution-{}",
        std::env::var("HOSTNAME").unwrap_or_else(|_| event_bus::new_event_id())
    );
    let machine = Arc::new(
        SubmissionMachine::new(store.clone(), broker.clone(), worker_id)
            .with_lease_ttl(Duration::from_millis(config.lease_ttl_ms))
            .with_max_submit_attempts(config.max_submit_attempts),
    );

    let (shutdown_tx, shutdown_rx) = shutdown_pair();
    let mut tasks = Vec::new();

    // Approval consumer on the trade plane.
    let mut consumer_cfg = ConsumerConfig::new(
        streams::RISK_ORDER_APPROVED_V1,
        config.consumer_group.clone(),
        format!("{}-0", config.consumer_group),
    );
    consumer_cfg.max_attempts = config.max_attempts;
    consumer_cfg.handler_timeout = Duration::from_secs(config.handler_timeout_secs);
    consumer_cfg.idempotency_ttl = Duration::from_secs(config.idempotency_ttl_secs);
    consumer_cfg.concurrency = config.worker_concurrency;
    consumer_cfg.backoff = retry.clone();
    let consumer = Consumer::new(
        log.clone(),
        registry.clone(),
        idempotency,
        Arc::new(ApprovalHandler::new(machine.clone())),
        consumer_cfg,
        shutdown_rx.clone(),
    );
    tasks.push(tokio::spawn(async move {
        if let Err(error) = consumer.run().await {
            tracing::error!(error = %error, "approval consumer failed");
        }
    }));

    // Outbox relay publishes lifecycle events through a whitelisted producer.
    let producer = Producer::new(
        log.clone(),
        registry.clone(),
        streams::trade_lifecycle_streams(),
    );
    let relay = OutboxRelay::new(store.clone(), producer, Duration::from_millis(200));
    tasks.push(tokio::spawn(relay.run(shutdown_rx.clone())));

    // Submit/fill driver and the reconciler.
    tasks.push(tokio::spawn(run_submission_worker(
        machine.clone(),
        Duration::from_millis(config.submit_period_ms),
        shutdown_rx.clone(),
    )));
    let reconciler = Reconciler::new(
        store.clone(),
        broker.clone(),
        machine.clone(),
        Duration::from_millis(config.reconcile_period_ms),
    );
    tasks.push(tokio::spawn(reconciler.run(shutdown_rx.clone())));

    // Health endpoint.
    let app = Router::new()
        .route(
            "/api/health",
            get(|| async { Json(json!({"status": "ok", "service": "execution-rs"})) }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        );
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");
    tracing::info!(addr = %addr, "execution service listening");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(error = %error, "health server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!("grace period expired; pending entries will be reclaimed by a future worker");
    }
    tracing::info!("execution service stopped");
}
