use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use event_bus::bus::shutdown_pair;
use event_bus::{
    retry_with_backoff, RedisLog, RetryPolicy, SchemaRegistry, StreamLog, EXIT_STORE_UNREACHABLE,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use trade_bridge_rs::{BridgeSettings, Config, Metrics, TradeBridge, DEFAULT_WHITELIST};

async fn render_metrics(State(metrics): State<Metrics>) -> String {
    metrics.render().unwrap_or_default()
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting trade bridge...");

    let config = Config::from_env().expect("Failed to load configuration from environment");
    let default_whitelist: Vec<String> = DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect();
    if config.whitelist != default_whitelist {
        // Overrides are legal but loud.
        tracing::warn!(whitelist = ?config.whitelist, "bridge whitelist overridden");
    }
    tracing::info!(
        whitelist = ?config.whitelist,
        group = %config.consumer_group,
        "Configuration loaded"
    );

    let retry = RetryPolicy::new(
        config.retry_backoff_base_ms,
        config.retry_backoff_factor,
        config.retry_backoff_cap_ms,
    );

    let compute: Arc<dyn StreamLog> = match retry_with_backoff(
        || RedisLog::connect(&config.store_url_compute),
        &retry,
        config.max_attempts,
        "compute_store_connect",
    )
    .await
    {
        Ok(log) => Arc::new(log),
        Err(error) => {
            tracing::error!(error = %error, "compute-plane store unreachable, exiting");
            std::process::exit(EXIT_STORE_UNREACHABLE);
        }
    };
    let trade: Arc<dyn StreamLog> = match retry_with_backoff(
        || RedisLog::connect(&config.store_url_trade),
        &retry,
        config.max_attempts,
        "trade_store_connect",
    )
    .await
    {
        Ok(log) => Arc::new(log),
        Err(error) => {
            tracing::error!(error = %error, "trade-plane store unreachable, exiting");
            std::process::exit(EXIT_STORE_UNREACHABLE);
        }
    };

    let registry = Arc::new(SchemaRegistry::with_core_streams());
    let metrics = Metrics::new();
    let settings = BridgeSettings {
        group: config.consumer_group.clone(),
        consumer: config.consumer_name.clone(),
        max_attempts: config.max_attempts,
        visibility_timeout: Duration::from_millis(config.visibility_timeout_ms),
        backoff: retry,
        ..BridgeSettings::default()
    };
    let bridge = Arc::new(TradeBridge::new(
        compute,
        trade,
        registry,
        config.whitelist.clone(),
        metrics.clone(),
        settings,
    ));

    let (shutdown_tx, shutdown_rx) = shutdown_pair();
    let tasks = bridge.spawn(shutdown_rx);

    let app = Router::new()
        .route(
            "/api/health",
            get(|| async { Json(json!({"status": "ok", "service": "trade-bridge-rs"})) }),
        )
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
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
    tracing::info!(addr = %addr, "trade bridge listening");
    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(error = %error, "health server failed");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("trade bridge stopped");
}
