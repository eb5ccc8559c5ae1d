use std::env;
use std::str::FromStr;

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Trade-plane stream store (the only store this service talks to).
    pub store_url_trade: String,
    /// "redis" or "memory" (memory is single-process dev only).
    pub store_backend: String,
    /// Postgres DSN for the submission store; in-memory store when unset.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub consumer_group: String,
    pub max_attempts: u32,
    pub handler_timeout_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub worker_concurrency: usize,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_factor: u32,
    pub retry_backoff_cap_ms: u64,
    pub reconcile_period_ms: u64,
    pub lease_ttl_ms: u64,
    pub submit_period_ms: u64,
    pub max_submit_attempts: u32,
    pub shutdown_grace_secs: u64,
    pub execution_dry_run: bool,
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| format!("{key} must be a valid {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let store_url_trade = env::var("STORE_URL_TRADE")
            .unwrap_or_else(|_| "redis://localhost:6380".to_string());
        let store_backend = env::var("STORE_BACKEND").unwrap_or_else(|_| "redis".to_string());
        if store_backend != "redis" && store_backend != "memory" {
            return Err(format!(
                "STORE_BACKEND must be 'redis' or 'memory', got '{store_backend}'"
            ));
        }
        let database_url = env::var("DATABASE_URL").ok();
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        Ok(Config {
            store_url_trade,
            store_backend,
            database_url,
            host,
            port: parsed("PORT", 8093u16)?,
            consumer_group: env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "execution-group".to_string()),
            max_attempts: parsed("MAX_ATTEMPTS", 5u32)?,
            handler_timeout_secs: parsed("HANDLER_TIMEOUT", 30u64)?,
            idempotency_ttl_secs: parsed("IDEMPOTENCY_TTL", 604_800u64)?,
            worker_concurrency: parsed("WORKER_CONCURRENCY", 4usize)?,
            retry_backoff_base_ms: parsed("RETRY_BACKOFF_BASE_MS", 1000u64)?,
            retry_backoff_factor: parsed("RETRY_BACKOFF_FACTOR", 2u32)?,
            retry_backoff_cap_ms: parsed("RETRY_BACKOFF_CAP_MS", 60_000u64)?,
            reconcile_period_ms: parsed("RECONCILE_PERIOD_MS", 30_000u64)?,
            lease_ttl_ms: parsed("LEASE_TTL_MS", 10_000u64)?,
            submit_period_ms: parsed("SUBMIT_PERIOD_MS", 500u64)?,
            max_submit_attempts: parsed("MAX_SUBMIT_ATTEMPTS", 3u32)?,
            shutdown_grace_secs: parsed("SHUTDOWN_GRACE_SECS", 30u64)?,
            execution_dry_run: parsed("EXECUTION_DRY_RUN", true)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        // Only meaningful when the variables are unset, as in CI.
        if env::var("MAX_ATTEMPTS").is_ok() {
            return;
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.idempotency_ttl_secs, 604_800);
        assert_eq!(config.reconcile_period_ms, 30_000);
        assert_eq!(config.lease_ttl_ms, 10_000);
        assert!(config.execution_dry_run);
    }
}
