use std::env;
use std::str::FromStr;

/// The only stream family allowed across the plane boundary.
pub const DEFAULT_WHITELIST: [&str; 1] = ["risk.order.approved.v1"];

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub store_url_compute: String,
    pub store_url_trade: String,
    /// Comma-separated override of the forwarding whitelist. Only
    /// risk-approval streams are accepted; anything else fails startup.
    pub whitelist: Vec<String>,
    pub consumer_group: String,
    pub consumer_name: String,
    pub host: String,
    pub port: u16,
    pub max_attempts: u32,
    pub visibility_timeout_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_factor: u32,
    pub retry_backoff_cap_ms: u64,
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
        let store_url_compute = env::var("STORE_URL_COMPUTE")
            .unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let store_url_trade = env::var("STORE_URL_TRADE")
            .unwrap_or_else(|_| "redis://localhost:6380".to_string());
        if store_url_compute == store_url_trade {
            return Err(
                "STORE_URL_COMPUTE and STORE_URL_TRADE must point at distinct stores".to_string(),
            );
        }

        let whitelist: Vec<String> = match env::var("BRIDGE_WHITELIST") {
            Ok(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            Err(_) => DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect(),
        };
        validate_whitelist(&whitelist)?;

        Ok(Config {
            store_url_compute,
            store_url_trade,
            whitelist,
            consumer_group: env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "trade-bridge".to_string()),
            consumer_name: env::var("HOSTNAME").unwrap_or_else(|_| "trade-bridge-1".to_string()),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parsed("PORT", 8094u16)?,
            max_attempts: parsed("MAX_ATTEMPTS", 5u32)?,
            visibility_timeout_ms: parsed("VISIBILITY_TIMEOUT_MS", 30_000u64)?,
            retry_backoff_base_ms: parsed("RETRY_BACKOFF_BASE_MS", 1000u64)?,
            retry_backoff_factor: parsed("RETRY_BACKOFF_FACTOR", 2u32)?,
            retry_backoff_cap_ms: parsed("RETRY_BACKOFF_CAP_MS", 60_000u64)?,
        })
    }
}

/// Only approval streams may cross into the trade plane. A misconfigured
/// whitelist is a startup failure, never a runtime condition.
pub fn validate_whitelist(whitelist: &[String]) -> Result<(), String> {
    if whitelist.is_empty() {
        return Err("bridge whitelist must not be empty".to_string());
    }
    for stream in whitelist {
        if !stream.starts_with("risk.order.approved.") {
            return Err(format!(
                "bridge whitelist only accepts risk.order.approved.* streams, got '{stream}'"
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_whitelist_is_valid() {
        let whitelist: Vec<String> = DEFAULT_WHITELIST.iter().map(|s| s.to_string()).collect();
        assert!(validate_whitelist(&whitelist).is_ok());
    }

    #[test]
    fn test_non_approval_stream_is_rejected() {
        let whitelist = vec!["strategy.candidate_action.generated.v1".to_string()];
        assert!(validate_whitelist(&whitelist).is_err());
    }

    #[test]
    fn test_empty_whitelist_is_rejected() {
        assert!(validate_whitelist(&[]).is_err());
    }
}
