//! # Trade Bridge
//!
//! The single crossing point between the compute plane and the trade
//! plane. Two physically isolated stream stores exist; compute-plane
//! processors have no route to the trade-plane store and vice versa,
//! except through this service, which forwards only whitelisted,
//! re-validated risk-approval events, one way.

pub mod config;
pub mod forwarder;
pub mod metrics;

pub use config::{validate_whitelist, Config, DEFAULT_WHITELIST};
pub use forwarder::{BridgeSettings, TradeBridge};
pub use metrics::Metrics;
