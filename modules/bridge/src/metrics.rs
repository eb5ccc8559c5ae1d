use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Bridge counters, exported in Prometheus text format.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    /// Events appended to the trade plane.
    pub bridge_forwarded_total: IntCounterVec,
    /// Events rejected on re-validation and dead-lettered on the compute
    /// plane.
    pub bridge_rejected_total: IntCounterVec,
    /// Events read but not forwarded (schema outside the whitelist).
    pub bridge_skipped_total: IntCounterVec,
    /// Trade-plane append retries.
    pub bridge_append_retry_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let bridge_forwarded_total = IntCounterVec::new(
            Opts::new("bridge_forwarded_total", "Events forwarded to the trade plane"),
            &["stream"],
        )
        .expect("metric");

        let bridge_rejected_total = IntCounterVec::new(
            Opts::new("bridge_rejected_total", "Events rejected on re-validation"),
            &["stream", "error_kind"],
        )
        .expect("metric");

        let bridge_skipped_total = IntCounterVec::new(
            Opts::new("bridge_skipped_total", "Events not forwarded (not whitelisted)"),
            &["stream"],
        )
        .expect("metric");

        let bridge_append_retry_total = IntCounterVec::new(
            Opts::new("bridge_append_retry_total", "Trade-plane append retries"),
            &["stream"],
        )
        .expect("metric");

        registry
            .register(Box::new(bridge_forwarded_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(bridge_rejected_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(bridge_skipped_total.clone()))
            .expect("register metric");
        registry
            .register(Box::new(bridge_append_retry_total.clone()))
            .expect("register metric");

        Self {
            registry,
            bridge_forwarded_total,
            bridge_rejected_total,
            bridge_skipped_total,
            bridge_append_retry_total,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }

    pub fn forwarded(&self, stream: &str) -> u64 {
        self.bridge_forwarded_total
            .with_label_values(&[stream])
            .get()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
