//! Prometheus metrics for the gateway.
//!
//! Exposed on a localhost-only listener at `/metrics`. Request counters are
//! recorded by the handlers; runtime counters (ledger appends, effect-append
//! failures, idempotent replays, live subscribers) are sampled from the
//! runtime at scrape time.

use std::sync::atomic::Ordering;

use prometheus::{CounterVec, Encoder, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;
use ubl_core::runtime::RuntimeCounters;

/// Errors from metrics registration or encoding.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Failed to register a metric.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Gateway metric families.
pub struct GatewayMetrics {
    registry: Registry,
    /// HTTP requests by endpoint and outcome code.
    http_requests_total: CounterVec,
    /// JSON-RPC requests by method and outcome code.
    rpc_requests_total: CounterVec,
    /// Atoms appended across all shards.
    ledger_appends_total: IntGauge,
    /// Effect appends that failed after their action committed.
    effect_append_failures_total: IntGauge,
    /// Sends answered from the idempotency window.
    idempotent_replays_total: IntGauge,
    /// Live SSE subscribers.
    sse_subscribers_active: IntGauge,
}

impl GatewayMetrics {
    /// Creates and registers all metric families.
    ///
    /// # Errors
    ///
    /// Returns an error when a metric fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("ubl_http_requests_total", "HTTP requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let rpc_requests_total = CounterVec::new(
            Opts::new("ubl_rpc_requests_total", "JSON-RPC requests by method and outcome"),
            &["method", "outcome"],
        )?;
        registry.register(Box::new(rpc_requests_total.clone()))?;

        let ledger_appends_total = IntGauge::new(
            "ubl_ledger_appends_total",
            "Atoms appended across all ledger shards",
        )?;
        registry.register(Box::new(ledger_appends_total.clone()))?;

        let effect_append_failures_total = IntGauge::new(
            "ubl_effect_append_failures_total",
            "Effect appends that failed after their action committed",
        )?;
        registry.register(Box::new(effect_append_failures_total.clone()))?;

        let idempotent_replays_total = IntGauge::new(
            "ubl_idempotent_replays_total",
            "Message sends answered from the idempotency window",
        )?;
        registry.register(Box::new(idempotent_replays_total.clone()))?;

        let sse_subscribers_active = IntGauge::new(
            "ubl_sse_subscribers_active",
            "Live SSE subscribers across all rooms",
        )?;
        registry.register(Box::new(sse_subscribers_active.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            rpc_requests_total,
            ledger_appends_total,
            effect_append_failures_total,
            idempotent_replays_total,
            sse_subscribers_active,
        })
    }

    /// Records one HTTP request outcome.
    pub fn record_http(&self, endpoint: &str, outcome: &str) {
        self.http_requests_total
            .with_label_values(&[endpoint, outcome])
            .inc();
    }

    /// Records one JSON-RPC request outcome.
    pub fn record_rpc(&self, method: &str, outcome: &str) {
        self.rpc_requests_total
            .with_label_values(&[method, outcome])
            .inc();
    }

    /// Samples runtime counters and encodes everything in Prometheus text
    /// format.
    ///
    /// # Errors
    ///
    /// Returns an error when encoding fails.
    #[allow(clippy::cast_possible_wrap)] // Counters stay far below i64::MAX.
    pub fn encode_text(&self, counters: &RuntimeCounters) -> Result<String, MetricsError> {
        self.ledger_appends_total
            .set(counters.ledger_appends.load(Ordering::Relaxed) as i64);
        self.effect_append_failures_total
            .set(counters.effect_append_failures.load(Ordering::Relaxed) as i64);
        self.idempotent_replays_total
            .set(counters.idempotent_replays.load(Ordering::Relaxed) as i64);
        self.sse_subscribers_active
            .set(counters.sse_subscribers.load(Ordering::Relaxed) as i64);

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
