//! Prometheus Metrics for the Orchestration Core
//! Breaker states, retry attempts, saga outcomes and compensations

use once_cell::sync::Lazy;
use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Global metrics registry
static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Application metrics
pub struct Metrics {
    pub circuit_breaker_state: GaugeVec,
    pub circuit_breaker_calls_total: CounterVec,
    pub retry_attempts_total: CounterVec,
    pub fallback_resolutions_total: CounterVec,
    pub transactions_total: CounterVec,
    pub active_transactions: Gauge,
    pub compensations_total: CounterVec,
}

static METRICS: Lazy<Mutex<Option<Metrics>>> = Lazy::new(|| Mutex::new(None));

/// Initialize metrics. Calling it twice is an error from the registry.
pub fn init_metrics(service_name: &str) -> anyhow::Result<()> {
    let circuit_breaker_state = GaugeVec::new(
        Opts::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=closed, 0.5=half-open, 1=open)",
        )
        .namespace("orchestration")
        .const_label("service", service_name),
        &["name"],
    )?;

    let circuit_breaker_calls_total = CounterVec::new(
        Opts::new("circuit_breaker_calls_total", "Calls through a circuit breaker")
            .namespace("orchestration")
            .const_label("service", service_name),
        &["name", "outcome"], // success, failure, timeout, rejected
    )?;

    let retry_attempts_total = CounterVec::new(
        Opts::new("retry_attempts_total", "Total retry attempts")
            .namespace("orchestration")
            .const_label("service", service_name),
        &["operation", "outcome"],
    )?;

    let fallback_resolutions_total = CounterVec::new(
        Opts::new("fallback_resolutions_total", "Failures resolved by a fallback source")
            .namespace("orchestration")
            .const_label("service", service_name),
        &["source"],
    )?;

    let transactions_total = CounterVec::new(
        Opts::new("transactions_total", "Saga transactions by final state")
            .namespace("orchestration")
            .const_label("service", service_name),
        &["state"],
    )?;

    let active_transactions = Gauge::with_opts(
        Opts::new("active_transactions", "Saga transactions currently tracked")
            .namespace("orchestration")
            .const_label("service", service_name),
    )?;

    let compensations_total = CounterVec::new(
        Opts::new("compensations_total", "Compensating actions by outcome")
            .namespace("orchestration")
            .const_label("service", service_name),
        &["outcome"],
    )?;

    // Register all metrics
    REGISTRY.register(Box::new(circuit_breaker_state.clone()))?;
    REGISTRY.register(Box::new(circuit_breaker_calls_total.clone()))?;
    REGISTRY.register(Box::new(retry_attempts_total.clone()))?;
    REGISTRY.register(Box::new(fallback_resolutions_total.clone()))?;
    REGISTRY.register(Box::new(transactions_total.clone()))?;
    REGISTRY.register(Box::new(active_transactions.clone()))?;
    REGISTRY.register(Box::new(compensations_total.clone()))?;

    let metrics = Metrics {
        circuit_breaker_state,
        circuit_breaker_calls_total,
        retry_attempts_total,
        fallback_resolutions_total,
        transactions_total,
        active_transactions,
        compensations_total,
    };

    *get_metrics() = Some(metrics);

    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

/// Get metrics instance; `None` until [`init_metrics`] has run.
pub fn get_metrics() -> MutexGuard<'static, Option<Metrics>> {
    METRICS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Encode metrics to Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap_or_default();
    String::from_utf8(buffer).unwrap_or_default()
}
