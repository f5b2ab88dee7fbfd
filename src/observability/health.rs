//! Health Check & Metrics HTTP Server
//! Provides /health, /health/live, /health/ready, /metrics endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, instrument};

use super::metrics::encode_metrics;
use crate::resilience::{CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
use crate::transaction::TransactionManager;

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<CircuitBreakerRegistry>,
    pub transactions: Arc<TransactionManager>,
    pub ready: Arc<AtomicBool>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    circuit_breakers: Vec<CircuitBreakerStats>,
    transactions: TransactionSummary,
}

#[derive(Serialize)]
pub struct TransactionSummary {
    active: usize,
    finished: usize,
}

static START_TIME: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

pub fn router(state: HealthState) -> Router {
    START_TIME.get_or_init(std::time::Instant::now);

    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Start the health check and metrics HTTP server
#[instrument(skip(state))]
pub async fn start_health_server(port: u16, state: HealthState) -> anyhow::Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = port, "Health/metrics server started");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Unhealthy while any breaker is OPEN.
#[instrument(skip(state))]
async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    let breakers = state.registry.stats().await;
    let healthy = breakers.iter().all(|s| s.state != CircuitState::Open);

    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    let response = HealthResponse {
        status: if healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        circuit_breakers: breakers,
        transactions: TransactionSummary {
            active: state.transactions.active_count(),
            finished: state.transactions.get_history().len(),
        },
    };

    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(response))
}

async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

async fn readiness(State(state): State<HealthState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "reason": "shutting_down" })),
        )
    }
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        encode_metrics(),
    )
}
