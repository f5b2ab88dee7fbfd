//! Orchestration Core - Service Entry Point
//! Wires configuration, observability, breakers and the transaction manager

use orchestration_core::config::Config;
use orchestration_core::observability::{
    self,
    health::{start_health_server, HealthState},
};
use orchestration_core::resilience::CircuitBreakerRegistry;
use orchestration_core::transaction::TransactionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    observability::init_observability("orchestration-core")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Orchestration Core..."
    );

    let registry = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
    let transactions = Arc::new(TransactionManager::new(config.transaction.clone()));
    let ready = Arc::new(AtomicBool::new(true));

    info!(
        breaker_timeout_ms = config.circuit_breaker.timeout_ms,
        error_threshold = config.circuit_breaker.error_threshold_percentage,
        saga_max_retries = config.transaction.max_retries,
        "Resilience defaults loaded"
    );

    let health_state = HealthState {
        registry: registry.clone(),
        transactions: transactions.clone(),
        ready: ready.clone(),
    };

    let metrics_port = config.metrics_port;
    let health_server = tokio::spawn(async move {
        if let Err(e) = start_health_server(metrics_port, health_state).await {
            error!(error = %e, "Health server failed");
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("Received shutdown signal");
    ready.store(false, Ordering::Relaxed);

    // compensate in-flight sagas before tearing down breakers
    transactions.abort_all("service shutdown").await;
    registry.destroy_all();
    health_server.abort();

    observability::shutdown_observability();
    info!(
        finished_transactions = transactions.get_history().len(),
        "Orchestration Core stopped"
    );
    Ok(())
}
