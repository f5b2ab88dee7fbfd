//! Configuration Module
//! Loads breaker and saga defaults from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::resilience::CircuitBreakerOptions;
use crate::transaction::TransactionOptions;

#[derive(Debug, Clone)]
pub struct Config {
    pub circuit_breaker: CircuitBreakerOptions,
    pub transaction: TransactionOptions,
    pub metrics_port: u16,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Unset or unparsable variables fall back to the built-in defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let breaker = CircuitBreakerOptions::default();
        let saga = TransactionOptions::default();

        // SAGA_TIMEOUT_MS=0 disables the global deadline
        let saga_timeout_ms: u64 = env_or(
            "SAGA_TIMEOUT_MS",
            saga.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
        );

        let config = Self {
            circuit_breaker: CircuitBreakerOptions {
                timeout_ms: env_or("CB_TIMEOUT_MS", breaker.timeout_ms),
                error_threshold_percentage: env_or(
                    "CB_ERROR_THRESHOLD_PERCENTAGE",
                    breaker.error_threshold_percentage,
                ),
                request_volume_threshold: env_or(
                    "CB_REQUEST_VOLUME_THRESHOLD",
                    breaker.request_volume_threshold,
                ),
                sleep_window_ms: env_or("CB_SLEEP_WINDOW_MS", breaker.sleep_window_ms),
                bucket_size_ms: env_or("CB_BUCKET_SIZE_MS", breaker.bucket_size_ms),
                bucket_num: env_or("CB_BUCKET_NUM", breaker.bucket_num),
                max_half_open_requests: env_or(
                    "CB_MAX_HALF_OPEN_REQUESTS",
                    breaker.max_half_open_requests,
                ),
            },
            transaction: TransactionOptions {
                timeout: (saga_timeout_ms > 0).then(|| Duration::from_millis(saga_timeout_ms)),
                max_retries: env_or("SAGA_MAX_RETRIES", saga.max_retries),
                retry_delay: Duration::from_millis(env_or(
                    "SAGA_RETRY_DELAY_MS",
                    saga.retry_delay.as_millis() as u64,
                )),
                max_retry_delay: saga.max_retry_delay,
                compensate_on_timeout: env_or(
                    "SAGA_COMPENSATE_ON_TIMEOUT",
                    saga.compensate_on_timeout,
                ),
            },
            metrics_port: env_or("METRICS_PORT", 9100),
        };

        if config.circuit_breaker.bucket_num == 0 {
            anyhow::bail!("CB_BUCKET_NUM must be at least 1");
        }
        if !(0.0..=100.0).contains(&config.circuit_breaker.error_threshold_percentage) {
            anyhow::bail!("CB_ERROR_THRESHOLD_PERCENTAGE must be within 0..=100");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("ORCH_TEST_GARBAGE_U64", "not-a-number");
        assert_eq!(env_or("ORCH_TEST_GARBAGE_U64", 7u64), 7);
        env::set_var("ORCH_TEST_GARBAGE_U64", "42");
        assert_eq!(env_or("ORCH_TEST_GARBAGE_U64", 7u64), 42);
        env::remove_var("ORCH_TEST_GARBAGE_U64");
    }

    #[test]
    fn test_missing_variables_use_defaults() {
        let config = Config::from_env().unwrap();
        assert!(config.circuit_breaker.bucket_num >= 1);
        assert!(config.metrics_port > 0);
    }
}
