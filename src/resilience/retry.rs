//! Retry with Backoff
//! Bounded attempts, linear or exponential delays, error classification

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::timeout::{with_optional_timeout, TimeoutError};
use crate::observability::metrics::get_metrics;

/// Network error codes treated as transient.
pub const RETRYABLE_NETWORK_CODES: &[&str] = &["ECONNREFUSED", "ETIMEDOUT", "ENOTFOUND", "ENETUNREACH"];

/// Error shape produced by datastore adapters so retry classification can
/// see network codes and HTTP statuses.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DependencyError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl DependencyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Retries were exhausted or an error was classified as permanent.
#[derive(Error)]
#[error("{message}")]
pub struct RetryError {
    pub message: String,
    pub attempts: u32,
    /// Every error observed, oldest first.
    pub errors: Vec<anyhow::Error>,
}

impl RetryError {
    pub fn last_error(&self) -> Option<&anyhow::Error> {
        self.errors.last()
    }

    pub fn into_last_error(mut self) -> Option<anyhow::Error> {
        self.errors.pop()
    }
}

impl fmt::Debug for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryError")
            .field("message", &self.message)
            .field("attempts", &self.attempts)
            .field(
                "errors",
                &self.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Linear,
    Exponential,
}

pub type RetryOnFn = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;
pub type ShouldRetryFn = Arc<dyn Fn(&anyhow::Error, u32) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub retry_on: Option<RetryOnFn>,
    /// Takes precedence over `retry_on` when both are set.
    pub should_retry: Option<ShouldRetryFn>,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryPreset::Standard.policy().into()
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .field("retry_on", &self.retry_on.is_some())
            .field("should_retry", &self.should_retry.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RetryOptions {
    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn is_retryable(&self, error: &anyhow::Error, attempt: u32) -> bool {
        if let Some(should_retry) = &self.should_retry {
            return should_retry(error, attempt);
        }
        if let Some(retry_on) = &self.retry_on {
            return retry_on(error);
        }
        is_transient(error)
    }
}

/// Serializable retry settings; the numeric half of [`RetryOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: Backoff,
}

impl From<RetryPolicy> for RetryOptions {
    fn from(policy: RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            delay: Duration::from_millis(policy.delay_ms),
            max_delay: Duration::from_millis(policy.max_delay_ms),
            backoff: policy.backoff,
            retry_on: None,
            should_retry: None,
            timeout: None,
        }
    }
}

/// Named settings for common call classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryPreset {
    Quick,
    Standard,
    Aggressive,
    Database,
    Network,
    RateLimited,
}

impl RetryPreset {
    pub const ALL: [RetryPreset; 6] = [
        RetryPreset::Quick,
        RetryPreset::Standard,
        RetryPreset::Aggressive,
        RetryPreset::Database,
        RetryPreset::Network,
        RetryPreset::RateLimited,
    ];

    pub fn policy(self) -> RetryPolicy {
        let (max_attempts, delay_ms, max_delay_ms, backoff) = match self {
            RetryPreset::Quick => (2, 100, 500, Backoff::Linear),
            RetryPreset::Standard => (3, 1_000, 10_000, Backoff::Exponential),
            RetryPreset::Aggressive => (5, 500, 30_000, Backoff::Exponential),
            RetryPreset::Database => (3, 500, 5_000, Backoff::Exponential),
            RetryPreset::Network => (4, 1_000, 15_000, Backoff::Exponential),
            RetryPreset::RateLimited => (5, 2_000, 60_000, Backoff::Exponential),
        };
        RetryPolicy {
            max_attempts,
            delay_ms,
            max_delay_ms,
            backoff,
        }
    }

    pub fn options(self) -> RetryOptions {
        let options: RetryOptions = self.policy().into();
        match self {
            RetryPreset::RateLimited => options.retry_on(|e| has_status(e, 429) || is_transient(e)),
            _ => options,
        }
    }
}

fn has_status(error: &anyhow::Error, status: u16) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<DependencyError>())
        .any(|e| e.status == Some(status))
}

/// Default classifier: network failures, 5xx/429/408, and timeouts.
pub fn is_transient(error: &anyhow::Error) -> bool {
    for cause in error.chain() {
        if let Some(dep) = cause.downcast_ref::<DependencyError>() {
            if let Some(code) = dep.code.as_deref() {
                if RETRYABLE_NETWORK_CODES.contains(&code) {
                    return true;
                }
            }
            if let Some(status) = dep.status {
                if status >= 500 || status == 429 || status == 408 {
                    return true;
                }
            }
        }

        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            if matches!(
                io.kind(),
                ConnectionRefused | TimedOut | ConnectionReset | ConnectionAborted | NotConnected
            ) {
                return true;
            }
        }

        if cause.is::<TimeoutError>() {
            return true;
        }
    }

    let message = format!("{:#}", error).to_lowercase();
    message.contains("connection") || message.contains("timeout")
}

/// Delay to wait after failed attempt number `attempt` (1-based).
///
/// Exponential adds 0-25% jitter. The result never exceeds `max_delay`.
pub fn compute_delay(attempt: u32, options: &RetryOptions) -> Duration {
    let attempt = attempt.max(1);
    let base_ms = options.delay.as_millis() as u64;
    let max_ms = options.max_delay.as_millis() as u64;

    match options.backoff {
        Backoff::Exponential => {
            let factor = 2u64.saturating_pow(attempt - 1);
            let capped = base_ms.saturating_mul(factor).min(max_ms);
            let jitter = (capped as f64 * rand::thread_rng().gen_range(0.0..=0.25)) as u64;
            Duration::from_millis(capped.saturating_add(jitter).min(max_ms))
        }
        Backoff::Linear => Duration::from_millis(base_ms.saturating_mul(attempt as u64).min(max_ms)),
    }
}

fn record_attempt(operation: &str, outcome: &str) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .retry_attempts_total
            .with_label_values(&[operation, outcome])
            .inc();
    }
}

/// Execute an async operation with retry logic
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    options: &RetryOptions,
    mut f: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = options.max_attempts.max(1);
    let mut errors: Vec<anyhow::Error> = Vec::new();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match with_optional_timeout(options.timeout, f()).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = operation,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                record_attempt(operation, "success");
                return Ok(result);
            }
            Err(e) => {
                let retryable = options.is_retryable(&e, attempt);

                if !retryable || attempt >= max_attempts {
                    let reason = if retryable { "exhausted" } else { "not_retryable" };
                    warn!(
                        operation = operation,
                        attempt = attempt,
                        reason = reason,
                        error = %e,
                        "Operation failed after all retries"
                    );
                    record_attempt(operation, reason);

                    let message = format!(
                        "Operation '{}' failed after {} attempt(s): {}",
                        operation, attempt, e
                    );
                    errors.push(e);
                    return Err(RetryError {
                        message,
                        attempts: attempt,
                        errors,
                    });
                }

                let delay = compute_delay(attempt, options);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                record_attempt(operation, "retry");
                errors.push(e);

                sleep(delay).await;
            }
        }
    }
}
