//! Timeout Enforcement
//! Bounds how long a caller waits for an async operation

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Raised when the timer wins the race against an operation.
#[derive(Debug, Clone, Error)]
#[error("Operation timed out after {}ms", duration.as_millis())]
pub struct TimeoutError {
    pub duration: Duration,
}

/// Await `future` for at most `duration`.
///
/// On expiry the future is dropped, which stops it at its next await point.
/// Work it already handed to another task keeps running.
pub async fn with_timeout<T, Fut>(duration: Duration, future: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(TimeoutError { duration }.into()),
    }
}

/// Like [`with_timeout`] but a `None` duration waits indefinitely.
pub async fn with_optional_timeout<T, Fut>(duration: Option<Duration>, future: Fut) -> anyhow::Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    match duration {
        Some(d) => with_timeout(d, future).await,
        None => future.await,
    }
}
