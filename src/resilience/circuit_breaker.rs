//! Circuit Breaker Implementation
//! Fails fast when a dependency's rolling error rate crosses a threshold
//!
//! ```text
//! CLOSED --(volume & error% reached)--> OPEN
//! OPEN --(sleep window elapsed / healthy probe)--> HALF_OPEN
//! HALF_OPEN --(probe success)--> CLOSED
//! HALF_OPEN --(probe failure)--> OPEN
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::EventListeners;
use super::rolling_window::{Outcome, RollingWindow};
use super::timeout::TimeoutError;
use crate::observability::metrics::get_metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 1.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Short-circuit rejection, or a fallback that failed after a rejection or
/// an operation error.
#[derive(Error)]
#[error("{message}")]
pub struct CircuitBreakerError {
    pub message: String,
    pub state: CircuitState,
    pub original_error: Option<anyhow::Error>,
}

impl fmt::Debug for CircuitBreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerError")
            .field("message", &self.message)
            .field("state", &self.state)
            .field("original_error", &self.original_error.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOptions {
    pub timeout_ms: u64,
    pub error_threshold_percentage: f64,
    pub request_volume_threshold: u64,
    pub sleep_window_ms: u64,
    pub bucket_size_ms: u64,
    pub bucket_num: usize,
    pub max_half_open_requests: u32,
}

impl Default for CircuitBreakerOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            error_threshold_percentage: 50.0,
            request_volume_threshold: 20,
            sleep_window_ms: 5_000,
            bucket_size_ms: 1_000,
            bucket_num: 10,
            max_half_open_requests: 1,
        }
    }
}

impl CircuitBreakerOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sleep_window(&self) -> Duration {
        Duration::from_millis(self.sleep_window_ms)
    }

    pub fn bucket_size(&self) -> Duration {
        Duration::from_millis(self.bucket_size_ms.max(1))
    }

    pub fn window_length(&self) -> Duration {
        self.bucket_size() * self.bucket_num.max(1) as u32
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub request_count: u64,
    pub error_count: u64,
    pub success_count: u64,
    pub timeout_count: u64,
    pub error_percentage: f64,
    pub avg_response_time_ms: f64,
    pub last_error: Option<String>,
    pub last_state_change: DateTime<Utc>,
    /// Only set while OPEN.
    pub next_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum BreakerEvent {
    StateChange { from: CircuitState, to: CircuitState },
    Success { elapsed: Duration },
    Failure { error: String, elapsed: Duration },
    Timeout { elapsed: Duration },
    /// A call was admitted as a half-open probe.
    Retry { probes_in_flight: u32 },
    Reject { state: CircuitState },
}

pub type BreakerFallback =
    Arc<dyn Fn(Option<&anyhow::Error>) -> BoxFuture<'static, anyhow::Result<Box<dyn Any + Send>>> + Send + Sync>;
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

type NoFallback<T> = fn(Option<&anyhow::Error>) -> std::future::Ready<anyhow::Result<T>>;

struct BreakerInner {
    state: CircuitState,
    window: RollingWindow,
    last_error: Option<String>,
    last_state_change: DateTime<Utc>,
    next_attempt: Option<Instant>,
    half_open_in_flight: u32,
    /// Bumped on every transition; a trial call only counts for the half-open
    /// period it was admitted in.
    epoch: u64,
}

/// Half-open slot held by an admitted trial call. Dropping it without an
/// outcome (the call future was cancelled) hands the slot back.
struct TrialSlot {
    inner: Arc<Mutex<BreakerInner>>,
    epoch: u64,
    settled: bool,
}

impl TrialSlot {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for TrialSlot {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let epoch = self.epoch;
        match self.inner.try_lock() {
            Ok(mut inner) => release_trial(&mut inner, epoch),
            Err(_) => {
                let inner = self.inner.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        release_trial(&mut *inner.lock().await, epoch);
                    });
                }
            }
        }
    }
}

fn release_trial(inner: &mut BreakerInner, epoch: u64) {
    if inner.state == CircuitState::HalfOpen && inner.epoch == epoch && inner.half_open_in_flight > 0 {
        inner.half_open_in_flight -= 1;
        debug!(half_open_in_flight = inner.half_open_in_flight, "Abandoned half-open call released its slot");
    }
}

pub struct CircuitBreaker {
    name: String,
    options: CircuitBreakerOptions,
    inner: Arc<Mutex<BreakerInner>>,
    fallback: Option<BreakerFallback>,
    health_probe: Option<HealthProbe>,
    listeners: EventListeners<BreakerEvent>,
    rotation: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreaker {
    /// Must be called within a Tokio runtime: bucket rotation runs on a
    /// background task every `bucket_size` until the breaker is destroyed
    /// or dropped.
    pub fn new(name: impl Into<String>, options: CircuitBreakerOptions) -> Self {
        let inner = Arc::new(Mutex::new(BreakerInner {
            state: CircuitState::Closed,
            window: RollingWindow::new(options.bucket_num),
            last_error: None,
            last_state_change: Utc::now(),
            next_attempt: None,
            half_open_in_flight: 0,
            epoch: 0,
        }));

        let rotation = spawn_rotation(Arc::downgrade(&inner), options.bucket_size());

        Self {
            name: name.into(),
            options,
            inner,
            fallback: None,
            health_probe: None,
            listeners: EventListeners::new(),
            rotation: std::sync::Mutex::new(Some(rotation)),
        }
    }

    /// Fallback used when a call is rejected or fails. A value of a type
    /// other than the call's `T` counts as a failed fallback.
    pub fn with_fallback<T, F, Fut>(mut self, fallback: F) -> Self
    where
        T: Send + 'static,
        F: Fn(Option<&anyhow::Error>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |error| {
            let fut = fallback(error);
            async move { fut.await.map(|value| Box::new(value) as Box<dyn Any + Send>) }.boxed()
        }));
        self
    }

    pub fn with_health_check<F, Fut>(mut self, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.health_probe = Some(Arc::new(move || probe().boxed()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CircuitBreakerOptions {
        &self.options
    }

    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&BreakerEvent) + Send + Sync + 'static,
    {
        self.listeners.on(listener);
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> anyhow::Result<T>
    where
        T: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.call(op, None::<NoFallback<T>>).await
    }

    /// Like [`execute`](Self::execute) but `fallback` is tried before the
    /// configured one.
    pub async fn execute_with_fallback<T, F, Fut, FB, FBFut>(&self, op: F, fallback: FB) -> anyhow::Result<T>
    where
        T: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        FB: FnOnce(Option<&anyhow::Error>) -> FBFut,
        FBFut: Future<Output = anyhow::Result<T>>,
    {
        self.call(op, Some(fallback)).await
    }

    async fn call<T, F, Fut, FB, FBFut>(&self, op: F, fallback: Option<FB>) -> anyhow::Result<T>
    where
        T: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        FB: FnOnce(Option<&anyhow::Error>) -> FBFut,
        FBFut: Future<Output = anyhow::Result<T>>,
    {
        let trial = match self.admit().await {
            Ok(trial) => trial,
            Err(state) => {
                debug!(name = %self.name, state = %state, "Call rejected by circuit breaker");
                self.record_call("rejected");
                self.listeners.emit(&BreakerEvent::Reject { state });
                return self.resolve(fallback, None, state).await;
            }
        };
        let slot = trial.map(|epoch| TrialSlot {
            inner: self.inner.clone(),
            epoch,
            settled: false,
        });

        let started = Instant::now();
        let result = tokio::time::timeout(self.options.timeout(), op()).await;
        let elapsed = started.elapsed();

        let error = match result {
            Ok(Ok(value)) => {
                self.on_success(elapsed, trial).await;
                if let Some(slot) = slot {
                    slot.settle();
                }
                return Ok(value);
            }
            Ok(Err(e)) => {
                self.on_failure(Outcome::Failure, &e, elapsed, trial).await;
                e
            }
            Err(_) => {
                let e = anyhow::Error::new(TimeoutError {
                    duration: self.options.timeout(),
                });
                self.on_failure(Outcome::Timeout, &e, elapsed, trial).await;
                e
            }
        };
        if let Some(slot) = slot {
            slot.settle();
        }

        let state = self.state().await;
        self.resolve(fallback, Some(error), state).await
    }

    /// Decide whether a call may proceed; `Ok(Some(epoch))` marks a
    /// half-open trial call, `Err` carries the rejecting state.
    async fn admit(&self) -> Result<Option<u64>, CircuitState> {
        let mut events = Vec::new();
        let admission = {
            let mut inner = self.inner.lock().await;

            if inner.state == CircuitState::Open {
                let ready = inner.next_attempt.map_or(true, |at| Instant::now() >= at);
                if ready {
                    self.transition(&mut inner, CircuitState::HalfOpen, &mut events);
                }
            }

            match inner.state {
                CircuitState::Closed => Ok(None),
                CircuitState::Open => Err(CircuitState::Open),
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.options.max_half_open_requests {
                        inner.half_open_in_flight += 1;
                        events.push(BreakerEvent::Retry {
                            probes_in_flight: inner.half_open_in_flight,
                        });
                        Ok(Some(inner.epoch))
                    } else {
                        Err(CircuitState::HalfOpen)
                    }
                }
            }
        };

        self.emit_all(&events);
        admission
    }

    async fn on_success(&self, elapsed: Duration, trial: Option<u64>) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.window.record(Outcome::Success, elapsed);
            if inner.state == CircuitState::HalfOpen && trial == Some(inner.epoch) {
                self.transition(&mut inner, CircuitState::Closed, &mut events);
            }
        }
        self.record_call("success");
        events.push(BreakerEvent::Success { elapsed });
        self.emit_all(&events);
    }

    async fn on_failure(&self, outcome: Outcome, error: &anyhow::Error, elapsed: Duration, trial: Option<u64>) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            inner.window.record(outcome, elapsed);
            inner.last_error = Some(error.to_string());

            match inner.state {
                // a single failed trial reopens; calls admitted while CLOSED do not
                CircuitState::HalfOpen if trial == Some(inner.epoch) => {
                    self.transition(&mut inner, CircuitState::Open, &mut events);
                }
                CircuitState::Closed if self.should_trip(&inner) => {
                    self.transition(&mut inner, CircuitState::Open, &mut events);
                }
                _ => {}
            }
        }

        match outcome {
            Outcome::Timeout => {
                warn!(name = %self.name, elapsed_ms = elapsed.as_millis() as u64, "Circuit breaker call timed out");
                self.record_call("timeout");
                events.push(BreakerEvent::Timeout { elapsed });
            }
            _ => {
                debug!(name = %self.name, error = %error, "Circuit breaker call failed");
                self.record_call("failure");
                events.push(BreakerEvent::Failure {
                    error: error.to_string(),
                    elapsed,
                });
            }
        }
        self.emit_all(&events);
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        let totals = inner.window.aggregate();
        totals.request_count >= self.options.request_volume_threshold
            && totals.error_percentage >= self.options.error_threshold_percentage
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, events: &mut Vec<BreakerEvent>) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.last_state_change = Utc::now();
        inner.half_open_in_flight = 0;
        inner.epoch = inner.epoch.wrapping_add(1);

        match to {
            CircuitState::Open => {
                inner.next_attempt = Some(Instant::now() + self.options.sleep_window());
                let totals = inner.window.aggregate();
                warn!(
                    name = %self.name,
                    from = %from,
                    request_count = totals.request_count,
                    error_percentage = totals.error_percentage,
                    sleep_window_ms = self.options.sleep_window_ms,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.next_attempt = None;
                info!(name = %self.name, "Circuit breaker transitioning to half-open");
            }
            CircuitState::Closed => {
                inner.next_attempt = None;
                // stale failures must not re-trip a recovered dependency
                inner.window.clear();
                info!(name = %self.name, from = %from, "Circuit breaker closed");
            }
        }

        if let Some(ref metrics) = *get_metrics() {
            metrics
                .circuit_breaker_state
                .with_label_values(&[self.name.as_str()])
                .set(to.gauge_value());
        }

        events.push(BreakerEvent::StateChange { from, to });
    }

    async fn resolve<T, FB, FBFut>(
        &self,
        fallback: Option<FB>,
        error: Option<anyhow::Error>,
        state: CircuitState,
    ) -> anyhow::Result<T>
    where
        T: 'static,
        FB: FnOnce(Option<&anyhow::Error>) -> FBFut,
        FBFut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(fallback) = fallback {
            let result = fallback(error.as_ref()).await;
            return result.map_err(|fb_err| self.fallback_failed(fb_err, error, state));
        }

        if let Some(fallback) = &self.fallback {
            let result = fallback(error.as_ref()).await;
            return match result {
                Ok(boxed) => match boxed.downcast::<T>() {
                    Ok(value) => Ok(*value),
                    Err(_) => Err(CircuitBreakerError {
                        message: format!(
                            "Circuit breaker '{}' fallback returned an incompatible type",
                            self.name
                        ),
                        state,
                        original_error: error,
                    }
                    .into()),
                },
                Err(fb_err) => Err(self.fallback_failed(fb_err, error, state)),
            };
        }

        match error {
            Some(e) => Err(e),
            None => Err(CircuitBreakerError {
                message: format!("Circuit breaker '{}' is {}", self.name, state),
                state,
                original_error: None,
            }
            .into()),
        }
    }

    fn fallback_failed(
        &self,
        fallback_error: anyhow::Error,
        original_error: Option<anyhow::Error>,
        state: CircuitState,
    ) -> anyhow::Error {
        warn!(name = %self.name, error = %fallback_error, "Circuit breaker fallback failed");
        CircuitBreakerError {
            message: format!(
                "Circuit breaker '{}' fallback failed: {}",
                self.name, fallback_error
            ),
            state,
            original_error,
        }
        .into()
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock().await;
        let totals = inner.window.aggregate();

        let next_attempt = match (inner.state, inner.next_attempt) {
            (CircuitState::Open, Some(at)) => {
                let remaining = at.saturating_duration_since(Instant::now());
                let remaining = chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
                Some(Utc::now() + remaining)
            }
            _ => None,
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            request_count: totals.request_count,
            error_count: totals.error_count,
            success_count: totals.success_count,
            timeout_count: totals.timeout_count,
            error_percentage: totals.error_percentage,
            avg_response_time_ms: totals.avg_response_time_ms,
            last_error: inner.last_error.clone(),
            last_state_change: inner.last_state_change,
            next_attempt,
        }
    }

    /// Force CLOSED and clear all buckets.
    pub async fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            self.transition(&mut inner, CircuitState::Closed, &mut events);
            inner.window.clear();
            inner.last_error = None;
        }
        info!(name = %self.name, "Circuit breaker reset");
        self.emit_all(&events);
    }

    /// Force OPEN for a full sleep window.
    pub async fn trip(&self) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            self.transition(&mut inner, CircuitState::Open, &mut events);
            inner.next_attempt = Some(Instant::now() + self.options.sleep_window());
        }
        self.emit_all(&events);
    }

    /// Probe the external health signal. A healthy signal while OPEN lets
    /// the next call through as a half-open probe without waiting out the
    /// sleep window. Without a probe configured this reports healthy.
    pub async fn health_check(&self) -> bool {
        let Some(probe) = &self.health_probe else {
            return true;
        };

        let healthy = probe().await;
        if healthy {
            let mut events = Vec::new();
            {
                let mut inner = self.inner.lock().await;
                if inner.state == CircuitState::Open {
                    self.transition(&mut inner, CircuitState::HalfOpen, &mut events);
                }
            }
            self.emit_all(&events);
        } else {
            warn!(name = %self.name, "Health check reported dependency unhealthy");
        }
        healthy
    }

    /// Stop bucket rotation and drop all listeners.
    pub fn destroy(&self) {
        if let Some(handle) = self
            .rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.listeners.clear();
        debug!(name = %self.name, "Circuit breaker destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.rotation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn emit_all(&self, events: &[BreakerEvent]) {
        for event in events {
            self.listeners.emit(event);
        }
    }

    fn record_call(&self, outcome: &str) {
        if let Some(ref metrics) = *get_metrics() {
            metrics
                .circuit_breaker_calls_total
                .with_label_values(&[self.name.as_str(), outcome])
                .inc();
        }
    }
}

impl Drop for CircuitBreaker {
    fn drop(&mut self) {
        if let Some(handle) = self
            .rotation
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn spawn_rotation(inner: std::sync::Weak<Mutex<BreakerInner>>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.lock().await.window.rotate();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options() -> CircuitBreakerOptions {
        CircuitBreakerOptions {
            timeout_ms: 100,
            error_threshold_percentage: 50.0,
            request_volume_threshold: 2,
            sleep_window_ms: 1_000,
            bucket_size_ms: 1_000,
            bucket_num: 10,
            max_half_open_requests: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("slow", options());

        let result: anyhow::Result<()> = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is::<TimeoutError>());
        let stats = breaker.stats().await;
        assert_eq!(stats.timeout_count, 1);
        assert_eq!(stats.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_fallback_type_mismatch() {
        let breaker = CircuitBreaker::new("typed", options()).with_fallback(|_| async { Ok(42u32) });
        breaker.trip().await;

        let matching: u32 = breaker.execute(|| async { Ok(1u32) }).await.unwrap();
        assert_eq!(matching, 42);

        let mismatched: anyhow::Result<String> = breaker.execute(|| async { Ok("x".to_string()) }).await;
        let err = mismatched.unwrap_err();
        assert!(err.downcast_ref::<CircuitBreakerError>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_ages_out_failures() {
        let breaker = CircuitBreaker::new(
            "aging",
            CircuitBreakerOptions {
                bucket_num: 2,
                request_volume_threshold: 100,
                ..options()
            },
        );

        let _ = breaker.execute(|| async { Err::<(), _>(anyhow::anyhow!("x")) }).await;
        assert_eq!(breaker.stats().await.request_count, 1);

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(breaker.stats().await.request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_rotation() {
        let breaker = CircuitBreaker::new("disposable", options());
        let events = Arc::new(AtomicU32::new(0));
        let counter = events.clone();
        breaker.on(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        breaker.destroy();
        assert!(breaker.is_destroyed());

        breaker.trip().await;
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }
}
