//! Saga Transaction Executor
//! Ordered steps with per-step retry, reverse-order compensation, global deadline
//!
//! `execute()` never returns an error: failures are reported through
//! [`TransactionResult`], which callers must inspect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::step::TransactionStep;
use super::types::{
    TransactionError, TransactionEvent, TransactionOptions, TransactionResult, TransactionState,
};
use crate::observability::metrics::get_metrics;
use crate::resilience::events::EventListeners;
use crate::resilience::retry::{with_retry, Backoff, RetryOptions, RetryPolicy};

struct SagaInner {
    state: TransactionState,
    steps: Vec<Arc<TransactionStep>>,
    /// Successfully executed steps, in execution order.
    executed: Vec<Arc<TransactionStep>>,
    /// Executed steps already handed to compensation, counted from the back.
    undone: usize,
    current_step: Option<String>,
    /// An `execute()` future is alive. Cleared when it completes or is dropped.
    live: bool,
}

/// Marks the execution as gone when `execute()` returns or its future is
/// dropped, and wakes anyone waiting in `abort()`.
struct LiveExecution<'a> {
    saga: &'a SagaTransaction,
}

impl Drop for LiveExecution<'_> {
    fn drop(&mut self) {
        let abandoned = {
            let mut inner = self.saga.lock();
            inner.live = false;
            !inner.state.is_terminal()
        };
        if abandoned {
            warn!(
                transaction_id = %self.saga.id,
                state = %self.saga.state(),
                "Execution dropped before completion"
            );
        }
        self.saga.done_tx.send_replace(true);
    }
}

enum RunOutcome {
    Completed(Option<Value>),
    StepFailed { step: String, error: anyhow::Error },
    TimedOut(Duration),
    Aborted(String),
}

pub struct SagaTransaction {
    id: String,
    options: TransactionOptions,
    inner: Mutex<SagaInner>,
    listeners: EventListeners<TransactionEvent>,
    abort_tx: watch::Sender<Option<String>>,
    done_tx: watch::Sender<bool>,
}

impl SagaTransaction {
    pub fn new(options: TransactionOptions) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), options)
    }

    pub fn with_id(id: impl Into<String>, options: TransactionOptions) -> Self {
        let (abort_tx, _) = watch::channel(None);
        let (done_tx, _) = watch::channel(false);

        Self {
            id: id.into(),
            options,
            inner: Mutex::new(SagaInner {
                state: TransactionState::Pending,
                steps: Vec::new(),
                executed: Vec::new(),
                undone: 0,
                current_step: None,
                live: false,
            }),
            listeners: EventListeners::new(),
            abort_tx,
            done_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SagaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn state(&self) -> TransactionState {
        self.lock().state
    }

    pub fn step_count(&self) -> usize {
        self.lock().steps.len()
    }

    /// Names of successfully executed steps, in execution order.
    pub fn executed_steps(&self) -> Vec<String> {
        self.lock().executed.iter().map(|s| s.name.clone()).collect()
    }

    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&TransactionEvent) + Send + Sync + 'static,
    {
        self.listeners.on(listener);
    }

    /// Append a step. Only legal while PENDING.
    pub fn add_step(&self, step: TransactionStep) -> Result<&Self, TransactionError> {
        let mut inner = self.lock();
        if inner.state != TransactionState::Pending {
            return Err(TransactionError::InvalidState {
                id: self.id.clone(),
                state: inner.state,
                operation: "add steps",
            });
        }
        inner.steps.push(Arc::new(step));
        Ok(self)
    }

    fn set_state(&self, state: TransactionState) {
        self.lock().state = state;
    }

    /// Run every step in insertion order. Can be executed exactly once; a
    /// second call reports `InvalidState` without side effects.
    pub async fn execute(&self) -> TransactionResult {
        {
            let mut inner = self.lock();
            if inner.state != TransactionState::Pending {
                let err = TransactionError::InvalidState {
                    id: self.id.clone(),
                    state: inner.state,
                    operation: "execute",
                };
                drop(inner);
                warn!(transaction_id = %self.id, error = %err, "Rejected repeated execution");
                return TransactionResult::failed(err.into(), None, false);
            }
            inner.state = TransactionState::Running;
            inner.live = true;
        }
        let _live = LiveExecution { saga: self };

        let started = Instant::now();
        info!(
            transaction_id = %self.id,
            step_count = self.step_count(),
            "Starting transaction"
        );
        self.listeners.emit(&TransactionEvent::Started);

        let mut abort_rx = self.abort_tx.subscribe();
        let outcome = tokio::select! {
            biased;
            reason = wait_for_abort(&mut abort_rx) => RunOutcome::Aborted(reason),
            elapsed = deadline(self.options.timeout) => RunOutcome::TimedOut(elapsed),
            outcome = self.run_steps() => outcome,
        };

        let result = match outcome {
            RunOutcome::Completed(data) => self.commit(data),
            RunOutcome::StepFailed { step, error } => self.roll_back(error, Some(step)).await,
            RunOutcome::TimedOut(after) => self.on_timeout(after).await,
            RunOutcome::Aborted(reason) => self.on_abort(reason).await,
        };

        info!(
            transaction_id = %self.id,
            state = %self.state(),
            success = result.success,
            duration_ms = started.elapsed().as_millis() as u64,
            "Transaction finished"
        );
        result
    }

    async fn run_steps(&self) -> RunOutcome {
        let steps: Vec<Arc<TransactionStep>> = self.lock().steps.clone();
        let mut last = None;

        for step in steps {
            self.lock().current_step = Some(step.name.clone());
            debug!(transaction_id = %self.id, step = %step.name, "Executing step");
            self.listeners.emit(&TransactionEvent::StepStart {
                step: step.name.clone(),
            });

            let options = self.retry_options(&step);
            match with_retry(&step.name, &options, || step.run()).await {
                Ok(output) => {
                    {
                        let mut inner = self.lock();
                        inner.executed.push(step.clone());
                        inner.current_step = None;
                    }
                    debug!(transaction_id = %self.id, step = %step.name, "Step completed");
                    self.listeners.emit(&TransactionEvent::StepComplete {
                        step: step.name.clone(),
                    });
                    last = Some(output);
                }
                Err(retry_error) => {
                    let attempts = retry_error.attempts;
                    let message = retry_error.message.clone();
                    let error = retry_error
                        .into_last_error()
                        .unwrap_or_else(|| anyhow::anyhow!(message));

                    error!(
                        transaction_id = %self.id,
                        step = %step.name,
                        attempts = attempts,
                        error = %error,
                        "Step failed, starting compensation"
                    );
                    self.listeners.emit(&TransactionEvent::StepFail {
                        step: step.name.clone(),
                        error: error.to_string(),
                        attempts,
                    });
                    return RunOutcome::StepFailed {
                        step: step.name.clone(),
                        error,
                    };
                }
            }
        }

        RunOutcome::Completed(last)
    }

    fn retry_options(&self, step: &TransactionStep) -> RetryOptions {
        let max_attempts = if step.retryable {
            step.max_retries.unwrap_or(self.options.max_retries).max(1)
        } else {
            1
        };

        let options: RetryOptions = RetryPolicy {
            max_attempts,
            delay_ms: self.options.retry_delay.as_millis() as u64,
            max_delay_ms: self.options.max_retry_delay.as_millis() as u64,
            backoff: Backoff::Exponential,
        }
        .into();
        // a retryable step is retried on any error
        options.should_retry(|_, _| true)
    }

    fn commit(&self, data: Option<Value>) -> TransactionResult {
        self.set_state(TransactionState::Committing);
        self.set_state(TransactionState::Committed);
        record_outcome(TransactionState::Committed);
        info!(transaction_id = %self.id, "Transaction committed");
        self.listeners.emit(&TransactionEvent::Committed);
        TransactionResult::committed(data)
    }

    async fn roll_back(&self, error: anyhow::Error, failed_step: Option<String>) -> TransactionResult {
        self.set_state(TransactionState::RollingBack);
        let compensated = self.compensate().await;
        let state = if compensated {
            TransactionState::RolledBack
        } else {
            TransactionState::Failed
        };
        self.finish_failed(state, &error);
        TransactionResult::failed(error, failed_step, compensated)
    }

    async fn on_timeout(&self, after: Duration) -> TransactionResult {
        let failed_step = self.lock().current_step.clone();
        let error = anyhow::Error::new(TransactionError::Timeout {
            id: self.id.clone(),
            duration: after,
        });

        warn!(
            transaction_id = %self.id,
            step = ?failed_step,
            timeout_ms = after.as_millis() as u64,
            "Transaction timed out"
        );
        self.listeners.emit(&TransactionEvent::TimedOut { after });

        if self.options.compensate_on_timeout {
            return self.roll_back(error, failed_step).await;
        }

        self.finish_failed(TransactionState::Failed, &error);
        TransactionResult::failed(error, failed_step, false)
    }

    async fn on_abort(&self, reason: String) -> TransactionResult {
        let failed_step = self.lock().current_step.clone();
        let error = anyhow::Error::new(TransactionError::Aborted {
            id: self.id.clone(),
            reason,
        });
        warn!(transaction_id = %self.id, error = %error, "Transaction aborted");

        self.set_state(TransactionState::RollingBack);
        let compensated = self.compensate().await;
        self.finish_failed(TransactionState::Failed, &error);
        TransactionResult::failed(error, failed_step, compensated)
    }

    fn finish_failed(&self, state: TransactionState, error: &anyhow::Error) {
        self.set_state(state);
        record_outcome(state);
        self.listeners.emit(&TransactionEvent::Failed {
            state,
            error: error.to_string(),
        });
    }

    /// Undo executed steps in reverse execution order. Each compensator's
    /// failure is isolated; returns true iff every attempted one succeeded.
    /// A step is handed to compensation at most once, so a rollback cut short
    /// by a dropped `execute()` resumes where it stopped.
    async fn compensate(&self) -> bool {
        {
            let inner = self.lock();
            info!(
                transaction_id = %self.id,
                step_count = inner.executed.len() - inner.undone,
                "Starting compensation for executed steps"
            );
        }

        let mut all_succeeded = true;
        while let Some(step) = self.next_to_undo() {
            let Some(undo) = step.undo() else {
                debug!(
                    transaction_id = %self.id,
                    step = %step.name,
                    "Step has no compensation action, skipping"
                );
                continue;
            };

            self.listeners.emit(&TransactionEvent::CompensateStart {
                step: step.name.clone(),
            });

            match undo.await {
                Ok(()) => {
                    info!(transaction_id = %self.id, step = %step.name, "Compensation succeeded");
                    record_compensation("success");
                    self.listeners.emit(&TransactionEvent::CompensateComplete {
                        step: step.name.clone(),
                    });
                }
                Err(e) => {
                    all_succeeded = false;
                    error!(
                        transaction_id = %self.id,
                        step = %step.name,
                        error = %e,
                        "Compensation failed (continuing with remaining compensations)"
                    );
                    record_compensation("failure");
                    self.listeners.emit(&TransactionEvent::CompensateFail {
                        step: step.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        all_succeeded
    }

    fn next_to_undo(&self) -> Option<Arc<TransactionStep>> {
        let mut inner = self.lock();
        let index = inner.executed.len().checked_sub(inner.undone + 1)?;
        inner.undone += 1;
        Some(inner.executed[index].clone())
    }

    /// Stop a RUNNING execution: the in-flight step is dropped, executed
    /// steps are compensated and the transaction ends FAILED. Waits until
    /// `execute()` has finished.
    ///
    /// If the `execute()` future was dropped mid-run, the abort does the
    /// compensation itself. No effect on PENDING or finished transactions.
    pub async fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let live = {
            let inner = self.lock();
            match inner.state {
                TransactionState::Running => inner.live,
                TransactionState::RollingBack if !inner.live => false,
                _ => return,
            }
        };

        if live {
            let mut done = self.done_tx.subscribe();
            self.abort_tx.send_replace(Some(reason.clone()));
            let _ = done.wait_for(|finished| *finished).await;
        }

        // the execution may have been dropped instead of finishing
        if self.claim_abandoned() {
            let _live = LiveExecution { saga: self };
            self.on_abort(reason).await;
        }
    }

    /// Take over an execution whose future was dropped. Only one caller wins;
    /// the winner holds a [`LiveExecution`] for the rest of the rollback.
    fn claim_abandoned(&self) -> bool {
        let mut inner = self.lock();
        let abandoned = !inner.live
            && matches!(
                inner.state,
                TransactionState::Running | TransactionState::RollingBack
            );
        if abandoned {
            inner.state = TransactionState::RollingBack;
            inner.live = true;
        }
        abandoned
    }
}

async fn wait_for_abort(rx: &mut watch::Receiver<Option<String>>) -> String {
    let reason = rx
        .wait_for(|reason| reason.is_some())
        .await
        .ok()
        .map(|reason| reason.clone().unwrap_or_default());

    match reason {
        Some(reason) => reason,
        // sender lives as long as the transaction
        None => std::future::pending().await,
    }
}

async fn deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(after) => {
            tokio::time::sleep(after).await;
            after
        }
        None => std::future::pending().await,
    }
}

fn record_outcome(state: TransactionState) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .transactions_total
            .with_label_values(&[state.as_str()])
            .inc();
    }
}

fn record_compensation(outcome: &str) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .compensations_total
            .with_label_values(&[outcome])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_add_step_rejected_after_execute() {
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(TransactionStep::new("only", || async { Ok(1) })).unwrap();

        let result = tx.execute().await;
        assert!(result.success);
        assert_eq!(tx.state(), TransactionState::Committed);

        let err = tx
            .add_step(TransactionStep::new("late", || async { Ok(2) }))
            .err()
            .unwrap();
        assert!(matches!(err, TransactionError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_second_execute_has_no_effect() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(TransactionStep::new("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }))
        .unwrap();

        assert!(tx.execute().await.success);
        let second = tx.execute().await;

        assert!(!second.success);
        assert!(second
            .error
            .unwrap()
            .downcast_ref::<TransactionError>()
            .is_some());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_retry_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(
            TransactionStep::new("flaky", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow::anyhow!("write conflict"))
                    } else {
                        Ok("written")
                    }
                }
            })
            .max_retries(3),
        )
        .unwrap();

        let result = tx.execute().await;
        assert!(result.success);
        assert_eq!(result.data_as::<String>().unwrap(), "written");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_step_runs_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(
            TransactionStep::new("once", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("rejected")) }
            })
            .retryable(false),
        )
        .unwrap();

        let result = tx.execute().await;
        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("once"));
        assert_eq!(result.error.unwrap().to_string(), "rejected");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        // nothing executed, so nothing to undo
        assert!(result.compensated);
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }
}
