//! Saga Transaction Types
//! Lifecycle states, options, results and events

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// `PENDING -> RUNNING -> COMMITTING -> COMMITTED`, or
/// `RUNNING -> ROLLING_BACK -> ROLLED_BACK | FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Pending,
    Running,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Pending => "PENDING",
            TransactionState::Running => "RUNNING",
            TransactionState::Committing => "COMMITTING",
            TransactionState::Committed => "COMMITTED",
            TransactionState::RollingBack => "ROLLING_BACK",
            TransactionState::RolledBack => "ROLLED_BACK",
            TransactionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Failed
        )
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    #[error("Transaction '{id}' cannot {operation} in state {state}")]
    InvalidState {
        id: String,
        state: TransactionState,
        operation: &'static str,
    },
    #[error("Transaction '{0}' is already active")]
    DuplicateId(String),
    #[error("Transaction '{0}' is not active")]
    NotFound(String),
    #[error("Transaction '{id}' timed out after {}ms", duration.as_millis())]
    Timeout { id: String, duration: Duration },
    #[error("Transaction '{id}' aborted: {reason}")]
    Aborted { id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Deadline for the whole saga; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Attempt budget for a retryable step without its own `max_retries`.
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    /// Roll back executed steps when the deadline fires.
    pub compensate_on_timeout: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(2),
            compensate_on_timeout: true,
        }
    }
}

/// Outcome of [`SagaTransaction::execute`](super::SagaTransaction::execute).
#[derive(Debug)]
pub struct TransactionResult {
    pub success: bool,
    /// Result of the last step on success.
    pub data: Option<Value>,
    pub error: Option<anyhow::Error>,
    pub failed_step: Option<String>,
    /// True iff every attempted compensator succeeded.
    pub compensated: bool,
}

impl TransactionResult {
    pub(crate) fn committed(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
            failed_step: None,
            compensated: false,
        }
    }

    pub(crate) fn failed(error: anyhow::Error, failed_step: Option<String>, compensated: bool) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            failed_step,
            compensated,
        }
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone().unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    Started,
    StepStart { step: String },
    StepComplete { step: String },
    StepFail { step: String, error: String, attempts: u32 },
    CompensateStart { step: String },
    CompensateComplete { step: String },
    CompensateFail { step: String, error: String },
    TimedOut { after: Duration },
    Committed,
    Failed { state: TransactionState, error: String },
}
