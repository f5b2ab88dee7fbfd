//! Transaction Manager
//! Tracks active sagas by id and keeps a history of finished ones

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::saga::SagaTransaction;
use super::types::{TransactionError, TransactionEvent, TransactionOptions, TransactionState};
use crate::observability::metrics::get_metrics;

/// A finished transaction.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionRecord {
    pub id: String,
    pub state: TransactionState,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct ActiveEntry {
    transaction: Arc<SagaTransaction>,
    start_time: DateTime<Utc>,
    /// Distinguishes registrations that reuse an id.
    serial: u64,
}

#[derive(Default)]
struct ManagerState {
    active: HashMap<String, ActiveEntry>,
    history: Vec<TransactionRecord>,
    next_serial: u64,
}

pub struct TransactionManager {
    state: Arc<Mutex<ManagerState>>,
    defaults: TransactionOptions,
}

impl TransactionManager {
    pub fn new(defaults: TransactionOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManagerState::default())),
            defaults,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn defaults(&self) -> &TransactionOptions {
        &self.defaults
    }

    pub fn generate_id() -> String {
        format!("tx-{}", Uuid::new_v4())
    }

    /// Register a new transaction under `id`. Fails with `DuplicateId` while
    /// another transaction with that id is still active.
    pub fn create_transaction(
        &self,
        id: impl Into<String>,
        options: Option<TransactionOptions>,
    ) -> Result<Arc<SagaTransaction>, TransactionError> {
        let id = id.into();
        let mut state = self.lock();
        if state.active.contains_key(&id) {
            warn!(transaction_id = %id, "Rejected duplicate transaction id");
            return Err(TransactionError::DuplicateId(id));
        }

        let transaction = Arc::new(SagaTransaction::with_id(
            id.clone(),
            options.unwrap_or_else(|| self.defaults.clone()),
        ));

        let serial = state.next_serial;
        state.next_serial += 1;

        let weak: Weak<Mutex<ManagerState>> = Arc::downgrade(&self.state);
        let finished_id = id.clone();
        transaction.on(move |event| {
            let (state, error) = match event {
                TransactionEvent::Committed => (TransactionState::Committed, None),
                TransactionEvent::Failed { state, error } => (*state, Some(error.clone())),
                _ => return,
            };
            if let Some(manager) = weak.upgrade() {
                finish(&manager, &finished_id, serial, state, error);
            }
        });

        state.active.insert(
            id.clone(),
            ActiveEntry {
                transaction: transaction.clone(),
                start_time: Utc::now(),
                serial,
            },
        );
        set_active_gauge(state.active.len());
        info!(transaction_id = %id, "Transaction created");

        Ok(transaction)
    }

    pub fn get_transaction(&self, id: &str) -> Option<Arc<SagaTransaction>> {
        self.lock().active.get(id).map(|entry| entry.transaction.clone())
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop a transaction that was never executed, freeing its id. The
    /// returned handle is no longer tracked. Fails with `InvalidState` once
    /// execution has started.
    pub fn discard(&self, id: &str) -> Result<Arc<SagaTransaction>, TransactionError> {
        let mut state = self.lock();
        let Some(entry) = state.active.get(id) else {
            return Err(TransactionError::NotFound(id.to_string()));
        };

        let current = entry.transaction.state();
        if current != TransactionState::Pending {
            return Err(TransactionError::InvalidState {
                id: id.to_string(),
                state: current,
                operation: "discard",
            });
        }

        let Some(entry) = state.active.remove(id) else {
            return Err(TransactionError::NotFound(id.to_string()));
        };
        set_active_gauge(state.active.len());
        info!(transaction_id = %id, "Transaction discarded");
        Ok(entry.transaction)
    }

    /// Finished transactions, oldest first.
    pub fn get_history(&self) -> Vec<TransactionRecord> {
        self.lock().history.clone()
    }

    /// Abort every RUNNING transaction and wait for their compensations.
    /// Executions whose future was dropped mid-run are compensated by the
    /// abort itself. Transactions that were never executed stay registered.
    pub async fn abort_all(&self, reason: &str) {
        let running: Vec<Arc<SagaTransaction>> = self
            .lock()
            .active
            .values()
            .map(|entry| entry.transaction.clone())
            .filter(|tx| {
                matches!(
                    tx.state(),
                    TransactionState::Running | TransactionState::RollingBack
                )
            })
            .collect();

        if running.is_empty() {
            return;
        }

        info!(count = running.len(), reason = reason, "Aborting running transactions");
        join_all(running.iter().map(|tx| tx.abort(reason))).await;
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(TransactionOptions::default())
    }
}

fn finish(
    manager: &Mutex<ManagerState>,
    id: &str,
    serial: u64,
    state: TransactionState,
    error: Option<String>,
) {
    let mut guard = manager.lock().unwrap_or_else(PoisonError::into_inner);
    // a discarded transaction must not evict a newer one under the same id
    if guard.active.get(id).map(|entry| entry.serial) != Some(serial) {
        return;
    }
    let Some(entry) = guard.active.remove(id) else {
        return;
    };

    guard.history.push(TransactionRecord {
        id: id.to_string(),
        state,
        start_time: entry.start_time,
        end_time: Utc::now(),
        error,
    });
    set_active_gauge(guard.active.len());
}

fn set_active_gauge(active: usize) {
    if let Some(ref metrics) = *get_metrics() {
        metrics.active_transactions.set(active as f64);
    }
}
