//! Saga Steps
//! A forward action plus an optional compensating action

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

type ExecuteFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type CompensateFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct TransactionStep {
    pub name: String,
    execute: ExecuteFn,
    compensate: Option<CompensateFn>,
    pub retryable: bool,
    pub max_retries: Option<u32>,
}

impl TransactionStep {
    /// `execute` may run more than once when the step is retryable.
    pub fn new<T, F, Fut>(name: impl Into<String>, execute: F) -> Self
    where
        T: Serialize + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            execute: Arc::new(move || {
                let fut = execute();
                async move {
                    let output = fut.await?;
                    Ok::<Value, anyhow::Error>(serde_json::to_value(output)?)
                }
                .boxed()
            }),
            compensate: None,
            retryable: true,
            max_retries: None,
        }
    }

    pub fn with_compensation<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move || compensate().boxed()));
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    pub(crate) fn run(&self) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.execute)()
    }

    pub(crate) fn undo(&self) -> Option<BoxFuture<'static, anyhow::Result<()>>> {
        self.compensate.as_ref().map(|compensate| compensate())
    }
}

impl fmt::Debug for TransactionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStep")
            .field("name", &self.name)
            .field("has_compensation", &self.has_compensation())
            .field("retryable", &self.retryable)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}
