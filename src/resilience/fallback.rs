//! Fallback Resolution
//! Layered cache / degraded / default recovery and composable fallback chains

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::timeout::with_optional_timeout;
use crate::observability::metrics::get_metrics;

pub type AsyncSource<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;
pub type KeyFn = Arc<dyn Fn() -> String + Send + Sync>;

fn source<T, F, Fut>(f: F) -> AsyncSource<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

fn record_resolution(source: &str) {
    if let Some(ref metrics) = *get_metrics() {
        metrics
            .fallback_resolutions_total
            .with_label_values(&[source])
            .inc();
    }
}

/// Every strategy of a chain failed.
#[derive(Error)]
#[error("{message}")]
pub struct AggregateError {
    pub message: String,
    pub errors: Vec<anyhow::Error>,
}

impl fmt::Debug for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateError")
            .field("message", &self.message)
            .field(
                "errors",
                &self.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// =====================================================
// TTL CACHE
// =====================================================

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) <= self.ttl
    }
}

/// Keyed value cache where each entry expires strictly after its ttl.
pub struct TtlCache<T> {
    entries: DashMap<String, CacheEntry<T>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: T, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
                ttl,
            },
        );
    }

    /// Fresh value for `key`. An expired entry is removed, never returned.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_fresh(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| !entry.is_fresh(now));
        None
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

// =====================================================
// WITH FALLBACK
// =====================================================

#[derive(Clone)]
pub struct CacheOptions<T> {
    pub store: Arc<TtlCache<T>>,
    pub key: KeyFn,
    pub ttl: Duration,
}

/// Recovery sources for [`with_fallback`], tried in field order.
pub struct FallbackOptions<T> {
    pub timeout: Option<Duration>,
    pub cache: Option<CacheOptions<T>>,
    pub degraded: Option<AsyncSource<T>>,
    pub fallback_factory: Option<AsyncSource<T>>,
    pub fallback_value: Option<T>,
}

impl<T> Default for FallbackOptions<T> {
    fn default() -> Self {
        Self {
            timeout: None,
            cache: None,
            degraded: None,
            fallback_factory: None,
            fallback_value: None,
        }
    }
}

impl<T> FallbackOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache<K>(mut self, store: Arc<TtlCache<T>>, key: K, ttl: Duration) -> Self
    where
        K: Fn() -> String + Send + Sync + 'static,
    {
        self.cache = Some(CacheOptions {
            store,
            key: Arc::new(key),
            ttl,
        });
        self
    }

    pub fn degraded<F, Fut>(mut self, service: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.degraded = Some(source(service));
        self
    }

    pub fn fallback_factory<F, Fut>(mut self, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.fallback_factory = Some(source(factory));
        self
    }

    pub fn fallback_value(mut self, value: T) -> Self {
        self.fallback_value = Some(value);
        self
    }
}

/// Run `operation`; on failure recover from cache, degraded service,
/// factory, then static value. The original error is returned only when
/// every configured source fails.
pub async fn with_fallback<T, F, Fut>(operation: F, options: &FallbackOptions<T>) -> anyhow::Result<T>
where
    T: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let error = match with_optional_timeout(options.timeout, operation()).await {
        Ok(value) => {
            if let Some(cache) = &options.cache {
                cache.store.insert((cache.key)(), value.clone(), cache.ttl);
            }
            return Ok(value);
        }
        Err(e) => e,
    };

    warn!(error = %error, "Primary operation failed, resolving fallback");

    if let Some(cache) = &options.cache {
        let key = (cache.key)();
        if let Some(value) = cache.store.get(&key) {
            info!(key = %key, "Serving cached value");
            record_resolution("cache");
            return Ok(value);
        }
        debug!(key = %key, "No fresh cache entry");
    }

    if let Some(degraded) = &options.degraded {
        match degraded().await {
            Ok(value) => {
                info!("Serving degraded service response");
                record_resolution("degraded");
                return Ok(value);
            }
            Err(e) => warn!(error = %e, "Degraded service failed"),
        }
    }

    if let Some(factory) = &options.fallback_factory {
        match factory().await {
            Ok(value) => {
                info!("Serving fallback factory value");
                record_resolution("factory");
                return Ok(value);
            }
            Err(e) => warn!(error = %e, "Fallback factory failed"),
        }
    }

    if let Some(value) = &options.fallback_value {
        info!("Serving static fallback value");
        record_resolution("default");
        return Ok(value.clone());
    }

    Err(error)
}

// =====================================================
// FALLBACK CHAIN
// =====================================================

struct Strategy<T> {
    name: String,
    run: AsyncSource<T>,
}

/// Ordered list of alternatives, first success wins.
pub struct FallbackChain<T> {
    strategies: Vec<Strategy<T>>,
    cache: Arc<TtlCache<T>>,
    stop_on_success: bool,
}

impl<T> FallbackChain<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            cache: Arc::new(TtlCache::new()),
            stop_on_success: true,
        }
    }

    pub fn add<F, Fut>(mut self, name: impl Into<String>, strategy: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.strategies.push(Strategy {
            name: name.into(),
            run: source(strategy),
        });
        self
    }

    /// Strategy whose result is reused for `ttl` under `key`.
    pub fn add_cached<F, Fut>(
        mut self,
        name: impl Into<String>,
        strategy: F,
        ttl: Duration,
        key: impl Into<String>,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let key: String = key.into();
        let strategy = Arc::new(strategy);

        let run: AsyncSource<T> = Arc::new(move || {
            let cache = cache.clone();
            let key = key.clone();
            let strategy = strategy.clone();
            async move {
                if let Some(hit) = cache.get(&key) {
                    return Ok(hit);
                }
                let value = strategy().await?;
                cache.insert(key, value.clone(), ttl);
                Ok::<T, anyhow::Error>(value)
            }
            .boxed()
        });

        self.strategies.push(Strategy {
            name: name.into(),
            run,
        });
        self
    }

    pub fn add_default(mut self, value: T) -> Self {
        self.strategies.push(Strategy {
            name: "default".to_string(),
            run: Arc::new(move || {
                let value = value.clone();
                async move { Ok::<T, anyhow::Error>(value) }.boxed()
            }),
        });
        self
    }

    /// With `false`, every strategy runs and the first success is returned.
    pub fn stop_on_success(mut self, stop: bool) -> Self {
        self.stop_on_success = stop;
        self
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub async fn execute(&self) -> Result<T, AggregateError> {
        let mut errors = Vec::new();
        let mut first_success: Option<T> = None;

        for strategy in &self.strategies {
            match (strategy.run)().await {
                Ok(value) => {
                    debug!(strategy = %strategy.name, "Fallback strategy succeeded");
                    if self.stop_on_success {
                        return Ok(value);
                    }
                    first_success.get_or_insert(value);
                }
                Err(e) => {
                    warn!(strategy = %strategy.name, error = %e, "Fallback strategy failed");
                    errors.push(e.context(format!("strategy '{}' failed", strategy.name)));
                }
            }
        }

        if let Some(value) = first_success {
            return Ok(value);
        }

        Err(AggregateError {
            message: format!("All {} fallback strategies failed", self.strategies.len()),
            errors,
        })
    }
}

impl<T> Default for FallbackChain<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
