//! Circuit Breaker Registry
//! One breaker per named dependency, owned by the composition root

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerOptions, CircuitBreakerStats};

pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerOptions,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: CircuitBreakerOptions) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    pub fn defaults(&self) -> &CircuitBreakerOptions {
        &self.defaults
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, || CircuitBreaker::new(name, self.defaults.clone()))
    }

    /// The first creation wins; `build` is only called for unknown names.
    pub fn get_or_create_with<F>(&self, name: &str, build: F) -> Arc<CircuitBreaker>
    where
        F: FnOnce() -> CircuitBreaker,
    {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(name = name, "Circuit breaker registered");
                Arc::new(build())
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        // never hold a shard lock across an await
        let mut breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        breakers.sort_by(|a, b| a.name().cmp(b.name()));
        breakers
    }

    pub async fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats = Vec::new();
        for breaker in self.snapshot() {
            stats.push(breaker.stats().await);
        }
        stats
    }

    pub async fn reset_all(&self) {
        for breaker in self.snapshot() {
            breaker.reset().await;
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let (_, breaker) = self.breakers.remove(name)?;
        breaker.destroy();
        Some(breaker)
    }

    pub fn destroy_all(&self) {
        for breaker in self.snapshot() {
            breaker.destroy();
        }
        self.breakers.clear();
        info!("All circuit breakers destroyed");
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerOptions::default())
    }
}
