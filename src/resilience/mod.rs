//! Resilience Module - Circuit Breakers, Retries, Fallbacks, Timeouts
//! Fault tolerance for calls into an external datastore

pub mod circuit_breaker;
pub mod events;
pub mod fallback;
pub mod registry;
pub mod retry;
pub mod rolling_window;
pub mod timeout;

pub use circuit_breaker::{
    BreakerEvent, CircuitBreaker, CircuitBreakerError, CircuitBreakerOptions, CircuitBreakerStats,
    CircuitState,
};
pub use events::EventListeners;
pub use fallback::{with_fallback, AggregateError, FallbackChain, FallbackOptions, TtlCache};
pub use registry::CircuitBreakerRegistry;
pub use retry::{
    compute_delay, is_transient, with_retry, Backoff, DependencyError, RetryError, RetryOptions,
    RetryPolicy, RetryPreset,
};
pub use timeout::{with_timeout, TimeoutError};
