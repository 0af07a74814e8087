//! Resilience utilities
//!
//! Three independent wrappers composable around any provider call:
//!
//! - [`with_timeout`]: races a call against a deadline and cancels it on expiry
//! - [`retry_with_backoff`]: exponential backoff over retryable failures
//! - [`CircuitBreaker`]: per-target short-circuiting after repeated failures
//!
//! The router nests them as retry(resource admission(breaker(timeout(call)))),
//! so each retry attempt takes fresh permits and is seen by the breaker.

mod circuit_breaker;
mod retry;
mod timeout;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use retry::{retry_with_backoff, RetryConfig};
pub use timeout::with_timeout;

/// Combined resilience settings applied to every provider call
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Deadline for a single provider call
    pub request_timeout: Duration,

    /// Retry policy
    pub retry: RetryConfig,

    /// Circuit breaker thresholds
    pub breaker: CircuitBreakerConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}
