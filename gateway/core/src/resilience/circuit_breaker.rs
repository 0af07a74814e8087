//! Per-target circuit breaker
//!
//! ```text
//! +--------+  failure_threshold  +------+   reset_timeout   +-----------+
//! | Closed | ------------------> | Open | ----------------> | Half-Open |
//! +--------+                     +------+                   +-----------+
//!     ^                              ^          1 failure        |
//!     |                              +---------------------------+
//!     |           success after half_open_timeout                |
//!     +----------------------------------------------------------+
//! ```
//!
//! - **Closed**: calls pass through; a success resets the failure count
//! - **Open**: calls are rejected with `circuit_open` without running
//! - **Half-Open**: calls are let through as probes; any failure reopens
//!
//! State lives in atomics so a breaker can be shared across tasks without a
//! lock. Timestamps are milliseconds since the breaker was created, measured
//! on the tokio clock so paused-time tests drive the transitions.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::types::{ErrorKind, ModelResponse};

const CLOSED: u32 = 0;
const OPEN: u32 = 1;
const HALF_OPEN: u32 = 2;

// ============================================================================
// State and Configuration
// ============================================================================

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed,

    /// Calls are rejected
    Open,

    /// Probe calls are allowed through
    HalfOpen,
}

/// Breaker thresholds
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time after the last failure before a probe is allowed
    pub reset_timeout: Duration,

    /// Time since the last failure a half-open success needs to close
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
        }
    }
}

/// Point-in-time view of a breaker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    /// Target key
    pub target: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures recorded
    pub failure_count: u32,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Circuit breaker guarding one target
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: CircuitBreakerConfig,

    /// 0 = Closed, 1 = Open, 2 = `HalfOpen`
    state: AtomicU32,
    failure_count: AtomicU32,
    last_failure_ms: AtomicU64,
    last_success_ms: AtomicU64,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a closed breaker for `target`
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            target: target.into(),
            config,
            state: AtomicU32::new(CLOSED),
            failure_count: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            last_success_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Target key this breaker guards
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state, without applying the open to half-open transition
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Consecutive failures recorded
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Snapshot for metrics output
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            target: self.target.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
        }
    }

    /// Whether a call may proceed right now
    ///
    /// Moves an open breaker to half-open once `reset_timeout` has passed
    /// since the last failure.
    pub fn try_acquire(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED | HALF_OPEN => true,
            _ => {
                let since_failure = self
                    .now_millis()
                    .saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
                if since_failure < duration_millis(self.config.reset_timeout) {
                    return false;
                }
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    tracing::info!(target_key = %self.target, "Circuit breaker half-open");
                }
                true
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = self.now_millis();
        self.last_success_ms.store(now, Ordering::Release);

        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                let since_failure = now.saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
                if since_failure >= duration_millis(self.config.half_open_timeout)
                    && self
                        .state
                        .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.failure_count.store(0, Ordering::Release);
                    tracing::info!(target_key = %self.target, "Circuit breaker closed");
                }
            }
            CLOSED => self.failure_count.store(0, Ordering::Release),
            _ => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = self.now_millis();
        self.last_failure_ms.store(now, Ordering::Release);
        let failures = self.failure_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);

        match self.state.load(Ordering::Acquire) {
            CLOSED if failures >= self.config.failure_threshold => {
                self.state.store(OPEN, Ordering::Release);
                tracing::warn!(
                    target_key = %self.target,
                    consecutive_failures = failures,
                    "Circuit breaker opened"
                );
            }
            HALF_OPEN => {
                self.state.store(OPEN, Ordering::Release);
                tracing::warn!(target_key = %self.target, "Probe failed, circuit breaker reopened");
            }
            _ => {}
        }
    }

    /// Force the breaker closed
    pub fn reset(&self) {
        self.state.store(CLOSED, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
    }

    /// Run `operation` under the breaker, passing raised errors through
    ///
    /// Rejected calls never poll `operation` and yield a `circuit_open`
    /// failure. An `Err` or a response with `success = false` counts against
    /// the breaker.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error unchanged.
    pub async fn execute<F, E>(&self, operation: F) -> Result<ModelResponse, E>
    where
        F: Future<Output = Result<ModelResponse, E>>,
    {
        if !self.try_acquire() {
            tracing::debug!(target_key = %self.target, "Circuit open, rejecting call");
            return Ok(self.rejection());
        }

        let result = operation.await;
        match &result {
            Ok(response) if response.success => self.record_success(),
            _ => self.record_failure(),
        }
        result
    }

    /// Run `operation` under the breaker
    ///
    /// Like [`execute`](Self::execute), but an `Err` from the operation is
    /// converted into an `execution_error` failure.
    pub async fn call<F, E>(&self, operation: F) -> ModelResponse
    where
        F: Future<Output = Result<ModelResponse, E>>,
        E: Display,
    {
        match self.execute(operation).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(target_key = %self.target, error = %e, "Provider call raised");
                ModelResponse::failure(&self.target, ErrorKind::ExecutionError, format!("Error: {e}"))
            }
        }
    }

    fn rejection(&self) -> ModelResponse {
        ModelResponse::failure(
            &self.target,
            ErrorKind::CircuitOpen,
            format!(
                "Service for {} is currently unavailable due to repeated failures. Please try again later.",
                self.target
            ),
        )
    }

    fn now_millis(&self) -> u64 {
        // Offset by one so a failure at creation time is distinguishable from "never"
        duration_millis(self.epoch.elapsed()).saturating_add(1)
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Registry
// ============================================================================

/// Lazily created breakers keyed by target
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry handing out breakers with `config`
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `target`, created on first use
    pub fn get_or_create(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.breakers
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(target, self.config.clone())))
                .value(),
        )
    }

    /// State of `target`'s breaker, `Closed` if it has none yet
    #[must_use]
    pub fn state(&self, target: &str) -> CircuitState {
        self.breakers
            .get(target)
            .map_or(CircuitState::Closed, |b| b.state())
    }

    /// Snapshots of every breaker, sorted by target
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }

    /// Close every breaker
    pub fn reset(&self) {
        for breaker in &self.breakers {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> ModelResponse {
        breaker
            .call(async {
                Ok::<_, Infallible>(ModelResponse::failure("m", ErrorKind::ExecutionError, "bad"))
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> ModelResponse {
        breaker
            .call(async { Ok::<_, Infallible>(ModelResponse::success("m", "ok")) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new("m", config());
        for _ in 0..2 {
            fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("m", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        let invoked = AtomicUsize::new(0);
        let result = breaker
            .call(async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(ModelResponse::success("m", "ok"))
            })
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(result.error, Some(ErrorKind::CircuitOpen));
        assert_eq!(
            result.text,
            "Service for m is currently unavailable due to repeated failures. Please try again later."
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::new("m", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        let result = succeed(&breaker).await;

        assert!(result.success);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("m", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // Failure clock restarted
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count_when_closed() {
        let breaker = CircuitBreaker::new("m", config());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        assert_eq!(breaker.failure_count(), 0);

        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raised_error_counts_as_failure() {
        let breaker = CircuitBreaker::new("m", config());
        let result = breaker.call(async { Err::<ModelResponse, _>("socket closed") }).await;

        assert_eq!(result.error, Some(ErrorKind::ExecutionError));
        assert_eq!(result.text, "Error: socket closed");
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_passes_error_through() {
        let breaker = CircuitBreaker::new("m", config());
        let result = breaker.execute(async { Err::<ModelResponse, _>("refused") }).await;

        assert_eq!(result.unwrap_err(), "refused");
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shares_breakers() {
        let registry = CircuitBreakerRegistry::new(config());
        let a = registry.get_or_create("a");
        let again = registry.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &again));

        for _ in 0..3 {
            a.record_failure();
        }
        assert_eq!(registry.state("a"), CircuitState::Open);
        assert_eq!(registry.state("b"), CircuitState::Closed);

        registry.reset();
        assert_eq!(registry.state("a"), CircuitState::Closed);
        assert_eq!(registry.snapshot().len(), 1);
    }
}
