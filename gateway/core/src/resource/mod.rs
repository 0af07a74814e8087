//! Concurrency admission control
//!
//! Every outbound provider call passes through [`ResourceManager::submit`],
//! which applies, in order:
//!
//! 1. the target's token bucket, if one is configured
//! 2. the global admission queue bounding all in-flight calls; waiters are
//!    ordered by [`Admission::priority`] and at most `max_queue_size` may wait
//! 3. the target's semaphore, sized `max(1, floor(global * fraction))`
//!
//! Permits are owned RAII guards, so they are released on every exit path,
//! including when the caller's future is dropped mid-call. A call submitted
//! with a request id can be cancelled through [`ResourceManager::cancel`],
//! whether it is still queued or already running.

mod queue;
mod rate_limit;

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

use crate::types::GenerationParams;
use queue::{Admit, AdmissionQueue, Slot};

pub use rate_limit::{RateLimit, TokenBucket};

/// Default number of calls allowed to wait for global capacity
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

// ============================================================================
// Configuration and Errors
// ============================================================================

/// Admission limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Maximum in-flight calls across all targets
    pub max_concurrent: usize,

    /// Share of `max_concurrent` any single target may use
    pub per_target_fraction: f64,

    /// Maximum time to wait for permits (`None` waits forever)
    pub queue_timeout: Option<Duration>,

    /// Calls allowed to wait for global capacity before new ones are refused
    pub max_queue_size: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 20,
            per_target_fraction: 0.5,
            queue_timeout: Some(Duration::from_secs(30)),
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl ResourceConfig {
    /// Per-target permit count derived from the global bound
    #[must_use]
    pub fn per_target_limit(&self) -> usize {
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let share = (self.max_concurrent as f64 * self.per_target_fraction).floor() as usize;
        share.clamp(1, self.max_concurrent.max(1))
    }
}

/// Admission failures
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Permits did not become available in time
    #[error("Timed out after {waited:?} waiting for capacity on {target}")]
    QueueTimeout {
        /// Target that was being admitted
        target: String,
        /// How long the call waited
        waited: Duration,
    },

    /// Too many calls are already waiting
    #[error("System is currently overloaded ({waiting} requests queued for {target}). Please try again later.")]
    QueueFull {
        /// Target that was being admitted
        target: String,
        /// Queue bound that was hit
        waiting: usize,
    },

    /// The call was cancelled by request id
    #[error("Request {request_id} to {target} was cancelled")]
    Cancelled {
        /// Target of the cancelled call
        target: String,
        /// Id the call was cancelled under
        request_id: String,
    },

    /// Capacity can no longer be granted
    #[error("Resource manager is shut down")]
    Closed,
}

/// How a call waits for admission
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Admission {
    /// Higher values are admitted first; ties go to the earlier call
    pub priority: i32,
    /// Id under which the call can be cancelled
    pub request_id: Option<String>,
}

impl Admission {
    /// Admission at `priority` with no cancellation id
    #[must_use]
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            request_id: None,
        }
    }

    /// Make the call cancellable under `request_id`
    #[must_use]
    pub fn cancellable(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl From<&GenerationParams> for Admission {
    fn from(params: &GenerationParams) -> Self {
        Self {
            priority: params.priority,
            request_id: params.request_id().map(str::to_string),
        }
    }
}

// ============================================================================
// Resource Manager
// ============================================================================

#[derive(Debug)]
struct TargetSlot {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

/// Decrements active counters when a call finishes or is dropped
struct ActiveGuard {
    target: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn enter(target: Arc<AtomicUsize>, total: Arc<AtomicUsize>) -> Self {
        target.fetch_add(1, Ordering::AcqRel);
        total.fetch_add(1, Ordering::AcqRel);
        Self { target, total }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.target.fetch_sub(1, Ordering::AcqRel);
        self.total.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Cancellation signal shared by every call under one request id
#[derive(Debug)]
struct CancelSignal {
    cancelled: watch::Sender<bool>,
}

/// Unregisters a call's interest in its request id
struct CancelRegistration<'a> {
    signals: &'a DashMap<String, Arc<CancelSignal>>,
    request_id: &'a str,
    signal: Option<Arc<CancelSignal>>,
}

impl CancelRegistration<'_> {
    async fn cancelled(&self) {
        let Some(signal) = &self.signal else {
            return std::future::pending().await;
        };
        let mut rx = signal.cancelled.subscribe();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for CancelRegistration<'_> {
    fn drop(&mut self) {
        drop(self.signal.take());
        // Only the map's own reference left means no call uses the id
        self.signals
            .remove_if(self.request_id, |_, signal| Arc::strong_count(signal) == 1);
    }
}

/// Global and per-target concurrency limits
#[derive(Debug)]
pub struct ResourceManager {
    config: ResourceConfig,
    per_target_limit: usize,
    global: Arc<AdmissionQueue>,
    targets: DashMap<String, TargetSlot>,
    rate_limits: DashMap<String, Arc<TokenBucket>>,
    cancellations: DashMap<String, Arc<CancelSignal>>,
    active_total: Arc<AtomicUsize>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ResourceConfig::default())
    }
}

impl ResourceManager {
    /// Create a manager with the given limits
    #[must_use]
    pub fn new(config: ResourceConfig) -> Self {
        let global_limit = config.max_concurrent.max(1);
        Self {
            per_target_limit: config.per_target_limit(),
            global: Arc::new(AdmissionQueue::new(global_limit, config.max_queue_size)),
            targets: DashMap::new(),
            rate_limits: DashMap::new(),
            cancellations: DashMap::new(),
            active_total: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Configured limits
    #[must_use]
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Permits each target may hold at once
    #[must_use]
    pub fn per_target_limit(&self) -> usize {
        self.per_target_limit
    }

    /// Install or replace a token bucket for `target`
    pub fn set_rate_limit(&self, target: &str, limit: RateLimit) {
        tracing::debug!(target_key = %target, rate = limit.rate, burst = limit.burst, "Rate limit set");
        self.rate_limits
            .insert(target.to_string(), Arc::new(TokenBucket::new(limit)));
    }

    /// Run `operation` once the target has capacity, at default priority
    ///
    /// # Errors
    ///
    /// See [`ResourceManager::submit_with`].
    pub async fn submit<F>(&self, target: &str, operation: F) -> Result<F::Output, ResourceError>
    where
        F: Future,
    {
        self.submit_with(target, &Admission::default(), operation).await
    }

    /// Run `operation` once the target has capacity
    ///
    /// # Errors
    ///
    /// - [`ResourceError::QueueFull`] if `max_queue_size` calls are already
    ///   waiting for global capacity
    /// - [`ResourceError::QueueTimeout`] if permits are not granted within
    ///   the configured queue timeout
    /// - [`ResourceError::Cancelled`] if the request id is cancelled before
    ///   `operation` finishes
    pub async fn submit_with<F>(
        &self,
        target: &str,
        admission: &Admission,
        operation: F,
    ) -> Result<F::Output, ResourceError>
    where
        F: Future,
    {
        let Some(request_id) = admission.request_id.as_deref() else {
            return self.admit_and_run(target, admission.priority, operation).await;
        };

        let registration = self.register(request_id);
        tokio::select! {
            result = self.admit_and_run(target, admission.priority, operation) => result,
            () = registration.cancelled() => {
                tracing::info!(target_key = %target, request_id = %request_id, "Call cancelled");
                Err(ResourceError::Cancelled {
                    target: target.to_string(),
                    request_id: request_id.to_string(),
                })
            }
        }
    }

    /// Cancel every queued or running call submitted under `request_id`
    ///
    /// Returns whether any call was using the id.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.cancellations.remove(request_id) {
            Some((_, signal)) => {
                signal.cancelled.send_replace(true);
                tracing::debug!(request_id = %request_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    async fn admit_and_run<F>(
        &self,
        target: &str,
        priority: i32,
        operation: F,
    ) -> Result<F::Output, ResourceError>
    where
        F: Future,
    {
        let bucket = self.rate_limits.get(target).map(|b| Arc::clone(b.value()));
        if let Some(bucket) = bucket {
            bucket.acquire().await;
        }

        let admit = self.global.acquire(priority).map_err(|_| {
            tracing::warn!(target_key = %target, priority, "Admission queue full");
            ResourceError::QueueFull {
                target: target.to_string(),
                waiting: self.config.max_queue_size,
            }
        })?;

        let (semaphore, active) = self.slot(target);
        let acquire = async move {
            let global_slot: Slot = match admit {
                Admit::Ready(slot) => slot,
                Admit::Queued(handoff) => handoff.await.map_err(|_| ResourceError::Closed)?,
            };
            let target_permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| ResourceError::Closed)?;
            Ok::<_, ResourceError>((global_slot, target_permit))
        };

        let _permits = match self.config.queue_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire)
                .await
                .map_err(|_| {
                    tracing::warn!(target_key = %target, waited_ms = limit.as_millis() as u64, "Queue timeout");
                    ResourceError::QueueTimeout {
                        target: target.to_string(),
                        waited: limit,
                    }
                })??,
            None => acquire.await?,
        };

        let _active = ActiveGuard::enter(active, Arc::clone(&self.active_total));
        tracing::debug!(target_key = %target, priority, "Permits acquired");
        Ok(operation.await)
    }

    fn register<'a>(&'a self, request_id: &'a str) -> CancelRegistration<'a> {
        let signal = self
            .cancellations
            .entry(request_id.to_string())
            .or_insert_with(|| {
                Arc::new(CancelSignal {
                    cancelled: watch::channel(false).0,
                })
            })
            .clone();
        CancelRegistration {
            signals: &self.cancellations,
            request_id,
            signal: Some(signal),
        }
    }

    /// Calls waiting for global capacity
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.global.waiting()
    }

    /// In-flight calls for `target`, or across all targets
    #[must_use]
    pub fn active_count(&self, target: Option<&str>) -> usize {
        match target {
            Some(target) => self
                .targets
                .get(target)
                .map_or(0, |slot| slot.active.load(Ordering::Acquire)),
            None => self.active_total.load(Ordering::Acquire),
        }
    }

    /// Permits that could be granted right now
    ///
    /// For a target this is the smaller of its own free permits and the
    /// global free permits.
    #[must_use]
    pub fn available_capacity(&self, target: Option<&str>) -> usize {
        let global = self.global.available();
        match target {
            Some(target) => {
                let own = self
                    .targets
                    .get(target)
                    .map_or(self.per_target_limit, |slot| slot.semaphore.available_permits());
                own.min(global)
            }
            None => global,
        }
    }

    /// Targets that have been admitted at least once
    #[must_use]
    pub fn known_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.targets.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets
    }

    fn slot(&self, target: &str) -> (Arc<Semaphore>, Arc<AtomicUsize>) {
        let slot = self
            .targets
            .entry(target.to_string())
            .or_insert_with(|| TargetSlot {
                semaphore: Arc::new(Semaphore::new(self.per_target_limit)),
                active: Arc::new(AtomicUsize::new(0)),
            });
        (Arc::clone(&slot.semaphore), Arc::clone(&slot.active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_concurrent: usize, fraction: f64) -> ResourceConfig {
        ResourceConfig {
            max_concurrent,
            per_target_fraction: fraction,
            queue_timeout: None,
            ..ResourceConfig::default()
        }
    }

    #[test]
    fn test_per_target_limit() {
        assert_eq!(config(20, 0.5).per_target_limit(), 10);
        assert_eq!(config(3, 0.5).per_target_limit(), 1);
        assert_eq!(config(1, 0.1).per_target_limit(), 1);
        assert_eq!(config(4, 1.0).per_target_limit(), 4);
    }

    #[tokio::test]
    async fn test_submit_returns_output() {
        let manager = ResourceManager::new(config(4, 0.5));
        let value = manager.submit("a", async { 42 }).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(manager.active_count(None), 0);
        assert_eq!(manager.known_targets(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_waiting_call_is_pending_until_release() {
        let manager = ResourceManager::new(config(1, 1.0));
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let mut first = tokio_test::task::spawn(manager.submit("a", async move {
            let _ = released.await;
            1
        }));
        tokio_test::assert_pending!(first.poll());
        assert_eq!(manager.active_count(None), 1);

        let mut second = tokio_test::task::spawn(manager.submit("a", async { 2 }));
        tokio_test::assert_pending!(second.poll());

        release.send(()).unwrap();
        assert_eq!(tokio_test::assert_ready!(first.poll()).unwrap(), 1);
        assert!(second.is_woken());
        assert_eq!(tokio_test::assert_ready!(second.poll()).unwrap(), 2);
        assert_eq!(manager.active_count(None), 0);
    }

    #[tokio::test]
    async fn test_higher_priority_admitted_first() {
        let manager = ResourceManager::new(config(1, 1.0));
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let mut holder = tokio_test::task::spawn(manager.submit("a", async move {
            let _ = released.await;
        }));
        tokio_test::assert_pending!(holder.poll());

        let low_admission = Admission::with_priority(0);
        let high_admission = Admission::with_priority(10);
        let mut low = tokio_test::task::spawn(manager.submit_with("b", &low_admission, async { "low" }));
        let mut high = tokio_test::task::spawn(manager.submit_with("c", &high_admission, async { "high" }));
        tokio_test::assert_pending!(low.poll());
        tokio_test::assert_pending!(high.poll());
        assert_eq!(manager.queued_count(), 2);

        release.send(()).unwrap();
        tokio_test::assert_ready!(holder.poll()).unwrap();
        assert!(high.is_woken());
        assert!(!low.is_woken());
        assert_eq!(tokio_test::assert_ready!(high.poll()).unwrap(), "high");

        assert!(low.is_woken());
        assert_eq!(tokio_test::assert_ready!(low.poll()).unwrap(), "low");
        assert_eq!(manager.available_capacity(None), 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_new_calls() {
        let manager = ResourceManager::new(ResourceConfig {
            max_queue_size: 1,
            ..config(1, 1.0)
        });
        let (_release, released) = tokio::sync::oneshot::channel::<()>();

        let mut holder = tokio_test::task::spawn(manager.submit("a", async move {
            let _ = released.await;
        }));
        tokio_test::assert_pending!(holder.poll());
        let mut waiting = tokio_test::task::spawn(manager.submit("a", async {}));
        tokio_test::assert_pending!(waiting.poll());

        let mut rejected = tokio_test::task::spawn(manager.submit("b", async {}));
        let err = tokio_test::assert_ready!(rejected.poll()).unwrap_err();
        assert!(matches!(err, ResourceError::QueueFull { ref target, waiting: 1 } if target == "b"));
    }

    #[tokio::test]
    async fn test_cancel_queued_call() {
        let manager = ResourceManager::new(config(1, 1.0));
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        let mut holder = tokio_test::task::spawn(manager.submit("a", async move {
            let _ = released.await;
        }));
        tokio_test::assert_pending!(holder.poll());

        let admission = Admission::default().cancellable("r1");
        let mut queued = tokio_test::task::spawn(manager.submit_with("a", &admission, async { 1 }));
        tokio_test::assert_pending!(queued.poll());

        assert!(manager.cancel("r1"));
        assert!(queued.is_woken());
        let err = tokio_test::assert_ready!(queued.poll()).unwrap_err();
        assert!(matches!(err, ResourceError::Cancelled { ref request_id, .. } if request_id == "r1"));
        drop(queued);
        assert!(!manager.cancel("r1"));

        // The abandoned place does not swallow the released slot
        release.send(()).unwrap();
        tokio_test::assert_ready!(holder.poll()).unwrap();
        assert_eq!(manager.available_capacity(None), 1);
        assert_eq!(manager.submit("a", async { 2 }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_cancel_running_calls_sharing_an_id() {
        let manager = ResourceManager::new(config(4, 1.0));
        let admission = Admission::with_priority(3).cancellable("shared");

        let mut first = tokio_test::task::spawn(
            manager.submit_with("a", &admission, std::future::pending::<()>()),
        );
        let mut second = tokio_test::task::spawn(
            manager.submit_with("b", &admission, std::future::pending::<()>()),
        );
        tokio_test::assert_pending!(first.poll());
        tokio_test::assert_pending!(second.poll());
        assert_eq!(manager.active_count(None), 2);

        assert!(manager.cancel("shared"));
        assert!(tokio_test::assert_ready!(first.poll()).is_err());
        assert!(tokio_test::assert_ready!(second.poll()).is_err());
        assert_eq!(manager.active_count(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_target_bound() {
        let manager = Arc::new(ResourceManager::new(config(4, 0.5)));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let inner = Arc::clone(&manager);
                    manager
                        .submit("a", async move {
                            peak.fetch_max(inner.active_count(Some("a")), Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(manager.active_count(Some("a")), 0);
        assert_eq!(manager.available_capacity(Some("a")), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let manager = Arc::new(ResourceManager::new(ResourceConfig {
            max_concurrent: 1,
            per_target_fraction: 1.0,
            queue_timeout: Some(Duration::from_secs(1)),
            ..ResourceConfig::default()
        }));

        let holder = Arc::clone(&manager);
        let blocker = tokio::spawn(async move {
            holder
                .submit("a", tokio::time::sleep(Duration::from_secs(10)))
                .await
        });
        tokio::task::yield_now().await;

        let err = manager.submit("b", async {}).await.unwrap_err();
        assert!(matches!(err, ResourceError::QueueTimeout { ref target, .. } if target == "b"));

        blocker.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_call_releases_permits() {
        let manager = ResourceManager::new(config(2, 1.0));
        let call = manager.submit("a", tokio::time::sleep(Duration::from_secs(60)));
        let _ = tokio::time::timeout(Duration::from_secs(1), call).await;

        assert_eq!(manager.active_count(Some("a")), 0);
        assert_eq!(manager.available_capacity(None), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_spaces_calls() {
        let manager = ResourceManager::new(config(4, 1.0));
        manager.set_rate_limit("a", RateLimit::per_second(1));

        let started = tokio::time::Instant::now();
        manager.submit("a", async {}).await.unwrap();
        manager.submit("a", async {}).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
    }
}
