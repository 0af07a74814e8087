//! Resilience integration tests
//!
//! Drive the router against scripted providers to check retry, timeout,
//! circuit breaking and admission control end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use common::{fast_resilience, registry, MockProvider, Step};
use gateway_core::{
    CircuitBreakerConfig, CircuitState, ErrorKind, GenerationParams, MonitorConfig, PerformanceMonitor,
    ResilienceConfig, ResourceConfig, ResourceManager, Router,
};

fn router(
    mocks: &[(&str, &Arc<MockProvider>)],
    resilience: ResilienceConfig,
    resources: ResourceConfig,
) -> Arc<Router> {
    Arc::new(Router::new(
        registry(mocks),
        Arc::new(ResourceManager::new(resources)),
        Arc::new(PerformanceMonitor::new(MonitorConfig::default())),
        resilience,
    ))
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_raised_errors_are_retried_until_success() {
    let flaky = Arc::new(MockProvider::new("flaky").with_script(&[Step::Raise, Step::Raise]));
    let router = router(&[("flaky", &flaky)], fast_resilience(3), ResourceConfig::default());

    let response = router
        .call_model("flaky", "hello", &GenerationParams::default())
        .await;

    assert!(response.success);
    assert_eq!(response.model, "flaky");
    assert_eq!(flaky.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_last_error() {
    let broken = Arc::new(MockProvider::new("broken").otherwise(Step::Raise));
    let router = router(&[("broken", &broken)], fast_resilience(2), ResourceConfig::default());

    let response = router
        .call_model("broken", "hello", &GenerationParams::default())
        .await;

    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::MaxRetriesExceeded));
    assert!(response.text.starts_with("Error after 2 retries:"));
    assert_eq!(broken.calls(), 3);
}

// ============================================================================
// Timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_timeout_is_not_retried() {
    let stuck = Arc::new(MockProvider::new("stuck").otherwise(Step::Hang));
    let mut resilience = fast_resilience(3);
    resilience.request_timeout = Duration::from_secs(1);
    let router = router(&[("stuck", &stuck)], resilience, ResourceConfig::default());

    let response = router
        .call_model("stuck", "hello", &GenerationParams::default())
        .await;

    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::Timeout));
    assert_eq!(response.model, "stuck");
    assert_eq!(stuck.calls(), 1);
    // The abandoned call released its permits
    assert_eq!(router.resources().active_count(None), 0);
}

// ============================================================================
// Circuit Breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_open_circuit_rejects_without_calling_provider() {
    let mock = Arc::new(MockProvider::new("m").with_script(&[Step::Fail, Step::Fail]));
    let resilience = ResilienceConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(10),
            half_open_timeout: Duration::from_secs(5),
        },
        ..fast_resilience(0)
    };
    let router = router(&[("m", &mock)], resilience, ResourceConfig::default());
    let params = GenerationParams::default();

    for _ in 0..2 {
        let response = router.call_model("m", "hi", &params).await;
        assert_eq!(response.error, Some(ErrorKind::ExecutionError));
    }
    assert_eq!(router.breakers()[0].state, CircuitState::Open);

    let rejected = router.call_model("m", "hi", &params).await;
    assert_eq!(rejected.error, Some(ErrorKind::CircuitOpen));
    assert!(rejected.text.contains("currently unavailable"));
    assert_eq!(mock.calls(), 2);

    tokio::time::advance(Duration::from_secs(11)).await;

    let probe = router.call_model("m", "hi", &params).await;
    assert!(probe.success);
    assert_eq!(mock.calls(), 3);
    let snapshot = &router.breakers()[0];
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_reopens_circuit() {
    let mock = Arc::new(MockProvider::failing("m"));
    let resilience = ResilienceConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(10),
            half_open_timeout: Duration::from_secs(5),
        },
        ..fast_resilience(0)
    };
    let router = router(&[("m", &mock)], resilience, ResourceConfig::default());
    let params = GenerationParams::default();

    router.call_model("m", "hi", &params).await;
    tokio::time::advance(Duration::from_secs(11)).await;
    router.call_model("m", "hi", &params).await;

    assert_eq!(mock.calls(), 2);
    assert_eq!(router.breakers()[0].state, CircuitState::Open);
    let rejected = router.call_model("m", "hi", &params).await;
    assert_eq!(rejected.error, Some(ErrorKind::CircuitOpen));
}

// ============================================================================
// Admission Control
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_global_limit_bounds_concurrency() {
    let slow = Arc::new(MockProvider::new("slow").with_delay(Duration::from_millis(50)));
    let resources = ResourceConfig {
        max_concurrent: 2,
        per_target_fraction: 1.0,
        queue_timeout: None,
        ..ResourceConfig::default()
    };
    let router = router(&[("slow", &slow)], fast_resilience(0), resources);
    let params = GenerationParams::default();

    let responses = join_all((0..5).map(|i| {
        let router = Arc::clone(&router);
        let params = params.clone();
        async move { router.call_model("slow", &format!("job {i}"), &params).await }
    }))
    .await;

    assert!(responses.iter().all(|r| r.success));
    assert_eq!(slow.calls(), 5);
    assert!(slow.peak_concurrency() <= 2);
    assert_eq!(router.resources().active_count(None), 0);
}

#[tokio::test(start_paused = true)]
async fn test_queue_timeout_yields_resource_exhausted() {
    let stuck = Arc::new(MockProvider::new("stuck").otherwise(Step::Hang));
    let resources = ResourceConfig {
        max_concurrent: 1,
        per_target_fraction: 1.0,
        queue_timeout: Some(Duration::from_millis(100)),
        ..ResourceConfig::default()
    };
    let mut resilience = fast_resilience(0);
    resilience.request_timeout = Duration::from_secs(60);
    let router = router(&[("stuck", &stuck)], resilience, resources);

    let holder = {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            router
                .call_model("stuck", "first", &GenerationParams::default())
                .await
        })
    };
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let queued = router
        .call_model("stuck", "second", &GenerationParams::default())
        .await;
    assert_eq!(queued.error, Some(ErrorKind::ResourceExhausted));
    assert_eq!(stuck.calls(), 1);

    holder.abort();
}

#[tokio::test(start_paused = true)]
async fn test_full_queue_yields_resource_exhausted() {
    let stuck = Arc::new(MockProvider::new("stuck").otherwise(Step::Hang));
    let resources = ResourceConfig {
        max_concurrent: 1,
        per_target_fraction: 1.0,
        queue_timeout: None,
        max_queue_size: 1,
    };
    let mut resilience = fast_resilience(0);
    resilience.request_timeout = Duration::from_secs(60);
    let router = router(&[("stuck", &stuck)], resilience, resources);

    let spawn_call = |prompt: &'static str| {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            router
                .call_model("stuck", prompt, &GenerationParams::default())
                .await
        })
    };
    let running = spawn_call("running");
    let waiting = spawn_call("waiting");
    while router.resources().queued_count() == 0 {
        tokio::task::yield_now().await;
    }

    let rejected = router
        .call_model("stuck", "rejected", &GenerationParams::default())
        .await;
    assert_eq!(rejected.error, Some(ErrorKind::ResourceExhausted));
    assert!(rejected.text.contains("overloaded"));
    assert_eq!(stuck.calls(), 1);

    running.abort();
    waiting.abort();
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_call_is_not_retried() {
    let stuck = Arc::new(MockProvider::new("stuck").otherwise(Step::Hang));
    let mut resilience = fast_resilience(3);
    resilience.request_timeout = Duration::from_secs(60);
    let router = router(&[("stuck", &stuck)], resilience, ResourceConfig::default());

    let call = {
        let router = Arc::clone(&router);
        tokio::spawn(async move {
            let params = GenerationParams::default().with_request_id("req-7");
            router.call_model("stuck", "hi", &params).await
        })
    };
    while stuck.calls() == 0 {
        tokio::task::yield_now().await;
    }

    assert!(router.resources().cancel("req-7"));
    let response = call.await.unwrap();
    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::Cancelled));
    assert_eq!(stuck.calls(), 1);
    assert_eq!(router.resources().active_count(None), 0);
    assert!(!router.resources().cancel("req-7"));
}
