//! Shared test infrastructure: scripted mock providers and gateway builders

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use gateway_core::{
    ErrorKind, Gateway, GatewayConfig, GenerationParams, ModelResponse, ProviderClient,
    ProviderError, ProviderRegistry, ResilienceConfig, RetryConfig, Usage,
};

// =============================================================================
// Mock Provider
// =============================================================================

/// What a mock does on one call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Successful response
    Succeed,
    /// Structured failure (`execution_error`)
    Fail,
    /// Raised adapter error
    Raise,
    /// Never completes
    Hang,
}

/// Provider with a call counter, optional delay and a scripted sequence of outcomes
pub struct MockProvider {
    model: String,
    delay: Duration,
    script: Mutex<VecDeque<Step>>,
    otherwise: Step,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockProvider {
    /// Mock that always succeeds
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            otherwise: Step::Succeed,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Mock that always returns a structured failure
    pub fn failing(model: &str) -> Self {
        Self::new(model).otherwise(Step::Fail)
    }

    /// Outcome once the script is exhausted
    pub fn otherwise(mut self, step: Step) -> Self {
        self.otherwise = step;
        self
    }

    /// Outcomes for the first calls, in order
    pub fn with_script(self, steps: &[Step]) -> Self {
        *self.script.lock() = steps.iter().copied().collect();
        self
    }

    /// Sleep before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Times `generate` was entered
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    fn name(&self) -> &str {
        "Mock"
    }

    async fn generate(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<ModelResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.script.lock().pop_front().unwrap_or(self.otherwise);
        match step {
            Step::Succeed => Ok(ModelResponse::success(
                &self.model,
                format!("{} answers: {prompt}", self.model),
            )
            .with_usage(Usage::new(10, 20))),
            Step::Fail => Ok(ModelResponse::failure(
                &self.model,
                ErrorKind::ExecutionError,
                "scripted failure",
            )),
            Step::Raise => Err(ProviderError::Other(anyhow::anyhow!("scripted error"))),
            Step::Hang => std::future::pending().await,
        }
    }
}

// =============================================================================
// Builders
// =============================================================================

/// Resilience settings with instant retries and a short deadline
pub fn fast_resilience(max_retries: u32) -> ResilienceConfig {
    ResilienceConfig {
        request_timeout: Duration::from_secs(5),
        retry: RetryConfig::disabled()
            .with_max_retries(max_retries)
            .with_initial_backoff(Duration::from_millis(10)),
        ..ResilienceConfig::default()
    }
}

/// Register mocks in order
pub fn registry(mocks: &[(&str, &Arc<MockProvider>)]) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for (name, mock) in mocks {
        let client: Arc<dyn ProviderClient> = Arc::<MockProvider>::clone(*mock);
        registry.register(*name, client).unwrap();
    }
    registry
}

/// Gateway over `mocks` with the given config
pub fn gateway_with(config: &GatewayConfig, mocks: &[(&str, &Arc<MockProvider>)]) -> Gateway {
    Gateway::new(config, registry(mocks))
}

/// Default config with fast, retry-free resilience
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.resilience = fast_resilience(0);
    config
}
