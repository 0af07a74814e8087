//! Model routing
//!
//! Decides which provider answers a prompt:
//!
//! ```text
//! route(model = Some(m))  ->  m known?  --no-->  model_unavailable (system)
//!                               |yes
//!                           call m  --ok-->  done
//!                               |failed, fallback on
//!                           shuffled others, first success wins
//!                               |all failed
//!                           all_models_failed (system)
//!
//! route(model = None)     ->  shuffled all, first success wins
//!
//! broadcast(models)       ->  one task per known model, results in input order
//! ```
//!
//! Every provider call goes through [`Router::call_model`], which applies the
//! full resilience stack and reports to the [`PerformanceMonitor`].

use std::sync::Arc;

use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::monitor::PerformanceMonitor;
use crate::provider::ProviderRegistry;
use crate::resilience::{
    retry_with_backoff, with_timeout, CircuitBreakerRegistry, CircuitSnapshot, ResilienceConfig,
};
use crate::resource::{Admission, ResourceError, ResourceManager};
use crate::types::{ErrorKind, GenerationParams, ModelResponse, SYSTEM_MODEL};

/// Routes prompts to registered providers
#[derive(Debug)]
pub struct Router {
    registry: ProviderRegistry,
    resources: Arc<ResourceManager>,
    breakers: CircuitBreakerRegistry,
    monitor: Arc<PerformanceMonitor>,
    resilience: ResilienceConfig,
}

impl Router {
    /// Create a router over `registry`
    #[must_use]
    pub fn new(
        registry: ProviderRegistry,
        resources: Arc<ResourceManager>,
        monitor: Arc<PerformanceMonitor>,
        resilience: ResilienceConfig,
    ) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(resilience.breaker.clone()),
            registry,
            resources,
            monitor,
            resilience,
        }
    }

    /// Registered model identifiers in registration order
    #[must_use]
    pub fn available_models(&self) -> &[String] {
        self.registry.models()
    }

    /// Whether `model` is registered
    #[must_use]
    pub fn has_model(&self, model: &str) -> bool {
        self.registry.contains(model)
    }

    /// The registered models among `models`, in the given order
    ///
    /// `None` means every registered model.
    #[must_use]
    pub fn known_models(&self, models: Option<&[String]>) -> Vec<String> {
        models
            .unwrap_or_else(|| self.registry.models())
            .iter()
            .filter(|m| self.registry.contains(m))
            .cloned()
            .collect()
    }

    /// Current breaker states, sorted by target
    #[must_use]
    pub fn breakers(&self) -> Vec<CircuitSnapshot> {
        self.breakers.snapshot()
    }

    /// Admission control shared by every call
    #[must_use]
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    // ========================================================================
    // Single-model routing
    // ========================================================================

    /// Answer `prompt` with one model
    ///
    /// With an explicit `model`, that model is tried first and, if it fails
    /// and `fallback` is set, the remaining models are tried in random order.
    /// Without one, every model is tried in random order regardless of
    /// `fallback`. Unknown models are never silently replaced, and a cancelled
    /// call ends the request instead of falling back.
    pub async fn route(
        &self,
        prompt: &str,
        model: Option<&str>,
        params: &GenerationParams,
        fallback: bool,
    ) -> ModelResponse {
        let Some(model) = model else {
            return self.try_in_random_order(prompt, params, None).await;
        };

        if !self.registry.contains(model) {
            tracing::warn!(model = %model, "Requested model is not registered");
            return self.unknown_model(model);
        }

        let response = self.call_model(model, prompt, params).await;
        if response.success || !fallback || response.error == Some(ErrorKind::Cancelled) {
            return response;
        }

        tracing::warn!(
            model = %model,
            error = ?response.error,
            "Primary model failed, falling back"
        );
        self.try_in_random_order(prompt, params, Some(model)).await
    }

    async fn try_in_random_order(
        &self,
        prompt: &str,
        params: &GenerationParams,
        exclude: Option<&str>,
    ) -> ModelResponse {
        let mut candidates: Vec<&str> = self
            .registry
            .models()
            .iter()
            .map(String::as_str)
            .filter(|m| Some(*m) != exclude)
            .collect();

        if candidates.is_empty() {
            return ModelResponse::failure(
                SYSTEM_MODEL,
                ErrorKind::ModelUnavailable,
                "No available AI models to process your request.",
            );
        }

        candidates.shuffle(&mut rand::thread_rng());

        for model in candidates {
            let response = self.call_model(model, prompt, params).await;
            if response.success || response.error == Some(ErrorKind::Cancelled) {
                return response;
            }
            tracing::debug!(model = %model, error = ?response.error, "Candidate failed");
        }

        tracing::warn!("Every candidate model failed");
        ModelResponse::failure(
            SYSTEM_MODEL,
            ErrorKind::AllModelsFailed,
            "All available AI models failed to process your request.",
        )
    }

    // ========================================================================
    // Broadcast
    // ========================================================================

    /// Ask several models at once
    ///
    /// `models` defaults to every registered model. Unknown names are
    /// dropped; if none remain a single `model_unavailable` failure is
    /// returned. Each call runs in its own task, so one provider's failure or
    /// the caller going away never cancels the others. Results are in the
    /// order of the (filtered) input list.
    pub async fn broadcast(
        self: &Arc<Self>,
        prompt: &str,
        models: Option<&[String]>,
        params: &GenerationParams,
    ) -> Vec<ModelResponse> {
        let requested = models.unwrap_or_else(|| self.registry.models());
        let valid = self.known_models(Some(requested));

        if valid.len() < requested.len() {
            tracing::warn!(
                requested = requested.len(),
                valid = valid.len(),
                "Ignoring unknown models in broadcast"
            );
        }

        if valid.is_empty() {
            return vec![ModelResponse::failure(
                SYSTEM_MODEL,
                ErrorKind::ModelUnavailable,
                format!(
                    "No valid models specified. Available models: {}",
                    self.registry.models().join(", ")
                ),
            )];
        }

        tracing::debug!(models = ?valid, "Broadcasting prompt");

        let handles: Vec<_> = valid
            .iter()
            .map(|model| {
                let router = Arc::clone(self);
                let model = model.clone();
                let prompt = prompt.to_string();
                let params = params.clone();
                tokio::spawn(async move { router.call_model(&model, &prompt, &params).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(valid)
            .map(|(joined, model)| {
                joined.unwrap_or_else(|e| {
                    tracing::warn!(model = %model, error = %e, "Broadcast task failed");
                    ModelResponse::failure(
                        model,
                        ErrorKind::UnexpectedError,
                        format!("An unexpected error occurred: {e}"),
                    )
                })
            })
            .collect()
    }

    // ========================================================================
    // Resilient call
    // ========================================================================

    /// Call one registered model through the full resilience stack
    ///
    /// Each attempt waits for admission at `params.priority`, then runs under
    /// the model's breaker with the request deadline. A `request_id` in
    /// `params` makes the call cancellable. Attempts are retried with backoff. The
    /// whole call is recorded as one request in the monitor.
    pub async fn call_model(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> ModelResponse {
        let Some(client) = self.registry.get(model) else {
            return self.unknown_model(model);
        };

        let request_id = PerformanceMonitor::new_request_id();
        self.monitor.start_request(request_id.as_str(), model);
        let started = Instant::now();

        let breaker = self.breakers.get_or_create(model);
        let deadline = self.resilience.request_timeout;
        let admission = Admission::from(params);
        let admission = &admission;

        let response = retry_with_backoff(&self.resilience.retry, model, || {
            let client = Arc::clone(&client);
            let breaker = Arc::clone(&breaker);
            async move {
                let guarded =
                    breaker.execute(with_timeout(client.generate(prompt, params), deadline, Some(model)));
                match self.resources.submit_with(model, admission, guarded).await {
                    Ok(result) => result,
                    Err(e @ ResourceError::Cancelled { .. }) => {
                        Ok(ModelResponse::failure(model, ErrorKind::Cancelled, e.to_string()))
                    }
                    Err(e) => Ok(ModelResponse::failure(
                        model,
                        ErrorKind::ResourceExhausted,
                        e.to_string(),
                    )),
                }
            }
        })
        .await
        .completed_by(model, started.elapsed());

        self.monitor
            .end_request(&request_id, response.success, response.error);
        if let Some(usage) = response.usage {
            self.monitor
                .record_tokens(model, u64::from(usage.total_tokens));
        }

        if !response.success {
            tracing::warn!(
                model = %model,
                request_id = %request_id,
                error = ?response.error,
                "Model call failed"
            );
        }
        response
    }

    fn unknown_model(&self, model: &str) -> ModelResponse {
        ModelResponse::failure(
            SYSTEM_MODEL,
            ErrorKind::ModelUnavailable,
            format!(
                "Model '{model}' not available. Available models: {}",
                self.registry.models().join(", ")
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::provider::{EchoProvider, ProviderClient, ProviderError};
    use crate::resilience::RetryConfig;

    /// Always answers with a structured failure
    struct Broken;

    #[async_trait]
    impl ProviderClient for Broken {
        fn name(&self) -> &str {
            "Broken"
        }

        async fn generate(
            &self,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<ModelResponse, ProviderError> {
            Ok(ModelResponse::failure("broken", ErrorKind::ExecutionError, "down"))
        }
    }

    fn router(registry: ProviderRegistry) -> Arc<Router> {
        let resilience = ResilienceConfig {
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig::disabled(),
            ..ResilienceConfig::default()
        };
        Arc::new(Router::new(
            registry,
            Arc::new(ResourceManager::default()),
            Arc::new(PerformanceMonitor::default()),
            resilience,
        ))
    }

    fn registry(entries: Vec<(&str, Arc<dyn ProviderClient>)>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for (name, client) in entries {
            registry.register(name, client).unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_unknown_model_lists_available() {
        let router = router(registry(vec![
            ("a", Arc::new(EchoProvider::new("a"))),
            ("b", Arc::new(EchoProvider::new("b"))),
        ]));

        let response = router
            .route("hi", Some("zzz"), &GenerationParams::default(), true)
            .await;

        assert!(!response.success);
        assert_eq!(response.model, SYSTEM_MODEL);
        assert_eq!(response.error, Some(ErrorKind::ModelUnavailable));
        assert_eq!(response.text, "Model 'zzz' not available. Available models: a, b");
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let router = router(ProviderRegistry::new());
        let response = router.route("hi", None, &GenerationParams::default(), true).await;
        assert_eq!(response.text, "No available AI models to process your request.");
        assert_eq!(response.error, Some(ErrorKind::ModelUnavailable));
    }

    #[tokio::test]
    async fn test_fallback_attributes_answering_model() {
        let router = router(registry(vec![
            ("broken", Arc::new(Broken)),
            ("echo", Arc::new(EchoProvider::new("echo"))),
        ]));

        let response = router
            .route("hi", Some("broken"), &GenerationParams::default(), true)
            .await;
        assert!(response.success);
        assert_eq!(response.model, "echo");

        let response = router
            .route("hi", Some("broken"), &GenerationParams::default(), false)
            .await;
        assert!(!response.success);
        assert_eq!(response.model, "broken");
    }

    #[tokio::test]
    async fn test_fallback_with_nothing_left_is_system_failure() {
        let router = router(registry(vec![("only", Arc::new(Broken))]));

        let response = router
            .route("hi", Some("only"), &GenerationParams::default(), true)
            .await;
        assert!(!response.success);
        assert_eq!(response.model, SYSTEM_MODEL);
        assert_eq!(response.error, Some(ErrorKind::ModelUnavailable));
        assert_eq!(response.text, "No available AI models to process your request.");

        let response = router
            .route("hi", Some("only"), &GenerationParams::default(), false)
            .await;
        assert_eq!(response.model, "only");
        assert_eq!(response.error, Some(ErrorKind::ExecutionError));
    }

    #[tokio::test]
    async fn test_all_failed() {
        let router = router(registry(vec![
            ("x", Arc::new(Broken)),
            ("y", Arc::new(Broken)),
        ]));

        let response = router.route("hi", None, &GenerationParams::default(), true).await;
        assert_eq!(response.model, SYSTEM_MODEL);
        assert_eq!(response.error, Some(ErrorKind::AllModelsFailed));
    }

    #[tokio::test]
    async fn test_broadcast_filters_unknown_models() {
        let router = router(registry(vec![
            ("a", Arc::new(EchoProvider::new("a"))),
            ("b", Arc::new(Broken)),
        ]));

        let requested = vec!["b".to_string(), "nope".to_string(), "a".to_string()];
        let responses = router
            .broadcast("hi", Some(&requested), &GenerationParams::default())
            .await;

        let models: Vec<_> = responses.iter().map(|r| r.model.as_str()).collect();
        assert_eq!(models, vec!["b", "a"]);
        assert!(!responses[0].success);
        assert!(responses[1].success);

        let none = vec!["nope".to_string()];
        let responses = router
            .broadcast("hi", Some(&none), &GenerationParams::default())
            .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0].text,
            "No valid models specified. Available models: a, b"
        );
    }

    #[tokio::test]
    async fn test_call_model_is_monitored() {
        let monitor = Arc::new(PerformanceMonitor::default());
        let router = Router::new(
            registry(vec![("a", Arc::new(EchoProvider::new("a")))]),
            Arc::new(ResourceManager::default()),
            Arc::clone(&monitor),
            ResilienceConfig::default(),
        );

        let response = router
            .call_model("a", "one two three", &GenerationParams::default())
            .await;
        assert!(response.success);
        assert!(response.latency.is_some());

        let report = monitor.get_metrics(Some("a"));
        assert_eq!(report.models["a"].requests, 1);
        assert_eq!(report.models["a"].successes, 1);
        assert!(report.models["a"].total_tokens > 0);
    }
}
