//! Public orchestration API
//!
//! [`Gateway`] wires every component together and is the only type an
//! application needs:
//!
//! ```text
//! process_prompt
//!   ├─ conversation context (optional)
//!   ├─ single:    cache ─miss─> Router::route ─> cache.set
//!   └─ broadcast: Router::broadcast ─> SynthesisEngine (optional)
//! ```
//!
//! Nothing here returns an error to the caller: every outcome, including a
//! panic inside the orchestration, becomes a [`ModelResponse`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::cache::{CacheStats, ResponseCache};
use crate::config::GatewayConfig;
use crate::memory::{ConversationMemory, Role};
use crate::monitor::{PerformanceMonitor, PerformanceReport};
use crate::optimizer::{ModelOptimizer, Priority, Recommendation};
use crate::provider::{ProviderRegistry, RegistryError};
use crate::resource::ResourceManager;
use crate::router::Router;
use crate::synthesis::SynthesisEngine;
use crate::types::{ErrorKind, ModelResponse, ProcessOutcome, PromptRequest, SYSTEM_MODEL};

/// Cache model key for requests that name no model
const ANY_MODEL_KEY: &str = "auto";

struct Maintenance {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Multi-provider request orchestrator
pub struct Gateway {
    router: Arc<Router>,
    synthesis: SynthesisEngine,
    cache: Arc<ResponseCache>,
    monitor: Arc<PerformanceMonitor>,
    memory: ConversationMemory,
    optimizer: ModelOptimizer,
    maintenance: Mutex<Option<Maintenance>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("models", &self.router.available_models())
            .field("synthesizer", &self.synthesis.synthesizer())
            .field("cache_entries", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Build a gateway around an already assembled registry
    ///
    /// Rate limits from `config.providers` are applied to the matching
    /// registered models. The cache snapshot, if configured, is restored.
    #[must_use]
    pub fn new(config: &GatewayConfig, registry: ProviderRegistry) -> Self {
        let resources = Arc::new(ResourceManager::new(config.resources.clone()));
        for spec in &config.providers {
            if let Some(limit) = spec.rate_limit {
                if registry.contains(&spec.name) {
                    resources.set_rate_limit(&spec.name, limit.to_rate_limit());
                }
            }
        }

        let monitor = Arc::new(PerformanceMonitor::new(config.monitor.clone()));
        let router = Arc::new(Router::new(
            registry,
            resources,
            Arc::clone(&monitor),
            config.resilience.clone(),
        ));
        let synthesis = SynthesisEngine::new(Arc::clone(&router), &config.synthesis);

        tracing::info!(
            models = ?router.available_models(),
            synthesizer = ?synthesis.synthesizer(),
            cache = config.cache.enabled,
            "Gateway initialized"
        );

        Self {
            router,
            synthesis,
            cache: Arc::new(ResponseCache::load(config.cache.clone())),
            monitor,
            memory: ConversationMemory::new(config.memory_max_history),
            optimizer: ModelOptimizer::new(),
            maintenance: Mutex::new(None),
        }
    }

    /// Build the registry from `config.providers`, then the gateway
    ///
    /// # Errors
    ///
    /// Returns an error if a provider cannot be constructed.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, RegistryError> {
        let registry = ProviderRegistry::from_specs(&config.providers)?;
        Ok(Self::new(config, registry))
    }

    // ========================================================================
    // Orchestration API
    // ========================================================================

    /// Answer a prompt
    ///
    /// Single-model requests are served from the cache when possible.
    /// Broadcasts always reach the providers.
    pub async fn process_prompt(&self, request: PromptRequest) -> ProcessOutcome {
        let use_multiple = request.use_multiple;
        match AssertUnwindSafe(self.handle(request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(reason = %reason, "Prompt processing panicked");

                let failure = ModelResponse::failure(
                    SYSTEM_MODEL,
                    ErrorKind::UnexpectedError,
                    format!("An unexpected error occurred: {reason}"),
                );
                if use_multiple {
                    ProcessOutcome::Multi {
                        responses: vec![failure],
                        synthesis: None,
                    }
                } else {
                    ProcessOutcome::Single(failure)
                }
            }
        }
    }

    async fn handle(&self, request: PromptRequest) -> ProcessOutcome {
        let prompt = match request.conversation_id.as_deref() {
            Some(id) => {
                let context = self.memory.context_for_prompt(id, None);
                if context.is_empty() {
                    request.prompt.clone()
                } else {
                    format!("{context}User: {}", request.prompt)
                }
            }
            None => request.prompt.clone(),
        };

        let outcome = if request.use_multiple && request.synthesize {
            let method = request
                .synthesis_method
                .unwrap_or_else(|| self.synthesis.default_method());
            let (responses, synthesis) = self
                .synthesis
                .deliberate(
                    method,
                    &prompt,
                    &request.prompt,
                    request.models.as_deref(),
                    &request.params,
                )
                .await;
            ProcessOutcome::Multi {
                responses,
                synthesis: Some(synthesis),
            }
        } else if request.use_multiple {
            let responses = self
                .router
                .broadcast(&prompt, request.models.as_deref(), &request.params)
                .await;
            ProcessOutcome::Multi {
                responses,
                synthesis: None,
            }
        } else {
            let model = match (&request.model, request.auto_select) {
                (Some(model), _) => Some(model.clone()),
                (None, Some(priority)) => self
                    .recommend_model(&request.prompt, priority)
                    .map(|rec| rec.model),
                (None, None) => None,
            };
            ProcessOutcome::Single(
                self.route_cached(&prompt, model.as_deref(), &request)
                    .await,
            )
        };

        if let Some(id) = request.conversation_id.as_deref() {
            self.memory.add_message(id, Role::User, request.prompt.as_str(), None);
            if let Some(answer) = outcome.primary().filter(|r| r.success) {
                self.memory
                    .add_message(id, Role::Assistant, answer.text.as_str(), Some(answer.model.as_str()));
            }
        }

        outcome
    }

    async fn route_cached(
        &self,
        prompt: &str,
        model: Option<&str>,
        request: &PromptRequest,
    ) -> ModelResponse {
        let key_model = model.unwrap_or(ANY_MODEL_KEY);
        if let Some(hit) = self.cache.get(prompt, key_model, &request.params) {
            return hit;
        }

        let response = self
            .router
            .route(prompt, model, &request.params, request.fallback)
            .await;
        self.cache
            .set(prompt, key_model, &response, &request.params, None);
        response
    }

    /// Registered model identifiers
    #[must_use]
    pub fn get_available_models(&self) -> Vec<String> {
        self.router.available_models().to_vec()
    }

    /// Live metrics, overall and per model
    #[must_use]
    pub fn get_performance_metrics(&self, model: Option<&str>) -> PerformanceReport {
        self.monitor.get_metrics(model)
    }

    /// Whether broadcasts can be synthesized by a model
    #[must_use]
    pub fn is_synthesis_available(&self) -> bool {
        self.synthesis.is_available()
    }

    /// Best registered model for `prompt` given the live metrics
    #[must_use]
    pub fn recommend_model(&self, prompt: &str, priority: Priority) -> Option<Recommendation> {
        let metrics = self.monitor.get_metrics(None);
        self.optimizer
            .recommend_model(prompt, priority, &metrics, self.router.available_models())
    }

    /// Cancel every queued or running provider call tagged with `request_id`
    ///
    /// Calls are tagged through [`crate::GenerationParams::with_request_id`].
    /// Returns whether anything was using the id.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.router.resources().cancel(request_id)
    }

    /// Cache counters
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Conversation log
    #[must_use]
    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    /// Underlying router
    #[must_use]
    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Underlying cache
    #[must_use]
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the periodic cache and monitor sweep
    ///
    /// Calling this while the task is running does nothing. A zero interval
    /// is refused and the task is not started.
    pub fn start_maintenance(&self, interval: Duration) {
        if interval.is_zero() {
            tracing::warn!("Maintenance interval is zero, not starting maintenance task");
            return;
        }

        let mut slot = self.maintenance.lock();
        if slot.as_ref().is_some_and(|m| !m.handle.is_finished()) {
            tracing::debug!("Maintenance task already running");
            return;
        }

        let (stop, mut stop_rx) = watch::channel(false);
        let cache = Arc::clone(&self.cache);
        let monitor = Arc::clone(&self.monitor);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => run_maintenance(&cache, &monitor),
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Maintenance task stopped");
        });

        tracing::info!(interval_secs = interval.as_secs(), "Maintenance task started");
        *slot = Some(Maintenance { stop, handle });
    }

    /// Whether the maintenance task is running
    ///
    /// A task that ended on its own (for example by panicking) counts as
    /// stopped.
    #[must_use]
    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(|m| !m.handle.is_finished())
    }

    /// Stop the maintenance task and write a final cache snapshot
    ///
    /// Does nothing if maintenance was never started.
    pub async fn shutdown(&self) {
        let maintenance = self.maintenance.lock().take();
        let Some(maintenance) = maintenance else {
            return;
        };

        let _ = maintenance.stop.send(true);
        if let Err(e) = maintenance.handle.await {
            tracing::warn!(error = %e, "Maintenance task ended abnormally");
        }

        if let Err(e) = self.cache.save_snapshot() {
            tracing::warn!(error = %e, "Failed to write final cache snapshot");
        }
        tracing::info!("Gateway shut down");
    }
}

fn run_maintenance(cache: &ResponseCache, monitor: &PerformanceMonitor) {
    let purged = cache.purge_expired();
    if let Err(e) = cache.save_snapshot() {
        tracing::warn!(error = %e, "Periodic cache snapshot failed");
    }
    monitor.cleanup();
    tracing::debug!(purged, in_flight = monitor.in_flight(), "Maintenance sweep");
}
