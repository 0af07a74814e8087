//! Offline provider that echoes the prompt back
//!
//! Useful for running the daemon without network access and for exercising
//! the orchestration paths deterministically.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::traits::{ProviderClient, ProviderError};
use crate::types::{GenerationParams, ModelResponse, Usage};

/// Deterministic provider returning `[model] prompt`
#[derive(Clone, Debug)]
pub struct EchoProvider {
    model: String,
    delay: Duration,
}

impl EchoProvider {
    /// Create an echo provider reporting the given model name
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            delay: Duration::ZERO,
        }
    }

    /// Sleep before answering, to simulate backend latency
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ProviderClient for EchoProvider {
    fn name(&self) -> &str {
        "Echo"
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ModelResponse, ProviderError> {
        let start = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let words: Vec<&str> = prompt.split_whitespace().collect();
        let budget = usize::try_from(params.max_tokens).unwrap_or(usize::MAX);
        let echoed = words.iter().take(budget).copied().collect::<Vec<_>>().join(" ");

        let prompt_tokens = u32::try_from(words.len()).unwrap_or(u32::MAX);
        let completion_tokens = u32::try_from(words.len().min(budget)).unwrap_or(u32::MAX);

        Ok(ModelResponse::success(&self.model, format!("[{}] {echoed}", self.model))
            .with_usage(Usage::new(prompt_tokens, completion_tokens))
            .with_latency(start.elapsed()))
    }
}
