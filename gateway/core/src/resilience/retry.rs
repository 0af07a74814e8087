//! Exponential backoff retry

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, ModelResponse};

/// Retry policy for a single target
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Multiplier applied after each retry
    pub backoff_factor: f64,

    /// Upper bound on any single delay
    pub max_backoff: Duration,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_backoff: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set the retry count
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial delay
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Calculate backoff duration for attempt N (0-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64()).max(0.0);

        let secs = if self.jitter {
            capped * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped
        };

        Duration::try_from_secs_f64(secs).unwrap_or(self.max_backoff)
    }
}

/// Invoke `operation` until it succeeds, fails terminally, or retries run out
///
/// A structured failure whose kind is not retryable (timeout, open circuit,
/// unknown model) is returned immediately. When retries run out the last
/// failing response is returned; if the last attempt raised, the error is
/// folded into a `max_retries_exceeded` failure attributed to `model`.
pub async fn retry_with_backoff<F, Fut, E>(
    config: &RetryConfig,
    model: &str,
    mut operation: F,
) -> ModelResponse
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ModelResponse, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(response) if response.success => return response,
            Ok(response) => {
                if !response.is_retryable_failure() || attempt >= config.max_retries {
                    return response;
                }
                tracing::debug!(
                    model = %model,
                    attempt = attempt + 1,
                    error = ?response.error,
                    "Retrying failed request"
                );
            }
            Err(e) => {
                if attempt >= config.max_retries {
                    tracing::warn!(model = %model, retries = config.max_retries, error = %e, "Retries exhausted");
                    return ModelResponse::failure(
                        model,
                        ErrorKind::MaxRetriesExceeded,
                        format!("Error after {} retries: {e}", config.max_retries),
                    );
                }
                tracing::debug!(model = %model, attempt = attempt + 1, error = %e, "Retrying after error");
            }
        }

        tokio::time::sleep(config.backoff_for_attempt(attempt)).await;
        attempt += 1;
    }
}
