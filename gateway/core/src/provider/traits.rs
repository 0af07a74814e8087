//! Provider capability trait
//!
//! The orchestration core depends on exactly one capability from a provider:
//! given a prompt and sampling parameters, produce a [`ModelResponse`]. How
//! the adapter talks to its backend is its own business.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{GenerationParams, ModelResponse};

/// Errors an adapter may raise
///
/// Raised errors are converted into `execution_error` responses at the
/// resilience boundary and never reach gateway callers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport-level failure
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("{provider} returned {status}: {body}")]
    Status {
        /// Adapter name
        provider: String,
        /// HTTP status code
        status: u16,
        /// Response body, possibly truncated
        body: String,
    },

    /// The backend answered with something we could not interpret
    #[error("Malformed response from {provider}: {reason}")]
    Decode {
        /// Adapter name
        provider: String,
        /// What was wrong
        reason: String,
    },

    /// A credential the adapter needs is not configured
    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(String),

    /// Any other adapter failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A single LLM backend addressed by model identifier
///
/// Implementations must be cheap to share; the router holds them behind
/// `Arc` and calls them concurrently.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Adapter name for logs
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`
    ///
    /// Returning `Ok` with `success = false` is a structured failure; returning
    /// `Err` means the adapter raised.
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ModelResponse, ProviderError>;
}

/// Truncate a response body for error messages
pub(crate) fn truncate_body(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
