//! Request and response types shared by every gateway component
//!
//! Every provider call, cache hit, fallback and synthesis ends in a
//! [`ModelResponse`]. Failures are values rather than errors: a failed
//! response carries `success = false`, a human-readable `text` and a
//! machine-readable [`ErrorKind`].

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::optimizer::Priority;
use crate::synthesis::SynthesisMethod;

/// Model identifier for responses produced by the gateway itself
pub const SYSTEM_MODEL: &str = "system";

/// Model identifier used when the originating model cannot be determined
pub const UNKNOWN_MODEL: &str = "unknown";

/// Default sampling temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Default completion budget
pub const DEFAULT_MAX_TOKENS: u32 = 1000;

/// `extra` key holding a call's cancellation id
pub const REQUEST_ID_KEY: &str = "request_id";

// ============================================================================
// Error Kinds
// ============================================================================

/// Machine-readable failure classification carried by failed responses
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The call did not finish before its deadline
    Timeout,
    /// The target's circuit breaker rejected the call
    CircuitOpen,
    /// Retries were exhausted after the adapter kept raising
    MaxRetriesExceeded,
    /// Unknown or unconfigured model requested
    ModelUnavailable,
    /// Every candidate model failed during fallback
    AllModelsFailed,
    /// Synthesis was given no responses at all
    NoResponses,
    /// Synthesis was given responses but none succeeded
    NoSuccessfulResponses,
    /// The provider adapter raised an error
    ExecutionError,
    /// Admission was refused: the wait queue was full or timed out
    ResourceExhausted,
    /// The caller cancelled the request
    Cancelled,
    /// Caught at the orchestration boundary
    UnexpectedError,
}

impl ErrorKind {
    /// Wire name of this error kind
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::CircuitOpen => "circuit_open",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::ModelUnavailable => "model_unavailable",
            Self::AllModelsFailed => "all_models_failed",
            Self::NoResponses => "no_responses",
            Self::NoSuccessfulResponses => "no_successful_responses",
            Self::ExecutionError => "execution_error",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Cancelled => "cancelled",
            Self::UnexpectedError => "unexpected_error",
        }
    }

    /// Whether a failure of this kind may be retried against the same target
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::Timeout | Self::CircuitOpen | Self::ModelUnavailable | Self::Cancelled
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Usage
// ============================================================================

/// Token accounting reported by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens generated in the completion
    pub completion_tokens: u32,
    /// Sum of prompt and completion tokens
    pub total_tokens: u32,
}

impl Usage {
    /// Build usage from prompt and completion counts
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

// ============================================================================
// Model Response
// ============================================================================

/// Outcome of a single provider call or gateway decision
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Generated text, or a human-readable failure message
    pub text: String,
    /// Model the response is attributed to
    pub model: String,
    /// Whether the call produced a usable answer
    pub success: bool,
    /// Failure classification (absent on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Token accounting, when the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Wall-clock latency in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
}

impl ModelResponse {
    /// A successful response
    pub fn success(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            success: true,
            error: None,
            usage: None,
            latency: None,
        }
    }

    /// A failed response with the given classification
    pub fn failure(model: impl Into<String>, kind: ErrorKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: model.into(),
            success: false,
            error: Some(kind),
            usage: None,
            latency: None,
        }
    }

    /// Failure produced when a call exceeds its deadline
    pub fn timeout(model: impl Into<String>, deadline: Duration) -> Self {
        let model = model.into();
        let text = format!(
            "Request to {model} timed out after {} seconds.",
            deadline.as_secs_f64()
        );
        Self::failure(model, ErrorKind::Timeout, text)
    }

    /// Attach token usage
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attach latency
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency.as_secs_f64());
        self
    }

    /// Attribute the response to the registered `model` and fill in
    /// latency the adapter left out
    #[must_use]
    pub(crate) fn completed_by(mut self, model: &str, elapsed: Duration) -> Self {
        model.clone_into(&mut self.model);
        if self.latency.is_none() {
            self.latency = Some(elapsed.as_secs_f64());
        }
        self
    }

    /// Whether this failure may be retried against the same target
    #[must_use]
    pub fn is_retryable_failure(&self) -> bool {
        !self.success && self.error.map_or(true, ErrorKind::is_retryable)
    }
}

// ============================================================================
// Generation Parameters
// ============================================================================

/// Sampling parameters forwarded to providers
///
/// Only `temperature` and `max_tokens` affect the cache key; `priority` and
/// `extra` carry request metadata such as ids that must not split the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,
    /// Maximum tokens to generate
    pub max_tokens: u32,
    /// Nucleus sampling mass
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Admission priority; higher values are admitted first under load
    #[serde(skip_serializing_if = "is_default_priority")]
    pub priority: i32,
    /// Output-neutral metadata
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_default_priority(priority: &i32) -> bool {
    *priority == 0
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: None,
            priority: 0,
            extra: BTreeMap::new(),
        }
    }
}

impl GenerationParams {
    /// Default parameters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set temperature, clamped to the range providers accept
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set the completion budget
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set nucleus sampling
    #[must_use]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p.clamp(0.0, 1.0));
        self
    }

    /// Attach output-neutral metadata
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Set admission priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Tag calls with an id they can be cancelled under
    #[must_use]
    pub fn with_request_id(self, request_id: impl Into<String>) -> Self {
        self.with_extra(REQUEST_ID_KEY, request_id)
    }

    /// Cancellation id, if one was attached
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.extra.get(REQUEST_ID_KEY).map(String::as_str)
    }
}

// ============================================================================
// Orchestration API Types
// ============================================================================

/// A prompt submitted to the gateway
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptRequest {
    /// The user prompt
    pub prompt: String,
    /// Explicit model; `None` picks one at random with fallback
    pub model: Option<String>,
    /// Broadcast to several models instead of routing to one
    pub use_multiple: bool,
    /// Synthesize broadcast results into one answer
    pub synthesize: bool,
    /// Subset of models to broadcast to (all registered when absent)
    pub models: Option<Vec<String>>,
    /// Sampling parameters
    pub params: GenerationParams,
    /// Try other models when the requested one fails
    pub fallback: bool,
    /// Conversation to read context from and append to
    pub conversation_id: Option<String>,
    /// Let the optimizer choose a model when none is given
    pub auto_select: Option<Priority>,
    /// How to gather answers for synthesis (the engine default when absent)
    pub synthesis_method: Option<SynthesisMethod>,
}

impl Default for PromptRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: None,
            use_multiple: false,
            synthesize: false,
            models: None,
            params: GenerationParams::default(),
            fallback: true,
            conversation_id: None,
            auto_select: None,
            synthesis_method: None,
        }
    }
}

impl PromptRequest {
    /// Route `prompt` to any available model with fallback
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Route to a specific model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Broadcast to every registered model
    #[must_use]
    pub fn broadcast(mut self) -> Self {
        self.use_multiple = true;
        self
    }

    /// Broadcast to the given models only
    #[must_use]
    pub fn broadcast_to(mut self, models: Vec<String>) -> Self {
        self.use_multiple = true;
        self.models = Some(models);
        self
    }

    /// Synthesize broadcast results
    #[must_use]
    pub fn with_synthesis(mut self) -> Self {
        self.use_multiple = true;
        self.synthesize = true;
        self
    }

    /// Synthesize broadcast results gathered with `method`
    #[must_use]
    pub fn with_synthesis_method(mut self, method: SynthesisMethod) -> Self {
        self.synthesis_method = Some(method);
        self.with_synthesis()
    }

    /// Override sampling parameters
    #[must_use]
    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Disable fallback to other models
    #[must_use]
    pub fn without_fallback(mut self) -> Self {
        self.fallback = false;
        self
    }

    /// Attach a conversation log
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Let the optimizer choose a model
    #[must_use]
    pub fn with_auto_select(mut self, priority: Priority) -> Self {
        self.auto_select = Some(priority);
        self
    }
}

/// Result of [`crate::Gateway::process_prompt`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProcessOutcome {
    /// A routed single-model call
    Single(ModelResponse),
    /// A broadcast, optionally synthesized
    Multi {
        /// One response per model, in request order
        responses: Vec<ModelResponse>,
        /// Combined answer when synthesis was requested
        #[serde(skip_serializing_if = "Option::is_none")]
        synthesis: Option<ModelResponse>,
    },
}

impl ProcessOutcome {
    /// The answer a caller would show: the synthesis, the single response, or
    /// the first successful broadcast response
    #[must_use]
    pub fn primary(&self) -> Option<&ModelResponse> {
        match self {
            Self::Single(response) => Some(response),
            Self::Multi {
                responses,
                synthesis,
            } => synthesis
                .as_ref()
                .filter(|s| s.success)
                .or_else(|| responses.iter().find(|r| r.success))
                .or_else(|| responses.first()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_error_kind_wire_names() {
        assert_eq!(ErrorKind::CircuitOpen.as_str(), "circuit_open");
        assert_eq!(
            serde_json::to_string(&ErrorKind::MaxRetriesExceeded).unwrap(),
            "\"max_retries_exceeded\""
        );
        assert_eq!(ErrorKind::NoSuccessfulResponses.to_string(), "no_successful_responses");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(!ErrorKind::Timeout.is_retryable());
        assert!(!ErrorKind::CircuitOpen.is_retryable());
        assert!(ErrorKind::ExecutionError.is_retryable());
        assert!(ErrorKind::ResourceExhausted.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());

        let untyped = ModelResponse {
            error: None,
            ..ModelResponse::failure("m", ErrorKind::ExecutionError, "boom")
        };
        assert!(untyped.is_retryable_failure());
        assert!(!ModelResponse::success("m", "ok").is_retryable_failure());
    }

    #[test]
    fn test_timeout_message() {
        let response = ModelResponse::timeout("gpt", Duration::from_secs(30));
        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::Timeout));
        assert_eq!(response.text, "Request to gpt timed out after 30 seconds.");
    }

    #[test]
    fn test_params_builder_clamps() {
        let params = GenerationParams::new()
            .with_temperature(5.0)
            .with_max_tokens(64)
            .with_top_p(1.5);
        assert!((params.temperature - 2.0).abs() < f32::EPSILON);
        assert_eq!(params.max_tokens, 64);
        assert_eq!(params.top_p, Some(1.0));
    }

    #[test]
    fn test_prompt_request_defaults_from_json() {
        let request: PromptRequest = serde_json::from_str(r#"{"prompt": "hi"}"#).unwrap();
        assert_eq!(request.prompt, "hi");
        assert!(request.fallback);
        assert!(!request.use_multiple);
        assert_eq!(request.params, GenerationParams::default());
        assert_eq!(request.synthesis_method, None);
    }

    #[test]
    fn test_with_synthesis_method_implies_broadcast() {
        let request = PromptRequest::new("hi").with_synthesis_method(SynthesisMethod::Sequential);
        assert!(request.use_multiple);
        assert!(request.synthesize);
        assert_eq!(request.synthesis_method, Some(SynthesisMethod::Sequential));
    }

    #[test]
    fn test_completed_by_stamps_registered_name() {
        let response = ModelResponse::success("", "text").completed_by("llama", Duration::from_millis(250));
        assert_eq!(response.model, "llama");
        assert_eq!(response.latency, Some(0.25));

        let response = ModelResponse::success("gpt", "text")
            .with_latency(Duration::from_secs(1))
            .completed_by("other", Duration::from_millis(5));
        assert_eq!(response.model, "other");
        assert_eq!(response.latency, Some(1.0));
    }

    #[test]
    fn test_outcome_primary() {
        let outcome = ProcessOutcome::Multi {
            responses: vec![
                ModelResponse::failure("a", ErrorKind::Timeout, "slow"),
                ModelResponse::success("b", "answer"),
            ],
            synthesis: None,
        };
        assert_eq!(outcome.primary().map(|r| r.model.as_str()), Some("b"));
    }
}
