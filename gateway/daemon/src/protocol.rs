//! Wire protocol between clients and the daemon
//!
//! Newline-delimited JSON. Each request line carries an `op` tag:
//!
//! ```text
//! {"op":"prompt","prompt":"Hi","model":"llama3"}
//! {"op":"prompt","prompt":"Hi","use_multiple":true,"synthesize":true,"synthesis_method":"sequential"}
//! {"op":"models"}
//! {"op":"metrics","model":"llama3"}
//! {"op":"recommend","prompt":"Write a sort","priority":"quality"}
//! {"op":"synthesis_available"}
//! {"op":"cache_stats"}
//! {"op":"cancel","request_id":"req-42"}
//! {"op":"ping"}
//! ```
//!
//! Every request gets exactly one response line of the form
//! `{"kind": ..., "data": ...}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use gateway_core::{
    CacheStats, Gateway, PerformanceReport, Priority, ProcessOutcome, PromptRequest,
    Recommendation,
};

/// Upper bound on a single request line
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Client request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Answer a prompt
    Prompt(PromptRequest),
    /// List registered models
    Models,
    /// Performance metrics, optionally for one model
    Metrics {
        #[serde(default)]
        model: Option<String>,
    },
    /// Best model for a prompt
    Recommend {
        prompt: String,
        #[serde(default)]
        priority: Priority,
    },
    /// Whether broadcasts can be synthesized by a model
    SynthesisAvailable,
    /// Cache counters
    CacheStats,
    /// Cancel calls tagged with `request_id`
    Cancel { request_id: String },
    /// Liveness check
    Ping,
}

/// Daemon response
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Response {
    /// Result of a prompt
    Outcome(ProcessOutcome),
    /// Registered model identifiers
    Models(Vec<String>),
    /// Live metrics
    Metrics(PerformanceReport),
    /// Recommended model, absent when nothing is registered
    Recommendation(Option<Recommendation>),
    /// Synthesis availability
    SynthesisAvailable(bool),
    /// Cache counters
    CacheStats(CacheStats),
    /// Whether any call was using the cancelled id
    Cancelled(bool),
    /// Reply to `ping`
    Pong,
    /// The request could not be served
    Error(String),
}

/// Request decoding failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not a valid request
    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Line exceeds [`MAX_LINE_BYTES`]
    #[error("Request too large: {size} bytes (limit {limit})")]
    TooLarge {
        /// Line length
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Prompt text is empty
    #[error("Prompt must not be empty")]
    EmptyPrompt,
}

/// Decode one request line
pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::TooLarge {
            size: line.len(),
            limit: MAX_LINE_BYTES,
        });
    }

    let request: Request = serde_json::from_str(line)?;
    match &request {
        Request::Prompt(prompt) if prompt.prompt.trim().is_empty() => {
            Err(ProtocolError::EmptyPrompt)
        }
        Request::Recommend { prompt, .. } if prompt.trim().is_empty() => {
            Err(ProtocolError::EmptyPrompt)
        }
        _ => Ok(request),
    }
}

/// Encode one response line, newline included
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut line = serde_json::to_vec(response).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to encode response");
        br#"{"kind":"error","data":"Failed to encode response"}"#.to_vec()
    });
    line.push(b'\n');
    line
}

/// Serve one request line against the gateway
pub async fn dispatch(gateway: &Gateway, line: &str) -> Response {
    let request = match decode_request(line) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(error = %e, "Rejected request");
            return Response::Error(e.to_string());
        }
    };

    match request {
        Request::Prompt(prompt) => Response::Outcome(gateway.process_prompt(prompt).await),
        Request::Models => Response::Models(gateway.get_available_models()),
        Request::Metrics { model } => {
            Response::Metrics(gateway.get_performance_metrics(model.as_deref()))
        }
        Request::Recommend { prompt, priority } => {
            Response::Recommendation(gateway.recommend_model(&prompt, priority))
        }
        Request::SynthesisAvailable => {
            Response::SynthesisAvailable(gateway.is_synthesis_available())
        }
        Request::CacheStats => Response::CacheStats(gateway.cache_stats()),
        Request::Cancel { request_id } => Response::Cancelled(gateway.cancel(&request_id)),
        Request::Ping => Response::Pong,
    }
}
