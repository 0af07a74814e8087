//! Deadline wrapper for provider calls

use std::future::Future;
use std::time::Duration;

use crate::types::{ModelResponse, UNKNOWN_MODEL};

/// Race `operation` against `deadline`
///
/// On expiry the operation future is dropped, which cancels it and releases
/// anything it holds, and a `timeout` failure attributed to `model` (or
/// `"unknown"`) is returned in its place.
pub async fn with_timeout<F, E>(
    operation: F,
    deadline: Duration,
    model: Option<&str>,
) -> Result<ModelResponse, E>
where
    F: Future<Output = Result<ModelResponse, E>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => {
            let model = model.unwrap_or(UNKNOWN_MODEL);
            tracing::warn!(model = %model, deadline_ms = deadline.as_millis() as u64, "Request timed out");
            Ok(ModelResponse::timeout(model, deadline))
        }
    }
}
