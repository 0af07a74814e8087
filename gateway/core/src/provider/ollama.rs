//! Ollama Provider
//!
//! Adapter for a local Ollama server using the non-streaming
//! `/api/generate` endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::traits::{truncate_body, ProviderClient, ProviderError};
use crate::types::{GenerationParams, ModelResponse, Usage, DEFAULT_TEMPERATURE};

/// Ollama backend client bound to one model
#[derive(Clone)]
pub struct OllamaProvider {
    /// Base URL, e.g. `http://localhost:11434`
    base_url: String,
    /// Model name as Ollama knows it
    model: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaProvider {
    /// Default local endpoint
    pub const DEFAULT_BASE_URL: &'static str = "http://localhost:11434";

    /// Create a new Ollama provider
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(Duration::from_secs(120)))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http_client,
        })
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    /// Build the JSON request body
    fn request_body(&self, prompt: &str, params: &GenerationParams) -> serde_json::Value {
        let mut options = serde_json::Map::new();
        if (params.temperature - DEFAULT_TEMPERATURE).abs() > f32::EPSILON {
            options.insert("temperature".to_string(), serde_json::json!(params.temperature));
        }
        if params.max_tokens > 0 {
            options.insert("num_predict".to_string(), serde_json::json!(params.max_tokens));
        }
        if let Some(top_p) = params.top_p {
            options.insert("top_p".to_string(), serde_json::json!(top_p));
        }

        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }
        body
    }
}

#[async_trait]
impl ProviderClient for OllamaProvider {
    fn name(&self) -> &str {
        "Ollama"
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ModelResponse, ProviderError> {
        let start = Instant::now();

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&self.request_body(prompt, params))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                provider: self.name().to_string(),
                status,
                body: truncate_body(&body),
            });
        }

        let data: serde_json::Value = response.json().await?;

        let content = data
            .get("response")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProviderError::Decode {
                provider: self.name().to_string(),
                reason: "missing `response` field".to_string(),
            })?
            .to_string();

        let count = |field: &str| {
            data.get(field)
                .and_then(serde_json::Value::as_u64)
                .and_then(|c| u32::try_from(c).ok())
        };

        let mut result = ModelResponse::success(&self.model, content).with_latency(start.elapsed());
        if let Some(completion) = count("eval_count") {
            result = result.with_usage(Usage::new(
                count("prompt_eval_count").unwrap_or(0),
                completion,
            ));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_provider_creation() {
        let provider = OllamaProvider::new("http://localhost:11434/", "llama3.2", None).unwrap();
        assert_eq!(provider.base_url, "http://localhost:11434");
        assert_eq!(provider.generate_url(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn test_request_body_defaults() {
        let provider = OllamaProvider::new(OllamaProvider::DEFAULT_BASE_URL, "llama3.2", None).unwrap();
        let body = provider.request_body("Hello", &GenerationParams::default());

        assert_eq!(body["model"], "llama3.2");
        assert_eq!(body["prompt"], "Hello");
        assert_eq!(body["stream"], false);
        assert_eq!(body["options"]["num_predict"], 1000);
        assert!(body["options"].get("temperature").is_none());
    }

    #[test]
    fn test_request_body_custom_sampling() {
        let provider = OllamaProvider::new(OllamaProvider::DEFAULT_BASE_URL, "llama3.2", None).unwrap();
        let params = GenerationParams::default()
            .with_temperature(0.2)
            .with_top_p(0.9);
        let body = provider.request_body("Hello", &params);

        assert!(body["options"]["temperature"].as_f64().is_some());
        assert!(body["options"]["top_p"].as_f64().is_some());
    }
}
