//! OpenAI-compatible chat completions adapter
//!
//! Works with any backend exposing `/chat/completions` with bearer auth
//! (OpenAI, OpenRouter, DeepSeek, vLLM and friends).

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::traits::{truncate_body, ProviderClient, ProviderError};
use crate::types::{GenerationParams, ModelResponse, Usage};

/// Chat completions client bound to one model
#[derive(Clone)]
pub struct OpenAiCompatibleProvider {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    /// Default API root
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    /// Default environment variable holding the API key
    pub const DEFAULT_KEY_ENV: &'static str = "OPENAI_API_KEY";

    /// Create a provider with an explicit key
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Option<Duration>,
    ) -> Result<Self, ProviderError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout.unwrap_or(Duration::from_secs(60)))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
            http_client,
        })
    }

    /// Create a provider reading its key from `key_var`
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::MissingCredential`] if the variable is unset.
    pub fn from_env_key(
        base_url: impl Into<String>,
        model: impl Into<String>,
        key_var: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, ProviderError> {
        let key = std::env::var(key_var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ProviderError::MissingCredential(key_var.to_string()))?;
        Self::new(base_url, model, Some(key), timeout)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn request_body(&self, prompt: &str, params: &GenerationParams) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });
        if let Some(top_p) = params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        body
    }

    fn parse_body(&self, data: &serde_json::Value) -> Result<(String, Option<Usage>), ProviderError> {
        let content = data
            .pointer("/choices/0/message/content")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProviderError::Decode {
                provider: self.name().to_string(),
                reason: "missing choices[0].message.content".to_string(),
            })?;

        let usage = data.get("usage").map(|u| {
            let field = |name: &str| {
                u.get(name)
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(0)
            };
            Usage::new(field("prompt_tokens"), field("completion_tokens"))
        });

        Ok((content.to_string(), usage))
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "OpenAI-compatible"
    }

    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ModelResponse, ProviderError> {
        let start = Instant::now();

        let mut request = self
            .http_client
            .post(self.completions_url())
            .json(&self.request_body(prompt, params));
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
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
        let (content, usage) = self.parse_body(&data)?;

        let mut result = ModelResponse::success(&self.model, content).with_latency(start.elapsed());
        if let Some(usage) = usage {
            result = result.with_usage(usage);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn provider() -> OpenAiCompatibleProvider {
        OpenAiCompatibleProvider::new("https://example.test/v1/", "gpt-4o-mini", None, None).unwrap()
    }

    #[test]
    fn test_urls_and_body() {
        let provider = provider();
        assert_eq!(provider.completions_url(), "https://example.test/v1/chat/completions");

        let body = provider.request_body("Hi", &GenerationParams::default().with_max_tokens(50));
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["content"], "Hi");
        assert_eq!(body["max_tokens"], 50);
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_parse_body() {
        let data = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Paris" } }],
            "usage": { "prompt_tokens": 9, "completion_tokens": 1, "total_tokens": 10 }
        });
        let (content, usage) = provider().parse_body(&data).unwrap();
        assert_eq!(content, "Paris");
        assert_eq!(usage, Some(Usage::new(9, 1)));
    }

    #[test]
    fn test_parse_body_missing_content() {
        let data = serde_json::json!({ "choices": [] });
        let err = provider().parse_body(&data).unwrap_err();
        assert!(matches!(err, ProviderError::Decode { .. }));
    }

    #[test]
    fn test_missing_key() {
        let err = OpenAiCompatibleProvider::from_env_key(
            OpenAiCompatibleProvider::DEFAULT_BASE_URL,
            "gpt",
            "GATEWAY_TEST_UNSET_KEY_VAR",
            None,
        )
        .err();
        assert!(matches!(err, Some(ProviderError::MissingCredential(_))));
    }
}
