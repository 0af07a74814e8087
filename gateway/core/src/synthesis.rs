//! Combining broadcast answers into one
//!
//! Successful responses are folded into a meta-prompt and sent to a
//! designated synthesizer model through the router's normal resilient path.
//! When no synthesizer is configured, or its call fails, the answers are
//! concatenated under per-model headers instead, which cannot fail.
//!
//! How the answers are gathered depends on the [`SynthesisMethod`]:
//!
//! ```text
//! parallel    every model answers the prompt at once
//! sequential  models answer one after another, each seeing the answers so far
//! debate      opening answers, then N rounds over the shared debate history
//! ```

use std::fmt;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::router::Router;
use crate::types::{ErrorKind, GenerationParams, ModelResponse};

/// Model tag for synthesis failures
pub const SYNTHESIS_MODEL: &str = "synthesis";

/// Model tag for the deterministic fallback
pub const MANUAL_SYNTHESIS_MODEL: &str = "synthesis (manual combination)";

/// Default completion budget for the synthesizer
pub const DEFAULT_SYNTHESIS_MAX_TOKENS: u32 = 1500;

/// Revision rounds after the opening answers of a debate
pub const DEFAULT_DEBATE_ROUNDS: usize = 2;

const RESPONSE_PREFIX: &str = "Synthesized Response:";

/// How answers are collected before they are combined
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisMethod {
    /// Every model answers independently and concurrently
    #[default]
    Parallel,
    /// Models answer in turn, each refining the answers before it
    Sequential,
    /// Models revise their answers over several rounds of shared history
    Debate,
}

impl SynthesisMethod {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Debate => "debate",
        }
    }
}

impl fmt::Display for SynthesisMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SynthesisMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "debate" => Ok(Self::Debate),
            other => Err(format!(
                "unknown synthesis method '{other}' (expected parallel, sequential or debate)"
            )),
        }
    }
}

/// Synthesizer settings
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SynthesisConfig {
    /// Model asked to write the combined answer
    pub synthesizer: Option<String>,
    /// Completion budget for that call (default 1500)
    pub max_tokens: Option<u32>,
    /// Method used when a request does not name one
    pub method: SynthesisMethod,
    /// Debate rounds after the opening answers (default 2)
    pub debate_rounds: Option<usize>,
}

/// Merges several model responses into a single answer
#[derive(Debug)]
pub struct SynthesisEngine {
    router: Arc<Router>,
    synthesizer: Option<String>,
    max_tokens: u32,
    method: SynthesisMethod,
    debate_rounds: usize,
}

impl SynthesisEngine {
    /// Create an engine that calls models through `router`
    #[must_use]
    pub fn new(router: Arc<Router>, config: &SynthesisConfig) -> Self {
        Self {
            router,
            synthesizer: config.synthesizer.clone(),
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_SYNTHESIS_MAX_TOKENS),
            method: config.method,
            debate_rounds: config.debate_rounds.unwrap_or(DEFAULT_DEBATE_ROUNDS),
        }
    }

    /// Method used when a request does not name one
    #[must_use]
    pub fn default_method(&self) -> SynthesisMethod {
        self.method
    }

    /// Configured synthesizer model
    #[must_use]
    pub fn synthesizer(&self) -> Option<&str> {
        self.synthesizer.as_deref()
    }

    /// Whether a synthesizer is configured and registered
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.synthesizer
            .as_deref()
            .is_some_and(|model| self.router.has_model(model))
    }

    /// Combine `responses` into one answer to `prompt`
    ///
    /// - no responses: `no_responses` failure
    /// - one response: returned unchanged
    /// - no successes: `no_successful_responses` failure, nothing is called
    /// - otherwise the synthesizer answers, or the manual combination does
    pub async fn synthesize(
        &self,
        prompt: &str,
        responses: &[ModelResponse],
        params: &GenerationParams,
    ) -> ModelResponse {
        match responses {
            [] => {
                return ModelResponse::failure(
                    SYNTHESIS_MODEL,
                    ErrorKind::NoResponses,
                    "No responses to synthesize.",
                )
            }
            [only] => return only.clone(),
            _ => {}
        }

        let successful: Vec<&ModelResponse> = responses.iter().filter(|r| r.success).collect();
        if successful.is_empty() {
            tracing::warn!(responses = responses.len(), "Nothing to synthesize");
            return ModelResponse::failure(
                SYNTHESIS_MODEL,
                ErrorKind::NoSuccessfulResponses,
                "No successful responses to synthesize.",
            );
        }

        match self.ask_synthesizer(prompt, &successful, params).await {
            Some(response) => response,
            None => manual_combination(&successful),
        }
    }

    /// Collect answers from `models` with `method`, then combine them
    ///
    /// `prompt` is what the models are asked (it may carry conversation
    /// context); `question` is the bare user prompt the synthesizer sees.
    /// Returns every individual answer in the order it was produced, and
    /// the combined answer.
    pub async fn deliberate(
        &self,
        method: SynthesisMethod,
        prompt: &str,
        question: &str,
        models: Option<&[String]>,
        params: &GenerationParams,
    ) -> (Vec<ModelResponse>, ModelResponse) {
        let participants = self.router.known_models(models);

        match method {
            SynthesisMethod::Sequential if !participants.is_empty() => {
                self.sequential(prompt, question, &participants, params).await
            }
            SynthesisMethod::Debate if participants.len() >= 2 => {
                self.debate(prompt, question, &participants, params).await
            }
            _ => {
                let responses = self.router.broadcast(prompt, models, params).await;
                let synthesis = self.synthesize(question, &responses, params).await;
                (responses, synthesis)
            }
        }
    }

    async fn sequential(
        &self,
        prompt: &str,
        question: &str,
        participants: &[String],
        params: &GenerationParams,
    ) -> (Vec<ModelResponse>, ModelResponse) {
        let mut current = prompt.to_string();
        let mut responses = Vec::with_capacity(participants.len());

        for model in participants {
            let response = self.router.call_model(model, &current, params).await;
            if response.success {
                current = refinement_prompt(&current, model, &response.text);
            } else {
                tracing::debug!(model = %model, error = ?response.error, "Skipping failed refinement");
            }
            responses.push(response);
        }

        let successful: Vec<&ModelResponse> = responses.iter().filter(|r| r.success).collect();
        let Some(last) = successful.last() else {
            return (responses.clone(), no_successful_responses());
        };
        if successful.len() == 1 {
            let only = (*last).clone();
            return (responses, only);
        }

        let synthesis = match self.ask_synthesizer(question, &successful, params).await {
            Some(response) => response,
            // The last refinement already builds on every earlier answer
            None => (*last).clone(),
        };
        (responses, synthesis)
    }

    async fn debate(
        &self,
        prompt: &str,
        question: &str,
        participants: &[String],
        params: &GenerationParams,
    ) -> (Vec<ModelResponse>, ModelResponse) {
        let opening = self
            .router
            .broadcast(&opening_prompt(prompt), Some(participants), params)
            .await;

        let mut history: Vec<ModelResponse> = opening.iter().filter(|r| r.success).cloned().collect();
        let mut responses = opening;
        if history.is_empty() {
            tracing::warn!(participants = participants.len(), "No opening answers, abandoning debate");
            return (responses, no_successful_responses());
        }

        let mut last_round = history.clone();
        for round in 1..=self.debate_rounds {
            let answers = self
                .router
                .broadcast(&round_prompt(prompt, &history, round), Some(participants), params)
                .await;
            let successful: Vec<ModelResponse> = answers.iter().filter(|r| r.success).cloned().collect();
            tracing::debug!(round, answers = successful.len(), "Debate round finished");

            responses.extend(answers);
            if !successful.is_empty() {
                last_round.clone_from(&successful);
            }
            history.extend(successful);
        }

        let sources: Vec<&ModelResponse> = history.iter().collect();
        let synthesis = match self.ask_synthesizer(question, &sources, params).await {
            Some(response) => response,
            None => manual_combination(&last_round.iter().collect::<Vec<_>>()),
        };
        (responses, synthesis)
    }

    /// The synthesizer's combined answer, or `None` when it is missing or fails
    async fn ask_synthesizer(
        &self,
        question: &str,
        sources: &[&ModelResponse],
        params: &GenerationParams,
    ) -> Option<ModelResponse> {
        let Some(synthesizer) = self.synthesizer.as_deref().filter(|m| self.router.has_model(m)) else {
            tracing::debug!("No synthesizer available, combining manually");
            return None;
        };

        let meta_prompt = build_meta_prompt(question, sources);
        let synthesis_params = params.clone().with_max_tokens(self.max_tokens);
        let response = self
            .router
            .call_model(synthesizer, &meta_prompt, &synthesis_params)
            .await;

        if !response.success {
            tracing::warn!(
                synthesizer = %synthesizer,
                error = ?response.error,
                "Synthesizer failed, combining manually"
            );
            return None;
        }

        tracing::info!(synthesizer = %synthesizer, sources = sources.len(), "Synthesized responses");
        Some(ModelResponse {
            text: clean_output(&response.text),
            model: format!("{SYNTHESIS_MODEL} (via {synthesizer})"),
            ..response
        })
    }
}

fn no_successful_responses() -> ModelResponse {
    ModelResponse::failure(
        SYNTHESIS_MODEL,
        ErrorKind::NoSuccessfulResponses,
        "No successful responses to synthesize.",
    )
}

/// `current` extended with `model`'s answer for the next model to build on
fn refinement_prompt(current: &str, model: &str, answer: &str) -> String {
    format!(
        "{current}\n\n{model} answered:\n{}\n\n\
         Taking that answer into account, give your own improved answer:",
        answer.trim()
    )
}

fn opening_prompt(prompt: &str) -> String {
    format!(
        "You are taking part in a debate about the following question:\n\n{prompt}\n\n\
         Give your opening answer."
    )
}

/// Debate prompt for `round` (1-based) carrying every answer so far
fn round_prompt(prompt: &str, history: &[ModelResponse], round: usize) -> String {
    let mut text = format!("Question:\n\n{prompt}\n\nDebate so far:\n\n");
    for entry in history {
        let _ = write!(text, "{}: {}\n\n", entry.model, entry.text.trim());
    }
    let _ = write!(
        text,
        "Round {round}: considering the debate so far, give your updated answer. \
         You may challenge the other answers and strengthen your own."
    );
    text
}

/// Prompt asking the synthesizer to merge `responses`
///
/// Sources appear in input order, each under a header naming its model.
#[must_use]
pub fn build_meta_prompt(prompt: &str, responses: &[&ModelResponse]) -> String {
    let mut meta = String::from(
        "You are combining answers from several AI models into one answer.\n\n\
         Original question:\n\n",
    );
    let _ = write!(meta, "\"{prompt}\"\n\nAnswers:\n\n");

    for response in responses {
        let _ = write!(
            meta,
            "=== {} ===\n{}\n\n",
            response.model,
            response.text.trim()
        );
    }

    meta.push_str(
        "Write a single answer to the original question that:\n\
         - keeps the accurate and useful points from every answer\n\
         - resolves contradictions between them\n\
         - is complete and well structured\n\n\
         Combined answer:",
    );
    meta
}

/// Deterministic fallback: each answer under a header naming its model
fn manual_combination(responses: &[&ModelResponse]) -> ModelResponse {
    let mut text = String::from("Combined responses:\n\n");
    for response in responses {
        let _ = write!(text, "## {}\n{}\n\n", response.model, response.text.trim());
    }
    ModelResponse::success(MANUAL_SYNTHESIS_MODEL, text.trim_end())
}

/// Strip the echo prefix and `(From ...)` attribution lines
fn clean_output(text: &str) -> String {
    let text = text.trim_start();
    let text = text
        .strip_prefix(RESPONSE_PREFIX)
        .map_or(text, str::trim_start);

    text.lines()
        .filter(|line| {
            let line = line.trim();
            !(line.starts_with("(From ") && line.ends_with(')'))
        })
        .collect::<Vec<_>>()
        .join("\n")
}
