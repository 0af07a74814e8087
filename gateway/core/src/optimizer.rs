//! Metric-driven model selection
//!
//! Scores every model with enough history on speed, quality and token
//! efficiency, weights the scores by the caller's [`Priority`], and nudges
//! them by how complex the prompt looks.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::monitor::{MetricsSnapshot, PerformanceReport};
use crate::types::GenerationParams;

/// Code-ish characters counted towards prompt complexity
const CODE_CHARS: &[char] = &['{', '}', '[', ']', '(', ')', '=', '+', '-', '*', '/', '>', '<'];

/// What the caller cares about most
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Lowest latency
    Speed,
    /// Highest success rate
    Quality,
    /// Fewest tokens
    Cost,
    /// Even mix
    #[default]
    Balanced,
}

impl Priority {
    /// (speed, quality, efficiency) weights
    fn weights(self) -> (f64, f64, f64) {
        match self {
            Self::Speed => (0.7, 0.2, 0.1),
            Self::Quality => (0.1, 0.7, 0.2),
            Self::Cost => (0.2, 0.1, 0.7),
            Self::Balanced => (0.33, 0.34, 0.33),
        }
    }

    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Speed => "speed",
            Self::Quality => "quality",
            Self::Cost => "cost",
            Self::Balanced => "balanced",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "speed" => Ok(Self::Speed),
            "quality" => Ok(Self::Quality),
            "cost" => Ok(Self::Cost),
            "balanced" => Ok(Self::Balanced),
            other => Err(format!(
                "unknown priority '{other}' (expected speed, quality, cost or balanced)"
            )),
        }
    }
}

/// Component scores on a 0-100 scale, after complexity adjustment
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelScores {
    /// From average latency
    pub speed: f64,
    /// From success rate
    pub quality: f64,
    /// From average tokens per request
    pub efficiency: f64,
}

/// Optimizer output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    /// Chosen model
    pub model: String,
    /// Weighted score
    pub score: f64,
    /// Component scores behind `score`
    pub scores: ModelScores,
    /// Priority the choice was made for
    pub priority: Priority,
    /// Prompt complexity in [0, 1]
    pub complexity: f64,
    /// Suggested sampling parameters
    pub params: GenerationParams,
}

/// Picks a model from live metrics
#[derive(Clone, Debug)]
pub struct ModelOptimizer {
    min_requests: u64,
}

impl Default for ModelOptimizer {
    fn default() -> Self {
        Self { min_requests: 5 }
    }
}

impl ModelOptimizer {
    /// Optimizer requiring the default history (5 requests) per model
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Change how many completed requests a model needs to be considered
    #[must_use]
    pub fn with_min_requests(mut self, min_requests: u64) -> Self {
        self.min_requests = min_requests;
        self
    }

    /// Best model among `candidates` for `prompt`, if any has enough history
    #[must_use]
    pub fn recommend_model(
        &self,
        prompt: &str,
        priority: Priority,
        metrics: &PerformanceReport,
        candidates: &[String],
    ) -> Option<Recommendation> {
        let complexity = prompt_complexity(prompt);
        let (w_speed, w_quality, w_efficiency) = priority.weights();

        let mut best: Option<(f64, &String, ModelScores)> = None;
        for model in candidates {
            let Some(stats) = metrics.models.get(model) else {
                continue;
            };
            if stats.requests < self.min_requests {
                continue;
            }

            let scores = score_model(stats, complexity);
            let total = scores.speed * w_speed + scores.quality * w_quality + scores.efficiency * w_efficiency;
            if best.as_ref().map_or(true, |(top, _, _)| total > *top) {
                best = Some((total, model, scores));
            }
        }

        best.map(|(score, model, scores)| {
            tracing::debug!(model = %model, score, priority = %priority, complexity, "Recommended model");
            Recommendation {
                model: model.clone(),
                score,
                scores,
                priority,
                complexity,
                params: suggested_params(priority, complexity),
            }
        })
    }
}

fn score_model(stats: &MetricsSnapshot, complexity: f64) -> ModelScores {
    let mut speed = 100.0 - (stats.avg_latency / 10.0 * 100.0).min(100.0);
    let mut quality = stats.success_rate * 100.0;
    let efficiency = 100.0 - (stats.avg_tokens_per_request / 2000.0 * 100.0).min(100.0);

    if complexity > 0.7 {
        quality *= 1.2;
        speed *= 0.8;
    } else if complexity < 0.3 {
        quality *= 0.9;
        speed *= 1.1;
    }

    ModelScores {
        speed,
        quality,
        efficiency,
    }
}

/// Heuristic complexity of a prompt in [0, 1]
///
/// Weighs length (saturating at 1000 chars), sentence count (at 20) and
/// code-like punctuation (at 100).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn prompt_complexity(prompt: &str) -> f64 {
    let length = prompt.chars().count() as f64;
    let sentences = prompt
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count() as f64;
    let code = prompt.chars().filter(|c| CODE_CHARS.contains(c)).count() as f64;

    0.4 * (length / 1000.0).min(1.0) + 0.3 * (sentences / 20.0).min(1.0) + 0.3 * (code / 100.0).min(1.0)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn suggested_params(priority: Priority, complexity: f64) -> GenerationParams {
    let (temperature, max_tokens, top_p) = match priority {
        Priority::Speed => (0.5, 500.0 + 500.0 * complexity, 0.9),
        Priority::Quality => (0.3 + 0.4 * complexity, 1000.0 + 1000.0 * complexity, 0.95),
        Priority::Cost => (0.7, 300.0 + 700.0 * complexity, 0.9),
        Priority::Balanced => (0.5 + 0.3 * complexity, 800.0 + 700.0 * complexity, 0.9),
    };

    GenerationParams::new()
        .with_temperature(temperature as f32)
        .with_max_tokens(max_tokens.round() as u32)
        .with_top_p(top_p as f32)
}
