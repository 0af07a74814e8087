//! Gateway Core - Multi-Provider LLM Request Orchestration
//!
//! This crate routes prompts to one or many LLM providers and makes every
//! call survivable: cached, time-bounded, retried, circuit-broken,
//! concurrency-limited and measured. Broadcast answers can be merged into a
//! single answer by a designated synthesizer model.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             Gateway                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────────────┐ │
//! │  │ResponseCache │  │ Conversation │  │     SynthesisEngine     │ │
//! │  │              │  │    Memory    │  │                         │ │
//! │  └──────────────┘  └──────────────┘  └────────────┬────────────┘ │
//! │                                                   │              │
//! │  ┌────────────────────────────────────────────────┴────────────┐ │
//! │  │                          Router                              │ │
//! │  │   retry ─> ResourceManager ─> CircuitBreaker ─> timeout      │ │
//! │  └────────────────────────────┬────────────────────────────────┘ │
//! │                               │          PerformanceMonitor      │
//! └───────────────────────────────┼──────────────────────────────────┘
//!                                 │
//!        ┌────────────────────────┼────────────────────────┐
//!        │                        │                        │
//!  OllamaProvider    OpenAiCompatibleProvider        EchoProvider
//! ```
//!
//! # Key Types
//!
//! - [`Gateway`]: the public orchestration API
//! - [`PromptRequest`] / [`ProcessOutcome`]: what goes in and comes out
//! - [`ModelResponse`]: every terminal outcome, success or failure
//! - [`ProviderClient`]: the one capability a provider adapter implements
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gateway_core::{EchoProvider, Gateway, GatewayConfig, PromptRequest, ProviderRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = ProviderRegistry::new()
//!         .with("echo", Arc::new(EchoProvider::new("echo")))
//!         .unwrap();
//!     let gateway = Gateway::new(&GatewayConfig::default(), registry);
//!
//!     let outcome = gateway.process_prompt(PromptRequest::new("Hello")).await;
//!     println!("{:?}", outcome.primary());
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod gateway;
pub mod memory;
pub mod monitor;
pub mod optimizer;
pub mod provider;
pub mod resilience;
pub mod resource;
pub mod router;
pub mod synthesis;
pub mod types;

// Orchestration
pub use gateway::Gateway;
pub use router::Router;
pub use synthesis::{SynthesisConfig, SynthesisEngine, SynthesisMethod};
pub use types::{
    ErrorKind, GenerationParams, ModelResponse, ProcessOutcome, PromptRequest, Usage,
    SYSTEM_MODEL, UNKNOWN_MODEL,
};

// Providers
pub use provider::{
    EchoProvider, OllamaProvider, OpenAiCompatibleProvider, ProviderClient, ProviderError,
    ProviderRegistry, RegistryError,
};

// Components
pub use cache::{CacheConfig, CacheError, CacheStats, ResponseCache};
pub use memory::{ConversationMemory, Message, Role};
pub use monitor::{MetricsSnapshot, MonitorConfig, PerformanceMonitor, PerformanceReport};
pub use optimizer::{ModelOptimizer, Priority, Recommendation};
pub use resilience::{
    retry_with_backoff, with_timeout, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    ResilienceConfig, RetryConfig,
};
pub use resource::{Admission, RateLimit, ResourceConfig, ResourceError, ResourceManager};

// Config exports
pub use config::{
    default_config_path, default_snapshot_path, load_config, load_config_from_path, ConfigError,
    ConfigOverrides, ConfigSource, GatewayConfig, GatewayToml, ProviderKind, ProviderSpec,
};
