//! Provider clients
//!
//! The orchestration core treats every backend polymorphically through
//! [`ProviderClient`]. Adding a backend means registering another
//! implementation in a [`ProviderRegistry`].
//!
//! # Available Adapters
//!
//! - **Ollama**: local server, `/api/generate`
//! - **OpenAI-compatible**: any `/chat/completions` endpoint with bearer auth
//! - **Echo**: offline, deterministic
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use gateway_core::provider::{EchoProvider, ProviderRegistry};
//!
//! let registry = ProviderRegistry::new()
//!     .with("echo", Arc::new(EchoProvider::new("echo")))?;
//! ```

mod echo;
mod ollama;
mod openai;
mod registry;
mod traits;

pub use echo::EchoProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatibleProvider;
pub use registry::{ProviderRegistry, RegistryError};
pub use traits::{ProviderClient, ProviderError};
