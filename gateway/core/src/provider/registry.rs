//! Model identifier to provider registry

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::echo::EchoProvider;
use super::ollama::OllamaProvider;
use super::openai::OpenAiCompatibleProvider;
use super::traits::{ProviderClient, ProviderError};
use crate::config::{ProviderKind, ProviderSpec};

/// Errors raised while assembling a registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A model identifier was registered twice
    #[error("Provider '{0}' is already registered")]
    Duplicate(String),

    /// A configured provider could not be constructed
    #[error("Failed to build provider '{name}': {source}")]
    Build {
        /// Model identifier from the configuration
        name: String,
        /// Underlying adapter error
        source: ProviderError,
    },
}

/// Registry of provider clients keyed by model identifier
///
/// Registration order is preserved and is the default broadcast order.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    order: Vec<String>,
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under a model identifier
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the identifier is taken.
    pub fn register(
        &mut self,
        model: impl Into<String>,
        client: Arc<dyn ProviderClient>,
    ) -> Result<(), RegistryError> {
        let model = model.into();
        if self.clients.contains_key(&model) {
            return Err(RegistryError::Duplicate(model));
        }
        tracing::debug!(model = %model, adapter = client.name(), "Registered provider");
        self.order.push(model.clone());
        self.clients.insert(model, client);
        Ok(())
    }

    /// Builder-style registration
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the identifier is taken.
    pub fn with(
        mut self,
        model: impl Into<String>,
        client: Arc<dyn ProviderClient>,
    ) -> Result<Self, RegistryError> {
        self.register(model, client)?;
        Ok(self)
    }

    /// Build a registry from provider configuration entries
    ///
    /// # Errors
    ///
    /// Returns an error if an adapter cannot be constructed or a name repeats.
    pub fn from_specs(specs: &[ProviderSpec]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for spec in specs {
            let client = build_client(spec).map_err(|source| RegistryError::Build {
                name: spec.name.clone(),
                source,
            })?;
            registry.register(spec.name.clone(), client)?;
        }
        Ok(registry)
    }

    /// Look up a client
    #[must_use]
    pub fn get(&self, model: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(model).cloned()
    }

    /// Whether a model identifier is registered
    #[must_use]
    pub fn contains(&self, model: &str) -> bool {
        self.clients.contains_key(model)
    }

    /// Registered model identifiers in registration order
    #[must_use]
    pub fn models(&self) -> &[String] {
        &self.order
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no providers are registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("models", &self.order)
            .finish()
    }
}

fn build_client(spec: &ProviderSpec) -> Result<Arc<dyn ProviderClient>, ProviderError> {
    let model = spec.model.clone().unwrap_or_else(|| spec.name.clone());
    let timeout = spec.timeout_secs.map(Duration::from_secs);

    let client: Arc<dyn ProviderClient> = match spec.kind {
        ProviderKind::Ollama => {
            let base_url = spec
                .base_url
                .clone()
                .unwrap_or_else(|| OllamaProvider::DEFAULT_BASE_URL.to_string());
            Arc::new(OllamaProvider::new(base_url, model, timeout)?)
        }
        ProviderKind::OpenAi => {
            let base_url = spec
                .base_url
                .clone()
                .unwrap_or_else(|| OpenAiCompatibleProvider::DEFAULT_BASE_URL.to_string());
            let key_var = spec
                .api_key_env
                .clone()
                .unwrap_or_else(|| OpenAiCompatibleProvider::DEFAULT_KEY_ENV.to_string());
            Arc::new(OpenAiCompatibleProvider::from_env_key(
                base_url, model, &key_var, timeout,
            )?)
        }
        ProviderKind::Echo => {
            let delay = Duration::from_millis(spec.delay_ms.unwrap_or(0));
            Arc::new(EchoProvider::new(model).with_delay(delay))
        }
    };
    Ok(client)
}
