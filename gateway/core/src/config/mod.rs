//! TOML Configuration File Support
//!
//! Centralized configuration for the gateway, loaded from
//! `~/.config/llm-gateway/gateway.toml`.
//!
//! # Configuration Priority
//!
//! Values are applied with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`GATEWAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [cache]
//! max_entries = 500
//! ttl_secs = 1800
//! snapshot_path = "/var/cache/llm-gateway/responses.json"
//!
//! [resilience]
//! request_timeout_secs = 30
//! max_retries = 3
//! failure_threshold = 5
//!
//! [resources]
//! max_concurrent = 20
//! per_target_fraction = 0.5
//! max_queue_size = 100
//!
//! [synthesis]
//! synthesizer = "llama"
//! method = "parallel"
//!
//! [[providers]]
//! name = "llama"
//! kind = "ollama"
//! model = "llama3.2"
//!
//! [[providers]]
//! name = "gpt"
//! kind = "openai"
//! model = "gpt-4o-mini"
//! api_key_env = "OPENAI_API_KEY"
//! rate_limit = { rate = 60, per_secs = 60, burst = 10 }
//! ```

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::memory::DEFAULT_MAX_HISTORY;
use crate::monitor::MonitorConfig;
use crate::resilience::ResilienceConfig;
use crate::resource::{RateLimit, ResourceConfig};
use crate::synthesis::{SynthesisConfig, SynthesisMethod};

/// Directory name used under the XDG config and cache directories
pub const APP_DIR: &str = "llm-gateway";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Highest configuration layer that contributed a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Built-in default
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Provider Entries
// =============================================================================

/// Adapter used for a provider entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local Ollama server
    Ollama,
    /// Any OpenAI-compatible chat completions endpoint
    #[serde(rename = "openai")]
    OpenAi,
    /// Offline echo provider
    Echo,
}

/// Token bucket settings for one provider
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateLimitToml {
    /// Calls allowed per `per_secs`
    pub rate: u32,

    /// Refill period in seconds (default 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_secs: Option<f64>,

    /// Bucket capacity (default `rate`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

impl RateLimitToml {
    /// Runtime form of this limit
    #[must_use]
    pub fn to_rate_limit(&self) -> RateLimit {
        let per = self
            .per_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(Duration::from_secs(1));
        RateLimit {
            rate: self.rate,
            per,
            burst: self.burst.unwrap_or(self.rate).max(1),
        }
    }
}

/// One `[[providers]]` entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Model identifier callers use to address this provider
    pub name: String,

    /// Adapter to build
    pub kind: ProviderKind,

    /// Backend model name (defaults to `name`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Endpoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Environment variable holding the API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// HTTP client timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Artificial delay for the echo provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Per-provider rate limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitToml>,
}

impl ProviderSpec {
    /// Echo provider entry, used when nothing else is configured
    #[must_use]
    pub fn echo(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProviderKind::Echo,
            model: None,
            base_url: None,
            api_key_env: None,
            timeout_secs: None,
            delay_ms: None,
            rate_limit: None,
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheToml {
    /// Whether caching is enabled
    pub enabled: Option<bool>,
    /// Maximum live entries
    pub max_entries: Option<usize>,
    /// Entry time-to-live in seconds
    pub ttl_secs: Option<u64>,
    /// Snapshot file
    pub snapshot_path: Option<PathBuf>,
    /// Snapshot whenever the entry count is a multiple of this
    pub snapshot_every: Option<usize>,
    /// Entries kept per snapshot
    pub snapshot_top: Option<usize>,
}

/// `[resilience]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceToml {
    /// Per-call deadline in seconds
    pub request_timeout_secs: Option<u64>,
    /// Retries after the first attempt
    pub max_retries: Option<u32>,
    /// First backoff in milliseconds
    pub initial_backoff_ms: Option<u64>,
    /// Backoff multiplier
    pub backoff_factor: Option<f64>,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: Option<u64>,
    /// Add jitter to backoff
    pub jitter: Option<bool>,
    /// Consecutive failures that open a breaker
    pub failure_threshold: Option<u32>,
    /// Seconds before an open breaker lets a probe through
    pub reset_timeout_secs: Option<u64>,
    /// Seconds a half-open breaker must stay healthy before closing
    pub half_open_timeout_secs: Option<u64>,
}

/// `[resources]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesToml {
    /// Global in-flight limit
    pub max_concurrent: Option<usize>,
    /// Share of the global limit one provider may use
    pub per_target_fraction: Option<f64>,
    /// Seconds to wait for capacity (0 waits forever)
    pub queue_timeout_secs: Option<u64>,
    /// Calls allowed to wait for capacity before new ones are refused
    pub max_queue_size: Option<usize>,
}

/// `[monitor]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorToml {
    /// Seconds sealed request records are kept
    pub retention_secs: Option<u64>,
    /// Seconds after which open records are sealed as timeouts
    pub stale_after_secs: Option<u64>,
    /// Cleanup every N completed requests
    pub cleanup_every: Option<u64>,
}

/// `[synthesis]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisToml {
    /// Synthesizer model identifier
    pub synthesizer: Option<String>,
    /// Synthesizer completion budget
    pub max_tokens: Option<u32>,
    /// Default method: `parallel`, `sequential` or `debate`
    pub method: Option<SynthesisMethod>,
    /// Debate rounds after the opening answers
    pub debate_rounds: Option<usize>,
}

/// `[memory]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryToml {
    /// Messages kept per conversation
    pub max_history: Option<usize>,
}

/// `[daemon]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonToml {
    /// Unix socket path
    pub socket_path: Option<PathBuf>,
    /// Concurrent client connections
    pub max_connections: Option<usize>,
    /// Seconds between maintenance sweeps
    pub maintenance_interval_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayToml {
    /// `[cache]`
    pub cache: CacheToml,
    /// `[resilience]`
    pub resilience: ResilienceToml,
    /// `[resources]`
    pub resources: ResourcesToml,
    /// `[monitor]`
    pub monitor: MonitorToml,
    /// `[synthesis]`
    pub synthesis: SynthesisToml,
    /// `[memory]`
    pub memory: MemoryToml,
    /// `[daemon]`
    pub daemon: DaemonToml,
    /// `[[providers]]`
    pub providers: Vec<ProviderSpec>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Daemon-only settings
#[derive(Clone, Debug, PartialEq)]
pub struct DaemonConfig {
    /// Socket path; the daemon picks a per-user default when unset
    pub socket_path: Option<PathBuf>,
    /// Concurrent client connections
    pub max_connections: usize,
    /// Interval of the maintenance task
    pub maintenance_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            max_connections: 64,
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Fully resolved gateway configuration
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Response cache
    pub cache: CacheConfig,
    /// Timeout, retry and breaker settings
    pub resilience: ResilienceConfig,
    /// Admission control
    pub resources: ResourceConfig,
    /// Monitor retention
    pub monitor: MonitorConfig,
    /// Synthesizer selection
    pub synthesis: SynthesisConfig,
    /// Messages kept per conversation
    pub memory_max_history: usize,
    /// Daemon settings
    pub daemon: DaemonConfig,
    /// Providers to register, in order
    pub providers: Vec<ProviderSpec>,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            resilience: ResilienceConfig::default(),
            resources: ResourceConfig::default(),
            monitor: MonitorConfig::default(),
            synthesis: SynthesisConfig::default(),
            memory_max_history: DEFAULT_MAX_HISTORY,
            daemon: DaemonConfig::default(),
            providers: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl GatewayConfig {
    /// Configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest layer that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values that would break runtime invariants
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resources.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "resources.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.resources.max_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "resources.max_queue_size must be at least 1".to_string(),
            ));
        }
        let fraction = self.resources.per_target_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "resources.per_target_fraction must be in (0, 1], got {fraction}"
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "cache.max_entries must be at least 1".to_string(),
            ));
        }
        if self.daemon.maintenance_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "daemon.maintenance_interval_secs must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "provider '{}' is defined more than once",
                    provider.name
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/llm-gateway/gateway.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("gateway.toml"))
}

/// Default cache snapshot path
///
/// Returns `$XDG_CACHE_HOME/llm-gateway/response_cache.json`.
#[must_use]
pub fn default_snapshot_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|p| p.join(APP_DIR).join("response_cache.json"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: GatewayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                providers = config.providers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);

    Ok(config)
}

fn apply_toml_config(config: &mut GatewayConfig, toml: &GatewayToml) {
    // Cache
    if let Some(enabled) = toml.cache.enabled {
        config.cache.enabled = enabled;
    }
    if let Some(max) = toml.cache.max_entries {
        config.cache.max_entries = max;
    }
    if let Some(ttl) = toml.cache.ttl_secs {
        config.cache.ttl = Duration::from_secs(ttl);
    }
    if toml.cache.snapshot_path.is_some() {
        config.cache.snapshot_path.clone_from(&toml.cache.snapshot_path);
    }
    if let Some(every) = toml.cache.snapshot_every {
        config.cache.snapshot_every = every;
    }
    if let Some(top) = toml.cache.snapshot_top {
        config.cache.snapshot_top = top;
    }

    // Resilience
    let resilience = &mut config.resilience;
    if let Some(secs) = toml.resilience.request_timeout_secs {
        resilience.request_timeout = Duration::from_secs(secs);
    }
    if let Some(retries) = toml.resilience.max_retries {
        resilience.retry.max_retries = retries;
    }
    if let Some(ms) = toml.resilience.initial_backoff_ms {
        resilience.retry.initial_backoff = Duration::from_millis(ms);
    }
    if let Some(factor) = toml.resilience.backoff_factor {
        resilience.retry.backoff_factor = factor;
    }
    if let Some(ms) = toml.resilience.max_backoff_ms {
        resilience.retry.max_backoff = Duration::from_millis(ms);
    }
    if let Some(jitter) = toml.resilience.jitter {
        resilience.retry.jitter = jitter;
    }
    if let Some(threshold) = toml.resilience.failure_threshold {
        resilience.breaker.failure_threshold = threshold;
    }
    if let Some(secs) = toml.resilience.reset_timeout_secs {
        resilience.breaker.reset_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.resilience.half_open_timeout_secs {
        resilience.breaker.half_open_timeout = Duration::from_secs(secs);
    }

    // Resources
    if let Some(max) = toml.resources.max_concurrent {
        config.resources.max_concurrent = max;
    }
    if let Some(fraction) = toml.resources.per_target_fraction {
        config.resources.per_target_fraction = fraction;
    }
    if let Some(secs) = toml.resources.queue_timeout_secs {
        config.resources.queue_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
    if let Some(size) = toml.resources.max_queue_size {
        config.resources.max_queue_size = size;
    }

    // Monitor
    if let Some(secs) = toml.monitor.retention_secs {
        config.monitor.retention = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.monitor.stale_after_secs {
        config.monitor.stale_after = Duration::from_secs(secs);
    }
    if let Some(every) = toml.monitor.cleanup_every {
        config.monitor.cleanup_every = every;
    }

    // Synthesis and memory
    if toml.synthesis.synthesizer.is_some() {
        config.synthesis.synthesizer.clone_from(&toml.synthesis.synthesizer);
    }
    if toml.synthesis.max_tokens.is_some() {
        config.synthesis.max_tokens = toml.synthesis.max_tokens;
    }
    if let Some(method) = toml.synthesis.method {
        config.synthesis.method = method;
    }
    if toml.synthesis.debate_rounds.is_some() {
        config.synthesis.debate_rounds = toml.synthesis.debate_rounds;
    }
    if let Some(max) = toml.memory.max_history {
        config.memory_max_history = max;
    }

    // Daemon
    if toml.daemon.socket_path.is_some() {
        config.daemon.socket_path.clone_from(&toml.daemon.socket_path);
    }
    if let Some(max) = toml.daemon.max_connections {
        config.daemon.max_connections = max;
    }
    if let Some(secs) = toml.daemon.maintenance_interval_secs {
        config.daemon.maintenance_interval = Duration::from_secs(secs);
    }

    if !toml.providers.is_empty() {
        config.providers.clone_from(&toml.providers);
    }
}

/// Parse an environment variable, ignoring unparseable values
fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

fn apply_env_config(config: &mut GatewayConfig) {
    if let Ok(enabled) = std::env::var("GATEWAY_CACHE_ENABLED") {
        config.cache.enabled = enabled != "0" && enabled.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env_parse::<usize>("GATEWAY_CACHE_MAX_ENTRIES") {
        config.cache.max_entries = max;
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("GATEWAY_CACHE_TTL_SECS") {
        config.cache.ttl = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Ok(path) = std::env::var("GATEWAY_CACHE_PATH") {
        config.cache.snapshot_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
    if let Some(secs) = env_parse::<u64>("GATEWAY_REQUEST_TIMEOUT_SECS") {
        config.resilience.request_timeout = Duration::from_secs(secs);
        config.source = ConfigSource::Env;
    }
    if let Some(retries) = env_parse::<u32>("GATEWAY_MAX_RETRIES") {
        config.resilience.retry.max_retries = retries;
        config.source = ConfigSource::Env;
    }
    if let Some(max) = env_parse::<usize>("GATEWAY_MAX_CONCURRENT") {
        config.resources.max_concurrent = max;
        config.source = ConfigSource::Env;
    }
    if let Some(fraction) = env_parse::<f64>("GATEWAY_PER_TARGET_FRACTION") {
        config.resources.per_target_fraction = fraction;
        config.source = ConfigSource::Env;
    }
    if let Ok(model) = std::env::var("GATEWAY_SYNTHESIZER") {
        config.synthesis.synthesizer = Some(model);
        config.source = ConfigSource::Env;
    }
    if let Ok(path) = std::env::var("GATEWAY_SOCKET") {
        config.daemon.socket_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,
    /// Synthesizer override
    pub synthesizer: Option<String>,
    /// Global concurrency override
    pub max_concurrent: Option<usize>,
    /// Cache on/off override
    pub cache_enabled: Option<bool>,
    /// Snapshot path override
    pub cache_path: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set synthesizer override
    #[must_use]
    pub fn with_synthesizer(mut self, model: String) -> Self {
        self.synthesizer = Some(model);
        self
    }

    /// Set global concurrency override
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }

    /// Enable or disable the cache
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = Some(enabled);
        self
    }

    /// Set snapshot path override
    #[must_use]
    pub fn with_cache_path(mut self, path: PathBuf) -> Self {
        self.cache_path = Some(path);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut GatewayConfig) {
        if self.socket_path.is_some()
            || self.synthesizer.is_some()
            || self.max_concurrent.is_some()
            || self.cache_enabled.is_some()
            || self.cache_path.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.socket_path {
            config.daemon.socket_path = Some(path.clone());
        }
        if let Some(ref model) = self.synthesizer {
            config.synthesis.synthesizer = Some(model.clone());
        }
        if let Some(max) = self.max_concurrent {
            config.resources.max_concurrent = max;
        }
        if let Some(enabled) = self.cache_enabled {
            config.cache.enabled = enabled;
        }
        if let Some(ref path) = self.cache_path {
            config.cache.snapshot_path = Some(path.clone());
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
