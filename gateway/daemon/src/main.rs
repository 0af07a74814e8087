//! Gateway Daemon - LLM Orchestration Server
//!
//! Entry point for the gateway daemon. It loads the gateway configuration,
//! builds the provider registry and serves prompt requests from local
//! clients over a Unix socket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (echo provider only if nothing is configured)
//! gateway-daemon
//!
//! # With config file
//! gateway-daemon --config ~/.config/llm-gateway/gateway.toml
//!
//! # Custom socket path and a synthesizer
//! gateway-daemon --socket-path /tmp/gw.sock --synthesizer llama3
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown (final cache snapshot is written)

mod protocol;
mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use gateway_core::{
    default_snapshot_path, load_config, load_config_from_path, ConfigOverrides, Gateway,
    GatewayConfig, ProviderSpec,
};

use server::{DaemonServer, ServerConfig};

/// Gateway Daemon - multi-provider LLM orchestration server
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Unix socket path for client connections
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model used to synthesize broadcast answers
    #[arg(long, value_name = "MODEL")]
    synthesizer: Option<String>,

    /// Maximum in-flight provider calls
    #[arg(long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Disable the response cache
    #[arg(long)]
    no_cache: bool,

    /// Cache snapshot file
    #[arg(long, value_name = "FILE")]
    cache_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::default();
        if let Some(path) = &self.socket_path {
            overrides = overrides.with_socket_path(path.clone());
        }
        if let Some(model) = &self.synthesizer {
            overrides = overrides.with_synthesizer(model.clone());
        }
        if let Some(max) = self.max_concurrent {
            overrides = overrides.with_max_concurrent(max);
        }
        if self.no_cache {
            overrides = overrides.with_cache_enabled(false);
        }
        if let Some(path) = &self.cache_path {
            overrides = overrides.with_cache_path(path.clone());
        }
        overrides
    }
}

/// Get the default socket path
///
/// Uses `XDG_RUNTIME_DIR` if available, otherwise `/tmp/llm-gateway-$UID/`
fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("llm-gateway")
            .join("gateway.sock")
    } else {
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/llm-gateway-{uid}/gateway.sock"))
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_daemon={level},gateway_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Load, override and validate the configuration
fn resolve_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(Some(path.clone()))
            .with_context(|| format!("Failed to load config from {path:?}"))?,
        None => load_config().context("Failed to load config")?,
    };
    args.overrides().apply(&mut config);

    if config.providers.is_empty() {
        warn!("No providers configured, serving the echo provider only");
        config.providers.push(ProviderSpec::echo("echo"));
    }
    if config.cache.snapshot_path.is_none() {
        config.cache.snapshot_path = default_snapshot_path();
    }

    config.validate()?;
    Ok(config)
}

/// Resolve once SIGTERM or SIGINT arrives
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Gateway Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config = resolve_config(&args)?;
    info!(source = %config.source(), providers = config.providers.len(), "Configuration loaded");

    let socket_path = config
        .daemon
        .socket_path
        .clone()
        .unwrap_or_else(default_socket_path);
    info!(socket_path = ?socket_path, "Socket path");

    let gateway = Arc::new(Gateway::from_config(&config).context("Failed to build providers")?);
    gateway.start_maintenance(config.daemon.maintenance_interval);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!(error = %e, "Signal handling failed");
            }
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    let server = DaemonServer::new(
        socket_path,
        Arc::clone(&gateway),
        ServerConfig {
            max_connections: config.daemon.max_connections,
        },
    );
    let result = server.run(shutdown).await;

    info!("Shutting down...");
    gateway.shutdown().await;

    match result {
        Ok(()) => {
            info!("Gateway daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_build_overrides() {
        let args = Args::try_parse_from([
            "gateway-daemon",
            "--socket-path",
            "/tmp/gw.sock",
            "--synthesizer",
            "judge",
            "--no-cache",
        ])
        .unwrap();

        let mut config = GatewayConfig::default();
        args.overrides().apply(&mut config);

        assert_eq!(config.daemon.socket_path, Some(PathBuf::from("/tmp/gw.sock")));
        assert_eq!(config.synthesis.synthesizer.as_deref(), Some("judge"));
        assert!(!config.cache.enabled);
    }

    #[test]
    fn test_default_socket_path_layout() {
        let path = default_socket_path();
        assert_eq!(path.file_name().unwrap(), "gateway.sock");
        assert!(path.to_string_lossy().contains("llm-gateway"));
    }
}
