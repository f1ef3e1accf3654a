//! stretch-proxy
//!
//! Per-client admission proxy in front of a single HTTP upstream.
//!
//! ```text
//!     Client ──▶ http server ──▶ admission queue ──(delay)──▶ forwarder ──▶ Upstream
//!                    │                 │
//!                    │                 └── reaper (idle client state)
//!                    └── 405 / 413 / 429 answered locally
//! ```
//!
//! Usage mirrors the classic positional form, with an optional TOML file
//! underneath:
//!
//! ```text
//! stretch-proxy [FROM] [TO] [TIMEOUT] [WINDOW] [TARGET] [HARDLIMIT] [MAXBYTES] [DEBUG]
//!               [--config proxy.toml [--watch]]
//! ```

use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use stretch_proxy::config::validation::validate_config;
use stretch_proxy::config::watcher::ConfigWatcher;
use stretch_proxy::config::{load_config, ConfigError, ProxyConfig};
use stretch_proxy::lifecycle::{wait_for_signal, Shutdown};
use stretch_proxy::observability::{init_logging, init_metrics};
use stretch_proxy::HttpServer;

#[derive(Parser, Debug)]
#[command(name = "stretch-proxy", version)]
#[command(about = "Per-client admission proxy that stretches bursts instead of refusing them")]
struct Cli {
    /// Listen address (host:port)
    from: Option<String>,

    /// Upstream address (host:port)
    to: Option<String>,

    /// Hard timeout in seconds for queue wait and the upstream call
    timeout: Option<f64>,

    /// Decay window in seconds
    window: Option<f64>,

    /// Tolerated concurrent requests per client before delaying
    target: Option<f64>,

    /// Queued requests per client before answering 429
    hardlimit: Option<usize>,

    /// Maximum request body bytes buffered while queued
    maxbytes: Option<usize>,

    /// Verbose dispatch logging and eager body buffering
    #[arg(value_parser = clap::builder::BoolishValueParser::new())]
    debug: Option<bool>,

    /// TOML configuration file; positional values override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reload admission settings when the config file changes
    #[arg(short, long, requires = "config")]
    watch: bool,
}

impl Cli {
    /// Lay the positional overrides over `config`.
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(from) = &self.from {
            config.listener.bind_address = from.clone();
        }
        if let Some(to) = &self.to {
            config.upstream.address = to.clone();
        }
        if let Some(timeout) = self.timeout {
            config.admission.hard_timeout_secs = timeout;
        }
        if let Some(window) = self.window {
            config.admission.window_secs = window;
        }
        if let Some(target) = self.target {
            config.admission.concurrency_target = target;
        }
        if let Some(limit) = self.hardlimit {
            config.admission.concurrency_limit = limit;
        }
        if let Some(max_bytes) = self.maxbytes {
            config.admission.max_body_bytes = max_bytes;
        }
        if let Some(debug) = self.debug {
            config.observability.debug = debug;
        }
    }

    fn resolve(&self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };
        self.apply(&mut config);
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.resolve()?;

    init_logging(&config.observability);
    tracing::info!("stretch-proxy v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.address,
        hard_timeout_secs = config.admission.hard_timeout_secs,
        window_secs = config.admission.window_secs,
        concurrency_target = config.admission.concurrency_target,
        concurrency_limit = config.admission.concurrency_limit,
        max_body_bytes = config.admission.max_body_bytes,
        debug = config.observability.debug,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        init_metrics(addr)?;
    }

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    // Keep the watcher alive for the life of the server.
    let (_watcher, config_updates) = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (Some(watcher.run()?), updates)
        }
        _ => {
            let (_, updates) = mpsc::unbounded_channel();
            (None, updates)
        }
    };

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.trigger();
    });

    let server = HttpServer::new(config)?;
    server.run(listener, config_updates, server_shutdown).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_arguments_keeps_defaults() {
        let cli = Cli::try_parse_from(["stretch-proxy"]).unwrap();
        assert_eq!(cli.resolve().unwrap(), ProxyConfig::default());
    }

    #[test]
    fn positionals_override_in_order() {
        let cli = Cli::try_parse_from([
            "stretch-proxy",
            "0.0.0.0:9000",
            "backend:8545",
            "30",
            "6",
            "2.5",
            "10",
            "2048",
            "1",
        ])
        .unwrap();
        let config = cli.resolve().unwrap();

        assert_eq!(config.listener.bind_address, "0.0.0.0:9000");
        assert_eq!(config.upstream.address, "backend:8545");
        assert_eq!(config.admission.hard_timeout_secs, 30.0);
        assert_eq!(config.admission.window_secs, 6.0);
        assert_eq!(config.admission.concurrency_target, 2.5);
        assert_eq!(config.admission.concurrency_limit, 10);
        assert_eq!(config.admission.max_body_bytes, 2048);
        assert!(config.observability.debug);
    }

    #[test]
    fn partial_positionals_leave_the_rest() {
        let cli = Cli::try_parse_from(["stretch-proxy", "127.0.0.1:8181", "10.0.0.5:80"]).unwrap();
        let config = cli.resolve().unwrap();
        assert_eq!(config.upstream.address, "10.0.0.5:80");
        assert_eq!(config.admission.concurrency_limit, 64);
        assert!(!config.observability.debug);
    }

    #[test]
    fn invalid_values_fail_validation() {
        let cli = Cli::try_parse_from(["stretch-proxy", "127.0.0.1:8080", "up:80", "12", "0"]).unwrap();
        assert!(matches!(cli.resolve(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn watch_requires_config() {
        assert!(Cli::try_parse_from(["stretch-proxy", "--watch"]).is_err());
    }
}
