//! Replication Daemon - Streams the Primary's Logs to Workers
//!
//! This is the main entry point for the replication daemon. Worker
//! processes connect over TCP, subscribe to streams with `REPLICATE` and
//! follow them live.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:9092)
//! replication-daemon
//!
//! # Custom listen address and server name
//! replication-daemon --listen-addr 0.0.0.0:9092 --server-name primary.example.com
//!
//! # With config file
//! replication-daemon --config /etc/replication/streamer.toml
//!
//! # Verbose logging
//! RUST_LOG=debug replication-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use replication_core::config::{default_config_path, load_config_from_path, ConfigOverrides};
use replication_core::{Collaborators, MemoryBackend, Notifier, Streamer};

use server::{DaemonServer, ServerConfig};

/// Replication Daemon - streams the primary's logs to worker processes
#[derive(Parser, Debug)]
#[command(name = "replication-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "REPLICATION_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on for worker connections
    #[arg(short = 'a', long, value_name = "ADDR")]
    listen_addr: Option<SocketAddr>,

    /// Name announced to workers in SERVER
    #[arg(short = 'n', long, value_name = "NAME")]
    server_name: Option<String>,

    /// Ping interval in milliseconds
    #[arg(long, value_name = "MS")]
    ping_interval_ms: Option<u64>,

    /// Row ceiling for a single fetch
    #[arg(long, value_name = "ROWS")]
    max_behind: Option<usize>,

    /// This process sends federation itself (no federation stream)
    #[arg(long)]
    send_federation: bool,

    /// Maximum concurrent worker connections
    #[arg(long, env = "REPLICATION_MAX_CONNECTIONS", default_value_t = 1000)]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "REPLICATION_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(addr) = self.listen_addr {
            overrides = overrides.with_listen_addr(addr);
        }
        if let Some(ref name) = self.server_name {
            overrides = overrides.with_server_name(name.clone());
        }
        if let Some(ms) = self.ping_interval_ms {
            overrides = overrides.with_ping_interval_ms(ms);
        }
        if let Some(max) = self.max_behind {
            overrides = overrides.with_max_behind(max);
        }
        if self.send_federation {
            overrides = overrides.with_send_federation(true);
        }
        overrides
    }
}

/// Initialize logging with the specified level
///
/// `RUST_LOG` takes precedence when set.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "replication_daemon={level},replication_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Replication daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    // Resolve configuration: CLI > env > file > defaults
    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line configuration")?;

    info!(
        listen_addr = %config.listen_addr,
        server_name = %config.server_name,
        source = %config.source(),
        config_file = ?config.config_file_path,
        "Configuration loaded"
    );

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    // Create the streamer over in-memory collaborators
    let backend = Arc::new(MemoryBackend::new());
    let notifier = Arc::new(Notifier::new());
    let streamer = Arc::new(Streamer::new(
        config.streamer_config(),
        Collaborators::in_memory(backend, notifier),
    ));
    info!(streams = ?streamer.stream_kinds(), "Streamer ready");

    tokio::spawn(Arc::clone(&streamer).run_notifier_loop());
    tokio::spawn(Arc::clone(&streamer).run_ping_loop());

    // Create and run daemon server
    let server = DaemonServer::bind(
        config.listen_addr,
        ServerConfig {
            max_connections: args.max_connections,
        },
    )
    .await?;

    let result = server.run(streamer, shutdown).await;

    match result {
        Ok(()) => {
            info!("Replication daemon stopped cleanly");
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
    use replication_core::ConfigSource;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["replication-daemon"]);
        assert!(args.config.is_none() || std::env::var("REPLICATION_CONFIG").is_ok());
        assert!(args.listen_addr.is_none());
        assert!(!args.send_federation);
    }

    #[test]
    fn test_args_become_overrides() {
        let args = Args::parse_from([
            "replication-daemon",
            "--listen-addr",
            "0.0.0.0:9100",
            "--server-name",
            "primary.test",
            "--max-behind",
            "500",
            "--send-federation",
        ]);

        let mut config = replication_core::ReplicationConfig::default();
        args.overrides().apply(&mut config).unwrap();

        assert_eq!(config.listen_addr.port(), 9100);
        assert_eq!(config.server_name, "primary.test");
        assert_eq!(config.max_behind, 500);
        assert!(config.send_federation);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streamer.toml");
        std::fs::write(&path, "[server]\nserver_name = \"from.file\"\n").unwrap();

        let config = load_config_from_path(Some(path)).unwrap();
        if std::env::var("REPLICATION_SERVER_NAME").is_err() {
            assert_eq!(config.server_name, "from.file");
        }
    }
}
