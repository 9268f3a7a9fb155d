//! Daemon Server Implementation
//!
//! This module provides the accept loop for the replication daemon:
//! - Accepts worker connections on a TCP listener
//! - Spawns one task per connection
//! - Enforces a connection limit
//! - Supports graceful shutdown
//!
//! ```text
//!                     DaemonServer
//!                          │
//!          ┌───────────────┼───────────────┐
//!          │               │               │
//!     synchrotron     federation      pusher worker
//!      (conn-1)        (conn-2)         (conn-3)
//!          │               │               │
//!          └───────────────┴───────────────┘
//!                          │
//!                       Streamer
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use tracing::{error, info, warn};

use replication_core::transport::serve_connection;
use replication_core::{ReplicationListener, Streamer};

/// How often the accept loop wakes to check the shutdown flag
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long connection tasks get to flush their final `ERROR` on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Connection state tracking (internal to server, separate from `Connection`)
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Bound listener
    listener: ReplicationListener,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connection state, keyed by peer address
    connection_states: Arc<DashMap<SocketAddr, ConnectionState>>,
}

impl DaemonServer {
    /// Bind the listener
    pub async fn bind(listen_addr: SocketAddr, server_config: ServerConfig) -> Result<Self> {
        let listener = ReplicationListener::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind to {listen_addr}"))?;

        Ok(Self {
            listener,
            server_config,
            connection_states: Arc::new(DashMap::new()),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Listener has no local address")
    }

    /// Run the accept loop until `shutdown` is set, then shut down
    pub async fn run(&self, streamer: Arc<Streamer>, shutdown: Arc<AtomicBool>) -> Result<()> {
        info!(addr = %self.local_addr()?, "Listening for worker connections");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                info!("Shutdown requested, stopping accept loop");
                break;
            }

            // Accept with timeout to allow checking shutdown flag
            let (stream, peer) =
                match tokio::time::timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                    Err(_) => continue,
                };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!(
                    %peer,
                    max_connections = self.server_config.max_connections,
                    "Connection limit reached, rejecting new connection"
                );
                drop(stream);
                continue;
            }

            let connection_states = Arc::clone(&self.connection_states);
            let streamer = Arc::clone(&streamer);
            let task_handle = tokio::spawn(async move {
                serve_connection(streamer, stream, Some(peer)).await;
                connection_states.remove(&peer);
                info!(
                    %peer,
                    active_connections = connection_states.len(),
                    "Connection handler finished"
                );
            });

            self.connection_states.insert(
                peer,
                ConnectionState {
                    connected_at: Instant::now(),
                    abort_handle: task_handle.abort_handle(),
                },
            );
        }

        self.shutdown(&streamer).await;
        Ok(())
    }

    /// Graceful shutdown
    ///
    /// Workers are sent `ERROR server shutting down`, given a moment to
    /// receive it, then any remaining connection task is aborted.
    async fn shutdown(&self, streamer: &Streamer) {
        info!("Initiating graceful shutdown");
        streamer.shutdown();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.connection_states.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let peers: Vec<SocketAddr> = self.connection_states.iter().map(|r| *r.key()).collect();
        for peer in peers {
            if let Some((_, state)) = self.connection_states.remove(&peer) {
                warn!(%peer, "Aborting connection");
                state.abort_handle.abort();
            }
        }

        info!("Shutdown complete");
    }

    /// Get number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_states.len()
    }

    /// Get connection statistics
    pub fn connection_stats(&self) -> HashMap<SocketAddr, ConnectionStats> {
        self.connection_states
            .iter()
            .map(|r| {
                let state = r.value();
                (
                    *r.key(),
                    ConnectionStats {
                        connected_at: state.connected_at,
                        uptime_secs: state.connected_at.elapsed().as_secs(),
                    },
                )
            })
            .collect()
    }
}

/// Statistics for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// When the connection was established
    pub connected_at: Instant,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}
