//! Replication Streamer
//!
//! The [`Streamer`] owns the registered streams and the live connections.
//! It drives the poke loop, answers catch-up requests, forwards worker
//! commands to the collaborators, and pings every connection.
//!
//! # Poke Loop
//!
//! ```text
//!   Notifier ──► on_notifier_poke() ──► SingleFlight ──► run_pass()
//!                                            │               │
//!                                 already running?           ├─ advance_upper_bound() (all streams)
//!                                  set pending, return       ├─ pull_next()          (per stream)
//!                                                            └─ fan_out()            (per stream)
//! ```
//!
//! A failed fetch skips only its stream for that pass. A failed delivery
//! skips only that connection. Nothing in a pass can stop the loop.
//! With no connections at the start of a pass, streams are fast-forwarded
//! instead of fetched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::backend::{FederationSender, MemoryBackend, PresenceHandler, ReplicationStore};
use crate::connection::{Connection, ConnectionId, DeliveryOutcome, OutboundReceiver};
use crate::error::{ReplicationError, Result};
use crate::notifier::Notifier;
use crate::single_flight::SingleFlight;
use crate::streaming::{
    BackfillStream, BatchedUpdate, EventsStream, FederationStream, PresenceStream, StartToken,
    Stream, StreamKind, StreamToken, StreamUpdate, MAX_BEHIND,
};
use crate::transport::ServerCommand;

// ============================================================================
// Configuration
// ============================================================================

/// Longest accepted `ping_interval`
pub const MAX_PING_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Runtime settings for the streamer
#[derive(Clone, Debug)]
pub struct StreamerConfig {
    /// Name announced in the `SERVER` command
    pub server_name: String,
    /// How often every connection is sent `PING`
    pub ping_interval: Duration,
    /// Silent intervals tolerated from a pinging worker before it is dropped
    pub ping_timeout_multiplier: u32,
    /// Row ceiling for a single fetch
    pub max_behind: usize,
    /// Outbound queue limit per connection
    pub max_pending_commands: usize,
    /// This process sends federation itself, so no federation stream
    pub send_federation: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            server_name: "localhost".to_string(),
            ping_interval: Duration::from_secs(5),
            ping_timeout_multiplier: 3,
            max_behind: MAX_BEHIND,
            max_pending_commands: 100_000,
            send_federation: false,
        }
    }
}

impl StreamerConfig {
    /// Silence after which a pinging worker is dropped
    #[must_use]
    pub fn ping_timeout(&self) -> Duration {
        self.ping_interval
            .checked_mul(self.ping_timeout_multiplier)
            .unwrap_or(Duration::MAX)
    }
}

/// Everything the streamer reads from or forwards to
#[derive(Clone)]
pub struct Collaborators {
    /// Event and backfill storage
    pub store: Arc<dyn ReplicationStore>,
    /// Presence rows and worker sync state
    pub presence: Arc<dyn PresenceHandler>,
    /// Federation sender, when federation is delegated to a worker
    pub federation: Option<Arc<dyn FederationSender>>,
    /// New-data signal
    pub notifier: Arc<Notifier>,
}

impl Collaborators {
    /// Use one in-memory backend for every collaborator
    #[must_use]
    pub fn in_memory(backend: Arc<MemoryBackend>, notifier: Arc<Notifier>) -> Self {
        Self {
            store: backend.clone(),
            presence: backend.clone(),
            federation: Some(backend),
            notifier,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// What a call to [`Streamer::on_notifier_poke`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeOutcome {
    /// Nobody connected at any pass start, positions fast-forwarded without
    /// fetching
    NoConnections,
    /// Another pass was running, it will run once more
    Deferred,
    /// Ran this many passes back to back
    Completed {
        /// Passes run, including reruns for pokes that arrived mid-pass
        passes: usize,
    },
}

/// Summary of one poke pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    /// Rows fetched across all streams
    pub rows: usize,
    /// Streams whose fetch failed this pass
    pub failed_streams: Vec<StreamKind>,
}

/// Result of fanning one stream's rows out to every connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutResult {
    /// Rows queued for a socket
    pub sent: usize,
    /// Rows held for connections still catching up
    pub buffered: usize,
    /// Rows not wanted by a connection
    pub dropped: usize,
    /// Connections a row could not be queued for
    pub failed_ids: Vec<ConnectionId>,
}

impl FanOutResult {
    /// Check if every connection took its rows
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed_ids.is_empty()
    }
}

// ============================================================================
// Streamer
// ============================================================================

/// The replication server core, shared as `Arc<Streamer>`
pub struct Streamer {
    config: StreamerConfig,
    streams: Vec<Stream>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    store: Arc<dyn ReplicationStore>,
    presence: Arc<dyn PresenceHandler>,
    federation: Option<Arc<dyn FederationSender>>,
    notifier: Arc<Notifier>,
    flight: SingleFlight,
    shutting_down: AtomicBool,
}

impl Streamer {
    /// Create a streamer with the standard stream set
    ///
    /// The federation stream is registered only when federation sending is
    /// delegated (`send_federation == false`) and a sender is supplied.
    #[must_use]
    pub fn new(config: StreamerConfig, collaborators: Collaborators) -> Self {
        let max_behind = config.max_behind;
        let mut streams = vec![
            Stream::new(
                Box::new(EventsStream::new(Arc::clone(&collaborators.store))),
                max_behind,
            ),
            Stream::new(
                Box::new(BackfillStream::new(Arc::clone(&collaborators.store))),
                max_behind,
            ),
            Stream::new(
                Box::new(PresenceStream::new(Arc::clone(&collaborators.presence))),
                max_behind,
            ),
        ];

        if !config.send_federation {
            if let Some(sender) = &collaborators.federation {
                streams.push(Stream::new(
                    Box::new(FederationStream::new(Arc::clone(sender))),
                    max_behind,
                ));
            }
        }

        Self::with_streams(config, collaborators, streams)
    }

    /// Create a streamer over an explicit stream set
    #[must_use]
    pub fn with_streams(
        config: StreamerConfig,
        collaborators: Collaborators,
        streams: Vec<Stream>,
    ) -> Self {
        tracing::info!(
            server_name = %config.server_name,
            streams = ?streams.iter().map(Stream::name).collect::<Vec<_>>(),
            "Replication streamer created"
        );

        let federation = if config.send_federation {
            None
        } else {
            collaborators.federation
        };

        Self {
            config,
            streams,
            connections: RwLock::new(HashMap::new()),
            store: collaborators.store,
            presence: collaborators.presence,
            federation,
            notifier: collaborators.notifier,
            flight: SingleFlight::new(),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Settings in use
    #[must_use]
    pub fn config(&self) -> &StreamerConfig {
        &self.config
    }

    /// Registered streams, in poke order
    #[must_use]
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Kinds of the registered streams, in poke order
    #[must_use]
    pub fn stream_kinds(&self) -> Vec<StreamKind> {
        self.streams.iter().map(Stream::kind).collect()
    }

    /// Look up a registered stream by wire name
    ///
    /// # Errors
    ///
    /// `UnknownStream` if no registered stream has that name.
    pub fn stream(&self, name: &str) -> Result<&Stream> {
        self.streams
            .iter()
            .find(|stream| stream.name() == name)
            .ok_or_else(|| ReplicationError::UnknownStream(name.to_string()))
    }

    /// The new-data notifier
    #[must_use]
    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Register a new connection and queue its `SERVER` greeting
    pub fn new_connection(&self, peer: Option<SocketAddr>) -> (Arc<Connection>, OutboundReceiver) {
        let (conn, outbound) = Connection::new(peer, self.config.max_pending_commands);

        if let Err(e) = conn.send(ServerCommand::Server(self.config.server_name.clone())) {
            tracing::warn!(conn_id = %conn.id(), error = %e, "Failed to queue SERVER greeting");
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            conn.send_error("server shutting down");
            return (conn, outbound);
        }

        let count = {
            let mut connections = self.connections.write();
            connections.insert(conn.id(), Arc::clone(&conn));
            connections.len()
        };
        tracing::info!(
            conn_id = %conn.id(),
            ?peer,
            connections = count,
            "Replication connection established"
        );

        (conn, outbound)
    }

    /// Remove a connection and clear its presence sync state
    ///
    /// Safe to call more than once; cleanup runs only the first time.
    pub async fn lost_connection(&self, conn: &Connection) {
        conn.close();
        self.connections.write().remove(&conn.id());

        if !conn.mark_lost() {
            return;
        }

        tracing::info!(
            conn_id = %conn.id(),
            name = ?conn.name(),
            peer = ?conn.peer(),
            uptime_secs = conn.age().as_secs(),
            "Replication connection lost"
        );

        if let Err(e) = self.presence.clear_sync_state(conn.id()).await {
            tracing::warn!(conn_id = %conn.id(), error = %e, "Failed to clear sync state");
        }
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Snapshot of the live connections
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// A live connection by ID
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    // ------------------------------------------------------------------------
    // Poke Loop
    // ------------------------------------------------------------------------

    /// Check every stream for new rows and fan them out
    ///
    /// At most one pass runs at a time; a poke during a pass makes the
    /// running pass loop once more.
    pub async fn on_notifier_poke(&self) -> PokeOutcome {
        let Some(mut guard) = self.flight.try_begin() else {
            tracing::debug!("Poke loop already running");
            return PokeOutcome::Deferred;
        };

        let mut passes = 0;
        loop {
            if self.fast_forward_if_idle() {
                tracing::trace!("No connections, fast-forwarded streams");
            } else {
                passes += 1;
                self.run_pass().await;
            }
            if !guard.should_rerun() {
                break;
            }
        }

        if passes == 0 {
            return PokeOutcome::NoConnections;
        }
        tracing::debug!(passes, "No more pending updates, leaving poke loop");

        PokeOutcome::Completed { passes }
    }

    /// Move every stream to its source's current token if nobody is connected
    ///
    /// Must only run while holding the poke guard. The connections lock is
    /// held throughout, so no worker can register and subscribe against the
    /// old positions.
    fn fast_forward_if_idle(&self) -> bool {
        let connections = self.connections.read();
        if !connections.is_empty() {
            return false;
        }
        for stream in &self.streams {
            stream.fast_forward();
        }
        true
    }

    /// One pass over every stream
    pub async fn run_pass(&self) -> PassStats {
        let mut stats = PassStats::default();

        for stream in &self.streams {
            stream.advance_upper_bound();
        }

        for stream in &self.streams {
            let position = stream.position();
            if !position.has_pending() {
                continue;
            }

            tracing::debug!(
                stream = stream.name(),
                from = %position.last_token,
                to = %position.upto_token,
                "Getting stream updates"
            );

            match stream.pull_next().await {
                Ok((updates, token)) => {
                    if !updates.is_empty() {
                        tracing::info!(
                            stream = stream.name(),
                            %token,
                            rows = updates.len(),
                            "Streaming"
                        );
                    }
                    stats.rows += updates.len();
                    let batched = BatchedUpdate::from_updates(updates);
                    let result = self.fan_out(stream.kind(), &batched);
                    if !result.all_succeeded() {
                        tracing::debug!(
                            stream = stream.name(),
                            failed = result.failed_ids.len(),
                            "Fan-out skipped failed connections"
                        );
                    }
                }
                Err(e @ ReplicationError::FallenBehind { .. }) => {
                    tracing::error!(stream = stream.name(), error = %e, "Stream fell behind");
                    self.drop_subscribers(stream.kind(), &e.to_string());
                    stream.skip_pending();
                    stats.failed_streams.push(stream.kind());
                }
                Err(e) => {
                    tracing::warn!(
                        stream = stream.name(),
                        error = %e,
                        "Failed to fetch stream updates"
                    );
                    stats.failed_streams.push(stream.kind());
                }
            }
        }

        stats
    }

    /// Deliver one stream's batched rows to every live connection
    ///
    /// A connection that fails a delivery gets no further rows from this
    /// batch; the rest are unaffected.
    pub fn fan_out(&self, stream: StreamKind, rows: &[BatchedUpdate]) -> FanOutResult {
        let mut result = FanOutResult::default();
        if rows.is_empty() {
            return result;
        }

        for conn in self.connections() {
            for row in rows {
                match conn.deliver(stream, row) {
                    Ok(DeliveryOutcome::Sent) => result.sent += 1,
                    Ok(DeliveryOutcome::Buffered) => result.buffered += 1,
                    Ok(DeliveryOutcome::Dropped) => result.dropped += 1,
                    Err(e) => {
                        tracing::warn!(
                            conn_id = %conn.id(),
                            stream = %stream,
                            error = %e,
                            "Failed to replicate"
                        );
                        result.failed_ids.push(conn.id());
                        break;
                    }
                }
            }
        }

        result
    }

    /// Send `ERROR` to every connection subscribed to a stream
    fn drop_subscribers(&self, stream: StreamKind, reason: &str) {
        use crate::connection::SubscriptionState;

        for conn in self.connections() {
            if conn.subscription_state(stream) != SubscriptionState::Unsubscribed {
                conn.send_error(reason);
            }
        }
    }

    /// Wait on the notifier forever, starting a poke for each signal
    ///
    /// Returns once [`Self::shutdown`] is called.
    pub async fn run_notifier_loop(self: Arc<Self>) {
        loop {
            self.notifier.wait_for_new_data().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            tracing::trace!("Woken up by notifier");

            let streamer = Arc::clone(&self);
            tokio::spawn(async move {
                streamer.on_notifier_poke().await;
            });
        }
        tracing::debug!("Notifier loop stopped");
    }

    // ------------------------------------------------------------------------
    // Catch-up
    // ------------------------------------------------------------------------

    /// Rows after `token` for a subscribing connection, and the token they
    /// resolve to
    ///
    /// # Errors
    ///
    /// `UnknownStream`, `FallenBehind`, or a collaborator failure.
    pub async fn get_stream_updates(
        &self,
        stream_name: &str,
        token: StartToken,
    ) -> Result<(Vec<StreamUpdate>, StreamToken)> {
        self.stream(stream_name)?.get_delta_since(token).await
    }

    // ------------------------------------------------------------------------
    // Keepalive
    // ------------------------------------------------------------------------

    /// Ping every connection and drop the ones that went quiet
    pub fn send_pings(&self, now_ms: i64) {
        let timeout_ms = i64::try_from(self.config.ping_timeout().as_millis()).unwrap_or(i64::MAX);

        for conn in self.connections() {
            if conn.is_timed_out(now_ms, timeout_ms) {
                tracing::warn!(conn_id = %conn.id(), name = ?conn.name(), "Ping timeout");
                conn.send_error("ping timeout");
                continue;
            }
            if let Err(e) = conn.send(ServerCommand::Ping(now_ms)) {
                tracing::debug!(conn_id = %conn.id(), error = %e, "Failed to queue PING");
            }
        }
    }

    /// Ping every connection each `ping_interval` until shutdown
    pub async fn run_ping_loop(self: Arc<Self>) {
        let period = self
            .config
            .ping_interval
            .clamp(Duration::from_millis(1), MAX_PING_INTERVAL);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.send_pings(chrono::Utc::now().timestamp_millis());
        }
        tracing::debug!("Ping loop stopped");
    }

    // ------------------------------------------------------------------------
    // Worker Commands
    // ------------------------------------------------------------------------

    /// Forward a `FEDERATION_ACK`
    ///
    /// # Errors
    ///
    /// Whatever the federation sender fails with.
    pub async fn federation_ack(&self, token: StreamToken) -> Result<()> {
        match &self.federation {
            Some(sender) => sender.acknowledge(token).await,
            None => {
                tracing::debug!(%token, "Ignoring federation ack, no federation sender");
                Ok(())
            }
        }
    }

    /// Forward a `USER_SYNC`
    ///
    /// # Errors
    ///
    /// Whatever the presence handler fails with.
    pub async fn on_user_sync(
        &self,
        conn_id: ConnectionId,
        user_id: &str,
        active: bool,
    ) -> Result<()> {
        tracing::debug!(%conn_id, user_id, active, "User sync");
        self.presence.record_sync_state(conn_id, user_id, active).await
    }

    /// Forward a `REMOVE_PUSHER`, then signal new data
    ///
    /// # Errors
    ///
    /// Whatever the store fails with.
    pub async fn on_remove_pusher(
        &self,
        app_id: &str,
        push_key: &str,
        user_id: &str,
    ) -> Result<()> {
        self.store.remove_pusher(app_id, push_key, user_id).await?;
        self.notifier.signal_new_data();
        Ok(())
    }

    /// Forward an `INVALIDATE_CACHE`
    ///
    /// # Errors
    ///
    /// Whatever the store fails with.
    pub async fn on_invalidate_cache(
        &self,
        cache_name: &str,
        keys: &[serde_json::Value],
    ) -> Result<()> {
        self.store.invalidate_cache(cache_name, keys).await
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Send `ERROR server shutting down` to every connection and stop the
    /// background loops
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let connections = self.connections();
        tracing::info!(connections = connections.len(), "Replication streamer shutting down");
        for conn in connections {
            conn.send_error("server shutting down");
        }

        // Wake the notifier loop so it sees the flag
        self.notifier.signal_new_data();
    }

    /// Whether [`Self::shutdown`] has been called
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("config", &self.config)
            .field("streams", &self.streams)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
