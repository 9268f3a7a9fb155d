//! Replication Connections
//!
//! One [`Connection`] per worker session. It owns the per-stream
//! subscription state and the outbound command queue; the transport layer
//! drains that queue onto the socket.
//!
//! # Subscription State Machine
//!
//! ```text
//!                 begin_subscribe()            finish_subscribe()
//!  ┌──────────────┐            ┌────────────┐               ┌─────────────┐
//!  │ Unsubscribed │───────────►│ Connecting │──────────────►│ Replicating │
//!  └──────────────┘            └────────────┘               └─────────────┘
//!         ▲                          │ fail_subscribe()             │
//!         └──────────────────────────┘         begin_subscribe()    │
//!                                    ◄──────────────────────────────┘
//! ```
//!
//! While a stream is `Connecting`, rows fanned out by the poke loop are
//! buffered. `finish_subscribe` sends the catch-up history, then the
//! buffered rows that were not already part of the history, then
//! `POSITION`, all under the state lock. A concurrent delivery therefore
//! lands either in the buffer before the drain or after the switch to
//! `Replicating`.
//!
//! A `Replicating` stream remembers the token its catch-up resolved to, and
//! drops any later delivery at or below it, so rows fetched by a poke pass
//! that overlapped the catch-up are sent exactly once.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::{ReplicationError, Result};
use crate::streaming::{BatchedUpdate, StreamKind, StreamToken, StreamUpdate};
use crate::transport::ServerCommand;

// ============================================================================
// Connection ID
// ============================================================================

/// Unique identifier for a worker connection
///
/// Generated from an atomic counter, so unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Create a new unique connection ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    /// Create a connection ID from a raw value
    #[cfg(test)]
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

// ============================================================================
// Subscription State
// ============================================================================

/// Where a stream is in the subscribe lifecycle for one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not subscribed, deliveries are dropped
    Unsubscribed,
    /// Catch-up in progress, deliveries are buffered
    Connecting,
    /// Steady state, deliveries are sent
    Replicating,
}

/// What [`Connection::deliver`] did with a row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued for the socket
    Sent,
    /// Held until catch-up completes
    Buffered,
    /// Not subscribed, or already sent during catch-up
    Dropped,
}

#[derive(Debug)]
struct ConnectionState {
    name: Option<String>,
    connecting: HashSet<StreamKind>,
    /// Stream -> token its catch-up resolved to
    replicating: HashMap<StreamKind, StreamToken>,
    pending: HashMap<StreamKind, Vec<BatchedUpdate>>,
    last_seen_ms: i64,
    ping_received: bool,
}

// ============================================================================
// Outbound Queue
// ============================================================================

/// Receiving half of a connection's outbound queue
///
/// Owned by the writer task.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<ServerCommand>,
    queued: Arc<AtomicUsize>,
}

impl OutboundReceiver {
    /// Wait for the next command
    ///
    /// Returns `None` once every sender is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<ServerCommand> {
        let command = self.rx.recv().await;
        if command.is_some() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
        }
        command
    }

    /// Take the next command if one is already queued
    pub fn try_recv(&mut self) -> Option<ServerCommand> {
        let command = self.rx.try_recv().ok();
        if command.is_some() {
            self.queued.fetch_sub(1, Ordering::Relaxed);
        }
        command
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One live worker session
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    connected_at: std::time::Instant,
    state: Mutex<ConnectionState>,
    tx: mpsc::UnboundedSender<ServerCommand>,
    queued: Arc<AtomicUsize>,
    max_pending_commands: usize,
    closed: watch::Sender<bool>,
    lost: AtomicBool,
}

impl Connection {
    /// Create a connection and the receiving half of its outbound queue
    #[must_use]
    pub fn new(
        peer: Option<SocketAddr>,
        max_pending_commands: usize,
    ) -> (Arc<Self>, OutboundReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let (closed, _) = watch::channel(false);

        let connection = Arc::new(Self {
            id: ConnectionId::new(),
            peer,
            connected_at: std::time::Instant::now(),
            state: Mutex::new(ConnectionState {
                name: None,
                connecting: HashSet::new(),
                replicating: HashMap::new(),
                pending: HashMap::new(),
                last_seen_ms: chrono::Utc::now().timestamp_millis(),
                ping_received: false,
            }),
            tx,
            queued: Arc::clone(&queued),
            max_pending_commands,
            closed,
            lost: AtomicBool::new(false),
        });

        (connection, OutboundReceiver { rx, queued })
    }

    /// Connection ID
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address, if known
    #[must_use]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Time since the connection was accepted
    #[must_use]
    pub fn age(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Label set by `NAME`
    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.state.lock().name.clone()
    }

    /// Set the label from `NAME`
    pub fn set_name(&self, name: impl Into<String>) {
        self.state.lock().name = Some(name.into());
    }

    /// Commands queued but not yet taken by the writer
    #[must_use]
    pub fn queued_commands(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    /// Queue a command for the writer
    ///
    /// # Errors
    ///
    /// `Delivery` if the connection is closed, or if the queue is over
    /// `max_pending_commands`. In the latter case the connection is sent
    /// `ERROR` and closed.
    pub fn send(&self, command: ServerCommand) -> Result<()> {
        if self.is_closed() {
            return Err(ReplicationError::delivery(self.id, "connection closed"));
        }

        if self.queued.load(Ordering::Relaxed) >= self.max_pending_commands {
            tracing::warn!(
                conn_id = %self.id,
                limit = self.max_pending_commands,
                "Outbound queue full, closing connection"
            );
            self.send_error("too many pending commands");
            return Err(ReplicationError::delivery(self.id, "outbound queue full"));
        }

        self.enqueue(command)
    }

    /// Queue `ERROR <message>` and close the connection
    ///
    /// Bypasses the queue limit so the worker always learns why it was
    /// dropped. Does nothing if the connection is already closed.
    pub fn send_error(&self, message: impl Into<String>) {
        if self.is_closed() {
            return;
        }
        let message = message.into();
        tracing::debug!(conn_id = %self.id, error = %message, "Sending ERROR");
        // Writer may already be gone, nothing more to do then
        let _ = self.enqueue(ServerCommand::Error(message));
        self.close();
    }

    fn enqueue(&self, command: ServerCommand) -> Result<()> {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.tx.send(command).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::Relaxed);
            ReplicationError::delivery(self.id, "writer has shut down")
        })
    }

    // ------------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------------

    /// Current state of a stream on this connection
    #[must_use]
    pub fn subscription_state(&self, stream: StreamKind) -> SubscriptionState {
        let state = self.state.lock();
        if state.replicating.contains_key(&stream) {
            SubscriptionState::Replicating
        } else if state.connecting.contains(&stream) {
            SubscriptionState::Connecting
        } else {
            SubscriptionState::Unsubscribed
        }
    }

    /// Streams in steady state
    #[must_use]
    pub fn replicating_streams(&self) -> Vec<StreamKind> {
        let state = self.state.lock();
        StreamKind::ALL
            .into_iter()
            .filter(|kind| state.replicating.contains_key(kind))
            .collect()
    }

    /// Rows buffered for a stream during catch-up
    #[must_use]
    pub fn pending_len(&self, stream: StreamKind) -> usize {
        self.state
            .lock()
            .pending
            .get(&stream)
            .map_or(0, Vec::len)
    }

    /// Move a stream to `Connecting` with an empty buffer
    ///
    /// A stream that was already replicating is resubscribed from scratch.
    pub fn begin_subscribe(&self, stream: StreamKind) {
        let mut state = self.state.lock();
        state.replicating.remove(&stream);
        state.connecting.insert(stream);
        state.pending.insert(stream, Vec::new());
    }

    /// Send catch-up history, drain the buffer, send `POSITION`, and move the
    /// stream to `Replicating`
    ///
    /// `history` holds every row in `(start, position]`. Buffered rows at or
    /// below `position` are part of it and are skipped.
    ///
    /// # Errors
    ///
    /// `Delivery` if the connection closed part way. The stream is then left
    /// unsubscribed.
    pub fn finish_subscribe(
        &self,
        stream: StreamKind,
        history: Vec<StreamUpdate>,
        position: StreamToken,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let buffered = state.pending.remove(&stream).unwrap_or_default();

        let result = (|| {
            for update in BatchedUpdate::from_updates(history) {
                self.send(rdata(stream, &update))?;
            }
            for update in buffered.iter().filter(|u| u.token > position) {
                self.send(rdata(stream, update))?;
            }
            self.send(ServerCommand::Position {
                stream,
                token: position,
            })
        })();

        state.connecting.remove(&stream);
        if result.is_ok() {
            state.replicating.insert(stream, position);
        }
        result
    }

    /// Abandon a subscribe, dropping anything buffered
    pub fn fail_subscribe(&self, stream: StreamKind) {
        let mut state = self.state.lock();
        state.connecting.remove(&stream);
        state.pending.remove(&stream);
    }

    /// Route one fanned-out row according to the stream's state
    ///
    /// # Errors
    ///
    /// `Delivery` if the row had to be sent and could not be queued.
    pub fn deliver(&self, stream: StreamKind, update: &BatchedUpdate) -> Result<DeliveryOutcome> {
        let mut state = self.state.lock();

        if let Some(&caught_up_to) = state.replicating.get(&stream) {
            if update.token <= caught_up_to {
                return Ok(DeliveryOutcome::Dropped);
            }
            self.send(rdata(stream, update))?;
            return Ok(DeliveryOutcome::Sent);
        }

        if state.connecting.contains(&stream) {
            state.pending.entry(stream).or_default().push(update.clone());
            return Ok(DeliveryOutcome::Buffered);
        }

        Ok(DeliveryOutcome::Dropped)
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    /// Record that a command arrived
    pub fn touch(&self, now_ms: i64) {
        self.state.lock().last_seen_ms = now_ms;
    }

    /// Record an inbound `PING`
    ///
    /// Enables the ping timeout for this connection.
    pub fn record_ping(&self, now_ms: i64) {
        let mut state = self.state.lock();
        state.last_seen_ms = now_ms;
        state.ping_received = true;
    }

    /// Whether the worker has gone quiet for longer than `timeout_ms`
    ///
    /// Only connections that have pinged at least once can time out.
    #[must_use]
    pub fn is_timed_out(&self, now_ms: i64, timeout_ms: i64) -> bool {
        let state = self.state.lock();
        state.ping_received && now_ms - state.last_seen_ms > timeout_ms
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Stop accepting commands and wake anything waiting on [`Self::closed`]
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Whether [`Self::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolve once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // Sender lives in self, so this only returns once closed
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Mark the connection as lost
    ///
    /// Returns `true` only for the first call, so cleanup runs once.
    pub fn mark_lost(&self) -> bool {
        !self.lost.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("name", &self.name())
            .field("queued", &self.queued_commands())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn rdata(stream: StreamKind, update: &BatchedUpdate) -> ServerCommand {
    ServerCommand::Rdata {
        stream,
        token: update.wire_token,
        payload: Arc::clone(&update.payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn update(token: i64, payload: &str) -> StreamUpdate {
        StreamUpdate::new(StreamToken::new(token), payload)
    }

    fn batched(token: i64, wire: Option<i64>, payload: &str) -> BatchedUpdate {
        BatchedUpdate {
            token: StreamToken::new(token),
            wire_token: wire.map(StreamToken::new),
            payload: Arc::from(payload),
        }
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(command) = rx.try_recv() {
            lines.push(command.to_line());
        }
        lines
    }

    #[test]
    fn test_connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert_eq!(ConnectionId::from_raw(7).to_string(), "conn-7");
    }

    #[test]
    fn test_deliver_unsubscribed_drops() {
        let (conn, mut rx) = Connection::new(None, 100);
        let outcome = conn
            .deliver(StreamKind::Events, &batched(1, Some(1), "[1]"))
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Dropped);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_subscribe_buffers_then_drains_in_order() {
        let (conn, mut rx) = Connection::new(None, 100);
        conn.begin_subscribe(StreamKind::Events);
        assert_eq!(
            conn.subscription_state(StreamKind::Events),
            SubscriptionState::Connecting
        );

        // Rows 3 and 4 arrive from a poke pass while catch-up is running
        for row in [batched(3, Some(3), "[3]"), batched(4, Some(4), "[4]")] {
            assert_eq!(
                conn.deliver(StreamKind::Events, &row).unwrap(),
                DeliveryOutcome::Buffered
            );
        }
        assert_eq!(conn.pending_len(StreamKind::Events), 2);

        conn.finish_subscribe(
            StreamKind::Events,
            vec![update(1, "[1]"), update(2, "[2]")],
            StreamToken::new(2),
        )
        .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                "RDATA events 1 [1]",
                "RDATA events 2 [2]",
                "RDATA events 3 [3]",
                "RDATA events 4 [4]",
                "POSITION events 2",
            ]
        );
        assert_eq!(
            conn.subscription_state(StreamKind::Events),
            SubscriptionState::Replicating
        );
        assert_eq!(conn.pending_len(StreamKind::Events), 0);
    }

    #[test]
    fn test_buffered_rows_covered_by_history_are_skipped() {
        let (conn, mut rx) = Connection::new(None, 100);
        conn.begin_subscribe(StreamKind::Events);
        conn.deliver(StreamKind::Events, &batched(2, Some(2), "[2]"))
            .unwrap();
        conn.deliver(StreamKind::Events, &batched(3, Some(3), "[3]"))
            .unwrap();

        conn.finish_subscribe(
            StreamKind::Events,
            vec![update(1, "[1]"), update(2, "[2]")],
            StreamToken::new(2),
        )
        .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                "RDATA events 1 [1]",
                "RDATA events 2 [2]",
                "RDATA events 3 [3]",
                "POSITION events 2",
            ]
        );
    }

    #[test]
    fn test_replicating_drops_rows_already_caught_up() {
        let (conn, mut rx) = Connection::new(None, 100);
        conn.begin_subscribe(StreamKind::Events);
        conn.finish_subscribe(StreamKind::Events, vec![update(5, "[5]")], StreamToken::new(5))
            .unwrap();
        drain(&mut rx);

        assert_eq!(
            conn.deliver(StreamKind::Events, &batched(5, Some(5), "[5]"))
                .unwrap(),
            DeliveryOutcome::Dropped
        );
        assert_eq!(
            conn.deliver(StreamKind::Events, &batched(6, None, "[6a]"))
                .unwrap(),
            DeliveryOutcome::Sent
        );
        assert_eq!(drain(&mut rx), vec!["RDATA events _ [6a]"]);
    }

    #[test]
    fn test_history_is_batched() {
        let (conn, mut rx) = Connection::new(None, 100);
        conn.begin_subscribe(StreamKind::Presence);
        conn.finish_subscribe(
            StreamKind::Presence,
            vec![update(1, "[\"a\"]"), update(1, "[\"b\"]"), update(2, "[\"c\"]")],
            StreamToken::new(2),
        )
        .unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                "RDATA presence _ [\"a\"]",
                "RDATA presence 1 [\"b\"]",
                "RDATA presence 2 [\"c\"]",
                "POSITION presence 2",
            ]
        );
    }

    #[test]
    fn test_fail_subscribe_returns_to_unsubscribed() {
        let (conn, mut rx) = Connection::new(None, 100);
        conn.begin_subscribe(StreamKind::Backfill);
        conn.deliver(StreamKind::Backfill, &batched(1, Some(1), "[1]"))
            .unwrap();
        conn.fail_subscribe(StreamKind::Backfill);

        assert_eq!(
            conn.subscription_state(StreamKind::Backfill),
            SubscriptionState::Unsubscribed
        );
        assert_eq!(conn.pending_len(StreamKind::Backfill), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_resubscribe_leaves_replicating() {
        let (conn, _rx) = Connection::new(None, 100);
        conn.begin_subscribe(StreamKind::Events);
        conn.finish_subscribe(StreamKind::Events, Vec::new(), StreamToken::new(0))
            .unwrap();
        assert_eq!(conn.replicating_streams(), vec![StreamKind::Events]);

        conn.begin_subscribe(StreamKind::Events);
        assert!(conn.replicating_streams().is_empty());
    }

    #[test]
    fn test_send_error_closes() {
        let (conn, mut rx) = Connection::new(None, 100);
        conn.send_error("unknown stream typing");

        assert!(conn.is_closed());
        assert_eq!(drain(&mut rx), vec!["ERROR unknown stream typing"]);
        assert!(conn.send(ServerCommand::Ping(1)).is_err());

        // Second error is not queued
        conn.send_error("again");
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_queue_limit_closes_connection() {
        let (conn, mut rx) = Connection::new(None, 2);
        conn.send(ServerCommand::Ping(1)).unwrap();
        conn.send(ServerCommand::Ping(2)).unwrap();
        assert_eq!(conn.queued_commands(), 2);

        let err = conn.send(ServerCommand::Ping(3)).unwrap_err();
        assert!(matches!(err, ReplicationError::Delivery { .. }));
        assert!(conn.is_closed());
        assert_eq!(
            drain(&mut rx),
            vec!["PING 1", "PING 2", "ERROR too many pending commands"]
        );
        assert_eq!(conn.queued_commands(), 0);
    }

    #[test]
    fn test_ping_timeout_requires_ping() {
        let (conn, _rx) = Connection::new(None, 10);
        conn.touch(1_000);
        assert!(!conn.is_timed_out(100_000, 15_000));

        conn.record_ping(1_000);
        assert!(!conn.is_timed_out(10_000, 15_000));
        assert!(conn.is_timed_out(16_001, 15_000));

        conn.touch(16_000);
        assert!(!conn.is_timed_out(16_001, 15_000));
    }

    #[test]
    fn test_mark_lost_once() {
        let (conn, _rx) = Connection::new(None, 10);
        assert!(conn.mark_lost());
        assert!(!conn.mark_lost());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (conn, _rx) = Connection::new(None, 10);
        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.closed().await })
        };
        conn.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve")
            .unwrap();
    }

    #[test]
    fn test_name() {
        let (conn, _rx) = Connection::new(None, 10);
        assert_eq!(conn.name(), None);
        conn.set_name("synchrotron");
        assert_eq!(conn.name(), Some("synchrotron".to_string()));
    }
}
