//! Replication Core - Server Side of the Worker Replication Protocol
//!
//! This crate streams the primary's append-only logs to worker processes
//! over a line-based TCP protocol. Workers subscribe to named streams from a
//! token, receive the history they missed, then follow live updates.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Collaborators                             │
//! │  ┌──────────────────┐  ┌─────────────────┐  ┌─────────────────┐  │
//! │  │ ReplicationStore │  │ PresenceHandler │  │FederationSender │  │
//! │  └────────┬─────────┘  └────────┬────────┘  └────────┬────────┘  │
//! └───────────┼─────────────────────┼────────────────────┼───────────┘
//!             │ fetch rows          │                    │
//! ┌───────────┼─────────────────────┼────────────────────┼───────────┐
//! │           ▼                     ▼                    ▼           │
//! │   ┌──────────────────────── Streamer ──────────────────────────┐ │
//! │   │ events │ backfill │ presence │ federation   (Stream)       │ │
//! │   │                                                            │ │
//! │   │ Notifier ──poke──► SingleFlight ──► pass ──► batch/fan out │ │
//! │   └──────────────────────────┬─────────────────────────────────┘ │
//! │                              │ RDATA / POSITION / ERROR / PING    │
//! │        ┌─────────────────────┼─────────────────────┐             │
//! │        ▼                     ▼                     ▼             │
//! │   Connection            Connection            Connection         │
//! │  (per-stream state: Unsubscribed → Connecting → Replicating)     │
//! └────────┬─────────────────────┬─────────────────────┬─────────────┘
//!          │ TCP                 │                     │
//!       worker                worker                worker
//! ```
//!
//! # Key Types
//!
//! - [`Streamer`]: Owns the streams and connections, runs the poke loop
//! - [`Connection`]: One worker's outbound queue and subscription state
//! - [`ProtocolHandler`]: Applies inbound commands to a connection
//! - [`Stream`]: Position tracking around a [`StreamSource`]
//! - [`ReplicationListener`]: TCP accept loop
//!
//! # Module Overview
//!
//! - [`backend`]: Collaborator traits and an in-memory implementation
//! - [`config`]: TOML, environment and CLI configuration
//! - [`connection`]: Per-worker connection state machine
//! - [`error`]: Error types
//! - [`handler`]: Inbound command dispatch
//! - [`notifier`]: New-data signal
//! - [`single_flight`]: Coalescing of concurrent pokes
//! - [`streamer`]: Poke loop, fan-out and keepalives
//! - [`streaming`]: Tokens, streams, sources and batching
//! - [`transport`]: Line codec, commands and TCP

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod notifier;
pub mod single_flight;
pub mod streamer;
pub mod streaming;
pub mod transport;

// Backend exports
pub use backend::{FederationSender, MemoryBackend, PresenceHandler, ReplicationStore};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, ReplicationConfig, ReplicationToml,
};

// Connection exports
pub use connection::{
    Connection, ConnectionId, DeliveryOutcome, OutboundReceiver, SubscriptionState,
};

// Error exports
pub use error::{ProtocolError, ReplicationError, Result};

pub use handler::ProtocolHandler;
pub use notifier::Notifier;

// Streamer exports
pub use streamer::{Collaborators, FanOutResult, PassStats, PokeOutcome, Streamer, StreamerConfig};

// Streaming exports
pub use streaming::{
    batch_updates, BatchedUpdate, StartToken, Stream, StreamKind, StreamRow, StreamSource,
    StreamToken, StreamUpdate, MAX_BEHIND,
};

// Transport exports
pub use transport::{ClientCommand, ReplicationListener, ServerCommand};
