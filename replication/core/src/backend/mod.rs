//! Backend Collaborators
//!
//! Abstractions over the systems the streamer reads from and forwards to.
//! The streamer never talks to storage directly; it only sees these traits,
//! so a real database, a presence service, or the in-memory backend can sit
//! behind them.

pub mod memory;
mod traits;

pub use memory::{MemoryBackend, MemoryLog, RemovedPusher};
pub use traits::{FederationSender, PresenceHandler, ReplicationStore};
