//! Replicated Streams
//!
//! Each stream is an append-only sequence of rows tagged with monotonic
//! tokens. The streamer polls every stream once per poke pass:
//!
//! ```text
//!   advance_upper_bound()        pull_next()             batch + fan-out
//!  ┌──────────────────────┐   ┌───────────────────┐   ┌──────────────────┐
//!  │ upto = current_token │──►│ rows (last, upto] │──►│ (_ | token, row) │
//!  └──────────────────────┘   └───────────────────┘   └──────────────────┘
//! ```
//!
//! Sources form a closed set, one per [`StreamKind`].

mod batch;
mod sources;
mod stream;
mod token;

pub use batch::{batch_updates, BatchedUpdate};
pub use sources::{BackfillStream, EventsStream, FederationStream, PresenceStream};
pub use stream::{
    Stream, StreamKind, StreamPosition, StreamRow, StreamSource, StreamUpdate, MAX_BEHIND,
};
pub use token::{StartToken, StreamToken};
