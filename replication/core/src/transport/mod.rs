//! Transport Layer
//!
//! Newline-delimited text protocol over TCP:
//!
//! - [`codec`]: line framing with a length limit
//! - [`command`]: client and server command types
//! - [`tcp`]: listener and per-connection reader/writer tasks

pub mod codec;
pub mod command;
pub mod tcp;

pub use codec::{encode_line, LineDecoder, MAX_LINE_LENGTH};
pub use command::{
    ClientCommand, ServerCommand, StreamSelector, SyncState, ALL_STREAMS, BATCH_MARKER,
};
pub use tcp::{serve_connection, ReplicationListener};
