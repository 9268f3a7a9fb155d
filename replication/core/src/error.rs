//! Error Types
//!
//! Errors raised by the replication streamer. Every error here is scoped to
//! either a single connection or a single stream for a single poke pass;
//! nothing in this crate is meant to take the process down.
//!
//! | Error | Scope | Effect |
//! |-------|-------|--------|
//! | `Protocol` | connection | `ERROR` sent, connection closed |
//! | `UnknownStream` | connection | `ERROR` sent, connection closed |
//! | `FallenBehind` | request | subscribe fails, no `POSITION` sent |
//! | `Delivery` | connection | logged, fan-out continues |
//! | `Collaborator` | stream/command | logged, `last_token` not advanced |

use thiserror::Error;

use crate::connection::ConnectionId;

/// Result type alias for replication operations
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Malformed or unknown input on the wire
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Command name is not one this side accepts
    #[error("invalid command: {0}")]
    UnknownCommand(String),

    /// Command name was recognised but its arguments were not
    #[error("failed to parse line for {command}: {reason}")]
    Malformed {
        /// Command name
        command: String,
        /// What was wrong with the arguments
        reason: String,
    },

    /// Line exceeded the framing limit before a newline arrived
    #[error("line exceeds {max} bytes")]
    LineTooLong {
        /// Configured limit
        max: usize,
    },

    /// Line was not valid UTF-8
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

impl ProtocolError {
    /// Shorthand for a `Malformed` error
    pub fn malformed(command: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while streaming or serving a connection
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Bad input from a client
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A subscribe or catch-up named a stream that is not registered
    #[error("unknown stream {0}")]
    UnknownStream(String),

    /// A fetch would have returned more rows than the configured ceiling
    #[error("stream {stream} has fallen behind (limit: {limit} rows)")]
    FallenBehind {
        /// Stream name
        stream: String,
        /// Configured `max_behind`
        limit: usize,
    },

    /// A command could not be queued for a connection
    #[error("delivery to {conn_id} failed: {reason}")]
    Delivery {
        /// Target connection
        conn_id: ConnectionId,
        /// Why the command was not queued
        reason: String,
    },

    /// Storage, presence or federation collaborator failed
    #[error("{collaborator} error: {message}")]
    Collaborator {
        /// Which collaborator failed
        collaborator: &'static str,
        /// Failure description
        message: String,
    },

    /// A row could not be serialized for the wire
    #[error("failed to encode row for stream {stream}: {source}")]
    Encode {
        /// Stream the row belongs to
        stream: String,
        /// Underlying serializer error
        #[source]
        source: serde_json::Error,
    },

    /// Socket I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicationError {
    /// Shorthand for a `Collaborator` error
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Shorthand for a `Delivery` error
    pub fn delivery(conn_id: ConnectionId, reason: impl Into<String>) -> Self {
        Self::Delivery {
            conn_id,
            reason: reason.into(),
        }
    }

    /// Whether this error came from bad client input
    #[must_use]
    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownCommand("FOO".to_string());
        assert_eq!(err.to_string(), "invalid command: FOO");

        let err = ProtocolError::malformed("REPLICATE", "missing token");
        assert_eq!(
            err.to_string(),
            "failed to parse line for REPLICATE: missing token"
        );
    }

    #[test]
    fn test_fallen_behind_display() {
        let err = ReplicationError::FallenBehind {
            stream: "events".to_string(),
            limit: 10_000,
        };
        assert!(err.to_string().contains("events"));
        assert!(err.to_string().contains("10000"));
    }

    #[test]
    fn test_protocol_conversion() {
        let err: ReplicationError = ProtocolError::InvalidUtf8.into();
        assert!(err.is_protocol());
        assert!(!ReplicationError::UnknownStream("x".into()).is_protocol());
    }
}
