//! Wire Commands
//!
//! Every line on the wire is `<COMMAND> <args>`. Arguments are split on
//! single spaces, with the last argument taking the remainder of the line so
//! JSON payloads and free-form messages may contain spaces.
//!
//! # Client → Server
//!
//! | Command | Arguments |
//! |---------|-----------|
//! | `NAME` | `<label>` |
//! | `REPLICATE` | `<stream\|ALL> <token\|NOW>` |
//! | `PING` | `<timestamp>` |
//! | `USER_SYNC` | `<start\|end> <user_id>` |
//! | `FEDERATION_ACK` | `<token>` |
//! | `REMOVE_PUSHER` | `<app_id> <user_id> <push_key>` |
//! | `INVALIDATE_CACHE` | `<cache_name> <json_keys>` |
//!
//! # Server → Client
//!
//! | Command | Arguments |
//! |---------|-----------|
//! | `SERVER` | `<server_name>` |
//! | `RDATA` | `<stream> <token\|_> <json>` |
//! | `POSITION` | `<stream> <token>` |
//! | `ERROR` | `<message>` |
//! | `PING` | `<timestamp>` |

use std::fmt;
use std::sync::Arc;

use crate::error::ProtocolError;
use crate::streaming::{StartToken, StreamKind, StreamToken};

/// Wire marker for a row whose token group continues on the next line
pub const BATCH_MARKER: &str = "_";

/// Keyword subscribing to every registered stream
pub const ALL_STREAMS: &str = "ALL";

// ============================================================================
// Client Commands
// ============================================================================

/// Which streams a `REPLICATE` targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSelector {
    /// Every registered stream
    All,
    /// One stream by wire name (may not be registered)
    Named(String),
}

/// `USER_SYNC` state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// The user started syncing
    Start,
    /// The user stopped syncing
    End,
}

impl SyncState {
    /// Whether the user is now syncing
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Start)
    }
}

/// A command received from a worker
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    /// Human-readable label for the connection
    Name(String),
    /// Subscribe to one or all streams from a position
    Replicate {
        /// Target streams
        stream: StreamSelector,
        /// Catch-up start
        token: StartToken,
    },
    /// Keepalive, payload is not interpreted
    Ping(String),
    /// A user started or stopped syncing on the worker
    UserSync {
        /// New state
        state: SyncState,
        /// User id
        user_id: String,
    },
    /// Federation rows up to this token are processed
    FederationAck(StreamToken),
    /// Delete a pusher
    RemovePusher {
        /// Application id
        app_id: String,
        /// Owning user
        user_id: String,
        /// Push key (may contain spaces)
        push_key: String,
    },
    /// Invalidate entries of a named cache
    InvalidateCache {
        /// Cache name
        cache_name: String,
        /// Cache keys
        keys: Vec<serde_json::Value>,
    },
}

impl ClientCommand {
    /// Parse one line
    ///
    /// Returns `Ok(None)` for blank lines.
    ///
    /// # Errors
    ///
    /// `UnknownCommand` for a name this side does not accept, `Malformed`
    /// for bad arguments.
    pub fn parse(line: &str) -> Result<Option<Self>, ProtocolError> {
        let line = line.trim_end();
        if line.trim_start().is_empty() {
            return Ok(None);
        }

        let (name, rest) = split_command(line);
        let command = match name {
            "NAME" => Self::Name(non_empty(name, rest, "missing name")?.to_string()),
            "REPLICATE" => {
                let (stream, token) = rest
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::malformed(name, "expected <stream> <token>"))?;
                let stream = match non_empty(name, stream, "missing stream")? {
                    ALL_STREAMS => StreamSelector::All,
                    other => StreamSelector::Named(other.to_string()),
                };
                let token = token
                    .parse()
                    .map_err(|_| ProtocolError::malformed(name, format!("bad token {token:?}")))?;
                Self::Replicate { stream, token }
            }
            "PING" => Self::Ping(rest.to_string()),
            "USER_SYNC" => {
                let (state, user_id) = rest
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::malformed(name, "expected <state> <user_id>"))?;
                let state = match state {
                    "start" => SyncState::Start,
                    "end" => SyncState::End,
                    other => {
                        return Err(ProtocolError::malformed(
                            name,
                            format!("invalid state {other:?}"),
                        ))
                    }
                };
                let user_id = non_empty(name, user_id, "missing user id")?.to_string();
                Self::UserSync { state, user_id }
            }
            "FEDERATION_ACK" => Self::FederationAck(
                rest.parse()
                    .map_err(|_| ProtocolError::malformed(name, format!("bad token {rest:?}")))?,
            ),
            "REMOVE_PUSHER" => {
                let mut parts = rest.splitn(3, ' ');
                let (Some(app_id), Some(user_id), Some(push_key)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(ProtocolError::malformed(
                        name,
                        "expected <app_id> <user_id> <push_key>",
                    ));
                };
                Self::RemovePusher {
                    app_id: non_empty(name, app_id, "missing app id")?.to_string(),
                    user_id: non_empty(name, user_id, "missing user id")?.to_string(),
                    push_key: non_empty(name, push_key, "missing push key")?.to_string(),
                }
            }
            "INVALIDATE_CACHE" => {
                let (cache_name, keys) = rest.split_once(' ').ok_or_else(|| {
                    ProtocolError::malformed(name, "expected <cache_name> <json_keys>")
                })?;
                let keys = serde_json::from_str(keys)
                    .map_err(|e| ProtocolError::malformed(name, format!("bad keys: {e}")))?;
                Self::InvalidateCache {
                    cache_name: non_empty(name, cache_name, "missing cache name")?.to_string(),
                    keys,
                }
            }
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        Ok(Some(command))
    }

    /// Command name as it appears on the wire
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Name(_) => "NAME",
            Self::Replicate { .. } => "REPLICATE",
            Self::Ping(_) => "PING",
            Self::UserSync { .. } => "USER_SYNC",
            Self::FederationAck(_) => "FEDERATION_ACK",
            Self::RemovePusher { .. } => "REMOVE_PUSHER",
            Self::InvalidateCache { .. } => "INVALIDATE_CACHE",
        }
    }
}

// ============================================================================
// Server Commands
// ============================================================================

/// A command sent to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCommand {
    /// Identifies this server, sent first on every connection
    Server(String),
    /// One replicated row
    Rdata {
        /// Stream the row belongs to
        stream: StreamKind,
        /// `None` while more rows follow under the same token
        token: Option<StreamToken>,
        /// JSON-encoded row
        payload: Arc<str>,
    },
    /// Catch-up for a stream is complete at this token
    Position {
        /// Stream
        stream: StreamKind,
        /// Resolved token
        token: StreamToken,
    },
    /// Fatal error, the connection is closed after this line
    Error(String),
    /// Keepalive with server time in milliseconds
    Ping(i64),
}

impl ServerCommand {
    /// Command name as it appears on the wire
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Server(_) => "SERVER",
            Self::Rdata { .. } => "RDATA",
            Self::Position { .. } => "POSITION",
            Self::Error(_) => "ERROR",
            Self::Ping(_) => "PING",
        }
    }

    /// Render as one line, without the terminator
    ///
    /// Free-form text has any newline replaced so one command is always
    /// exactly one line.
    #[must_use]
    pub fn to_line(&self) -> String {
        match self {
            Self::Server(name) => format!("SERVER {}", single_line(name)),
            Self::Rdata {
                stream,
                token,
                payload,
            } => match token {
                Some(token) => format!("RDATA {stream} {token} {}", single_line(payload)),
                None => format!("RDATA {stream} {BATCH_MARKER} {}", single_line(payload)),
            },
            Self::Position { stream, token } => format!("POSITION {stream} {token}"),
            Self::Error(message) => format!("ERROR {}", single_line(message)),
            Self::Ping(ts) => format!("PING {ts}"),
        }
    }

    /// Parse a server line, as a worker would
    ///
    /// # Errors
    ///
    /// `UnknownCommand` or `Malformed` for lines a worker would reject.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let (name, rest) = split_command(line.trim_end());
        match name {
            "SERVER" => Ok(Self::Server(rest.to_string())),
            "RDATA" => {
                let mut parts = rest.splitn(3, ' ');
                let (Some(stream), Some(token), Some(payload)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(ProtocolError::malformed(
                        name,
                        "expected <stream> <token> <json>",
                    ));
                };
                let token = if token == BATCH_MARKER {
                    None
                } else {
                    Some(token.parse().map_err(|_| {
                        ProtocolError::malformed(name, format!("bad token {token:?}"))
                    })?)
                };
                Ok(Self::Rdata {
                    stream: parse_stream(name, stream)?,
                    token,
                    payload: Arc::from(payload),
                })
            }
            "POSITION" => {
                let (stream, token) = rest
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::malformed(name, "expected <stream> <token>"))?;
                Ok(Self::Position {
                    stream: parse_stream(name, stream)?,
                    token: token.parse().map_err(|_| {
                        ProtocolError::malformed(name, format!("bad token {token:?}"))
                    })?,
                })
            }
            "ERROR" => Ok(Self::Error(rest.to_string())),
            "PING" => Ok(Self::Ping(rest.parse().map_err(|_| {
                ProtocolError::malformed(name, format!("bad timestamp {rest:?}"))
            })?)),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    /// Whether the connection must be closed once this is written
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn split_command(line: &str) -> (&str, &str) {
    line.split_once(' ').unwrap_or((line, ""))
}

fn non_empty<'a>(command: &str, value: &'a str, reason: &str) -> Result<&'a str, ProtocolError> {
    if value.is_empty() {
        Err(ProtocolError::malformed(command, reason))
    } else {
        Ok(value)
    }
}

fn parse_stream(command: &str, name: &str) -> Result<StreamKind, ProtocolError> {
    StreamKind::from_name(name)
        .ok_or_else(|| ProtocolError::malformed(command, format!("unknown stream {name:?}")))
}

fn single_line(text: &str) -> std::borrow::Cow<'_, str> {
    if text.contains(['\n', '\r']) {
        text.replace(['\n', '\r'], " ").into()
    } else {
        text.into()
    }
}
