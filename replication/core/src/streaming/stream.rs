//! Stream Abstraction
//!
//! A [`Stream`] pairs a [`StreamSource`] with the two positions the poke loop
//! tracks for it:
//!
//! - `upto_token`: captured once at the start of each poke pass
//! - `last_token`: everything up to here has been handed to the fan-out
//!
//! `last_token <= upto_token` holds at all times. `last_token` only moves
//! after a successful fetch, so a failed fetch is simply retried on the next
//! pass.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};

use super::token::{StartToken, StreamToken};

/// Default ceiling on rows a single fetch may return
pub const MAX_BEHIND: usize = 10_000;

/// The closed set of streams a worker can replicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// New events persisted on the primary
    Events,
    /// Historical events pulled in by backfill
    Backfill,
    /// Presence state changes
    Presence,
    /// Outbound federation state
    Federation,
}

impl StreamKind {
    /// All stream kinds, in poke-loop order
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Events,
        StreamKind::Backfill,
        StreamKind::Presence,
        StreamKind::Federation,
    ];

    /// Wire name of the stream
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Backfill => "backfill",
            Self::Presence => "presence",
            Self::Federation => "federation",
        }
    }

    /// Look up a stream kind by wire name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A row as returned by a source: its token plus the remaining columns
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRow {
    /// Position of the row within its stream
    pub token: StreamToken,
    /// Row columns, opaque to the streamer
    pub data: serde_json::Value,
}

impl StreamRow {
    /// Create a row
    pub fn new(token: impl Into<StreamToken>, data: serde_json::Value) -> Self {
        Self {
            token: token.into(),
            data,
        }
    }
}

/// A row serialized for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamUpdate {
    /// Position of the row within its stream
    pub token: StreamToken,
    /// JSON encoding of the row columns
    pub payload: Arc<str>,
}

impl StreamUpdate {
    /// Create an update from an already serialized payload
    pub fn new(token: StreamToken, payload: impl Into<Arc<str>>) -> Self {
        Self {
            token,
            payload: payload.into(),
        }
    }

    fn encode(stream: &str, row: StreamRow) -> Result<Self> {
        let payload =
            serde_json::to_string(&row.data).map_err(|source| ReplicationError::Encode {
                stream: stream.to_string(),
                source,
            })?;
        Ok(Self::new(row.token, payload))
    }
}

/// Position source plus delta fetch for one stream
///
/// Implemented once per [`StreamKind`] in [`super::sources`].
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Which stream this source feeds
    fn kind(&self) -> StreamKind;

    /// Latest position known to the backing source (not necessarily delivered)
    fn current_token(&self) -> StreamToken;

    /// Rows with token in `(from, to]`, ascending by token
    ///
    /// Rows sharing a token must be contiguous. At most `limit` rows are
    /// returned.
    async fn fetch_rows(
        &self,
        from: StreamToken,
        to: StreamToken,
        limit: usize,
    ) -> Result<Vec<StreamRow>>;
}

/// Snapshot of a stream's poke-loop positions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPosition {
    /// Position already handed to the fan-out
    pub last_token: StreamToken,
    /// Position captured at the start of the current pass
    pub upto_token: StreamToken,
}

impl StreamPosition {
    /// Whether there are rows between `last_token` and `upto_token`
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.last_token != self.upto_token
    }
}

/// One replicated stream
pub struct Stream {
    source: Box<dyn StreamSource>,
    position: Mutex<StreamPosition>,
    max_behind: usize,
}

impl Stream {
    /// Wrap a source, starting both positions at its current token
    #[must_use]
    pub fn new(source: Box<dyn StreamSource>, max_behind: usize) -> Self {
        let current = source.current_token();
        Self {
            source,
            position: Mutex::new(StreamPosition {
                last_token: current,
                upto_token: current,
            }),
            max_behind,
        }
    }

    /// Stream kind
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.source.kind()
    }

    /// Wire name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Current positions
    #[must_use]
    pub fn position(&self) -> StreamPosition {
        *self.position.lock()
    }

    /// Position already handed to the fan-out
    #[must_use]
    pub fn last_token(&self) -> StreamToken {
        self.position.lock().last_token
    }

    /// Position captured at the start of the current pass
    #[must_use]
    pub fn upto_token(&self) -> StreamToken {
        self.position.lock().upto_token
    }

    /// Capture the source's current token as the pass upper bound
    ///
    /// Never moves `upto_token` backwards.
    pub fn advance_upper_bound(&self) -> StreamToken {
        let current = self.source.current_token();
        let mut position = self.position.lock();
        if current > position.upto_token {
            position.upto_token = current;
        }
        position.upto_token
    }

    /// Jump both positions to the source's current token without fetching
    ///
    /// Used when nobody is connected, so positions do not go stale.
    pub fn fast_forward(&self) -> StreamToken {
        let current = self.source.current_token();
        let mut position = self.position.lock();
        if current > position.upto_token {
            position.upto_token = current;
        }
        position.last_token = position.upto_token;
        position.upto_token
    }

    /// Move `last_token` up to the pass upper bound without fetching
    ///
    /// Used once every subscriber of a stream that fell behind has been
    /// dropped, so later passes start from a fetchable position.
    pub fn skip_pending(&self) -> StreamToken {
        let mut position = self.position.lock();
        position.last_token = position.upto_token;
        position.last_token
    }

    /// Rows after `from` up to `upto_token`, and the token they resolve to
    ///
    /// `NOW` (or a token at or past `upto_token`) returns no rows without
    /// touching the source.
    ///
    /// # Errors
    ///
    /// `FallenBehind` if the source returns `max_behind` rows or more, and
    /// whatever the source itself fails with.
    pub async fn get_delta_since(
        &self,
        from: StartToken,
    ) -> Result<(Vec<StreamUpdate>, StreamToken)> {
        let upto = self.upto_token();

        let from = match from {
            StartToken::Now => return Ok((Vec::new(), upto)),
            StartToken::At(token) if token >= upto => return Ok((Vec::new(), upto)),
            StartToken::At(token) => token,
        };

        let rows = self
            .source
            .fetch_rows(from, upto, self.max_behind + 1)
            .await?;

        if rows.len() >= self.max_behind {
            return Err(ReplicationError::FallenBehind {
                stream: self.name().to_string(),
                limit: self.max_behind,
            });
        }

        let updates = rows
            .into_iter()
            .map(|row| StreamUpdate::encode(self.name(), row))
            .collect::<Result<Vec<_>>>()?;

        Ok((updates, upto))
    }

    /// Fetch everything after `last_token` and advance it on success
    pub async fn pull_next(&self) -> Result<(Vec<StreamUpdate>, StreamToken)> {
        let from = self.last_token();
        let (updates, resolved) = self.get_delta_since(StartToken::At(from)).await?;

        let mut position = self.position.lock();
        if resolved > position.last_token {
            position.last_token = resolved;
        }

        Ok((updates, resolved))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let position = self.position();
        f.debug_struct("Stream")
            .field("name", &self.name())
            .field("last_token", &position.last_token)
            .field("upto_token", &position.upto_token)
            .field("max_behind", &self.max_behind)
            .finish()
    }
}
