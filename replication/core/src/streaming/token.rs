//! Stream Tokens
//!
//! Positions within a single stream. Tokens from different streams are never
//! compared with each other.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Totally ordered position within one stream
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StreamToken(i64);

impl StreamToken {
    /// Create a token from its raw value
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// The token immediately after this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<i64> for StreamToken {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for StreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamToken {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(Self)
    }
}

/// Where a client wants a subscription to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartToken {
    /// Skip catch-up and start from the stream's current position
    Now,
    /// Replay everything after this token
    At(StreamToken),
}

impl fmt::Display for StartToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Now => write!(f, "NOW"),
            Self::At(token) => write!(f, "{token}"),
        }
    }
}

impl FromStr for StartToken {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("now") {
            Ok(Self::Now)
        } else {
            s.parse().map(Self::At)
        }
    }
}

impl From<StreamToken> for StartToken {
    fn from(token: StreamToken) -> Self {
        Self::At(token)
    }
}
