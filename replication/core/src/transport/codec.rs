//! Line Codec
//!
//! Wire framing for the replication protocol: UTF-8 text, one command per
//! line, terminated by `\n` (a trailing `\r` is tolerated and stripped).
//!
//! # Security
//!
//! - Maximum line length is enforced while buffering, before a newline is
//!   seen, so a client cannot grow the buffer without bound
//! - Invalid UTF-8 is rejected rather than lossily converted

use crate::error::ProtocolError;

use super::command::ServerCommand;

/// Maximum line length (1 MiB)
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Minimum buffer capacity for decoder
const MIN_BUFFER_CAPACITY: usize = 4096;

/// Encode a command as one newline-terminated line
#[must_use]
pub fn encode_line(command: &ServerCommand) -> Vec<u8> {
    let mut line = command.to_line().into_bytes();
    line.push(b'\n');
    line
}

/// Decoder state machine for streaming line parsing
///
/// Buffers incoming bytes and yields complete lines.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Position where we've consumed up to
    read_pos: usize,
    max_line_length: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Create a decoder with the default line limit
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_length(MAX_LINE_LENGTH)
    }

    /// Create a decoder with a custom line limit
    #[must_use]
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
            max_line_length,
        }
    }

    /// Append bytes to the buffer
    pub fn push(&mut self, data: &[u8]) {
        // Compact buffer if we've consumed a lot
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes buffered but not yet decoded
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Try to decode the next line
    ///
    /// Returns:
    /// - `Ok(Some(line))` without its terminator
    /// - `Ok(None)` if more data is needed
    /// - `Err(LineTooLong)` if the limit is exceeded
    /// - `Err(InvalidUtf8)` if the line is not UTF-8
    pub fn decode_line(&mut self) -> Result<Option<String>, ProtocolError> {
        let pending = &self.buffer[self.read_pos..];

        let Some(newline) = pending.iter().position(|&b| b == b'\n') else {
            if pending.len() > self.max_line_length {
                return Err(ProtocolError::LineTooLong {
                    max: self.max_line_length,
                });
            }
            return Ok(None);
        };

        if newline > self.max_line_length {
            return Err(ProtocolError::LineTooLong {
                max: self.max_line_length,
            });
        }

        let mut line = &pending[..newline];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let line = std::str::from_utf8(line)
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();

        self.read_pos += newline + 1;
        Ok(Some(line))
    }
}
