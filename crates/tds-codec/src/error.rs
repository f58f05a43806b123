//! Codec error types.

use std::io;

use tds_protocol::{PacketType, ProtocolError};
use thiserror::Error;

/// Errors raised by the framing and reading layers.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Transport I/O failed.
    #[error("IO error: {0}")]
    Io(io::Error),

    /// The byte stream violated the wire format.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport reached end of stream before the requested bytes arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// A packet exceeds the maximum accepted size.
    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge {
        /// Declared packet size.
        size: usize,
        /// Maximum accepted size.
        max: usize,
    },

    /// A packet header declares an impossible length.
    #[error("invalid packet header")]
    InvalidHeader,

    /// A packet of the wrong type arrived.
    #[error("unexpected packet type: expected {expected:?}, got {actual:?}")]
    UnexpectedPacketType {
        /// Type required at this point.
        expected: PacketType,
        /// Type received.
        actual: PacketType,
    },

    /// Requested packet size is outside the negotiable range.
    #[error("invalid packet size {0}")]
    InvalidPacketSize(usize),

    /// The writer or reader was used out of sequence.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// A column was requested behind the row cursor or past the last column.
    #[error("column {requested} is not readable (cursor at {cursor}, {count} columns)")]
    ColumnOutOfOrder {
        /// Requested column index.
        requested: usize,
        /// Index of the next unread column.
        cursor: usize,
        /// Number of columns in the row.
        count: usize,
    },
}

impl CodecError {
    /// Whether the transport is gone.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        // Errors raised inside `AsyncRead` adapters travel as boxed payloads.
        if err.get_ref().is_some_and(|inner| inner.is::<CodecError>()) {
            return match err.into_inner().map(|inner| inner.downcast::<CodecError>()) {
                Some(Ok(inner)) => *inner,
                Some(Err(other)) => Self::Io(io::Error::other(other)),
                None => Self::ConnectionClosed,
            };
        }
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
