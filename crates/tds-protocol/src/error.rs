//! Protocol-level error types.

use thiserror::Error;

use crate::token::TokenType;

/// Errors raised while encoding or decoding TDS wire structures.
///
/// Decoders never consume past the end of their input. When the input is
/// short they return [`ProtocolError::Incomplete`] (or
/// [`ProtocolError::UnexpectedEof`] when the shortfall is not known up front),
/// and the caller retries once more bytes are buffered. Every other variant
/// describes malformed or unsupported data and is not recoverable on the
/// connection that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// More bytes are required; `needed` is the total length required from
    /// the start of the item being decoded.
    #[error("incomplete data: need {needed} bytes, have {available}")]
    Incomplete {
        /// Total bytes required from the start of the item.
        needed: usize,
        /// Bytes available when decoding stopped.
        available: usize,
    },

    /// Input ended in the middle of a variable-shaped field.
    #[error("unexpected end of data")]
    UnexpectedEof,

    /// Unknown packet type byte.
    #[error("invalid packet type: {0:#04x}")]
    InvalidPacketType(u8),

    /// Status byte carries unknown bits.
    #[error("invalid packet status: {0:#04x}")]
    InvalidPacketStatus(u8),

    /// Packet header declares an impossible length.
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(u16),

    /// Unknown token tag.
    #[error("invalid token type: {0:#04x}")]
    InvalidTokenType(u8),

    /// Column or parameter type code this engine cannot decode.
    #[error("unsupported data type: {0:#04x}")]
    UnsupportedType(u8),

    /// A token arrived where a different one was required.
    #[error("unexpected token: expected {expected}, got {actual:?}")]
    UnexpectedToken {
        /// Description of what was required at this point.
        expected: &'static str,
        /// The token that was received.
        actual: TokenType,
    },

    /// The server rejected the login.
    #[error("login failed ({number}): {message}")]
    LoginFailed {
        /// Server error number.
        number: i32,
        /// Server error message.
        message: String,
    },

    /// A length or count field is inconsistent with the data around it.
    #[error("malformed {0}")]
    Malformed(&'static str),

    /// String data is not valid UTF-16.
    #[error("string encoding error: {0}")]
    StringEncoding(String),

    /// A value does not fit the wire representation.
    #[error("value too large: {0}")]
    ValueTooLarge(String),
}

impl ProtocolError {
    /// Whether this error only means the input was short and decoding can be
    /// retried from the same offset once more bytes are available.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete { .. } | Self::UnexpectedEof)
    }
}
