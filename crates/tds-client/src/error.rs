//! Client error types.

use std::sync::Arc;

use tds_codec::CodecError;
use tds_protocol::{ProtocolError, ServerMessage};
use thiserror::Error;

use crate::state::ConnectionState;

/// Reasons an operation was not admitted onto a connection.
///
/// Admission failures are reported synchronously and leave the connection
/// untouched; the caller may retry or pick another connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AdmissionError {
    /// The connection is not accepting operations.
    #[error("connection is {0}")]
    NotReady(ConnectionState),

    /// Immediate start was requested but other operations are queued.
    #[error("connection is busy")]
    Busy,

    /// Another operation holds the connection for exclusive use.
    #[error("connection is held for exclusive use")]
    ExclusiveHeld,

    /// The operation is already bound to a connection.
    #[error("operation is already bound")]
    AlreadyBound,
}

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation was not admitted.
    #[error("operation not admitted: {0}")]
    Admission(#[from] AdmissionError),

    /// Framing or transport failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Wire format violation outside the reader.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Server returned an error.
    #[error("server error {number}: {message}")]
    Server {
        /// Error number.
        number: i32,
        /// Error class/severity (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message.
        message: String,
        /// Stored procedure name (if applicable).
        procedure: Option<String>,
        /// Line number in the SQL batch or procedure.
        line: u32,
    },

    /// The connection failed while this operation was queued or running.
    ///
    /// Every operation on a faulted connection receives the same cause.
    #[error("connection faulted: {0}")]
    ConnectionFaulted(Arc<Error>),

    /// The operation was canceled.
    #[error("operation canceled")]
    Canceled,

    /// Flushing a request did not finish in time.
    #[error("flush timed out")]
    FlushTimeout,

    /// Opening the connection did not finish in time.
    #[error("connection timed out")]
    ConnectTimeout,

    /// The connection is closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// A value or argument violates a size or shape limit.
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Writing the request failed; shared by the read and write sides.
    #[error("request write failed: {0}")]
    WriteFailed(Arc<Error>),

    /// The background write task ended without reporting.
    #[error("write task aborted")]
    WriteAborted,
}

impl Error {
    /// Build a server error from an ERROR token.
    #[must_use]
    pub fn server(message: &ServerMessage) -> Self {
        Self::Server {
            number: message.number,
            class: message.class,
            state: message.state,
            message: message.message.clone(),
            procedure: (!message.procedure.is_empty()).then(|| message.procedure.clone()),
            line: message.line.max(0) as u32,
        }
    }

    /// Check if this error is transient and may succeed on retry.
    ///
    /// Nothing is retried automatically; this only classifies.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Admission(_)
            | Self::ConnectTimeout
            | Self::FlushTimeout
            | Self::ConnectionClosed
            | Self::Io(_) => true,
            Self::Codec(e) => e.is_connection_closed(),
            Self::ConnectionFaulted(cause) | Self::WriteFailed(cause) => cause.is_transient(),
            Self::Server { number, .. } => matches!(number, 1205 | 40197 | 40501 | 40613),
            _ => false,
        }
    }

    /// Check if this error leaves the connection unusable.
    ///
    /// Such errors fault every operation queued on the same connection.
    #[must_use]
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            Self::Codec(_)
            | Self::Protocol(_)
            | Self::Io(_)
            | Self::ConnectionFaulted(_)
            | Self::FlushTimeout
            | Self::ConnectionClosed => true,
            Self::Server { class, .. } => *class >= 20,
            Self::WriteFailed(cause) => cause.is_connection_fatal(),
            _ => false,
        }
    }

    /// Check if this is a server error with a specific number.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server { number: n, .. } if *n == number)
    }

    /// Get the error class/severity if this is a server error.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server { class, .. } => Some(*class),
            _ => None,
        }
    }

    /// The underlying cause, looking through [`Error::ConnectionFaulted`]
    /// and [`Error::WriteFailed`].
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Self::ConnectionFaulted(cause) | Self::WriteFailed(cause) => cause.root(),
            other => other,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_is_transient_not_fatal() {
        let err = Error::from(AdmissionError::Busy);
        assert!(err.is_transient());
        assert!(!err.is_connection_fatal());
    }

    #[test]
    fn test_faulted_wraps_cause() {
        let cause = Arc::new(Error::from(CodecError::ConnectionClosed));
        let err = Error::ConnectionFaulted(Arc::clone(&cause));
        assert!(err.is_connection_fatal());
        assert!(err.is_transient());
        assert!(matches!(err.root(), Error::Codec(CodecError::ConnectionClosed)));
    }

    #[test]
    fn test_server_error_classification() {
        let msg = ServerMessage {
            number: 208,
            class: 16,
            message: "Invalid object name 'missing'.".into(),
            ..ServerMessage::default()
        };
        let err = Error::server(&msg);
        assert!(err.is_server_error(208));
        assert_eq!(err.class(), Some(16));
        assert!(!err.is_connection_fatal());
        assert!(!err.is_transient());

        let deadlock = Error::server(&ServerMessage {
            number: 1205,
            class: 13,
            ..ServerMessage::default()
        });
        assert!(deadlock.is_transient());
    }

    #[test]
    fn test_validation_is_neither() {
        let err = Error::Validation("name too long".into());
        assert!(!err.is_transient());
        assert!(!err.is_connection_fatal());
    }
}
