//! Pool error types.

use std::time::Duration;

use tds_client::{AdmissionError, Error};
use thiserror::Error;

/// Errors that can occur during pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// No connection can take the operation now.
    ///
    /// Reported synchronously; nothing changed and the caller may retry.
    #[error("connection pool exhausted")]
    Exhausted,

    /// The pool stayed exhausted for the whole wait.
    #[error("connection acquisition timeout after {0:?}")]
    AcquisitionTimeout(Duration),

    /// Pool is closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Opening a connection for a slot failed.
    #[error("failed to create connection: {0}")]
    ConnectionCreation(#[source] Error),

    /// Opening a connection did not finish in time.
    #[error("connection creation timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// The chosen connection refused the operation.
    #[error("operation not admitted: {0}")]
    Admission(#[from] AdmissionError),

    /// Pool configuration error.
    #[error("pool configuration error: {0}")]
    Configuration(String),

    /// The request was canceled before it reached a connection.
    #[error("operation canceled")]
    Canceled,

    /// The multiplexing writer has stopped.
    #[error("multiplexing writer stopped")]
    WriterStopped,
}

impl PoolError {
    /// Check if the same request may succeed on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Exhausted
            | Self::AcquisitionTimeout(_)
            | Self::ConnectionTimeout(_)
            | Self::Admission(_) => true,
            Self::ConnectionCreation(e) => e.is_transient(),
            Self::PoolClosed | Self::Configuration(_) | Self::Canceled | Self::WriterStopped => {
                false
            }
        }
    }
}
