//! Connection configuration.

use std::time::Duration;

use bytes::Bytes;
use tds_codec::DEFAULT_READ_CAPACITY;
use tds_protocol::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE};

use crate::error::{Error, Result};
use crate::statement_cache::DEFAULT_MAX_STATEMENTS;

/// Configuration for opening a connection.
///
/// The PreLogin and Login7 bodies are opaque: they are framed and sent as
/// given, and their responses are validated only as far as the token
/// sequence goes.
///
/// This struct is marked `#[non_exhaustive]`; build it from
/// [`ConnectionConfig::default()`] and the setters.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Server hostname or IP address.
    pub host: String,

    /// Server port (default: 1433).
    pub port: u16,

    /// Requested packet size (default: 4096). The server may negotiate a
    /// different size during login.
    pub packet_size: usize,

    /// Initial read buffer capacity (default: 8192).
    pub read_buffer_capacity: usize,

    /// Time allowed for TCP connect plus login (default: 15s).
    pub connect_timeout: Duration,

    /// Time allowed for one flush to the transport (default: 30s).
    pub flush_timeout: Duration,

    /// Maximum prepared statements kept per connection (default: 256).
    /// Zero disables statement preparation.
    pub statement_cache_size: usize,

    /// PreLogin request body.
    pub prelogin: Bytes,

    /// Login7 request body.
    pub login7: Bytes,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1433,
            packet_size: DEFAULT_PACKET_SIZE,
            read_buffer_capacity: DEFAULT_READ_CAPACITY,
            connect_timeout: Duration::from_secs(15),
            flush_timeout: Duration::from_secs(30),
            statement_cache_size: DEFAULT_MAX_STATEMENTS,
            prelogin: Bytes::new(),
            login7: Bytes::new(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the server port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the requested packet size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Set the initial read buffer capacity.
    #[must_use]
    pub fn read_buffer_capacity(mut self, capacity: usize) -> Self {
        self.read_buffer_capacity = capacity;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the flush timeout.
    #[must_use]
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Set the prepared statement table size.
    #[must_use]
    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    /// Set the PreLogin request body.
    #[must_use]
    pub fn prelogin(mut self, body: impl Into<Bytes>) -> Self {
        self.prelogin = body.into();
        self
    }

    /// Set the Login7 request body.
    #[must_use]
    pub fn login7(mut self, body: impl Into<Bytes>) -> Self {
        self.login7 = body.into();
        self
    }

    /// `host:port` address for the TCP connect.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if !(MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&self.packet_size) {
            return Err(Error::Config(format!(
                "packet size {} outside {MIN_PACKET_SIZE}..={MAX_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.read_buffer_capacity == 0 {
            return Err(Error::Config("read buffer capacity must be > 0".into()));
        }
        if self.connect_timeout.is_zero() || self.flush_timeout.is_zero() {
            return Err(Error::Config("timeouts must be > 0".into()));
        }
        Ok(())
    }
}
