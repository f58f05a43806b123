//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Default pending-operation limit per pipelined connection.
pub const DEFAULT_MAX_PIPELINE_DEPTH: usize = 16;

/// Default byte count after which the multiplexing writer flushes a batch.
pub const DEFAULT_BATCH_THRESHOLD: usize = 1000;

/// Configuration for a [`ConnectionSource`](crate::ConnectionSource).
///
/// This struct is marked `#[non_exhaustive]` to allow adding new fields
/// in future minor versions without breaking changes. Use the builder
/// pattern methods or [`Default::default()`] to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Number of connection slots.
    pub max_connections: usize,

    /// Whether operations may queue behind busy connections.
    pub pipelining: bool,

    /// Maximum queued operations on one connection before it stops
    /// receiving pipelined work.
    pub max_pipeline_depth: usize,

    /// Time allowed for opening a connection, and for waiting on an
    /// exhausted pool.
    pub connection_timeout: Duration,

    /// Buffered bytes after which the multiplexing writer stops batching
    /// and flushes.
    pub batch_threshold: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            pipelining: true,
            max_pipeline_depth: DEFAULT_MAX_PIPELINE_DEPTH,
            connection_timeout: Duration::from_secs(30),
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of connection slots.
    #[must_use]
    pub fn max_connections(mut self, count: usize) -> Self {
        self.max_connections = count;
        self
    }

    /// Enable or disable pipelining onto busy connections.
    #[must_use]
    pub fn pipelining(mut self, enabled: bool) -> Self {
        self.pipelining = enabled;
        self
    }

    /// Set the per-connection pipeline depth limit.
    #[must_use]
    pub fn max_pipeline_depth(mut self, depth: usize) -> Self {
        self.max_pipeline_depth = depth;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the multiplexing batch threshold in bytes.
    #[must_use]
    pub fn batch_threshold(mut self, bytes: usize) -> Self {
        self.batch_threshold = bytes;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Configuration(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.pipelining && self.max_pipeline_depth < 2 {
            return Err(PoolError::Configuration(
                "max_pipeline_depth must be at least 2 when pipelining".into(),
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(PoolError::Configuration(
                "connection_timeout must be greater than 0".into(),
            ));
        }
        if self.batch_threshold == 0 {
            return Err(PoolError::Configuration(
                "batch_threshold must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert!(config.pipelining);
        assert_eq!(config.max_pipeline_depth, DEFAULT_MAX_PIPELINE_DEPTH);
        assert_eq!(config.batch_threshold, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_methods() {
        let config = PoolConfig::new()
            .max_connections(4)
            .pipelining(false)
            .max_pipeline_depth(1)
            .connection_timeout(Duration::from_secs(5))
            .batch_threshold(4096);

        assert_eq!(config.max_connections, 4);
        assert!(!config.pipelining);
        assert_eq!(config.max_pipeline_depth, 1);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.batch_threshold, 4096);
        // Depth is irrelevant without pipelining.
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_max() {
        let result = PoolConfig::new().max_connections(0).validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("max_connections must be greater than 0")
        );
    }

    #[test]
    fn test_config_validation_depth() {
        let result = PoolConfig::new().max_pipeline_depth(1).validate();
        assert!(result.unwrap_err().to_string().contains("max_pipeline_depth"));
    }

    #[test]
    fn test_config_validation_zero_threshold() {
        assert!(PoolConfig::new().batch_threshold(0).validate().is_err());
        assert!(
            PoolConfig::new()
                .connection_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }
}
