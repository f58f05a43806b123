//! Opening connections for pool slots.

use std::sync::Arc;

use async_trait::async_trait;
use tds_client::{ConnectionConfig, Protocol, Result};

/// Opens logged-in connections for a [`ConnectionSource`](crate::ConnectionSource).
///
/// `#[async_trait]` keeps the trait object safe; the source holds it as
/// `Arc<dyn ConnectionFactory>`.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open one connection.
    async fn connect(&self) -> Result<Arc<Protocol>>;
}

/// Opens connections over TCP with a fixed configuration.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    config: ConnectionConfig,
}

impl TcpConnector {
    /// Create a connector for `config`.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// The connection configuration.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnector {
    async fn connect(&self) -> Result<Arc<Protocol>> {
        Protocol::open(&self.config).await
    }
}
