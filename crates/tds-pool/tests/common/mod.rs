//! Shared helpers for pool tests against the mock server.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tds_client::{ConnectionConfig, Error, Protocol, Result};
use tds_pool::{ConnectionFactory, TcpConnector};
use tds_testing::fixtures;
use tds_testing::mock_server::MockTdsServer;

/// Client configuration pointed at `server`.
pub fn config_for(server: &MockTdsServer) -> ConnectionConfig {
    ConnectionConfig::new()
        .host(server.host())
        .port(server.port())
        .connect_timeout(Duration::from_secs(5))
        .flush_timeout(Duration::from_secs(5))
        .prelogin(fixtures::prelogin_body())
        .login7(fixtures::login7_body())
}

/// A TCP connector that counts attempts, and can fail or stall them.
pub struct CountingConnector {
    inner: TcpConnector,
    attempts: AtomicUsize,
    failures: AtomicUsize,
    delay: Duration,
}

impl CountingConnector {
    pub fn new(server: &MockTdsServer) -> Arc<Self> {
        Self::build(server, 0, Duration::ZERO)
    }

    /// Fail the first `failures` attempts.
    pub fn failing(server: &MockTdsServer, failures: usize) -> Arc<Self> {
        Self::build(server, failures, Duration::ZERO)
    }

    /// Wait `delay` before each attempt.
    pub fn delayed(server: &MockTdsServer, delay: Duration) -> Arc<Self> {
        Self::build(server, 0, delay)
    }

    fn build(server: &MockTdsServer, failures: usize, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: TcpConnector::new(config_for(server)),
            attempts: AtomicUsize::new(0),
            failures: AtomicUsize::new(failures),
            delay,
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for CountingConnector {
    async fn connect(&self) -> Result<Arc<Protocol>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "refused by test connector",
            )));
        }
        self.inner.connect().await
    }
}

/// Install a test subscriber once, honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}
