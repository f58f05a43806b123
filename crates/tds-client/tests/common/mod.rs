//! Shared helpers for tests against the mock server.

#![allow(dead_code, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use tds_client::{ConnectionConfig, Protocol};
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

/// Open a logged-in connection to `server`.
pub async fn connect(server: &MockTdsServer) -> Arc<Protocol> {
    Protocol::open(&config_for(server)).await.unwrap()
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
