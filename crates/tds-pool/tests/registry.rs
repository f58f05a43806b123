//! Pool registry tests against the mock server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use tds_client::{OperationFlags, execute_batch};
use tds_pool::{PoolConfig, PoolError, PoolKey, PoolRegistry};
use tds_testing::mock_server::{MockResponse, MockTdsServer};

#[tokio::test]
async fn test_registry_shares_sources_per_server() {
    common::init_tracing();
    let first = MockTdsServer::builder()
        .with_default_response(MockResponse::affected(1))
        .build()
        .await
        .unwrap();
    let second = MockTdsServer::builder().build().await.unwrap();
    let registry = PoolRegistry::new(PoolConfig::new().max_connections(2)).unwrap();

    let a = registry.get_or_create(&common::config_for(&first)).unwrap();
    let b = registry.get_or_create(&common::config_for(&first)).unwrap();
    let c = registry.get_or_create(&common::config_for(&second)).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(registry.len(), 2);

    let op = b.acquire(OperationFlags::empty()).await.unwrap();
    let conn = Arc::clone(op.protocol());
    op.complete();
    let summary = execute_batch(&conn, "DELETE FROM t").await.unwrap();
    assert_eq!(summary.rows_affected, 1);
    assert_eq!(a.connection_count(), 1);
    assert_eq!(first.accepted_count(), 1);
    assert_eq!(second.accepted_count(), 0);

    registry.close_all().await;
    assert!(registry.is_empty());
    assert!(a.is_closed());
    assert!(matches!(
        a.acquire(OperationFlags::empty()).await,
        Err(PoolError::PoolClosed)
    ));
}

#[tokio::test]
async fn test_closed_source_is_replaced() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let registry = PoolRegistry::new(PoolConfig::default()).unwrap();
    let config = common::config_for(&server);

    let old = registry.get_or_create(&config).unwrap();
    old.close().await;

    let new = registry.get_or_create(&config).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert!(Arc::ptr_eq(
        &new,
        &registry.get(&PoolKey::from(&config)).unwrap()
    ));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_invalid_connection_config_is_rejected() {
    let registry = PoolRegistry::new(PoolConfig::default()).unwrap();
    let config = tds_client::ConnectionConfig::new().host("");
    assert!(matches!(
        registry.get_or_create(&config),
        Err(PoolError::ConnectionCreation(_))
    ));
    assert!(registry.is_empty());
}
