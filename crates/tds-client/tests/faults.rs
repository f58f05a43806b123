//! Connection fault tests.
//!
//! A fault completes every queued operation with one shared cause and
//! leaves the connection closed to new work.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use tds_client::{
    AdmissionError, CommandContext, ConnectionState, Error, OperationFlags, OperationState,
    Outcome, Protocol, execute_batch,
};
use tds_codec::CodecError;
use tds_protocol::{ProtocolError, SqlBatch};
use tds_testing::TokenStream;
use tds_testing::mock_server::{MockColumn, MockResponse, MockTdsServer, MockValue};
use tokio_util::sync::CancellationToken;

fn start(conn: &Arc<Protocol>, sql: &str) -> CommandContext {
    CommandContext::start(
        conn,
        SqlBatch::new(sql),
        OperationFlags::empty(),
        CancellationToken::new(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_fault_is_shared_by_every_operation() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let conn = common::connect(&server).await;

    let ops: Vec<_> = (0..3)
        .map(|_| conn.try_start_operation(OperationFlags::empty()).unwrap())
        .collect();

    let cause = conn.fault(Error::ConnectionClosed);
    let again = conn.fault(Error::FlushTimeout);
    assert!(Arc::ptr_eq(&cause, &again), "only the first fault is recorded");
    assert!(Arc::ptr_eq(&cause, &conn.fault_cause().unwrap()));
    assert_eq!(conn.state(), ConnectionState::Completed);
    assert!(conn.is_idle());

    for op in &ops {
        match op.slot().outcome() {
            Some(Outcome::Faulted(shared)) => assert!(Arc::ptr_eq(shared, &cause)),
            other => panic!("unexpected outcome {other:?}"),
        }
        match op.slot().activated().await {
            Err(Error::ConnectionFaulted(shared)) => assert!(Arc::ptr_eq(&shared, &cause)),
            other => panic!("unexpected activation {other:?}"),
        }
    }

    assert_eq!(
        conn.try_start_operation(OperationFlags::empty()).unwrap_err(),
        AdmissionError::NotReady(ConnectionState::Completed)
    );
}

#[tokio::test]
async fn test_completing_after_fault_changes_nothing() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let conn = common::connect(&server).await;

    let op = conn.try_start_operation(OperationFlags::empty()).unwrap();
    let slot = Arc::clone(op.slot());
    conn.fault(Error::ConnectionClosed);

    assert!(!conn.complete(&slot, Outcome::Success));
    assert!(slot.outcome().unwrap().is_faulted());
    op.complete();
}

#[tokio::test]
async fn test_disconnect_faults_pipelined_operations() {
    let server = MockTdsServer::builder()
        .with_default_response(MockResponse::Disconnect)
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    let first = tokio::spawn(start(&conn, "SELECT 1").execute());
    let second = tokio::spawn(start(&conn, "SELECT 2").execute());

    let first = first.await.unwrap().unwrap_err();
    let second = second.await.unwrap().unwrap_err();

    let cause = conn.fault_cause().expect("connection should be faulted");
    match &first {
        Error::ConnectionFaulted(shared) => assert!(Arc::ptr_eq(shared, &cause)),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(second.is_connection_fatal(), "{second}");
    assert!(first.is_transient());
    assert_eq!(conn.state(), ConnectionState::Completed);
}

#[tokio::test]
async fn test_malformed_response_faults() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT garbage",
            MockResponse::tokens(TokenStream::new().raw(&[0x42, 0x00, 0x00])),
        )
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    let err = execute_batch(&conn, "SELECT garbage").await.unwrap_err();
    assert!(
        matches!(
            err.root(),
            Error::Codec(CodecError::Protocol(ProtocolError::InvalidTokenType(0x42)))
        ),
        "{err}"
    );
    assert_eq!(conn.state(), ConnectionState::Completed);
    assert!(execute_batch(&conn, "SELECT 1").await.is_err());
}

#[tokio::test]
async fn test_server_error_is_not_a_fault() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT * FROM missing",
            MockResponse::error(208, "Invalid object name 'missing'."),
        )
        .with_response("SELECT 1", MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    let err = execute_batch(&conn, "SELECT * FROM missing").await.unwrap_err();
    assert!(err.is_server_error(208), "{err}");
    assert!(!err.is_connection_fatal());
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert!(conn.fault_cause().is_none());

    let summary = execute_batch(&conn, "SELECT 1").await.unwrap();
    assert_eq!(summary.rows_affected, 1);
}

#[tokio::test]
async fn test_flush_timeout_faults() {
    common::init_tracing();
    let server = MockTdsServer::builder()
        .with_response("HANG", MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let (local, remote) = tokio::io::duplex(1024);
    server.attach(remote).unwrap();

    let config = common::config_for(&server).flush_timeout(Duration::from_millis(100));
    let conn = Protocol::connect(local, &config).await.unwrap();

    // The server stops reading after this one.
    let hung = start(&conn, "HANG");
    tokio::time::timeout(Duration::from_secs(1), async {
        while server.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let large = "SELECT 1 -- ".to_owned() + &"x".repeat(64 * 1024);
    let err = tokio::time::timeout(Duration::from_secs(5), start(&conn, &large).execute())
        .await
        .expect("flush was not bounded")
        .unwrap_err();

    assert!(matches!(err.root(), Error::FlushTimeout), "{err}");
    assert!(matches!(
        conn.fault_cause().as_deref(),
        Some(Error::FlushTimeout)
    ));
    assert!(hung.operation().slot().outcome().unwrap().is_faulted());
}

#[tokio::test]
async fn test_flush_timeout_wakes_the_active_reader() {
    let server = MockTdsServer::builder()
        .with_response("HANG", MockResponse::Hang)
        .build()
        .await
        .unwrap();
    let (local, remote) = tokio::io::duplex(1024);
    server.attach(remote).unwrap();

    let config = common::config_for(&server).flush_timeout(Duration::from_millis(100));
    let conn = Protocol::connect(local, &config).await.unwrap();

    let hung = start(&conn, "HANG");
    tokio::time::timeout(Duration::from_secs(1), async {
        while server.requests().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // Hand the token stream to the next command while the server is stuck.
    assert!(conn.complete(hung.operation().slot(), Outcome::Success));

    let large = "SELECT 1 -- ".to_owned() + &"x".repeat(64 * 1024);
    let ctx = start(&conn, &large);
    assert_eq!(ctx.operation().slot().state(), OperationState::Activated);

    let err = tokio::time::timeout(Duration::from_secs(5), ctx.execute())
        .await
        .expect("reader stayed blocked after the connection faulted")
        .unwrap_err();
    assert!(matches!(err, Error::WriteFailed(_)), "{err}");
    assert!(matches!(err.root(), Error::FlushTimeout), "{err}");
    assert!(matches!(
        conn.fault_cause().as_deref(),
        Some(Error::FlushTimeout)
    ));
}

#[tokio::test]
async fn test_dropping_unread_response_faults() {
    let server = MockTdsServer::builder()
        .with_response(
            "SELECT id FROM t",
            MockResponse::rows(
                vec![MockColumn::int("id")],
                vec![vec![MockValue::Int(1)], vec![MockValue::Int(2)]],
            ),
        )
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    let mut ctx = start(&conn, "SELECT id FROM t");
    let queued = conn.try_start_operation(OperationFlags::empty()).unwrap();
    let mut reader = ctx.read().await.unwrap();
    {
        let mut row = reader.next_row().await.unwrap().unwrap();
        assert_eq!(row.column(0).await.unwrap().as_deref(), Some(&1i32.to_le_bytes()[..]));
    }
    drop(reader);
    drop(ctx);

    let cause = conn.fault_cause().expect("abandoned response should fault");
    assert!(matches!(*cause, Error::Canceled));
    assert!(queued.slot().outcome().unwrap().is_faulted());
}

#[tokio::test]
async fn test_dropping_idle_operation_hands_over() {
    let server = MockTdsServer::builder().build().await.unwrap();
    let conn = common::connect(&server).await;

    let first = conn.try_start_operation(OperationFlags::empty()).unwrap();
    let second = conn.try_start_operation(OperationFlags::empty()).unwrap();
    drop(first);

    second.slot().activated().await.unwrap();
    assert!(conn.fault_cause().is_none());
    second.complete();
    assert!(conn.is_idle());
}
