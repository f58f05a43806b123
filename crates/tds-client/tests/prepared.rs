//! Prepared statement tests.
//!
//! Statement preparation through `sp_prepexec`, reuse by handle, handle
//! release on eviction, and session state carried into requests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;

use tds_client::{
    CommandExecution, ConnectionState, Parameter, ParameterArena, ParameterCache,
    ParameterContext, PreparationState, Protocol, execute_batch,
};
use tds_protocol::{DoneStatus, ProcId};
use tds_testing::TokenStream;
use tds_testing::mock_server::{MockColumn, MockRequest, MockResponse, MockTdsServer, MockValue};

fn no_params() -> Arc<ParameterContext> {
    Arc::new(ParameterContext::empty(&ParameterArena::new(4)))
}

fn procs(server: &MockTdsServer) -> Vec<ProcId> {
    server.requests().iter().filter_map(MockRequest::proc_id).collect()
}

async fn run(conn: &Arc<Protocol>, sql: &str) -> u64 {
    CommandExecution::new(conn, sql, no_params())
        .execute()
        .await
        .unwrap()
        .rows_affected
}

#[tokio::test]
async fn test_prepare_then_execute_by_handle() {
    let sql = "UPDATE t SET x = @p1 WHERE id = @p2";
    let server = MockTdsServer::builder()
        .with_response(sql, MockResponse::affected(4))
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;
    let cache = ParameterCache::new(ParameterArena::new(8), 16);

    let params = cache
        .get_or_build(&[Parameter::new("p1", 10i32), Parameter::new("p2", 7i32)])
        .unwrap();
    let mut first = CommandExecution::new(&conn, sql, Arc::clone(&params));
    assert_eq!(first.preparation(), PreparationState::Unprepared);
    assert!(!first.statement().is_complete());
    let summary = first.execute().await.unwrap();
    assert_eq!(summary.rows_affected, 4);
    assert_eq!(summary.return_status, Some(0));

    let statement = conn.statement(sql);
    assert!(statement.is_complete());
    assert_eq!(statement.handle(), Some(1));

    let mut second = CommandExecution::new(&conn, sql, params);
    second.request();
    assert_eq!(second.preparation(), PreparationState::Prepared);
    assert_eq!(second.execute().await.unwrap().rows_affected, 4);

    assert_eq!(procs(&server), vec![ProcId::PrepExec, ProcId::Execute]);
    let requests = server.requests();
    assert_eq!(requests[1].handle(), Some(1));
    match &requests[0] {
        MockRequest::Rpc { params, .. } => {
            // statement handle, parameter declarations, text, then values
            assert_eq!(params.len(), 5);
            assert_eq!(params[3].name, "@p1");
        }
        other => panic!("unexpected request {other:?}"),
    }
}

#[tokio::test]
async fn test_eviction_releases_handle_before_next_prepare() {
    let server = MockTdsServer::builder()
        .with_response("SELECT a", MockResponse::scalar_int(1))
        .with_response("SELECT b", MockResponse::scalar_int(2))
        .build()
        .await
        .unwrap();
    let config = common::config_for(&server).statement_cache_size(1);
    let conn = Protocol::open(&config).await.unwrap();

    assert_eq!(run(&conn, "SELECT a").await, 1);
    assert_eq!(run(&conn, "SELECT b").await, 1);
    assert_eq!(conn.cached_statements(), 1);
    assert!(conn.take_retired().is_empty());

    assert_eq!(
        procs(&server),
        vec![ProcId::PrepExec, ProcId::Unprepare, ProcId::PrepExec]
    );
    assert_eq!(server.requests()[1].handle(), Some(1));
}

#[tokio::test]
async fn test_disabled_table_executes_text() {
    let server = MockTdsServer::builder()
        .with_response("SELECT a", MockResponse::scalar_int(1))
        .build()
        .await
        .unwrap();
    let config = common::config_for(&server).statement_cache_size(0);
    let conn = Protocol::open(&config).await.unwrap();

    let mut exec = CommandExecution::new(&conn, "SELECT a", no_params());
    exec.request();
    assert_eq!(exec.preparation(), PreparationState::Unprepared);
    exec.execute().await.unwrap();
    run(&conn, "SELECT a").await;

    assert_eq!(conn.cached_statements(), 0);
    assert_eq!(procs(&server), vec![ProcId::ExecuteSql, ProcId::ExecuteSql]);
    assert_eq!(server.requests()[0].sql().as_deref(), Some("SELECT a"));
}

#[tokio::test]
async fn test_duplicate_prepare_retires_second_handle() {
    let sql = "SELECT c FROM t";
    let server = MockTdsServer::builder()
        .with_response(sql, MockResponse::scalar_int(3))
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    // Both start before either response is read.
    let first = tokio::spawn(CommandExecution::new(&conn, sql, no_params()).execute());
    let second = tokio::spawn(CommandExecution::new(&conn, sql, no_params()).execute());
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(conn.statement(sql).handle(), Some(1));

    run(&conn, sql).await;
    assert_eq!(
        procs(&server),
        vec![
            ProcId::PrepExec,
            ProcId::PrepExec,
            ProcId::Unprepare,
            ProcId::Execute
        ]
    );
    let requests = server.requests();
    assert_eq!(requests[2].handle(), Some(2));
    assert_eq!(requests[3].handle(), Some(1));
}

#[tokio::test]
async fn test_failed_prepare_stays_unprepared() {
    let sql = "SELECT * FROM missing";
    let server = MockTdsServer::builder()
        .with_response(sql, MockResponse::error(208, "Invalid object name 'missing'."))
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    for _ in 0..2 {
        let err = CommandExecution::new(&conn, sql, no_params())
            .execute()
            .await
            .unwrap_err();
        assert!(err.is_server_error(208), "{err}");
    }
    assert!(!conn.statement(sql).is_complete());
    assert_eq!(procs(&server), vec![ProcId::PrepExec, ProcId::PrepExec]);
    assert_eq!(conn.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_rows_are_read_column_by_column() {
    let sql = "SELECT id, name FROM users WHERE active = @active";
    let server = MockTdsServer::builder()
        .with_response(
            sql,
            MockResponse::rows(
                vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
                vec![
                    vec![MockValue::Int(1), MockValue::from("Ada")],
                    vec![MockValue::Int(2), MockValue::Null],
                ],
            ),
        )
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    let arena = ParameterArena::new(4);
    let params = Arc::new(
        ParameterContext::build(&arena, &[Parameter::new("active", true)]).unwrap(),
    );
    let mut exec = CommandExecution::new(&conn, sql, params);
    let (ctx, mut reader) = exec.start().await.unwrap();

    let mut ids = Vec::new();
    let mut names = Vec::new();
    while let Some(mut row) = reader.next_row().await.unwrap() {
        assert_eq!(row.column_count(), 2);
        let id = row.column(0).await.unwrap().unwrap();
        ids.push(i32::from_le_bytes(id[..4].try_into().unwrap()));
        names.push(row.column(1).await.unwrap());
    }
    assert!(reader.is_finished());
    let summary = ctx.finish(reader).await.unwrap();

    assert_eq!(ids, vec![1, 2]);
    assert_eq!(names[0].as_deref(), Some(&b"A\0d\0a\0"[..]));
    assert_eq!(names[1], None);
    assert_eq!(summary.rows_affected, 2);
    assert_eq!(summary.return_values.len(), 1);
    assert!(conn.statement(sql).is_complete());
    assert_eq!(arena.outstanding(), 1);
}

#[tokio::test]
async fn test_transaction_descriptor_follows_session() {
    let server = MockTdsServer::builder()
        .with_response(
            "BEGIN TRAN",
            MockResponse::tokens(
                TokenStream::new()
                    .begin_transaction(0x0000_0001_0000_00AB)
                    .done(DoneStatus::empty(), 0),
            ),
        )
        .with_response(
            "COMMIT",
            MockResponse::tokens(
                TokenStream::new()
                    .commit_transaction(0x0000_0001_0000_00AB)
                    .done(DoneStatus::empty(), 0),
            ),
        )
        .build()
        .await
        .unwrap();
    let conn = common::connect(&server).await;

    execute_batch(&conn, "BEGIN TRAN").await.unwrap();
    assert_eq!(conn.transaction_descriptor(), 0x0000_0001_0000_00AB);
    run(&conn, "UPDATE t SET x = 1").await;
    execute_batch(&conn, "COMMIT").await.unwrap();
    assert_eq!(conn.transaction_descriptor(), 0);
    execute_batch(&conn, "SELECT 1").await.unwrap();

    let descriptors: Vec<u64> = server.requests().iter().map(MockRequest::transaction).collect();
    assert_eq!(
        descriptors,
        vec![0, 0x0000_0001_0000_00AB, 0x0000_0001_0000_00AB, 0]
    );
}
