//! # tds-testing
//!
//! Test infrastructure for the TDS engine.
//!
//! ## Features
//!
//! - Mock TDS server for end-to-end tests (no database required)
//! - Token stream fixtures for reader and codec tests
//! - Request log for asserting what a client put on the wire
//!
//! ## Mock Server Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockColumn, MockResponse, MockTdsServer, MockValue};
//!
//! #[tokio::test]
//! async fn test_with_mock_server() {
//!     let server = MockTdsServer::builder()
//!         .with_response(
//!             "SELECT * FROM users WHERE id = 1",
//!             MockResponse::rows(
//!                 vec![MockColumn::int("id"), MockColumn::nvarchar("name", 50)],
//!                 vec![vec![MockValue::Int(1), MockValue::from("Alice")]],
//!             ),
//!         )
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     // Connect your client to server.addr()
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod fixtures;
pub mod mock_server;

pub use fixtures::TokenStream;
pub use mock_server::{
    MockColumn, MockRequest, MockResponse, MockServerBuilder, MockServerConfig, MockServerError,
    MockTdsServer, MockValue, RpcProcedure,
};
