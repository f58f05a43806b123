//! # tds-client
//!
//! A TDS connection shared by many logical commands.
//!
//! ## Operations
//!
//! Every use of a connection is an [`Operation`]: admitted under a short
//! lock, queued in FIFO order, activated when it reaches the head of the
//! queue, and completed exactly once. Requests are written in queue order
//! independently of activation, so several can be in flight (pipelined)
//! behind the response currently being read.
//!
//! ```text
//! try_start_operation ─▶ Pending ─▶ Activated ─▶ Completed
//!                           │                       ▲
//!                           └── canceled / faulted ─┘
//! ```
//!
//! ## Connection state
//!
//! ```text
//! Created -> Ready -> Draining -> Completed
//! ```
//!
//! A fault (parse failure, flush timeout, abandoned response) moves the
//! connection straight to `Completed` and fails every queued operation with
//! the same shared cause.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_client::{ConnectionConfig, Protocol, command::execute_batch};
//!
//! let config = ConnectionConfig::new()
//!     .host("localhost")
//!     .prelogin(prelogin_body)
//!     .login7(login_body);
//! let conn = Protocol::open(&config).await?;
//!
//! let summary = execute_batch(&conn, "UPDATE t SET x = 1").await?;
//! println!("{} rows", summary.rows_affected);
//!
//! conn.close().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod command;
pub mod config;
pub mod error;
pub mod operation;
pub mod parameters;
pub mod protocol;
pub mod results;
pub mod state;
pub mod statement_cache;

pub use command::{
    CommandContext, CommandExecution, IoCompletionPair, PreparationState, execute_batch,
};
pub use config::ConnectionConfig;
pub use error::{AdmissionError, Error, Result};
pub use operation::{Operation, OperationFlags, OperationSlot, OperationState, Outcome};
pub use parameters::{
    Parameter, ParameterArena, ParameterCache, ParameterContext, ParameterValue,
    ResolvedParameter,
};
pub use protocol::Protocol;
pub use results::{CommandReader, CommandSummary};
pub use state::ConnectionState;
pub use statement_cache::{Statement, StatementCache, StatementKind};
pub use tokio_util::sync::CancellationToken;
