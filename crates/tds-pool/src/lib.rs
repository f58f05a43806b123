//! # tds-pool
//!
//! Spreading operations over a fixed number of pipelined TDS connections.
//!
//! A [`ConnectionSource`] owns an array of connection slots. Each request
//! goes to the first match of:
//!
//! 1. an idle connection that can start it immediately,
//! 2. with pipelining, the least-loaded busy connection below the depth limit,
//! 3. an empty or reclaimable slot, filled with a new connection.
//!
//! Otherwise the pool is exhausted. [`MultiplexingWriter`] puts one queue in
//! front of a source and batches writes across connections, and
//! [`PoolRegistry`] shares sources between callers with equal connection
//! parameters.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_client::{ConnectionConfig, OperationFlags};
//! use tds_pool::{PoolConfig, PoolRegistry};
//!
//! let registry = PoolRegistry::new(PoolConfig::new().max_connections(4))?;
//! let source = registry.get_or_create(&connection_config)?;
//!
//! let op = source.acquire(OperationFlags::empty()).await?;
//! // Write a request on op.protocol(), read the response, then:
//! op.complete();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connector;
pub mod error;
pub mod multiplexing;
pub mod registry;
pub mod source;

pub use config::PoolConfig;
pub use connector::{ConnectionFactory, TcpConnector};
pub use error::PoolError;
pub use multiplexing::MultiplexingWriter;
pub use registry::{PoolKey, PoolRegistry};
pub use source::ConnectionSource;
