//! Mock TDS server for unit testing.
//!
//! A scripted server that speaks enough of the protocol to exercise a
//! client end to end without a real database instance.
//!
//! ## Features
//!
//! - PreLogin and Login7 handshake (or a scripted login failure)
//! - Responses keyed by SQL text, for batches and `sp_executesql`
//! - Prepared statements: `sp_prepexec` hands out handles, `sp_execute`
//!   runs them, `sp_unprepare` releases them
//! - Attention acknowledgement, including while a response is delayed
//! - Stalls, hangs and disconnects for failure tests
//! - A log of every request received
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_testing::mock_server::{MockTdsServer, MockResponse};
//!
//! #[tokio::test]
//! async fn test_query() {
//!     let server = MockTdsServer::builder()
//!         .with_response("SELECT 1", MockResponse::scalar_int(1))
//!         .build()
//!         .await
//!         .unwrap();
//!
//!     let addr = server.addr();
//!     // Connect your client to addr...
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tds_codec::{CodecError, Message, MessageAssembler, TdsCodec};
use tds_protocol::token::read_value;
use tds_protocol::{
    ColumnData, DEFAULT_PACKET_SIZE, DoneStatus, PacketType, ProcId, ProtocolError, RpcParam,
    TypeId, TypeInfo,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;

use crate::fixtures::{self, TokenStream};

/// Error type for mock server operations.
#[derive(Debug, Error)]
pub enum MockServerError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet framing error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed request.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server already stopped.
    #[error("server already stopped")]
    Stopped,
}

impl From<ProtocolError> for MockServerError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

/// Result type for mock server operations.
pub type Result<T> = std::result::Result<T, MockServerError>;

// =============================================================================
// Responses
// =============================================================================

/// A column value in a scripted result set.
#[derive(Debug, Clone, PartialEq)]
pub enum MockValue {
    /// NULL.
    Null,
    /// BIT.
    Bool(bool),
    /// INT.
    Int(i32),
    /// BIGINT.
    BigInt(i64),
    /// FLOAT.
    Float(f64),
    /// NVARCHAR.
    String(String),
    /// VARBINARY.
    Binary(Bytes),
}

impl MockValue {
    /// Wire bytes without the length prefix; `None` for NULL.
    #[must_use]
    pub fn encode(&self) -> Option<Bytes> {
        match self {
            Self::Null => None,
            Self::Bool(v) => Some(Bytes::copy_from_slice(&[u8::from(*v)])),
            Self::Int(v) => Some(Bytes::copy_from_slice(&v.to_le_bytes())),
            Self::BigInt(v) => Some(Bytes::copy_from_slice(&v.to_le_bytes())),
            Self::Float(v) => Some(Bytes::copy_from_slice(&v.to_le_bytes())),
            Self::String(s) => Some(s.encode_utf16().flat_map(u16::to_le_bytes).collect()),
            Self::Binary(b) => Some(b.clone()),
        }
    }
}

impl From<i32> for MockValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for MockValue {
    fn from(v: i64) -> Self {
        Self::BigInt(v)
    }
}

impl From<bool> for MockValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for MockValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for MockValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// A column in a scripted result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockColumn {
    /// Column name.
    pub name: String,
    /// Wire type.
    pub type_info: TypeInfo,
}

impl MockColumn {
    /// An `INT` column.
    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, TypeInfo::nullable(TypeId::IntN, 4))
    }

    /// A `BIGINT` column.
    pub fn bigint(name: impl Into<String>) -> Self {
        Self::new(name, TypeInfo::nullable(TypeId::IntN, 8))
    }

    /// A `BIT` column.
    pub fn bit(name: impl Into<String>) -> Self {
        Self::new(name, TypeInfo::nullable(TypeId::BitN, 1))
    }

    /// A `FLOAT` column.
    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, TypeInfo::nullable(TypeId::FloatN, 8))
    }

    /// An `NVARCHAR(n)` column, `n` in characters.
    pub fn nvarchar(name: impl Into<String>, max_chars: u16) -> Self {
        Self::new(name, TypeInfo::nvarchar(max_chars.saturating_mul(2)))
    }

    /// An `NVARCHAR(MAX)` column.
    pub fn nvarchar_max(name: impl Into<String>) -> Self {
        Self::new(name, TypeInfo::nvarchar(0xFFFF))
    }

    /// A `VARBINARY(n)` column.
    pub fn varbinary(name: impl Into<String>, max_bytes: u16) -> Self {
        Self::new(name, TypeInfo::varbinary(max_bytes))
    }

    fn new(name: impl Into<String>, type_info: TypeInfo) -> Self {
        Self {
            name: name.into(),
            type_info,
        }
    }

    fn to_column_data(&self) -> ColumnData {
        ColumnData::new(self.name.clone(), self.type_info.clone())
    }
}

/// Mock response configuration.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// A bare DONE.
    Empty,

    /// A counted DONE.
    RowsAffected(u64),

    /// A result set.
    Rows {
        /// Column definitions.
        columns: Vec<MockColumn>,
        /// Row data.
        rows: Vec<Vec<MockValue>>,
    },

    /// An ERROR followed by a failed DONE.
    Error {
        /// Error number.
        number: i32,
        /// Severity class.
        class: u8,
        /// Error message.
        message: String,
    },

    /// Pre-encoded tokens, sent verbatim with no terminator added.
    Tokens(Bytes),

    /// The inner response after a delay. An attention during the delay
    /// replaces it with the acknowledgement.
    Delayed(Duration, Box<MockResponse>),

    /// Never answer; only an attention ends the wait.
    Stall,

    /// Stop reading and writing on the connection.
    Hang,

    /// Close the connection instead of answering.
    Disconnect,
}

impl MockResponse {
    /// A bare DONE.
    #[must_use]
    pub fn empty() -> Self {
        Self::Empty
    }

    /// A counted DONE.
    #[must_use]
    pub fn affected(rows: u64) -> Self {
        Self::RowsAffected(rows)
    }

    /// A single-column, single-row `INT` result.
    #[must_use]
    pub fn scalar_int(value: i32) -> Self {
        Self::rows(vec![MockColumn::int("")], vec![vec![MockValue::Int(value)]])
    }

    /// A single-column, single-row `NVARCHAR` result.
    #[must_use]
    pub fn scalar_string(value: &str) -> Self {
        Self::rows(
            vec![MockColumn::nvarchar("", 4000)],
            vec![vec![MockValue::from(value)]],
        )
    }

    /// A result set.
    #[must_use]
    pub fn rows(columns: Vec<MockColumn>, rows: Vec<Vec<MockValue>>) -> Self {
        Self::Rows { columns, rows }
    }

    /// A severity 16 error.
    pub fn error(number: i32, message: impl Into<String>) -> Self {
        Self::Error {
            number,
            class: 16,
            message: message.into(),
        }
    }

    /// Verbatim tokens.
    #[must_use]
    pub fn tokens(stream: TokenStream) -> Self {
        Self::Tokens(stream.into_bytes())
    }

    /// `response` after `delay`.
    #[must_use]
    pub fn delayed(delay: Duration, response: MockResponse) -> Self {
        Self::Delayed(delay, Box::new(response))
    }

    fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Encode as the response to a batch (`rpc == false`) or an RPC.
    ///
    /// RPC responses close the statement with DONEINPROC and end with
    /// RETURNSTATUS, the prepared handle if any, and DONEPROC.
    fn encode(&self, rpc: bool, handle: Option<i32>) -> Bytes {
        let (stream, status, count) = match self {
            Self::Tokens(bytes) => return bytes.clone(),
            Self::RowsAffected(n) => (TokenStream::new(), DoneStatus::COUNT, *n),
            Self::Rows { columns, rows } => {
                let types: Vec<TypeInfo> = columns.iter().map(|c| c.type_info.clone()).collect();
                let mut stream =
                    TokenStream::new().columns(columns.iter().map(MockColumn::to_column_data).collect());
                for row in rows {
                    let values: Vec<Option<Bytes>> = row.iter().map(MockValue::encode).collect();
                    let refs: Vec<Option<&[u8]>> = values.iter().map(Option::as_deref).collect();
                    stream = stream.row(&types, &refs);
                }
                (stream, DoneStatus::COUNT, rows.len() as u64)
            }
            Self::Error {
                number,
                class,
                message,
            } => (
                TokenStream::new().error(*number, *class, message),
                DoneStatus::ERROR,
                0,
            ),
            Self::Empty
            | Self::Delayed(..)
            | Self::Stall
            | Self::Hang
            | Self::Disconnect => (TokenStream::new(), DoneStatus::empty(), 0),
        };

        if !rpc {
            return stream.done(status, count).into_bytes();
        }
        let failed = status.contains(DoneStatus::ERROR);
        let mut stream = stream
            .done_in_proc(status | DoneStatus::MORE, count)
            .return_status(i32::from(failed));
        if let Some(handle) = handle {
            stream = stream.return_int(0, "@handle", handle);
        }
        let final_status = if failed {
            DoneStatus::ERROR
        } else {
            DoneStatus::empty()
        };
        stream.done_proc(final_status, 0).into_bytes()
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Procedure targeted by an RPC request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcProcedure {
    /// Well-known procedure.
    Id(ProcId),
    /// Named procedure.
    Name(String),
}

/// A request received by the mock server.
#[derive(Debug, Clone, PartialEq)]
pub enum MockRequest {
    /// SQL batch.
    Batch {
        /// SQL text.
        sql: String,
        /// Transaction descriptor from ALL_HEADERS.
        transaction: u64,
    },
    /// Remote procedure call.
    Rpc {
        /// Target procedure.
        procedure: RpcProcedure,
        /// Parameters in wire order.
        params: Vec<RpcParam>,
        /// Transaction descriptor from ALL_HEADERS.
        transaction: u64,
    },
    /// Attention signal.
    Attention,
}

impl MockRequest {
    /// Decode a client message.
    pub fn decode(message: &Message) -> Result<Self> {
        let mut src = &message.payload[..];
        match message.packet_type {
            PacketType::Attention => Ok(Self::Attention),
            PacketType::SqlBatch => {
                let transaction = read_all_headers(&mut src)?;
                Ok(Self::Batch {
                    sql: utf16(src)?,
                    transaction,
                })
            }
            PacketType::Rpc => {
                let transaction = read_all_headers(&mut src)?;
                ensure(src, 2)?;
                let procedure = match src.get_u16_le() {
                    0xFFFF => {
                        ensure(src, 2)?;
                        RpcProcedure::Id(proc_id(src.get_u16_le())?)
                    }
                    chars => {
                        let len = usize::from(chars) * 2;
                        ensure(src, len)?;
                        let name = utf16(&src[..len])?;
                        src.advance(len);
                        RpcProcedure::Name(name)
                    }
                };
                ensure(src, 2)?;
                let _options = src.get_u16_le();

                let mut params = Vec::new();
                while src.has_remaining() {
                    params.push(read_param(&mut src)?);
                }
                Ok(Self::Rpc {
                    procedure,
                    params,
                    transaction,
                })
            }
            other => Err(MockServerError::Protocol(format!(
                "unexpected packet type {other:?}"
            ))),
        }
    }

    /// The well-known procedure of an RPC.
    #[must_use]
    pub fn proc_id(&self) -> Option<ProcId> {
        match self {
            Self::Rpc {
                procedure: RpcProcedure::Id(id),
                ..
            } => Some(*id),
            _ => None,
        }
    }

    /// SQL text of a batch, `sp_executesql` or `sp_prepexec`.
    #[must_use]
    pub fn sql(&self) -> Option<String> {
        match self {
            Self::Batch { sql, .. } => Some(sql.clone()),
            Self::Rpc { params, .. } => {
                let index = match self.proc_id()? {
                    ProcId::ExecuteSql => 0,
                    ProcId::PrepExec => 2,
                    _ => return None,
                };
                let value = params.get(index)?.value.as_deref()?;
                utf16(value).ok()
            }
            Self::Attention => None,
        }
    }

    /// Handle passed to `sp_execute` or `sp_unprepare`.
    #[must_use]
    pub fn handle(&self) -> Option<i32> {
        match (self.proc_id()?, self) {
            (ProcId::Execute | ProcId::Unprepare, Self::Rpc { params, .. }) => {
                let bytes: [u8; 4] = params.first()?.value.as_deref()?.try_into().ok()?;
                Some(i32::from_le_bytes(bytes))
            }
            _ => None,
        }
    }

    /// Transaction descriptor the request was sent under.
    #[must_use]
    pub fn transaction(&self) -> u64 {
        match self {
            Self::Batch { transaction, .. } | Self::Rpc { transaction, .. } => *transaction,
            Self::Attention => 0,
        }
    }
}

fn ensure(src: &[u8], n: usize) -> Result<()> {
    if src.len() < n {
        return Err(MockServerError::Protocol(format!(
            "truncated request: need {n} bytes, have {}",
            src.len()
        )));
    }
    Ok(())
}

fn utf16(bytes: &[u8]) -> Result<String> {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| MockServerError::Protocol(e.to_string()))
}

fn proc_id(id: u16) -> Result<ProcId> {
    Ok(match id {
        0x000A => ProcId::ExecuteSql,
        0x000B => ProcId::Prepare,
        0x000C => ProcId::Execute,
        0x000D => ProcId::PrepExec,
        0x000F => ProcId::Unprepare,
        other => {
            return Err(MockServerError::Protocol(format!(
                "unsupported procedure id {other:#06x}"
            )));
        }
    })
}

/// Skip ALL_HEADERS, returning the transaction descriptor it carries.
fn read_all_headers(src: &mut &[u8]) -> Result<u64> {
    ensure(src, 4)?;
    let total = src.get_u32_le() as usize;
    let body_len = total.saturating_sub(4);
    ensure(src, body_len)?;
    let mut headers = &src[..body_len];
    src.advance(body_len);

    let mut transaction = 0;
    while headers.len() >= 6 {
        let len = headers.get_u32_le() as usize;
        let header_type = headers.get_u16_le();
        let body = len.saturating_sub(6).min(headers.len());
        if header_type == 0x0002 && body >= 8 {
            transaction = u64::from_le_bytes(headers[..8].try_into().unwrap_or_default());
        }
        headers.advance(body);
    }
    Ok(transaction)
}

fn read_param(src: &mut &[u8]) -> Result<RpcParam> {
    ensure(src, 1)?;
    let len = usize::from(src.get_u8()) * 2;
    ensure(src, len)?;
    let name = utf16(&src[..len])?;
    src.advance(len);
    ensure(src, 1)?;
    let flags = src.get_u8();
    let type_info = TypeInfo::decode(src)?;
    let value = read_value(src, type_info.length_kind)?;

    let mut param = RpcParam::new(name, type_info, value);
    if flags & 0x01 != 0 {
        param = param.as_output();
    }
    Ok(param)
}

// =============================================================================
// Server
// =============================================================================

/// Mock server configuration.
#[derive(Debug, Clone)]
pub struct MockServerConfig {
    /// Responses keyed by SQL text.
    pub responses: HashMap<String, MockResponse>,
    /// Response for SQL with no entry.
    pub default_response: MockResponse,
    /// Server name reported in LOGINACK.
    pub server_name: String,
    /// Database reported at login.
    pub database: String,
    /// Packet size granted at login.
    pub packet_size: usize,
    /// Error number and message to fail every login with.
    pub login_failure: Option<(i32, String)>,
}

impl MockServerConfig {
    fn response_for(&self, sql: &str) -> MockResponse {
        self.responses
            .get(sql)
            .cloned()
            .unwrap_or_else(|| self.default_response.clone())
    }
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            responses: HashMap::new(),
            default_response: MockResponse::empty(),
            server_name: "MockSQLServer".to_string(),
            database: "master".to_string(),
            packet_size: DEFAULT_PACKET_SIZE,
            login_failure: None,
        }
    }
}

/// Builder for configuring a mock server.
#[derive(Debug, Default)]
pub struct MockServerBuilder {
    config: MockServerConfig,
}

impl MockServerBuilder {
    /// Create a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response for a specific SQL text.
    #[must_use]
    pub fn with_response(mut self, sql: impl Into<String>, response: MockResponse) -> Self {
        self.config.responses.insert(sql.into(), response);
        self
    }

    /// Set the response for unmatched SQL.
    #[must_use]
    pub fn with_default_response(mut self, response: MockResponse) -> Self {
        self.config.default_response = response;
        self
    }

    /// Set the server name reported in LOGINACK.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    /// Set the database reported at login.
    #[must_use]
    pub fn with_database(mut self, db: impl Into<String>) -> Self {
        self.config.database = db.into();
        self
    }

    /// Set the packet size granted at login.
    #[must_use]
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.config.packet_size = size;
        self
    }

    /// Reject every login with an ERROR.
    #[must_use]
    pub fn with_login_failure(mut self, number: i32, message: impl Into<String>) -> Self {
        self.config.login_failure = Some((number, message.into()));
        self
    }

    /// The configuration built so far.
    #[must_use]
    pub fn config(self) -> MockServerConfig {
        self.config
    }

    /// Build and start the mock server.
    pub async fn build(self) -> Result<MockTdsServer> {
        MockTdsServer::start(self.config).await
    }
}

struct Shared {
    config: MockServerConfig,
    requests: Mutex<Vec<MockRequest>>,
    connections: AtomicUsize,
    accepted: AtomicUsize,
    stopped: AtomicBool,
}

impl Shared {
    fn record(&self, request: &MockRequest) {
        tracing::trace!(?request, "mock server received request");
        self.requests.lock().push(request.clone());
    }
}

/// A mock TDS server for testing.
///
/// Listens on an ephemeral localhost port; [`attach`](Self::attach) serves
/// any other stream, such as one end of an in-memory duplex.
pub struct MockTdsServer {
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    shared: Arc<Shared>,
}

impl MockTdsServer {
    /// Create a new builder for the mock server.
    #[must_use]
    pub fn builder() -> MockServerBuilder {
        MockServerBuilder::new()
    }

    /// Start the mock server on an available port.
    pub async fn start(config: MockServerConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let shared = Arc::new(Shared {
            config,
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            accepted: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });

        let server = Self {
            addr,
            shutdown_tx: shutdown_tx.clone(),
            shared: Arc::clone(&shared),
        };

        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer)) => {
                                let _ = stream.set_nodelay(true);
                                tracing::debug!(%peer, "mock server accepted connection");
                                spawn_connection(
                                    Arc::clone(&shared),
                                    stream,
                                    shutdown_tx.subscribe(),
                                );
                            }
                            Err(e) => {
                                tracing::error!("accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        });

        Ok(server)
    }

    /// Serve a connection over an arbitrary stream.
    pub fn attach<S>(&self, stream: S) -> Result<JoinHandle<()>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(MockServerError::Stopped);
        }
        Ok(spawn_connection(
            Arc::clone(&self.shared),
            stream,
            self.shutdown_tx.subscribe(),
        ))
    }

    /// Get the server's listening address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the host string for connection configuration.
    #[must_use]
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Get the port number.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections currently open.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::Acquire)
    }

    /// Connections accepted since start.
    #[must_use]
    pub fn accepted_count(&self) -> usize {
        self.shared.accepted.load(Ordering::Acquire)
    }

    /// Every request received so far, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<MockRequest> {
        self.shared.requests.lock().clone()
    }

    /// Stop the server and every connection it serves.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }
}

impl std::fmt::Debug for MockTdsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTdsServer")
            .field("addr", &self.addr)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Drop for MockTdsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_connection<S>(
    shared: Arc<Shared>,
    stream: S,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    shared.accepted.fetch_add(1, Ordering::AcqRel);
    shared.connections.fetch_add(1, Ordering::AcqRel);
    tokio::spawn(async move {
        let connection = Connection::new(Arc::clone(&shared), stream);
        tokio::select! {
            result = connection.run() => {
                if let Err(e) = result {
                    tracing::debug!("mock connection error: {}", e);
                }
            }
            _ = shutdown.recv() => {}
        }
        shared.connections.fetch_sub(1, Ordering::AcqRel);
    })
}

// =============================================================================
// Connection handling
// =============================================================================

enum Interrupt {
    Elapsed,
    Attention,
    Closed,
}

struct Connection<S> {
    shared: Arc<Shared>,
    frames: FramedRead<ReadHalf<S>, TdsCodec>,
    assembler: MessageAssembler,
    write: WriteHalf<S>,
    packet_size: usize,
    /// Requests read ahead while a response was delayed.
    backlog: VecDeque<MockRequest>,
    handles: HashMap<i32, String>,
    next_handle: i32,
}

impl<S: AsyncRead + AsyncWrite> Connection<S> {
    fn new(shared: Arc<Shared>, stream: S) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            shared,
            frames: FramedRead::new(read, TdsCodec::new()),
            assembler: MessageAssembler::new(),
            write,
            packet_size: DEFAULT_PACKET_SIZE,
            backlog: VecDeque::new(),
            handles: HashMap::new(),
            next_handle: 1,
        }
    }

    async fn run(mut self) -> Result<()> {
        // Step 1: PRELOGIN
        let Some(prelogin) = self.next_message().await? else {
            return Ok(());
        };
        expect_type(&prelogin, PacketType::PreLogin)?;
        self.send(&fixtures::prelogin_response()).await?;

        // Step 2: LOGIN7
        let Some(login) = self.next_message().await? else {
            return Ok(());
        };
        expect_type(&login, PacketType::Login7)?;
        let shared = Arc::clone(&self.shared);
        let config = &shared.config;
        if let Some((number, message)) = &config.login_failure {
            let failure = TokenStream::new()
                .error(*number, 14, message)
                .done(DoneStatus::ERROR, 0)
                .into_bytes();
            self.send(&failure).await?;
            return Ok(());
        }
        let response =
            fixtures::login_response(&config.database, config.packet_size, &config.server_name);
        self.send(&response).await?;
        self.packet_size = config.packet_size;

        // Step 3: requests
        loop {
            let request = match self.backlog.pop_front() {
                Some(request) => request,
                None => match self.next_request().await? {
                    Some(request) => request,
                    None => return Ok(()),
                },
            };

            if request == MockRequest::Attention {
                // Nothing left to cancel; acknowledge anyway.
                self.send(&attention_ack()).await?;
                continue;
            }
            let (response, handle) = self.respond(&request);
            if !self.deliver(&request, response, handle).await? {
                return Ok(());
            }
        }
    }

    fn respond(&mut self, request: &MockRequest) -> (MockResponse, Option<i32>) {
        let config = &self.shared.config;
        match request.proc_id() {
            None | Some(ProcId::ExecuteSql) => {
                let response = match request {
                    MockRequest::Rpc {
                        procedure: RpcProcedure::Name(name),
                        ..
                    } => config.response_for(name),
                    _ => config.response_for(&request.sql().unwrap_or_default()),
                };
                (response, None)
            }
            Some(ProcId::PrepExec) => {
                let sql = request.sql().unwrap_or_default();
                let response = config.response_for(&sql);
                if response.is_error() {
                    return (response, None);
                }
                let handle = self.next_handle;
                self.next_handle += 1;
                self.handles.insert(handle, sql);
                (response, Some(handle))
            }
            Some(ProcId::Execute) => {
                let handle = request.handle().unwrap_or_default();
                match self.handles.get(&handle) {
                    Some(sql) => (config.response_for(sql), None),
                    None => (
                        MockResponse::error(
                            8179,
                            format!("Could not find prepared statement with handle {handle}."),
                        ),
                        None,
                    ),
                }
            }
            Some(ProcId::Unprepare) => {
                if let Some(handle) = request.handle() {
                    self.handles.remove(&handle);
                }
                (MockResponse::empty(), None)
            }
            Some(ProcId::Prepare) => (MockResponse::empty(), None),
        }
    }

    /// Send the response to `request`. Returns `false` once the connection
    /// should close.
    async fn deliver(
        &mut self,
        request: &MockRequest,
        mut response: MockResponse,
        handle: Option<i32>,
    ) -> Result<bool> {
        loop {
            let delay = match response {
                MockResponse::Delayed(delay, inner) => {
                    response = *inner;
                    Some(delay)
                }
                MockResponse::Stall => None,
                MockResponse::Hang => return std::future::pending().await,
                MockResponse::Disconnect => return Ok(false),
                other => {
                    let rpc = matches!(request, MockRequest::Rpc { .. });
                    self.send(&other.encode(rpc, handle)).await?;
                    return Ok(true);
                }
            };
            match self.wait(delay).await? {
                Interrupt::Elapsed => {}
                Interrupt::Attention => {
                    self.backlog.clear();
                    self.send(&attention_ack()).await?;
                    return Ok(true);
                }
                Interrupt::Closed => return Ok(false),
            }
        }
    }

    /// Wait for `delay` (forever if `None`), reading requests ahead.
    async fn wait(&mut self, delay: Option<Duration>) -> Result<Interrupt> {
        let sleep = async move {
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return Ok(Interrupt::Elapsed),
                request = self.next_request() => match request? {
                    None => return Ok(Interrupt::Closed),
                    Some(MockRequest::Attention) => return Ok(Interrupt::Attention),
                    Some(request) => self.backlog.push_back(request),
                },
            }
        }
    }

    /// Read, decode and log the next request.
    async fn next_request(&mut self) -> Result<Option<MockRequest>> {
        let Some(message) = self.next_message().await? else {
            return Ok(None);
        };
        let request = MockRequest::decode(&message)?;
        self.shared.record(&request);
        Ok(Some(request))
    }

    async fn next_message(&mut self) -> Result<Option<Message>> {
        while let Some(packet) = self.frames.next().await {
            if let Some(message) = self.assembler.push(packet?)? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let packets = fixtures::packetize(payload, self.packet_size)?;
        self.write.write_all(&packets).await?;
        self.write.flush().await?;
        Ok(())
    }
}

fn expect_type(message: &Message, expected: PacketType) -> Result<()> {
    if message.packet_type != expected {
        return Err(MockServerError::Protocol(format!(
            "expected {expected:?}, got {:?}",
            message.packet_type
        )));
    }
    Ok(())
}

fn attention_ack() -> Bytes {
    TokenStream::new().done(DoneStatus::ATTN, 0).into_bytes()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tds_codec::{FrontendMessage, PacketWriter};
    use tds_protocol::{PacketStatus, RpcRequest, SqlBatch};

    fn message_for(request: impl Into<FrontendMessage>) -> Message {
        let mut writer = PacketWriter::new(4096).unwrap();
        writer
            .write_message(&request.into(), PacketStatus::NORMAL)
            .unwrap();
        let mut wire = BytesMut::from(&writer.take_completed()[..]);
        let mut codec = TdsCodec::new();
        let mut assembler = MessageAssembler::new();
        loop {
            let packet = tokio_util::codec::Decoder::decode(&mut codec, &mut wire)
                .unwrap()
                .unwrap();
            if let Some(message) = assembler.push(packet).unwrap() {
                return message;
            }
        }
    }

    #[test]
    fn test_decode_batch() {
        let request =
            MockRequest::decode(&message_for(SqlBatch::new("SELECT 1").with_transaction(9)))
                .unwrap();
        assert_eq!(request.sql().as_deref(), Some("SELECT 1"));
        assert_eq!(request.transaction(), 9);
    }

    #[test]
    fn test_decode_prep_exec_statement_text() {
        let request = MockRequest::decode(&message_for(RpcRequest::prep_exec(
            "SELECT @p1",
            vec![RpcParam::int("@p1", 5)],
        )))
        .unwrap();
        assert_eq!(request.proc_id(), Some(ProcId::PrepExec));
        assert_eq!(request.sql().as_deref(), Some("SELECT @p1"));
        match request {
            MockRequest::Rpc { params, .. } => assert_eq!(params.len(), 4),
            other => unreachable!("decoded {other:?}"),
        }
    }

    #[test]
    fn test_decode_execute_and_unprepare_handle() {
        let execute =
            MockRequest::decode(&message_for(RpcRequest::execute(42, Vec::new()))).unwrap();
        assert_eq!(execute.handle(), Some(42));
        assert_eq!(execute.sql(), None);

        let unprepare = MockRequest::decode(&message_for(RpcRequest::unprepare(7))).unwrap();
        assert_eq!(unprepare.proc_id(), Some(ProcId::Unprepare));
        assert_eq!(unprepare.handle(), Some(7));
    }

    #[test]
    fn test_rpc_response_carries_handle() {
        let bytes = MockResponse::affected(3).encode(true, Some(11));
        let mut buf = &bytes[..];
        let mut tokens = Vec::new();
        while !buf.is_empty() {
            let (token, used) = tds_protocol::Token::decode(buf).unwrap();
            tokens.push(token);
            buf = &buf[used..];
        }
        assert!(matches!(tokens[0], tds_protocol::Token::DoneInProc(d) if d.row_count == 3));
        assert!(matches!(tokens[1], tds_protocol::Token::ReturnStatus(0)));
        match &tokens[2] {
            tds_protocol::Token::ReturnValue(value) => assert_eq!(value.as_i32(), Some(11)),
            other => unreachable!("unexpected {other:?}"),
        }
        assert!(matches!(tokens[3], tds_protocol::Token::DoneProc(d) if !d.has_more()));
    }

    #[tokio::test]
    async fn test_server_starts_and_stops() {
        let server = MockTdsServer::builder()
            .with_server_name("UnitTest")
            .build()
            .await
            .unwrap();
        assert!(server.port() > 0);
        assert_eq!(server.host(), "127.0.0.1");
        assert_eq!(server.connection_count(), 0);
        server.stop();
        let (_client, remote) = tokio::io::duplex(64);
        assert!(matches!(server.attach(remote), Err(MockServerError::Stopped)));
    }
}
