//! TDS token stream definitions.
//!
//! Tokens are the fundamental units of TDS response data. The server sends
//! a stream of tokens that describe metadata, rows, errors, and other information.
//!
//! ## Token Structure
//!
//! Each token begins with a 1-byte token type identifier. What follows is
//! one of three shapes:
//!
//! - a fixed-size body (`DONE`, `RETURNSTATUS`),
//! - a 2-byte little-endian length followed by that many body bytes
//!   (`LOGINACK`, `ERROR`, `INFO`, `ENVCHANGE`, `ORDER`),
//! - a self-describing body whose size is only known once it is decoded
//!   (`COLMETADATA`, `RETURNVALUE`).
//!
//! `ROW` is decoded as a bare marker. The row body depends on the active
//! column metadata and is read column by column by the codec's row reader.
//!
//! Decoding works on a contiguous byte slice and never reads past it. A short
//! slice yields [`ProtocolError::Incomplete`] or
//! [`ProtocolError::UnexpectedEof`] and the caller retries with more bytes,
//! which is what makes the streaming reader resumable.
//!
//! ```rust,ignore
//! use tds_protocol::token::Token;
//!
//! let (token, consumed) = Token::decode(&buf)?;
//! if let Token::Done(done) = token {
//!     println!("rows affected: {:?}", done.row_count());
//! }
//! ```

use std::sync::Arc;

use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};

use crate::codec::{read_b_varchar, read_us_varchar, skip_b_varchar, skip_us_varchar};
use crate::error::ProtocolError;
use crate::types::{ColumnFlags, LengthKind, TypeId};
use crate::writer::{BufferWriter, LengthCounter};

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Column ordering (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Output parameter value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Row data (ROW).
    Row = 0xD1,
    /// Return status of a stored procedure (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Statement completion (DONE).
    Done = 0xFD,
    /// Stored procedure completion (DONEPROC).
    DoneProc = 0xFE,
    /// Statement completion inside a stored procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

/// How a token's body is delimited on the wire.
#[derive(Debug, Clone, Copy)]
enum Framing {
    Fixed(usize),
    Length16,
    SelfDescribing,
}

impl TokenType {
    /// Create a token type from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x81 => Self::ColMetaData,
            0xA9 => Self::Order,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAC => Self::ReturnValue,
            0xAD => Self::LoginAck,
            0xD1 => Self::Row,
            0x79 => Self::ReturnStatus,
            0xE3 => Self::EnvChange,
            0xFD => Self::Done,
            0xFE => Self::DoneProc,
            0xFF => Self::DoneInProc,
            _ => return None,
        })
    }

    /// Whether this is one of the three DONE variants.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Done | Self::DoneProc | Self::DoneInProc)
    }

    const fn framing(self) -> Framing {
        match self {
            Self::Done | Self::DoneProc | Self::DoneInProc => Framing::Fixed(Done::SIZE),
            Self::ReturnStatus => Framing::Fixed(4),
            Self::Row => Framing::Fixed(0),
            Self::LoginAck | Self::Error | Self::Info | Self::EnvChange | Self::Order => {
                Framing::Length16
            }
            Self::ColMetaData | Self::ReturnValue => Framing::SelfDescribing,
        }
    }
}

/// A decoded token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// Server error.
    Error(ServerMessage),
    /// Server informational message.
    Info(ServerMessage),
    /// Environment change.
    EnvChange(EnvChange),
    /// Statement completion.
    Done(Done),
    /// Stored procedure completion.
    DoneProc(Done),
    /// Statement completion inside a stored procedure.
    DoneInProc(Done),
    /// Column metadata for the rows that follow.
    ColMetaData(Arc<ColMetaData>),
    /// Start of a row; the body is read column by column.
    Row,
    /// Stored procedure return status.
    ReturnStatus(i32),
    /// Output parameter value.
    ReturnValue(ReturnValue),
    /// Column ordering.
    Order(Order),
}

impl Token {
    /// The tag of this token.
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        match self {
            Self::LoginAck(_) => TokenType::LoginAck,
            Self::Error(_) => TokenType::Error,
            Self::Info(_) => TokenType::Info,
            Self::EnvChange(_) => TokenType::EnvChange,
            Self::Done(_) => TokenType::Done,
            Self::DoneProc(_) => TokenType::DoneProc,
            Self::DoneInProc(_) => TokenType::DoneInProc,
            Self::ColMetaData(_) => TokenType::ColMetaData,
            Self::Row => TokenType::Row,
            Self::ReturnStatus(_) => TokenType::ReturnStatus,
            Self::ReturnValue(_) => TokenType::ReturnValue,
            Self::Order(_) => TokenType::Order,
        }
    }

    /// The DONE body if this is any DONE variant.
    #[must_use]
    pub fn as_done(&self) -> Option<&Done> {
        match self {
            Self::Done(done) | Self::DoneProc(done) | Self::DoneInProc(done) => Some(done),
            _ => None,
        }
    }

    /// Bytes needed, counted from the tag, to decode the token at the start
    /// of `buf`.
    ///
    /// Returns `Ok(None)` when the size cannot be known before decoding
    /// (count-prefixed or self-describing bodies). Unknown tags are rejected
    /// here so the reader never waits for bytes of a token it cannot parse.
    pub fn required_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
        let Some(&tag) = buf.first() else {
            return Ok(Some(1));
        };
        let token_type = TokenType::from_u8(tag).ok_or(ProtocolError::InvalidTokenType(tag))?;
        Ok(match token_type.framing() {
            Framing::Fixed(size) => Some(1 + size),
            Framing::Length16 if buf.len() < 3 => Some(3),
            Framing::Length16 => Some(3 + u16::from_le_bytes([buf[1], buf[2]]) as usize),
            Framing::SelfDescribing => None,
        })
    }

    /// Decode one token from the start of `buf`.
    ///
    /// Returns the token and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let Some(&tag) = buf.first() else {
            return Err(ProtocolError::Incomplete {
                needed: 1,
                available: 0,
            });
        };
        let token_type = TokenType::from_u8(tag).ok_or(ProtocolError::InvalidTokenType(tag))?;

        match token_type.framing() {
            Framing::Fixed(size) => {
                let body = bounded_body(buf, 1, size)?;
                let token = match token_type {
                    TokenType::Row => Self::Row,
                    TokenType::ReturnStatus => {
                        Self::ReturnStatus(i32::from_le_bytes([body[0], body[1], body[2], body[3]]))
                    }
                    TokenType::Done => Self::Done(Done::decode(&mut &body[..])?),
                    TokenType::DoneProc => Self::DoneProc(Done::decode(&mut &body[..])?),
                    _ => Self::DoneInProc(Done::decode(&mut &body[..])?),
                };
                Ok((token, 1 + size))
            }
            Framing::Length16 => {
                if buf.len() < 3 {
                    return Err(ProtocolError::Incomplete {
                        needed: 3,
                        available: buf.len(),
                    });
                }
                let length = u16::from_le_bytes([buf[1], buf[2]]) as usize;
                let body = bounded_body(buf, 3, length)?;
                let token = within(body, token_name(token_type), |src| {
                    Ok(match token_type {
                        TokenType::LoginAck => Self::LoginAck(LoginAck::decode(src)?),
                        TokenType::Error => Self::Error(ServerMessage::decode(src)?),
                        TokenType::Info => Self::Info(ServerMessage::decode(src)?),
                        TokenType::EnvChange => Self::EnvChange(EnvChange::decode(src)?),
                        _ => Self::Order(Order::decode(src)?),
                    })
                })?;
                Ok((token, 3 + length))
            }
            Framing::SelfDescribing => {
                let mut src = &buf[1..];
                let token = match token_type {
                    TokenType::ColMetaData => {
                        Self::ColMetaData(Arc::new(ColMetaData::decode(&mut src)?))
                    }
                    _ => Self::ReturnValue(ReturnValue::decode(&mut src)?),
                };
                Ok((token, buf.len() - src.len()))
            }
        }
    }

    /// Encode this token.
    ///
    /// `Row` writes only the tag; row bodies are appended by the caller
    /// with [`write_value`].
    pub fn encode(&self, dst: &mut impl BufferWriter) {
        match self {
            Self::LoginAck(ack) => ack.encode(dst),
            Self::Error(msg) => msg.encode(TokenType::Error, dst),
            Self::Info(msg) => msg.encode(TokenType::Info, dst),
            Self::EnvChange(env) => env.encode(dst),
            Self::Done(done) => done.encode(TokenType::Done, dst),
            Self::DoneProc(done) => done.encode(TokenType::DoneProc, dst),
            Self::DoneInProc(done) => done.encode(TokenType::DoneInProc, dst),
            Self::ColMetaData(meta) => meta.encode(dst),
            Self::Row => dst.write_u8(TokenType::Row as u8),
            Self::ReturnStatus(status) => {
                dst.write_u8(TokenType::ReturnStatus as u8);
                dst.write_i32_le(*status);
            }
            Self::ReturnValue(value) => value.encode(dst),
            Self::Order(order) => order.encode(dst),
        }
    }
}

fn token_name(token_type: TokenType) -> &'static str {
    match token_type {
        TokenType::LoginAck => "LOGINACK token",
        TokenType::Error => "ERROR token",
        TokenType::Info => "INFO token",
        TokenType::EnvChange => "ENVCHANGE token",
        _ => "ORDER token",
    }
}

fn bounded_body(buf: &[u8], start: usize, length: usize) -> Result<&[u8], ProtocolError> {
    let end = start + length;
    if buf.len() < end {
        return Err(ProtocolError::Incomplete {
            needed: end,
            available: buf.len(),
        });
    }
    Ok(&buf[start..end])
}

/// Decode a body whose bytes are all present. Running short inside it means
/// the declared length is wrong, not that more data is coming.
fn within<T>(
    body: &[u8],
    what: &'static str,
    decode: impl FnOnce(&mut &[u8]) -> Result<T, ProtocolError>,
) -> Result<T, ProtocolError> {
    let mut src = body;
    decode(&mut src).map_err(|e| {
        if e.is_incomplete() {
            ProtocolError::Malformed(what)
        } else {
            e
        }
    })
}

fn ensure(src: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        Err(ProtocolError::UnexpectedEof)
    } else {
        Ok(())
    }
}

fn encode_with_length(
    dst: &mut impl BufferWriter,
    token_type: TokenType,
    body: impl Fn(&mut dyn BufferWriter),
) {
    let mut counter = LengthCounter::default();
    body(&mut counter);
    dst.write_u8(token_type as u8);
    dst.write_u16_le(counter.0 as u16);
    let sink: &mut dyn BufferWriter = dst;
    body(sink);
}

// =============================================================================
// DONE
// =============================================================================

bitflags! {
    /// DONE token status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow in this response.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is in progress.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention signal.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// Body shared by DONE, DONEPROC and DONEINPROC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Done {
    /// Status bits.
    pub status: DoneStatus,
    /// Token of the command that completed.
    pub cur_cmd: u16,
    /// Rows affected (valid only with [`DoneStatus::COUNT`]).
    pub row_count: u64,
}

impl Done {
    /// Body size in bytes.
    pub const SIZE: usize = 12;

    /// Decode a DONE body (after the tag).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, Self::SIZE)?;
        let status = DoneStatus::from_bits_retain(src.get_u16_le());
        let cur_cmd = src.get_u16_le();
        let row_count = src.get_u64_le();
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode with the given DONE variant tag.
    pub fn encode(&self, token_type: TokenType, dst: &mut impl BufferWriter) {
        dst.write_u8(token_type as u8);
        dst.write_u16_le(self.status.bits());
        dst.write_u16_le(self.cur_cmd);
        dst.write_u64_le(self.row_count);
    }

    /// Whether more result tokens follow in this response.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// Whether the statement reported an error.
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.status.intersects(DoneStatus::ERROR.union(DoneStatus::SRVERROR))
    }

    /// Whether this acknowledges an attention signal.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// Row count, if the server marked it valid.
    #[must_use]
    pub const fn row_count(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }
}

// =============================================================================
// ERROR / INFO
// =============================================================================

/// Body shared by ERROR and INFO tokens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// Error state.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerMessage {
    /// Decode the message body (after tag and length).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 6)?;
        let number = src.get_i32_le();
        let state = src.get_u8();
        let class = src.get_u8();
        let message = read_us_varchar(src)?;
        let server = read_b_varchar(src)?;
        let procedure = read_b_varchar(src)?;
        ensure(src, 4)?;
        let line = src.get_i32_le();

        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode as an ERROR or INFO token.
    pub fn encode(&self, token_type: TokenType, dst: &mut impl BufferWriter) {
        encode_with_length(dst, token_type, |w| {
            w.write_i32_le(self.number);
            w.write_u8(self.state);
            w.write_u8(self.class);
            w.write_us_varchar(&self.message);
            w.write_b_varchar(&self.server);
            w.write_b_varchar(&self.procedure);
            w.write_i32_le(self.line);
        });
    }

    /// Check if this is a fatal error (severity >= 20).
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= 20
    }
}

// =============================================================================
// LOGINACK
// =============================================================================

/// Login acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginAck {
    /// Interface type.
    pub interface: u8,
    /// Negotiated TDS version (e.g. `0x7400_0004`).
    pub tds_version: u32,
    /// Server program name.
    pub prog_name: String,
    /// Server program version.
    pub prog_version: u32,
}

impl LoginAck {
    /// Decode the body (after tag and length).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 5)?;
        let interface = src.get_u8();
        let tds_version = src.get_u32();
        let prog_name = read_b_varchar(src)?;
        ensure(src, 4)?;
        let prog_version = src.get_u32();

        Ok(Self {
            interface,
            tds_version,
            prog_name,
            prog_version,
        })
    }

    /// Encode as a LOGINACK token.
    pub fn encode(&self, dst: &mut impl BufferWriter) {
        encode_with_length(dst, TokenType::LoginAck, |w| {
            w.write_u8(self.interface);
            w.write_bytes(&self.tds_version.to_be_bytes());
            w.write_b_varchar(&self.prog_name);
            w.write_bytes(&self.prog_version.to_be_bytes());
        });
    }
}

// =============================================================================
// ENVCHANGE
// =============================================================================

/// Environment change type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvChangeType {
    /// Current database.
    Database,
    /// Session language.
    Language,
    /// Character set.
    CharacterSet,
    /// Negotiated packet size.
    PacketSize,
    /// SQL collation.
    SqlCollation,
    /// Transaction started.
    BeginTransaction,
    /// Transaction committed.
    CommitTransaction,
    /// Transaction rolled back.
    RollbackTransaction,
    /// Reset-connection acknowledgment.
    ResetConnectionAck,
    /// Redirect to another server.
    Routing,
    /// Any other change; the value is kept as raw bytes.
    Other(u8),
}

impl EnvChangeType {
    /// Create from raw byte value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            18 => Self::ResetConnectionAck,
            20 => Self::Routing,
            other => Self::Other(other),
        }
    }

    /// Raw byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Database => 1,
            Self::Language => 2,
            Self::CharacterSet => 3,
            Self::PacketSize => 4,
            Self::SqlCollation => 7,
            Self::BeginTransaction => 8,
            Self::CommitTransaction => 9,
            Self::RollbackTransaction => 10,
            Self::ResetConnectionAck => 18,
            Self::Routing => 20,
            Self::Other(other) => other,
        }
    }

    const fn is_string(self) -> bool {
        matches!(
            self,
            Self::Database | Self::Language | Self::CharacterSet | Self::PacketSize
        )
    }
}

/// Environment change value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChangeValue {
    /// String value.
    String(String),
    /// Binary value (collation, transaction descriptor, or unknown types).
    Binary(Bytes),
    /// Routing target.
    Routing {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },
}

/// Environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// What changed.
    pub env_type: EnvChangeType,
    /// New value.
    pub new_value: EnvChangeValue,
    /// Old value.
    pub old_value: EnvChangeValue,
}

impl EnvChange {
    /// Create a string-valued change.
    #[must_use]
    pub fn string(env_type: EnvChangeType, new_value: &str, old_value: &str) -> Self {
        Self {
            env_type,
            new_value: EnvChangeValue::String(new_value.to_owned()),
            old_value: EnvChangeValue::String(old_value.to_owned()),
        }
    }

    /// Decode the body (after tag and length). The body must be complete.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 1)?;
        let env_type = EnvChangeType::from_u8(src.get_u8());

        let (new_value, old_value) = if env_type.is_string() {
            (
                EnvChangeValue::String(read_b_varchar(src)?),
                EnvChangeValue::String(read_b_varchar(src)?),
            )
        } else if env_type == EnvChangeType::Routing {
            (Self::decode_routing(src)?, EnvChangeValue::Binary(Bytes::new()))
        } else if matches!(env_type, EnvChangeType::Other(_)) {
            (
                EnvChangeValue::Binary(src.copy_to_bytes(src.remaining())),
                EnvChangeValue::Binary(Bytes::new()),
            )
        } else {
            (
                EnvChangeValue::Binary(read_b_varbyte(src)?),
                EnvChangeValue::Binary(read_b_varbyte(src)?),
            )
        };

        // Trailing bytes within the declared length are ignored.
        let rest = src.remaining();
        src.advance(rest);

        Ok(Self {
            env_type,
            new_value,
            old_value,
        })
    }

    fn decode_routing(src: &mut impl Buf) -> Result<EnvChangeValue, ProtocolError> {
        ensure(src, 2 + 1 + 2)?;
        let _routing_len = src.get_u16_le();
        let _protocol = src.get_u8();
        let port = src.get_u16_le();
        let host = read_us_varchar(src)?;
        // old value: zero-length USHORT
        if src.remaining() >= 2 {
            src.advance(2);
        }
        Ok(EnvChangeValue::Routing { host, port })
    }

    /// Encode as an ENVCHANGE token.
    pub fn encode(&self, dst: &mut impl BufferWriter) {
        encode_with_length(dst, TokenType::EnvChange, |w| {
            w.write_u8(self.env_type.as_u8());
            for value in [&self.new_value, &self.old_value] {
                match value {
                    EnvChangeValue::String(s) => w.write_b_varchar(s),
                    EnvChangeValue::Binary(_) if self.env_type == EnvChangeType::Routing => {
                        w.write_u16_le(0);
                    }
                    EnvChangeValue::Binary(b) => {
                        w.write_u8(b.len() as u8);
                        w.write_bytes(b);
                    }
                    EnvChangeValue::Routing { host, port } => {
                        let host_bytes = host.encode_utf16().count() * 2;
                        w.write_u16_le((1 + 2 + 2 + host_bytes) as u16);
                        w.write_u8(0);
                        w.write_u16_le(*port);
                        w.write_us_varchar(host);
                    }
                }
            }
        });
    }

    /// The new database name if this is a database change.
    #[must_use]
    pub fn new_database(&self) -> Option<&str> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::Database, EnvChangeValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The new packet size if this is a packet size change.
    #[must_use]
    pub fn new_packet_size(&self) -> Option<usize> {
        match (&self.env_type, &self.new_value) {
            (EnvChangeType::PacketSize, EnvChangeValue::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// Routing target if this is a routing change.
    #[must_use]
    pub fn routing_info(&self) -> Option<(&str, u16)> {
        match &self.new_value {
            EnvChangeValue::Routing { host, port } => Some((host, *port)),
            _ => None,
        }
    }
}

fn read_b_varbyte(src: &mut impl Buf) -> Result<Bytes, ProtocolError> {
    ensure(src, 1)?;
    let len = src.get_u8() as usize;
    ensure(src, len)?;
    Ok(src.copy_to_bytes(len))
}

// =============================================================================
// ORDER
// =============================================================================

/// Column ordering of the current result set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Order {
    /// 1-based ordinals of the ORDER BY columns.
    pub columns: Vec<u16>,
}

impl Order {
    /// Decode the body (after tag and length).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        if src.remaining() % 2 != 0 {
            return Err(ProtocolError::Malformed("ORDER token"));
        }
        let mut columns = Vec::with_capacity(src.remaining() / 2);
        while src.has_remaining() {
            columns.push(src.get_u16_le());
        }
        Ok(Self { columns })
    }

    /// Encode as an ORDER token.
    pub fn encode(&self, dst: &mut impl BufferWriter) {
        dst.write_u8(TokenType::Order as u8);
        dst.write_u16_le((self.columns.len() * 2) as u16);
        for column in &self.columns {
            dst.write_u16_le(*column);
        }
    }
}

// =============================================================================
// COLMETADATA
// =============================================================================

/// Collation (5 bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Collation {
    /// Locale id and comparison flags.
    pub lcid: u32,
    /// Sort id.
    pub sort_id: u8,
}

impl Collation {
    /// `Latin1_General_CI_AS`, used for parameters the client sends.
    pub const DEFAULT: Self = Self {
        lcid: 0x00D0_0409,
        sort_id: 0x34,
    };

    fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 5)?;
        let lcid = src.get_u32_le();
        let sort_id = src.get_u8();
        Ok(Self { lcid, sort_id })
    }

    fn encode(&self, dst: &mut (impl BufferWriter + ?Sized)) {
        dst.write_u32_le(self.lcid);
        dst.write_u8(self.sort_id);
    }
}

/// Type descriptor (`TYPE_INFO`) of a column, parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Type code.
    pub type_id: TypeId,
    /// Declared maximum length, for length-prefixed types.
    pub max_length: Option<u32>,
    /// Precision (decimal/numeric).
    pub precision: Option<u8>,
    /// Scale (decimal/numeric/time types).
    pub scale: Option<u8>,
    /// Collation (character types).
    pub collation: Option<Collation>,
    /// How values of this type are length-prefixed.
    pub length_kind: LengthKind,
}

impl TypeInfo {
    /// Descriptor for a fixed-length type.
    pub fn fixed(type_id: TypeId) -> Result<Self, ProtocolError> {
        Ok(Self {
            type_id,
            max_length: None,
            precision: None,
            scale: None,
            collation: None,
            length_kind: type_id.length_kind()?,
        })
    }

    /// Nullable numeric type (`INTN`, `BITN`, `FLTN`, ...) of the given width.
    #[must_use]
    pub fn nullable(type_id: TypeId, width: u8) -> Self {
        Self {
            type_id,
            max_length: Some(u32::from(width)),
            precision: None,
            scale: None,
            collation: None,
            length_kind: LengthKind::Byte,
        }
    }

    /// `NVARCHAR(n)` with `n` in bytes, or `NVARCHAR(MAX)` when `n` is `0xFFFF`.
    #[must_use]
    pub fn nvarchar(max_bytes: u16) -> Self {
        Self {
            type_id: TypeId::NVarChar,
            max_length: Some(u32::from(max_bytes)),
            precision: None,
            scale: None,
            collation: Some(Collation::DEFAULT),
            length_kind: LengthKind::UShort.resolve(Some(u32::from(max_bytes))),
        }
    }

    /// `VARBINARY(n)`, or `VARBINARY(MAX)` when `n` is `0xFFFF`.
    #[must_use]
    pub fn varbinary(max_bytes: u16) -> Self {
        Self {
            type_id: TypeId::BigVarBinary,
            max_length: Some(u32::from(max_bytes)),
            precision: None,
            scale: None,
            collation: None,
            length_kind: LengthKind::UShort.resolve(Some(u32::from(max_bytes))),
        }
    }

    /// Decode a `TYPE_INFO` starting at the type byte.
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 1)?;
        let type_id = TypeId::for_column(src.get_u8())?;
        let mut info = Self::fixed(type_id)?;

        match type_id {
            TypeId::Null
            | TypeId::Int1
            | TypeId::Bit
            | TypeId::Int2
            | TypeId::Int4
            | TypeId::Int8
            | TypeId::Float4
            | TypeId::Float8
            | TypeId::Money
            | TypeId::Money4
            | TypeId::DateTime
            | TypeId::DateTime4
            | TypeId::Date => {}

            TypeId::Guid
            | TypeId::IntN
            | TypeId::BitN
            | TypeId::FloatN
            | TypeId::MoneyN
            | TypeId::DateTimeN
            | TypeId::Char
            | TypeId::VarChar
            | TypeId::Binary
            | TypeId::VarBinary => {
                ensure(src, 1)?;
                info.max_length = Some(u32::from(src.get_u8()));
            }

            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                ensure(src, 3)?;
                info.max_length = Some(u32::from(src.get_u8()));
                info.precision = Some(src.get_u8());
                info.scale = Some(src.get_u8());
            }

            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                ensure(src, 1)?;
                info.scale = Some(src.get_u8());
            }

            TypeId::BigVarChar | TypeId::BigChar | TypeId::NChar | TypeId::NVarChar => {
                ensure(src, 2)?;
                info.max_length = Some(u32::from(src.get_u16_le()));
                info.collation = Some(Collation::decode(src)?);
            }

            TypeId::BigVarBinary | TypeId::BigBinary => {
                ensure(src, 2)?;
                info.max_length = Some(u32::from(src.get_u16_le()));
            }

            TypeId::Udt => {
                ensure(src, 2)?;
                info.max_length = Some(u32::from(src.get_u16_le()));
                skip_b_varchar(src)?; // database
                skip_b_varchar(src)?; // schema
                skip_b_varchar(src)?; // type name
                skip_us_varchar(src)?; // assembly qualified name
            }

            TypeId::Text | TypeId::NText | TypeId::Image => {
                ensure(src, 4)?;
                info.max_length = Some(src.get_u32_le());
                if type_id != TypeId::Image {
                    info.collation = Some(Collation::decode(src)?);
                }
            }

            TypeId::Variant => {
                ensure(src, 4)?;
                info.max_length = Some(src.get_u32_le());
            }

            TypeId::Xml => {
                ensure(src, 1)?;
                if src.get_u8() != 0 {
                    skip_b_varchar(src)?; // database
                    skip_b_varchar(src)?; // owning schema
                    skip_us_varchar(src)?; // schema collection
                }
            }

            TypeId::Tvp => return Err(ProtocolError::UnsupportedType(TypeId::Tvp as u8)),
        }

        info.length_kind = info.length_kind.resolve(info.max_length);
        Ok(info)
    }

    /// Encode as a `TYPE_INFO`.
    pub fn encode(&self, dst: &mut (impl BufferWriter + ?Sized)) {
        dst.write_u8(self.type_id as u8);
        let max_length = self.max_length.unwrap_or(0);
        match self.type_id {
            TypeId::Decimal | TypeId::Numeric | TypeId::DecimalN | TypeId::NumericN => {
                dst.write_u8(max_length as u8);
                dst.write_u8(self.precision.unwrap_or(18));
                dst.write_u8(self.scale.unwrap_or(0));
            }
            TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset => {
                dst.write_u8(self.scale.unwrap_or(7));
            }
            TypeId::Udt => {
                dst.write_u16_le(max_length as u16);
                dst.write_b_varchar("");
                dst.write_b_varchar("");
                dst.write_b_varchar("");
                dst.write_us_varchar("");
            }
            TypeId::Xml => dst.write_u8(0),
            TypeId::Date => {}
            _ => match self.type_id.length_kind() {
                Ok(LengthKind::Byte) => dst.write_u8(max_length as u8),
                Ok(LengthKind::UShort) => {
                    dst.write_u16_le(max_length as u16);
                    if let Some(collation) = &self.collation {
                        collation.encode(dst);
                    }
                }
                Ok(LengthKind::Long { .. }) => {
                    dst.write_u32_le(max_length);
                    if let Some(collation) = &self.collation {
                        collation.encode(dst);
                    }
                }
                _ => {}
            },
        }
    }
}

/// A column descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnData {
    /// Column name.
    pub name: String,
    /// User type id.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Type descriptor.
    pub type_info: TypeInfo,
}

impl ColumnData {
    /// Create a column descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, type_info: TypeInfo) -> Self {
        Self {
            name: name.into(),
            user_type: 0,
            flags: ColumnFlags::NULLABLE,
            type_info,
        }
    }

    /// How this column's values are length-prefixed.
    #[must_use]
    pub fn length_kind(&self) -> LengthKind {
        self.type_info.length_kind
    }

    /// Check if this column is nullable.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }
}

/// Column metadata for a result set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColMetaData {
    /// Column descriptors, in wire order.
    pub columns: Vec<ColumnData>,
}

impl ColMetaData {
    /// Column count indicating no metadata.
    pub const NO_METADATA: u16 = 0xFFFF;

    /// Decode the body (after the tag).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let column_count = src.get_u16_le();
        if column_count == Self::NO_METADATA {
            return Ok(Self::default());
        }

        let mut columns = Vec::with_capacity(column_count as usize);
        for _ in 0..column_count {
            columns.push(Self::decode_column(src)?);
        }
        Ok(Self { columns })
    }

    fn decode_column(src: &mut impl Buf) -> Result<ColumnData, ProtocolError> {
        ensure(src, 6)?;
        let user_type = src.get_u32_le();
        let flags = ColumnFlags::from_bits_retain(src.get_u16_le());
        let type_info = TypeInfo::decode(src)?;

        if matches!(type_info.type_id, TypeId::Text | TypeId::NText | TypeId::Image) {
            ensure(src, 1)?;
            let parts = src.get_u8();
            for _ in 0..parts {
                skip_us_varchar(src)?;
            }
        }

        let name = read_b_varchar(src)?;
        Ok(ColumnData {
            name,
            user_type,
            flags,
            type_info,
        })
    }

    /// Encode as a COLMETADATA token.
    pub fn encode(&self, dst: &mut impl BufferWriter) {
        dst.write_u8(TokenType::ColMetaData as u8);
        if self.columns.is_empty() {
            dst.write_u16_le(Self::NO_METADATA);
            return;
        }
        dst.write_u16_le(self.columns.len() as u16);
        for column in &self.columns {
            dst.write_u32_le(column.user_type);
            dst.write_u16_le(column.flags.bits());
            column.type_info.encode(dst);
            if matches!(
                column.type_info.type_id,
                TypeId::Text | TypeId::NText | TypeId::Image
            ) {
                dst.write_u8(0);
            }
            dst.write_b_varchar(&column.name);
        }
    }

    /// Get the number of columns.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Check if this represents no metadata.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

// =============================================================================
// RETURNVALUE
// =============================================================================

/// Output parameter or UDF return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name.
    pub name: String,
    /// Status (0x01 output parameter, 0x02 UDF return value).
    pub status: u8,
    /// User type id.
    pub user_type: u32,
    /// Flags.
    pub flags: ColumnFlags,
    /// Type descriptor.
    pub type_info: TypeInfo,
    /// Raw value bytes without their length prefix; `None` is NULL.
    pub value: Option<Bytes>,
}

impl ReturnValue {
    /// Decode the body (after the tag).
    pub fn decode(src: &mut impl Buf) -> Result<Self, ProtocolError> {
        ensure(src, 2)?;
        let ordinal = src.get_u16_le();
        let name = read_b_varchar(src)?;
        ensure(src, 1 + 4 + 2)?;
        let status = src.get_u8();
        let user_type = src.get_u32_le();
        let flags = ColumnFlags::from_bits_retain(src.get_u16_le());
        let type_info = TypeInfo::decode(src)?;
        let value = read_value(src, type_info.length_kind)?;

        Ok(Self {
            ordinal,
            name,
            status,
            user_type,
            flags,
            type_info,
            value,
        })
    }

    /// Encode as a RETURNVALUE token.
    pub fn encode(&self, dst: &mut impl BufferWriter) {
        dst.write_u8(TokenType::ReturnValue as u8);
        dst.write_u16_le(self.ordinal);
        dst.write_b_varchar(&self.name);
        dst.write_u8(self.status);
        dst.write_u32_le(self.user_type);
        dst.write_u16_le(self.flags.bits());
        self.type_info.encode(dst);
        write_value(dst, self.type_info.length_kind, self.value.as_deref());
    }

    /// Interpret the value as a 32-bit integer (`INT` or `INTN(4)`).
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.value.as_deref()?.try_into().ok()?;
        Some(i32::from_le_bytes(bytes))
    }
}

// =============================================================================
// Values
// =============================================================================

/// Read one value with the given length convention from a contiguous buffer.
///
/// Returns the value bytes without their prefix, or `None` for NULL.
pub fn read_value(src: &mut impl Buf, kind: LengthKind) -> Result<Option<Bytes>, ProtocolError> {
    let len = match kind {
        LengthKind::Fixed(0) => return Ok(None),
        LengthKind::Fixed(n) => n as usize,
        LengthKind::Byte => {
            ensure(src, 1)?;
            match src.get_u8() {
                0 => return Ok(None),
                n => n as usize,
            }
        }
        LengthKind::UShort => {
            ensure(src, 2)?;
            match src.get_u16_le() {
                0xFFFF => return Ok(None),
                n => n as usize,
            }
        }
        LengthKind::Long { text_pointer } => {
            if text_pointer {
                ensure(src, 1)?;
                let pointer_len = src.get_u8() as usize;
                if pointer_len == 0 {
                    return Ok(None);
                }
                ensure(src, pointer_len + 8)?;
                src.advance(pointer_len + 8);
            }
            ensure(src, 4)?;
            match src.get_u32_le() {
                0 if !text_pointer => return Ok(None),
                n => n as usize,
            }
        }
        LengthKind::Plp => return read_plp(src),
    };
    ensure(src, len)?;
    Ok(Some(src.copy_to_bytes(len)))
}

/// Marker for a NULL PLP value.
pub const PLP_NULL: u64 = u64::MAX;

fn read_plp(src: &mut impl Buf) -> Result<Option<Bytes>, ProtocolError> {
    ensure(src, 8)?;
    let total = src.get_u64_le();
    if total == PLP_NULL {
        return Ok(None);
    }
    let mut value = BytesMut::new();
    loop {
        ensure(src, 4)?;
        let chunk = src.get_u32_le() as usize;
        if chunk == 0 {
            break;
        }
        ensure(src, chunk)?;
        value.extend_from_slice(&src.copy_to_bytes(chunk));
    }
    Ok(Some(value.freeze()))
}

/// Write one value with the given length convention.
///
/// PLP values are written as a single chunk.
pub fn write_value(dst: &mut (impl BufferWriter + ?Sized), kind: LengthKind, value: Option<&[u8]>) {
    match (kind, value) {
        (LengthKind::Fixed(_), Some(v)) => dst.write_bytes(v),
        (LengthKind::Fixed(_), None) => {}
        (LengthKind::Byte, None) => dst.write_u8(0),
        (LengthKind::Byte, Some(v)) => {
            dst.write_u8(v.len() as u8);
            dst.write_bytes(v);
        }
        (LengthKind::UShort, None) => dst.write_u16_le(0xFFFF),
        (LengthKind::UShort, Some(v)) => {
            dst.write_u16_le(v.len() as u16);
            dst.write_bytes(v);
        }
        (LengthKind::Long { text_pointer: true }, None) => dst.write_u8(0),
        (LengthKind::Long { text_pointer: true }, Some(v)) => {
            dst.write_u8(16);
            dst.write_bytes(&[0u8; 16]);
            dst.write_bytes(&[0u8; 8]);
            dst.write_u32_le(v.len() as u32);
            dst.write_bytes(v);
        }
        (LengthKind::Long { text_pointer: false }, None) => dst.write_u32_le(0),
        (LengthKind::Long { text_pointer: false }, Some(v)) => {
            dst.write_u32_le(v.len() as u32);
            dst.write_bytes(v);
        }
        (LengthKind::Plp, None) => dst.write_u64_le(PLP_NULL),
        (LengthKind::Plp, Some(v)) => {
            dst.write_u64_le(v.len() as u64);
            if !v.is_empty() {
                dst.write_u32_le(v.len() as u32);
                dst.write_bytes(v);
            }
            dst.write_u32_le(0);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encoded(token: &Token) -> Vec<u8> {
        let mut buf = Vec::new();
        token.encode(&mut buf);
        buf
    }

    fn sample_metadata() -> ColMetaData {
        ColMetaData {
            columns: vec![
                ColumnData::new("id", TypeInfo::nullable(TypeId::IntN, 4)),
                ColumnData::new("name", TypeInfo::nvarchar(100)),
                ColumnData::new("body", TypeInfo::nvarchar(0xFFFF)),
                ColumnData::new("created", TypeInfo::fixed(TypeId::DateTime).unwrap()),
            ],
        }
    }

    #[test]
    fn test_done_wire_bytes() {
        // Trailing byte belongs to whatever follows.
        let raw = [
            0xFD, 0x00, 0x00, 0x10, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        let (token, consumed) = Token::decode(&raw).unwrap();
        assert_eq!(consumed, 13);
        let Token::Done(done) = token else {
            panic!("expected DONE, got {token:?}");
        };
        assert_eq!(done.status, DoneStatus::empty());
        assert_eq!(done.cur_cmd, 0x0010);
        assert_eq!(done.row_count, 5);
        assert_eq!(done.row_count(), None);
        assert!(!done.has_more());
    }

    #[test]
    fn test_done_status_bits() {
        let raw = [0xFE, 0x31, 0x01, 0xC1, 0x00, 42, 0, 0, 0, 0, 0, 0, 0];
        let (token, _) = Token::decode(&raw).unwrap();
        let done = token.as_done().unwrap();
        assert_eq!(token.token_type(), TokenType::DoneProc);
        assert!(done.has_more());
        assert!(done.is_attention_ack());
        assert!(done.has_error());
        assert_eq!(done.row_count(), Some(42));
    }

    #[test]
    fn test_unknown_tag_is_fatal() {
        assert_eq!(
            Token::decode(&[0x42, 0, 0]).unwrap_err(),
            ProtocolError::InvalidTokenType(0x42)
        );
        assert_eq!(
            Token::required_len(&[0x42]).unwrap_err(),
            ProtocolError::InvalidTokenType(0x42)
        );
    }

    #[test]
    fn test_required_len() {
        assert_eq!(Token::required_len(&[]).unwrap(), Some(1));
        assert_eq!(Token::required_len(&[0xFD]).unwrap(), Some(13));
        assert_eq!(Token::required_len(&[0x79]).unwrap(), Some(5));
        assert_eq!(Token::required_len(&[0xD1]).unwrap(), Some(1));
        assert_eq!(Token::required_len(&[0xAA, 0x10]).unwrap(), Some(3));
        assert_eq!(Token::required_len(&[0xAA, 0x10, 0x00]).unwrap(), Some(19));
        assert_eq!(Token::required_len(&[0x81, 0x01]).unwrap(), None);
    }

    #[test]
    fn test_server_message_roundtrip() {
        let msg = ServerMessage {
            number: 208,
            state: 1,
            class: 16,
            message: "Invalid object name 'nope'.".into(),
            server: "db01".into(),
            procedure: String::new(),
            line: 1,
        };
        let raw = encoded(&Token::Error(msg.clone()));
        assert_eq!(Token::required_len(&raw).unwrap(), Some(raw.len()));
        let (token, consumed) = Token::decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(token, Token::Error(msg));
    }

    #[test]
    fn test_length_prefixed_body_too_short_is_malformed() {
        // INFO declaring 4 body bytes, which cannot hold a message
        let raw = [0xAB, 0x04, 0x00, 1, 0, 0, 0];
        assert_eq!(
            Token::decode(&raw).unwrap_err(),
            ProtocolError::Malformed("INFO token")
        );
    }

    #[test]
    fn test_login_ack_and_env_change() {
        let ack = LoginAck {
            interface: 1,
            tds_version: 0x7400_0004,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: 0x1000_0FA0,
        };
        let raw = encoded(&Token::LoginAck(ack.clone()));
        assert_eq!(&raw[4..8], &[0x74, 0x00, 0x00, 0x04]);
        assert_eq!(Token::decode(&raw).unwrap().0, Token::LoginAck(ack));

        let env = EnvChange::string(EnvChangeType::PacketSize, "8192", "4096");
        let raw = encoded(&Token::EnvChange(env.clone()));
        let (token, _) = Token::decode(&raw).unwrap();
        let Token::EnvChange(decoded) = token else {
            panic!("expected ENVCHANGE");
        };
        assert_eq!(decoded, env);
        assert_eq!(decoded.new_packet_size(), Some(8192));
    }

    #[test]
    fn test_env_change_binary_and_unknown() {
        let env = EnvChange {
            env_type: EnvChangeType::BeginTransaction,
            new_value: EnvChangeValue::Binary(Bytes::from_static(&[1, 2, 3, 4, 5, 6, 7, 8])),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        };
        let raw = encoded(&Token::EnvChange(env.clone()));
        assert_eq!(Token::decode(&raw).unwrap().0, Token::EnvChange(env));

        // type 13 (real-time log shipping) is kept raw
        let raw = [0xE3, 0x03, 0x00, 13, 0xAA, 0xBB];
        let (token, consumed) = Token::decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        let Token::EnvChange(env) = token else {
            panic!("expected ENVCHANGE");
        };
        assert_eq!(env.env_type, EnvChangeType::Other(13));
    }

    #[test]
    fn test_routing_env_change() {
        let env = EnvChange {
            env_type: EnvChangeType::Routing,
            new_value: EnvChangeValue::Routing {
                host: "replica.local".into(),
                port: 1433,
            },
            old_value: EnvChangeValue::Binary(Bytes::new()),
        };
        let mut raw = Vec::new();
        env.encode(&mut raw);
        let (token, consumed) = Token::decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        let Token::EnvChange(decoded) = token else {
            panic!("expected ENVCHANGE");
        };
        assert_eq!(decoded.routing_info(), Some(("replica.local", 1433)));
    }

    #[test]
    fn test_colmetadata_roundtrip() {
        let meta = sample_metadata();
        let raw = encoded(&Token::ColMetaData(Arc::new(meta.clone())));
        let (token, consumed) = Token::decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        let Token::ColMetaData(decoded) = token else {
            panic!("expected COLMETADATA");
        };
        assert_eq!(*decoded, meta);
        assert_eq!(decoded.columns[1].length_kind(), LengthKind::UShort);
        assert_eq!(decoded.columns[2].length_kind(), LengthKind::Plp);
    }

    #[test]
    fn test_colmetadata_no_metadata() {
        let (token, consumed) = Token::decode(&[0x81, 0xFF, 0xFF]).unwrap();
        assert_eq!(consumed, 3);
        let Token::ColMetaData(meta) = token else {
            panic!("expected COLMETADATA");
        };
        assert!(meta.is_empty());
    }

    #[test]
    fn test_colmetadata_tvp_unsupported() {
        let raw = [0x81, 0x01, 0x00, 0, 0, 0, 0, 0x01, 0x00, 0xF3, 0x00];
        assert_eq!(
            Token::decode(&raw).unwrap_err(),
            ProtocolError::UnsupportedType(0xF3)
        );
        let raw = [0x81, 0x01, 0x00, 0, 0, 0, 0, 0x01, 0x00, 0x99, 0x00];
        assert_eq!(
            Token::decode(&raw).unwrap_err(),
            ProtocolError::UnsupportedType(0x99)
        );
    }

    #[test]
    fn test_return_value_handle() {
        let value = ReturnValue {
            ordinal: 0,
            name: "@handle".into(),
            status: 1,
            user_type: 0,
            flags: ColumnFlags::NULLABLE,
            type_info: TypeInfo::nullable(TypeId::IntN, 4),
            value: Some(Bytes::copy_from_slice(&7i32.to_le_bytes())),
        };
        let raw = encoded(&Token::ReturnValue(value.clone()));
        let (token, consumed) = Token::decode(&raw).unwrap();
        assert_eq!(consumed, raw.len());
        let Token::ReturnValue(decoded) = token else {
            panic!("expected RETURNVALUE");
        };
        assert_eq!(decoded.as_i32(), Some(7));
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_order_and_return_status() {
        let raw = encoded(&Token::Order(Order {
            columns: vec![1, 3],
        }));
        assert_eq!(raw, vec![0xA9, 4, 0, 1, 0, 3, 0]);
        let (token, _) = Token::decode(&[0x79, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
        assert_eq!(token, Token::ReturnStatus(-1));
    }

    #[test]
    fn test_read_value_kinds() {
        let kinds_and_values: [(LengthKind, Option<&[u8]>); 8] = [
            (LengthKind::Fixed(4), Some(&[1, 2, 3, 4])),
            (LengthKind::Byte, None),
            (LengthKind::Byte, Some(&[9])),
            (LengthKind::UShort, None),
            (LengthKind::UShort, Some(b"abc")),
            (LengthKind::Long { text_pointer: true }, Some(b"text")),
            (LengthKind::Long { text_pointer: true }, None),
            (LengthKind::Plp, Some(b"plp value")),
        ];
        for (kind, value) in kinds_and_values {
            let mut buf = Vec::new();
            write_value(&mut buf, kind, value);
            let mut src = &buf[..];
            let decoded = read_value(&mut src, kind).unwrap();
            assert_eq!(decoded.as_deref(), value, "{kind:?}");
            assert!(src.is_empty());
        }
    }

    #[test]
    fn test_plp_multiple_chunks_and_null() {
        let mut buf = Vec::new();
        buf.write_u64_le(5);
        buf.write_u32_le(2);
        buf.write_bytes(b"he");
        buf.write_u32_le(3);
        buf.write_bytes(b"llo");
        buf.write_u32_le(0);
        assert_eq!(
            read_value(&mut &buf[..], LengthKind::Plp).unwrap().as_deref(),
            Some(&b"hello"[..])
        );

        let null = PLP_NULL.to_le_bytes();
        assert_eq!(read_value(&mut &null[..], LengthKind::Plp).unwrap(), None);
    }

    fn token_stream() -> Vec<u8> {
        let mut buf = Vec::new();
        for token in [
            Token::EnvChange(EnvChange::string(EnvChangeType::Database, "app", "master")),
            Token::ColMetaData(Arc::new(sample_metadata())),
            Token::Info(ServerMessage {
                number: 5701,
                message: "Changed database context".into(),
                ..ServerMessage::default()
            }),
            Token::ReturnStatus(0),
            Token::Done(Done {
                status: DoneStatus::COUNT,
                cur_cmd: 0xC1,
                row_count: 3,
            }),
        ] {
            token.encode(&mut buf);
        }
        buf
    }

    proptest! {
        #[test]
        fn prop_prefixes_never_overconsume(cut in 0usize..200) {
            let stream = token_stream();
            let mut offset = 0;
            while offset < stream.len() {
                let (_, full) = Token::decode(&stream[offset..]).unwrap();
                let end = (offset + cut.min(full)).min(stream.len());
                let prefix = &stream[offset..end];
                match Token::decode(prefix) {
                    Ok((_, consumed)) => prop_assert_eq!(consumed, full),
                    Err(e) => prop_assert!(e.is_incomplete(), "{:?}", e),
                }
                if let Some(needed) = Token::required_len(prefix).unwrap() {
                    prop_assert!(needed <= full);
                }
                offset += full;
            }
        }
    }
}
