//! Token stream fixtures.
//!
//! [`TokenStream`] builds server responses token by token; [`packetize`]
//! frames any payload as a tabular-result message. The mock server answers
//! with these, and reader tests feed them straight into a `TokenReader`.

use bytes::{Bytes, BytesMut};
use tds_codec::{CodecError, PacketWriter};
use tds_protocol::token::write_value;
use tds_protocol::{
    BufferWriter, ColMetaData, ColumnData, Done, DoneStatus, EnvChange, EnvChangeType,
    EnvChangeValue, LoginAck, PacketStatus, PacketType, ReturnValue, ServerMessage, Token,
    TypeInfo,
};

/// TDS 7.4, as reported in LOGINACK.
pub const TDS_74: u32 = 0x7400_0004;

/// Opaque PreLogin body for client configurations pointed at the mock server.
#[must_use]
pub fn prelogin_body() -> Bytes {
    // VERSION option only, then the terminator.
    Bytes::from_static(&[0x00, 0x00, 0x06, 0x00, 0x06, 0xFF, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00])
}

/// PreLogin response: VERSION and ENCRYPTION (not supported).
#[must_use]
pub fn prelogin_response() -> Bytes {
    Bytes::from_static(&[
        0x00, 0x00, 0x0B, 0x00, 0x06, // VERSION
        0x01, 0x00, 0x11, 0x00, 0x01, // ENCRYPTION
        0xFF, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02,
    ])
}

/// Opaque Login7 body for client configurations pointed at the mock server.
///
/// The mock server does not authenticate; any body is accepted.
#[must_use]
pub fn login7_body() -> Bytes {
    let mut body = BytesMut::new();
    body.write_u32_le(0);
    body.write_u32_le(TDS_74);
    body.write_utf16("tds-testing");
    body.freeze()
}

/// Builder for an encoded token stream.
#[derive(Debug, Default, Clone)]
pub struct TokenStream {
    buf: BytesMut,
}

impl TokenStream {
    /// Create an empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append any token.
    #[must_use]
    pub fn token(mut self, token: &Token) -> Self {
        token.encode(&mut self.buf);
        self
    }

    /// Append a database ENVCHANGE.
    #[must_use]
    pub fn database(self, new: &str, old: &str) -> Self {
        self.token(&Token::EnvChange(EnvChange::string(
            EnvChangeType::Database,
            new,
            old,
        )))
    }

    /// Append a packet size ENVCHANGE.
    #[must_use]
    pub fn packet_size(self, size: usize) -> Self {
        let size = size.to_string();
        self.token(&Token::EnvChange(EnvChange::string(
            EnvChangeType::PacketSize,
            &size,
            &size,
        )))
    }

    /// Append a BeginTransaction ENVCHANGE carrying `descriptor`.
    #[must_use]
    pub fn begin_transaction(self, descriptor: u64) -> Self {
        self.token(&Token::EnvChange(EnvChange {
            env_type: EnvChangeType::BeginTransaction,
            new_value: EnvChangeValue::Binary(Bytes::copy_from_slice(
                &descriptor.to_le_bytes(),
            )),
            old_value: EnvChangeValue::Binary(Bytes::new()),
        }))
    }

    /// Append a CommitTransaction ENVCHANGE for `descriptor`.
    #[must_use]
    pub fn commit_transaction(self, descriptor: u64) -> Self {
        self.token(&Token::EnvChange(EnvChange {
            env_type: EnvChangeType::CommitTransaction,
            new_value: EnvChangeValue::Binary(Bytes::new()),
            old_value: EnvChangeValue::Binary(Bytes::copy_from_slice(
                &descriptor.to_le_bytes(),
            )),
        }))
    }

    /// Append an INFO message.
    #[must_use]
    pub fn info(self, number: i32, message: &str) -> Self {
        self.token(&Token::Info(ServerMessage {
            number,
            class: 0,
            message: message.to_owned(),
            ..ServerMessage::default()
        }))
    }

    /// Append an ERROR message.
    #[must_use]
    pub fn error(self, number: i32, class: u8, message: &str) -> Self {
        self.token(&Token::Error(ServerMessage {
            number,
            state: 1,
            class,
            message: message.to_owned(),
            ..ServerMessage::default()
        }))
    }

    /// Append a LOGINACK.
    #[must_use]
    pub fn login_ack(self, prog_name: &str) -> Self {
        self.token(&Token::LoginAck(LoginAck {
            interface: 1,
            tds_version: TDS_74,
            prog_name: prog_name.to_owned(),
            prog_version: 0x1000_0000,
        }))
    }

    /// Append COLMETADATA.
    #[must_use]
    pub fn columns(self, columns: Vec<ColumnData>) -> Self {
        self.token(&Token::ColMetaData(std::sync::Arc::new(ColMetaData {
            columns,
        })))
    }

    /// Append a ROW whose values follow `types`.
    #[must_use]
    pub fn row(mut self, types: &[TypeInfo], values: &[Option<&[u8]>]) -> Self {
        Token::Row.encode(&mut self.buf);
        for (type_info, value) in types.iter().zip(values) {
            write_value(&mut self.buf, type_info.length_kind, *value);
        }
        self
    }

    /// Append a RETURNSTATUS.
    #[must_use]
    pub fn return_status(self, status: i32) -> Self {
        self.token(&Token::ReturnStatus(status))
    }

    /// Append an `INT` output parameter.
    #[must_use]
    pub fn return_int(self, ordinal: u16, name: &str, value: i32) -> Self {
        self.token(&Token::ReturnValue(ReturnValue {
            ordinal,
            name: name.to_owned(),
            status: 0x01,
            user_type: 0,
            flags: tds_protocol::ColumnFlags::NULLABLE,
            type_info: TypeInfo::nullable(tds_protocol::TypeId::IntN, 4),
            value: Some(Bytes::copy_from_slice(&value.to_le_bytes())),
        }))
    }

    /// Append a DONE.
    #[must_use]
    pub fn done(self, status: DoneStatus, row_count: u64) -> Self {
        self.token(&Token::Done(done(status, row_count)))
    }

    /// Append a DONEINPROC.
    #[must_use]
    pub fn done_in_proc(self, status: DoneStatus, row_count: u64) -> Self {
        self.token(&Token::DoneInProc(done(status, row_count)))
    }

    /// Append a DONEPROC.
    #[must_use]
    pub fn done_proc(self, status: DoneStatus, row_count: u64) -> Self {
        self.token(&Token::DoneProc(done(status, row_count)))
    }

    /// Append raw bytes.
    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Encoded length so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The encoded tokens.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

fn done(status: DoneStatus, row_count: u64) -> Done {
    Done {
        status,
        cur_cmd: 0,
        row_count,
    }
}

/// The token sequence a server sends after a successful Login7.
#[must_use]
pub fn login_response(database: &str, packet_size: usize, prog_name: &str) -> Bytes {
    TokenStream::new()
        .database(database, "master")
        .info(5701, &format!("Changed database context to '{database}'."))
        .login_ack(prog_name)
        .packet_size(packet_size)
        .done(DoneStatus::empty(), 0)
        .into_bytes()
}

/// Frame `payload` as a tabular-result message of `packet_size` packets.
pub fn packetize(payload: &[u8], packet_size: usize) -> Result<Bytes, CodecError> {
    let mut writer = PacketWriter::new(packet_size)?;
    let mut message = writer.start_message(PacketType::TabularResult, PacketStatus::NORMAL)?;
    message.write_bytes(payload);
    message.end_message();
    Ok(writer.take_completed())
}
