//! Client-to-server messages.

use bytes::Bytes;
use tds_protocol::{BufferWriter, PacketType, RpcRequest, SqlBatch};

/// A logical message sent by the client.
///
/// PreLogin and Login7 bodies are produced by the handshake layer and carried
/// as opaque bytes.
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// PRELOGIN negotiation body.
    PreLogin(Bytes),
    /// LOGIN7 body.
    Login7(Bytes),
    /// SQL text batch.
    SqlBatch(SqlBatch),
    /// Remote procedure call.
    Rpc(RpcRequest),
    /// Cancel the request in flight. Has no body.
    Attention,
}

impl FrontendMessage {
    /// Packet type carrying this message.
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::PreLogin(_) => PacketType::PreLogin,
            Self::Login7(_) => PacketType::Login7,
            Self::SqlBatch(_) => PacketType::SqlBatch,
            Self::Rpc(_) => PacketType::Rpc,
            Self::Attention => PacketType::Attention,
        }
    }

    /// Write the message body.
    pub fn write_body(&self, dst: &mut impl BufferWriter) {
        match self {
            Self::PreLogin(body) | Self::Login7(body) => dst.write_bytes(body),
            Self::SqlBatch(batch) => batch.write_body(dst),
            Self::Rpc(request) => request.write_body(dst),
            Self::Attention => {}
        }
    }
}

impl From<SqlBatch> for FrontendMessage {
    fn from(batch: SqlBatch) -> Self {
        Self::SqlBatch(batch)
    }
}

impl From<RpcRequest> for FrontendMessage {
    fn from(request: RpcRequest) -> Self {
        Self::Rpc(request)
    }
}
