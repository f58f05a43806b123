//! Streaming token reader.

use std::sync::Arc;

use bytes::Bytes;
use tds_protocol::{ColMetaData, ProtocolError, Token};
use tokio::io::AsyncRead;

use crate::error::CodecError;
use crate::packet_reader::PacketReader;
use crate::read_buffer::ReadBuffer;
use crate::row_reader::{self, RowReader};

/// Reads response tokens from a packet stream.
///
/// The reader remembers the most recent column metadata. After a `ROW`
/// token it is in row mode: column values follow the tag in the stream and
/// are read through [`row`](Self::row). Asking for the next token skips
/// whatever is left of the current row.
#[derive(Debug)]
pub struct TokenReader<R> {
    pub(crate) buffer: ReadBuffer<PacketReader<R>>,
    pub(crate) metadata: Option<Arc<ColMetaData>>,
    /// Index of the next unread column while in row mode.
    pub(crate) next_column: Option<usize>,
}

impl<R> TokenReader<R> {
    /// Read responses from `inner` with a receive buffer of `capacity` bytes.
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            buffer: ReadBuffer::with_capacity(PacketReader::new(inner), capacity),
            metadata: None,
            next_column: None,
        }
    }

    /// Column metadata of the current result set.
    #[must_use]
    pub fn metadata(&self) -> Option<&Arc<ColMetaData>> {
        self.metadata.as_ref()
    }

    /// Whether the reader is positioned inside a row.
    #[must_use]
    pub fn in_row(&self) -> bool {
        self.next_column.is_some()
    }

    /// The packet layer, for message-boundary bookkeeping.
    #[must_use]
    pub fn packet_reader(&self) -> &PacketReader<R> {
        self.buffer.get_ref()
    }

    /// Get a mutable reference to the transport.
    pub fn get_mut(&mut self) -> &mut R {
        self.buffer.get_mut().get_mut()
    }

    /// Consume the reader, returning the transport.
    pub fn into_inner(self) -> R {
        self.buffer.into_inner().into_inner()
    }
}

impl<R: AsyncRead + Unpin> TokenReader<R> {
    /// Read the next token.
    ///
    /// End of stream is [`CodecError::ConnectionClosed`]; any other error
    /// leaves the stream at an unknown position.
    pub async fn next_token(&mut self) -> Result<Token, CodecError> {
        // A dropped `read_message` may have left the packet layer yielding.
        self.buffer.get_mut().set_yield_at_message_end(false);
        self.skip_row().await?;

        let (token, used) = loop {
            let buffered = self.buffer.buffered();
            if let Some(needed) = Token::required_len(buffered)? {
                if buffered.len() < needed {
                    self.buffer.read_at_least(needed).await?;
                    continue;
                }
            }
            match Token::decode(buffered) {
                Ok(decoded) => break decoded,
                Err(ProtocolError::Incomplete { needed, .. }) => {
                    let needed = needed.max(buffered.len() + 1);
                    self.buffer.read_at_least(needed).await?;
                }
                Err(ProtocolError::UnexpectedEof) => {
                    let needed = buffered.len() + 1;
                    self.buffer.read_at_least(needed).await?;
                }
                Err(e) => return Err(e.into()),
            }
        };
        self.buffer.commit(used);

        tracing::trace!(token_type = ?token.token_type(), len = used, "read token");

        match &token {
            Token::ColMetaData(meta) => {
                self.metadata = Some(Arc::clone(meta));
            }
            Token::Row => {
                if self.metadata.as_ref().is_none_or(|m| m.is_empty()) {
                    return Err(ProtocolError::Malformed("ROW token without column metadata").into());
                }
                self.next_column = Some(0);
            }
            _ => {}
        }
        Ok(token)
    }

    /// Access the values of the current row.
    ///
    /// Returns `None` unless the last token read was `ROW`.
    pub fn row(&mut self) -> Option<RowReader<'_, R>> {
        if self.in_row() {
            Some(RowReader::new(self))
        } else {
            None
        }
    }

    /// Skip the unread columns of the current row, if any.
    pub async fn skip_row(&mut self) -> Result<(), CodecError> {
        if let Some(cursor) = self.next_column {
            let Some(meta) = self.metadata.clone() else {
                self.next_column = None;
                return Ok(());
            };
            for column in &meta.columns[cursor.min(meta.columns.len())..] {
                row_reader::skip_value(&mut self.buffer, column.length_kind()).await?;
            }
            self.next_column = None;
        }
        Ok(())
    }

    /// Read one whole raw message that is not a token stream.
    ///
    /// Used for the PRELOGIN response. Must be called between messages with
    /// nothing buffered.
    pub async fn read_message(&mut self) -> Result<Bytes, CodecError> {
        if self.in_row() || !self.buffer.is_empty() {
            return Err(CodecError::InvalidState(
                "raw message read with token data buffered",
            ));
        }
        let target = self.packet_reader().messages_completed() + 1;
        self.buffer.get_mut().set_yield_at_message_end(true);
        let filled = self.fill_until(target).await;
        self.buffer.get_mut().set_yield_at_message_end(false);
        filled?;
        let len = self.buffer.len();
        Ok(self.buffer.take(len))
    }

    async fn fill_until(&mut self, messages: u64) -> Result<(), CodecError> {
        while self.packet_reader().messages_completed() < messages {
            let read = self.buffer.fill().await?;
            if read == 0 && self.packet_reader().messages_completed() < messages {
                return Err(CodecError::ConnectionClosed);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::{
        ColumnData, Done, DoneStatus, PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
        ServerMessage, TypeId, TypeInfo, token::write_value,
    };
    use tokio_test::io::Builder;

    fn wrap_packets(payload: &[u8], packet_payload: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let chunks: Vec<&[u8]> = if payload.is_empty() {
            vec![&[]]
        } else {
            payload.chunks(packet_payload).collect()
        };
        for (i, chunk) in chunks.iter().enumerate() {
            let status = if i == chunks.len() - 1 {
                PacketStatus::END_OF_MESSAGE
            } else {
                PacketStatus::NORMAL
            };
            PacketHeader::new(
                PacketType::TabularResult,
                status,
                (PACKET_HEADER_SIZE + chunk.len()) as u16,
            )
            .with_packet_id(i as u8)
            .encode(&mut out);
            out.extend_from_slice(chunk);
        }
        out
    }

    fn result_set() -> Vec<u8> {
        let meta = ColMetaData {
            columns: vec![
                ColumnData::new("id", TypeInfo::nullable(TypeId::IntN, 4)),
                ColumnData::new("name", TypeInfo::nvarchar(100)),
                ColumnData::new("blob", TypeInfo::varbinary(0xFFFF)),
            ],
        };
        let mut stream = Vec::new();
        Token::ColMetaData(Arc::new(meta.clone())).encode(&mut stream);
        for (id, name) in [(1i32, "one"), (2, "two")] {
            Token::Row.encode(&mut stream);
            let kinds: Vec<_> = meta.columns.iter().map(|c| c.length_kind()).collect();
            write_value(&mut stream, kinds[0], Some(&id.to_le_bytes()));
            let name: Vec<u8> = name.encode_utf16().flat_map(u16::to_le_bytes).collect();
            write_value(&mut stream, kinds[1], Some(&name));
            write_value(&mut stream, kinds[2], Some(&vec![id as u8; 300]));
        }
        Token::Info(ServerMessage {
            number: 5701,
            message: "changed database context".into(),
            ..ServerMessage::default()
        })
        .encode(&mut stream);
        Token::Done(Done {
            status: DoneStatus::COUNT,
            cur_cmd: 0xC1,
            row_count: 2,
        })
        .encode(&mut stream);
        stream
    }

    /// Read every token, taking column 1 of each row.
    async fn collect<R: AsyncRead + Unpin>(reader: &mut TokenReader<R>) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            let token = reader.next_token().await.unwrap();
            let done = matches!(&token, Token::Done(d) if !d.has_more());
            seen.push(format!("{:?}", token.token_type()));
            if let Some(mut row) = reader.row() {
                let name = row.column(1).await.unwrap().unwrap();
                seen.push(format!("{name:?}"));
            }
            if done {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn test_reads_tokens_and_rows() {
        let wire = wrap_packets(&result_set(), 504);
        let mut reader = TokenReader::new(&wire[..], 64);
        let seen = collect(&mut reader).await;
        assert_eq!(seen.len(), 7);
        assert_eq!(seen[0], "ColMetaData");
        assert_eq!(seen[1], "Row");
        assert_eq!(seen[6], "Done");
        assert_eq!(reader.packet_reader().messages_completed(), 1);
    }

    #[tokio::test]
    async fn test_one_byte_chunks_match_contiguous() {
        let wire = wrap_packets(&result_set(), 100);
        let mut contiguous = TokenReader::new(&wire[..], 4096);
        let expected = collect(&mut contiguous).await;

        let mut builder = Builder::new();
        for b in &wire {
            builder.read(std::slice::from_ref(b));
        }
        let mut chunked = TokenReader::new(builder.build(), 32);
        assert_eq!(collect(&mut chunked).await, expected);
    }

    #[tokio::test]
    async fn test_row_without_metadata_is_malformed() {
        let wire = wrap_packets(&[0xD1], 504);
        let mut reader = TokenReader::new(&wire[..], 64);
        let err = reader.next_token().await.unwrap_err();
        assert!(matches!(err, CodecError::Protocol(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_unknown_tag_fails_without_waiting() {
        let wire = wrap_packets(&[0x42], 504);
        let mut reader = TokenReader::new(&wire[..], 64);
        let err = reader.next_token().await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Protocol(ProtocolError::InvalidTokenType(0x42))
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_connection_closed() {
        let stream = result_set();
        let wire = wrap_packets(&stream[..stream.len() - 3], 504);
        let mut reader = TokenReader::new(&wire[..], 64);
        let err = loop {
            match reader.next_token().await {
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_read_raw_message() {
        let mut wire = wrap_packets(&[1, 2, 3, 4, 5, 6], 4);
        wire.extend(wrap_packets(&result_set(), 504));
        let mut reader = TokenReader::new(&wire[..], 64);
        let raw = reader.read_message().await.unwrap();
        assert_eq!(&raw[..], &[1, 2, 3, 4, 5, 6]);
        assert!(matches!(reader.next_token().await.unwrap(), Token::ColMetaData(_)));
    }

    #[tokio::test]
    async fn test_raw_message_with_empty_final_packet() {
        let (mut server, client) = tokio::io::duplex(256);
        let mut wire = wrap_packets(&[1, 2, 3], 504);
        // Clear end-of-message and follow with an empty closing packet.
        wire[1] = PacketStatus::NORMAL.bits();
        wire.extend(wrap_packets(&[], 504));
        tokio::io::AsyncWriteExt::write_all(&mut server, &wire)
            .await
            .unwrap();

        let mut reader = TokenReader::new(client, 64);
        let raw = tokio::time::timeout(std::time::Duration::from_secs(1), reader.read_message())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&raw[..], &[1, 2, 3]);
        assert!(reader.packet_reader().at_message_boundary());
        drop(server);
    }
}
