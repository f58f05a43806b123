//! Header-stripping reader over the response packet stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project_lite::pin_project;
use tds_protocol::{MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketType};
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::CodecError;

pin_project! {
    /// An `AsyncRead` adapter that removes TDS packet headers.
    ///
    /// Consumers see the payloads of consecutive packets as one continuous
    /// byte stream. Each poll returns bytes from at most one packet, so a
    /// caller can observe message boundaries through
    /// [`messages_completed`](Self::messages_completed).
    #[derive(Debug)]
    pub struct PacketReader<R> {
        #[pin]
        inner: R,
        header: [u8; PACKET_HEADER_SIZE],
        header_filled: usize,
        remaining: usize,
        end_of_message: bool,
        in_message: bool,
        messages_completed: u64,
        yield_at_message_end: bool,
        expected_type: PacketType,
        max_packet_size: usize,
    }
}

impl<R> PacketReader<R> {
    /// Read server responses (tabular result packets).
    pub fn new(inner: R) -> Self {
        Self::with_packet_type(inner, PacketType::TabularResult)
    }

    /// Read packets of the given type.
    pub fn with_packet_type(inner: R, expected_type: PacketType) -> Self {
        Self {
            inner,
            header: [0; PACKET_HEADER_SIZE],
            header_filled: 0,
            remaining: 0,
            end_of_message: false,
            in_message: false,
            messages_completed: 0,
            yield_at_message_end: false,
            expected_type,
            max_packet_size: MAX_PACKET_SIZE,
        }
    }

    /// Number of messages whose last payload byte has been returned.
    #[must_use]
    pub fn messages_completed(&self) -> u64 {
        self.messages_completed
    }

    /// Return from a read as soon as a message ends, even with no payload
    /// bytes to hand out.
    ///
    /// A message that closes with an empty end-of-message packet then shows
    /// up as a zero-length read with
    /// [`messages_completed`](Self::messages_completed) advanced, instead of
    /// the reader waiting on the next header.
    pub fn set_yield_at_message_end(&mut self, enabled: bool) {
        self.yield_at_message_end = enabled;
    }

    /// Whether the reader is between messages.
    #[must_use]
    pub fn at_message_boundary(&self) -> bool {
        !self.in_message
    }

    /// Get a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Get a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the adapter, returning the reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn invalid(err: CodecError) -> io::Error {
    err.into()
}

impl<R: AsyncRead> AsyncRead for PacketReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            if *this.remaining > 0 {
                let want = (*this.remaining).min(buf.remaining());
                let n = {
                    let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(want));
                    ready!(this.inner.as_mut().poll_read(cx, &mut chunk))?;
                    chunk.filled().len()
                };
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                buf.advance(n);
                *this.remaining -= n;
                if *this.remaining == 0 && *this.end_of_message {
                    *this.messages_completed += 1;
                    *this.in_message = false;
                }
                return Poll::Ready(Ok(()));
            }

            while *this.header_filled < PACKET_HEADER_SIZE {
                let mut rest = ReadBuf::new(&mut this.header[*this.header_filled..]);
                ready!(this.inner.as_mut().poll_read(cx, &mut rest))?;
                let n = rest.filled().len();
                if n == 0 {
                    if *this.header_filled == 0 && !*this.in_message {
                        // Clean end of stream between messages.
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                *this.header_filled += n;
            }
            *this.header_filled = 0;

            let header = PacketHeader::decode(&mut &this.header[..])
                .map_err(|e| invalid(CodecError::Protocol(e)))?;
            let length = header.length as usize;
            if length < PACKET_HEADER_SIZE {
                return Poll::Ready(Err(invalid(CodecError::InvalidHeader)));
            }
            if length > *this.max_packet_size {
                return Poll::Ready(Err(invalid(CodecError::PacketTooLarge {
                    size: length,
                    max: *this.max_packet_size,
                })));
            }
            if header.packet_type != *this.expected_type {
                return Poll::Ready(Err(invalid(CodecError::UnexpectedPacketType {
                    expected: *this.expected_type,
                    actual: header.packet_type,
                })));
            }

            tracing::trace!(
                packet_type = ?header.packet_type,
                length,
                packet_id = header.packet_id,
                is_eom = header.is_end_of_message(),
                "read packet header"
            );

            *this.remaining = header.payload_length();
            *this.end_of_message = header.is_end_of_message();
            *this.in_message = true;
            if *this.remaining == 0 && *this.end_of_message {
                *this.messages_completed += 1;
                *this.in_message = false;
                if *this.yield_at_message_end {
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tds_protocol::PacketStatus;
    use tokio::io::AsyncReadExt;
    use tokio_test::io::Builder;

    fn packet(status: PacketStatus, id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = PacketHeader::new(
            PacketType::TabularResult,
            status,
            (PACKET_HEADER_SIZE + payload.len()) as u16,
        )
        .with_packet_id(id)
        .encode_to_bytes()
        .to_vec();
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_strips_headers_across_packets() {
        let mut wire = packet(PacketStatus::NORMAL, 0, b"hello ");
        wire.extend(packet(PacketStatus::END_OF_MESSAGE, 1, b"world"));

        let mut reader = PacketReader::new(&wire[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(reader.messages_completed(), 1);
        assert!(reader.at_message_boundary());
    }

    #[tokio::test]
    async fn test_one_byte_transport_chunks() {
        let wire = packet(PacketStatus::END_OF_MESSAGE, 0, b"abc");
        let mut builder = Builder::new();
        for b in &wire {
            builder.read(std::slice::from_ref(b));
        }
        let mut reader = PacketReader::new(builder.build());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_empty_final_packet_ends_message() {
        let (mut server, client) = tokio::io::duplex(256);
        let mut wire = packet(PacketStatus::NORMAL, 0, &[1, 2, 3]);
        wire.extend(packet(PacketStatus::END_OF_MESSAGE, 1, b""));
        tokio::io::AsyncWriteExt::write_all(&mut server, &wire)
            .await
            .unwrap();

        let mut reader = PacketReader::new(client);
        reader.set_yield_at_message_end(true);
        let mut out = [0u8; 16];
        assert_eq!(reader.read(&mut out).await.unwrap(), 3);
        assert_eq!(reader.messages_completed(), 0);

        // The transport stays open; the empty packet alone ends the read.
        let n = tokio::time::timeout(std::time::Duration::from_secs(1), reader.read(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(reader.messages_completed(), 1);
        assert!(reader.at_message_boundary());
        drop(server);
    }

    #[tokio::test]
    async fn test_empty_packets_are_skipped_in_token_streams() {
        let mut wire = packet(PacketStatus::END_OF_MESSAGE, 0, b"");
        wire.extend(packet(PacketStatus::END_OF_MESSAGE, 0, b"next"));
        let mut reader = PacketReader::new(&wire[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"next");
        assert_eq!(reader.messages_completed(), 2);
    }

    #[tokio::test]
    async fn test_rejects_wrong_packet_type() {
        let wire = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 8)
            .encode_to_bytes();
        let mut reader = PacketReader::new(&wire[..]);
        let mut out = Vec::new();
        let err = CodecError::from(reader.read_to_end(&mut out).await.unwrap_err());
        assert!(matches!(err, CodecError::UnexpectedPacketType { .. }));
    }

    #[tokio::test]
    async fn test_truncated_header_is_eof() {
        let wire = [0x04u8, 0x01, 0x00];
        let mut reader = PacketReader::new(&wire[..]);
        let mut out = Vec::new();
        let err = CodecError::from(reader.read_to_end(&mut out).await.unwrap_err());
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_short_length_is_invalid() {
        let mut wire = packet(PacketStatus::END_OF_MESSAGE, 0, b"");
        wire[3] = 4;
        let mut reader = PacketReader::new(&wire[..]);
        let mut out = Vec::new();
        let err = CodecError::from(reader.read_to_end(&mut out).await.unwrap_err());
        assert!(matches!(
            err,
            CodecError::InvalidHeader | CodecError::Protocol(_)
        ));
    }
}
