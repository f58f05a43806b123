//! Resumable receive buffer.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CodecError;

/// Default receive buffer capacity.
pub const DEFAULT_READ_CAPACITY: usize = 8192;

/// A receive buffer that only releases bytes when the consumer commits them.
///
/// Parsers call [`read_at_least`](Self::read_at_least) to make sure an item is
/// fully buffered, inspect [`buffered`](Self::buffered), and
/// [`commit`](Self::commit) the bytes they consumed. A parse that runs short
/// commits nothing and is retried from the same offset after the next read.
#[derive(Debug)]
pub struct ReadBuffer<R> {
    inner: R,
    buf: BytesMut,
    capacity: usize,
}

impl<R> ReadBuffer<R> {
    /// Wrap a reader with the default capacity.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_READ_CAPACITY)
    }

    /// Wrap a reader with the given capacity.
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Nominal capacity. A single item larger than this grows the buffer.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Uncommitted bytes.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Number of uncommitted bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Release `n` consumed bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the buffered length.
    pub fn commit(&mut self, n: usize) {
        self.buf.advance(n);
    }

    /// Remove and return the first `n` buffered bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the buffered length.
    pub fn take(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Get a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Get a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Consume the buffer, returning the reader. Buffered bytes are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> ReadBuffer<R> {
    /// Make sure at least `n` uncommitted bytes are buffered.
    ///
    /// Returns immediately when they already are. Hitting end of stream
    /// first is [`CodecError::ConnectionClosed`].
    pub async fn read_at_least(&mut self, n: usize) -> Result<(), CodecError> {
        if self.buf.len() >= n {
            return Ok(());
        }
        // `reserve` reclaims the committed prefix before allocating.
        self.buf.reserve(n.max(self.capacity) - self.buf.len());
        while self.buf.len() < n {
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(CodecError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Read whatever the transport has, up to the free capacity.
    ///
    /// Returns the number of bytes added; `0` means end of stream.
    pub async fn fill(&mut self) -> Result<usize, CodecError> {
        self.buf.reserve(self.capacity.saturating_sub(self.buf.len()).max(1));
        Ok(self.inner.read_buf(&mut self.buf).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_at_least_across_chunks() {
        let mock = Builder::new().read(b"ab").read(b"c").read(b"defg").build();
        let mut buf = ReadBuffer::with_capacity(mock, 16);

        buf.read_at_least(3).await.unwrap();
        assert_eq!(&buf.buffered()[..3], b"abc");

        // Already satisfied: no transport read.
        buf.read_at_least(2).await.unwrap();
        buf.commit(2);
        assert_eq!(buf.buffered(), b"c");

        buf.read_at_least(5).await.unwrap();
        assert_eq!(buf.buffered(), b"cdefg");
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let mock = Builder::new().read(b"ab").build();
        let mut buf = ReadBuffer::with_capacity(mock, 16);
        let err = buf.read_at_least(3).await.unwrap_err();
        assert!(err.is_connection_closed());
        assert_eq!(buf.buffered(), b"ab");
    }

    #[tokio::test]
    async fn test_oversized_item_grows_buffer() {
        let data = vec![7u8; 100];
        let mock = Builder::new().read(&data).build();
        let mut buf = ReadBuffer::with_capacity(mock, 16);
        buf.read_at_least(100).await.unwrap();
        assert_eq!(buf.len(), 100);
    }
}
