//! Column access within a row.
//!
//! Row values are not framed as a whole: each column carries its own length
//! prefix, chosen by the column's type. Reading column `k` therefore walks the
//! columns before it, skipping each by its prefix. Only the requested value
//! is copied out. Long and PLP values are consumed in pieces no larger than
//! what is buffered, so skipping them never grows the receive buffer.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tds_protocol::token::PLP_NULL;
use tds_protocol::{ColMetaData, ColumnData, LengthKind};
use tokio::io::AsyncRead;

use crate::error::CodecError;
use crate::read_buffer::ReadBuffer;
use crate::token_reader::TokenReader;

/// Cursor over the columns of the current row.
///
/// Columns are read in increasing order; a column behind the cursor can no
/// longer be read.
#[derive(Debug)]
pub struct RowReader<'a, R> {
    reader: &'a mut TokenReader<R>,
    metadata: Arc<ColMetaData>,
}

impl<'a, R> RowReader<'a, R> {
    pub(crate) fn new(reader: &'a mut TokenReader<R>) -> Self {
        let metadata = reader.metadata.clone().unwrap_or_default();
        Self { reader, metadata }
    }

    /// Number of columns in the row.
    #[must_use]
    pub fn column_count(&self) -> usize {
        self.metadata.column_count()
    }

    /// Metadata of column `k`.
    #[must_use]
    pub fn column_info(&self, k: usize) -> Option<&ColumnData> {
        self.metadata.columns.get(k)
    }

    /// Index of the next readable column.
    #[must_use]
    pub fn position(&self) -> usize {
        self.reader.next_column.unwrap_or(self.column_count())
    }
}

impl<R: AsyncRead + Unpin> RowReader<'_, R> {
    /// Read the value of column `k`; `None` is SQL NULL.
    pub async fn column(&mut self, k: usize) -> Result<Option<Bytes>, CodecError> {
        let count = self.column_count();
        let cursor = self.position();
        if k < cursor || k >= count {
            return Err(CodecError::ColumnOutOfOrder {
                requested: k,
                cursor,
                count,
            });
        }
        for (offset, column) in self.metadata.columns[cursor..k].iter().enumerate() {
            skip_value(&mut self.reader.buffer, column.length_kind()).await?;
            self.reader.next_column = Some(cursor + offset + 1);
        }
        let kind = self.metadata.columns[k].length_kind();
        let value = read_value(&mut self.reader.buffer, kind).await?;
        self.reader.next_column = Some(k + 1);
        Ok(value)
    }

    /// Read every remaining column in order.
    pub async fn remaining(&mut self) -> Result<Vec<Option<Bytes>>, CodecError> {
        let mut values = Vec::with_capacity(self.column_count() - self.position());
        for k in self.position()..self.column_count() {
            values.push(self.column(k).await?);
        }
        Ok(values)
    }
}

/// Skip one value without materializing it.
pub(crate) async fn skip_value<R: AsyncRead + Unpin>(
    buffer: &mut ReadBuffer<R>,
    kind: LengthKind,
) -> Result<(), CodecError> {
    visit_value(buffer, kind, None).await.map(|_| ())
}

/// Read one value.
pub(crate) async fn read_value<R: AsyncRead + Unpin>(
    buffer: &mut ReadBuffer<R>,
    kind: LengthKind,
) -> Result<Option<Bytes>, CodecError> {
    let mut value = BytesMut::new();
    let present = visit_value(buffer, kind, Some(&mut value)).await?;
    Ok(present.then(|| value.freeze()))
}

/// Walk one value, copying its bytes into `sink` when given.
///
/// Returns `false` for NULL.
async fn visit_value<R: AsyncRead + Unpin>(
    buffer: &mut ReadBuffer<R>,
    kind: LengthKind,
    mut sink: Option<&mut BytesMut>,
) -> Result<bool, CodecError> {
    match kind {
        LengthKind::Fixed(0) => Ok(false),
        LengthKind::Fixed(n) => {
            consume(buffer, n as usize, sink).await?;
            Ok(true)
        }
        LengthKind::Byte => {
            let len = prefix(buffer, 1).await? as usize;
            if len == 0 {
                return Ok(false);
            }
            consume(buffer, len, sink).await?;
            Ok(true)
        }
        LengthKind::UShort => {
            let len = prefix(buffer, 2).await?;
            if len == 0xFFFF {
                return Ok(false);
            }
            consume(buffer, len as usize, sink).await?;
            Ok(true)
        }
        LengthKind::Long { text_pointer } => {
            if text_pointer {
                let pointer_len = prefix(buffer, 1).await? as usize;
                if pointer_len == 0 {
                    return Ok(false);
                }
                // text pointer and timestamp
                consume(buffer, pointer_len + 8, None).await?;
            }
            let len = prefix(buffer, 4).await? as usize;
            if len == 0 && !text_pointer {
                return Ok(false);
            }
            consume(buffer, len, sink).await?;
            Ok(true)
        }
        LengthKind::Plp => {
            let total = prefix(buffer, 8).await?;
            if total == PLP_NULL {
                return Ok(false);
            }
            loop {
                let chunk = prefix(buffer, 4).await? as usize;
                if chunk == 0 {
                    return Ok(true);
                }
                consume(buffer, chunk, sink.as_deref_mut()).await?;
            }
        }
    }
}

/// Read and commit a little-endian length prefix of `width` bytes.
async fn prefix<R: AsyncRead + Unpin>(
    buffer: &mut ReadBuffer<R>,
    width: usize,
) -> Result<u64, CodecError> {
    buffer.read_at_least(width).await?;
    let mut raw = [0u8; 8];
    raw[..width].copy_from_slice(&buffer.buffered()[..width]);
    buffer.commit(width);
    Ok(u64::from_le_bytes(raw))
}

/// Commit `len` bytes, copying them into `sink` when given.
async fn consume<R: AsyncRead + Unpin>(
    buffer: &mut ReadBuffer<R>,
    mut len: usize,
    mut sink: Option<&mut BytesMut>,
) -> Result<(), CodecError> {
    if let Some(sink) = sink.as_deref_mut() {
        sink.reserve(len);
    }
    while len > 0 {
        buffer.read_at_least(1).await?;
        let step = len.min(buffer.len());
        if let Some(sink) = sink.as_deref_mut() {
            sink.extend_from_slice(&buffer.buffered()[..step]);
        }
        buffer.commit(step);
        len -= step;
    }
    Ok(())
}
