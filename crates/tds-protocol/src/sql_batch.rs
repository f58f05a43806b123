//! SQL batch request encoding.
//!
//! A SQL batch (packet type 0x01) payload is:
//! - the ALL_HEADERS section, carrying the transaction descriptor,
//! - the SQL text as UTF-16LE, without a length prefix.

use bytes::{Bytes, BytesMut};

use crate::writer::BufferWriter;

/// Size of the ALL_HEADERS block written by [`write_all_headers`].
pub const ALL_HEADERS_LEN: usize = 22;

/// Write the ALL_HEADERS section with a single transaction descriptor header.
///
/// Use `0` as the descriptor in auto-commit mode; inside an explicit
/// transaction it is the value from the BeginTransaction ENVCHANGE.
pub fn write_all_headers(dst: &mut (impl BufferWriter + ?Sized), transaction_descriptor: u64) {
    dst.write_u32_le(ALL_HEADERS_LEN as u32);
    // HeaderLength (4) + HeaderType (2) + descriptor (8) + outstanding requests (4)
    dst.write_u32_le(18);
    dst.write_u16_le(0x0002);
    dst.write_u64_le(transaction_descriptor);
    dst.write_u32_le(1);
}

/// A SQL batch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBatch {
    sql: String,
    transaction_descriptor: u64,
}

impl SqlBatch {
    /// Create an auto-commit batch.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            transaction_descriptor: 0,
        }
    }

    /// Run the batch inside the given transaction.
    #[must_use]
    pub fn with_transaction(mut self, descriptor: u64) -> Self {
        self.transaction_descriptor = descriptor;
        self
    }

    /// Get the SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Write the payload.
    pub fn write_body(&self, dst: &mut (impl BufferWriter + ?Sized)) {
        write_all_headers(dst, self.transaction_descriptor);
        dst.write_utf16(&self.sql);
    }

    /// Encode the payload into a new buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + self.sql.len() * 2);
        self.write_body(&mut buf);
        buf.freeze()
    }
}

/// Encode an auto-commit SQL batch payload.
///
/// ```
/// use tds_protocol::sql_batch::encode_sql_batch;
///
/// let payload = encode_sql_batch("SELECT 1");
/// assert_eq!(payload.len(), 22 + 16);
/// ```
#[must_use]
pub fn encode_sql_batch(sql: &str) -> Bytes {
    SqlBatch::new(sql).encode()
}
