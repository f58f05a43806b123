//! Buffer-writer abstraction for message bodies.
//!
//! Request bodies are written through [`BufferWriter`] rather than directly
//! into a `BufMut`, so the same encoding code can target a plain growable
//! buffer (tests, fuzzing, the mock server) or the packet framing writer,
//! which slices the bytes into wire packets as they arrive.

use bytes::BytesMut;

/// A sink for primitive, string, and raw writes.
///
/// Implementors provide [`write_bytes`](BufferWriter::write_bytes); the
/// remaining methods encode TDS primitives (little-endian integers and
/// UTF-16LE strings) on top of it.
pub trait BufferWriter {
    /// Append raw bytes.
    fn write_bytes(&mut self, src: &[u8]);

    /// Append a single byte.
    fn write_u8(&mut self, value: u8) {
        self.write_bytes(&[value]);
    }

    /// Append a little-endian `u16`.
    fn write_u16_le(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a little-endian `u32`.
    fn write_u32_le(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a little-endian `u64`.
    fn write_u64_le(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a little-endian `i32`.
    fn write_i32_le(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a little-endian `i64`.
    fn write_i64_le(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a little-endian `f64`.
    fn write_f64_le(&mut self, value: f64) {
        self.write_bytes(&value.to_le_bytes());
    }

    /// Append a string as UTF-16LE without a length prefix.
    fn write_utf16(&mut self, s: &str) {
        write_units(self, s.encode_utf16());
    }

    /// Append a string with a 1-byte character-count prefix (`B_VARCHAR`).
    ///
    /// Strings longer than 255 UTF-16 code units are truncated; callers that
    /// cannot accept truncation validate lengths first.
    fn write_b_varchar(&mut self, s: &str) {
        let len = s.encode_utf16().count().min(u8::MAX as usize);
        self.write_u8(len as u8);
        write_units(self, s.encode_utf16().take(len));
    }

    /// Append a string with a 2-byte character-count prefix (`US_VARCHAR`).
    fn write_us_varchar(&mut self, s: &str) {
        let len = s.encode_utf16().count().min(u16::MAX as usize);
        self.write_u16_le(len as u16);
        write_units(self, s.encode_utf16().take(len));
    }
}

/// Bytes staged on the stack per `write_bytes` call when encoding UTF-16.
const UTF16_CHUNK: usize = 256;

fn write_units<W: BufferWriter + ?Sized>(dst: &mut W, units: impl Iterator<Item = u16>) {
    let mut chunk = [0u8; UTF16_CHUNK];
    let mut filled = 0;
    for unit in units {
        chunk[filled..filled + 2].copy_from_slice(&unit.to_le_bytes());
        filled += 2;
        if filled == UTF16_CHUNK {
            dst.write_bytes(&chunk);
            filled = 0;
        }
    }
    if filled > 0 {
        dst.write_bytes(&chunk[..filled]);
    }
}

impl BufferWriter for BytesMut {
    fn write_bytes(&mut self, src: &[u8]) {
        self.extend_from_slice(src);
    }
}

impl BufferWriter for Vec<u8> {
    fn write_bytes(&mut self, src: &[u8]) {
        self.extend_from_slice(src);
    }
}

impl<W: BufferWriter + ?Sized> BufferWriter for &mut W {
    fn write_bytes(&mut self, src: &[u8]) {
        (**self).write_bytes(src);
    }
}

/// Counts bytes without storing them.
///
/// Lets callers size a body (for example an `ALL_HEADERS` block or a
/// parameter value) before writing it for real.
#[derive(Debug, Default, Clone, Copy)]
pub struct LengthCounter(pub usize);

impl BufferWriter for LengthCounter {
    fn write_bytes(&mut self, src: &[u8]) {
        self.0 += src.len();
    }
}
