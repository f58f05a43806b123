//! Codec utilities for TDS protocol decoding.
//!
//! Low-level string readers shared by the token decoders. Writers live on
//! [`BufferWriter`](crate::writer::BufferWriter).

use bytes::Buf;

use crate::error::ProtocolError;

/// Read a length-prefixed UTF-16LE string.
///
/// The format is: 1-byte length (in characters) followed by UTF-16LE bytes.
pub fn read_b_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = src.get_u8() as usize;
    read_utf16_string(src, len)
}

/// Read a length-prefixed UTF-16LE string with 2-byte length.
///
/// The format is: 2-byte length (in characters) followed by UTF-16LE bytes.
pub fn read_us_varchar(src: &mut impl Buf) -> Result<String, ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let len = src.get_u16_le() as usize;
    read_utf16_string(src, len)
}

/// Read a UTF-16LE string of specified character length.
pub fn read_utf16_string(src: &mut impl Buf, char_count: usize) -> Result<String, ProtocolError> {
    let byte_count = char_count * 2;
    if src.remaining() < byte_count {
        return Err(ProtocolError::UnexpectedEof);
    }

    let mut chars = Vec::with_capacity(char_count);
    for _ in 0..char_count {
        chars.push(src.get_u16_le());
    }

    String::from_utf16(&chars).map_err(|e| ProtocolError::StringEncoding(e.to_string()))
}

/// Skip a `B_VARCHAR` without decoding it.
pub fn skip_b_varchar(src: &mut impl Buf) -> Result<(), ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let bytes = src.get_u8() as usize * 2;
    skip(src, bytes)
}

/// Skip a `US_VARCHAR` without decoding it.
pub fn skip_us_varchar(src: &mut impl Buf) -> Result<(), ProtocolError> {
    if src.remaining() < 2 {
        return Err(ProtocolError::UnexpectedEof);
    }
    let bytes = src.get_u16_le() as usize * 2;
    skip(src, bytes)
}

fn skip(src: &mut impl Buf, count: usize) -> Result<(), ProtocolError> {
    if src.remaining() < count {
        return Err(ProtocolError::UnexpectedEof);
    }
    src.advance(count);
    Ok(())
}

/// Calculate the byte length of a UTF-16 encoded string.
#[must_use]
pub fn utf16_byte_len(s: &str) -> usize {
    s.encode_utf16().count() * 2
}
