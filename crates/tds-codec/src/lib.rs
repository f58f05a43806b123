//! # tds-codec
//!
//! Async framing layer between a byte transport and the TDS token stream.
//!
//! ## Outbound
//!
//! [`PacketWriter`] frames logical messages into packets inside one output
//! buffer. Message bodies are written straight into it through
//! [`BufferWriter`](tds_protocol::BufferWriter); completed packets are handed
//! to the transport with [`PacketWriter::take_completed`].
//!
//! ## Inbound
//!
//! ```text
//! transport → PacketReader (strip headers) → ReadBuffer (commit on success)
//!           → TokenReader (tokens, row mode) → RowReader (column values)
//! ```
//!
//! Decoding is resumable: a token that is not fully buffered is retried from
//! the same offset after the next read, so the stream can arrive in chunks of
//! any size.
//!
//! [`TdsCodec`] and [`MessageAssembler`] operate on whole packets and
//! messages; the mock server uses them on the receiving end of requests.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod frontend;
pub mod message;
pub mod packet_codec;
pub mod packet_reader;
pub mod packet_writer;
pub mod read_buffer;
pub mod row_reader;
pub mod token_reader;

pub use error::CodecError;
pub use frontend::FrontendMessage;
pub use message::{Message, MessageAssembler};
pub use packet_codec::{Packet, TdsCodec};
pub use packet_reader::PacketReader;
pub use packet_writer::{MessageWriter, PacketWriter};
pub use read_buffer::{DEFAULT_READ_CAPACITY, ReadBuffer};
pub use row_reader::RowReader;
pub use token_reader::TokenReader;
