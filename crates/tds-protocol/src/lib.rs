//! # tds-protocol
//!
//! IO-agnostic implementation of the TDS (Tabular Data Stream) wire format:
//! packet headers, the response token stream, type length conventions, and
//! the request bodies a client sends.
//!
//! ## Design Philosophy
//!
//! This crate contains no networking logic and makes no assumptions about the
//! async runtime. Decoders operate on byte slices and report short input as
//! [`ProtocolError::Incomplete`] instead of consuming partial data, which lets
//! the codec crate build a resumable streaming reader on top of them. Request
//! bodies are written through [`BufferWriter`], so they can be encoded
//! straight into the packet framing writer.
//!
//! ## Example
//!
//! ```rust
//! use tds_protocol::{PacketHeader, PacketStatus, PacketType, Token};
//!
//! let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 46);
//! assert_eq!(header.payload_length(), 38);
//!
//! let done = [0xFD, 0x10, 0x00, 0xC1, 0x00, 1, 0, 0, 0, 0, 0, 0, 0];
//! let (token, consumed) = Token::decode(&done).unwrap();
//! assert_eq!(consumed, 13);
//! assert_eq!(token.as_done().and_then(|d| d.row_count()), Some(1));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod error;
pub mod login;
pub mod packet;
pub mod rpc;
pub mod sql_batch;
pub mod token;
pub mod types;
pub mod writer;

pub use error::ProtocolError;
pub use login::{LoginOutcome, LoginSequence};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};
pub use rpc::{ParamFlags, ProcId, RpcOptionFlags, RpcParam, RpcRequest};
pub use sql_batch::{SqlBatch, encode_sql_batch};
pub use token::{
    ColMetaData, Collation, ColumnData, Done, DoneStatus, EnvChange, EnvChangeType,
    EnvChangeValue, LoginAck, Order, ReturnValue, ServerMessage, Token, TokenType, TypeInfo,
};
pub use types::{ColumnFlags, LengthKind, TypeId};
pub use writer::{BufferWriter, LengthCounter};
