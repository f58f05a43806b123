//! Packet-to-message reassembly.
//!
//! The receiving side of the framing writer: packets are buffered until one
//! carries `END_OF_MESSAGE`. The mock server uses it to read client requests,
//! and tests use it to check what the writer put on the wire.

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::{PacketStatus, PacketType};

use crate::error::CodecError;
use crate::packet_codec::Packet;

/// A complete message reassembled from one or more packets.
#[derive(Debug, Clone)]
pub struct Message {
    /// Packet type shared by every packet of the message.
    pub packet_type: PacketType,
    /// Status of the first packet, where the reset-connection bits live.
    pub status: PacketStatus,
    /// Number of packets the message arrived in.
    pub packet_count: usize,
    /// Concatenated payloads.
    pub payload: Bytes,
}

impl Message {
    /// Payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether the client asked for a session reset before this request.
    #[must_use]
    pub fn resets_connection(&self) -> bool {
        self.status.intersects(
            PacketStatus::RESET_CONNECTION | PacketStatus::RESET_CONNECTION_SKIP_TRAN,
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Partial {
    packet_type: PacketType,
    status: PacketStatus,
    next_packet_id: u8,
    packet_count: usize,
}

/// Reassembles packets into messages.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    buffer: BytesMut,
    partial: Option<Partial>,
}

impl MessageAssembler {
    /// Create an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a packet.
    ///
    /// Returns the message once its last packet arrives. A packet whose type
    /// differs from the message in progress, or whose id is out of sequence,
    /// is an error.
    pub fn push(&mut self, packet: Packet) -> Result<Option<Message>, CodecError> {
        let header = packet.header;
        let mut partial = match self.partial {
            Some(partial) => {
                if header.packet_type != partial.packet_type {
                    return Err(CodecError::UnexpectedPacketType {
                        expected: partial.packet_type,
                        actual: header.packet_type,
                    });
                }
                if header.packet_id != partial.next_packet_id {
                    return Err(CodecError::InvalidState("packet id out of sequence"));
                }
                partial
            }
            None => Partial {
                packet_type: header.packet_type,
                status: header.status,
                next_packet_id: header.packet_id,
                packet_count: 0,
            },
        };

        self.buffer.extend_from_slice(&packet.payload);
        partial.packet_count += 1;
        partial.next_packet_id = header.packet_id.wrapping_add(1);

        tracing::trace!(
            packet_type = ?header.packet_type,
            packet_count = partial.packet_count,
            buffer_len = self.buffer.len(),
            is_eom = header.is_end_of_message(),
            "assembling message"
        );

        if header.is_end_of_message() {
            self.partial = None;
            Ok(Some(Message {
                packet_type: partial.packet_type,
                status: partial.status - PacketStatus::END_OF_MESSAGE,
                packet_count: partial.packet_count,
                payload: self.buffer.split().freeze(),
            }))
        } else {
            self.partial = Some(partial);
            Ok(None)
        }
    }

    /// Whether part of a message is buffered.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        self.partial.is_some()
    }

    /// Drop any partial message.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.partial = None;
    }
}
