//! Outbound message-to-packet framing.
//!
//! [`PacketWriter`] turns logical messages into wire packets inside a single
//! output buffer, without staging the message body anywhere else.
//!
//! Every packet region starts with eight reserved header bytes followed by
//! payload. A message that fits in one packet is finished by stamping the
//! header into the reserved slot. When a region grows past one packet, it is
//! split from the end backward: the bytes of packet `i` move forward by `i`
//! header sizes and a header is stamped into the gap in front of them.
//! Working backward means every move lands on bytes that were already
//! relocated. The trailing packet, partial or exactly full, is parked in a
//! scratch buffer and becomes the start of the next region, so only the
//! final packet of a message may be short, and it is empty only for an
//! empty message.
//!
//! ```text
//! region:   [H0 | p0 p0 p0 | p1 p1 p1 | p2 p2 ]
//! framed:   [H0 | p0 p0 p0 ][H1 | p1 p1 p1 ][H2 | p2 p2 ]
//! ```

use bytes::{Bytes, BytesMut};
use tds_protocol::{
    BufferWriter, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader,
    PacketStatus, PacketType,
};

use crate::error::CodecError;
use crate::frontend::FrontendMessage;

/// Status bits honored only on the first packet of a message.
const RESET_BITS: PacketStatus =
    PacketStatus::RESET_CONNECTION.union(PacketStatus::RESET_CONNECTION_SKIP_TRAN);

#[derive(Debug, Clone, Copy)]
struct MessageState {
    packet_type: PacketType,
    reset: PacketStatus,
    next_packet_id: u8,
    first_packet_pending: bool,
}

/// Frames logical messages into TDS packets.
#[derive(Debug)]
pub struct PacketWriter {
    packet_size: usize,
    output: BytesMut,
    /// Offset of the reserved header of the region being filled.
    region_start: usize,
    scratch: BytesMut,
    message: Option<MessageState>,
}

impl PacketWriter {
    /// Create a writer producing packets of at most `packet_size` bytes.
    pub fn new(packet_size: usize) -> Result<Self, CodecError> {
        validate_packet_size(packet_size)?;
        Ok(Self {
            packet_size,
            output: BytesMut::with_capacity(packet_size),
            region_start: 0,
            scratch: BytesMut::new(),
            message: None,
        })
    }

    /// Total packet size, header included.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Change the packet size for subsequent messages.
    pub fn set_packet_size(&mut self, packet_size: usize) -> Result<(), CodecError> {
        if self.message.is_some() {
            return Err(CodecError::InvalidState(
                "packet size changed while a message is being written",
            ));
        }
        validate_packet_size(packet_size)?;
        self.packet_size = packet_size;
        Ok(())
    }

    /// Whether a message is being written.
    #[must_use]
    pub fn in_message(&self) -> bool {
        self.message.is_some()
    }

    /// Begin a logical message.
    ///
    /// Only the reset-connection bits of `status` are honored, and only on
    /// the first packet; end-of-message is set by [`MessageWriter::end_message`].
    pub fn start_message(
        &mut self,
        packet_type: PacketType,
        status: PacketStatus,
    ) -> Result<MessageWriter<'_>, CodecError> {
        if self.message.is_some() {
            return Err(CodecError::InvalidState("message already in progress"));
        }
        self.message = Some(MessageState {
            packet_type,
            reset: status & RESET_BITS,
            next_packet_id: 0,
            first_packet_pending: true,
        });
        self.open_region();
        Ok(MessageWriter { writer: self })
    }

    /// Frame a whole frontend message.
    pub fn write_message(
        &mut self,
        message: &FrontendMessage,
        status: PacketStatus,
    ) -> Result<(), CodecError> {
        let mut body = self.start_message(message.packet_type(), status)?;
        message.write_body(&mut body);
        body.end_message();
        Ok(())
    }

    /// Drop the unfinished message, discarding its bytes that have not been
    /// handed out by [`take_completed`](Self::take_completed).
    pub fn abandon_message(&mut self) {
        if self.message.take().is_some() {
            self.output.truncate(self.region_start);
            self.scratch.clear();
        }
    }

    /// Bytes of finished packets ready for the transport.
    #[must_use]
    pub fn completed_len(&self) -> usize {
        if self.message.is_some() {
            self.region_start
        } else {
            self.output.len()
        }
    }

    /// Take the finished packets. Bytes of a message still being written
    /// stay behind.
    pub fn take_completed(&mut self) -> Bytes {
        let ready = self.completed_len();
        let packets = self.output.split_to(ready).freeze();
        self.region_start -= ready.min(self.region_start);
        packets
    }

    fn max_payload(&self) -> usize {
        self.packet_size - PACKET_HEADER_SIZE
    }

    fn data_start(&self) -> usize {
        self.region_start + PACKET_HEADER_SIZE
    }

    fn open_region(&mut self) {
        self.region_start = self.output.len();
        self.output.extend_from_slice(&[0u8; PACKET_HEADER_SIZE]);
    }

    fn append(&mut self, src: &[u8]) {
        self.output.extend_from_slice(src);
        if self.output.len() - self.data_start() > self.max_payload() {
            self.frame(false);
        }
    }

    /// Split the current region into packets.
    ///
    /// With `last` unset only whole packets are emitted and the remainder
    /// opens the next region. The remainder is never empty, so a body that
    /// ends on a packet boundary still closes with a full end-of-message
    /// packet. With `last` set the remainder (or an empty body) becomes the
    /// end-of-message packet.
    fn frame(&mut self, last: bool) {
        let Some(mut state) = self.message else {
            return;
        };
        let max_payload = self.max_payload();
        let data_start = self.data_start();
        let len = self.output.len() - data_start;
        let full = len / max_payload;
        let rem = len % max_payload;

        let (packets, held) = if last {
            ((full + usize::from(rem > 0)).max(1), 0)
        } else if len > max_payload {
            let held = if rem == 0 { max_payload } else { rem };
            ((len - held) / max_payload, held)
        } else {
            (0, 0)
        };
        if packets == 0 {
            return;
        }

        if held > 0 {
            let tail = self.output.len() - held;
            self.scratch.clear();
            self.scratch.extend_from_slice(&self.output[tail..]);
            self.output.truncate(tail);
        }

        let payload_len = self.output.len() - data_start;
        self.output
            .resize(self.output.len() + (packets - 1) * PACKET_HEADER_SIZE, 0);

        let base = state.next_packet_id;
        for i in (1..packets).rev() {
            let src = data_start + i * max_payload;
            let chunk = (payload_len - i * max_payload).min(max_payload);
            let dst = src + i * PACKET_HEADER_SIZE;
            self.output.copy_within(src..src + chunk, dst);

            let mut status = PacketStatus::NORMAL;
            if last && i == packets - 1 {
                status |= PacketStatus::END_OF_MESSAGE;
            }
            PacketHeader::new(state.packet_type, status, (chunk + PACKET_HEADER_SIZE) as u16)
                .with_packet_id(base.wrapping_add(i as u8))
                .encode_into(&mut self.output[dst - PACKET_HEADER_SIZE..]);
        }

        let mut status = PacketStatus::NORMAL;
        if state.first_packet_pending {
            status |= state.reset;
            state.first_packet_pending = false;
        }
        if last && packets == 1 {
            status |= PacketStatus::END_OF_MESSAGE;
        }
        let chunk = payload_len.min(max_payload);
        PacketHeader::new(state.packet_type, status, (chunk + PACKET_HEADER_SIZE) as u16)
            .with_packet_id(base)
            .encode_into(&mut self.output[self.region_start..]);

        state.next_packet_id = base.wrapping_add(packets as u8);
        self.message = Some(state);

        tracing::trace!(
            packet_type = ?state.packet_type,
            packets,
            payload_len,
            last,
            "framed packets"
        );

        if !last {
            self.open_region();
            self.output.extend_from_slice(&self.scratch);
            self.scratch.clear();
        }
    }

    fn end_message(&mut self) {
        self.frame(true);
        self.message = None;
        self.region_start = self.output.len();
    }
}

fn validate_packet_size(packet_size: usize) -> Result<(), CodecError> {
    if (MIN_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&packet_size) {
        Ok(())
    } else {
        Err(CodecError::InvalidPacketSize(packet_size))
    }
}

/// Body sink for one message, returned by [`PacketWriter::start_message`].
///
/// Dropping it without calling [`end_message`](Self::end_message) leaves the
/// message open; use [`PacketWriter::abandon_message`] to discard it.
#[derive(Debug)]
pub struct MessageWriter<'a> {
    writer: &'a mut PacketWriter,
}

impl MessageWriter<'_> {
    /// Finish the message; its last packet carries end-of-message.
    pub fn end_message(self) {
        self.writer.end_message();
    }
}

impl BufferWriter for MessageWriter<'_> {
    fn write_bytes(&mut self, src: &[u8]) {
        self.writer.append(src);
    }
}
