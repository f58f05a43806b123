#![no_main]

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use arbitrary::Arbitrary;
use bytes::{Buf, Bytes};
use libfuzzer_sys::fuzz_target;
use tds_codec::{PacketWriter, TokenReader};
use tds_protocol::{BufferWriter, PacketStatus, PacketType};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Debug, Arbitrary)]
struct Input {
    payload: Vec<u8>,
    /// Sizes of the reads the transport hands out.
    splits: Vec<u8>,
    packet_size: u16,
}

/// Hands out the wire bytes in fixed chunks, then end of stream.
struct Chunked(VecDeque<Bytes>);

impl AsyncRead for Chunked {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(chunk) = self.0.front_mut() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk[..n]);
            chunk.advance(n);
            if chunk.is_empty() {
                self.0.pop_front();
            }
        }
        Poll::Ready(Ok(()))
    }
}

fuzz_target!(|input: Input| {
    // Frame the payload as a response, then feed it back in arbitrary chunks
    let Ok(mut writer) = PacketWriter::new(usize::from(input.packet_size).max(512)) else {
        return;
    };
    let Ok(mut message) = writer.start_message(PacketType::TabularResult, PacketStatus::NORMAL)
    else {
        return;
    };
    message.write_bytes(&input.payload);
    message.end_message();
    let mut wire = writer.take_completed();

    let mut chunks = VecDeque::new();
    for split in input.splits.iter().map(|&n| usize::from(n).max(1)) {
        if wire.is_empty() {
            break;
        }
        chunks.push_back(wire.split_to(split.min(wire.len())));
    }
    if !wire.is_empty() {
        chunks.push_back(wire);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let mut reader = TokenReader::new(Chunked(chunks), 64);
        for _ in 0..1024 {
            if reader.next_token().await.is_err() {
                break;
            }
            if let Some(mut row) = reader.row() {
                // Read every other column; the next token skips the rest
                for k in (0..row.column_count()).step_by(2) {
                    if row.column(k).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
});
