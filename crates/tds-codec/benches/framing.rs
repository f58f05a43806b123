//! Benchmarks for packet framing and token reading.

#![allow(clippy::unwrap_used, missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tds_codec::{PacketWriter, TokenReader};
use tds_protocol::{
    BufferWriter, Done, DoneStatus, PacketStatus, PacketType, ServerMessage, Token,
};

/// Benchmark framing messages of various sizes.
fn bench_packet_writer(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_writer");
    for size in [64usize, 4096, 64 * 1024] {
        let body = vec![0x5Au8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &body, |b, body| {
            let mut writer = PacketWriter::new(4096).unwrap();
            b.iter(|| {
                let mut msg = writer
                    .start_message(PacketType::SqlBatch, PacketStatus::NORMAL)
                    .unwrap();
                for chunk in body.chunks(512) {
                    msg.write_bytes(chunk);
                }
                msg.end_message();
                black_box(writer.take_completed())
            })
        });
    }
    group.finish();
}

fn response_wire() -> Vec<u8> {
    let mut payload = Vec::new();
    for i in 0..200 {
        Token::Info(ServerMessage {
            number: i,
            message: "progress".into(),
            ..ServerMessage::default()
        })
        .encode(&mut payload);
        Token::DoneInProc(Done {
            status: DoneStatus::MORE | DoneStatus::COUNT,
            cur_cmd: 0xC1,
            row_count: i as u64,
        })
        .encode(&mut payload);
    }
    Token::Done(Done::default()).encode(&mut payload);

    let mut writer = PacketWriter::new(4096).unwrap();
    let mut msg = writer
        .start_message(PacketType::TabularResult, PacketStatus::NORMAL)
        .unwrap();
    msg.write_bytes(&payload);
    msg.end_message();
    writer.take_completed().to_vec()
}

/// Benchmark reading a token stream through the packet and buffer layers.
fn bench_token_reader(c: &mut Criterion) {
    let wire = response_wire();
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let mut group = c.benchmark_group("token_reader");
    group.throughput(Throughput::Bytes(wire.len() as u64));
    group.bench_function("info_done_stream", |b| {
        b.to_async(&runtime).iter(|| async {
            let mut reader = TokenReader::new(&wire[..], 8192);
            let mut count = 0usize;
            loop {
                let token = reader.next_token().await.unwrap();
                count += 1;
                if matches!(&token, Token::Done(d) if !d.has_more()) {
                    break;
                }
            }
            black_box(count)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_packet_writer, bench_token_reader);
criterion_main!(benches);
