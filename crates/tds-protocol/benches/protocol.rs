//! Benchmarks for TDS protocol encoding and decoding.

#![allow(clippy::unwrap_used, missing_docs)]

use std::sync::Arc;

use bytes::BytesMut;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use tds_protocol::{
    ColMetaData, ColumnData, Done, DoneStatus, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType, ServerMessage, Token, TypeId, TypeInfo, encode_sql_batch,
};

/// Benchmark packet header encoding.
fn bench_packet_header_encode(c: &mut Criterion) {
    let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 1000);

    c.bench_function("packet_header_encode", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE);
            header.encode(&mut buf);
            black_box(buf)
        })
    });
}

/// Benchmark packet header decoding.
fn bench_packet_header_decode(c: &mut Criterion) {
    let encoded =
        PacketHeader::new(PacketType::TabularResult, PacketStatus::END_OF_MESSAGE, 1000)
            .encode_to_bytes();

    c.bench_function("packet_header_decode", |b| {
        b.iter(|| {
            let mut cursor = encoded.clone();
            black_box(PacketHeader::decode(&mut cursor).unwrap())
        })
    });
}

fn response_stream() -> Vec<u8> {
    let meta = ColMetaData {
        columns: vec![
            ColumnData::new("id", TypeInfo::nullable(TypeId::IntN, 4)),
            ColumnData::new("name", TypeInfo::nvarchar(200)),
            ColumnData::new("payload", TypeInfo::varbinary(0xFFFF)),
        ],
    };
    let mut buf = Vec::new();
    Token::ColMetaData(Arc::new(meta)).encode(&mut buf);
    for i in 0..32 {
        Token::Info(ServerMessage {
            number: i,
            message: "informational message".into(),
            ..ServerMessage::default()
        })
        .encode(&mut buf);
        Token::DoneInProc(Done {
            status: DoneStatus::MORE | DoneStatus::COUNT,
            cur_cmd: 0xC1,
            row_count: i as u64,
        })
        .encode(&mut buf);
    }
    buf
}

/// Benchmark decoding a token stream from a contiguous buffer.
fn bench_token_decode(c: &mut Criterion) {
    let stream = response_stream();
    let mut group = c.benchmark_group("token_decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("stream", |b| {
        b.iter(|| {
            let mut offset = 0;
            let mut count = 0;
            while offset < stream.len() {
                let (token, consumed) = Token::decode(&stream[offset..]).unwrap();
                black_box(token);
                offset += consumed;
                count += 1;
            }
            black_box(count)
        })
    });
    group.finish();
}

/// Benchmark SQL batch encoding with various query sizes.
fn bench_sql_batch_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("sql_batch_encode");

    let simple_query = "SELECT 1";
    group.throughput(Throughput::Bytes(simple_query.len() as u64));
    group.bench_function("simple", |b| {
        b.iter(|| black_box(encode_sql_batch(black_box(simple_query))))
    });

    let large_query = "SELECT u.id, u.name, u.email, o.id as order_id, o.total, o.status \
        FROM users u \
        INNER JOIN orders o ON u.id = o.user_id \
        WHERE u.organization_id = @p1 AND o.created_at >= @p2 \
        ORDER BY o.created_at DESC, u.name ASC";
    group.throughput(Throughput::Bytes(large_query.len() as u64));
    group.bench_function("large", |b| {
        b.iter(|| black_box(encode_sql_batch(black_box(large_query))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_packet_header_encode,
    bench_packet_header_decode,
    bench_token_decode,
    bench_sql_batch_encode,
);

criterion_main!(benches);
