//! Codec benchmarks for canopy-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use canopy_protocol::{codec, Packet, DEFAULT_CHUNK_SIZE};

fn bench_encode_small(c: &mut Criterion) {
    let packet = Packet::message("bench", Some("test"), vec![0u8; 64], false);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::encode(black_box(&packet), DEFAULT_CHUNK_SIZE))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let packet = Packet::message("bench", Some("test"), vec![0u8; 64], false);
    let encoded = codec::encode(&packet, DEFAULT_CHUNK_SIZE).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("small_64B", |b| {
        b.iter(|| codec::decode(black_box(&encoded), DEFAULT_CHUNK_SIZE))
    });
    group.finish();
}

fn bench_stream_multi_chunk(c: &mut Criterion) {
    let packet = Packet::message("bench", Some("test/channel/room"), vec![0u8; 8192], true);
    let encoded = codec::encode(&packet, DEFAULT_CHUNK_SIZE).unwrap();

    let mut group = c.benchmark_group("stream");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("multi_chunk_8KB", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&encoded[..]);
            codec::decode_from(black_box(&mut buf), DEFAULT_CHUNK_SIZE).unwrap()
        })
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_stream_multi_chunk
);
criterion_main!(benches);
