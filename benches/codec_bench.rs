//! Performance benchmarks for the TLV codec and packet codec.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench codec_bench
//! ```

use bytes::BytesMut;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tokio_util::codec::{Decoder, Encoder};

use dal_protocol::{Tlv, TlvCodec, VipaCodec, VipaCommand, VipaCommandType};

/// Reset reply body with a nested identification template.
fn device_info_tree() -> Vec<Tlv> {
    vec![Tlv::container(
        [0xE1],
        vec![
            Tlv::leaf([0xDF, 0x0D], b"P400".to_vec()),
            Tlv::leaf([0x9F, 0x1E], b"275-123-456".to_vec()),
            Tlv::leaf([0xDF, 0x7F], b"VOS2 1.2.3".to_vec()),
            Tlv::container([0xE4], vec![Tlv::leaf([0x48], vec![0x00, 0x01])]),
        ],
    )]
}

fn bench_tlv(c: &mut Criterion) {
    let mut group = c.benchmark_group("tlv");
    group.throughput(Throughput::Elements(1));

    let codec = TlvCodec::new();
    let tree = device_info_tree();
    let bytes = codec.encode(&tree);

    group.bench_function("encode_device_info", |b| {
        b.iter(|| black_box(codec.encode(black_box(&tree))));
    });
    group.bench_function("decode_device_info", |b| {
        b.iter(|| black_box(codec.decode(black_box(&bytes)).unwrap()));
    });

    group.finish();
}

fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");

    for size in [16usize, 1024, 4096, 16 * 1024] {
        let command = VipaCommand::new(VipaCommandType::DisplayHtml, 0x00, 0x00)
            .with_data(vec![0x5A; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("frames", size), &command, |b, command| {
            b.iter(|| black_box(command.frames()));
        });
    }

    group.finish();
}

fn bench_packet_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_decode");

    for size in [16usize, 1024, 8192] {
        let frames = VipaCommand::new(VipaCommandType::DisplayHtml, 0x00, 0x00)
            .with_data(vec![0x11; size])
            .frames();
        let mut wire = BytesMut::new();
        let mut codec = VipaCodec::new();
        for frame in frames {
            codec.encode(frame, &mut wire).unwrap();
        }

        group.throughput(Throughput::Bytes(wire.len() as u64));
        group.bench_with_input(BenchmarkId::new("decode", size), &wire, |b, wire| {
            b.iter(|| {
                let mut codec = VipaCodec::new();
                let mut buf = wire.clone();
                while let Some(packet) = codec.decode(&mut buf).unwrap() {
                    black_box(packet);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_tlv, bench_framer, bench_packet_decode);
criterion_main!(benches);
