//! Hot-path benchmarks for vidlink-transport.
//!
//! Measures the per-byte cost of the two stream-facing components:
//! - NaluParser::feed over a synthetic GOP in various chunk sizes
//! - Message encode and MessageDecoder::push for video-sized payloads
//!
//! Run with: cargo bench --package vidlink-transport

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use vidlink_transport::nal::START_CODE;
use vidlink_transport::parser::NaluParser;
use vidlink_transport::wire::{encode_message, Message, MessageDecoder, MessageType};

/// One SPS, one PPS, one IDR slice and `p_slices` P slices of `slice_len`
/// bytes each, all start-code delimited. Slice bodies avoid zero bytes.
fn synthetic_gop(p_slices: usize, slice_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let sps = [0x67, 0x42, 0xC0, 0x1E, 0xDA, 0x02, 0x80, 0xBF, 0xE5];
    let pps = [0x68, 0xCE, 0x38, 0x80];
    for body in [&sps[..], &pps[..]] {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(body);
    }
    for n in 0..=p_slices {
        out.extend_from_slice(&START_CODE);
        out.push(if n == 0 { 0x65 } else { 0x41 });
        out.extend((0..slice_len).map(|i| (i % 251 + 1) as u8));
    }
    out.extend_from_slice(&START_CODE);
    out
}

// ─── Parser ──────────────────────────────────────────────────────────────

fn bench_parser(c: &mut Criterion) {
    let gop = synthetic_gop(29, 4096);
    let mut group = c.benchmark_group("parser_feed");
    group.throughput(Throughput::Bytes(gop.len() as u64));

    for chunk in [1400usize, 16 * 1024, 64 * 1024] {
        group.bench_function(format!("chunk_{chunk}"), |b| {
            b.iter(|| {
                let mut parser = NaluParser::default();
                let mut units = 0;
                for piece in gop.chunks(chunk) {
                    parser.feed(black_box(piece)).unwrap();
                    units += parser.drain_units().count();
                }
                black_box(units);
            });
        });
    }
    group.finish();
}

// ─── Framer ──────────────────────────────────────────────────────────────

fn bench_framer(c: &mut Criterion) {
    let mut group = c.benchmark_group("framer");

    for size in [64usize, 1400, 64 * 1024] {
        let payload = Bytes::from(vec![0xAB; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{size}"), |b| {
            let msg = Message::video(payload.clone());
            b.iter(|| black_box(black_box(&msg).encode()));
        });

        let wire = encode_message(MessageType::VideoData, &payload);
        group.bench_function(format!("decode_{size}"), |b| {
            b.iter(|| {
                let mut decoder = MessageDecoder::new();
                for piece in wire.chunks(1400) {
                    decoder.push(black_box(piece)).unwrap();
                }
                black_box(decoder.next_message());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parser, bench_framer);
criterion_main!(benches);
