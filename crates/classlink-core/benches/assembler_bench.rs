//! Criterion benchmarks for the stream assembler.
//!
//! Simulates the read patterns a connection actually sees: many frames per
//! read, frames split across small reads, and streams with injected garbage.
//!
//! Run with:
//! ```bash
//! cargo bench --package classlink-core --bench assembler_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use classlink_core::protocol::assembler::StreamAssembler;
use classlink_core::protocol::codec::pack;
use classlink_core::protocol::messages::{MessageData, MessageType};
use serde_json::json;

fn frame(i: usize) -> Vec<u8> {
    let mut data = MessageData::new();
    data.insert("seq".to_string(), json!(i));
    data.insert("text".to_string(), json!("the quick brown fox"));
    pack(MessageType::ChatMessage, data, false)
}

fn stream_of(count: usize) -> Vec<u8> {
    (0..count).flat_map(frame).collect()
}

/// Whole stream delivered in reads of `chunk` bytes.
fn bench_chunked_reads(c: &mut Criterion) {
    let stream = stream_of(1_000);
    let mut group = c.benchmark_group("assembler_chunked");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk in [64usize, 1_460, 65_536] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut assembler = StreamAssembler::new();
                let mut frames = 0;
                for piece in stream.chunks(chunk) {
                    frames += assembler.feed(black_box(piece)).len();
                }
                assert_eq!(frames, 1_000);
            })
        });
    }
    group.finish();
}

/// Every tenth frame preceded by garbage that forces a resync.
fn bench_resync(c: &mut Criterion) {
    let mut stream = Vec::new();
    for i in 0..1_000 {
        if i % 10 == 0 {
            stream.extend_from_slice(&[0x5A; 97]);
        }
        stream.extend_from_slice(&frame(i));
    }

    c.bench_function("assembler_resync", |b| {
        b.iter(|| {
            let mut assembler = StreamAssembler::new();
            let frames: usize = stream
                .chunks(4_096)
                .map(|piece| assembler.feed(black_box(piece)).len())
                .sum();
            assert_eq!(frames, 1_000);
        })
    });
}

criterion_group!(benches, bench_chunked_reads, bench_resync);
criterion_main!(benches);
