//! Throughput benchmarks for Pulse Chat.
//!
//! These benchmarks measure the raw throughput of the event codec, hub
//! fan-out and moderation matching.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pulse_chat_bench::{clean_text, fanout_hub, message_event, moderation_engine, runtime};
use pulse_chat_core::MatchMode;
use pulse_chat_protocol::{codec, EventKind};
use std::time::Instant;
use uuid::Uuid;

/// Benchmark event encoding.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let channel_id = Uuid::new_v4();

    for (name, len) in [("64B", 64), ("1KB", 1024), ("4KB", 4000)] {
        let event = message_event(channel_id, len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(name, |b| b.iter(|| codec::encode(black_box(&event))));
    }

    group.finish();
}

/// Benchmark event decoding.
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    let channel_id = Uuid::new_v4();

    for (name, len) in [("64B", 64), ("1KB", 1024), ("4KB", 4000)] {
        let encoded = codec::encode(&message_event(channel_id, len)).unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_function(name, |b| b.iter(|| codec::decode(black_box(&encoded))));
    }

    group.finish();
}

/// Benchmark fan-out of one broadcast to every listener on a channel,
/// including each listener draining its frame.
fn bench_fanout(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("fanout");

    for size in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (hub, channel_id, mut handles) = rt.block_on(async { fanout_hub(size, 64) });
            let payload = serde_json::json!({"content": "x".repeat(64)});

            b.iter_custom(|iters| {
                rt.block_on(async {
                    let start = Instant::now();
                    for _ in 0..iters {
                        hub.broadcast_to_channel(channel_id, EventKind::MessageCreated, &payload);
                        for handle in &mut handles {
                            black_box(handle.recv().await);
                        }
                    }
                    start.elapsed()
                })
            });
        });
    }

    group.finish();
}

/// Benchmark rule matching against a clean message.
fn bench_moderation(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("moderation");
    let channel_id = Uuid::new_v4();
    let content = clean_text(40);

    for rules in [10usize, 100, 500] {
        for (mode_name, mode) in [("boundary", MatchMode::Boundary), ("substring", MatchMode::Substring)] {
            let engine = moderation_engine(&rt, rules, mode);
            group.throughput(Throughput::Bytes(content.len() as u64));
            group.bench_with_input(
                BenchmarkId::new(mode_name, rules),
                &content,
                |b, content| b.iter(|| engine.check_message(channel_id, black_box(content))),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_fanout, bench_moderation);
criterion_main!(benches);
