//! Identity resolution benchmarks for rustla-core.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rustla_core::identity::{resolve, string_hash};

fn bench_string_hash(c: &mut Criterion) {
    let input = "twitch/destiny";

    let mut group = c.benchmark_group("string_hash");
    group.throughput(Throughput::Bytes(input.len() as u64));
    group.bench_function("pair_14B", |b| b.iter(|| string_hash(black_box(input))));
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");
    group.bench_function("case_insensitive", |b| {
        b.iter(|| resolve(black_box("Twitch"), black_box("Destiny")))
    });
    group.bench_function("case_sensitive", |b| {
        b.iter(|| resolve(black_box("youtube"), black_box("dQw4w9WgXcQ")))
    });
    group.bench_function("advanced_url", |b| {
        b.iter(|| resolve(black_box("advanced"), black_box("https://Example.com/live/stream.m3u8")))
    });
    group.bench_function("rejected", |b| {
        b.iter(|| resolve(black_box("twitch"), black_box("not a channel")))
    });
    group.finish();
}

criterion_group!(benches, bench_string_hash, bench_resolve);
criterion_main!(benches);
