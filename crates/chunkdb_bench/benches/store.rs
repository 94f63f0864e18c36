//! Store benchmarks: batch writes, point reads and range scans.

use chunkdb_bench::{generate_inserts, open_bench_store, rng, BENCH_SEGMENT_SIZE};
use chunkdb_core::{Key, Range};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use tempfile::TempDir;

/// Benchmark batch inserts of increasing size into one segment.
fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_insert");
    group.sample_size(20);

    for count in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let temp_dir = TempDir::new().unwrap();
            let store = open_bench_store(&temp_dir.path().join("store"));
            let mut rng = rng();
            let mut start = 0i64;

            b.iter(|| {
                // Fresh grouping numbers each round so batches do not merge
                // into the previous round's chunks.
                let changes = generate_inserts(&mut rng, count, start, 60_000, 128);
                start += 60_000;
                store.apply_batch(black_box(changes)).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark single inserts, each its own journaled batch.
fn bench_single_insert(c: &mut Criterion) {
    let temp_dir = TempDir::new().unwrap();
    let store = open_bench_store(&temp_dir.path().join("store"));
    let mut rng = rng();
    let value = vec![0xAB; 128];
    let mut i = 0u64;

    c.bench_function("single_insert", |b| {
        b.iter(|| {
            let g = rng.gen_range(0..BENCH_SEGMENT_SIZE);
            store
                .insert(Key::point(g, i.to_le_bytes().to_vec()), black_box(value.clone()))
                .unwrap();
            i += 1;
        });
    });
}

/// Benchmark point reads against a populated store.
fn bench_point_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("point_read");

    for count in [1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let temp_dir = TempDir::new().unwrap();
            let store = open_bench_store(&temp_dir.path().join("store"));
            let mut rng = rng();
            let changes = generate_inserts(&mut rng, count, 0, 3_600_000, 64);
            let keys: Vec<Key> = changes.iter().map(|c| c.key.clone()).collect();
            store.apply_batch(changes).unwrap();

            let mut i = 0usize;
            b.iter(|| {
                let value = store.get(black_box(&keys[i % keys.len()])).unwrap();
                black_box(value);
                i += 1;
            });
        });
    }

    group.finish();
}

/// Benchmark range scans over one hour of data.
fn bench_range_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_scan");
    group.sample_size(20);

    for count in [1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let temp_dir = TempDir::new().unwrap();
            let store = open_bench_store(&temp_dir.path().join("store"));
            let mut rng = rng();
            store
                .apply_batch(generate_inserts(&mut rng, count, 0, 3_600_000, 64))
                .unwrap();

            b.iter(|| {
                let mut seen = 0usize;
                for entity in store.iter(black_box(Range::new(0, 3_599_999))).unwrap() {
                    black_box(entity.unwrap());
                    seen += 1;
                }
                seen
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_batch_insert,
    bench_single_insert,
    bench_point_read,
    bench_range_scan,
);
criterion_main!(benches);
