//! Benchmark utilities.

use chunkdb_core::{IndividualChange, Key, SegmentConfig, Store, StoreConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Segment size used by the benchmark stores.
pub const BENCH_SEGMENT_SIZE: i64 = 86_400_000;

/// Opens a store tuned for benchmarks: no fsync, no background rollups.
pub fn open_bench_store(path: &Path) -> Store {
    let segment = SegmentConfig::new(BENCH_SEGMENT_SIZE, vec![1_000, 60_000, 3_600_000])
        .expect("bench segment config is valid");
    let config = StoreConfig::new()
        .segment(segment)
        .sync_writes(false)
        .background_rollups(false)
        .iterator_timeout(None);
    Store::open(path, config).expect("Failed to open bench store")
}

/// Returns a seeded generator so runs are comparable.
pub fn rng() -> StdRng {
    StdRng::seed_from_u64(0x0c0f_fee0)
}

/// Generate random entity data of the specified size.
pub fn random_data(rng: &mut impl Rng, size: usize) -> Vec<u8> {
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate point keys spread over `span` grouping numbers starting at `start`.
pub fn generate_keys(rng: &mut impl Rng, count: usize, start: i64, span: i64) -> Vec<Key> {
    (0..count)
        .map(|i| {
            let g = start + rng.gen_range(0..span.max(1));
            Key::point(g, format!("sensor-{i:06}"))
        })
        .collect()
}

/// Generate inserts with payloads of `payload_size` bytes.
pub fn generate_inserts(
    rng: &mut impl Rng,
    count: usize,
    start: i64,
    span: i64,
    payload_size: usize,
) -> Vec<IndividualChange> {
    generate_keys(rng, count, start, span)
        .into_iter()
        .map(|key| IndividualChange::insert(key, random_data(rng, payload_size)))
        .collect()
}
