//! Verify command implementation.

use super::{open_offline, OfflineStore};
use chunkdb_core::{Range, Segment};
use std::path::Path;

/// Verification result.
#[derive(Debug, Default)]
pub struct VerifyResult {
    /// Number of segments checked.
    pub segments_checked: usize,
    /// Number of chunk files checked.
    pub chunks_checked: usize,
    /// Number of entities decoded.
    pub entities: usize,
    /// List of errors found.
    pub errors: Vec<String>,
}

impl VerifyResult {
    /// Returns true if no problem was found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying store at {}", path.display());
    println!();

    let store = open_offline(path)?;
    let result = verify(&store)?;

    println!("Segments checked: {}", result.segments_checked);
    println!("Chunks checked:   {}", result.chunks_checked);
    println!("Entities:         {}", result.entities);
    for error in &result.errors {
        println!("  ERROR: {error}");
    }

    println!();
    if result.is_ok() {
        println!("✓ Store verification passed");
        Ok(())
    } else {
        println!("✗ Store verification failed");
        Err("Verification failed".into())
    }
}

/// Checks every existing segment.
pub fn verify(store: &OfflineStore) -> Result<VerifyResult, Box<dyn std::error::Error>> {
    let mut result = VerifyResult::default();
    for segment in store.segments.get_existing_segments(Range::FULL)? {
        result.segments_checked += 1;
        verify_segment(&segment, &mut result)?;
    }
    Ok(result)
}

fn verify_segment(
    segment: &Segment,
    result: &mut VerifyResult,
) -> Result<(), Box<dyn std::error::Error>> {
    let seg = segment.range();
    let ranges = segment.chunk_ranges()?;

    // Ranges are sorted by start; compare each one with the widest range
    // seen so far to catch chunks nested behind a wide one.
    let mut widest: Option<Range> = None;
    for range in &ranges {
        if let Some(previous) = widest {
            if previous.overlaps(range) {
                result
                    .errors
                    .push(format!("segment {seg}: chunks {previous} and {range} overlap"));
            }
        }
        if widest.map_or(true, |w| range.end() > w.end()) {
            widest = Some(*range);
        }
    }

    for range in ranges {
        result.chunks_checked += 1;
        let entities = match segment.chunk(range).read() {
            Ok(entities) => entities,
            Err(e) => {
                result.errors.push(format!("segment {seg}: {e}"));
                continue;
            }
        };

        let catch_all = range.end() < seg.start();
        for entity in &entities {
            let key = &entity.key;
            let placed = if catch_all {
                key.grouping_number() < seg.start() && key.span().overlaps(&seg)
            } else {
                range.contains(key.grouping_number())
            };
            if !placed {
                result
                    .errors
                    .push(format!("segment {seg}: chunk {range} holds foreign key {key}"));
            }
        }
        result.entities += entities.len();
    }
    Ok(())
}
