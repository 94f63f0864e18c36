//! Inspect command implementation.

use super::{format_size, open_offline, OfflineStore};
use chunkdb_core::{KeyKind, Range, RecoveryManager};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// On-disk format version.
    pub format_version: String,
    /// Key kind the store was created with.
    pub key_kind: KeyKind,
    /// Segment size.
    pub segment_size: i64,
    /// Rollup levels, ascending.
    pub rollup_levels: Vec<i64>,
    /// Number of pending log entries.
    pub pending_entries: usize,
    /// Total size of all chunk files in bytes.
    pub total_size: u64,
    /// Total number of chunk files.
    pub chunk_count: usize,
    /// Segments holding chunk files.
    pub segments: Vec<SegmentStats>,
}

/// Statistics for a single segment.
#[derive(Debug, Serialize)]
pub struct SegmentStats {
    /// Segment range, as `start_end`.
    pub range: String,
    /// Number of chunk files.
    pub chunk_count: usize,
    /// Size of the chunk files in bytes.
    pub size: u64,
    /// Chunk ranges (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<String>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_chunks: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_offline(path)?;
    let result = inspect(&store, show_chunks)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects the inspection result.
pub fn inspect(
    store: &OfflineStore,
    show_chunks: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let recovery = RecoveryManager::open(store.dir.recovery_dir(), false)?;
    let (major, minor) = store.meta.format_version;

    let mut result = InspectResult {
        path: store.dir.path().display().to_string(),
        format_version: format!("{major}.{minor}"),
        key_kind: store.meta.key_kind,
        segment_size: store.meta.segment.segment_size(),
        rollup_levels: store.meta.segment.rollup_levels().to_vec(),
        pending_entries: recovery.pending_entries()?.len(),
        total_size: 0,
        chunk_count: 0,
        segments: Vec::new(),
    };

    for segment in store.segments.get_existing_segments(Range::FULL)? {
        let ranges = segment.chunk_ranges()?;
        let mut size = 0;
        for range in &ranges {
            size += fs::metadata(segment.chunk(*range).path())?.len();
        }

        result.total_size += size;
        result.chunk_count += ranges.len();
        result.segments.push(SegmentStats {
            range: segment.range().to_string(),
            chunk_count: ranges.len(),
            size,
            chunks: show_chunks.then(|| ranges.iter().map(ToString::to_string).collect()),
        });
    }

    Ok(result)
}

fn print_text_output(result: &InspectResult) {
    println!("ChunkDB Store Inspection");
    println!("========================");
    println!();
    println!("Path:           {}", result.path);
    println!("Format:         v{}", result.format_version);
    println!("Key kind:       {:?}", result.key_kind);
    println!("Segment size:   {}", result.segment_size);
    println!("Rollup levels:  {:?}", result.rollup_levels);
    println!("Pending log:    {} entries", result.pending_entries);
    println!();
    println!("Storage:");
    println!("  Segments:     {}", result.segments.len());
    println!("  Chunk files:  {}", result.chunk_count);
    println!("  Total size:   {} bytes", format_size(result.total_size));

    if !result.segments.is_empty() {
        println!();
        println!("Segments:");
        for segment in &result.segments {
            println!(
                "  [{}] {} chunks, {} bytes",
                segment.range,
                segment.chunk_count,
                format_size(segment.size)
            );
            if let Some(chunks) = &segment.chunks {
                for chunk in chunks {
                    println!("    {chunk}");
                }
            }
        }
    }
}
