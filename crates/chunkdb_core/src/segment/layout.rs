//! Segment directory naming.
//!
//! A segment with index `i = floor(start / segment_size)` lives at
//!
//! ```text
//! <data>/<pos|neg>/<d>/<ddd>/<ddd>/<ddd>/<ddd>/<ddd>/<start>_<end>/
//! ```
//!
//! where the digit components are the 19-digit zero-padded magnitude of `i`
//! without its last three digits. The leaf name carries the segment range, so
//! every directory level holds at most 1000 children.

use crate::config::SegmentConfig;
use crate::error::CoreResult;
use crate::range::Range;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const POSITIVE: &str = "pos";
const NEGATIVE: &str = "neg";
const MAGNITUDE_DIGITS: usize = 19;
const COMPONENT_WIDTHS: [usize; 6] = [1, 3, 3, 3, 3, 3];

/// Returns the directory of the segment with `index` and `range`.
#[must_use]
pub fn segment_dir(root: &Path, index: i64, range: Range) -> PathBuf {
    let sign = if index < 0 { NEGATIVE } else { POSITIVE };
    let digits = format!("{:0width$}", index.unsigned_abs(), width = MAGNITUDE_DIGITS);

    let mut path = root.join(sign);
    let mut offset = 0;
    for width in COMPONENT_WIDTHS {
        path.push(&digits[offset..offset + width]);
        offset += width;
    }
    path.push(range.to_string());
    path
}

/// Lists the ranges of segments whose directory exists and which overlap
/// `query`, sorted ascending.
///
/// Only the branches of the tree that can hold matching segment indices are
/// visited.
pub fn existing_segment_ranges(
    root: &Path,
    config: &SegmentConfig,
    query: Range,
) -> CoreResult<Vec<Range>> {
    let bounds = (
        i128::from(config.segment_index(query.start())),
        i128::from(config.segment_index(query.end())),
    );

    let mut found = Vec::new();
    for (sign, negative) in [(NEGATIVE, true), (POSITIVE, false)] {
        walk(&root.join(sign), 0, String::new(), negative, bounds, query, &mut found)?;
    }
    found.sort();
    Ok(found)
}

fn walk(
    dir: &Path,
    depth: usize,
    prefix: String,
    negative: bool,
    bounds: (i128, i128),
    query: Range,
    found: &mut Vec<Range>,
) -> CoreResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if depth == COMPONENT_WIDTHS.len() {
            if let Ok(range) = name.parse::<Range>() {
                if range.overlaps(&query) {
                    found.push(range);
                }
            }
            continue;
        }

        let width = COMPONENT_WIDTHS[depth];
        if name.len() != width || !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let child_prefix = format!("{prefix}{name}");
        if index_span(&child_prefix, negative).is_some_and(|(lo, hi)| hi >= bounds.0 && lo <= bounds.1)
        {
            walk(&entry.path(), depth + 1, child_prefix, negative, bounds, query, found)?;
        }
    }
    Ok(())
}

/// Returns the inclusive span of segment indices below a digit prefix.
fn index_span(prefix: &str, negative: bool) -> Option<(i128, i128)> {
    let rest = MAGNITUDE_DIGITS - prefix.len();
    let lo: i128 = format!("{prefix}{}", "0".repeat(rest)).parse().ok()?;
    let hi: i128 = format!("{prefix}{}", "9".repeat(rest)).parse().ok()?;
    Some(if negative { (-hi, -lo) } else { (lo, hi) })
}
