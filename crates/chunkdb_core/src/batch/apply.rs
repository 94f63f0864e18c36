//! Routing one change list across segments.

use crate::error::CoreResult;
use crate::segment::SegmentManager;
use crate::types::{sort_changes, IndividualChange};

/// Applies `changes` to every segment they touch, in ascending segment order.
///
/// A change whose key spans several segments stays active until the segment
/// holding the end of its span has been written. When no change is active
/// the walk jumps straight to the segment of the next change instead of
/// visiting the empty segments in between.
pub fn apply_changes(manager: &SegmentManager, changes: &[IndividualChange]) -> CoreResult<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let mut sorted = changes.to_vec();
    sort_changes(&mut sorted);

    let mut next = 0;
    let mut active: Vec<IndividualChange> = Vec::new();
    let mut segment = manager.get_first_segment(&sorted[0].key);

    loop {
        let range = segment.range();
        while next < sorted.len() && sorted[next].key.span().start() <= range.end() {
            active.push(sorted[next].clone());
            next += 1;
        }

        let routed: Vec<IndividualChange> = active
            .iter()
            .filter(|c| c.key.span().overlaps(&range))
            .cloned()
            .collect();
        if !routed.is_empty() {
            segment.apply_changes(&routed)?;
        }
        active.retain(|c| c.key.span().end() > range.end());

        segment = if !active.is_empty() {
            match manager.get_segment_after(&segment) {
                Some(after) => after,
                None => break,
            }
        } else if next < sorted.len() {
            manager.get_segment(sorted[next].grouping_number())
        } else {
            break;
        };
    }
    Ok(())
}
