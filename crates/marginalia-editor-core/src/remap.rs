//! Moving positions and selections through a delta.
//!
//! A position inside a deleted span collapses to the span's start. A position
//! after an insertion shifts by the inserted length. A position exactly at an
//! insertion point moves past the insertion with `Affinity::After` and stays
//! put with `Affinity::Before`.

use std::ops::Range;

use crate::delta::{DeltaOp, SequenceDelta};
use crate::types::{Affinity, Selection};

/// Map an old-sequence offset to the equivalent new-sequence offset.
pub fn remap_offset(offset: usize, delta: &SequenceDelta, affinity: Affinity) -> usize {
    let mut old = 0;
    let mut new = 0;
    for op in &delta.ops {
        match op {
            DeltaOp::Retain { len, .. } => {
                if offset < old + len {
                    return new + (offset - old);
                }
                old += len;
                new += len;
            }
            DeltaOp::Insert { .. } => {
                let len = op.new_len();
                if offset == old && affinity == Affinity::Before {
                    return new;
                }
                new += len;
            }
            DeltaOp::Delete { len } => {
                if offset < old + len {
                    return new;
                }
                old += len;
            }
        }
    }
    new + offset.saturating_sub(old)
}

/// Map a selection, keeping its direction.
pub fn remap_selection(
    selection: Selection,
    delta: &SequenceDelta,
    affinity: Affinity,
) -> Selection {
    if selection.is_collapsed() {
        return Selection::collapsed(remap_offset(selection.focus, delta, affinity));
    }
    let range = remap_range(selection.to_range(), delta);
    if selection.is_backward() {
        Selection::new(range.end, range.start)
    } else {
        Selection::new(range.start, range.end)
    }
}

/// Map a range so it keeps covering the same characters.
///
/// Text inserted at either edge stays outside the range; a range whose text
/// was entirely deleted collapses to where the deletion happened.
pub fn remap_range(range: Range<usize>, delta: &SequenceDelta) -> Range<usize> {
    let start = remap_offset(range.start, delta, Affinity::After);
    let end = remap_offset(range.end, delta, Affinity::Before).max(start);
    tracing::trace!(?range, start, end, "remapped range");
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marks::Marks;

    fn insert_at(at: usize, text: &str) -> SequenceDelta {
        SequenceDelta::new().retain(at).insert(text, Marks::new())
    }

    #[test]
    fn test_shift_after_insertion() {
        let delta = insert_at(2, "abc");
        assert_eq!(remap_offset(1, &delta, Affinity::After), 1);
        assert_eq!(remap_offset(5, &delta, Affinity::After), 8);
        assert_eq!(remap_offset(5, &delta, Affinity::Before), 8);
    }

    #[test]
    fn test_affinity_at_insertion_point() {
        let delta = insert_at(2, "abc");
        assert_eq!(remap_offset(2, &delta, Affinity::After), 5);
        assert_eq!(remap_offset(2, &delta, Affinity::Before), 2);
    }

    #[test]
    fn test_insert_at_end_of_document() {
        let delta = insert_at(5, "!");
        assert_eq!(remap_offset(5, &delta, Affinity::After), 6);
        assert_eq!(remap_offset(5, &delta, Affinity::Before), 5);
    }

    #[test]
    fn test_position_inside_deletion_collapses_to_start() {
        let delta = SequenceDelta::new().retain(6).delete(5);
        assert_eq!(remap_offset(8, &delta, Affinity::After), 6);
        assert_eq!(remap_offset(11, &delta, Affinity::After), 6);
        assert_eq!(remap_offset(3, &delta, Affinity::After), 3);
    }

    #[test]
    fn test_range_survives_insert_before_it() {
        // "hello world", "world" at 6..11, "X" inserted at 0.
        let delta = insert_at(0, "X");
        assert_eq!(remap_range(6..11, &delta), 7..12);
    }

    #[test]
    fn test_range_does_not_grow_at_edges() {
        let delta = SequenceDelta::new()
            .retain(6)
            .insert("A", Marks::new())
            .retain(5)
            .insert("B", Marks::new());
        assert_eq!(remap_range(6..11, &delta), 7..12);
    }

    #[test]
    fn test_range_deleted_entirely() {
        let delta = SequenceDelta::new().retain(6).delete(5);
        assert_eq!(remap_range(6..11, &delta), 6..6);
    }

    #[test]
    fn test_backward_selection_keeps_direction() {
        let delta = insert_at(0, "XY");
        let sel = remap_selection(Selection::new(5, 1), &delta, Affinity::After);
        assert_eq!(sel, Selection::new(7, 3));
        assert!(sel.is_backward());
    }
}
