//! Local edit operations.
//!
//! `LocalEdit` is the vocabulary of primitive edits a user can make. Each one
//! is translated into replicated-store mutations; none of them touch the
//! projected document directly.

use std::ops::Range;

use smol_str::SmolStr;

use crate::marks::{MarkValue, Marks};
use crate::types::Affinity;

/// All primitive local edits.
///
/// Offsets are flat character offsets (blocks joined by one separator).
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    /// Insert inline text at `at`.
    ///
    /// With `marks` set, the inserted run carries exactly that mark set
    /// (pending marks from a collapsed-selection toggle). Without it, the text
    /// inherits whatever expanding marks the store gives it.
    InsertText {
        at: usize,
        text: String,
        marks: Option<Marks>,
        affinity: Affinity,
    },

    /// Delete a range, separators included.
    DeleteRange { range: Range<usize> },

    /// Split the block containing `at` into two (Enter).
    SplitNode { at: usize },

    /// Merge block `block` into the block before it.
    MergeNodes { block: usize },

    /// Set a formatting mark over a range.
    SetMark {
        range: Range<usize>,
        key: SmolStr,
        value: MarkValue,
    },

    /// Remove a formatting mark from a range.
    UnsetMark { range: Range<usize>, key: SmolStr },

    /// Remove `key` when the whole range already has it, set it otherwise.
    ToggleMark { range: Range<usize>, key: SmolStr },

    /// Change the kind of a block.
    SetNodeKind { block: usize, kind: SmolStr },
}

impl LocalEdit {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self::InsertText {
            at,
            text: text.into(),
            marks: None,
            affinity: Affinity::After,
        }
    }

    pub fn delete(range: Range<usize>) -> Self {
        Self::DeleteRange { range }
    }

    pub fn set_mark(range: Range<usize>, key: &str, value: impl Into<MarkValue>) -> Self {
        Self::SetMark {
            range,
            key: SmolStr::new(key),
            value: value.into(),
        }
    }

    pub fn toggle_mark(range: Range<usize>, key: &str) -> Self {
        Self::ToggleMark {
            range,
            key: SmolStr::new(key),
        }
    }

    /// The caret affinity this edit asks for, if it overrides the default.
    pub fn affinity(&self) -> Option<Affinity> {
        match self {
            Self::InsertText { affinity, .. } => Some(*affinity),
            _ => None,
        }
    }
}
