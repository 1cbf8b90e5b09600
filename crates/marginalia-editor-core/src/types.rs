//! Core editor types: selections, points and insertion affinity.
//!
//! Offsets are character offsets into the flattened document text, where
//! consecutive blocks are joined by a single separator character.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Which side of an insertion a position sticks to.
///
/// `After` moves a position sitting exactly at the insertion point past the
/// inserted text (the caret follows text typed by its own user). `Before`
/// leaves it in place, so a remote insertion at the caret does not drag the
/// caret along.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Affinity {
    Before,
    #[default]
    After,
}

/// Text selection with anchor and focus positions.
///
/// The anchor is where the selection started, the focus is where the caret is now.
/// They may be in any order - use `start()` and `end()` for ordered bounds.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Default)]
pub struct Selection {
    /// Where selection started
    pub anchor: usize,
    /// Where the caret is now
    pub focus: usize,
}

impl Selection {
    /// Create a new selection.
    pub fn new(anchor: usize, focus: usize) -> Self {
        Self { anchor, focus }
    }

    /// Create a collapsed selection (caret position).
    pub fn collapsed(offset: usize) -> Self {
        Self {
            anchor: offset,
            focus: offset,
        }
    }

    /// Get the start (lower bound) of the selection.
    pub fn start(&self) -> usize {
        self.anchor.min(self.focus)
    }

    /// Get the end (upper bound) of the selection.
    pub fn end(&self) -> usize {
        self.anchor.max(self.focus)
    }

    /// Check if the selection is collapsed (empty, caret only).
    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.focus
    }

    /// Convert to a Range<usize> (ordered).
    pub fn to_range(&self) -> Range<usize> {
        self.start()..self.end()
    }

    /// Check if the selection is backward (focus before anchor).
    pub fn is_backward(&self) -> bool {
        self.focus < self.anchor
    }
}

impl From<Range<usize>> for Selection {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

/// A tree address: block index, leaf index within the block, and character
/// offset within the leaf text.
#[derive(Clone, Debug, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Point {
    pub block: usize,
    pub leaf: usize,
    pub offset: usize,
}

impl Point {
    pub fn new(block: usize, leaf: usize, offset: usize) -> Self {
        Self {
            block,
            leaf,
            offset,
        }
    }
}
