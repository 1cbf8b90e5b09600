//! Sequence deltas: the description of one applied mutation.
//!
//! A delta walks the old sequence from the start. `Retain` skips characters
//! (optionally patching their marks), `Insert` adds new characters and
//! `Delete` removes old ones. Offsets are in unicode scalar values.

use std::ops::Range;

use smol_str::SmolStr;

use crate::marks::{MarkPatch, Marks};

/// One step of a sequence delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOp {
    /// Skip `len` characters, applying `attrs` as a patch (`None` removes a key).
    Retain { len: usize, attrs: MarkPatch },
    /// Insert `text` carrying exactly the mark set `attrs`.
    Insert { text: String, attrs: Marks },
    /// Remove `len` characters.
    Delete { len: usize },
}

impl DeltaOp {
    /// Characters of the old sequence this op consumes.
    pub fn old_len(&self) -> usize {
        match self {
            DeltaOp::Retain { len, .. } | DeltaOp::Delete { len } => *len,
            DeltaOp::Insert { .. } => 0,
        }
    }

    /// Characters of the new sequence this op produces.
    pub fn new_len(&self) -> usize {
        match self {
            DeltaOp::Retain { len, .. } => *len,
            DeltaOp::Insert { text, .. } => text.chars().count(),
            DeltaOp::Delete { .. } => 0,
        }
    }
}

/// An ordered list of delta ops plus block-kind metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceDelta {
    pub ops: Vec<DeltaOp>,
    /// New kind of the first block, when it changed.
    pub head_kind: Option<SmolStr>,
}

impl SequenceDelta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip characters without touching them.
    pub fn retain(self, len: usize) -> Self {
        self.retain_with(len, MarkPatch::new())
    }

    /// Skip characters while patching their marks.
    pub fn retain_with(mut self, len: usize, attrs: MarkPatch) -> Self {
        self.push(DeltaOp::Retain { len, attrs });
        self
    }

    pub fn insert(mut self, text: impl Into<String>, attrs: Marks) -> Self {
        self.push(DeltaOp::Insert {
            text: text.into(),
            attrs,
        });
        self
    }

    pub fn delete(mut self, len: usize) -> Self {
        self.push(DeltaOp::Delete { len });
        self
    }

    pub fn with_head_kind(mut self, kind: impl Into<SmolStr>) -> Self {
        self.head_kind = Some(kind.into());
        self
    }

    /// Append an op, coalescing it with the previous one when they are the
    /// same kind of op with the same attributes. Zero-length ops are dropped.
    pub fn push(&mut self, op: DeltaOp) {
        if op.old_len() == 0 && op.new_len() == 0 {
            return;
        }
        match (self.ops.last_mut(), op) {
            (
                Some(DeltaOp::Retain { len, attrs }),
                DeltaOp::Retain {
                    len: more,
                    attrs: more_attrs,
                },
            ) if *attrs == more_attrs => *len += more,
            (
                Some(DeltaOp::Insert { text, attrs }),
                DeltaOp::Insert {
                    text: more,
                    attrs: more_attrs,
                },
            ) if *attrs == more_attrs => text.push_str(&more),
            (Some(DeltaOp::Delete { len }), DeltaOp::Delete { len: more }) => *len += more,
            (_, op) => self.ops.push(op),
        }
    }

    /// Drop a trailing plain retain, which carries no information.
    pub fn chop(mut self) -> Self {
        if let Some(DeltaOp::Retain { attrs, .. }) = self.ops.last() {
            if attrs.is_empty() {
                self.ops.pop();
            }
        }
        self
    }

    /// No content, mark or block-kind change.
    pub fn is_empty(&self) -> bool {
        self.head_kind.is_none()
            && self.ops.iter().all(|op| match op {
                DeltaOp::Retain { attrs, .. } => attrs.is_empty(),
                _ => false,
            })
    }

    /// Whether characters were inserted or deleted.
    pub fn changes_text(&self) -> bool {
        self.ops
            .iter()
            .any(|op| !matches!(op, DeltaOp::Retain { .. }))
    }

    /// Ranges of inserted text, in new-sequence offsets.
    pub fn inserted_ranges(&self) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        let mut new = 0;
        for op in &self.ops {
            if let DeltaOp::Insert { .. } = op {
                out.push(new..new + op.new_len());
            }
            new += op.new_len();
        }
        out
    }

    /// Ranges of deleted text, in old-sequence offsets.
    pub fn deleted_ranges(&self) -> Vec<Range<usize>> {
        let mut out = Vec::new();
        let mut old = 0;
        for op in &self.ops {
            if let DeltaOp::Delete { len } = op {
                out.push(old..old + len);
            }
            old += op.old_len();
        }
        out
    }

    /// Mark patches applied to retained text, in new-sequence offsets.
    pub fn attribute_changes(&self) -> Vec<(Range<usize>, &MarkPatch)> {
        let mut out = Vec::new();
        let mut new = 0;
        for op in &self.ops {
            if let DeltaOp::Retain { len, attrs } = op {
                if !attrs.is_empty() {
                    out.push((new..new + len, attrs));
                }
            }
            new += op.new_len();
        }
        out
    }

    /// Net change in sequence length.
    pub fn len_change(&self) -> isize {
        self.ops
            .iter()
            .map(|op| op.new_len() as isize - op.old_len() as isize)
            .sum()
    }
}
