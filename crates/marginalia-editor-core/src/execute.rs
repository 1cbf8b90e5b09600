//! Document edits and delta translation.
//!
//! `translate_delta` turns a sequence delta observed on the replicated store
//! into the document edits that reproduce it, replaying each one on a working
//! copy of the current tree as it goes. Offsets in every `DocumentEdit` refer
//! to the document as it is when that edit is applied, so the edit list can be
//! replayed in order on the original tree.

use std::ops::Range;

use smol_str::SmolStr;

use crate::delta::{DeltaOp, SequenceDelta};
use crate::document::{Document, DocumentError, SEPARATOR};
use crate::marks::{BLOCK_KEY, MarkPatch, Marks};
use crate::node::NodeKindRegistry;

/// A primitive edit on the projected tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentEdit {
    InsertText {
        at: usize,
        text: String,
        marks: Marks,
    },
    RemoveText {
        range: Range<usize>,
    },
    /// Split the block containing `at`; the new block gets `kind`.
    SplitNode {
        at: usize,
        kind: SmolStr,
    },
    /// Merge `block` into the block before it.
    MergeNode {
        block: usize,
    },
    FormatText {
        range: Range<usize>,
        patch: MarkPatch,
    },
    SetNodeKind {
        block: usize,
        kind: SmolStr,
    },
}

/// Apply one edit to a document.
pub fn apply_edit(
    doc: &mut Document,
    edit: &DocumentEdit,
    registry: &NodeKindRegistry,
) -> Result<(), DocumentError> {
    match edit {
        DocumentEdit::InsertText { at, text, marks } => {
            doc.insert_text(*at, text, marks.clone(), registry)
        }
        DocumentEdit::RemoveText { range } => doc.remove_text(range.clone(), registry),
        DocumentEdit::SplitNode { at, kind } => doc.split_node(*at, kind, registry),
        DocumentEdit::MergeNode { block } => doc.merge_node(*block, registry),
        DocumentEdit::FormatText { range, patch } => doc.format(range.clone(), patch, registry),
        DocumentEdit::SetNodeKind { block, kind } => doc.set_node_kind(*block, kind, registry),
    }
}

/// Apply a list of edits in order.
pub fn replay(
    doc: &mut Document,
    edits: &[DocumentEdit],
    registry: &NodeKindRegistry,
) -> Result<(), DocumentError> {
    for edit in edits {
        apply_edit(doc, edit, registry)?;
    }
    Ok(())
}

/// The document edits equivalent to one delta, and the tree they produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub edits: Vec<DocumentEdit>,
    pub document: Document,
}

/// Translate a store delta into document edits against `doc`.
///
/// Fails when the delta does not fit the document (it was computed against a
/// different state); callers then fall back to a full projection.
pub fn translate_delta(
    doc: &Document,
    delta: &SequenceDelta,
    registry: &NodeKindRegistry,
) -> Result<Translation, DocumentError> {
    let mut tx = Translator {
        doc: doc.clone(),
        edits: Vec::new(),
        registry,
    };
    let mut pos = 0;

    for op in &delta.ops {
        match op {
            DeltaOp::Retain { len, attrs } => {
                tx.retain(pos, *len, attrs)?;
                pos += len;
            }
            DeltaOp::Insert { text, attrs } => {
                pos = tx.insert(pos, text, attrs)?;
            }
            DeltaOp::Delete { len } => tx.delete(pos, *len)?,
        }
    }

    if let Some(kind) = &delta.head_kind {
        tx.push(DocumentEdit::SetNodeKind {
            block: 0,
            kind: kind.clone(),
        })?;
    }

    Ok(Translation {
        edits: tx.edits,
        document: tx.doc,
    })
}

struct Translator<'a> {
    doc: Document,
    edits: Vec<DocumentEdit>,
    registry: &'a NodeKindRegistry,
}

impl Translator<'_> {
    fn push(&mut self, edit: DocumentEdit) -> Result<(), DocumentError> {
        apply_edit(&mut self.doc, &edit, self.registry)?;
        self.edits.push(edit);
        Ok(())
    }

    fn retain(&mut self, pos: usize, len: usize, attrs: &MarkPatch) -> Result<(), DocumentError> {
        if attrs.is_empty() {
            return Ok(());
        }
        let end = pos + len;
        if end > self.doc.len_chars() {
            return Err(DocumentError::OutOfBounds {
                offset: end,
                len: self.doc.len_chars(),
            });
        }

        let patch: MarkPatch = attrs
            .iter()
            .filter(|(key, _)| key.as_str() != BLOCK_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if !patch.is_empty() {
            self.push(DocumentEdit::FormatText {
                range: pos..end,
                patch,
            })?;
        }

        if let Some(block_value) = attrs.get(BLOCK_KEY) {
            let kind = block_value
                .as_ref()
                .and_then(|value| value.as_text())
                .unwrap_or(self.registry.fallback().tag());
            let kind = SmolStr::new(kind);
            // Every separator inside the span changes the kind of the block after it.
            for block in 1..self.doc.len_blocks() {
                let Some(start) = self.doc.block_start(block) else {
                    continue;
                };
                let separator = start - 1;
                if (pos..end).contains(&separator) {
                    self.push(DocumentEdit::SetNodeKind {
                        block,
                        kind: kind.clone(),
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Returns the position after the inserted text.
    fn insert(&mut self, mut pos: usize, text: &str, attrs: &Marks) -> Result<usize, DocumentError> {
        let marks = attrs.without_block();
        let kind = attrs
            .get(BLOCK_KEY)
            .and_then(|value| value.as_text())
            .unwrap_or(self.registry.fallback().tag());
        let kind = SmolStr::new(kind);

        for (idx, part) in text.split(SEPARATOR).enumerate() {
            if idx > 0 {
                self.push(DocumentEdit::SplitNode {
                    at: pos,
                    kind: kind.clone(),
                })?;
                pos += 1;
            }
            if !part.is_empty() {
                self.push(DocumentEdit::InsertText {
                    at: pos,
                    text: part.to_string(),
                    marks: marks.clone(),
                })?;
                pos += part.chars().count();
            }
        }
        Ok(pos)
    }

    fn delete(&mut self, pos: usize, len: usize) -> Result<(), DocumentError> {
        let mut remaining = len;
        while remaining > 0 {
            let (block, offset) = self.doc.block_at(pos)?;
            let available = self.doc.nodes()[block].len_chars() - offset;
            if available > 0 {
                let n = available.min(remaining);
                self.push(DocumentEdit::RemoveText { range: pos..pos + n })?;
                remaining -= n;
            } else {
                // Sitting on the separator after `block`.
                self.push(DocumentEdit::MergeNode { block: block + 1 })?;
                remaining -= 1;
            }
        }
        Ok(())
    }
}
