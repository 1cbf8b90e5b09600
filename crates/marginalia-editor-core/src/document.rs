//! The projected document tree: blocks of inline leaves.
//!
//! A `Document` is a derived, disposable view of the replicated sequence. It
//! is rebuilt (or replayed) after every accepted change and never written
//! back. The flattened form joins blocks with one separator character, so a
//! document with blocks `"ab"` and `"c"` has length 4 and the separator sits
//! at offset 2.

use std::collections::BTreeMap;
use std::ops::Range;

use smol_str::SmolStr;
use thiserror::Error;

use crate::marks::{MarkPatch, Marks};
use crate::node::{NodeKindRegistry, PARAGRAPH, hash_source, make_node_id};
use crate::types::Point;

/// The character joining two blocks in the flattened text.
pub const SEPARATOR: char = '\n';

/// Errors from addressing or editing a document tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DocumentError {
    /// Offset past the end of the document.
    #[error("offset {offset} is outside the document (length {len})")]
    OutOfBounds { offset: usize, len: usize },

    /// Text edits never cross a block boundary; crossing edits are split by
    /// the translator.
    #[error("range {start}..{end} crosses a block boundary")]
    CrossesBlock { start: usize, end: usize },

    /// Block index that does not exist.
    #[error("block {block} does not exist ({count} blocks)")]
    NoSuchBlock { block: usize, count: usize },

    /// Inline text containing a separator.
    #[error("inline text may not contain a block separator")]
    SeparatorInText,
}

/// The atomic unit of text: a string plus its marks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Leaf {
    pub text: String,
    pub marks: Marks,
}

impl Leaf {
    pub fn new(text: impl Into<String>, marks: Marks) -> Self {
        Self {
            text: text.into(),
            marks,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Marks::new())
    }

    pub fn len_chars(&self) -> usize {
        self.text.chars().count()
    }

    /// Split off the text after `char_offset` into a new leaf with the same marks.
    fn split_off(&mut self, char_offset: usize) -> Leaf {
        let byte = byte_index(&self.text, char_offset);
        Leaf {
            text: self.text.split_off(byte),
            marks: self.marks.clone(),
        }
    }
}

/// A block-level node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Positional id (`n-<index>`), reassigned whenever blocks move.
    pub id: SmolStr,
    /// Kind tag, always one the registry knows.
    pub kind: SmolStr,
    pub children: Vec<Leaf>,
}

impl Node {
    pub fn new(kind: impl Into<SmolStr>) -> Self {
        Self {
            id: SmolStr::default(),
            kind: kind.into(),
            children: vec![Leaf::default()],
        }
    }

    pub fn with_children(kind: impl Into<SmolStr>, children: Vec<Leaf>) -> Self {
        let mut node = Self {
            id: SmolStr::default(),
            kind: kind.into(),
            children,
        };
        node.normalize_leaves();
        node
    }

    pub fn paragraph(text: &str) -> Self {
        Self::with_children(PARAGRAPH, vec![Leaf::plain(text)])
    }

    pub fn text(&self) -> String {
        self.children.iter().map(|leaf| leaf.text.as_str()).collect()
    }

    pub fn len_chars(&self) -> usize {
        self.children.iter().map(Leaf::len_chars).sum()
    }

    /// Hash of the block text for change detection.
    pub fn source_hash(&self) -> u64 {
        hash_source(&self.text())
    }

    /// Merge adjacent leaves with identical marks, drop empty leaves, and
    /// guarantee at least one leaf.
    pub fn normalize_leaves(&mut self) {
        let mut merged: Vec<Leaf> = Vec::with_capacity(self.children.len());
        for leaf in self.children.drain(..) {
            if leaf.text.is_empty() {
                continue;
            }
            match merged.last_mut() {
                Some(last) if last.marks == leaf.marks => last.text.push_str(&leaf.text),
                _ => merged.push(leaf),
            }
        }
        if merged.is_empty() {
            merged.push(Leaf::default());
        }
        self.children = merged;
    }

    /// Locate the leaf containing `offset`, returning (leaf index, offset in leaf).
    ///
    /// An offset on a boundary resolves to the end of the earlier leaf.
    pub fn leaf_at(&self, offset: usize) -> Option<(usize, usize)> {
        let mut start = 0;
        for (idx, leaf) in self.children.iter().enumerate() {
            let len = leaf.len_chars();
            if offset <= start + len {
                return Some((idx, offset - start));
            }
            start += len;
        }
        None
    }

    /// Make sure a leaf starts at `offset`, splitting one if needed.
    /// Returns the index of the leaf starting there (or `children.len()` at the end).
    fn ensure_boundary(&mut self, offset: usize) -> usize {
        let mut start = 0;
        for idx in 0..self.children.len() {
            let len = self.children[idx].len_chars();
            if offset == start {
                return idx;
            }
            if offset < start + len {
                let tail = self.children[idx].split_off(offset - start);
                self.children.insert(idx + 1, tail);
                return idx + 1;
            }
            start += len;
        }
        self.children.len()
    }

    fn insert_text(&mut self, offset: usize, text: &str, marks: Marks) {
        let idx = self.ensure_boundary(offset);
        self.children.insert(idx, Leaf::new(text, marks));
    }

    fn remove_text(&mut self, range: Range<usize>) {
        let start = self.ensure_boundary(range.start);
        let end = self.ensure_boundary(range.end);
        self.children.drain(start..end);
    }

    fn format(&mut self, range: Range<usize>, patch: &MarkPatch) {
        let start = self.ensure_boundary(range.start);
        let end = self.ensure_boundary(range.end);
        for leaf in &mut self.children[start..end] {
            leaf.marks.apply_patch(patch);
        }
    }

    fn split_off(&mut self, offset: usize) -> Vec<Leaf> {
        let idx = self.ensure_boundary(offset);
        self.children.split_off(idx)
    }
}

/// An ordered, never-empty sequence of blocks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Document {
    /// Build a document, restoring the "at least one block" invariant and
    /// assigning positional ids.
    pub fn new(mut nodes: Vec<Node>) -> Self {
        if nodes.is_empty() {
            nodes.push(Node::new(PARAGRAPH));
        }
        let mut doc = Self { nodes };
        doc.renumber();
        doc
    }

    /// Parse plain text into paragraphs, one per line.
    pub fn from_plain_text(text: &str) -> Self {
        Self::new(text.split(SEPARATOR).map(Node::paragraph).collect())
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, block: usize) -> Option<&Node> {
        self.nodes.get(block)
    }

    pub fn len_blocks(&self) -> usize {
        self.nodes.len()
    }

    /// Total length including separators.
    pub fn len_chars(&self) -> usize {
        let text: usize = self.nodes.iter().map(Node::len_chars).sum();
        text + self.nodes.len() - 1
    }

    /// The flattened text, blocks joined by separators.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if idx > 0 {
                out.push(SEPARATOR);
            }
            out.push_str(&node.text());
        }
        out
    }

    /// Flat offset where `block` starts.
    pub fn block_start(&self, block: usize) -> Option<usize> {
        if block >= self.nodes.len() {
            return None;
        }
        Some(
            self.nodes[..block]
                .iter()
                .map(|node| node.len_chars() + 1)
                .sum(),
        )
    }

    /// Resolve a flat offset to (block index, offset within block).
    ///
    /// The separator position after block `i` resolves to the end of block `i`.
    pub fn block_at(&self, offset: usize) -> Result<(usize, usize), DocumentError> {
        let mut start = 0;
        for (idx, node) in self.nodes.iter().enumerate() {
            let len = node.len_chars();
            if offset <= start + len {
                return Ok((idx, offset - start));
            }
            start += len + 1;
        }
        Err(DocumentError::OutOfBounds {
            offset,
            len: self.len_chars(),
        })
    }

    /// Flat offset of a tree point.
    pub fn point_to_offset(&self, point: Point) -> Option<usize> {
        let node = self.nodes.get(point.block)?;
        let leaf = node.children.get(point.leaf)?;
        if point.offset > leaf.len_chars() {
            return None;
        }
        let in_block: usize = node.children[..point.leaf]
            .iter()
            .map(Leaf::len_chars)
            .sum();
        Some(self.block_start(point.block)? + in_block + point.offset)
    }

    /// Tree point of a flat offset.
    pub fn offset_to_point(&self, offset: usize) -> Option<Point> {
        let (block, in_block) = self.block_at(offset).ok()?;
        let (leaf, in_leaf) = self.nodes[block].leaf_at(in_block)?;
        Some(Point::new(block, leaf, in_leaf))
    }

    /// Marks of the character starting at `offset`, if it is inline text.
    pub fn marks_at(&self, offset: usize) -> Option<&Marks> {
        let (block, in_block) = self.block_at(offset).ok()?;
        let node = &self.nodes[block];
        let mut start = 0;
        for leaf in &node.children {
            let len = leaf.len_chars();
            if in_block < start + len {
                return Some(&leaf.marks);
            }
            start += len;
        }
        None
    }

    /// True when every character of `range` carries `key = true`.
    /// Separators are ignored; a range with no text is never active.
    pub fn is_mark_active(&self, range: Range<usize>, key: &str) -> bool {
        if range.is_empty() {
            return false;
        }
        let mut saw_text = false;
        for (span, marks) in self.runs() {
            if span.end <= range.start || span.start >= range.end {
                continue;
            }
            saw_text = true;
            if !marks.is_active(key) {
                return false;
            }
        }
        saw_text
    }

    /// Every non-empty leaf with its flat range, in document order.
    pub fn runs(&self) -> impl Iterator<Item = (Range<usize>, &Marks)> {
        let mut offset = 0;
        let mut out = Vec::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if idx > 0 {
                offset += 1;
            }
            for leaf in &node.children {
                let len = leaf.len_chars();
                if len > 0 {
                    out.push((offset..offset + len, &leaf.marks));
                }
                offset += len;
            }
        }
        out.into_iter()
    }

    /// Ranges covered by each thread anchor, in document order.
    ///
    /// A range interrupted only by a block separator is reported as one range.
    pub fn thread_ranges(&self) -> BTreeMap<SmolStr, Vec<Range<usize>>> {
        let mut ranges: BTreeMap<SmolStr, Vec<Range<usize>>> = BTreeMap::new();
        for (span, marks) in self.runs() {
            for id in marks.thread_ids() {
                let entry = ranges.entry(SmolStr::new(id)).or_default();
                match entry.last_mut() {
                    Some(last) if self.is_contiguous(last.end, span.start) => {
                        last.end = span.end;
                    }
                    _ => entry.push(span.clone()),
                }
            }
        }
        ranges
    }

    fn is_contiguous(&self, end: usize, start: usize) -> bool {
        end == start || (end + 1 == start && self.text_char(end) == Some(SEPARATOR))
    }

    fn text_char(&self, offset: usize) -> Option<char> {
        let (block, in_block) = self.block_at(offset).ok()?;
        if in_block == self.nodes[block].len_chars() {
            return (block + 1 < self.nodes.len()).then_some(SEPARATOR);
        }
        self.nodes[block].text().chars().nth(in_block)
    }

    /// Flattened (text, marks) runs, separators included with empty marks.
    ///
    /// Two documents with equal content produce equal run lists regardless
    /// of how their leaves were split.
    pub fn content(&self) -> Vec<(String, Marks)> {
        let mut out: Vec<(String, Marks)> = Vec::new();
        let mut push = |text: &str, marks: &Marks| {
            if text.is_empty() {
                return;
            }
            match out.last_mut() {
                Some((last, last_marks)) if last_marks == marks => last.push_str(text),
                _ => out.push((text.to_string(), marks.clone())),
            }
        };
        let separator = Marks::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            if idx > 0 {
                push("\n", &separator);
            }
            for leaf in &node.children {
                push(&leaf.text, &leaf.marks);
            }
        }
        out
    }

    /// Reassign positional ids after blocks were added or removed.
    fn renumber(&mut self) {
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            node.id = make_node_id(idx);
        }
    }

    fn normalize_block(&mut self, block: usize, registry: &NodeKindRegistry) {
        let node = &mut self.nodes[block];
        registry.resolve(&node.kind).normalize(node);
    }

    pub(crate) fn insert_text(
        &mut self,
        at: usize,
        text: &str,
        marks: Marks,
        registry: &NodeKindRegistry,
    ) -> Result<(), DocumentError> {
        if text.contains(SEPARATOR) {
            return Err(DocumentError::SeparatorInText);
        }
        let (block, offset) = self.block_at(at)?;
        self.nodes[block].insert_text(offset, text, marks);
        self.normalize_block(block, registry);
        Ok(())
    }

    pub(crate) fn remove_text(
        &mut self,
        range: Range<usize>,
        registry: &NodeKindRegistry,
    ) -> Result<(), DocumentError> {
        let (block, start) = self.block_at(range.start)?;
        let end = start + range.len();
        if end > self.nodes[block].len_chars() {
            return Err(DocumentError::CrossesBlock {
                start: range.start,
                end: range.end,
            });
        }
        self.nodes[block].remove_text(start..end);
        self.normalize_block(block, registry);
        Ok(())
    }

    pub(crate) fn format(
        &mut self,
        range: Range<usize>,
        patch: &MarkPatch,
        registry: &NodeKindRegistry,
    ) -> Result<(), DocumentError> {
        if range.end > self.len_chars() {
            return Err(DocumentError::OutOfBounds {
                offset: range.end,
                len: self.len_chars(),
            });
        }
        for block in 0..self.nodes.len() {
            let start = self.block_start(block).unwrap_or_default();
            let end = start + self.nodes[block].len_chars();
            let local_start = range.start.max(start);
            let local_end = range.end.min(end);
            if local_start >= local_end {
                continue;
            }
            self.nodes[block].format(local_start - start..local_end - start, patch);
            self.normalize_block(block, registry);
        }
        Ok(())
    }

    pub(crate) fn split_node(
        &mut self,
        at: usize,
        kind: &str,
        registry: &NodeKindRegistry,
    ) -> Result<(), DocumentError> {
        let (block, offset) = self.block_at(at)?;
        let tail = self.nodes[block].split_off(offset);
        let kind = registry.resolve(kind).tag();
        let node = Node {
            id: SmolStr::default(),
            kind: SmolStr::new(kind),
            children: tail,
        };
        self.nodes.insert(block + 1, node);
        self.normalize_block(block, registry);
        self.normalize_block(block + 1, registry);
        self.renumber();
        Ok(())
    }

    pub(crate) fn merge_node(
        &mut self,
        block: usize,
        registry: &NodeKindRegistry,
    ) -> Result<(), DocumentError> {
        if block == 0 || block >= self.nodes.len() {
            return Err(DocumentError::NoSuchBlock {
                block,
                count: self.nodes.len(),
            });
        }
        let merged = self.nodes.remove(block);
        self.nodes[block - 1].children.extend(merged.children);
        self.normalize_block(block - 1, registry);
        self.renumber();
        Ok(())
    }

    pub(crate) fn set_node_kind(
        &mut self,
        block: usize,
        kind: &str,
        registry: &NodeKindRegistry,
    ) -> Result<(), DocumentError> {
        let count = self.nodes.len();
        let node = self
            .nodes
            .get_mut(block)
            .ok_or(DocumentError::NoSuchBlock { block, count })?;
        node.kind = SmolStr::new(registry.resolve(kind).tag());
        self.normalize_block(block, registry);
        Ok(())
    }
}

/// Byte index of a char offset, clamped to the end of the string.
pub(crate) fn byte_index(s: &str, char_offset: usize) -> usize {
    s.char_indices()
        .nth(char_offset)
        .map(|(idx, _)| idx)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marks::{BOLD, ITALIC, MarkValue, thread_key};

    fn bold() -> Marks {
        Marks::new().with(BOLD, true)
    }

    #[test]
    fn test_empty_document_has_one_block_one_leaf() {
        let doc = Document::new(Vec::new());
        assert_eq!(doc.len_blocks(), 1);
        assert_eq!(doc.nodes()[0].children.len(), 1);
        assert_eq!(doc.nodes()[0].children[0], Leaf::default());
        assert_eq!(doc.len_chars(), 0);
    }

    #[test]
    fn test_plain_text_blocks_and_offsets() {
        let doc = Document::from_plain_text("ab\nc");
        assert_eq!(doc.len_blocks(), 2);
        assert_eq!(doc.len_chars(), 4);
        assert_eq!(doc.text(), "ab\nc");
        assert_eq!(doc.block_at(2), Ok((0, 2)));
        assert_eq!(doc.block_at(3), Ok((1, 0)));
        assert_eq!(doc.block_at(4), Ok((1, 1)));
        assert!(doc.block_at(5).is_err());
        assert_eq!(doc.block_start(1), Some(3));
    }

    #[test]
    fn test_point_offset_conversion() {
        let doc = Document::new(vec![
            Node::paragraph("hello"),
            Node::with_children(
                PARAGRAPH,
                vec![Leaf::plain("ab"), Leaf::new("cd", bold())],
            ),
        ]);

        let point = Point::new(1, 1, 1);
        assert_eq!(doc.point_to_offset(point), Some(9));
        assert_eq!(doc.offset_to_point(9), Some(Point::new(1, 1, 1)));
        // Leaf boundary resolves to the end of the earlier leaf.
        assert_eq!(doc.offset_to_point(8), Some(Point::new(1, 0, 2)));
        assert_eq!(doc.point_to_offset(Point::new(1, 0, 3)), None);
    }

    #[test]
    fn test_normalize_merges_and_drops() {
        let node = Node::with_children(
            PARAGRAPH,
            vec![
                Leaf::new("a", bold()),
                Leaf::new("", Marks::new()),
                Leaf::new("b", bold()),
                Leaf::plain("c"),
            ],
        );
        assert_eq!(
            node.children,
            vec![Leaf::new("ab", bold()), Leaf::plain("c")]
        );
    }

    #[test]
    fn test_insert_with_different_marks_splits_leaf() {
        let registry = NodeKindRegistry::default();
        let mut doc = Document::from_plain_text("hello");
        doc.insert_text(2, "XY", bold(), &registry).unwrap();

        assert_eq!(
            doc.nodes()[0].children,
            vec![
                Leaf::plain("he"),
                Leaf::new("XY", bold()),
                Leaf::plain("llo")
            ]
        );
    }

    #[test]
    fn test_format_across_blocks() {
        let registry = NodeKindRegistry::default();
        let mut doc = Document::from_plain_text("abc\ndef");
        let mut patch = MarkPatch::new();
        patch.insert(ITALIC.into(), Some(MarkValue::Bool(true)));
        doc.format(1..6, &patch, &registry).unwrap();

        let italic = Marks::new().with(ITALIC, true);
        assert_eq!(
            doc.nodes()[0].children,
            vec![Leaf::plain("a"), Leaf::new("bc", italic.clone())]
        );
        assert_eq!(
            doc.nodes()[1].children,
            vec![Leaf::new("de", italic), Leaf::plain("f")]
        );
    }

    #[test]
    fn test_split_and_merge() {
        let registry = NodeKindRegistry::default();
        let mut doc = Document::from_plain_text("hello world");
        doc.split_node(5, PARAGRAPH, &registry).unwrap();
        assert_eq!(doc.text(), "hello\n world");
        assert_eq!(doc.nodes()[1].id, "n-1");

        doc.merge_node(1, &registry).unwrap();
        assert_eq!(doc.text(), "hello world");
        assert_eq!(doc.len_blocks(), 1);
        assert!(doc.merge_node(0, &registry).is_err());
    }

    #[test]
    fn test_remove_text_rejects_crossing_block() {
        let registry = NodeKindRegistry::default();
        let mut doc = Document::from_plain_text("ab\ncd");
        assert_eq!(
            doc.remove_text(1..4, &registry),
            Err(DocumentError::CrossesBlock { start: 1, end: 4 })
        );
        doc.remove_text(0..2, &registry).unwrap();
        assert_eq!(doc.text(), "\ncd");
        assert_eq!(doc.nodes()[0].children, vec![Leaf::default()]);
    }

    #[test]
    fn test_thread_ranges_bridge_separators() {
        let anchored = Marks::new().with(thread_key("t1"), true);
        let doc = Document::new(vec![
            Node::with_children(
                PARAGRAPH,
                vec![Leaf::plain("ab"), Leaf::new("cd", anchored.clone())],
            ),
            Node::with_children(
                PARAGRAPH,
                vec![Leaf::new("ef", anchored.clone()), Leaf::plain("g")],
            ),
            Node::with_children(PARAGRAPH, vec![Leaf::new("h", anchored)]),
        ]);

        let ranges = doc.thread_ranges();
        // "cd" + separator + "ef" is one range; "h" follows an unanchored "g".
        assert_eq!(ranges["t1"], vec![2..7, 9..10]);
    }

    #[test]
    fn test_is_mark_active() {
        let doc = Document::new(vec![Node::with_children(
            PARAGRAPH,
            vec![Leaf::new("abc", bold()), Leaf::plain("d")],
        )]);
        assert!(doc.is_mark_active(0..3, BOLD));
        assert!(!doc.is_mark_active(0..4, BOLD));
        assert!(!doc.is_mark_active(2..2, BOLD));
    }

    #[test]
    fn test_content_ignores_leaf_splits() {
        let a = Document::new(vec![Node::with_children(
            PARAGRAPH,
            vec![Leaf::plain("ab"), Leaf::plain("cd")],
        )]);
        let b = Document::from_plain_text("abcd");
        assert_eq!(a.content(), b.content());
        assert_eq!(a, b);
    }

    #[test]
    fn test_projection_outline_snapshot() {
        let doc = Document::new(vec![
            Node::with_children(
                PARAGRAPH,
                vec![Leaf::plain("hello "), Leaf::new("world", bold())],
            ),
            Node::new(PARAGRAPH),
        ]);
        let outline: Vec<String> = doc
            .nodes()
            .iter()
            .map(|node| {
                let leaves: Vec<String> = node
                    .children
                    .iter()
                    .map(|leaf| {
                        let keys: Vec<&str> = leaf.marks.keys().collect();
                        if keys.is_empty() {
                            format!("{:?}", leaf.text)
                        } else {
                            format!("{:?}[{}]", leaf.text, keys.join(","))
                        }
                    })
                    .collect();
                format!("{} {}: {}", node.id, node.kind, leaves.join(" "))
            })
            .collect();
        insta::assert_snapshot!("projection_outline", outline.join("\n"));
    }
}
