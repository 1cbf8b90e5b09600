//! Comment anchors.
//!
//! A comment thread is anchored by marking its text with `thread:<id>`. The
//! binder walks one comment through selection and composition to that mark;
//! the ledger watches projected documents for anchors that disappear (all of
//! their text was deleted) or come back (undo, late concurrent updates).

use std::collections::BTreeMap;
use std::ops::Range;

use smol_str::SmolStr;

use marginalia_editor_core::{Document, Marks, SequenceDelta, remap_range};

use crate::error::AnchorError;

/// Where the comment in progress stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BinderState {
    #[default]
    Idle,
    RangeSelected {
        range: Range<usize>,
    },
    Composing {
        range: Range<usize>,
    },
    /// The thread exists and its anchor mark is written. The binder is done;
    /// the mark moves with the text from here on.
    Bound {
        thread: SmolStr,
    },
}

impl BinderState {
    fn name(&self) -> &'static str {
        match self {
            BinderState::Idle => "idle",
            BinderState::RangeSelected { .. } => "a range is selected",
            BinderState::Composing { .. } => "composing",
            BinderState::Bound { .. } => "bound",
        }
    }
}

/// State machine for attaching one new comment to a range.
#[derive(Debug, Clone, Default)]
pub struct CommentBinder {
    state: BinderState,
}

impl CommentBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &BinderState {
        &self.state
    }

    /// Capture the range to comment on. Starts a new cycle from `Idle` or
    /// after a previous thread was bound.
    pub fn select(&mut self, range: Range<usize>) -> Result<(), AnchorError> {
        match self.state {
            BinderState::Idle | BinderState::Bound { .. } => {}
            _ => return Err(self.invalid("select a range")),
        }
        if range.is_empty() {
            return Err(AnchorError::EmptyRange);
        }
        self.state = BinderState::RangeSelected { range };
        Ok(())
    }

    /// The user started typing the comment body.
    pub fn start_composing(&mut self) -> Result<(), AnchorError> {
        match &self.state {
            BinderState::RangeSelected { range } => {
                self.state = BinderState::Composing {
                    range: range.clone(),
                };
                Ok(())
            }
            _ => Err(self.invalid("start composing")),
        }
    }

    /// Abandon the comment. No mark is ever written.
    pub fn cancel(&mut self) -> Result<(), AnchorError> {
        match self.state {
            BinderState::RangeSelected { .. } | BinderState::Composing { .. } => {
                self.state = BinderState::Idle;
                Ok(())
            }
            _ => Err(self.invalid("cancel")),
        }
    }

    /// The range waiting for a thread, if any. Embedders decorate it as
    /// highlighted while the comment is being written.
    pub fn pending_range(&self) -> Option<Range<usize>> {
        match &self.state {
            BinderState::RangeSelected { range } | BinderState::Composing { range } => {
                Some(range.clone())
            }
            _ => None,
        }
    }

    /// Keep the pending range on the same characters.
    pub fn remap(&mut self, delta: &SequenceDelta) {
        if let BinderState::RangeSelected { range } | BinderState::Composing { range } =
            &mut self.state
        {
            *range = remap_range(range.clone(), delta);
        }
    }

    /// Move to `Bound` for a freshly minted thread and return the range its
    /// anchor mark must cover.
    ///
    /// If the pending text was deleted in the meantime the comment cannot be
    /// anchored: the binder returns to `Idle` and reports `EmptyRange`.
    pub fn bind(&mut self, thread_id: &str) -> Result<Range<usize>, AnchorError> {
        let range = match &self.state {
            BinderState::Composing { range } => range.clone(),
            _ => return Err(self.invalid("bind a thread")),
        };
        if thread_id.is_empty() {
            return Err(AnchorError::EmptyThreadId);
        }
        if range.is_empty() {
            self.state = BinderState::Idle;
            return Err(AnchorError::EmptyRange);
        }
        self.state = BinderState::Bound {
            thread: SmolStr::new(thread_id),
        };
        Ok(range)
    }

    /// Back to `Idle` unconditionally, after a failed anchor write.
    pub(crate) fn reset(&mut self) {
        self.state = BinderState::Idle;
    }

    fn invalid(&self, action: &'static str) -> AnchorError {
        AnchorError::InvalidTransition {
            action,
            state: self.state.name(),
        }
    }
}

/// The thread activated by clicking a run: the first `thread:<id>` key in
/// key order.
pub fn thread_for_marks(marks: &Marks) -> Option<&str> {
    marks.first_thread()
}

/// The thread activated by clicking at `offset`.
pub fn activate_at(doc: &Document, offset: usize) -> Option<SmolStr> {
    doc.marks_at(offset)
        .and_then(thread_for_marks)
        .map(SmolStr::new)
}

/// Whether `range` covers any inline text. Separators alone cannot carry an
/// anchor: the projection drops their marks.
pub fn covers_text(doc: &Document, range: &Range<usize>) -> bool {
    !range.is_empty()
        && doc
            .runs()
            .any(|(span, _)| span.start < range.end && range.start < span.end)
}

/// A thread whose anchored text is gone. Informational, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedAnchorWarning {
    pub thread_id: SmolStr,
    /// Where the anchor last covered text.
    pub last_range: Option<Range<usize>>,
}

/// A change in whether a known thread is anchored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorChange {
    Orphaned(OrphanedAnchorWarning),
    Reanchored {
        thread_id: SmolStr,
        ranges: Vec<Range<usize>>,
    },
}

/// Every thread id ever seen anchored, with its current ranges.
#[derive(Debug, Clone, Default)]
pub struct AnchorLedger {
    threads: BTreeMap<SmolStr, Vec<Range<usize>>>,
}

impl AnchorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking from an existing document without reporting anything.
    pub fn seed(doc: &Document) -> Self {
        Self {
            threads: doc.thread_ranges(),
        }
    }

    /// Compare `doc` with the previous state and report threads that lost or
    /// regained their anchor.
    pub fn update(&mut self, doc: &Document) -> Vec<AnchorChange> {
        let mut current = doc.thread_ranges();
        let mut changes = Vec::new();

        for (thread_id, previous) in self.threads.iter_mut() {
            let now = current.remove(thread_id).unwrap_or_default();
            match (previous.is_empty(), now.is_empty()) {
                (false, true) => {
                    tracing::debug!(%thread_id, "comment anchor orphaned");
                    changes.push(AnchorChange::Orphaned(OrphanedAnchorWarning {
                        thread_id: thread_id.clone(),
                        last_range: previous.first().cloned(),
                    }));
                }
                (true, false) => {
                    tracing::debug!(%thread_id, "comment anchor restored");
                    changes.push(AnchorChange::Reanchored {
                        thread_id: thread_id.clone(),
                        ranges: now.clone(),
                    });
                }
                _ => {}
            }
            *previous = now;
        }

        // Threads bound on this replica or by a peer since the last update.
        self.threads.extend(current);
        changes
    }

    pub fn ranges(&self, thread_id: &str) -> Option<&[Range<usize>]> {
        self.threads.get(thread_id).map(Vec::as_slice)
    }

    pub fn is_orphaned(&self, thread_id: &str) -> bool {
        self.threads
            .get(thread_id)
            .is_some_and(|ranges| ranges.is_empty())
    }

    /// Known threads with no text left.
    pub fn orphaned(&self) -> impl Iterator<Item = &str> {
        self.threads
            .iter()
            .filter(|(_, ranges)| ranges.is_empty())
            .map(|(id, _)| id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use marginalia_editor_core::{BOLD, Leaf, Marks, Node, PARAGRAPH, thread_key};

    use super::*;

    fn anchored(text: &str, before: &str, threads: &[&str]) -> Document {
        let mut marks = Marks::new();
        for id in threads {
            marks.insert(thread_key(id), true);
        }
        Document::new(vec![Node::with_children(
            PARAGRAPH,
            vec![Leaf::plain(before), Leaf::new(text, marks)],
        )])
    }

    #[test]
    fn test_full_cycle() {
        let mut binder = CommentBinder::new();
        binder.select(6..11).unwrap();
        binder.start_composing().unwrap();
        assert_eq!(binder.pending_range(), Some(6..11));

        let range = binder.bind("th_1").unwrap();
        assert_eq!(range, 6..11);
        assert_eq!(
            binder.state(),
            &BinderState::Bound {
                thread: "th_1".into()
            }
        );
        assert_eq!(binder.pending_range(), None);

        // A new cycle may start after binding.
        binder.select(0..2).unwrap();
    }

    #[test]
    fn test_cancel_returns_to_idle() {
        let mut binder = CommentBinder::new();
        binder.select(0..3).unwrap();
        binder.cancel().unwrap();
        assert_eq!(binder.state(), &BinderState::Idle);

        binder.select(0..3).unwrap();
        binder.start_composing().unwrap();
        binder.cancel().unwrap();
        assert_eq!(binder.state(), &BinderState::Idle);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut binder = CommentBinder::new();
        assert!(matches!(
            binder.bind("th_1"),
            Err(AnchorError::InvalidTransition { state: "idle", .. })
        ));
        assert!(binder.start_composing().is_err());
        assert!(binder.cancel().is_err());

        binder.select(0..3).unwrap();
        assert!(binder.select(1..2).is_err());
        assert!(binder.bind("th_1").is_err());
        assert_eq!(CommentBinder::new().select(2..2), Err(AnchorError::EmptyRange));
    }

    #[test]
    fn test_pending_range_follows_edits_and_can_vanish() {
        let mut binder = CommentBinder::new();
        binder.select(6..11).unwrap();
        binder.start_composing().unwrap();

        binder.remap(&SequenceDelta::new().insert("X", Marks::new()));
        assert_eq!(binder.pending_range(), Some(7..12));

        binder.remap(&SequenceDelta::new().retain(7).delete(5));
        assert_eq!(binder.pending_range(), Some(7..7));

        assert_eq!(binder.bind("th_1"), Err(AnchorError::EmptyRange));
        assert_eq!(binder.state(), &BinderState::Idle);
    }

    #[test]
    fn test_first_match_wins() {
        let marks = Marks::new()
            .with(BOLD, true)
            .with(thread_key("th_b"), true)
            .with(thread_key("th_a"), true);
        assert_eq!(thread_for_marks(&marks), Some("th_a"));

        let doc = anchored("world", "hello ", &["th_z", "th_c"]);
        assert_eq!(activate_at(&doc, 7).as_deref(), Some("th_c"));
        assert_eq!(activate_at(&doc, 2), None);
    }

    #[test]
    fn test_separator_only_ranges_cover_no_text() {
        let doc = Document::new(vec![Node::paragraph("ab"), Node::paragraph("cd")]);
        assert!(!covers_text(&doc, &(2..3)));
        assert!(covers_text(&doc, &(1..3)));
        assert!(covers_text(&doc, &(2..4)));
        assert!(!covers_text(&doc, &(1..1)));
    }

    #[test]
    fn test_ledger_orphan_and_reanchor() {
        let mut ledger = AnchorLedger::new();
        assert!(ledger.update(&anchored("world", "hello ", &["t1"])).is_empty());
        assert_eq!(ledger.ranges("t1"), Some(&[6..11][..]));

        let changes = ledger.update(&Document::from_plain_text("hello "));
        assert_eq!(
            changes,
            vec![AnchorChange::Orphaned(OrphanedAnchorWarning {
                thread_id: "t1".into(),
                last_range: Some(6..11),
            })]
        );
        assert!(ledger.is_orphaned("t1"));
        assert_eq!(ledger.orphaned().collect::<Vec<_>>(), vec!["t1"]);

        // Reported once, not on every update.
        assert!(ledger.update(&Document::from_plain_text("hello ")).is_empty());

        let changes = ledger.update(&anchored("world", "hello ", &["t1"]));
        assert_eq!(
            changes,
            vec![AnchorChange::Reanchored {
                thread_id: "t1".into(),
                ranges: vec![6..11],
            }]
        );
    }
}
