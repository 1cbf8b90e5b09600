//! Translating local edits into store mutations.
//!
//! `plan_local_edit` validates an edit against the current projection and
//! returns the mutations that implement it. Nothing is written until the
//! whole plan is known, so a rejected edit never leaves a partial change
//! behind. `apply_mutations` then runs a plan as a single store commit.

use std::ops::Range;

use smol_str::SmolStr;

use marginalia_editor_core::{
    BLOCK_KEY, Document, EXPANDING_MARKS, LocalEdit, MarkKey, MarkValue, NodeKindRegistry,
    SequenceDelta, thread_key,
};

use crate::anchor::covers_text;
use crate::error::{AnchorError, CrdtError, EngineError};
use crate::store::SequenceStore;

/// A single write to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMutation {
    Insert {
        at: usize,
        text: String,
    },
    Delete {
        range: Range<usize>,
    },
    Mark {
        range: Range<usize>,
        key: SmolStr,
        value: MarkValue,
    },
    Unmark {
        range: Range<usize>,
        key: SmolStr,
    },
    SetHeadKind {
        kind: SmolStr,
    },
}

/// Validate `edit` against `doc` and plan its store mutations.
///
/// An empty plan means the edit is a no-op (empty text, empty range).
pub fn plan_local_edit(
    doc: &Document,
    registry: &NodeKindRegistry,
    edit: &LocalEdit,
) -> Result<Vec<StoreMutation>, EngineError> {
    let len = doc.len_chars();
    match edit {
        LocalEdit::InsertText {
            at, text, marks, ..
        } => {
            check_offset(*at, len)?;
            if text.is_empty() {
                return Ok(Vec::new());
            }
            let range = *at..*at + text.chars().count();
            let mut plan = vec![StoreMutation::Insert {
                at: *at,
                text: text.clone(),
            }];
            if let Some(marks) = marks {
                for (key, _) in marks {
                    check_formatting_key(key)?;
                }
                // Drop expanding marks the run would otherwise inherit.
                for key in EXPANDING_MARKS {
                    if !marks.contains(key) {
                        plan.push(StoreMutation::Unmark {
                            range: range.clone(),
                            key: SmolStr::new_static(key),
                        });
                    }
                }
                for (key, value) in marks {
                    plan.push(StoreMutation::Mark {
                        range: range.clone(),
                        key: key.clone(),
                        value: value.clone(),
                    });
                }
            }
            Ok(plan)
        }

        LocalEdit::DeleteRange { range } => {
            check_range(range, len)?;
            if range.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![StoreMutation::Delete {
                range: range.clone(),
            }])
        }

        LocalEdit::SplitNode { at } => {
            check_offset(*at, len)?;
            let (block, _) = doc
                .block_at(*at)
                .map_err(|_| EngineError::invalid_range(*at..*at, len))?;
            let handler = registry.resolve(&doc.nodes()[block].kind);
            let kind = handler.split_kind().unwrap_or(handler.tag());

            let mut plan = vec![StoreMutation::Insert {
                at: *at,
                text: "\n".to_string(),
            }];
            if !registry.is_fallback(kind) {
                plan.push(StoreMutation::Mark {
                    range: *at..*at + 1,
                    key: SmolStr::new_static(BLOCK_KEY),
                    value: MarkValue::from(kind),
                });
            }
            Ok(plan)
        }

        LocalEdit::MergeNodes { block } => {
            let separator = separator_before(doc, *block)?;
            Ok(vec![StoreMutation::Delete {
                range: separator..separator + 1,
            }])
        }

        LocalEdit::SetMark { range, key, value } => {
            check_range(range, len)?;
            check_formatting_key(key)?;
            if range.is_empty() {
                return Ok(Vec::new());
            }
            if !value.is_set() {
                return Ok(vec![StoreMutation::Unmark {
                    range: range.clone(),
                    key: key.clone(),
                }]);
            }
            Ok(vec![StoreMutation::Mark {
                range: range.clone(),
                key: key.clone(),
                value: value.clone(),
            }])
        }

        LocalEdit::UnsetMark { range, key } => {
            check_range(range, len)?;
            check_formatting_key(key)?;
            if range.is_empty() {
                return Ok(Vec::new());
            }
            Ok(vec![StoreMutation::Unmark {
                range: range.clone(),
                key: key.clone(),
            }])
        }

        LocalEdit::ToggleMark { range, key } => {
            check_range(range, len)?;
            check_formatting_key(key)?;
            if range.is_empty() {
                return Ok(Vec::new());
            }
            if doc.is_mark_active(range.clone(), key) {
                Ok(vec![StoreMutation::Unmark {
                    range: range.clone(),
                    key: key.clone(),
                }])
            } else {
                Ok(vec![StoreMutation::Mark {
                    range: range.clone(),
                    key: key.clone(),
                    value: MarkValue::Bool(true),
                }])
            }
        }

        LocalEdit::SetNodeKind { block, kind } => {
            if !registry.contains(kind) {
                return Err(EngineError::UnknownNodeKind { kind: kind.clone() });
            }
            if *block == 0 {
                return Ok(vec![StoreMutation::SetHeadKind { kind: kind.clone() }]);
            }
            let separator = separator_before(doc, *block)?;
            let range = separator..separator + 1;
            let key = SmolStr::new_static(BLOCK_KEY);
            if registry.is_fallback(kind) {
                Ok(vec![StoreMutation::Unmark { range, key }])
            } else {
                Ok(vec![StoreMutation::Mark {
                    range,
                    key,
                    value: MarkValue::Text(kind.clone()),
                }])
            }
        }
    }
}

/// Plan the anchor mark for a comment thread. Only the binder calls this.
pub fn plan_anchor(
    doc: &Document,
    range: Range<usize>,
    thread_id: &str,
) -> Result<Vec<StoreMutation>, EngineError> {
    check_range(&range, doc.len_chars())?;
    if !covers_text(doc, &range) {
        return Err(AnchorError::EmptyRange.into());
    }
    Ok(vec![StoreMutation::Mark {
        range,
        key: thread_key(thread_id),
        value: MarkValue::Bool(true),
    }])
}

/// Apply a plan as one commit. Returns the deltas it produced.
///
/// The whole plan is checked against the store before anything is written,
/// so a plan that does not fit leaves the store untouched.
pub fn apply_mutations(
    store: &mut SequenceStore,
    plan: &[StoreMutation],
) -> Result<Vec<SequenceDelta>, CrdtError> {
    if plan.is_empty() {
        return Ok(Vec::new());
    }
    check_plan(plan, store.len_chars())?;
    let ((), deltas) = store.transact(|txn| {
        for mutation in plan {
            match mutation {
                StoreMutation::Insert { at, text } => txn.insert(*at, text)?,
                StoreMutation::Delete { range } => txn.delete(range.start, range.len())?,
                StoreMutation::Mark { range, key, value } => txn.mark(range.clone(), key, value)?,
                StoreMutation::Unmark { range, key } => txn.unmark(range.clone(), key)?,
                StoreMutation::SetHeadKind { kind } => txn.set_head_kind(kind)?,
            }
        }
        Ok(())
    })?;
    Ok(deltas)
}

/// Walk the plan, tracking the length each mutation sees.
fn check_plan(plan: &[StoreMutation], mut len: usize) -> Result<(), CrdtError> {
    let out_of_bounds = |range: &Range<usize>, len| {
        range.start > range.end || range.end > len
    };
    for mutation in plan {
        match mutation {
            StoreMutation::Insert { at, text } => {
                if *at > len {
                    return Err(CrdtError::OutOfBounds { range: *at..*at, len });
                }
                len += text.chars().count();
            }
            StoreMutation::Delete { range } => {
                if out_of_bounds(range, len) {
                    return Err(CrdtError::OutOfBounds { range: range.clone(), len });
                }
                len -= range.len();
            }
            StoreMutation::Mark { range, .. } | StoreMutation::Unmark { range, .. } => {
                if out_of_bounds(range, len) {
                    return Err(CrdtError::OutOfBounds { range: range.clone(), len });
                }
            }
            StoreMutation::SetHeadKind { .. } => {}
        }
    }
    Ok(())
}

fn check_offset(offset: usize, len: usize) -> Result<(), EngineError> {
    if offset > len {
        return Err(EngineError::invalid_range(offset..offset, len));
    }
    Ok(())
}

fn check_range(range: &Range<usize>, len: usize) -> Result<(), EngineError> {
    if range.start > range.end || range.end > len {
        return Err(EngineError::invalid_range(range.clone(), len));
    }
    Ok(())
}

fn check_formatting_key(key: &SmolStr) -> Result<(), EngineError> {
    if MarkKey::classify(key).is_reserved() {
        return Err(EngineError::ReservedMark { key: key.clone() });
    }
    Ok(())
}

/// Offset of the separator that starts `block`.
fn separator_before(doc: &Document, block: usize) -> Result<usize, EngineError> {
    match doc.block_start(block) {
        Some(start) if block > 0 => Ok(start - 1),
        _ => Err(EngineError::invalid_range(block..block, doc.len_blocks())),
    }
}

#[cfg(test)]
mod tests {
    use marginalia_editor_core::{BOLD, ITALIC, Leaf, Marks, Node, NodeKind, PARAGRAPH};

    use super::*;

    struct Quote;

    impl NodeKind for Quote {
        fn tag(&self) -> &str {
            "quote"
        }

        fn split_kind(&self) -> Option<&str> {
            Some(PARAGRAPH)
        }
    }

    fn registry() -> NodeKindRegistry {
        let mut registry = NodeKindRegistry::default();
        registry.register(Quote);
        registry
    }

    #[test]
    fn test_reserved_keys_are_rejected() {
        let doc = Document::from_plain_text("hello");
        for key in ["thread:t1", BLOCK_KEY] {
            let edit = LocalEdit::set_mark(0..2, key, true);
            assert!(matches!(
                plan_local_edit(&doc, &registry(), &edit),
                Err(EngineError::ReservedMark { .. })
            ));
        }
    }

    #[test]
    fn test_out_of_bounds_is_rejected() {
        let doc = Document::from_plain_text("hello");
        let edit = LocalEdit::delete(3..9);
        assert!(matches!(
            plan_local_edit(&doc, &registry(), &edit),
            Err(EngineError::InvalidRange { len: 5, .. })
        ));
        let edit = LocalEdit::insert(6, "x");
        assert!(plan_local_edit(&doc, &registry(), &edit).is_err());
    }

    #[test]
    fn test_toggle_checks_whole_range() {
        let doc = Document::new(vec![Node::with_children(
            PARAGRAPH,
            vec![Leaf::new("ab", Marks::new().with(BOLD, true)), Leaf::plain("cd")],
        )]);

        let plan = plan_local_edit(&doc, &registry(), &LocalEdit::toggle_mark(0..2, BOLD)).unwrap();
        assert!(matches!(plan[0], StoreMutation::Unmark { .. }));

        let plan = plan_local_edit(&doc, &registry(), &LocalEdit::toggle_mark(0..4, BOLD)).unwrap();
        assert!(matches!(plan[0], StoreMutation::Mark { .. }));
    }

    #[test]
    fn test_insert_with_explicit_marks() {
        let doc = Document::from_plain_text("ab");
        let edit = LocalEdit::InsertText {
            at: 2,
            text: "c".into(),
            marks: Some(Marks::new().with(ITALIC, true)),
            affinity: Default::default(),
        };
        let plan = plan_local_edit(&doc, &registry(), &edit).unwrap();

        assert_eq!(
            plan.first(),
            Some(&StoreMutation::Insert {
                at: 2,
                text: "c".into()
            })
        );
        assert!(plan.contains(&StoreMutation::Unmark {
            range: 2..3,
            key: BOLD.into()
        }));
        assert!(!plan.contains(&StoreMutation::Unmark {
            range: 2..3,
            key: ITALIC.into()
        }));
        assert_eq!(
            plan.last(),
            Some(&StoreMutation::Mark {
                range: 2..3,
                key: ITALIC.into(),
                value: MarkValue::Bool(true)
            })
        );
    }

    #[test]
    fn test_split_uses_handler_kind() {
        let doc = Document::new(vec![Node::with_children("quote", vec![Leaf::plain("abc")])]);
        let plan = plan_local_edit(&doc, &registry(), &LocalEdit::SplitNode { at: 1 }).unwrap();
        // Quote splits into a paragraph, which is the fallback: no block mark.
        assert_eq!(
            plan,
            vec![StoreMutation::Insert {
                at: 1,
                text: "\n".into()
            }]
        );
    }

    #[test]
    fn test_merge_and_set_kind_target_separator() {
        let doc = Document::from_plain_text("ab\ncd");
        let plan = plan_local_edit(&doc, &registry(), &LocalEdit::MergeNodes { block: 1 }).unwrap();
        assert_eq!(plan, vec![StoreMutation::Delete { range: 2..3 }]);

        assert!(plan_local_edit(&doc, &registry(), &LocalEdit::MergeNodes { block: 0 }).is_err());
        assert!(plan_local_edit(&doc, &registry(), &LocalEdit::MergeNodes { block: 2 }).is_err());

        let edit = LocalEdit::SetNodeKind {
            block: 1,
            kind: "quote".into(),
        };
        let plan = plan_local_edit(&doc, &registry(), &edit).unwrap();
        assert_eq!(
            plan,
            vec![StoreMutation::Mark {
                range: 2..3,
                key: BLOCK_KEY.into(),
                value: MarkValue::from("quote")
            }]
        );

        let edit = LocalEdit::SetNodeKind {
            block: 0,
            kind: "heading".into(),
        };
        assert!(matches!(
            plan_local_edit(&doc, &registry(), &edit),
            Err(EngineError::UnknownNodeKind { .. })
        ));
    }

    #[test]
    fn test_empty_edits_are_noops() {
        let doc = Document::from_plain_text("ab");
        assert!(plan_local_edit(&doc, &registry(), &LocalEdit::insert(1, "")).unwrap().is_empty());
        assert!(plan_local_edit(&doc, &registry(), &LocalEdit::delete(1..1)).unwrap().is_empty());
        assert!(
            plan_local_edit(&doc, &registry(), &LocalEdit::set_mark(1..1, BOLD, true))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_anchor_needs_inline_text() {
        let doc = Document::new(vec![Node::paragraph("ab"), Node::paragraph("cd")]);
        assert!(matches!(
            plan_anchor(&doc, 2..3, "th_1"),
            Err(EngineError::Anchor(AnchorError::EmptyRange))
        ));
        assert_eq!(
            plan_anchor(&doc, 1..4, "th_1").unwrap(),
            vec![StoreMutation::Mark {
                range: 1..4,
                key: thread_key("th_1"),
                value: MarkValue::Bool(true),
            }]
        );
    }

    #[test]
    fn test_plan_that_does_not_fit_writes_nothing() {
        let mut store = SequenceStore::new(&crate::config::EngineConfig::default()).unwrap();
        store.insert(0, "abc").unwrap();
        let version = store.version();

        let plan = vec![
            StoreMutation::Insert {
                at: 0,
                text: "xy".into(),
            },
            StoreMutation::Delete { range: 4..9 },
        ];
        assert!(matches!(
            apply_mutations(&mut store, &plan),
            Err(CrdtError::OutOfBounds { len: 5, .. })
        ));
        assert_eq!(store.to_string(), "abc");
        assert_eq!(store.version(), version);

        // Offsets later in the plan see the length earlier mutations left.
        let plan = vec![
            StoreMutation::Insert {
                at: 3,
                text: "de".into(),
            },
            StoreMutation::Delete { range: 4..5 },
        ];
        apply_mutations(&mut store, &plan).unwrap();
        assert_eq!(store.to_string(), "abcd");
    }
}
