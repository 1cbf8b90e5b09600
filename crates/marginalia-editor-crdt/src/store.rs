//! Loro-backed replicated sequence store.
//!
//! The document lives in one `LoroText`. Blocks are separated by `'\n'`; the
//! separator's reserved `block` mark holds the kind of the block after it,
//! and the kind of the first block lives in the `blocks` map under `head`.
//!
//! Loro reports every commit and import through a root subscription. The
//! callback converts the diff into a `SequenceDelta` and hands it over an
//! unbounded channel; the store drains the channel right after the commit
//! or import returns and runs its observers, in registration order, on the
//! caller's thread.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use loro::event::Diff;
use loro::{
    ContainerTrait, ExpandType, ExportMode, LoroDoc, LoroMap, LoroText, LoroValue, StyleConfig,
    StyleConfigMap, Subscription, TextDelta, UndoManager, ValueOrContainer, VersionVector,
};
use marginalia_editor_core::{
    DeltaOp, EXPANDING_MARKS, MarkPatch, MarkValue, Marks, SequenceDelta,
};
use smol_str::SmolStr;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::error::{CrdtError, MalformedDelta};

const BLOCKS_MAP: &str = "blocks";
const HEAD_KEY: &str = "head";

/// Where an applied change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// Handle returned by [`SequenceStore::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Box<dyn FnMut(&SequenceDelta, Origin)>;

#[derive(Debug, Default)]
struct RawChange {
    delta: SequenceDelta,
    head_changed: bool,
}

/// The replicated rich-text sequence.
pub struct SequenceStore {
    doc: LoroDoc,
    text: LoroText,
    blocks: LoroMap,
    undo: UndoManager,
    changes: mpsc::UnboundedReceiver<RawChange>,
    _subscription: Subscription,
    observers: Vec<(ObserverId, Observer)>,
    next_observer: u64,
}

impl SequenceStore {
    /// Create an empty store.
    pub fn new(config: &EngineConfig) -> Result<Self, CrdtError> {
        let doc = LoroDoc::new();
        if let Some(peer_id) = config.peer_id {
            doc.set_peer_id(peer_id)?;
        }

        let mut styles = StyleConfigMap::new();
        for key in EXPANDING_MARKS {
            styles.insert(
                key.into(),
                StyleConfig {
                    expand: ExpandType::After,
                },
            );
        }
        doc.config_text_style(styles);
        // Thread anchors and block kinds never grow into adjacent typing.
        doc.config_default_text_style(Some(StyleConfig {
            expand: ExpandType::None,
        }));

        let text = doc.get_text(config.text_container.as_str());
        let blocks = doc.get_map(BLOCKS_MAP);

        let (tx, changes) = mpsc::unbounded_channel();
        let text_id = text.id();
        let blocks_id = blocks.id();
        let subscription = doc.subscribe_root(Arc::new(move |event| {
            let mut change = RawChange::default();
            for container in event.events.iter() {
                if *container.target == text_id {
                    if let Diff::Text(ops) = &container.diff {
                        change.delta = delta_from_loro(ops);
                    }
                } else if *container.target == blocks_id {
                    change.head_changed = true;
                }
            }
            if tx.send(change).is_err() {
                tracing::trace!("store dropped before change was drained");
            }
        }));

        let mut undo = UndoManager::new(&doc);
        undo.set_merge_interval(0);

        Ok(Self {
            doc,
            text,
            blocks,
            undo,
            changes,
            _subscription: subscription,
            observers: Vec::new(),
            next_observer: 0,
        })
    }

    /// Create a store from an encoded state (`encodeState` output).
    pub fn from_snapshot(config: &EngineConfig, snapshot: &[u8]) -> Result<Self, CrdtError> {
        let mut store = Self::new(config)?;
        store.import(snapshot)?;
        Ok(store)
    }

    /// Get the underlying Loro document.
    pub fn doc(&self) -> &LoroDoc {
        &self.doc
    }

    pub fn len_chars(&self) -> usize {
        self.text.len_unicode()
    }

    pub fn slice(&self, range: Range<usize>) -> Option<String> {
        if range.start > range.end || range.end > self.len_chars() {
            return None;
        }
        self.text.slice(range.start, range.end).ok()
    }

    /// The full attributed content as (text, marks) runs, separators included.
    pub fn rich_runs(&self) -> Vec<(String, Marks)> {
        self.text
            .to_delta()
            .into_iter()
            .filter_map(|op| match op {
                TextDelta::Insert { insert, attributes } => Some((
                    insert,
                    attributes
                        .as_ref()
                        .map(|attrs| marks_from_loro(attrs))
                        .unwrap_or_default(),
                )),
                _ => None,
            })
            .collect()
    }

    /// Kind tag of the first block, if one was ever set.
    pub fn head_kind(&self) -> Option<SmolStr> {
        match self.blocks.get(HEAD_KEY) {
            Some(ValueOrContainer::Value(LoroValue::String(kind))) => Some(SmolStr::new(&*kind)),
            _ => None,
        }
    }

    /// Get current version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Export full snapshot.
    pub fn export_snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| CrdtError::Export(e.to_string()))
    }

    /// Export updates since given version. `None` when there is nothing new.
    pub fn export_updates_since(
        &self,
        version: &VersionVector,
    ) -> Result<Option<Vec<u8>>, CrdtError> {
        if *version == self.doc.oplog_vv() {
            return Ok(None);
        }

        let updates = self
            .doc
            .export(ExportMode::Updates {
                from: Cow::Owned(version.clone()),
            })
            .map_err(|e| CrdtError::Export(e.to_string()))?;

        if updates.is_empty() {
            return Ok(None);
        }
        Ok(Some(updates))
    }

    /// Import a remote update or snapshot.
    ///
    /// Returns the deltas it produced. A payload that cannot be decoded is
    /// rejected without touching the store. A payload whose dependencies are
    /// missing is kept pending by loro; if nothing else in it could be applied
    /// this is reported as `MalformedDelta::MissingDependencies`.
    pub fn import(&mut self, bytes: &[u8]) -> Result<Vec<SequenceDelta>, CrdtError> {
        let status = self.doc.import(bytes).map_err(|e| {
            tracing::warn!(error = %e, len = bytes.len(), "dropping undecodable update");
            MalformedDelta::Undecodable {
                reason: e.to_string(),
            }
        })?;
        let deltas = self.drain(Origin::Remote);

        if status.pending.is_some() {
            tracing::warn!(
                applied = deltas.len(),
                "update is waiting for missing dependencies"
            );
            if deltas.is_empty() {
                return Err(MalformedDelta::MissingDependencies.into());
            }
        }
        Ok(deltas)
    }

    /// Merge an encoded state into this store (`applyEncodedState`).
    pub fn apply_encoded_state(&mut self, snapshot: &[u8]) -> Result<Vec<SequenceDelta>, CrdtError> {
        self.import(snapshot)
    }

    /// Run several mutations as one commit.
    ///
    /// Observers see a single delta for the whole transaction. Loro cannot
    /// roll back, so writes made before `f` fails are still committed;
    /// callers validate first (see `translator::apply_mutations`).
    pub fn transact<R>(
        &mut self,
        f: impl FnOnce(&StoreTxn<'_>) -> Result<R, CrdtError>,
    ) -> Result<(R, Vec<SequenceDelta>), CrdtError> {
        let txn = StoreTxn {
            text: &self.text,
            blocks: &self.blocks,
        };
        let result = f(&txn);
        if let Err(e) = &result {
            tracing::warn!(error = %e, "transaction failed midway, committing partial writes");
        }
        self.doc.commit();
        let deltas = self.drain(Origin::Local);
        result.map(|value| (value, deltas))
    }

    pub fn insert(&mut self, at: usize, text: &str) -> Result<Vec<SequenceDelta>, CrdtError> {
        self.transact(|txn| txn.insert(at, text)).map(|(_, deltas)| deltas)
    }

    pub fn delete(&mut self, range: Range<usize>) -> Result<Vec<SequenceDelta>, CrdtError> {
        self.transact(|txn| txn.delete(range.start, range.len()))
            .map(|(_, deltas)| deltas)
    }

    pub fn mark(
        &mut self,
        range: Range<usize>,
        key: &str,
        value: &MarkValue,
    ) -> Result<Vec<SequenceDelta>, CrdtError> {
        self.transact(|txn| txn.mark(range, key, value))
            .map(|(_, deltas)| deltas)
    }

    pub fn unmark(&mut self, range: Range<usize>, key: &str) -> Result<Vec<SequenceDelta>, CrdtError> {
        self.transact(|txn| txn.unmark(range, key))
            .map(|(_, deltas)| deltas)
    }

    pub fn set_head_kind(&mut self, kind: &str) -> Result<Vec<SequenceDelta>, CrdtError> {
        self.transact(|txn| txn.set_head_kind(kind))
            .map(|(_, deltas)| deltas)
    }

    /// Register an observer, called after every applied mutation.
    pub fn observe(&mut self, observer: impl FnMut(&SequenceDelta, Origin) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(observer)));
        id
    }

    /// Remove an observer. Returns false if it was not registered.
    pub fn unobserve(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer, _)| *observer != id);
        self.observers.len() != before
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    /// Undo this replica's last local change. `None` if there was nothing to undo.
    pub fn undo(&mut self) -> Result<Option<Vec<SequenceDelta>>, CrdtError> {
        if !self.undo.undo()? {
            return Ok(None);
        }
        self.doc.commit();
        Ok(Some(self.drain(Origin::Local)))
    }

    /// Redo the last undone change. `None` if there was nothing to redo.
    pub fn redo(&mut self) -> Result<Option<Vec<SequenceDelta>>, CrdtError> {
        if !self.undo.redo()? {
            return Ok(None);
        }
        self.doc.commit();
        Ok(Some(self.drain(Origin::Local)))
    }

    fn drain(&mut self, origin: Origin) -> Vec<SequenceDelta> {
        let mut deltas = Vec::new();
        while let Ok(change) = self.changes.try_recv() {
            let mut delta = change.delta;
            if change.head_changed {
                delta.head_kind = Some(self.head_kind().unwrap_or_default());
            }
            if !delta.is_empty() {
                deltas.push(delta);
            }
        }

        // Insert attributes are only trustworthy against the current content
        // when a single change was produced.
        if let [only] = deltas.as_mut_slice() {
            *only = self.settle_inserts(std::mem::take(only));
        }

        for delta in &deltas {
            tracing::debug!(?origin, ops = delta.ops.len(), head_kind = ?delta.head_kind, "applied change");
            for (_, observer) in self.observers.iter_mut() {
                observer(delta, origin);
            }
        }
        deltas
    }

    /// Replace the attributes of inserted text with the marks it actually
    /// carries in the store, splitting inserts where the marks change.
    fn settle_inserts(&self, delta: SequenceDelta) -> SequenceDelta {
        if !delta
            .ops
            .iter()
            .any(|op| matches!(op, DeltaOp::Insert { .. }))
        {
            return delta;
        }

        let runs = self.rich_runs();
        let mut settled = SequenceDelta {
            ops: Vec::with_capacity(delta.ops.len()),
            head_kind: delta.head_kind.clone(),
        };
        let mut new = 0;
        for op in &delta.ops {
            let len = op.new_len();
            match op {
                DeltaOp::Insert { .. } => {
                    let pieces = slice_runs(&runs, new..new + len);
                    let covered: usize = pieces.iter().map(|(text, _)| text.chars().count()).sum();
                    if covered != len {
                        return delta;
                    }
                    for (text, attrs) in pieces {
                        settled.push(DeltaOp::Insert { text, attrs });
                    }
                }
                other => settled.push(other.clone()),
            }
            new += len;
        }
        settled
    }
}

impl fmt::Display for SequenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text.to_string())
    }
}

impl fmt::Debug for SequenceStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceStore")
            .field("peer_id", &self.doc.peer_id())
            .field("len_chars", &self.len_chars())
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Mutation handle passed to [`SequenceStore::transact`].
pub struct StoreTxn<'a> {
    text: &'a LoroText,
    blocks: &'a LoroMap,
}

impl StoreTxn<'_> {
    pub fn len_chars(&self) -> usize {
        self.text.len_unicode()
    }

    pub fn insert(&self, at: usize, text: &str) -> Result<(), CrdtError> {
        self.text.insert(at, text)?;
        Ok(())
    }

    pub fn delete(&self, at: usize, len: usize) -> Result<(), CrdtError> {
        self.text.delete(at, len)?;
        Ok(())
    }

    pub fn mark(&self, range: Range<usize>, key: &str, value: &MarkValue) -> Result<(), CrdtError> {
        self.text.mark(range, key, to_loro_value(value))?;
        Ok(())
    }

    pub fn unmark(&self, range: Range<usize>, key: &str) -> Result<(), CrdtError> {
        self.text.unmark(range, key)?;
        Ok(())
    }

    pub fn set_head_kind(&self, kind: &str) -> Result<(), CrdtError> {
        self.blocks.insert(HEAD_KEY, kind)?;
        Ok(())
    }
}

fn to_loro_value(value: &MarkValue) -> LoroValue {
    match value {
        MarkValue::Bool(b) => LoroValue::Bool(*b),
        MarkValue::Text(s) => LoroValue::from(s.as_str()),
    }
}

fn mark_value(value: &LoroValue) -> Option<MarkValue> {
    match value {
        LoroValue::Bool(b) => Some(MarkValue::Bool(*b)),
        LoroValue::String(s) => Some(MarkValue::Text(SmolStr::new(&**s))),
        LoroValue::Null => None,
        other => {
            tracing::trace!(?other, "ignoring non-scalar mark value");
            None
        }
    }
}

fn marks_from_loro<'a, K>(attrs: impl IntoIterator<Item = (&'a K, &'a LoroValue)>) -> Marks
where
    K: AsRef<str> + 'a,
{
    attrs
        .into_iter()
        .filter_map(|(key, value)| Some((SmolStr::new(key.as_ref()), mark_value(value)?)))
        .collect()
}

fn patch_from_loro<'a, K>(attrs: impl IntoIterator<Item = (&'a K, &'a LoroValue)>) -> MarkPatch
where
    K: AsRef<str> + 'a,
{
    attrs
        .into_iter()
        .map(|(key, value)| (SmolStr::new(key.as_ref()), mark_value(value)))
        .collect()
}

fn delta_from_loro(ops: &[TextDelta]) -> SequenceDelta {
    let mut delta = SequenceDelta::new();
    for op in ops {
        match op {
            TextDelta::Retain { retain, attributes } => delta.push(DeltaOp::Retain {
                len: *retain,
                attrs: attributes
                    .as_ref()
                    .map(|attrs| patch_from_loro(attrs))
                    .unwrap_or_default(),
            }),
            TextDelta::Insert { insert, attributes } => delta.push(DeltaOp::Insert {
                text: insert.clone(),
                attrs: attributes
                    .as_ref()
                    .map(|attrs| marks_from_loro(attrs))
                    .unwrap_or_default(),
            }),
            TextDelta::Delete { delete } => delta.push(DeltaOp::Delete { len: *delete }),
        }
    }
    delta.chop()
}

/// The (text, marks) pieces covering `range` of a run list.
fn slice_runs(runs: &[(String, Marks)], range: Range<usize>) -> Vec<(String, Marks)> {
    let mut out = Vec::new();
    let mut start = 0;
    for (text, marks) in runs {
        if start >= range.end {
            break;
        }
        let len = text.chars().count();
        let end = start + len;
        let lo = range.start.max(start);
        let hi = range.end.min(end);
        if lo < hi {
            let piece: String = text.chars().skip(lo - start).take(hi - lo).collect();
            out.push((piece, marks.clone()));
        }
        start = end;
    }
    out
}
