//! The embedding surface.
//!
//! `Engine` is the single mutable owner of a replica: the store, the current
//! projection, the local selection, the comment binder and the anchor ledger.
//! Every mutation entry point (local edit, undo/redo, queued remote update,
//! encoded state) funnels through `after_change`, which re-projects once,
//! remaps positions and notifies subscribers.

use std::future::Future;
use std::ops::Range;

use smol_str::SmolStr;
use tokio::sync::{mpsc, watch};

use marginalia_editor_core::{
    Affinity, Document, DocumentEdit, LocalEdit, NodeKind, NodeKindRegistry, SequenceDelta,
    Selection, remap_selection, translate_delta,
};

use crate::anchor::{self, AnchorChange, AnchorLedger, BinderState, CommentBinder, OrphanedAnchorWarning};
use crate::comments::{CommentThread, ThreadOverview};
use crate::config::EngineConfig;
use crate::error::{AnchorError, EngineError, TransportError};
use crate::projector::project;
use crate::session::{
    SessionState, SyncSession, SyncTransport, TransportEvent, TransportSender, transport_channel,
};
use crate::store::{Origin, SequenceStore};
use crate::translator::{apply_mutations, plan_anchor, plan_local_edit};

/// What subscribers are told after each applied change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The document changed. `edits` replay the change on the previous
    /// projection; when they could not be derived the list is empty and the
    /// new projection should be read whole.
    Changed {
        origin: Origin,
        edits: Vec<DocumentEdit>,
    },
    Orphaned(OrphanedAnchorWarning),
    Reanchored {
        thread_id: SmolStr,
        ranges: Vec<Range<usize>>,
    },
    SyncChanged {
        state: SessionState,
        synced: bool,
    },
}

impl From<AnchorChange> for EngineEvent {
    fn from(change: AnchorChange) -> Self {
        match change {
            AnchorChange::Orphaned(warning) => EngineEvent::Orphaned(warning),
            AnchorChange::Reanchored { thread_id, ranges } => {
                EngineEvent::Reanchored { thread_id, ranges }
            }
        }
    }
}

/// A collaborative rich-text replica.
pub struct Engine {
    config: EngineConfig,
    registry: NodeKindRegistry,
    store: SequenceStore,
    document: Document,
    selection: Option<Selection>,
    binder: CommentBinder,
    ledger: AnchorLedger,
    session: Option<SyncSession>,
    queue_tx: TransportSender,
    queue: mpsc::UnboundedReceiver<TransportEvent>,
    listeners: Vec<mpsc::UnboundedSender<EngineEvent>>,
}

impl Engine {
    /// Create a replica, optionally bootstrapped from an encoded snapshot.
    pub fn new(config: EngineConfig, initial_snapshot: Option<&[u8]>) -> Result<Self, EngineError> {
        Self::with_registry(config, NodeKindRegistry::default(), initial_snapshot)
    }

    /// Like [`Engine::new`] with a prepared set of node kinds.
    pub fn with_registry(
        config: EngineConfig,
        registry: NodeKindRegistry,
        initial_snapshot: Option<&[u8]>,
    ) -> Result<Self, EngineError> {
        let store = match initial_snapshot {
            Some(snapshot) => SequenceStore::from_snapshot(&config, snapshot)?,
            None => SequenceStore::new(&config)?,
        };
        let document = project(&store, &registry);
        let ledger = AnchorLedger::seed(&document);
        let (queue_tx, queue) = transport_channel();
        tracing::debug!(
            len = document.len_chars(),
            blocks = document.len_blocks(),
            "engine created"
        );

        Ok(Self {
            config,
            registry,
            store,
            document,
            selection: None,
            binder: CommentBinder::new(),
            ledger,
            session: None,
            queue_tx,
            queue,
            listeners: Vec::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &SequenceStore {
        &self.store
    }

    /// The current projection.
    pub fn project(&self) -> &Document {
        &self.document
    }

    /// Register a node kind and re-project, since stored kinds that fell back
    /// to the default may now resolve.
    pub fn register_kind(&mut self, kind: impl NodeKind + 'static) {
        self.registry.register(kind);
        self.document = project(&self.store, &self.registry);
    }

    /// Receive every [`EngineEvent`] from now on. Dropping the receiver
    /// unsubscribes.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    fn emit(&mut self, event: EngineEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Whether local edits are currently accepted.
    pub fn is_editable(&self) -> bool {
        !self.config.gate_until_synced
            || self.session.as_ref().is_none_or(SyncSession::has_synced)
    }

    fn check_editable(&self) -> Result<(), EngineError> {
        if self.is_editable() {
            Ok(())
        } else {
            Err(EngineError::NotSynced)
        }
    }

    /// Apply a local edit synchronously.
    ///
    /// Either the whole edit lands in one store commit or nothing changes.
    /// Returns the document edits it produced.
    pub fn apply_local_edit(&mut self, edit: LocalEdit) -> Result<Vec<DocumentEdit>, EngineError> {
        self.check_editable()?;
        let plan = plan_local_edit(&self.document, &self.registry, &edit)?;
        if plan.is_empty() {
            return Ok(Vec::new());
        }
        let deltas = apply_mutations(&mut self.store, &plan)?;
        tracing::debug!(?edit, mutations = plan.len(), "applied local edit");

        let affinity = edit.affinity().unwrap_or(self.config.local_affinity);
        let edits = self.after_change(Origin::Local, &deltas, affinity);
        self.flush_outbox();
        Ok(edits)
    }

    /// Queue a remote update. Nothing is applied until [`Engine::pump`].
    pub fn on_remote_delta(&self, update: Vec<u8>) {
        if self.queue_tx.send(TransportEvent::Update(update)).is_err() {
            tracing::warn!("engine queue closed, remote update lost");
        }
    }

    /// A sender transports use to deliver events into the engine's queue.
    pub fn transport_sender(&self) -> TransportSender {
        self.queue_tx.clone()
    }

    /// Drain the queue.
    ///
    /// Each update is imported atomically; one that fails is logged and
    /// dropped without affecting the rest. The projection, the selection and
    /// the anchors are updated once for the whole batch. Returns the number
    /// of queued events handled.
    pub fn pump(&mut self) -> usize {
        let mut handled = 0;
        let mut deltas = Vec::new();

        while let Ok(event) = self.queue.try_recv() {
            handled += 1;
            match event {
                TransportEvent::Update(update) => {
                    let before = self.store.version();
                    match self.store.import(&update) {
                        Ok(applied) => {
                            if let Some(session) = &mut self.session {
                                session.note_remote_import(&before, self.store.version());
                            }
                            deltas.extend(applied);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, bytes = update.len(), "dropped remote update");
                        }
                    }
                }
                lifecycle => self.handle_lifecycle(&lifecycle),
            }
        }

        if !deltas.is_empty() {
            tracing::debug!(deltas = deltas.len(), "applying remote batch");
            let affinity = self.config.remote_affinity;
            self.after_change(Origin::Remote, &deltas, affinity);
        }
        self.flush_outbox();
        handled
    }

    fn handle_lifecycle(&mut self, event: &TransportEvent) {
        let Some(session) = &mut self.session else {
            tracing::trace!(?event, "no session attached, ignoring");
            return;
        };
        if session.handle(event) {
            let state = session.state();
            let synced = session.is_synced();
            self.emit(EngineEvent::SyncChanged { state, synced });
        }
    }

    /// Re-project after the store changed and bring everything derived from
    /// the old projection up to date.
    fn after_change(
        &mut self,
        origin: Origin,
        deltas: &[SequenceDelta],
        affinity: Affinity,
    ) -> Vec<DocumentEdit> {
        let mut working = Some(self.document.clone());
        let mut edits = Vec::new();

        for delta in deltas {
            if let Some(doc) = working.take() {
                match translate_delta(&doc, delta, &self.registry) {
                    Ok(translation) => {
                        edits.extend(translation.edits);
                        working = Some(translation.document);
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "delta does not fit projection, re-projecting");
                        edits.clear();
                    }
                }
            }
            if let Some(selection) = self.selection {
                self.selection = Some(remap_selection(selection, delta, affinity));
            }
            self.binder.remap(delta);
        }

        let projected = project(&self.store, &self.registry);
        match working {
            Some(doc) if doc != projected => {
                tracing::warn!(
                    replayed = %doc.text(),
                    projected = %projected.text(),
                    "replayed edits diverged from projection"
                );
                edits.clear();
            }
            _ => {}
        }
        self.document = projected;

        if let Some(selection) = self.selection {
            let len = self.document.len_chars();
            self.selection = Some(Selection::new(selection.anchor.min(len), selection.focus.min(len)));
        }

        let changes = self.ledger.update(&self.document);
        self.emit(EngineEvent::Changed {
            origin,
            edits: edits.clone(),
        });
        for change in changes {
            self.emit(change.into());
        }
        edits
    }

    fn flush_outbox(&mut self) {
        if let Some(session) = &mut self.session {
            if let Err(e) = session.flush(&self.store) {
                tracing::warn!(error = %e, "broadcast failed, changes stay queued");
            }
        }
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    /// Set the local selection. It then follows every applied change.
    pub fn set_selection(&mut self, selection: Option<Selection>) -> Result<(), EngineError> {
        if let Some(selection) = selection {
            let len = self.document.len_chars();
            if selection.end() > len {
                return Err(EngineError::invalid_range(selection.to_range(), len));
            }
        }
        self.selection = selection;
        Ok(())
    }

    /// Map a selection through a delta with the affinity configured for
    /// changes of `origin`.
    pub fn remap_selection(
        &self,
        selection: Selection,
        delta: &SequenceDelta,
        origin: Origin,
    ) -> Selection {
        let affinity = match origin {
            Origin::Local => self.config.local_affinity,
            Origin::Remote => self.config.remote_affinity,
        };
        remap_selection(selection, delta, affinity)
    }

    pub fn binder_state(&self) -> &BinderState {
        self.binder.state()
    }

    /// The range of the comment being written, for highlighting.
    pub fn pending_comment_range(&self) -> Option<Range<usize>> {
        self.binder.pending_range()
    }

    /// Capture `range` for a new comment.
    pub fn begin_comment(&mut self, range: Range<usize>) -> Result<(), EngineError> {
        let len = self.document.len_chars();
        if range.start > range.end || range.end > len {
            return Err(EngineError::invalid_range(range, len));
        }
        if !anchor::covers_text(&self.document, &range) {
            return Err(AnchorError::EmptyRange.into());
        }
        self.binder.select(range)?;
        Ok(())
    }

    pub fn start_composing(&mut self) -> Result<(), EngineError> {
        self.binder.start_composing()?;
        Ok(())
    }

    pub fn cancel_comment(&mut self) -> Result<(), EngineError> {
        self.binder.cancel()?;
        Ok(())
    }

    /// Anchor the comment being composed to the thread the comment service
    /// minted. Returns the range the anchor covers.
    ///
    /// On failure the binder is back in `Idle` and nothing was written.
    pub fn bind_comment_anchor(&mut self, thread_id: &str) -> Result<Range<usize>, EngineError> {
        self.check_editable()?;
        let range = self.binder.bind(thread_id)?;

        let deltas = match self.write_anchor(range.clone(), thread_id) {
            Ok(deltas) => deltas,
            Err(e) => {
                self.binder.reset();
                return Err(e);
            }
        };
        tracing::debug!(%thread_id, ?range, "bound comment anchor");

        let affinity = self.config.local_affinity;
        self.after_change(Origin::Local, &deltas, affinity);
        self.flush_outbox();
        Ok(range)
    }

    fn write_anchor(
        &mut self,
        range: Range<usize>,
        thread_id: &str,
    ) -> Result<Vec<SequenceDelta>, EngineError> {
        let plan = plan_anchor(&self.document, range, thread_id)?;
        Ok(apply_mutations(&mut self.store, &plan)?)
    }

    /// The thread activated by clicking at `offset`.
    pub fn activate_at(&self, offset: usize) -> Option<SmolStr> {
        anchor::activate_at(&self.document, offset)
    }

    pub fn anchors(&self) -> &AnchorLedger {
        &self.ledger
    }

    /// Split a thread list into anchored and unanchored threads.
    pub fn thread_overview(&self, threads: impl IntoIterator<Item = CommentThread>) -> ThreadOverview {
        ThreadOverview::new(threads, &self.document)
    }

    pub fn encode_state(&self) -> Result<Vec<u8>, EngineError> {
        Ok(self.store.export_snapshot()?)
    }

    /// Merge an encoded state into this replica, applied at once rather than
    /// through the queue.
    pub fn apply_encoded_state(&mut self, snapshot: &[u8]) -> Result<(), EngineError> {
        let deltas = self.store.apply_encoded_state(snapshot)?;
        let affinity = self.config.remote_affinity;
        self.after_change(Origin::Remote, &deltas, affinity);
        Ok(())
    }

    pub fn can_undo(&self) -> bool {
        self.store.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.store.can_redo()
    }

    /// Revert this replica's latest edit. Returns false if there was none.
    pub fn undo(&mut self) -> Result<bool, EngineError> {
        self.check_editable()?;
        match self.store.undo()? {
            Some(deltas) => {
                let affinity = self.config.local_affinity;
                self.after_change(Origin::Local, &deltas, affinity);
                self.flush_outbox();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn redo(&mut self) -> Result<bool, EngineError> {
        self.check_editable()?;
        match self.store.redo()? {
            Some(deltas) => {
                let affinity = self.config.local_affinity;
                self.after_change(Origin::Local, &deltas, affinity);
                self.flush_outbox();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Attach a transport, replacing any previous session. Events it sends
    /// through [`Engine::transport_sender`] are handled by [`Engine::pump`].
    pub fn attach_session(&mut self, transport: impl SyncTransport + 'static) {
        if let Some(mut previous) = self.session.take() {
            previous.disconnect();
        }
        self.session = Some(SyncSession::new(transport));
    }

    pub fn session(&self) -> Option<&SyncSession> {
        self.session.as_ref()
    }

    pub fn connect(&mut self) -> Result<(), EngineError> {
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;
        session.connect()?;
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(session) = &mut self.session {
            session.disconnect();
            let state = session.state();
            self.emit(EngineEvent::SyncChanged {
                state,
                synced: false,
            });
        }
    }

    /// The session's synced signal, if a session is attached.
    pub fn subscribe_synced(&self) -> Option<watch::Receiver<bool>> {
        self.session.as_ref().map(SyncSession::subscribe_synced)
    }

    /// Resolves once the attached session is synced.
    pub fn wait_synced(&self) -> impl Future<Output = Result<(), TransportError>> + 'static {
        let wait = self.session.as_ref().map(SyncSession::wait_synced);
        async move {
            match wait {
                Some(wait) => wait.await,
                None => Err(TransportError::Closed),
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("selection", &self.selection)
            .field("binder", &self.binder)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
