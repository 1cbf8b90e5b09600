//! Sync session management.
//!
//! The session owns the connection lifecycle of an external transport, the
//! level-triggered `synced` signal and the outbox of local changes that have
//! not been broadcast yet. Transport events arrive on the engine's queue
//! (see [`transport_channel`]) and are fed to [`SyncSession::handle`] by the
//! engine's pump.

use std::future::Future;

use loro::VersionVector;
use tokio::sync::{mpsc, watch};

use crate::error::{EngineError, TransportError};
use crate::store::SequenceStore;

/// Events a transport reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// The transport's view of whether the initial state has been exchanged.
    Synced(bool),
    /// An opaque CRDT update from a peer.
    Update(Vec<u8>),
}

/// Sending half used by transports to deliver events.
pub type TransportSender = mpsc::UnboundedSender<TransportEvent>;

/// Create the queue transports push into and the engine drains.
pub fn transport_channel() -> (TransportSender, mpsc::UnboundedReceiver<TransportEvent>) {
    mpsc::unbounded_channel()
}

/// An external real-time sync transport.
///
/// Implementations deliver incoming events through a [`TransportSender`]
/// handed to them at construction.
pub trait SyncTransport {
    fn connect(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    /// Send an update to every peer.
    fn broadcast(&mut self, update: Vec<u8>) -> Result<(), TransportError>;
}

/// Session lifecycle states.
///
/// UI can use this to show appropriate status indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Attached but never connected.
    #[default]
    Idle,
    Connecting,
    /// Connected, initial state exchange in progress.
    Syncing,
    Synced,
    /// Disconnected. Local edits keep applying and wait in the outbox.
    Offline,
}

impl SessionState {
    pub fn is_synced(&self) -> bool {
        matches!(self, Self::Synced)
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Syncing | Self::Synced)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline)
    }
}

/// Broadcast bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct SyncState {
    /// Store version at the last successful broadcast. `None` until the first
    /// one, in which case everything is sent.
    pub last_broadcast_version: Option<VersionVector>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the store has changes that were never broadcast.
    pub fn has_unsent_changes(&self, store: &SequenceStore) -> bool {
        match &self.last_broadcast_version {
            None => true,
            Some(last) => store.version() != *last,
        }
    }

    pub fn mark_broadcast(&mut self, version: VersionVector) {
        self.last_broadcast_version = Some(version);
    }
}

/// A transport plus its lifecycle and outbox.
pub struct SyncSession {
    transport: Box<dyn SyncTransport>,
    state: SessionState,
    synced: watch::Sender<bool>,
    sync_state: SyncState,
    has_synced: bool,
}

impl SyncSession {
    pub fn new(transport: impl SyncTransport + 'static) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            transport: Box::new(transport),
            state: SessionState::Idle,
            synced,
            sync_state: SyncState::new(),
            has_synced: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Whether the session reported synced at least once.
    pub fn has_synced(&self) -> bool {
        self.has_synced
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.sync_state
    }

    /// The synced signal. A new receiver sees the current value immediately.
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Resolves once the session is synced (immediately if it already is).
    pub fn wait_synced(&self) -> impl Future<Output = Result<(), TransportError>> + 'static {
        let mut rx = self.synced.subscribe();
        async move {
            rx.wait_for(|synced| *synced)
                .await
                .map(|_| ())
                .map_err(|_| TransportError::Closed)
        }
    }

    pub fn connect(&mut self) -> Result<(), TransportError> {
        self.state = SessionState::Connecting;
        if let Err(e) = self.transport.connect() {
            tracing::warn!(?e, "transport connect failed");
            self.state = SessionState::Offline;
            return Err(e);
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.set_state(SessionState::Offline);
    }

    /// Apply a lifecycle event. Returns true if the state changed.
    ///
    /// `Update` payloads are not lifecycle events and are ignored here.
    pub fn handle(&mut self, event: &TransportEvent) -> bool {
        let next = match event {
            TransportEvent::Connected => SessionState::Syncing,
            TransportEvent::Disconnected => SessionState::Offline,
            TransportEvent::Synced(true) => SessionState::Synced,
            TransportEvent::Synced(false) if self.state.is_synced() => SessionState::Syncing,
            TransportEvent::Synced(false) | TransportEvent::Update(_) => return false,
        };
        self.set_state(next)
    }

    fn set_state(&mut self, next: SessionState) -> bool {
        if next == self.state {
            return false;
        }
        tracing::debug!(from = ?self.state, to = ?next, "session state changed");
        self.state = next;
        if next.is_synced() {
            self.has_synced = true;
        }
        self.synced.send_replace(next.is_synced());
        true
    }

    /// Broadcast everything the store has that was not broadcast yet.
    ///
    /// Only runs while synced; offline changes stay in the version gap until
    /// the next synced signal. Returns whether anything was sent.
    pub fn flush(&mut self, store: &SequenceStore) -> Result<bool, EngineError> {
        if !self.state.is_synced() {
            return Ok(false);
        }
        let since = self
            .sync_state
            .last_broadcast_version
            .clone()
            .unwrap_or_default();
        let sent = match store.export_updates_since(&since)? {
            Some(update) => {
                tracing::debug!(bytes = update.len(), "broadcasting local changes");
                self.transport.broadcast(update)?;
                true
            }
            None => false,
        };
        self.sync_state.mark_broadcast(store.version());
        Ok(sent)
    }

    /// Record a remote import. The broadcast mark only moves past it when no
    /// local change is waiting, so the outbox never skips unsent edits.
    pub fn note_remote_import(&mut self, before: &VersionVector, after: VersionVector) {
        if self.sync_state.last_broadcast_version.as_ref() == Some(before) {
            self.sync_state.mark_broadcast(after);
        }
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("state", &self.state)
            .field("has_synced", &self.has_synced)
            .finish()
    }
}

/// In-process transport: broadcasts land on a channel, and connecting
/// reports `Connected` then `Synced(true)` straight away.
#[derive(Debug)]
pub struct MemoryTransport {
    events: TransportSender,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemoryTransport {
    /// Returns the transport and the receiver of everything it broadcasts.
    pub fn new(events: TransportSender) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (Self { events, outgoing }, rx)
    }

    fn emit(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.events.send(event).map_err(|_| TransportError::Closed)
    }
}

impl SyncTransport for MemoryTransport {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.emit(TransportEvent::Connected)?;
        self.emit(TransportEvent::Synced(true))
    }

    fn disconnect(&mut self) {
        if self.emit(TransportEvent::Disconnected).is_err() {
            tracing::trace!("engine gone, disconnect not delivered");
        }
    }

    fn broadcast(&mut self, update: Vec<u8>) -> Result<(), TransportError> {
        self.outgoing
            .send(update)
            .map_err(|e| TransportError::Broadcast(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;

    fn session() -> (
        SyncSession,
        mpsc::UnboundedReceiver<TransportEvent>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (tx, events) = transport_channel();
        let (transport, outgoing) = MemoryTransport::new(tx);
        (SyncSession::new(transport), events, outgoing)
    }

    #[test]
    fn test_session_state_default() {
        assert_eq!(SessionState::default(), SessionState::Idle);
        assert!(!SessionState::Idle.is_online());
        assert!(SessionState::Syncing.is_online());
        assert!(SessionState::Offline.is_offline());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (mut session, mut events, _outgoing) = session();
        session.connect().unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        while let Ok(event) = events.try_recv() {
            session.handle(&event);
        }
        assert_eq!(session.state(), SessionState::Synced);
        assert!(session.is_synced());

        assert!(session.handle(&TransportEvent::Disconnected));
        assert_eq!(session.state(), SessionState::Offline);
        assert!(!session.is_synced());
        assert!(session.has_synced());

        assert!(!session.handle(&TransportEvent::Synced(false)));
        assert!(!session.handle(&TransportEvent::Update(vec![1])));
    }

    #[test]
    fn test_late_subscriber_sees_current_value() {
        let (mut session, _events, _outgoing) = session();
        session.handle(&TransportEvent::Synced(true));
        let rx = session.subscribe_synced();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_wait_synced() {
        let (mut session, _events, _outgoing) = session();
        let pending = tokio::time::timeout(Duration::from_millis(20), session.wait_synced()).await;
        assert!(pending.is_err());

        let wait = session.wait_synced();
        session.handle(&TransportEvent::Connected);
        session.handle(&TransportEvent::Synced(true));
        wait.await.unwrap();
    }

    #[test]
    fn test_outbox_waits_for_sync_then_sends_gap() {
        let (mut session, _events, mut outgoing) = session();
        let mut store = SequenceStore::new(&EngineConfig::default().with_peer_id(1)).unwrap();

        store.insert(0, "offline edit").unwrap();
        assert!(!session.flush(&store).unwrap());
        assert!(session.sync_state().has_unsent_changes(&store));

        session.handle(&TransportEvent::Synced(true));
        assert!(session.flush(&store).unwrap());
        assert!(!session.sync_state().has_unsent_changes(&store));

        let update = outgoing.try_recv().unwrap();
        let mut peer = SequenceStore::new(&EngineConfig::default().with_peer_id(2)).unwrap();
        peer.import(&update).unwrap();
        assert_eq!(peer.to_string(), "offline edit");

        // Nothing new, nothing sent.
        assert!(!session.flush(&store).unwrap());
        assert!(outgoing.try_recv().is_err());
    }

    #[test]
    fn test_remote_import_does_not_hide_unsent_edits() {
        let (mut session, _events, _outgoing) = session();
        let mut store = SequenceStore::new(&EngineConfig::default().with_peer_id(1)).unwrap();
        session.handle(&TransportEvent::Synced(true));
        session.flush(&store).unwrap();

        store.insert(0, "local").unwrap();
        let before = store.version();
        let mut peer = SequenceStore::new(&EngineConfig::default().with_peer_id(2)).unwrap();
        peer.insert(0, "remote").unwrap();
        store.import(&peer.export_snapshot().unwrap()).unwrap();
        session.note_remote_import(&before, store.version());

        assert!(session.sync_state().has_unsent_changes(&store));
    }
}
