//! Loro-backed collaborative rich-text engine.
//!
//! This crate provides:
//! - `SequenceStore`: the replicated sequence (a loro rich-text container)
//! - `project` / translator: store content to document tree and back
//! - `CommentBinder` / `AnchorLedger`: comment anchors as `thread:<id>` marks
//! - `SyncSession`: transport lifecycle, synced signal and offline outbox
//! - `Engine`: the single-writer embedding surface tying it together

pub mod anchor;
pub mod comments;
pub mod config;
pub mod engine;
mod error;
pub mod projector;
pub mod session;
pub mod store;
pub mod translator;

pub use anchor::{
    AnchorChange, AnchorLedger, BinderState, CommentBinder, OrphanedAnchorWarning, activate_at,
    thread_for_marks,
};
pub use comments::{Comment, CommentService, CommentThread, MemoryCommentService, ThreadOverview};
pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent};
pub use error::{AnchorError, CommentError, CrdtError, EngineError, MalformedDelta, TransportError};
pub use projector::{project, project_runs};
pub use session::{
    MemoryTransport, SessionState, SyncSession, SyncState, SyncTransport, TransportEvent,
    TransportSender, transport_channel,
};
pub use store::{ObserverId, Origin, SequenceStore, StoreTxn};
pub use translator::{StoreMutation, apply_mutations, plan_anchor, plan_local_edit};

// Re-export Loro types that consumers need
pub use loro::{ExportMode, LoroDoc, VersionVector};
