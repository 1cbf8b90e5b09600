//! Error types for store, anchor and engine operations.

use std::ops::Range;

use miette::Diagnostic;
use smol_str::SmolStr;
use thiserror::Error;

/// A remote payload that could not be applied.
///
/// Isolated per update: the store is left exactly as it was before the
/// payload arrived, and later payloads apply normally.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
#[non_exhaustive]
pub enum MalformedDelta {
    /// The bytes are not a loro update or snapshot.
    #[error("undecodable update: {reason}")]
    #[diagnostic(code(marginalia::delta::undecodable))]
    Undecodable { reason: String },

    /// The update depends on changes this replica has not seen yet. Loro keeps
    /// it pending and applies it once the missing changes arrive.
    #[error("update depends on changes not yet received")]
    #[diagnostic(
        code(marginalia::delta::missing_dependencies),
        help("the update is retained and applied when its dependencies arrive")
    )]
    MissingDependencies,
}

/// Errors that can occur during CRDT operations.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum CrdtError {
    /// Loro rejected a mutation.
    #[error("loro error: {0}")]
    #[diagnostic(code(marginalia::crdt::loro))]
    Loro(String),

    /// A planned mutation does not fit the store.
    #[error("mutation range {start}..{end} is outside the store (length {len})", start = .range.start, end = .range.end)]
    #[diagnostic(code(marginalia::crdt::out_of_bounds))]
    OutOfBounds { range: Range<usize>, len: usize },

    /// Failed to export CRDT data.
    #[error("failed to export CRDT data: {0}")]
    #[diagnostic(code(marginalia::crdt::export))]
    Export(String),

    /// Remote input that was dropped.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Malformed(#[from] MalformedDelta),
}

impl From<loro::LoroError> for CrdtError {
    fn from(e: loro::LoroError) -> Self {
        CrdtError::Loro(e.to_string())
    }
}

/// Illegal use of the comment-anchor binder.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
#[non_exhaustive]
pub enum AnchorError {
    #[error("cannot {action} while {state}")]
    #[diagnostic(code(marginalia::anchor::transition))]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    /// The captured range lost all of its text before the thread was bound.
    #[error("the selected range is empty")]
    #[diagnostic(
        code(marginalia::anchor::empty_range),
        help("select some text before starting a comment")
    )]
    EmptyRange,

    #[error("thread id must not be empty")]
    #[diagnostic(code(marginalia::anchor::thread_id))]
    EmptyThreadId,
}

/// Errors raised by a sync transport.
#[derive(Error, Debug, Diagnostic)]
#[diagnostic(code(marginalia::transport))]
pub enum TransportError {
    #[error("failed to connect")]
    Connect(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("failed to broadcast update")]
    Broadcast(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("transport is closed")]
    Closed,
}

/// Errors returned to the embedder. A failed local edit leaves the store and
/// the projection untouched.
#[derive(Error, Debug, Diagnostic)]
#[non_exhaustive]
pub enum EngineError {
    #[error("range {start}..{end} is outside the document (length {len})", start = .range.start, end = .range.end)]
    #[diagnostic(code(marginalia::engine::invalid_range))]
    InvalidRange { range: Range<usize>, len: usize },

    #[error("mark key `{key}` is reserved")]
    #[diagnostic(
        code(marginalia::engine::reserved_mark),
        help("thread anchors are written by binding a comment; block kinds by SetNodeKind")
    )]
    ReservedMark { key: SmolStr },

    #[error("node kind `{kind}` is not registered")]
    #[diagnostic(code(marginalia::engine::unknown_node_kind))]
    UnknownNodeKind { kind: SmolStr },

    #[error("editing is disabled until the session has synced")]
    #[diagnostic(code(marginalia::engine::not_synced))]
    NotSynced,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Anchor(#[from] AnchorError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Crdt(#[from] CrdtError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Transport(#[from] TransportError),
}

impl EngineError {
    pub(crate) fn invalid_range(range: Range<usize>, len: usize) -> Self {
        EngineError::InvalidRange { range, len }
    }
}

/// Errors from a comment-thread service.
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
#[non_exhaustive]
pub enum CommentError {
    #[error("unknown thread `{0}`")]
    #[diagnostic(code(marginalia::comments::unknown_thread))]
    UnknownThread(SmolStr),

    #[error("unknown comment `{comment}` in thread `{thread}`")]
    #[diagnostic(code(marginalia::comments::unknown_comment))]
    UnknownComment { thread: SmolStr, comment: SmolStr },

    #[error("comment body must not be empty")]
    #[diagnostic(code(marginalia::comments::empty_body))]
    EmptyBody,
}
