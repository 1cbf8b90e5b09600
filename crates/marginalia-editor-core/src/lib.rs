//! marginalia-editor-core: the storage-independent half of the editor.
//!
//! This crate provides:
//! - `Document` / `Node` / `Leaf` - the projected tree and its invariants
//! - `Marks` - string-keyed text attributes, including comment anchors
//! - `NodeKindRegistry` - tag-keyed dispatch for block kinds
//! - `SequenceDelta` and `remap` - moving positions through applied changes
//! - `translate_delta` - replaying store deltas as document edits

pub mod actions;
pub mod delta;
pub mod document;
pub mod execute;
pub mod marks;
pub mod node;
pub mod remap;
pub mod types;

pub use actions::LocalEdit;
pub use delta::{DeltaOp, SequenceDelta};
pub use document::{Document, DocumentError, Leaf, Node, SEPARATOR};
pub use execute::{DocumentEdit, Translation, apply_edit, replay, translate_delta};
pub use marks::{
    BLOCK_KEY, BOLD, EXPANDING_MARKS, HIGHLIGHTED, ITALIC, MarkKey, MarkPatch, MarkValue, Marks,
    THREAD_PREFIX, UNDERLINE, thread_id, thread_key,
};
pub use node::{NodeKind, NodeKindRegistry, PARAGRAPH, Paragraph, hash_source, make_node_id};
pub use remap::{remap_offset, remap_range, remap_selection};
pub use smol_str::SmolStr;
pub use types::{Affinity, Point, Selection};
