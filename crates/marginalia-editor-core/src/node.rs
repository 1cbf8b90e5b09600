//! Block node kinds and the tag-keyed dispatch table that resolves them.
//!
//! Every block carries a kind tag. Behaviour that depends on the kind goes
//! through a `NodeKind` handler looked up in a `NodeKindRegistry`, which
//! always has a fallback handler so an unknown tag (say, one written by a
//! newer replica) still projects as an ordinary block.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smol_str::{SmolStr, format_smolstr};

use crate::document::Node;

pub const PARAGRAPH: &str = "paragraph";

/// Behaviour attached to a block kind.
pub trait NodeKind: Send + Sync {
    /// The tag stored in the document for this kind.
    fn tag(&self) -> &str;

    /// Restore the node's invariants after an edit or projection.
    ///
    /// The default merges adjacent leaves with identical marks, drops empty
    /// leaves and guarantees at least one leaf.
    fn normalize(&self, node: &mut Node) {
        node.normalize_leaves();
    }

    /// Kind given to the block created when this block is split.
    /// `None` keeps the same kind.
    fn split_kind(&self) -> Option<&str> {
        None
    }
}

/// The one built-in kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct Paragraph;

impl NodeKind for Paragraph {
    fn tag(&self) -> &str {
        PARAGRAPH
    }
}

/// Tag → handler table with a mandatory fallback.
#[derive(Clone)]
pub struct NodeKindRegistry {
    kinds: HashMap<SmolStr, Arc<dyn NodeKind>>,
    fallback: Arc<dyn NodeKind>,
}

impl NodeKindRegistry {
    /// Create a registry whose fallback is `fallback`. The fallback is also
    /// registered under its own tag.
    pub fn new(fallback: impl NodeKind + 'static) -> Self {
        let fallback: Arc<dyn NodeKind> = Arc::new(fallback);
        let mut kinds = HashMap::new();
        kinds.insert(SmolStr::new(fallback.tag()), fallback.clone());
        Self { kinds, fallback }
    }

    /// Register a handler. Returns the handler previously registered for the tag.
    pub fn register(&mut self, kind: impl NodeKind + 'static) -> Option<Arc<dyn NodeKind>> {
        let kind: Arc<dyn NodeKind> = Arc::new(kind);
        self.kinds.insert(SmolStr::new(kind.tag()), kind)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.kinds.contains_key(tag)
    }

    /// Look up a handler, falling back for unknown or empty tags.
    pub fn resolve(&self, tag: &str) -> &dyn NodeKind {
        match self.kinds.get(tag) {
            Some(kind) => kind.as_ref(),
            None => {
                if !tag.is_empty() {
                    tracing::trace!(tag, "unknown node kind, using fallback");
                }
                self.fallback.as_ref()
            }
        }
    }

    pub fn fallback(&self) -> &dyn NodeKind {
        self.fallback.as_ref()
    }

    pub fn is_fallback(&self, tag: &str) -> bool {
        tag == self.fallback.tag()
    }
}

impl Default for NodeKindRegistry {
    fn default() -> Self {
        Self::new(Paragraph)
    }
}

impl std::fmt::Debug for NodeKindRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.kinds.keys().collect();
        tags.sort();
        f.debug_struct("NodeKindRegistry")
            .field("kinds", &tags)
            .field("fallback", &self.fallback.tag())
            .finish()
    }
}

/// Simple hash function for block text comparison.
///
/// Used by embedders to quickly detect if a block's content has changed.
pub fn hash_source(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Generate a node id from its index.
///
/// Ids are positional: they identify "the n-th block" for DOM diffing, not a
/// particular block across edits.
pub fn make_node_id(index: usize) -> SmolStr {
    format_smolstr!("n-{}", index)
}

#[cfg(test)]
mod tests {
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

    #[test]
    fn test_hash_source() {
        let h1 = hash_source("hello world");
        let h2 = hash_source("hello world");
        let h3 = hash_source("hello world!");

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_make_node_id() {
        assert_eq!(make_node_id(0), "n-0");
        assert_eq!(make_node_id(42), "n-42");
    }

    #[test]
    fn test_unknown_tag_resolves_to_fallback() {
        let registry = NodeKindRegistry::default();
        assert_eq!(registry.resolve("heading").tag(), PARAGRAPH);
        assert_eq!(registry.resolve("").tag(), PARAGRAPH);
        assert!(registry.contains(PARAGRAPH));
        assert!(!registry.contains("heading"));
    }

    #[test]
    fn test_register_new_kind_keeps_existing() {
        let mut registry = NodeKindRegistry::default();
        assert!(registry.register(Quote).is_none());

        assert_eq!(registry.resolve("quote").tag(), "quote");
        assert_eq!(registry.resolve("quote").split_kind(), Some(PARAGRAPH));
        assert_eq!(registry.resolve(PARAGRAPH).tag(), PARAGRAPH);
        assert!(registry.is_fallback(PARAGRAPH));
    }
}
