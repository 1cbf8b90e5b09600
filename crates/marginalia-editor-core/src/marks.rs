//! Text marks: named attributes applied to runs of text.
//!
//! Marks are keyed by strings rather than fixed fields so that comment
//! anchors (`thread:<id>`) can live next to the well-known formatting keys.
//! Keys are kept in a `BTreeMap`, which gives every mark set a canonical
//! order. That order is what "first" means when a run carries several
//! thread anchors.

use std::collections::BTreeMap;
use std::collections::btree_map;

use smol_str::{SmolStr, format_smolstr};

pub const BOLD: &str = "bold";
pub const ITALIC: &str = "italic";
pub const UNDERLINE: &str = "underline";
pub const HIGHLIGHTED: &str = "highlighted";

/// Formatting marks that grow when text is typed at the end of a marked run.
pub const EXPANDING_MARKS: [&str; 4] = [BOLD, ITALIC, UNDERLINE, HIGHLIGHTED];

/// Prefix of comment-anchor keys. Only the anchor binder may write these.
pub const THREAD_PREFIX: &str = "thread:";

/// Reserved key carried by block separators to record the kind of the block
/// that follows them.
pub const BLOCK_KEY: &str = "block";

/// Value of a single mark.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarkValue {
    Bool(bool),
    Text(SmolStr),
}

impl MarkValue {
    /// `false` is treated the same as an absent mark.
    pub fn is_set(&self) -> bool {
        !matches!(self, MarkValue::Bool(false))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MarkValue::Text(s) => Some(s.as_str()),
            MarkValue::Bool(_) => None,
        }
    }
}

impl From<bool> for MarkValue {
    fn from(value: bool) -> Self {
        MarkValue::Bool(value)
    }
}

impl From<&str> for MarkValue {
    fn from(value: &str) -> Self {
        MarkValue::Text(SmolStr::new(value))
    }
}

/// Changes to a mark set: `Some(value)` sets a key, `None` removes it.
pub type MarkPatch = BTreeMap<SmolStr, Option<MarkValue>>;

/// How a mark key is treated at the editing boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkKey<'a> {
    /// Ordinary formatting (`bold`, `italic`, or any custom key).
    Formatting(&'a str),
    /// A comment anchor, carrying the thread id.
    Thread(&'a str),
    /// The block-kind attribute of a separator.
    Block,
}

impl<'a> MarkKey<'a> {
    pub fn classify(key: &'a str) -> Self {
        if key == BLOCK_KEY {
            MarkKey::Block
        } else if let Some(id) = key.strip_prefix(THREAD_PREFIX) {
            MarkKey::Thread(id)
        } else {
            MarkKey::Formatting(key)
        }
    }

    /// Reserved keys cannot be written through ordinary formatting edits.
    pub fn is_reserved(&self) -> bool {
        !matches!(self, MarkKey::Formatting(_))
    }
}

/// Build the mark key that anchors a comment thread.
pub fn thread_key(thread_id: &str) -> SmolStr {
    format_smolstr!("{THREAD_PREFIX}{thread_id}")
}

/// Extract the thread id from an anchor key, if it is one.
pub fn thread_id(key: &str) -> Option<&str> {
    key.strip_prefix(THREAD_PREFIX).filter(|id| !id.is_empty())
}

/// The set of marks carried by a run of text.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Marks(BTreeMap<SmolStr, MarkValue>);

impl Marks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<SmolStr>, value: impl Into<MarkValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a mark. Unset values (`false`) remove the key instead.
    pub fn insert(&mut self, key: impl Into<SmolStr>, value: impl Into<MarkValue>) {
        let key = key.into();
        let value = value.into();
        if value.is_set() {
            self.0.insert(key, value);
        } else {
            self.0.remove(&key);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<MarkValue> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&MarkValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// True when `key` is present with the boolean value `true`.
    pub fn is_active(&self, key: &str) -> bool {
        matches!(self.0.get(key), Some(MarkValue::Bool(true)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, SmolStr, MarkValue> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(SmolStr::as_str)
    }

    /// Thread ids anchored on this run, in key order.
    pub fn thread_ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().filter_map(|key| thread_id(key))
    }

    /// First-match-wins: the thread activated when this run is clicked.
    pub fn first_thread(&self) -> Option<&str> {
        self.thread_ids().next()
    }

    /// Copy of this mark set without the reserved block attribute.
    pub fn without_block(&self) -> Marks {
        let mut marks = self.clone();
        marks.0.remove(BLOCK_KEY);
        marks
    }

    /// Apply a patch in place.
    pub fn apply_patch(&mut self, patch: &MarkPatch) {
        for (key, value) in patch {
            match value {
                Some(value) => self.insert(key.clone(), value.clone()),
                None => {
                    self.0.remove(key);
                }
            }
        }
    }
}

impl FromIterator<(SmolStr, MarkValue)> for Marks {
    fn from_iter<I: IntoIterator<Item = (SmolStr, MarkValue)>>(iter: I) -> Self {
        let mut marks = Marks::new();
        for (key, value) in iter {
            marks.insert(key, value);
        }
        marks
    }
}

impl<'a> IntoIterator for &'a Marks {
    type Item = (&'a SmolStr, &'a MarkValue);
    type IntoIter = btree_map::Iter<'a, SmolStr, MarkValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
