//! Building the document tree from the store's content.

use smol_str::SmolStr;

use marginalia_editor_core::{BLOCK_KEY, Document, Leaf, Marks, Node, NodeKindRegistry, SEPARATOR};

use crate::store::SequenceStore;

/// Project the store's current content into a document.
///
/// Deterministic: two stores with the same content project to equal documents.
pub fn project(store: &SequenceStore, registry: &NodeKindRegistry) -> Document {
    project_runs(&store.rich_runs(), store.head_kind().as_deref(), registry)
}

/// Project a run list. `head_kind` is the kind of the first block.
pub fn project_runs(
    runs: &[(String, Marks)],
    head_kind: Option<&str>,
    registry: &NodeKindRegistry,
) -> Document {
    let mut nodes = Vec::new();
    let mut current = empty_node(head_kind.unwrap_or_default(), registry);

    for (text, marks) in runs {
        let inline = marks.without_block();
        let mut parts = text.split(SEPARATOR);
        if let Some(first) = parts.next() {
            push_leaf(&mut current, first, &inline);
        }
        for part in parts {
            finish(&mut nodes, current, registry);
            let kind = marks
                .get(BLOCK_KEY)
                .and_then(|value| value.as_text())
                .unwrap_or_default();
            current = empty_node(kind, registry);
            push_leaf(&mut current, part, &inline);
        }
    }
    finish(&mut nodes, current, registry);

    Document::new(nodes)
}

fn empty_node(kind: &str, registry: &NodeKindRegistry) -> Node {
    Node {
        id: SmolStr::default(),
        kind: SmolStr::new(registry.resolve(kind).tag()),
        children: Vec::new(),
    }
}

fn push_leaf(node: &mut Node, text: &str, marks: &Marks) {
    if !text.is_empty() {
        node.children.push(Leaf::new(text, marks.clone()));
    }
}

fn finish(nodes: &mut Vec<Node>, mut node: Node, registry: &NodeKindRegistry) {
    registry.resolve(&node.kind).normalize(&mut node);
    nodes.push(node);
}

#[cfg(test)]
mod tests {
    use marginalia_editor_core::{BOLD, MarkValue, NodeKind, PARAGRAPH};

    use super::*;
    use crate::config::EngineConfig;

    struct Quote;

    impl NodeKind for Quote {
        fn tag(&self) -> &str {
            "quote"
        }
    }

    #[test]
    fn test_empty_store_projects_one_empty_block() {
        let store = SequenceStore::new(&EngineConfig::default()).unwrap();
        let doc = project(&store, &NodeKindRegistry::default());

        assert_eq!(doc.len_blocks(), 1);
        assert_eq!(doc.nodes()[0].children, vec![Leaf::default()]);
        assert_eq!(doc.nodes()[0].kind, PARAGRAPH);
    }

    #[test]
    fn test_runs_group_into_leaves_and_blocks() {
        let bold = Marks::new().with(BOLD, true);
        let runs = vec![
            ("hel".to_string(), Marks::new()),
            ("lo\nwor".to_string(), bold.clone()),
            ("ld".to_string(), Marks::new()),
        ];
        let doc = project_runs(&runs, None, &NodeKindRegistry::default());

        assert_eq!(doc.text(), "hello\nworld");
        assert_eq!(
            doc.nodes()[0].children,
            vec![Leaf::plain("hel"), Leaf::new("lo", bold.clone())]
        );
        assert_eq!(
            doc.nodes()[1].children,
            vec![Leaf::new("wor", bold), Leaf::plain("ld")]
        );
        assert_eq!(doc.nodes()[1].id, "n-1");
    }

    #[test]
    fn test_separator_kind_and_unknown_kinds() {
        let mut registry = NodeKindRegistry::default();
        registry.register(Quote);
        let runs = vec![
            ("a".to_string(), Marks::new()),
            (
                "\n".to_string(),
                Marks::new().with(BLOCK_KEY, MarkValue::from("quote")),
            ),
            ("b".to_string(), Marks::new()),
            (
                "\n".to_string(),
                Marks::new().with(BLOCK_KEY, MarkValue::from("table")),
            ),
        ];
        let doc = project_runs(&runs, Some("quote"), &registry);

        let kinds: Vec<&str> = doc.nodes().iter().map(|node| node.kind.as_str()).collect();
        assert_eq!(kinds, vec!["quote", "quote", PARAGRAPH]);
        // The trailing separator opens an empty block.
        assert_eq!(doc.nodes()[2].children, vec![Leaf::default()]);
    }

    #[test]
    fn test_projection_is_deterministic() {
        let mut store = SequenceStore::new(&EngineConfig::default()).unwrap();
        store.insert(0, "one\ntwo").unwrap();
        store.mark(1..6, BOLD, &MarkValue::Bool(true)).unwrap();

        let registry = NodeKindRegistry::default();
        let first = project(&store, &registry);
        let second = project(&store, &registry);
        assert_eq!(first, second);
        assert_eq!(first.content(), second.content());
    }
}
