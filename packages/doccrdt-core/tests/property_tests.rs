mod common;

use std::collections::BTreeMap;

use common::{actor, text_content, tree_size, tree_xml, Relay};
use doccrdt_core::{CrdtElement, Document, ElementInit, TreeNode};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Edit {
    Insert { at: usize, text: String },
    Delete { at: usize, len: usize },
}

impl Edit {
    /// Clamp to `model` and apply. Returns the character range replaced and the inserted text,
    /// or `None` when the edit does not fit.
    fn apply(&self, model: &mut String) -> Option<(usize, usize, String)> {
        let len = model.len();
        match self {
            Edit::Insert { at, text } => {
                let at = at % (len + 1);
                model.insert_str(at, text);
                Some((at, at, text.clone()))
            }
            Edit::Delete { at, len: count } => {
                if len == 0 {
                    return None;
                }
                let from = at % len;
                let to = from + 1 + count % (len - from);
                model.replace_range(from..to, "");
                Some((from, to, String::new()))
            }
        }
    }
}

fn edits(max: usize) -> impl Strategy<Value = Vec<Edit>> {
    prop::collection::vec(
        prop_oneof![
            (any::<usize>(), "[a-z]{1,3}").prop_map(|(at, text)| Edit::Insert { at, text }),
            (any::<usize>(), any::<usize>()).prop_map(|(at, len)| Edit::Delete { at, len }),
        ],
        1..=max,
    )
}

fn tree_doc(actor_byte: u8, base: &str) -> Document {
    let mut doc = Document::new("doc", actor(actor_byte));
    let paragraph = if base.is_empty() {
        TreeNode::element("p")
    } else {
        TreeNode::element("p").with_children(vec![TreeNode::text(base)])
    };
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "t", TreeNode::element("r").with_children(vec![paragraph]))
                .map(|_| ())
        },
        None,
    )
    .unwrap();
    doc
}

fn edit_paragraph(doc: &mut Document, from: usize, to: usize, text: &str) {
    let contents = if text.is_empty() {
        Vec::new()
    } else {
        vec![TreeNode::text(text)]
    };
    doc.update(
        |ctx| {
            let tree = ctx.resolve("$.t")?;
            ctx.edit_tree(tree, 1 + from, 1 + to, contents, 0)
        },
        None,
    )
    .unwrap();
}

#[derive(Clone, Debug)]
enum TreeStep {
    Insert { at: usize },
    Split { at: usize, level: u32 },
}

fn tree_steps() -> impl Strategy<Value = Vec<TreeStep>> {
    prop::collection::vec(
        prop_oneof![
            any::<usize>().prop_map(|at| TreeStep::Insert { at }),
            (any::<usize>(), 1u32..=2).prop_map(|(at, level)| TreeStep::Split { at, level }),
        ],
        1..=2,
    )
}

/// `<r><b><p>abcd</p><p>efgh</p></b></r>`
fn nested_tree_doc(actor_byte: u8) -> Document {
    let mut doc = Document::new("doc", actor(actor_byte));
    let block = TreeNode::element("b").with_children(vec![
        TreeNode::element("p").with_children(vec![TreeNode::text("abcd")]),
        TreeNode::element("p").with_children(vec![TreeNode::text("efgh")]),
    ]);
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "t", TreeNode::element("r").with_children(vec![block]))
                .map(|_| ())
        },
        None,
    )
    .unwrap();
    doc
}

/// Indexes that fall inside a paragraph.
fn paragraph_indexes(doc: &Document) -> Vec<usize> {
    let Some(CrdtElement::Tree(tree)) = doc.root().find_by_path("$.t") else {
        panic!("no tree at $.t");
    };
    (0..=tree.size())
        .filter(|index| tree.index_to_path(*index).map_or(false, |path| path.len() == 3))
        .collect()
}

fn apply_step(doc: &mut Document, step: &TreeStep) {
    let (at, contents, level) = match step {
        TreeStep::Insert { at } => (*at, vec![TreeNode::text("x")], 0),
        TreeStep::Split { at, level } => (*at, Vec::new(), *level),
    };
    let indexes = paragraph_indexes(doc);
    if indexes.is_empty() {
        return;
    }
    let index = indexes[at % indexes.len()];
    doc.update(
        |ctx| {
            let tree = ctx.resolve("$.t")?;
            ctx.edit_tree(tree, index, index, contents, level)
        },
        None,
    )
    .unwrap();
}

proptest! {
    #[test]
    fn concurrent_splits_and_inserts_converge(left in tree_steps(), right in tree_steps()) {
        let mut relay = Relay::default();
        let mut a = nested_tree_doc(1);
        let mut b = Document::new("doc", actor(2));
        relay.attach(&mut a).unwrap();
        relay.attach(&mut b).unwrap();

        for step in &left {
            apply_step(&mut a, step);
        }
        for step in &right {
            apply_step(&mut b, step);
        }
        relay.sync_all(&mut [&mut a, &mut b]).unwrap();

        prop_assert_eq!(tree_xml(&a, "$.t"), tree_xml(&b, "$.t"));
        prop_assert_eq!(tree_size(&a, "$.t"), tree_size(&b, "$.t"));
    }

    #[test]
    fn tree_edits_follow_a_string_model(ops in edits(24)) {
        let mut relay = Relay::default();
        let mut a = tree_doc(1, "");
        let mut b = Document::new("doc", actor(2));
        relay.attach(&mut a).unwrap();
        relay.attach(&mut b).unwrap();

        let mut model = String::new();
        for op in &ops {
            if let Some((from, to, text)) = op.apply(&mut model) {
                edit_paragraph(&mut a, from, to, &text);
            }
        }
        relay.sync_all(&mut [&mut a, &mut b]).unwrap();

        let expected = format!("<r><p>{model}</p></r>");
        prop_assert_eq!(tree_xml(&a, "$.t"), expected.clone());
        prop_assert_eq!(tree_xml(&b, "$.t"), expected);
        prop_assert_eq!(tree_size(&a, "$.t"), model.len() + 2);
        prop_assert_eq!(tree_size(&b, "$.t"), model.len() + 2);
    }

    #[test]
    fn text_edits_follow_a_string_model(ops in edits(24)) {
        let mut relay = Relay::default();
        let mut a = Document::new("doc", actor(1));
        let mut b = Document::new("doc", actor(2));
        relay.attach(&mut a).unwrap();
        relay.attach(&mut b).unwrap();
        a.update(
            |ctx| {
                let root = ctx.root_created_at();
                ctx.set(root, "text", ElementInit::Text).map(|_| ())
            },
            None,
        )
        .unwrap();

        let mut model = String::new();
        for op in &ops {
            if let Some((from, to, text)) = op.apply(&mut model) {
                a.update(
                    |ctx| {
                        let target = ctx.resolve("$.text")?;
                        ctx.edit_text(target, from, to, &text, BTreeMap::new())
                    },
                    None,
                )
                .unwrap();
            }
        }
        relay.sync_all(&mut [&mut a, &mut b]).unwrap();

        prop_assert_eq!(text_content(&a, "$.text"), model.clone());
        prop_assert_eq!(text_content(&b, "$.text"), model);
    }

    #[test]
    fn concurrent_tree_inserts_converge(
        base in "[a-z]{0,4}",
        left in edits(6),
        right in edits(6),
    ) {
        let mut relay = Relay::default();
        let mut a = tree_doc(1, &base);
        let mut b = Document::new("doc", actor(2));
        relay.attach(&mut a).unwrap();
        relay.attach(&mut b).unwrap();

        let mut inserted = 0;
        for (doc, ops) in [(&mut a, &left), (&mut b, &right)] {
            let mut model = base.clone();
            for op in ops.iter().filter(|op| matches!(op, Edit::Insert { .. })) {
                if let Some((from, to, text)) = op.apply(&mut model) {
                    inserted += text.len();
                    edit_paragraph(doc, from, to, &text);
                }
            }
        }
        relay.sync_all(&mut [&mut a, &mut b]).unwrap();

        prop_assert_eq!(tree_xml(&a, "$.t"), tree_xml(&b, "$.t"));
        prop_assert_eq!(tree_size(&a, "$.t"), base.len() + inserted + 2);
    }

    #[test]
    fn split_and_merge_round_trip(text in "[a-z]{2,8}", cut in any::<usize>()) {
        let mut relay = Relay::default();
        let mut a = tree_doc(1, &text);
        let mut b = Document::new("doc", actor(2));
        relay.attach(&mut a).unwrap();
        relay.attach(&mut b).unwrap();

        let cut = 1 + cut % (text.len() - 1);
        a.update(
            |ctx| {
                let tree = ctx.resolve("$.t")?;
                ctx.edit_tree(tree, 1 + cut, 1 + cut, Vec::new(), 1)
            },
            None,
        )
        .unwrap();
        relay.sync_all(&mut [&mut a, &mut b]).unwrap();

        let split = format!("<r><p>{}</p><p>{}</p></r>", &text[..cut], &text[cut..]);
        prop_assert_eq!(tree_xml(&a, "$.t"), split.clone());
        prop_assert_eq!(tree_xml(&b, "$.t"), split);

        // Deleting the boundary between the halves joins them again.
        edit_paragraph(&mut b, cut, cut + 2, "");
        relay.sync_all(&mut [&mut a, &mut b]).unwrap();

        let joined = format!("<r><p>{text}</p></r>");
        prop_assert_eq!(tree_xml(&a, "$.t"), joined.clone());
        prop_assert_eq!(tree_xml(&b, "$.t"), joined);
    }
}
