mod common;

use std::collections::BTreeMap;

use common::{actor, text_content, tree_size, tree_xml, Relay};
use doccrdt_core::{CounterValue, Document, DocumentOptions, ElementInit, Error, TreeNode};

fn set(doc: &mut Document, key: &str, value: i32) {
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, key, value).map(|_| ())
        },
        None,
    )
    .unwrap();
}

#[test]
fn empty_history_is_an_error() {
    let mut doc = Document::new("doc", actor(1));
    assert_eq!(doc.undo(), Err(Error::EmptyHistory("undo")));
    assert_eq!(doc.redo(), Err(Error::EmptyHistory("redo")));
}

#[test]
fn overwritten_values_come_back_in_order() {
    let mut doc = Document::new("doc", actor(1));
    set(&mut doc, "k", 1);
    set(&mut doc, "k", 2);

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"k":1}"#);
    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), "{}");
    assert!(!doc.can_undo());

    doc.redo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"k":1}"#);
    doc.redo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"k":2}"#);
    assert!(!doc.can_redo());

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"k":1}"#);
}

#[test]
fn a_new_change_clears_redo() {
    let mut doc = Document::new("doc", actor(1));
    set(&mut doc, "a", 1);
    doc.undo().unwrap();
    assert!(doc.can_redo());

    set(&mut doc, "b", 2);
    assert!(!doc.can_redo());
    assert_eq!(doc.to_sorted_json(), r#"{"b":2}"#);
}

#[test]
fn removed_members_are_restored() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(
                root,
                "obj",
                ElementInit::object([("x".to_string(), 1i32.into())]),
            )
            .map(|_| ())
        },
        None,
    )
    .unwrap();
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            let obj = ctx.resolve("$.obj")?;
            ctx.remove(root, obj)
        },
        None,
    )
    .unwrap();
    assert_eq!(doc.to_sorted_json(), "{}");

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"obj":{"x":1}}"#);
    doc.redo().unwrap();
    assert_eq!(doc.to_sorted_json(), "{}");
}

#[test]
fn array_insertions_are_reverted() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "list", ElementInit::array([1i32.into()]))
                .map(|_| ())
        },
        None,
    )
    .unwrap();
    doc.update(
        |ctx| {
            let list = ctx.resolve("$.list")?;
            ctx.push_back(list, 2i32).map(|_| ())
        },
        None,
    )
    .unwrap();

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"list":[1]}"#);
    doc.redo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"list":[1,2]}"#);
}

#[test]
fn counter_increases_are_negated() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "c", CounterValue::Long(5)).map(|_| ())
        },
        None,
    )
    .unwrap();
    doc.update(
        |ctx| {
            let counter = ctx.resolve("$.c")?;
            ctx.increase(counter, 3)
        },
        None,
    )
    .unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"c":8}"#);

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"c":5}"#);
    doc.redo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"c":8}"#);
}

#[test]
fn text_edits_are_reverted() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            let text = ctx.set(root, "text", ElementInit::Text)?;
            ctx.edit_text(text, 0, 0, "hello", BTreeMap::new())
        },
        None,
    )
    .unwrap();
    doc.update(
        |ctx| {
            let text = ctx.resolve("$.text")?;
            ctx.edit_text(text, 5, 5, " world", BTreeMap::new())
        },
        None,
    )
    .unwrap();
    assert_eq!(text_content(&doc, "$.text"), "hello world");

    doc.undo().unwrap();
    assert_eq!(text_content(&doc, "$.text"), "hello");
    doc.redo().unwrap();
    assert_eq!(text_content(&doc, "$.text"), "hello world");
}

#[test]
fn tree_insertions_are_reverted() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(
                root,
                "t",
                TreeNode::element("r").with_children(vec![
                    TreeNode::element("p").with_children(vec![TreeNode::text("ab")])
                ]),
            )
            .map(|_| ())
        },
        None,
    )
    .unwrap();
    doc.update(
        |ctx| {
            let tree = ctx.resolve("$.t")?;
            ctx.edit_tree(tree, 2, 2, vec![TreeNode::text("X")], 0)
        },
        None,
    )
    .unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>aXb</p></r>");

    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ab</p></r>");
    doc.redo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>aXb</p></r>");
}

fn paragraph_tree(doc: &mut Document, content: &str) {
    let paragraph = TreeNode::element("p").with_children(vec![TreeNode::text(content)]);
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "t", TreeNode::element("r").with_children(vec![paragraph]))
                .map(|_| ())
        },
        None,
    )
    .unwrap();
}

fn edit_tree(doc: &mut Document, from: usize, to: usize, contents: Vec<TreeNode>, split_level: u32) {
    doc.update(
        |ctx| {
            let tree = ctx.resolve("$.t")?;
            ctx.edit_tree(tree, from, to, contents, split_level)
        },
        None,
    )
    .unwrap();
}

#[test]
fn undoing_a_tree_deletion_leaves_surrounding_text_alone() {
    let mut doc = Document::new("doc", actor(1));
    paragraph_tree(&mut doc, "abcd");
    edit_tree(&mut doc, 5, 5, vec![TreeNode::text("X")], 0);
    edit_tree(&mut doc, 2, 4, Vec::new(), 0);
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>adX</p></r>");

    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>abcdX</p></r>");
    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>abcd</p></r>");

    doc.redo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>abcdX</p></r>");
    doc.redo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>adX</p></r>");
}

#[test]
fn tree_deletion_survives_undo_redo_undo() {
    let mut doc = Document::new("doc", actor(1));
    paragraph_tree(&mut doc, "abcd");
    edit_tree(&mut doc, 2, 4, Vec::new(), 0);
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ad</p></r>");

    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>abcd</p></r>");
    doc.redo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ad</p></r>");
    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>abcd</p></r>");
    assert_eq!(tree_size(&doc, "$.t"), 6);
}

#[test]
fn splits_and_merges_are_undone_one_at_a_time() {
    let mut doc = Document::new("doc", actor(1));
    paragraph_tree(&mut doc, "abcd");
    edit_tree(&mut doc, 3, 3, Vec::new(), 1);
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ab</p><p>cd</p></r>");
    edit_tree(&mut doc, 2, 6, Vec::new(), 0);
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ad</p></r>");

    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ab</p><p>cd</p></r>");
    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>abcd</p></r>");
    assert_eq!(doc.history().undo_len(), 1);

    doc.redo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ab</p><p>cd</p></r>");
    doc.redo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ad</p></r>");
}

#[test]
fn undoing_a_split_keeps_the_earlier_insert() {
    let mut doc = Document::new("doc", actor(1));
    paragraph_tree(&mut doc, "ab");
    edit_tree(&mut doc, 2, 2, vec![TreeNode::text("X")], 0);
    edit_tree(&mut doc, 3, 3, Vec::new(), 1);
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>aX</p><p>b</p></r>");

    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>aXb</p></r>");
    doc.undo().unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ab</p></r>");
}

#[test]
fn undone_text_deletion_keeps_its_style() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            let text = ctx.set(root, "text", ElementInit::Text)?;
            ctx.edit_text(text, 0, 0, "abcd", BTreeMap::new())?;
            let bold = BTreeMap::from([("bold".to_string(), "true".to_string())]);
            ctx.style_text(text, 1, 3, bold)
        },
        None,
    )
    .unwrap();
    let styled = r#"{"text":[{"val":"a"},{"attrs":{"bold":"true"},"val":"bc"},{"val":"d"}]}"#;
    assert_eq!(doc.to_sorted_json(), styled);

    doc.update(
        |ctx| {
            let text = ctx.resolve("$.text")?;
            ctx.edit_text(text, 0, 3, "", BTreeMap::new())
        },
        None,
    )
    .unwrap();
    assert_eq!(text_content(&doc, "$.text"), "d");

    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), styled);
    doc.redo().unwrap();
    assert_eq!(text_content(&doc, "$.text"), "d");
}

#[test]
fn stacks_are_bounded_by_the_configured_depth() {
    let options = DocumentOptions {
        max_undo_depth: 2,
        ..DocumentOptions::default()
    };
    let mut doc = Document::with_options("doc", actor(1), options);
    set(&mut doc, "a", 1);
    set(&mut doc, "b", 2);
    set(&mut doc, "c", 3);
    assert_eq!(doc.history().undo_len(), 2);

    doc.undo().unwrap();
    doc.undo().unwrap();
    assert!(!doc.can_undo());
    // The oldest change fell off the stack and stays applied.
    assert_eq!(doc.to_sorted_json(), r#"{"a":1}"#);
}

#[test]
fn remote_changes_are_not_undoable() {
    let mut relay = Relay::default();
    let mut a = Document::new("doc", actor(1));
    let mut b = Document::new("doc", actor(2));
    relay.attach(&mut a).unwrap();
    relay.attach(&mut b).unwrap();

    set(&mut b, "k", 1);
    relay.sync_all(&mut [&mut a, &mut b]).unwrap();

    assert_eq!(a.to_sorted_json(), r#"{"k":1}"#);
    assert!(!a.can_undo());
}

#[test]
fn undo_skips_targets_removed_by_a_peer() {
    let mut relay = Relay::default();
    let mut a = Document::new("doc", actor(1));
    let mut b = Document::new("doc", actor(2));
    relay.attach(&mut a).unwrap();
    relay.attach(&mut b).unwrap();

    a.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "obj", ElementInit::Object(BTreeMap::new())).map(|_| ())
        },
        None,
    )
    .unwrap();
    a.update(
        |ctx| {
            let obj = ctx.resolve("$.obj")?;
            ctx.set(obj, "x", 1i32).map(|_| ())
        },
        None,
    )
    .unwrap();
    relay.sync_all(&mut [&mut a, &mut b]).unwrap();

    b.update(
        |ctx| {
            let root = ctx.root_created_at();
            let obj = ctx.resolve("$.obj")?;
            ctx.remove(root, obj)
        },
        None,
    )
    .unwrap();
    relay.sync_all(&mut [&mut a, &mut b]).unwrap();
    assert_eq!(a.to_sorted_json(), "{}");

    a.undo().unwrap();
    assert_eq!(a.history().undo_len(), 1);
    assert!(!a.can_redo());
    assert_eq!(a.to_sorted_json(), "{}");
}

#[test]
fn redo_follows_recreated_elements() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "list", ElementInit::Array(Vec::new())).map(|_| ())
        },
        None,
    )
    .unwrap();
    doc.update(
        |ctx| {
            let list = ctx.resolve("$.list")?;
            ctx.push_back(list, 1i32).map(|_| ())
        },
        None,
    )
    .unwrap();

    // Undo the list itself, bring it back, then undo the push inside the recreated list.
    doc.undo().unwrap();
    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), "{}");
    doc.redo().unwrap();
    doc.redo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"list":[1]}"#);
    doc.undo().unwrap();
    assert_eq!(doc.to_sorted_json(), r#"{"list":[]}"#);
}
