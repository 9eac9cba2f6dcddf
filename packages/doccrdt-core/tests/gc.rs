mod common;

use std::collections::BTreeMap;

use common::{actor, text_content, tree_xml};
use doccrdt_core::{
    ChangePack, Checkpoint, Document, DocumentOptions, ElementInit, TimeTicket, TreeNode,
};

fn doc_with_object() -> Document {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(
                root,
                "obj",
                ElementInit::object([("a", 1i32.into()), ("b", 2i32.into())]),
            )
            .map(|_| ())
        },
        None,
    )
    .unwrap();
    doc
}

fn remove_obj(doc: &mut Document) {
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            let obj = ctx.resolve("$.obj")?;
            ctx.remove(root, obj)
        },
        None,
    )
    .unwrap();
}

#[test]
fn removed_subtrees_are_collected_once() {
    let mut doc = doc_with_object();
    remove_obj(&mut doc);
    assert_eq!(doc.garbage_len(), 3);

    assert_eq!(doc.garbage_collect(&TimeTicket::MAX).unwrap(), 3);
    assert_eq!(doc.garbage_len(), 0);
    assert_eq!(doc.garbage_collect(&TimeTicket::MAX).unwrap(), 0);
    assert_eq!(doc.to_sorted_json(), "{}");
}

#[test]
fn tombstones_newer_than_the_safe_ticket_survive() {
    let mut doc = doc_with_object();
    remove_obj(&mut doc);

    assert_eq!(doc.garbage_collect(&TimeTicket::INITIAL).unwrap(), 0);
    assert_eq!(doc.garbage_len(), 3);
}

#[test]
fn overwritten_values_become_garbage() {
    let mut doc = Document::new("doc", actor(1));
    for value in [1i32, 2] {
        doc.update(
            |ctx| {
                let root = ctx.root_created_at();
                ctx.set(root, "k", value).map(|_| ())
            },
            None,
        )
        .unwrap();
    }
    assert_eq!(doc.garbage_len(), 1);
    assert_eq!(doc.garbage_collect(&TimeTicket::MAX).unwrap(), 1);
    assert_eq!(doc.to_sorted_json(), r#"{"k":2}"#);
}

#[test]
fn deleted_text_fragments_are_purged() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            let text = ctx.set(root, "text", ElementInit::Text)?;
            ctx.edit_text(text, 0, 0, "abc", BTreeMap::new())
        },
        None,
    )
    .unwrap();
    doc.update(
        |ctx| {
            let text = ctx.resolve("$.text")?;
            ctx.edit_text(text, 1, 2, "", BTreeMap::new())
        },
        None,
    )
    .unwrap();

    assert_eq!(doc.garbage_len(), 1);
    assert_eq!(doc.garbage_collect(&TimeTicket::MAX).unwrap(), 1);
    assert_eq!(doc.garbage_len(), 0);
    assert_eq!(text_content(&doc, "$.text"), "ac");

    // Editing around the purged fragment still works.
    doc.update(
        |ctx| {
            let text = ctx.resolve("$.text")?;
            ctx.edit_text(text, 1, 1, "B", BTreeMap::new())
        },
        None,
    )
    .unwrap();
    assert_eq!(text_content(&doc, "$.text"), "aBc");
}

#[test]
fn deleted_tree_nodes_are_purged() {
    let mut doc = Document::new("doc", actor(1));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(
                root,
                "t",
                TreeNode::element("r").with_children(vec![
                    TreeNode::element("p").with_children(vec![TreeNode::text("ab")]),
                    TreeNode::element("p").with_children(vec![TreeNode::text("cd")]),
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
            ctx.edit_tree(tree, 4, 8, Vec::new(), 0)
        },
        None,
    )
    .unwrap();
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ab</p></r>");

    assert_eq!(doc.garbage_len(), 2);
    assert_eq!(doc.garbage_collect(&TimeTicket::MAX).unwrap(), 2);
    assert_eq!(doc.garbage_len(), 0);
    assert_eq!(tree_xml(&doc, "$.t"), "<r><p>ab</p></r>");
}

#[test]
fn disabled_gc_keeps_everything() {
    let options = DocumentOptions {
        disable_gc: true,
        ..DocumentOptions::default()
    };
    let mut doc = Document::with_options("doc", actor(1), options);
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "k", 1i32)?;
            let k = ctx.resolve("$.k")?;
            ctx.remove(root, k)
        },
        None,
    )
    .unwrap();

    assert_eq!(doc.garbage_collect(&TimeTicket::MAX).unwrap(), 0);
    assert_eq!(doc.garbage_len(), 1);
}

#[test]
fn change_packs_carry_the_collection_horizon() {
    let mut doc = doc_with_object();
    remove_obj(&mut doc);

    doc.apply_change_pack(ChangePack {
        document_key: "doc".into(),
        checkpoint: Checkpoint::new(2, 2),
        min_synced_ticket: Some(TimeTicket::MAX),
        ..ChangePack::default()
    })
    .unwrap();

    assert_eq!(doc.garbage_len(), 0);
    assert!(!doc.has_local_changes());
}
