use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use doccrdt_core::{ActorId, Document, ElementInit, TimeTicket, TreeNode};

const COUNTS: &[usize] = &[10, 100, 1_000];

fn tree_doc() -> Document {
    let mut doc = Document::new("bench", ActorId([1; 12]));
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(
                root,
                "t",
                TreeNode::element("doc").with_children(vec![TreeNode::element("p")]),
            )
            .map(|_| ())
        },
        None,
    )
    .unwrap();
    doc
}

fn tree_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("tree-typing");
    for &count in COUNTS {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut doc = tree_doc();
                for i in 0..count {
                    doc.update(
                        |ctx| {
                            let tree = ctx.resolve("$.t")?;
                            ctx.edit_tree(tree, 1 + i, 1 + i, vec![TreeNode::text("x")], 0)
                        },
                        None,
                    )
                    .unwrap();
                }
                doc
            })
        });
    }
    group.finish();
}

fn text_edit_and_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("text-edit-gc");
    for &count in COUNTS {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                let mut doc = Document::new("bench", ActorId([1; 12]));
                doc.update(
                    |ctx| {
                        let root = ctx.root_created_at();
                        ctx.set(root, "text", ElementInit::Text).map(|_| ())
                    },
                    None,
                )
                .unwrap();
                for i in 0..count {
                    doc.update(
                        |ctx| {
                            let text = ctx.resolve("$.text")?;
                            ctx.edit_text(text, i, i, "ab", Default::default())?;
                            ctx.edit_text(text, i, i + 1, "", Default::default())
                        },
                        None,
                    )
                    .unwrap();
                }
                doc.garbage_collect(&TimeTicket::MAX).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, tree_typing, text_edit_and_collect);
criterion_main!(benches);
