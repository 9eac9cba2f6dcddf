use std::env;
use std::error::Error as StdError;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use doccrdt_core::{ActorId, Document, ElementInit, Result, TreeNode};

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Output {
    implementation: &'static str,
    workload: String,
    timestamp: String,
    name: String,
    total_ops: u64,
    duration_ms: f64,
    ops_per_sec: f64,
    extra: Extra,
    source_file: Option<String>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct Extra {
    count: u64,
    garbage_len: usize,
}

/// Type `count` characters into one paragraph, then delete every other one.
fn tree_typing(count: u64) -> Result<(f64, usize)> {
    let mut doc = Document::new("bench", ActorId([1; 12]));
    let start = Instant::now();
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
    )?;
    for i in 0..count as usize {
        doc.update(
            |ctx| {
                let tree = ctx.resolve("$.t")?;
                ctx.edit_tree(tree, 1 + i, 1 + i, vec![TreeNode::text("x")], 0)
            },
            None,
        )?;
    }
    for i in 0..(count as usize / 2) {
        doc.update(
            |ctx| {
                let tree = ctx.resolve("$.t")?;
                ctx.edit_tree(tree, 1 + i, 2 + i, Vec::new(), 0)
            },
            None,
        )?;
    }
    Ok((start.elapsed().as_secs_f64() * 1000.0, doc.garbage_len()))
}

/// Append `count` characters to a text, then style the whole run.
fn text_editing(count: u64) -> Result<(f64, usize)> {
    let mut doc = Document::new("bench", ActorId([1; 12]));
    let start = Instant::now();
    doc.update(
        |ctx| {
            let root = ctx.root_created_at();
            ctx.set(root, "text", ElementInit::Text).map(|_| ())
        },
        None,
    )?;
    for i in 0..count as usize {
        doc.update(
            |ctx| {
                let text = ctx.resolve("$.text")?;
                ctx.edit_text(text, i, i, "a", Default::default())
            },
            None,
        )?;
    }
    doc.update(
        |ctx| {
            let text = ctx.resolve("$.text")?;
            let attributes = [("bold".to_string(), "true".to_string())].into();
            ctx.style_text(text, 0, count as usize, attributes)
        },
        None,
    )?;
    Ok((start.elapsed().as_secs_f64() * 1000.0, doc.garbage_len()))
}

fn main() -> std::result::Result<(), Box<dyn StdError>> {
    let mut count: u64 = 200;
    let mut out_file: Option<PathBuf> = None;
    for arg in env::args().skip(1) {
        if let Some(val) = arg.strip_prefix("--count=") {
            count = val.parse().unwrap_or(count);
        } else if let Some(val) = arg.strip_prefix("--out=") {
            out_file = Some(PathBuf::from(val));
        }
    }

    let workloads: [(&str, fn(u64) -> Result<(f64, usize)>, u64); 2] = [
        ("tree-typing", tree_typing, count + count / 2),
        ("text-editing", text_editing, count + 1),
    ];

    let mut outputs = Vec::new();
    for (name, run, total_ops) in workloads {
        let (duration_ms, garbage_len) = run(count)?;
        let workload = format!("{name}-{count}");
        outputs.push(Output {
            implementation: "doccrdt-core",
            workload: workload.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            name: workload,
            total_ops,
            duration_ms,
            ops_per_sec: if duration_ms > 0.0 {
                total_ops as f64 / duration_ms * 1000.0
            } else {
                f64::INFINITY
            },
            extra: Extra { count, garbage_len },
            source_file: out_file.as_ref().map(|p| p.display().to_string()),
        });
    }

    let json = serde_json::to_string_pretty(&outputs)?;
    if let Some(path) = out_file {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &json)?;
    }
    println!("{}", json);
    Ok(())
}
