#![allow(dead_code)]

use std::collections::HashMap;

use doccrdt_core::{
    ActorId, Change, ChangePack, Checkpoint, CrdtElement, DocStatus, Document, Result,
};
use tracing_subscriber::EnvFilter;

/// Route library logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn actor(b: u8) -> ActorId {
    ActorId([b; 12])
}

/// In-memory stand-in for the server: orders pushed changes, assigns server sequences and
/// hands every client the changes it has not seen yet.
#[derive(Default)]
pub struct Relay {
    log: Vec<Change>,
    acked: HashMap<ActorId, u64>,
}

impl Relay {
    pub fn attach(&mut self, doc: &mut Document) -> Result<()> {
        init_tracing();
        doc.set_status(DocStatus::Attached);
        self.push_pull(doc)
    }

    pub fn server_seq(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn push_pull(&mut self, doc: &mut Document) -> Result<()> {
        let pack = doc.create_change_pack();
        let actor = doc.actor();
        let acked = self.acked.get(&actor).copied().unwrap_or(0);
        for mut change in pack.changes {
            if change.id.client_seq <= acked {
                continue;
            }
            change.id.server_seq = Some(self.server_seq() + 1);
            self.log.push(change);
        }
        self.acked.insert(actor, pack.checkpoint.client_seq);

        let since = doc.checkpoint().server_seq as usize;
        let changes = self.log[since.min(self.log.len())..]
            .iter()
            .filter(|change| change.id.actor != actor)
            .cloned()
            .collect();
        doc.apply_change_pack(ChangePack {
            document_key: pack.document_key,
            checkpoint: Checkpoint::new(self.server_seq(), pack.checkpoint.client_seq),
            changes,
            snapshot: None,
            is_removed: false,
            min_synced_ticket: None,
        })
    }

    /// Two rounds so every client sees every other client's changes.
    pub fn sync_all(&mut self, docs: &mut [&mut Document]) -> Result<()> {
        for _ in 0..2 {
            for doc in docs.iter_mut() {
                self.push_pull(doc)?;
            }
        }
        Ok(())
    }
}

pub fn tree_xml(doc: &Document, path: &str) -> String {
    match doc.root().find_by_path(path) {
        Some(CrdtElement::Tree(tree)) => tree.to_xml(),
        other => panic!("no tree at {path}: {other:?}"),
    }
}

pub fn tree_size(doc: &Document, path: &str) -> usize {
    match doc.root().find_by_path(path) {
        Some(CrdtElement::Tree(tree)) => tree.size(),
        other => panic!("no tree at {path}: {other:?}"),
    }
}

pub fn text_content(doc: &Document, path: &str) -> String {
    match doc.root().find_by_path(path) {
        Some(CrdtElement::Text(text)) => text.to_string(),
        other => panic!("no text at {path}: {other:?}"),
    }
}
