//! The replicated document: a root of CRDT elements plus the bookkeeping needed to exchange
//! changes with peers.
//!
//! Local updates run against a staging copy of the root first. Only changes that applied
//! cleanly there reach the real root, which keeps every change atomic. Remote changes go
//! through the same path.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tracing::debug;

use crate::change::{
    Change, ChangeContext, ChangePack, ContextOutput, Presence, PresenceChange, Snapshot,
};
use crate::clock::{Clock, LamportClock};
use crate::config::DocumentOptions;
use crate::crdt::root::CrdtRoot;
use crate::error::{Error, Result};
use crate::history::{History, HistoryEntry};
use crate::ids::{ActorId, ChangeId, Checkpoint, TimeTicket};
use crate::operation::{OpSource, OperationInfo, Renames};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocStatus {
    Detached,
    Attached,
    Removed,
}

/// Details of an applied change delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeInfo {
    pub actor: ActorId,
    pub message: Option<String>,
    pub client_seq: u64,
    pub server_seq: Option<u64>,
    pub operations: Vec<OperationInfo>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DocEvent {
    LocalChange(ChangeInfo),
    RemoteChange(ChangeInfo),
    /// The root was replaced by a snapshot.
    Snapshot,
}

impl DocEvent {
    /// The event restricted to operations at `topic` or below it. `None` if nothing remains.
    pub fn filtered(&self, topic: &str) -> Option<DocEvent> {
        let keep = |info: &ChangeInfo| {
            let operations: Vec<OperationInfo> = info
                .operations
                .iter()
                .filter(|op| is_same_or_nested(op.path(), topic))
                .cloned()
                .collect();
            (!operations.is_empty()).then(|| ChangeInfo {
                operations,
                ..info.clone()
            })
        };
        match self {
            DocEvent::LocalChange(info) => keep(info).map(DocEvent::LocalChange),
            DocEvent::RemoteChange(info) => keep(info).map(DocEvent::RemoteChange),
            DocEvent::Snapshot => Some(DocEvent::Snapshot),
        }
    }
}

/// `$.a.b` is nested under `$.a` but not under `$.ab`.
fn is_same_or_nested(path: &str, topic: &str) -> bool {
    match path.strip_prefix(topic) {
        Some(rest) => rest.is_empty() || rest.starts_with('.'),
        None => false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    topic: Option<String>,
    listener: Box<dyn FnMut(&DocEvent)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HistoryStep {
    Undo,
    Redo,
}

impl HistoryStep {
    fn name(self) -> &'static str {
        match self {
            HistoryStep::Undo => "undo",
            HistoryStep::Redo => "redo",
        }
    }
}

pub struct Document<C: Clock = LamportClock> {
    key: String,
    options: DocumentOptions,
    clock: C,
    change_id: ChangeId,
    checkpoint: Checkpoint,
    status: DocStatus,
    root: CrdtRoot,
    /// Staging copy of `root`; rebuilt from `root` after a failed change.
    clone: Option<CrdtRoot>,
    local_changes: Vec<Change>,
    /// Highest client sequence applied per remote actor.
    applied: HashMap<ActorId, u64>,
    presences: BTreeMap<ActorId, Presence>,
    history: History,
    is_updating: bool,
    subscriptions: Vec<Subscription>,
    next_subscription: u64,
}

impl Document<LamportClock> {
    pub fn new(key: impl Into<String>, actor: ActorId) -> Self {
        Self::with_options(key, actor, DocumentOptions::default())
    }

    pub fn with_options(key: impl Into<String>, actor: ActorId, options: DocumentOptions) -> Self {
        Self::with_clock(key, actor, options, LamportClock::default())
    }
}

impl<C: Clock> Document<C> {
    pub fn with_clock(
        key: impl Into<String>,
        actor: ActorId,
        options: DocumentOptions,
        clock: C,
    ) -> Self {
        let history = History::new(options.max_undo_depth);
        Self {
            key: key.into(),
            options,
            clock,
            change_id: ChangeId::initial(actor),
            checkpoint: Checkpoint::default(),
            status: DocStatus::Detached,
            root: CrdtRoot::default(),
            clone: None,
            local_changes: Vec::new(),
            applied: HashMap::new(),
            presences: BTreeMap::new(),
            history,
            is_updating: false,
            subscriptions: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn actor(&self) -> ActorId {
        self.change_id.actor
    }

    pub fn options(&self) -> &DocumentOptions {
        &self.options
    }

    pub fn status(&self) -> DocStatus {
        self.status
    }

    pub fn set_status(&mut self, status: DocStatus) {
        self.status = status;
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn root(&self) -> &CrdtRoot {
        &self.root
    }

    pub fn to_json_value(&self) -> Value {
        self.root.to_json_value()
    }

    pub fn to_sorted_json(&self) -> String {
        self.root.to_sorted_json()
    }

    pub fn presences(&self) -> &BTreeMap<ActorId, Presence> {
        &self.presences
    }

    pub fn presence(&self, actor: &ActorId) -> Option<&Presence> {
        self.presences.get(actor)
    }

    pub fn has_local_changes(&self) -> bool {
        !self.local_changes.is_empty()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn garbage_len(&self) -> usize {
        self.root.garbage_len()
    }

    fn ensure_clone(&mut self) -> &mut CrdtRoot {
        let root = &self.root;
        self.clone.get_or_insert_with(|| root.clone())
    }

    /// Run `updater` as one local change.
    ///
    /// Nothing is recorded if `updater` fails or makes no mutation.
    pub fn update<F>(&mut self, updater: F, message: Option<&str>) -> Result<()>
    where
        F: FnOnce(&mut ChangeContext<'_>) -> Result<()>,
    {
        if self.status == DocStatus::Removed {
            return Err(Error::DocumentRemoved);
        }
        let id = self.change_id.next(&mut self.clock)?;

        self.is_updating = true;
        let clone = self.ensure_clone();
        let mut ctx = ChangeContext::new(id.clone(), clone);
        let outcome = updater(&mut ctx);
        let output = ctx.finish();
        self.is_updating = false;

        if let Err(err) = outcome {
            self.clone = None;
            return Err(err);
        }
        if output.operations.is_empty() && output.presence_change.is_none() {
            return Ok(());
        }

        let ContextOutput {
            operations,
            reverse_operations,
            presence_change,
        } = output;
        let change = Change {
            id: id.clone(),
            message: message.map(str::to_string),
            operations,
            presence_change,
        };
        let infos = self.commit(change, OpSource::Local)?;

        if !infos.is_empty() {
            self.history.clear_redo();
        }
        self.history.push_undo(reverse_operations);
        self.emit_local(&id, message, infos);
        Ok(())
    }

    /// Apply a change already staged on the clone to the root and queue it for sync.
    fn commit(&mut self, change: Change, source: OpSource) -> Result<Vec<OperationInfo>> {
        let infos = match change.execute(&mut self.root, source) {
            Ok(infos) => infos,
            Err(err) => {
                self.clone = None;
                return Err(err);
            }
        };
        if let Some(presence_change) = &change.presence_change {
            apply_presence(&mut self.presences, change.id.actor, presence_change);
        }
        self.change_id = change.id.clone();
        self.local_changes.push(change);
        Ok(infos)
    }

    fn emit_local(&mut self, id: &ChangeId, message: Option<&str>, operations: Vec<OperationInfo>) {
        if operations.is_empty() {
            return;
        }
        self.emit(DocEvent::LocalChange(ChangeInfo {
            actor: id.actor,
            message: message.map(str::to_string),
            client_seq: id.client_seq,
            server_seq: None,
            operations,
        }));
    }

    /// Revert the most recent local change that has not been undone.
    pub fn undo(&mut self) -> Result<()> {
        if self.is_updating {
            return Err(Error::HistoryDuringUpdate);
        }
        if self.status == DocStatus::Removed {
            return Err(Error::DocumentRemoved);
        }
        let entry = self.history.pop_undo().ok_or(Error::EmptyHistory("undo"))?;
        self.replay(entry, HistoryStep::Undo)
    }

    pub fn redo(&mut self) -> Result<()> {
        if self.is_updating {
            return Err(Error::HistoryDuringUpdate);
        }
        if self.status == DocStatus::Removed {
            return Err(Error::DocumentRemoved);
        }
        let entry = self.history.pop_redo().ok_or(Error::EmptyHistory("redo"))?;
        self.replay(entry, HistoryStep::Redo)
    }

    /// Execute a history entry as a new local change. Operations whose targets are gone are
    /// skipped; if all of them are, the entry is simply consumed.
    fn replay(&mut self, entry: HistoryEntry, step: HistoryStep) -> Result<()> {
        let id = self.change_id.next(&mut self.clock)?;
        let mut renames = Renames::default();

        let clone = self.ensure_clone();
        let mut ctx = ChangeContext::new(id.clone(), clone);
        let outcome = replay_entry(&mut ctx, entry, &mut renames);
        let output = ctx.finish();
        if let Err(err) = outcome {
            self.clone = None;
            return Err(err);
        }
        if output.operations.is_empty() {
            debug!(step = step.name(), "history entry had no remaining targets");
            return Ok(());
        }

        let ContextOutput {
            operations,
            reverse_operations,
            ..
        } = output;
        let change = Change {
            id: id.clone(),
            message: None,
            operations,
            presence_change: None,
        };
        let infos = self.commit(change, OpSource::UndoRedo)?;

        match step {
            HistoryStep::Undo => self.history.push_redo(reverse_operations),
            HistoryStep::Redo => self.history.push_undo(reverse_operations),
        }
        self.history.reconcile(&renames);
        self.emit_local(&id, None, infos);
        Ok(())
    }

    /// Local changes not yet acknowledged, with the current checkpoint.
    pub fn create_change_pack(&self) -> ChangePack {
        ChangePack {
            document_key: self.key.clone(),
            checkpoint: Checkpoint::new(self.checkpoint.server_seq, self.change_id.client_seq),
            changes: self.local_changes.clone(),
            snapshot: None,
            is_removed: self.status == DocStatus::Removed,
            min_synced_ticket: None,
        }
    }

    /// Current state as a snapshot payload.
    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(Snapshot {
            root: self.root.to_object()?,
            presences: self.presences.clone(),
            lamport: self.clock.now(),
        })
    }

    /// Apply a pack received from the server.
    pub fn apply_change_pack(&mut self, pack: ChangePack) -> Result<()> {
        debug!(
            key = %self.key,
            changes = pack.changes.len(),
            snapshot = pack.snapshot.is_some(),
            server_seq = pack.checkpoint.server_seq,
            client_seq = pack.checkpoint.client_seq,
            "applying change pack"
        );
        let has_snapshot = pack.snapshot.is_some();
        if let Some(snapshot) = pack.snapshot {
            self.apply_snapshot(snapshot);
        } else if !pack.changes.is_empty() {
            self.apply_changes(pack.changes)?;
        }

        let acked = pack.checkpoint.client_seq;
        self.local_changes.retain(|change| change.id.client_seq > acked);

        if has_snapshot {
            // The snapshot predates the pending local changes.
            for change in &self.local_changes {
                change.execute(&mut self.root, OpSource::Local)?;
            }
            self.clone = None;
        }

        self.checkpoint = self.checkpoint.forward(&pack.checkpoint);

        if let Some(min_synced_ticket) = pack.min_synced_ticket {
            self.garbage_collect(&min_synced_ticket)?;
        }
        if pack.is_removed {
            self.status = DocStatus::Removed;
        }
        Ok(())
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) {
        debug!(key = %self.key, lamport = snapshot.lamport, "applying snapshot");
        self.root = CrdtRoot::new(snapshot.root);
        self.clone = None;
        self.presences = snapshot.presences;
        self.clock.observe(snapshot.lamport);
        self.emit(DocEvent::Snapshot);
    }

    /// Apply remote changes in `(lamport, actor)` order. Each change is staged on the clone
    /// first; a change that fails there never reaches the root. Changes applied by an
    /// earlier call are skipped, so a pack can be redelivered after a partial failure.
    pub fn apply_changes(&mut self, mut changes: Vec<Change>) -> Result<()> {
        changes.sort_by(|a, b| {
            a.id.lamport
                .cmp(&b.id.lamport)
                .then_with(|| a.id.actor.cmp(&b.id.actor))
        });
        for change in changes {
            let actor = change.id.actor;
            let client_seq = change.id.client_seq;
            if self.applied.get(&actor).map_or(false, |seq| client_seq <= *seq) {
                debug!(%actor, client_seq, "skipping change applied before");
                continue;
            }
            let clone = self.ensure_clone();
            if let Err(err) = change.execute(clone, OpSource::Remote) {
                self.clone = None;
                return Err(err);
            }
            let operations = change.execute(&mut self.root, OpSource::Remote)?;
            self.applied.insert(actor, client_seq);
            self.clock.observe(change.id.lamport);
            if let Some(presence_change) = &change.presence_change {
                apply_presence(&mut self.presences, change.id.actor, presence_change);
            }
            if !operations.is_empty() {
                self.emit(DocEvent::RemoteChange(ChangeInfo {
                    actor,
                    message: change.message,
                    client_seq,
                    server_seq: change.id.server_seq,
                    operations,
                }));
            }
        }
        Ok(())
    }

    /// Drop tombstones removed at or before `safe`. Returns the number of reclaimed entities.
    pub fn garbage_collect(&mut self, safe: &TimeTicket) -> Result<usize> {
        if self.options.disable_gc {
            return Ok(0);
        }
        if let Some(clone) = self.clone.as_mut() {
            clone.garbage_collect(safe)?;
        }
        let collected = self.root.garbage_collect(safe)?;
        debug!(key = %self.key, collected, "garbage collected");
        Ok(collected)
    }

    /// Register `listener` for events at `topic` (a `$.a.b` path) or below it, or for every
    /// event when `topic` is `None`.
    pub fn subscribe<F>(&mut self, topic: Option<&str>, listener: F) -> SubscriptionId
    where
        F: FnMut(&DocEvent) + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.push(Subscription {
            id,
            topic: topic.map(str::to_string),
            listener: Box::new(listener),
        });
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|sub| sub.id != id);
        self.subscriptions.len() != before
    }

    fn emit(&mut self, event: DocEvent) {
        for sub in &mut self.subscriptions {
            match &sub.topic {
                None => (sub.listener)(&event),
                Some(topic) => {
                    if let Some(event) = event.filtered(topic) {
                        (sub.listener)(&event);
                    }
                }
            }
        }
    }
}

fn apply_presence(
    presences: &mut BTreeMap<ActorId, Presence>,
    actor: ActorId,
    change: &PresenceChange,
) {
    match change {
        PresenceChange::Put(presence) => {
            presences.insert(actor, presence.clone());
        }
        PresenceChange::Clear => {
            presences.remove(&actor);
        }
    }
}

fn replay_entry(
    ctx: &mut ChangeContext<'_>,
    entry: HistoryEntry,
    renames: &mut Renames,
) -> Result<()> {
    for mut op in entry {
        op.rename(renames);
        op.restamp(&mut || ctx.issue_time_ticket(), renames)?;
        op.executed_at = ctx.issue_time_ticket()?;
        ctx.push(op, OpSource::UndoRedo)?;
    }
    Ok(())
}
