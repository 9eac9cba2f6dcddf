use std::collections::{BTreeMap, HashMap};

use tracing::{trace, warn};

use crate::crdt::element::{CrdtElement, Tombstone};
use crate::crdt::rga_split::RgaSplitPos;
use crate::crdt::root::CrdtRoot;
use crate::crdt::tree::{TreeChange, TreeNode, TreeNodeId, TreeNodeSnapshot, TreePos};
use crate::error::{Error, Result};
use crate::ids::{ActorId, TimeTicket};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Newest creation ticket per actor an editor had seen when it made a text or tree edit.
pub type MaxCreatedAtByActor = HashMap<ActorId, TimeTicket>;

/// Where an operation being executed comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpSource {
    Local,
    Remote,
    /// Replay of a reverse operation. Targets that no longer resolve are skipped.
    UndoRedo,
}

/// The document mutations.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OperationKind {
    /// Set `key` of the target object.
    Set { key: String, value: CrdtElement },
    /// Insert into the target array after `prev_created_at` (`INITIAL` for the front).
    Add {
        prev_created_at: TimeTicket,
        value: CrdtElement,
    },
    Move {
        prev_created_at: TimeTicket,
        created_at: TimeTicket,
    },
    Remove { created_at: TimeTicket },
    /// Replace an array element in place.
    ArraySet {
        created_at: TimeTicket,
        value: CrdtElement,
    },
    /// Add to the target counter.
    Increase { value: i64 },
    Edit {
        from: RgaSplitPos,
        to: RgaSplitPos,
        content: String,
        attributes: BTreeMap<String, String>,
        #[cfg_attr(feature = "serde", serde(default))]
        max_created_at_by_actor: Option<MaxCreatedAtByActor>,
    },
    Style {
        from: RgaSplitPos,
        to: RgaSplitPos,
        attributes: BTreeMap<String, String>,
        #[cfg_attr(feature = "serde", serde(default))]
        max_created_at_by_actor: Option<MaxCreatedAtByActor>,
    },
    TreeEdit {
        from: TreePos,
        to: TreePos,
        contents: Vec<TreeNodeSnapshot>,
        split_level: u32,
        #[cfg_attr(feature = "serde", serde(default))]
        max_created_at_by_actor: Option<MaxCreatedAtByActor>,
    },
    TreeStyle {
        from: TreePos,
        to: TreePos,
        attributes: BTreeMap<String, String>,
        #[cfg_attr(feature = "serde", serde(default))]
        max_created_at_by_actor: Option<MaxCreatedAtByActor>,
    },
    TreeRemoveStyle {
        from: TreePos,
        to: TreePos,
        attributes_to_remove: Vec<String>,
        #[cfg_attr(feature = "serde", serde(default))]
        max_created_at_by_actor: Option<MaxCreatedAtByActor>,
    },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Set { .. } => "set",
            OperationKind::Add { .. } => "add",
            OperationKind::Move { .. } => "move",
            OperationKind::Remove { .. } => "remove",
            OperationKind::ArraySet { .. } => "array-set",
            OperationKind::Increase { .. } => "increase",
            OperationKind::Edit { .. } => "edit",
            OperationKind::Style { .. } => "style",
            OperationKind::TreeEdit { .. } => "tree-edit",
            OperationKind::TreeStyle { .. } => "tree-style",
            OperationKind::TreeRemoveStyle { .. } => "tree-remove-style",
        }
    }
}

/// An operation addressed to the element created at `parent_created_at`.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Operation {
    pub parent_created_at: TimeTicket,
    /// `TimeTicket::INITIAL` on reverse operations until they are replayed.
    pub executed_at: TimeTicket,
    pub kind: OperationKind,
}

/// What an applied operation changed, addressed by element path.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationInfo {
    Set {
        path: String,
        key: String,
    },
    Add {
        path: String,
        index: usize,
    },
    Move {
        path: String,
        previous_index: usize,
        index: usize,
    },
    Remove {
        path: String,
        key: Option<String>,
        index: Option<usize>,
    },
    ArraySet {
        path: String,
        index: usize,
    },
    Increase {
        path: String,
        value: i64,
    },
    Edit {
        path: String,
        from: usize,
        to: usize,
        content: String,
        attributes: BTreeMap<String, String>,
    },
    Style {
        path: String,
        from: usize,
        to: usize,
        attributes: BTreeMap<String, String>,
    },
    TreeEdit {
        path: String,
        from: usize,
        to: usize,
        from_path: Vec<usize>,
        to_path: Vec<usize>,
        value: Option<Vec<TreeNode>>,
        split_level: u32,
    },
    TreeStyle {
        path: String,
        from: usize,
        to: usize,
        from_path: Vec<usize>,
        to_path: Vec<usize>,
        attributes: BTreeMap<String, String>,
        attributes_to_remove: Vec<String>,
    },
}

impl OperationInfo {
    pub fn path(&self) -> &str {
        match self {
            OperationInfo::Set { path, .. }
            | OperationInfo::Add { path, .. }
            | OperationInfo::Move { path, .. }
            | OperationInfo::Remove { path, .. }
            | OperationInfo::ArraySet { path, .. }
            | OperationInfo::Increase { path, .. }
            | OperationInfo::Edit { path, .. }
            | OperationInfo::Style { path, .. }
            | OperationInfo::TreeEdit { path, .. }
            | OperationInfo::TreeStyle { path, .. } => path,
        }
    }
}

/// Identities re-issued while replaying history, so stored history entries can follow them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Renames {
    /// `(old, new)` creation tickets of re-created elements.
    pub tickets: Vec<(TimeTicket, TimeTicket)>,
    pub tree_nodes: Vec<TreeNodeRename>,
}

/// A tree node re-inserted under a new id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TreeNodeRename {
    pub old: TreeNodeId,
    pub new: TreeNodeId,
    /// Characters of a text node. Element nodes are matched by id alone.
    pub text_len: Option<usize>,
}

impl Renames {
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty() && self.tree_nodes.is_empty()
    }

    fn ticket(&self, ticket: &mut TimeTicket) {
        if let Some((_, new)) = self.tickets.iter().find(|(old, _)| old == ticket) {
            *ticket = *new;
        }
    }

    /// Rewrite a position id. Text anchors point at the end of a character run, so only
    /// offsets strictly inside or at the end of the re-inserted run move; the boundary at its
    /// start belongs to whatever precedes it.
    fn tree_node(&self, id: &mut TreeNodeId) {
        for rename in &self.tree_nodes {
            match rename.text_len {
                None if *id == rename.old => {
                    *id = rename.new;
                    return;
                }
                Some(len)
                    if id.created_at == rename.old.created_at
                        && id.offset > rename.old.offset
                        && id.offset <= rename.old.offset + len =>
                {
                    *id = TreeNodeId::new(
                        rename.new.created_at,
                        rename.new.offset + id.offset - rename.old.offset,
                    );
                    return;
                }
                _ => {}
            }
        }
    }
}

/// Outcome of [`Operation::execute`].
#[derive(Clone, Debug, Default)]
pub struct Executed {
    pub infos: Vec<OperationInfo>,
    /// Operations undoing this one, in the order they are to be replayed.
    pub reverse: Vec<Operation>,
    /// Creation tickets observed by a text or tree operation.
    pub max_created_at_by_actor: Option<MaxCreatedAtByActor>,
}

fn tree_style_info(path: &str, change: TreeChange) -> OperationInfo {
    OperationInfo::TreeStyle {
        path: path.to_string(),
        from: change.from,
        to: change.to,
        from_path: change.from_path,
        to_path: change.to_path,
        attributes: change.attributes,
        attributes_to_remove: change.attributes_to_remove,
    }
}

impl Operation {
    pub fn new(parent_created_at: TimeTicket, executed_at: TimeTicket, kind: OperationKind) -> Self {
        Self {
            parent_created_at,
            executed_at,
            kind,
        }
    }

    fn reverse(&self, kind: OperationKind) -> Operation {
        Operation::new(self.parent_created_at, TimeTicket::INITIAL, kind)
    }

    pub(crate) fn set_max_created_at_by_actor(&mut self, map: MaxCreatedAtByActor) {
        match &mut self.kind {
            OperationKind::Edit {
                max_created_at_by_actor,
                ..
            }
            | OperationKind::Style {
                max_created_at_by_actor,
                ..
            }
            | OperationKind::TreeEdit {
                max_created_at_by_actor,
                ..
            }
            | OperationKind::TreeStyle {
                max_created_at_by_actor,
                ..
            }
            | OperationKind::TreeRemoveStyle {
                max_created_at_by_actor,
                ..
            } => *max_created_at_by_actor = Some(map),
            _ => {}
        }
    }

    /// Apply to `root`. Returns `None` when a replayed reverse operation found its target
    /// gone; the reverse is only computed for local and undo/redo sources.
    pub fn execute(&self, root: &mut CrdtRoot, source: OpSource) -> Result<Option<Executed>> {
        trace!(
            kind = self.kind.name(),
            executed_at = %self.executed_at,
            "executing operation"
        );
        match self.apply(root, source) {
            Ok(Some(mut executed)) => {
                if source == OpSource::Remote {
                    executed.reverse.clear();
                }
                Ok(Some(executed))
            }
            Ok(None) => Ok(None),
            Err(Error::MissingDependency(what)) if source == OpSource::UndoRedo => {
                warn!(kind = self.kind.name(), %what, "skipping reverse operation");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn skip(&self, source: OpSource, reason: &str) -> Result<Option<Executed>> {
        if source == OpSource::UndoRedo {
            warn!(kind = self.kind.name(), reason, "skipping reverse operation");
            return Ok(None);
        }
        Err(Error::MissingDependency(format!(
            "{} target {}: {reason}",
            self.kind.name(),
            self.parent_created_at
        )))
    }

    fn apply(&self, root: &mut CrdtRoot, source: OpSource) -> Result<Option<Executed>> {
        let parent_ticket = self.parent_created_at;
        let executed_at = self.executed_at;
        let Some(parent) = root.find_mut(&parent_ticket) else {
            return self.skip(source, "target not found");
        };
        if source == OpSource::UndoRedo && parent.is_removed() {
            return self.skip(source, "target removed");
        }

        match &self.kind {
            OperationKind::Set { key, value } => {
                let CrdtElement::Object(object) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "set on a {}",
                        parent.type_name()
                    )));
                };
                let previous = object.get(key).cloned();
                let removed = object.set(key, value.clone(), executed_at);
                root.register_element(value, parent_ticket);
                if let Some(removed) = removed {
                    root.register_removed(removed);
                }
                let reverse = match previous {
                    Some(previous) => OperationKind::Set {
                        key: key.clone(),
                        value: previous,
                    },
                    None => OperationKind::Remove {
                        created_at: value.created_at(),
                    },
                };
                Ok(Some(Executed {
                    infos: vec![OperationInfo::Set {
                        path: root.create_path(&parent_ticket)?,
                        key: key.clone(),
                    }],
                    reverse: vec![self.reverse(reverse)],
                    max_created_at_by_actor: None,
                }))
            }
            OperationKind::Add {
                prev_created_at,
                value,
            } => {
                let CrdtElement::Array(array) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "add on a {}",
                        parent.type_name()
                    )));
                };
                array.insert_after(prev_created_at, value.clone(), executed_at)?;
                let index = array.elements().index_of(&value.created_at()).unwrap_or(0);
                root.register_element(value, parent_ticket);
                Ok(Some(Executed {
                    infos: vec![OperationInfo::Add {
                        path: root.create_path(&parent_ticket)?,
                        index,
                    }],
                    reverse: vec![self.reverse(OperationKind::Remove {
                        created_at: value.created_at(),
                    })],
                    max_created_at_by_actor: None,
                }))
            }
            OperationKind::Move {
                prev_created_at,
                created_at,
            } => {
                let CrdtElement::Array(array) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "move on a {}",
                        parent.type_name()
                    )));
                };
                let Some(target) = array.get_by_id(created_at) else {
                    return self.skip(source, "element not found");
                };
                if source == OpSource::UndoRedo && target.is_removed() {
                    return self.skip(source, "element removed");
                }
                let previous_prev = array.elements().prev_created_at(created_at);
                let previous_index = array.elements().index_of(created_at).unwrap_or(0);
                if !array.move_after(prev_created_at, created_at, executed_at)? {
                    return Ok(Some(Executed::default()));
                }
                let index = array.elements().index_of(created_at).unwrap_or(0);
                let reverse = previous_prev
                    .map(|prev| {
                        self.reverse(OperationKind::Move {
                            prev_created_at: prev,
                            created_at: *created_at,
                        })
                    })
                    .into_iter()
                    .collect();
                Ok(Some(Executed {
                    infos: vec![OperationInfo::Move {
                        path: root.create_path(&parent_ticket)?,
                        previous_index,
                        index,
                    }],
                    reverse,
                    max_created_at_by_actor: None,
                }))
            }
            OperationKind::Remove { created_at } => {
                let Some(target) = parent.child(created_at) else {
                    return self.skip(source, "element not found");
                };
                if target.is_removed() {
                    if source == OpSource::UndoRedo {
                        return self.skip(source, "element removed");
                    }
                    parent.delete_child(created_at, executed_at);
                    return Ok(Some(Executed::default()));
                }
                let mut restored = target.clone();
                restored.meta_mut().removed_at = None;
                let (key, index, reverse) = match &*parent {
                    CrdtElement::Object(object) => {
                        let key = object.key_of(created_at).map(str::to_string);
                        let reverse = key.clone().map(|key| OperationKind::Set {
                            key,
                            value: restored,
                        });
                        (key, None, reverse)
                    }
                    CrdtElement::Array(array) => {
                        let index = array.elements().index_of(created_at);
                        let reverse = array.elements().prev_created_at(created_at).map(|prev| {
                            OperationKind::Add {
                                prev_created_at: prev,
                                value: restored,
                            }
                        });
                        (None, index, reverse)
                    }
                    other => {
                        return Err(Error::InvalidOperation(format!(
                            "remove on a {}",
                            other.type_name()
                        )))
                    }
                };
                if parent.delete_child(created_at, executed_at) == Some(true) {
                    root.register_removed(*created_at);
                }
                Ok(Some(Executed {
                    infos: vec![OperationInfo::Remove {
                        path: root.create_path(&parent_ticket)?,
                        key,
                        index,
                    }],
                    reverse: reverse.map(|kind| self.reverse(kind)).into_iter().collect(),
                    max_created_at_by_actor: None,
                }))
            }
            OperationKind::ArraySet { created_at, value } => {
                let CrdtElement::Array(array) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "array set on a {}",
                        parent.type_name()
                    )));
                };
                let Some(previous) = array.get_by_id(created_at).cloned() else {
                    return self.skip(source, "element not found");
                };
                if source == OpSource::UndoRedo && previous.is_removed() {
                    return self.skip(source, "element removed");
                }
                let removed = array.set(created_at, value.clone(), executed_at)?;
                let index = array.elements().index_of(&value.created_at()).unwrap_or(0);
                root.register_element(value, parent_ticket);
                if removed {
                    root.register_removed(*created_at);
                }
                Ok(Some(Executed {
                    infos: vec![OperationInfo::ArraySet {
                        path: root.create_path(&parent_ticket)?,
                        index,
                    }],
                    reverse: vec![self.reverse(OperationKind::ArraySet {
                        created_at: value.created_at(),
                        value: previous,
                    })],
                    max_created_at_by_actor: None,
                }))
            }
            OperationKind::Increase { value } => {
                let CrdtElement::Counter(counter) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "increase on a {}",
                        parent.type_name()
                    )));
                };
                counter.increase(*value);
                Ok(Some(Executed {
                    infos: vec![OperationInfo::Increase {
                        path: root.create_path(&parent_ticket)?,
                        value: *value,
                    }],
                    reverse: vec![self.reverse(OperationKind::Increase {
                        value: value.wrapping_neg(),
                    })],
                    max_created_at_by_actor: None,
                }))
            }
            OperationKind::Edit {
                from,
                to,
                content,
                attributes,
                max_created_at_by_actor,
            } => {
                let CrdtElement::Text(text) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "edit on a {}",
                        parent.type_name()
                    )));
                };
                let result = text.edit(
                    from,
                    to,
                    content,
                    attributes,
                    executed_at,
                    max_created_at_by_actor.as_ref(),
                )?;
                if result.has_garbage {
                    root.register_gc_container(parent_ticket);
                }
                let path = root.create_path(&parent_ticket)?;
                let (start, end) = result.inserted_range;
                // Runs are re-inserted last first at the same anchor; each newer insertion
                // lands right after the anchor, which restores document order.
                let mut reverse = Vec::new();
                if !content.is_empty() || !result.removed_runs.is_empty() {
                    let mut runs = result.removed_runs.into_iter().rev();
                    let (first, first_attributes) = runs.next().unwrap_or_default();
                    reverse.push(self.reverse(OperationKind::Edit {
                        from: start,
                        to: end,
                        content: first,
                        attributes: first_attributes,
                        max_created_at_by_actor: None,
                    }));
                    for (content, attributes) in runs {
                        reverse.push(self.reverse(OperationKind::Edit {
                            from: start,
                            to: start,
                            content,
                            attributes,
                            max_created_at_by_actor: None,
                        }));
                    }
                }
                Ok(Some(Executed {
                    infos: result
                        .changes
                        .into_iter()
                        .map(|change| OperationInfo::Edit {
                            path: path.clone(),
                            from: change.from,
                            to: change.to,
                            content: change.content,
                            attributes: change.attributes,
                        })
                        .collect(),
                    reverse,
                    max_created_at_by_actor: Some(result.max_created_at_by_actor),
                }))
            }
            OperationKind::Style {
                from,
                to,
                attributes,
                max_created_at_by_actor,
            } => {
                let CrdtElement::Text(text) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "style on a {}",
                        parent.type_name()
                    )));
                };
                let (changes, max_created) = text.style(
                    from,
                    to,
                    attributes,
                    executed_at,
                    max_created_at_by_actor.as_ref(),
                )?;
                let path = root.create_path(&parent_ticket)?;
                Ok(Some(Executed {
                    infos: changes
                        .into_iter()
                        .map(|change| OperationInfo::Style {
                            path: path.clone(),
                            from: change.from,
                            to: change.to,
                            attributes: change.attributes,
                        })
                        .collect(),
                    reverse: Vec::new(),
                    max_created_at_by_actor: Some(max_created),
                }))
            }
            OperationKind::TreeEdit {
                from,
                to,
                contents,
                split_level,
                max_created_at_by_actor,
            } => {
                let CrdtElement::Tree(tree) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "tree edit on a {}",
                        parent.type_name()
                    )));
                };
                let result = tree.edit(
                    from,
                    to,
                    Some(contents.as_slice()),
                    *split_level,
                    executed_at,
                    max_created_at_by_actor.as_ref(),
                )?;
                if result.has_garbage {
                    root.register_gc_container(parent_ticket);
                }
                let path = root.create_path(&parent_ticket)?;
                let reverse = result
                    .reverse
                    .map(|reverse| {
                        self.reverse(OperationKind::TreeEdit {
                            from: reverse.from,
                            to: reverse.to,
                            contents: reverse.contents,
                            split_level: 0,
                            max_created_at_by_actor: None,
                        })
                    })
                    .into_iter()
                    .collect();
                Ok(Some(Executed {
                    infos: result
                        .changes
                        .into_iter()
                        .map(|change| OperationInfo::TreeEdit {
                            path: path.clone(),
                            from: change.from,
                            to: change.to,
                            from_path: change.from_path,
                            to_path: change.to_path,
                            value: change.value,
                            split_level: *split_level,
                        })
                        .collect(),
                    reverse,
                    max_created_at_by_actor: Some(result.max_created_at_by_actor),
                }))
            }
            OperationKind::TreeStyle {
                from,
                to,
                attributes,
                max_created_at_by_actor,
            } => {
                let CrdtElement::Tree(tree) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "tree style on a {}",
                        parent.type_name()
                    )));
                };
                let (changes, max_created) = tree.style(
                    from,
                    to,
                    attributes,
                    executed_at,
                    max_created_at_by_actor.as_ref(),
                )?;
                let path = root.create_path(&parent_ticket)?;
                Ok(Some(Executed {
                    infos: changes
                        .into_iter()
                        .map(|change| tree_style_info(&path, change))
                        .collect(),
                    reverse: Vec::new(),
                    max_created_at_by_actor: Some(max_created),
                }))
            }
            OperationKind::TreeRemoveStyle {
                from,
                to,
                attributes_to_remove,
                max_created_at_by_actor,
            } => {
                let CrdtElement::Tree(tree) = parent else {
                    return Err(Error::InvalidOperation(format!(
                        "tree style on a {}",
                        parent.type_name()
                    )));
                };
                let (changes, max_created) = tree.remove_style(
                    from,
                    to,
                    attributes_to_remove,
                    executed_at,
                    max_created_at_by_actor.as_ref(),
                )?;
                let path = root.create_path(&parent_ticket)?;
                Ok(Some(Executed {
                    infos: changes
                        .into_iter()
                        .map(|change| tree_style_info(&path, change))
                        .collect(),
                    reverse: Vec::new(),
                    max_created_at_by_actor: Some(max_created),
                }))
            }
        }
    }

    /// Give the values this operation creates fresh identities, recording each one in
    /// `renames`. Every re-inserted tree node gets a ticket of its own, so fragments of the
    /// original node that are still visible keep their ids.
    pub(crate) fn restamp(
        &mut self,
        issue: &mut dyn FnMut() -> Result<TimeTicket>,
        renames: &mut Renames,
    ) -> Result<()> {
        match &mut self.kind {
            OperationKind::Set { value, .. }
            | OperationKind::Add { value, .. }
            | OperationKind::ArraySet { value, .. } => value.restamp(issue, &mut renames.tickets),
            OperationKind::TreeEdit { contents, .. } => {
                let mut failure = None;
                for content in contents.iter_mut() {
                    content.for_each_mut(&mut |node| {
                        if failure.is_some() {
                            return;
                        }
                        match issue() {
                            Ok(ticket) => {
                                let new = TreeNodeId::new(ticket, 0);
                                renames.tree_nodes.push(TreeNodeRename {
                                    old: node.id,
                                    new,
                                    text_len: node.is_text().then(|| node.value.chars().count()),
                                });
                                node.id = new;
                            }
                            Err(err) => failure = Some(err),
                        }
                    });
                }
                failure.map_or(Ok(()), Err)
            }
            _ => Ok(()),
        }
    }

    /// Point references at re-issued identities.
    pub(crate) fn rename(&mut self, renames: &Renames) {
        renames.ticket(&mut self.parent_created_at);
        match &mut self.kind {
            OperationKind::Add {
                prev_created_at, ..
            } => renames.ticket(prev_created_at),
            OperationKind::Move {
                prev_created_at,
                created_at,
            } => {
                renames.ticket(prev_created_at);
                renames.ticket(created_at);
            }
            OperationKind::Remove { created_at } | OperationKind::ArraySet { created_at, .. } => {
                renames.ticket(created_at)
            }
            OperationKind::TreeEdit { from, to, .. }
            | OperationKind::TreeStyle { from, to, .. }
            | OperationKind::TreeRemoveStyle { from, to, .. } => {
                for pos in [from, to] {
                    renames.tree_node(&mut pos.parent_id);
                    renames.tree_node(&mut pos.left_sibling_id);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::object::CrdtObject;
    use crate::crdt::primitive::{Primitive, PrimitiveValue};

    fn t(lamport: u64) -> TimeTicket {
        TimeTicket::new(lamport, 0, ActorId([2; 12]))
    }

    fn text_value(value: &str, at: TimeTicket) -> CrdtElement {
        CrdtElement::Primitive(Primitive::new(PrimitiveValue::from(value), at))
    }

    #[test]
    fn set_reverse_restores_previous_value() {
        let mut root = CrdtRoot::default();
        let root_ticket = root.root_created_at();
        let first = Operation::new(
            root_ticket,
            t(1),
            OperationKind::Set {
                key: "k".into(),
                value: text_value("a", t(1)),
            },
        );
        let executed = first.execute(&mut root, OpSource::Local).unwrap().unwrap();
        let kinds: Vec<OperationKind> = executed.reverse.into_iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OperationKind::Remove { created_at: t(1) }]);

        let second = Operation::new(
            root_ticket,
            t(2),
            OperationKind::Set {
                key: "k".into(),
                value: text_value("b", t(2)),
            },
        );
        let executed = second.execute(&mut root, OpSource::Local).unwrap().unwrap();
        let reverse = executed.reverse.into_iter().next().unwrap();
        assert_eq!(reverse.executed_at, TimeTicket::INITIAL);
        match reverse.kind {
            OperationKind::Set { key, value } => {
                assert_eq!(key, "k");
                assert_eq!(value.created_at(), t(1));
            }
            other => panic!("unexpected reverse {}", other.name()),
        }
        assert_eq!(root.to_sorted_json(), r#"{"k":"b"}"#);
    }

    #[test]
    fn remote_execution_has_no_reverse() {
        let mut root = CrdtRoot::default();
        let op = Operation::new(
            root.root_created_at(),
            t(1),
            OperationKind::Set {
                key: "k".into(),
                value: text_value("a", t(1)),
            },
        );
        let executed = op.execute(&mut root, OpSource::Remote).unwrap().unwrap();
        assert!(executed.reverse.is_empty());
        assert_eq!(executed.infos[0].path(), "$");
    }

    #[test]
    fn missing_target_is_skipped_only_for_undo() {
        let mut root = CrdtRoot::new(CrdtObject::new(TimeTicket::INITIAL));
        let op = Operation::new(t(9), t(10), OperationKind::Remove { created_at: t(8) });
        assert!(matches!(
            op.execute(&mut root, OpSource::Remote),
            Err(Error::MissingDependency(_))
        ));
        assert!(op.execute(&mut root, OpSource::UndoRedo).unwrap().is_none());
    }

    #[test]
    fn rename_rewrites_references() {
        let mut op = Operation::new(
            t(1),
            TimeTicket::INITIAL,
            OperationKind::Move {
                prev_created_at: t(2),
                created_at: t(3),
            },
        );
        op.rename(&Renames {
            tickets: vec![(t(3), t(30)), (t(1), t(10))],
            tree_nodes: Vec::new(),
        });
        assert_eq!(op.parent_created_at, t(10));
        assert_eq!(
            op.kind,
            OperationKind::Move {
                prev_created_at: t(2),
                created_at: t(30)
            }
        );
    }

    #[test]
    fn tree_renames_only_move_positions_inside_the_reinserted_run() {
        let para = TreeNodeId::new(t(2), 0);
        let renames = Renames {
            tickets: Vec::new(),
            tree_nodes: vec![TreeNodeRename {
                old: TreeNodeId::new(t(3), 1),
                new: TreeNodeId::new(t(9), 0),
                text_len: Some(2),
            }],
        };
        let at = |offset| TreePos::new(para, TreeNodeId::new(t(3), offset));
        let mut op = Operation::new(
            t(1),
            TimeTicket::INITIAL,
            OperationKind::TreeEdit {
                from: at(1),
                to: at(3),
                contents: Vec::new(),
                split_level: 0,
                max_created_at_by_actor: None,
            },
        );
        op.rename(&renames);
        let OperationKind::TreeEdit { from, to, .. } = &op.kind else {
            panic!("unexpected kind {}", op.kind.name());
        };
        assert_eq!(*from, at(1));
        assert_eq!(to.left_sibling_id, TreeNodeId::new(t(9), 2));

        let mut after = Operation::new(
            t(1),
            TimeTicket::INITIAL,
            OperationKind::TreeStyle {
                from: at(4),
                to: at(4),
                attributes: BTreeMap::new(),
                max_created_at_by_actor: None,
            },
        );
        let untouched = after.clone();
        after.rename(&renames);
        assert_eq!(after, untouched);
    }
}
