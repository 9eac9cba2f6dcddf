//! Changes: the atomic unit of local mutation and of sync exchange.
//!
//! A [`ChangeContext`] is handed to the updater passed to
//! [`Document::update`](crate::Document::update). Every mutation made through it is
//! recorded as an [`Operation`] and applied to the document's staging root right away, so
//! later calls in the same updater observe earlier ones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::crdt::array::CrdtArray;
use crate::crdt::counter::{CounterValue, CrdtCounter};
use crate::crdt::element::CrdtElement;
use crate::crdt::object::CrdtObject;
use crate::crdt::primitive::{Primitive, PrimitiveValue};
use crate::crdt::root::CrdtRoot;
use crate::crdt::text::CrdtText;
use crate::crdt::tree::{CrdtTree, TreeNode, TreeNodeSnapshot, TreePos};
use crate::error::{Error, Result};
use crate::ids::{ActorId, ChangeId, Checkpoint, Lamport, TimeTicket};
use crate::operation::{OpSource, Operation, OperationInfo, OperationKind};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Ephemeral per-actor state shared next to the document.
pub type Presence = BTreeMap<String, serde_json::Value>;

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PresenceChange {
    Put(Presence),
    Clear,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Change {
    pub id: ChangeId,
    pub message: Option<String>,
    pub operations: Vec<Operation>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub presence_change: Option<PresenceChange>,
}

impl Change {
    /// Apply every operation in order, stopping at the first failure.
    pub fn execute(&self, root: &mut CrdtRoot, source: OpSource) -> Result<Vec<OperationInfo>> {
        let mut infos = Vec::new();
        for op in &self.operations {
            if let Some(executed) = op.execute(root, source)? {
                infos.extend(executed.infos);
            }
        }
        Ok(infos)
    }
}

/// Full document state, sent instead of changes when a client lags too far behind.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Snapshot {
    pub root: CrdtObject,
    pub presences: BTreeMap<ActorId, Presence>,
    /// Highest lamport contained in the snapshot.
    pub lamport: Lamport,
}

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ChangePack {
    pub document_key: String,
    pub checkpoint: Checkpoint,
    pub changes: Vec<Change>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub snapshot: Option<Snapshot>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub is_removed: bool,
    /// Ticket every peer has seen; tombstones at or before it can be collected.
    #[cfg_attr(feature = "serde", serde(default))]
    pub min_synced_ticket: Option<TimeTicket>,
}

impl ChangePack {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }
}

/// Initial content of an element created inside an update.
#[derive(Clone, Debug, PartialEq)]
pub enum ElementInit {
    Primitive(PrimitiveValue),
    Object(BTreeMap<String, ElementInit>),
    Array(Vec<ElementInit>),
    /// An empty text; content is added with [`ChangeContext::edit_text`].
    Text,
    Counter(CounterValue),
    Tree(TreeNode),
}

impl ElementInit {
    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, ElementInit)>) -> Self {
        ElementInit::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn array(items: impl IntoIterator<Item = ElementInit>) -> Self {
        ElementInit::Array(items.into_iter().collect())
    }
}

macro_rules! primitive_init {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ElementInit {
            fn from(value: $ty) -> Self {
                ElementInit::Primitive(PrimitiveValue::from(value))
            }
        })*
    };
}

primitive_init!(bool, i32, i64, f64, &str, String, Vec<u8>, DateTime<Utc>);

impl From<PrimitiveValue> for ElementInit {
    fn from(value: PrimitiveValue) -> Self {
        ElementInit::Primitive(value)
    }
}

impl From<CounterValue> for ElementInit {
    fn from(value: CounterValue) -> Self {
        ElementInit::Counter(value)
    }
}

impl From<TreeNode> for ElementInit {
    fn from(root: TreeNode) -> Self {
        ElementInit::Tree(root)
    }
}

/// Collects the operations of one local change.
pub struct ChangeContext<'a> {
    id: ChangeId,
    root: &'a mut CrdtRoot,
    delimiter: u32,
    operations: Vec<Operation>,
    reverse_operations: Vec<Operation>,
    presence_change: Option<PresenceChange>,
}

/// Parts of a finished [`ChangeContext`].
pub(crate) struct ContextOutput {
    pub operations: Vec<Operation>,
    /// Reverse operations in the order they must be replayed.
    pub reverse_operations: Vec<Operation>,
    pub presence_change: Option<PresenceChange>,
}

impl<'a> ChangeContext<'a> {
    pub(crate) fn new(id: ChangeId, root: &'a mut CrdtRoot) -> Self {
        Self {
            id,
            root,
            delimiter: 0,
            operations: Vec::new(),
            reverse_operations: Vec::new(),
            presence_change: None,
        }
    }

    pub fn id(&self) -> &ChangeId {
        &self.id
    }

    /// The document as mutated so far by this change.
    pub fn root(&self) -> &CrdtRoot {
        &*self.root
    }

    pub fn root_created_at(&self) -> TimeTicket {
        self.root.root_created_at()
    }

    /// Creation ticket of the visible element at `path`, e.g. `$.todos.0`.
    pub fn resolve(&self, path: &str) -> Result<TimeTicket> {
        self.root
            .find_by_path(path)
            .map(CrdtElement::created_at)
            .ok_or_else(|| Error::MissingDependency(format!("path {path}")))
    }

    pub fn has_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    pub(crate) fn issue_time_ticket(&mut self) -> Result<TimeTicket> {
        self.delimiter = self.delimiter.checked_add(1).ok_or(Error::ClockOverflow)?;
        Ok(self.id.create_time_ticket(self.delimiter))
    }

    fn reserve_delimiters(&mut self, count: u32) -> Result<()> {
        self.delimiter = self
            .delimiter
            .checked_add(count)
            .ok_or(Error::ClockOverflow)?;
        Ok(())
    }

    fn create_element(&mut self, init: ElementInit) -> Result<CrdtElement> {
        let created_at = self.issue_time_ticket()?;
        Ok(match init {
            ElementInit::Primitive(value) => CrdtElement::Primitive(Primitive::new(value, created_at)),
            ElementInit::Object(entries) => {
                let mut object = CrdtObject::new(created_at);
                for (key, init) in entries {
                    let child = self.create_element(init)?;
                    let at = child.created_at();
                    object.set(&key, child, at);
                }
                CrdtElement::Object(object)
            }
            ElementInit::Array(items) => {
                let mut array = CrdtArray::new(created_at);
                for init in items {
                    let child = self.create_element(init)?;
                    let at = child.created_at();
                    let prev = array.elements().last_created_at();
                    array.insert_after(&prev, child, at)?;
                }
                CrdtElement::Array(array)
            }
            ElementInit::Text => CrdtElement::Text(CrdtText::new(created_at)),
            ElementInit::Counter(value) => CrdtElement::Counter(CrdtCounter::new(value, created_at)),
            ElementInit::Tree(root) => {
                let snapshot = TreeNodeSnapshot::issue(&root, &mut || self.issue_time_ticket())?;
                CrdtElement::Tree(CrdtTree::new(created_at, &snapshot)?)
            }
        })
    }

    /// Execute `op` on the staging root and record it. Returns `false` when a replayed
    /// operation was skipped.
    pub(crate) fn push(&mut self, mut op: Operation, source: OpSource) -> Result<bool> {
        let Some(executed) = op.execute(&mut *self.root, source)? else {
            return Ok(false);
        };
        if let Some(max_created_at_by_actor) = executed.max_created_at_by_actor {
            op.set_max_created_at_by_actor(max_created_at_by_actor);
        }
        // Stored backwards so `finish` can flip the whole list into replay order.
        self.reverse_operations
            .extend(executed.reverse.into_iter().rev());
        self.operations.push(op);
        Ok(true)
    }

    pub(crate) fn finish(self) -> ContextOutput {
        let mut reverse_operations = self.reverse_operations;
        reverse_operations.reverse();
        ContextOutput {
            operations: self.operations,
            reverse_operations,
            presence_change: self.presence_change,
        }
    }

    fn push_local(&mut self, parent: TimeTicket, executed_at: TimeTicket, kind: OperationKind) -> Result<()> {
        self.push(Operation::new(parent, executed_at, kind), OpSource::Local)
            .map(|_| ())
    }

    /// Set `key` of the object `parent`. Returns the new element's creation ticket.
    pub fn set(
        &mut self,
        parent: TimeTicket,
        key: &str,
        value: impl Into<ElementInit>,
    ) -> Result<TimeTicket> {
        let value = self.create_element(value.into())?;
        let created_at = value.created_at();
        self.push_local(
            parent,
            created_at,
            OperationKind::Set {
                key: key.to_string(),
                value,
            },
        )?;
        Ok(created_at)
    }

    /// Append to the array `parent`.
    pub fn push_back(&mut self, parent: TimeTicket, value: impl Into<ElementInit>) -> Result<TimeTicket> {
        let prev = match self.root.find(&parent) {
            Some(CrdtElement::Array(array)) => array.elements().last_created_at(),
            Some(other) => {
                return Err(Error::InvalidOperation(format!(
                    "push on a {}",
                    other.type_name()
                )))
            }
            None => return Err(Error::MissingDependency(format!("array {parent}"))),
        };
        self.insert_after(parent, prev, value)
    }

    /// Insert into the array `parent` after `prev` (`TimeTicket::INITIAL` for the front).
    pub fn insert_after(
        &mut self,
        parent: TimeTicket,
        prev: TimeTicket,
        value: impl Into<ElementInit>,
    ) -> Result<TimeTicket> {
        let value = self.create_element(value.into())?;
        let created_at = value.created_at();
        self.push_local(
            parent,
            created_at,
            OperationKind::Add {
                prev_created_at: prev,
                value,
            },
        )?;
        Ok(created_at)
    }

    pub fn move_after(&mut self, parent: TimeTicket, prev: TimeTicket, created_at: TimeTicket) -> Result<()> {
        let executed_at = self.issue_time_ticket()?;
        self.push_local(
            parent,
            executed_at,
            OperationKind::Move {
                prev_created_at: prev,
                created_at,
            },
        )
    }

    /// Remove the child `created_at` of the object or array `parent`.
    pub fn remove(&mut self, parent: TimeTicket, created_at: TimeTicket) -> Result<()> {
        let executed_at = self.issue_time_ticket()?;
        self.push_local(parent, executed_at, OperationKind::Remove { created_at })
    }

    /// Replace the array element `created_at` in place.
    pub fn array_set(
        &mut self,
        parent: TimeTicket,
        created_at: TimeTicket,
        value: impl Into<ElementInit>,
    ) -> Result<TimeTicket> {
        let value = self.create_element(value.into())?;
        let new_created_at = value.created_at();
        self.push_local(parent, new_created_at, OperationKind::ArraySet { created_at, value })?;
        Ok(new_created_at)
    }

    pub fn increase(&mut self, counter: TimeTicket, value: i64) -> Result<()> {
        let executed_at = self.issue_time_ticket()?;
        self.push_local(counter, executed_at, OperationKind::Increase { value })
    }

    fn text(&self, created_at: &TimeTicket) -> Result<&CrdtText> {
        match self.root.find(created_at) {
            Some(CrdtElement::Text(text)) => Ok(text),
            Some(other) => Err(Error::InvalidOperation(format!(
                "expected a text, found a {}",
                other.type_name()
            ))),
            None => Err(Error::MissingDependency(format!("text {created_at}"))),
        }
    }

    fn tree(&self, created_at: &TimeTicket) -> Result<&CrdtTree> {
        match self.root.find(created_at) {
            Some(CrdtElement::Tree(tree)) => Ok(tree),
            Some(other) => Err(Error::InvalidOperation(format!(
                "expected a tree, found a {}",
                other.type_name()
            ))),
            None => Err(Error::MissingDependency(format!("tree {created_at}"))),
        }
    }

    /// Replace the characters `from..to` of a text with `content`.
    pub fn edit_text(
        &mut self,
        text: TimeTicket,
        from: usize,
        to: usize,
        content: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<()> {
        let (from_pos, to_pos) = self.text(&text)?.index_range_to_pos_range(from, to)?;
        let executed_at = self.issue_time_ticket()?;
        self.push_local(
            text,
            executed_at,
            OperationKind::Edit {
                from: from_pos,
                to: to_pos,
                content: content.to_string(),
                attributes,
                max_created_at_by_actor: None,
            },
        )
    }

    pub fn style_text(
        &mut self,
        text: TimeTicket,
        from: usize,
        to: usize,
        attributes: BTreeMap<String, String>,
    ) -> Result<()> {
        if from >= to {
            return Err(Error::InvalidOperation(format!(
                "style range {from}..{to} is empty"
            )));
        }
        let (from_pos, to_pos) = self.text(&text)?.index_range_to_pos_range(from, to)?;
        let executed_at = self.issue_time_ticket()?;
        self.push_local(
            text,
            executed_at,
            OperationKind::Style {
                from: from_pos,
                to: to_pos,
                attributes,
                max_created_at_by_actor: None,
            },
        )
    }

    /// Replace the tree content between the visible indexes `from` and `to` with `contents`,
    /// splitting `split_level` enclosing elements at `from`.
    pub fn edit_tree(
        &mut self,
        tree: TimeTicket,
        from: usize,
        to: usize,
        contents: Vec<TreeNode>,
        split_level: u32,
    ) -> Result<()> {
        let (from_pos, to_pos) = self.tree(&tree)?.index_range_to_pos_range(from, to)?;
        self.edit_tree_at(tree, from_pos, to_pos, contents, split_level)
    }

    /// [`edit_tree`](Self::edit_tree) addressed by index paths from the tree root.
    pub fn edit_tree_by_path(
        &mut self,
        tree: TimeTicket,
        from_path: &[usize],
        to_path: &[usize],
        contents: Vec<TreeNode>,
        split_level: u32,
    ) -> Result<()> {
        let target = self.tree(&tree)?;
        let from_pos = target.path_to_pos(from_path)?;
        let to_pos = target.path_to_pos(to_path)?;
        self.edit_tree_at(tree, from_pos, to_pos, contents, split_level)
    }

    fn edit_tree_at(
        &mut self,
        tree: TimeTicket,
        from: TreePos,
        to: TreePos,
        contents: Vec<TreeNode>,
        split_level: u32,
    ) -> Result<()> {
        validate_tree_contents(&contents)?;
        let mut snapshots = Vec::with_capacity(contents.len());
        for node in &contents {
            snapshots.push(TreeNodeSnapshot::issue(node, &mut || self.issue_time_ticket())?);
        }
        let executed_at = self.issue_time_ticket()?;
        // Split elements take the edit ticket with the following delimiters.
        self.reserve_delimiters(split_level)?;
        self.push_local(
            tree,
            executed_at,
            OperationKind::TreeEdit {
                from,
                to,
                contents: snapshots,
                split_level,
                max_created_at_by_actor: None,
            },
        )
    }

    pub fn style_tree(
        &mut self,
        tree: TimeTicket,
        from: usize,
        to: usize,
        attributes: BTreeMap<String, String>,
    ) -> Result<()> {
        let (from_pos, to_pos) = self.tree(&tree)?.index_range_to_pos_range(from, to)?;
        let executed_at = self.issue_time_ticket()?;
        self.push_local(
            tree,
            executed_at,
            OperationKind::TreeStyle {
                from: from_pos,
                to: to_pos,
                attributes,
                max_created_at_by_actor: None,
            },
        )
    }

    pub fn remove_style_tree(
        &mut self,
        tree: TimeTicket,
        from: usize,
        to: usize,
        attributes_to_remove: Vec<String>,
    ) -> Result<()> {
        let (from_pos, to_pos) = self.tree(&tree)?.index_range_to_pos_range(from, to)?;
        let executed_at = self.issue_time_ticket()?;
        self.push_local(
            tree,
            executed_at,
            OperationKind::TreeRemoveStyle {
                from: from_pos,
                to: to_pos,
                attributes_to_remove,
                max_created_at_by_actor: None,
            },
        )
    }

    pub fn set_presence(&mut self, presence: Presence) {
        self.presence_change = Some(PresenceChange::Put(presence));
    }

    pub fn clear_presence(&mut self) {
        self.presence_change = Some(PresenceChange::Clear);
    }
}

/// Inserted tree content is either all text or all elements, and text nodes are never empty.
fn validate_tree_contents(contents: &[TreeNode]) -> Result<()> {
    let texts = contents.iter().filter(|node| node.is_text()).count();
    if texts != 0 && texts != contents.len() {
        return Err(Error::InvalidOperation(
            "tree contents mix text and element nodes".to_string(),
        ));
    }
    let mut stack: Vec<&TreeNode> = contents.iter().collect();
    while let Some(node) = stack.pop() {
        if node.is_text() && node.value.is_empty() {
            return Err(Error::InvalidOperation("empty text node".to_string()));
        }
        stack.extend(node.children.iter());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change_id() -> ChangeId {
        ChangeId {
            client_seq: 1,
            server_seq: None,
            lamport: 7,
            actor: ActorId([3; 12]),
        }
    }

    #[test]
    fn nested_values_take_consecutive_delimiters() {
        let mut root = CrdtRoot::default();
        let mut ctx = ChangeContext::new(change_id(), &mut root);
        let parent = ctx.root_created_at();
        let list = ctx
            .set(parent, "list", ElementInit::array([1i32.into(), 2i32.into()]))
            .unwrap();
        assert_eq!(list.delimiter, 1);
        assert_eq!(list.lamport, 7);
        let second = ctx.resolve("$.list.1").unwrap();
        assert_eq!(second.delimiter, 3);

        let out = ctx.finish();
        assert_eq!(out.operations.len(), 1);
        assert_eq!(out.reverse_operations.len(), 1);
        assert_eq!(root.to_sorted_json(), r#"{"list":[1,2]}"#);
    }

    #[test]
    fn tree_edit_reserves_split_delimiters() {
        let mut root = CrdtRoot::default();
        let mut ctx = ChangeContext::new(change_id(), &mut root);
        let parent = ctx.root_created_at();
        let tree = ctx
            .set(
                parent,
                "t",
                TreeNode::element("r").with_children(vec![
                    TreeNode::element("p").with_children(vec![TreeNode::text("ab")])
                ]),
            )
            .unwrap();
        ctx.edit_tree(tree, 2, 2, Vec::new(), 1).unwrap();
        let after = ctx.issue_time_ticket().unwrap();
        // tree, r, p, "ab" take 1..=4; the edit takes 5 and reserves 6.
        assert_eq!(after.delimiter, 7);
    }

    #[test]
    fn mixed_tree_contents_are_rejected() {
        let contents = vec![TreeNode::text("a"), TreeNode::element("p")];
        assert!(matches!(
            validate_tree_contents(&contents),
            Err(Error::InvalidOperation(_))
        ));
        assert!(validate_tree_contents(&[TreeNode::text("")]).is_err());
    }

    #[test]
    fn unknown_path_is_a_missing_dependency() {
        let mut root = CrdtRoot::default();
        let ctx = ChangeContext::new(change_id(), &mut root);
        assert!(matches!(
            ctx.resolve("$.nope"),
            Err(Error::MissingDependency(_))
        ));
    }
}
