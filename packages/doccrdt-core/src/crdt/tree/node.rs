use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::crdt::element::Tombstone;
use crate::crdt::rht::Rht;
use crate::error::Result;
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Node type marking text leaves.
pub const TEXT_TYPE: &str = "text";

/// Identity of a tree node. Text fragments produced by a split share `created_at` and differ
/// by the character `offset` they start at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreeNodeId {
    pub created_at: TimeTicket,
    pub offset: usize,
}

impl TreeNodeId {
    pub fn new(created_at: TimeTicket, offset: usize) -> Self {
        Self { created_at, offset }
    }
}

/// Node as supplied by callers and reported in change descriptors.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreeNode {
    pub node_type: String,
    pub value: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn element(node_type: impl Into<String>) -> Self {
        Self {
            node_type: node_type.into(),
            value: String::new(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            node_type: TEXT_TYPE.to_string(),
            value: value.into(),
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_children(mut self, children: Vec<TreeNode>) -> Self {
        self.children = children;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_text(&self) -> bool {
        self.node_type == TEXT_TYPE
    }

    pub fn to_json_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.node_type.clone()));
        if self.is_text() {
            map.insert("value".to_string(), Value::String(self.value.clone()));
            return Value::Object(map);
        }
        map.insert(
            "children".to_string(),
            Value::Array(self.children.iter().map(TreeNode::to_json_value).collect()),
        );
        if !self.attributes.is_empty() {
            let attrs = self
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            map.insert("attributes".to_string(), Value::Object(attrs));
        }
        Value::Object(map)
    }
}

/// A node together with the identities every replica will give it; the payload of tree edit
/// operations.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreeNodeSnapshot {
    pub id: TreeNodeId,
    pub node_type: String,
    pub value: String,
    pub attributes: BTreeMap<String, String>,
    pub children: Vec<TreeNodeSnapshot>,
}

impl TreeNodeSnapshot {
    /// Assign identities to `node` and its descendants in pre-order.
    pub fn issue<F>(node: &TreeNode, issue: &mut F) -> Result<Self>
    where
        F: FnMut() -> Result<TimeTicket>,
    {
        let id = TreeNodeId::new(issue()?, 0);
        let mut children = Vec::with_capacity(node.children.len());
        for child in &node.children {
            children.push(TreeNodeSnapshot::issue(child, &mut *issue)?);
        }
        Ok(Self {
            id,
            node_type: node.node_type.clone(),
            value: node.value.clone(),
            attributes: node.attributes.clone(),
            children,
        })
    }

    pub fn is_text(&self) -> bool {
        self.node_type == TEXT_TYPE
    }

    /// Visit every snapshot in the subtree, pre-order.
    pub(crate) fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut TreeNodeSnapshot)) {
        f(self);
        for child in &mut self.children {
            child.for_each_mut(f);
        }
    }
}

/// A node of the tree arena. Structure is expressed through ids only.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrdtTreeNode {
    pub(crate) id: TreeNodeId,
    pub(crate) node_type: String,
    pub(crate) value: String,
    pub(crate) parent: Option<TreeNodeId>,
    /// Children in document order, tombstones included.
    pub(crate) children: Vec<TreeNodeId>,
    pub(crate) removed_at: Option<TimeTicket>,
    pub(crate) ins_prev: Option<TreeNodeId>,
    pub(crate) ins_next: Option<TreeNodeId>,
    pub(crate) attributes: Rht,
    /// Text length for text nodes; sum of the padded sizes of visible children otherwise.
    pub(crate) size: usize,
}

impl CrdtTreeNode {
    pub(crate) fn new(id: TreeNodeId, node_type: String, value: String) -> Self {
        let size = if node_type == TEXT_TYPE {
            value.chars().count()
        } else {
            0
        };
        Self {
            id,
            node_type,
            value,
            parent: None,
            children: Vec::new(),
            removed_at: None,
            ins_prev: None,
            ins_next: None,
            attributes: Rht::new(),
            size,
        }
    }

    pub fn id(&self) -> TreeNodeId {
        self.id
    }

    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn parent(&self) -> Option<TreeNodeId> {
        self.parent
    }

    pub fn ins_prev(&self) -> Option<TreeNodeId> {
        self.ins_prev
    }

    pub fn attributes(&self) -> &Rht {
        &self.attributes
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_text(&self) -> bool {
        self.node_type == TEXT_TYPE
    }

    /// Size including the open and close tokens of an element.
    pub fn padded_size(&self) -> usize {
        if self.is_text() {
            self.size
        } else {
            self.size + 2
        }
    }

    /// Identity naming the position right after this node.
    pub fn anchor(&self) -> TreeNodeId {
        if self.is_text() {
            TreeNodeId::new(self.id.created_at, self.id.offset + self.size)
        } else {
            self.id
        }
    }

    pub(crate) fn can_delete(&self, edited_at: &TimeTicket, max_created_at: &TimeTicket) -> bool {
        !self.id.created_at.after(max_created_at)
            && self.removed_at.map_or(true, |removed_at| edited_at.after(&removed_at))
    }
}

impl Tombstone for CrdtTreeNode {
    fn removed_at(&self) -> Option<TimeTicket> {
        self.removed_at
    }

    fn set_removed_at(&mut self, removed_at: Option<TimeTicket>) {
        self.removed_at = removed_at;
    }
}
