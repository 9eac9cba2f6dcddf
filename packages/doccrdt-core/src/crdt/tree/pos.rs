use std::collections::BTreeMap;

use crate::crdt::tree::node::{TreeNode, TreeNodeId};
use crate::ids::ActorId;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Position relative to content: right after `left_sibling_id` inside `parent_id`.
/// `left_sibling_id == parent_id` denotes the leftmost slot of the parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreePos {
    pub parent_id: TreeNodeId,
    pub left_sibling_id: TreeNodeId,
}

impl TreePos {
    pub fn new(parent_id: TreeNodeId, left_sibling_id: TreeNodeId) -> Self {
        Self {
            parent_id,
            left_sibling_id,
        }
    }
}

/// Position in the visible tree: inside `node` at child offset `offset`, or at character
/// `offset` when `node` is text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct TreePosition {
    pub node: TreeNodeId,
    pub offset: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TreeChangeKind {
    Content,
    Style,
    RemoveStyle,
}

/// A visible change, expressed as a range over visible indices and paths.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreeChange {
    pub kind: TreeChangeKind,
    pub from: usize,
    pub to: usize,
    pub from_path: Vec<usize>,
    pub to_path: Vec<usize>,
    pub actor: ActorId,
    pub value: Option<Vec<TreeNode>>,
    pub attributes: BTreeMap<String, String>,
    pub attributes_to_remove: Vec<String>,
}

impl TreeChange {
    pub(crate) fn content(
        from: usize,
        to: usize,
        from_path: Vec<usize>,
        to_path: Vec<usize>,
        actor: ActorId,
    ) -> Self {
        Self {
            kind: TreeChangeKind::Content,
            from,
            to,
            from_path,
            to_path,
            actor,
            value: None,
            attributes: BTreeMap::new(),
            attributes_to_remove: Vec::new(),
        }
    }
}
