//! Hierarchical replicated tree.
//!
//! Nodes live in an arena keyed by [`TreeNodeId`]. Parent, children and split-chain links are
//! stored as ids. Removed nodes stay in their parent's child list until garbage collection so
//! positions recorded against an older state still resolve.
//!
//! Every node caches its visible size: a text node counts its characters and an element counts
//! the padded sizes of its visible children. The padded size of an element adds one token for
//! the open tag and one for the close tag, which gives the flat index space edits address.

mod node;
mod pos;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde_json::Value;
use tracing::trace;

use crate::crdt::element::{ElementMeta, Tombstone};
use crate::crdt::rht::escape_xml;
use crate::crdt::{max_created_at_for, record_created_at};
use crate::error::{Error, Result};
use crate::ids::{ActorId, TimeTicket};

use pos::TreePosition;

pub use node::{CrdtTreeNode, TreeNode, TreeNodeId, TreeNodeSnapshot, TEXT_TYPE};
pub use pos::{TreeChange, TreeChangeKind, TreePos};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TokenKind {
    Start,
    Text,
    End,
}

/// A node boundary or text run inside an index range.
#[derive(Clone, Copy, Debug)]
struct Token {
    id: TreeNodeId,
    kind: TokenKind,
    /// Element tokens: whether the opposite tag lies in the range too.
    paired: bool,
    from: usize,
    to: usize,
}

/// Edit that undoes a tree edit: delete `from..to`, then insert `contents` at `from`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreeEditReverse {
    pub from: TreePos,
    pub to: TreePos,
    pub contents: Vec<TreeNodeSnapshot>,
}

/// Result of [`CrdtTree::edit`].
#[derive(Clone, Debug)]
pub struct TreeEdit {
    pub changes: Vec<TreeChange>,
    pub max_created_at_by_actor: HashMap<ActorId, TimeTicket>,
    pub has_garbage: bool,
    /// Absent when nothing visible changed or the edited parent was already removed.
    pub reverse: Option<TreeEditReverse>,
}

/// Children of `container` that an edit splitting or merging elements rewrites. Undoing such
/// an edit replaces whatever ends up in that span with the snapshots taken before it.
struct ReplacedSpan {
    container: TreeNodeId,
    /// Anchor right before the span.
    left: TreeNodeId,
    /// Last child covered before the edit, if the span was not empty.
    last: Option<TreeNodeId>,
    before: HashSet<TreeNodeId>,
    contents: Vec<TreeNodeSnapshot>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrdtTree {
    pub(crate) meta: ElementMeta,
    root_id: TreeNodeId,
    nodes: BTreeMap<TreeNodeId, CrdtTreeNode>,
}

impl CrdtTree {
    pub fn new(created_at: TimeTicket, root: &TreeNodeSnapshot) -> Result<Self> {
        if root.is_text() {
            return Err(Error::InvalidOperation(
                "tree root must be an element node".to_string(),
            ));
        }
        let mut tree = Self {
            meta: ElementMeta::new(created_at),
            root_id: root.id,
            nodes: BTreeMap::new(),
        };
        tree.build(root)?;
        Ok(tree)
    }

    pub fn root_id(&self) -> TreeNodeId {
        self.root_id
    }

    /// Visible size of the root's content.
    pub fn size(&self) -> usize {
        self.nodes.get(&self.root_id).map_or(0, |root| root.size)
    }

    pub fn get(&self, id: &TreeNodeId) -> Option<&CrdtTreeNode> {
        self.nodes.get(id)
    }

    /// Every node in id order, tombstones included.
    pub fn nodes(&self) -> impl Iterator<Item = &CrdtTreeNode> {
        self.nodes.values()
    }

    fn node(&self, id: &TreeNodeId) -> Result<&CrdtTreeNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::MissingDependency(format!("tree node {:?}", id)))
    }

    fn node_mut(&mut self, id: &TreeNodeId) -> Result<&mut CrdtTreeNode> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::MissingDependency(format!("tree node {:?}", id)))
    }

    /// `id` followed by its ancestors up to the root.
    fn ancestors(&self, id: &TreeNodeId) -> Result<Vec<TreeNodeId>> {
        let mut chain = vec![*id];
        let mut current = self.node(id)?.parent;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.node(&parent)?.parent;
        }
        Ok(chain)
    }

    fn parent_of(&self, id: &TreeNodeId) -> Result<TreeNodeId> {
        self.node(id)?
            .parent
            .ok_or_else(|| Error::InconsistentState(format!("tree node {:?} is detached", id)))
    }

    /// Node with the same `created_at` whose offset is the greatest not above `id.offset`.
    fn find_floor(&self, id: &TreeNodeId) -> Option<TreeNodeId> {
        self.nodes
            .range(..=*id)
            .next_back()
            .map(|(found, _)| *found)
            .filter(|found| found.created_at == id.created_at)
    }

    fn child_index(&self, parent: &TreeNodeId, child: &TreeNodeId) -> Result<usize> {
        self.node(parent)?
            .children
            .iter()
            .position(|candidate| candidate == child)
            .ok_or_else(|| {
                Error::InconsistentState(format!("{:?} is not a child of {:?}", child, parent))
            })
    }

    fn visible_children(&self, id: &TreeNodeId) -> Result<Vec<TreeNodeId>> {
        Ok(self
            .node(id)?
            .children
            .iter()
            .copied()
            .filter(|child| self.nodes.get(child).map_or(false, |n| !n.is_removed()))
            .collect())
    }

    /// Number of visible children before `child`; for a removed child this is the slot it
    /// would occupy.
    fn find_offset(&self, parent: &TreeNodeId, child: &TreeNodeId) -> Result<usize> {
        let mut offset = 0;
        for id in &self.node(parent)?.children {
            if id == child {
                return Ok(offset);
            }
            if !self.node(id)?.is_removed() {
                offset += 1;
            }
        }
        Err(Error::InconsistentState(format!(
            "{:?} is not a child of {:?}",
            child, parent
        )))
    }

    fn padded_size_before(&self, parent: &TreeNodeId, child: &TreeNodeId) -> Result<usize> {
        let mut size = 0;
        for id in &self.node(parent)?.children {
            if id == child {
                return Ok(size);
            }
            let node = self.node(id)?;
            if !node.is_removed() {
                size += node.padded_size();
            }
        }
        Err(Error::InconsistentState(format!(
            "{:?} is not a child of {:?}",
            child, parent
        )))
    }

    /// Add `delta` to the size of `start` and its ancestors. A removed node is not counted by
    /// its parent, so propagation stops there.
    fn adjust_size(&mut self, start: TreeNodeId, delta: isize) -> Result<()> {
        let mut current = Some(start);
        while let Some(id) = current {
            let node = self.node_mut(&id)?;
            node.size = node.size.saturating_add_signed(delta);
            if node.is_removed() {
                break;
            }
            current = node.parent;
        }
        Ok(())
    }

    fn attach(&mut self, parent: TreeNodeId, index: usize, child: TreeNodeId) -> Result<()> {
        let (alive, padded) = {
            let node = self.node_mut(&child)?;
            node.parent = Some(parent);
            (!node.is_removed(), node.padded_size())
        };
        let parent_node = self.node_mut(&parent)?;
        let index = index.min(parent_node.children.len());
        parent_node.children.insert(index, child);
        if alive {
            self.adjust_size(parent, padded as isize)?;
        }
        Ok(())
    }

    fn detach(&mut self, child: TreeNodeId) -> Result<()> {
        let (parent, alive, padded) = {
            let node = self.node_mut(&child)?;
            (node.parent.take(), !node.is_removed(), node.padded_size())
        };
        let Some(parent) = parent else {
            return Ok(());
        };
        self.node_mut(&parent)?.children.retain(|id| *id != child);
        if alive {
            self.adjust_size(parent, -(padded as isize))?;
        }
        Ok(())
    }

    fn remove_node(&mut self, id: TreeNodeId, removed_at: TimeTicket) -> Result<bool> {
        let node = self.node_mut(&id)?;
        let padded = node.padded_size();
        let parent = node.parent;
        if !node.remove(removed_at) {
            return Ok(false);
        }
        if let Some(parent) = parent {
            self.adjust_size(parent, -(padded as isize))?;
        }
        Ok(true)
    }

    /// Insert `snapshot` and its descendants into the arena, unattached. Returns the id of the
    /// subtree root.
    fn build(&mut self, snapshot: &TreeNodeSnapshot) -> Result<TreeNodeId> {
        if self.nodes.contains_key(&snapshot.id) {
            return Err(Error::InvalidOperation(format!(
                "tree node {:?} already exists",
                snapshot.id
            )));
        }
        if snapshot.is_text() && !snapshot.children.is_empty() {
            return Err(Error::InvalidOperation(
                "text nodes cannot have children".to_string(),
            ));
        }

        let mut node = CrdtTreeNode::new(
            snapshot.id,
            snapshot.node_type.clone(),
            snapshot.value.clone(),
        );
        for (key, value) in &snapshot.attributes {
            node.attributes.set(key, value, snapshot.id.created_at);
        }
        self.nodes.insert(snapshot.id, node);
        self.link_fragment(snapshot.id)?;

        let mut size = 0;
        let mut children = Vec::with_capacity(snapshot.children.len());
        for child in &snapshot.children {
            let child_id = self.build(child)?;
            let child_node = self.node_mut(&child_id)?;
            child_node.parent = Some(snapshot.id);
            size += child_node.padded_size();
            children.push(child_id);
        }
        if !snapshot.is_text() {
            let node = self.node_mut(&snapshot.id)?;
            node.size = size;
            node.children = children;
        }
        Ok(snapshot.id)
    }

    /// Fragments sharing a `created_at` form one split chain.
    fn link_fragment(&mut self, id: TreeNodeId) -> Result<()> {
        if id.offset == 0 {
            return Ok(());
        }
        let Some(prev) = self
            .nodes
            .range(..id)
            .next_back()
            .map(|(found, _)| *found)
            .filter(|found| found.created_at == id.created_at)
        else {
            return Ok(());
        };
        let next = self.node_mut(&prev)?.ins_next.replace(id);
        if let Some(next) = next {
            self.node_mut(&next)?.ins_prev = Some(id);
        }
        let node = self.node_mut(&id)?;
        node.ins_prev = Some(prev);
        node.ins_next = next;
        Ok(())
    }

    fn split_text(&mut self, id: TreeNodeId, offset: usize) -> Result<()> {
        let node = self.node_mut(&id)?;
        if offset == 0 || offset >= node.value.chars().count() {
            return Ok(());
        }
        let at = node
            .value
            .char_indices()
            .nth(offset)
            .map(|(i, _)| i)
            .unwrap_or(node.value.len());
        let right_value = node.value.split_off(at);
        node.size = offset;

        let right_id = TreeNodeId::new(id.created_at, id.offset + offset);
        let mut right = CrdtTreeNode::new(right_id, node.node_type.clone(), right_value);
        right.removed_at = node.removed_at;
        right.parent = node.parent;
        right.attributes = node.attributes.clone();
        right.ins_prev = Some(id);
        right.ins_next = node.ins_next.replace(right_id);
        let parent = node.parent;

        if let Some(next) = right.ins_next {
            self.node_mut(&next)?.ins_prev = Some(right_id);
        }
        self.nodes.insert(right_id, right);
        if let Some(parent) = parent {
            let index = self.child_index(&parent, &id)?;
            self.node_mut(&parent)?.children.insert(index + 1, right_id);
        }
        Ok(())
    }

    /// Move the children from `offset` (over all children) into a new sibling `split_id`
    /// placed right after `id`.
    fn split_element(&mut self, id: TreeNodeId, offset: usize, split_id: TreeNodeId) -> Result<()> {
        if self.nodes.contains_key(&split_id) {
            return Err(Error::InvalidOperation(format!(
                "tree node {:?} already exists",
                split_id
            )));
        }
        let node = self.node_mut(&id)?;
        let parent = node
            .parent
            .ok_or_else(|| Error::InvalidOperation("the tree root cannot be split".to_string()))?;
        let at = offset.min(node.children.len());
        let moved = node.children.split_off(at);

        let mut split = CrdtTreeNode::new(split_id, node.node_type.clone(), String::new());
        split.removed_at = node.removed_at;
        split.attributes = node.attributes.clone();
        split.ins_prev = Some(id);
        split.ins_next = node.ins_next.replace(split_id);
        if let Some(next) = split.ins_next {
            self.node_mut(&next)?.ins_prev = Some(split_id);
        }
        self.nodes.insert(split_id, split);
        let index = self.child_index(&parent, &id)?;
        self.attach(parent, index + 1, split_id)?;

        let mut moved_size = 0;
        for child in &moved {
            let child = self.node_mut(child)?;
            child.parent = Some(split_id);
            if !child.is_removed() {
                moved_size += child.padded_size();
            }
        }
        let node = self.node_mut(&id)?;
        node.size = node.size.saturating_sub(moved_size);
        let split = self.node_mut(&split_id)?;
        split.size += moved_size;
        split.children = moved;
        Ok(())
    }

    fn to_tree_node_pair(&self, pos: &TreePos) -> Result<(TreeNodeId, TreeNodeId)> {
        let parent = self
            .find_floor(&pos.parent_id)
            .ok_or_else(|| Error::MissingDependency(format!("tree parent {:?}", pos.parent_id)))?;
        let mut left = self.find_floor(&pos.left_sibling_id).ok_or_else(|| {
            Error::MissingDependency(format!("tree left sibling {:?}", pos.left_sibling_id))
        })?;

        // A boundary between two fragments belongs to the left one.
        if pos.left_sibling_id != pos.parent_id
            && pos.left_sibling_id.offset > 0
            && pos.left_sibling_id.offset == left.offset
        {
            if let Some(prev) = self.node(&left)?.ins_prev {
                left = prev;
            }
        }
        Ok((parent, left))
    }

    /// Resolve `pos` to `(parent, left)`, splitting the text node it points into. Siblings
    /// inserted concurrently after `edited_at` are skipped so they stay on the left.
    fn find_nodes_and_split_text(
        &mut self,
        pos: &TreePos,
        edited_at: TimeTicket,
    ) -> Result<(TreeNodeId, TreeNodeId)> {
        let (parent, mut left) = self.to_tree_node_pair(pos)?;
        let leftmost = parent == left;
        let real_parent = if leftmost {
            parent
        } else {
            self.node(&left)?.parent.unwrap_or(parent)
        };

        if !leftmost && self.node(&left)?.is_text() {
            let offset = pos.left_sibling_id.offset.saturating_sub(left.offset);
            self.split_text(left, offset)?;
        }

        let mut parent = real_parent;
        let mut start = if leftmost {
            0
        } else {
            self.child_index(&real_parent, &left)? + 1
        };
        loop {
            let node = self.node(&parent)?;
            let mut reached_end = true;
            for next in &node.children[start.min(node.children.len())..] {
                if !next.created_at.after(&edited_at) {
                    reached_end = false;
                    break;
                }
                left = *next;
            }
            // Content after `left` was moved into a fragment split off concurrently.
            match node.ins_next {
                Some(next) if reached_end && next.created_at.after(&edited_at) => {
                    parent = next;
                    left = next;
                    start = 0;
                }
                _ => return Ok((parent, left)),
            }
        }
    }

    fn to_tree_position(&self, parent: TreeNodeId, left: TreeNodeId) -> Result<TreePosition> {
        if self.node(&parent)?.is_removed() {
            let mut child = parent;
            let mut current = self.parent_of(&parent)?;
            while self.node(&current)?.is_removed() {
                child = current;
                current = self.parent_of(&current)?;
            }
            return Ok(TreePosition {
                node: current,
                offset: self.find_offset(&current, &child)?,
            });
        }
        if parent == left {
            return Ok(TreePosition {
                node: parent,
                offset: 0,
            });
        }

        let left_node = self.node(&left)?;
        let mut offset = self.find_offset(&parent, &left)?;
        if !left_node.is_removed() {
            if left_node.is_text() {
                return Ok(TreePosition {
                    node: left,
                    offset: left_node.size,
                });
            }
            offset += 1;
        }
        Ok(TreePosition {
            node: parent,
            offset,
        })
    }

    fn index_of(&self, pos: TreePosition) -> Result<usize> {
        let mut current = pos.node;
        let mut size = 0;
        let mut depth = 1;

        let node = self.node(&current)?;
        if node.is_text() {
            let parent = self.parent_of(&current)?;
            size += pos.offset + self.padded_size_before(&parent, &current)?;
            current = parent;
        } else {
            for child in self.visible_children(&current)?.iter().take(pos.offset) {
                size += self.node(child)?.padded_size();
            }
        }

        while let Some(parent) = self.node(&current)?.parent {
            size += self.padded_size_before(&parent, &current)?;
            depth += 1;
            current = parent;
        }
        Ok(size + depth - 1)
    }

    fn tree_pos_to_path(&self, pos: TreePosition) -> Result<Vec<usize>> {
        let mut path = Vec::new();
        let mut current = pos.node;
        if self.node(&current)?.is_text() {
            let parent = self.parent_of(&current)?;
            path.push(self.padded_size_before(&parent, &current)? + pos.offset);
            current = parent;
        } else {
            path.push(pos.offset);
        }
        while let Some(parent) = self.node(&current)?.parent {
            path.push(self.find_offset(&parent, &current)?);
            current = parent;
        }
        path.reverse();
        Ok(path)
    }

    fn find_tree_pos(&self, id: TreeNodeId, index: usize, prefer_text: bool) -> Result<TreePosition> {
        let node = self.node(&id)?;
        if index > node.size {
            return Err(Error::InvalidOperation(format!(
                "tree index {index} out of range {}",
                node.size
            )));
        }
        if node.is_text() {
            return Ok(TreePosition {
                node: id,
                offset: index,
            });
        }

        let mut offset = 0;
        let mut pos = 0;
        for child_id in self.visible_children(&id)? {
            let child = self.node(&child_id)?;
            let remaining = index - pos;
            if prefer_text && child.is_text() && child.size >= remaining {
                return self.find_tree_pos(child_id, remaining, prefer_text);
            }
            if remaining == 0 {
                return Ok(TreePosition { node: id, offset });
            }
            if !prefer_text && child.padded_size() == remaining {
                return Ok(TreePosition {
                    node: id,
                    offset: offset + 1,
                });
            }
            if child.padded_size() > remaining {
                let inner = if child.is_text() { remaining } else { remaining - 1 };
                return self.find_tree_pos(child_id, inner, prefer_text);
            }
            pos += child.padded_size();
            offset += 1;
        }
        Ok(TreePosition { node: id, offset })
    }

    fn from_tree_position(&self, pos: TreePosition) -> Result<TreePos> {
        let node = self.node(&pos.node)?;
        if node.is_text() {
            let parent = self.parent_of(&pos.node)?;
            if pos.offset > 0 {
                let left = TreeNodeId::new(node.id.created_at, node.id.offset + pos.offset);
                return Ok(TreePos::new(parent, left));
            }
            let index = self.child_index(&parent, &pos.node)?;
            let left = match index.checked_sub(1) {
                Some(prev) => {
                    let prev = self.node(&parent)?.children[prev];
                    self.node(&prev)?.anchor()
                }
                None => parent,
            };
            return Ok(TreePos::new(parent, left));
        }

        if pos.offset == 0 {
            return Ok(TreePos::new(pos.node, pos.node));
        }
        let children = self.visible_children(&pos.node)?;
        let left = children.get(pos.offset - 1).ok_or_else(|| {
            Error::InvalidOperation(format!("child offset {} out of range", pos.offset))
        })?;
        Ok(TreePos::new(pos.node, self.node(left)?.anchor()))
    }

    fn path_to_tree_position(&self, path: &[usize]) -> Result<TreePosition> {
        let (last, parents) = path
            .split_last()
            .ok_or_else(|| Error::InvalidOperation("empty tree path".to_string()))?;
        let mut current = self.root_id;
        for index in parents {
            current = *self
                .visible_children(&current)?
                .get(*index)
                .ok_or_else(|| Error::InvalidOperation(format!("invalid tree path {:?}", path)))?;
        }

        let children = self.visible_children(&current)?;
        let has_text = children
            .iter()
            .any(|child| self.nodes.get(child).map_or(false, CrdtTreeNode::is_text));
        if has_text {
            if *last > self.node(&current)?.size {
                return Err(Error::InvalidOperation(format!("invalid tree path {:?}", path)));
            }
            let mut remaining = *last;
            for child in children {
                let size = self.node(&child)?.size;
                if size < remaining {
                    remaining -= size;
                } else {
                    return Ok(TreePosition {
                        node: child,
                        offset: remaining,
                    });
                }
            }
            return Ok(TreePosition {
                node: current,
                offset: remaining,
            });
        }

        if children.len() < *last {
            return Err(Error::InvalidOperation(format!("invalid tree path {:?}", path)));
        }
        Ok(TreePosition {
            node: current,
            offset: *last,
        })
    }

    fn to_index(&self, parent: TreeNodeId, left: TreeNodeId) -> Result<usize> {
        self.index_of(self.to_tree_position(parent, left)?)
    }

    fn to_path(&self, parent: TreeNodeId, left: TreeNodeId) -> Result<Vec<usize>> {
        self.tree_pos_to_path(self.to_tree_position(parent, left)?)
    }

    /// Position of a visible index. Indices inside a text run resolve into the text.
    pub fn find_pos(&self, index: usize) -> Result<TreePos> {
        self.from_tree_position(self.find_tree_pos(self.root_id, index, true)?)
    }

    pub fn index_range_to_pos_range(&self, from: usize, to: usize) -> Result<(TreePos, TreePos)> {
        if from > to {
            return Err(Error::InvalidOperation(format!(
                "tree range from {from} is after to {to}"
            )));
        }
        let from_pos = self.find_pos(from)?;
        if from == to {
            return Ok((from_pos, from_pos));
        }
        Ok((from_pos, self.find_pos(to)?))
    }

    pub fn index_to_path(&self, index: usize) -> Result<Vec<usize>> {
        self.tree_pos_to_path(self.find_tree_pos(self.root_id, index, true)?)
    }

    pub fn path_to_index(&self, path: &[usize]) -> Result<usize> {
        self.index_of(self.path_to_tree_position(path)?)
    }

    pub fn path_to_pos(&self, path: &[usize]) -> Result<TreePos> {
        self.from_tree_position(self.path_to_tree_position(path)?)
    }

    fn collect_tokens(
        &self,
        id: &TreeNodeId,
        from: isize,
        to: isize,
        base: usize,
        out: &mut Vec<Token>,
    ) -> Result<()> {
        let mut pos: isize = 0;
        for child_id in self.visible_children(id)? {
            let child = self.node(&child_id)?;
            let padded = child.padded_size() as isize;
            if from - padded < pos && pos < to {
                let start = base + pos as usize;
                if child.is_text() {
                    out.push(Token {
                        id: child_id,
                        kind: TokenKind::Text,
                        paired: true,
                        from: start,
                        to: start + child.size,
                    });
                } else {
                    let from_child = from - pos - 1;
                    let to_child = to - pos - 1;
                    let start_contained = from_child < 0;
                    let end_contained = to_child > child.size as isize;
                    if start_contained {
                        out.push(Token {
                            id: child_id,
                            kind: TokenKind::Start,
                            paired: end_contained,
                            from: start,
                            to: start + 1,
                        });
                    }
                    self.collect_tokens(
                        &child_id,
                        from_child.max(0),
                        to_child.min(child.size as isize),
                        start + 1,
                        out,
                    )?;
                    if end_contained {
                        let end = start + child.padded_size();
                        out.push(Token {
                            id: child_id,
                            kind: TokenKind::End,
                            paired: start_contained,
                            from: end - 1,
                            to: end,
                        });
                    }
                }
            }
            pos += padded;
        }
        Ok(())
    }

    fn tokens_between(&self, from: usize, to: usize) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        if from < to {
            self.collect_tokens(&self.root_id, from as isize, to as isize, 0, &mut tokens)?;
        }
        Ok(tokens)
    }

    /// Replace the content between `from` and `to` with `contents`, splitting `split_level`
    /// enclosing elements at `from`.
    ///
    /// With `max_created_at_by_actor` set (remote edits) only nodes the editor had seen are
    /// deleted. Change indices and paths are expressed against the tree before the edit and
    /// listed right to left, so applying them in order keeps each one valid.
    pub fn edit(
        &mut self,
        from: &TreePos,
        to: &TreePos,
        contents: Option<&[TreeNodeSnapshot]>,
        split_level: u32,
        edited_at: TimeTicket,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    ) -> Result<TreeEdit> {
        let actor = edited_at.actor;
        let (from_parent, from_left) = self.find_nodes_and_split_text(from, edited_at)?;
        let (to_parent, to_left) = self.find_nodes_and_split_text(to, edited_at)?;
        let from_idx = self.to_index(from_parent, from_left)?;
        let from_path = self.to_path(from_parent, from_left)?;
        let to_idx = self.to_index(to_parent, to_left)?;
        let tokens = self.tokens_between(from_idx, to_idx)?;

        let mut removing: Vec<TreeNodeId> = Vec::new();
        let mut removing_set: HashSet<TreeNodeId> = HashSet::new();
        let mut to_move: Vec<TreeNodeId> = Vec::new();
        let mut deleted: Vec<(usize, usize)> = Vec::new();
        let mut max_created = HashMap::new();
        let mut balanced = true;

        for token in &tokens {
            let node = self.node(&token.id)?;
            let max = max_created_at_for(max_created_at_by_actor, &token.id.created_at.actor);
            if !token.id.created_at.after(&max) {
                record_created_at(&mut max_created, token.id.created_at);
            }
            if !token.paired {
                balanced = false;
            }
            let parent_removing = node.parent.map_or(false, |p| removing_set.contains(&p));
            if !node.can_delete(&edited_at, &max) && !parent_removing {
                continue;
            }
            if token.kind == TokenKind::Start && !token.paired {
                to_move.extend(self.visible_children(&token.id)?);
            }
            if token.kind != TokenKind::End && removing_set.insert(token.id) {
                removing.push(token.id);
            }
            deleted.push((token.from, token.to));
        }

        let from_parent_alive = !self.node(&from_parent)?.is_removed();
        let mut top_removed = Vec::new();
        for id in &removing {
            let parent = self.node(id)?.parent;
            if !parent.map_or(false, |p| removing_set.contains(&p)) {
                top_removed.push((*id, parent));
            }
        }
        let reversible = split_level == 0
            && balanced
            && from_parent_alive
            && top_removed
                .iter()
                .all(|(_, parent)| *parent == Some(from_parent));
        let mut removed_contents = Vec::new();
        let mut span = None;
        if reversible {
            for (id, _) in &top_removed {
                removed_contents.push(self.snapshot(id)?);
            }
        } else if from_parent_alive {
            span = self.replaced_span(
                (from_parent, from_left),
                (to_parent, to_left),
                split_level,
                !to_move.is_empty(),
            )?;
        }

        deleted.sort_unstable();
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for (start, end) in deleted {
            match runs.last_mut() {
                Some(last) if last.1 == start => last.1 = end,
                _ => runs.push((start, end)),
            }
        }
        let mut changes = Vec::with_capacity(runs.len() + 1);
        for (start, end) in runs.into_iter().rev() {
            changes.push(TreeChange::content(
                start,
                end,
                self.index_to_path(start)?,
                self.index_to_path(end)?,
                actor,
            ));
        }

        let mut has_garbage = false;
        for id in &removing {
            has_garbage |= self.remove_node(*id, edited_at)?;
        }

        for id in to_move {
            if self.node(&id)?.is_removed() {
                continue;
            }
            self.detach(id)?;
            let end = self.node(&from_parent)?.children.len();
            self.attach(from_parent, end, id)?;
        }

        if split_level > 0 {
            let mut parent = from_parent;
            let mut left = from_left;
            let mut split = false;
            for level in 1..=split_level {
                let Some(grand_parent) = self.node(&parent)?.parent else {
                    break;
                };
                let offset = if left == parent {
                    0
                } else {
                    self.child_index(&parent, &left)? + 1
                };
                let delimiter = edited_at
                    .delimiter
                    .checked_add(level)
                    .ok_or(Error::ClockOverflow)?;
                let split_id = TreeNodeId::new(edited_at.with_delimiter(delimiter), 0);
                self.split_element(parent, offset, split_id)?;
                split = true;
                left = parent;
                parent = grand_parent;
            }
            if split {
                changes.push(TreeChange::content(
                    from_idx,
                    from_idx,
                    from_path.clone(),
                    from_path.clone(),
                    actor,
                ));
            }
        }

        let mut inserted = Vec::new();
        if let Some(contents) = contents.filter(|contents| !contents.is_empty()) {
            let mut index = if from_left == from_parent {
                0
            } else {
                self.child_index(&from_parent, &from_left)? + 1
            };
            let mut values = Vec::with_capacity(contents.len());
            for content in contents {
                let id = self.build(content)?;
                if !from_parent_alive {
                    let mut subtree = Vec::new();
                    self.collect_subtree(&id, &mut subtree)?;
                    for node_id in subtree {
                        self.node_mut(&node_id)?.remove(edited_at);
                    }
                    has_garbage = true;
                }
                self.attach(from_parent, index, id)?;
                index += 1;
                inserted.push(id);
                if from_parent_alive {
                    values.push(self.to_tree_node(&id)?);
                }
            }

            if !values.is_empty() {
                match changes.last_mut() {
                    Some(last) if last.from == from_idx => last.value = Some(values),
                    _ => {
                        let mut change = TreeChange::content(
                            from_idx,
                            from_idx,
                            from_path.clone(),
                            from_path,
                            actor,
                        );
                        change.value = Some(values);
                        changes.push(change);
                    }
                }
            }
        }

        let reverse = if reversible && (!removed_contents.is_empty() || !inserted.is_empty()) {
            let from_anchor = if from_left == from_parent {
                from_parent
            } else {
                self.node(&from_left)?.anchor()
            };
            let from_pos = TreePos::new(from_parent, from_anchor);
            let to_pos = match inserted.last() {
                Some(id) => TreePos::new(from_parent, self.node(id)?.anchor()),
                None => from_pos,
            };
            Some(TreeEditReverse {
                from: from_pos,
                to: to_pos,
                contents: removed_contents,
            })
        } else if let Some(span) = span {
            self.span_reverse(span)?
        } else {
            None
        };

        trace!(
            changes = changes.len(),
            removed = removing.len(),
            inserted = inserted.len(),
            "tree edit applied"
        );
        Ok(TreeEdit {
            changes,
            max_created_at_by_actor: max_created,
            has_garbage,
            reverse,
        })
    }

    /// The span of children an edit rewrites: children of the nearest element that holds both
    /// ends of the range and every element the edit splits. Called before anything is
    /// removed.
    fn replaced_span(
        &self,
        (from_parent, from_left): (TreeNodeId, TreeNodeId),
        (to_parent, to_left): (TreeNodeId, TreeNodeId),
        split_level: u32,
        moves_to_end: bool,
    ) -> Result<Option<ReplacedSpan>> {
        let from_chain = self.ancestors(&from_parent)?;
        let to_chain = self.ancestors(&to_parent)?;
        let common = from_chain
            .iter()
            .position(|id| to_chain.contains(id))
            .ok_or_else(|| {
                Error::InconsistentState("tree range ends share no ancestor".to_string())
            })?;
        let split_top = (split_level as usize).min(from_chain.len() - 1);
        let level = common.max(split_top);
        let container = from_chain[level];
        if self.node(&container)?.is_removed() {
            return Ok(None);
        }

        let children = self.node(&container)?.children.clone();
        let first = if level > 0 {
            self.child_index(&container, &from_chain[level - 1])?
        } else if from_left == container {
            0
        } else {
            self.child_index(&container, &from_left)? + 1
        };
        let mut last = if to_parent == container {
            if to_left == container {
                None
            } else {
                Some(self.child_index(&container, &to_left)?)
            }
        } else {
            let below = to_chain
                .iter()
                .position(|id| *id == container)
                .and_then(|index| index.checked_sub(1))
                .map(|index| to_chain[index])
                .ok_or_else(|| {
                    Error::InconsistentState(format!("{:?} is not above the range end", container))
                })?;
            Some(self.child_index(&container, &below)?)
        };
        // Children of merged elements end up at the back of the container.
        if level == 0 && moves_to_end {
            last = children.len().checked_sub(1);
        }
        let last = last.filter(|last| *last >= first);

        let mut contents = Vec::new();
        if let Some(last) = last {
            for id in &children[first..=last] {
                if !self.node(id)?.is_removed() {
                    contents.push(self.snapshot(id)?);
                }
            }
        }
        let left = match first.checked_sub(1) {
            Some(prev) => self.node(&children[prev])?.anchor(),
            None => container,
        };
        Ok(Some(ReplacedSpan {
            container,
            left,
            last: last.map(|index| children[index]),
            before: children.into_iter().collect(),
            contents,
        }))
    }

    /// Reverse of an edit that rewrote `span`: everything from the span's left anchor through
    /// the rightmost child the edit touched or created is replaced with the old snapshots.
    fn span_reverse(&self, span: ReplacedSpan) -> Result<Option<TreeEditReverse>> {
        let right = self
            .node(&span.container)?
            .children
            .iter()
            .rev()
            .find(|id| span.last == Some(**id) || !span.before.contains(*id))
            .copied();
        let Some(right) = right else {
            return Ok(None);
        };
        Ok(Some(TreeEditReverse {
            from: TreePos::new(span.container, span.left),
            to: TreePos::new(span.container, self.node(&right)?.anchor()),
            contents: span.contents,
        }))
    }

    /// Visible element nodes between `from` and `to` that the editor had seen.
    fn styled_nodes(
        &mut self,
        from: &TreePos,
        to: &TreePos,
        edited_at: TimeTicket,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    ) -> Result<(Vec<TreeNodeId>, HashMap<ActorId, TimeTicket>)> {
        let (from_parent, from_left) = self.find_nodes_and_split_text(from, edited_at)?;
        let (to_parent, to_left) = self.find_nodes_and_split_text(to, edited_at)?;
        let from_idx = self.to_index(from_parent, from_left)?;
        let to_idx = self.to_index(to_parent, to_left)?;

        let mut seen = HashSet::new();
        let mut targets = Vec::new();
        let mut max_created = HashMap::new();
        for token in self.tokens_between(from_idx, to_idx)? {
            if token.kind == TokenKind::Text || !seen.insert(token.id) {
                continue;
            }
            let node = self.node(&token.id)?;
            let max = max_created_at_for(max_created_at_by_actor, &token.id.created_at.actor);
            if node.is_text() || node.is_removed() || token.id.created_at.after(&max) {
                continue;
            }
            record_created_at(&mut max_created, token.id.created_at);
            targets.push(token.id);
        }
        Ok((targets, max_created))
    }

    fn style_change(&self, id: &TreeNodeId, kind: TreeChangeKind) -> Result<TreeChange> {
        let parent = self.parent_of(id)?;
        let siblings = self.visible_children(&parent)?;
        let prev = siblings
            .iter()
            .position(|sibling| sibling == id)
            .and_then(|index| index.checked_sub(1))
            .map_or(parent, |index| siblings[index]);
        Ok(TreeChange {
            kind,
            from: self.to_index(parent, prev)?,
            to: self.to_index(*id, *id)?,
            from_path: self.to_path(parent, prev)?,
            to_path: self.to_path(*id, *id)?,
            actor: ActorId::INITIAL,
            value: None,
            attributes: BTreeMap::new(),
            attributes_to_remove: Vec::new(),
        })
    }

    /// Set `attributes` on every element in range. One change is reported per element whose
    /// attributes actually changed.
    pub fn style(
        &mut self,
        from: &TreePos,
        to: &TreePos,
        attributes: &BTreeMap<String, String>,
        edited_at: TimeTicket,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    ) -> Result<(Vec<TreeChange>, HashMap<ActorId, TimeTicket>)> {
        let (targets, max_created) = self.styled_nodes(from, to, edited_at, max_created_at_by_actor)?;
        let mut changes = Vec::new();
        for id in targets {
            let node = self.node_mut(&id)?;
            let mut applied = BTreeMap::new();
            for (key, value) in attributes {
                if node.attributes.set(key, value, edited_at) {
                    applied.insert(key.clone(), value.clone());
                }
            }
            if applied.is_empty() {
                continue;
            }
            let mut change = self.style_change(&id, TreeChangeKind::Style)?;
            change.actor = edited_at.actor;
            change.attributes = applied;
            changes.push(change);
        }
        Ok((changes, max_created))
    }

    pub fn remove_style(
        &mut self,
        from: &TreePos,
        to: &TreePos,
        keys: &[String],
        edited_at: TimeTicket,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    ) -> Result<(Vec<TreeChange>, HashMap<ActorId, TimeTicket>)> {
        let (targets, max_created) = self.styled_nodes(from, to, edited_at, max_created_at_by_actor)?;
        let mut changes = Vec::new();
        for id in targets {
            let node = self.node_mut(&id)?;
            let removed: Vec<String> = keys
                .iter()
                .filter(|key| node.attributes.remove(key, edited_at).is_some())
                .cloned()
                .collect();
            if removed.is_empty() {
                continue;
            }
            let mut change = self.style_change(&id, TreeChangeKind::RemoveStyle)?;
            change.actor = edited_at.actor;
            change.attributes_to_remove = removed;
            changes.push(change);
        }
        Ok((changes, max_created))
    }

    fn collect_subtree(&self, id: &TreeNodeId, out: &mut Vec<TreeNodeId>) -> Result<()> {
        out.push(*id);
        for child in &self.node(id)?.children {
            self.collect_subtree(child, out)?;
        }
        Ok(())
    }

    /// Visible subtree rooted at `id`, ids included.
    fn snapshot(&self, id: &TreeNodeId) -> Result<TreeNodeSnapshot> {
        let node = self.node(id)?;
        let mut children = Vec::new();
        for child in self.visible_children(id)? {
            children.push(self.snapshot(&child)?);
        }
        Ok(TreeNodeSnapshot {
            id: node.id,
            node_type: node.node_type.clone(),
            value: node.value.clone(),
            attributes: node.attributes.to_map(),
            children,
        })
    }

    pub fn to_tree_node(&self, id: &TreeNodeId) -> Result<TreeNode> {
        let node = self.node(id)?;
        let mut children = Vec::new();
        for child in self.visible_children(id)? {
            children.push(self.to_tree_node(&child)?);
        }
        Ok(TreeNode {
            node_type: node.node_type.clone(),
            value: node.value.clone(),
            attributes: node.attributes.to_map(),
            children,
        })
    }

    pub fn to_xml(&self) -> String {
        self.node_to_xml(&self.root_id)
    }

    fn node_to_xml(&self, id: &TreeNodeId) -> String {
        let Some(node) = self.nodes.get(id) else {
            return String::new();
        };
        if node.is_text() {
            return escape_xml(&node.value);
        }
        let children: String = node
            .children
            .iter()
            .filter(|child| self.nodes.get(child).map_or(false, |n| !n.is_removed()))
            .map(|child| self.node_to_xml(child))
            .collect();
        format!(
            "<{}{}>{}</{}>",
            node.node_type,
            node.attributes.to_xml(),
            children,
            node.node_type
        )
    }

    pub fn to_json_value(&self) -> Value {
        self.to_tree_node(&self.root_id)
            .map(|root| root.to_json_value())
            .unwrap_or(Value::Null)
    }

    /// Removed nodes that can be dropped: removed at or before `safe`, every child droppable
    /// too, and not the split origin of a visible fragment.
    fn collectable(&self, safe: &TimeTicket) -> BTreeSet<TreeNodeId> {
        let mut set: BTreeSet<TreeNodeId> = self
            .nodes
            .values()
            .filter(|node| node.id != self.root_id)
            .filter(|node| node.removed_at.map_or(false, |at| at <= *safe))
            .map(|node| node.id)
            .collect();
        loop {
            let mut excluded: Vec<TreeNodeId> = set
                .iter()
                .copied()
                .filter(|id| {
                    self.nodes
                        .get(id)
                        .map_or(true, |node| node.children.iter().any(|c| !set.contains(c)))
                })
                .collect();
            excluded.extend(
                self.nodes
                    .values()
                    .filter(|node| !node.is_removed())
                    .filter_map(|node| node.ins_prev)
                    .filter(|prev| set.contains(prev)),
            );
            if excluded.is_empty() {
                return set;
            }
            for id in excluded {
                set.remove(&id);
            }
        }
    }

    pub fn garbage_len(&self, safe: &TimeTicket) -> usize {
        self.collectable(safe).len()
    }

    pub fn purge_removed(&mut self, safe: &TimeTicket) -> usize {
        let doomed = self.collectable(safe);
        for id in &doomed {
            let Some(node) = self.nodes.remove(id) else {
                continue;
            };
            if let Some(prev) = node.ins_prev.and_then(|p| self.nodes.get_mut(&p)) {
                prev.ins_next = node.ins_next;
            }
            if let Some(next) = node.ins_next.and_then(|n| self.nodes.get_mut(&n)) {
                next.ins_prev = node.ins_prev;
            }
            if let Some(parent) = node.parent.and_then(|p| self.nodes.get_mut(&p)) {
                parent.children.retain(|child| child != id);
            }
        }
        doomed.len()
    }
}
