//! Replicated growable array whose nodes can be split at a character offset.
//!
//! Nodes are kept in document order in a `Vec`, and in a `BTreeMap` keyed by
//! [`RgaSplitNodeId`] so a position can be resolved with a floor lookup. Splitting a node keeps
//! the left half under the original id; the right half gets `(created_at, offset + k)` and is
//! linked to it through `ins_prev`/`ins_next`. Visible-index lookups scan the order vector and
//! are O(n).

use std::collections::{BTreeMap, HashMap};

use crate::crdt::element::Tombstone;
use crate::crdt::{max_created_at_for, record_created_at};
use crate::error::{Error, Result};
use crate::ids::{ActorId, TimeTicket};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Payload of a split node.
pub trait SplitValue: Clone + Default {
    /// Length in the units positions count in.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep `[0, offset)` in `self` and return the remainder.
    fn split_off(&mut self, offset: usize) -> Self;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RgaSplitNodeId {
    pub created_at: TimeTicket,
    pub offset: usize,
}

impl RgaSplitNodeId {
    pub const HEAD: RgaSplitNodeId = RgaSplitNodeId {
        created_at: TimeTicket::INITIAL,
        offset: 0,
    };

    pub fn new(created_at: TimeTicket, offset: usize) -> Self {
        Self { created_at, offset }
    }
}

/// A position inside the node `id`, `relative_offset` units past its start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RgaSplitPos {
    pub id: RgaSplitNodeId,
    pub relative_offset: usize,
}

impl RgaSplitPos {
    pub fn new(id: RgaSplitNodeId, relative_offset: usize) -> Self {
        Self {
            id,
            relative_offset,
        }
    }

    pub fn absolute_id(&self) -> RgaSplitNodeId {
        RgaSplitNodeId::new(self.id.created_at, self.id.offset + self.relative_offset)
    }
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RgaSplitNode<V> {
    id: RgaSplitNodeId,
    value: V,
    removed_at: Option<TimeTicket>,
    ins_prev: Option<RgaSplitNodeId>,
    ins_next: Option<RgaSplitNodeId>,
}

impl<V: SplitValue> RgaSplitNode<V> {
    fn new(id: RgaSplitNodeId, value: V) -> Self {
        Self {
            id,
            value,
            removed_at: None,
            ins_prev: None,
            ins_next: None,
        }
    }

    pub fn id(&self) -> RgaSplitNodeId {
        self.id
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn ins_prev(&self) -> Option<RgaSplitNodeId> {
        self.ins_prev
    }

    fn visible_len(&self) -> usize {
        if self.is_removed() {
            0
        } else {
            self.value.len()
        }
    }
}

impl<V> Tombstone for RgaSplitNode<V> {
    fn removed_at(&self) -> Option<TimeTicket> {
        self.removed_at
    }

    fn set_removed_at(&mut self, removed_at: Option<TimeTicket>) {
        self.removed_at = removed_at;
    }
}

/// One contiguous visible change, in coordinates valid after the preceding changes applied.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitChange<V> {
    pub from: usize,
    pub to: usize,
    pub value: Option<V>,
}

/// Outcome of [`RgaTreeSplit::edit`].
#[derive(Clone, Debug)]
pub struct SplitEdit<V> {
    pub changes: Vec<SplitChange<V>>,
    pub max_created_at_by_actor: HashMap<ActorId, TimeTicket>,
    /// Values that became invisible, in document order.
    pub removed_values: Vec<V>,
    /// Whether tombstones were created.
    pub has_garbage: bool,
    /// Position right after the node the edit was anchored to.
    pub from_anchor: RgaSplitPos,
    /// End of the inserted node, if anything was inserted.
    pub inserted_end: Option<RgaSplitPos>,
}

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RgaTreeSplit<V> {
    order: Vec<RgaSplitNodeId>,
    nodes: BTreeMap<RgaSplitNodeId, RgaSplitNode<V>>,
}

impl<V: SplitValue> Default for RgaTreeSplit<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: SplitValue> RgaTreeSplit<V> {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            RgaSplitNodeId::HEAD,
            RgaSplitNode::new(RgaSplitNodeId::HEAD, V::default()),
        );
        Self {
            order: vec![RgaSplitNodeId::HEAD],
            nodes,
        }
    }

    fn node(&self, id: &RgaSplitNodeId) -> Result<&RgaSplitNode<V>> {
        self.nodes
            .get(id)
            .ok_or_else(|| Error::InconsistentState(format!("split node {:?} missing", id)))
    }

    fn node_mut(&mut self, id: &RgaSplitNodeId) -> Result<&mut RgaSplitNode<V>> {
        self.nodes
            .get_mut(id)
            .ok_or_else(|| Error::InconsistentState(format!("split node {:?} missing", id)))
    }

    fn index_in_order(&self, id: &RgaSplitNodeId) -> Result<usize> {
        self.order
            .iter()
            .position(|candidate| candidate == id)
            .ok_or_else(|| Error::InconsistentState(format!("split node {:?} not ordered", id)))
    }

    fn visible_len_before(&self, order_index: usize) -> usize {
        self.order[..order_index]
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(RgaSplitNode::visible_len)
            .sum()
    }

    fn find_floor(&self, id: &RgaSplitNodeId) -> Option<RgaSplitNodeId> {
        self.nodes
            .range(..=*id)
            .next_back()
            .map(|(found, _)| *found)
            .filter(|found| found.created_at == id.created_at)
    }

    /// Floor lookup that resolves an exact split boundary to the node on its left.
    fn find_floor_prefer_left(&self, id: &RgaSplitNodeId) -> Result<RgaSplitNodeId> {
        let found = self
            .find_floor(id)
            .ok_or_else(|| Error::MissingDependency(format!("text position {:?}", id)))?;
        if id.offset > 0 && found.offset == id.offset {
            if let Some(prev) = self.node(&found)?.ins_prev {
                return Ok(prev);
            }
        }
        Ok(found)
    }

    fn split_node(&mut self, id: RgaSplitNodeId, offset: usize) -> Result<()> {
        let index = self.index_in_order(&id)?;
        let node = self.node_mut(&id)?;
        if offset == 0 || offset >= node.value.len() {
            return Ok(());
        }

        let right_id = RgaSplitNodeId::new(id.created_at, id.offset + offset);
        let right = RgaSplitNode {
            id: right_id,
            value: node.value.split_off(offset),
            removed_at: node.removed_at,
            ins_prev: Some(id),
            ins_next: node.ins_next,
        };
        let old_next = node.ins_next.replace(right_id);
        if let Some(next) = old_next {
            self.node_mut(&next)?.ins_prev = Some(right_id);
        }
        self.order.insert(index + 1, right_id);
        self.nodes.insert(right_id, right);
        Ok(())
    }

    /// Split at `pos` and return `(left, right)` around it, skipping nodes inserted
    /// concurrently after `edited_at` so they stay on the left.
    pub fn find_node_with_split(
        &mut self,
        pos: &RgaSplitPos,
        edited_at: TimeTicket,
    ) -> Result<(RgaSplitNodeId, Option<RgaSplitNodeId>)> {
        let absolute = pos.absolute_id();
        let node = self.find_floor_prefer_left(&absolute)?;
        let relative = absolute.offset.saturating_sub(node.offset);
        self.split_node(node, relative)?;

        let mut index = self.index_in_order(&node)?;
        while index + 1 < self.order.len() && self.order[index + 1].created_at.after(&edited_at)
        {
            index += 1;
        }
        Ok((self.order[index], self.order.get(index + 1).copied()))
    }

    /// Range of order indexes strictly after `left` and before `right`.
    fn between(&self, left: &RgaSplitNodeId, right: Option<&RgaSplitNodeId>) -> Result<(usize, usize)> {
        let start = self.index_in_order(left)? + 1;
        let end = match right {
            Some(id) => self.index_in_order(id)?,
            None => self.order.len(),
        };
        Ok((start, end.max(start)))
    }

    /// Delete the content between `from` and `to`, then insert `value` there.
    ///
    /// With `max_created_at_by_actor` set (remote edits) only nodes the editor had seen are
    /// deleted; `None` means every node is known.
    pub fn edit(
        &mut self,
        from: &RgaSplitPos,
        to: &RgaSplitPos,
        edited_at: TimeTicket,
        value: Option<V>,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    ) -> Result<SplitEdit<V>> {
        let (_, to_right) = self.find_node_with_split(to, edited_at)?;
        let (from_left, _) = self.find_node_with_split(from, edited_at)?;
        let (start, end) = self.between(&from_left, to_right.as_ref())?;

        let mut changes: Vec<SplitChange<V>> = Vec::new();
        let mut max_created = HashMap::new();
        let mut removed_values = Vec::new();
        let mut has_garbage = false;
        let mut index = self.visible_len_before(start);
        let mut shift = 0;
        let mut run: Option<(usize, usize)> = None;

        let candidates: Vec<RgaSplitNodeId> = self.order[start..end].to_vec();
        for id in candidates {
            let known = !id
                .created_at
                .after(&max_created_at_for(max_created_at_by_actor, &id.created_at.actor));
            let node = self.node_mut(&id)?;
            let len = node.value.len();
            if !known {
                index += node.visible_len();
                continue;
            }
            record_created_at(&mut max_created, id.created_at);
            if node.is_removed() {
                node.remove(edited_at);
                continue;
            }

            removed_values.push(node.value.clone());
            node.remove(edited_at);
            has_garbage = true;
            run = match run {
                Some((run_from, run_to)) if run_to == index => Some((run_from, run_to + len)),
                Some((run_from, run_to)) => {
                    changes.push(SplitChange {
                        from: run_from - shift,
                        to: run_to - shift,
                        value: None,
                    });
                    shift += run_to - run_from;
                    Some((index, index + len))
                }
                None => Some((index, index + len)),
            };
            index += len;
        }
        if let Some((run_from, run_to)) = run {
            changes.push(SplitChange {
                from: run_from - shift,
                to: run_to - shift,
                value: None,
            });
        }

        let from_left_index = self.index_in_order(&from_left)?;
        let from_left_node = self.node(&from_left)?;
        let from_anchor = RgaSplitPos::new(from_left, from_left_node.value.len());
        let mut inserted_end = None;

        if let Some(value) = value.filter(|v| !v.is_empty()) {
            let at = self.visible_len_before(from_left_index) + from_left_node.visible_len();
            let id = RgaSplitNodeId::new(edited_at, 0);
            inserted_end = Some(RgaSplitPos::new(id, value.len()));
            match changes.last_mut() {
                Some(last) if last.from == at => last.value = Some(value.clone()),
                _ => changes.push(SplitChange {
                    from: at,
                    to: at,
                    value: Some(value.clone()),
                }),
            }
            self.order.insert(from_left_index + 1, id);
            self.nodes.insert(id, RgaSplitNode::new(id, value));
        }

        Ok(SplitEdit {
            changes,
            max_created_at_by_actor: max_created,
            removed_values,
            has_garbage,
            from_anchor,
            inserted_end,
        })
    }

    /// Apply `update` to every visible node between `from` and `to`. Returns the visible
    /// ranges where `update` reported a change, plus the creation tickets observed.
    pub fn style<F>(
        &mut self,
        from: &RgaSplitPos,
        to: &RgaSplitPos,
        edited_at: TimeTicket,
        max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
        mut update: F,
    ) -> Result<(Vec<(usize, usize)>, HashMap<ActorId, TimeTicket>)>
    where
        F: FnMut(&mut V) -> bool,
    {
        let (_, to_right) = self.find_node_with_split(to, edited_at)?;
        let (from_left, _) = self.find_node_with_split(from, edited_at)?;
        let (start, end) = self.between(&from_left, to_right.as_ref())?;

        let mut ranges = Vec::new();
        let mut max_created = HashMap::new();
        let mut index = self.visible_len_before(start);
        let candidates: Vec<RgaSplitNodeId> = self.order[start..end].to_vec();
        for id in candidates {
            let max = max_created_at_for(max_created_at_by_actor, &id.created_at.actor);
            let node = self.node_mut(&id)?;
            let len = node.visible_len();
            if len > 0 && !id.created_at.after(&max) {
                record_created_at(&mut max_created, id.created_at);
                if update(&mut node.value) {
                    ranges.push((index, index + len));
                }
            }
            index += len;
        }
        Ok((ranges, max_created))
    }

    /// Position of a visible index. Boundaries resolve to the end of the left node; index 0
    /// resolves to the head.
    pub fn index_to_pos(&self, index: usize) -> Result<RgaSplitPos> {
        let mut remaining = index;
        for id in &self.order {
            let node = self.node(id)?;
            if node.is_removed() {
                continue;
            }
            let len = node.value.len();
            if remaining <= len {
                return Ok(RgaSplitPos::new(*id, remaining));
            }
            remaining -= len;
        }
        Err(Error::InvalidOperation(format!(
            "index {index} out of range {}",
            self.len()
        )))
    }

    /// Visible length.
    pub fn len(&self) -> usize {
        self.nodes.values().map(RgaSplitNode::visible_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible nodes in document order.
    pub fn iter(&self) -> impl Iterator<Item = &RgaSplitNode<V>> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|node| node.visible_len() > 0)
    }

    /// Every node in document order, head and tombstones included.
    pub fn all(&self) -> impl Iterator<Item = &RgaSplitNode<V>> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn garbage_len(&self, safe: &TimeTicket) -> usize {
        self.nodes
            .values()
            .filter(|node| node.removed_at.map_or(false, |at| at <= *safe))
            .count()
    }

    /// Drop tombstones removed at or before `safe`, relinking the split chain around them.
    pub fn purge_removed(&mut self, safe: &TimeTicket) -> usize {
        let doomed: Vec<RgaSplitNodeId> = self
            .nodes
            .values()
            .filter(|node| node.removed_at.map_or(false, |at| at <= *safe))
            .map(|node| node.id)
            .collect();
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
            self.order.retain(|candidate| candidate != id);
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Chars(String);

    impl SplitValue for Chars {
        fn len(&self) -> usize {
            self.0.chars().count()
        }

        fn split_off(&mut self, offset: usize) -> Self {
            let at = self
                .0
                .char_indices()
                .nth(offset)
                .map(|(i, _)| i)
                .unwrap_or(self.0.len());
            Chars(self.0.split_off(at))
        }
    }

    fn t(lamport: u64, actor: u8) -> TimeTicket {
        TimeTicket::new(lamport, 0, ActorId([actor; 12]))
    }

    fn text(rga: &RgaTreeSplit<Chars>) -> String {
        rga.iter().map(|node| node.value().0.as_str()).collect()
    }

    fn insert(rga: &mut RgaTreeSplit<Chars>, index: usize, s: &str, at: TimeTicket) -> SplitEdit<Chars> {
        let pos = rga.index_to_pos(index).unwrap();
        rga.edit(&pos, &pos, at, Some(Chars(s.to_string())), None)
            .unwrap()
    }

    #[test]
    fn delete_inside_node_splits_it() {
        let mut rga = RgaTreeSplit::new();
        insert(&mut rga, 0, "hello", t(1, 1));
        let from = rga.index_to_pos(1).unwrap();
        let to = rga.index_to_pos(4).unwrap();
        let edit = rga.edit(&from, &to, t(2, 1), None, None).unwrap();

        assert_eq!(text(&rga), "ho");
        assert_eq!(edit.changes, vec![SplitChange { from: 1, to: 4, value: None }]);
        assert_eq!(rga.all().count(), 4);
    }

    #[test]
    fn concurrent_inserts_at_same_position_converge() {
        let mut base = RgaTreeSplit::new();
        insert(&mut base, 0, "ac", t(1, 1));
        let pos = base.index_to_pos(1).unwrap();

        let mut a = base.clone();
        let mut b = base.clone();
        a.edit(&pos, &pos, t(2, 1), Some(Chars("X".into())), None).unwrap();
        a.edit(&pos, &pos, t(2, 2), Some(Chars("Y".into())), None).unwrap();
        b.edit(&pos, &pos, t(2, 2), Some(Chars("Y".into())), None).unwrap();
        b.edit(&pos, &pos, t(2, 1), Some(Chars("X".into())), None).unwrap();

        assert_eq!(text(&a), text(&b));
        assert_eq!(text(&a), "aYXc");
    }

    #[test]
    fn remote_delete_spares_unseen_insertions() {
        let mut rga = RgaTreeSplit::new();
        insert(&mut rga, 0, "abc", t(1, 1));
        let from = rga.index_to_pos(0).unwrap();
        let to = rga.index_to_pos(3).unwrap();

        // Another actor inserts concurrently before the delete arrives.
        insert(&mut rga, 1, "Z", t(2, 2));

        let mut seen = HashMap::new();
        seen.insert(ActorId([1; 12]), t(1, 1));
        let edit = rga.edit(&from, &to, t(2, 1), None, Some(&seen)).unwrap();

        assert_eq!(text(&rga), "Z");
        assert_eq!(
            edit.changes,
            vec![
                SplitChange { from: 0, to: 1, value: None },
                SplitChange { from: 1, to: 3, value: None },
            ]
        );
    }

    #[test]
    fn purge_relinks_split_chain() {
        let mut rga = RgaTreeSplit::new();
        insert(&mut rga, 0, "abc", t(1, 1));
        let from = rga.index_to_pos(1).unwrap();
        let to = rga.index_to_pos(2).unwrap();
        rga.edit(&from, &to, t(2, 1), None, None).unwrap();

        assert_eq!(rga.garbage_len(&TimeTicket::MAX), 1);
        assert_eq!(rga.purge_removed(&TimeTicket::MAX), 1);
        assert_eq!(rga.purge_removed(&TimeTicket::MAX), 0);

        let right = rga
            .all()
            .find(|node| node.id().offset == 2)
            .map(|node| node.ins_prev());
        assert_eq!(right, Some(Some(RgaSplitNodeId::new(t(1, 1), 0))));

        // Appending after the surviving tail still works.
        insert(&mut rga, 2, "d", t(3, 1));
        assert_eq!(text(&rga), "acd");
    }
}
