use std::collections::{BTreeMap, HashMap};

use crate::crdt::element::{CrdtElement, Tombstone};
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ElementRhtNode {
    key: String,
    value: CrdtElement,
}

impl ElementRhtNode {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &CrdtElement {
        &self.value
    }
}

/// Replicated hash table of object members.
///
/// Every element ever set is kept under its creation ticket; `keys` points at the entry that
/// currently wins each key. Losers and overwritten values stay behind as tombstones until GC.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ElementRht {
    nodes: HashMap<TimeTicket, ElementRhtNode>,
    keys: BTreeMap<String, TimeTicket>,
}

impl ElementRht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` to `value`, returning the element that became a tombstone because of it:
    /// either the previous winner, or `value` itself when a newer entry already owns the key.
    /// Setting an element whose creation ticket is already stored changes nothing.
    pub fn set(
        &mut self,
        key: &str,
        mut value: CrdtElement,
        executed_at: TimeTicket,
    ) -> Option<TimeTicket> {
        let created_at = value.created_at();
        if self.nodes.contains_key(&created_at) {
            return None;
        }
        let mut removed = None;
        let wins = match self.keys.get(key).and_then(|w| self.nodes.get_mut(w)) {
            Some(winner) if !executed_at.after(&winner.value.positioned_at()) => false,
            Some(winner) => {
                if winner.value.remove(executed_at) {
                    removed = Some(winner.value.created_at());
                }
                true
            }
            None => true,
        };

        if wins {
            value.set_moved_at(executed_at);
            self.keys.insert(key.to_string(), created_at);
        } else {
            value.remove(executed_at);
            removed = Some(created_at);
        }
        self.nodes.insert(
            created_at,
            ElementRhtNode {
                key: key.to_string(),
                value,
            },
        );
        removed
    }

    /// Visible element currently owning `key`.
    pub fn get(&self, key: &str) -> Option<&CrdtElement> {
        self.keys
            .get(key)
            .and_then(|created_at| self.nodes.get(created_at))
            .map(|node| &node.value)
            .filter(|value| !value.is_removed())
    }

    /// Any element, visible or not, by creation ticket.
    pub fn get_by_id(&self, created_at: &TimeTicket) -> Option<&CrdtElement> {
        self.nodes.get(created_at).map(|node| &node.value)
    }

    pub fn get_by_id_mut(&mut self, created_at: &TimeTicket) -> Option<&mut CrdtElement> {
        self.nodes.get_mut(created_at).map(|node| &mut node.value)
    }

    pub fn key_of(&self, created_at: &TimeTicket) -> Option<&str> {
        self.nodes.get(created_at).map(|node| node.key.as_str())
    }

    /// Tombstone the element created at `created_at`. Returns whether it was visible before.
    pub fn delete(&mut self, created_at: &TimeTicket, executed_at: TimeTicket) -> Option<bool> {
        self.nodes
            .get_mut(created_at)
            .map(|node| node.value.remove(executed_at))
    }

    /// Physically drop an entry.
    pub fn purge(&mut self, created_at: &TimeTicket) -> Option<CrdtElement> {
        let node = self.nodes.remove(created_at)?;
        if self.keys.get(&node.key) == Some(created_at) {
            self.keys.remove(&node.key);
        }
        Some(node.value)
    }

    /// Visible members in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CrdtElement)> {
        self.keys.iter().filter_map(move |(key, created_at)| {
            self.nodes
                .get(created_at)
                .filter(|node| !node.value.is_removed())
                .map(|node| (key.as_str(), &node.value))
        })
    }

    /// Every entry including tombstones.
    pub fn all(&self) -> impl Iterator<Item = &ElementRhtNode> {
        self.nodes.values()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut CrdtElement> {
        self.nodes.values_mut().map(|node| &mut node.value)
    }

    /// Rebuild both indexes after creation tickets of members changed.
    pub(crate) fn reindex(&mut self, renamed: &[(TimeTicket, TimeTicket)]) {
        if renamed.is_empty() {
            return;
        }
        let nodes = std::mem::take(&mut self.nodes);
        self.nodes = nodes
            .into_values()
            .map(|node| (node.value.created_at(), node))
            .collect();
        for created_at in self.keys.values_mut() {
            if let Some((_, new)) = renamed.iter().find(|(old, _)| old == created_at) {
                *created_at = *new;
            }
        }
    }
}
