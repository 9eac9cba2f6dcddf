use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RhtNode {
    value: String,
    updated_at: TimeTicket,
    removed: bool,
}

impl RhtNode {
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn updated_at(&self) -> TimeTicket {
        self.updated_at
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }
}

/// Last-writer-wins string map used for text and tree attributes.
///
/// Removals are kept as tombstones so an older concurrent `set` cannot resurrect a key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Rht {
    nodes: BTreeMap<String, RhtNode>,
}

impl Rht {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` when `executed_at` is newer than its last update. Returns whether it applied.
    pub fn set(&mut self, key: &str, value: &str, executed_at: TimeTicket) -> bool {
        if let Some(prev) = self.nodes.get(key) {
            if !executed_at.after(&prev.updated_at) {
                return false;
            }
        }
        self.nodes.insert(
            key.to_string(),
            RhtNode {
                value: value.to_string(),
                updated_at: executed_at,
                removed: false,
            },
        );
        true
    }

    /// Tombstone `key`. Returns the previously visible value when the removal applied.
    pub fn remove(&mut self, key: &str, executed_at: TimeTicket) -> Option<String> {
        let previous = match self.nodes.get(key) {
            Some(prev) if !executed_at.after(&prev.updated_at) => return None,
            Some(prev) if !prev.removed => Some(prev.value.clone()),
            _ => None,
        };
        self.nodes.insert(
            key.to_string(),
            RhtNode {
                value: String::new(),
                updated_at: executed_at,
                removed: true,
            },
        );
        previous
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.nodes
            .get(key)
            .filter(|node| !node.removed)
            .map(|node| node.value.as_str())
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Visible entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes
            .iter()
            .filter(|(_, node)| !node.removed)
            .map(|(key, node)| (key.as_str(), node.value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries().next().is_none()
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn to_json_value(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in self.entries() {
            map.insert(key.to_string(), Value::String(value.to_string()));
        }
        Value::Object(map)
    }

    /// Attributes rendered as ` key="value"` pairs.
    pub fn to_xml(&self) -> String {
        self.entries()
            .map(|(key, value)| format!(" {}=\"{}\"", key, escape_xml(value)))
            .collect()
    }
}

pub(crate) fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ActorId;

    fn t(lamport: u64) -> TimeTicket {
        TimeTicket::new(lamport, 0, ActorId([1; 12]))
    }

    #[test]
    fn newer_set_wins_regardless_of_order() {
        let mut a = Rht::new();
        a.set("bold", "true", t(2));
        assert!(!a.set("bold", "false", t(1)));

        let mut b = Rht::new();
        b.set("bold", "false", t(1));
        b.set("bold", "true", t(2));

        assert_eq!(a, b);
        assert_eq!(a.get("bold"), Some("true"));
    }

    #[test]
    fn removal_tombstone_blocks_older_set() {
        let mut rht = Rht::new();
        assert_eq!(rht.remove("color", t(5)), None);
        assert!(!rht.set("color", "red", t(3)));
        assert!(!rht.has("color"));
        assert!(rht.set("color", "blue", t(6)));
        assert_eq!(rht.to_xml(), " color=\"blue\"");
    }
}
