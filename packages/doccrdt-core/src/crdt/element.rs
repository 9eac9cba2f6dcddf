use serde_json::Value;

use crate::crdt::array::CrdtArray;
use crate::crdt::counter::CrdtCounter;
use crate::crdt::object::CrdtObject;
use crate::crdt::primitive::Primitive;
use crate::crdt::text::CrdtText;
use crate::crdt::tree::CrdtTree;
use crate::error::Result;
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tombstone bookkeeping shared by document elements, text fragments and tree nodes.
pub trait Tombstone {
    fn removed_at(&self) -> Option<TimeTicket>;
    fn set_removed_at(&mut self, removed_at: Option<TimeTicket>);

    fn is_removed(&self) -> bool {
        self.removed_at().is_some()
    }

    /// Mark removed at `ticket`. The earliest removal ticket is kept so every replica records
    /// the same `removed_at`. Returns `true` only if the entity was visible before.
    fn remove(&mut self, ticket: TimeTicket) -> bool {
        match self.removed_at() {
            None => {
                self.set_removed_at(Some(ticket));
                true
            }
            Some(prev) => {
                if ticket < prev {
                    self.set_removed_at(Some(ticket));
                }
                false
            }
        }
    }
}

/// Tickets every element carries.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ElementMeta {
    pub created_at: TimeTicket,
    pub moved_at: Option<TimeTicket>,
    pub removed_at: Option<TimeTicket>,
}

impl ElementMeta {
    pub fn new(created_at: TimeTicket) -> Self {
        Self {
            created_at,
            moved_at: None,
            removed_at: None,
        }
    }

    /// Ticket that placed the element where it is now.
    pub fn positioned_at(&self) -> TimeTicket {
        self.moved_at.unwrap_or(self.created_at)
    }
}

impl Tombstone for ElementMeta {
    fn removed_at(&self) -> Option<TimeTicket> {
        self.removed_at
    }

    fn set_removed_at(&mut self, removed_at: Option<TimeTicket>) {
        self.removed_at = removed_at;
    }
}

/// A node of the document: one closed variant per container kind.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum CrdtElement {
    Primitive(Primitive),
    Object(CrdtObject),
    Array(CrdtArray),
    Text(CrdtText),
    Counter(CrdtCounter),
    Tree(CrdtTree),
}

impl CrdtElement {
    pub fn meta(&self) -> &ElementMeta {
        match self {
            CrdtElement::Primitive(e) => &e.meta,
            CrdtElement::Object(e) => &e.meta,
            CrdtElement::Array(e) => &e.meta,
            CrdtElement::Text(e) => &e.meta,
            CrdtElement::Counter(e) => &e.meta,
            CrdtElement::Tree(e) => &e.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ElementMeta {
        match self {
            CrdtElement::Primitive(e) => &mut e.meta,
            CrdtElement::Object(e) => &mut e.meta,
            CrdtElement::Array(e) => &mut e.meta,
            CrdtElement::Text(e) => &mut e.meta,
            CrdtElement::Counter(e) => &mut e.meta,
            CrdtElement::Tree(e) => &mut e.meta,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CrdtElement::Primitive(_) => "primitive",
            CrdtElement::Object(_) => "object",
            CrdtElement::Array(_) => "array",
            CrdtElement::Text(_) => "text",
            CrdtElement::Counter(_) => "counter",
            CrdtElement::Tree(_) => "tree",
        }
    }

    pub fn created_at(&self) -> TimeTicket {
        self.meta().created_at
    }

    pub fn moved_at(&self) -> Option<TimeTicket> {
        self.meta().moved_at
    }

    pub fn positioned_at(&self) -> TimeTicket {
        self.meta().positioned_at()
    }

    pub fn set_moved_at(&mut self, moved_at: TimeTicket) {
        self.meta_mut().moved_at = Some(moved_at);
    }

    /// Direct child by creation ticket, tombstones included.
    pub fn child(&self, created_at: &TimeTicket) -> Option<&CrdtElement> {
        match self {
            CrdtElement::Object(o) => o.get_by_id(created_at),
            CrdtElement::Array(a) => a.get_by_id(created_at),
            _ => None,
        }
    }

    pub fn child_mut(&mut self, created_at: &TimeTicket) -> Option<&mut CrdtElement> {
        match self {
            CrdtElement::Object(o) => o.get_by_id_mut(created_at),
            CrdtElement::Array(a) => a.get_by_id_mut(created_at),
            _ => None,
        }
    }

    /// Every direct child, tombstones included.
    pub fn children(&self) -> Vec<&CrdtElement> {
        match self {
            CrdtElement::Object(o) => o.members().all().map(|node| node.value()).collect(),
            CrdtElement::Array(a) => a.elements().all().collect(),
            _ => Vec::new(),
        }
    }

    /// Path segment naming `child` inside this container: the key or the array index.
    pub fn sub_path_of(&self, child: &TimeTicket) -> Option<String> {
        match self {
            CrdtElement::Object(o) => o.key_of(child).map(str::to_string),
            CrdtElement::Array(a) => a.elements().index_of(child).map(|i| i.to_string()),
            _ => None,
        }
    }

    pub fn delete_child(&mut self, created_at: &TimeTicket, executed_at: TimeTicket) -> Option<bool> {
        match self {
            CrdtElement::Object(o) => o.delete(created_at, executed_at),
            CrdtElement::Array(a) => a.delete(created_at, executed_at),
            _ => None,
        }
    }

    pub fn purge_child(&mut self, created_at: &TimeTicket) -> Option<CrdtElement> {
        match self {
            CrdtElement::Object(o) => o.purge(created_at),
            CrdtElement::Array(a) => a.purge(created_at),
            _ => None,
        }
    }

    pub fn to_json_value(&self) -> Value {
        match self {
            CrdtElement::Primitive(e) => e.to_json_value(),
            CrdtElement::Object(e) => e.to_json_value(),
            CrdtElement::Array(e) => e.to_json_value(),
            CrdtElement::Text(e) => e.to_json_value(),
            CrdtElement::Counter(e) => e.to_json_value(),
            CrdtElement::Tree(e) => e.to_json_value(),
        }
    }

    /// Re-issue the creation tickets of this element and its descendants so a copy can be
    /// inserted again next to its tombstoned original. Each `(old, new)` pair is appended to
    /// `renamed`.
    pub(crate) fn restamp(
        &mut self,
        issue: &mut dyn FnMut() -> Result<TimeTicket>,
        renamed: &mut Vec<(TimeTicket, TimeTicket)>,
    ) -> Result<()> {
        let old = self.created_at();
        let new = issue()?;
        {
            let meta = self.meta_mut();
            meta.created_at = new;
            meta.moved_at = None;
        }
        renamed.push((old, new));

        match self {
            CrdtElement::Object(o) => {
                let mark = renamed.len();
                for child in o.members_mut().all_mut() {
                    child.restamp(issue, renamed)?;
                }
                o.members_mut().reindex(&renamed[mark..]);
            }
            CrdtElement::Array(a) => {
                for child in a.elements_mut().all_mut() {
                    child.restamp(issue, renamed)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

impl Tombstone for CrdtElement {
    fn removed_at(&self) -> Option<TimeTicket> {
        self.meta().removed_at
    }

    fn set_removed_at(&mut self, removed_at: Option<TimeTicket>) {
        self.meta_mut().removed_at = removed_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::primitive::PrimitiveValue;
    use crate::ids::ActorId;

    fn t(lamport: u64) -> TimeTicket {
        TimeTicket::new(lamport, 0, ActorId([3; 12]))
    }

    #[test]
    fn earliest_removal_is_kept() {
        let mut meta = ElementMeta::new(t(1));
        assert!(meta.remove(t(5)));
        assert!(!meta.remove(t(3)));
        assert!(!meta.remove(t(7)));
        assert_eq!(meta.removed_at, Some(t(3)));
    }

    #[test]
    fn restamp_reissues_nested_tickets() {
        let mut object = CrdtObject::new(t(1));
        let child = CrdtElement::Primitive(Primitive::new(PrimitiveValue::from(1), t(2)));
        object.set("a", child, t(2));
        let mut element = CrdtElement::Object(object);

        let mut next = 10;
        let mut issue = || -> Result<TimeTicket> {
            next += 1;
            Ok(t(next))
        };
        let mut renamed = Vec::new();
        element.restamp(&mut issue, &mut renamed).unwrap();

        assert_eq!(renamed, vec![(t(1), t(11)), (t(2), t(12))]);
        match &element {
            CrdtElement::Object(o) => {
                assert_eq!(o.get("a").map(|e| e.created_at()), Some(t(12)));
            }
            other => panic!("unexpected {}", other.type_name()),
        }
    }
}
