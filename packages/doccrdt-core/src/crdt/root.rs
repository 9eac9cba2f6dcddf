use std::collections::{BTreeSet, HashMap};

use serde_json::Value;

use crate::crdt::element::{CrdtElement, Tombstone};
use crate::crdt::object::CrdtObject;
use crate::error::{Error, Result};
use crate::ids::TimeTicket;

/// Owner of the document's element tree.
///
/// Keeps a registry from creation ticket to parent ticket so operations can address any
/// element, plus the sets the garbage collector sweeps: removed elements, and text or tree
/// containers holding tombstoned fragments.
#[derive(Clone, Debug)]
pub struct CrdtRoot {
    root: CrdtElement,
    parents: HashMap<TimeTicket, Option<TimeTicket>>,
    removed: BTreeSet<TimeTicket>,
    gc_containers: BTreeSet<TimeTicket>,
}

impl Default for CrdtRoot {
    fn default() -> Self {
        Self::new(CrdtObject::new(TimeTicket::INITIAL))
    }
}

impl CrdtRoot {
    pub fn new(object: CrdtObject) -> Self {
        let root = CrdtElement::Object(object);
        let mut entries = Vec::new();
        index_subtree(&root, None, &mut entries);
        let mut this = Self {
            root,
            parents: HashMap::new(),
            removed: BTreeSet::new(),
            gc_containers: BTreeSet::new(),
        };
        this.apply_entries(entries);
        this
    }

    pub fn element(&self) -> &CrdtElement {
        &self.root
    }

    /// Copy of the root object, e.g. for a snapshot.
    pub fn to_object(&self) -> Result<CrdtObject> {
        match &self.root {
            CrdtElement::Object(object) => Ok(object.clone()),
            other => Err(Error::InconsistentState(format!(
                "document root is a {}",
                other.type_name()
            ))),
        }
    }

    pub fn root_created_at(&self) -> TimeTicket {
        self.root.created_at()
    }

    /// Ancestor chain from the root down to `created_at`.
    fn chain(&self, created_at: &TimeTicket) -> Option<Vec<TimeTicket>> {
        let mut chain = vec![*created_at];
        let mut current = *self.parents.get(created_at)?;
        while let Some(parent) = current {
            chain.push(parent);
            current = *self.parents.get(&parent)?;
        }
        chain.reverse();
        Some(chain)
    }

    pub fn find(&self, created_at: &TimeTicket) -> Option<&CrdtElement> {
        let chain = self.chain(created_at)?;
        let mut current = &self.root;
        for ticket in chain.iter().skip(1) {
            current = current.child(ticket)?;
        }
        Some(current)
    }

    pub fn find_mut(&mut self, created_at: &TimeTicket) -> Option<&mut CrdtElement> {
        let chain = self.chain(created_at)?;
        let mut current = &mut self.root;
        for ticket in chain.iter().skip(1) {
            current = current.child_mut(ticket)?;
        }
        Some(current)
    }

    pub fn parent_of(&self, created_at: &TimeTicket) -> Option<TimeTicket> {
        self.parents.get(created_at).copied().flatten()
    }

    pub fn contains(&self, created_at: &TimeTicket) -> bool {
        self.parents.contains_key(created_at)
    }

    /// Number of registered elements, the root included.
    pub fn element_count(&self) -> usize {
        self.parents.len()
    }

    /// Register `element` and its descendants under `parent`.
    pub fn register_element(&mut self, element: &CrdtElement, parent: TimeTicket) {
        let mut entries = Vec::new();
        index_subtree(element, Some(parent), &mut entries);
        self.apply_entries(entries);
    }

    fn apply_entries(&mut self, entries: Vec<RegistryEntry>) {
        for entry in entries {
            self.parents.insert(entry.created_at, entry.parent);
            if entry.removed {
                self.removed.insert(entry.created_at);
            }
            if entry.has_garbage {
                self.gc_containers.insert(entry.created_at);
            }
        }
    }

    /// Forget `created_at` and its descendants. Returns how many entries were dropped.
    fn deregister(&mut self, tickets: &[TimeTicket]) -> usize {
        for created_at in tickets {
            self.parents.remove(created_at);
            self.removed.remove(created_at);
            self.gc_containers.remove(created_at);
        }
        tickets.len()
    }

    pub fn register_removed(&mut self, created_at: TimeTicket) {
        self.removed.insert(created_at);
    }

    pub fn register_gc_container(&mut self, created_at: TimeTicket) {
        self.gc_containers.insert(created_at);
    }

    /// Path of `created_at` from the root, e.g. `$.todos.0`.
    pub fn create_path(&self, created_at: &TimeTicket) -> Result<String> {
        let chain = self
            .chain(created_at)
            .ok_or_else(|| Error::MissingDependency(format!("element {created_at}")))?;
        let mut path = String::from("$");
        let mut current = &self.root;
        for ticket in chain.iter().skip(1) {
            let segment = current.sub_path_of(ticket).ok_or_else(|| {
                Error::InconsistentState(format!("element {ticket} is not a child"))
            })?;
            path.push('.');
            path.push_str(&segment);
            current = current
                .child(ticket)
                .ok_or_else(|| Error::InconsistentState(format!("element {ticket} missing")))?;
        }
        Ok(path)
    }

    /// Visible element at a `$.key.0` style path.
    pub fn find_by_path(&self, path: &str) -> Option<&CrdtElement> {
        let mut segments = path.split('.');
        if segments.next() != Some("$") {
            return None;
        }
        let mut current = &self.root;
        for segment in segments {
            current = match current {
                CrdtElement::Object(object) => object.get(segment)?,
                CrdtElement::Array(array) => array.get(segment.parse().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Entities a collection with the maximum ticket would reclaim.
    pub fn garbage_len(&self) -> usize {
        let mut seen = BTreeSet::new();
        for created_at in &self.removed {
            match self.find(created_at) {
                Some(element) => collect_descendants(element, &mut seen),
                None => {
                    seen.insert(*created_at);
                }
            }
        }
        let fragments: usize = self
            .gc_containers
            .iter()
            .filter(|created_at| !seen.contains(*created_at))
            .filter_map(|created_at| self.find(created_at))
            .map(|element| fragment_garbage_len(element, &TimeTicket::MAX))
            .sum();
        seen.len() + fragments
    }

    /// Physically drop everything removed at or before `safe`. Returns the number of
    /// elements and fragments reclaimed.
    pub fn garbage_collect(&mut self, safe: &TimeTicket) -> Result<usize> {
        let mut count = 0;

        let candidates: Vec<TimeTicket> = self.removed.iter().copied().collect();
        for created_at in candidates {
            let Some(element) = self.find(&created_at) else {
                continue;
            };
            if !element.removed_at().map_or(false, |at| at <= *safe) {
                continue;
            }
            let mut subtree = BTreeSet::new();
            collect_descendants(element, &mut subtree);
            let parent = self.parent_of(&created_at).ok_or_else(|| {
                Error::InconsistentState(format!("removed element {created_at} has no parent"))
            })?;
            if let Some(parent) = self.find_mut(&parent) {
                parent.purge_child(&created_at);
            }
            let subtree: Vec<TimeTicket> = subtree.into_iter().collect();
            count += self.deregister(&subtree);
        }

        let containers: Vec<TimeTicket> = self.gc_containers.iter().copied().collect();
        for created_at in containers {
            let Some(element) = self.find_mut(&created_at) else {
                self.gc_containers.remove(&created_at);
                continue;
            };
            count += match element {
                CrdtElement::Text(text) => text.purge_removed(safe),
                CrdtElement::Tree(tree) => tree.purge_removed(safe),
                _ => 0,
            };
            if fragment_garbage_len(element, &TimeTicket::MAX) == 0 {
                self.gc_containers.remove(&created_at);
            }
        }
        Ok(count)
    }

    pub fn to_json_value(&self) -> Value {
        self.root.to_json_value()
    }

    /// JSON projection with object keys in sorted order.
    pub fn to_sorted_json(&self) -> String {
        self.to_json_value().to_string()
    }
}

/// `element` and everything below it, tombstones included.
fn collect_descendants(element: &CrdtElement, out: &mut BTreeSet<TimeTicket>) {
    if !out.insert(element.created_at()) {
        return;
    }
    for child in element.children() {
        collect_descendants(child, out);
    }
}

fn fragment_garbage_len(element: &CrdtElement, safe: &TimeTicket) -> usize {
    match element {
        CrdtElement::Text(text) => text.garbage_len(safe),
        CrdtElement::Tree(tree) => tree.garbage_len(safe),
        _ => 0,
    }
}

struct RegistryEntry {
    created_at: TimeTicket,
    parent: Option<TimeTicket>,
    removed: bool,
    has_garbage: bool,
}

fn index_subtree(element: &CrdtElement, parent: Option<TimeTicket>, out: &mut Vec<RegistryEntry>) {
    let created_at = element.created_at();
    out.push(RegistryEntry {
        created_at,
        parent,
        removed: element.is_removed(),
        has_garbage: fragment_garbage_len(element, &TimeTicket::MAX) > 0,
    });
    for child in element.children() {
        index_subtree(child, Some(created_at), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::array::CrdtArray;
    use crate::crdt::primitive::{Primitive, PrimitiveValue};
    use crate::ids::ActorId;

    fn t(lamport: u64) -> TimeTicket {
        TimeTicket::new(lamport, 0, ActorId([4; 12]))
    }

    fn number(value: i32, at: TimeTicket) -> CrdtElement {
        CrdtElement::Primitive(Primitive::new(PrimitiveValue::from(value), at))
    }

    fn root_with_list() -> CrdtRoot {
        let mut root = CrdtRoot::default();
        let list = CrdtElement::Array(CrdtArray::new(t(1)));
        let root_ticket = root.root_created_at();
        if let Some(CrdtElement::Object(object)) = root.find_mut(&root_ticket) {
            object.set("list", list.clone(), t(1));
        }
        root.register_element(&list, root_ticket);

        for (prev, at) in [(TimeTicket::INITIAL, t(2)), (t(2), t(3))] {
            let value = number(at.lamport as i32, at);
            if let Some(CrdtElement::Array(array)) = root.find_mut(&t(1)) {
                array.insert_after(&prev, value.clone(), at).unwrap();
            }
            root.register_element(&value, t(1));
        }
        root
    }

    #[test]
    fn paths_follow_keys_and_indexes() {
        let root = root_with_list();
        assert_eq!(root.create_path(&t(3)).unwrap(), "$.list.1");
        assert_eq!(
            root.find_by_path("$.list.0").map(CrdtElement::created_at),
            Some(t(2))
        );
        assert_eq!(root.to_sorted_json(), r#"{"list":[2,3]}"#);
    }

    #[test]
    fn collect_purges_removed_elements_once() {
        let mut root = root_with_list();
        root.find_mut(&t(1))
            .and_then(|list| list.delete_child(&t(2), t(4)))
            .unwrap();
        root.register_removed(t(2));

        assert_eq!(root.garbage_len(), 1);
        assert_eq!(root.garbage_collect(&t(3)).unwrap(), 0);
        assert_eq!(root.garbage_collect(&TimeTicket::MAX).unwrap(), 1);
        assert_eq!(root.garbage_collect(&TimeTicket::MAX).unwrap(), 0);
        assert!(!root.contains(&t(2)));
        assert_eq!(root.to_sorted_json(), r#"{"list":[3]}"#);
    }

    #[test]
    fn removing_a_container_reclaims_its_whole_subtree() {
        let mut root = root_with_list();
        root.find_mut(&t(1))
            .and_then(|list| list.delete_child(&t(2), t(4)))
            .unwrap();
        root.register_removed(t(2));
        let root_ticket = root.root_created_at();
        root.find_mut(&root_ticket)
            .and_then(|object| object.delete_child(&t(1), t(5)))
            .unwrap();
        root.register_removed(t(1));

        assert_eq!(root.garbage_len(), 3);
        assert_eq!(root.garbage_collect(&TimeTicket::MAX).unwrap(), 3);
        assert_eq!(root.garbage_len(), 0);
        assert_eq!(root.element_count(), 1);
        assert_eq!(root.to_sorted_json(), "{}");
    }
}
