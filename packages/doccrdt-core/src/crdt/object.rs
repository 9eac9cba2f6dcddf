use serde_json::{Map, Value};

use crate::crdt::element::{CrdtElement, ElementMeta};
use crate::crdt::element_rht::ElementRht;
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Object container: string keys mapped through a replicated hash table.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrdtObject {
    pub(crate) meta: ElementMeta,
    members: ElementRht,
}

impl CrdtObject {
    pub fn new(created_at: TimeTicket) -> Self {
        Self {
            meta: ElementMeta::new(created_at),
            members: ElementRht::new(),
        }
    }

    /// See [`ElementRht::set`].
    pub fn set(
        &mut self,
        key: &str,
        value: CrdtElement,
        executed_at: TimeTicket,
    ) -> Option<TimeTicket> {
        self.members.set(key, value, executed_at)
    }

    pub fn get(&self, key: &str) -> Option<&CrdtElement> {
        self.members.get(key)
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn get_by_id(&self, created_at: &TimeTicket) -> Option<&CrdtElement> {
        self.members.get_by_id(created_at)
    }

    pub fn get_by_id_mut(&mut self, created_at: &TimeTicket) -> Option<&mut CrdtElement> {
        self.members.get_by_id_mut(created_at)
    }

    pub fn delete(&mut self, created_at: &TimeTicket, executed_at: TimeTicket) -> Option<bool> {
        self.members.delete(created_at, executed_at)
    }

    pub fn purge(&mut self, created_at: &TimeTicket) -> Option<CrdtElement> {
        self.members.purge(created_at)
    }

    pub fn key_of(&self, created_at: &TimeTicket) -> Option<&str> {
        self.members.key_of(created_at)
    }

    pub fn keys(&self) -> Vec<String> {
        self.members.iter().map(|(key, _)| key.to_string()).collect()
    }

    pub fn members(&self) -> &ElementRht {
        &self.members
    }

    pub(crate) fn members_mut(&mut self) -> &mut ElementRht {
        &mut self.members
    }

    pub fn to_json_value(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in self.members.iter() {
            map.insert(key.to_string(), value.to_json_value());
        }
        Value::Object(map)
    }
}
