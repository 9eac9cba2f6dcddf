use serde_json::Value;

use crate::crdt::element::{CrdtElement, ElementMeta};
use crate::crdt::rga_list::RgaTreeList;
use crate::error::{Error, Result};
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Array container backed by a replicated growable array.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrdtArray {
    pub(crate) meta: ElementMeta,
    elements: RgaTreeList,
}

impl CrdtArray {
    pub fn new(created_at: TimeTicket) -> Self {
        Self {
            meta: ElementMeta::new(created_at),
            elements: RgaTreeList::new(),
        }
    }

    pub fn insert_after(
        &mut self,
        prev: &TimeTicket,
        value: CrdtElement,
        executed_at: TimeTicket,
    ) -> Result<()> {
        self.elements.insert_after(prev, value, executed_at)
    }

    pub fn move_after(
        &mut self,
        prev: &TimeTicket,
        created_at: &TimeTicket,
        executed_at: TimeTicket,
    ) -> Result<bool> {
        self.elements.move_after(prev, created_at, executed_at)
    }

    /// Replace the element created at `created_at` with `value`, keeping its slot: the new
    /// value is placed right after the old one, which is then tombstoned.
    pub fn set(
        &mut self,
        created_at: &TimeTicket,
        value: CrdtElement,
        executed_at: TimeTicket,
    ) -> Result<bool> {
        if self.elements.get_by_id(created_at).is_none() {
            return Err(Error::MissingDependency(format!("array element {created_at}")));
        }
        self.elements.insert_after(created_at, value, executed_at)?;
        Ok(self
            .elements
            .delete(created_at, executed_at)
            .unwrap_or(false))
    }

    pub fn get(&self, index: usize) -> Option<&CrdtElement> {
        self.elements.get(index)
    }

    pub fn get_by_id(&self, created_at: &TimeTicket) -> Option<&CrdtElement> {
        self.elements.get_by_id(created_at)
    }

    pub fn get_by_id_mut(&mut self, created_at: &TimeTicket) -> Option<&mut CrdtElement> {
        self.elements.get_by_id_mut(created_at)
    }

    pub fn delete(&mut self, created_at: &TimeTicket, executed_at: TimeTicket) -> Option<bool> {
        self.elements.delete(created_at, executed_at)
    }

    pub fn purge(&mut self, created_at: &TimeTicket) -> Option<CrdtElement> {
        self.elements.purge(created_at)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &RgaTreeList {
        &self.elements
    }

    pub(crate) fn elements_mut(&mut self) -> &mut RgaTreeList {
        &mut self.elements
    }

    pub fn to_json_value(&self) -> Value {
        Value::Array(
            self.elements
                .iter()
                .map(CrdtElement::to_json_value)
                .collect(),
        )
    }
}
