//! Replicated growable array of elements.
//!
//! Uses a plain `Vec` in document order (tombstones included) and linear scans for lookups.
//! Elements are addressed by creation ticket only, never by index.

use crate::crdt::element::{CrdtElement, Tombstone};
use crate::error::{Error, Result};
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RgaTreeList {
    elements: Vec<CrdtElement>,
}

impl RgaTreeList {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, created_at: &TimeTicket) -> Option<usize> {
        self.elements
            .iter()
            .position(|e| &e.created_at() == created_at)
    }

    /// Slot right after `prev`; `TimeTicket::INITIAL` anchors the front.
    fn slot_after(&self, prev: &TimeTicket) -> Result<usize> {
        if *prev == TimeTicket::INITIAL {
            return Ok(0);
        }
        self.position(prev)
            .map(|i| i + 1)
            .ok_or_else(|| Error::MissingDependency(format!("array anchor {prev}")))
    }

    /// Insert `value` after the element created at `prev`.
    ///
    /// Elements already positioned after `prev` with a newer ticket than `executed_at` stay
    /// to the left, so concurrent inserts at one anchor order identically everywhere. An
    /// element that is already in the list is left where it is.
    pub fn insert_after(
        &mut self,
        prev: &TimeTicket,
        value: CrdtElement,
        executed_at: TimeTicket,
    ) -> Result<()> {
        if self.position(&value.created_at()).is_some() {
            return Ok(());
        }
        let mut idx = self.slot_after(prev)?;
        while idx < self.elements.len() && self.elements[idx].positioned_at().after(&executed_at)
        {
            idx += 1;
        }
        self.elements.insert(idx, value);
        Ok(())
    }

    /// Re-anchor an element after `prev`. Applies only when `executed_at` is newer than the
    /// element's last move; returns whether it moved.
    pub fn move_after(
        &mut self,
        prev: &TimeTicket,
        created_at: &TimeTicket,
        executed_at: TimeTicket,
    ) -> Result<bool> {
        let pos = self
            .position(created_at)
            .ok_or_else(|| Error::MissingDependency(format!("array element {created_at}")))?;
        if prev == created_at {
            return Ok(false);
        }
        if *prev != TimeTicket::INITIAL && self.position(prev).is_none() {
            return Err(Error::MissingDependency(format!("array anchor {prev}")));
        }
        if let Some(moved_at) = self.elements[pos].moved_at() {
            if !executed_at.after(&moved_at) {
                return Ok(false);
            }
        }

        let mut value = self.elements.remove(pos);
        value.set_moved_at(executed_at);
        let mut idx = self.slot_after(prev)?;
        while idx < self.elements.len() && self.elements[idx].positioned_at().after(&executed_at)
        {
            idx += 1;
        }
        self.elements.insert(idx, value);
        Ok(true)
    }

    /// Visible element at `index`.
    pub fn get(&self, index: usize) -> Option<&CrdtElement> {
        self.iter().nth(index)
    }

    pub fn get_by_id(&self, created_at: &TimeTicket) -> Option<&CrdtElement> {
        self.position(created_at).map(|i| &self.elements[i])
    }

    pub fn get_by_id_mut(&mut self, created_at: &TimeTicket) -> Option<&mut CrdtElement> {
        let pos = self.position(created_at)?;
        self.elements.get_mut(pos)
    }

    /// Number of visible elements before `created_at`; its index when visible.
    pub fn index_of(&self, created_at: &TimeTicket) -> Option<usize> {
        let pos = self.position(created_at)?;
        Some(self.elements[..pos].iter().filter(|e| !e.is_removed()).count())
    }

    /// Creation ticket of the element right before `created_at`, or `INITIAL` at the front.
    pub fn prev_created_at(&self, created_at: &TimeTicket) -> Option<TimeTicket> {
        let pos = self.position(created_at)?;
        Some(if pos == 0 {
            TimeTicket::INITIAL
        } else {
            self.elements[pos - 1].created_at()
        })
    }

    /// Anchor for appending: the last element in document order, tombstones included.
    pub fn last_created_at(&self) -> TimeTicket {
        self.elements
            .last()
            .map(|e| e.created_at())
            .unwrap_or(TimeTicket::INITIAL)
    }

    pub fn delete(&mut self, created_at: &TimeTicket, executed_at: TimeTicket) -> Option<bool> {
        self.get_by_id_mut(created_at)
            .map(|element| element.remove(executed_at))
    }

    pub fn purge(&mut self, created_at: &TimeTicket) -> Option<CrdtElement> {
        let pos = self.position(created_at)?;
        Some(self.elements.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible elements in order.
    pub fn iter(&self) -> impl Iterator<Item = &CrdtElement> {
        self.elements.iter().filter(|e| !e.is_removed())
    }

    pub fn all(&self) -> impl Iterator<Item = &CrdtElement> {
        self.elements.iter()
    }

    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut CrdtElement> {
        self.elements.iter_mut()
    }
}
