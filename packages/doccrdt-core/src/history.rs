use std::collections::VecDeque;

use crate::config::DEFAULT_MAX_UNDO_DEPTH;
use crate::operation::{Operation, Renames};

/// Reverse operations of one local change, in replay order.
pub type HistoryEntry = Vec<Operation>;

/// Linear undo/redo stacks. Each stack keeps at most `max_depth` entries and evicts the
/// oldest one when it overflows.
#[derive(Clone, Debug)]
pub struct History {
    max_depth: usize,
    undo_stack: VecDeque<HistoryEntry>,
    redo_stack: VecDeque<HistoryEntry>,
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNDO_DEPTH)
    }
}

impl History {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            undo_stack: VecDeque::new(),
            redo_stack: VecDeque::new(),
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn push_undo(&mut self, entry: HistoryEntry) {
        push_bounded(&mut self.undo_stack, entry, self.max_depth);
    }

    pub fn push_redo(&mut self, entry: HistoryEntry) {
        push_bounded(&mut self.redo_stack, entry, self.max_depth);
    }

    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.undo_stack.pop_back()
    }

    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        self.redo_stack.pop_back()
    }

    /// Drop the redo stack; a new local change starts a new branch.
    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    /// Rewrite references to re-created elements in every stored entry.
    pub(crate) fn reconcile(&mut self, renames: &Renames) {
        if renames.is_empty() {
            return;
        }
        for entry in self.undo_stack.iter_mut().chain(self.redo_stack.iter_mut()) {
            for op in entry.iter_mut() {
                op.rename(renames);
            }
        }
    }
}

fn push_bounded(stack: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, max_depth: usize) {
    if max_depth == 0 || entry.is_empty() {
        return;
    }
    stack.push_back(entry);
    while stack.len() > max_depth {
        stack.pop_front();
    }
}
