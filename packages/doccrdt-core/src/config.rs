#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default bound of the undo and redo stacks.
pub const DEFAULT_MAX_UNDO_DEPTH: usize = 50;

/// Per-document tuning knobs.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DocumentOptions {
    /// Skip tombstone collection entirely, e.g. for documents inspected by tooling.
    pub disable_gc: bool,
    /// Oldest entries are evicted once a stack grows past this depth.
    pub max_undo_depth: usize,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self {
            disable_gc: false,
            max_undo_depth: DEFAULT_MAX_UNDO_DEPTH,
        }
    }
}
