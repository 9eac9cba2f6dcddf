#![forbid(unsafe_code)]
//! Core of a replicated document engine.
//!
//! A [`Document`] holds a tree of CRDT elements (objects, arrays, text, counters and
//! hierarchical trees) and converges with its peers by exchanging [`ChangePack`]s. Local
//! changes record reverse operations for undo/redo, and tombstones are reclaimed once every
//! peer has seen them. Transport and storage are left to the host.

pub mod change;
pub mod clock;
pub mod config;
pub mod crdt;
pub mod document;
pub mod error;
pub mod history;
pub mod ids;
pub mod operation;

pub use change::{
    Change, ChangeContext, ChangePack, ElementInit, Presence, PresenceChange, Snapshot,
};
pub use clock::{Clock, LamportClock};
pub use config::{DocumentOptions, DEFAULT_MAX_UNDO_DEPTH};
pub use crdt::{
    CounterValue, CrdtArray, CrdtCounter, CrdtElement, CrdtObject, CrdtRoot, CrdtText, CrdtTree,
    PrimitiveValue, Tombstone, TreeChange, TreeChangeKind, TreeNode, TreeNodeId, TreePos,
};
pub use document::{ChangeInfo, DocEvent, DocStatus, Document, SubscriptionId};
pub use error::{Error, Result};
pub use history::History;
pub use ids::{ActorId, ChangeId, Checkpoint, Lamport, TimeTicket};
pub use operation::{OpSource, Operation, OperationInfo, OperationKind};
