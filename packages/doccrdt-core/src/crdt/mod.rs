//! Replicated containers and the root that owns them.

use std::collections::HashMap;

use crate::ids::{ActorId, TimeTicket};

pub mod array;
pub mod counter;
pub mod element;
pub mod element_rht;
pub mod object;
pub mod primitive;
pub mod rga_list;
pub mod rga_split;
pub mod rht;
pub mod root;
pub mod text;
pub mod tree;

pub use array::CrdtArray;
pub use counter::{CounterValue, CrdtCounter};
pub use element::{CrdtElement, ElementMeta, Tombstone};
pub use object::CrdtObject;
pub use primitive::{Primitive, PrimitiveValue};
pub use rga_split::{RgaSplitNodeId, RgaSplitPos};
pub use rht::Rht;
pub use root::CrdtRoot;
pub use text::{CrdtText, TextChange, TextStyleChange, TextValue};
pub use tree::{
    CrdtTree, CrdtTreeNode, TreeChange, TreeChangeKind, TreeNode, TreeNodeId, TreeNodeSnapshot,
    TreePos,
};

/// Newest creation ticket of `actor` an editor had seen. Local edits (`None`) have seen
/// everything; a remote editor that recorded nothing for `actor` had seen none of its nodes.
pub(crate) fn max_created_at_for(
    max_created_at_by_actor: Option<&HashMap<ActorId, TimeTicket>>,
    actor: &ActorId,
) -> TimeTicket {
    match max_created_at_by_actor {
        None => TimeTicket::MAX,
        Some(map) => map.get(actor).copied().unwrap_or(TimeTicket::INITIAL),
    }
}

pub(crate) fn record_created_at(map: &mut HashMap<ActorId, TimeTicket>, created_at: TimeTicket) {
    let entry = map.entry(created_at.actor).or_insert(created_at);
    if created_at.after(entry) {
        *entry = created_at;
    }
}
