// id.rs — Stable node identifiers for model graphs
//
// Node ids are assigned at insertion in monotonically increasing order and
// are never reused within a graph, even when the graph is rebuilt through a
// transformer (the destination graph allocates fresh ids).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier for a node within a graph.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Allocator for node ids. Produces monotonically increasing ids in
/// insertion order, ensuring deterministic assignment.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    next_node: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next id. `None` once the id space is exhausted: the
    /// id after the last one handed out must stay representable, since
    /// `peek` names a slot no node occupies.
    pub fn alloc_node(&mut self) -> Option<NodeId> {
        let id = NodeId(self.next_node);
        self.next_node = self.next_node.checked_add(1)?;
        Some(id)
    }

    /// The id the next call to `alloc_node` will return.
    pub fn peek(&self) -> NodeId {
        NodeId(self.next_node)
    }

    /// Make sure ids at or below `id` are never handed out again. `None`
    /// (allocator unchanged) when `id` is the largest representable id.
    pub fn reserve_through(&mut self, id: NodeId) -> Option<NodeId> {
        let next = id.0.checked_add(1)?;
        self.next_node = self.next_node.max(next);
        Some(self.peek())
    }
}
