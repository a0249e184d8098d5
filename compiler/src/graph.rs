// graph.rs — Model graph arena and dependency-ordered traversal
//
// The graph owns every node, keyed by a stable id. Input ports refer to
// producers by id, so an output may feed any number of downstream ports
// without shared ownership. Nodes are only ever added; they are dropped
// together with the graph.
//
// Preconditions: none.
// Postconditions: every node's inputs reference nodes inserted before it,
//                 so the producer relation is acyclic by construction.
// Failure modes: unknown producer, bad port or range, arity or size
//                mismatch → `GraphError`; the graph is left unchanged.
// Side effects: none.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::diag::{codes, DiagCode, Diagnose, Location};
use crate::id::{IdAllocator, NodeId};
use crate::node::{Node, NodeKind};
use crate::port::{OutputRef, PortElements};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("node {node} not found")]
    NodeNotFound { node: NodeId },
    #[error("node {node} has no output port {port}")]
    PortOutOfRange { node: NodeId, port: usize },
    #[error("range of {len} element(s) at {start} exceeds output {node}.{port} of size {size}")]
    RangeOutOfBounds {
        node: NodeId,
        port: usize,
        start: usize,
        len: usize,
        size: usize,
    },
    #[error("{tag} node {node} takes {expected} input(s), got {found}")]
    Arity {
        node: NodeId,
        tag: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("{tag} node {node}: expected {expected} element(s), got {found}")]
    SizeMismatch {
        node: NodeId,
        tag: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("node {node} reads from node {producer}, which is defined later")]
    ForwardReference { node: NodeId, producer: NodeId },
    #[error("node id {node} is already in use")]
    DuplicateId { node: NodeId },
    #[error("expected {expected} input value(s), got {found}")]
    InputLength { expected: usize, found: usize },
    #[error("{tag} node {node} has no compute function")]
    NotComputable { node: NodeId, tag: &'static str },
    #[error("no node id is left after {node}")]
    IdsExhausted { node: NodeId },
    #[error("input node {node} is not part of the input layout")]
    UnboundInput { node: NodeId },
    #[error("node {node} in the input layout is not an Input node")]
    NotAnInput { node: NodeId },
    #[error("input node {node} appears more than once in the input layout")]
    DuplicateInput { node: NodeId },
}

impl Diagnose for GraphError {
    fn code(&self) -> DiagCode {
        match self {
            GraphError::NodeNotFound { .. } => codes::E0101_NODE_NOT_FOUND,
            GraphError::PortOutOfRange { .. } => codes::E0102_PORT_OUT_OF_RANGE,
            GraphError::RangeOutOfBounds { .. } => codes::E0103_RANGE_OUT_OF_BOUNDS,
            GraphError::Arity { .. } => codes::E0104_ARITY,
            GraphError::SizeMismatch { .. } => codes::E0105_SIZE_MISMATCH,
            GraphError::ForwardReference { .. } => codes::E0106_FORWARD_REFERENCE,
            GraphError::DuplicateId { .. } => codes::E0107_DUPLICATE_ID,
            GraphError::InputLength { .. } => codes::E0108_INPUT_LENGTH,
            GraphError::NotComputable { .. } => codes::E0109_NOT_COMPUTABLE,
            GraphError::IdsExhausted { .. } => codes::E0110_IDS_EXHAUSTED,
            GraphError::UnboundInput { .. } => codes::E0111_UNBOUND_INPUT,
            GraphError::NotAnInput { .. } => codes::E0112_NOT_AN_INPUT,
            GraphError::DuplicateInput { .. } => codes::E0113_DUPLICATE_INPUT,
        }
    }

    fn location(&self) -> Option<Location> {
        match self {
            GraphError::NodeNotFound { node }
            | GraphError::PortOutOfRange { node, .. }
            | GraphError::RangeOutOfBounds { node, .. }
            | GraphError::Arity { node, .. }
            | GraphError::SizeMismatch { node, .. }
            | GraphError::ForwardReference { node, .. }
            | GraphError::DuplicateId { node }
            | GraphError::NotComputable { node, .. }
            | GraphError::IdsExhausted { node }
            | GraphError::UnboundInput { node }
            | GraphError::NotAnInput { node }
            | GraphError::DuplicateInput { node } => Some(Location::Node(*node)),
            GraphError::InputLength { .. } => None,
        }
    }
}

// ── Records ─────────────────────────────────────────────────────────────────

/// Everything needed to recreate one node: id, kind (which carries the type
/// tag and parameters), input references and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub kind: NodeKind,
    pub inputs: Vec<PortElements>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

// ── Graph ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    ids: IdAllocator,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node reading from `inputs` (one entry per input port) and
    /// return its freshly assigned id.
    pub fn add_node(
        &mut self,
        kind: NodeKind,
        inputs: Vec<PortElements>,
    ) -> Result<NodeId, GraphError> {
        self.add_node_with_metadata(kind, inputs, BTreeMap::new())
    }

    pub fn add_node_with_metadata(
        &mut self,
        kind: NodeKind,
        inputs: Vec<PortElements>,
        metadata: BTreeMap<String, String>,
    ) -> Result<NodeId, GraphError> {
        let mut ids = self.ids.clone();
        let id = ids.alloc_node().ok_or(GraphError::IdsExhausted {
            node: self.ids.peek(),
        })?;
        self.insert(id, kind, inputs, metadata)?;
        self.ids = ids;
        Ok(id)
    }

    fn insert(
        &mut self,
        id: NodeId,
        kind: NodeKind,
        inputs: Vec<PortElements>,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), GraphError> {
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateId { node: id });
        }
        let sizes = inputs
            .iter()
            .map(|elements| self.check_elements(elements).map(|_| elements.len()))
            .collect::<Result<Vec<_>, _>>()?;
        let size = kind.check(id, &sizes)?;
        self.nodes
            .insert(id, Node::new(id, kind, inputs, size, metadata));
        Ok(())
    }

    /// Check that every range of `elements` lies within an existing output.
    pub fn check_elements(&self, elements: &PortElements) -> Result<(), GraphError> {
        for range in elements.ranges() {
            let producer = self.get(range.node)?;
            let size = producer
                .output_size(range.port)
                .ok_or(GraphError::PortOutOfRange {
                    node: range.node,
                    port: range.port,
                })?;
            if range.checked_end().map_or(true, |end| end > size) {
                return Err(GraphError::RangeOutOfBounds {
                    node: range.node,
                    port: range.port,
                    start: range.start,
                    len: range.len,
                    size,
                });
            }
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Like `node`, but a miss is a `NodeNotFound` error.
    pub fn get(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes
            .get(&id)
            .ok_or(GraphError::NodeNotFound { node: id })
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The id the next inserted node will receive. No node of this graph
    /// has an id at or above it.
    pub fn next_id(&self) -> NodeId {
        self.ids.peek()
    }

    /// All nodes in id order (which is also a valid dependency order).
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn output_size(&self, output: OutputRef) -> Option<usize> {
        self.node(output.node)?.output_size(output.port)
    }

    /// Nodes no other node reads from, in id order.
    pub fn terminal_nodes(&self) -> Vec<NodeId> {
        let referenced: HashSet<NodeId> = self
            .nodes
            .values()
            .flat_map(|n| n.producers())
            .collect();
        self.nodes
            .keys()
            .copied()
            .filter(|id| !referenced.contains(id))
            .collect()
    }

    /// Input nodes in id order. The procedure input vector is the
    /// concatenation of their elements in this order.
    pub fn input_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| matches!(n.kind(), NodeKind::Input { .. }))
            .map(Node::id)
            .collect()
    }

    pub fn input_size(&self) -> usize {
        self.input_nodes()
            .iter()
            .filter_map(|id| self.node(*id))
            .map(Node::size)
            .fold(0, usize::saturating_add)
    }

    // ── Traversal ───────────────────────────────────────────────────────────

    /// Visit every node in dependency order.
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter::new(self, self.terminal_nodes(), HashSet::new())
    }

    /// Visit the transitive producers of `goals` (goals included) in
    /// dependency order.
    pub fn iter_from(&self, goals: &[NodeId]) -> Result<NodeIter<'_>, GraphError> {
        self.iter_from_excluding(goals, &[])
    }

    /// Like `iter_from`, but nodes in `boundary` count as already visited:
    /// they are neither yielded nor walked through.
    pub fn iter_from_excluding(
        &self,
        goals: &[NodeId],
        boundary: &[NodeId],
    ) -> Result<NodeIter<'_>, GraphError> {
        for id in goals.iter().chain(boundary) {
            self.get(*id)?;
        }
        Ok(NodeIter::new(
            self,
            goals.to_vec(),
            boundary.iter().copied().collect(),
        ))
    }

    // ── Evaluation ──────────────────────────────────────────────────────────

    /// Reference interpreter: compute the values of `outputs` given the
    /// concatenated input vector, laid out by `input_nodes()`.
    pub fn evaluate(
        &self,
        inputs: &[f64],
        outputs: &[PortElements],
    ) -> Result<Vec<f64>, GraphError> {
        self.evaluate_with_layout(&self.input_nodes(), inputs, outputs)
    }

    /// Like `evaluate`, with `layout` naming the Input nodes whose
    /// elements, concatenated in that order, form `inputs`. Every Input
    /// node the outputs depend on must appear in `layout` exactly once.
    pub fn evaluate_with_layout(
        &self,
        layout: &[NodeId],
        inputs: &[f64],
        outputs: &[PortElements],
    ) -> Result<Vec<f64>, GraphError> {
        let mut offsets = HashMap::new();
        let mut offset: usize = 0;
        for &id in layout {
            let node = self.get(id)?;
            if !matches!(node.kind(), NodeKind::Input { .. }) {
                return Err(GraphError::NotAnInput { node: id });
            }
            if offsets.insert(id, offset).is_some() {
                return Err(GraphError::DuplicateInput { node: id });
            }
            offset = offset.saturating_add(node.size());
        }
        if inputs.len() != offset {
            return Err(GraphError::InputLength {
                expected: offset,
                found: inputs.len(),
            });
        }

        let mut goals = Vec::new();
        for elements in outputs {
            self.check_elements(elements)?;
            goals.extend(elements.nodes());
        }

        let mut values: HashMap<NodeId, Vec<f64>> = HashMap::new();
        for node in self.iter_from(&goals)? {
            let computed = match node.kind() {
                NodeKind::Input { size } => {
                    let start = *offsets
                        .get(&node.id())
                        .ok_or(GraphError::UnboundInput { node: node.id() })?;
                    inputs[start..start + size].to_vec()
                }
                _ => {
                    let args = node
                        .inputs()
                        .iter()
                        .map(|p| gather(&values, &p.elements))
                        .collect::<Result<Vec<_>, _>>()?;
                    node.compute(&args)?
                }
            };
            values.insert(node.id(), computed);
        }

        let mut result = Vec::new();
        for elements in outputs {
            result.extend(gather(&values, elements)?);
        }
        Ok(result)
    }

    // ── Reconstruction ──────────────────────────────────────────────────────

    /// Records for every node, in dependency order.
    pub fn to_records(&self) -> Vec<NodeRecord> {
        self.iter()
            .map(|n| NodeRecord {
                id: n.id(),
                kind: n.kind().clone(),
                inputs: n.inputs().iter().map(|p| p.elements.clone()).collect(),
                metadata: n.metadata().clone(),
            })
            .collect()
    }

    /// Rebuild a graph from records listed in dependency order, keeping
    /// their ids.
    pub fn from_records(records: &[NodeRecord]) -> Result<Graph, GraphError> {
        let declared: BTreeSet<NodeId> = records.iter().map(|r| r.id).collect();
        let mut graph = Graph::new();
        for record in records {
            for producer in record.inputs.iter().flat_map(PortElements::nodes) {
                if graph.contains(producer) {
                    continue;
                }
                return Err(if declared.contains(&producer) {
                    GraphError::ForwardReference {
                        node: record.id,
                        producer,
                    }
                } else {
                    GraphError::NodeNotFound { node: producer }
                });
            }
            let mut ids = graph.ids.clone();
            ids.reserve_through(record.id)
                .ok_or(GraphError::IdsExhausted { node: record.id })?;
            graph.insert(
                record.id,
                record.kind.clone(),
                record.inputs.clone(),
                record.metadata.clone(),
            )?;
            graph.ids = ids;
        }
        Ok(graph)
    }
}

fn gather(
    values: &HashMap<NodeId, Vec<f64>>,
    elements: &PortElements,
) -> Result<Vec<f64>, GraphError> {
    let mut out = Vec::with_capacity(elements.len());
    for range in elements.ranges() {
        let produced = values
            .get(&range.node)
            .ok_or(GraphError::NodeNotFound { node: range.node })?;
        out.extend_from_slice(&produced[range.start..range.end()]);
    }
    Ok(out)
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.iter() {
            write!(f, "{}: {}[{}]", node.id(), node.tag(), node.size())?;
            for (i, port) in node.inputs().iter().enumerate() {
                let sep = if i == 0 { " <- " } else { "; " };
                write!(f, "{}{}", sep, port.elements)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Dependency iterator ─────────────────────────────────────────────────────

/// Yields each reachable node exactly once, strictly after all of its
/// producers.
///
/// Explicit stack: a popped node whose producers are not all visited is
/// pushed back underneath them; producers are pushed in reverse input order
/// so the first input is explored first.
pub struct NodeIter<'g> {
    graph: &'g Graph,
    stack: Vec<NodeId>,
    visited: HashSet<NodeId>,
}

impl<'g> NodeIter<'g> {
    fn new(graph: &'g Graph, seeds: Vec<NodeId>, visited: HashSet<NodeId>) -> Self {
        let mut stack = seeds;
        stack.reverse();
        NodeIter {
            graph,
            stack,
            visited,
        }
    }
}

impl<'g> Iterator for NodeIter<'g> {
    type Item = &'g Node;

    fn next(&mut self) -> Option<&'g Node> {
        while let Some(id) = self.stack.pop() {
            if self.visited.contains(&id) {
                continue;
            }
            let Some(node) = self.graph.node(id) else {
                continue;
            };
            let pending: Vec<NodeId> = node
                .producers()
                .into_iter()
                .filter(|p| !self.visited.contains(p))
                .collect();
            if pending.is_empty() {
                self.visited.insert(id);
                return Some(node);
            }
            self.stack.push(id);
            self.stack.extend(pending.into_iter().rev());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::BinaryOp;

    fn chain() -> (Graph, Vec<NodeId>) {
        let mut g = Graph::new();
        let x = g.add_node(NodeKind::Input { size: 3 }, vec![]).unwrap();
        let a = g
            .add_node(
                NodeKind::Scale { factors: vec![2.0] },
                vec![PortElements::full(x, 3)],
            )
            .unwrap();
        let b = g
            .add_node(
                NodeKind::Shift {
                    offsets: vec![5.0],
                },
                vec![PortElements::full(a, 3)],
            )
            .unwrap();
        let c = g
            .add_node(
                NodeKind::Scale { factors: vec![0.5] },
                vec![PortElements::full(b, 3)],
            )
            .unwrap();
        let out = g
            .add_node(NodeKind::Output, vec![PortElements::full(c, 3)])
            .unwrap();
        (g, vec![x, a, b, c, out])
    }

    #[test]
    fn add_node_assigns_sequential_ids() {
        let (g, ids) = chain();
        assert_eq!(ids, vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3), NodeId(4)]);
        assert_eq!(g.len(), 5);
        assert_eq!(g.next_id(), NodeId(5));
    }

    #[test]
    fn unknown_producer_is_rejected() {
        let mut g = Graph::new();
        let err = g
            .add_node(NodeKind::Output, vec![PortElements::full(NodeId(9), 1)])
            .unwrap_err();
        assert_eq!(err, GraphError::NodeNotFound { node: NodeId(9) });
        assert!(g.is_empty());
        // The failed insert did not consume an id.
        assert_eq!(g.next_id(), NodeId(0));
    }

    #[test]
    fn range_and_port_bounds_are_checked() {
        let mut g = Graph::new();
        let x = g.add_node(NodeKind::Input { size: 2 }, vec![]).unwrap();
        let err = g
            .add_node(NodeKind::Output, vec![PortElements::range(x, 0, 1, 2)])
            .unwrap_err();
        assert!(matches!(err, GraphError::RangeOutOfBounds { size: 2, .. }));
        let err = g
            .add_node(NodeKind::Output, vec![PortElements::range(x, 1, 0, 1)])
            .unwrap_err();
        assert!(matches!(err, GraphError::PortOutOfRange { port: 1, .. }));
    }

    #[test]
    fn arity_and_sizes_are_checked() {
        let mut g = Graph::new();
        let x = g.add_node(NodeKind::Input { size: 3 }, vec![]).unwrap();
        let y = g.add_node(NodeKind::Input { size: 2 }, vec![]).unwrap();
        let err = g.add_node(NodeKind::Output, vec![]).unwrap_err();
        assert!(matches!(err, GraphError::Arity { expected: 1, found: 0, .. }));
        let err = g
            .add_node(
                NodeKind::Scale {
                    factors: vec![1.0, 2.0],
                },
                vec![PortElements::full(x, 3)],
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::SizeMismatch { expected: 3, found: 2, .. }));
        let err = g
            .add_node(
                NodeKind::Binary { op: BinaryOp::Add },
                vec![PortElements::full(x, 3), PortElements::full(y, 2)],
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::SizeMismatch { .. }));
    }

    #[test]
    fn lookup_miss_is_not_a_panic() {
        let (g, _) = chain();
        assert!(g.node(NodeId(42)).is_none());
        assert!(g.get(NodeId(42)).is_err());
    }

    #[test]
    fn iteration_follows_dependencies() {
        let (g, ids) = chain();
        let order: Vec<NodeId> = g.iter().map(Node::id).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn iteration_explores_first_input_first() {
        let mut g = Graph::new();
        let a = g.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap();
        let b = g.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap();
        let sum = g
            .add_node(
                NodeKind::Binary { op: BinaryOp::Add },
                vec![PortElements::full(b, 1), PortElements::full(a, 1)],
            )
            .unwrap();
        let order: Vec<NodeId> = g.iter().map(Node::id).collect();
        assert_eq!(order, vec![b, a, sum]);
    }

    #[test]
    fn full_iteration_covers_disconnected_components() {
        let (mut g, _) = chain();
        let y = g.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap();
        let z = g
            .add_node(NodeKind::Output, vec![PortElements::full(y, 1)])
            .unwrap();
        let order: Vec<NodeId> = g.iter().map(Node::id).collect();
        assert_eq!(order.len(), g.len());
        assert_eq!(&order[order.len() - 2..], &[y, z]);
    }

    #[test]
    fn shared_producer_is_visited_once() {
        let mut g = Graph::new();
        let x = g.add_node(NodeKind::Input { size: 2 }, vec![]).unwrap();
        let s = g
            .add_node(
                NodeKind::Scale { factors: vec![3.0] },
                vec![PortElements::full(x, 2)],
            )
            .unwrap();
        let sum = g
            .add_node(
                NodeKind::Binary { op: BinaryOp::Add },
                vec![PortElements::full(s, 2), PortElements::full(x, 2)],
            )
            .unwrap();
        let order: Vec<NodeId> = g.iter().map(Node::id).collect();
        assert_eq!(order, vec![x, s, sum]);
    }

    #[test]
    fn goal_iteration_is_restricted_to_producers() {
        let (g, ids) = chain();
        let order: Vec<NodeId> = g.iter_from(&[ids[2]]).unwrap().map(Node::id).collect();
        assert_eq!(order, ids[..3].to_vec());
        assert!(g.iter_from(&[NodeId(77)]).is_err());
    }

    #[test]
    fn boundary_nodes_are_not_yielded() {
        let (g, ids) = chain();
        let order: Vec<NodeId> = g
            .iter_from_excluding(&[ids[4]], &[ids[2]])
            .unwrap()
            .map(Node::id)
            .collect();
        assert_eq!(order, vec![ids[3], ids[4]]);
    }

    #[test]
    fn evaluate_three_layer_chain() {
        let (g, ids) = chain();
        let out = g
            .evaluate(&[1.0, 2.0, 3.0], &[PortElements::full(ids[4], 3)])
            .unwrap();
        assert_eq!(out, vec![3.5, 4.5, 5.5]);
        let err = g.evaluate(&[1.0], &[PortElements::full(ids[4], 3)]).unwrap_err();
        assert_eq!(err, GraphError::InputLength { expected: 3, found: 1 });
    }

    #[test]
    fn evaluate_concatenates_inputs_in_id_order() {
        let mut g = Graph::new();
        let a = g.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap();
        let b = g.add_node(NodeKind::Input { size: 2 }, vec![]).unwrap();
        let out = g
            .add_node(
                NodeKind::Output,
                vec![PortElements::from_ranges(
                    PortElements::full(b, 2)
                        .ranges()
                        .iter()
                        .chain(PortElements::full(a, 1).ranges())
                        .copied(),
                )],
            )
            .unwrap();
        assert_eq!(g.input_nodes(), vec![a, b]);
        assert_eq!(g.input_size(), 3);
        let values = g
            .evaluate(&[1.0, 2.0, 3.0], &[PortElements::full(out, 3)])
            .unwrap();
        assert_eq!(values, vec![2.0, 3.0, 1.0]);
    }

    #[test]
    fn records_rebuild_the_same_graph() {
        let (g, ids) = chain();
        let records = g.to_records();
        let json = serde_json::to_string(&records).unwrap();
        let parsed: Vec<NodeRecord> = serde_json::from_str(&json).unwrap();
        let rebuilt = Graph::from_records(&parsed).unwrap();
        assert_eq!(rebuilt.len(), g.len());
        assert_eq!(rebuilt.to_records(), records);
        assert_eq!(rebuilt.next_id(), g.next_id());
        assert_eq!(rebuilt.get(ids[1]).unwrap().tag(), "Scale");
    }

    #[test]
    fn records_reject_cycles_and_dangling_references() {
        let (g, _) = chain();
        let mut records = g.to_records();
        records.swap(1, 2);
        let err = Graph::from_records(&records).unwrap_err();
        assert!(matches!(err, GraphError::ForwardReference { .. }));

        let mut records = g.to_records();
        records.remove(0);
        let err = Graph::from_records(&records).unwrap_err();
        assert_eq!(err, GraphError::NodeNotFound { node: NodeId(0) });
    }

    fn input_record(id: NodeId) -> NodeRecord {
        NodeRecord {
            id,
            kind: NodeKind::Input { size: 1 },
            inputs: vec![],
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn records_reject_ids_at_the_end_of_the_id_space() {
        let err = Graph::from_records(&[input_record(NodeId(u32::MAX))]).unwrap_err();
        assert_eq!(err, GraphError::IdsExhausted { node: NodeId(u32::MAX) });
        assert_eq!(err.code(), codes::E0110_IDS_EXHAUSTED);

        let mut g = Graph::from_records(&[input_record(NodeId(u32::MAX - 1))]).unwrap();
        assert_eq!(g.next_id(), NodeId(u32::MAX));
        let err = g.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap_err();
        assert_eq!(err, GraphError::IdsExhausted { node: NodeId(u32::MAX) });
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn records_reject_ranges_ending_past_usize_max() {
        let records = [
            input_record(NodeId(0)),
            NodeRecord {
                id: NodeId(1),
                kind: NodeKind::Output,
                inputs: vec![PortElements::range(NodeId(0), 0, usize::MAX, 1)],
                metadata: BTreeMap::new(),
            },
        ];
        let err = Graph::from_records(&records).unwrap_err();
        assert_eq!(
            err,
            GraphError::RangeOutOfBounds {
                node: NodeId(0),
                port: 0,
                start: usize::MAX,
                len: 1,
                size: 1,
            }
        );
    }

    #[test]
    fn evaluate_with_layout_follows_the_given_order() {
        let mut g = Graph::new();
        let a = g.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap();
        let b = g.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap();
        let s = g
            .add_node(NodeKind::Scale { factors: vec![10.0] }, vec![PortElements::full(a, 1)])
            .unwrap();
        let outputs = [PortElements::full(s, 1), PortElements::full(b, 1)];
        assert_eq!(g.evaluate(&[1.0, 2.0], &outputs).unwrap(), vec![10.0, 2.0]);
        assert_eq!(
            g.evaluate_with_layout(&[b, a], &[1.0, 2.0], &outputs).unwrap(),
            vec![20.0, 1.0]
        );

        let err = g.evaluate_with_layout(&[a], &[1.0], &outputs).unwrap_err();
        assert_eq!(err, GraphError::UnboundInput { node: b });
        let err = g.evaluate_with_layout(&[a, a], &[1.0, 2.0], &outputs).unwrap_err();
        assert_eq!(err, GraphError::DuplicateInput { node: a });
        let err = g.evaluate_with_layout(&[s], &[1.0], &outputs).unwrap_err();
        assert_eq!(err, GraphError::NotAnInput { node: s });
    }

    #[test]
    fn display_lists_nodes_in_order() {
        let (g, _) = chain();
        let text = g.to_string();
        assert_eq!(text.lines().count(), 5);
        assert_eq!(text.lines().next(), Some("0: Input[3]"));
        assert_eq!(text.lines().nth(1), Some("1: Scale[3] <- 0[0..3]"));
    }

    #[test]
    fn errors_carry_codes_and_locations() {
        let err = GraphError::NodeNotFound { node: NodeId(4) };
        let d = err.to_diagnostic();
        assert_eq!(d.to_string(), "error[E0101]: node 4 not found (at node 4)");
    }
}
