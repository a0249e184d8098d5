// transform.rs — Graph-to-graph transformation: copy, refine, submodel transforms
//
// A `Transformer` walks a source graph in dependency order and rebuilds it
// into a destination graph, one node at a time. Every source output that
// has been handled is recorded in a mapping table (source output → elements
// of the destination graph). A node's dependents resolve their inputs
// through that table, so it must be populated before they are visited,
// which the dependency order guarantees.
//
// Preconditions: the source graph is well formed (guaranteed by `Graph`).
// Postconditions: the destination graph computes the same values for every
//                 mapped output; the mapping table relates the two graphs.
// Failure modes: unmapped input references, incomplete refinements, bad
//                arguments → `TransformError`. The source is never mutated.
// Side effects: `trace!`/`debug!` logging of refinement decisions.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use crate::diag::{codes, DiagCode, Diagnose, Location};
use crate::graph::{Graph, GraphError};
use crate::id::NodeId;
use crate::node::{Node, NodeKind};
use crate::port::{OutputRef, PortElements};

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransformError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("output {node}.{port} has no counterpart in the destination graph")]
    Unmapped { node: NodeId, port: usize },
    #[error("node {node} reported a refinement but left its output unmapped")]
    RefineIncomplete { node: NodeId },
    #[error("max_iterations must be positive")]
    InvalidIterations,
    #[error("boundary has {expected} output(s) but {found} destination input(s) were given")]
    BoundaryMismatch { expected: usize, found: usize },
    #[error("node {node} has {expected} output element(s) but was mapped onto {found}")]
    OutputSize {
        node: NodeId,
        expected: usize,
        found: usize,
    },
}

impl Diagnose for TransformError {
    fn code(&self) -> DiagCode {
        match self {
            TransformError::Graph(e) => e.code(),
            TransformError::Unmapped { .. } => codes::E0201_UNMAPPED,
            TransformError::RefineIncomplete { .. } => codes::E0202_REFINE_INCOMPLETE,
            TransformError::InvalidIterations => codes::E0203_INVALID_ITERATIONS,
            TransformError::BoundaryMismatch { .. } => codes::E0204_BOUNDARY_MISMATCH,
            TransformError::OutputSize { .. } => codes::E0205_OUTPUT_SIZE,
        }
    }

    fn location(&self) -> Option<Location> {
        match self {
            TransformError::Graph(e) => e.location(),
            TransformError::Unmapped { node, .. }
            | TransformError::RefineIncomplete { node }
            | TransformError::OutputSize { node, .. } => Some(Location::Node(*node)),
            TransformError::InvalidIterations | TransformError::BoundaryMismatch { .. } => None,
        }
    }
}

// ── Refinement policy ───────────────────────────────────────────────────────

/// What the refinement loop should do with one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    /// No opinion; defer to the next action function or the default.
    Abstain,
    Refine,
    /// Keep the node as is.
    Compile,
}

type ActionFn = Box<dyn Fn(&Node) -> NodeAction>;
type CompilableFn = Box<dyn Fn(&Node) -> bool>;

/// Refinement policy: action functions consulted in insertion order (the
/// first non-`Abstain` answer wins), falling back to "compile if compilable,
/// otherwise refine".
pub struct TransformContext {
    actions: Vec<ActionFn>,
    compilable: CompilableFn,
}

impl Default for TransformContext {
    fn default() -> Self {
        TransformContext {
            actions: Vec::new(),
            compilable: Box::new(|node| node.kind().is_primitive()),
        }
    }
}

impl TransformContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the "is compilable" predicate.
    pub fn with_compilable(mut self, compilable: impl Fn(&Node) -> bool + 'static) -> Self {
        self.compilable = Box::new(compilable);
        self
    }

    pub fn with_action(mut self, action: impl Fn(&Node) -> NodeAction + 'static) -> Self {
        self.actions.push(Box::new(action));
        self
    }

    pub fn is_compilable(&self, node: &Node) -> bool {
        (self.compilable)(node)
    }

    pub fn action_for(&self, node: &Node) -> NodeAction {
        for action in &self.actions {
            match action(node) {
                NodeAction::Abstain => continue,
                decided => return decided,
            }
        }
        if self.is_compilable(node) {
            NodeAction::Compile
        } else {
            NodeAction::Refine
        }
    }
}

// ── Transformer ─────────────────────────────────────────────────────────────

/// Callback invoked once per visited source node.
pub trait TransformFn: FnMut(&Node, &mut Transformer) -> Result<(), TransformError> {}

impl<F> TransformFn for F where F: FnMut(&Node, &mut Transformer) -> Result<(), TransformError> {}

#[derive(Debug, Default)]
pub struct Transformer {
    dest: Graph,
    map: HashMap<OutputRef, PortElements>,
    in_place: bool,
}

impl Transformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The destination graph built so far.
    pub fn dest(&self) -> &Graph {
        &self.dest
    }

    /// Forget the destination graph and the mapping table.
    pub fn reset(&mut self) {
        self.dest = Graph::new();
        self.map.clear();
        self.in_place = false;
    }

    // ── Mapping table ───────────────────────────────────────────────────────

    /// Destination elements for a source output port.
    pub fn corresponding_output(&self, output: OutputRef) -> Result<&PortElements, TransformError> {
        self.map.get(&output).ok_or(TransformError::Unmapped {
            node: output.node,
            port: output.port,
        })
    }

    /// Destination elements for arbitrary source elements, range by range.
    pub fn corresponding(&self, elements: &PortElements) -> Result<PortElements, TransformError> {
        let mut result = PortElements::new();
        for range in elements.ranges() {
            let unmapped = TransformError::Unmapped {
                node: range.node,
                port: range.port,
            };
            let mapped = self.map.get(&range.output()).ok_or(unmapped.clone())?;
            let part = mapped.slice(range.start, range.len).ok_or(unmapped)?;
            result.append(&part);
        }
        Ok(result)
    }

    /// The destination node standing in for a source node whose primary
    /// output was mapped onto one whole destination output.
    pub fn corresponding_node(&self, node: NodeId) -> Result<NodeId, TransformError> {
        let mapped = self.corresponding_output(OutputRef::new(node, 0))?;
        mapped
            .as_whole_output(mapped.len())
            .map(|o| o.node)
            .ok_or(TransformError::Unmapped { node, port: 0 })
    }

    /// The source node's inputs, rewritten to destination elements.
    pub fn transform_inputs(&self, node: &Node) -> Result<Vec<PortElements>, TransformError> {
        node.inputs()
            .iter()
            .map(|p| self.corresponding(&p.elements))
            .collect()
    }

    /// Record `elements` of the destination graph as the new home of
    /// `node`'s primary output.
    pub fn map_output(&mut self, node: &Node, elements: PortElements) -> Result<(), TransformError> {
        if elements.len() != node.size() {
            return Err(TransformError::OutputSize {
                node: node.id(),
                expected: node.size(),
                found: elements.len(),
            });
        }
        self.dest.check_elements(&elements)?;
        self.map.insert(node.output_ref(0), elements);
        Ok(())
    }

    // ── Building the destination ────────────────────────────────────────────

    pub fn add_node(
        &mut self,
        kind: NodeKind,
        inputs: Vec<PortElements>,
    ) -> Result<NodeId, TransformError> {
        Ok(self.dest.add_node(kind, inputs)?)
    }

    pub fn add_node_with_metadata(
        &mut self,
        kind: NodeKind,
        inputs: Vec<PortElements>,
        metadata: BTreeMap<String, String>,
    ) -> Result<NodeId, TransformError> {
        Ok(self.dest.add_node_with_metadata(kind, inputs, metadata)?)
    }

    /// Recreate `node` in the destination, reading from the corresponding
    /// destination elements. When transforming in place, a node whose inputs
    /// did not change is mapped onto itself instead of being duplicated.
    pub fn copy_node(&mut self, node: &Node) -> Result<NodeId, TransformError> {
        let inputs = self.transform_inputs(node)?;
        if self.in_place && self.is_unchanged(node, &inputs) {
            self.map
                .insert(node.output_ref(0), node.output_elements());
            return Ok(node.id());
        }
        let id = self.add_node_with_metadata(
            node.kind().clone(),
            inputs,
            node.metadata().clone(),
        )?;
        self.map_output(node, PortElements::full(id, node.size()))?;
        Ok(id)
    }

    fn is_unchanged(&self, node: &Node, inputs: &[PortElements]) -> bool {
        self.dest.node(node.id()).is_some_and(|existing| {
            existing.kind() == node.kind()
                && existing.metadata() == node.metadata()
                && existing
                    .inputs()
                    .iter()
                    .map(|p| &p.elements)
                    .eq(inputs.iter())
        })
    }

    // ── Whole-graph operations ──────────────────────────────────────────────

    /// Structure-preserving copy of every node.
    pub fn copy_graph(&mut self, source: &Graph) -> Result<Graph, TransformError> {
        self.transform_graph(source, |node: &Node, t: &mut Transformer| {
            t.copy_node(node).map(|_| ())
        })
    }

    /// Copy only the transitive producers of `outputs`.
    pub fn copy_submodel(
        &mut self,
        source: &Graph,
        outputs: &[PortElements],
    ) -> Result<Graph, TransformError> {
        self.transform_submodel(source, outputs, |node: &Node, t: &mut Transformer| {
            t.copy_node(node).map(|_| ())
        })
    }

    /// Run `f` on every node of `source` in dependency order, building a
    /// fresh destination graph.
    pub fn transform_graph(
        &mut self,
        source: &Graph,
        mut f: impl TransformFn,
    ) -> Result<Graph, TransformError> {
        self.reset();
        for node in source.iter() {
            f(node, self)?;
        }
        Ok(std::mem::take(&mut self.dest))
    }

    /// Like `transform_graph`, restricted to the producers of `outputs`.
    pub fn transform_submodel(
        &mut self,
        source: &Graph,
        outputs: &[PortElements],
        mut f: impl TransformFn,
    ) -> Result<Graph, TransformError> {
        self.reset();
        let goals: Vec<NodeId> = outputs.iter().flat_map(PortElements::nodes).collect();
        for node in source.iter_from(&goals)? {
            f(node, self)?;
        }
        Ok(std::mem::take(&mut self.dest))
    }

    /// Transform the nodes between `boundary` and `outputs` onto `dest`.
    ///
    /// `boundary[i]` of the source is identified with `dest_inputs[i]` of
    /// the destination; boundary nodes and everything behind them are not
    /// visited. Returns the destination graph and the destination elements
    /// corresponding to each of `outputs`.
    pub fn transform_submodel_onto(
        &mut self,
        source: &Graph,
        boundary: &[OutputRef],
        outputs: &[PortElements],
        dest: Graph,
        dest_inputs: &[PortElements],
        f: impl TransformFn,
    ) -> Result<(Graph, Vec<PortElements>), TransformError> {
        self.reset();
        self.dest = dest;
        self.run_onto(source, boundary, outputs, dest_inputs, f)
    }

    /// Transform the submodel producing `outputs` within `graph` itself.
    ///
    /// Built on a copy and swapped in at the end, so `graph` is untouched
    /// on failure. Unchanged nodes keep their ids; replaced nodes get new
    /// ones and their stale originals stay behind until the next prune.
    pub fn transform_submodel_in_place(
        &mut self,
        graph: &mut Graph,
        boundary: &[OutputRef],
        outputs: &[PortElements],
        f: impl TransformFn,
    ) -> Result<Vec<PortElements>, TransformError> {
        let dest_inputs = boundary
            .iter()
            .map(|b| -> Result<PortElements, TransformError> {
                let size = graph
                    .output_size(*b)
                    .ok_or(GraphError::PortOutOfRange {
                        node: b.node,
                        port: b.port,
                    })?;
                Ok(PortElements::of_output(*b, size))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.reset();
        self.dest = graph.clone();
        self.in_place = true;
        let (result, mapped) = self.run_onto(graph, boundary, outputs, &dest_inputs, f)?;
        *graph = result;
        Ok(mapped)
    }

    fn run_onto(
        &mut self,
        source: &Graph,
        boundary: &[OutputRef],
        outputs: &[PortElements],
        dest_inputs: &[PortElements],
        mut f: impl TransformFn,
    ) -> Result<(Graph, Vec<PortElements>), TransformError> {
        if boundary.len() != dest_inputs.len() {
            return Err(TransformError::BoundaryMismatch {
                expected: boundary.len(),
                found: dest_inputs.len(),
            });
        }
        for (b, d) in boundary.iter().zip(dest_inputs) {
            let size = source
                .output_size(*b)
                .ok_or(GraphError::PortOutOfRange {
                    node: b.node,
                    port: b.port,
                })?;
            if size != d.len() {
                return Err(TransformError::OutputSize {
                    node: b.node,
                    expected: size,
                    found: d.len(),
                });
            }
            self.dest.check_elements(d)?;
            self.map.insert(*b, d.clone());
        }

        let goals: Vec<NodeId> = outputs.iter().flat_map(PortElements::nodes).collect();
        let stops: Vec<NodeId> = boundary.iter().map(|b| b.node).collect();
        for node in source.iter_from_excluding(&goals, &stops)? {
            f(node, self)?;
        }
        let mapped = outputs
            .iter()
            .map(|o| self.corresponding(o))
            .collect::<Result<Vec<_>, _>>()?;
        self.in_place = false;
        Ok((std::mem::take(&mut self.dest), mapped))
    }

    // ── Refinement ──────────────────────────────────────────────────────────

    /// Refine `source` until every node is compilable under `context`, a
    /// pass refines nothing, or `max_iterations` passes have run.
    ///
    /// The mapping table is composed across passes, so afterwards it relates
    /// outputs of `source` to outputs of the returned graph.
    pub fn refine_graph(
        &mut self,
        source: &Graph,
        context: &TransformContext,
        max_iterations: usize,
    ) -> Result<Graph, TransformError> {
        if max_iterations == 0 {
            return Err(TransformError::InvalidIterations);
        }
        self.reset();
        let mut current = source.clone();
        for iteration in 0..max_iterations {
            self.dest = Graph::new();
            let previous = std::mem::take(&mut self.map);

            let mut refined_any = false;
            for node in current.iter() {
                let action = context.action_for(node);
                let refined = match action {
                    NodeAction::Compile => {
                        self.copy_node(node)?;
                        false
                    }
                    NodeAction::Refine | NodeAction::Abstain => node.refine(self)?,
                };
                if refined {
                    if !self.map.contains_key(&node.output_ref(0)) {
                        return Err(TransformError::RefineIncomplete { node: node.id() });
                    }
                    trace!(node = %node.id(), tag = node.tag(), "refined");
                }
                refined_any |= refined;
            }

            if !previous.is_empty() {
                let composed = previous
                    .into_iter()
                    .map(|(k, v)| -> Result<_, TransformError> {
                        Ok((k, self.corresponding(&v)?))
                    })
                    .collect::<Result<HashMap<_, _>, _>>()?;
                self.map = composed;
            }

            current = std::mem::take(&mut self.dest);
            let remaining = Self::uncompilable_nodes(&current, context).len();
            debug!(iteration, refined_any, remaining, nodes = current.len(), "refine pass");
            if !refined_any || remaining == 0 {
                break;
            }
        }
        Ok(current)
    }

    /// Nodes `context` does not consider compilable, in dependency order.
    pub fn uncompilable_nodes(graph: &Graph, context: &TransformContext) -> Vec<NodeId> {
        graph
            .iter()
            .filter(|n| !context.is_compilable(n))
            .map(Node::id)
            .collect()
    }
}

/// Build a transform callback that hands nodes matching `predicate` to
/// `replace` and copies every other node.
pub fn substitute_where<P, R>(predicate: P, mut replace: R) -> impl TransformFn
where
    P: Fn(&Node) -> bool,
    R: FnMut(&Node, &mut Transformer) -> Result<(), TransformError>,
{
    move |node: &Node, t: &mut Transformer| {
        if predicate(node) {
            replace(node, t)
        } else {
            t.copy_node(node).map(|_| ())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::UnaryOp;

    struct Fixture {
        graph: Graph,
        input: NodeId,
        norm: NodeId,
        neg: NodeId,
        out: NodeId,
        side: NodeId,
    }

    /// Input(2) -> Normalize -> Negate -> Output, plus a side branch
    /// Input -> Unary(Abs) that nothing reads.
    fn fixture() -> Fixture {
        let mut graph = Graph::new();
        let input = graph.add_node(NodeKind::Input { size: 2 }, vec![]).unwrap();
        let norm = graph
            .add_node(
                NodeKind::Normalize {
                    mean: vec![1.0, 2.0],
                    variance: vec![4.0],
                    epsilon: 0.0,
                },
                vec![PortElements::full(input, 2)],
            )
            .unwrap();
        let neg = graph
            .add_node(
                NodeKind::Unary {
                    op: UnaryOp::Negate,
                },
                vec![PortElements::full(norm, 2)],
            )
            .unwrap();
        let out = graph
            .add_node(NodeKind::Output, vec![PortElements::full(neg, 2)])
            .unwrap();
        let side = graph
            .add_node(
                NodeKind::Unary { op: UnaryOp::Abs },
                vec![PortElements::full(input, 2)],
            )
            .unwrap();
        Fixture {
            graph,
            input,
            norm,
            neg,
            out,
            side,
        }
    }

    #[test]
    fn copy_preserves_size_and_structure() {
        let f = fixture();
        let mut t = Transformer::new();
        let copy = t.copy_graph(&f.graph).unwrap();
        assert_eq!(copy.len(), f.graph.len());
        let tags: Vec<_> = copy.iter().map(Node::tag).collect();
        let original: Vec<_> = f.graph.iter().map(Node::tag).collect();
        assert_eq!(tags, original);
        assert!(t.corresponding_node(f.side).is_ok());
    }

    #[test]
    fn submodel_copy_keeps_only_producers() {
        let f = fixture();
        let mut t = Transformer::new();
        let sub = t
            .copy_submodel(&f.graph, &[PortElements::full(f.norm, 2)])
            .unwrap();
        assert_eq!(sub.len(), 2);
        assert!(t.corresponding_node(f.out).is_err());
    }

    #[test]
    fn refine_lowers_to_primitives_and_preserves_values() {
        let f = fixture();
        let mut t = Transformer::new();
        let refined = t
            .refine_graph(&f.graph, &TransformContext::new(), 10)
            .unwrap();
        assert!(Transformer::uncompilable_nodes(&refined, &TransformContext::new()).is_empty());
        let tags: Vec<_> = refined.iter().map(Node::tag).collect();
        assert_eq!(tags, vec!["Input", "Shift", "Scale", "Scale", "Output", "Unary"]);

        let out = t.corresponding_output(OutputRef::new(f.out, 0)).unwrap().clone();
        let x = [5.0, -2.0];
        let expected = f
            .graph
            .evaluate(&x, &[PortElements::full(f.out, 2)])
            .unwrap();
        assert_eq!(refined.evaluate(&x, &[out]).unwrap(), expected);
        assert_eq!(expected, vec![-2.0, 2.0]);
    }

    #[test]
    fn compile_action_blocks_refinement() {
        let f = fixture();
        let context = TransformContext::new().with_action(|n| match n.kind() {
            NodeKind::Normalize { .. } => NodeAction::Compile,
            _ => NodeAction::Abstain,
        });
        let mut t = Transformer::new();
        let refined = t.refine_graph(&f.graph, &context, 10).unwrap();
        assert!(refined
            .nodes()
            .any(|n| matches!(n.kind(), NodeKind::Normalize { .. })));
        assert!(!refined
            .nodes()
            .any(|n| matches!(n.kind(), NodeKind::Unary { op: UnaryOp::Negate })));
    }

    #[test]
    fn mapping_is_composed_across_iterations() {
        let f = fixture();
        // Treating Scale as uncompilable forces a second pass that refines
        // nothing; the map must still lead from the original graph.
        let context = TransformContext::new().with_compilable(|n| {
            n.kind().is_primitive() && !matches!(n.kind(), NodeKind::Scale { .. })
        });
        let mut t = Transformer::new();
        let refined = t.refine_graph(&f.graph, &context, 10).unwrap();
        let neg = t.corresponding_node(f.neg).unwrap();
        assert_eq!(refined.get(neg).unwrap().tag(), "Scale");
        let input = t.corresponding_node(f.input).unwrap();
        assert_eq!(refined.get(input).unwrap().tag(), "Input");
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let f = fixture();
        let err = Transformer::new()
            .refine_graph(&f.graph, &TransformContext::new(), 0)
            .unwrap_err();
        assert_eq!(err, TransformError::InvalidIterations);
        assert_eq!(err.code(), codes::E0203_INVALID_ITERATIONS);
    }

    #[test]
    fn unmapped_reference_is_an_error() {
        let f = fixture();
        let t = Transformer::new();
        let err = t.corresponding(&PortElements::full(f.norm, 2)).unwrap_err();
        assert_eq!(err, TransformError::Unmapped { node: f.norm, port: 0 });
    }

    #[test]
    fn map_output_checks_size() {
        let f = fixture();
        let mut t = Transformer::new();
        let x = t.add_node(NodeKind::Input { size: 1 }, vec![]).unwrap();
        let node = f.graph.get(f.norm).unwrap();
        let err = t.map_output(node, PortElements::full(x, 1)).unwrap_err();
        assert!(matches!(err, TransformError::OutputSize { expected: 2, found: 1, .. }));
    }

    #[test]
    fn submodel_onto_another_graph() {
        let f = fixture();
        let mut dest = Graph::new();
        let feed = dest.add_node(NodeKind::Input { size: 2 }, vec![]).unwrap();
        let mut t = Transformer::new();
        let (dest, outputs) = t
            .transform_submodel_onto(
                &f.graph,
                &[OutputRef::new(f.norm, 0)],
                &[PortElements::full(f.out, 2)],
                dest,
                &[PortElements::full(feed, 2)],
                |n: &Node, t: &mut Transformer| t.copy_node(n).map(|_| ()),
            )
            .unwrap();
        // feed + Negate + Output; Normalize and its input stay behind.
        assert_eq!(dest.len(), 3);
        assert_eq!(
            dest.evaluate(&[1.0, -4.0], &outputs).unwrap(),
            vec![-1.0, 4.0]
        );
    }

    #[test]
    fn boundary_arity_is_checked() {
        let f = fixture();
        let err = Transformer::new()
            .transform_submodel_onto(
                &f.graph,
                &[OutputRef::new(f.norm, 0)],
                &[PortElements::full(f.out, 2)],
                Graph::new(),
                &[],
                |n: &Node, t: &mut Transformer| t.copy_node(n).map(|_| ()),
            )
            .unwrap_err();
        assert_eq!(err, TransformError::BoundaryMismatch { expected: 1, found: 0 });
    }

    #[test]
    fn in_place_copy_elides_unchanged_nodes() {
        let f = fixture();
        let mut graph = f.graph.clone();
        let mut t = Transformer::new();
        let outputs = t
            .transform_submodel_in_place(
                &mut graph,
                &[],
                &[PortElements::full(f.out, 2)],
                |n: &Node, t: &mut Transformer| t.copy_node(n).map(|_| ()),
            )
            .unwrap();
        assert_eq!(graph.len(), f.graph.len());
        assert_eq!(outputs, vec![PortElements::full(f.out, 2)]);
    }

    #[test]
    fn substitution_rewrites_matching_nodes() {
        let f = fixture();
        let mut t = Transformer::new();
        let callback = substitute_where(
            |n: &Node| matches!(n.kind(), NodeKind::Unary { op: UnaryOp::Negate }),
            |n: &Node, t: &mut Transformer| {
                let inputs = t.transform_inputs(n)?;
                let id = t.add_node(NodeKind::Scale { factors: vec![-1.0] }, inputs)?;
                t.map_output(n, PortElements::full(id, n.size()))
            },
        );
        let rewritten = t.transform_graph(&f.graph, callback).unwrap();
        assert_eq!(rewritten.len(), f.graph.len());
        let neg = t.corresponding_node(f.neg).unwrap();
        assert_eq!(rewritten.get(neg).unwrap().tag(), "Scale");
    }
}
