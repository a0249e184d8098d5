// passes.rs — Graph-level passes built on the transformer
//
// Each pass consumes a `LoweredGraph` (a graph plus the procedure's input
// layout and output elements) and produces a new one, rebasing the input
// layout and outputs through the transformer's mapping table.
//
// Preconditions: `inputs` lists Input nodes of `graph`; `outputs` reference
//                existing elements of `graph`.
// Postconditions: the returned graph computes the same output values for
//                 the same input vector.
// Failure modes: `TransformError` from the underlying transform.
// Side effects: `debug!` logging of node counts.

use std::collections::HashSet;

use tracing::debug;

use crate::affine::AffineOp;
use crate::graph::Graph;
use crate::id::NodeId;
use crate::node::{param_at, Node, NodeKind};
use crate::port::PortElements;
use crate::transform::{substitute_where, TransformContext, TransformError, Transformer};

/// A graph together with the layout of the procedure compiled from it.
#[derive(Debug, Clone)]
pub struct LoweredGraph {
    pub graph: Graph,
    /// Input nodes whose concatenated elements form the input vector.
    pub inputs: Vec<NodeId>,
    /// Elements whose concatenation forms the output vector.
    pub outputs: Vec<PortElements>,
}

impl LoweredGraph {
    /// Take every Input node of `graph`, in id order, as the input layout.
    pub fn new(graph: Graph, outputs: Vec<PortElements>) -> Result<Self, TransformError> {
        for elements in &outputs {
            graph.check_elements(elements)?;
        }
        Ok(LoweredGraph {
            inputs: graph.input_nodes(),
            graph,
            outputs,
        })
    }

    pub fn input_size(&self) -> usize {
        self.inputs
            .iter()
            .filter_map(|id| self.graph.node(*id))
            .map(Node::size)
            .fold(0, usize::saturating_add)
    }

    pub fn output_size(&self) -> usize {
        self.outputs.iter().map(PortElements::len).sum()
    }

    /// Values of the outputs for the given input vector, laid out by
    /// `inputs`, by interpretation.
    pub fn evaluate(&self, inputs: &[f64]) -> Result<Vec<f64>, TransformError> {
        Ok(self
            .graph
            .evaluate_with_layout(&self.inputs, inputs, &self.outputs)?)
    }

    fn rebase(&self, transformer: &Transformer, graph: Graph) -> Result<Self, TransformError> {
        let inputs = self
            .inputs
            .iter()
            .map(|id| transformer.corresponding_node(*id))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(|o| transformer.corresponding(o))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LoweredGraph {
            graph,
            inputs,
            outputs,
        })
    }
}

// ── Refinement and pruning ──────────────────────────────────────────────────

/// Refine to a fixed point under `context`.
pub fn refine(
    lowered: &LoweredGraph,
    context: &TransformContext,
    max_iterations: usize,
) -> Result<LoweredGraph, TransformError> {
    let mut transformer = Transformer::new();
    let graph = transformer.refine_graph(&lowered.graph, context, max_iterations)?;
    lowered.rebase(&transformer, graph)
}

/// Keep only the input layout and the producers of the outputs. Inputs are
/// copied first, so they take the lowest ids in layout order.
pub fn prune(lowered: &LoweredGraph) -> Result<LoweredGraph, TransformError> {
    let mut goals = Vec::with_capacity(lowered.inputs.len() + lowered.outputs.len());
    for id in &lowered.inputs {
        goals.push(lowered.graph.get(*id)?.output_elements());
    }
    goals.extend(lowered.outputs.iter().cloned());

    let mut transformer = Transformer::new();
    let graph = transformer.copy_submodel(&lowered.graph, &goals)?;
    debug!(before = lowered.graph.len(), after = graph.len(), "pruned");
    lowered.rebase(&transformer, graph)
}

// ── Affine folding ──────────────────────────────────────────────────────────

/// Per-element `(multiply, increment)` parameters of an affine kind.
fn affine_params(kind: &NodeKind) -> Option<(&[f64], &[f64])> {
    const ZERO: &[f64] = &[0.0];
    const ONE: &[f64] = &[1.0];
    match kind {
        NodeKind::Scale { factors } => Some((factors.as_slice(), ZERO)),
        NodeKind::Shift { offsets } => Some((ONE, offsets.as_slice())),
        NodeKind::ScaleShift { scale, shift } => Some((scale.as_slice(), shift.as_slice())),
        _ => None,
    }
}

/// Compose `outer` after `inner`, element by element. Stays broadcast when
/// every parameter vector is.
fn compose(outer: (&[f64], &[f64]), inner: (&[f64], &[f64]), size: usize) -> NodeKind {
    let broadcast = [outer.0, outer.1, inner.0, inner.1]
        .iter()
        .all(|p| p.len() == 1);
    let len = if broadcast { 1 } else { size };
    let (scale, shift) = (0..len)
        .map(|i| {
            let op = AffineOp::new(param_at(outer.0, i), param_at(outer.1, i))
                .compound(&AffineOp::new(param_at(inner.0, i), param_at(inner.1, i)));
            (op.multiply_by(), op.increment_by())
        })
        .unzip();
    NodeKind::ScaleShift { scale, shift }
}

fn fold_into_producer(node: &Node, t: &mut Transformer) -> Result<(), TransformError> {
    let (outer_scale, outer_shift) = match affine_params(node.kind()) {
        Some(params) => params,
        None => return t.copy_node(node).map(|_| ()),
    };
    let inputs = t.transform_inputs(node)?;
    let size = node.size();
    let folded = inputs[0]
        .as_whole_output(size)
        .and_then(|o| t.dest().node(o.node))
        .and_then(|producer| {
            let inner = affine_params(producer.kind())?;
            let source = producer.input(0)?.clone();
            Some((compose((outer_scale, outer_shift), inner, size), source))
        });
    let Some((kind, source)) = folded else {
        return t.copy_node(node).map(|_| ());
    };
    let id = t.add_node_with_metadata(kind, vec![source], node.metadata().clone())?;
    t.map_output(node, PortElements::full(id, size))
}

/// Collapse adjacent Scale / Shift / ScaleShift nodes into single ScaleShift
/// nodes, then prune what the folded chains no longer read.
pub fn fold_affine_chains(lowered: &LoweredGraph) -> Result<LoweredGraph, TransformError> {
    let mut transformer = Transformer::new();
    let callback = substitute_where(
        |node: &Node| affine_params(node.kind()).is_some(),
        fold_into_producer,
    );
    let graph = transformer.transform_graph(&lowered.graph, callback)?;
    let folded = lowered.rebase(&transformer, graph)?;
    prune(&folded)
}

// ── Output annotation ───────────────────────────────────────────────────────

/// Attach `key = value` metadata to the nodes producing `lowered.outputs`,
/// in place. Superseded nodes stay in the graph until the next `prune`.
pub fn annotate_outputs(
    lowered: &mut LoweredGraph,
    key: &str,
    value: &str,
) -> Result<(), TransformError> {
    let producers: HashSet<NodeId> = lowered
        .outputs
        .iter()
        .flat_map(PortElements::nodes)
        .collect();
    let callback = substitute_where(
        move |node: &Node| producers.contains(&node.id()),
        |node: &Node, t: &mut Transformer| {
            let inputs = t.transform_inputs(node)?;
            let mut metadata = node.metadata().clone();
            metadata.insert(key.to_string(), value.to_string());
            let id = t.add_node_with_metadata(node.kind().clone(), inputs, metadata)?;
            t.map_output(node, PortElements::full(id, node.size()))
        },
    );
    let mut transformer = Transformer::new();
    let outputs = transformer.transform_submodel_in_place(
        &mut lowered.graph,
        &[],
        &lowered.outputs,
        callback,
    )?;
    lowered.outputs = outputs;
    lowered.inputs = lowered
        .inputs
        .iter()
        .map(|id| transformer.corresponding_node(*id).unwrap_or(*id))
        .collect();
    Ok(())
}
