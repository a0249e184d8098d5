// coords.rs — Coordinate action graph and backward affine fusion
//
// Lowers a graph of coordinatewise affine nodes to one bookkeeping entry
// per scalar element ("coordinate"). Each element holds a queue of pending
// actions: "once my value is known, accumulate `op(value)` into `target`".
// The backward pass walks nodes from outputs toward inputs and composes
// every queued action with the node's own per-element operation, moving it
// onto the element the node reads from. A chain of any length collapses to
// one action per input element.
//
// Preconditions: every node between the listed inputs and the outputs is
//                Input, Scale, Shift, ScaleShift or Output.
// Postconditions: after `fuse`, in fused mode every surviving action sits on
//                 an input element and targets a synthetic output element.
// Failure modes: any other node kind, an Input missing from or repeated
//                in the layout, a non-Input in the layout → `FusionError`,
//                raised by `build` before any action is queued.
// Side effects: `debug!` logging of fusion statistics.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;

use tracing::debug;

use crate::affine::AffineOp;
use crate::diag::{codes, DiagCode, Diagnose, Location};
use crate::emit::Variable;
use crate::graph::{Graph, GraphError};
use crate::id::NodeId;
use crate::node::{param_at, Node, NodeKind};
use crate::port::PortElements;

// ── Coordinates and actions ─────────────────────────────────────────────────

/// One scalar element: `(node, element index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    pub node: NodeId,
    pub element: usize,
}

impl Coordinate {
    pub fn new(node: NodeId, element: usize) -> Self {
        Coordinate { node, element }
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.node, self.element)
    }
}

/// Accumulate `op(source)` into `target` once the source value is known.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Action {
    pub op: AffineOp,
    pub target: Coordinate,
}

/// Per-coordinate bookkeeping, owned by one fusion/emission run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementNode {
    pub(crate) actions: VecDeque<Action>,
    pub(crate) initialized: bool,
    pub(crate) fixed: Option<Variable>,
    pub(crate) temp: Option<usize>,
    pub(crate) pending: usize,
}

impl ElementNode {
    fn fixed(variable: Variable, pending: usize) -> Self {
        ElementNode {
            fixed: Some(variable),
            pending,
            ..Default::default()
        }
    }

    pub fn actions(&self) -> &VecDeque<Action> {
        &self.actions
    }

    /// At least one action has already been accumulated into this element.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Procedure input or output storage this element is bound to.
    pub fn fixed_variable(&self) -> Option<Variable> {
        self.fixed
    }

    pub fn temp_slot(&self) -> Option<usize> {
        self.temp
    }

    /// Producer actions that still have to fire before the value is final.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Where the element's value currently lives.
    pub fn variable(&self) -> Option<Variable> {
        self.temp.map(Variable::Temp).or(self.fixed)
    }
}

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FusionError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("{tag} node {node} has no per-element affine form and cannot be fused")]
    Unsupported { node: NodeId, tag: &'static str },
    #[error("Input node {node} is not part of the procedure input layout")]
    UnlistedInput { node: NodeId },
    #[error("{tag} node {node} is listed as a procedure input but is not an Input node")]
    NotAnInput { node: NodeId, tag: &'static str },
    #[error("Input node {node} appears more than once in the procedure input layout")]
    DuplicateInput { node: NodeId },
    #[error("node {node} reads output port {port}; only port 0 can be fused")]
    MultiPort { node: NodeId, port: usize },
    #[error("coordinate graph has already been fused")]
    AlreadyFused,
    #[error("fusion invariant violated at {coordinate}: {detail}")]
    Invariant {
        coordinate: Coordinate,
        detail: &'static str,
    },
}

impl Diagnose for FusionError {
    fn code(&self) -> DiagCode {
        match self {
            FusionError::Graph(e) => e.code(),
            FusionError::Unsupported { .. } => codes::E0301_UNSUPPORTED_NODE,
            FusionError::UnlistedInput { .. } => codes::E0302_UNLISTED_INPUT,
            FusionError::MultiPort { .. } => codes::E0303_MULTI_PORT,
            FusionError::AlreadyFused | FusionError::Invariant { .. } => {
                codes::E0304_FUSION_INVARIANT
            }
            FusionError::NotAnInput { .. } => codes::E0305_NOT_AN_INPUT,
            FusionError::DuplicateInput { .. } => codes::E0306_DUPLICATE_INPUT,
        }
    }

    fn location(&self) -> Option<Location> {
        match self {
            FusionError::Graph(e) => e.location(),
            FusionError::Unsupported { node, .. }
            | FusionError::UnlistedInput { node }
            | FusionError::NotAnInput { node, .. }
            | FusionError::DuplicateInput { node }
            | FusionError::MultiPort { node, .. } => Some(Location::Node(*node)),
            FusionError::Invariant { coordinate, .. } => Some(Location::Coordinate(*coordinate)),
            FusionError::AlreadyFused => None,
        }
    }
}

// ── Fusion modes ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMode {
    /// Compose chains into one action per input element.
    #[default]
    Fuse,
    /// Keep one action per node element; every intermediate is stored.
    Materialize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FusionStats {
    /// Actions composed and moved one layer toward the inputs.
    pub fused: usize,
    /// Actions dropped because their composed operation was null.
    pub pruned: usize,
    /// Intermediate elements kept as stored values.
    pub materialized: usize,
}

// ── Coordinate graph ────────────────────────────────────────────────────────

/// One affine node: its per-element operation and the element each output
/// element reads.
#[derive(Debug, Clone)]
struct Layer {
    node: NodeId,
    ops: Vec<AffineOp>,
    sources: Vec<Coordinate>,
}

#[derive(Debug, Clone)]
pub struct CoordinateGraph {
    elements: BTreeMap<Coordinate, ElementNode>,
    layers: Vec<Layer>,
    inputs: Vec<(NodeId, usize)>,
    outputs: Vec<Coordinate>,
    output_layer: NodeId,
    mode: Option<FusionMode>,
}

/// Per-element operation of a fusable node, `None` for the procedure
/// inputs themselves.
fn element_ops(node: &Node) -> Result<Option<Vec<AffineOp>>, FusionError> {
    let n = node.size();
    let ops = match node.kind() {
        NodeKind::Input { .. } => return Ok(None),
        NodeKind::Scale { factors } => (0..n)
            .map(|i| AffineOp::scale(param_at(factors, i)))
            .collect(),
        NodeKind::Shift { offsets } => (0..n)
            .map(|i| AffineOp::shift(param_at(offsets, i)))
            .collect(),
        NodeKind::ScaleShift { scale, shift } => (0..n)
            .map(|i| AffineOp::new(param_at(scale, i), param_at(shift, i)))
            .collect(),
        NodeKind::Output => vec![AffineOp::IDENTITY; n],
        NodeKind::Constant { .. }
        | NodeKind::Normalize { .. }
        | NodeKind::Unary { .. }
        | NodeKind::Binary { .. } => {
            return Err(FusionError::Unsupported {
                node: node.id(),
                tag: node.tag(),
            })
        }
    };
    Ok(Some(ops))
}

fn slot(
    elements: &mut BTreeMap<Coordinate, ElementNode>,
    coordinate: Coordinate,
) -> Result<&mut ElementNode, FusionError> {
    elements.get_mut(&coordinate).ok_or(FusionError::Invariant {
        coordinate,
        detail: "no element node",
    })
}

impl CoordinateGraph {
    /// Build element nodes for the producers of `outputs`.
    ///
    /// `inputs` is the procedure input layout: element `e` of `inputs[k]`
    /// is procedure input `offset(k) + e`; each Input appears once. Output element `j` (counting
    /// through the concatenation of `outputs`) becomes the synthetic
    /// coordinate `(graph.next_id(), j)`, bound to procedure output `j`
    /// and seeded with one identity action from the element it reads.
    pub fn build(
        graph: &Graph,
        inputs: &[NodeId],
        outputs: &[PortElements],
    ) -> Result<Self, FusionError> {
        let mut elements = BTreeMap::new();
        let mut layout = Vec::with_capacity(inputs.len());
        let mut listed = HashSet::with_capacity(inputs.len());
        let mut offset = 0;
        for &id in inputs {
            if !listed.insert(id) {
                return Err(FusionError::DuplicateInput { node: id });
            }
            let node = graph.get(id)?;
            let NodeKind::Input { size } = *node.kind() else {
                return Err(FusionError::NotAnInput {
                    node: id,
                    tag: node.tag(),
                });
            };
            for e in 0..size {
                elements.insert(
                    Coordinate::new(id, e),
                    ElementNode::fixed(Variable::Input(offset + e), 0),
                );
            }
            layout.push((id, size));
            offset += size;
        }

        let mut goals = Vec::new();
        for elements in outputs {
            graph.check_elements(elements)?;
            for range in elements.ranges() {
                if range.port != 0 {
                    return Err(FusionError::MultiPort {
                        node: range.node,
                        port: range.port,
                    });
                }
            }
            goals.extend(elements.nodes());
        }

        let mut layers = Vec::new();
        for node in graph.iter_from(&goals)? {
            let Some(ops) = element_ops(node)? else {
                if !listed.contains(&node.id()) {
                    return Err(FusionError::UnlistedInput { node: node.id() });
                }
                continue;
            };
            let reads = node.input(0).ok_or(FusionError::Graph(GraphError::Arity {
                node: node.id(),
                tag: node.tag(),
                expected: 1,
                found: 0,
            }))?;
            let mut sources = Vec::with_capacity(reads.len());
            for r in reads.elements() {
                if r.port != 0 {
                    return Err(FusionError::MultiPort {
                        node: r.node,
                        port: r.port,
                    });
                }
                sources.push(Coordinate::new(r.node, r.index));
            }
            for e in 0..node.size() {
                elements.insert(Coordinate::new(node.id(), e), ElementNode::default());
            }
            layers.push(Layer {
                node: node.id(),
                ops,
                sources,
            });
        }

        let output_layer = graph.next_id();
        let mut output_sources = Vec::new();
        for (j, r) in outputs.iter().flat_map(PortElements::elements).enumerate() {
            let source = Coordinate::new(r.node, r.index);
            let target = Coordinate::new(output_layer, j);
            elements.insert(target, ElementNode::fixed(Variable::Output(j), 1));
            slot(&mut elements, source)?.actions.push_back(Action {
                op: AffineOp::IDENTITY,
                target,
            });
            output_sources.push(source);
        }

        Ok(CoordinateGraph {
            elements,
            layers,
            inputs: layout,
            outputs: output_sources,
            output_layer,
            mode: None,
        })
    }

    /// Backward pass over the layers, outputs first.
    ///
    /// In `Fuse` mode each queued action `(op, target)` on a node's element
    /// becomes `(op ∘ op_self, target)` on the element it reads; a composed
    /// operation that is null is dropped and its target's pending count
    /// decremented instead. In `Materialize` mode each live element gets one
    /// `(op_self, itself)` action on its source and keeps its own queue.
    pub fn fuse(&mut self, mode: FusionMode) -> Result<FusionStats, FusionError> {
        if self.mode.is_some() {
            return Err(FusionError::AlreadyFused);
        }
        let mut stats = FusionStats::default();
        let elements = &mut self.elements;
        for layer in self.layers.iter().rev() {
            for (e, (op_self, &source)) in layer.ops.iter().zip(&layer.sources).enumerate() {
                let here = Coordinate::new(layer.node, e);
                match mode {
                    FusionMode::Fuse => {
                        let queued = std::mem::take(&mut slot(elements, here)?.actions);
                        for action in queued {
                            let composed = action.op.compound(op_self);
                            if composed.is_null() {
                                let target = slot(elements, action.target)?;
                                target.pending = target.pending.checked_sub(1).ok_or(
                                    FusionError::Invariant {
                                        coordinate: action.target,
                                        detail: "pending count underflow",
                                    },
                                )?;
                                stats.pruned += 1;
                            } else {
                                slot(elements, source)?.actions.push_back(Action {
                                    op: composed,
                                    target: action.target,
                                });
                                stats.fused += 1;
                            }
                        }
                    }
                    FusionMode::Materialize => {
                        let element = slot(elements, here)?;
                        if element.actions.is_empty() {
                            continue;
                        }
                        element.pending += 1;
                        slot(elements, source)?.actions.push_back(Action {
                            op: *op_self,
                            target: here,
                        });
                        stats.materialized += 1;
                    }
                }
            }
        }
        self.mode = Some(mode);
        debug!(
            ?mode,
            fused = stats.fused,
            pruned = stats.pruned,
            materialized = stats.materialized,
            elements = self.elements.len(),
            "coordinate fusion"
        );
        Ok(stats)
    }

    pub fn mode(&self) -> Option<FusionMode> {
        self.mode
    }

    pub fn element(&self, coordinate: Coordinate) -> Option<&ElementNode> {
        self.elements.get(&coordinate)
    }

    pub(crate) fn element_mut(&mut self, coordinate: Coordinate) -> Option<&mut ElementNode> {
        self.elements.get_mut(&coordinate)
    }

    /// Every element node in coordinate order.
    pub fn elements(&self) -> impl Iterator<Item = (Coordinate, &ElementNode)> {
        self.elements.iter().map(|(c, e)| (*c, e))
    }

    /// Number of element nodes, synthetic outputs included.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn input_size(&self) -> usize {
        self.inputs.iter().map(|(_, size)| size).sum()
    }

    /// Input coordinates in procedure input order.
    pub fn input_coordinates(&self) -> Vec<Coordinate> {
        self.inputs
            .iter()
            .flat_map(|&(id, size)| (0..size).map(move |e| Coordinate::new(id, e)))
            .collect()
    }

    /// The graph coordinates the procedure outputs read, in output order.
    pub fn output_coordinates(&self) -> &[Coordinate] {
        &self.outputs
    }

    pub fn output_size(&self) -> usize {
        self.outputs.len()
    }

    /// Synthetic coordinate standing for procedure output `j`.
    pub fn output_target(&self, j: usize) -> Coordinate {
        Coordinate::new(self.output_layer, j)
    }
}
