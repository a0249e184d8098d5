// node.rs — Node kinds and the per-node contract
//
// A node is an immutable unit of computation: a kind (with its constant
// parameters), input ports referencing other nodes' outputs, and output
// ports of fixed size. Every kind answers the same contract: output size,
// a pure compute function, copy, refine, and a type tag for dispatch.
//
// Kinds form a closed enum so that passes dispatch with an exhaustive
// `match` instead of runtime type checks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::graph::GraphError;
use crate::id::NodeId;
use crate::port::{InputPort, OutputPort, OutputRef, PortElements};
use crate::transform::{TransformError, Transformer};

// ── Element-wise operators ──────────────────────────────────────────────────

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum UnaryOp {
    Negate,
    Abs,
    Sqrt,
    Exp,
    Log,
    Tanh,
}

impl UnaryOp {
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Negate => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Tanh => x.tanh(),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Subtract => a - b,
            BinaryOp::Multiply => a * b,
            BinaryOp::Divide => a / b,
        }
    }
}

// ── Node kinds ──────────────────────────────────────────────────────────────

/// The kind of a graph node and its constant parameters.
///
/// Parameter vectors hold either one value (broadcast over every element)
/// or one value per input element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, strum_macros::IntoStaticStr)]
#[serde(tag = "type")]
pub enum NodeKind {
    /// A true input of the model; values are supplied by the caller.
    Input { size: usize },
    Constant { values: Vec<f64> },
    /// Coordinatewise `x * factor`.
    Scale { factors: Vec<f64> },
    /// Coordinatewise `x + offset`.
    Shift { offsets: Vec<f64> },
    /// Coordinatewise `x * scale + shift`.
    ScaleShift { scale: Vec<f64>, shift: Vec<f64> },
    /// Coordinatewise `(x - mean) / sqrt(variance + epsilon)`.
    Normalize {
        mean: Vec<f64>,
        variance: Vec<f64>,
        epsilon: f64,
    },
    Unary { op: UnaryOp },
    Binary { op: BinaryOp },
    /// Passes its input through; marks values the model exposes.
    Output,
}

impl NodeKind {
    /// Stable type tag (the variant name).
    pub fn tag(&self) -> &'static str {
        self.into()
    }

    pub fn input_names(&self) -> &'static [&'static str] {
        match self {
            NodeKind::Input { .. } | NodeKind::Constant { .. } => &[],
            NodeKind::Binary { .. } => &["input_a", "input_b"],
            NodeKind::Scale { .. }
            | NodeKind::Shift { .. }
            | NodeKind::ScaleShift { .. }
            | NodeKind::Normalize { .. }
            | NodeKind::Unary { .. }
            | NodeKind::Output => &["input"],
        }
    }

    /// Primitive kinds never refine themselves.
    pub fn is_primitive(&self) -> bool {
        match self {
            NodeKind::Normalize { .. } => false,
            NodeKind::Unary { op } => *op != UnaryOp::Negate,
            NodeKind::Input { .. }
            | NodeKind::Constant { .. }
            | NodeKind::Scale { .. }
            | NodeKind::Shift { .. }
            | NodeKind::ScaleShift { .. }
            | NodeKind::Binary { .. }
            | NodeKind::Output => true,
        }
    }

    /// Check the kind's parameters against its input sizes and return the
    /// size of its output.
    pub(crate) fn check(&self, id: NodeId, input_sizes: &[usize]) -> Result<usize, GraphError> {
        let expected = self.input_names().len();
        if input_sizes.len() != expected {
            return Err(GraphError::Arity {
                node: id,
                tag: self.tag(),
                expected,
                found: input_sizes.len(),
            });
        }
        let n = input_sizes.first().copied().unwrap_or(0);
        match self {
            NodeKind::Input { size } => Ok(*size),
            NodeKind::Constant { values } => Ok(values.len()),
            NodeKind::Scale { factors } => {
                check_params(id, self.tag(), factors, n)?;
                Ok(n)
            }
            NodeKind::Shift { offsets } => {
                check_params(id, self.tag(), offsets, n)?;
                Ok(n)
            }
            NodeKind::ScaleShift { scale, shift } => {
                check_params(id, self.tag(), scale, n)?;
                check_params(id, self.tag(), shift, n)?;
                Ok(n)
            }
            NodeKind::Normalize { mean, variance, .. } => {
                check_params(id, self.tag(), mean, n)?;
                check_params(id, self.tag(), variance, n)?;
                Ok(n)
            }
            NodeKind::Binary { .. } => {
                if input_sizes[1] != n {
                    return Err(GraphError::SizeMismatch {
                        node: id,
                        tag: self.tag(),
                        expected: n,
                        found: input_sizes[1],
                    });
                }
                Ok(n)
            }
            NodeKind::Unary { .. } | NodeKind::Output => Ok(n),
        }
    }
}

fn check_params(id: NodeId, tag: &'static str, params: &[f64], n: usize) -> Result<(), GraphError> {
    if params.len() == 1 || params.len() == n {
        Ok(())
    } else {
        Err(GraphError::SizeMismatch {
            node: id,
            tag,
            expected: n,
            found: params.len(),
        })
    }
}

/// Parameter for element `index`, broadcasting single-valued vectors.
pub fn param_at(params: &[f64], index: usize) -> f64 {
    if params.len() == 1 {
        params[0]
    } else {
        params[index]
    }
}

// ── Node ────────────────────────────────────────────────────────────────────

/// A node in the model graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
    metadata: BTreeMap<String, String>,
}

impl Node {
    /// Assemble a node whose kind has already been checked against its
    /// inputs; `output_size` is the result of that check.
    pub(crate) fn new(
        id: NodeId,
        kind: NodeKind,
        inputs: Vec<PortElements>,
        output_size: usize,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        let inputs = kind
            .input_names()
            .iter()
            .zip(inputs)
            .map(|(name, elements)| InputPort { name, elements })
            .collect();
        Node {
            id,
            kind,
            inputs,
            outputs: vec![OutputPort {
                name: "output",
                size: output_size,
            }],
            metadata,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn tag(&self) -> &'static str {
        self.kind.tag()
    }

    pub fn inputs(&self) -> &[InputPort] {
        &self.inputs
    }

    pub fn input(&self, index: usize) -> Option<&PortElements> {
        self.inputs.get(index).map(|p| &p.elements)
    }

    pub fn outputs(&self) -> &[OutputPort] {
        &self.outputs
    }

    pub fn output_size(&self, port: usize) -> Option<usize> {
        self.outputs.get(port).map(|p| p.size)
    }

    /// Size of the primary (port 0) output.
    pub fn size(&self) -> usize {
        self.outputs[0].size
    }

    pub fn output_ref(&self, port: usize) -> OutputRef {
        OutputRef::new(self.id, port)
    }

    /// Every element of the primary output.
    pub fn output_elements(&self) -> PortElements {
        PortElements::full(self.id, self.size())
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn has_metadata(&self, key: &str) -> bool {
        self.metadata.contains_key(key)
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Producer ids in input-port order, then range order. Repeats are kept.
    pub fn producers(&self) -> Vec<NodeId> {
        self.inputs
            .iter()
            .flat_map(|p| p.elements.nodes())
            .collect()
    }

    /// Compute the primary output from the values of each input port.
    /// Pure: depends only on `inputs` and the node's constant parameters.
    ///
    /// `inputs` must hold one vector per input port, each as long as the
    /// elements that port reads; otherwise `Arity` or `SizeMismatch`.
    pub fn compute(&self, inputs: &[Vec<f64>]) -> Result<Vec<f64>, GraphError> {
        if inputs.len() != self.inputs.len() {
            return Err(GraphError::Arity {
                node: self.id,
                tag: self.tag(),
                expected: self.inputs.len(),
                found: inputs.len(),
            });
        }
        for (port, values) in self.inputs.iter().zip(inputs) {
            if values.len() != port.elements.len() {
                return Err(GraphError::SizeMismatch {
                    node: self.id,
                    tag: self.tag(),
                    expected: port.elements.len(),
                    found: values.len(),
                });
            }
        }
        let coordinatewise = |f: &dyn Fn(usize, f64) -> f64| -> Vec<f64> {
            inputs[0]
                .iter()
                .enumerate()
                .map(|(i, &x)| f(i, x))
                .collect()
        };
        let values = match &self.kind {
            NodeKind::Input { .. } => {
                return Err(GraphError::NotComputable {
                    node: self.id,
                    tag: self.tag(),
                })
            }
            NodeKind::Constant { values } => values.clone(),
            NodeKind::Scale { factors } => coordinatewise(&|i, x| x * param_at(factors, i)),
            NodeKind::Shift { offsets } => coordinatewise(&|i, x| x + param_at(offsets, i)),
            NodeKind::ScaleShift { scale, shift } => {
                coordinatewise(&|i, x| x * param_at(scale, i) + param_at(shift, i))
            }
            NodeKind::Normalize {
                mean,
                variance,
                epsilon,
            } => coordinatewise(&|i, x| {
                (x - param_at(mean, i)) / (param_at(variance, i) + epsilon).sqrt()
            }),
            NodeKind::Unary { op } => coordinatewise(&|_, x| op.apply(x)),
            NodeKind::Binary { op } => inputs[0]
                .iter()
                .zip(&inputs[1])
                .map(|(&a, &b)| op.apply(a, b))
                .collect(),
            NodeKind::Output => inputs[0].clone(),
        };
        Ok(values)
    }

    /// Recreate this node in the transformer's destination graph, reading
    /// from the corresponding destination outputs.
    pub fn copy(&self, transformer: &mut Transformer) -> Result<NodeId, TransformError> {
        transformer.copy_node(self)
    }

    /// Replace this node with an equivalent subgraph of simpler nodes in the
    /// transformer's destination graph. Returns `false` (after copying the
    /// node unchanged) when the kind has no refinement.
    pub fn refine(&self, transformer: &mut Transformer) -> Result<bool, TransformError> {
        let size = self.size();
        match &self.kind {
            NodeKind::Normalize {
                mean,
                variance,
                epsilon,
            } => {
                let inputs = transformer.transform_inputs(self)?;
                let offsets = mean.iter().map(|m| -m).collect();
                let factors = variance
                    .iter()
                    .map(|v| 1.0 / (v + epsilon).sqrt())
                    .collect();
                let centered = transformer.add_node(NodeKind::Shift { offsets }, inputs)?;
                let scaled = transformer.add_node_with_metadata(
                    NodeKind::Scale { factors },
                    vec![PortElements::full(centered, size)],
                    self.metadata.clone(),
                )?;
                transformer.map_output(self, PortElements::full(scaled, size))?;
                Ok(true)
            }
            NodeKind::Unary {
                op: UnaryOp::Negate,
            } => {
                let inputs = transformer.transform_inputs(self)?;
                let negated = transformer.add_node_with_metadata(
                    NodeKind::Scale {
                        factors: vec![-1.0],
                    },
                    inputs,
                    self.metadata.clone(),
                )?;
                transformer.map_output(self, PortElements::full(negated, size))?;
                Ok(true)
            }
            _ => {
                transformer.copy_node(self)?;
                Ok(false)
            }
        }
    }
}
