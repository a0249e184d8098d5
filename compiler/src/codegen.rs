// codegen.rs — C source generation for fused models
//
// An `Emitter` backend that renders the procedure as one C function
// `void name(const double* input, double* output)`, one statement per
// assignment, each annotated with the coordinate it was produced for.
//
// Preconditions: driven by `emit::emit_procedure` (begin, emits, end).
// Postconditions: `finish` returns the complete function text.
// Failure modes: events outside begin/end, or a second begin → `EmitError`.
// Side effects: none.

use std::fmt::Write as _;

use crate::affine::format_literal;
use crate::coords::Coordinate;
use crate::emit::{AssignKind, EmitError, Emitter, Expr, Variable, VariableNames};

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CEmitter {
    names: VariableNames,
    out: String,
    open: bool,
    finished: bool,
}

impl CEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_names(names: VariableNames) -> Self {
        CEmitter {
            names,
            ..Self::default()
        }
    }

    pub fn names(&self) -> &VariableNames {
        &self.names
    }

    /// The text written so far.
    pub fn source(&self) -> &str {
        &self.out
    }

    pub fn finish(self) -> String {
        self.out
    }

    fn render(&self, expr: &Expr) -> String {
        match expr {
            Expr::Affine { op, source } => op.render(&self.names.render(*source)),
            Expr::Literal(value) => format_literal(*value),
        }
    }
}

// ── Emitter implementation ──────────────────────────────────────────────────

impl Emitter for CEmitter {
    fn begin_procedure(
        &mut self,
        name: &str,
        input_size: usize,
        outputs: &[Coordinate],
    ) -> Result<(), EmitError> {
        if self.open || self.finished {
            return Err(EmitError::protocol(None, "procedure already begun"));
        }
        writeln!(self.out, "// Input dimension: {}", input_size)?;
        writeln!(self.out, "// Output dimension: {}", outputs.len())?;
        write!(self.out, "// Output coordinates:")?;
        for c in outputs {
            write!(self.out, " {}", c)?;
        }
        writeln!(self.out)?;
        writeln!(
            self.out,
            "void {}(const double* {}, double* {})",
            name, self.names.input, self.names.output
        )?;
        writeln!(self.out, "{{")?;
        self.open = true;
        Ok(())
    }

    fn emit(
        &mut self,
        kind: AssignKind,
        dest: Variable,
        source: &Expr,
        origin: Coordinate,
    ) -> Result<(), EmitError> {
        if !self.open {
            return Err(EmitError::protocol(
                Some(origin),
                "assignment outside a procedure",
            ));
        }
        let dest = self.names.render(dest);
        let rhs = self.render(source);
        let (node, element) = (origin.node, origin.element);
        match kind {
            AssignKind::Declare => writeln!(
                self.out,
                "    double {} = {}; // coordinate ({},{}), allocating new temporary variable",
                dest, rhs, node, element
            )?,
            AssignKind::Set => writeln!(
                self.out,
                "    {} = {}; // coordinate ({},{})",
                dest, rhs, node, element
            )?,
            AssignKind::Accumulate => writeln!(
                self.out,
                "    {} += {}; // coordinate ({},{})",
                dest, rhs, node, element
            )?,
            AssignKind::Reassign => writeln!(
                self.out,
                "    {} = {}; // coordinate ({},{}), reassigning temporary variable",
                dest, rhs, node, element
            )?,
        }
        Ok(())
    }

    fn end_procedure(&mut self) -> Result<(), EmitError> {
        if !self.open {
            return Err(EmitError::protocol(None, "no procedure to end"));
        }
        writeln!(self.out, "}}")?;
        self.open = false;
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affine::AffineOp;
    use crate::coords::{CoordinateGraph, FusionMode};
    use crate::emit::emit_procedure;
    use crate::graph::Graph;
    use crate::id::NodeId;
    use crate::node::NodeKind;
    use crate::port::PortElements;

    fn compile_chain(kinds: Vec<NodeKind>, size: usize, mode: FusionMode) -> String {
        let mut g = Graph::new();
        let x = g.add_node(NodeKind::Input { size }, vec![]).unwrap();
        let mut prev = x;
        for kind in kinds {
            prev = g.add_node(kind, vec![PortElements::full(prev, size)]).unwrap();
        }
        let out = g
            .add_node(NodeKind::Output, vec![PortElements::full(prev, size)])
            .unwrap();
        let mut coords =
            CoordinateGraph::build(&g, &[x], &[PortElements::full(out, size)]).unwrap();
        coords.fuse(mode).unwrap();
        let mut emitter = CEmitter::new();
        emit_procedure(coords, "predict", &mut emitter).unwrap();
        emitter.finish()
    }

    #[test]
    fn fused_chain_renders_one_statement_per_output() {
        let source = compile_chain(
            vec![
                NodeKind::Scale { factors: vec![2.0] },
                NodeKind::Shift { offsets: vec![5.0] },
                NodeKind::Scale { factors: vec![0.5] },
            ],
            3,
            FusionMode::Fuse,
        );
        assert_eq!(
            source,
            "// Input dimension: 3\n\
             // Output dimension: 3\n\
             // Output coordinates: (4,0) (4,1) (4,2)\n\
             void predict(const double* input, double* output)\n\
             {\n    \
             output[0] = input[0] + 2.5; // coordinate (5,0)\n    \
             output[1] = input[1] + 2.5; // coordinate (5,1)\n    \
             output[2] = input[2] + 2.5; // coordinate (5,2)\n\
             }\n"
        );
    }

    #[test]
    fn materialized_chain_declares_then_reassigns() {
        let source = compile_chain(
            vec![
                NodeKind::Scale { factors: vec![2.0] },
                NodeKind::Shift { offsets: vec![-5.0] },
            ],
            1,
            FusionMode::Materialize,
        );
        let body: Vec<&str> = source.lines().skip(5).collect();
        assert_eq!(
            body,
            vec![
                "    double tmp0 = 2.0 * input[0]; // coordinate (1,0), allocating new temporary variable",
                "    double tmp1 = tmp0 - 5.0; // coordinate (2,0), allocating new temporary variable",
                "    tmp0 = tmp1; // coordinate (3,0), reassigning temporary variable",
                "    output[0] = tmp0; // coordinate (4,0)",
                "}",
            ]
        );
    }

    #[test]
    fn accumulate_renders_compound_assignment() {
        let mut emitter = CEmitter::with_names(VariableNames {
            input: "x".to_string(),
            output: "y".to_string(),
            temp_prefix: "t".to_string(),
        });
        let origin = Coordinate::new(NodeId(2), 0);
        emitter.begin_procedure("f", 1, &[origin]).unwrap();
        emitter
            .emit(
                AssignKind::Accumulate,
                Variable::Output(0),
                &Expr::Affine {
                    op: AffineOp::scale(3.0),
                    source: Variable::Input(0),
                },
                origin,
            )
            .unwrap();
        emitter.end_procedure().unwrap();
        let source = emitter.finish();
        assert!(source.contains("void f(const double* x, double* y)"));
        assert!(source.contains("    y[0] += 3.0 * x[0]; // coordinate (2,0)\n"));
    }

    #[test]
    fn events_outside_a_procedure_are_rejected() {
        let mut emitter = CEmitter::new();
        let origin = Coordinate::new(NodeId(0), 0);
        assert!(emitter
            .emit(AssignKind::Set, Variable::Output(0), &Expr::Literal(1.0), origin)
            .is_err());
        assert!(emitter.end_procedure().is_err());
        emitter.begin_procedure("f", 0, &[]).unwrap();
        assert!(emitter.begin_procedure("g", 0, &[]).is_err());
    }
}
