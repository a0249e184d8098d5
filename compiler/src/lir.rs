//! LIR – Low-level instruction list for emitted procedures.
//!
//! `ProgramEmitter` is an `Emitter` backend that records the assignment
//! stream as a `Procedure` instead of text, checking the emitter protocol
//! as it goes (declare before use, accumulate only into written storage,
//! indices in range). `Procedure::run` is a reference interpreter, so a
//! compiled procedure can be compared value for value with
//! `Graph::evaluate`.

use std::collections::HashSet;
use std::fmt;

use crate::coords::Coordinate;
use crate::diag::{codes, DiagCode, Diagnose};
use crate::emit::{AssignKind, EmitError, Emitter, Expr, Variable};
use crate::pass::StageCert;

// ── Procedure ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: AssignKind,
    pub dest: Variable,
    pub expr: Expr,
    pub origin: Coordinate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Procedure {
    pub name: String,
    pub input_size: usize,
    /// Graph coordinates the outputs read, in output order.
    pub outputs: Vec<Coordinate>,
    /// Distinct temporary slots the instructions use.
    pub temp_count: usize,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecError {
    #[error("procedure expects {expected} input value(s), got {found}")]
    InputLength { expected: usize, found: usize },
    #[error("instruction {index} refers to {variable}, which is out of range")]
    BadVariable { variable: Variable, index: usize },
}

impl Diagnose for ExecError {
    fn code(&self) -> DiagCode {
        match self {
            ExecError::InputLength { .. } => codes::E0405_EXEC_INPUT_LENGTH,
            ExecError::BadVariable { .. } => codes::E0406_EXEC_BAD_VARIABLE,
        }
    }
}

impl Procedure {
    pub fn output_size(&self) -> usize {
        self.outputs.len()
    }

    /// Execute the instruction list. Outputs that are never written read
    /// as zero.
    pub fn run(&self, inputs: &[f64]) -> Result<Vec<f64>, ExecError> {
        if inputs.len() != self.input_size {
            return Err(ExecError::InputLength {
                expected: self.input_size,
                found: inputs.len(),
            });
        }
        let mut outputs = vec![0.0; self.output_size()];
        let mut temps = vec![0.0; self.temp_count];

        for (index, inst) in self.instructions.iter().enumerate() {
            let bad = |variable| ExecError::BadVariable { variable, index };
            let value = match inst.expr {
                Expr::Literal(v) => v,
                Expr::Affine { op, source } => {
                    let x = match source {
                        Variable::Input(i) => inputs.get(i),
                        Variable::Output(j) => outputs.get(j),
                        Variable::Temp(k) => temps.get(k),
                    }
                    .copied()
                    .ok_or_else(|| bad(source))?;
                    op.apply(x)
                }
            };
            let slot = match inst.dest {
                Variable::Input(_) => None,
                Variable::Output(j) => outputs.get_mut(j),
                Variable::Temp(k) => temps.get_mut(k),
            }
            .ok_or_else(|| bad(inst.dest))?;
            match inst.kind {
                AssignKind::Accumulate => *slot += value,
                AssignKind::Declare | AssignKind::Set | AssignKind::Reassign => *slot = value,
            }
        }
        Ok(outputs)
    }
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "procedure {}({} -> {}, {} temp(s))",
            self.name,
            self.input_size,
            self.output_size(),
            self.temp_count
        )?;
        for inst in &self.instructions {
            writeln!(
                f,
                "  {:<10} {} = {}  ; {}",
                inst.kind.to_string(),
                inst.dest,
                inst.expr,
                inst.origin
            )?;
        }
        Ok(())
    }
}

// ── Recording backend ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ProgramEmitter {
    current: Option<Procedure>,
    finished: Option<Procedure>,
    declared: HashSet<usize>,
    written: HashSet<Variable>,
}

impl ProgramEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The completed procedure. Fails if `end_procedure` was never reached.
    pub fn finish(self) -> Result<Procedure, EmitError> {
        self.finished
            .ok_or_else(|| EmitError::protocol(None, "procedure was never ended"))
    }

    fn check_read(
        &self,
        procedure: &Procedure,
        source: &Expr,
        origin: Coordinate,
    ) -> Result<(), EmitError> {
        let Expr::Affine { source, .. } = *source else {
            return Ok(());
        };
        let ok = match source {
            Variable::Input(i) => i < procedure.input_size,
            Variable::Output(_) | Variable::Temp(_) => self.written.contains(&source),
        };
        if ok {
            Ok(())
        } else {
            Err(EmitError::protocol(
                Some(origin),
                format!("read of {} before it holds a value", source),
            ))
        }
    }

    fn check_write(
        &self,
        procedure: &Procedure,
        kind: AssignKind,
        dest: Variable,
        origin: Coordinate,
    ) -> Result<(), EmitError> {
        let violation = |detail: String| Err(EmitError::protocol(Some(origin), detail));
        match dest {
            Variable::Input(_) => return violation(format!("{} {} writes an input", kind, dest)),
            Variable::Output(j) if j >= procedure.output_size() => {
                return violation(format!("{} is out of range", dest))
            }
            _ => {}
        }
        match (kind, dest) {
            (AssignKind::Declare, Variable::Temp(k)) if self.declared.contains(&k) => {
                violation(format!("{} declared twice", dest))
            }
            (AssignKind::Declare, Variable::Temp(_)) => Ok(()),
            (AssignKind::Declare | AssignKind::Reassign, Variable::Input(_) | Variable::Output(_)) => {
                violation(format!("{} targets {}, not a temporary", kind, dest))
            }
            (_, Variable::Temp(k)) if !self.declared.contains(&k) => {
                violation(format!("{} {} before its declaration", kind, dest))
            }
            (AssignKind::Accumulate, _) if !self.written.contains(&dest) => {
                violation(format!("accumulate into unwritten {}", dest))
            }
            _ => Ok(()),
        }
    }
}

impl Emitter for ProgramEmitter {
    fn begin_procedure(
        &mut self,
        name: &str,
        input_size: usize,
        outputs: &[Coordinate],
    ) -> Result<(), EmitError> {
        if self.current.is_some() || self.finished.is_some() {
            return Err(EmitError::protocol(None, "procedure already begun"));
        }
        self.current = Some(Procedure {
            name: name.to_string(),
            input_size,
            outputs: outputs.to_vec(),
            temp_count: 0,
            instructions: Vec::new(),
        });
        Ok(())
    }

    fn emit(
        &mut self,
        kind: AssignKind,
        dest: Variable,
        source: &Expr,
        origin: Coordinate,
    ) -> Result<(), EmitError> {
        let Some(procedure) = self.current.take() else {
            return Err(EmitError::protocol(
                Some(origin),
                "assignment outside a procedure",
            ));
        };
        let checked = self
            .check_read(&procedure, source, origin)
            .and_then(|()| self.check_write(&procedure, kind, dest, origin));
        let mut procedure = procedure;
        if checked.is_ok() {
            if let (AssignKind::Declare, Variable::Temp(k)) = (kind, dest) {
                self.declared.insert(k);
                procedure.temp_count = procedure.temp_count.max(k + 1);
            }
            self.written.insert(dest);
            procedure.instructions.push(Instruction {
                kind,
                dest,
                expr: *source,
                origin,
            });
        }
        self.current = Some(procedure);
        checked
    }

    fn end_procedure(&mut self) -> Result<(), EmitError> {
        let procedure = self
            .current
            .take()
            .ok_or_else(|| EmitError::protocol(None, "no procedure to end"))?;
        self.finished = Some(procedure);
        Ok(())
    }
}

// ── Postconditions ─────────────────────────────────────────────────────────

/// Postconditions of an emitted procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcedureCert {
    /// P1: every output is written by a `set` before any accumulate into it.
    pub p1_outputs_set: bool,
    /// P2: every temporary slot is declared exactly once.
    pub p2_single_declare: bool,
    /// P3: every temporary index is below `temp_count`.
    pub p3_temps_in_range: bool,
}

impl StageCert for ProcedureCert {
    fn all_pass(&self) -> bool {
        self.p1_outputs_set && self.p2_single_declare && self.p3_temps_in_range
    }

    fn obligations(&self) -> Vec<(&'static str, bool)> {
        vec![
            ("P1_outputs_set", self.p1_outputs_set),
            ("P2_single_declare", self.p2_single_declare),
            ("P3_temps_in_range", self.p3_temps_in_range),
        ]
    }
}

pub fn verify_procedure(procedure: &Procedure) -> ProcedureCert {
    ProcedureCert {
        p1_outputs_set: verify_p1_outputs_set(procedure),
        p2_single_declare: verify_p2_single_declare(procedure),
        p3_temps_in_range: verify_p3_temps_in_range(procedure),
    }
}

fn verify_p1_outputs_set(procedure: &Procedure) -> bool {
    let mut set = vec![false; procedure.output_size()];
    for inst in &procedure.instructions {
        if let Variable::Output(j) = inst.dest {
            let Some(seen) = set.get_mut(j) else {
                return false;
            };
            match inst.kind {
                AssignKind::Set => *seen = true,
                AssignKind::Accumulate if *seen => {}
                _ => return false,
            }
        }
    }
    set.into_iter().all(|s| s)
}

fn verify_p2_single_declare(procedure: &Procedure) -> bool {
    let mut declared = HashSet::new();
    procedure
        .instructions
        .iter()
        .filter(|i| i.kind == AssignKind::Declare)
        .all(|i| match i.dest {
            Variable::Temp(k) => declared.insert(k),
            _ => false,
        })
}

fn verify_p3_temps_in_range(procedure: &Procedure) -> bool {
    let in_range = |v: Variable| match v {
        Variable::Temp(k) => k < procedure.temp_count,
        _ => true,
    };
    procedure.instructions.iter().all(|i| {
        in_range(i.dest)
            && match i.expr {
                Expr::Affine { source, .. } => in_range(source),
                Expr::Literal(_) => true,
            }
    })
}
