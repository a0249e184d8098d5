// emit.rs — Forward emission over a fused coordinate graph
//
// Walks procedure inputs in index order and fires queued actions depth
// first: as soon as an element has received all of its producer actions,
// emission continues from it, so each value is consumed right after it is
// produced. Temporary storage comes from a free-list allocator; a slot is
// returned the moment the element holding it has no actions left.
//
// Preconditions: the coordinate graph has been fused (either mode).
// Postconditions: every procedure output is written exactly once with
//                 `set` (then possibly `accumulate`d); the emitter sees
//                 `declare` at most once per slot index, before any other
//                 assignment to it.
// Failure modes: emitter errors; bookkeeping inconsistencies → `EmitError`.
// Side effects: calls into the `Emitter` backend; `debug!` statistics.

use std::fmt;

use tracing::debug;

use crate::affine::{format_literal, AffineOp};
use crate::coords::{Coordinate, CoordinateGraph, ElementNode};
use crate::diag::{codes, DiagCode, Diagnose, Location};

// ── Emission vocabulary ─────────────────────────────────────────────────────

/// Storage an assignment reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variable {
    /// Element of the caller-owned, read-only input array.
    Input(usize),
    /// Element of the caller-owned output array.
    Output(usize),
    /// Temporary slot.
    Temp(usize),
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&VariableNames::default().render(*self))
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display, strum_macros::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum AssignKind {
    /// First write to a never-used temporary slot.
    Declare,
    /// First write to a procedure output.
    Set,
    /// Add into storage that already holds a partial value.
    Accumulate,
    /// First write to a recycled temporary slot.
    Reassign,
}

/// Right-hand side of an assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Expr {
    Affine { op: AffineOp, source: Variable },
    Literal(f64),
}

impl Expr {
    /// Render with the given variable naming.
    pub fn render(&self, names: &VariableNames) -> String {
        match self {
            Expr::Affine { op, source } => op.render(&names.render(*source)),
            Expr::Literal(value) => format_literal(*value),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(&VariableNames::default()))
    }
}

/// Spelling of procedure variables in emitted text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableNames {
    pub input: String,
    pub output: String,
    pub temp_prefix: String,
}

impl Default for VariableNames {
    fn default() -> Self {
        VariableNames {
            input: "input".to_string(),
            output: "output".to_string(),
            temp_prefix: "tmp".to_string(),
        }
    }
}

impl VariableNames {
    pub fn render(&self, variable: Variable) -> String {
        match variable {
            Variable::Input(i) => format!("{}[{}]", self.input, i),
            Variable::Output(j) => format!("{}[{}]", self.output, j),
            Variable::Temp(k) => format!("{}{}", self.temp_prefix, k),
        }
    }
}

// ── Backend interface ───────────────────────────────────────────────────────

/// A backend rendering emission events into some target representation.
pub trait Emitter {
    fn begin_procedure(
        &mut self,
        name: &str,
        input_size: usize,
        outputs: &[Coordinate],
    ) -> Result<(), EmitError>;

    /// `dest (kind) source`, produced for element `origin`.
    fn emit(
        &mut self,
        kind: AssignKind,
        dest: Variable,
        source: &Expr,
        origin: Coordinate,
    ) -> Result<(), EmitError>;

    fn end_procedure(&mut self) -> Result<(), EmitError>;
}

/// Drive two backends from one emission run, first then second.
impl<A: Emitter, B: Emitter> Emitter for (A, B) {
    fn begin_procedure(
        &mut self,
        name: &str,
        input_size: usize,
        outputs: &[Coordinate],
    ) -> Result<(), EmitError> {
        self.0.begin_procedure(name, input_size, outputs)?;
        self.1.begin_procedure(name, input_size, outputs)
    }

    fn emit(
        &mut self,
        kind: AssignKind,
        dest: Variable,
        source: &Expr,
        origin: Coordinate,
    ) -> Result<(), EmitError> {
        self.0.emit(kind, dest, source, origin)?;
        self.1.emit(kind, dest, source, origin)
    }

    fn end_procedure(&mut self) -> Result<(), EmitError> {
        self.0.end_procedure()?;
        self.1.end_procedure()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error("emitter protocol violation: {detail}")]
    Protocol {
        origin: Option<Coordinate>,
        detail: String,
    },
    #[error("no element node for coordinate {coordinate}")]
    UnknownCoordinate { coordinate: Coordinate },
    #[error("coordinate {coordinate} never fired {remaining} queued action(s)")]
    Stalled {
        coordinate: Coordinate,
        remaining: usize,
    },
    #[error(transparent)]
    Format(#[from] fmt::Error),
}

impl EmitError {
    pub fn protocol(origin: Option<Coordinate>, detail: impl Into<String>) -> Self {
        EmitError::Protocol {
            origin,
            detail: detail.into(),
        }
    }
}

impl Diagnose for EmitError {
    fn code(&self) -> DiagCode {
        match self {
            EmitError::Protocol { .. } => codes::E0401_PROTOCOL,
            EmitError::UnknownCoordinate { .. } => codes::E0402_UNKNOWN_COORDINATE,
            EmitError::Stalled { .. } => codes::E0403_STALLED,
            EmitError::Format(_) => codes::E0404_FORMAT,
        }
    }

    fn location(&self) -> Option<Location> {
        match self {
            EmitError::Protocol { origin, .. } => origin.map(Location::Coordinate),
            EmitError::UnknownCoordinate { coordinate } | EmitError::Stalled { coordinate, .. } => {
                Some(Location::Coordinate(*coordinate))
            }
            EmitError::Format(_) => None,
        }
    }
}

// ── Slot allocation ─────────────────────────────────────────────────────────

/// Free-list allocator for temporary slots: released indices are reused
/// last-in first-out before a new index is issued.
#[derive(Debug, Clone, Default)]
pub struct SlotAllocator {
    free: Vec<usize>,
    issued: usize,
}

impl SlotAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot index and whether it has never been issued before.
    pub fn acquire(&mut self) -> (usize, bool) {
        match self.free.pop() {
            Some(index) => (index, false),
            None => {
                let index = self.issued;
                self.issued += 1;
                (index, true)
            }
        }
    }

    pub fn release(&mut self, index: usize) {
        self.free.push(index);
    }

    /// Distinct slots handed out so far.
    pub fn issued(&self) -> usize {
        self.issued
    }

    /// Slots currently held.
    pub fn live(&self) -> usize {
        self.issued - self.free.len()
    }
}

// ── Forward pass ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitStats {
    /// Distinct temporary slots the procedure uses.
    pub temp_slots: usize,
    pub instructions: usize,
    pub declares: usize,
    pub sets: usize,
    pub accumulates: usize,
    pub reassigns: usize,
    /// Inputs copied into a temporary because several actions read them.
    pub staged_inputs: usize,
    /// Outputs whose every contribution was pruned, written as zero.
    pub zero_filled: usize,
}

/// Mutable state of one emission run.
struct EmissionContext<'e, E: Emitter + ?Sized> {
    coords: CoordinateGraph,
    slots: SlotAllocator,
    stats: EmitStats,
    emitter: &'e mut E,
}

fn element_mut(
    coords: &mut CoordinateGraph,
    coordinate: Coordinate,
) -> Result<&mut ElementNode, EmitError> {
    coords
        .element_mut(coordinate)
        .ok_or(EmitError::UnknownCoordinate { coordinate })
}

impl<E: Emitter + ?Sized> EmissionContext<'_, E> {
    fn emit(
        &mut self,
        kind: AssignKind,
        dest: Variable,
        source: Expr,
        origin: Coordinate,
    ) -> Result<(), EmitError> {
        self.emitter.emit(kind, dest, &source, origin)?;
        self.stats.instructions += 1;
        match kind {
            AssignKind::Declare => self.stats.declares += 1,
            AssignKind::Set => self.stats.sets += 1,
            AssignKind::Accumulate => self.stats.accumulates += 1,
            AssignKind::Reassign => self.stats.reassigns += 1,
        }
        Ok(())
    }

    /// Storage for a write into `target`: its existing storage once
    /// initialized, its fixed variable, or a slot from the free list.
    fn request(&mut self, target: Coordinate) -> Result<(AssignKind, Variable), EmitError> {
        let element = element_mut(&mut self.coords, target)?;
        if element.initialized {
            let variable = element.variable().ok_or_else(|| {
                EmitError::protocol(Some(target), "initialized element has no storage")
            })?;
            return Ok((AssignKind::Accumulate, variable));
        }
        if let Some(variable) = element.fixed {
            return Ok((AssignKind::Set, variable));
        }
        let (index, fresh) = self.slots.acquire();
        element.temp = Some(index);
        let kind = if fresh {
            AssignKind::Declare
        } else {
            AssignKind::Reassign
        };
        Ok((kind, Variable::Temp(index)))
    }

    fn release(&mut self, coordinate: Coordinate) -> Result<(), EmitError> {
        if let Some(index) = element_mut(&mut self.coords, coordinate)?.temp.take() {
            self.slots.release(index);
        }
        Ok(())
    }

    /// Copy an input read by several actions into a temporary.
    fn stage(&mut self, input: Coordinate) -> Result<(), EmitError> {
        let element = element_mut(&mut self.coords, input)?;
        if element.actions.len() <= 1 {
            return Ok(());
        }
        let source = element
            .fixed
            .ok_or_else(|| EmitError::protocol(Some(input), "input element is not bound"))?;
        let (index, fresh) = self.slots.acquire();
        element.temp = Some(index);
        let kind = if fresh {
            AssignKind::Declare
        } else {
            AssignKind::Reassign
        };
        let copy = Expr::Affine {
            op: AffineOp::IDENTITY,
            source,
        };
        self.emit(kind, Variable::Temp(index), copy, input)?;
        self.stats.staged_inputs += 1;
        Ok(())
    }

    /// Fire every action reachable from `start`, depth first.
    fn drain(&mut self, start: Coordinate) -> Result<(), EmitError> {
        let mut stack = vec![start];
        while let Some(&current) = stack.last() {
            let element = element_mut(&mut self.coords, current)?;
            let Some(action) = element.actions.pop_front() else {
                stack.pop();
                self.release(current)?;
                continue;
            };
            let exhausted = element.actions.is_empty();
            let source = element.variable().ok_or_else(|| {
                EmitError::protocol(Some(current), "source element has no storage")
            })?;

            let (kind, dest) = self.request(action.target)?;
            let expr = Expr::Affine {
                op: action.op,
                source,
            };
            self.emit(kind, dest, expr, action.target)?;

            let target = element_mut(&mut self.coords, action.target)?;
            target.initialized = true;
            target.pending = target.pending.checked_sub(1).ok_or_else(|| {
                EmitError::protocol(Some(action.target), "more writes than producers")
            })?;
            let ready = target.pending == 0;

            if exhausted {
                self.release(current)?;
            }
            if ready {
                stack.push(action.target);
            }
        }
        Ok(())
    }

    /// Write zero to outputs that received no contribution.
    fn zero_fill(&mut self) -> Result<(), EmitError> {
        for j in 0..self.coords.output_size() {
            let target = self.coords.output_target(j);
            let element = element_mut(&mut self.coords, target)?;
            if element.initialized {
                continue;
            }
            element.initialized = true;
            self.emit(AssignKind::Set, Variable::Output(j), Expr::Literal(0.0), target)?;
            self.stats.zero_filled += 1;
        }
        Ok(())
    }

    fn check_drained(&self) -> Result<(), EmitError> {
        match self.coords.elements().find(|(_, e)| !e.actions().is_empty()) {
            Some((coordinate, element)) => Err(EmitError::Stalled {
                coordinate,
                remaining: element.actions().len(),
            }),
            None => Ok(()),
        }
    }
}

/// Emit the procedure computed by a fused coordinate graph.
///
/// The graph is consumed: its per-element bookkeeping is spent by the walk.
pub fn emit_procedure<E: Emitter + ?Sized>(
    coords: CoordinateGraph,
    name: &str,
    emitter: &mut E,
) -> Result<EmitStats, EmitError> {
    if coords.mode().is_none() {
        return Err(EmitError::protocol(None, "coordinate graph has not been fused"));
    }
    emitter.begin_procedure(name, coords.input_size(), coords.output_coordinates())?;

    let inputs = coords.input_coordinates();
    let mut ctx = EmissionContext {
        coords,
        slots: SlotAllocator::new(),
        stats: EmitStats::default(),
        emitter,
    };
    for input in inputs {
        ctx.stage(input)?;
        ctx.drain(input)?;
    }
    ctx.zero_fill()?;
    ctx.check_drained()?;
    ctx.emitter.end_procedure()?;

    let mut stats = ctx.stats;
    stats.temp_slots = ctx.slots.issued();
    debug!(
        procedure = name,
        temp_slots = stats.temp_slots,
        instructions = stats.instructions,
        staged_inputs = stats.staged_inputs,
        zero_filled = stats.zero_filled,
        "emitted procedure"
    );
    Ok(stats)
}
