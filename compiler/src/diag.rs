// diag.rs — Unified diagnostics model
//
// Provides the shared diagnostic types used across all compiler passes.
// Each pass owns a typed error enum; this module gives those errors a
// stable code and a location (node or coordinate) for reporting.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use crate::coords::Coordinate;
use crate::id::NodeId;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`).
///
/// Once assigned, a code must never be reassigned to a different semantic
/// meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Code registry. `E01xx` graph, `E02xx` transform, `E03xx` fusion,
/// `E04xx` emission and execution, `E05xx` pipeline.
pub mod codes {
    use super::DiagCode;

    pub const E0101_NODE_NOT_FOUND: DiagCode = DiagCode("E0101");
    pub const E0102_PORT_OUT_OF_RANGE: DiagCode = DiagCode("E0102");
    pub const E0103_RANGE_OUT_OF_BOUNDS: DiagCode = DiagCode("E0103");
    pub const E0104_ARITY: DiagCode = DiagCode("E0104");
    pub const E0105_SIZE_MISMATCH: DiagCode = DiagCode("E0105");
    pub const E0106_FORWARD_REFERENCE: DiagCode = DiagCode("E0106");
    pub const E0107_DUPLICATE_ID: DiagCode = DiagCode("E0107");
    pub const E0108_INPUT_LENGTH: DiagCode = DiagCode("E0108");
    pub const E0109_NOT_COMPUTABLE: DiagCode = DiagCode("E0109");
    pub const E0110_IDS_EXHAUSTED: DiagCode = DiagCode("E0110");
    pub const E0111_UNBOUND_INPUT: DiagCode = DiagCode("E0111");
    pub const E0112_NOT_AN_INPUT: DiagCode = DiagCode("E0112");
    pub const E0113_DUPLICATE_INPUT: DiagCode = DiagCode("E0113");

    pub const E0201_UNMAPPED: DiagCode = DiagCode("E0201");
    pub const E0202_REFINE_INCOMPLETE: DiagCode = DiagCode("E0202");
    pub const E0203_INVALID_ITERATIONS: DiagCode = DiagCode("E0203");
    pub const E0204_BOUNDARY_MISMATCH: DiagCode = DiagCode("E0204");
    pub const E0205_OUTPUT_SIZE: DiagCode = DiagCode("E0205");

    pub const E0301_UNSUPPORTED_NODE: DiagCode = DiagCode("E0301");
    pub const E0302_UNLISTED_INPUT: DiagCode = DiagCode("E0302");
    pub const E0303_MULTI_PORT: DiagCode = DiagCode("E0303");
    pub const E0304_FUSION_INVARIANT: DiagCode = DiagCode("E0304");
    pub const E0305_NOT_AN_INPUT: DiagCode = DiagCode("E0305");
    pub const E0306_DUPLICATE_INPUT: DiagCode = DiagCode("E0306");

    pub const E0401_PROTOCOL: DiagCode = DiagCode("E0401");
    pub const E0402_UNKNOWN_COORDINATE: DiagCode = DiagCode("E0402");
    pub const E0403_STALLED: DiagCode = DiagCode("E0403");
    pub const E0404_FORMAT: DiagCode = DiagCode("E0404");
    pub const E0405_EXEC_INPUT_LENGTH: DiagCode = DiagCode("E0405");
    pub const E0406_EXEC_BAD_VARIABLE: DiagCode = DiagCode("E0406");

    pub const E0501_VERIFICATION: DiagCode = DiagCode("E0501");
    pub const E0502_PROVENANCE: DiagCode = DiagCode("E0502");
    pub const E0503_MISSING_ARTIFACT: DiagCode = DiagCode("E0503");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Location ─────────────────────────────────────────────────────────────

/// Where in the model a diagnostic points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Node(NodeId),
    Coordinate(Coordinate),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Node(id) => write!(f, "node {}", id),
            Location::Coordinate(c) => write!(f, "coordinate {}", c),
        }
    }
}

/// Implemented by every pass error so failures can be reported uniformly.
pub trait Diagnose: std::error::Error {
    fn code(&self) -> DiagCode;

    fn location(&self) -> Option<Location> {
        None
    }

    fn to_diagnostic(&self) -> Diagnostic {
        let mut d = Diagnostic::new(DiagLevel::Error, self.to_string()).with_code(self.code());
        d.location = self.location();
        d
    }
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// A compiler diagnostic emitted by any pass.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub location: Option<Location>,
    pub message: String,
    pub hint: Option<String>,
}

impl Diagnostic {
    /// Create a new diagnostic with no code, location, or hint.
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            location: None,
            message: message.into(),
            hint: None,
        }
    }

    /// Attach a stable diagnostic code.
    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the node or coordinate that triggered the diagnostic.
    pub fn at(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        if let Some(location) = &self.location {
            write!(f, " (at {})", location)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}
