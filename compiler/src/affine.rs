// affine.rs — Scalar affine operations `y = a*x + b`
//
// The value-level algebra the fusion compiler works in. Composition is
// written destination-first: `dest.compound(&src)` applies `src` and then
// `dest`, so a chain of element operations collapses into one
// multiply-add no matter how long it is.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffineOp {
    multiply: f64,
    increment: f64,
}

impl AffineOp {
    /// `(1, 0)`: the neutral element of `compound`.
    pub const IDENTITY: AffineOp = AffineOp {
        multiply: 1.0,
        increment: 0.0,
    };

    /// `(0, 0)`: contributes nothing.
    pub const NULL: AffineOp = AffineOp {
        multiply: 0.0,
        increment: 0.0,
    };

    pub fn new(multiply: f64, increment: f64) -> Self {
        AffineOp {
            multiply,
            increment,
        }
    }

    pub fn scale(factor: f64) -> Self {
        Self::new(factor, 0.0)
    }

    pub fn shift(offset: f64) -> Self {
        Self::new(1.0, offset)
    }

    pub fn multiply_by(&self) -> f64 {
        self.multiply
    }

    pub fn increment_by(&self) -> f64 {
        self.increment
    }

    /// `(a1,b1).compound((a2,b2)) = (a1*a2, a1*b2 + b1)`: apply `src` first,
    /// then `self`.
    pub fn compound(&self, src: &AffineOp) -> AffineOp {
        AffineOp {
            multiply: self.multiply * src.multiply,
            increment: self.multiply * src.increment + self.increment,
        }
    }

    /// True for `(0, 0)` only. A pure scale by zero followed by nothing is
    /// null; the identity is not.
    pub fn is_null(&self) -> bool {
        self.multiply == 0.0 && self.increment == 0.0
    }

    pub fn is_identity(&self) -> bool {
        self.multiply == 1.0 && self.increment == 0.0
    }

    pub fn apply(&self, x: f64) -> f64 {
        self.multiply * x + self.increment
    }

    /// Render the operation applied to `source` as a C-style expression,
    /// omitting the multiply or the add when it is trivial.
    pub fn render(&self, source: &str) -> String {
        let a = self.multiply;
        let b = self.increment;
        if b == 0.0 {
            if a == 1.0 {
                source.to_string()
            } else if a == 0.0 {
                format_literal(0.0)
            } else {
                format!("{} * {}", format_literal(a), source)
            }
        } else if a == 0.0 {
            format_literal(b)
        } else {
            let scaled = if a == 1.0 {
                source.to_string()
            } else {
                format!("{} * {}", format_literal(a), source)
            };
            if b < 0.0 {
                format!("{} - {}", scaled, format_literal(-b))
            } else {
                format!("{} + {}", scaled, format_literal(b))
            }
        }
    }
}

impl Default for AffineOp {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl fmt::Display for AffineOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            format_literal(self.multiply),
            format_literal(self.increment)
        )
    }
}

/// Shortest round-trip spelling that always reads back as a double
/// (`2.0`, `0.5`, `1e-7`).
pub fn format_literal(value: f64) -> String {
    format!("{:?}", value)
}
