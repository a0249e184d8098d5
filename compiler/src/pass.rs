// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the compiler's passes, their dependency edges, and the artifacts
// they produce. Used by the pipeline runner to compute the minimal pass
// subset for a requested terminal pass.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Refine,
    Prune,
    Fold,
    BuildCoordinates,
    Fuse,
    Emit,
}

/// Machine-readable artifact identifiers. Each maps to a concrete type
/// in the compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Refined,     // LoweredGraph
    Pruned,      // LoweredGraph
    Folded,      // LoweredGraph
    Coordinates, // CoordinateGraph
    FusionStats, // FusionStats
    Procedure,   // Procedure
    Generated,   // GeneratedCode
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for diagnostics and span fields.
    pub name: &'static str,
    /// Pass dependencies (other passes whose outputs this pass consumes).
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

/// Return the static descriptor for a given pass.
pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Refine => PassDescriptor {
            name: "refine",
            inputs: &[],
            outputs: &[ArtifactId::Refined],
            invalidation_key: "graph + outputs + max_refine_iterations",
            invariants: "every node is compilable under the transform context",
        },
        PassId::Prune => PassDescriptor {
            name: "prune",
            inputs: &[PassId::Refine],
            outputs: &[ArtifactId::Pruned],
            invalidation_key: "refined graph",
            invariants: "only the input layout and producers of the outputs remain",
        },
        PassId::Fold => PassDescriptor {
            name: "fold",
            inputs: &[PassId::Prune],
            outputs: &[ArtifactId::Folded],
            invalidation_key: "pruned graph + fold_affine",
            invariants: "no affine node feeds another affine node",
        },
        PassId::BuildCoordinates => PassDescriptor {
            name: "build_coordinates",
            inputs: &[PassId::Fold],
            outputs: &[ArtifactId::Coordinates],
            invalidation_key: "folded graph",
            invariants: "every closure node has a per-element affine form",
        },
        PassId::Fuse => PassDescriptor {
            name: "fuse",
            inputs: &[PassId::BuildCoordinates],
            outputs: &[ArtifactId::FusionStats],
            invalidation_key: "coordinates + fuse",
            invariants: "in fused mode, actions sit on input elements only",
        },
        PassId::Emit => PassDescriptor {
            name: "emit",
            inputs: &[PassId::Fuse],
            outputs: &[ArtifactId::Procedure, ArtifactId::Generated],
            invalidation_key: "fused coordinates + names",
            invariants: "P1-P3 obligations verified, every output written",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 6] = [
    PassId::Refine,
    PassId::Prune,
    PassId::Fold,
    PassId::BuildCoordinates,
    PassId::Fuse,
    PassId::Emit,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Stage certificates ─────────────────────────────────────────────────────

/// Named postcondition checks a pass verifies on its own output.
pub trait StageCert {
    fn all_pass(&self) -> bool;

    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that did not hold.
    fn failed(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
