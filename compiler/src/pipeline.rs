// pipeline.rs — Compilation state and pass orchestration
//
// Holds every pass artifact and runs the minimal set of passes for a given
// terminal PassId: refine → prune → fold → build coordinates → fuse → emit.
//
// Preconditions: the source graph and its output elements are set before
//                calling run_pipeline.
// Postconditions: all artifacts for required passes are populated, or the
//                 failing pass is reported with its cause.
// Failure modes: any pass error; emitted procedure failing its certificate.
// Side effects: one `info_span!("pass")` per pass with a `debug!` timing
//               event; calls on_pass_complete after each successful pass.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use crate::codegen::CEmitter;
use crate::coords::{CoordinateGraph, FusionError, FusionMode, FusionStats};
use crate::diag::{codes, DiagCode, Diagnose, Diagnostic, Location};
use crate::emit::{emit_procedure, EmitError, EmitStats, VariableNames};
use crate::graph::Graph;
use crate::lir::{verify_procedure, Procedure, ProgramEmitter};
use crate::pass::{descriptor, required_passes, ArtifactId, PassId, StageCert};
use crate::passes::{fold_affine_chains, prune, refine, LoweredGraph};
use crate::port::PortElements;
use crate::transform::{TransformContext, TransformError};

// ── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Name of the emitted procedure.
    pub function_name: String,
    pub input_name: String,
    pub output_name: String,
    pub temp_prefix: String,
    /// Compose affine chains; `false` materializes every intermediate.
    pub fuse: bool,
    /// Run node-level affine folding before coordinate fusion.
    pub fold_affine: bool,
    pub max_refine_iterations: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            function_name: "predict".to_string(),
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            temp_prefix: "tmp".to_string(),
            fuse: true,
            fold_affine: false,
            max_refine_iterations: 10,
        }
    }
}

impl CompileOptions {
    pub fn names(&self) -> VariableNames {
        VariableNames {
            input: self.input_name.clone(),
            output: self.output_name.clone(),
            temp_prefix: self.temp_prefix.clone(),
        }
    }

    pub fn fusion_mode(&self) -> FusionMode {
        if self.fuse {
            FusionMode::Fuse
        } else {
            FusionMode::Materialize
        }
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible builds and cache-key use.
///
/// `graph_hash`: SHA-256 of the compact JSON of the node records and the
/// requested outputs. `options_hash`: SHA-256 of the compact JSON of the
/// options. `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub graph_hash: [u8; 32],
    pub options_hash: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the graph hash (64 characters).
    pub fn graph_hash_hex(&self) -> String {
        bytes_to_hex(&self.graph_hash)
    }

    /// Hex string of the options hash (64 characters).
    pub fn options_hash_hex(&self) -> String {
        bytes_to_hex(&self.options_hash)
    }

    pub fn to_json(&self) -> String {
        serde_json::json!({
            "graph_hash": self.graph_hash_hex(),
            "options_hash": self.options_hash_hex(),
            "compiler_version": self.compiler_version,
        })
        .to_string()
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Compute provenance from the source graph, its outputs and the options.
pub fn compute_provenance(
    graph: &Graph,
    outputs: &[PortElements],
    options: &CompileOptions,
) -> Result<Provenance, serde_json::Error> {
    let canonical_graph = serde_json::to_vec(&(graph.to_records(), outputs))?;
    let canonical_options = serde_json::to_vec(options)?;
    Ok(Provenance {
        graph_hash: sha256(&canonical_graph),
        options_hash: sha256(&canonical_options),
        compiler_version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Artifacts ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GeneratedCode {
    pub c_source: String,
    pub procedure: Procedure,
    pub stats: EmitStats,
    pub provenance: Provenance,
}

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub options: CompileOptions,
    pub context: TransformContext,
    pub source: LoweredGraph,
    pub refined: Option<LoweredGraph>,
    pub pruned: Option<LoweredGraph>,
    pub folded: Option<LoweredGraph>,
    pub coordinates: Option<CoordinateGraph>,
    pub fusion: Option<FusionStats>,
    pub generated: Option<GeneratedCode>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
}

impl CompilationState {
    pub fn new(source: LoweredGraph, options: CompileOptions, context: TransformContext) -> Self {
        Self {
            options,
            context,
            source,
            refined: None,
            pruned: None,
            folded: None,
            coordinates: None,
            fusion: None,
            generated: None,
            diagnostics: Vec::new(),
            has_error: false,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Fusion(#[from] FusionError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error("procedure verification failed: {}", .0.join(", "))]
    Verification(Vec<&'static str>),
    #[error("cannot fingerprint the model: {0}")]
    Provenance(#[from] serde_json::Error),
    #[error("artifact {0:?} is not available")]
    MissingArtifact(ArtifactId),
}

impl Diagnose for StageError {
    fn code(&self) -> DiagCode {
        match self {
            StageError::Transform(e) => e.code(),
            StageError::Fusion(e) => e.code(),
            StageError::Emit(e) => e.code(),
            StageError::Verification(_) => codes::E0501_VERIFICATION,
            StageError::Provenance(_) => codes::E0502_PROVENANCE,
            StageError::MissingArtifact(_) => codes::E0503_MISSING_ARTIFACT,
        }
    }

    fn location(&self) -> Option<Location> {
        match self {
            StageError::Transform(e) => e.location(),
            StageError::Fusion(e) => e.location(),
            StageError::Emit(e) => e.location(),
            _ => None,
        }
    }
}

/// Pipeline execution failed in a pass. The matching diagnostic is also
/// recorded in `CompilationState.diagnostics`.
#[derive(Debug, thiserror::Error)]
#[error("{cause} (in pass {failing_pass:?})")]
pub struct PipelineError {
    /// The pass that produced the error.
    pub failing_pass: PassId,
    #[source]
    pub cause: StageError,
}

impl Diagnose for PipelineError {
    fn code(&self) -> DiagCode {
        self.cause.code()
    }

    fn location(&self) -> Option<Location> {
        self.cause.location()
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

fn artifact<T>(slot: &Option<T>, id: ArtifactId) -> Result<&T, StageError> {
    slot.as_ref().ok_or(StageError::MissingArtifact(id))
}

fn run_pass(state: &mut CompilationState, pass: PassId) -> Result<(), StageError> {
    match pass {
        PassId::Refine => {
            let refined = refine(
                &state.source,
                &state.context,
                state.options.max_refine_iterations,
            )?;
            state.refined = Some(refined);
        }
        PassId::Prune => {
            let pruned = prune(artifact(&state.refined, ArtifactId::Refined)?)?;
            state.pruned = Some(pruned);
        }
        PassId::Fold => {
            let pruned = artifact(&state.pruned, ArtifactId::Pruned)?;
            let folded = if state.options.fold_affine {
                fold_affine_chains(pruned)?
            } else {
                pruned.clone()
            };
            state.folded = Some(folded);
        }
        PassId::BuildCoordinates => {
            let folded = artifact(&state.folded, ArtifactId::Folded)?;
            let coords = CoordinateGraph::build(&folded.graph, &folded.inputs, &folded.outputs)?;
            state.coordinates = Some(coords);
        }
        PassId::Fuse => {
            let coords = state
                .coordinates
                .as_mut()
                .ok_or(StageError::MissingArtifact(ArtifactId::Coordinates))?;
            state.fusion = Some(coords.fuse(state.options.fusion_mode())?);
        }
        PassId::Emit => {
            let coords = state
                .coordinates
                .take()
                .ok_or(StageError::MissingArtifact(ArtifactId::Coordinates))?;
            let mut backends = (
                CEmitter::with_names(state.options.names()),
                ProgramEmitter::new(),
            );
            let stats = emit_procedure(coords, &state.options.function_name, &mut backends)?;
            let (c, program) = backends;
            let procedure = program.finish()?;
            let cert = verify_procedure(&procedure);
            if !cert.all_pass() {
                return Err(StageError::Verification(cert.failed()));
            }
            let provenance = compute_provenance(
                &state.source.graph,
                &state.source.outputs,
                &state.options,
            )?;
            state.generated = Some(GeneratedCode {
                c_source: c.finish(),
                procedure,
                stats,
                provenance,
            });
        }
    }
    Ok(())
}

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: enter span → execute → timing event → callback.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    mut on_pass_complete: impl FnMut(PassId, Duration),
) -> Result<(), PipelineError> {
    for pass in required_passes(terminal) {
        let name = descriptor(pass).name;
        let span = info_span!("pass", pass = name);
        let _entered = span.enter();

        let t = Instant::now();
        let result = run_pass(state, pass);
        let elapsed = t.elapsed();
        debug!(
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            ok = result.is_ok(),
            "pass complete"
        );

        if let Err(cause) = result {
            state.diagnostics.push(cause.to_diagnostic());
            state.has_error = true;
            return Err(PipelineError {
                failing_pass: pass,
                cause,
            });
        }
        on_pass_complete(pass, elapsed);
    }
    Ok(())
}

// ── Entry points ───────────────────────────────────────────────────────────

/// Compile the procedure computing `outputs` of `graph` under a custom
/// refinement policy.
pub fn compile_with_context(
    graph: Graph,
    outputs: Vec<PortElements>,
    options: &CompileOptions,
    context: TransformContext,
) -> Result<GeneratedCode, PipelineError> {
    let source = LoweredGraph::new(graph, outputs).map_err(|e| PipelineError {
        failing_pass: PassId::Refine,
        cause: e.into(),
    })?;
    let mut state = CompilationState::new(source, options.clone(), context);
    run_pipeline(&mut state, PassId::Emit, |_, _| {})?;
    state.generated.ok_or(PipelineError {
        failing_pass: PassId::Emit,
        cause: StageError::MissingArtifact(ArtifactId::Generated),
    })
}

/// Compile with the default refinement policy (refine until primitive).
pub fn compile(
    graph: Graph,
    outputs: Vec<PortElements>,
    options: &CompileOptions,
) -> Result<GeneratedCode, PipelineError> {
    compile_with_context(graph, outputs, options, TransformContext::default())
}

pub fn compile_to_c(
    graph: Graph,
    outputs: Vec<PortElements>,
    options: &CompileOptions,
) -> Result<String, PipelineError> {
    compile(graph, outputs, options).map(|g| g.c_source)
}

pub fn compile_to_procedure(
    graph: Graph,
    outputs: Vec<PortElements>,
    options: &CompileOptions,
) -> Result<Procedure, PipelineError> {
    compile(graph, outputs, options).map(|g| g.procedure)
}
