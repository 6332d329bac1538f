// pipeline.rs — Compilation state and pass orchestration
//
// Holds every pass artifact of one model and runs the minimal set of passes
// for a given terminal PassId.
//
// Preconditions: the model file is loaded and decoded before run_pipeline.
// Postconditions: all artifacts for required passes are populated, or has_error is set.
// Failure modes: any pass emitting error-level diagnostics.
// Side effects: calls on_pass_complete after each pass for immediate display;
//               prints timing lines to stderr when verbose.

use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::calls::CallTable;
use crate::codegen::{CodegenOptions, GeneratedCode};
use crate::diag::{codes, DiagLevel, Diagnostic};
use crate::layout::LayoutPlan;
use crate::model::{ModelFile, ModelMetadata};
use crate::pass::{descriptor, required_passes, PassId};

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible builds and cache keys.
///
/// `model_hash`: SHA-256 of the raw model file text.
/// `layout_fingerprint`: SHA-256 of the compact JSON of the layout plan.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub model_hash: [u8; 32],
    pub layout_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    /// Hex string of the model hash (64 characters).
    pub fn model_hash_hex(&self) -> String {
        bytes_to_hex(&self.model_hash)
    }

    pub fn layout_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.layout_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        let value = serde_json::json!({
            "model_hash": self.model_hash_hex(),
            "layout_fingerprint": self.layout_fingerprint_hex(),
            "compiler_version": self.compiler_version,
        });
        format!("{:#}\n", value)
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

fn sha256(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Compute provenance from the model text and its layout.
///
/// The fingerprint hashes compact JSON so it does not depend on display
/// formatting; two models with the same layout share it.
pub fn compute_provenance(source: &str, plan: &LayoutPlan) -> Result<Provenance, Diagnostic> {
    Ok(Provenance {
        model_hash: sha256(source),
        layout_fingerprint: json_fingerprint(plan, "layout plan")?,
        compiler_version: env!("CARGO_PKG_VERSION"),
    })
}

/// SHA-256 of the compact JSON of `value`.
fn json_fingerprint<T: Serialize + ?Sized>(value: &T, what: &str) -> Result<[u8; 32], Diagnostic> {
    let canonical = serde_json::to_string(value).map_err(|err| {
        Diagnostic::error(codes::E0111, format!("cannot fingerprint the {}: {}", what, err))
    })?;
    Ok(sha256(&canonical))
}

// ── Artifact storage ───────────────────────────────────────────────────────

/// Holds all compilation artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub source: String,
    pub file: ModelFile,
    pub metadata: Option<ModelMetadata>,
    pub calls: Option<CallTable>,
    pub layout: Option<LayoutPlan>,
    pub generated: Option<GeneratedCode>,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(source: String, file: ModelFile) -> Self {
        Self {
            source,
            file,
            metadata: None,
            calls: None,
            layout: None,
            generated: None,
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Error type ─────────────────────────────────────────────────────────────

/// Pipeline execution stopped at `failing_pass`. The diagnostics are in
/// `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    pub failing_pass: PassId,
}

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Per-pass post-processing: callback, accumulate, verbose, error check.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    if verbose {
        eprintln!(
            "mcc: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run the minimal set of passes to produce `terminal`.
///
/// Per-pass sequence: execute, on_pass_complete(callback), verbose, error check.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    codegen_options: &CodegenOptions,
    verbose: bool,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::BuildModel => match crate::model::build(&state.file) {
                Ok(metadata) => {
                    state.metadata = Some(metadata);
                    Vec::new()
                }
                Err(diags) => diags,
            },
            PassId::ClassifyCalls => {
                let metadata = state.metadata.as_ref().ok_or(PipelineError {
                    failing_pass: pass_id,
                })?;
                state.calls = Some(crate::calls::classify(metadata));
                Vec::new()
            }
            PassId::PlanLayout => {
                let metadata = state.metadata.as_ref().ok_or(PipelineError {
                    failing_pass: pass_id,
                })?;
                let plan = crate::layout::plan(metadata);
                let diags = match compute_provenance(&state.source, &plan) {
                    Ok(provenance) => {
                        state.provenance = Some(provenance);
                        Vec::new()
                    }
                    Err(diag) => vec![diag],
                };
                state.layout = Some(plan);
                diags
            }
            PassId::Codegen => {
                let (Some(metadata), Some(plan), Some(calls)) =
                    (&state.metadata, &state.layout, &state.calls)
                else {
                    return Err(PipelineError {
                        failing_pass: pass_id,
                    });
                };
                let hash = state.provenance.as_ref().map(Provenance::model_hash_hex);
                let result = crate::codegen::codegen(
                    metadata,
                    plan,
                    calls,
                    codegen_options,
                    hash.as_deref(),
                );
                if !has_error_diags(&result.diagnostics) {
                    state.generated = Some(result.generated);
                }
                result.diagnostics
            }
        };
        finish_pass(
            state,
            pass_id,
            diags,
            t.elapsed(),
            verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────
