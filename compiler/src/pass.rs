// pass.rs — Pass descriptors: metadata, dependency resolution, artifact IDs
//
// Declares the compiler's four passes (loading the model file is outside the
// runner), their dependency edges and the artifacts they produce. The
// pipeline runner uses them to run the minimal pass subset for each --emit
// target.
//
// Preconditions: none.
// Postconditions: `required_passes` returns a topological order.
// Failure modes: none.
// Side effects: none.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each compiler pass (loading excluded, handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    BuildModel,
    ClassifyCalls,
    PlanLayout,
    Codegen,
}

/// Machine-readable artifact identifiers. Each maps to a field of the
/// compilation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Metadata,  // ModelMetadata
    CallTable, // CallTable
    Layout,    // LayoutPlan
    Generated, // GeneratedCode
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a compiler pass.
pub struct PassDescriptor {
    /// Human-readable name for verbose output.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Postconditions (documentation only).
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::BuildModel => PassDescriptor {
            name: "build_model",
            inputs: &[],
            outputs: &[ArtifactId::Metadata],
            invalidation_key: "model file",
            invariants: "blocks parsed, variables classified, ions and SOLVE targets checked",
        },
        PassId::ClassifyCalls => PassDescriptor {
            name: "classify_calls",
            inputs: &[PassId::BuildModel],
            outputs: &[ArtifactId::CallTable],
            invalidation_key: "metadata",
            invariants: "every call site name has a CallKind",
        },
        PassId::PlanLayout => PassDescriptor {
            name: "plan_layout",
            inputs: &[PassId::BuildModel],
            outputs: &[ArtifactId::Layout],
            invalidation_key: "metadata",
            invariants: "float and int layouts fixed, semantics indices match int offsets",
        },
        PassId::Codegen => PassDescriptor {
            name: "codegen",
            inputs: &[PassId::ClassifyCalls, PassId::PlanLayout],
            outputs: &[ArtifactId::Generated],
            invalidation_key: "metadata + calls + layout + codegen_options",
            invariants: "complete translation unit(s) or error diagnostics",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 4] = [
    PassId::BuildModel,
    PassId::ClassifyCalls,
    PassId::PlanLayout,
    PassId::Codegen,
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

// ── Tests ──────────────────────────────────────────────────────────────────
