// codegen.rs — Code generation driver
//
// Assembles the output files of one model for the selected backend. The
// CoreNEURON targets share one file skeleton (preamble, data structures,
// host helpers, routines, event kernels, compute kernels, registration);
// the file plan of the backend decides how it is split across the primary
// file and an optional wrapper. NEURON-native output is delegated to
// `neuron.rs` as a whole.
//
// Preconditions: metadata, layout plan and call table were derived from the
//                same model.
// Postconditions: every compute kernel the backend cannot express is printed
//                 by a sequential session and reported as W0100; all other
//                 kernels are byte-identical to a run without fallback.
// Failure modes: the first emission error aborts generation; no partial
//                output is returned.
// Side effects: none.

use std::collections::BTreeMap;

use crate::backend::{
    policy, reachable_routines, BackendKind, BackendPolicy, BlockType, CppBackend, FilePlan,
};
use crate::calls::CallTable;
use crate::diag::{codes, Diagnostic};
use crate::emit::Session;
use crate::layout::LayoutPlan;
use crate::model::{Callable, ModelMetadata};
use crate::resolve::{Resolver, Style};
use crate::structs::GlobalDeclaration;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct CodegenResult {
    pub generated: GeneratedCode,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Default)]
pub struct GeneratedCode {
    /// Kernel file (`.cpp`, `.cu` or `.ispc`).
    pub primary: String,
    /// Host wrapper for split-compilation backends.
    pub wrapper: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CodegenOptions {
    pub backend: BackendKind,
    /// Print the provenance hash in the file header.
    pub provenance: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        CodegenOptions {
            backend: BackendKind::Cpp,
            provenance: true,
        }
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

pub fn codegen(
    metadata: &ModelMetadata,
    plan: &LayoutPlan,
    calls: &CallTable,
    options: &CodegenOptions,
    provenance: Option<&str>,
) -> CodegenResult {
    let style = match options.backend {
        BackendKind::Neuron => Style::Neuron,
        _ => Style::Coreneuron,
    };
    let resolver = match Resolver::new(metadata, plan, style) {
        Ok(resolver) => resolver,
        Err(diag) => {
            return CodegenResult {
                generated: GeneratedCode::default(),
                diagnostics: vec![diag],
            }
        }
    };
    let backend = policy(options.backend);
    let mut ctx = CodegenCtx {
        metadata,
        plan,
        calls,
        resolver: &resolver,
        backend: backend.as_ref(),
        provenance: provenance.filter(|_| options.provenance),
        fallbacks: BTreeMap::new(),
        diagnostics: Vec::new(),
    };
    match ctx.emit_all() {
        Ok(generated) => CodegenResult {
            generated,
            diagnostics: ctx.diagnostics,
        },
        Err(diag) => {
            ctx.diagnostics.push(diag);
            CodegenResult {
                generated: GeneratedCode::default(),
                diagnostics: ctx.diagnostics,
            }
        }
    }
}

/// Compute kernels the model needs, in file order.
pub fn compute_kernels(metadata: &ModelMetadata) -> Vec<BlockType> {
    let mut blocks = vec![BlockType::Initial];
    if metadata.nrn_cur_required() {
        blocks.push(BlockType::Equation);
    }
    if metadata.nrn_state_required() {
        blocks.push(BlockType::State);
    }
    blocks
}

fn kernel_method(block: BlockType) -> &'static str {
    match block {
        BlockType::Initial => "nrn_init",
        BlockType::Equation => "nrn_cur",
        _ => "nrn_state",
    }
}

// ── Internal context ────────────────────────────────────────────────────────

struct CodegenCtx<'a> {
    metadata: &'a ModelMetadata,
    plan: &'a LayoutPlan,
    calls: &'a CallTable,
    resolver: &'a Resolver<'a>,
    backend: &'a dyn BackendPolicy,
    provenance: Option<&'a str>,
    /// Compute kernels printed by the sequential backend, with the reason.
    fallbacks: BTreeMap<BlockType, String>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> CodegenCtx<'a> {
    fn session(&self) -> Session<'a> {
        Session::new(self.metadata, self.plan, self.calls, self.resolver, self.backend)
    }

    fn emit_all(&mut self) -> Result<GeneratedCode, Diagnostic> {
        if self.backend.kind() == BackendKind::Neuron {
            let mut s = self.session();
            s.print_neuron_file(self.provenance)?;
            return Ok(GeneratedCode {
                primary: s.finish(),
                wrapper: None,
            });
        }
        self.plan_fallbacks();
        match self.backend.file_plan() {
            FilePlan::Single => Ok(GeneratedCode {
                primary: self.emit_coreneuron_file()?,
                wrapper: None,
            }),
            FilePlan::DeviceWithHostDeclarations => Ok(GeneratedCode {
                primary: self.emit_coreneuron_file()?,
                wrapper: Some(self.emit_host_declarations()),
            }),
            FilePlan::KernelsWithHostWrapper => {
                let primary = self.emit_kernel_file()?;
                let wrapper = self.emit_host_wrapper()?;
                Ok(GeneratedCode {
                    primary,
                    wrapper: Some(wrapper),
                })
            }
        }
    }

    /// Asks the backend about every compute kernel once; a fallback is a
    /// warning, never an error.
    fn plan_fallbacks(&mut self) {
        for block in compute_kernels(self.metadata) {
            let Some(reason) = self.backend.fallback_reason(block, self.metadata, self.calls)
            else {
                continue;
            };
            let method = self.resolver.method_name(kernel_method(block));
            self.diagnostics.push(
                Diagnostic::warning(
                    codes::W0100,
                    format!(
                        "{} is generated for the C++ backend instead of {}: {}",
                        method,
                        self.backend.kind(),
                        reason
                    ),
                )
                .with_hint("remove the construct to keep the kernel on the selected backend"),
            );
            self.fallbacks.insert(block, reason);
        }
    }

    fn routines(&self) -> Vec<&'a Callable> {
        let m = self.metadata;
        m.procedures.iter().chain(&m.functions).collect()
    }

    // ── Shared skeleton ──

    /// Info header through the CONSTRUCTOR/DESTRUCTOR hooks.
    fn print_host_preamble(&self, s: &mut Session<'a>, declaration: GlobalDeclaration) -> Result<(), Diagnostic> {
        s.print_backend_info("CoreNEURON", self.provenance);
        s.print_headers();
        s.print_namespace_begin();
        s.print_unit_constants();
        s.print_prcellstate_macros();
        s.print_mechanism_info();
        s.print_global_struct(true, declaration);
        s.print_instance_struct(true);
        s.print_hoc_tables();
        s.print_getters();
        s.print_memory_routines();
        s.print_thread_callbacks();
        s.print_instance_setup();
        s.print_nrn_alloc();
        s.print_nrn_constructor()?;
        s.print_nrn_destructor()
    }

    fn print_routines(&self, s: &mut Session<'a>, routines: &[&'a Callable]) -> Result<(), Diagnostic> {
        s.print_function_prototypes(routines);
        for routine in routines {
            s.print_callable(routine)?;
        }
        Ok(())
    }

    /// BEFORE/AFTER, derivimplicit and every event kernel.
    fn print_host_kernels(&self, s: &mut Session<'a>) -> Result<(), Diagnostic> {
        let m = self.metadata;
        for (i, block) in m.before_after.iter().enumerate() {
            s.print_before_after(i, block)?;
        }
        for block in &m.derivimplicit_blocks {
            s.print_derivimplicit_kernel(block)?;
        }
        s.print_net_send_buffering();
        s.print_net_init()?;
        s.print_watch_activate()?;
        s.print_watch_check()?;
        s.print_net_receive_kernel()?;
        s.print_net_receive_front_end();
        s.print_net_buf_receive();
        Ok(())
    }

    fn print_compute_kernel(s: &mut Session<'a>, block: BlockType) -> Result<(), Diagnostic> {
        match block {
            BlockType::Initial => s.print_nrn_init(),
            BlockType::Equation => s.print_nrn_cur(),
            _ => s.print_nrn_state(),
        }
    }

    /// The kernel for `block` as the sequential backend prints it.
    fn print_fallback_kernel(s: &mut Session<'a>, block: BlockType) -> Result<(), Diagnostic> {
        let mut sequential = s.fork(&CppBackend);
        Self::print_compute_kernel(&mut sequential, block)?;
        s.p.add_text(sequential.finish());
        Ok(())
    }

    fn print_registration_and_close(s: &mut Session<'a>) {
        s.print_check_table_thread();
        s.print_mechanism_register();
        s.print_namespace_end();
    }

    // ── Single translation unit (cpp, acc, cuda) ──

    fn emit_coreneuron_file(&self) -> Result<String, Diagnostic> {
        let mut s = self.session();
        self.print_host_preamble(&mut s, GlobalDeclaration::Definition)?;
        s.print_top_verbatim();
        self.print_routines(&mut s, &self.routines())?;
        self.print_host_kernels(&mut s)?;
        for block in compute_kernels(self.metadata) {
            if self.fallbacks.contains_key(&block) {
                Self::print_fallback_kernel(&mut s, block)?;
            } else {
                Self::print_compute_kernel(&mut s, block)?;
            }
        }
        Self::print_registration_and_close(&mut s);
        Ok(s.finish())
    }

    /// C++ declarations of the host entry points defined in the device file.
    fn emit_host_declarations(&self) -> String {
        let mut s = self.session();
        s.print_backend_info("CoreNEURON", self.provenance);
        s.print_namespace_begin();
        s.p.add_newline();
        for block in compute_kernels(self.metadata) {
            let method = s.method_name(kernel_method(block));
            s.p.add_line(format!("void {}(NrnThread* nt, Memb_list* ml, int type);", method));
        }
        s.print_namespace_end();
        s.finish()
    }

    // ── Kernel file with host wrapper (ispc) ──

    /// Routines reachable from the compute kernels that stay on the backend.
    fn kernel_routines(&self) -> Vec<&'a Callable> {
        let m = self.metadata;
        let mut names: Vec<String> = Vec::new();
        for block in compute_kernels(m) {
            if self.fallbacks.contains_key(&block) {
                continue;
            }
            for body in kernel_bodies(m, block) {
                for routine in reachable_routines(body, m, self.calls) {
                    names.push(routine.name.clone());
                }
            }
        }
        self.routines()
            .into_iter()
            .filter(|r| names.contains(&r.name))
            .collect()
    }

    fn uses_celsius(&self) -> bool {
        self.metadata.neuron_globals.iter().any(|g| g == "celsius")
    }

    fn emit_kernel_file(&mut self) -> Result<String, Diagnostic> {
        let m = self.metadata;
        let mut s = self.session();
        s.print_backend_info("CoreNEURON", self.provenance);
        s.p.add_newline();
        self.backend.backend_includes(&mut s.p, m);
        s.print_ispc_constants();
        if self.uses_celsius() {
            s.p.add_line("extern uniform double ispc_celsius;");
        }
        s.print_global_struct(false, GlobalDeclaration::Extern);
        s.print_instance_struct(false);
        let routines = self.kernel_routines();
        self.print_routines(&mut s, &routines)?;
        for block in compute_kernels(m) {
            if !self.fallbacks.contains_key(&block) {
                Self::print_compute_kernel(&mut s, block)?;
            }
        }
        self.report_moved_routines(&routines);
        Ok(s.finish())
    }

    /// W0101 for routines that only a fallback kernel reaches.
    fn report_moved_routines(&mut self, kernel_routines: &[&'a Callable]) {
        let m = self.metadata;
        for block in self.fallbacks.keys() {
            for body in kernel_bodies(m, *block) {
                for routine in reachable_routines(body, m, self.calls) {
                    let on_backend = kernel_routines.iter().any(|r| r.name == routine.name);
                    let reported = self.diagnostics.iter().any(|d| {
                        d.code == Some(codes::W0101) && d.message.contains(&format!("'{}'", routine.name))
                    });
                    if !on_backend && !reported {
                        self.diagnostics.push(Diagnostic::warning(
                            codes::W0101,
                            format!(
                                "'{}' is only generated in the wrapper file, next to {}",
                                routine.name,
                                self.resolver.method_name(kernel_method(*block))
                            ),
                        ));
                    }
                }
            }
        }
    }

    /// Host half: data structures, host-only kernels, fallback kernels and
    /// one launcher per backend kernel.
    fn emit_host_wrapper(&self) -> Result<String, Diagnostic> {
        let m = self.metadata;
        let mut s = self.session().fork(&CppBackend);
        self.print_host_preamble(&mut s, GlobalDeclaration::ExternC)?;
        if self.uses_celsius() {
            s.p.add_newline();
            s.p.push_block("extern \"C\"");
            s.p.add_line("double ispc_celsius;");
            s.p.pop_block();
        }
        s.print_top_verbatim();
        self.print_routines(&mut s, &self.routines())?;

        let offloaded: Vec<BlockType> = compute_kernels(m)
            .into_iter()
            .filter(|b| !self.fallbacks.contains_key(b))
            .collect();
        let instance = s.instance_struct();
        if !offloaded.is_empty() {
            s.p.add_newlines(2);
            s.p.add_line("/** kernel declarations of the ISPC file */");
            s.p.push_block("extern \"C\"");
            for block in &offloaded {
                let method = s.method_name(kernel_method(*block));
                s.p.add_line(format!(
                    "void ispc_{}({}* inst, NrnThread* nt, Memb_list* ml, int type);",
                    method, instance
                ));
            }
            s.p.pop_block();
        }

        self.print_host_kernels(&mut s)?;
        for block in compute_kernels(m) {
            if self.fallbacks.contains_key(&block) {
                Self::print_compute_kernel(&mut s, block)?;
                continue;
            }
            let method = s.method_name(kernel_method(block));
            s.p.add_newlines(2);
            s.p
                .push_block(format!("void {}(NrnThread* nt, Memb_list* ml, int type)", method));
            if block == BlockType::Initial {
                s.p.add_line("setup_instance(nt, ml);");
            }
            s.p
                .add_line(format!("auto* const inst = static_cast<{}*>(ml->instance);", instance));
            if self.uses_celsius() {
                s.p.add_line("ispc_celsius = celsius;");
            }
            s.p.add_line(format!("ispc_{}(inst, nt, ml, type);", method));
            s.p.pop_block();
        }
        Self::print_registration_and_close(&mut s);
        Ok(s.finish())
    }
}

// ── Free helpers ────────────────────────────────────────────────────────────

/// Statement blocks a compute kernel runs.
fn kernel_bodies(metadata: &ModelMetadata, block: BlockType) -> Vec<&crate::ast::StatementBlock> {
    let mut bodies = Vec::new();
    match block {
        BlockType::Initial => bodies.extend(metadata.initial.iter()),
        BlockType::Equation => bodies.extend(metadata.breakpoint.iter()),
        _ => {
            bodies.extend(metadata.nrn_state.iter());
            if metadata.currents.is_empty() {
                bodies.extend(metadata.breakpoint.iter());
            }
        }
    }
    bodies
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::classify;
    use crate::diag::DiagLevel;
    use crate::layout;
    use crate::model::{build, ModelFile};

    const HH: &str = r#"{
        "mod_file": "hh", "suffix": "hh",
        "variables": [
            {"name": "gnabar", "kinds": ["range", "parameter"], "value": 0.12},
            {"name": "ina", "kinds": ["range", "assigned"]},
            {"name": "ena", "kinds": ["assigned"]}
        ],
        "ions": [{"name": "na", "reads": ["ena"], "writes": ["ina"]}],
        "currents": ["ina"],
        "blocks": {"initial": "ina = 0", "breakpoint": "ina = gnabar*(v - ena)"}
    }"#;

    const VERBATIM_CURRENT: &str = r#"{
        "mod_file": "leak", "suffix": "leak",
        "variables": [
            {"name": "x", "kinds": ["range", "assigned"]},
            {"name": "il", "kinds": ["range", "assigned"]}
        ],
        "currents": ["il"],
        "blocks": {
            "initial": "x = 1",
            "breakpoint": "il = 0.1*v\nVERBATIM\n x = 2;\nENDVERBATIM"
        }
    }"#;

    fn generate(json: &str, backend: BackendKind) -> CodegenResult {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        let options = CodegenOptions {
            backend,
            provenance: true,
        };
        codegen(&metadata, &plan, &calls, &options, Some("abc123"))
    }

    #[test]
    fn sequential_backend_writes_one_file_in_skeleton_order() {
        let result = generate(HH, BackendKind::Cpp);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert!(result.generated.wrapper.is_none());
        let text = &result.generated.primary;
        assert!(text.contains("Provenance      : abc123"));
        let order = [
            "namespace coreneuron {",
            "static const char *mechanism[]",
            "struct hh_Store {",
            "struct hh_Instance {",
            "static void nrn_alloc_hh(",
            "void nrn_init_hh(NrnThread* nt, Memb_list* ml, int type) {",
            "void nrn_cur_hh(NrnThread* nt, Memb_list* ml, int type) {",
            "void nrn_state_hh(NrnThread* nt, Memb_list* ml, int type) {",
            "void _hh_reg() {",
            "}  // namespace coreneuron",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|needle| text.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);
    }

    #[test]
    fn provenance_can_be_disabled() {
        let file: ModelFile = serde_json::from_str(HH).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        let options = CodegenOptions {
            backend: BackendKind::Cpp,
            provenance: false,
        };
        let result = codegen(&metadata, &plan, &calls, &options, Some("abc123"));
        assert!(!result.generated.primary.contains("Provenance"));
    }

    #[test]
    fn cuda_wrapper_declares_host_entry_points() {
        let result = generate(HH, BackendKind::Cuda);
        let wrapper = result.generated.wrapper.expect("wrapper");
        assert!(wrapper.contains("namespace cuda {"));
        assert!(wrapper.contains("void nrn_init_hh(NrnThread* nt, Memb_list* ml, int type);\n"));
        assert!(wrapper.contains("void nrn_cur_hh(NrnThread* nt, Memb_list* ml, int type);\n"));
        assert!(result
            .generated
            .primary
            .contains("__global__ void nrn_cur_hh_kernel(NrnThread* nt, Memb_list* ml, int type) {"));
    }

    #[test]
    fn ispc_falls_back_for_the_verbatim_kernel_only() {
        let result = generate(VERBATIM_CURRENT, BackendKind::Ispc);
        let warnings: Vec<_> = result
            .diagnostics
            .iter()
            .filter(|d| d.level == DiagLevel::Warning)
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].code, Some(codes::W0100));
        assert!(warnings[0].message.starts_with("nrn_cur_leak is generated for the C++ backend"));

        let kernels = &result.generated.primary;
        assert!(kernels.contains("export void ispc_nrn_init_leak("));
        assert!(kernels.contains("export void ispc_nrn_state_leak("));
        assert!(!kernels.contains("ispc_nrn_cur_leak"));

        let wrapper = result.generated.wrapper.expect("wrapper");
        assert!(wrapper.contains("void ispc_nrn_init_leak(leak_Instance* inst, NrnThread* nt, Memb_list* ml, int type);"));
        assert!(wrapper.contains("    setup_instance(nt, ml);\n    auto* const inst = static_cast<leak_Instance*>(ml->instance);\n    ispc_nrn_init_leak(inst, nt, ml, type);\n"));
        assert!(wrapper.contains("void nrn_cur_leak(NrnThread* nt, Memb_list* ml, int type) {"));
        assert!(wrapper.contains("// VERBATIM\n"));
        assert!(wrapper.contains("inst->x[id] = 2;"));
    }

    #[test]
    fn neuron_backend_reports_unsupported_constructs() {
        let json = r#"{
            "mod_file": "cad", "suffix": "cad",
            "variables": [{"name": "cai", "kinds": ["state"]}],
            "solves": [{"block": "states", "method": "derivimplicit"}],
            "blocks": {
                "state": "DERIVIMPLICIT states",
                "derivimplicit": [{"name": "states", "body": "Dcai = -cai"}]
            }
        }"#;
        let result = generate(json, BackendKind::Neuron);
        assert!(result.generated.primary.is_empty());
        assert_eq!(result.diagnostics.len(), 1);
        assert_eq!(result.diagnostics[0].code, Some(codes::E0201));
    }

    #[test]
    fn neuron_backend_writes_one_file() {
        let result = generate(HH, BackendKind::Neuron);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        assert!(result.generated.wrapper.is_none());
        assert!(result.generated.primary.contains("Simulator       : NEURON"));
    }
}
