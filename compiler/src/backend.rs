// backend.rs — Backend policies
//
// The kernel emitters share one control-flow skeleton. Every point where the
// targets diverge (loop construct, atomics, qualifiers, namespaces, device
// data annotations, literal spelling, fallback) is a hook on `BackendPolicy`.
// Emitters never branch on the backend identity.
//
// Preconditions: none.
// Postconditions: exactly one policy drives a code generation session; a
//                 fallback kernel is printed by a separate `CppBackend` session.
// Failure modes: `emit_atomic_update` with an operator other than `+`/`-`
//                returns E0200.
// Side effects: hooks append to the given `CodePrinter` only.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::ast::{Stmt, StatementBlock};
use crate::calls::{CallKind, CallTable};
use crate::diag::{codes, Diagnostic};
use crate::model::ModelMetadata;
use crate::printer::CodePrinter;

// ── Block and backend tags ───────────────────────────────────────────────

/// Kind of block a kernel is emitted for. Selects ion read/write rules and
/// the variables in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BlockType {
    Initial,
    Constructor,
    Destructor,
    /// BREAKPOINT current computation (`nrn_cur`).
    Equation,
    State,
    Watch,
    NetReceive,
    BeforeAfter,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockType::Initial => "initial",
            BlockType::Constructor => "constructor",
            BlockType::Destructor => "destructor",
            BlockType::Equation => "breakpoint",
            BlockType::State => "state",
            BlockType::Watch => "watch",
            BlockType::NetReceive => "net_receive",
            BlockType::BeforeAfter => "before_after",
        }
    }

    /// Per-instance kernels that device backends launch in parallel.
    pub fn is_compute_kernel(self) -> bool {
        matches!(
            self,
            BlockType::Initial | BlockType::Equation | BlockType::State
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Cpp,
    Acc,
    Cuda,
    Ispc,
    Neuron,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Cpp,
        BackendKind::Acc,
        BackendKind::Cuda,
        BackendKind::Ispc,
        BackendKind::Neuron,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Cpp => "cpp",
            BackendKind::Acc => "acc",
            BackendKind::Cuda => "cuda",
            BackendKind::Ispc => "ispc",
            BackendKind::Neuron => "neuron",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown backend '{}'", s))
    }
}

/// Output files produced by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePlan {
    /// One C++ translation unit.
    Single,
    /// Device source plus a C++ file declaring the host entry points.
    DeviceWithHostDeclarations,
    /// Kernel source plus a C++ wrapper holding host code and fallback kernels.
    KernelsWithHostWrapper,
}

/// Policy for the backend selected by `kind`.
pub fn policy(kind: BackendKind) -> Box<dyn BackendPolicy> {
    match kind {
        BackendKind::Cpp => Box::new(CppBackend),
        BackendKind::Acc => Box::new(AccBackend),
        BackendKind::Cuda => Box::new(CudaBackend),
        BackendKind::Ispc => Box::new(IspcBackend),
        BackendKind::Neuron => Box::new(NeuronBackend),
    }
}

// ── Policy trait ─────────────────────────────────────────────────────────

/// Platform divergence points. Defaults implement the sequential C++ target.
pub trait BackendPolicy {
    fn kind(&self) -> BackendKind;

    /// Name printed in the generated file header.
    fn name(&self) -> &'static str;

    fn file_plan(&self) -> FilePlan {
        FilePlan::Single
    }

    // ── File shape ──

    fn backend_includes(&self, _p: &mut CodePrinter, _metadata: &ModelMetadata) {}

    fn namespace_begin(&self, _p: &mut CodePrinter) {}

    fn namespace_end(&self, _p: &mut CodePrinter) {}

    fn memory_routines(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        host_memory_routines(p);
    }

    fn abort_routine(&self, p: &mut CodePrinter) {
        p.add_newlines(2);
        p.push_block("static inline void coreneuron_abort()");
        p.add_line("abort();");
        p.pop_block();
    }

    // ── Qualifiers ──

    /// Non-aliasing qualifier for kernel-local array pointers (`double* {q}data`).
    fn pointer_qualifier(&self) -> &'static str {
        "__restrict__ "
    }

    /// Prefix for kernel scalars shared by all lanes.
    fn scalar_qualifier(&self) -> &'static str {
        ""
    }

    /// Prefix of every member of the global struct.
    fn global_qualifier(&self) -> &'static str {
        ""
    }

    /// Prefix of the global struct singleton definition.
    fn global_instance_qualifier(&self) -> &'static str {
        ""
    }

    /// Prefix of FUNCTION/PROCEDURE definitions and device helpers.
    fn function_qualifier(&self) -> &'static str {
        "inline "
    }

    // ── Compute kernels ──

    /// Signature of the kernel for `block` (without the opening brace).
    fn kernel_signature(&self, method: &str, block: BlockType, _instance_struct: &str) -> String {
        if block == BlockType::Watch {
            format!("void {}(NrnThread* nt, Memb_list* ml)", method)
        } else {
            format!("void {}(NrnThread* nt, Memb_list* ml, int type)", method)
        }
    }

    /// The kernel reads `inst` from `ml->instance` (otherwise it is a parameter).
    fn kernel_fetches_instance(&self) -> bool {
        true
    }

    /// `setup_instance` is called at the top of `nrn_init`.
    fn setup_instance_in_kernel(&self) -> bool {
        true
    }

    /// Printed after the closing brace of a compute kernel.
    fn after_compute_kernel(&self, _p: &mut CodePrinter, _method: &str, _block: BlockType) {}

    fn tiling(&self, p: &mut CodePrinter, _block: BlockType) {
        p.add_line("int start = 0;");
        p.add_line("int end = nodecount;");
    }

    fn parallel_hint(&self, p: &mut CodePrinter, _block: BlockType, _metadata: &ModelMetadata) {
        p.add_line("#pragma ivdep");
        p.add_line("#pragma omp simd");
    }

    fn begin_iteration(&self, p: &mut CodePrinter, _block: BlockType) {
        p.push_block("for (int id = start; id < end; id++)");
    }

    fn end_iteration(&self, p: &mut CodePrinter) {
        p.pop_block();
    }

    /// Whether matrix contributions go through per-instance shadow slots and
    /// a separate reduction pass.
    fn requires_shadow_reduction(&self, block: BlockType, metadata: &ModelMetadata) -> bool {
        block == BlockType::Equation && metadata.point_process
    }

    fn shadow_variables(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if metadata.point_process {
            p.add_line("double* shadow_rhs = nt->_shadow_rhs;");
            p.add_line("double* shadow_d = nt->_shadow_d;");
        }
    }

    fn begin_reduction(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        p.push_block("for (int id = start; id < end; id++)");
    }

    fn end_reduction(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        p.pop_block();
    }

    /// Race-free `lhs op= rhs` for `op` in `+`/`-`.
    fn emit_atomic_update(
        &self,
        p: &mut CodePrinter,
        lhs: &str,
        op: char,
        rhs: &str,
    ) -> Result<(), Diagnostic> {
        check_atomic_op(self.name(), op)?;
        p.add_line(format!("{} {}= {};", lhs, op, rhs));
        Ok(())
    }

    /// Accumulation inside the shadow reduction loop.
    fn reduction_update(
        &self,
        p: &mut CodePrinter,
        lhs: &str,
        op: char,
        rhs: &str,
    ) -> Result<(), Diagnostic> {
        self.emit_atomic_update(p, lhs, op, rhs)
    }

    // ── Device data ──

    fn data_present_begin(&self, _p: &mut CodePrinter, _metadata: &ModelMetadata) {}

    fn data_present_end(&self, _p: &mut CodePrinter, _metadata: &ModelMetadata) {}

    /// Reserve the next net_send buffer slot into `i`.
    fn net_send_count_update(&self, p: &mut CodePrinter) {
        p.add_line("i = nsb->_cnt++;");
    }

    /// The net_send buffer may be grown on overflow.
    fn net_send_buffer_growable(&self) -> bool {
        true
    }

    fn device_stream_wait(&self, _p: &mut CodePrinter) {}

    fn net_send_buf_update_to_host(&self, _p: &mut CodePrinter) {}

    fn count_update_to_device(&self, _p: &mut CodePrinter) {}

    fn global_device_update(&self, _p: &mut CodePrinter, _metadata: &ModelMetadata) {}

    fn deriv_advance_flag_update(&self, _p: &mut CodePrinter) {}

    // ── Names and literals ──

    fn rename_function<'a>(&self, name: &'a str) -> &'a str {
        name
    }

    fn rename_variable<'a>(&self, name: &'a str) -> &'a str {
        name
    }

    /// Spelling of a real literal given its source lexeme.
    fn format_real(&self, lexeme: &str) -> String {
        format_real_cpp(lexeme)
    }

    /// Calls removed from the output (statement dropped).
    fn drops_call(&self, _name: &str) -> bool {
        false
    }

    // ── Fallback ──

    /// Reason the compute kernel for `block` must be printed by the
    /// sequential backend instead, or `None` when this backend can express it.
    fn fallback_reason(
        &self,
        _block: BlockType,
        _metadata: &ModelMetadata,
        _calls: &CallTable,
    ) -> Option<String> {
        None
    }
}

fn check_atomic_op(backend: &str, op: char) -> Result<(), Diagnostic> {
    if op == '+' || op == '-' {
        return Ok(());
    }
    Err(Diagnostic::error(
        codes::E0200,
        format!("atomic update with operator '{}' is not supported", op),
    )
    .with_cause(format!("{} backend", backend), None)
    .with_hint("only '+' and '-' accumulations can be made atomic"))
}

fn host_memory_routines(p: &mut CodePrinter) {
    p.add_newlines(2);
    p.push_block("static inline void* mem_alloc(size_t num, size_t size, size_t alignment = 16)");
    p.add_multi_line(
        r#"
        void* ptr;
        posix_memalign(&ptr, alignment, num*size);
        memset(ptr, 0, size);
        return ptr;
        "#,
    );
    p.pop_block();
    p.add_newlines(2);
    p.push_block("static inline void mem_free(void* ptr)");
    p.add_line("free(ptr);");
    p.pop_block();
}

fn managed_memory_routines(p: &mut CodePrinter) {
    p.add_newlines(2);
    p.push_block("static inline void* mem_alloc(size_t num, size_t size, size_t alignment = 16)");
    p.add_multi_line(
        r#"
        void* ptr;
        cudaMallocManaged(&ptr, num*size);
        cudaMemset(ptr, 0, num*size);
        return ptr;
        "#,
    );
    p.pop_block();
    p.add_newlines(2);
    p.push_block("static inline void mem_free(void* ptr)");
    p.add_line("cudaFree(ptr);");
    p.pop_block();
}

fn device_abort_routine(p: &mut CodePrinter, qualifier: &str, what: &str) {
    p.add_newlines(2);
    p.push_block(format!("{}static inline void coreneuron_abort()", qualifier));
    p.add_line(format!(r#"printf("Error : Issue while running {} kernel \n");"#, what));
    p.add_line("assert(0==1);");
    p.pop_block();
}

/// Real literal as written, with integral values printed as `x.0`.
pub fn format_real_cpp(lexeme: &str) -> String {
    if lexeme.contains(['e', 'E']) {
        return lexeme.to_string();
    }
    match lexeme.parse::<f64>() {
        Ok(value) if value.fract() == 0.0 => format!("{:.1}", value),
        _ => lexeme.to_string(),
    }
}

/// ISPC double literal with the `d` exponent marker.
pub fn format_real_ispc(lexeme: &str) -> String {
    let Ok(value) = lexeme.parse::<f64>() else {
        return lexeme.to_string();
    };
    if value.ceil() == value {
        return format!("{:.1}d", value);
    }
    if (-1.0..=1.0).contains(&value) {
        return format!("{:.16}d", value);
    }
    let e = value.abs().log10().floor();
    let m = 10f64.powf(e);
    format!("{:.6}d{}", value / m, e as i32)
}

/// `-rhs`, parenthesized unless `rhs` is a plain access expression.
fn negated(rhs: &str) -> String {
    let plain = rhs
        .replace("->", ".")
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '[' | ']' | '.'));
    if plain {
        format!("-{}", rhs)
    } else {
        format!("-({})", rhs)
    }
}

// ── Fallback analysis ────────────────────────────────────────────────────

fn contains_verbatim(block: &StatementBlock) -> bool {
    let mut found = false;
    block.walk_stmts(&mut |s| {
        if matches!(s, Stmt::Verbatim(..)) {
            found = true;
        }
    });
    found
}

/// Model routines reachable from `block`, transitively.
pub fn reachable_routines<'m>(
    block: &StatementBlock,
    metadata: &'m ModelMetadata,
    calls: &CallTable,
) -> Vec<&'m crate::model::Callable> {
    let mut seen: Vec<String> = Vec::new();
    let mut pending = calls.methods_called_in(block);
    let mut out = Vec::new();
    while let Some(name) = pending.pop() {
        if seen.contains(&name) {
            continue;
        }
        seen.push(name.clone());
        if let Some(callable) = metadata.callable(&name) {
            pending.extend(calls.methods_called_in(&callable.body));
            out.push(callable);
        }
    }
    out
}

/// VERBATIM in the block or in any routine it calls.
pub fn needs_native_code(block: &StatementBlock, metadata: &ModelMetadata, calls: &CallTable) -> bool {
    contains_verbatim(block)
        || reachable_routines(block, metadata, calls)
            .iter()
            .any(|c| contains_verbatim(&c.body))
}

fn calls_kind(block: &StatementBlock, calls: &CallTable, kind: &CallKind) -> bool {
    let mut found = false;
    block.walk_exprs(&mut |e| {
        if let crate::ast::Expr::Call(call) = e {
            if &calls.kind(&call.name.name) == kind {
                found = true;
            }
        }
    });
    found
}

// ── Sequential C++ ───────────────────────────────────────────────────────

/// Plain loops with vectorization hints.
#[derive(Debug, Clone, Copy, Default)]
pub struct CppBackend;

impl BackendPolicy for CppBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpp
    }

    fn name(&self) -> &'static str {
        "C (api-compatibility)"
    }
}

// ── OpenACC / OpenMP offload ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct AccBackend;

impl AccBackend {
    fn atomic_pragma(p: &mut CodePrinter) {
        p.add_line("nrn_pragma_acc(atomic update)");
        p.add_line("nrn_pragma_omp(atomic update)");
    }
}

impl BackendPolicy for AccBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Acc
    }

    fn name(&self) -> &'static str {
        "C-OpenAcc (api-compatibility)"
    }

    fn backend_includes(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        // artificial cells run on the host
        if metadata.artificial_cell {
            p.add_line("#undef DISABLE_OPENACC");
            p.add_line("#define DISABLE_OPENACC");
        } else {
            p.add_line("#include <coreneuron/utils/offload.hpp>");
            p.add_line("#include <cuda_runtime_api.h>");
        }
    }

    fn memory_routines(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if metadata.artificial_cell {
            host_memory_routines(p);
        } else {
            managed_memory_routines(p);
        }
    }

    fn abort_routine(&self, p: &mut CodePrinter) {
        device_abort_routine(p, "", "OpenACC");
    }

    fn parallel_hint(&self, p: &mut CodePrinter, block: BlockType, metadata: &ModelMetadata) {
        if metadata.artificial_cell {
            return;
        }
        let mut present = String::from("present(inst");
        if block == BlockType::NetReceive {
            present.push_str(", nrb");
        } else {
            present.push_str(", node_index, data, voltage, indexes, thread");
            if block == BlockType::Equation {
                present.push_str(", vec_rhs, vec_d");
            }
        }
        present.push(')');
        p.add_line(format!(
            "nrn_pragma_acc(parallel loop {} async(nt->stream_id) if(nt->compute_gpu))",
            present
        ));
        p.add_line("nrn_pragma_omp(target teams distribute parallel for if(nt->compute_gpu))");
    }

    fn shadow_variables(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if metadata.point_process {
            p.add_line("double* shadow_rhs = nt->_shadow_rhs;");
            p.add_line("double* shadow_d = nt->_shadow_d;");
        }
    }

    fn begin_reduction(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if !metadata.artificial_cell {
            p.add_line(
                "nrn_pragma_acc(parallel loop present(node_index, vec_rhs, vec_d, shadow_rhs, shadow_d) async(nt->stream_id) if(nt->compute_gpu))",
            );
            p.add_line("nrn_pragma_omp(target teams distribute parallel for if(nt->compute_gpu))");
        }
        p.push_block("for (int id = start; id < end; id++)");
    }

    fn emit_atomic_update(
        &self,
        p: &mut CodePrinter,
        lhs: &str,
        op: char,
        rhs: &str,
    ) -> Result<(), Diagnostic> {
        check_atomic_op(self.name(), op)?;
        Self::atomic_pragma(p);
        p.add_line(format!("{} {}= {};", lhs, op, rhs));
        Ok(())
    }

    fn data_present_begin(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if !metadata.artificial_cell {
            p.add_line("nrn_pragma_acc(data present(nt, ml) if(nt->compute_gpu))");
            p.add_line("{");
            p.increase_indent();
        }
    }

    fn data_present_end(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if !metadata.artificial_cell {
            p.pop_block();
        }
    }

    fn net_send_count_update(&self, p: &mut CodePrinter) {
        p.push_block("if (nt->compute_gpu)");
        p.add_line("nrn_pragma_acc(atomic capture)");
        p.add_line("nrn_pragma_omp(atomic capture)");
        p.add_line("i = nsb->_cnt++;");
        p.chain_block("else");
        p.add_line("i = nsb->_cnt++;");
        p.pop_block();
    }

    fn net_send_buffer_growable(&self) -> bool {
        false
    }

    fn device_stream_wait(&self, p: &mut CodePrinter) {
        p.push_block("if(nt->compute_gpu)");
        p.add_line("nrn_pragma_acc(wait(nt->stream_id))");
        p.pop_block();
    }

    fn net_send_buf_update_to_host(&self, p: &mut CodePrinter) {
        self.device_stream_wait(p);
        p.push_block("if (nsb && nt->compute_gpu)");
        p.add_line("nrn_pragma_acc(update self(nsb->_cnt))");
        p.add_line("nrn_pragma_omp(target update from(nsb->_cnt))");
        p.add_line("update_net_send_buffer_on_host(nt, nsb);");
        p.pop_block();
    }

    fn count_update_to_device(&self, p: &mut CodePrinter) {
        p.push_block("if (nt->compute_gpu)");
        p.add_line("nrn_pragma_acc(update device(nsb->_cnt))");
        p.add_line("nrn_pragma_omp(target update to(nsb->_cnt))");
        p.pop_block();
    }

    fn global_device_update(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if metadata.artificial_cell {
            return;
        }
        let global = format!("{}_global", metadata.mod_suffix);
        p.push_block("if (nt->compute_gpu)");
        p.add_line(format!("nrn_pragma_acc(update device ({}))", global));
        p.add_line(format!("nrn_pragma_omp(target update to({}))", global));
        p.pop_block();
    }

    fn deriv_advance_flag_update(&self, p: &mut CodePrinter) {
        p.add_line("nrn_pragma_acc(update device (deriv_advance_flag) if(nt->compute_gpu))");
        p.add_line("nrn_pragma_omp(target update to(deriv_advance_flag) if(nt->compute_gpu))");
    }
}

// ── CUDA ─────────────────────────────────────────────────────────────────

/// Threads per block of the host launchers.
pub const CUDA_THREADS_PER_BLOCK: usize = 128;

#[derive(Debug, Clone, Copy, Default)]
pub struct CudaBackend;

impl BackendPolicy for CudaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cuda
    }

    fn name(&self) -> &'static str {
        "C-CUDA (api-compatibility)"
    }

    fn file_plan(&self) -> FilePlan {
        FilePlan::DeviceWithHostDeclarations
    }

    fn backend_includes(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        p.add_line("#include <cuda.h>");
        p.add_line("#include <cuda_runtime_api.h>");
        p.add_line("#include <assert.h>");
    }

    fn namespace_begin(&self, p: &mut CodePrinter) {
        p.add_line("namespace cuda {");
    }

    fn namespace_end(&self, p: &mut CodePrinter) {
        p.add_line("}  // namespace cuda");
    }

    fn memory_routines(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        managed_memory_routines(p);
    }

    fn abort_routine(&self, p: &mut CodePrinter) {
        device_abort_routine(p, "__host__ __device__ ", "CUDA");
    }

    fn global_instance_qualifier(&self) -> &'static str {
        "__managed__ "
    }

    fn function_qualifier(&self) -> &'static str {
        "__host__ __device__ inline "
    }

    fn kernel_signature(&self, method: &str, block: BlockType, instance_struct: &str) -> String {
        if block.is_compute_kernel() {
            format!(
                "__global__ void {}_kernel(NrnThread* nt, Memb_list* ml, int type)",
                method
            )
        } else {
            CppBackend.kernel_signature(method, block, instance_struct)
        }
    }

    fn setup_instance_in_kernel(&self) -> bool {
        false
    }

    fn after_compute_kernel(&self, p: &mut CodePrinter, method: &str, block: BlockType) {
        if !block.is_compute_kernel() {
            return;
        }
        p.add_newlines(2);
        p.push_block(format!("void {}(NrnThread* nt, Memb_list* ml, int type)", method));
        if block == BlockType::Initial {
            p.add_line("setup_instance(nt, ml);");
        }
        p.add_line("int nodecount = ml->nodecount;");
        p.add_line(format!("int threads_per_block = {};", CUDA_THREADS_PER_BLOCK));
        p.add_line("int nblocks = (nodecount + threads_per_block - 1) / threads_per_block;");
        p.add_line(format!(
            "{}_kernel<<<nblocks, threads_per_block>>>(nt, ml, type);",
            method
        ));
        p.add_line("cudaDeviceSynchronize();");
        p.pop_block();
    }

    fn parallel_hint(&self, _p: &mut CodePrinter, _block: BlockType, _metadata: &ModelMetadata) {}

    fn begin_iteration(&self, p: &mut CodePrinter, block: BlockType) {
        if block.is_compute_kernel() {
            p.add_line("int id = blockIdx.x * blockDim.x + threadIdx.x;");
            p.push_block("if (id < end)");
        } else {
            p.push_block("for (int id = start; id < end; id++)");
        }
    }

    /// Each thread folds its own shadow slot after the main section.
    fn begin_reduction(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        p.push_block("if (id < end)");
    }

    fn emit_atomic_update(
        &self,
        p: &mut CodePrinter,
        lhs: &str,
        op: char,
        rhs: &str,
    ) -> Result<(), Diagnostic> {
        check_atomic_op(self.name(), op)?;
        if op == '+' {
            p.add_line(format!("atomicAdd(&{}, {});", lhs, rhs));
        } else {
            p.add_line(format!("atomicAdd(&{}, {});", lhs, negated(rhs)));
        }
        Ok(())
    }

    fn net_send_count_update(&self, p: &mut CodePrinter) {
        p.add_line("#ifdef __CUDA_ARCH__");
        p.add_line("i = atomicAdd(&nsb->_cnt, 1);");
        p.add_line("#else");
        p.add_line("i = nsb->_cnt++;");
        p.add_line("#endif");
    }

    fn net_send_buffer_growable(&self) -> bool {
        false
    }

    fn device_stream_wait(&self, p: &mut CodePrinter) {
        p.add_line("cudaDeviceSynchronize();");
    }

    fn fallback_reason(
        &self,
        block: BlockType,
        metadata: &ModelMetadata,
        calls: &CallTable,
    ) -> Option<String> {
        let body = match block {
            BlockType::Initial => metadata.initial.as_ref(),
            BlockType::Equation => metadata.breakpoint.as_ref(),
            BlockType::State => metadata.nrn_state.as_ref(),
            _ => return None,
        };
        if block == BlockType::Initial && metadata.require_wrote_conc {
            return Some("concentration writes call back into the host runtime".into());
        }
        if matches!(block, BlockType::Initial | BlockType::State) && metadata.derivimplicit_used() {
            return Some("the Newton solver workspace lives on the host".into());
        }
        let body = body?;
        if needs_native_code(body, metadata, calls) {
            return Some("VERBATIM code cannot run on the device".into());
        }
        if block == BlockType::Initial && calls_kind(body, calls, &CallKind::NetSend) {
            return Some("net_send from INITIAL uses the host event queue".into());
        }
        None
    }
}

// ── ISPC ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct IspcBackend;

impl BackendPolicy for IspcBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ispc
    }

    fn name(&self) -> &'static str {
        "ispc (api-compatibility)"
    }

    fn file_plan(&self) -> FilePlan {
        FilePlan::KernelsWithHostWrapper
    }

    fn backend_includes(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        p.add_line("#include \"nmodl/fast_math.ispc\"");
        p.add_line("#include \"coreneuron/mechanism/nrnoc_ml.ispc\"");
    }

    fn pointer_qualifier(&self) -> &'static str {
        "uniform "
    }

    fn scalar_qualifier(&self) -> &'static str {
        "uniform "
    }

    fn global_qualifier(&self) -> &'static str {
        "uniform "
    }

    fn function_qualifier(&self) -> &'static str {
        "static inline "
    }

    fn kernel_signature(&self, method: &str, _block: BlockType, instance_struct: &str) -> String {
        format!(
            "export void ispc_{}(uniform {}* uniform inst, uniform NrnThread* uniform nt, uniform Memb_list* uniform ml, uniform int type)",
            method, instance_struct
        )
    }

    fn kernel_fetches_instance(&self) -> bool {
        false
    }

    fn setup_instance_in_kernel(&self) -> bool {
        false
    }

    fn tiling(&self, p: &mut CodePrinter, _block: BlockType) {
        p.add_line("int uniform start = 0;");
        p.add_line("int uniform end = nodecount;");
    }

    fn parallel_hint(&self, _p: &mut CodePrinter, _block: BlockType, _metadata: &ModelMetadata) {}

    fn begin_iteration(&self, p: &mut CodePrinter, _block: BlockType) {
        p.push_block("foreach (id = start ... end)");
    }

    fn shadow_variables(&self, p: &mut CodePrinter, metadata: &ModelMetadata) {
        if metadata.point_process {
            p.add_line("double* uniform shadow_rhs = nt->_shadow_rhs;");
            p.add_line("double* uniform shadow_d = nt->_shadow_d;");
        }
    }

    fn begin_reduction(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        p.push_block("for (uniform int id = start; id < end; id++)");
        p.push_block("if (programIndex == 0)");
    }

    fn end_reduction(&self, p: &mut CodePrinter, _metadata: &ModelMetadata) {
        p.pop_block();
        p.pop_block();
    }

    fn emit_atomic_update(
        &self,
        p: &mut CodePrinter,
        lhs: &str,
        op: char,
        rhs: &str,
    ) -> Result<(), Diagnostic> {
        check_atomic_op(self.name(), op)?;
        let function = if op == '+' {
            "atomic_add_local"
        } else {
            "atomic_subtract_local"
        };
        p.add_line(format!("{}(&{}, {});", function, lhs, rhs));
        Ok(())
    }

    /// The reduction runs on one program instance; plain updates suffice.
    fn reduction_update(
        &self,
        p: &mut CodePrinter,
        lhs: &str,
        op: char,
        rhs: &str,
    ) -> Result<(), Diagnostic> {
        check_atomic_op(self.name(), op)?;
        p.add_line(format!("{} {}= {};", lhs, op, rhs));
        Ok(())
    }

    fn rename_function<'a>(&self, name: &'a str) -> &'a str {
        match name {
            "fabs" => "abs",
            "exp" => "vexp",
            other => other,
        }
    }

    fn rename_variable<'a>(&self, name: &'a str) -> &'a str {
        match name {
            "celsius" => "ispc_celsius",
            "PI" => "ISPC_PI",
            other => other,
        }
    }

    fn format_real(&self, lexeme: &str) -> String {
        format_real_ispc(lexeme)
    }

    fn drops_call(&self, name: &str) -> bool {
        name == "printf"
    }

    fn fallback_reason(
        &self,
        block: BlockType,
        metadata: &ModelMetadata,
        calls: &CallTable,
    ) -> Option<String> {
        match block {
            BlockType::Initial => {
                if metadata.require_wrote_conc {
                    return Some("INITIAL writes an ion concentration".into());
                }
                if metadata.net_send_used && !metadata.artificial_cell {
                    return Some("pending events are flushed on the host after INITIAL".into());
                }
                let body = metadata.initial.as_ref()?;
                if needs_native_code(body, metadata, calls) {
                    Some("VERBATIM code in INITIAL".into())
                } else if calls_kind(body, calls, &CallKind::NetSend) {
                    Some("net_send called from INITIAL".into())
                } else {
                    None
                }
            }
            BlockType::Equation => metadata
                .breakpoint
                .as_ref()
                .filter(|b| needs_native_code(b, metadata, calls))
                .map(|_| "VERBATIM code in BREAKPOINT".into()),
            BlockType::State if metadata.derivimplicit_used() => {
                Some("the Newton solve runs on the host".into())
            }
            BlockType::State => metadata
                .nrn_state
                .as_ref()
                .filter(|b| needs_native_code(b, metadata, calls))
                .map(|_| "VERBATIM code in the state update".into()),
            BlockType::Constructor
            | BlockType::Destructor
            | BlockType::Watch
            | BlockType::NetReceive
            | BlockType::BeforeAfter => None,
        }
    }
}

// ── NEURON-native ────────────────────────────────────────────────────────

/// Host-only C++ against the NEURON mechanism API. Its file layout lives in
/// `neuron.rs`; this policy covers the shared statement-level hooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeuronBackend;

impl BackendPolicy for NeuronBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Neuron
    }

    fn name(&self) -> &'static str {
        "C++ (api-compatibility)"
    }

    fn pointer_qualifier(&self) -> &'static str {
        ""
    }

    fn parallel_hint(&self, _p: &mut CodePrinter, _block: BlockType, _metadata: &ModelMetadata) {}

    fn begin_iteration(&self, p: &mut CodePrinter, _block: BlockType) {
        p.push_block("for (int id = 0; id < nodecount; id++)");
    }

    /// Each instance writes its own node row in the sorted data layout.
    fn requires_shadow_reduction(&self, _block: BlockType, _metadata: &ModelMetadata) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::classify;
    use crate::model::{build, ModelFile};

    fn metadata(json: &str) -> ModelMetadata {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        build(&file).expect("valid model")
    }

    fn atomic(policy: &dyn BackendPolicy, op: char) -> Result<String, Diagnostic> {
        let mut p = CodePrinter::new();
        policy.emit_atomic_update(&mut p, "vec_rhs[node_id]", op, "rhs")?;
        Ok(p.finish())
    }

    #[test]
    fn cpp_atomic_is_plain_compound_assignment() {
        assert_eq!(atomic(&CppBackend, '+').unwrap(), "vec_rhs[node_id] += rhs;\n");
        assert_eq!(atomic(&CppBackend, '-').unwrap(), "vec_rhs[node_id] -= rhs;\n");
    }

    #[test]
    fn unsupported_atomic_operator_is_e0200() {
        for kind in BackendKind::ALL {
            let err = atomic(policy(kind).as_ref(), '*').unwrap_err();
            assert_eq!(err.code, Some(codes::E0200), "{}", kind);
        }
    }

    #[test]
    fn cuda_and_ispc_atomics() {
        assert_eq!(
            atomic(&CudaBackend, '-').unwrap(),
            "atomicAdd(&vec_rhs[node_id], -rhs);\n"
        );
        assert_eq!(
            atomic(&CudaBackend, '+').unwrap(),
            "atomicAdd(&vec_rhs[node_id], rhs);\n"
        );
        assert_eq!(
            atomic(&IspcBackend, '-').unwrap(),
            "atomic_subtract_local(&vec_rhs[node_id], rhs);\n"
        );
        let mut p = CodePrinter::new();
        CudaBackend
            .emit_atomic_update(&mut p, "x", '-', "a*b")
            .unwrap();
        assert_eq!(p.finish(), "atomicAdd(&x, -(a*b));\n");
    }

    #[test]
    fn acc_atomic_carries_pragmas() {
        let text = atomic(&AccBackend, '+').unwrap();
        assert!(text.starts_with("nrn_pragma_acc(atomic update)\nnrn_pragma_omp(atomic update)\n"));
        assert!(text.ends_with("vec_rhs[node_id] += rhs;\n"));
    }

    #[test]
    fn real_literals() {
        assert_eq!(format_real_cpp("1"), "1.0");
        assert_eq!(format_real_cpp("2.00"), "2.0");
        assert_eq!(format_real_cpp("0.001"), "0.001");
        assert_eq!(format_real_cpp("1e-3"), "1e-3");
        assert_eq!(format_real_ispc("2"), "2.0d");
        assert_eq!(format_real_ispc("0.5"), "0.5000000000000000d");
        assert_eq!(format_real_ispc("96485.3"), "9.648530d4");
    }

    #[test]
    fn ispc_renames() {
        assert_eq!(IspcBackend.rename_function("exp"), "vexp");
        assert_eq!(IspcBackend.rename_function("fabs"), "abs");
        assert_eq!(IspcBackend.rename_function("log"), "log");
        assert_eq!(IspcBackend.rename_variable("celsius"), "ispc_celsius");
        assert_eq!(IspcBackend.rename_variable("PI"), "ISPC_PI");
        assert!(IspcBackend.drops_call("printf"));
        assert!(!CppBackend.drops_call("printf"));
    }

    #[test]
    fn backend_kind_round_trips_through_str() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>(), Ok(kind));
        }
        assert!("fortran".parse::<BackendKind>().is_err());
    }

    #[test]
    fn shadow_reduction_only_for_point_process_currents() {
        let pp = metadata(
            r#"{"mod_file": "s", "suffix": "s", "point_process": true,
                "variables": [{"name": "i", "kinds": ["range", "assigned"]}],
                "currents": ["i"], "blocks": {"breakpoint": "i = 0"}}"#,
        );
        for kind in [BackendKind::Cpp, BackendKind::Acc, BackendKind::Cuda, BackendKind::Ispc] {
            let policy = policy(kind);
            assert!(policy.requires_shadow_reduction(BlockType::Equation, &pp));
            assert!(!policy.requires_shadow_reduction(BlockType::State, &pp));
        }
    }

    #[test]
    fn ispc_falls_back_on_verbatim_only_for_that_kernel() {
        let m = metadata(
            r#"{"mod_file": "v", "suffix": "v",
                "variables": [{"name": "x", "kinds": ["range", "assigned"]}],
                "blocks": {"initial": "x = 1", "breakpoint": "VERBATIM\n x = 2;\nENDVERBATIM"}}"#,
        );
        let calls = classify(&m);
        assert!(IspcBackend
            .fallback_reason(BlockType::Equation, &m, &calls)
            .is_some());
        assert!(IspcBackend
            .fallback_reason(BlockType::Initial, &m, &calls)
            .is_none());
        assert!(CppBackend
            .fallback_reason(BlockType::Equation, &m, &calls)
            .is_none());
    }

    #[test]
    fn verbatim_reached_through_a_procedure_counts() {
        let m = metadata(
            r#"{"mod_file": "v", "suffix": "v",
                "variables": [{"name": "x", "kinds": ["range", "assigned"]}],
                "blocks": {"initial": "setx()",
                    "procedures": [{"name": "setx", "params": [], "body": "VERBATIM\n x = 3;\nENDVERBATIM"}]}}"#,
        );
        let calls = classify(&m);
        assert_eq!(
            IspcBackend.fallback_reason(BlockType::Initial, &m, &calls),
            Some("VERBATIM code in INITIAL".to_string())
        );
    }

    #[test]
    fn cuda_guard_and_launcher() {
        let mut p = CodePrinter::new();
        CudaBackend.begin_iteration(&mut p, BlockType::Equation);
        CudaBackend.end_iteration(&mut p);
        assert_eq!(
            p.finish(),
            "int id = blockIdx.x * blockDim.x + threadIdx.x;\nif (id < end) {\n}\n"
        );
        let mut p = CodePrinter::new();
        CudaBackend.after_compute_kernel(&mut p, "nrn_init_hh", BlockType::Initial);
        let text = p.finish();
        assert!(text.contains("nrn_init_hh_kernel<<<nblocks, threads_per_block>>>(nt, ml, type);"));
        assert!(text.contains("setup_instance(nt, ml);"));
        assert!(text.contains("cudaDeviceSynchronize();"));
    }
}
