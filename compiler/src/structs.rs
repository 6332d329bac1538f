// structs.rs — File preamble, data structures and host helpers
//
// Everything a generated file carries before its first compute kernel:
// info header, includes, namespaces, unit constants, the mechanism info
// table, global and instance structs, hoc tables, getters, thread memory
// callbacks and the instance setup routines.
//
// Preconditions: the session's resolver was built with `Style::Coreneuron`.
// Postconditions: member order of both structs matches `setup_instance` and
//                 the layout plan.
// Failure modes: none; all inputs were validated when the model was built.
// Side effects: appends to the session printer only.

use crate::emit::Session;
use crate::layout::IndexVariableInfo;
use crate::model::VarKind;
use crate::resolve::EmissionContext;

/// Version string the runtime checks in the mechanism info table.
pub const MECHANISM_API_VERSION: &str = "7.7.0";

/// How the global struct singleton is declared after the struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalDeclaration {
    /// Trivially-copyable assertions and the definition.
    Definition,
    /// Definition with C linkage, shared with a kernel file.
    ExternC,
    /// Declaration of a singleton defined by the wrapper.
    Extern,
}

impl<'a> Session<'a> {
    // ── Preamble ──

    pub fn print_backend_info(&mut self, simulator: &str, provenance: Option<&str>) {
        let m = self.metadata;
        self.p.add_line("/*********************************************************");
        self.p.add_line(format!("Model Name      : {}", m.mod_suffix));
        self.p.add_line(format!("Filename        : {}.mod", m.mod_file));
        self.p.add_line(format!("Generator       : mcc {}", env!("CARGO_PKG_VERSION")));
        self.p.add_line(format!("Vectorized      : {}", m.vectorize));
        self.p.add_line(format!("Threadsafe      : {}", m.thread_safe));
        self.p.add_line(format!("Simulator       : {}", simulator));
        self.p.add_line(format!("Backend         : {}", self.backend.name()));
        if let Some(hash) = provenance {
            self.p.add_line(format!("Provenance      : {}", hash));
        }
        self.p.add_line("*********************************************************/");
    }

    pub fn print_standard_includes(&mut self) {
        self.p.add_newline();
        self.p.add_multi_line(
            r#"
            #include <math.h>
            #include <stdio.h>
            #include <stdlib.h>
            #include <string.h>
            "#,
        );
    }

    pub fn print_runtime_includes(&mut self) {
        self.p.add_newline();
        self.p.add_multi_line(
            r#"
            #include <coreneuron/gpu/nrn_acc_manager.hpp>
            #include <coreneuron/mechanism/mech/mod2c_core_thread.hpp>
            #include <coreneuron/mechanism/register_mech.hpp>
            #include <coreneuron/nrnconf.h>
            #include <coreneuron/nrniv/nrniv_decl.h>
            #include <coreneuron/sim/multicore.hpp>
            #include <coreneuron/sim/scopmath/newton_thread.hpp>
            #include <coreneuron/utils/ivocvect.hpp>
            #include <coreneuron/utils/nrnoc_aux.hpp>
            #include <coreneuron/utils/randoms/nrnran123.h>
            "#,
        );
    }

    /// Standard, backend and runtime includes.
    pub fn print_headers(&mut self) {
        self.print_standard_includes();
        let backend = self.backend;
        backend.backend_includes(&mut self.p, self.metadata);
        self.print_runtime_includes();
    }

    pub fn print_namespace_begin(&mut self) {
        self.p.add_newlines(2);
        self.p.add_line("namespace coreneuron {");
        let backend = self.backend;
        backend.namespace_begin(&mut self.p);
    }

    pub fn print_namespace_end(&mut self) {
        self.p.add_newline();
        let backend = self.backend;
        backend.namespace_end(&mut self.p);
        self.p.add_line("}  // namespace coreneuron");
    }

    /// Unit factors as `static const double`.
    pub fn print_unit_constants(&mut self) {
        if self.metadata.factors.is_empty() {
            return;
        }
        self.p.add_newlines(2);
        self.p.add_line("/** constants used in nmodl from UNITS */");
        for factor in &self.metadata.factors {
            self.p
                .add_line(format!("static const double {} = {};", factor.name, factor.value));
        }
    }

    /// Fixed constants of the ISPC kernel file.
    pub fn print_ispc_constants(&mut self) {
        self.p.add_newlines(2);
        self.p.add_line("/** constants used in nmodl. */");
        self.p.add_line("static const uniform double FARADAY = 96485.3d;");
        self.p.add_line("static const uniform double ISPC_PI = 3.14159d;");
        self.p.add_line("static const uniform double R = 8.3145d;");
    }

    pub fn print_prcellstate_macros(&mut self) {
        self.p.add_newline();
        self.p.add_line("#ifndef NRN_PRCELLSTATE");
        self.p.add_line("#define NRN_PRCELLSTATE 0");
        self.p.add_line("#endif");
    }

    /// `static const char *mechanism[]`: version, suffix, then the range
    /// parameter, range assigned, range state and pointer names, each list
    /// closed by `0`.
    pub fn print_mechanism_info(&mut self) {
        let m = self.metadata;
        let entry = |name: &str, length: usize, is_array: bool| {
            let mut text = name.to_string();
            if !m.point_process {
                text.push('_');
                text.push_str(&m.mod_suffix);
            }
            if is_array {
                text.push_str(&format!("[{}]", length));
            }
            format!("\"{}\",", text)
        };
        self.p.add_newlines(2);
        self.p.add_line("/** channel information */");
        self.p.push_block("static const char *mechanism[] =");
        self.p.add_line(format!("\"{}\",", MECHANISM_API_VERSION));
        self.p.add_line(format!("\"{}\",", m.mod_suffix));
        let groups = [
            &m.range_parameter_vars,
            &m.range_assigned_vars,
            &m.range_state_vars,
            &m.pointer_variables,
        ];
        for (i, group) in groups.iter().enumerate() {
            for var in group.iter() {
                self.p.add_line(entry(&var.name, var.length, var.is_array));
            }
            self.p.add_line(if i + 1 == groups.len() { "0" } else { "0," });
        }
        self.p.pop_block_with(";");
    }

    // ── Data structures ──

    pub fn print_global_struct(&mut self, initializers: bool, declaration: GlobalDeclaration) {
        let q = self.backend.global_qualifier();
        let store = self.resolver.global_struct();
        let singleton = self.resolver.global_instance();
        self.p.add_newlines(2);
        self.p.add_line("/** all global variables */");
        self.p.push_block(format!("struct {}", store));
        for member in self.resolver.globals() {
            self.p.add_line(format!("{};", member.declaration(q, initializers)));
        }
        self.p.pop_block_with(";");
        self.p.add_newline();
        match declaration {
            GlobalDeclaration::Definition => {
                for trait_name in [
                    "is_trivially_copy_constructible_v",
                    "is_trivially_move_constructible_v",
                    "is_trivially_copy_assignable_v",
                    "is_trivially_move_assignable_v",
                    "is_trivially_destructible_v",
                ] {
                    self.p
                        .add_line(format!("static_assert(std::{}<{}>);", trait_name, store));
                }
                self.p.add_line(format!(
                    "{}{} {};",
                    self.backend.global_instance_qualifier(),
                    store,
                    singleton
                ));
            }
            GlobalDeclaration::ExternC => {
                self.p.add_line("/** holds object of global variable */");
                self.p.push_block("extern \"C\"");
                self.p.add_line(format!("{} {};", store, singleton));
                self.p.pop_block();
            }
            GlobalDeclaration::Extern => {
                self.p.add_line("/** holds object of global variable */");
                self.p.add_line(format!("extern {} {};", store, singleton));
            }
        }
    }

    fn int_member(&self, var: &IndexVariableInfo, initializers: bool) -> String {
        let q = if var.is_constant { "const " } else { "" };
        let c_type = if var.is_index || var.is_integer {
            "int"
        } else if var.is_vdata {
            "void*"
        } else {
            "double"
        };
        format!(
            "{}{}* {}{}{};",
            q,
            c_type,
            self.backend.pointer_qualifier(),
            var.name(),
            if initializers { "{}" } else { "" }
        )
    }

    pub fn print_instance_struct(&mut self, initializers: bool) {
        let m = self.metadata;
        let pq = self.backend.pointer_qualifier();
        let init = if initializers { "{}" } else { "" };
        self.p.add_newlines(2);
        self.p
            .add_line("/** all mechanism instance variables and global variables */");
        self.p.push_block(format!("struct {}", self.instance_struct()));
        for name in &m.neuron_globals {
            if initializers {
                self.p
                    .add_line(format!("double* {}{{&coreneuron::{}}};", name, name));
            } else {
                self.p.add_line(format!("double* {};", name));
            }
        }
        for var in &self.plan.float_variables {
            let symbol = &var.symbol;
            let constant =
                symbol.has(VarKind::Parameter) && !m.variables_written.contains(&symbol.name);
            self.p.add_line(format!(
                "{}double* {}{}{};",
                if constant { "const " } else { "" },
                pq,
                symbol.name,
                init
            ));
        }
        for var in &self.plan.int_variables {
            let line = self.int_member(var, initializers);
            self.p.add_line(line);
        }
        if initializers {
            self.p.add_line(format!(
                "{}* global{{&{}}};",
                self.resolver.global_struct(),
                self.resolver.global_instance()
            ));
        } else {
            self.p
                .add_line(format!("{}* global;", self.resolver.global_struct()));
        }
        self.p.pop_block_with(";");
    }

    /// `hoc_scalar_double[]` and `hoc_vector_double[]`.
    pub fn print_hoc_tables(&mut self) {
        let m = self.metadata;
        let singleton = self.resolver.global_instance();
        let host = EmissionContext::host();
        // (hoc name, storage, length, is_array)
        let mut entries: Vec<(String, String, usize, bool)> = Vec::new();
        for var in &m.global_variables {
            entries.push((
                var.name.clone(),
                self.resolver.resolve(&var.name, &host),
                var.length,
                var.is_array,
            ));
        }
        if m.table_count() > 0 {
            entries.push(("usetable".into(), format!("{}.usetable", singleton), 1, false));
        }
        let mut offset = 0;
        for var in &m.thread_variables {
            let storage = if var.is_array {
                format!("{}.thread_data + {}", singleton, offset)
            } else {
                format!("{}.thread_data[{}]", singleton, offset)
            };
            entries.push((var.name.clone(), storage, var.length, var.is_array));
            offset += var.length;
        }

        self.p.add_newlines(2);
        self.p.add_line("/** connect global (scalar) variables to hoc -- */");
        self.p.add_line("static DoubScal hoc_scalar_double[] = {");
        self.p.increase_indent();
        for (name, storage, _, _) in entries.iter().filter(|e| !e.3) {
            self.p
                .add_line(format!("{{\"{}_{}\", &{}}},", name, m.mod_suffix, storage));
        }
        self.p.add_line("{nullptr, nullptr}");
        self.p.decrease_indent();
        self.p.add_line("};");

        self.p.add_newlines(2);
        self.p.add_line("/** connect global (array) variables to hoc -- */");
        self.p.add_line("static DoubVec hoc_vector_double[] = {");
        self.p.increase_indent();
        for (name, storage, length, _) in entries.iter().filter(|e| e.3) {
            self.p.add_line(format!(
                "{{\"{}_{}\", {}, {}}},",
                name, m.mod_suffix, storage, length
            ));
        }
        self.p.add_line("{nullptr, nullptr, 0}");
        self.p.decrease_indent();
        self.p.add_line("};");
    }

    // ── Getters ──

    fn getter(&mut self, signature: &str, value: impl std::fmt::Display) {
        self.p.add_newlines(2);
        self.p.push_block(signature);
        self.p.add_line(format!("return {};", value));
        self.p.pop_block();
    }

    pub fn print_getters(&mut self) {
        let m = self.metadata;
        let plan = self.plan;
        self.getter(
            "static inline int first_pointer_var_index()",
            plan.first_pointer_var_index_value(),
        );
        if m.net_receive_exist() {
            self.getter(
                "static inline int num_net_receive_args()",
                m.num_net_receive_parameters(),
            );
        }
        self.print_thread_getters();
        self.getter("static inline int float_variables_size()", plan.float_variables_size());
        self.getter("static inline int int_variables_size()", plan.int_variables_size());
        let mech_type = self
            .resolver
            .resolve("mech_type", &EmissionContext::host());
        self.getter("static inline int get_mech_type()", mech_type);

        self.p.add_newlines(2);
        self.p.push_block("static inline Memb_list* get_memb_list(NrnThread* nt)");
        self.p.push_block("if (!nt->_ml_list)");
        self.p.add_line("return nullptr;");
        self.p.pop_block();
        self.p.add_line("return nt->_ml_list[get_mech_type()];");
        self.p.pop_block();
    }

    fn print_thread_getters(&mut self) {
        let m = self.metadata;
        let plan = self.plan;
        let thread = &plan.thread;
        if !m.vectorize {
            return;
        }
        if let (true, Some(tid)) = (m.derivimplicit_used(), thread.derivimplicit_var_thread_id) {
            let list = thread.derivimplicit_list_num;
            self.p.add_newlines(2);
            self.p.add_line("/** thread specific helper routines for derivimplicit */");
            self.p.add_newline();
            self.p.push_block(format!(
                "static inline int* deriv{}_advance(ThreadDatum* thread)",
                list
            ));
            self.p.add_line(format!("return &(thread[{}].i);", tid));
            self.p.pop_block();
            self.p.add_newline();
            self.p.push_block(format!("static inline int dith{}()", list));
            self.p.add_line(format!("return {};", tid + 1));
            self.p.pop_block();
            self.p.add_newline();
            self.p.push_block(format!(
                "static inline void** newtonspace{}(ThreadDatum* thread)",
                list
            ));
            self.p.add_line(format!("return &(thread[{}]._pvoid);", tid + 2));
            self.p.pop_block();
        }
        if let (false, Some(tid)) = (m.thread_variables.is_empty(), thread.thread_var_thread_id) {
            self.p.add_newlines(2);
            self.p.add_line("/** tid for thread variables */");
            self.p.push_block("static inline int thread_var_tid()");
            self.p.add_line(format!("return {};", tid));
            self.p.pop_block();
        }
        if let (false, Some(tid)) = (m.top_local_variables.is_empty(), thread.top_local_thread_id) {
            self.p.add_newlines(2);
            self.p.add_line("/** tid for top local tread variables */");
            self.p.push_block("static inline int top_local_var_tid()");
            self.p.add_line(format!("return {};", tid));
            self.p.pop_block();
        }
    }

    pub fn print_memory_routines(&mut self) {
        let backend = self.backend;
        backend.memory_routines(&mut self.p, self.metadata);
        backend.abort_routine(&mut self.p);
    }

    // ── Thread storage ──

    /// `thread_mem_init` and its mirror `thread_mem_cleanup`.
    pub fn print_thread_callbacks(&mut self) {
        let m = self.metadata;
        if !m.thread_callback_register() {
            return;
        }
        let plan = self.plan;
        let thread = &plan.thread;
        let list = thread.derivimplicit_list_num;
        let thread_data = format!("{}.thread_data", self.resolver.global_instance());
        let in_use = format!("{}.thread_data_in_use", self.resolver.global_instance());

        self.p.add_newlines(2);
        self.p.add_line("/** thread memory allocation callback */");
        self.p.push_block("static void thread_mem_init(ThreadDatum* thread) ");
        if m.vectorize && m.derivimplicit_used() {
            self.p.add_line(format!("thread[dith{}()].pval = nullptr;", list));
        }
        if m.vectorize && thread.top_local_thread_size != 0 {
            self.p.add_line(format!(
                "thread[top_local_var_tid()].pval = (double*)mem_alloc({}, sizeof(double));",
                thread.top_local_thread_size
            ));
        }
        if thread.thread_var_data_size != 0 {
            self.p.push_block(format!("if ({})", in_use));
            self.p.add_line(format!(
                "thread[thread_var_tid()].pval = (double*)mem_alloc({}, sizeof(double));",
                thread.thread_var_data_size
            ));
            self.p.chain_block("else");
            self.p
                .add_line(format!("thread[thread_var_tid()].pval = {};", thread_data));
            self.p.add_line(format!("{} = 1;", in_use));
            self.p.pop_block();
        }
        self.p.pop_block();
        self.p.add_newlines(2);

        self.p.add_line("/** thread memory cleanup callback */");
        self.p.push_block("static void thread_mem_cleanup(ThreadDatum* thread) ");
        if m.vectorize && m.derivimplicit_used() {
            self.p.add_line(format!("free(thread[dith{}()].pval);", list));
            self.p.add_line(format!(
                "nrn_destroy_newtonspace(static_cast<NewtonSpace*>(*newtonspace{}(thread)));",
                list
            ));
        }
        if m.vectorize && thread.top_local_thread_size != 0 {
            self.p.add_line("free(thread[top_local_var_tid()].pval);");
        }
        if thread.thread_var_data_size != 0 {
            self.p
                .push_block(format!("if (thread[thread_var_tid()].pval == {})", thread_data));
            self.p.add_line(format!("{} = 0;", in_use));
            self.p.chain_block("else");
            self.p.add_line("free(thread[thread_var_tid()].pval);");
            self.p.pop_block();
        }
        self.p.pop_block();
    }

    // ── Instance setup ──

    fn print_instance_checks(&mut self) {
        let inst = self.instance_struct();
        let store = self.resolver.global_struct();
        let singleton = self.resolver.global_instance();
        self.p
            .add_line(format!("auto* const inst = static_cast<{}*>(ml->instance);", inst));
        self.p.add_line("assert(inst);");
        self.p.add_line("assert(inst->global);");
        self.p.add_line(format!("assert(inst->global == &{});", singleton));
        self.p.add_line("assert(inst->global == ml->global_variables);");
        self.p
            .add_line(format!("assert(ml->global_variables_size == sizeof({}));", store));
    }

    /// Private constructor and destructor of the instance struct, and
    /// `setup_instance` wiring every member into the runtime arrays.
    pub fn print_instance_setup(&mut self) {
        let inst = self.instance_struct();
        let store = self.resolver.global_struct();
        let singleton = self.resolver.global_instance();

        self.p.add_newline();
        self.p.add_line("// Allocate instance structure");
        self.p.push_block(format!(
            "static void {}(NrnThread* nt, Memb_list* ml, int type)",
            self.method_name("nrn_private_constructor")
        ));
        self.p.add_line("assert(!ml->instance);");
        self.p.add_line("assert(!ml->global_variables);");
        self.p.add_line("assert(ml->global_variables_size == 0);");
        self.p.add_line(format!("auto* const inst = new {}{{}};", inst));
        self.p.add_line(format!("assert(inst->global == &{});", singleton));
        self.p.add_line("ml->instance = inst;");
        self.p.add_line("ml->global_variables = inst->global;");
        self.p
            .add_line(format!("ml->global_variables_size = sizeof({});", store));
        self.p.pop_block();
        self.p.add_newline();

        self.p.add_line("// Deallocate the instance structure");
        self.p.push_block(format!(
            "static void {}(NrnThread* nt, Memb_list* ml, int type)",
            self.method_name("nrn_private_destructor")
        ));
        self.print_instance_checks();
        if !self.metadata.random_variables.is_empty() {
            self.p.add_line("int pnodecount = ml->_nodecount_padded;");
            self.p.add_line("int nodecount = ml->nodecount;");
            self.p.add_line("Datum* indexes = ml->pdata;");
            self.p.push_block("for (int id = 0; id < nodecount; id++)");
            let ctx = EmissionContext::kernel(crate::backend::BlockType::Destructor);
            for var in &self.metadata.random_variables {
                let line = format!("nrnran123_deletestream({});", self.name(&var.name, &ctx));
                self.p.add_line(line);
            }
            self.p.pop_block();
        }
        self.p.add_multi_line(
            r#"
            delete inst;
            ml->instance = nullptr;
            ml->global_variables = nullptr;
            ml->global_variables_size = 0;
            "#,
        );
        self.p.pop_block();
        self.p.add_newline();

        self.p.add_line("/** initialize mechanism instance variables */");
        self.p
            .push_block("static inline void setup_instance(NrnThread* nt, Memb_list* ml)");
        self.print_instance_checks();
        self.p.add_line("int pnodecount = ml->_nodecount_padded;");
        self.p.add_line("Datum* indexes = ml->pdata;");
        for var in &self.plan.float_variables {
            self.p.add_line(format!(
                "inst->{} = ml->data+{}*pnodecount;",
                var.symbol.name, var.offset
            ));
        }
        for var in &self.plan.int_variables {
            let source = if var.is_index || var.is_integer {
                "ml->pdata"
            } else if var.is_vdata {
                "nt->_vdata"
            } else {
                "nt->_data"
            };
            self.p.add_line(format!("inst->{} = {};", var.name(), source));
        }
        self.p.pop_block();
        self.p.add_newline();
    }

    pub fn print_nrn_alloc(&mut self) {
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static void {}(double* data, Datum* indexes, int type)",
            self.method_name("nrn_alloc")
        ));
        self.p.add_line("// do nothing");
        self.p.pop_block();
    }

    /// Top-level VERBATIM, printed outside every routine.
    pub fn print_top_verbatim(&mut self) {
        if self.metadata.verbatim_top.is_empty() {
            return;
        }
        self.p.add_newlines(2);
        self.p.add_line("/** top-level verbatim blocks */");
        let ctx = EmissionContext::top_level_verbatim();
        for text in &self.metadata.verbatim_top {
            self.verbatim(text, &ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendPolicy, CppBackend, IspcBackend};
    use crate::calls::{classify, CallTable};
    use crate::layout::{self, LayoutPlan};
    use crate::model::{build, ModelFile, ModelMetadata};
    use crate::resolve::{Resolver, Style};

    fn fixture(json: &str) -> (ModelMetadata, LayoutPlan, CallTable) {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        (metadata, plan, calls)
    }

    fn render(json: &str, backend: &dyn BackendPolicy, f: impl FnOnce(&mut Session<'_>)) -> String {
        let (metadata, plan, calls) = fixture(json);
        let resolver = Resolver::new(&metadata, &plan, Style::Coreneuron).expect("resolver");
        let mut s = Session::new(&metadata, &plan, &calls, &resolver, backend);
        f(&mut s);
        s.finish()
    }

    const PAS: &str = r#"{
        "mod_file": "leak", "suffix": "leak",
        "variables": [
            {"name": "g", "kinds": ["range", "parameter"], "value": 0.001},
            {"name": "e", "kinds": ["range", "parameter"], "value": -70},
            {"name": "i", "kinds": ["range", "assigned"]},
            {"name": "q10", "kinds": ["global"], "value": 3}
        ],
        "currents": ["i"],
        "factors": [{"name": "FARADAY", "value": 96485.309}],
        "blocks": {"breakpoint": "i = g * (v - e)"}
    }"#;

    #[test]
    fn mechanism_info_lists_suffixed_names() {
        let text = render(PAS, &CppBackend, |s| s.print_mechanism_info());
        assert!(text.contains(
            "static const char *mechanism[] = {\n    \"7.7.0\",\n    \"leak\",\n    \"g_leak\",\n    \"e_leak\",\n    0,\n    \"i_leak\",\n    0,\n    0,\n    0\n};\n"
        ));
    }

    #[test]
    fn instance_struct_const_qualifies_unwritten_parameters() {
        let text = render(PAS, &CppBackend, |s| s.print_instance_struct(true));
        assert!(text.contains("struct leak_Instance {\n"));
        assert!(text.contains("    const double* __restrict__ g{};\n"));
        assert!(text.contains("    double* __restrict__ i{};\n"));
        assert!(text.contains("    leak_Store* global{&leak_global};\n};\n"));
    }

    #[test]
    fn ispc_structs_use_uniform_and_no_initializers() {
        let text = render(PAS, &IspcBackend, |s| {
            s.print_global_struct(false, GlobalDeclaration::Extern);
            s.print_instance_struct(false);
        });
        assert!(text.contains("    uniform double q10;\n"));
        assert!(text.contains("extern leak_Store leak_global;\n"));
        assert!(text.contains("    const double* uniform g;\n"));
        assert!(!text.contains("{}"));
    }

    #[test]
    fn global_struct_definition_is_asserted_trivial() {
        let text = render(PAS, &CppBackend, |s| {
            s.print_global_struct(true, GlobalDeclaration::Definition)
        });
        assert!(text.contains("    double q10{3};\n"));
        assert!(text.contains("static_assert(std::is_trivially_destructible_v<leak_Store>);\n"));
        assert!(text.ends_with("leak_Store leak_global;\n"));
    }

    #[test]
    fn hoc_tables_and_getters() {
        let text = render(PAS, &CppBackend, |s| {
            s.print_hoc_tables();
            s.print_getters();
        });
        assert!(text.contains("    {\"q10_leak\", &leak_global.q10},\n    {nullptr, nullptr}\n"));
        assert!(text.contains("static inline int first_pointer_var_index() {\n    return -1;\n}"));
        assert!(text.contains("static inline int float_variables_size() {\n    return 5;\n}"));
        assert!(text.contains("return leak_global.mech_type;"));
        assert!(!text.contains("num_net_receive_args"));
    }

    #[test]
    fn setup_instance_wires_float_offsets() {
        let text = render(PAS, &CppBackend, |s| s.print_instance_setup());
        assert!(text.contains("    inst->g = ml->data+0*pnodecount;\n"));
        assert!(text.contains("    inst->e = ml->data+1*pnodecount;\n"));
        assert!(text.contains("static void nrn_private_constructor_leak(NrnThread* nt, Memb_list* ml, int type) {"));
        assert!(text.contains("    delete inst;\n"));
    }

    #[test]
    fn unit_constants_print_shortest_value() {
        let text = render(PAS, &CppBackend, |s| s.print_unit_constants());
        assert!(text.contains("static const double FARADAY = 96485.309;"));
    }
}
