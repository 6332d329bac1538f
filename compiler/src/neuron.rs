// neuron.rs — NEURON-native translation unit
//
// Emits a mechanism against the NEURON mechanism API instead of the
// CoreNEURON one: data is reached through `_nrn_mechanism_cache_range`
// views (`make_instance_{suffix}`, `make_node_data_{suffix}`), integer
// slots through `_ppvar`, and registration describes every data field to
// `_nrn_mechanism_register_data_fields`. Statement bodies, ion bookkeeping
// and the current kernels are shared with the other backends; the session's
// resolver must use `Style::Neuron`.
//
// Preconditions: the resolver was built with `Style::Neuron`;
//                `check_neuron_support` passed.
// Postconditions: field registration order equals the layout plan, which is
//                 the order `make_instance` reads the cache range.
// Failure modes: E0201 for WATCH, derivimplicit, FOR_NETCON and
//                BEFORE/AFTER blocks; statement emission errors propagate.
// Side effects: appends to the session printer only.

use crate::backend::BlockType;
use crate::diag::{codes, Diagnostic};
use crate::emit::Session;
use crate::layout::{CONDUCTANCE, CONDUCTANCE_UNUSED, FOR_NETCON, POINT_PROCESS, TQITEM};
use crate::model::ModelMetadata;
use crate::resolve::{format_g, EmissionContext};
use crate::structs::GlobalDeclaration;

/// Signature tail shared by `nrn_init`, `nrn_cur`, `nrn_state` and `nrn_jacob`.
const KERNEL_PARAMS: &str =
    "const _nrn_model_sorted_token& _sorted_token, NrnThread* nt, Memb_list* _ml_arg, int _type";

/// Constructs present in `metadata` that the NEURON backend cannot translate.
pub fn unsupported_constructs(metadata: &ModelMetadata) -> Vec<&'static str> {
    let mut found = Vec::new();
    if metadata.is_watch_used() {
        found.push("WATCH statements");
    }
    if metadata.derivimplicit_used() {
        found.push("derivimplicit solves");
    }
    if metadata.for_netcon_used {
        found.push("FOR_NETCON loops");
    }
    if !metadata.before_after.is_empty() {
        found.push("BEFORE/AFTER blocks");
    }
    found
}

/// E0201 naming the first unsupported construct; the rest become causes.
pub fn check_neuron_support(metadata: &ModelMetadata) -> Result<(), Diagnostic> {
    let found = unsupported_constructs(metadata);
    let Some((first, rest)) = found.split_first() else {
        return Ok(());
    };
    let mut diag = Diagnostic::error(
        codes::E0201,
        format!("{} are not supported by the NEURON backend", first),
    )
    .with_hint("generate CoreNEURON code with '--backend cpp' instead");
    for other in rest {
        diag = diag.with_cause(format!("{}, also unsupported", other), None);
    }
    Err(diag)
}

impl<'a> Session<'a> {
    /// Complete NEURON translation unit.
    pub fn print_neuron_file(&mut self, provenance: Option<&str>) -> Result<(), Diagnostic> {
        check_neuron_support(self.metadata)?;
        let m = self.metadata;

        self.print_backend_info("NEURON", provenance);
        self.print_neuron_includes();
        self.print_neuron_macros();
        self.print_neuron_global_declarations();
        self.p.add_newlines(2);
        self.p.add_line("namespace neuron {");
        self.print_unit_constants();
        self.print_prcellstate_macros();
        self.print_mechanism_info();
        self.print_neuron_statics();
        self.print_global_struct(true, GlobalDeclaration::Definition);
        self.print_parameter_defaults();
        self.print_neuron_instance_struct();
        self.print_node_data_struct();
        self.print_make_instance();
        self.print_make_node_data();
        self.print_neuron_lifecycle_declarations();
        self.print_neuron_alloc()?;

        let callables: Vec<_> = m.functions.iter().chain(&m.procedures).collect();
        self.print_function_prototypes(&callables);
        self.print_point_process_functions();
        self.print_setdata_functions();
        self.print_top_verbatim();
        self.print_hoc_tables();
        self.print_hoc_functions();
        self.print_neuron_thread_callbacks();

        for callable in m.procedures.iter().chain(&m.functions) {
            self.print_callable(callable)?;
        }
        self.print_neuron_check_table();
        self.print_neuron_nrn_init()?;
        self.print_neuron_nrn_cur()?;
        self.print_neuron_nrn_state()?;
        self.print_neuron_nrn_jacob();
        self.print_neuron_net_receive()?;
        self.print_neuron_net_init()?;
        self.print_neuron_constructor()?;
        self.print_neuron_destructor()?;
        self.print_initlists()?;
        self.print_neuron_register();

        self.p.add_newline();
        self.p.add_line("}  // namespace neuron");
        Ok(())
    }

    // ── Preamble ──

    fn print_neuron_includes(&mut self) {
        self.p.add_newline();
        self.p.add_multi_line(
            r#"
            #include <math.h>
            #include <stdio.h>
            #include <stdlib.h>
            #include <vector>
            "#,
        );
        self.p.add_newline();
        self.p.add_multi_line(
            r#"
            #include "mech_api.h"
            #include "neuron/cache/mechanism_range.hpp"
            #include "nrniv_mf.h"
            #include "section_fwd.hpp"
            "#,
        );
        if self.metadata.thread_callback_register() {
            self.p
                .add_line("extern void _nrn_thread_reg(int, int, void(*)(Datum*));");
        }
    }

    fn print_neuron_macros(&mut self) {
        let m = self.metadata;
        self.p.add_newline();
        self.p.add_line("/* NEURON global macro definitions */");
        if m.vectorize {
            self.p.add_line("/* VECTORIZED */");
            self.p.add_line("#define NRN_VECTORIZED 1");
        } else {
            self.p.add_line("/* NOT VECTORIZED */");
            self.p.add_line("#define NRN_VECTORIZED 0");
        }
        self.p.add_newline();
        self.p.add_line(format!(
            "static constexpr auto number_of_datum_variables = {};",
            self.plan.int_variables_size()
        ));
        self.p.add_line(format!(
            "static constexpr auto number_of_floating_point_variables = {};",
            self.plan.float_variables.len()
        ));
        self.p.add_newline();
        self.p.add_multi_line(
            r#"
            namespace {
            template <typename T>
            using _nrn_mechanism_std_vector = std::vector<T>;
            using _nrn_model_sorted_token = neuron::model_sorted_token;
            using _nrn_mechanism_cache_range = neuron::cache::MechanismRange<number_of_floating_point_variables, number_of_datum_variables>;
            using _nrn_mechanism_cache_instance = neuron::cache::MechanismInstance<number_of_floating_point_variables, number_of_datum_variables>;
            using _nrn_non_owning_id_without_container = neuron::container::non_owning_identifier_without_container;
            template <typename T>
            using _nrn_mechanism_field = neuron::mechanism::field<T>;
            template <typename... Args>
            void _nrn_mechanism_register_data_fields(Args&&... args) {
                neuron::mechanism::register_data_fields(std::forward<Args>(args)...);
            }
            }  // namespace
            "#,
        );
        if m.point_process {
            self.p.add_line("extern Prop* nrn_point_prop_;");
        } else {
            self.p.add_line("Prop* hoc_getdata_range(int type);");
        }
        if m.table_count() > 0 {
            self.p
                .add_line("void _nrn_thread_table_reg(int, nrn_thread_table_check_t);");
        }
        self.p.add_line("extern Node* nrn_alloc_node_;");
    }

    fn print_neuron_global_declarations(&mut self) {
        for name in &self.metadata.neuron_globals {
            self.p.add_line(format!("extern double {};", name));
        }
    }

    /// File-scope registration state.
    fn print_neuron_statics(&mut self) {
        let m = self.metadata;
        self.p.add_newlines(2);
        self.p.add_line("/* NEURON global variables */");
        if self.plan.primes_size != 0 {
            self.p.add_line(format!(
                "static neuron::container::field_index _slist1[{0}], _dlist1[{0}];",
                self.plan.primes_size
            ));
        }
        for ion in &m.ions {
            self.p.add_line(format!("static Symbol* _{}_sym;", ion.name));
        }
        self.p.add_line("static int mech_type;");
        if m.point_process {
            self.p.add_line("static int _pointtype;");
        } else {
            self.p.add_line("static Prop* _extcall_prop;");
            self.p.add_line("/* _prop_id kind of shadows _extcall_prop to allow validity checking. */");
            self.p
                .add_line("static _nrn_non_owning_id_without_container _prop_id{};");
        }
        if m.diam_used {
            self.p.add_line("static Symbol* _morphology_sym;");
        }
        self.p
            .add_line("static _nrn_mechanism_std_vector<Datum> _extcall_thread;");
    }

    /// Defaults of the range parameters, in declaration order.
    fn print_parameter_defaults(&mut self) {
        let m = self.metadata;
        let defaults: Vec<String> = m
            .range_parameter_vars
            .iter()
            .map(|p| format!("{} /* {} */", format_g(p.value.unwrap_or(0.0)), p.name))
            .collect();
        self.p.add_newline();
        self.p
            .push_block("static std::vector<double> _parameter_defaults =");
        if !defaults.is_empty() {
            self.p.add_multi_line(&defaults.join(",\n"));
        }
        self.p.pop_block_with(";");
    }

    // ── Data views ──

    /// Data-handle slots cached by `make_instance`: everything except
    /// index/integer/vdata slots and the point process.
    fn cached_int_variables(&self) -> impl Iterator<Item = &'a crate::layout::IndexVariableInfo> {
        self.plan.int_variables.iter().filter(|v| {
            v.name() != POINT_PROCESS && !(v.is_index || v.is_integer || v.is_vdata)
        })
    }

    fn print_neuron_instance_struct(&mut self) {
        let m = self.metadata;
        self.p.add_newlines(2);
        self.p
            .add_line("/** all mechanism instance variables and global variables */");
        self.p.push_block(format!("struct {}", self.instance_struct()));
        for name in &m.neuron_globals {
            self.p.add_line(format!("double* {}{{&::{}}};", name, name));
        }
        for var in &self.plan.float_variables {
            self.p.add_line(format!("double* {}{{}};", var.symbol.name));
        }
        let cached: Vec<String> = self
            .cached_int_variables()
            .map(|var| {
                let q = if var.is_constant { "const " } else { "" };
                format!("{}double* const* {}{{}};", q, var.name())
            })
            .collect();
        for line in cached {
            self.p.add_line(line);
        }
        self.p.add_line(format!(
            "{}* global{{&{}}};",
            self.resolver.global_struct(),
            self.resolver.global_instance()
        ));
        self.p.pop_block_with(";");
    }

    fn print_node_data_struct(&mut self) {
        self.p.add_newlines(2);
        self.p
            .push_block(format!("struct {}", self.resolver.node_data_struct()));
        self.p.add_line("int const * nodeindices;");
        self.p.add_line("double const * node_voltages;");
        self.p.add_line("double * node_diagonal;");
        self.p.add_line("double * node_rhs;");
        self.p.add_line("int nodecount;");
        self.p.pop_block_with(";");
    }

    /// Instance struct filled from the cache range, in member order.
    fn print_make_instance(&mut self) {
        let m = self.metadata;
        let mut args: Vec<String> = m
            .neuron_globals
            .iter()
            .map(|name| format!("&::{}", name))
            .collect();
        for (i, var) in self.plan.float_variables.iter().enumerate() {
            if var.symbol.is_array {
                args.push(format!(
                    "_lmc.template data_array_ptr<{}, {}>()",
                    i, var.symbol.length
                ));
            } else {
                args.push(format!("_lmc.template fpfield_ptr<{}>()", i));
            }
        }
        for var in self.cached_int_variables() {
            args.push(format!("_lmc.template dptr_field_ptr<{}>()", var.offset));
        }
        let inst = self.instance_struct();
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static {} make_instance_{}(_nrn_mechanism_cache_range& _lmc)",
            inst,
            self.suffix()
        ));
        self.p.push_block(format!("return {}", inst));
        if !args.is_empty() {
            self.p.add_multi_line(&args.join(",\n"));
        }
        self.p.pop_block_with(";");
        self.p.pop_block();
    }

    fn print_make_node_data(&mut self) {
        let node_data = self.resolver.node_data_struct();
        let suffix = self.suffix().to_string();
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static {} make_node_data_{}(NrnThread& nt, Memb_list& _ml_arg)",
            node_data, suffix
        ));
        self.p.push_block(format!("return {}", node_data));
        self.p.add_multi_line(
            r#"
            _ml_arg.nodeindices,
            nt.node_voltage_storage(),
            nt.node_d_storage(),
            nt.node_rhs_storage(),
            _ml_arg.nodecount
            "#,
        );
        self.p.pop_block_with(";");
        self.p.pop_block();
        self.p.push_block(format!(
            "static {} make_node_data_{}(Prop * _prop)",
            node_data, suffix
        ));
        self.p.add_line("static std::vector<int> node_index{0};");
        self.p.add_line("Node* _node = _nrn_mechanism_access_node(_prop);");
        self.p.push_block(format!("return {}", node_data));
        self.p.add_multi_line(
            r#"
            node_index.data(),
            &_nrn_mechanism_access_voltage(_node),
            &_nrn_mechanism_access_d(_node),
            &_nrn_mechanism_access_rhs(_node),
            1
            "#,
        );
        self.p.pop_block_with(";");
        self.p.pop_block();
        self.p.add_newline();
    }

    // ── Allocation ──

    fn print_neuron_lifecycle_declarations(&mut self) {
        if self.metadata.constructor.is_some() {
            let line = format!("void {}(Prop* prop);", self.method_name("nrn_constructor"));
            self.p.add_line(line);
        }
        let line = format!("void {}(Prop* prop);", self.method_name("nrn_destructor"));
        self.p.add_line(line);
    }

    /// `nrn_alloc`: datum allocation, parameter defaults and ion wiring.
    fn print_neuron_alloc(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let plan = self.plan;
        let host = EmissionContext::host();
        let int_size = plan.int_variables_size();

        self.p.add_newlines(2);
        self.p
            .push_block(format!("static void {}(Prop* _prop)", self.method_name("nrn_alloc")));
        self.p.add_line("Datum *_ppvar = nullptr;");
        if m.point_process {
            self.p.push_block("if (nrn_point_prop_)");
            self.p.add_line(
                "_nrn_mechanism_access_alloc_seq(_prop) = _nrn_mechanism_access_alloc_seq(nrn_point_prop_);",
            );
            self.p
                .add_line("_ppvar = _nrn_mechanism_access_dparam(nrn_point_prop_);");
            self.p.chain_block("else");
        }
        if int_size > 0 {
            self.p.add_line(format!(
                "_ppvar = nrn_prop_datum_alloc(mech_type, {}, _prop);",
                int_size
            ));
            self.p.add_line("_nrn_mechanism_access_dparam(_prop) = _ppvar;");
        }
        self.p.add_line("_nrn_mechanism_cache_instance _lmc{_prop};");
        self.p.add_line("size_t const _iml = 0;");
        self.p.add_line(format!(
            "assert(_nrn_mechanism_get_num_vars(_prop) == {});",
            plan.float_variables.len()
        ));
        if plan.float_variables_size() > 0 {
            self.p.add_line("/*initialize range parameters*/");
            for (i, param) in m.range_parameter_vars.iter().enumerate() {
                if param.is_array {
                    continue;
                }
                let position = plan.position_of_float_var(&param.name)?;
                self.p.add_line(format!(
                    "_lmc.template fpfield<{}>(_iml) = _parameter_defaults[{}]; /* {} */",
                    position, i, param.name
                ));
            }
        }
        if m.point_process {
            self.p.pop_block();
        }
        if int_size > 0 {
            self.p.add_line("_nrn_mechanism_access_dparam(_prop) = _ppvar;");
        }

        for var in &plan.int_variables {
            match var.name() {
                "diam" => {
                    self.p
                        .add_line("Prop * morphology_prop = need_memb(_morphology_sym);");
                    self.p.add_line(format!(
                        "_ppvar[{}] = _nrn_mechanism_get_param_handle(morphology_prop, 0);",
                        var.offset
                    ));
                }
                "area" => self.p.add_line(format!(
                    "_ppvar[{}] = _nrn_mechanism_get_area_handle(nrn_alloc_node_);",
                    var.offset
                )),
                _ => {}
            }
        }

        for ion in &m.ions {
            let name = &ion.name;
            self.p
                .add_line(format!("Symbol * {0}_sym = hoc_lookup(\"{0}_ion\");", name));
            self.p
                .add_line(format!("Prop * {0}_prop = need_memb({0}_sym);", name));
            let written = |var: String| ion.is_written(&var);
            if written(ion.extra_conc_name()) {
                self.p
                    .add_line(format!("nrn_check_conc_write(_prop, {}_prop, 0);", name));
            }
            if written(ion.intra_conc_name()) {
                self.p
                    .add_line(format!("nrn_check_conc_write(_prop, {}_prop, 1);", name));
            }
            let read = |var: String| ion.is_read(&var) || ion.implicit_reads.contains(&var);
            let conc = if ion.is_conc_written() {
                3
            } else {
                (read(ion.intra_conc_name()) || read(ion.extra_conc_name())) as u8
            };
            let rev = if written(ion.rev_potential_name()) {
                3
            } else {
                read(ion.rev_potential_name()) as u8
            };
            self.p
                .add_line(format!("nrn_promote({}_prop, {}, {});", name, conc, rev));
            for var in &plan.int_variables {
                let var_name = var.name();
                if let Some(ion_var) = var_name.strip_prefix("ion_") {
                    if let Some(index) = ion.variable_index(ion_var) {
                        self.p.add_line(format!(
                            "_ppvar[{}] = _nrn_mechanism_get_param_handle({}_prop, {});",
                            var.offset, name, index
                        ));
                    }
                } else if var_name == format!("style_{}", name) {
                    self.p.add_line(format!(
                        "_ppvar[{}] = {{neuron::container::do_not_search, &(_nrn_mechanism_access_dparam({}_prop)[0].literal_value<int>())}};",
                        var.offset, name
                    ));
                }
            }
        }

        if !m.random_variables.is_empty() {
            for random in &m.random_variables {
                let slot = self.name(&random.name, &host);
                self.p.add_line(format!("{} = nrnran123_newstream();", slot));
            }
            self.p.add_line(format!(
                "nrn_mech_inst_destruct[mech_type] = neuron::{};",
                self.method_name("nrn_destructor")
            ));
        }
        if m.point_process || m.artificial_cell {
            self.p.push_block("if(!nrn_point_prop_)");
            if m.constructor.is_some() {
                self.p
                    .add_line(format!("{}(_prop);", self.method_name("nrn_constructor")));
            }
            self.p.pop_block();
        }
        self.p.pop_block();
        Ok(())
    }

    // ── hoc interface ──

    fn print_point_process_functions(&mut self) {
        if !self.metadata.point_process {
            return;
        }
        self.p.add_newline();
        self.p.add_multi_line(
            r#"
            /* Point Process specific functions */
            static void* _hoc_create_pnt(Object* _ho) {
                return create_point_process(_pointtype, _ho);
            }
            static void _hoc_destroy_pnt(void* _vptr) {
                destroy_point_process(_vptr);
            }
            static double _hoc_loc_pnt(void* _vptr) {
                return loc_point_process(_pointtype, _vptr);
            }
            static double _hoc_has_loc(void* _vptr) {
                return has_loc_point(_vptr);
            }
            static double _hoc_get_loc_pnt(void* _vptr) {
                return (get_loc_point_process(_vptr));
            }
            "#,
        );
    }

    fn print_setdata_functions(&mut self) {
        self.p.add_newline();
        self.p.add_line("/* Neuron setdata functions */");
        self.p
            .add_line("extern void _nrn_setdata_reg(int, void(*)(Prop*));");
        self.p.push_block("static void _setdata(Prop* _prop)");
        if !self.metadata.point_process {
            self.p.add_line("_extcall_prop = _prop;");
            self.p.add_line("_prop_id = _nrn_get_prop_id(_prop);");
        }
        self.p.pop_block();
        if self.metadata.point_process {
            self.p.push_block("static void _hoc_setdata(void* _vptr)");
            self.p.add_line("Prop* _prop;");
            self.p.add_line("_prop = ((Point_process*)_vptr)->prop;");
            self.p.add_line("_setdata(_prop);");
        } else {
            self.p.push_block("static void _hoc_setdata()");
            self.p.add_line("Prop *_prop = hoc_getdata_range(mech_type);");
            self.p.add_line("_setdata(_prop);");
            self.p.add_line("hoc_retpushx(1.);");
        }
        self.p.pop_block();
    }

    /// hoc callable tables. Model routines are not exported to hoc.
    fn print_hoc_functions(&mut self) {
        let m = self.metadata;
        self.p.add_newlines(2);
        self.p.add_line("/* connect user functions to hoc names */");
        self.p.add_line("static VoidFunc hoc_intfunc[] = {");
        self.p.increase_indent();
        if m.point_process {
            self.p.add_line("{0, 0}");
            self.p.decrease_indent();
            self.p.add_line("};");
            self.p.add_line("static Member_func _member_func[] = {");
            self.p.increase_indent();
            self.p.add_line("{\"loc\", _hoc_loc_pnt},");
            self.p.add_line("{\"has_loc\", _hoc_has_loc},");
            self.p.add_line("{\"get_loc\", _hoc_get_loc_pnt},");
        } else {
            self.p
                .add_line(format!("{{\"setdata_{}\", _hoc_setdata}},", m.mod_suffix));
        }
        self.p.add_line("{nullptr, nullptr}");
        self.p.decrease_indent();
        self.p.add_line("};");
        if !m.point_process {
            self.p
                .push_block("static NPyDirectMechFunc npy_direct_func_proc[] =");
            self.p.add_line("{nullptr, nullptr}");
            self.p.pop_block_with(";");
        }
    }

    /// Thread storage of thread-promoted globals and top-level LOCALs.
    fn print_neuron_thread_callbacks(&mut self) {
        let m = self.metadata;
        if !m.thread_callback_register() {
            return;
        }
        let thread = &self.plan.thread;
        let singleton = self.resolver.global_instance();
        let static_data = format!("{}.thread_data", singleton);
        let in_use = format!("{}.thread_data_in_use", singleton);

        self.p.add_newlines(2);
        self.p.push_block("static void thread_mem_init(Datum* _thread)");
        if let (Some(tid), true) = (thread.top_local_thread_id, thread.top_local_thread_size > 0) {
            self.p.add_line(format!(
                "_thread[{}] = {{neuron::container::do_not_search, new double[{}]{{}}}};",
                tid, thread.top_local_thread_size
            ));
        }
        if let Some(tid) = thread.thread_var_thread_id {
            self.p.push_block(format!("if({})", in_use));
            self.p.add_line(format!(
                "_thread[{}] = {{neuron::container::do_not_search, new double[{}]{{}}}};",
                tid, thread.thread_var_data_size
            ));
            self.p.chain_block("else");
            self.p.add_line(format!(
                "_thread[{}] = {{neuron::container::do_not_search, {}}};",
                tid, static_data
            ));
            self.p.add_line(format!("{} = 1;", in_use));
            self.p.pop_block();
        }
        self.p.pop_block();

        self.p.push_block("static void thread_mem_cleanup(Datum* _thread)");
        if let (Some(tid), true) = (thread.top_local_thread_id, thread.top_local_thread_size > 0) {
            self.p
                .add_line(format!("delete[] _thread[{}].get<double*>();", tid));
        }
        if let Some(tid) = thread.thread_var_thread_id {
            self.p.add_line(format!(
                "double * _thread_data_ptr = _thread[{}].get<double*>();",
                tid
            ));
            self.p
                .push_block(format!("if(_thread_data_ptr == {})", static_data));
            self.p.add_line(format!("{} = 0;", in_use));
            self.p.chain_block("else");
            self.p.add_line("delete[] _thread_data_ptr;");
            self.p.pop_block();
        }
        self.p.pop_block();
    }

    /// Entry point the runtime calls to rebuild every TABLE.
    fn print_neuron_check_table(&mut self) {
        let m = self.metadata;
        if m.table_count() == 0 {
            return;
        }
        self.p.add_newlines(2);
        self.p.push_block(
            "static void _check_table_thread(Memb_list* _ml, size_t id, Datum* _ppvar, Datum* _thread, double* _globals, NrnThread* nt, int _type, const _nrn_model_sorted_token& _sorted_token)",
        );
        self.p
            .add_line("_nrn_mechanism_cache_range _lmc{_sorted_token, *nt, *_ml, _type};");
        self.p
            .add_line(format!("auto inst = make_instance_{}(_lmc);", self.suffix()));
        if !m.artificial_cell {
            self.p.add_line(format!(
                "auto node_data = make_node_data_{}(*nt, *_ml);",
                self.suffix()
            ));
        }
        let args = self.internal_args();
        for callable in m.functions_with_table() {
            let check = format!("check_{}", self.method_name(&callable.name));
            self.p.add_line(format!("{}({});", check, args));
        }
        self.p.pop_block();
    }

    // ── Compute kernels ──

    /// Kernel signature and the views every kernel starts from. Leaves the
    /// function block open.
    fn neuron_kernel_prologue(&mut self, method: &str) {
        let suffix = self.suffix().to_string();
        self.p
            .push_block(format!("void {}({})", method, KERNEL_PARAMS));
        self.p
            .add_line("_nrn_mechanism_cache_range _lmc{_sorted_token, *nt, *_ml_arg, _type};");
        self.p
            .add_line(format!("auto inst = make_instance_{}(_lmc);", suffix));
        self.p.add_line(format!(
            "auto node_data = make_node_data_{}(*nt, *_ml_arg);",
            suffix
        ));
        self.p.add_line("auto nodecount = _ml_arg->nodecount;");
        self.p.add_line("auto* _thread = _ml_arg->_thread;");
    }

    fn print_neuron_nrn_init(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let backend = self.backend;
        let ctx = EmissionContext::kernel(BlockType::Initial);
        let method = self.method_name("nrn_init");
        self.p.add_newlines(2);
        self.neuron_kernel_prologue(&method);
        backend.begin_iteration(&mut self.p, BlockType::Initial);
        self.p.add_line("auto* _ppvar = _ml_arg->pdata[id];");
        if !m.artificial_cell {
            self.p.add_line("int node_id = node_data.nodeindices[id];");
            self.p.add_line("auto v = node_data.node_voltages[node_id];");
        }
        let dt = self.name("dt", &ctx);
        if let Some(changed) = &m.changed_dt {
            self.p.add_line(format!("double _save_prev_dt = {};", dt));
            self.p.add_line(format!("{} = {};", dt, changed));
        }
        self.print_ion_reads(BlockType::Initial, &ctx);
        if let Some(initial) = &m.initial {
            self.block(initial, &ctx)?;
        }
        self.print_ion_writes(BlockType::Initial, &ctx)?;
        if m.changed_dt.is_some() {
            self.p.add_line(format!("{} = _save_prev_dt;", dt));
        }
        backend.end_iteration(&mut self.p);
        self.p.pop_block();
        Ok(())
    }

    fn conductance_slot(&self) -> &'static str {
        if self.metadata.vectorize {
            CONDUCTANCE_UNUSED
        } else {
            CONDUCTANCE
        }
    }

    fn print_neuron_nrn_cur(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        if !m.nrn_cur_required() {
            return Ok(());
        }
        let Some(breakpoint) = &m.breakpoint else {
            return Ok(());
        };
        if m.conductances.is_empty() {
            self.print_nrn_current(breakpoint)?;
        }
        let backend = self.backend;
        let ctx = EmissionContext::kernel(BlockType::Equation);
        let method = self.method_name("nrn_cur");
        let (rhs_op, _) = self.matrix_operators();

        self.p.add_newlines(2);
        self.p.add_line("/** update current */");
        self.neuron_kernel_prologue(&method);
        backend.begin_iteration(&mut self.p, BlockType::Equation);
        self.p.add_line("int node_id = node_data.nodeindices[id];");
        self.p.add_line("double v = node_data.node_voltages[node_id];");
        self.p.add_line("auto* _ppvar = _ml_arg->pdata[id];");
        self.print_ion_reads(BlockType::Equation, &ctx);
        if m.conductances.is_empty() {
            self.print_nrn_cur_finite_difference(&ctx)?;
        } else {
            self.print_nrn_cur_conductance(breakpoint, &ctx)?;
        }
        self.print_ion_writes(BlockType::Equation, &ctx)?;
        if m.point_process {
            let area = self.name(crate::layout::NODE_AREA, &ctx);
            self.p.add_line(format!("double mfactor = 1.e2/{};", area));
            self.p.add_line("g = g*mfactor;");
            self.p.add_line("rhs = rhs*mfactor;");
        }
        self.p
            .add_line(format!("node_data.node_rhs[node_id] {}= rhs;", rhs_op));
        let g = self.name(self.conductance_slot(), &ctx);
        self.p.add_line(format!("{} = g;", g));
        backend.end_iteration(&mut self.p);
        self.p.pop_block();
        Ok(())
    }

    fn print_neuron_nrn_state(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        if !m.nrn_state_required() {
            return Ok(());
        }
        let backend = self.backend;
        let ctx = EmissionContext::kernel(BlockType::State);
        let method = self.method_name("nrn_state");
        self.p.add_newlines(2);
        self.neuron_kernel_prologue(&method);
        backend.begin_iteration(&mut self.p, BlockType::State);
        self.p.add_line("int node_id = node_data.nodeindices[id];");
        self.p.add_line("auto* _ppvar = _ml_arg->pdata[id];");
        self.p.add_line("auto v = node_data.node_voltages[node_id];");
        self.print_ion_reads(BlockType::State, &ctx);
        if let Some(state) = &m.nrn_state {
            self.block(state, &ctx)?;
        }
        if let (true, Some(breakpoint)) = (m.currents.is_empty(), &m.breakpoint) {
            self.block(breakpoint, &ctx)?;
        }
        self.print_ion_writes(BlockType::State, &ctx)?;
        backend.end_iteration(&mut self.p);
        self.p.pop_block();
        Ok(())
    }

    /// Diagonal contribution of the conductance computed by `nrn_cur`.
    fn print_neuron_nrn_jacob(&mut self) {
        let m = self.metadata;
        let backend = self.backend;
        let ctx = EmissionContext::kernel(BlockType::Equation);
        let (_, d_op) = self.matrix_operators();
        let suffix = self.suffix().to_string();
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static void {}({})",
            self.method_name("nrn_jacob"),
            KERNEL_PARAMS
        ));
        self.p
            .add_line("_nrn_mechanism_cache_range _lmc{_sorted_token, *nt, *_ml_arg, _type};");
        self.p
            .add_line(format!("auto inst = make_instance_{}(_lmc);", suffix));
        self.p.add_line(format!(
            "auto node_data = make_node_data_{}(*nt, *_ml_arg);",
            suffix
        ));
        self.p.add_line("auto nodecount = _ml_arg->nodecount;");
        backend.begin_iteration(&mut self.p, BlockType::Equation);
        if m.breakpoint_exist() {
            let g = self.name(self.conductance_slot(), &ctx);
            self.p.add_line("int node_id = node_data.nodeindices[id];");
            self.p
                .add_line(format!("node_data.node_diagonal[node_id] {}= {};", d_op, g));
        }
        backend.end_iteration(&mut self.p);
        self.p.pop_block();
    }

    // ── Events ──

    /// Views of the single instance an event is delivered to.
    fn print_neuron_event_preamble(&mut self) {
        self.p
            .add_line("_nrn_mechanism_cache_instance _lmc{_pnt->prop};");
        self.p
            .add_line("auto * nt = static_cast<NrnThread*>(_pnt->_vnt);");
        self.p
            .add_line("auto * _ppvar = _nrn_mechanism_access_dparam(_pnt->prop);");
        self.p
            .add_line(format!("auto inst = make_instance_{}(_lmc);", self.suffix()));
        if !self.metadata.artificial_cell {
            self.p.add_line(format!(
                "auto node_data = make_node_data_{}(_pnt->prop);",
                self.suffix()
            ));
        }
        self.p.add_line("Datum * _thread = nullptr;");
        self.p.add_line("size_t id = 0;");
        self.p.add_line("double t = nt->_t;");
    }

    /// NET_RECEIVE parameters live in the `_args` array of the NetCon.
    fn net_receive_scope(params: &[String]) -> Vec<(String, String)> {
        params
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), format!("_args[{}]", i)))
            .collect()
    }

    fn print_neuron_net_receive(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let Some(nr) = &m.net_receive else {
            return Ok(());
        };
        let ctx = EmissionContext::kernel(BlockType::NetReceive).in_net_receive(&nr.params);
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static void nrn_net_receive_{}(Point_process* _pnt, double* _args, double flag)",
            self.suffix()
        ));
        self.print_neuron_event_preamble();
        self.with_scope(Self::net_receive_scope(&nr.params), |s| s.block(&nr.body, &ctx))?;
        self.p.add_newline();
        self.p.pop_block();
        Ok(())
    }

    fn print_neuron_net_init(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let Some(nr) = &m.net_receive else {
            return Ok(());
        };
        let Some(initial) = &nr.initial else {
            return Ok(());
        };
        let ctx = EmissionContext::kernel(BlockType::NetReceive).in_net_init(&nr.params);
        self.p.add_newlines(2);
        self.p
            .push_block("static void net_init(Point_process* _pnt, double* _args, double flag)");
        if !initial.statements.is_empty() {
            self.print_neuron_event_preamble();
            self.with_scope(Self::net_receive_scope(&nr.params), |s| s.block(initial, &ctx))?;
        }
        self.p.pop_block();
        Ok(())
    }

    // ── CONSTRUCTOR / DESTRUCTOR ──

    fn print_prop_preamble(&mut self) {
        self.p
            .add_line("Datum* _ppvar = _nrn_mechanism_access_dparam(prop);");
        self.p.add_line("_nrn_mechanism_cache_instance _lmc{prop};");
        self.p.add_line("const size_t id = 0;");
        self.p
            .add_line(format!("auto inst = make_instance_{}(_lmc);", self.suffix()));
        if !self.metadata.artificial_cell {
            self.p.add_line(format!(
                "auto node_data = make_node_data_{}(prop);",
                self.suffix()
            ));
        }
        self.p.add_newline();
    }

    fn print_neuron_constructor(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let Some(body) = &m.constructor else {
            return Ok(());
        };
        let ctx = EmissionContext::kernel(BlockType::Constructor);
        self.p.add_newlines(2);
        self.p
            .push_block(format!("void {}(Prop* prop)", self.method_name("nrn_constructor")));
        self.print_prop_preamble();
        self.block(body, &ctx)?;
        self.p.pop_block();
        Ok(())
    }

    fn print_neuron_destructor(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let ctx = EmissionContext::kernel(BlockType::Destructor);
        let host = EmissionContext::host();
        self.p.add_newlines(2);
        self.p
            .push_block(format!("void {}(Prop* prop)", self.method_name("nrn_destructor")));
        self.print_prop_preamble();
        for random in &m.random_variables {
            let slot = self.name(&random.name, &host);
            self.p
                .add_line(format!("nrnran123_deletestream((nrnran123_State*) {});", slot));
        }
        if let Some(body) = &m.destructor {
            self.block(body, &ctx)?;
        }
        self.p.pop_block();
        Ok(())
    }

    /// `_initlists`: field indices of every integrated state and its
    /// derivative, called once at registration.
    fn print_initlists(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let plan = self.plan;
        self.p.add_newlines(2);
        self.p.push_block("static void _initlists()");
        for (i, prime) in m.prime_variables.iter().enumerate() {
            let state = plan.position_of_float_var(&prime.name)?;
            let derivative_name = format!("D{}", prime.name);
            let derivative = plan.position_of_float_var(&derivative_name)?;
            if prime.is_array {
                self.p
                    .push_block(format!("for (int _i = 0; _i < {}; ++_i)", prime.length));
                self.p
                    .add_line(format!("/* {}[{}] */", prime.name, prime.length));
                self.p
                    .add_line(format!("_slist1[{}+_i] = {{{}, _i}};", i, state));
                self.p
                    .add_line(format!("/* {}[{}] */", derivative_name, prime.length));
                self.p
                    .add_line(format!("_dlist1[{}+_i] = {{{}, _i}};", i, derivative));
                self.p.pop_block();
            } else {
                self.p.add_line(format!("/* {} */", prime.name));
                self.p.add_line(format!("_slist1[{}] = {{{}, 0}};", i, state));
                self.p.add_line(format!("/* {} */", derivative_name));
                self.p
                    .add_line(format!("_dlist1[{}] = {{{}, 0}};", i, derivative));
            }
        }
        self.p.pop_block();
        Ok(())
    }

    // ── Registration ──

    /// C++ type under which an integer slot is registered.
    fn datum_field_type(var: &crate::layout::IndexVariableInfo) -> &'static str {
        let name = var.name();
        if name == POINT_PROCESS {
            "Point_process*"
        } else if name == TQITEM || name == FOR_NETCON {
            "void*"
        } else if name.starts_with("style_")
            && var.semantic.starts_with('#')
            && var.semantic.ends_with("_ion")
        {
            "int*"
        } else {
            "double*"
        }
    }

    /// `_{mod_file}_reg()` in the NEURON registration format.
    pub fn print_neuron_register(&mut self) {
        let m = self.metadata;
        let plan = self.plan;
        let host = EmissionContext::host();

        self.p.add_newlines(2);
        self.p.add_line("/** register channel with the simulator */");
        self.p
            .push_block(format!("extern \"C\" void _{}_reg()", m.mod_file));
        self.p.add_line("_initlists();");
        self.p.add_newline();
        for ion in &m.ions {
            self.p.add_line(format!(
                "ion_reg(\"{}\", {});",
                ion.name,
                format_g(ion.valence.unwrap_or(-10000.0))
            ));
        }
        if !m.ions.is_empty() {
            self.p.add_newline();
        }
        for ion in &m.ions {
            self.p
                .add_line(format!("_{0}_sym = hoc_lookup(\"{0}_ion\");", ion.name));
        }
        if !m.ions.is_empty() {
            self.p.add_newline();
        }

        let compute = if m.breakpoint_exist() {
            let cur = if m.nrn_cur_required() {
                self.method_name("nrn_cur")
            } else {
                "nullptr".into()
            };
            let state = if m.nrn_state_required() {
                self.method_name("nrn_state")
            } else {
                "nullptr".into()
            };
            format!("{}, {}, {}", cur, self.method_name("nrn_jacob"), state)
        } else {
            "nullptr, nullptr, nullptr".into()
        };
        let arguments = format!(
            "mechanism, {}, {}, {}, {}, {}",
            self.method_name("nrn_alloc"),
            compute,
            self.method_name("nrn_init"),
            plan.first_pointer_var_index_value(),
            1 + plan.thread.thread_data_index
        );
        if m.point_process {
            self.p.add_line(format!(
                "_pointtype = point_register_mech({}, _hoc_create_pnt, _hoc_destroy_pnt, _member_func);",
                arguments
            ));
            if m.destructor.is_some() {
                self.p.add_line(format!(
                    "register_destructor({});",
                    self.method_name("nrn_destructor")
                ));
            }
        } else {
            self.p.add_line(format!("register_mech({});", arguments));
        }
        if m.thread_callback_register() {
            self.p.add_line(format!(
                "_extcall_thread.resize({});",
                plan.thread.thread_data_index + 1
            ));
            self.p.add_line("thread_mem_init(_extcall_thread.data());");
            if !m.thread_variables.is_empty() {
                let in_use = self.name("thread_data_in_use", &host);
                self.p.add_line(format!("{} = 0;", in_use));
            }
        }

        self.p.add_newline();
        self.p.add_line("mech_type = nrn_get_mechtype(mechanism[1]);");
        self.p
            .add_line("hoc_register_parm_default(mech_type, &_parameter_defaults);");
        if m.table_count() > 0 {
            self.p
                .add_line("_nrn_thread_table_reg(mech_type, _check_table_thread);");
        }

        let mut fields: Vec<String> = plan
            .float_variables
            .iter()
            .enumerate()
            .map(|(i, var)| {
                if var.symbol.is_array {
                    format!(
                        "_nrn_mechanism_field<double>{{\"{}\", {}}} /* {} */",
                        var.symbol.name, var.symbol.length, i
                    )
                } else {
                    format!("_nrn_mechanism_field<double>{{\"{}\"}} /* {} */", var.symbol.name, i)
                }
            })
            .collect();
        for var in &plan.int_variables {
            fields.push(format!(
                "_nrn_mechanism_field<{}>{{\"{}\", \"{}\"}} /* {} */",
                Self::datum_field_type(var),
                var.name(),
                var.semantic,
                var.offset
            ));
        }
        self.p.add_line("_nrn_mechanism_register_data_fields(mech_type,");
        self.p.increase_indent();
        if !fields.is_empty() {
            self.p.add_multi_line(&fields.join(",\n"));
        }
        self.p.decrease_indent();
        self.p.add_line(");");
        self.p.add_newline();

        self.p.add_line(format!(
            "hoc_register_prop_size(mech_type, {}, {});",
            plan.float_variables_size(),
            plan.int_variables_size()
        ));
        for semantic in &plan.semantics {
            self.p.add_line(format!(
                "hoc_register_dparam_semantics(mech_type, {}, \"{}\");",
                semantic.index, semantic.name
            ));
        }
        if m.write_concentration {
            self.p.add_line("nrn_writes_conc(mech_type, 0);");
        }
        if let (true, Some(tqitem)) = (m.artificial_cell, plan.tqitem_index) {
            self.p
                .add_line(format!("add_nrn_artcell(mech_type, {});", tqitem));
        }
        if m.net_event_used {
            self.p.add_line("add_nrn_has_net_event(mech_type);");
        }
        self.p
            .add_line("hoc_register_var(hoc_scalar_double, hoc_vector_double, hoc_intfunc);");
        if !m.point_process {
            self.p
                .add_line("hoc_register_npy_direct(mech_type, npy_direct_func_proc);");
        }
        if m.net_receive.is_some() {
            self.p.add_line(format!(
                "pnt_receive[mech_type] = nrn_net_receive_{};",
                m.mod_suffix
            ));
            self.p.add_line(format!(
                "pnt_receive_size[mech_type] = {};",
                m.num_net_receive_parameters()
            ));
        }
        if m.net_receive.as_ref().is_some_and(|nr| nr.initial.is_some()) {
            self.p.add_line("pnt_receive_init[mech_type] = net_init;");
        }
        if m.thread_callback_register() {
            self.p
                .add_line("_nrn_thread_reg(mech_type, 1, thread_mem_init);");
            self.p
                .add_line("_nrn_thread_reg(mech_type, 0, thread_mem_cleanup);");
        }
        if m.diam_used {
            self.p.add_line("_morphology_sym = hoc_lookup(\"morphology\");");
        }
        self.p.pop_block();
    }
}
