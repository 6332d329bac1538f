// register.rs — Mechanism registration
//
// `_{mod_file}_reg()`: looks the mechanism and its ions up in the runtime,
// registers the kernels and callbacks, the data sizes and the
// index-semantics table, then the optional event, WATCH, FOR_NETCON and
// BEFORE/AFTER hooks.
//
// Preconditions: the layout plan is the one the instance struct was built
//                from; semantics indices must agree with `setup_instance`.
// Postconditions: optional hooks are registered exactly when the matching
//                 kernel was emitted.
// Failure modes: none.
// Side effects: appends to the session printer only.

use crate::emit::Session;
use crate::layout::FOR_NETCON;
use crate::model::{Attach, BeforeAfter, BeforeAfterKind};
use crate::resolve::EmissionContext;

/// `BAType::{Before,After} + BAType::{attach}` as understood by `hoc_reg_ba`.
pub fn before_after_register_type(block: &BeforeAfter) -> String {
    let kind = match block.kind {
        BeforeAfterKind::Before => "BAType::Before",
        BeforeAfterKind::After => "BAType::After",
    };
    let attach = match block.attach {
        Attach::Breakpoint => "BAType::Breakpoint",
        Attach::Solve => "BAType::Solve",
        Attach::Initial => "BAType::Initial",
        Attach::Step => "BAType::Step",
    };
    format!("{} + {}", kind, attach)
}

impl<'a> Session<'a> {
    /// Number of `ThreadDatum` objects the runtime allocates per thread.
    pub fn num_thread_objects(&self) -> usize {
        if self.metadata.vectorize {
            self.plan.thread.thread_data_index + 1
        } else {
            0
        }
    }

    /// Shared argument list of `register_mech` and `point_register_mech`.
    fn register_mechanism_arguments(&self) -> String {
        let m = self.metadata;
        let cur = if m.nrn_cur_required() {
            self.method_name("nrn_cur")
        } else {
            "nullptr".to_string()
        };
        let state = if m.nrn_state_required() {
            self.method_name("nrn_state")
        } else {
            "nullptr".to_string()
        };
        format!(
            "mechanism, {}, {}, nullptr, {}, {}, {}, {}, first_pointer_var_index()",
            self.method_name("nrn_alloc"),
            cur,
            state,
            self.method_name("nrn_init"),
            self.method_name("nrn_private_constructor"),
            self.method_name("nrn_private_destructor"),
        )
    }

    pub fn print_mechanism_register(&mut self) {
        let m = self.metadata;
        let plan = self.plan;
        let host = EmissionContext::host();

        self.p.add_newlines(2);
        self.p.add_line("/** register channel with the simulator */");
        self.p.push_block(format!("void _{}_reg()", m.mod_file));
        self.p.add_newline();
        self.p.add_line(format!(
            "int mech_type = nrn_get_mechtype(\"{}\");",
            m.mod_suffix
        ));
        let mech_type = self.name("mech_type", &host);
        self.p.add_line(format!("{} = mech_type;", mech_type));
        self.p.push_block("if (mech_type == -1)");
        self.p.add_line("return;");
        self.p.pop_block();
        self.p.add_newline();
        // 0 selects the SoA layout
        self.p.add_line("_nrn_layout_reg(mech_type, 0);");

        let arguments = self.register_mechanism_arguments();
        let threads = self.num_thread_objects();
        if m.point_process {
            let constructor = if m.constructor.is_some() {
                self.method_name("nrn_constructor")
            } else {
                "nullptr".into()
            };
            let destructor = if m.destructor.is_some() {
                self.method_name("nrn_destructor")
            } else {
                "nullptr".into()
            };
            self.p.add_line(format!(
                "point_register_mech({}, {}, {}, {});",
                arguments, constructor, destructor, threads
            ));
        } else {
            self.p
                .add_line(format!("register_mech({}, {});", arguments, threads));
            if m.constructor.is_some() {
                self.p.add_line(format!(
                    "register_constructor({});",
                    self.method_name("nrn_constructor")
                ));
            }
        }
        for ion in &m.ions {
            let type_var = self.name(&format!("{}_type", ion.name), &host);
            self.p.add_line(format!(
                "{} = nrn_get_mechtype(\"{}_ion\");",
                type_var, ion.name
            ));
        }
        self.p.add_newline();

        if m.vectorize && plan.thread.thread_data_index != 0 {
            let ext = self.name("ext_call_thread", &host);
            self.p.add_line(format!("thread_mem_init({});", ext));
        }
        if !m.thread_variables.is_empty() {
            let in_use = self.name("thread_data_in_use", &host);
            self.p.add_line(format!("{} = 0;", in_use));
        }
        if m.thread_callback_register() {
            self.p.add_line("_nrn_thread_reg0(mech_type, thread_mem_cleanup);");
            self.p.add_line("_nrn_thread_reg1(mech_type, thread_mem_init);");
        }
        if m.emit_table_thread() {
            self.p.add_line(format!(
                "_nrn_thread_table_reg(mech_type, {});",
                self.method_name("check_table_thread")
            ));
        }
        if m.bbcore_pointer_used {
            self.p.add_line("hoc_reg_bbcore_read(mech_type, bbcore_read);");
            self.p.add_line("hoc_reg_bbcore_write(mech_type, bbcore_write);");
        }
        self.p.add_line(
            "hoc_register_prop_size(mech_type, float_variables_size(), int_variables_size());",
        );
        for semantic in &plan.semantics {
            self.p.add_line(format!(
                "hoc_register_dparam_semantics(mech_type, {}, \"{}\");",
                semantic.index, semantic.name
            ));
        }

        if m.is_watch_used() {
            self.p.add_line(format!(
                "hoc_register_watch_check({}, mech_type);",
                self.method_name("nrn_watch_check")
            ));
        }
        if m.write_concentration {
            self.p.add_line("nrn_writes_conc(mech_type, 0);");
        }
        if m.net_event_used {
            self.p.add_line("add_nrn_has_net_event(mech_type);");
        }
        if let (true, Some(tqitem)) = (m.artificial_cell, plan.tqitem_index) {
            self.p
                .add_line(format!("add_nrn_artcell(mech_type, {});", tqitem));
        }
        if m.net_receive_buffering_required() {
            self.p.add_line(format!(
                "hoc_register_net_receive_buffering({}, mech_type);",
                self.method_name("net_buf_receive")
            ));
        }
        if m.num_net_receive_parameters() != 0 {
            let init = match &m.net_receive {
                Some(nr) if nr.initial.is_some() => "net_init",
                _ => "nullptr",
            };
            self.p.add_line(format!(
                "set_pnt_receive(mech_type, {}, {}, num_net_receive_args());",
                self.method_name("net_receive"),
                init
            ));
        }
        if m.for_netcon_used {
            if let Ok(index) = plan.position_of_int_var(FOR_NETCON) {
                self.p
                    .add_line(format!("add_nrn_fornetcons(mech_type, {});", index));
            }
        }
        if m.net_event_used || m.net_send_used {
            self.p.add_line("hoc_register_net_send_buffering(mech_type);");
        }
        for (i, block) in m.before_after.iter().enumerate() {
            self.p.add_line(format!(
                "hoc_reg_ba(mech_type, {}, {});",
                self.method_name(&format!("nrn_before_after_{}", i)),
                before_after_register_type(block)
            ));
        }
        self.p
            .add_line("hoc_register_var(hoc_scalar_double, hoc_vector_double, NULL);");
        self.p.pop_block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CppBackend;
    use crate::calls::classify;
    use crate::layout;
    use crate::model::{build, ModelFile};
    use crate::resolve::{Resolver, Style};

    fn render(json: &str) -> String {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        let resolver = Resolver::new(&metadata, &plan, Style::Coreneuron).expect("resolver");
        let mut s = Session::new(&metadata, &plan, &calls, &resolver, &CppBackend);
        s.print_mechanism_register();
        s.finish()
    }

    #[test]
    fn density_mechanism_registration() {
        let text = render(
            r#"{
                "mod_file": "hh", "suffix": "hh",
                "variables": [
                    {"name": "gnabar", "kinds": ["range", "parameter"], "value": 0.12},
                    {"name": "ina", "kinds": ["range", "assigned"]},
                    {"name": "ena", "kinds": ["assigned"]}
                ],
                "ions": [{"name": "na", "reads": ["ena"], "writes": ["ina"]}],
                "currents": ["ina"],
                "blocks": {"breakpoint": "ina = gnabar*(v - ena)"}
            }"#,
        );
        assert!(text.starts_with("\n\n/** register channel with the simulator */\nvoid _hh_reg() {\n"));
        assert!(text.contains("    int mech_type = nrn_get_mechtype(\"hh\");\n    hh_global.mech_type = mech_type;\n"));
        assert!(text.contains(
            "    register_mech(mechanism, nrn_alloc_hh, nrn_cur_hh, nullptr, nrn_state_hh, nrn_init_hh, nrn_private_constructor_hh, nrn_private_destructor_hh, first_pointer_var_index(), "
        ));
        assert!(text.contains("    hh_global.na_type = nrn_get_mechtype(\"na_ion\");\n"));
        assert!(text.contains("hoc_register_dparam_semantics(mech_type, 0, \"na_ion\");"));
        assert!(text.contains("hoc_register_dparam_semantics(mech_type, 2, \"na_ion\");"));
        assert!(!text.contains("#na_ion"));
        assert!(text.ends_with("    hoc_register_var(hoc_scalar_double, hoc_vector_double, NULL);\n}\n"));
        assert!(!text.contains("set_pnt_receive"));
    }

    #[test]
    fn artificial_cell_registers_event_hooks() {
        let text = render(
            r#"{
                "mod_file": "cell", "suffix": "Cell", "point_process": true, "artificial_cell": true,
                "variables": [{"name": "tau", "kinds": ["range", "parameter"], "value": 10}],
                "blocks": {
                    "initial": "net_send(0, 1)",
                    "net_receive": {"params": ["w"], "body": "net_event(t) net_send(tau, 1)", "initial": "w = 0"},
                    "before_after": [{"kind": "after", "attach": "solve", "body": "tau = tau"}]
                }
            }"#,
        );
        assert!(text.contains("point_register_mech(mechanism, nrn_alloc_Cell, nullptr, nullptr, nullptr, nrn_init_Cell, "));
        assert!(text.contains("add_nrn_has_net_event(mech_type);"));
        assert!(text.contains("add_nrn_artcell(mech_type, 2);"));
        assert!(text.contains("set_pnt_receive(mech_type, net_receive_Cell, net_init, num_net_receive_args());"));
        assert!(!text.contains("hoc_register_net_receive_buffering"));
        assert!(text.contains("hoc_register_net_send_buffering(mech_type);"));
        assert!(text.contains("hoc_reg_ba(mech_type, nrn_before_after_0_Cell, BAType::After + BAType::Solve);"));
    }
}
