// events.rs — Discrete event plumbing
//
// net_send buffering, the NET_RECEIVE kernel with its buffered front-end and
// replay loop, the nested INITIAL (`net_init`), WATCH activation and the
// per-step watch check.
//
// Preconditions: `tqitem`, `point_process` and `watch{n}` slots exist in the
//                layout whenever the constructs using them are present.
// Postconditions: at most one WATCH statement triggers per instance and
//                 step; events raised while replaying go to the next phase.
// Failure modes: propagates statement emission errors.
// Side effects: appends to the session printer only.

use crate::ast::{Expr, StatementBlock};
use crate::backend::BlockType;
use crate::diag::Diagnostic;
use crate::emit::Session;
use crate::layout::{POINT_PROCESS, TQITEM, TSAVE};
use crate::resolve::EmissionContext;

/// True when `name` is read or written anywhere in `block`.
pub fn block_mentions(block: &StatementBlock, name: &str) -> bool {
    let mut found = false;
    block.walk_exprs(&mut |e| {
        if e.target_name() == Some(name) {
            found = true;
        }
    });
    found
}

fn watch_slot(i: usize) -> String {
    format!("watch{}", i + 1)
}

impl<'a> Session<'a> {
    // ── net_send buffer ──

    pub fn print_net_send_buffering(&mut self) {
        if !self.metadata.net_send_buffer_required() {
            return;
        }
        let backend = self.backend;
        let qualifier = backend.function_qualifier().trim_start_matches("static ");
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static {}void net_send_buffering(const NrnThread* nt, NetSendBuffer_t* nsb, int type, int vdata_index, int weight_index, int point_index, double t, double flag)",
            qualifier
        ));
        self.p.add_line("int i = 0;");
        backend.net_send_count_update(&mut self.p);
        if backend.net_send_buffer_growable() {
            self.p.push_block("if (i >= nsb->_size)");
            self.p.add_line("nsb->grow();");
            self.p.pop_block();
        }
        self.p.push_block("if (i < nsb->_size)");
        self.p.add_multi_line(
            r#"
            nsb->_sendtype[i] = type;
            nsb->_vdata_index[i] = vdata_index;
            nsb->_weight_index[i] = weight_index;
            nsb->_pnt_index[i] = point_index;
            nsb->_nsb_t[i] = t;
            nsb->_nsb_flag[i] = flag;
            "#,
        );
        self.p.pop_block();
        self.p.pop_block();
    }

    /// Hand buffered events back to the host queue.
    pub fn print_send_event_move(&mut self) {
        let backend = self.backend;
        self.p.add_newline();
        self.p.add_line("NetSendBuffer_t* nsb = ml->_net_send_buffer;");
        backend.net_send_buf_update_to_host(&mut self.p);
        self.p.push_block("for (int i=0; i < nsb->_cnt; i++)");
        self.p.add_multi_line(
            r#"
            int type = nsb->_sendtype[i];
            int tid = nt->id;
            double t = nsb->_nsb_t[i];
            double flag = nsb->_nsb_flag[i];
            int vdata_index = nsb->_vdata_index[i];
            int weight_index = nsb->_weight_index[i];
            int point_index = nsb->_pnt_index[i];
            net_sem_from_gpu(type, vdata_index, weight_index, tid, point_index, t, flag);
            "#,
        );
        self.p.pop_block();
        self.p.add_line("nsb->_cnt = 0;");
        backend.count_update_to_device(&mut self.p);
    }

    // ── NET_RECEIVE ──

    /// Locals shared by `net_init` and the receive kernel; binds every used
    /// receive parameter to its weight slot.
    fn print_net_receive_common(&mut self, body: &StatementBlock, initial: bool, need_instance: bool) {
        let m = self.metadata;
        self.p.add_multi_line(
            r#"
            int tid = pnt->_tid;
            int id = pnt->_i_instance;
            double v = 0;
            "#,
        );
        if m.artificial_cell || initial {
            self.p.add_line("NrnThread* nt = nrn_threads + tid;");
            self.p.add_line("Memb_list* ml = nt->_ml_list[pnt->_type];");
        }
        if initial {
            let backend = self.backend;
            backend.data_present_begin(&mut self.p, m);
        }
        self.p.add_multi_line(
            r#"
            int nodecount = ml->nodecount;
            int pnodecount = ml->_nodecount_padded;
            double* data = ml->data;
            double* weights = nt->weights;
            Datum* indexes = ml->pdata;
            ThreadDatum* thread = ml->_thread;
            "#,
        );
        if need_instance {
            self.p.add_line(format!(
                "auto* const inst = static_cast<{}*>(ml->instance);",
                self.instance_struct()
            ));
        }
        let Some(net_receive) = &m.net_receive else {
            return;
        };
        if net_receive.params.is_empty() {
            return;
        }
        self.p.add_newline();
        for (i, param) in net_receive.params.iter().enumerate() {
            if block_mentions(body, param) {
                self.p
                    .add_line(format!("double* {} = weights + weight_index + {};", param, i));
            }
        }
    }

    /// INITIAL nested in NET_RECEIVE, run once per connection.
    pub fn print_net_init(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let Some(net_receive) = &m.net_receive else {
            return Ok(());
        };
        let Some(initial) = &net_receive.initial else {
            return Ok(());
        };
        self.p.add_newlines(2);
        self.p.add_line("/** initialize block for net receive */");
        self.p
            .push_block("static void net_init(Point_process* pnt, int weight_index, double flag)");
        if initial.statements.is_empty() {
            self.p.add_line("// do nothing");
        } else {
            self.print_net_receive_common(initial, true, true);
            let ctx = EmissionContext::kernel(BlockType::NetReceive).in_net_init(&net_receive.params);
            self.block(initial, &ctx)?;
            let backend = self.backend;
            backend.data_present_end(&mut self.p, m);
            self.p.add_line("auto& nsb = ml->_net_send_buffer;");
            backend.net_send_buf_update_to_host(&mut self.p);
        }
        self.p.pop_block();
        Ok(())
    }

    /// Event delivery for one instance. Artificial cells are called by the
    /// queue directly; other point processes through `net_buf_receive`.
    pub fn print_net_receive_kernel(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let Some(net_receive) = &m.net_receive else {
            return Ok(());
        };
        let signature = if m.artificial_cell {
            format!(
                "static inline void {}(Point_process* pnt, int weight_index, double flag)",
                self.method_name("net_receive")
            )
        } else {
            format!(
                "static inline void {}(double t, Point_process* pnt, {}* inst, NrnThread* nt, Memb_list* ml, int weight_index, double flag)",
                self.method_name("net_receive_kernel"),
                self.instance_struct()
            )
        };
        let ctx = EmissionContext::kernel(BlockType::NetReceive).in_net_receive(&net_receive.params);

        self.p.add_newlines(2);
        self.p.push_block(signature);
        self.print_net_receive_common(&net_receive.body, false, m.artificial_cell);
        if m.artificial_cell {
            self.p.add_line("double t = nt->_t;");
        }
        if block_mentions(&net_receive.body, "v") {
            self.p.add_line("int node_id = ml->nodeindices[id];");
            self.p.add_line("v = nt->_actual_v[node_id];");
        }
        let tsave = self.name(TSAVE, &ctx);
        self.p.add_line(format!("{} = t;", tsave));
        if m.is_watch_used() {
            self.p.add_line("bool watch_remove = false;");
        }
        self.block(&net_receive.body, &ctx)?;
        self.p.pop_block();
        Ok(())
    }

    /// Buffering front-end registered with the queue for point processes.
    pub fn print_net_receive_front_end(&mut self) {
        if !self.metadata.net_receive_buffering_required() {
            return;
        }
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static void {}(Point_process* pnt, int weight_index, double flag)",
            self.method_name("net_receive")
        ));
        self.p.add_line("NrnThread* nt = nrn_threads + pnt->_tid;");
        self.p.add_line("Memb_list* ml = get_memb_list(nt);");
        self.p.add_line("NetReceiveBuffer_t* nrb = ml->_net_receive_buffer;");
        self.p.push_block("if (nrb->_cnt >= nrb->_size)");
        self.p.add_line("realloc_net_receive_buffer(nt, ml);");
        self.p.pop_block();
        self.p.add_multi_line(
            r#"
            int id = nrb->_cnt;
            nrb->_pnt_index[id] = pnt-nt->pntprocs;
            nrb->_weight_index[id] = weight_index;
            nrb->_nrb_t[id] = nt->_t;
            nrb->_nrb_flag[id] = flag;
            nrb->_cnt++;
            "#,
        );
        self.p.pop_block();
    }

    /// Replays the buffered events grouped by displacement.
    pub fn print_net_buf_receive(&mut self) {
        let m = self.metadata;
        if !m.net_receive_buffering_required() {
            return;
        }
        let backend = self.backend;
        self.p.add_newlines(2);
        self.p
            .push_block(format!("void {}(NrnThread* nt)", self.method_name("net_buf_receive")));
        self.p.add_line("Memb_list* ml = get_memb_list(nt);");
        self.p.push_block("if (!ml)");
        self.p.add_line("return;");
        self.p.pop_block();
        self.p.add_newline();
        backend.data_present_begin(&mut self.p, m);
        self.p.add_line("NetReceiveBuffer_t* nrb = ml->_net_receive_buffer;");
        self.p.add_line(format!(
            "auto* const inst = static_cast<{}*>(ml->instance);",
            self.instance_struct()
        ));
        self.p.add_line("int count = nrb->_displ_cnt;");
        backend.parallel_hint(&mut self.p, BlockType::NetReceive, m);
        self.p.push_block("for (int i = 0; i < count; i++)");
        self.p.add_line("int start = nrb->_displ[i];");
        self.p.add_line("int end = nrb->_displ[i+1];");
        self.p.push_block("for (int j = start; j < end; j++)");
        self.p.add_multi_line(
            r#"
            int index = nrb->_nrb_index[j];
            int offset = nrb->_pnt_index[index];
            double t = nrb->_nrb_t[index];
            int weight_index = nrb->_weight_index[index];
            double flag = nrb->_nrb_flag[index];
            Point_process* point_process = nt->pntprocs + offset;
            "#,
        );
        self.p.add_line(format!(
            "{}(t, point_process, inst, nt, ml, weight_index, flag);",
            self.method_name("net_receive_kernel")
        ));
        self.p.pop_block();
        self.p.pop_block();
        backend.device_stream_wait(&mut self.p);
        self.p.add_line("nrb->_displ_cnt = 0;");
        self.p.add_line("nrb->_cnt = 0;");
        if m.net_send_used || m.net_event_used {
            self.print_send_event_move();
        }
        backend.data_present_end(&mut self.p, m);
        self.p.pop_block();
    }

    // ── WATCH ──

    /// Arms the WATCH slots of an instance; called from NET_RECEIVE.
    pub fn print_watch_activate(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        if !m.is_watch_used() {
            return Ok(());
        }
        let ctx = EmissionContext::kernel(BlockType::Watch);
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "static void nrn_watch_activate({}* inst, int id, int pnodecount, int watch_id, double v, bool &watch_remove)",
            self.instance_struct()
        ));
        self.p.push_block("if (watch_remove == false)");
        for i in 0..m.watch_statements.len() {
            let slot = self.name(&watch_slot(i), &ctx);
            self.p.add_line(format!("{} = 0;", slot));
        }
        self.p.add_line("watch_remove = true;");
        self.p.pop_block();
        for (i, watch) in m.watch_statements.iter().enumerate() {
            let Some(clause) = watch.clauses.first() else {
                continue;
            };
            let slot = self.name(&watch_slot(i), &ctx);
            let cond = self.expr(&clause.cond, &ctx)?;
            self.p.push_block(format!("if (watch_id == {})", i));
            self.p.add_line(format!("{} = 2 + ({});", slot, cond));
            self.p.pop_block();
        }
        self.p.pop_block();
        Ok(())
    }

    /// Rising-edge detection of the armed WATCH conditions. The first
    /// statement that fires clears `watch_untriggered`, so later ones wait
    /// for the next step.
    pub fn print_watch_check(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        if !m.is_watch_used() {
            return Ok(());
        }
        let ctx = EmissionContext::kernel(BlockType::Watch);
        let method = self.method_name("nrn_watch_check");
        self.p.add_newlines(2);
        self.p.add_line("/** routine to check watch activation */");
        self.kernel_prologue(BlockType::Watch, &method);
        let backend = self.backend;
        backend.parallel_hint(&mut self.p, BlockType::Watch, m);
        self.p.push_block("for (int id = 0; id < nodecount; id++)");
        let voltage_used = m.watch_statements.iter().any(|w| {
            w.clauses.first().is_some_and(|c| {
                let mut found = false;
                c.cond.walk(&mut |e| {
                    if matches!(e, Expr::Name(id) if id.name == "v") {
                        found = true;
                    }
                });
                found
            })
        });
        if voltage_used {
            self.print_voltage(&ctx);
        }
        self.p.add_line("bool watch_untriggered = true;");
        let tqitem = self.name(TQITEM, &ctx);
        let point_process = self.name(POINT_PROCESS, &ctx);
        let t = self.name("t", &ctx);
        for (i, watch) in m.watch_statements.iter().enumerate() {
            let Some(clause) = watch.clauses.first() else {
                continue;
            };
            let slot = self.name(&watch_slot(i), &ctx);
            let cond = self.expr(&clause.cond, &ctx)?;
            let flag = self.expr(&clause.flag, &ctx)?;
            self.p
                .push_block(format!("if ({}&2 && watch_untriggered)", slot));
            self.p.push_block(format!("if ({})", cond));
            self.p.push_block(format!("if (({}&1) == 0)", slot));
            self.p.add_line("watch_untriggered = false;");
            self.p.add_line(format!(
                "net_send_buffering(nt, ml->_net_send_buffer, 0, {}, -1, {}, {}+0.0, {});",
                tqitem, point_process, t, flag
            ));
            self.p.pop_block();
            self.p.add_line(format!("{} = 3;", slot));
            self.p.chain_block("else");
            self.p.add_line(format!("{} = 2;", slot));
            self.p.pop_block();
            self.p.pop_block();
        }
        self.p.pop_block();
        self.print_send_event_move();
        self.kernel_epilogue(BlockType::Watch, &method);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AccBackend, BackendPolicy, CppBackend};
    use crate::calls::classify;
    use crate::layout;
    use crate::model::{build, ModelFile};
    use crate::resolve::{Resolver, Style};

    fn render(
        json: &str,
        backend: &dyn BackendPolicy,
        f: impl FnOnce(&mut Session<'_>) -> Result<(), Diagnostic>,
    ) -> String {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        let resolver = Resolver::new(&metadata, &plan, Style::Coreneuron).expect("resolver");
        let mut s = Session::new(&metadata, &plan, &calls, &resolver, backend);
        f(&mut s).expect("emit");
        s.finish()
    }

    const SYNAPSE: &str = r#"{
        "mod_file": "syn", "suffix": "Syn", "point_process": true,
        "variables": [
            {"name": "gs", "kinds": ["state"]},
            {"name": "i", "kinds": ["range", "assigned"]},
            {"name": "thresh", "kinds": ["range", "parameter"], "value": -20}
        ],
        "currents": ["i"],
        "blocks": {
            "breakpoint": "i = gs * v",
            "net_receive": {
                "params": ["w", "unused"],
                "body": "gs = gs + w WATCH (v > thresh) 2 WATCH (gs > 1) 3 net_event(t)",
                "initial": "w = 0"
            }
        }
    }"#;

    #[test]
    fn receive_kernel_binds_used_parameters_only() {
        let text = render(SYNAPSE, &CppBackend, |s| s.print_net_receive_kernel());
        assert!(text.contains(
            "static inline void net_receive_kernel_Syn(double t, Point_process* pnt, Syn_Instance* inst, NrnThread* nt, Memb_list* ml, int weight_index, double flag) {"
        ));
        assert!(text.contains("    double* w = weights + weight_index + 0;\n"));
        assert!(!text.contains("double* unused"));
        assert!(text.contains("    inst->tsave[id] = t;\n    bool watch_remove = false;\n"));
        assert!(text.contains("    inst->gs[id] = inst->gs[id] + (*w);\n"));
        assert!(text.contains("nrn_watch_activate(inst, id, pnodecount, 1, v, watch_remove);"));
        assert!(text.contains("int node_id = ml->nodeindices[id];"));
    }

    #[test]
    fn watch_check_triggers_once_per_step() {
        let text = render(SYNAPSE, &CppBackend, |s| s.print_watch_check());
        assert_eq!(text.matches("watch_untriggered = false;").count(), 2);
        assert!(text.contains("    bool watch_untriggered = true;\n"));
        assert!(text.contains("if (inst->watch1[4*pnodecount+id]&2 && watch_untriggered) {"));
        assert!(text.contains("if (inst->watch2[5*pnodecount+id]&2 && watch_untriggered) {"));
        assert!(text.contains("} else {\n"));
        assert!(text.contains("nsb->_cnt = 0;"));
    }

    #[test]
    fn watch_activate_uses_first_condition() {
        let text = render(SYNAPSE, &CppBackend, |s| s.print_watch_activate());
        assert!(text.contains("        inst->watch1[4*pnodecount+id] = 0;\n"));
        assert!(text.contains(
            "    if (watch_id == 0) {\n        inst->watch1[4*pnodecount+id] = 2 + (v > inst->thresh[id]);\n    }\n"
        ));
    }

    #[test]
    fn buffered_delivery_flushes_events() {
        let text = render(SYNAPSE, &CppBackend, |s| {
            s.print_net_receive_front_end();
            s.print_net_buf_receive();
            Ok(())
        });
        assert!(text.contains("static void net_receive_Syn(Point_process* pnt, int weight_index, double flag) {"));
        assert!(text.contains("realloc_net_receive_buffer(nt, ml);"));
        assert!(text.contains("void net_buf_receive_Syn(NrnThread* nt) {"));
        assert!(text.contains("net_receive_kernel_Syn(t, point_process, inst, nt, ml, weight_index, flag);"));
        assert!(text.contains("net_sem_from_gpu(type, vdata_index, weight_index, tid, point_index, t, flag);"));
    }

    #[test]
    fn device_send_buffer_is_not_grown() {
        let cpu = render(SYNAPSE, &CppBackend, |s| {
            s.print_net_send_buffering();
            Ok(())
        });
        assert!(cpu.contains("static inline void net_send_buffering("));
        assert!(cpu.contains("nsb->grow();"));
        let acc = render(SYNAPSE, &AccBackend, |s| {
            s.print_net_send_buffering();
            Ok(())
        });
        assert!(!acc.contains("nsb->grow();"));
        assert!(acc.contains("nrn_pragma_acc(atomic capture)"));
    }

    #[test]
    fn net_init_renames_parameters() {
        let text = render(SYNAPSE, &CppBackend, |s| s.print_net_init());
        assert!(text.contains("static void net_init(Point_process* pnt, int weight_index, double flag) {"));
        assert!(text.contains("    NrnThread* nt = nrn_threads + tid;\n"));
        assert!(text.contains("    (*w) = 0;\n"));
        assert!(text.contains("auto& nsb = ml->_net_send_buffer;"));
    }
}
