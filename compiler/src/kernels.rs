// kernels.rs — Per-instance compute kernels
//
// `nrn_init`, `nrn_cur` (with `nrn_current_{suffix}` for the finite
// difference path), `nrn_state`, BEFORE/AFTER kernels and the host-only
// constructor/destructor hooks.
//
// Preconditions: the session's layout plan and resolver belong to the same
//                metadata.
// Postconditions: every kernel closes all blocks it opens; matrix updates of
//                 point processes only reach `vec_rhs`/`vec_d` through the
//                 reduction pass.
// Failure modes: E0108 from INITIAL concentration writes, E0200 from atomic
//                updates, statement emission errors.
// Side effects: appends to the session printer only.

use crate::ast::StatementBlock;
use crate::backend::BlockType;
use crate::diag::Diagnostic;
use crate::emit::{Session, ShadowUseStatement, INTERNAL_ARGS};
use crate::layout::{NODE_AREA, TSAVE};
use crate::model::{BeforeAfter, BeforeAfterKind};
use crate::resolve::{EmissionContext, Style};

/// Voltage perturbation of the finite-difference conductance estimate.
pub const FD_PERTURBATION: &str = "0.001";

impl<'a> Session<'a> {
    // ── nrn_init ──

    /// Instance initialisation. Runs INITIAL for every instance unless the
    /// runtime skips model initialisation.
    pub fn print_nrn_init(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let backend = self.backend;
        let ctx = EmissionContext::kernel(BlockType::Initial);
        let method = self.method_name("nrn_init");

        self.p.add_newlines(2);
        self.p.add_line("/** initialize channel */");
        self.kernel_prologue(BlockType::Initial, &method);
        if m.derivimplicit_used() {
            let list = self.plan.thread.derivimplicit_list_num;
            let equations = m.num_equations;
            self.p.add_newline();
            self.p
                .add_line(format!("int& deriv_advance_flag = *deriv{}_advance(thread);", list));
            self.p.add_line("deriv_advance_flag = 0;");
            backend.deriv_advance_flag_update(&mut self.p);
            self.p.add_line(format!("auto ns = newtonspace{}(thread);", list));
            self.p.add_line(format!("auto& th = thread[dith{}()];", list));
            self.p.push_block("if (*ns == nullptr)");
            self.p.add_line(format!(
                "int vec_size = 2*{}*pnodecount*sizeof(double);",
                equations
            ));
            self.p.add_line("double* vec = makevector(vec_size);");
            self.p.add_line("th.pval = vec;");
            self.p
                .add_line(format!("*ns = nrn_cons_newtonspace({}, pnodecount);", equations));
            self.p.pop_block();
        }
        // globals may have been changed from hoc or python
        backend.global_device_update(&mut self.p, m);

        self.p.push_block("if (_nrn_skip_initmodel == 0)");
        let dt = self.name("dt", &ctx);
        if let Some(changed) = &m.changed_dt {
            self.p.add_line(format!("double _save_prev_dt = {};", dt));
            self.p.add_line(format!("{} = {};", dt, changed));
        }
        self.begin_loop(BlockType::Initial);
        if m.net_receive.is_some() {
            let tsave = self.name(TSAVE, &ctx);
            self.p.add_line(format!("{} = -1e20;", tsave));
        }
        if m.artificial_cell {
            self.p.add_line("double v = 0.0;");
        } else {
            self.print_voltage(&ctx);
        }
        self.print_ion_reads(BlockType::Initial, &ctx);
        if let Some(initial) = &m.initial {
            self.block(initial, &ctx)?;
        }
        self.print_ion_writes(BlockType::Initial, &ctx)?;
        self.end_loop();
        if m.changed_dt.is_some() {
            self.p.add_line(format!("{} = _save_prev_dt;", dt));
        }
        self.p.pop_block();

        if m.derivimplicit_used() {
            self.p.add_line("deriv_advance_flag = 1;");
            backend.deriv_advance_flag_update(&mut self.p);
        }
        if m.net_send_used && !m.artificial_cell {
            self.print_send_event_move();
        }
        self.kernel_epilogue(BlockType::Initial, &method);
        Ok(())
    }

    // ── nrn_cur ──

    /// Routine parameters with `v` last, so callers can perturb it.
    fn nrn_current_params(&self) -> String {
        match self.resolver.style() {
            Style::Coreneuron => self.internal_params(),
            Style::Neuron => format!("{}, double v", self.internal_params()),
        }
    }

    fn nrn_current_args(&self) -> String {
        match self.resolver.style() {
            Style::Coreneuron => INTERNAL_ARGS.to_string(),
            Style::Neuron => format!("{}, v", self.internal_args()),
        }
    }

    /// Total current as a function of `v`, used twice by the finite
    /// difference path.
    pub fn print_nrn_current(&mut self, breakpoint: &StatementBlock) -> Result<(), Diagnostic> {
        let ctx = EmissionContext::kernel(BlockType::Equation);
        let fq = self.backend.function_qualifier();
        self.p.add_newlines(2);
        self.p.push_block(format!(
            "{}double {}({})",
            fq,
            self.method_name("nrn_current"),
            self.nrn_current_params()
        ));
        self.p.add_line("double current = 0.0;");
        self.block(breakpoint, &ctx)?;
        let m = self.metadata;
        for current in &m.currents {
            let name = self.name(current, &ctx);
            self.p.add_line(format!("current += {};", name));
        }
        self.p.add_line("return current;");
        self.p.pop_block();
        Ok(())
    }

    /// Declared conductances: one pass through BREAKPOINT, `rhs` and `g`
    /// summed from the declared names.
    pub(crate) fn print_nrn_cur_conductance(
        &mut self,
        breakpoint: &StatementBlock,
        ctx: &EmissionContext<'_>,
    ) -> Result<(), Diagnostic> {
        let m = self.metadata;
        self.block(breakpoint, ctx)?;
        if !m.currents.is_empty() {
            let rhs: Vec<String> = m.currents.iter().map(|c| self.name(c, ctx)).collect();
            self.p.add_line(format!("double rhs = {};", rhs.join("+")));
        }
        let g: Vec<String> = m
            .conductances
            .iter()
            .map(|c| self.name(&c.variable, ctx))
            .collect();
        self.p.add_line(format!("double g = {};", g.join("+")));
        for conductance in &m.conductances {
            let Some(ion) = &conductance.ion else {
                continue;
            };
            let statement = ShadowUseStatement {
                lhs: self.name(&format!("ion_di{}dv", ion), ctx),
                op: "+=",
                rhs: self.name(&conductance.variable, ctx),
            };
            self.shadow_update(&statement, BlockType::Equation)?;
        }
        Ok(())
    }

    /// No declared conductances: `g` is estimated from the current at
    /// `v+0.001` and at `v`.
    pub(crate) fn print_nrn_cur_finite_difference(&mut self, ctx: &EmissionContext<'_>) -> Result<(), Diagnostic> {
        let m = self.metadata;
        let current = self.method_name("nrn_current");
        self.p.add_line(format!(
            "double g = {}({}+{});",
            current, self.nrn_current_args(), FD_PERTURBATION
        ));
        for ion in &m.ions {
            for var in ion.writes.iter().filter(|v| ion.is_ionic_current(v)) {
                let name = self.name(var, ctx);
                self.p.add_line(format!("double di{} = {};", ion.name, name));
            }
        }
        self.p
            .add_line(format!("double rhs = {}({});", current, self.nrn_current_args()));
        self.p.add_line(format!("g = (g-rhs)/{};", FD_PERTURBATION));
        for ion in &m.ions {
            for var in ion.writes.iter().filter(|v| ion.is_ionic_current(v)) {
                let mut rhs = format!("(di{}-{})/{}", ion.name, self.name(var, ctx), FD_PERTURBATION);
                if m.point_process {
                    rhs.push_str(&format!("*1.e2/{}", self.name(NODE_AREA, ctx)));
                }
                let statement = ShadowUseStatement {
                    lhs: self.name(&format!("ion_di{}dv", ion.name), ctx),
                    op: "+=",
                    rhs,
                };
                self.shadow_update(&statement, BlockType::Equation)?;
            }
        }
        Ok(())
    }

    /// Operators applied to `vec_rhs` and `vec_d`; flipped for electrode
    /// currents.
    pub(crate) fn matrix_operators(&self) -> (char, char) {
        if self.metadata.electrode_current {
            ('+', '-')
        } else {
            ('-', '+')
        }
    }

    fn print_fast_imem(&mut self, rhs: &str, d: &str, in_reduction: bool) -> Result<(), Diagnostic> {
        let m = self.metadata;
        if !m.electrode_current {
            return Ok(());
        }
        let backend = self.backend;
        let (rhs_op, d_op) = self.matrix_operators();
        self.p.push_block("if (nt->nrn_fast_imem)");
        if in_reduction {
            backend.begin_reduction(&mut self.p, m);
            self.p.add_line("int node_id = node_index[id];");
            backend.reduction_update(&mut self.p, "nt->nrn_fast_imem->nrn_sav_rhs[node_id]", rhs_op, rhs)?;
            backend.reduction_update(&mut self.p, "nt->nrn_fast_imem->nrn_sav_d[node_id]", d_op, d)?;
            backend.end_reduction(&mut self.p, m);
        } else {
            self.p.add_line(format!(
                "nt->nrn_fast_imem->nrn_sav_rhs[node_id] {}= {};",
                rhs_op, rhs
            ));
            self.p
                .add_line(format!("nt->nrn_fast_imem->nrn_sav_d[node_id] {}= {};", d_op, d));
        }
        self.p.pop_block();
        Ok(())
    }

    /// Current kernel. Point processes park `rhs`/`g` in the shadow arrays
    /// and a second loop folds them into the matrix.
    pub fn print_nrn_cur(&mut self) -> Result<(), Diagnostic> {
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
        let shadowed = backend.requires_shadow_reduction(BlockType::Equation, m);
        let (rhs_op, d_op) = self.matrix_operators();

        self.p.add_newlines(2);
        self.p.add_line("/** update current */");
        self.kernel_prologue(BlockType::Equation, &method);
        self.begin_loop(BlockType::Equation);
        self.print_voltage(&ctx);
        self.print_ion_reads(BlockType::Equation, &ctx);
        if m.conductances.is_empty() {
            self.print_nrn_cur_finite_difference(&ctx)?;
        } else {
            self.print_nrn_cur_conductance(breakpoint, &ctx)?;
        }
        self.print_ion_writes(BlockType::Equation, &ctx)?;
        if m.point_process {
            let area = self.name(NODE_AREA, &ctx);
            self.p.add_line(format!("double mfactor = 1.e2/{};", area));
            self.p.add_line("g = g*mfactor;");
            self.p.add_line("rhs = rhs*mfactor;");
        }
        self.print_g_unused(&ctx);
        if shadowed {
            self.p.add_line("shadow_rhs[id] = rhs;");
            self.p.add_line("shadow_d[id] = g;");
        } else {
            self.p.add_line(format!("vec_rhs[node_id] {}= rhs;", rhs_op));
            self.p.add_line(format!("vec_d[node_id] {}= g;", d_op));
            self.print_fast_imem("rhs", "g", false)?;
        }
        self.end_loop();

        if shadowed {
            backend.begin_reduction(&mut self.p, m);
            self.p.add_line("int node_id = node_index[id];");
            backend.reduction_update(&mut self.p, "vec_rhs[node_id]", rhs_op, "shadow_rhs[id]")?;
            backend.reduction_update(&mut self.p, "vec_d[node_id]", d_op, "shadow_d[id]")?;
            backend.end_reduction(&mut self.p, m);
            self.print_fast_imem("shadow_rhs[id]", "shadow_d[id]", true)?;
        }
        self.kernel_epilogue(BlockType::Equation, &method);
        Ok(())
    }

    // ── nrn_state ──

    pub fn print_nrn_state(&mut self) -> Result<(), Diagnostic> {
        let m = self.metadata;
        if !m.nrn_state_required() {
            return Ok(());
        }
        let ctx = EmissionContext::kernel(BlockType::State);
        let method = self.method_name("nrn_state");
        self.p.add_newlines(2);
        self.p.add_line("/** update state */");
        self.kernel_prologue(BlockType::State, &method);
        self.begin_loop(BlockType::State);
        self.print_voltage(&ctx);
        self.print_ion_reads(BlockType::State, &ctx);
        if let Some(state) = &m.nrn_state {
            self.block(state, &ctx)?;
        }
        // no current to compute: BREAKPOINT is only bookkeeping
        if let (true, Some(breakpoint)) = (m.currents.is_empty(), &m.breakpoint) {
            self.block(breakpoint, &ctx)?;
        }
        self.print_ion_writes(BlockType::State, &ctx)?;
        self.end_loop();
        self.kernel_epilogue(BlockType::State, &method);
        Ok(())
    }

    // ── BEFORE / AFTER ──

    pub fn print_before_after(&mut self, index: usize, block: &BeforeAfter) -> Result<(), Diagnostic> {
        let ctx = EmissionContext::kernel(BlockType::BeforeAfter);
        let method = self.method_name(&format!("nrn_before_after_{}", index));
        let kind = match block.kind {
            BeforeAfterKind::Before => "BEFORE",
            BeforeAfterKind::After => "AFTER",
        };
        self.p.add_newlines(2);
        self.p.add_line(format!(
            "/** {} of block type {} # {} */",
            kind,
            block.attach.as_str(),
            index
        ));
        self.kernel_prologue(BlockType::BeforeAfter, &method);
        self.begin_loop(BlockType::BeforeAfter);
        self.print_voltage(&ctx);
        self.print_ion_reads(BlockType::Equation, &ctx);
        self.block(&block.body, &ctx)?;
        self.print_ion_writes(BlockType::Equation, &ctx)?;
        self.end_loop();
        self.kernel_epilogue(BlockType::BeforeAfter, &method);
        Ok(())
    }

    // ── CONSTRUCTOR / DESTRUCTOR ──

    fn print_lifecycle(&mut self, block: BlockType, body: Option<&StatementBlock>) -> Result<(), Diagnostic> {
        let name = match block {
            BlockType::Destructor => "nrn_destructor",
            _ => "nrn_constructor",
        };
        let method = self.method_name(name);
        let ctx = EmissionContext::kernel(block);
        self.p.add_newlines(2);
        self.kernel_prologue(block, &method);
        if let Some(body) = body {
            self.block(body, &ctx)?;
        }
        self.kernel_epilogue(block, &method);
        Ok(())
    }

    /// CONSTRUCTOR body; only compiled for the NEURON-coupled build.
    pub fn print_nrn_constructor(&mut self) -> Result<(), Diagnostic> {
        let body = self.metadata.constructor.as_ref();
        self.print_lifecycle(BlockType::Constructor, body)
    }

    pub fn print_nrn_destructor(&mut self) -> Result<(), Diagnostic> {
        let body = self.metadata.destructor.as_ref();
        self.print_lifecycle(BlockType::Destructor, body)
    }
}
