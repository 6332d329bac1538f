// emit.rs — Shared emission session and statement printer
//
// A `Session` owns one `CodePrinter` and borrows everything derived once per
// model (metadata, layout, call table, resolver). It prints statement blocks,
// expressions, ion bookkeeping and the kernel prologue every compute kernel
// shares. Platform differences are delegated to the session's backend.
//
// Preconditions: the resolver was built from the same metadata and plan.
// Postconditions: every printed kernel is complete; errors abort the
//                 session and the partial text is discarded by the caller.
// Failure modes: E0109 (call arity), E0108 (concentration write),
//                E0200 (atomic operator) propagate as `Diagnostic`.
// Side effects: appends to the session printer only.

use crate::ast::{BinaryOp, Call, Expr, Stmt, StatementBlock, UnaryOp, WatchStmt};
use crate::backend::{BackendPolicy, BlockType};
use crate::calls::{CallKind, CallTable};
use crate::diag::{codes, Diagnostic};
use crate::layout::{LayoutPlan, CONDUCTANCE_UNUSED, NODE_AREA, POINT_PROCESS, TQITEM, VOLTAGE_UNUSED};
use crate::model::ModelMetadata;
use crate::printer::CodePrinter;
use crate::resolve::{EmissionContext, Resolver, Style};

/// Argument list of the derivimplicit solve and VERBATIM `_threadargs_`.
pub const EXTERNAL_ARGS: &str = "id, pnodecount, data, indexes, thread, nt, ml, v";

/// Parameters matching `EXTERNAL_ARGS`.
pub const EXTERNAL_PARAMS: &str =
    "int id, int pnodecount, double* data, Datum* indexes, ThreadDatum* thread, NrnThread* nt, Memb_list* ml, double v";

/// Argument list every model routine receives first.
pub const INTERNAL_ARGS: &str = "id, pnodecount, inst, data, indexes, thread, nt, v";

// ── Deferred writes ──────────────────────────────────────────────────────

/// A write that may have to go through an atomic or shadow update.
/// With an empty `op`, `lhs` is a complete statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowUseStatement {
    pub lhs: String,
    pub op: &'static str,
    pub rhs: String,
}

impl ShadowUseStatement {
    fn new(lhs: String, op: &'static str, rhs: String) -> Self {
        ShadowUseStatement { lhs, op, rhs }
    }

    fn raw(statement: String) -> Self {
        ShadowUseStatement {
            lhs: statement,
            op: "",
            rhs: String::new(),
        }
    }
}

// ── Session ──────────────────────────────────────────────────────────────

pub struct Session<'a> {
    pub metadata: &'a ModelMetadata,
    pub plan: &'a LayoutPlan,
    pub calls: &'a CallTable,
    pub resolver: &'a Resolver<'a>,
    pub backend: &'a dyn BackendPolicy,
    pub p: CodePrinter,
    /// Lexical scopes of LOCALs and routine parameters: (name, spelling).
    scopes: Vec<Vec<(String, String)>>,
}

/// Slot numbered by `model::build`; only NET_RECEIVE and INITIAL get one.
fn watch_slot_of(watch: &WatchStmt) -> Result<usize, Diagnostic> {
    watch.slot.ok_or_else(|| {
        Diagnostic::error(codes::E0110, format!("WATCH {} has no watch slot", watch_clauses(watch)))
            .with_span(watch.span)
            .with_hint("WATCH statements belong in NET_RECEIVE or INITIAL")
    })
}

fn watch_clauses(watch: &WatchStmt) -> String {
    watch
        .clauses
        .iter()
        .map(|c| format!("({}) {}", c.cond, c.flag))
        .collect::<Vec<_>>()
        .join(", ")
}

impl<'a> Session<'a> {
    pub fn new(
        metadata: &'a ModelMetadata,
        plan: &'a LayoutPlan,
        calls: &'a CallTable,
        resolver: &'a Resolver<'a>,
        backend: &'a dyn BackendPolicy,
    ) -> Self {
        Session {
            metadata,
            plan,
            calls,
            resolver,
            backend,
            p: CodePrinter::new(),
            scopes: Vec::new(),
        }
    }

    /// Fresh session on the same model with another policy.
    pub fn fork(&self, backend: &'a dyn BackendPolicy) -> Session<'a> {
        Session::new(self.metadata, self.plan, self.calls, self.resolver, backend)
    }

    pub fn finish(self) -> String {
        self.p.finish()
    }

    pub fn suffix(&self) -> &str {
        &self.metadata.mod_suffix
    }

    pub fn method_name(&self, name: &str) -> String {
        self.resolver.method_name(name)
    }

    pub fn instance_struct(&self) -> String {
        self.resolver.instance_struct()
    }

    // ── Names ──

    /// Spelling of `name`: scoped locals, backend renames, then the resolver.
    pub fn name(&self, name: &str, ctx: &EmissionContext<'_>) -> String {
        for scope in self.scopes.iter().rev() {
            if let Some((_, spelling)) = scope.iter().rev().find(|(n, _)| n == name) {
                return spelling.clone();
            }
        }
        let renamed = self.backend.rename_variable(name);
        if renamed != name {
            return renamed.to_string();
        }
        self.resolver.resolve(name, ctx)
    }

    /// Run `f` with an extra scope of (name, spelling) pairs.
    pub fn with_scope<T>(
        &mut self,
        names: Vec<(String, String)>,
        f: impl FnOnce(&mut Self) -> Result<T, Diagnostic>,
    ) -> Result<T, Diagnostic> {
        self.scopes.push(names);
        let result = f(self);
        self.scopes.pop();
        result
    }

    fn declare_local(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.push((name.to_string(), name.to_string()));
        }
    }

    // ── Parameter lists ──

    /// `int id, int pnodecount, Inst* inst, ...` with the backend qualifiers.
    pub fn internal_params(&self) -> String {
        if self.resolver.style() == Style::Neuron {
            let node_data = if self.metadata.artificial_cell {
                String::new()
            } else {
                format!("{}& node_data, ", self.resolver.node_data_struct())
            };
            return format!(
                "_nrn_mechanism_cache_range& _lmc, {}& inst, {}size_t id, Datum* _ppvar, Datum* _thread, NrnThread* nt",
                self.instance_struct(),
                node_data
            );
        }
        let q = self.backend.scalar_qualifier();
        format!(
            "int id, {q}int pnodecount, {q}{}* {q}inst, {q}double* {q}data, {q}const Datum* {q}indexes, {q}ThreadDatum* {q}thread, {q}NrnThread* {q}nt, double v",
            self.instance_struct()
        )
    }

    /// Arguments matching `internal_params`.
    pub fn internal_args(&self) -> String {
        match self.resolver.style() {
            Style::Coreneuron => INTERNAL_ARGS.to_string(),
            Style::Neuron if self.metadata.artificial_cell => {
                "_lmc, inst, id, _ppvar, _thread, nt".to_string()
            }
            Style::Neuron => "_lmc, inst, node_data, id, _ppvar, _thread, nt".to_string(),
        }
    }

    // ── Expressions ──

    pub fn expr(&self, e: &Expr, ctx: &EmissionContext<'_>) -> Result<String, Diagnostic> {
        Ok(match e {
            Expr::Integer(value, _) => value.to_string(),
            Expr::Real(lexeme, _) => self.backend.format_real(lexeme),
            Expr::Str(text, _) => format!("\"{}\"", text),
            Expr::Name(id) => self.name(&id.name, ctx),
            Expr::Indexed(id, index) => {
                format!("{}[{}]", self.name(&id.name, ctx), self.expr(index, ctx)?)
            }
            Expr::Call(call) => self.call(call, ctx)?,
            Expr::Unary(UnaryOp::Neg, operand, _) => format!("-{}", self.expr(operand, ctx)?),
            Expr::Unary(UnaryOp::Not, operand, _) => format!("!{}", self.expr(operand, ctx)?),
            Expr::Binary(lhs, BinaryOp::Pow, rhs, _) => format!(
                "pow({}, {})",
                self.expr(lhs, ctx)?,
                self.expr(rhs, ctx)?
            ),
            Expr::Binary(lhs, op, rhs, _) => format!(
                "{} {} {}",
                self.expr(lhs, ctx)?,
                op.symbol(),
                self.expr(rhs, ctx)?
            ),
            Expr::Paren(inner, _) => format!("({})", self.expr(inner, ctx)?),
        })
    }

    fn args(&self, args: &[Expr], ctx: &EmissionContext<'_>) -> Result<Vec<String>, Diagnostic> {
        args.iter().map(|a| self.expr(a, ctx)).collect()
    }

    fn check_arity(&self, call: &Call, expected: usize) -> Result<(), Diagnostic> {
        if call.args.len() == expected {
            return Ok(());
        }
        Err(Diagnostic::error(
            codes::E0109,
            format!(
                "'{}' takes {} argument(s) but {} were given",
                call.name.name,
                expected,
                call.args.len()
            ),
        )
        .with_span(call.span))
    }

    /// `weight_index` and point process expressions of an event call.
    fn event_operands(&self, ctx: &EmissionContext<'_>) -> (String, String) {
        if ctx.event_scope() {
            ("weight_index".into(), "pnt".into())
        } else {
            let pp = self.name(POINT_PROCESS, ctx);
            ("0".into(), format!("(Point_process*){}", pp))
        }
    }

    pub fn call(&self, call: &Call, ctx: &EmissionContext<'_>) -> Result<String, Diagnostic> {
        let kind = self.calls.kind(&call.name.name);
        if kind.is_event() && self.resolver.style() == Style::Neuron {
            return self.neuron_event_call(call, &kind, ctx);
        }
        match kind {
            CallKind::NetSend => {
                self.check_arity(call, 2)?;
                let args = self.args(&call.args, ctx)?;
                let tqitem = self.name(TQITEM, ctx);
                let (weight_index, pnt) = self.event_operands(ctx);
                if self.metadata.artificial_cell {
                    Ok(format!(
                        "artcell_net_send(&{}, {}, {}, nt->_t+{})",
                        tqitem,
                        weight_index,
                        pnt,
                        args.join(", ")
                    ))
                } else {
                    Ok(format!(
                        "net_send_buffering(nt, ml->_net_send_buffer, 0, {}, {}, {}, {}+{})",
                        tqitem,
                        weight_index,
                        self.name(POINT_PROCESS, ctx),
                        self.name("t", ctx),
                        args.join(", ")
                    ))
                }
            }
            CallKind::NetMove => {
                self.check_arity(call, 1)?;
                let args = self.args(&call.args, ctx)?;
                let tqitem = self.name(TQITEM, ctx);
                if self.metadata.artificial_cell {
                    Ok(format!("artcell_net_move(&{}, pnt, {})", tqitem, args.join(", ")))
                } else {
                    Ok(format!(
                        "net_send_buffering(nt, ml->_net_send_buffer, 2, {}, -1, {}, {}, 0.0)",
                        tqitem,
                        self.name(POINT_PROCESS, ctx),
                        args.join(", ")
                    ))
                }
            }
            CallKind::NetEvent => {
                self.check_arity(call, 1)?;
                let args = self.args(&call.args, ctx)?;
                if self.metadata.artificial_cell {
                    let (_, pnt) = self.event_operands(ctx);
                    Ok(format!("net_event({}, {})", pnt, args.join(", ")))
                } else {
                    Ok(format!(
                        "net_send_buffering(nt, ml->_net_send_buffer, 1, -1, -1, {}, {}, 0.0)",
                        self.name(POINT_PROCESS, ctx),
                        args.join(", ")
                    ))
                }
            }
            CallKind::Table(name) | CallKind::Method(name) => {
                if let Some(callable) = self.metadata.callable(&name) {
                    self.check_arity(call, callable.params.len())?;
                }
                let mut args = vec![self.internal_args()];
                args.extend(self.args(&call.args, ctx)?);
                Ok(format!("{}({})", self.method_name(&name), args.join(", ")))
            }
            CallKind::External(name) => {
                let args = self.args(&call.args, ctx)?;
                Ok(format!(
                    "{}({})",
                    self.backend.rename_function(&name),
                    args.join(", ")
                ))
            }
        }
    }

    /// Event builtins against the NEURON queue: the integer slots are read
    /// straight from `_ppvar`.
    fn neuron_event_call(
        &self,
        call: &Call,
        kind: &CallKind,
        ctx: &EmissionContext<'_>,
    ) -> Result<String, Diagnostic> {
        let slot = |name: &str| self.plan.position_of_int_var(name);
        let pnt = if ctx.net_receive {
            "_pnt".to_string()
        } else {
            format!("_ppvar[{}].get<Point_process*>()", slot(POINT_PROCESS)?)
        };
        let artcell = self.metadata.artificial_cell;
        match kind {
            CallKind::NetSend => {
                self.check_arity(call, 2)?;
                let args = self.args(&call.args, ctx)?;
                Ok(format!(
                    "{}(/* tqitem */ &_ppvar[{}], nullptr, {}, {} + {})",
                    if artcell { "artcell_net_send" } else { "net_send" },
                    slot(TQITEM)?,
                    pnt,
                    self.name("t", ctx),
                    args.join(", ")
                ))
            }
            CallKind::NetMove => {
                self.check_arity(call, 1)?;
                let args = self.args(&call.args, ctx)?;
                Ok(format!(
                    "{}(/* tqitem */ &_ppvar[{}], {}, {})",
                    if artcell { "artcell_net_move" } else { "net_move" },
                    slot(TQITEM)?,
                    pnt,
                    args.join(", ")
                ))
            }
            _ => {
                self.check_arity(call, 1)?;
                let args = self.args(&call.args, ctx)?;
                Ok(format!("net_event({}, {})", pnt, args.join(", ")))
            }
        }
    }

    // ── Statements ──

    /// Print the statements of `block` in a new scope (no braces).
    pub fn block(&mut self, block: &StatementBlock, ctx: &EmissionContext<'_>) -> Result<(), Diagnostic> {
        self.with_scope(Vec::new(), |s| {
            for stmt in &block.statements {
                s.statement(stmt, ctx)?;
            }
            Ok(())
        })
    }

    /// `{ ... }` nested block.
    fn braced(&mut self, header: String, block: &StatementBlock, ctx: &EmissionContext<'_>) -> Result<(), Diagnostic> {
        self.p.push_block(header);
        self.block(block, ctx)?;
        self.p.pop_block();
        Ok(())
    }

    pub fn statement(&mut self, stmt: &Stmt, ctx: &EmissionContext<'_>) -> Result<(), Diagnostic> {
        match stmt {
            Stmt::Local(vars, _) => {
                let mut decls = Vec::with_capacity(vars.len());
                for var in vars {
                    self.declare_local(&var.name.name);
                    match var.length {
                        Some(n) => decls.push(format!("{}[{}]", var.name.name, n)),
                        None => decls.push(var.name.name.clone()),
                    }
                }
                self.p.add_line(format!("double {};", decls.join(", ")));
            }
            Stmt::Assign { target, value, .. } => {
                let line = format!("{} = {};", self.expr(target, ctx)?, self.expr(value, ctx)?);
                self.p.add_line(line);
            }
            Stmt::Expr(e) => {
                if let Expr::Call(call) = e {
                    if self.backend.drops_call(&call.name.name) {
                        return Ok(());
                    }
                }
                let line = format!("{};", self.expr(e, ctx)?);
                self.p.add_line(line);
            }
            Stmt::If(s) => {
                let header = format!("if ({})", self.expr(&s.cond, ctx)?);
                self.p.push_block(header);
                self.block(&s.then_block, ctx)?;
                for (cond, body) in &s.else_ifs {
                    let header = format!("else if ({})", self.expr(cond, ctx)?);
                    self.p.chain_block(header);
                    self.block(body, ctx)?;
                }
                if let Some(body) = &s.else_block {
                    self.p.chain_block("else");
                    self.block(body, ctx)?;
                }
                self.p.pop_block();
            }
            Stmt::While { cond, body, .. } => {
                let header = format!("while ({})", self.expr(cond, ctx)?);
                self.braced(header, body, ctx)?;
            }
            Stmt::From { var, from, to, by, body, .. } => {
                let name = &var.name;
                let step = match by {
                    Some(by) => format!("{} += {}", name, self.expr(by, ctx)?),
                    None => format!("{}++", name),
                };
                let header = format!(
                    "for (int {} = {}; {} <= {}; {})",
                    name,
                    self.expr(from, ctx)?,
                    name,
                    self.expr(to, ctx)?,
                    step
                );
                let scope = vec![(name.clone(), name.clone())];
                self.with_scope(scope, |s| s.braced(header, body, ctx))?;
            }
            Stmt::Watch(watch) => {
                let index = watch_slot_of(watch)?;
                self.p.add_line(format!(
                    "nrn_watch_activate(inst, id, pnodecount, {}, v, watch_remove);",
                    index
                ));
            }
            Stmt::ForNetcon { params, body, .. } => {
                let index = self
                    .plan
                    .semantics
                    .iter()
                    .find(|s| s.name == "fornetcon")
                    .map_or(0, |s| s.index);
                self.p.add_line(format!("const size_t offset = {}*pnodecount + id;", index));
                self.p.add_line(
                    "const size_t for_netcon_start = nt->_fornetcon_perm_indices[indexes[offset]];",
                );
                self.p.add_line(
                    "const size_t for_netcon_end = nt->_fornetcon_perm_indices[indexes[offset] + 1];",
                );
                let inner = ctx.with_for_netcon(params);
                self.braced(
                    "for (auto i = for_netcon_start; i < for_netcon_end; ++i)".into(),
                    body,
                    &inner,
                )?;
            }
            Stmt::Verbatim(text, _) => self.verbatim(text, ctx),
            Stmt::DerivImplicit(name) => {
                let line = format!("{}({});", self.method_name(&name.name), EXTERNAL_ARGS);
                self.p.add_line(line);
            }
            // handled by net_init
            Stmt::Initial(_) => {}
        }
        Ok(())
    }

    // ── VERBATIM ──

    pub fn verbatim(&mut self, text: &str, ctx: &EmissionContext<'_>) {
        let ctx = if ctx.top_verbatim {
            ctx.without_instance()
        } else {
            *ctx
        };
        let processed = self.verbatim_text(text, &ctx);
        self.p.add_line("// VERBATIM");
        for line in processed.lines() {
            if !line.trim().is_empty() {
                self.p.add_line(line.trim_end());
            }
        }
        self.p.add_line("// ENDVERBATIM");
    }

    /// Rewrite identifiers of native code: thread-argument macros, model
    /// routines and model variables. String literals and member names after
    /// `.`/`->` are left alone.
    pub fn verbatim_text(&self, text: &str, ctx: &EmissionContext<'_>) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        let mut after_method = false;
        while i < chars.len() {
            let c = chars[i];
            if c == '"' {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i = (i + 1).min(chars.len());
                out.extend(&chars[start..i]);
                continue;
            }
            if c.is_ascii_digit() {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    out.push(chars[i]);
                    i += 1;
                }
                continue;
            }
            if !(c.is_ascii_alphabetic() || c == '_') {
                out.push(c);
                i += 1;
                continue;
            }
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let member = out.ends_with('.') || out.ends_with("->");
            let internal = std::mem::take(&mut after_method);
            let (args, proto) = if self.resolver.style() == Style::Neuron {
                (self.internal_args(), self.internal_params())
            } else if internal {
                (INTERNAL_ARGS.to_string(), EXTERNAL_PARAMS.to_string())
            } else {
                (EXTERNAL_ARGS.to_string(), EXTERNAL_PARAMS.to_string())
            };
            match word.as_str() {
                _ if member => out.push_str(&word),
                "_threadargs_" => out.push_str(&args),
                "_threadargscomma_" => {
                    out.push_str(&args);
                    out.push_str(", ");
                }
                "_threadargsproto_" => out.push_str(&proto),
                "_threadargsprotocomma_" => {
                    out.push_str(&proto);
                    out.push_str(", ");
                }
                _ if self.metadata.callable(&word).is_some() => {
                    out.push_str(&self.method_name(&word));
                    after_method = true;
                }
                _ => out.push_str(&self.name(&word, ctx)),
            }
        }
        out
    }

    // ── Ion bookkeeping ──

    /// `var = ion_var;` for every ion value the block reads.
    pub fn ion_read_statements(&self, block: BlockType, ctx: &EmissionContext<'_>) -> Vec<String> {
        let mut statements = Vec::new();
        for ion in &self.metadata.ions {
            let mut names: Vec<&String> = ion.reads.iter().collect();
            for var in &ion.writes {
                if ion.is_ionic_conc(var) && !names.contains(&var) {
                    names.push(var);
                }
            }
            for var in names {
                let skip = block == BlockType::State
                    && ion.is_ionic_conc(var)
                    && self.metadata.state_vars.iter().any(|s| &s.name == var);
                if skip {
                    continue;
                }
                statements.push(format!(
                    "{} = {};",
                    self.name(var, ctx),
                    self.name(&format!("ion_{}", var), ctx)
                ));
            }
        }
        statements
    }

    /// Writes back to the ion arrays, and concentration notifications in
    /// INITIAL.
    pub fn ion_write_statements(
        &self,
        block: BlockType,
        ctx: &EmissionContext<'_>,
    ) -> Result<Vec<ShadowUseStatement>, Diagnostic> {
        let mut statements = Vec::new();
        for ion in &self.metadata.ions {
            let mut concentration: Option<&str> = None;
            for var in &ion.writes {
                let lhs = self.name(&format!("ion_{}", var), ctx);
                if ion.is_ionic_current(var) {
                    if block == BlockType::Equation {
                        let mut rhs = self.name(var, ctx);
                        if self.metadata.point_process {
                            rhs.push_str(&format!("*(1.e2/{})", self.name(NODE_AREA, ctx)));
                        }
                        statements.push(ShadowUseStatement::new(lhs, "+=", rhs));
                    }
                    continue;
                }
                if !ion.is_rev_potential(var) {
                    concentration = Some(var);
                }
                statements.push(ShadowUseStatement::new(lhs, "=", self.name(var, ctx)));
            }
            if let (BlockType::Initial, Some(conc)) = (block, concentration) {
                let index = if ion.is_intra_cell_conc(conc) {
                    1
                } else if ion.is_extra_cell_conc(conc) {
                    2
                } else {
                    return Err(Diagnostic::error(
                        codes::E0108,
                        format!(
                            "ion '{}' writes '{}', which is neither its intra- nor extracellular concentration",
                            ion.name, conc
                        ),
                    )
                    .with_cause("INITIAL block", None));
                };
                if self.resolver.style() == Style::Neuron {
                    statements.extend(self.neuron_conc_write(ion, ctx)?);
                    continue;
                }
                let type_name = format!("{}_type", ion.name);
                statements.push(ShadowUseStatement::new(
                    format!("int {}", type_name),
                    "=",
                    self.name(&type_name, ctx),
                ));
                statements.push(ShadowUseStatement::raw(format!(
                    "nrn_wrote_conc({}, &({}), {}, {}, nrn_ion_global_map, {}, nt->_ml_list[{}]->_nodecount_padded)",
                    type_name,
                    self.name(&format!("ion_{}", conc), ctx),
                    index,
                    self.name(&format!("style_{}", ion.name), ctx),
                    self.name("celsius", ctx),
                    type_name
                )));
            }
        }
        Ok(statements)
    }

    /// `nrn_wrote_conc` as the NEURON ion mechanism expects it: style from
    /// the ion's dparam, then reversal potential and both concentrations.
    fn neuron_conc_write(
        &self,
        ion: &crate::model::Ion,
        ctx: &EmissionContext<'_>,
    ) -> Result<Vec<ShadowUseStatement>, Diagnostic> {
        let style = self.plan.position_of_int_var(&format!("style_{}", ion.name))?;
        let ion_value = |var: String| {
            let slot = format!("ion_{}", var);
            if self.plan.int_variable(&slot).is_some() {
                self.name(&slot, ctx)
            } else {
                self.name(&var, ctx)
            }
        };
        Ok(vec![
            ShadowUseStatement::raw(format!(
                "int _style_{} = *(_ppvar[{}].get<int*>())",
                ion.name, style
            )),
            ShadowUseStatement::raw(format!(
                "nrn_wrote_conc(_{}_sym, {}, {}, {}, _style_{})",
                ion.name,
                ion_value(ion.rev_potential_name()),
                ion_value(ion.intra_conc_name()),
                ion_value(ion.extra_conc_name()),
                ion.name
            )),
        ])
    }

    /// Print a deferred write. Accumulations into shared ion arrays of point
    /// processes are made atomic.
    pub fn shadow_update(&mut self, statement: &ShadowUseStatement, block: BlockType) -> Result<(), Diagnostic> {
        if statement.op.is_empty() {
            self.p.add_line(format!("{};", statement.lhs));
            return Ok(());
        }
        let shared = block == BlockType::Equation && self.metadata.point_process;
        match statement.op {
            "+=" | "-=" if shared => {
                let op = if statement.op == "+=" { '+' } else { '-' };
                self.backend
                    .emit_atomic_update(&mut self.p, &statement.lhs, op, &statement.rhs)
            }
            op => {
                self.p
                    .add_line(format!("{} {} {};", statement.lhs, op, statement.rhs));
                Ok(())
            }
        }
    }

    pub fn print_ion_reads(&mut self, block: BlockType, ctx: &EmissionContext<'_>) {
        for line in self.ion_read_statements(block, ctx) {
            self.p.add_line(line);
        }
    }

    pub fn print_ion_writes(&mut self, block: BlockType, ctx: &EmissionContext<'_>) -> Result<(), Diagnostic> {
        for statement in self.ion_write_statements(block, ctx)? {
            self.shadow_update(&statement, block)?;
        }
        Ok(())
    }

    // ── Kernel scaffolding ──

    pub fn print_v_unused(&mut self, ctx: &EmissionContext<'_>) {
        if !self.metadata.vectorize {
            return;
        }
        let line = format!("{} = v;", self.name(VOLTAGE_UNUSED, ctx));
        self.p.add_line("#if NRN_PRCELLSTATE");
        self.p.add_line(line);
        self.p.add_line("#endif");
    }

    pub fn print_g_unused(&mut self, ctx: &EmissionContext<'_>) {
        if !self.metadata.vectorize {
            return;
        }
        let line = format!("{} = g;", self.name(CONDUCTANCE_UNUSED, ctx));
        self.p.add_line("#if NRN_PRCELLSTATE");
        self.p.add_line(line);
        self.p.add_line("#endif");
    }

    /// `node_id`, `v` and its `NRN_PRCELLSTATE` copy.
    pub fn print_voltage(&mut self, ctx: &EmissionContext<'_>) {
        self.p.add_line("int node_id = node_index[id];");
        self.p.add_line("double v = voltage[node_id];");
        self.print_v_unused(ctx);
    }

    /// Signature and local views shared by every compute kernel. Leaves one
    /// block open (two with a data-present region).
    pub fn kernel_prologue(&mut self, block: BlockType, method: &str) {
        let backend = self.backend;
        let signature = backend.kernel_signature(method, block, &self.instance_struct());
        self.p.push_block(signature);
        let host_only = matches!(block, BlockType::Constructor | BlockType::Destructor);
        if host_only {
            self.p.add_line("#ifndef CORENEURON_BUILD");
        } else {
            backend.data_present_begin(&mut self.p, self.metadata);
        }
        let q = backend.scalar_qualifier();
        let r = backend.pointer_qualifier();
        self.p.add_line(format!("{q}int nodecount = ml->nodecount;"));
        self.p.add_line(format!("{q}int pnodecount = ml->_nodecount_padded;"));
        self.p.add_line(format!("{q}const int* {r}node_index = ml->nodeindices;"));
        self.p.add_line(format!("{q}double* {r}data = ml->data;"));
        self.p.add_line(format!("{q}const double* {r}voltage = nt->_actual_v;"));
        if block == BlockType::Equation {
            self.p.add_line(format!("{q}double* {r}vec_rhs = nt->_actual_rhs;"));
            self.p.add_line(format!("{q}double* {r}vec_d = nt->_actual_d;"));
            if backend.requires_shadow_reduction(block, self.metadata) {
                backend.shadow_variables(&mut self.p, self.metadata);
            }
        }
        self.p.add_line(format!("{q}Datum* {r}indexes = ml->pdata;"));
        self.p.add_line(format!("{q}ThreadDatum* {r}thread = ml->_thread;"));
        if block == BlockType::Initial && backend.setup_instance_in_kernel() {
            self.p.add_newline();
            self.p.add_line("setup_instance(nt, ml);");
        }
        if backend.kernel_fetches_instance() {
            let line = format!(
                "auto* const inst = static_cast<{}*>(ml->instance);",
                self.instance_struct()
            );
            self.p.add_line(line);
        }
        self.p.add_newline();
    }

    /// Close what `kernel_prologue` opened.
    pub fn kernel_epilogue(&mut self, block: BlockType, method: &str) {
        if matches!(block, BlockType::Constructor | BlockType::Destructor) {
            self.p.add_line("#endif");
        } else {
            self.backend.data_present_end(&mut self.p, self.metadata);
        }
        self.p.pop_block();
        self.backend.after_compute_kernel(&mut self.p, method, block);
    }

    /// Tiling, parallel hint and the per-instance loop header.
    pub fn begin_loop(&mut self, block: BlockType) {
        self.backend.tiling(&mut self.p, block);
        self.backend.parallel_hint(&mut self.p, block, self.metadata);
        self.backend.begin_iteration(&mut self.p, block);
    }

    pub fn end_loop(&mut self) {
        self.backend.end_iteration(&mut self.p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CppBackend, CudaBackend, IspcBackend};
    use crate::calls::classify;
    use crate::layout;
    use crate::model::{build, ModelFile};
    use crate::parser::parse_block;
    use crate::resolve::Style;

    struct Fixture {
        metadata: ModelMetadata,
        plan: LayoutPlan,
        calls: CallTable,
    }

    fn fixture(json: &str) -> Fixture {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        let metadata = build(&file).expect("valid model");
        let plan = layout::plan(&metadata);
        let calls = classify(&metadata);
        Fixture { metadata, plan, calls }
    }

    fn print(fx: &Fixture, backend: &dyn BackendPolicy, source: &str, ctx: EmissionContext<'_>) -> Result<String, Diagnostic> {
        let resolver = Resolver::new(&fx.metadata, &fx.plan, Style::Coreneuron)?;
        let mut s = Session::new(&fx.metadata, &fx.plan, &fx.calls, &resolver, backend);
        let block = parse_block(source).block.expect("statement block");
        s.block(&block, &ctx)?;
        Ok(s.finish())
    }

    const CHANNEL: &str = r#"{
        "mod_file": "na", "suffix": "na",
        "variables": [
            {"name": "gbar", "kinds": ["range", "parameter"], "value": 0.12},
            {"name": "ena", "kinds": ["assigned"]},
            {"name": "ina", "kinds": ["assigned"]},
            {"name": "m", "kinds": ["state"]},
            {"name": "minf", "kinds": ["range", "assigned"]}
        ],
        "ions": [{"name": "na", "reads": ["ena"], "writes": ["ina"]}],
        "blocks": {
            "breakpoint": "ina = gbar * m * (v - ena)",
            "functions": [{"name": "alpha", "params": ["x"], "body": "alpha = exp(x)"}]
        }
    }"#;

    #[test]
    fn statements_resolve_names_and_calls() {
        let fx = fixture(CHANNEL);
        let text = print(
            &fx,
            &CppBackend,
            "LOCAL a\na = alpha(v) ^ 2\nminf = a / (1 + m)",
            EmissionContext::kernel(BlockType::State),
        )
        .unwrap();
        assert_eq!(
            text,
            "double a;\n\
             a = pow(alpha_na(id, pnodecount, inst, data, indexes, thread, nt, v, v), 2);\n\
             inst->minf[id] = a / (1 + inst->m[id]);\n"
        );
    }

    #[test]
    fn control_flow_shapes() {
        let fx = fixture(CHANNEL);
        let text = print(
            &fx,
            &CppBackend,
            "IF (v > 0) { m = 1 } ELSE IF (v < -10) { m = 0 } ELSE { m = 0.5 }\nFROM i = 0 TO 2 { m = m + i }",
            EmissionContext::kernel(BlockType::State),
        )
        .unwrap();
        assert_eq!(
            text,
            "if (v > 0) {\n    inst->m[id] = 1;\n} else if (v < -10) {\n    inst->m[id] = 0;\n} else {\n    inst->m[id] = 0.5;\n}\n\
             for (int i = 0; i <= 2; i++) {\n    inst->m[id] = inst->m[id] + i;\n}\n"
        );
    }

    #[test]
    fn ispc_renames_literals_and_drops_printf() {
        let fx = fixture(CHANNEL);
        let text = print(
            &fx,
            &IspcBackend,
            "m = exp(2)\nprintf(\"x\")\nm = fabs(m) * 1",
            EmissionContext::kernel(BlockType::State),
        )
        .unwrap();
        assert_eq!(text, "inst->m[id] = vexp(2);\ninst->m[id] = abs(inst->m[id]) * 1;\n");
    }

    #[test]
    fn wrong_arity_is_e0109() {
        let fx = fixture(CHANNEL);
        let err = print(&fx, &CppBackend, "m = alpha(1, 2)", EmissionContext::kernel(BlockType::State))
            .unwrap_err();
        assert_eq!(err.code, Some(codes::E0109));
    }

    #[test]
    fn ion_reads_and_current_writes() {
        let fx = fixture(CHANNEL);
        let resolver = Resolver::new(&fx.metadata, &fx.plan, Style::Coreneuron).unwrap();
        let s = Session::new(&fx.metadata, &fx.plan, &fx.calls, &resolver, &CppBackend);
        let ctx = EmissionContext::kernel(BlockType::Equation);
        assert_eq!(
            s.ion_read_statements(BlockType::Equation, &ctx),
            vec!["inst->ena[id] = inst->ion_ena[indexes[0*pnodecount + id]];"]
        );
        let writes = s.ion_write_statements(BlockType::Equation, &ctx).unwrap();
        assert_eq!(
            writes,
            vec![ShadowUseStatement::new(
                "inst->ion_ina[indexes[1*pnodecount + id]]".into(),
                "+=",
                "inst->ina[id]".into()
            )]
        );
        assert!(s.ion_write_statements(BlockType::State, &ctx).unwrap().is_empty());
    }

    #[test]
    fn initial_concentration_write_notifies_runtime() {
        let fx = fixture(
            r#"{
            "mod_file": "cadyn", "suffix": "cadyn",
            "variables": [
                {"name": "ica", "kinds": ["assigned"]},
                {"name": "cai", "kinds": ["state"]}
            ],
            "ions": [{"name": "ca", "reads": ["ica", "cai"], "writes": ["cai"]}],
            "neuron_globals": ["celsius"],
            "blocks": {"initial": "cai = 0.0001"}
        }"#,
        );
        let resolver = Resolver::new(&fx.metadata, &fx.plan, Style::Coreneuron).unwrap();
        let mut s = Session::new(&fx.metadata, &fx.plan, &fx.calls, &resolver, &CppBackend);
        let ctx = EmissionContext::kernel(BlockType::Initial);
        s.print_ion_writes(BlockType::Initial, &ctx).unwrap();
        let text = s.finish();
        assert!(text.contains("int ca_type = inst->global->ca_type;"));
        assert!(text.contains("nrn_wrote_conc(ca_type, &(inst->ion_cai["));
        assert!(text.contains("*(inst->celsius), nt->_ml_list[ca_type]->_nodecount_padded);"));
    }

    #[test]
    fn point_process_current_accumulation_is_atomic_on_gpu() {
        let fx = fixture(
            r#"{
            "mod_file": "ksyn", "suffix": "ksyn", "point_process": true,
            "variables": [{"name": "ik", "kinds": ["assigned"]}, {"name": "ek", "kinds": ["assigned"]}],
            "ions": [{"name": "k", "reads": ["ek"], "writes": ["ik"]}],
            "blocks": {"breakpoint": "ik = 0.1 * (v - ek)"}
        }"#,
        );
        let resolver = Resolver::new(&fx.metadata, &fx.plan, Style::Coreneuron).unwrap();
        let mut s = Session::new(&fx.metadata, &fx.plan, &fx.calls, &resolver, &CudaBackend);
        let ctx = EmissionContext::kernel(BlockType::Equation);
        s.print_ion_writes(BlockType::Equation, &ctx).unwrap();
        let text = s.finish();
        assert!(text.starts_with("atomicAdd(&inst->ion_ik["), "{}", text);
        assert!(text.contains("*(1.e2/inst->node_area["));
    }

    #[test]
    fn verbatim_rewrites_thread_args_and_routines() {
        let fx = fixture(CHANNEL);
        let resolver = Resolver::new(&fx.metadata, &fx.plan, Style::Coreneuron).unwrap();
        let s = Session::new(&fx.metadata, &fx.plan, &fx.calls, &resolver, &CppBackend);
        let ctx = EmissionContext::kernel(BlockType::State);
        assert_eq!(
            s.verbatim_text("x = alpha(_threadargscomma_ 1.0); y = gbar; p->gbar = \"gbar\";", &ctx),
            "x = alpha_na(id, pnodecount, inst, data, indexes, thread, nt, v,  1.0); y = inst->gbar[id]; p->gbar = \"gbar\";"
        );
        assert_eq!(
            s.verbatim_text("f(_threadargs_)", &ctx),
            format!("f({})", EXTERNAL_ARGS)
        );
    }

    #[test]
    fn locals_shadow_model_variables() {
        let fx = fixture(CHANNEL);
        let text = print(
            &fx,
            &CppBackend,
            "LOCAL m\nm = 2\nIF (m > 1) { LOCAL gbar\ngbar = m }",
            EmissionContext::kernel(BlockType::State),
        )
        .unwrap();
        assert_eq!(text, "double m;\nm = 2;\nif (m > 1) {\n    double gbar;\n    gbar = m;\n}\n");
    }
}
