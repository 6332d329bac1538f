// resolve.rs — Variable name resolution
//
// Maps a model variable name to the access expression of the generated code:
// instance-struct field or raw data array for per-instance floats, one of
// four index patterns for integer slots, thread storage, global struct
// member, runtime variable, or the name unchanged.
//
// Preconditions: `LayoutPlan` was planned from the same `ModelMetadata`.
// Postconditions: `resolve` is a pure function of the name, the context and
//                 the plan; unclassified names pass through unchanged.
// Failure modes: building the global member list fails with E0100 when a
//                state derivative has no float slot.
// Side effects: none.

use crate::ast::Ident;
use crate::backend::BlockType;
use crate::layout::{IndexVariableInfo, LayoutPlan, POINT_PROCESS};
use crate::diag::Diagnostic;
use crate::model::ModelMetadata;

/// Spelling family of the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    /// CoreNEURON-compatible kernels (`inst->x[id]`, `indexes[..]`).
    Coreneuron,
    /// NEURON mechanism API (`inst.x[id]`, `_ppvar[..]`).
    Neuron,
}

// ── Emission context ─────────────────────────────────────────────────────

/// Where a name is printed. Immutable: nested constructs derive a new value
/// with one of the `with_*`/`in_*` builders instead of flipping flags.
#[derive(Debug, Clone, Copy)]
pub struct EmissionContext<'a> {
    /// An instance pointer `inst` is in scope.
    pub use_instance: bool,
    pub block: Option<BlockType>,
    /// Printing the NET_RECEIVE kernel: `t` is the event time parameter.
    pub net_receive: bool,
    /// Printing the INITIAL block nested in NET_RECEIVE.
    pub net_init: bool,
    /// Printing top-level VERBATIM (outside every kernel).
    pub top_verbatim: bool,
    pub net_receive_params: &'a [String],
    pub for_netcon_params: &'a [Ident],
}

impl<'a> EmissionContext<'a> {
    pub fn kernel(block: BlockType) -> Self {
        EmissionContext {
            use_instance: true,
            block: Some(block),
            net_receive: false,
            net_init: false,
            top_verbatim: false,
            net_receive_params: &[],
            for_netcon_params: &[],
        }
    }

    /// Host code without an instance in scope (registration, callbacks).
    pub fn host() -> Self {
        EmissionContext {
            use_instance: false,
            block: None,
            ..EmissionContext::kernel(BlockType::Initial)
        }
    }

    /// Body of a FUNCTION/PROCEDURE: internal arguments are in scope.
    pub fn routine() -> Self {
        EmissionContext {
            block: None,
            ..EmissionContext::kernel(BlockType::Initial)
        }
    }

    pub fn top_level_verbatim() -> Self {
        EmissionContext {
            top_verbatim: true,
            ..EmissionContext::host()
        }
    }

    pub fn in_net_receive(self, params: &'a [String]) -> Self {
        EmissionContext {
            net_receive: true,
            net_receive_params: params,
            ..self
        }
    }

    pub fn in_net_init(self, params: &'a [String]) -> Self {
        EmissionContext {
            net_init: true,
            net_receive_params: params,
            ..self
        }
    }

    pub fn with_for_netcon(self, params: &'a [Ident]) -> Self {
        EmissionContext {
            for_netcon_params: params,
            ..self
        }
    }

    pub fn without_instance(self) -> Self {
        EmissionContext {
            use_instance: false,
            ..self
        }
    }

    /// Inside `net_receive` or `net_init`, where `weight_index` and `pnt`
    /// are parameters.
    pub fn event_scope(&self) -> bool {
        self.net_receive || self.net_init
    }
}

// ── Global struct members ────────────────────────────────────────────────

/// One member of the `{suffix}_Store` struct.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalMember {
    pub name: String,
    pub c_type: &'static str,
    /// Array extents, e.g. `[3]` or `[3][201]`; empty for scalars.
    pub dims: String,
    /// Brace initializer content; `""` prints `{}`.
    pub init: String,
}

impl GlobalMember {
    fn scalar(c_type: &'static str, name: impl Into<String>, init: impl Into<String>) -> Self {
        GlobalMember {
            name: name.into(),
            c_type,
            dims: String::new(),
            init: init.into(),
        }
    }

    fn array(c_type: &'static str, name: impl Into<String>, dims: String, init: impl Into<String>) -> Self {
        GlobalMember {
            name: name.into(),
            c_type,
            dims,
            init: init.into(),
        }
    }

    /// Declaration without the trailing `;`.
    pub fn declaration(&self, qualifier: &str, initializers: bool) -> String {
        let init = if initializers {
            format!("{{{}}}", self.init)
        } else {
            String::new()
        };
        format!("{}{} {}{}{}", qualifier, self.c_type, self.name, self.dims, init)
    }
}

/// `printf("%g")` spelling used for global initial values.
pub fn format_g(value: f64) -> String {
    if value == 0.0 {
        return "0".into();
    }
    if !value.is_finite() {
        return value.to_string();
    }
    let exponent = value.abs().log10().floor() as i32;
    let sci = format!("{:.5e}", value);
    // rounding may bump the exponent (9.999995 -> 1.00000e1)
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(exponent);
    if exp < -4 || exp >= 6 {
        let mantissa = trim_fraction(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exp.abs())
    } else {
        let decimals = (5 - exp).max(0) as usize;
        trim_fraction(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Members of the global struct, in declaration order.
pub fn global_members(
    metadata: &ModelMetadata,
    plan: &LayoutPlan,
    style: Style,
) -> Result<Vec<GlobalMember>, Diagnostic> {
    let mut members = Vec::new();
    for ion in &metadata.ions {
        members.push(GlobalMember::scalar("int", format!("{}_type", ion.name), ""));
    }
    if metadata.point_process {
        members.push(GlobalMember::scalar("int", "point_type", ""));
    }
    for state in &metadata.state_vars {
        let name = format!("{}0", state.name);
        if metadata.lookup(&name).is_none() {
            members.push(GlobalMember::scalar("double", name, ""));
        }
    }
    if !metadata.vectorize {
        for var in &metadata.top_local_variables {
            if var.is_array {
                members.push(GlobalMember::array("double", &var.name, format!("[{}]", var.length), ""));
            } else {
                members.push(GlobalMember::scalar("double", &var.name, ""));
            }
        }
    }
    if !metadata.thread_variables.is_empty() {
        members.push(GlobalMember::scalar("int", "thread_data_in_use", ""));
        members.push(GlobalMember::array(
            "double",
            "thread_data",
            format!("[{}]", plan.thread.thread_var_data_size),
            "",
        ));
    }
    if style == Style::Coreneuron {
        members.push(GlobalMember::scalar("int", "reset", ""));
        members.push(GlobalMember::scalar("int", "mech_type", ""));
    }
    for var in metadata.global_variables.iter().chain(&metadata.constant_variables) {
        if var.is_array {
            members.push(GlobalMember::array("double", &var.name, format!("[{}]", var.length), ""));
        } else {
            members.push(GlobalMember::scalar(
                "double",
                &var.name,
                format_g(var.value.unwrap_or(0.0)),
            ));
        }
    }
    if plan.primes_size > 0 && style == Style::Coreneuron {
        let mut slist = Vec::new();
        let mut dlist = Vec::new();
        for prime in &metadata.prime_variables {
            let state = plan.position_of_float_var(&prime.name)?;
            let derivative = plan.position_of_float_var(&format!("D{}", prime.name))?;
            for k in 0..prime.length {
                slist.push((state + k).to_string());
                dlist.push((derivative + k).to_string());
            }
        }
        let dims = format!("[{}]", plan.primes_size);
        members.push(GlobalMember::array("int", "slist1", dims.clone(), slist.join(", ")));
        members.push(GlobalMember::array("int", "dlist1", dims.clone(), dlist.join(", ")));
        if metadata.derivimplicit_used() {
            members.push(GlobalMember::array("int", "slist2", dims, slist.join(", ")));
        }
    }
    if metadata.table_count() > 0 {
        members.push(GlobalMember::scalar("double", "usetable", "1"));
        for callable in metadata.functions_with_table() {
            members.push(GlobalMember::scalar("double", format!("tmin_{}", callable.name), ""));
            members.push(GlobalMember::scalar("double", format!("mfac_{}", callable.name), ""));
        }
        for callable in metadata.functions_with_table() {
            let Some(table) = &callable.table else { continue };
            let points = table.with + 1;
            if callable.is_function {
                members.push(GlobalMember::array(
                    "double",
                    format!("t_{}", callable.name),
                    format!("[{}]", points),
                    "",
                ));
                continue;
            }
            for var in &table.vars {
                let length = metadata.lookup(var).filter(|s| s.is_array).map(|s| s.length);
                let dims = match length {
                    Some(n) => format!("[{}][{}]", n, points),
                    None => format!("[{}]", points),
                };
                members.push(GlobalMember::array("double", format!("t_{}", var), dims, ""));
            }
        }
    }
    if style == Style::Coreneuron && metadata.vectorize && plan.thread.thread_data_index > 0 {
        members.push(GlobalMember::array(
            "ThreadDatum",
            "ext_call_thread",
            format!("[{}]", plan.thread.thread_data_index),
            "",
        ));
    }
    Ok(members)
}

// ── Resolver ─────────────────────────────────────────────────────────────

pub struct Resolver<'a> {
    metadata: &'a ModelMetadata,
    plan: &'a LayoutPlan,
    style: Style,
    globals: Vec<GlobalMember>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        metadata: &'a ModelMetadata,
        plan: &'a LayoutPlan,
        style: Style,
    ) -> Result<Self, Diagnostic> {
        let globals = global_members(metadata, plan, style)?;
        Ok(Resolver {
            metadata,
            plan,
            style,
            globals,
        })
    }

    pub fn style(&self) -> Style {
        self.style
    }

    pub fn globals(&self) -> &[GlobalMember] {
        &self.globals
    }

    /// `{suffix}_Instance`
    pub fn instance_struct(&self) -> String {
        format!("{}_Instance", self.metadata.mod_suffix)
    }

    /// `{suffix}_Store`
    pub fn global_struct(&self) -> String {
        format!("{}_Store", self.metadata.mod_suffix)
    }

    /// `{suffix}_NodeData`, the node view of NEURON kernels.
    pub fn node_data_struct(&self) -> String {
        format!("{}_NodeData", self.metadata.mod_suffix)
    }

    /// Singleton of the global struct.
    pub fn global_instance(&self) -> String {
        format!("{}_global", self.metadata.mod_suffix)
    }

    /// `{name}_{suffix}`
    pub fn method_name(&self, name: &str) -> String {
        format!("{}_{}", name, self.metadata.mod_suffix)
    }

    /// Access expression for `name`; first match wins.
    pub fn resolve(&self, name: &str, ctx: &EmissionContext<'_>) -> String {
        if let Some(k) = ctx.for_netcon_params.iter().position(|p| p.name == name) {
            return format!("weights[{} + nt->_fornetcon_weight_perm[i]]", k);
        }
        if ctx.event_scope() && ctx.net_receive_params.iter().any(|p| p == name) {
            return format!("(*{})", name);
        }
        if self.style == Style::Neuron && name == POINT_PROCESS && ctx.net_receive {
            return "_pnt".into();
        }
        if let Some(var) = self.plan.float_variable(name) {
            return self.float_variable(name, var.symbol.is_array, var.symbol.length, var.offset, ctx);
        }
        if let Some(var) = self.plan.int_variable(name) {
            return self.int_variable(var, ctx);
        }
        if let Some(text) = self.thread_variable(name) {
            return text;
        }
        if self.globals.iter().any(|g| g.name == name) {
            return self.global_variable(name, ctx);
        }
        match name {
            "dt" => return "nt->_dt".into(),
            "t" if !ctx.net_receive => return "nt->_t".into(),
            _ => {}
        }
        if self.metadata.neuron_globals.iter().any(|g| g == name) {
            return if ctx.use_instance {
                format!("*({}{})", self.instance_prefix(), name)
            } else {
                name.to_string()
            };
        }
        name.to_string()
    }

    fn instance_prefix(&self) -> &'static str {
        match self.style {
            Style::Coreneuron => "inst->",
            Style::Neuron => "inst.",
        }
    }

    fn float_variable(
        &self,
        name: &str,
        is_array: bool,
        length: usize,
        position: usize,
        ctx: &EmissionContext<'_>,
    ) -> String {
        match (self.style, ctx.use_instance, is_array) {
            (Style::Coreneuron, true, true) => format!("(inst->{}+id*{})", name, length),
            (Style::Coreneuron, true, false) => format!("inst->{}[id]", name),
            (Style::Coreneuron, false, true) => {
                format!("(data + {}*pnodecount + id*{})", position, length)
            }
            (Style::Coreneuron, false, false) => format!("data[{}*pnodecount + id]", position),
            (Style::Neuron, true, true) => format!("(inst.{}+id*{})", name, length),
            (Style::Neuron, true, false) => format!("inst.{}[id]", name),
            (Style::Neuron, false, _) => format!("_lmc.template fpfield<{}>(id)", position),
        }
    }

    fn int_variable(&self, var: &IndexVariableInfo, ctx: &EmissionContext<'_>) -> String {
        let name = var.name();
        let position = var.offset;
        if self.style == Style::Neuron {
            return match var.semantic.as_str() {
                "random" | "fornetcon" => format!("_ppvar[{}].literal_value<void*>()", position),
                "pointer" => format!("(*_ppvar[{}].get<double*>())", position),
                _ if var.is_integer || var.is_index => {
                    if ctx.use_instance {
                        format!("inst.{}[id]", name)
                    } else {
                        format!("_ppvar[{}]", position)
                    }
                }
                _ if ctx.use_instance => format!("(*inst.{}[id])", name),
                _ => format!("(*_ppvar[{}].get<double*>())", position),
            };
        }
        let text = if var.is_index {
            if ctx.use_instance {
                format!("inst->{}[{}]", name, position)
            } else {
                format!("indexes[{}]", position)
            }
        } else if var.is_integer {
            if ctx.use_instance {
                format!("inst->{}[{}*pnodecount+id]", name, position)
            } else {
                format!("indexes[{}*pnodecount+id]", position)
            }
        } else if ctx.use_instance {
            format!("inst->{}[indexes[{}*pnodecount + id]]", name, position)
        } else {
            let data = if var.is_vdata { "_vdata" } else { "_data" };
            format!("nt->{}[indexes[{}*pnodecount + id]]", data, position)
        };
        if var.semantic == "random" {
            format!("(nrnran123_State*) {}", text)
        } else {
            text
        }
    }

    fn thread_variable(&self, name: &str) -> Option<String> {
        let thread = &self.plan.thread;
        let lookup = |vars: &[crate::model::Symbol]| {
            let mut offset = 0;
            for var in vars {
                if var.name == name {
                    return Some((offset, var.is_array));
                }
                offset += var.length;
            }
            None
        };
        if let Some((offset, is_array)) = lookup(&self.metadata.thread_variables) {
            let base = match thread.thread_var_thread_id {
                Some(tid) if self.metadata.vectorize => self.thread_slot(tid),
                _ => format!("{}.thread_data", self.global_instance()),
            };
            return Some(element(&base, offset, is_array));
        }
        if let (Some(tid), true) = (thread.top_local_thread_id, self.metadata.vectorize) {
            if let Some((offset, is_array)) = lookup(&self.metadata.top_local_variables) {
                return Some(element(&self.thread_slot(tid), offset, is_array));
            }
        }
        None
    }

    fn thread_slot(&self, tid: usize) -> String {
        match self.style {
            Style::Coreneuron => format!("thread[{}].pval", tid),
            Style::Neuron => format!("_thread[{}].get<double*>()", tid),
        }
    }

    fn global_variable(&self, name: &str, ctx: &EmissionContext<'_>) -> String {
        if ctx.use_instance {
            format!("{}global->{}", self.instance_prefix(), name)
        } else {
            format!("{}.{}", self.global_instance(), name)
        }
    }
}

fn element(base: &str, offset: usize, is_array: bool) -> String {
    if is_array {
        format!("({} + {})", base, offset)
    } else {
        format!("{}[{}]", base, offset)
    }
}
