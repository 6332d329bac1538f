// layout.rs — Per-instance data layout planning
//
// Assigns offsets to every per-instance floating-point and integer variable
// and builds the index-semantics table the runtime reads at registration.
// The ordering replicates the legacy runtime's layout exactly; it is an
// external binary contract.
//
// Preconditions: `ModelMetadata` was produced by `model::build`.
// Postconditions: offsets are cumulative element counts, so an array
//                 variable of length n occupies n consecutive slots.
//                 Planning twice yields identical plans.
// Failure modes: position lookups of unknown names return E0100.
// Side effects: none.

use serde::Serialize;

use crate::diag::{codes, Diagnostic};
use crate::model::{ModelMetadata, Symbol, VarKind};

/// Name of the per-instance voltage copy kept when vectorized.
pub const VOLTAGE_UNUSED: &str = "v_unused";
/// Conductance slot when vectorized.
pub const CONDUCTANCE_UNUSED: &str = "g_unused";
/// Conductance slot when not vectorized.
pub const CONDUCTANCE: &str = "g";
/// Last event delivery time.
pub const TSAVE: &str = "tsave";
pub const NODE_AREA: &str = "node_area";
pub const POINT_PROCESS: &str = "point_process";
pub const TQITEM: &str = "tqitem";
pub const FOR_NETCON: &str = "fornetcon_data";
pub const ION_PREFIX: &str = "ion_";

// ── Layout entries ───────────────────────────────────────────────────────

/// A slot group of the float array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FloatVariable {
    pub symbol: Symbol,
    pub offset: usize,
}

/// A slot group of the integer (`pdata`) array.
///
/// At most one of `is_vdata`, `is_index` and `is_integer` is set. None set
/// means the slot holds an index into the shared `nt->_data` array.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexVariableInfo {
    pub symbol: Symbol,
    pub offset: usize,
    pub is_vdata: bool,
    pub is_index: bool,
    pub is_integer: bool,
    pub is_constant: bool,
    pub semantic: String,
}

impl IndexVariableInfo {
    fn new(symbol: Symbol, semantic: impl Into<String>) -> Self {
        IndexVariableInfo {
            symbol,
            offset: 0,
            is_vdata: false,
            is_index: false,
            is_integer: false,
            is_constant: false,
            semantic: semantic.into(),
        }
    }

    fn vdata(mut self) -> Self {
        self.is_vdata = true;
        self
    }

    fn index(mut self) -> Self {
        self.is_index = true;
        self
    }

    fn integer(mut self) -> Self {
        self.is_integer = true;
        self
    }

    fn constant(mut self) -> Self {
        self.is_constant = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.symbol.name
    }
}

/// One entry of the index-semantics table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSemantics {
    pub index: usize,
    pub name: String,
    pub size: usize,
}

/// Thread-data slot assignment (`ThreadDatum` ids).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadLayout {
    /// First of the three derivimplicit slots (advance flag, `dith`, Newton space).
    pub derivimplicit_var_thread_id: Option<usize>,
    /// Suffix of `slist`/`dlist` used by the derivimplicit solve.
    pub derivimplicit_list_num: usize,
    pub top_local_thread_id: Option<usize>,
    pub top_local_thread_size: usize,
    pub thread_var_thread_id: Option<usize>,
    pub thread_var_data_size: usize,
    /// Number of `ThreadDatum` entries in use.
    pub thread_data_index: usize,
}

/// Offsets and tables for one model. Owned by a code generation session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutPlan {
    pub float_variables: Vec<FloatVariable>,
    pub int_variables: Vec<IndexVariableInfo>,
    pub semantics: Vec<IndexSemantics>,
    /// Integer offset of the first pointer variable.
    pub first_pointer_var_index: Option<usize>,
    /// Position of `tqitem` in `int_variables`.
    pub tqitem_index: Option<usize>,
    pub num_primes: usize,
    pub primes_size: usize,
    pub thread: ThreadLayout,
}

impl LayoutPlan {
    pub fn float_variable(&self, name: &str) -> Option<&FloatVariable> {
        self.float_variables.iter().find(|v| v.symbol.name == name)
    }

    pub fn int_variable(&self, name: &str) -> Option<&IndexVariableInfo> {
        self.int_variables.iter().find(|v| v.symbol.name == name)
    }

    pub fn position_of_float_var(&self, name: &str) -> Result<usize, Diagnostic> {
        self.float_variable(name)
            .map(|v| v.offset)
            .ok_or_else(|| unclassified("float", name))
    }

    pub fn position_of_int_var(&self, name: &str) -> Result<usize, Diagnostic> {
        self.int_variable(name)
            .map(|v| v.offset)
            .ok_or_else(|| unclassified("integer", name))
    }

    /// Total float slots per instance.
    pub fn float_variables_size(&self) -> usize {
        self.float_variables
            .iter()
            .map(|v| v.symbol.length)
            .sum()
    }

    /// Total integer slots per instance.
    pub fn int_variables_size(&self) -> usize {
        self.int_variables.iter().map(|v| v.symbol.length).sum()
    }

    /// `first_pointer_var_index()` as the runtime expects it.
    pub fn first_pointer_var_index_value(&self) -> i64 {
        self.first_pointer_var_index.map_or(-1, |i| i as i64)
    }
}

fn unclassified(array: &str, name: &str) -> Diagnostic {
    Diagnostic::error(
        codes::E0100,
        format!("variable '{}' has no slot in the {} array", name, array),
    )
    .with_hint("the variable was never classified by the model file")
}

// ── Float layout ─────────────────────────────────────────────────────────

fn assign_offsets(symbols: Vec<Symbol>) -> Vec<FloatVariable> {
    let mut offset = 0;
    symbols
        .into_iter()
        .map(|symbol| {
            let var = FloatVariable { symbol, offset };
            offset += var.symbol.length;
            var
        })
        .collect()
}

/// Float array order of the legacy runtime:
/// range parameters, range assigned, range states, then the remaining
/// assigned and ion variables merged with one `D{state}` per state by
/// definition order. `v_unused`, the conductance slot and `tsave` follow.
pub fn compute_float_layout(metadata: &ModelMetadata) -> Vec<FloatVariable> {
    let mut remaining = metadata.assigned_vars.clone();
    for state in &metadata.state_vars {
        remaining.push(Symbol {
            name: format!("D{}", state.name),
            kinds: vec![VarKind::Assigned],
            value: None,
            ..state.clone()
        });
    }
    remaining.sort_by_key(|s| s.order);

    let mut symbols: Vec<Symbol> = metadata
        .range_parameter_vars
        .iter()
        .chain(&metadata.range_assigned_vars)
        .chain(&metadata.range_state_vars)
        .cloned()
        .collect();
    symbols.extend(remaining);

    if metadata.vectorize {
        symbols.push(Symbol::synthetic(VOLTAGE_UNUSED));
    }
    if metadata.breakpoint_exist() {
        let name = if metadata.vectorize {
            CONDUCTANCE_UNUSED
        } else {
            CONDUCTANCE
        };
        if !symbols.iter().any(|s| s.name == name) {
            symbols.push(Symbol::synthetic(name));
        }
    }
    if metadata.net_receive_exist() {
        symbols.push(Symbol::synthetic(TSAVE));
    }
    assign_offsets(symbols)
}

// ── Integer layout ───────────────────────────────────────────────────────

/// Integer variables and their semantics, built in one walk so the two
/// tables never disagree.
#[derive(Debug, Clone, PartialEq)]
pub struct IntLayout {
    pub variables: Vec<IndexVariableInfo>,
    pub semantics: Vec<IndexSemantics>,
    pub first_pointer_var_index: Option<usize>,
    pub tqitem_index: Option<usize>,
}

pub fn compute_int_layout(metadata: &ModelMetadata) -> IntLayout {
    let mut vars: Vec<IndexVariableInfo> = Vec::new();
    let mut first_pointer_var_index = None;
    let mut tqitem_index = None;

    if metadata.point_process {
        vars.push(IndexVariableInfo::new(Symbol::synthetic(NODE_AREA), "area").constant());
        let pp = IndexVariableInfo::new(Symbol::synthetic(POINT_PROCESS), "pntproc");
        vars.push(if metadata.artificial_cell {
            pp.vdata()
        } else {
            pp.integer().constant()
        });
    }

    for ion in &metadata.ions {
        let semantic = format!("{}_ion", ion.name);
        let first = vars.len();
        for var in &ion.reads {
            vars.push(
                IndexVariableInfo::new(Symbol::synthetic(format!("{ION_PREFIX}{var}")), &semantic)
                    .constant(),
            );
        }
        let mut di_dv = None;
        for var in &ion.writes {
            let name = format!("{ION_PREFIX}{var}");
            match vars[first..].iter_mut().find(|v| v.symbol.name == name) {
                Some(existing) => existing.is_constant = false,
                None => vars.push(IndexVariableInfo::new(Symbol::synthetic(name), &semantic)),
            }
            if ion.is_ionic_current(var) {
                di_dv = Some(format!("{ION_PREFIX}{}", ion.current_derivative_name()));
            }
        }
        if let Some(name) = di_dv {
            vars.push(IndexVariableInfo::new(Symbol::synthetic(name), &semantic));
        }
        if ion.need_style {
            vars.push(IndexVariableInfo::new(
                Symbol::synthetic(format!("{ION_PREFIX}{}_erev", ion.name)),
                &semantic,
            ));
            vars.push(
                IndexVariableInfo::new(
                    Symbol::synthetic(format!("style_{}", ion.name)),
                    format!("#{}_ion", ion.name),
                )
                .index()
                .constant(),
            );
        }
    }

    for var in &metadata.pointer_variables {
        if first_pointer_var_index.is_none() {
            first_pointer_var_index = Some(vars.iter().map(|v| v.symbol.length).sum());
        }
        if var.has(VarKind::Pointer) {
            vars.push(IndexVariableInfo::new(var.clone(), "pointer"));
        } else {
            vars.push(IndexVariableInfo::new(var.clone(), "bbcorepointer").vdata());
        }
    }

    if metadata.diam_used {
        vars.push(IndexVariableInfo::new(Symbol::synthetic("diam"), "diam"));
    }
    if metadata.area_used {
        vars.push(IndexVariableInfo::new(Symbol::synthetic("area"), "area"));
    }

    if metadata.net_send_used || metadata.is_watch_used() {
        let tq = IndexVariableInfo::new(Symbol::synthetic(TQITEM), "netsend");
        vars.push(if metadata.artificial_cell {
            tq.vdata()
        } else {
            tq.integer().constant()
        });
        tqitem_index = Some(vars.len() - 1);
    }

    // one slot more than WATCH statements, matching the simulator's Datum count
    if metadata.is_watch_used() {
        for i in 0..=metadata.watch_statements.len() {
            vars.push(
                IndexVariableInfo::new(Symbol::synthetic(format!("watch{i}")), "watch").integer(),
            );
        }
    }

    if metadata.for_netcon_used {
        vars.push(IndexVariableInfo::new(Symbol::synthetic(FOR_NETCON), "fornetcon").integer());
    }

    for var in &metadata.random_variables {
        vars.push(IndexVariableInfo::new(var.clone(), "random").vdata());
    }

    let mut offset = 0;
    let mut semantics = Vec::with_capacity(vars.len());
    for var in &mut vars {
        var.offset = offset;
        semantics.push(IndexSemantics {
            index: offset,
            name: var.semantic.clone(),
            size: var.symbol.length,
        });
        offset += var.symbol.length;
    }

    IntLayout {
        variables: vars,
        semantics,
        first_pointer_var_index,
        tqitem_index,
    }
}

// ── Thread data ──────────────────────────────────────────────────────────

/// `ThreadDatum` ids: derivimplicit takes the first three, then top-level
/// locals, then thread-promoted globals.
pub fn compute_thread_layout(metadata: &ModelMetadata) -> ThreadLayout {
    let mut thread = ThreadLayout::default();
    if metadata.derivimplicit_used() {
        thread.derivimplicit_var_thread_id = Some(0);
        thread.derivimplicit_list_num = 1;
        thread.thread_data_index = 3;
    }
    if metadata.vectorize && !metadata.top_local_variables.is_empty() {
        thread.top_local_thread_id = Some(thread.thread_data_index);
        thread.thread_data_index += 1;
    }
    if metadata.vectorize && !metadata.thread_variables.is_empty() {
        thread.thread_var_thread_id = Some(thread.thread_data_index);
        thread.thread_data_index += 1;
    }
    thread.top_local_thread_size = metadata.top_local_variables.iter().map(|v| v.length).sum();
    thread.thread_var_data_size = metadata.thread_variables.iter().map(|v| v.length).sum();
    thread
}

/// Plan the complete layout of a model.
pub fn plan(metadata: &ModelMetadata) -> LayoutPlan {
    let ints = compute_int_layout(metadata);
    LayoutPlan {
        float_variables: compute_float_layout(metadata),
        int_variables: ints.variables,
        semantics: ints.semantics,
        first_pointer_var_index: ints.first_pointer_var_index,
        tqitem_index: ints.tqitem_index,
        num_primes: metadata.prime_variables.len(),
        primes_size: metadata.prime_variables.iter().map(|p| p.length).sum(),
        thread: compute_thread_layout(metadata),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{build, ModelFile};

    fn metadata(json: &str) -> ModelMetadata {
        let file: ModelFile = serde_json::from_str(json).expect("model json");
        build(&file).expect("valid model")
    }

    fn float_names(plan: &[FloatVariable]) -> Vec<(&str, usize)> {
        plan.iter()
            .map(|v| (v.symbol.name.as_str(), v.offset))
            .collect()
    }

    const HH_LIKE: &str = r#"{
        "mod_file": "hh", "suffix": "hh",
        "variables": [
            {"name": "gnabar", "kinds": ["range", "parameter"], "value": 0.12},
            {"name": "ena", "kinds": ["assigned"]},
            {"name": "gna", "kinds": ["range", "assigned"]},
            {"name": "m", "kinds": ["state"]},
            {"name": "ina", "kinds": ["assigned"]},
            {"name": "h", "kinds": ["state"]},
            {"name": "gl", "kinds": ["range", "parameter"], "value": 0.0003},
            {"name": "il", "kinds": ["range", "assigned"]}
        ],
        "ions": [{"name": "na", "reads": ["ena"], "writes": ["ina"]}],
        "currents": ["il"],
        "blocks": {"breakpoint": "gna = gnabar * m * m * m * h ina = gna * (v - ena) il = gl * v"}
    }"#;

    #[test]
    fn float_order_parameters_assigned_states_rest() {
        let m = metadata(HH_LIKE);
        let layout = compute_float_layout(&m);
        assert_eq!(
            float_names(&layout),
            vec![
                ("gnabar", 0),
                ("gl", 1),
                ("gna", 2),
                ("il", 3),
                ("m", 4),
                ("h", 5),
                ("ena", 6),
                ("Dm", 7),
                ("ina", 8),
                ("Dh", 9),
                ("v_unused", 10),
                ("g_unused", 11),
            ]
        );
    }

    #[test]
    fn array_variables_take_their_length() {
        let m = metadata(
            r#"{
                "mod_file": "a", "suffix": "a", "vectorize": false,
                "variables": [
                    {"name": "w", "kinds": ["range", "parameter"], "length": 3},
                    {"name": "x", "kinds": ["range", "assigned"]}
                ],
                "blocks": {"breakpoint": "x = w[0]"}
            }"#,
        );
        let plan = plan(&m);
        assert_eq!(plan.position_of_float_var("x").expect("x"), 3);
        assert_eq!(plan.position_of_float_var("g").expect("g"), 4);
        assert_eq!(plan.float_variables_size(), 5);
        assert!(plan.float_variables[0].symbol.is_array);
    }

    #[test]
    fn existing_conductance_is_not_duplicated() {
        let m = metadata(
            r#"{
                "mod_file": "a", "suffix": "a", "vectorize": false,
                "variables": [{"name": "g", "kinds": ["range", "assigned"]}],
                "blocks": {"breakpoint": "g = 1"}
            }"#,
        );
        let layout = compute_float_layout(&m);
        assert_eq!(layout.iter().filter(|v| v.symbol.name == "g").count(), 1);
    }

    #[test]
    fn ion_int_variables_and_semantics() {
        let m = metadata(HH_LIKE);
        let plan = plan(&m);
        let names: Vec<_> = plan.int_variables.iter().map(|v| v.name()).collect();
        assert_eq!(names, vec!["ion_ena", "ion_ina", "ion_dinadv"]);
        assert!(plan.int_variables[0].is_constant);
        assert!(!plan.int_variables[1].is_constant);
        let sem: Vec<_> = plan.semantics.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(sem, vec!["na_ion", "na_ion", "na_ion"]);
        assert_eq!(plan.first_pointer_var_index, None);
        assert_eq!(plan.first_pointer_var_index_value(), -1);
    }

    #[test]
    fn concentration_write_adds_style_slots() {
        let m = metadata(
            r#"{
                "mod_file": "cad", "suffix": "cad",
                "variables": [
                    {"name": "ica", "kinds": ["assigned"]},
                    {"name": "cai", "kinds": ["state"]}
                ],
                "ions": [{"name": "ca", "reads": ["ica", "cai"], "writes": ["cai"]}],
                "blocks": {"state": "cai = cai - ica"}
            }"#,
        );
        let plan = plan(&m);
        let names: Vec<_> = plan.int_variables.iter().map(|v| v.name()).collect();
        assert_eq!(
            names,
            vec!["ion_ica", "ion_cai", "ion_cao", "ion_ca_erev", "style_ca"]
        );
        let style = plan.int_variable("style_ca").expect("style");
        assert!(style.is_index && style.is_constant);
        assert_eq!(plan.semantics[4].name, "#ca_ion");
        assert!(!plan.int_variable("ion_cai").expect("cai").is_constant);
    }

    #[test]
    fn point_process_pointers_watch_and_tqitem() {
        let m = metadata(
            r#"{
                "mod_file": "w", "suffix": "w", "point_process": true,
                "variables": [
                    {"name": "y", "kinds": ["range", "assigned"]},
                    {"name": "src", "kinds": ["pointer"]},
                    {"name": "rng", "kinds": ["bbcorepointer"]}
                ],
                "blocks": {
                    "initial": "net_send(0, 1)",
                    "net_receive": {"params": ["w"], "body": "WATCH (y > 1) 2"}
                }
            }"#,
        );
        let plan = plan(&m);
        let names: Vec<_> = plan.int_variables.iter().map(|v| v.name()).collect();
        assert_eq!(
            names,
            vec!["node_area", "point_process", "src", "rng", "tqitem", "watch0", "watch1"]
        );
        assert_eq!(plan.first_pointer_var_index, Some(2));
        assert_eq!(plan.tqitem_index, Some(4));
        assert!(plan.int_variables[1].is_integer);
        assert!(plan.int_variable("rng").expect("rng").is_vdata);
        let sem: Vec<_> = plan.semantics.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            sem,
            vec!["area", "pntproc", "pointer", "bbcorepointer", "netsend", "watch", "watch"]
        );
        assert_eq!(plan.position_of_float_var("tsave").expect("tsave") + 1, plan.float_variables_size());
    }

    #[test]
    fn artificial_cell_uses_vdata_slots() {
        let m = metadata(
            r#"{
                "mod_file": "a", "suffix": "a", "artificial_cell": true,
                "blocks": {"net_receive": {"params": [], "body": "net_send(1, 1)"}}
            }"#,
        );
        let plan = plan(&m);
        assert!(plan.int_variable("point_process").expect("pp").is_vdata);
        assert!(plan.int_variable("tqitem").expect("tq").is_vdata);
    }

    #[test]
    fn thread_ids_follow_derivimplicit() {
        let m = metadata(
            r#"{
                "mod_file": "d", "suffix": "d",
                "variables": [
                    {"name": "m", "kinds": ["state"]},
                    {"name": "tmp", "kinds": ["local"]},
                    {"name": "minf", "kinds": ["global"]}
                ],
                "solves": [{"block": "states", "method": "derivimplicit"}],
                "blocks": {
                    "state": "DERIVIMPLICIT states",
                    "initial": "minf = 1",
                    "derivimplicit": [{"name": "states", "body": "Dm = minf - m"}]
                }
            }"#,
        );
        let plan = plan(&m);
        assert_eq!(plan.thread.derivimplicit_var_thread_id, Some(0));
        assert_eq!(plan.thread.top_local_thread_id, Some(3));
        assert_eq!(plan.thread.thread_var_thread_id, Some(4));
        assert_eq!(plan.thread.thread_data_index, 5);
        assert_eq!(plan.num_primes, 1);
    }

    #[test]
    fn unknown_position_is_an_error() {
        let m = metadata(HH_LIKE);
        let err = plan(&m).position_of_float_var("nope").expect_err("unknown");
        assert_eq!(err.code, Some(codes::E0100));
    }
}
