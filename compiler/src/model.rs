// model.rs — Model file input and immutable model metadata
//
// Loads the JSON model file produced by the analysis stage, parses every
// block body, and derives the classified variable lists and feature flags
// the code generator consumes.
//
// Preconditions: the model file deserializes into `ModelFile`.
// Postconditions: `build` returns an immutable `ModelMetadata` whose lists
//                 are sorted by definition order, or every error found.
// Failure modes: parse errors, undeclared SOLVE/DERIVIMPLICIT targets,
//                unsupported methods, ion naming violations (see `diag::codes`).
// Side effects: `load_model` reads one file.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ast::{Expr, Span, StatementBlock, Stmt, WatchStmt};
use crate::calls::{self, CallKind};
use crate::diag::{codes, Diagnostic};

// ── Model file (input) ───────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_length() -> usize {
    1
}

/// The JSON model file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelFile {
    pub mod_file: String,
    pub suffix: String,
    #[serde(default = "default_true")]
    pub vectorize: bool,
    #[serde(default = "default_true")]
    pub thread_safe: bool,
    #[serde(default)]
    pub point_process: bool,
    #[serde(default)]
    pub artificial_cell: bool,
    #[serde(default)]
    pub electrode_current: bool,
    #[serde(default)]
    pub diam_used: bool,
    #[serde(default)]
    pub area_used: bool,
    #[serde(default)]
    pub variables: Vec<VarDecl>,
    #[serde(default)]
    pub ions: Vec<IonDecl>,
    #[serde(default)]
    pub currents: Vec<String>,
    #[serde(default)]
    pub conductances: Vec<ConductanceDecl>,
    #[serde(default)]
    pub neuron_globals: Vec<String>,
    #[serde(default)]
    pub factors: Vec<Factor>,
    #[serde(default)]
    pub changed_dt: Option<String>,
    #[serde(default)]
    pub solves: Vec<SolveDecl>,
    #[serde(default)]
    pub blocks: BlocksDecl,
    #[serde(default)]
    pub verbatim_top: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VarDecl {
    pub name: String,
    pub kinds: Vec<VarKind>,
    #[serde(default)]
    pub length: Option<usize>,
    #[serde(default)]
    pub value: Option<f64>,
}

/// Classification flag of a declared variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    Range,
    Parameter,
    Assigned,
    State,
    Global,
    Constant,
    Thread,
    Pointer,
    Bbcorepointer,
    ReadIon,
    WriteIon,
    Random,
    Extern,
    /// LOCAL declared at file scope.
    Local,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IonDecl {
    pub name: String,
    #[serde(default)]
    pub reads: Vec<String>,
    #[serde(default)]
    pub writes: Vec<String>,
    #[serde(default)]
    pub valence: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConductanceDecl {
    pub variable: String,
    #[serde(default)]
    pub ion: Option<String>,
}

/// A unit factor (`FARADAY`, `R`, ...).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Factor {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolveDecl {
    pub block: String,
    pub method: String,
    /// Byte range of the SOLVE statement in the original model source.
    #[serde(default)]
    pub span: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlocksDecl {
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(default)]
    pub breakpoint: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub constructor: Option<String>,
    #[serde(default)]
    pub destructor: Option<String>,
    #[serde(default)]
    pub net_receive: Option<NetReceiveDecl>,
    #[serde(default)]
    pub before_after: Vec<BeforeAfterDecl>,
    #[serde(default)]
    pub derivimplicit: Vec<NamedBlockDecl>,
    #[serde(default)]
    pub functions: Vec<CallableDecl>,
    #[serde(default)]
    pub procedures: Vec<CallableDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetReceiveDecl {
    #[serde(default)]
    pub params: Vec<String>,
    pub body: String,
    #[serde(default)]
    pub initial: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeforeAfterDecl {
    pub kind: BeforeAfterKind,
    pub attach: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamedBlockDecl {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallableDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub body: String,
    #[serde(default)]
    pub table: Option<TableDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableDecl {
    #[serde(default)]
    pub vars: Vec<String>,
    #[serde(default)]
    pub depend: Vec<String>,
    pub from: String,
    pub to: String,
    pub with: i64,
}

// ── Loading ──────────────────────────────────────────────────────────────

/// Errors from reading or decoding a model file.
#[derive(Debug)]
pub enum LoadError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            LoadError::Json { path, source } => {
                write!(f, "{}: invalid model file: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io { source, .. } => Some(source),
            LoadError::Json { source, .. } => Some(source),
        }
    }
}

/// Read and decode a model file. Returns the file text with the decoded model.
pub fn load_model(path: &Path) -> Result<(String, ModelFile), LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file = serde_json::from_str(&text).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    Ok((text, file))
}

// ── Metadata (output) ────────────────────────────────────────────────────

/// A classified variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Symbol {
    pub name: String,
    pub length: usize,
    pub is_array: bool,
    /// Definition order (declaration index in the model file).
    pub order: usize,
    pub value: Option<f64>,
    pub kinds: Vec<VarKind>,
}

impl Symbol {
    /// A generator-introduced scalar (`v_unused`, `tsave`, ...).
    pub fn synthetic(name: impl Into<String>) -> Self {
        Symbol {
            name: name.into(),
            length: 1,
            is_array: false,
            order: usize::MAX,
            value: None,
            kinds: Vec::new(),
        }
    }

    pub fn has(&self, kind: VarKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn has_any(&self, kinds: &[VarKind]) -> bool {
        kinds.iter().any(|k| self.has(*k))
    }
}

/// One USEION statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ion {
    pub name: String,
    pub reads: Vec<String>,
    /// Concentrations read only to mirror the simulator's data layout.
    pub implicit_reads: Vec<String>,
    pub writes: Vec<String>,
    pub valence: Option<f64>,
    pub need_style: bool,
}

impl Ion {
    pub fn ionic_current_name(&self) -> String {
        format!("i{}", self.name)
    }
    pub fn intra_conc_name(&self) -> String {
        format!("{}i", self.name)
    }
    pub fn extra_conc_name(&self) -> String {
        format!("{}o", self.name)
    }
    pub fn rev_potential_name(&self) -> String {
        format!("e{}", self.name)
    }
    pub fn current_derivative_name(&self) -> String {
        format!("di{}dv", self.name)
    }

    pub fn is_ionic_current(&self, text: &str) -> bool {
        text == self.ionic_current_name()
    }
    pub fn is_intra_cell_conc(&self, text: &str) -> bool {
        text == self.intra_conc_name()
    }
    pub fn is_extra_cell_conc(&self, text: &str) -> bool {
        text == self.extra_conc_name()
    }
    pub fn is_rev_potential(&self, text: &str) -> bool {
        text == self.rev_potential_name()
    }
    pub fn is_ionic_conc(&self, text: &str) -> bool {
        self.is_intra_cell_conc(text) || self.is_extra_cell_conc(text)
    }
    /// `ena`, `ina`, `nai`, `nao` for sodium.
    pub fn is_ionic_variable(&self, text: &str) -> bool {
        self.is_ionic_conc(text) || self.is_ionic_current(text) || self.is_rev_potential(text)
    }

    pub fn is_read(&self, text: &str) -> bool {
        self.reads.iter().any(|r| r == text)
    }
    pub fn is_written(&self, text: &str) -> bool {
        self.writes.iter().any(|w| w == text)
    }
    pub fn is_conc_written(&self) -> bool {
        self.writes.iter().any(|w| self.is_ionic_conc(w))
    }

    /// Position of a variable inside the simulator's ion mechanism
    /// (`e`, `i`, `o`, current, current derivative).
    pub fn variable_index(&self, text: &str) -> Option<usize> {
        if self.is_rev_potential(text) {
            Some(0)
        } else if self.is_intra_cell_conc(text) {
            Some(1)
        } else if self.is_extra_cell_conc(text) {
            Some(2)
        } else if self.is_ionic_current(text) {
            Some(3)
        } else if text == self.current_derivative_name() {
            Some(4)
        } else {
            None
        }
    }
}

/// A CONDUCTANCE hint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conductance {
    pub ion: Option<String>,
    pub variable: String,
}

/// SOLVE methods the generator supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolveMethod {
    Cnexp,
    Derivimplicit,
    Euler,
    Sparse,
    AfterCvode,
    CvodeT,
    CvodeTV,
}

impl SolveMethod {
    pub const ALL: [SolveMethod; 7] = [
        SolveMethod::Cnexp,
        SolveMethod::Derivimplicit,
        SolveMethod::Euler,
        SolveMethod::Sparse,
        SolveMethod::AfterCvode,
        SolveMethod::CvodeT,
        SolveMethod::CvodeTV,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SolveMethod::Cnexp => "cnexp",
            SolveMethod::Derivimplicit => "derivimplicit",
            SolveMethod::Euler => "euler",
            SolveMethod::Sparse => "sparse",
            SolveMethod::AfterCvode => "after_cvode",
            SolveMethod::CvodeT => "cvode_t",
            SolveMethod::CvodeTV => "cvode_t_v",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Solve {
    pub block: String,
    pub method: SolveMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BeforeAfterKind {
    Before,
    After,
}

/// Lifecycle point a BEFORE/AFTER block attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Attach {
    Breakpoint,
    Solve,
    Initial,
    Step,
}

impl Attach {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "breakpoint" => Some(Attach::Breakpoint),
            "solve" => Some(Attach::Solve),
            "initial" => Some(Attach::Initial),
            "step" => Some(Attach::Step),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Attach::Breakpoint => "Breakpoint",
            Attach::Solve => "Solve",
            Attach::Initial => "Initial",
            Attach::Step => "Step",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeforeAfter {
    pub kind: BeforeAfterKind,
    pub attach: Attach,
    pub body: StatementBlock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetReceive {
    pub params: Vec<String>,
    pub body: StatementBlock,
    pub initial: Option<StatementBlock>,
}

/// A DERIVATIVE block solved with derivimplicit; assignments are `D{state} = ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivBlock {
    pub name: String,
    pub body: StatementBlock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    pub vars: Vec<String>,
    pub depend: Vec<String>,
    pub from: Expr,
    pub to: Expr,
    pub with: i64,
}

/// A FUNCTION or PROCEDURE.
#[derive(Debug, Clone, PartialEq)]
pub struct Callable {
    pub name: String,
    pub params: Vec<String>,
    pub body: StatementBlock,
    pub table: Option<Table>,
    pub is_function: bool,
}

/// Analyzed model. Immutable once built.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub mod_file: String,
    pub mod_suffix: String,
    pub vectorize: bool,
    pub thread_safe: bool,
    pub point_process: bool,
    pub artificial_cell: bool,
    pub electrode_current: bool,
    pub diam_used: bool,
    pub area_used: bool,

    /// Every declared variable, in definition order.
    pub symbols: Vec<Symbol>,
    pub ions: Vec<Ion>,
    /// Nonspecific/electrode currents followed by written ionic currents.
    pub currents: Vec<String>,
    pub conductances: Vec<Conductance>,
    pub neuron_globals: Vec<String>,
    pub factors: Vec<Factor>,
    pub changed_dt: Option<String>,
    pub solves: Vec<Solve>,

    pub range_parameter_vars: Vec<Symbol>,
    pub range_assigned_vars: Vec<Symbol>,
    pub state_vars: Vec<Symbol>,
    pub range_state_vars: Vec<Symbol>,
    pub assigned_vars: Vec<Symbol>,
    pub global_variables: Vec<Symbol>,
    pub constant_variables: Vec<Symbol>,
    pub thread_variables: Vec<Symbol>,
    pub top_local_variables: Vec<Symbol>,
    pub pointer_variables: Vec<Symbol>,
    pub random_variables: Vec<Symbol>,
    pub table_statement_variables: Vec<String>,
    /// States integrated by a SOLVE, in the order their derivatives appear.
    pub prime_variables: Vec<Symbol>,
    pub num_equations: usize,

    pub initial: Option<StatementBlock>,
    pub breakpoint: Option<StatementBlock>,
    pub nrn_state: Option<StatementBlock>,
    pub constructor: Option<StatementBlock>,
    pub destructor: Option<StatementBlock>,
    pub net_receive: Option<NetReceive>,
    pub before_after: Vec<BeforeAfter>,
    pub derivimplicit_blocks: Vec<DerivBlock>,
    pub functions: Vec<Callable>,
    pub procedures: Vec<Callable>,
    pub verbatim_top: Vec<String>,
    pub watch_statements: Vec<WatchStmt>,

    pub net_send_used: bool,
    pub net_event_used: bool,
    pub net_move_used: bool,
    pub for_netcon_used: bool,
    pub bbcore_pointer_used: bool,
    pub write_concentration: bool,
    pub require_wrote_conc: bool,
    pub variables_written: BTreeSet<String>,
}

impl ModelMetadata {
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn is_ionic_current(&self, name: &str) -> bool {
        self.ions.iter().any(|ion| ion.is_ionic_current(name))
    }

    pub fn is_watch_used(&self) -> bool {
        !self.watch_statements.is_empty()
    }

    pub fn derivimplicit_used(&self) -> bool {
        self.solves
            .iter()
            .any(|s| s.method == SolveMethod::Derivimplicit)
    }

    pub fn net_receive_exist(&self) -> bool {
        self.net_receive.is_some()
    }

    pub fn breakpoint_exist(&self) -> bool {
        self.breakpoint.is_some()
    }

    pub fn functions_with_table(&self) -> impl Iterator<Item = &Callable> {
        self.functions
            .iter()
            .chain(&self.procedures)
            .filter(|c| c.table.is_some())
    }

    pub fn table_count(&self) -> usize {
        self.functions_with_table().count()
    }

    pub fn emit_table_thread(&self) -> bool {
        self.table_count() > 0 && self.vectorize
    }

    pub fn callable(&self, name: &str) -> Option<&Callable> {
        self.functions
            .iter()
            .chain(&self.procedures)
            .find(|c| c.name == name)
    }

    /// Current kernel required (`nrn_cur`).
    pub fn nrn_cur_required(&self) -> bool {
        self.breakpoint_exist() && !self.currents.is_empty()
    }

    /// State kernel required (`nrn_state`).
    pub fn nrn_state_required(&self) -> bool {
        !self.artificial_cell && (self.nrn_state.is_some() || self.breakpoint_exist())
    }

    /// `net_receive` is buffered on the device and replayed on the host.
    pub fn net_receive_buffering_required(&self) -> bool {
        self.point_process && !self.artificial_cell && self.net_receive.is_some()
    }

    /// Events produced on the device are buffered for the host.
    pub fn net_send_buffer_required(&self) -> bool {
        self.net_receive.is_some()
            && !self.artificial_cell
            && (self.net_event_used || self.net_send_used || self.is_watch_used())
    }

    /// Thread data used by derivimplicit, top locals or thread variables.
    pub fn thread_callback_register(&self) -> bool {
        self.derivimplicit_used()
            || (self.vectorize
                && (!self.top_local_variables.is_empty() || !self.thread_variables.is_empty()))
    }

    /// Number of NET_RECEIVE arguments.
    pub fn num_net_receive_parameters(&self) -> usize {
        self.net_receive.as_ref().map_or(0, |n| n.params.len())
    }

    /// Every statement block of the model (bodies, nested INITIAL, callables).
    pub fn all_blocks(&self) -> Vec<&StatementBlock> {
        let mut out: Vec<&StatementBlock> = Vec::new();
        out.extend(self.initial.iter());
        out.extend(self.breakpoint.iter());
        out.extend(self.nrn_state.iter());
        out.extend(self.constructor.iter());
        out.extend(self.destructor.iter());
        if let Some(nr) = &self.net_receive {
            out.push(&nr.body);
            out.extend(nr.initial.iter());
        }
        out.extend(self.before_after.iter().map(|b| &b.body));
        out.extend(self.derivimplicit_blocks.iter().map(|b| &b.body));
        out.extend(self.functions.iter().map(|c| &c.body));
        out.extend(self.procedures.iter().map(|c| &c.body));
        out
    }
}

// ── Builder ──────────────────────────────────────────────────────────────

fn span_of(range: Option<(usize, usize)>) -> Span {
    let (start, end) = range.unwrap_or((0, 0));
    (start..end).into()
}

/// Parse one block body; parse errors are collected with the block's name.
fn parse_body(source: &str, block: &str, errors: &mut Vec<Diagnostic>) -> StatementBlock {
    let result = crate::parser::parse_block(source);
    for err in &result.errors {
        errors.push(
            Diagnostic::error(codes::E0001, format!("{block}: {err}"))
                .with_span(*err.span())
                .with_cause(format!("{block} block"), None),
        );
    }
    result
        .block
        .unwrap_or_else(|| StatementBlock::empty((0..source.len()).into()))
}

fn parse_expr(source: &str, block: &str, errors: &mut Vec<Diagnostic>) -> Expr {
    match crate::parser::parse_expr(source) {
        Ok(e) => e,
        Err(errs) => {
            for err in errs {
                errors.push(Diagnostic::error(codes::E0001, format!("{block}: {err}")));
            }
            Expr::Integer(0, (0..0).into())
        }
    }
}

fn sorted(mut vars: Vec<Symbol>) -> Vec<Symbol> {
    vars.sort_by_key(|s| s.order);
    vars
}

/// Reverse definition order, then stable by first character: the symbol
/// hash-bucket order of the legacy translator.
fn mod2c_symbol_order(mut vars: Vec<Symbol>) -> Vec<Symbol> {
    vars.sort_by(|a, b| b.order.cmp(&a.order));
    vars.sort_by_key(|s| s.name.chars().next());
    vars
}

/// Build the immutable metadata, validating the model.
pub fn build(file: &ModelFile) -> Result<ModelMetadata, Vec<Diagnostic>> {
    let mut errors = Vec::new();

    // ── Ions ──

    let mut ions = Vec::new();
    let mut write_concentration = false;
    let mut require_wrote_conc = false;
    for decl in &file.ions {
        let mut ion = Ion {
            name: decl.name.clone(),
            reads: decl.reads.clone(),
            implicit_reads: Vec::new(),
            writes: decl.writes.clone(),
            valence: decl.valence,
            need_style: false,
        };
        for var in decl.reads.iter().chain(&decl.writes) {
            if !ion.is_ionic_variable(var) {
                errors.push(
                    Diagnostic::error(
                        codes::E0103,
                        format!("'{}' is not a variable of ion '{}'", var, ion.name),
                    )
                    .with_hint(format!(
                        "ion variables are i{0}, e{0}, {0}i and {0}o",
                        ion.name
                    )),
                );
            }
        }
        for var in &decl.writes {
            if ion.is_ionic_conc(var) {
                ion.need_style = true;
                write_concentration = true;
            }
            if !ion.is_ionic_current(var) && !ion.is_rev_potential(var) {
                require_wrote_conc = true;
            }
        }
        let has = |ion: &Ion, name: &str| ion.is_read(name) || ion.is_written(name);
        let (intra, extra) = (ion.intra_conc_name(), ion.extra_conc_name());
        let implicit = match (has(&ion, &intra), has(&ion, &extra)) {
            (true, false) => Some(extra),
            (false, true) => Some(intra),
            _ => None,
        };
        if let Some(name) = implicit {
            ion.reads.push(name.clone());
            ion.implicit_reads.push(name);
        }
        ions.push(ion);
    }

    // ── Symbols ──

    let mut symbols: Vec<Symbol> = Vec::new();
    for (order, decl) in file.variables.iter().enumerate() {
        if symbols.iter().any(|s| s.name == decl.name) {
            errors.push(Diagnostic::error(
                codes::E0002,
                format!("variable '{}' is declared twice", decl.name),
            ));
            continue;
        }
        let mut kinds = decl.kinds.clone();
        for ion in &ions {
            if ion.is_read(&decl.name) && !ion.implicit_reads.contains(&decl.name) {
                kinds.push(VarKind::ReadIon);
            }
            if ion.is_written(&decl.name) {
                kinds.push(VarKind::WriteIon);
            }
        }
        kinds.sort();
        kinds.dedup();
        if kinds.contains(&VarKind::Range) && kinds.contains(&VarKind::State) {
            errors.push(Diagnostic::error(
                codes::E0003,
                format!("'{}' cannot be both RANGE and STATE", decl.name),
            ));
        }
        symbols.push(Symbol {
            name: decl.name.clone(),
            length: decl.length.unwrap_or_else(default_length),
            is_array: decl.length.is_some(),
            order,
            value: decl.value,
            kinds,
        });
    }
    for ion in &ions {
        for var in ion.reads.iter().chain(&ion.writes) {
            if ion.implicit_reads.contains(var) {
                continue;
            }
            if !symbols.iter().any(|s| &s.name == var) {
                errors.push(
                    Diagnostic::error(
                        codes::E0100,
                        format!("ion variable '{}' is not declared", var),
                    )
                    .with_hint("declare it as an ASSIGNED or STATE variable"),
                );
            }
        }
    }

    let is_ion_var = |name: &str| ions.iter().any(|i| i.is_read(name) || i.is_written(name));
    let is_ion_cur = |name: &str| ions.iter().any(|i| i.is_ionic_current(name));
    let non_ioncur_filter = |s: &Symbol| !(is_ion_var(&s.name) && !is_ion_cur(&s.name));
    let select = |with: &dyn Fn(&Symbol) -> bool| -> Vec<Symbol> {
        symbols.iter().filter(|s| with(s)).cloned().collect()
    };

    use VarKind as K;
    let pointer_like = [K::Global, K::Pointer, K::Bbcorepointer];

    let range_parameter_vars = sorted(select(&|s: &Symbol| {
        s.has(K::Range)
            && s.has(K::Parameter)
            && !s.has_any(&pointer_like)
            && !s.has(K::State)
            && non_ioncur_filter(s)
    }));
    let range_assigned_vars = sorted(select(&|s: &Symbol| {
        s.has(K::Range)
            && s.has(K::Assigned)
            && !s.has_any(&pointer_like)
            && !s.has(K::State)
            && !s.has(K::Parameter)
            && non_ioncur_filter(s)
    }));
    let state_vars = sorted(select(&|s: &Symbol| s.has(K::State) && !s.has_any(&pointer_like)));
    let range_state_vars: Vec<Symbol> = state_vars
        .iter()
        .filter(|s| non_ioncur_filter(*s))
        .cloned()
        .collect();
    let in_lists = |s: &Symbol| {
        range_parameter_vars
            .iter()
            .chain(&range_assigned_vars)
            .chain(&range_state_vars)
            .any(|o| o.name == s.name)
    };
    let assigned_vars = sorted(select(&|s: &Symbol| {
        s.has_any(&[K::Assigned, K::State, K::ReadIon, K::WriteIon])
            && !s.has_any(&pointer_like)
            && !s.has(K::Extern)
            && s.name != "diam"
            && s.name != "area"
            && !in_lists(s)
    }));

    let diam_used = file.diam_used || symbols.iter().any(|s| s.name == "diam");
    let area_used = file.area_used || symbols.iter().any(|s| s.name == "area");

    // ── Blocks ──

    let blocks = &file.blocks;
    let mut initial = blocks
        .initial
        .as_deref()
        .map(|src| parse_body(src, "INITIAL", &mut errors));
    let breakpoint = blocks
        .breakpoint
        .as_deref()
        .map(|src| parse_body(src, "BREAKPOINT", &mut errors));
    let nrn_state = blocks
        .state
        .as_deref()
        .map(|src| parse_body(src, "STATE", &mut errors));
    let constructor = blocks
        .constructor
        .as_deref()
        .map(|src| parse_body(src, "CONSTRUCTOR", &mut errors));
    let destructor = blocks
        .destructor
        .as_deref()
        .map(|src| parse_body(src, "DESTRUCTOR", &mut errors));
    let mut net_receive = blocks.net_receive.as_ref().map(|nr| NetReceive {
        params: nr.params.clone(),
        body: parse_body(&nr.body, "NET_RECEIVE", &mut errors),
        initial: nr
            .initial
            .as_deref()
            .map(|src| parse_body(src, "NET_RECEIVE INITIAL", &mut errors)),
    });

    let mut before_after = Vec::new();
    for (i, ba) in blocks.before_after.iter().enumerate() {
        let body = parse_body(&ba.body, "BEFORE/AFTER", &mut errors);
        match Attach::parse(&ba.attach) {
            Some(attach) => before_after.push(BeforeAfter {
                kind: ba.kind,
                attach,
                body,
            }),
            None => errors.push(
                Diagnostic::error(
                    codes::E0104,
                    format!(
                        "before/after block {} attaches to unknown point '{}'",
                        i, ba.attach
                    ),
                )
                .with_hint("use breakpoint, solve, initial or step"),
            ),
        }
    }

    let derivimplicit_blocks: Vec<DerivBlock> = blocks
        .derivimplicit
        .iter()
        .map(|d| DerivBlock {
            name: d.name.clone(),
            body: parse_body(&d.body, &d.name, &mut errors),
        })
        .collect();

    let mut callables = |decls: &[CallableDecl], is_function: bool| -> Vec<Callable> {
        decls
            .iter()
            .map(|c| {
                let body = parse_body(&c.body, &c.name, &mut errors);
                let table = c.table.as_ref().map(|t| Table {
                    vars: t.vars.clone(),
                    depend: t.depend.clone(),
                    from: parse_expr(&t.from, &c.name, &mut errors),
                    to: parse_expr(&t.to, &c.name, &mut errors),
                    with: t.with,
                });
                Callable {
                    name: c.name.clone(),
                    params: c.params.clone(),
                    body,
                    table,
                    is_function,
                }
            })
            .collect()
    };
    let functions = callables(&blocks.functions, true);
    let procedures = callables(&blocks.procedures, false);

    // ── Non-range variables ──

    let mut written = BTreeSet::new();
    let mut collect_written = |block: &StatementBlock| {
        block.walk_stmts(&mut |stmt| {
            if let Stmt::Assign { target, .. } = stmt {
                if let Some(name) = target.target_name() {
                    written.insert(name.to_string());
                }
            }
        });
    };
    initial.iter().for_each(&mut collect_written);
    breakpoint.iter().for_each(&mut collect_written);
    nrn_state.iter().for_each(&mut collect_written);
    constructor.iter().for_each(&mut collect_written);
    destructor.iter().for_each(&mut collect_written);
    if let Some(nr) = &net_receive {
        collect_written(&nr.body);
        nr.initial.iter().for_each(&mut collect_written);
    }
    before_after.iter().for_each(|b| collect_written(&b.body));
    derivimplicit_blocks.iter().for_each(|b| collect_written(&b.body));
    functions.iter().for_each(|c| collect_written(&c.body));
    procedures.iter().for_each(|c| collect_written(&c.body));

    let promote = |s: &Symbol| file.thread_safe && written.contains(&s.name);
    let global_like = select(&|s: &Symbol| {
        (s.has(K::Global)
            || (s.has(K::Parameter)
                && !s.has_any(&[
                    K::Range,
                    K::Assigned,
                    K::Pointer,
                    K::Bbcorepointer,
                    K::ReadIon,
                    K::WriteIon,
                    K::Extern,
                ])
                && s.name != "diam"
                && s.name != "area"))
            && !s.has(K::Constant)
            && !s.has(K::State)
    });
    let mut global_variables = Vec::new();
    let mut thread_variables = Vec::new();
    for s in global_like {
        if s.has(K::Thread) || promote(&s) {
            thread_variables.push(s);
        } else {
            global_variables.push(s);
        }
    }
    let thread_variables = mod2c_symbol_order(thread_variables);
    let constant_variables = sorted(select(&|s: &Symbol| s.has(K::Constant)));
    let top_local_variables = sorted(select(&|s: &Symbol| s.has(K::Local)));
    let pointer_variables = sorted(select(&|s: &Symbol| s.has_any(&[K::Pointer, K::Bbcorepointer])));
    let random_variables = sorted(select(&|s: &Symbol| s.has(K::Random)));
    let bbcore_pointer_used = symbols.iter().any(|s| s.has(K::Bbcorepointer));

    let mut table_statement_variables = Vec::new();
    for callable in functions.iter().chain(&procedures) {
        if let Some(table) = &callable.table {
            if callable.is_function {
                table_statement_variables.push(callable.name.clone());
            } else {
                for var in &table.vars {
                    if !symbols.iter().any(|s| &s.name == var) {
                        errors.push(Diagnostic::error(
                            codes::E0107,
                            format!(
                                "TABLE of '{}' lists undeclared variable '{}'",
                                callable.name, var
                            ),
                        ));
                    }
                    table_statement_variables.push(var.clone());
                }
            }
            if table.with <= 0 {
                errors.push(Diagnostic::error(
                    codes::E0107,
                    format!("TABLE of '{}' needs a positive WITH count", callable.name),
                ));
            }
        }
    }

    // ── Solves ──

    let mut solves = Vec::new();
    for decl in &file.solves {
        let span = span_of(decl.span);
        let known_block = derivimplicit_blocks.iter().any(|d| d.name == decl.block)
            || procedures.iter().any(|p| p.name == decl.block)
            || file.blocks.state.is_some();
        if !known_block {
            errors.push(
                Diagnostic::error(
                    codes::E0101,
                    format!("SOLVE names undeclared block '{}'", decl.block),
                )
                .with_span(span),
            );
        }
        match SolveMethod::parse(&decl.method) {
            Some(method) => solves.push(Solve {
                block: decl.block.clone(),
                method,
            }),
            None => errors.push(
                Diagnostic::error(
                    codes::E0102,
                    format!(
                        "SOLVE {} uses unsupported method '{}'",
                        decl.block, decl.method
                    ),
                )
                .with_span(span)
                .with_hint("supported: cnexp, derivimplicit, euler, sparse, after_cvode, cvode_t, cvode_t_v"),
            ),
        }
    }

    // ── Derived flags from a walk over every block ──

    // Slots are numbered in statement order, NET_RECEIVE first.
    let mut watch_statements: Vec<WatchStmt> = Vec::new();
    let mut collect_watch = |block: &mut StatementBlock| {
        block.walk_stmts_mut(&mut |stmt| {
            if let Stmt::Watch(w) = stmt {
                w.slot = Some(watch_statements.len());
                watch_statements.push(w.clone());
            }
        });
    };
    if let Some(nr) = &mut net_receive {
        collect_watch(&mut nr.body);
    }
    initial.iter_mut().for_each(&mut collect_watch);

    let mut net_send_used = false;
    let mut net_event_used = false;
    let mut net_move_used = false;
    let mut for_netcon_used = false;
    let mut deriv_callbacks = Vec::new();
    let mut scan = |block: &StatementBlock, in_net_receive: bool, errors: &mut Vec<Diagnostic>| {
        block.walk_exprs(&mut |e| {
            if let Expr::Call(call) = e {
                match calls::builtin(&call.name.name) {
                    Some(CallKind::NetSend) => net_send_used = true,
                    Some(CallKind::NetEvent) => net_event_used = true,
                    Some(CallKind::NetMove) => {
                        net_move_used = true;
                        if !in_net_receive {
                            errors.push(
                                Diagnostic::error(
                                    codes::E0106,
                                    "net_move is only allowed in NET_RECEIVE",
                                )
                                .with_span(call.span),
                            );
                        }
                    }
                    Some(CallKind::Table(_) | CallKind::Method(_) | CallKind::External(_)) | None => {}
                }
            }
        });
        block.walk_stmts(&mut |stmt| match stmt {
            Stmt::ForNetcon { .. } => for_netcon_used = true,
            Stmt::DerivImplicit(name) => deriv_callbacks.push(name.clone()),
            Stmt::Local(..)
            | Stmt::Assign { .. }
            | Stmt::Expr(_)
            | Stmt::If(_)
            | Stmt::While { .. }
            | Stmt::From { .. }
            | Stmt::Watch(_)
            | Stmt::Verbatim(..)
            | Stmt::Initial(_) => {}
        });
    };
    if let Some(nr) = &net_receive {
        scan(&nr.body, true, &mut errors);
        if let Some(init) = &nr.initial {
            scan(init, true, &mut errors);
        }
    }
    for block in [&initial, &breakpoint, &nrn_state, &constructor, &destructor]
        .into_iter()
        .flatten()
    {
        scan(block, false, &mut errors);
    }
    for block in before_after
        .iter()
        .map(|b| &b.body)
        .chain(derivimplicit_blocks.iter().map(|b| &b.body))
        .chain(functions.iter().map(|c| &c.body))
        .chain(procedures.iter().map(|c| &c.body))
    {
        scan(block, false, &mut errors);
    }
    for name in &deriv_callbacks {
        if !derivimplicit_blocks.iter().any(|d| d.name == name.name) {
            errors.push(
                Diagnostic::error(
                    codes::E0105,
                    format!("DERIVIMPLICIT names undeclared block '{}'", name.name),
                )
                .with_span(name.span),
            );
        }
    }

    // ── Primes ──

    let mut prime_variables: Vec<Symbol> = Vec::new();
    let mut num_equations = 0;
    for block in &derivimplicit_blocks {
        block.body.walk_stmts(&mut |stmt| {
            if let Stmt::Assign { target, .. } = stmt {
                let state = target
                    .target_name()
                    .and_then(|n| n.strip_prefix('D'))
                    .and_then(|n| state_vars.iter().find(|s| s.name == n));
                if let Some(state) = state {
                    num_equations += 1;
                    if !prime_variables.iter().any(|p| p.name == state.name) {
                        prime_variables.push(state.clone());
                    }
                }
            }
        });
    }
    if prime_variables.is_empty() && !solves.is_empty() {
        prime_variables = state_vars.clone();
        num_equations = prime_variables.len();
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let mut currents = file.currents.clone();
    for ion in &ions {
        for var in &ion.writes {
            if ion.is_ionic_current(var) {
                currents.push(var.clone());
            }
        }
    }

    Ok(ModelMetadata {
        mod_file: file.mod_file.clone(),
        mod_suffix: file.suffix.clone(),
        vectorize: file.vectorize,
        thread_safe: file.thread_safe,
        point_process: file.point_process || file.artificial_cell,
        artificial_cell: file.artificial_cell,
        electrode_current: file.electrode_current,
        diam_used,
        area_used,
        ions,
        currents,
        conductances: file
            .conductances
            .iter()
            .map(|c| Conductance {
                ion: c.ion.clone(),
                variable: c.variable.clone(),
            })
            .collect(),
        neuron_globals: file.neuron_globals.clone(),
        factors: file.factors.clone(),
        changed_dt: file.changed_dt.clone(),
        solves,
        range_parameter_vars,
        range_assigned_vars,
        state_vars,
        range_state_vars,
        assigned_vars,
        global_variables,
        constant_variables,
        thread_variables,
        top_local_variables,
        pointer_variables,
        random_variables,
        table_statement_variables,
        prime_variables,
        num_equations,
        initial,
        breakpoint,
        nrn_state,
        constructor,
        destructor,
        net_receive,
        before_after,
        derivimplicit_blocks,
        functions,
        procedures,
        verbatim_top: file.verbatim_top.clone(),
        watch_statements,
        net_send_used,
        net_event_used,
        net_move_used,
        for_netcon_used,
        bbcore_pointer_used,
        write_concentration,
        require_wrote_conc,
        variables_written: written,
        symbols,
    })
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn file(json: &str) -> ModelFile {
        serde_json::from_str(json).expect("model json")
    }

    fn names(vars: &[Symbol]) -> Vec<&str> {
        vars.iter().map(|s| s.name.as_str()).collect()
    }

    const CADYN: &str = r#"{
        "mod_file": "cadyn", "suffix": "cadyn",
        "variables": [
            {"name": "depth", "kinds": ["range", "parameter"], "value": 0.1},
            {"name": "ica", "kinds": ["assigned"]},
            {"name": "drive", "kinds": ["range", "assigned"]},
            {"name": "cai", "kinds": ["state"]},
            {"name": "gamma", "kinds": ["range", "parameter"], "value": 0.05},
            {"name": "taur", "kinds": ["parameter"], "value": 200}
        ],
        "ions": [{"name": "ca", "reads": ["ica", "cai"], "writes": ["cai"]}],
        "solves": [{"block": "states", "method": "cnexp"}],
        "blocks": {"breakpoint": "drive = -ica / depth", "state": "cai = cai + dt * drive"}
    }"#;

    #[test]
    fn range_lists_follow_definition_order() {
        let m = build(&file(CADYN)).expect("valid");
        assert_eq!(names(&m.range_parameter_vars), vec!["depth", "gamma"]);
        assert_eq!(names(&m.range_assigned_vars), vec!["drive"]);
        assert_eq!(names(&m.state_vars), vec!["cai"]);
        // cai is an ion concentration, so it moves to the remaining list
        assert!(m.range_state_vars.is_empty());
        assert_eq!(names(&m.assigned_vars), vec!["ica", "cai"]);
        assert_eq!(names(&m.global_variables), vec!["taur"]);
    }

    #[test]
    fn concentration_write_needs_style_and_implicit_read() {
        let m = build(&file(CADYN)).expect("valid");
        let ca = &m.ions[0];
        assert!(ca.need_style);
        assert!(m.write_concentration);
        assert!(m.require_wrote_conc);
        assert_eq!(ca.implicit_reads, vec!["cao"]);
        assert!(ca.is_read("cao"));
        assert_eq!(ca.variable_index("dicadv"), Some(4));
    }

    #[test]
    fn written_globals_are_promoted_to_thread_variables() {
        let m = build(&file(
            r#"{
                "mod_file": "t", "suffix": "t",
                "variables": [
                    {"name": "minf", "kinds": ["global"]},
                    {"name": "bx", "kinds": ["global"]},
                    {"name": "ax", "kinds": ["global"]},
                    {"name": "q10", "kinds": ["global"]}
                ],
                "blocks": {"initial": "minf = 1 ax = 2 bx = 3"}
            }"#,
        ))
        .expect("valid");
        assert_eq!(names(&m.global_variables), vec!["q10"]);
        assert_eq!(names(&m.thread_variables), vec!["ax", "bx", "minf"]);
        assert!(m.thread_callback_register());
    }

    #[test]
    fn flags_from_block_walk() {
        let m = build(&file(
            r#"{
                "mod_file": "t", "suffix": "t", "point_process": true,
                "variables": [{"name": "y", "kinds": ["range", "assigned"]}],
                "blocks": {
                    "initial": "net_send(0, 1)",
                    "net_receive": {"params": ["w"], "body": "WATCH (y > 1) 2 net_event(t) FOR_NETCON(w1) { w1 = 0 }"}
                }
            }"#,
        ))
        .expect("valid");
        assert!(m.net_send_used);
        assert!(m.net_event_used);
        assert!(m.for_netcon_used);
        assert_eq!(m.watch_statements.len(), 1);
        assert!(m.net_receive_buffering_required());
        assert!(m.net_send_buffer_required());
        assert!(m.variables_written.contains("w1"));
    }

    #[test]
    fn watch_slots_follow_statement_order() {
        let m = build(&file(
            r#"{
                "mod_file": "t", "suffix": "t", "point_process": true,
                "variables": [{"name": "thresh", "kinds": ["range", "parameter"], "value": -20}],
                "blocks": {
                    "initial": "WATCH (v > thresh) 2",
                    "net_receive": {
                        "params": ["w"],
                        "body": "WATCH (v > thresh) 2\nIF (w > 0) { WATCH (v < thresh) 3 }"
                    }
                }
            }"#,
        ))
        .expect("valid");
        let slots: Vec<Option<usize>> = m.watch_statements.iter().map(|w| w.slot).collect();
        assert_eq!(slots, vec![Some(0), Some(1), Some(2)]);
        let mut initial_slots = Vec::new();
        m.initial.as_ref().expect("initial").walk_stmts(&mut |stmt| {
            if let Stmt::Watch(w) = stmt {
                initial_slots.push(w.slot);
            }
        });
        assert_eq!(initial_slots, vec![Some(2)]);
    }

    #[test]
    fn unsupported_method_is_fatal() {
        let errs = build(&file(
            r#"{"mod_file": "t", "suffix": "t", "blocks": {"state": "x = 1"},
                "solves": [{"block": "states", "method": "runge", "span": [10, 20]}]}"#,
        ))
        .expect_err("invalid");
        assert_eq!(errs[0].code, Some(codes::E0102));
        assert!(errs[0].message.contains("runge"));
        assert_eq!(errs[0].span.start, 10);
    }

    #[test]
    fn undeclared_solve_block_is_fatal() {
        let errs = build(&file(
            r#"{"mod_file": "t", "suffix": "t",
                "solves": [{"block": "kin", "method": "sparse"}]}"#,
        ))
        .expect_err("invalid");
        assert_eq!(errs[0].code, Some(codes::E0101));
    }

    #[test]
    fn ion_variable_naming_is_checked() {
        let errs = build(&file(
            r#"{"mod_file": "t", "suffix": "t",
                "variables": [{"name": "gna", "kinds": ["assigned"]}],
                "ions": [{"name": "na", "reads": ["gna"]}]}"#,
        ))
        .expect_err("invalid");
        assert!(errs.iter().any(|e| e.code == Some(codes::E0103)));
    }

    #[test]
    fn before_after_attachment_is_closed() {
        let errs = build(&file(
            r#"{"mod_file": "t", "suffix": "t",
                "blocks": {"before_after": [{"kind": "before", "attach": "finitialize", "body": ""}]}}"#,
        ))
        .expect_err("invalid");
        assert_eq!(errs[0].code, Some(codes::E0104));
    }

    #[test]
    fn net_move_outside_net_receive_is_fatal() {
        let errs = build(&file(
            r#"{"mod_file": "t", "suffix": "t", "blocks": {"initial": "net_move(t + 1)"}}"#,
        ))
        .expect_err("invalid");
        assert_eq!(errs[0].code, Some(codes::E0106));
    }

    #[test]
    fn parse_errors_name_the_block() {
        let errs = build(&file(
            r#"{"mod_file": "t", "suffix": "t", "blocks": {"breakpoint": "x = (1 +"}}"#,
        ))
        .expect_err("invalid");
        assert_eq!(errs[0].code, Some(codes::E0001));
        assert!(errs[0].message.starts_with("BREAKPOINT"));
    }

    #[test]
    fn derivimplicit_primes_in_equation_order() {
        let m = build(&file(
            r#"{
                "mod_file": "t", "suffix": "t",
                "variables": [
                    {"name": "m", "kinds": ["state"]},
                    {"name": "h", "kinds": ["state"]}
                ],
                "solves": [{"block": "states", "method": "derivimplicit"}],
                "blocks": {
                    "state": "DERIVIMPLICIT states",
                    "derivimplicit": [{"name": "states", "body": "Dh = -h Dm = -m"}]
                }
            }"#,
        ))
        .expect("valid");
        assert_eq!(names(&m.prime_variables), vec!["h", "m"]);
        assert_eq!(m.num_equations, 2);
        assert!(m.derivimplicit_used());
    }

    #[test]
    fn unknown_derivimplicit_callback_is_fatal() {
        let errs = build(&file(
            r#"{"mod_file": "t", "suffix": "t", "blocks": {"state": "DERIVIMPLICIT nope"}}"#,
        ))
        .expect_err("invalid");
        assert_eq!(errs[0].code, Some(codes::E0105));
    }

    #[test]
    fn load_error_display_names_the_path() {
        let err = load_model(Path::new("/nonexistent/model.json")).expect_err("missing");
        assert!(err.to_string().starts_with("/nonexistent/model.json: "));
    }
}
