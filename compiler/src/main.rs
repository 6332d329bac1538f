use clap::Parser;
use std::path::{Path, PathBuf};

use mcc::backend::BackendKind;
use mcc::codegen::{CodegenOptions, GeneratedCode};
use mcc::model::ModelMetadata;
use mcc::pass::PassId;
use mcc::pipeline::{run_pipeline, CompilationState};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Code,
    Layout,
    Semantics,
    Ast,
    BuildInfo,
}

impl EmitStage {
    fn terminal_pass(self) -> PassId {
        match self {
            EmitStage::Code => PassId::Codegen,
            EmitStage::Layout | EmitStage::Semantics | EmitStage::BuildInfo => PassId::PlanLayout,
            EmitStage::Ast => PassId::BuildModel,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum BackendArg {
    Cpp,
    Acc,
    Cuda,
    Ispc,
    Neuron,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Cpp => BackendKind::Cpp,
            BackendArg::Acc => BackendKind::Acc,
            BackendArg::Cuda => BackendKind::Cuda,
            BackendArg::Ispc => BackendKind::Ispc,
            BackendArg::Neuron => BackendKind::Neuron,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "mcc",
    version,
    about = "Mechanism code compiler: generates simulator kernels from analyzed ion-channel models"
)]
struct Cli {
    /// Analyzed model file (.json)
    model: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target backend
    #[arg(long, value_enum, default_value_t = BackendArg::Cpp)]
    backend: BackendArg,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Code)]
    emit: EmitStage,

    /// Omit the provenance hash from generated files
    #[arg(long)]
    no_provenance: bool,

    /// Print compiler passes and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let backend = BackendKind::from(cli.backend);

    if cli.verbose {
        eprintln!("mcc: model   = {}", cli.model.display());
        eprintln!("mcc: backend = {}", backend);
        eprintln!("mcc: emit    = {:?}", cli.emit);
    }

    // ── Load model file ──
    let (source, file) = match mcc::model::load_model(&cli.model) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("mcc: error: {}", e);
            std::process::exit(2);
        }
    };

    // ── Run passes ──
    let options = CodegenOptions {
        backend,
        provenance: !cli.no_provenance,
    };
    let mut state = CompilationState::new(source, file);
    let result = run_pipeline(
        &mut state,
        cli.emit.terminal_pass(),
        &options,
        cli.verbose,
        |_, diags| {
            for diag in diags {
                eprintln!("mcc: {}", diag);
            }
        },
    );
    if result.is_err() || state.has_error {
        std::process::exit(1);
    }

    if cli.verbose {
        if let (Some(m), Some(plan)) = (&state.metadata, &state.layout) {
            eprintln!(
                "mcc: {}: {} float variables ({} doubles), {} int variables",
                m.mod_suffix,
                plan.float_variables.len(),
                plan.float_variables_size(),
                plan.int_variables.len(),
            );
        }
    }

    // ── Write requested artifact ──
    let text = match cli.emit {
        EmitStage::Code => match &state.generated {
            Some(generated) => return write_code(generated, cli.output.as_deref(), backend),
            None => {
                eprintln!("mcc: error: no code generated");
                std::process::exit(1);
            }
        },
        EmitStage::Layout => state.layout.as_ref().map(|plan| to_json(plan)),
        EmitStage::Semantics => state.layout.as_ref().map(|plan| to_json(&plan.semantics)),
        EmitStage::BuildInfo => state.provenance.as_ref().map(|p| p.to_json()),
        EmitStage::Ast => state.metadata.as_ref().map(render_ast),
    };
    match text {
        Some(text) => write_output(cli.output.as_deref(), &text),
        None => {
            eprintln!("mcc: error: {:?} output unavailable", cli.emit);
            std::process::exit(1);
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_string_pretty(value) {
        Ok(json) => json + "\n",
        Err(e) => {
            eprintln!("mcc: error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Parsed blocks of the model, re-printed as NMODL.
fn render_ast(m: &ModelMetadata) -> String {
    let mut out = String::new();
    let mut section = |title: &str, body: String| {
        out.push_str(&format!("{} {{\n{}}}\n", title, body));
    };
    if let Some(block) = &m.initial {
        section("INITIAL", block.to_string());
    }
    if let Some(block) = &m.breakpoint {
        section("BREAKPOINT", block.to_string());
    }
    if let Some(block) = &m.nrn_state {
        section("STATE UPDATE", block.to_string());
    }
    for block in &m.derivimplicit_blocks {
        section(&format!("DERIVATIVE {}", block.name), block.body.to_string());
    }
    for block in &m.before_after {
        section("BEFORE/AFTER", block.body.to_string());
    }
    if let Some(nr) = &m.net_receive {
        section(
            &format!("NET_RECEIVE ({})", nr.params.join(", ")),
            nr.body.to_string(),
        );
        if let Some(init) = &nr.initial {
            section("NET_RECEIVE INITIAL", init.to_string());
        }
    }
    for callable in m.procedures.iter().chain(&m.functions) {
        let kind = if callable.is_function {
            "FUNCTION"
        } else {
            "PROCEDURE"
        };
        section(
            &format!("{} {}({})", kind, callable.name, callable.params.join(", ")),
            callable.body.to_string(),
        );
    }
    out
}

fn write_output(path: Option<&Path>, text: &str) {
    match path {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                eprintln!("mcc: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", text),
    }
}

/// Primary file at `path`; the wrapper goes next to it as `{stem}_wrapper.cpp`.
fn write_code(generated: &GeneratedCode, path: Option<&Path>, backend: BackendKind) {
    write_output(path, &generated.primary);
    let Some(wrapper) = &generated.wrapper else {
        return;
    };
    match path {
        Some(path) => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "mechanism".to_string());
            let wrapper_path = path.with_file_name(format!("{}_wrapper.cpp", stem));
            write_output(Some(&wrapper_path), wrapper);
        }
        None => {
            println!("// ---- {} host wrapper ----", backend);
            print!("{}", wrapper);
        }
    }
}
