// Integration tests for the pass pipeline and the command-line driver.
//
// - Every fixture model through every backend with the library pipeline
// - Minimal pass evaluation for each --emit target
// - Exit codes and output files of the binary

use std::path::{Path, PathBuf};
use std::process::Command;

use mcc::backend::BackendKind;
use mcc::codegen::CodegenOptions;
use mcc::diag::{codes, DiagLevel};
use mcc::model::load_model;
use mcc::pass::PassId;
use mcc::pipeline::{run_pipeline, CompilationState};

fn mcc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mcc"))
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn fixture(name: &str) -> PathBuf {
    project_root().join("models").join(name)
}

const FIXTURES: [&str; 6] = [
    "hh.json",
    "expsyn.json",
    "pulse.json",
    "cadyn.json",
    "watchsyn.json",
    "leak.json",
];

/// Fixtures using constructs the NEURON backend rejects.
const NEURON_UNSUPPORTED: [&str; 2] = ["cadyn.json", "watchsyn.json"];

fn compile(name: &str, backend: BackendKind) -> CompilationState {
    let (source, file) = load_model(&fixture(name)).expect("fixture");
    let mut state = CompilationState::new(source, file);
    let options = CodegenOptions {
        backend,
        provenance: true,
    };
    let _ = run_pipeline(&mut state, PassId::Codegen, &options, false, |_, _| {});
    state
}

#[test]
fn every_fixture_compiles_for_every_backend() {
    for name in FIXTURES {
        for backend in BackendKind::ALL {
            let state = compile(name, backend);
            if backend == BackendKind::Neuron && NEURON_UNSUPPORTED.contains(&name) {
                assert!(state.has_error, "{name} on {backend}");
                assert!(state
                    .diagnostics
                    .iter()
                    .any(|d| d.code == Some(codes::E0201)));
                assert!(state.generated.is_none());
                continue;
            }
            let errors: Vec<_> = state
                .diagnostics
                .iter()
                .filter(|d| d.level == DiagLevel::Error)
                .collect();
            assert!(errors.is_empty(), "{name} on {backend}: {:?}", errors);
            let generated = state.generated.as_ref().expect("generated");
            assert!(generated.primary.contains("Model Name"), "{name} on {backend}");
            let split = matches!(backend, BackendKind::Cuda | BackendKind::Ispc);
            assert_eq!(generated.wrapper.is_some(), split, "{name} on {backend}");
        }
    }
}

#[test]
fn fallback_warnings_do_not_fail_compilation() {
    let state = compile("cadyn.json", BackendKind::Cuda);
    assert!(!state.has_error);
    let warnings: Vec<_> = state
        .diagnostics
        .iter()
        .filter(|d| d.code == Some(codes::W0100))
        .collect();
    assert_eq!(warnings.len(), 2, "{:?}", warnings);
    assert!(warnings[0].message.starts_with("nrn_init_cad"));
    assert!(warnings[1].message.starts_with("nrn_state_cad"));
}

// ── Binary ──

fn run_mcc(args: &[&str]) -> std::process::Output {
    Command::new(mcc_binary())
        .args(args)
        .output()
        .expect("failed to run mcc")
}

#[test]
fn emit_layout_prints_json() {
    let path = fixture("expsyn.json");
    let output = run_mcc(&["--emit", "layout", path.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(json["tqitem_index"], serde_json::Value::Null);
    assert_eq!(json["float_variables"][0]["symbol"]["name"], "tau");
    assert_eq!(json["semantics"][1]["name"], "pntproc");
}

#[test]
fn emit_ast_reprints_blocks() {
    let path = fixture("expsyn.json");
    let output = run_mcc(&["--emit", "ast", path.to_str().unwrap()]);
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    assert!(text.contains("BREAKPOINT {"));
    assert!(text.contains("NET_RECEIVE (weight) {"));
}

#[test]
fn missing_model_exits_with_io_error() {
    let output = run_mcc(&["does/not/exist.json"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("mcc: error: "));
}

#[test]
fn unsupported_construct_exits_with_compile_error() {
    let path = fixture("watchsyn.json");
    let output = run_mcc(&["--backend", "neuron", path.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("mcc: error[E0201]: WATCH statements are not supported by the NEURON backend"));
    assert!(stderr.contains("hint: generate CoreNEURON code with '--backend cpp' instead"));
}

#[test]
fn wrapper_is_written_next_to_the_output() {
    let dir = std::env::temp_dir().join(format!("mcc_wrapper_test_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let out = dir.join("hh.ispc");
    let path = fixture("hh.json");
    let output = run_mcc(&[
        "--backend",
        "ispc",
        "-o",
        out.to_str().unwrap(),
        path.to_str().unwrap(),
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let kernels = std::fs::read_to_string(&out).unwrap();
    let wrapper = std::fs::read_to_string(dir.join("hh_wrapper.cpp")).unwrap();
    assert!(kernels.contains("export void ispc_nrn_init_hh("));
    assert!(wrapper.contains("void _hh_reg() {"));
    let _ = std::fs::remove_dir_all(&dir);
}
