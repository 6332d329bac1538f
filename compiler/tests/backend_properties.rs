// Kernel properties that must hold on every CoreNEURON backend: shadow
// reduction for point processes, matrix sign convention, the
// finite-difference conductance, one-shot WATCH and fallback isolation.

use std::path::{Path, PathBuf};

use mcc::backend::BackendKind;
use mcc::calls::classify;
use mcc::codegen::{codegen, CodegenOptions, CodegenResult};
use mcc::diag::codes;
use mcc::layout;
use mcc::model::{build, load_model, ModelFile};

const CORENEURON_BACKENDS: [BackendKind; 4] = [
    BackendKind::Cpp,
    BackendKind::Acc,
    BackendKind::Cuda,
    BackendKind::Ispc,
];

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn generate_file(file: &ModelFile, backend: BackendKind) -> CodegenResult {
    let metadata = build(file).expect("valid model");
    let plan = layout::plan(&metadata);
    let calls = classify(&metadata);
    let options = CodegenOptions {
        backend,
        provenance: false,
    };
    codegen(&metadata, &plan, &calls, &options, None)
}

fn generate_json(json: &str, backend: BackendKind) -> CodegenResult {
    let file: ModelFile = serde_json::from_str(json).expect("model json");
    generate_file(&file, backend)
}

fn generate_fixture(name: &str, backend: BackendKind) -> CodegenResult {
    let (_, file) = load_model(&project_root().join("models").join(name)).expect("fixture");
    generate_file(&file, backend)
}

/// Text from `marker` up to the end of the enclosing top-level function.
fn section<'t>(text: &'t str, marker: &str) -> &'t str {
    let start = text
        .find(marker)
        .unwrap_or_else(|| panic!("missing {marker}"));
    let rest = &text[start..];
    let end = rest.find("\n}\n").map(|i| i + 3).unwrap_or(rest.len());
    &rest[..end]
}

// ── Shadow necessity ──

#[test]
fn point_process_current_only_touches_the_matrix_in_the_reduction() {
    for backend in CORENEURON_BACKENDS {
        let result = generate_fixture("expsyn.json", backend);
        assert!(result.diagnostics.is_empty(), "{backend}: {:?}", result.diagnostics);
        let text = &result.generated.primary;
        let kernel = &text[text.find("/** update current */").expect("nrn_cur")..];
        let (per_instance, reduction) = kernel
            .split_once("shadow_d[id] = g;")
            .unwrap_or_else(|| panic!("{backend}: no shadow write"));
        assert!(!per_instance.contains("vec_rhs[node_id]"), "{backend}");
        assert!(!per_instance.contains("vec_d[node_id]"), "{backend}");
        assert!(reduction.contains("vec_rhs[node_id]"), "{backend}");
        assert!(reduction.contains("shadow_rhs[id]"), "{backend}");
    }
}

// ── Sign convention ──

#[test]
fn electrode_current_flips_matrix_operators() {
    let clamp = r#"{
        "mod_file": "clamp", "suffix": "IClamp", "point_process": true, "electrode_current": true,
        "variables": [
            {"name": "amp", "kinds": ["range", "parameter"]},
            {"name": "i", "kinds": ["range", "assigned"]}
        ],
        "currents": ["i"],
        "blocks": {"breakpoint": "i = amp"}
    }"#;
    let text = generate_json(clamp, BackendKind::Cpp).generated.primary;
    assert!(text.contains("vec_rhs[node_id] += shadow_rhs[id];"));
    assert!(text.contains("vec_d[node_id] -= shadow_d[id];"));

    let text = generate_fixture("leak.json", BackendKind::Cpp).generated.primary;
    assert!(text.contains("vec_rhs[node_id] -= rhs;"));
    assert!(text.contains("vec_d[node_id] += g;"));
}

// ── Finite-difference conductance ──

#[test]
fn current_is_evaluated_at_v_and_v_plus_perturbation() {
    for backend in CORENEURON_BACKENDS {
        let text = generate_fixture("hh.json", backend).generated.primary;
        let kernel = section(&text, "/** update current */");
        let line = |prefix: &str| -> String {
            kernel
                .lines()
                .map(str::trim)
                .find(|l| l.starts_with(prefix))
                .unwrap_or_else(|| panic!("{backend}: missing {prefix}"))
                .to_string()
        };
        let perturbed = line("double g = nrn_current_hh(");
        let base = line("double rhs = nrn_current_hh(");
        assert!(perturbed.ends_with(", v+0.001);"), "{backend}: {perturbed}");
        assert!(base.ends_with(", v);"), "{backend}: {base}");
        assert_eq!(
            perturbed.trim_start_matches("double g = ").replace("v+0.001", "v"),
            base.trim_start_matches("double rhs = "),
        );
        assert!(kernel.contains("g = (g-rhs)/0.001;"), "{backend}");
    }
}

// ── WATCH one-shot ──

#[test]
fn watch_check_fires_at_most_one_statement_per_pass() {
    let json = r#"{
        "mod_file": "tripwire", "suffix": "Tripwire", "point_process": true,
        "variables": [
            {"name": "a", "kinds": ["range", "parameter"], "value": -30},
            {"name": "b", "kinds": ["range", "parameter"], "value": -20},
            {"name": "c", "kinds": ["range", "parameter"], "value": -10}
        ],
        "blocks": {
            "net_receive": {
                "params": ["w"],
                "body": "WATCH (v > a) 1\nWATCH (v > b) 2\nWATCH (v > c) 3"
            }
        }
    }"#;
    for backend in [BackendKind::Cpp, BackendKind::Acc] {
        let text = generate_json(json, backend).generated.primary;
        let kernel = section(&text, "/** routine to check watch activation */");
        assert_eq!(kernel.matches("bool watch_untriggered = true;").count(), 1);
        assert_eq!(kernel.matches("&2 && watch_untriggered)").count(), 3);
        let lines: Vec<&str> = kernel.lines().map(str::trim).collect();
        let sends: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with("net_send_buffering("))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(sends.len(), 3);
        for i in sends {
            assert_eq!(lines[i - 1], "watch_untriggered = false;", "{backend}");
        }
    }
}

#[test]
fn identical_watch_statements_arm_distinct_slots() {
    let json = r#"{
        "mod_file": "twinwatch", "suffix": "TwinWatch", "point_process": true,
        "variables": [
            {"name": "thresh", "kinds": ["range", "parameter"], "value": -20},
            {"name": "gs", "kinds": ["state"]}
        ],
        "blocks": {
            "initial": "WATCH (v > thresh) 2\ngs = 0",
            "net_receive": {"params": ["w"], "body": "WATCH (v > thresh) 2\ngs = gs + w"}
        }
    }"#;
    for backend in [BackendKind::Cpp, BackendKind::Acc] {
        let result = generate_json(json, backend);
        assert!(result.diagnostics.is_empty(), "{backend}: {:?}", result.diagnostics);
        let text = &result.generated.primary;
        for slot in 0..2 {
            let activation = format!("nrn_watch_activate(inst, id, pnodecount, {slot}, v, watch_remove);");
            assert!(text.contains(&activation), "{backend}: slot {slot} never armed");
        }
    }
}

#[test]
fn watch_outside_event_blocks_is_rejected() {
    let json = r#"{
        "mod_file": "stray", "suffix": "Stray", "point_process": true,
        "variables": [
            {"name": "thresh", "kinds": ["range", "parameter"], "value": -20},
            {"name": "i", "kinds": ["range", "assigned"]}
        ],
        "currents": ["i"],
        "blocks": {"breakpoint": "WATCH (v > thresh) 2\ni = 0"}
    }"#;
    let result = generate_json(json, BackendKind::Cpp);
    assert!(result
        .diagnostics
        .iter()
        .any(|d| d.code == Some(codes::E0110)), "{:?}", result.diagnostics);
    assert!(!result.generated.primary.contains("nrn_watch_activate(inst, id, pnodecount, 0"));
}

// ── Fallback isolation ──

#[test]
fn fallback_leaves_other_kernels_untouched() {
    let model = |breakpoint: &str| {
        format!(
            r#"{{
                "mod_file": "leak", "suffix": "leak",
                "variables": [
                    {{"name": "x", "kinds": ["range", "assigned"]}},
                    {{"name": "il", "kinds": ["range", "assigned"]}}
                ],
                "currents": ["il"],
                "blocks": {{"initial": "x = 1", "breakpoint": {}}}
            }}"#,
            serde_json::to_string(breakpoint).unwrap()
        )
    };
    let plain = generate_json(&model("il = 0.1*v"), BackendKind::Ispc);
    let native = generate_json(
        &model("il = 0.1*v\nVERBATIM\n x = 2;\nENDVERBATIM"),
        BackendKind::Ispc,
    );
    assert!(plain.diagnostics.is_empty());
    assert_eq!(native.diagnostics.len(), 1);
    assert_eq!(native.diagnostics[0].code, Some(codes::W0100));

    for marker in ["export void ispc_nrn_init_leak(", "export void ispc_nrn_state_leak("] {
        assert_eq!(
            section(&plain.generated.primary, marker),
            section(&native.generated.primary, marker),
        );
    }
    assert!(plain.generated.primary.contains("export void ispc_nrn_cur_leak("));
    assert!(!native.generated.primary.contains("export void ispc_nrn_cur_leak("));
    let wrapper = native.generated.wrapper.expect("wrapper");
    assert!(wrapper.contains("void nrn_cur_leak(NrnThread* nt, Memb_list* ml, int type) {"));
}
