use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use mcc::backend::BackendKind;
use mcc::codegen::CodegenOptions;
use mcc::model::ModelFile;
use mcc::pass::PassId;
use mcc::pipeline::{run_pipeline, CompilationState};
use mcc::*;

// Fixture models, from a plain density channel up to an event-driven
// mechanism with a Newton solve.

const LEAK: &str = include_str!("../models/leak.json");
const HH: &str = include_str!("../models/hh.json");
const EXPSYN: &str = include_str!("../models/expsyn.json");
const CADYN: &str = include_str!("../models/cadyn.json");

fn scenarios() -> [(&'static str, &'static str); 4] {
    [
        ("leak", LEAK),
        ("hh", HH),
        ("expsyn", EXPSYN),
        ("cadyn", CADYN),
    ]
}

fn parse(source: &str) -> ModelFile {
    serde_json::from_str(source).expect("benchmark fixture must parse")
}

fn metadata(source: &str) -> model::ModelMetadata {
    model::build(&parse(source)).expect("benchmark fixture must be valid")
}

/// Synthetic density channel with `n` range parameters and as many states.
fn generate_scaling_model(n: usize) -> String {
    let mut variables = Vec::new();
    let mut body = Vec::new();
    for i in 0..n {
        variables.push(format!(
            r#"{{"name": "p{i}", "kinds": ["range", "parameter"], "value": {i}}}"#
        ));
        variables.push(format!(r#"{{"name": "s{i}", "kinds": ["state"]}}"#));
        body.push(format!("s{i} = s{i} + dt*(p{i} - s{i})"));
    }
    format!(
        r#"{{"mod_file": "scale", "suffix": "scale", "variables": [{}],
            "blocks": {{"state": "{}"}}}}"#,
        variables.join(", "),
        body.join(" ")
    )
}

// Model JSON to metadata.
fn bench_build_model(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_model");
    for (name, source) in scenarios() {
        let file = parse(source);
        group.bench_with_input(BenchmarkId::from_parameter(name), &file, |b, file| {
            b.iter(|| black_box(model::build(black_box(file))))
        });
    }
    group.finish();
}

// Variable ordering and index semantics.
fn bench_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_plan");
    for (name, source) in scenarios() {
        let m = metadata(source);
        group.bench_with_input(BenchmarkId::from_parameter(name), &m, |b, m| {
            b.iter(|| black_box(layout::plan(black_box(m))))
        });
    }
    group.finish();
}

// Emission alone, per backend, on the HH channel.
fn bench_codegen_per_backend(c: &mut Criterion) {
    let mut group = c.benchmark_group("codegen/hh");
    let m = metadata(HH);
    let plan = layout::plan(&m);
    let calls = calls::classify(&m);
    for kind in BackendKind::ALL {
        let options = CodegenOptions {
            backend: kind,
            provenance: false,
        };
        group.bench_function(kind.to_string(), |b| {
            b.iter(|| black_box(codegen::codegen(&m, &plan, &calls, &options, None)))
        });
    }
    group.finish();
}

// Whole pipeline from parsed model to generated text.
fn bench_full_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_pipeline");
    let options = CodegenOptions::default();
    for (name, source) in scenarios() {
        group.bench_function(name, |b| {
            b.iter_batched(
                || CompilationState::new(source.to_string(), parse(source)),
                |mut state| {
                    let result = run_pipeline(&mut state, PassId::Codegen, &options, false, |_, _| {});
                    black_box((result, state.generated))
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

// Layout and emission cost against model size.
fn bench_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("scaling");
    let options = CodegenOptions::default();
    for n in [1_usize, 10, 50, 200] {
        let source = generate_scaling_model(n);
        let m = metadata(&source);
        let calls = calls::classify(&m);
        group.bench_with_input(BenchmarkId::new("layout", n), &m, |b, m| {
            b.iter(|| black_box(layout::plan(m)))
        });
        let plan = layout::plan(&m);
        group.bench_with_input(BenchmarkId::new("codegen", n), &m, |b, m| {
            b.iter(|| black_box(codegen::codegen(m, &plan, &calls, &options, None)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_build_model,
    bench_layout,
    bench_codegen_per_backend,
    bench_full_pipeline,
    bench_scaling,
);
criterion_main!(benches);
