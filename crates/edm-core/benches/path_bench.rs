//! # Path Benchmarks
//!
//! Performance benchmarks for path parsing, resolution, filtering and the
//! safe-links analysis.
//!
//! Run with: `cargo bench -p edm-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use edm_core::{Edm, GetOptions, ObjectId, Path};
use serde_json::{Value, json};
use std::hint::black_box;

const SPACE: &str = "bench";

/// Engine holding one root with `width` children, each with `width`
/// grandchildren.
fn create_fanout(width: usize) -> (Edm, ObjectId) {
    let mut edm = Edm::new();
    edm.define_schema(
        SPACE,
        &json!({
            "Node": {
                "n": {"dtype": "i"},
                "mass": {"unit": "kg"},
                "kids": {"link": "Node", "shape": [-1]}
            }
        }),
        false,
    )
    .expect("schema");

    let leaf = |i: usize| json!({"n": {"value": i}, "mass": {"value": i, "unit": "g"}});
    let kids: Vec<Value> = (0..width)
        .map(|i| {
            let mut node = leaf(i);
            node["kids"] = Value::Array((0..width).map(leaf).collect());
            node
        })
        .collect();
    let id = edm
        .create_object(SPACE, "Node", &json!({"n": {"value": 0}, "kids": kids}))
        .expect("create");
    (edm, id)
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_parse");
    for path in [
        "a",
        "a[1].b[2:].c[::-1].d",
        r#"csState[:].rveStates[:|sigmaHom["value"] < 85].rve.materials[:|name.endswith("0")].name"#,
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(path.len()), &path, |b, p| {
            b.iter(|| Path::parse(black_box(p)).expect("parse"));
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_get");
    for width in [4, 16] {
        let (edm, id) = create_fanout(width);
        for path in ["kids[:].kids[:].n", r#"kids[:].kids[:|n["value"] % 2 == 0].mass"#] {
            let opts = GetOptions::at(path);
            group.bench_with_input(
                BenchmarkId::new(path, width),
                &opts,
                |b, opts| {
                    b.iter(|| {
                        edm.get_object(SPACE, "Node", &id, black_box(opts))
                            .expect("get")
                    });
                },
            );
        }
    }
    group.finish();
}

fn bench_safe_links(c: &mut Criterion) {
    let mut group = c.benchmark_group("safe_links");
    for width in [4, 16] {
        let (edm, id) = create_fanout(width);
        let targets = vec!["kids[0].kids[:].mass".to_string()];
        group.bench_with_input(BenchmarkId::from_parameter(width), &targets, |b, t| {
            b.iter(|| edm.safe_links(SPACE, "Node", &id, black_box(t)).expect("safe"));
        });
    }
    group.finish();
}

fn bench_clone(c: &mut Criterion) {
    let mut group = c.benchmark_group("clone");
    group.sample_size(20);
    for width in [4, 8] {
        group.bench_function(BenchmarkId::from_parameter(width), |b| {
            b.iter_batched(
                || create_fanout(width),
                |(mut edm, id)| edm.clone_object(SPACE, "Node", &id, &[]).expect("clone"),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_resolve,
    bench_safe_links,
    bench_clone
);
criterion_main!(benches);
