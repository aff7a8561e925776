//! Benchmarks for graph diffing.
//!
//! These benchmarks measure:
//! - `compute_diff` over snapshots of growing size with ~10% modified nodes
//! - the cost of attribute-level change reporting

#![allow(missing_docs)]

mod common;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use nereus::GraphDiffEngine;
use nereus::diff::DiffOptions;

fn bench_compute_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_diff");
    let engine = GraphDiffEngine::default();
    let options = DiffOptions::default();

    for nodes in &[100usize, 1_000, 10_000] {
        let base = common::snapshot("acme", "base", *nodes, 1);
        let target = common::snapshot("acme", "target", *nodes, 2);

        group.throughput(Throughput::Elements(*nodes as u64));
        group.bench_with_input(BenchmarkId::new("nodes", nodes), nodes, |b, _| {
            b.iter(|| {
                let result = engine
                    .compute_diff(&base, &target, &options)
                    .expect("diff failed");
                black_box(result)
            });
        });
    }

    group.finish();
}

fn bench_attribute_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("attribute_changes");
    let engine = GraphDiffEngine::default();
    let base = common::snapshot("acme", "base", 5_000, 1);
    let target = common::snapshot("acme", "target", 5_000, 2);

    for include in [false, true] {
        let options = DiffOptions {
            include_attribute_changes: include,
            ..DiffOptions::default()
        };
        group.bench_with_input(
            BenchmarkId::new("include_attribute_changes", include),
            &include,
            |b, _| {
                b.iter(|| {
                    let result = engine
                        .compute_diff(&base, &target, &options)
                        .expect("diff failed");
                    black_box(result)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_compute_diff, bench_attribute_changes);
criterion_main!(benches);
