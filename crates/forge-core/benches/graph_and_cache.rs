use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use forge_core::content_store::ContentStore;
use forge_core::fingerprint::Fingerprint;
use forge_core::graph::{BuildGraph, Target, TargetId, TargetType};

fn linear_chain(n: usize) -> Vec<Target> {
    (0..n)
        .map(|i| {
            let deps = if i == 0 { vec![] } else { vec![TargetId::new(format!("//p:{}", i - 1))] };
            Target::new(format!("//p:{i}"), TargetType::Library, "rust").with_deps(deps)
        })
        .collect()
}

fn bench_graph_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("graph_build");
    for &n in &[100usize, 1_000, 10_000] {
        let targets = linear_chain(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &targets, |b, targets| {
            b.iter(|| BuildGraph::build(black_box(targets.clone())).unwrap());
        });
    }
    group.finish();
}

fn bench_topo_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("topo_order");
    for &n in &[100usize, 1_000, 10_000] {
        let graph = BuildGraph::build(linear_chain(n)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &graph, |b, graph| {
            b.iter(|| black_box(graph.topo_order()));
        });
    }
    group.finish();
}

fn bench_fingerprint_of_bytes(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint_of_bytes");
    for &size in &[1_024usize, 64 * 1024, 1024 * 1024] {
        let bytes = vec![0xab_u8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| Fingerprint::of_bytes(black_box(bytes)));
        });
    }
    group.finish();
}

fn bench_content_store_round_trip(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(dir.path()).unwrap();
    let bytes = vec![0x42_u8; 64 * 1024];

    c.bench_function("content_store_store_and_load_64kb", |b| {
        b.iter(|| {
            let fp = store.store(black_box(&bytes)).unwrap();
            black_box(store.load(&fp).unwrap());
        });
    });
}

criterion_group!(benches, bench_graph_build, bench_topo_order, bench_fingerprint_of_bytes, bench_content_store_round_trip);
criterion_main!(benches);
