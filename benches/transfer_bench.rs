//! Benchmarks for slice planning and pooled reads.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::TempDir;

use gds_io::backend::driver::PosixLoader;
use gds_io::backend::policy::{BackendPolicy, PolicyMode, PolicySettings};
use gds_io::backend::shim::CapabilityShim;
use gds_io::config::TransferConfig;
use gds_io::transfer::slicing::plan_slices;
use gds_io::transfer::{ChunkedInput, GdsRuntime};

const MIB: usize = 1024 * 1024;

fn bench_plan_slices(c: &mut Criterion) {
    c.bench_function("plan_slices_1gib_4mib", |b| {
        b.iter(|| {
            let slices = plan_slices(black_box(0), black_box(1024 * MIB), 4 * MIB);
            black_box(slices);
        })
    });
}

fn bench_pooled_read(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bench.bin");
    let size = 64 * MIB;
    std::fs::write(&path, vec![7u8; size]).unwrap();

    let policy = BackendPolicy::new(PolicySettings {
        mode: PolicyMode::Required,
        backend_config: "/nonexistent/cufile.json".into(),
        backend_config_env: "GDS_IO_BENCH_JSON".to_string(),
    });
    let runtime = GdsRuntime::builder()
        .policy(Arc::new(policy))
        .shim(Arc::new(CapabilityShim::new(PosixLoader)))
        .host_memory()
        .config(TransferConfig {
            direct_io: false,
            ..TransferConfig::default()
        })
        .build()
        .unwrap();

    let input = ChunkedInput::open(&runtime, &path).unwrap();
    let mut buffer = runtime.allocator().allocate(size).unwrap();

    let mut group = c.benchmark_group("pooled_read");
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("posix_64mib", |b| {
        b.iter(|| {
            let read = input.read_into(0, &mut buffer).unwrap();
            black_box(read);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_plan_slices, bench_pooled_read);
criterion_main!(benches);
