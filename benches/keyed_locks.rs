//! Benchmarks for per-resource locking and the idempotent reconcile path
//!
//! Target: lock overhead well below one backend round trip

use ceph_reconciler::{
    ConnectionRegistry, KeyedLocks, MemoryConnector, PoolSpec, ReconcileMetrics, Reconciler,
    ResourcePath, VolumeSpec,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;

fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed_locks");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();

    group.bench_function("acquire_release_same_key", |b| {
        let locks = KeyedLocks::new();
        b.iter(|| {
            rt.block_on(async {
                let guard = locks.acquire(black_box("ceph/rbd")).await;
                drop(guard);
            });
        });
    });

    group.bench_function("try_acquire_1000_keys", |b| {
        let locks = KeyedLocks::new();
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("vol-{:04}", counter % 1000);
            let _ = black_box(locks.try_acquire(key));
        });
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed_locks");
    group.throughput(Throughput::Elements(100));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let locks = Arc::new(KeyedLocks::new());

    group.bench_function("concurrent_100_acquires_10_keys", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut handles = Vec::new();
                for i in 0..100 {
                    let locks = locks.clone();
                    handles.push(tokio::spawn(async move {
                        let _guard = locks.acquire(format!("vol-{}", i % 10)).await;
                    }));
                }
                for handle in handles {
                    let _ = handle.await;
                }
            });
        });
    });

    group.finish();
}

fn bench_parse_identifiers(c: &mut Criterion) {
    let mut group = c.benchmark_group("identifiers");
    group.throughput(Throughput::Elements(1));

    group.bench_function("parse_snapshot_path", |b| {
        b.iter(|| {
            let _ = ResourcePath::parse_snapshot(black_box("ceph1/rbd/vol1@snap1"));
        });
    });

    group.finish();
}

fn bench_reconcile_existing_volume(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconciler");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let connector = MemoryConnector::new();
    let registry = ConnectionRegistry::new(connector);
    let reconciler = Reconciler::new(registry, ReconcileMetrics::new().unwrap());

    let spec = rt.block_on(async {
        let pool = reconciler
            .create_pool(&PoolSpec::new("ceph", "rbd"))
            .await
            .unwrap();
        let spec = VolumeSpec::sized(pool, "vol1", 1 << 30);
        reconciler.create_volume(&spec).await.unwrap();
        spec
    });

    group.bench_function("create_volume_unchanged", |b| {
        b.iter(|| {
            rt.block_on(async {
                let _ = reconciler.create_volume(black_box(&spec)).await;
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_acquire_release,
    bench_contended,
    bench_parse_identifiers,
    bench_reconcile_existing_volume,
);
criterion_main!(benches);
