use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use strata_core::chunk::BincodeSerializer;
use strata_core::kv::StoreBackend;
use strata_core::segment::FixedSegmentFinder;
use strata_core::update::WriteStrategy;
use strata_core::{Closeable, StorageConfig, TimeSeriesDb, MAX_TIME};
use tempfile::tempdir;

const VALUE_COUNT: i64 = 200_000;

fn open(dir: &std::path::Path, strategy: WriteStrategy) -> Arc<TimeSeriesDb<String, i64>> {
    TimeSeriesDb::builder("bench")
        .config(StorageConfig {
            data_dir: dir.to_path_buf(),
            backend: StoreBackend::Memory,
            write_strategy: strategy,
            ..Default::default()
        })
        .serializer(Arc::new(BincodeSerializer::<i64>::new()))
        .segment_finder(Arc::new(FixedSegmentFinder::new(50_000)))
        .open()
        .unwrap()
}

fn benchmark_update_strategies(c: &mut Criterion) {
    let mut group = c.benchmark_group("update_strategies");
    group.throughput(Throughput::Elements(VALUE_COUNT as u64));
    group.sample_size(10);

    let strategies = [
        ("sequential", WriteStrategy::Sequential),
        ("parallel_2", WriteStrategy::Parallel { workers: 2 }),
        ("parallel_4", WriteStrategy::Parallel { workers: 4 }),
    ];
    for (name, strategy) in strategies {
        group.bench_with_input(BenchmarkId::new("update", name), &strategy, |b, &strategy| {
            b.iter(|| {
                let dir = tempdir().unwrap();
                let db = open(dir.path(), strategy);
                let summary = db.update(&"bench".to_string(), 0..VALUE_COUNT, &mut ()).unwrap();
                black_box(summary);
                db.close().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_shifts(c: &mut Criterion) {
    let mut group = c.benchmark_group("shifts");
    let dir = tempdir().unwrap();
    let db = open(dir.path(), WriteStrategy::default());
    let key = "bench".to_string();
    db.update(&key, 0..VALUE_COUNT, &mut ()).unwrap();

    for &n in [1u64, 1_000, 100_000].iter() {
        group.bench_with_input(BenchmarkId::new("previous", n), &n, |b, &n| {
            b.iter(|| black_box(db.get_previous_value(&key, MAX_TIME, n).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("next", n), &n, |b, &n| {
            b.iter(|| black_box(db.get_next_value(&key, 0, n).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_update_strategies, benchmark_shifts);
criterion_main!(benches);
