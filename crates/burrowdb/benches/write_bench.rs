//! Benchmarks for the burrowdb write path.
//!
//! Run with: cargo bench --package burrowdb
//!
//! ## Benchmark Categories
//!
//! - **Batch Commit**: staged write + durable commit throughput
//! - **Point Lookup**: hot-key gets against a populated store
//! - **Single Put**: one-record batch convenience path

use burrowdb::{Db, Options};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

fn populate(db: &Db, n: u32) {
    let mut batch = db.batch();
    for i in 0..n {
        batch.put(format!("metric/{i}").as_bytes(), &i.to_le_bytes());
    }
    batch.write().unwrap();
    batch.commit().unwrap();
}

fn bench_batch_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_commit");

    for &batch_size in &[100u32, 1000] {
        group.throughput(Throughput::Elements(u64::from(batch_size)));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let dir = TempDir::new().unwrap();
                let db = Db::open(dir.path(), Options::default()).unwrap();
                let mut round = 0u32;
                b.iter(|| {
                    let mut batch = db.batch();
                    for i in 0..batch_size {
                        let key = format!("series/{round}/{i}");
                        batch.put(key.as_bytes(), &i.to_le_bytes());
                    }
                    batch.write().unwrap();
                    batch.commit().unwrap();
                    round += 1;
                });
            },
        );
    }
    group.finish();
}

fn bench_point_lookup(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), Options::default()).unwrap();
    populate(&db, 10_000);

    c.bench_function("get_hot_key", |b| {
        b.iter(|| {
            let value = db.get(black_box(b"metric/5000")).unwrap();
            black_box(value)
        })
    });

    c.bench_function("get_miss", |b| {
        b.iter(|| {
            let value = db.get(black_box(b"absent/key")).unwrap();
            black_box(value)
        })
    });
}

fn bench_single_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let db = Db::open(dir.path(), Options::default()).unwrap();
    let mut i = 0u64;

    c.bench_function("single_put", |b| {
        b.iter(|| {
            db.put(format!("point/{i}").as_bytes(), b"21.5").unwrap();
            i += 1;
        })
    });
}

criterion_group!(
    benches,
    bench_batch_commit,
    bench_point_lookup,
    bench_single_put
);
criterion_main!(benches);
