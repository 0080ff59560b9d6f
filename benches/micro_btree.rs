#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vesper::storage::{Durability, Env, EnvOptions};

fn bench_env() -> Env {
    Env::ephemeral(
        EnvOptions::default()
            .page_size(4096)
            .durability(Durability::None),
    )
    .expect("ephemeral env")
}

fn bench_commit_small_batches(c: &mut Criterion) {
    let env = bench_env();
    let mut next = 0u64;
    c.bench_function("commit_16_inserts", |b| {
        b.iter(|| {
            let mut tx = env.begin_write().expect("writer");
            let tree = tx.create_tree("bench").expect("tree");
            for _ in 0..16 {
                next += 1;
                tx.put(&tree, &next.to_be_bytes(), b"benchmark-value-payload")
                    .expect("put");
            }
            black_box(tx.commit().expect("commit"));
        })
    });
}

fn bench_point_reads(c: &mut Criterion) {
    let env = bench_env();
    let mut tx = env.begin_write().expect("writer");
    let tree = tx.create_tree("bench").expect("tree");
    for i in 0..10_000u64 {
        tx.put(&tree, &i.to_be_bytes(), b"benchmark-value-payload")
            .expect("put");
    }
    tx.commit().expect("commit");

    let read = env.begin_read().expect("reader");
    let tree = read.open_tree("bench").expect("tree");
    let mut key = 0u64;
    c.bench_function("get_hot_10k", |b| {
        b.iter(|| {
            key = (key + 7919) % 10_000;
            black_box(read.get(&tree, &key.to_be_bytes()).expect("get"));
        })
    });
}

fn bench_range_scan(c: &mut Criterion) {
    let env = bench_env();
    let mut tx = env.begin_write().expect("writer");
    let tree = tx.create_tree("bench").expect("tree");
    for i in 0..10_000u64 {
        tx.put(&tree, &i.to_be_bytes(), b"benchmark-value-payload")
            .expect("put");
    }
    tx.commit().expect("commit");

    let read = env.begin_read().expect("reader");
    let tree = read.open_tree("bench").expect("tree");
    c.bench_function("scan_10k", |b| {
        b.iter(|| {
            let mut count = 0usize;
            let mut cursor = read.iter(&tree).expect("cursor");
            while let Some(pair) = cursor.next_entry().expect("entry") {
                black_box(pair);
                count += 1;
            }
            assert_eq!(count, 10_000);
        })
    });
}

criterion_group!(
    benches,
    bench_commit_small_batches,
    bench_point_reads,
    bench_range_scan
);
criterion_main!(benches);
