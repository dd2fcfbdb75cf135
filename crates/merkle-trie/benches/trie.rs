//! Trie benchmarks.
//!
//! Covers the hot paths: pooled insertion, root-hash evaluation, lookup
//! against a materialised graph, and flush-through to the store.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use merkle_trie::{keccak256, MemStore, Trie};

fn pairs(count: u64) -> Vec<([u8; 32], [u8; 32])> {
    (0..count)
        .map(|i| {
            let key = keccak256(&i.to_be_bytes());
            let value = keccak256(&key);
            (key, value)
        })
        .collect()
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_and_root_hash");
    for size in [100u64, 1_000] {
        let entries = pairs(size);
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &entries, |b, entries| {
            b.iter(|| {
                let trie = Trie::new(Arc::new(MemStore::new()));
                for (key, value) in entries {
                    trie.set(key, value).unwrap();
                }
                black_box(trie.root_hash().unwrap())
            });
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let entries = pairs(1_000);
    let trie = Trie::new(Arc::new(MemStore::new()));
    for (key, value) in &entries {
        trie.set(key, value).unwrap();
    }
    trie.root_hash().unwrap();

    group.throughput(Throughput::Elements(entries.len() as u64));
    group.bench_function("materialised_1000", |b| {
        b.iter(|| {
            for (key, _) in &entries {
                black_box(trie.get(key).unwrap());
            }
        });
    });
    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");
    let entries = pairs(1_000);
    group.throughput(Throughput::Elements(entries.len() as u64));
    group.bench_function("1000_entries", |b| {
        b.iter(|| {
            let mut trie = Trie::new(Arc::new(MemStore::new()));
            for (key, value) in &entries {
                trie.set(key, value).unwrap();
            }
            trie.flush().unwrap();
            black_box(trie.root_hash().unwrap())
        });
    });
    group.finish();
}

fn bench_proof(c: &mut Criterion) {
    let mut group = c.benchmark_group("proof");
    let entries = pairs(1_000);
    let trie = Trie::new(Arc::new(MemStore::new()));
    for (key, value) in &entries {
        trie.set(key, value).unwrap();
    }
    trie.root_hash().unwrap();

    group.bench_function("prove_single", |b| {
        let (key, _) = &entries[500];
        b.iter(|| black_box(trie.prove(key).unwrap()));
    });
    group.finish();
}

criterion_group!(benches, bench_insert, bench_get, bench_flush, bench_proof);
criterion_main!(benches);
