//! Benchmarks for the storage engines and the record codec.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ringkv_storage::keystore::ns;
use ringkv_storage::wal::{FsyncPolicy, Wal, WalEntry};
use ringkv_storage::{KeyStore, MemoryStore, Record, WalStore};
use tempfile::TempDir;

fn encoded_record(version: u64, value_size: usize) -> Vec<u8> {
    Record::new(version, 0, 0x1234_5678, vec![0x42u8; value_size]).encode()
}

fn bench_wal_store_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_store_put");

    for size in [64, 1024, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let store = WalStore::open(dir.path(), FsyncPolicy::None).unwrap();

            let mut i = 0u64;
            b.iter(|| {
                let key = format!("key_{}", i);
                store
                    .put(ns::DATA, key.as_bytes(), &encoded_record(i, size))
                    .unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_memory_get(c: &mut Criterion) {
    let store = MemoryStore::new();
    for i in 0..1000u64 {
        store
            .put(ns::DATA, format!("key_{:04}", i).as_bytes(), &encoded_record(i, 256))
            .unwrap();
    }

    c.bench_function("memory_get_decode", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = format!("key_{:04}", i % 1000);
            let raw = store.get(ns::DATA, key.as_bytes()).unwrap().unwrap();
            black_box(Record::decode(&raw).unwrap());
            i += 1;
        });
    });
}

fn bench_range_scan(c: &mut Criterion) {
    let store = MemoryStore::new();
    for i in 0..10_000u64 {
        store
            .put(ns::MERKLE, format!("0C/0000/{:012X}", i).as_bytes(), b"leaf")
            .unwrap();
    }

    c.bench_function("range_scan_10k", |b| {
        b.iter(|| {
            let mut n = 0usize;
            store
                .range(ns::MERKLE, b"0C/0000/", b"0C/0001/", &mut |_, _| {
                    n += 1;
                    true
                })
                .unwrap();
            black_box(n);
        });
    });
}

fn bench_wal_append(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let wal_path = dir.path().join("bench.wal");
    let mut wal = Wal::open(&wal_path, FsyncPolicy::None).unwrap();

    c.bench_function("wal_append", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let entry = WalEntry::put(format!("dk_{}", i).as_bytes(), &encoded_record(i, 128));
            wal.append(&entry).unwrap();
            i += 1;
        });
    });
}

criterion_group!(
    benches,
    bench_wal_store_put,
    bench_memory_get,
    bench_range_scan,
    bench_wal_append
);
criterion_main!(benches);
