//! Benchmarks comparing BrimMap to the standard library HashMap.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashMap;

use brim::BrimMap;

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1_000usize, 65_536, 1_048_576] {
        group.bench_with_input(BenchmarkId::new("HashMap", size), &size, |b, &n| {
            b.iter(|| {
                let mut map: HashMap<u64, u64> = HashMap::new();
                for i in 0..n as u64 {
                    map.insert(i, i);
                }
                black_box(map)
            });
        });

        group.bench_with_input(BenchmarkId::new("BrimMap", size), &size, |b, &n| {
            b.iter(|| {
                let mut map: BrimMap<u64, u64> = BrimMap::new();
                for i in 0..n as u64 {
                    map.put(i, i).unwrap();
                }
                black_box(map)
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for size in [1_000usize, 65_536, 1_048_576] {
        let mut hashmap: HashMap<u64, u64> = HashMap::new();
        let mut brim: BrimMap<u64, u64> = BrimMap::new();
        for i in 0..size as u64 {
            hashmap.insert(i, i);
            brim.put(i, i).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("HashMap", size), &size, |b, &n| {
            b.iter(|| {
                let mut sum = 0u64;
                for i in 0..n as u64 {
                    if let Some(v) = hashmap.get(&i) {
                        sum = sum.wrapping_add(*v);
                    }
                }
                black_box(sum)
            });
        });

        group.bench_with_input(BenchmarkId::new("BrimMap", size), &size, |b, &n| {
            b.iter(|| {
                let mut sum = 0u64;
                for i in 0..n as u64 {
                    if let Some(v) = brim.get(&i) {
                        sum = sum.wrapping_add(*v);
                    }
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

/// Fill a pre-sized table to its very last slot, the regime standard maps
/// cannot enter at all.
fn bench_full_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("fill_to_100_percent");
    group.sample_size(20);

    for size in [65_536usize, 1_048_576] {
        group.bench_with_input(BenchmarkId::new("BrimMap", size), &size, |b, &n| {
            b.iter(|| {
                let mut map: BrimMap<u64, u64> = BrimMap::with_capacity(n).unwrap();
                for i in 0..n as u64 {
                    map.put(i, i).unwrap();
                }
                assert_eq!(map.capacity(), n);
                black_box(map)
            });
        });

        // Lookups against a brimful table: every probe window is dense.
        let mut full: BrimMap<u64, u64> = BrimMap::with_capacity(size).unwrap();
        for i in 0..size as u64 {
            full.put(i, i).unwrap();
        }
        group.bench_with_input(BenchmarkId::new("BrimMap_get", size), &size, |b, &n| {
            b.iter(|| {
                let mut sum = 0u64;
                for i in 0..n as u64 {
                    sum = sum.wrapping_add(*full.get(&i).unwrap());
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_insert, bench_lookup, bench_full_load);
criterion_main!(benches);
