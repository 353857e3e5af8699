//! Benchmarks for the metadata cache.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use metadata_cache::cache::partition_candidates;
use metadata_cache::workload::{Record, RecordClass};
use metadata_cache::{
    Address, Cache, Config, FlushFlags, InsertFlags, MemStore, ProtectFlags, UnprotectFlags,
};

const ENTRIES: u64 = 10_000;
const SLOT: u64 = 64;

fn filled_cache() -> Cache<MemStore> {
    let mut config = Config::default();
    config.cache.max_size = 4 * 1024 * 1024;
    config.cache.min_clean_size = 0;
    let mut cache = Cache::new(config, MemStore::new((ENTRIES * SLOT) as usize)).unwrap();
    let class = RecordClass::shared();
    for i in 0..ENTRIES {
        cache
            .insert_entry(
                &class,
                Address(i * SLOT),
                Box::new(Record::new(vec![i as u8; 40])),
                InsertFlags::default(),
            )
            .unwrap();
    }
    cache
}

fn bench_insert_and_flush(c: &mut Criterion) {
    c.bench_function("insert_flush_10k", |b| {
        b.iter(|| {
            let mut cache = filled_cache();
            cache.flush(FlushFlags::default()).unwrap();
            black_box(cache.stats().bytes_written);
        })
    });
}

fn bench_protect_hits(c: &mut Criterion) {
    let mut cache = filled_cache();
    let class = RecordClass::shared();

    c.bench_function("protect_unprotect_hit_10k", |b| {
        b.iter(|| {
            for i in (0..ENTRIES).step_by(7) {
                let addr = Address(i * SLOT);
                cache
                    .protect(&class, addr, &(), ProtectFlags::read_only())
                    .unwrap();
                cache.unprotect(addr, UnprotectFlags::default()).unwrap();
            }
        })
    });
}

fn bench_reclaim(c: &mut Criterion) {
    c.bench_function("reclaim_to_quarter_budget_10k", |b| {
        b.iter(|| {
            let mut cache = filled_cache();
            cache.flush(FlushFlags::default()).unwrap();
            let quarter = cache.size() / 4;
            cache.set_max_size(quarter, 0).unwrap();
            cache.reclaim_space().unwrap();
            black_box(cache.len());
        })
    });
}

fn bench_partition(c: &mut Criterion) {
    c.bench_function("partition_candidates_1k_ranks", |b| {
        b.iter(|| {
            let mut covered = 0;
            for rank in 0..1000 {
                covered += partition_candidates(black_box(1_000_003), rank, 1000).len();
            }
            black_box(covered);
        })
    });
}

criterion_group!(
    benches,
    bench_insert_and_flush,
    bench_protect_hits,
    bench_reclaim,
    bench_partition,
);
criterion_main!(benches);
