//! Integration tests for speculative loads and checksum retries.

use metadata_cache::workload::{Record, RecordClass};
use metadata_cache::{
    Address, BackingStore, Cache, CacheError, Config, MemStore, ProtectFlags, UnprotectFlags,
};

fn cache_with(store: MemStore, attempts: u32) -> Cache<MemStore> {
    let mut config = Config::default();
    config.load.max_read_attempts = attempts;
    config.load.initial_backoff_us = 1;
    config.load.max_backoff_us = 8;
    Cache::new(config, store).unwrap()
}

#[test]
fn test_speculative_load_reads_remainder() {
    let store = MemStore::new(4096);
    let record = Record::new(vec![3u8; 200]);
    store.preload(Address(512), &record.encode());
    let mut cache = cache_with(store, 3);
    let class = RecordClass::shared();

    // The default guess is short: one read for the guess, one for the rest.
    cache
        .protect(&class, Address(512), &(), ProtectFlags::read_only())
        .unwrap();
    assert_eq!(cache.payload::<Record>(Address(512)).unwrap().body, vec![3u8; 200]);
    assert_eq!(cache.entry_status(Address(512)).unwrap().size, record.image_len());
    assert_eq!(cache.store().stats().total_reads, 2);
    cache.unprotect(Address(512), UnprotectFlags::default()).unwrap();

    // An explicit guess that covers the record needs a single read.
    let store = MemStore::new(4096);
    store.preload(Address(0), &record.encode());
    let mut cache = cache_with(store, 3);
    let guess = 256usize;
    cache
        .protect(&class, Address(0), &guess, ProtectFlags::default())
        .unwrap();
    assert_eq!(cache.store().stats().total_reads, 1);
    assert_eq!(cache.size(), record.image_len());
}

#[test]
fn test_guess_clamped_to_end_of_allocation() {
    let record = Record::new(vec![1u8; 10]);
    let image = record.encode();
    let store = MemStore::new(image.len() + 100);
    let eoa = store.end_of_allocation().0;
    store.preload(Address(100), &image);
    let mut cache = cache_with(store, 3);

    let guess = 4096usize;
    cache
        .protect(&RecordClass::shared(), Address(100), &guess, ProtectFlags::default())
        .unwrap();
    assert_eq!(cache.size(), image.len());
    assert_eq!(eoa, 100 + image.len() as u64);
}

#[test]
fn test_checksum_failures_retried_then_exhausted() {
    let record = Record::new(vec![8u8; 30]);

    let store = MemStore::new(1024);
    store.preload(Address(0), &record.encode());
    store.corrupt_next_reads(2);
    let mut cache = cache_with(store, 3);
    cache
        .protect(&RecordClass::shared(), Address(0), &(), ProtectFlags::default())
        .unwrap();
    assert_eq!(cache.stats().load_retries, 2);
    assert_eq!(cache.stats().loads, 1);

    let store = MemStore::new(1024);
    store.preload(Address(0), &record.encode());
    store.corrupt_next_reads(3);
    let mut cache = cache_with(store, 3);
    let err = cache
        .protect(&RecordClass::shared(), Address(0), &(), ProtectFlags::default())
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::ChecksumFailureExhausted { attempts: 3, .. }
    ));
    assert!(cache.is_empty());
    assert_eq!(cache.stats().misses, 0);
}

#[test]
fn test_failed_store_reads_are_retried() {
    let record = Record::new(vec![6u8; 30]);

    let store = MemStore::new(1024);
    store.preload(Address(64), &record.encode());
    store.fail_next_reads(2);
    let mut cache = cache_with(store, 3);
    cache
        .protect(&RecordClass::shared(), Address(64), &(), ProtectFlags::read_only())
        .unwrap();
    assert_eq!(cache.payload::<Record>(Address(64)).unwrap().body, vec![6u8; 30]);
    assert_eq!(cache.stats().load_retries, 2);
    cache.unprotect(Address(64), UnprotectFlags::default()).unwrap();

    // A store that keeps failing surfaces its own error once attempts run out.
    let store = MemStore::new(1024);
    store.preload(Address(64), &record.encode());
    store.fail_next_reads(3);
    let mut cache = cache_with(store, 3);
    let err = cache
        .protect(&RecordClass::shared(), Address(64), &(), ProtectFlags::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::Store(_)));
    assert!(!err.is_contract_violation());
    assert!(cache.is_empty());
    cache.check_invariants().unwrap();
}
