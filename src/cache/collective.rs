//! Collective sync points for caches shared by cooperating processes.
//!
//! Every process holds its own cache over the same backing store. At a sync
//! point all of them apply the same sorted candidate list: each process
//! writes the contiguous slice [`partition_candidates`] assigns to its rank
//! and clears the rest without writing, so every candidate reaches the store
//! exactly once. Between sync points reclamation only evicts clean entries.

use std::ops::Range;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::class::NotifyAction;
use crate::cache::entry::{Address, EntryId, Ring};
use crate::cache::flush::FlushMode;
use crate::cache::lifecycle::Cache;
use crate::error::{CacheError, Result};
use crate::store::{BackingStore, WriteOp};

/// The slice of a candidate list of length `num_candidates` that process
/// `rank` of `num_processes` writes.
///
/// Slices are contiguous, disjoint, cover the whole list and differ in
/// length by at most one.
pub fn partition_candidates(num_candidates: usize, rank: usize, num_processes: usize) -> Range<usize> {
    if num_processes == 0 || rank >= num_processes {
        return 0..0;
    }
    let base = num_candidates / num_processes;
    let rem = num_candidates % num_processes;
    let start = rank * base + rank.min(rem);
    let len = base + usize::from(rank < rem);
    start..start + len
}

/// What one process did at a sync point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub candidates: usize,
    /// Entries this process wrote (or handed to the vectorized write).
    pub written: usize,
    /// Entries cleared because another process writes them.
    pub cleared: usize,
    pub bytes_written: u64,
    pub vector_write_issued: bool,
}

impl<S: BackingStore> Cache<S> {
    /// Addresses that must become clean at the next sync point, sorted.
    ///
    /// With `flush_all` that is every dirty entry. Otherwise dirty entries
    /// are taken from the tail of the dirty LRU until cleaning them would
    /// restore the minimum clean size.
    pub fn build_candidate_list(&self, flush_all: bool) -> Vec<Address> {
        let mut candidates: Vec<Address> = if flush_all {
            if self.dirty_set.is_enabled() {
                self.dirty_set.ids().map(|(addr, _)| addr).collect()
            } else {
                self.arena
                    .iter()
                    .filter(|(_, e)| e.is_dirty)
                    .map(|(_, e)| e.addr)
                    .collect()
            }
        } else {
            let empty = self.max_size.saturating_sub(self.index.size());
            let mut shortfall = self
                .min_clean_size
                .saturating_sub(empty + self.index.clean_size());
            let mut picked = Vec::new();
            let mut cursor = self.queues.dirty_lru_tail();
            while let Some(id) = cursor {
                if shortfall == 0 {
                    break;
                }
                let entry = self.arena.entry(id);
                picked.push(entry.addr);
                shortfall = shortfall.saturating_sub(entry.size);
                cursor = self.queues.aux_prev(&self.arena, id);
            }
            picked
        };
        candidates.sort_unstable();
        candidates
    }

    /// Build the full candidate list and apply it. Convenience for a single
    /// process or for tests; cooperating processes must agree on one list.
    pub fn sync_point(&mut self) -> Result<SyncReport> {
        let candidates = self.build_candidate_list(true);
        self.apply_candidate_list(&candidates)
    }

    /// Make every candidate clean: write this rank's share and clear the
    /// others.
    pub fn apply_candidate_list(&mut self, candidates: &[Address]) -> Result<SyncReport> {
        let (rank, num_processes, coalesce) = self
            .config
            .collective
            .as_ref()
            .map_or((0, 1, false), |c| (c.rank, c.num_processes, c.coalesce_writes));

        if let Some(pair) = candidates.windows(2).find(|w| w[0] >= w[1]) {
            return Err(violation(pair[1], "candidate list is not strictly ascending"));
        }
        let mut ids = Vec::with_capacity(candidates.len());
        for addr in candidates {
            let id = self
                .index
                .lookup(&self.arena, *addr)
                .ok_or_else(|| violation(*addr, "candidate is not in the cache"))?;
            let entry = self.arena.entry(id);
            if entry.is_protected() {
                return Err(violation(*addr, "candidate is protected"));
            }
            if !entry.is_dirty {
                return Err(violation(*addr, "candidate is already clean"));
            }
            ids.push(id);
        }

        let mine = partition_candidates(ids.len(), rank, num_processes);
        for (i, id) in ids.iter().enumerate() {
            let entry = self.arena.entry_mut(*id);
            if mine.contains(&i) {
                entry.flush_immediately = true;
            } else {
                entry.clear_on_sync = true;
            }
        }

        let result = self.run_sync(&ids, coalesce);
        for id in &ids {
            if let Some(entry) = self.arena.get_mut(*id) {
                entry.flush_immediately = false;
                entry.clear_on_sync = false;
            }
        }
        let report = result?;

        self.stats.sync_points += 1;
        info!(
            rank,
            num_processes,
            candidates = report.candidates,
            written = report.written,
            cleared = report.cleared,
            bytes_written = report.bytes_written,
            "Applied candidate list"
        );
        Ok(report)
    }

    fn run_sync(&mut self, ids: &[EntryId], coalesce: bool) -> Result<SyncReport> {
        let mut report = SyncReport {
            candidates: ids.len(),
            ..Default::default()
        };
        let mut deferred = Vec::new();
        let result = self.sync_rings(ids, coalesce, &mut report, &mut deferred);

        if coalesce {
            // Every process takes part in the collective write, even with
            // nothing to contribute or after a failed candidate.
            self.write_deferred(deferred, &mut report)?;
        }
        result.map(|()| report)
    }

    /// Write or clear candidates ring by ring. Coalesced writes are queued
    /// in `deferred` with their images; those entries are already clean.
    fn sync_rings(
        &mut self,
        ids: &[EntryId],
        coalesce: bool,
        report: &mut SyncReport,
        deferred: &mut Vec<(EntryId, WriteOp)>,
    ) -> Result<()> {
        for ring in Ring::all() {
            loop {
                let pending: Vec<EntryId> = ids
                    .iter()
                    .copied()
                    .filter(|id| {
                        self.arena.get(*id).is_some_and(|e| {
                            e.ring == ring && e.is_dirty && (e.flush_immediately || e.clear_on_sync)
                        })
                    })
                    .collect();
                let Some(first) = pending.first() else {
                    break;
                };
                let first = self.arena.entry(*first).addr;

                let mut progress = false;
                for id in pending {
                    let entry = self.arena.entry(id);
                    if entry.n_dirty_children > 0 {
                        continue;
                    }
                    if entry.flush_immediately {
                        if coalesce {
                            let mode = FlushMode {
                                suppress_write: true,
                                ..Default::default()
                            };
                            let outcome = self.flush_single(id, mode)?;
                            let image = self.arena.entry(id).image.as_deref().ok_or_else(|| {
                                CacheError::Invariant(format!("entry {} has no image", outcome.addr))
                            })?;
                            let op = WriteOp {
                                addr: outcome.addr,
                                data: Bytes::copy_from_slice(image),
                            };
                            deferred.push((id, op));
                        } else {
                            let outcome = self.flush_single(id, FlushMode::default())?;
                            report.bytes_written += outcome.bytes as u64;
                        }
                        report.written += 1;
                    } else {
                        let mode = FlushMode {
                            clear_only: true,
                            ..Default::default()
                        };
                        self.flush_single(id, mode)?;
                        report.cleared += 1;
                    }
                    let entry = self.arena.entry_mut(id);
                    entry.flush_immediately = false;
                    entry.clear_on_sync = false;
                    self.apply_effects()?;
                    progress = true;
                }
                if !progress {
                    return Err(violation(first, "pinned entry still has dirty children"));
                }
            }
        }
        Ok(())
    }

    /// Issue the vectorized write for the queued images. On failure every
    /// queued entry is dirtied again; on success each gets its `AfterFlush`.
    fn write_deferred(
        &mut self,
        deferred: Vec<(EntryId, WriteOp)>,
        report: &mut SyncReport,
    ) -> Result<()> {
        let (ids, ops): (Vec<EntryId>, Vec<WriteOp>) = deferred.into_iter().unzip();
        let bytes: u64 = ops.iter().map(|op| op.data.len() as u64).sum();
        if let Err(e) = self.store.write_vector(&ops) {
            warn!(ops = ops.len(), error = %e, "Vectorized write failed, dirtying entries again");
            for id in ids {
                if self.arena.contains(id) {
                    self.set_dirty(id)?;
                }
            }
            self.apply_effects()?;
            return Err(e.into());
        }
        self.stats.writes += ops.len() as u64;
        self.stats.bytes_written += bytes;
        report.bytes_written += bytes;
        report.vector_write_issued = true;
        debug!(ops = ops.len(), bytes, "Issued vectorized write");

        for id in ids {
            if self.arena.contains(id) {
                self.notify(id, NotifyAction::AfterFlush, None, None)?;
            }
        }
        self.apply_effects()
    }
}

fn violation(addr: Address, detail: &str) -> CacheError {
    CacheError::CollectiveProtocolViolation {
        addr,
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::lifecycle::{InsertFlags, ProtectFlags};
    use crate::cache::test_support::BytesClass;
    use crate::config::{CollectiveConfig, Config};
    use crate::store::MemStore;

    fn collective_cache(
        store: Arc<MemStore>,
        rank: usize,
        num_processes: usize,
        coalesce_writes: bool,
    ) -> Cache<Arc<MemStore>> {
        let config = Config {
            collective: Some(CollectiveConfig {
                rank,
                num_processes,
                coalesce_writes,
            }),
            ..Default::default()
        };
        let mut cache = Cache::new(config, store).unwrap();
        let class = BytesClass::shared();
        for addr in (0..5u64).map(|i| i * 32) {
            cache
                .insert_entry(&class, Address(addr), Box::new(vec![addr as u8; 32]), InsertFlags::default())
                .unwrap();
        }
        cache
    }

    #[test]
    fn test_partition_covers_each_candidate_once() {
        for n in 0..40 {
            for p in 1..9 {
                let mut next = 0;
                let mut lens = Vec::new();
                for rank in 0..p {
                    let range = partition_candidates(n, rank, p);
                    assert_eq!(range.start, next, "n={n} p={p} rank={rank}");
                    next = range.end;
                    lens.push(range.len());
                }
                assert_eq!(next, n);
                let min = lens.iter().min().copied().unwrap_or(0);
                let max = lens.iter().max().copied().unwrap_or(0);
                assert!(max - min <= 1, "n={n} p={p} lens={lens:?}");
            }
        }
        assert_eq!(partition_candidates(5, 3, 3), 0..0);
    }

    #[test]
    fn test_every_candidate_written_exactly_once() {
        let store = Arc::new(MemStore::new(4096));
        let mut caches: Vec<_> = (0..3)
            .map(|rank| collective_cache(Arc::clone(&store), rank, 3, false))
            .collect();
        let candidates = caches[0].build_candidate_list(true);
        assert_eq!(candidates.len(), 5);

        let mut written = 0;
        for cache in &mut caches {
            let report = cache.apply_candidate_list(&candidates).unwrap();
            assert_eq!(report.written + report.cleared, 5);
            written += report.written;
            assert_eq!(cache.dirty_size(), 0);
            cache.check_invariants().unwrap();
        }
        assert_eq!(written, 5);
        let mut addrs: Vec<u64> = store.writes().iter().map(|w| w.addr.0).collect();
        addrs.sort_unstable();
        assert_eq!(addrs, vec![0, 32, 64, 96, 128]);
    }

    #[test]
    fn test_coalesced_write_issued_even_when_empty() {
        let store = Arc::new(MemStore::new(4096));
        // Five candidates over eight processes: rank 6 writes nothing.
        let mut cache = collective_cache(Arc::clone(&store), 6, 8, true);
        let candidates = cache.build_candidate_list(true);
        let report = cache.apply_candidate_list(&candidates).unwrap();
        assert_eq!(report.written, 0);
        assert_eq!(report.cleared, 5);
        assert!(report.vector_write_issued);
        assert_eq!(store.stats().total_vector_writes, 1);
        assert!(store.writes().is_empty());

        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(Arc::clone(&store), 0, 2, true);
        let report = cache.apply_candidate_list(&candidates).unwrap();
        assert_eq!(report.written, 3);
        assert_eq!(report.bytes_written, 96);
        assert!(store.writes().iter().all(|w| w.vector_call == Some(0)));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_failed_candidate_still_issues_vector_write() {
        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(Arc::clone(&store), 0, 1, true);
        // A 32 byte payload cannot fill a 48 byte image.
        cache.pin_entry(Address(128)).unwrap();
        cache.resize_entry(Address(128), 48).unwrap();

        let candidates = cache.build_candidate_list(true);
        let err = cache.apply_candidate_list(&candidates).unwrap_err();
        assert!(matches!(err, CacheError::Class { addr: Address(128), .. }));

        // The entries marked clean before the failure reached the store.
        let addrs: Vec<u64> = store.writes().iter().map(|w| w.addr.0).collect();
        assert_eq!(addrs, vec![0, 32, 64, 96]);
        assert!(store.writes().iter().all(|w| w.vector_call == Some(0)));
        assert_eq!(store.contents(Address(64), 32), vec![64u8; 32]);
        for addr in [0u64, 32, 64, 96] {
            assert!(!cache.entry_status(Address(addr)).unwrap().is_dirty);
        }
        assert!(cache.entry_status(Address(128)).unwrap().is_dirty);
        assert_eq!(cache.dirty_size(), 48);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_failed_vector_write_dirties_entries_again() {
        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(Arc::clone(&store), 0, 1, true);
        store.fail_next_writes(1);

        assert!(matches!(cache.sync_point(), Err(CacheError::Store(_))));
        assert!(store.writes().is_empty());
        assert_eq!(cache.dirty_size(), 160);
        assert_eq!(cache.build_candidate_list(true).len(), 5);
        cache.check_invariants().unwrap();

        let report = cache.sync_point().unwrap();
        assert_eq!(report.written, 5);
        assert_eq!(report.bytes_written, 160);
        assert_eq!(cache.dirty_size(), 0);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_protected_candidate_is_a_violation() {
        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(store, 0, 1, false);
        cache
            .protect(&BytesClass::shared(), Address(64), &(), ProtectFlags::default())
            .unwrap();
        let candidates = cache.build_candidate_list(true);
        let err = cache.apply_candidate_list(&candidates).unwrap_err();
        assert!(matches!(
            err,
            CacheError::CollectiveProtocolViolation { addr: Address(64), .. }
        ));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_unsorted_or_unknown_candidates_rejected() {
        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(store, 0, 1, false);
        assert!(cache
            .apply_candidate_list(&[Address(64), Address(32)])
            .is_err());
        assert!(cache.apply_candidate_list(&[Address(1000)]).is_err());
        assert_eq!(cache.dirty_size(), 160);
    }

    #[test]
    fn test_parent_waits_for_child_within_sync() {
        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(Arc::clone(&store), 0, 1, false);
        cache.create_flush_dependency(Address(0), Address(128)).unwrap();
        let report = cache.sync_point().unwrap();
        assert_eq!(report.written, 5);
        let order: Vec<u64> = store.writes().iter().map(|w| w.addr.0).collect();
        let child = order.iter().position(|a| *a == 128).unwrap();
        let parent = order.iter().position(|a| *a == 0).unwrap();
        assert!(child < parent);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_partial_list_restores_min_clean() {
        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(store, 0, 1, false);
        cache.set_max_size(160, 64).unwrap();
        // Full cache, all dirty: two 32 byte entries from the dirty tail.
        let candidates = cache.build_candidate_list(false);
        assert_eq!(candidates, vec![Address(0), Address(32)]);
    }

    #[test]
    fn test_reclaim_skips_dirty_entries_in_collective_mode() {
        let store = Arc::new(MemStore::new(4096));
        let mut cache = collective_cache(Arc::clone(&store), 0, 1, false);
        cache.set_max_size(64, 0).unwrap();
        cache.reclaim_space().unwrap();
        assert_eq!(cache.len(), 5);
        assert!(store.writes().is_empty());
    }
}
