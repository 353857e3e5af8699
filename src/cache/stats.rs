//! Cache statistics.

use serde::{Deserialize, Serialize};

/// Counters accumulated since creation or the last
/// [`Cache::reset_stats`](crate::cache::Cache::reset_stats), plus a snapshot
/// of current occupancy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Protect calls.
    pub accesses: u64,
    pub hits: u64,
    pub misses: u64,

    pub insertions: u64,
    pub loads: u64,
    /// Extra reads caused by checksum mismatches.
    pub load_retries: u64,

    /// Dirty entries whose image was written (or handed to a vectorized
    /// write).
    pub flushes: u64,
    /// Dirty entries marked clean without being written.
    pub clears: u64,
    pub writes: u64,
    pub bytes_written: u64,

    pub evictions: u64,
    pub expunges: u64,
    pub removals: u64,
    pub moves: u64,
    pub resizes: u64,
    pub pins: u64,
    pub unpins: u64,

    pub size_increases: u64,
    pub size_decreases: u64,
    pub flash_increases: u64,

    pub sync_points: u64,

    // Occupancy snapshot.
    pub entries: usize,
    pub current_size: usize,
    pub clean_size: usize,
    pub dirty_size: usize,
    pub max_size: usize,
    pub min_clean_size: usize,
    pub max_observed_entries: usize,
    pub max_observed_size: usize,
}

impl CacheStats {
    /// Fraction of protect calls satisfied without a load (0.0 - 1.0).
    pub fn hit_rate(&self) -> f64 {
        if self.accesses == 0 {
            return 0.0;
        }
        self.hits as f64 / self.accesses as f64
    }
}
