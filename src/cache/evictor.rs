//! Eviction policy: decides what to do with each entry met while scanning
//! the LRU from its tail.
//!
//! Reclamation is driven by two constraints:
//! - the cache must fit `index_size + space_needed` into `max_size`,
//! - free space plus clean bytes should cover `min_clean_size`, so that a
//!   later reclaim can evict without writing.
//!
//! Dirty entries are flushed, clean ones evicted. In collective mode a write
//! needs coordination with the other processes, so only clean entries are
//! touched and reclamation walks the clean sub-list instead.

use crate::cache::entry::CacheEntry;

/// Occupancy against the current budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pressure {
    pub size: usize,
    pub clean_size: usize,
    pub max_size: usize,
    pub min_clean_size: usize,
    /// Bytes about to be added.
    pub needed: usize,
}

impl Pressure {
    /// The pending addition does not fit.
    pub fn over_budget(&self) -> bool {
        self.size + self.needed > self.max_size
    }

    /// Free space plus clean bytes fall short of the minimum clean size.
    pub fn clean_short(&self) -> bool {
        let empty = self.max_size.saturating_sub(self.size);
        empty + self.clean_size < self.min_clean_size
    }

    pub fn is_relieved(&self) -> bool {
        !self.over_budget() && !self.clean_short()
    }
}

/// What to do with one LRU entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimAction {
    /// Leave it in place.
    Skip,
    /// Write it and keep it, now clean.
    Flush,
    /// Write it, then evict it.
    FlushAndEvict,
    /// Evict a clean entry.
    Evict,
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    clean_only: bool,
}

impl Evictor {
    /// `clean_only` restricts reclamation to clean entries (collective mode).
    pub fn new(clean_only: bool) -> Self {
        Self { clean_only }
    }

    pub fn clean_only(&self) -> bool {
        self.clean_only
    }

    /// Maximum entries one reclamation scan visits.
    pub fn scan_bound(&self, index_len: usize) -> usize {
        2 * index_len + 1
    }

    pub fn classify(
        &self,
        entry: &CacheEntry,
        pressure: &Pressure,
        write_permitted: bool,
    ) -> VictimAction {
        if !entry.belongs_on_lru() || entry.flush_in_progress {
            return VictimAction::Skip;
        }
        // Children still dirty: the entry cannot be written or dropped yet.
        if entry.n_dirty_children > 0 || entry.n_unserialized_children > 0 {
            return VictimAction::Skip;
        }
        if entry.is_dirty {
            if self.clean_only || !write_permitted {
                return VictimAction::Skip;
            }
            if pressure.over_budget() {
                VictimAction::FlushAndEvict
            } else if pressure.clean_short() {
                VictimAction::Flush
            } else {
                VictimAction::Skip
            }
        } else if pressure.over_budget() {
            VictimAction::Evict
        } else {
            VictimAction::Skip
        }
    }
}
