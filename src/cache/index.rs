//! Hash index: address → entry lookup plus the cache's size accounting.
//!
//! A fixed-size bucket table hashed on the low bits of the address. Each
//! bucket is a short chain with move-to-front on hit. The size counters
//! (`size`, `clean_size`, `dirty_size` and their per-ring splits) are only
//! ever changed together with index membership or an entry state change,
//! so they cannot drift from the set of indexed entries.

use crate::cache::entry::{Address, CacheEntry, EntryArena, EntryId, Ring};
use crate::error::{CacheError, Result};

/// Per-ring occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingUsage {
    pub len: usize,
    pub size: usize,
    pub clean_size: usize,
    pub dirty_size: usize,
}

pub(crate) struct HashIndex {
    buckets: Vec<Vec<EntryId>>,
    mask: u64,
    len: usize,
    size: usize,
    clean_size: usize,
    dirty_size: usize,
    rings: [RingUsage; Ring::COUNT],
    max_len: usize,
    max_size: usize,
}

impl HashIndex {
    /// Create an index with `2^bucket_bits` buckets.
    pub fn new(bucket_bits: u32) -> Self {
        let buckets = 1usize << bucket_bits;
        Self {
            buckets: vec![Vec::new(); buckets],
            mask: (buckets - 1) as u64,
            len: 0,
            size: 0,
            clean_size: 0,
            dirty_size: 0,
            rings: [RingUsage::default(); Ring::COUNT],
            max_len: 0,
            max_size: 0,
        }
    }

    #[inline]
    fn bucket(&self, addr: Address) -> usize {
        // Entries are at least 8-byte aligned in practice; skip those bits.
        ((addr.0 >> 3) & self.mask) as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn clean_size(&self) -> usize {
        self.clean_size
    }

    pub fn dirty_size(&self) -> usize {
        self.dirty_size
    }

    pub fn ring_usage(&self, ring: Ring) -> RingUsage {
        self.rings[ring.index()]
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Find an entry, moving it to the front of its chain on hit.
    pub fn find(&mut self, arena: &EntryArena, addr: Address) -> Option<EntryId> {
        let b = self.bucket(addr);
        let chain = &mut self.buckets[b];
        let pos = chain.iter().position(|id| arena.entry(*id).addr == addr)?;
        if pos > 0 {
            let id = chain.remove(pos);
            chain.insert(0, id);
        }
        Some(chain[0])
    }

    /// Find an entry without reordering its chain.
    pub fn lookup(&self, arena: &EntryArena, addr: Address) -> Option<EntryId> {
        self.buckets[self.bucket(addr)]
            .iter()
            .copied()
            .find(|id| arena.entry(*id).addr == addr)
    }

    pub fn insert(&mut self, arena: &mut EntryArena, id: EntryId) -> Result<()> {
        let addr = arena.entry(id).addr;
        if self.lookup(arena, addr).is_some() {
            return Err(CacheError::DuplicateInsert(addr));
        }
        let b = self.bucket(addr);
        self.buckets[b].insert(0, id);

        let entry = arena.entry_mut(id);
        entry.in_index = true;
        self.len += 1;
        self.size += entry.size;
        let ring = &mut self.rings[entry.ring.index()];
        ring.len += 1;
        ring.size += entry.size;
        if entry.is_dirty {
            self.dirty_size += entry.size;
            ring.dirty_size += entry.size;
        } else {
            self.clean_size += entry.size;
            ring.clean_size += entry.size;
        }
        self.max_len = self.max_len.max(self.len);
        self.max_size = self.max_size.max(self.size);
        Ok(())
    }

    pub fn remove(&mut self, arena: &mut EntryArena, id: EntryId) {
        let addr = arena.entry(id).addr;
        let b = self.bucket(addr);
        if let Some(pos) = self.buckets[b].iter().position(|x| *x == id) {
            self.buckets[b].remove(pos);
        } else {
            return;
        }

        let entry = arena.entry_mut(id);
        entry.in_index = false;
        self.len -= 1;
        self.size -= entry.size;
        let ring = &mut self.rings[entry.ring.index()];
        ring.len -= 1;
        ring.size -= entry.size;
        if entry.is_dirty {
            self.dirty_size -= entry.size;
            ring.dirty_size -= entry.size;
        } else {
            self.clean_size -= entry.size;
            ring.clean_size -= entry.size;
        }
    }

    /// Re-hash an entry whose address changed from `old_addr`.
    pub fn rekey(&mut self, arena: &EntryArena, id: EntryId, old_addr: Address) {
        let old = self.bucket(old_addr);
        if let Some(pos) = self.buckets[old].iter().position(|x| *x == id) {
            self.buckets[old].remove(pos);
        }
        let new = self.bucket(arena.entry(id).addr);
        self.buckets[new].insert(0, id);
    }

    /// Account for an entry whose size changed from `old_size` to its
    /// current size. Must be called before any dirty/clean transition.
    pub fn on_size_change(&mut self, entry: &CacheEntry, old_size: usize) {
        let new_size = entry.size;
        let ring = &mut self.rings[entry.ring.index()];
        self.size = self.size - old_size + new_size;
        ring.size = ring.size - old_size + new_size;
        if entry.is_dirty {
            self.dirty_size = self.dirty_size - old_size + new_size;
            ring.dirty_size = ring.dirty_size - old_size + new_size;
        } else {
            self.clean_size = self.clean_size - old_size + new_size;
            ring.clean_size = ring.clean_size - old_size + new_size;
        }
        self.max_size = self.max_size.max(self.size);
    }

    /// Move an entry's size from the clean to the dirty column.
    pub fn on_dirty(&mut self, entry: &CacheEntry) {
        let ring = &mut self.rings[entry.ring.index()];
        self.clean_size -= entry.size;
        self.dirty_size += entry.size;
        ring.clean_size -= entry.size;
        ring.dirty_size += entry.size;
    }

    /// Move an entry's size from the dirty to the clean column.
    pub fn on_clean(&mut self, entry: &CacheEntry) {
        let ring = &mut self.rings[entry.ring.index()];
        self.dirty_size -= entry.size;
        self.clean_size += entry.size;
        ring.dirty_size -= entry.size;
        ring.clean_size += entry.size;
    }

    /// Every indexed entry id, bucket by bucket.
    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.buckets.iter().flatten().copied()
    }

    pub fn reset_high_water(&mut self) {
        self.max_len = self.len;
        self.max_size = self.size;
    }
}
