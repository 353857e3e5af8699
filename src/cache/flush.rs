//! Flushing and space reclamation.
//!
//! [`Cache::flush_single`] is the unit operation everything else is built
//! on: serialize if the image is stale, write, notify, then either mark the
//! entry clean or destroy it. Whole-cache flushes run ring by ring, outermost
//! first, each ring to a fixed point. Reclamation walks the LRU from its tail
//! and asks the [`Evictor`](crate::cache::evictor::Evictor) what to do with
//! each entry.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::class::{Effects, NotifyAction};
use crate::cache::entry::{Address, CacheEntry, EntryId, ListKind, Ring};
use crate::cache::evictor::VictimAction;
use crate::cache::lifecycle::Cache;
use crate::error::{CacheError, Result};
use crate::store::BackingStore;

/// Options for a whole-cache [`Cache::flush`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushFlags {
    /// Destroy every entry once it is written.
    pub invalidate: bool,
    /// Mark dirty entries clean without writing them.
    pub clear_only: bool,
    /// Only flush entries carrying a flush marker.
    pub marked_only: bool,
    /// Leave dirty protected entries alone instead of failing.
    pub ignore_protected: bool,
}

impl FlushFlags {
    pub fn invalidate() -> Self {
        Self {
            invalidate: true,
            ..Default::default()
        }
    }

    pub fn marked_only() -> Self {
        Self {
            marked_only: true,
            ..Default::default()
        }
    }
}

/// How one entry is flushed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FlushMode {
    /// Remove the entry from the cache afterwards.
    pub destroy: bool,
    /// Do not write; just mark clean.
    pub clear_only: bool,
    /// Serialize but leave the write and its `AfterFlush` to the caller.
    pub suppress_write: bool,
    /// On destroy, report the entry's file space as freed.
    pub free_file_space: bool,
}

impl FlushMode {
    pub fn evict() -> Self {
        Self {
            destroy: true,
            ..Default::default()
        }
    }

    /// Destroy without writing.
    pub fn discard(free_file_space: bool) -> Self {
        Self {
            destroy: true,
            clear_only: true,
            free_file_space,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FlushOutcome {
    /// Address after any move requested by the class.
    pub addr: Address,
    pub written: bool,
    pub bytes: usize,
}

impl<S: BackingStore> Cache<S> {
    /// Write one entry if it is dirty. Flushing a clean entry does nothing.
    ///
    /// Fails with `UnserializedChildren` while a flush-dependency child still
    /// has a stale image.
    pub fn flush_entry(&mut self, addr: Address) -> Result<()> {
        let id = self.id_of(addr)?;
        self.flush_single(id, FlushMode::default())?;
        self.apply_effects()
    }

    /// Flush the whole cache, rings outermost first.
    pub fn flush(&mut self, flags: FlushFlags) -> Result<()> {
        if flags.invalidate {
            return self.flush_invalidate(flags);
        }
        for ring in Ring::all() {
            self.flush_ring(ring, flags)?;
        }
        debug!(
            dirty_size = self.index.dirty_size(),
            marked_only = flags.marked_only,
            "Flushed cache"
        );
        Ok(())
    }

    /// Flush everything, then evict every entry that is not pinned or
    /// protected.
    pub fn evict(&mut self) -> Result<()> {
        self.flush(FlushFlags::default())?;
        let victims: Vec<EntryId> = self
            .queues
            .members(&self.arena, ListKind::Lru)
            .into_iter()
            .rev()
            .collect();
        let mut evicted = 0;
        for id in victims {
            let Some(entry) = self.arena.get(id) else {
                continue;
            };
            if entry.is_dirty || !entry.belongs_on_lru() {
                continue;
            }
            self.flush_single(id, FlushMode::evict())?;
            self.stats.evictions += 1;
            evicted += 1;
        }
        self.apply_effects()?;
        debug!(evicted, remaining = self.index.len(), "Evicted cache");
        Ok(())
    }

    /// Evict and flush from the LRU tail until the cache is within budget.
    pub fn reclaim_space(&mut self) -> Result<()> {
        self.make_space(0)
    }

    /// Make room for `needed` more bytes and restore the minimum clean size,
    /// as far as the LRU allows.
    pub(crate) fn make_space(&mut self, needed: usize) -> Result<()> {
        if !self.config.cache.evictions_enabled {
            return Ok(());
        }
        if self.pressure(needed).over_budget() {
            self.size_ctl.note_full();
        }

        let clean_only = self.evictor.clean_only();
        let bound = self.evictor.scan_bound(self.index.len());
        let mut cursor = self.scan_tail(clean_only);
        let mut scanned = 0;
        let mut flushed = 0;
        let mut evicted = 0;
        while let Some(id) = cursor {
            let pressure = self.pressure(needed);
            if pressure.is_relieved() || scanned >= bound {
                break;
            }
            scanned += 1;

            let prev = if clean_only {
                self.queues.aux_prev(&self.arena, id)
            } else {
                self.queues.lru_prev(&self.arena, id)
            };
            let action = self.evictor.classify(
                self.arena.entry(id),
                &pressure,
                self.config.cache.write_permitted,
            );
            match action {
                VictimAction::Skip => {}
                VictimAction::Flush => {
                    self.flush_single(id, FlushMode::default())?;
                    flushed += 1;
                }
                VictimAction::FlushAndEvict | VictimAction::Evict => {
                    self.flush_single(id, FlushMode::evict())?;
                    self.stats.evictions += 1;
                    evicted += 1;
                }
            }
            if action != VictimAction::Skip {
                self.apply_effects()?;
            }

            // Callbacks may have moved the next candidate; start over from
            // the tail if it left the list being walked.
            cursor = match prev {
                Some(p) if self.still_on_scan_list(p, clean_only) => Some(p),
                Some(_) => self.scan_tail(clean_only),
                None => None,
            };
        }

        if flushed > 0 || evicted > 0 {
            debug!(
                needed,
                flushed,
                evicted,
                size = self.index.size(),
                max_size = self.max_size,
                "Reclaimed space"
            );
        }
        Ok(())
    }

    fn scan_tail(&self, clean_only: bool) -> Option<EntryId> {
        if clean_only {
            self.queues.clean_lru_tail()
        } else {
            self.queues.lru_tail()
        }
    }

    fn still_on_scan_list(&self, id: EntryId, clean_only: bool) -> bool {
        self.arena
            .get(id)
            .is_some_and(|e| e.list == ListKind::Lru && !(clean_only && e.is_dirty))
    }

    /// Flush one ring to a fixed point. Outer rings re-dirtied by this
    /// ring's flushes are flushed again before the next entry is written.
    fn flush_ring(&mut self, ring: Ring, flags: FlushFlags) -> Result<()> {
        let mode = FlushMode {
            clear_only: flags.clear_only,
            ..Default::default()
        };
        let bound = 2 * self.index.ring_usage(ring).len + 8;
        let mut reflushes = 0;
        for _ in 0..bound {
            self.settle_outer_rings(ring, flags, bound, &mut reflushes)?;
            let targets = self.flush_targets(ring, flags)?;
            if targets.is_empty() {
                return Ok(());
            }
            let mut progress = false;
            for id in &targets {
                self.settle_outer_rings(ring, flags, bound, &mut reflushes)?;
                let Some(entry) = self.arena.get(*id) else {
                    continue;
                };
                if !entry.is_dirty || entry.is_protected() || entry.n_dirty_children > 0 {
                    continue;
                }
                self.flush_single(*id, mode)?;
                self.apply_effects()?;
                progress = true;
            }
            if !progress {
                return Err(CacheError::FlushStalled {
                    ring,
                    remaining: targets.len(),
                });
            }
        }
        let remaining = self.flush_targets(ring, flags)?.len();
        if remaining > 0 {
            return Err(CacheError::FlushStalled { ring, remaining });
        }
        // Outer rings must still be clean once this ring is done.
        for outer in Ring::all().take_while(|r| *r < ring) {
            if let Some(first) = self.flush_targets(outer, flags)?.first() {
                return Err(CacheError::RingOrderViolation {
                    addr: self.addr_of(*first)?,
                    outer,
                    inner: ring,
                });
            }
        }
        Ok(())
    }

    /// Flush any outer ring that has dirty entries again. Gives up once
    /// `bound` re-flushes have not settled them.
    fn settle_outer_rings(
        &mut self,
        ring: Ring,
        flags: FlushFlags,
        bound: usize,
        reflushes: &mut usize,
    ) -> Result<()> {
        for outer in Ring::all().take_while(|r| *r < ring) {
            if self.index.ring_usage(outer).dirty_size == 0 {
                continue;
            }
            let redirtied = self.flush_targets(outer, flags)?;
            let Some(first) = redirtied.first() else {
                continue;
            };
            *reflushes += 1;
            if *reflushes > bound {
                return Err(CacheError::RingOrderViolation {
                    addr: self.addr_of(*first)?,
                    outer,
                    inner: ring,
                });
            }
            debug!(outer = %outer, inner = %ring, count = redirtied.len(), "Re-flushing outer ring");
            self.flush_ring(outer, flags)?;
        }
        Ok(())
    }

    /// Dirty entries of `ring` a flush should write, in flush order.
    fn flush_targets(&self, ring: Ring, flags: FlushFlags) -> Result<Vec<EntryId>> {
        let candidates: Vec<EntryId> = if self.dirty_set.is_enabled() {
            self.dirty_set.ids().map(|(_, id)| id).collect()
        } else {
            let mut ids = self.queues.aux_members(&self.arena, true);
            ids.reverse();
            for kind in [ListKind::Pinned, ListKind::Protected] {
                ids.extend(
                    self.queues
                        .members(&self.arena, kind)
                        .into_iter()
                        .filter(|id| self.arena.entry(*id).is_dirty),
                );
            }
            ids
        };

        let mut targets = Vec::new();
        for id in candidates {
            let entry = self.arena.entry(id);
            if entry.ring != ring || (flags.marked_only && !entry.flush_marker) {
                continue;
            }
            if entry.is_protected() {
                if flags.ignore_protected {
                    continue;
                }
                return Err(CacheError::EntryProtected(entry.addr));
            }
            targets.push(id);
        }
        Ok(targets)
    }

    /// Write (unless clearing) and destroy every entry.
    fn flush_invalidate(&mut self, flags: FlushFlags) -> Result<()> {
        if let Some(id) = self.queues.members(&self.arena, ListKind::Protected).first() {
            return Err(CacheError::EntryProtected(self.arena.entry(*id).addr));
        }
        for id in self.queues.members(&self.arena, ListKind::Pinned) {
            let entry = self.arena.entry_mut(id);
            if entry.pinned_by_client {
                warn!(addr = %entry.addr, "Unpinning entry for cache teardown");
                entry.pinned_by_client = false;
                self.queues.relocate(&mut self.arena, id);
                self.stats.unpins += 1;
            }
        }
        let flags = FlushFlags {
            marked_only: false,
            ignore_protected: false,
            ..flags
        };
        if !flags.clear_only {
            for ring in Ring::all() {
                self.flush_ring(ring, flags)?;
            }
        }

        let mode = FlushMode {
            destroy: true,
            clear_only: flags.clear_only,
            ..Default::default()
        };
        let before = self.index.len();
        for ring in Ring::all() {
            loop {
                let in_ring: Vec<(EntryId, bool)> = self
                    .arena
                    .iter()
                    .filter(|(_, e)| e.ring == ring)
                    .map(|(id, e)| (id, e.n_children == 0))
                    .collect();
                if in_ring.is_empty() {
                    break;
                }
                let leaves: Vec<EntryId> = in_ring
                    .iter()
                    .filter(|(_, leaf)| *leaf)
                    .map(|(id, _)| *id)
                    .collect();
                if leaves.is_empty() {
                    return Err(CacheError::FlushStalled {
                        ring,
                        remaining: in_ring.len(),
                    });
                }
                for id in leaves {
                    if self.arena.get(id).is_some_and(|e| e.n_children == 0) {
                        self.flush_single(id, mode)?;
                    }
                }
                self.apply_effects()?;
            }
        }
        info!(destroyed = before, clear_only = flags.clear_only, "Invalidated cache");
        Ok(())
    }

    /// Flush one entry. Bookkeeping is left consistent even when the write
    /// or a callback fails part way.
    pub(crate) fn flush_single(&mut self, id: EntryId, mode: FlushMode) -> Result<FlushOutcome> {
        let entry = self.arena.get(id).ok_or(CacheError::StaleHandle)?;
        let addr = entry.addr;
        if entry.is_protected() {
            return Err(CacheError::EntryProtected(addr));
        }
        if mode.destroy && entry.n_children > 0 {
            return Err(CacheError::RemoveOfLiveEntry {
                addr,
                reason: "has flush dependency children",
            });
        }
        let was_dirty = entry.is_dirty;
        let write = was_dirty && !mode.clear_only;
        if write && !mode.suppress_write && !self.config.cache.write_permitted {
            return Err(CacheError::WriteNotPermitted(addr));
        }
        if write && !entry.image_up_to_date && entry.n_unserialized_children > 0 {
            return Err(CacheError::UnserializedChildren {
                addr,
                count: entry.n_unserialized_children,
            });
        }

        self.arena.entry_mut(id).flush_in_progress = true;
        let result = self.flush_single_inner(id, mode, was_dirty, write);
        if let Some(entry) = self.arena.get_mut(id) {
            entry.flush_in_progress = false;
        }
        result
    }

    fn flush_single_inner(
        &mut self,
        id: EntryId,
        mode: FlushMode,
        was_dirty: bool,
        write: bool,
    ) -> Result<FlushOutcome> {
        if write && !self.arena.entry(id).image_up_to_date {
            self.serialize_entry(id)?;
        }

        let entry = self.arena.entry(id);
        let mut outcome = FlushOutcome {
            addr: entry.addr,
            written: false,
            bytes: 0,
        };
        if write && !mode.suppress_write {
            let image = entry
                .image
                .as_deref()
                .ok_or_else(|| CacheError::Invariant(format!("entry {} has no image", entry.addr)))?;
            self.store.write(entry.addr, image)?;
            outcome.written = true;
            outcome.bytes = image.len();
            self.stats.writes += 1;
            self.stats.bytes_written += image.len() as u64;
        }
        if outcome.written {
            self.notify(id, NotifyAction::AfterFlush, None, None)?;
        }

        if was_dirty {
            self.set_clean(id)?;
            if write {
                self.stats.flushes += 1;
            } else {
                self.stats.clears += 1;
            }
        }
        self.arena.entry_mut(id).flush_marker = false;
        if mode.destroy {
            self.destroy_entry(id, mode.free_file_space)?;
        }
        if outcome.written {
            debug!(addr = %outcome.addr, bytes = outcome.bytes, destroy = mode.destroy, "Flushed entry");
        }
        Ok(outcome)
    }

    /// Bring the entry's image up to date, applying any size or address
    /// change the class asks for first.
    fn serialize_entry(&mut self, id: EntryId) -> Result<()> {
        let entry = self.arena.entry_mut(id);
        let class = Arc::clone(&entry.class);
        let (addr, size) = (entry.addr, entry.size);
        let payload = entry
            .payload
            .as_deref_mut()
            .ok_or_else(|| CacheError::Invariant(format!("entry {addr} has no payload")))?;
        let mut effects = Effects::new();
        let change = class
            .pre_serialize(addr, size, payload, &mut effects)
            .map_err(|e| CacheError::class(addr, e))?;
        self.pending_dirty.extend(effects.dirty);

        if let Some(new_size) = change.new_size {
            if new_size == 0 {
                return Err(CacheError::InvalidResize {
                    addr,
                    size: new_size,
                });
            }
            if new_size != size {
                self.resize_internal(id, new_size);
                self.stats.resizes += 1;
                debug!(addr = %addr, old_size = size, new_size, "Resized entry before serialize");
            }
        }
        if let Some(new_addr) = change.new_addr {
            if new_addr != addr {
                if self.contains(new_addr) {
                    return Err(CacheError::DuplicateInsert(new_addr));
                }
                self.move_internal(id, new_addr);
                self.stats.moves += 1;
                debug!(from = %addr, to = %new_addr, "Moved entry before serialize");
            }
        }

        let entry = self.arena.entry_mut(id);
        let addr = entry.addr;
        let mut image = entry.image.take().unwrap_or_default();
        image.resize(entry.size, 0);
        let result = match entry.payload.as_deref() {
            Some(payload) => class
                .serialize(payload, &mut image)
                .map_err(|e| CacheError::class(addr, e)),
            None => Err(CacheError::Invariant(format!("entry {addr} has no payload"))),
        };
        entry.image = Some(image);
        result?;
        self.set_image_current(id)
    }

    /// Take an entry out of every structure and hand its payload to the
    /// class's `free` hook.
    pub(crate) fn destroy_entry(&mut self, id: EntryId, free_file_space: bool) -> Result<()> {
        let entry = self.arena.entry(id);
        let addr = entry.addr;
        if entry.n_children > 0 {
            return Err(CacheError::RemoveOfLiveEntry {
                addr,
                reason: "has flush dependency children",
            });
        }
        let freed = if free_file_space {
            entry
                .payload
                .as_deref()
                .map(|p| entry.class.file_space_free_size(p, entry.size))
        } else {
            None
        };
        self.notify(id, NotifyAction::BeforeEvict, None, freed)?;

        self.detach_from_parents(id)?;
        self.queues.detach(&mut self.arena, id);
        if self.dirty_set.remove(addr).is_some() {
            self.arena.entry_mut(id).in_dirty_set = false;
        }
        self.index.remove(&mut self.arena, id);
        let CacheEntry { class, payload, .. } =
            self.arena.remove(id).ok_or(CacheError::StaleHandle)?;
        if let Some(payload) = payload {
            class.free(payload).map_err(|e| CacheError::class(addr, e))?;
        }
        debug!(addr = %addr, freed_space = freed, "Destroyed entry");
        Ok(())
    }
}
