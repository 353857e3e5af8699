//! The cache coordinator and the entry lifecycle.
//!
//! [`Cache`] owns every structure (arena, hash index, replacement queues,
//! dirty set, size controller) and is the only way to reach them. All
//! operations are synchronous and run to completion; the unit of
//! concurrency the cache offers is logical: protect grants exclusive or
//! shared read-only ownership of an entry's content, which keeps the cache
//! from flushing or evicting it until unprotect.
//!
//! Entry state changes that touch several structures go through a small set
//! of internal transitions (`set_dirty`, `set_clean`, `set_image_current`,
//! `resize_internal`, `move_internal`) so counters, lists and the dirty set
//! always change together.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::cache::class::{Effects, EntryClass, LoadContext, NotifyAction, NotifyContext};
use crate::cache::dirty_set::DirtySet;
use crate::cache::entry::{
    Address, CacheEntry, EntryArena, EntryId, EntryStatus, ListKind, Protection, Ring,
};
use crate::cache::evictor::{Evictor, Pressure};
use crate::cache::flush::FlushMode;
use crate::cache::index::{HashIndex, RingUsage};
use crate::cache::load;
use crate::cache::queues::{ListStats, ReplacementQueues};
use crate::cache::size_ctl::SizeController;
use crate::cache::stats::CacheStats;
use crate::config::{Config, ResizeConfig};
use crate::error::{CacheError, ConfigError, Result};
use crate::store::BackingStore;

/// Options for [`Cache::insert_entry`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertFlags {
    /// Pin the entry on behalf of the client.
    pub pin: bool,
    /// Mark the entry for a marked-only flush.
    pub flush_marker: bool,
    pub ring: Ring,
}

/// Options for [`Cache::protect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtectFlags {
    /// Shared read-only protection; may be held by several callers.
    pub read_only: bool,
    /// Ring assigned to the entry if it has to be loaded.
    pub ring: Ring,
}

impl ProtectFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }
}

/// Options for [`Cache::unprotect`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnprotectFlags {
    /// The holder modified the entry.
    pub dirtied: bool,
    /// Discard the entry without writing it.
    pub delete: bool,
    pub pin: bool,
    pub unpin: bool,
    pub flush_marker: bool,
    /// With `delete`: release the entry's file space.
    pub free_file_space: bool,
}

impl UnprotectFlags {
    pub fn dirtied() -> Self {
        Self {
            dirtied: true,
            ..Default::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Default::default()
        }
    }
}

/// The metadata entry cache.
pub struct Cache<S: BackingStore> {
    pub(crate) config: Config,
    pub(crate) store: S,
    pub(crate) arena: EntryArena,
    pub(crate) index: HashIndex,
    pub(crate) queues: ReplacementQueues,
    pub(crate) dirty_set: DirtySet,
    pub(crate) evictor: Evictor,
    pub(crate) size_ctl: SizeController,
    pub(crate) stats: CacheStats,
    pub(crate) max_size: usize,
    pub(crate) min_clean_size: usize,
    /// Entries callbacks asked to have dirtied, applied once they return.
    pub(crate) pending_dirty: Vec<Address>,
}

impl<S: BackingStore> Cache<S> {
    /// Create an empty cache over `store`.
    pub fn new(config: Config, store: S) -> Result<Self> {
        config.validate()?;
        let collective = config.collective.is_some();
        debug!(
            max_size = config.cache.max_size,
            min_clean_size = config.cache.min_clean_size,
            collective,
            "Created cache"
        );
        Ok(Self {
            index: HashIndex::new(config.cache.hash_bucket_bits),
            queues: ReplacementQueues::new(),
            dirty_set: DirtySet::new(config.cache.dirty_set_enabled),
            evictor: Evictor::new(collective),
            size_ctl: SizeController::new(config.resize.clone()),
            stats: CacheStats::default(),
            max_size: config.cache.max_size,
            min_clean_size: config.cache.min_clean_size,
            arena: EntryArena::new(),
            pending_dirty: Vec::new(),
            config,
            store,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.len() == 0
    }

    /// Total bytes of all cached entries.
    pub fn size(&self) -> usize {
        self.index.size()
    }

    pub fn clean_size(&self) -> usize {
        self.index.clean_size()
    }

    pub fn dirty_size(&self) -> usize {
        self.index.dirty_size()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn min_clean_size(&self) -> usize {
        self.min_clean_size
    }

    pub fn ring_usage(&self, ring: Ring) -> RingUsage {
        self.index.ring_usage(ring)
    }

    pub fn lru_stats(&self) -> ListStats {
        self.queues.lru_stats()
    }

    pub fn clean_lru_stats(&self) -> ListStats {
        self.queues.clean_lru_stats()
    }

    pub fn dirty_lru_stats(&self) -> ListStats {
        self.queues.dirty_lru_stats()
    }

    pub fn pinned_stats(&self) -> ListStats {
        self.queues.pinned_stats()
    }

    pub fn protected_stats(&self) -> ListStats {
        self.queues.protected_stats()
    }

    /// Number of entries in the address-ordered dirty set.
    pub fn dirty_set_len(&self) -> usize {
        self.dirty_set.len()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.index.lookup(&self.arena, addr).is_some()
    }

    /// Addresses of the LRU, most recently used first.
    pub fn lru_addresses(&self) -> Vec<Address> {
        self.queues
            .members(&self.arena, ListKind::Lru)
            .into_iter()
            .map(|id| self.arena.entry(id).addr)
            .collect()
    }

    pub fn evictions_enabled(&self) -> bool {
        self.config.cache.evictions_enabled
    }

    /// With evictions disabled the cache grows without bound.
    pub fn set_evictions_enabled(&mut self, enabled: bool) {
        self.config.cache.evictions_enabled = enabled;
    }

    pub fn write_permitted(&self) -> bool {
        self.config.cache.write_permitted
    }

    pub fn set_write_permitted(&mut self, permitted: bool) {
        self.config.cache.write_permitted = permitted;
    }

    /// Set the budget directly. Takes effect at the next reclamation.
    pub fn set_max_size(&mut self, max_size: usize, min_clean_size: usize) -> Result<()> {
        if min_clean_size > max_size {
            return Err(ConfigError::Invalid {
                field: "cache.min_clean_size",
                reason: format!("{min_clean_size} exceeds max_size {max_size}"),
            }
            .into());
        }
        self.max_size = max_size;
        self.min_clean_size = min_clean_size;
        Ok(())
    }

    pub fn resize_config(&self) -> &ResizeConfig {
        self.size_ctl.config()
    }

    /// Replace the size controller's settings and start a new epoch.
    pub fn set_resize_config(&mut self, resize: ResizeConfig) -> Result<()> {
        let mut candidate = self.config.clone();
        candidate.resize = resize.clone();
        candidate.validate()?;
        self.config.resize = resize.clone();
        self.size_ctl.set_config(resize);
        Ok(())
    }

    /// Snapshot of the counters and current occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.index.len(),
            current_size: self.index.size(),
            clean_size: self.index.clean_size(),
            dirty_size: self.index.dirty_size(),
            max_size: self.max_size,
            min_clean_size: self.min_clean_size,
            max_observed_entries: self.index.max_len(),
            max_observed_size: self.index.max_size(),
            ..self.stats.clone()
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = CacheStats::default();
        self.index.reset_high_water();
    }

    pub fn entry_status(&self, addr: Address) -> Option<EntryStatus> {
        self.index
            .lookup(&self.arena, addr)
            .map(|id| self.arena.entry(id).status())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register a brand-new entry. It starts dirty with no image.
    pub fn insert_entry(
        &mut self,
        class: &Arc<dyn EntryClass>,
        addr: Address,
        payload: Box<dyn Any + Send>,
        flags: InsertFlags,
    ) -> Result<EntryId> {
        if !flags.ring.is_valid() {
            return Err(CacheError::InvalidRing(flags.ring));
        }
        if self.contains(addr) {
            return Err(CacheError::DuplicateInsert(addr));
        }
        let size = class
            .image_len(&*payload)
            .map_err(|e| CacheError::class(addr, e))?;
        if size == 0 {
            return Err(CacheError::InvalidResize { addr, size });
        }

        self.flash_increase(size);
        self.make_space(size)?;

        let mut entry = CacheEntry::new(addr, size, flags.ring, Arc::clone(class), payload);
        entry.is_dirty = true;
        entry.pinned_by_client = flags.pin;
        entry.flush_marker = flags.flush_marker;
        let id = self.link_new(entry)?;

        self.stats.insertions += 1;
        if flags.pin {
            self.stats.pins += 1;
        }
        debug!(addr = %addr, size, ring = %flags.ring, class = class.name(), "Inserted entry");

        self.notify(id, NotifyAction::AfterInsert, None, None)?;
        self.apply_effects()?;
        Ok(id)
    }

    /// Acquire logical ownership of an entry, loading it on a miss.
    pub fn protect(
        &mut self,
        class: &Arc<dyn EntryClass>,
        addr: Address,
        ctx: LoadContext<'_>,
        flags: ProtectFlags,
    ) -> Result<EntryId> {
        let id = match self.index.find(&self.arena, addr) {
            Some(id) => {
                self.check_class(id, class.as_ref())?;
                let entry = self.arena.entry_mut(id);
                entry.protection = match (entry.protection, flags.read_only) {
                    (Protection::None, false) => Protection::Exclusive,
                    (Protection::None, true) => Protection::ReadOnly(1),
                    (Protection::ReadOnly(n), true) => Protection::ReadOnly(n + 1),
                    _ => return Err(CacheError::AlreadyProtected(addr)),
                };
                entry.accesses += 1;
                self.queues.relocate(&mut self.arena, id);
                self.record_access(true)?;
                id
            }
            None => {
                let id = self.load_and_insert(class, addr, ctx, flags)?;
                self.record_access(false)?;
                id
            }
        };
        Ok(id)
    }

    fn load_and_insert(
        &mut self,
        class: &Arc<dyn EntryClass>,
        addr: Address,
        ctx: LoadContext<'_>,
        flags: ProtectFlags,
    ) -> Result<EntryId> {
        if !flags.ring.is_valid() {
            return Err(CacheError::InvalidRing(flags.ring));
        }
        let loaded = load::load_entry(&self.store, &self.config.load, class.as_ref(), addr, ctx)?;
        self.stats.loads += 1;
        self.stats.load_retries += u64::from(loaded.attempts - 1);

        let size = loaded.size();
        self.flash_increase(size);
        self.make_space(size)?;

        let mut entry = CacheEntry::new(addr, size, flags.ring, Arc::clone(class), loaded.payload);
        entry.image = Some(loaded.image);
        entry.image_up_to_date = true;
        entry.accesses = 1;
        entry.protection = if flags.read_only {
            Protection::ReadOnly(1)
        } else {
            Protection::Exclusive
        };
        let id = self.link_new(entry)?;

        if loaded.dirtied {
            self.set_dirty(id)?;
        }
        self.notify(id, NotifyAction::AfterLoad, None, None)?;
        self.apply_effects()?;
        Ok(id)
    }

    /// Release protection, applying the requested state changes.
    pub fn unprotect(&mut self, addr: Address, flags: UnprotectFlags) -> Result<()> {
        let id = self.id_of(addr)?;
        let entry = self.arena.entry(id);
        match entry.protection {
            Protection::None => return Err(CacheError::NotProtected(addr)),
            Protection::ReadOnly(_) if flags.dirtied => {
                return Err(CacheError::ReadOnlyEntry(addr))
            }
            _ => {}
        }
        if flags.pin && flags.unpin {
            return Err(CacheError::Invariant(format!(
                "unprotect of {addr} asked to both pin and unpin"
            )));
        }
        if flags.pin && entry.pinned_by_client {
            return Err(CacheError::AlreadyPinned(addr));
        }
        if flags.unpin && !entry.pinned_by_client {
            return Err(CacheError::NotPinned(addr));
        }
        if flags.delete {
            let still_protected = matches!(entry.protection, Protection::ReadOnly(n) if n > 1);
            let reason = if still_protected {
                Some("protected")
            } else if flags.pin || (entry.pinned_by_client && !flags.unpin) {
                Some("pinned")
            } else if entry.n_children > 0 {
                Some("has flush dependency children")
            } else {
                None
            };
            if let Some(reason) = reason {
                return Err(CacheError::RemoveOfLiveEntry { addr, reason });
            }
        }

        let entry = self.arena.entry_mut(id);
        let dirtied = flags.dirtied || entry.dirtied;
        entry.protection = match entry.protection {
            Protection::ReadOnly(n) if n > 1 => Protection::ReadOnly(n - 1),
            _ => Protection::None,
        };
        if !entry.is_protected() {
            entry.dirtied = false;
        }
        if flags.pin {
            entry.pinned_by_client = true;
            self.stats.pins += 1;
        }
        if flags.unpin {
            entry.pinned_by_client = false;
            self.stats.unpins += 1;
        }
        if flags.flush_marker {
            entry.flush_marker = true;
        }

        if dirtied {
            self.set_dirty(id)?;
        }
        self.queues.relocate(&mut self.arena, id);

        if flags.delete {
            self.flush_single(id, FlushMode::discard(flags.free_file_space))?;
            self.stats.expunges += 1;
            debug!(addr = %addr, "Deleted entry on unprotect");
        }
        self.apply_effects()
    }

    /// Pin an entry on behalf of the client.
    pub fn pin_entry(&mut self, addr: Address) -> Result<()> {
        let id = self.id_of(addr)?;
        self.pin_id(id)
    }

    pub(crate) fn pin_id(&mut self, id: EntryId) -> Result<()> {
        let entry = self.arena.entry_mut(id);
        if entry.pinned_by_client {
            return Err(CacheError::AlreadyPinned(entry.addr));
        }
        entry.pinned_by_client = true;
        self.queues.relocate(&mut self.arena, id);
        self.stats.pins += 1;
        Ok(())
    }

    /// Drop the client pin. The entry returns to the LRU once no pin source
    /// and no protection remain.
    pub fn unpin_entry(&mut self, addr: Address) -> Result<()> {
        let id = self.id_of(addr)?;
        self.unpin_id(id)
    }

    pub(crate) fn unpin_id(&mut self, id: EntryId) -> Result<()> {
        let entry = self.arena.entry_mut(id);
        if !entry.pinned_by_client {
            return Err(CacheError::NotPinned(entry.addr));
        }
        entry.pinned_by_client = false;
        self.queues.relocate(&mut self.arena, id);
        self.stats.unpins += 1;
        Ok(())
    }

    /// Change the declared size of a pinned or protected entry. The entry
    /// becomes dirty.
    pub fn resize_entry(&mut self, addr: Address, new_size: usize) -> Result<()> {
        let id = self.id_of(addr)?;
        if new_size == 0 {
            return Err(CacheError::InvalidResize {
                addr,
                size: new_size,
            });
        }
        let entry = self.arena.entry(id);
        if !entry.is_pinned() && !entry.is_protected() {
            return Err(CacheError::NotPinnedOrProtected(addr));
        }
        if entry.is_read_only() {
            return Err(CacheError::ReadOnlyEntry(addr));
        }
        let old_size = entry.size;
        if new_size > old_size {
            self.flash_increase(new_size - old_size);
        }
        if new_size != old_size {
            self.resize_internal(id, new_size);
            self.stats.resizes += 1;
        }
        self.set_dirty(id)?;
        debug!(addr = %addr, old_size, new_size, "Resized entry");
        self.apply_effects()
    }

    /// Re-key an entry to a new address. The entry becomes dirty.
    pub fn move_entry(&mut self, old_addr: Address, new_addr: Address) -> Result<()> {
        let id = self.id_of(old_addr)?;
        if old_addr != new_addr {
            if self.contains(new_addr) {
                return Err(CacheError::DuplicateInsert(new_addr));
            }
            if self.arena.entry(id).is_read_only() {
                return Err(CacheError::ReadOnlyEntry(old_addr));
            }
            self.move_internal(id, new_addr);
            self.stats.moves += 1;
        }
        self.set_dirty(id)?;
        debug!(from = %old_addr, to = %new_addr, "Moved entry");
        self.apply_effects()
    }

    /// Mark an entry dirty outside of unprotect.
    ///
    /// On a protected entry this is recorded and takes effect when it is
    /// unprotected; a pinned entry is dirtied at once.
    pub fn mark_entry_dirty(&mut self, addr: Address) -> Result<()> {
        let id = self.id_of(addr)?;
        let entry = self.arena.entry(id);
        let (protection, pinned) = (entry.protection, entry.is_pinned());
        match protection {
            Protection::Exclusive => {
                self.arena.entry_mut(id).dirtied = true;
                Ok(())
            }
            Protection::ReadOnly(_) => Err(CacheError::ReadOnlyEntry(addr)),
            Protection::None if pinned => {
                self.set_dirty(id)?;
                self.apply_effects()
            }
            Protection::None => Err(CacheError::NotPinnedOrProtected(addr)),
        }
    }

    /// Mark a pinned, unprotected entry clean without writing it.
    pub fn mark_entry_clean(&mut self, addr: Address) -> Result<()> {
        let id = self.id_of(addr)?;
        let entry = self.arena.entry(id);
        if entry.is_protected() {
            return Err(CacheError::EntryProtected(addr));
        }
        if !entry.is_pinned() {
            return Err(CacheError::NotPinnedOrProtected(addr));
        }
        if entry.is_dirty {
            self.set_clean(id)?;
            self.stats.clears += 1;
        }
        self.apply_effects()
    }

    /// Discard an entry without writing it, whatever its dirty state.
    pub fn expunge_entry(
        &mut self,
        class: &Arc<dyn EntryClass>,
        addr: Address,
        free_file_space: bool,
    ) -> Result<()> {
        let id = self.id_of(addr)?;
        self.check_class(id, class.as_ref())?;
        let entry = self.arena.entry(id);
        if entry.is_protected() {
            return Err(CacheError::RemoveOfLiveEntry {
                addr,
                reason: "protected",
            });
        }
        if entry.is_pinned() {
            return Err(CacheError::RemoveOfLiveEntry {
                addr,
                reason: "pinned",
            });
        }
        self.flush_single(id, FlushMode::discard(free_file_space))?;
        self.stats.expunges += 1;
        debug!(addr = %addr, free_file_space, "Expunged entry");
        self.apply_effects()
    }

    /// Take a clean, idle entry out of the cache and hand its payload back.
    ///
    /// Unlike expunge, no notification is sent and the class's `free` hook
    /// is not called.
    pub fn remove_entry(&mut self, addr: Address) -> Result<Box<dyn Any + Send>> {
        let id = self.id_of(addr)?;
        let entry = self.arena.entry(id);
        let reason = if entry.is_protected() {
            Some("protected")
        } else if entry.is_pinned() {
            Some("pinned")
        } else if entry.is_dirty {
            Some("dirty")
        } else if !entry.parents.is_empty() {
            Some("has flush dependency parents")
        } else if entry.n_children > 0 {
            Some("has flush dependency children")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(CacheError::RemoveOfLiveEntry { addr, reason });
        }

        self.queues.detach(&mut self.arena, id);
        self.index.remove(&mut self.arena, id);
        let entry = self.arena.remove(id).ok_or(CacheError::StaleHandle)?;
        self.stats.removals += 1;
        debug!(addr = %addr, "Removed entry");
        entry
            .payload
            .ok_or_else(|| CacheError::Invariant(format!("entry {addr} has no payload")))
    }

    // ------------------------------------------------------------------
    // Payload access
    // ------------------------------------------------------------------

    /// Borrow the payload of a protected or pinned entry.
    pub fn payload<T: 'static>(&self, addr: Address) -> Result<&T> {
        let id = self.id_of(addr)?;
        let entry = self.arena.entry(id);
        if !entry.is_protected() && !entry.is_pinned() {
            return Err(CacheError::NotPinnedOrProtected(addr));
        }
        entry
            .payload
            .as_deref()
            .and_then(|p| p.downcast_ref::<T>())
            .ok_or(CacheError::PayloadType {
                addr,
                expected: std::any::type_name::<T>(),
            })
    }

    /// Mutably borrow the payload of an exclusively protected entry.
    pub fn payload_mut<T: 'static>(&mut self, addr: Address) -> Result<&mut T> {
        let id = self.id_of(addr)?;
        let entry = self.arena.entry_mut(id);
        match entry.protection {
            Protection::Exclusive => {}
            Protection::ReadOnly(_) => return Err(CacheError::ReadOnlyEntry(addr)),
            Protection::None => return Err(CacheError::NotProtected(addr)),
        }
        entry
            .payload
            .as_deref_mut()
            .and_then(|p| p.downcast_mut::<T>())
            .ok_or(CacheError::PayloadType {
                addr,
                expected: std::any::type_name::<T>(),
            })
    }

    // ------------------------------------------------------------------
    // Internal transitions
    // ------------------------------------------------------------------

    pub(crate) fn id_of(&self, addr: Address) -> Result<EntryId> {
        self.index
            .lookup(&self.arena, addr)
            .ok_or(CacheError::NotInCache(addr))
    }

    pub(crate) fn addr_of(&self, id: EntryId) -> Result<Address> {
        self.arena
            .get(id)
            .map(|e| e.addr)
            .ok_or(CacheError::StaleHandle)
    }

    pub(crate) fn pressure(&self, needed: usize) -> Pressure {
        Pressure {
            size: self.index.size(),
            clean_size: self.index.clean_size(),
            max_size: self.max_size,
            min_clean_size: self.min_clean_size,
            needed,
        }
    }

    fn check_class(&self, id: EntryId, class: &dyn EntryClass) -> Result<()> {
        let entry = self.arena.entry(id);
        if entry.class.id() != class.id() {
            return Err(CacheError::ClassMismatch {
                addr: entry.addr,
                expected: class.name(),
                actual: entry.class.name(),
            });
        }
        Ok(())
    }

    /// Put a fresh entry into the arena, index, dirty set and queues.
    fn link_new(&mut self, entry: CacheEntry) -> Result<EntryId> {
        let (addr, size, dirty) = (entry.addr, entry.size, entry.is_dirty);
        let id = self.arena.insert(entry);
        if let Err(e) = self.index.insert(&mut self.arena, id) {
            self.arena.remove(id);
            return Err(e);
        }
        if dirty && self.dirty_set.insert(addr, id, size) {
            self.arena.entry_mut(id).in_dirty_set = true;
        }
        self.queues.attach(&mut self.arena, id);
        Ok(id)
    }

    /// Deliver a lifecycle notification, queueing any effects it requests.
    pub(crate) fn notify(
        &mut self,
        id: EntryId,
        action: NotifyAction,
        child: Option<Address>,
        freed_space: Option<usize>,
    ) -> Result<()> {
        let entry = self.arena.entry_mut(id);
        if !entry.class.wants_notify() {
            return Ok(());
        }
        let class = Arc::clone(&entry.class);
        let (addr, size, ring, is_dirty) = (entry.addr, entry.size, entry.ring, entry.is_dirty);
        let payload = entry
            .payload
            .as_deref_mut()
            .ok_or_else(|| CacheError::Invariant(format!("entry {addr} has no payload")))?;
        let mut effects = Effects::new();
        let ctx = NotifyContext {
            addr,
            size,
            ring,
            is_dirty,
            child,
            freed_space,
            payload,
        };
        class
            .notify(action, ctx, &mut effects)
            .map_err(|e| CacheError::class(addr, e))?;
        self.pending_dirty.extend(effects.dirty);
        Ok(())
    }

    /// Dirty every entry a callback asked for, until no requests remain.
    /// Requests for entries no longer cached are dropped.
    pub(crate) fn apply_effects(&mut self) -> Result<()> {
        while !self.pending_dirty.is_empty() {
            let batch = std::mem::take(&mut self.pending_dirty);
            for addr in batch {
                match self.index.lookup(&self.arena, addr) {
                    Some(id) => self.set_dirty(id)?,
                    None => debug!(addr = %addr, "Dropping dirty request for uncached entry"),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn set_dirty(&mut self, id: EntryId) -> Result<()> {
        let entry = self.arena.entry_mut(id);
        let was_dirty = entry.is_dirty;
        let was_unserialized = entry.is_unserialized();
        entry.is_dirty = true;
        entry.image_up_to_date = false;
        let (addr, size) = (entry.addr, entry.size);

        let mut actions = Vec::with_capacity(2);
        if !was_dirty {
            self.index.on_dirty(self.arena.entry(id));
            self.queues.on_dirty(&mut self.arena, id);
            if self.dirty_set.insert(addr, id, size) {
                self.arena.entry_mut(id).in_dirty_set = true;
            }
            actions.push(NotifyAction::ChildDirtied);
        }
        if !was_unserialized {
            actions.push(NotifyAction::ChildUnserialized);
        }
        self.propagate_to_parents(id, &actions)?;
        if !was_dirty {
            self.notify(id, NotifyAction::EntryDirtied, None, None)?;
        }
        Ok(())
    }

    /// Mark a dirty entry clean. The image is left as it is: after a write it
    /// is current, after a clear it may be stale while the file copy is not.
    pub(crate) fn set_clean(&mut self, id: EntryId) -> Result<()> {
        let entry = self.arena.entry_mut(id);
        if !entry.is_dirty {
            return Ok(());
        }
        let was_unserialized = entry.is_unserialized();
        entry.is_dirty = false;
        entry.dirtied = false;
        let addr = entry.addr;

        self.index.on_clean(self.arena.entry(id));
        self.queues.on_clean(&mut self.arena, id);
        if self.dirty_set.remove(addr).is_some() {
            self.arena.entry_mut(id).in_dirty_set = false;
        }

        let mut actions = vec![NotifyAction::ChildCleaned];
        if was_unserialized {
            actions.push(NotifyAction::ChildSerialized);
        }
        self.propagate_to_parents(id, &actions)?;
        self.notify(id, NotifyAction::EntryCleaned, None, None)
    }

    /// The entry's image now reflects its payload.
    pub(crate) fn set_image_current(&mut self, id: EntryId) -> Result<()> {
        let entry = self.arena.entry_mut(id);
        let was_unserialized = entry.is_unserialized();
        entry.image_up_to_date = true;
        if was_unserialized {
            self.propagate_to_parents(id, &[NotifyAction::ChildSerialized])?;
        }
        Ok(())
    }

    pub(crate) fn resize_internal(&mut self, id: EntryId, new_size: usize) {
        let entry = self.arena.entry_mut(id);
        let old_size = entry.size;
        entry.size = new_size;
        let addr = entry.addr;
        self.index.on_size_change(self.arena.entry(id), old_size);
        self.queues.on_size_change(&self.arena, id, old_size);
        self.dirty_set.update_size(addr, new_size);
    }

    pub(crate) fn move_internal(&mut self, id: EntryId, new_addr: Address) {
        let entry = self.arena.entry_mut(id);
        let old_addr = entry.addr;
        entry.addr = new_addr;
        self.index.rekey(&self.arena, id, old_addr);
        self.dirty_set.rekey(old_addr, new_addr);
    }

    // ------------------------------------------------------------------
    // Consistency checking
    // ------------------------------------------------------------------

    /// Walk every structure and verify that they agree.
    pub fn check_invariants(&self) -> Result<()> {
        let fail = |msg: String| Err(CacheError::Invariant(msg));

        if self.arena.len() != self.index.len() {
            return fail(format!(
                "arena holds {} entries, index {}",
                self.arena.len(),
                self.index.len()
            ));
        }
        if let Some(stale) = self.index.ids().find(|id| !self.arena.contains(*id)) {
            return fail(format!("index holds stale handle {stale:?}"));
        }

        let mut size = 0;
        let mut clean = 0;
        let mut dirty = 0;
        let mut dirty_count = 0;
        let mut rings = [RingUsage::default(); Ring::COUNT];
        let mut children = std::collections::HashMap::<EntryId, (usize, usize, usize)>::new();

        for (id, entry) in self.arena.iter() {
            let addr = entry.addr;
            if !entry.in_index || self.index.lookup(&self.arena, addr) != Some(id) {
                return fail(format!("entry {addr} is not reachable through the index"));
            }
            if entry.list != entry.expected_list() {
                return fail(format!(
                    "entry {addr} is on {:?}, expected {:?}",
                    entry.list,
                    entry.expected_list()
                ));
            }
            if entry.flush_in_progress {
                return fail(format!("entry {addr} is still marked as flushing"));
            }
            if entry.payload.is_none() {
                return fail(format!("entry {addr} has no payload"));
            }
            if entry.size == 0 {
                return fail(format!("entry {addr} has zero size"));
            }
            if self.dirty_set.is_enabled() {
                if entry.is_dirty != self.dirty_set.contains(addr)
                    || entry.is_dirty != entry.in_dirty_set
                {
                    return fail(format!("dirty set disagrees with entry {addr}"));
                }
            } else if entry.in_dirty_set {
                return fail(format!("entry {addr} claims a disabled dirty set"));
            }
            if entry.pinned_by_dependency != (entry.n_children > 0) {
                return fail(format!("dependency pin of {addr} disagrees with its children"));
            }
            if entry.n_dirty_children > entry.n_children
                || entry.n_unserialized_children > entry.n_children
            {
                return fail(format!("child counters of {addr} exceed its children"));
            }

            size += entry.size;
            let ring = &mut rings[entry.ring.index()];
            ring.len += 1;
            ring.size += entry.size;
            if entry.is_dirty {
                dirty += entry.size;
                ring.dirty_size += entry.size;
                dirty_count += 1;
            } else {
                clean += entry.size;
                ring.clean_size += entry.size;
            }

            for parent in &entry.parents {
                let Some(p) = self.arena.get(*parent) else {
                    return fail(format!("entry {addr} has a dangling parent"));
                };
                if p.ring < entry.ring {
                    return fail(format!("parent {} is outside child {addr}'s ring", p.addr));
                }
                let counts = children.entry(*parent).or_default();
                counts.0 += 1;
                if entry.is_dirty {
                    counts.1 += 1;
                }
                if entry.is_unserialized() {
                    counts.2 += 1;
                }
            }
        }

        if size != self.index.size()
            || clean != self.index.clean_size()
            || dirty != self.index.dirty_size()
        {
            return fail(format!(
                "size counters ({}, clean {}, dirty {}) disagree with entries ({size}, clean {clean}, dirty {dirty})",
                self.index.size(),
                self.index.clean_size(),
                self.index.dirty_size()
            ));
        }
        for ring in Ring::all() {
            if rings[ring.index()] != self.index.ring_usage(ring) {
                return fail(format!("ring {ring} usage disagrees with its entries"));
            }
        }
        if self.dirty_set.is_enabled()
            && (self.dirty_set.len() != dirty_count || self.dirty_set.size() != dirty)
        {
            return fail(format!(
                "dirty set holds {} entries of {} bytes, {dirty_count} of {dirty} are dirty",
                self.dirty_set.len(),
                self.dirty_set.size()
            ));
        }

        for (id, entry) in self.arena.iter() {
            let (n, d, u) = children.get(&id).copied().unwrap_or_default();
            if (entry.n_children, entry.n_dirty_children, entry.n_unserialized_children) != (n, d, u)
            {
                return fail(format!(
                    "entry {} counts ({}, {}, {}) children, found ({n}, {d}, {u})",
                    entry.addr,
                    entry.n_children,
                    entry.n_dirty_children,
                    entry.n_unserialized_children
                ));
            }
        }

        self.check_lists()
    }

    fn check_lists(&self) -> Result<()> {
        let fail = |msg: String| Err(CacheError::Invariant(msg));
        let mut seen = 0;
        for kind in [ListKind::Lru, ListKind::Pinned, ListKind::Protected] {
            let members = self.queues.members(&self.arena, kind);
            let stats = match kind {
                ListKind::Lru => self.queues.lru_stats(),
                ListKind::Pinned => self.queues.pinned_stats(),
                _ => self.queues.protected_stats(),
            };
            let bytes: usize = members.iter().map(|id| self.arena.entry(*id).size).sum();
            if members.len() != stats.len || bytes != stats.size {
                return fail(format!("{kind:?} list length or size is stale"));
            }
            if let Some(id) = members.iter().find(|id| self.arena.entry(**id).list != kind) {
                return fail(format!(
                    "entry {} is linked on {kind:?} but marked otherwise",
                    self.arena.entry(*id).addr
                ));
            }
            seen += members.len();
        }
        if seen != self.index.len() {
            return fail(format!(
                "{seen} entries on lists, {} in the index",
                self.index.len()
            ));
        }

        for dirty in [false, true] {
            let members = self.queues.aux_members(&self.arena, dirty);
            let stats = if dirty {
                self.queues.dirty_lru_stats()
            } else {
                self.queues.clean_lru_stats()
            };
            let bytes: usize = members.iter().map(|id| self.arena.entry(*id).size).sum();
            if members.len() != stats.len || bytes != stats.size {
                return fail(format!("{} LRU length or size is stale", if dirty { "dirty" } else { "clean" }));
            }
            for id in &members {
                let entry = self.arena.entry(*id);
                if entry.list != ListKind::Lru || entry.is_dirty != dirty {
                    return fail(format!("entry {} is on the wrong LRU sub-list", entry.addr));
                }
            }
        }
        let lru = self.queues.lru_stats();
        let clean = self.queues.clean_lru_stats();
        let dirty = self.queues.dirty_lru_stats();
        if clean.len + dirty.len != lru.len || clean.size + dirty.size != lru.size {
            return fail("clean and dirty LRU do not partition the LRU".to_string());
        }
        Ok(())
    }
}

impl<S: BackingStore> std::fmt::Debug for Cache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.index.len())
            .field("size", &self.index.size())
            .field("dirty_size", &self.index.dirty_size())
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::test_support::BytesClass;
    use crate::store::MemStore;

    fn cache() -> Cache<MemStore> {
        Cache::new(Config::default(), MemStore::new(4096)).unwrap()
    }

    fn insert(cache: &mut Cache<MemStore>, addr: u64, size: usize) -> EntryId {
        cache
            .insert_entry(
                &BytesClass::shared(),
                Address(addr),
                Box::new(vec![1u8; size]),
                InsertFlags::default(),
            )
            .unwrap()
    }

    #[test]
    fn test_insert_is_dirty_and_counted() {
        let mut cache = cache();
        insert(&mut cache, 100, 100);
        assert_eq!(cache.size(), 100);
        assert_eq!(cache.dirty_size(), 100);
        assert_eq!(cache.dirty_set_len(), 1);
        assert_eq!(cache.lru_stats().len, 1);
        let status = cache.entry_status(Address(100)).unwrap();
        assert!(status.is_dirty);
        assert!(!status.image_up_to_date);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_duplicate_and_empty_insert_rejected() {
        let mut cache = cache();
        insert(&mut cache, 8, 8);
        let class = BytesClass::shared();
        let err = cache
            .insert_entry(&class, Address(8), Box::new(vec![0u8; 8]), InsertFlags::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::DuplicateInsert(Address(8))));
        let err = cache
            .insert_entry(&class, Address(16), Box::new(Vec::<u8>::new()), InsertFlags::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidResize { size: 0, .. }));
        assert_eq!(cache.len(), 1);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_protect_hit_moves_to_protected_list() {
        let mut cache = cache();
        let class = BytesClass::shared();
        insert(&mut cache, 8, 8);
        cache
            .protect(&class, Address(8), &(), ProtectFlags::default())
            .unwrap();
        assert_eq!(cache.protected_stats().len, 1);
        assert_eq!(cache.lru_stats().len, 0);
        let err = cache
            .protect(&class, Address(8), &(), ProtectFlags::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::AlreadyProtected(_)));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_read_only_protection_is_counted() {
        let mut cache = cache();
        let class = BytesClass::shared();
        insert(&mut cache, 8, 8);
        cache.protect(&class, Address(8), &(), ProtectFlags::read_only()).unwrap();
        cache.protect(&class, Address(8), &(), ProtectFlags::read_only()).unwrap();
        assert_eq!(cache.entry_status(Address(8)).unwrap().read_only_holders, 2);
        assert!(matches!(
            cache.protect(&class, Address(8), &(), ProtectFlags::default()),
            Err(CacheError::AlreadyProtected(_))
        ));
        assert!(matches!(
            cache.unprotect(Address(8), UnprotectFlags::dirtied()),
            Err(CacheError::ReadOnlyEntry(_))
        ));
        cache.unprotect(Address(8), UnprotectFlags::default()).unwrap();
        assert!(cache.entry_status(Address(8)).unwrap().is_protected);
        cache.unprotect(Address(8), UnprotectFlags::default()).unwrap();
        assert!(!cache.entry_status(Address(8)).unwrap().is_protected);
        assert!(matches!(
            cache.unprotect(Address(8), UnprotectFlags::default()),
            Err(CacheError::NotProtected(_))
        ));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_pin_unpin_contract() {
        let mut cache = cache();
        insert(&mut cache, 8, 8);
        cache.pin_entry(Address(8)).unwrap();
        assert!(matches!(
            cache.pin_entry(Address(8)),
            Err(CacheError::AlreadyPinned(_))
        ));
        assert_eq!(cache.pinned_stats().len, 1);
        cache.unpin_entry(Address(8)).unwrap();
        assert!(matches!(
            cache.unpin_entry(Address(8)),
            Err(CacheError::NotPinned(_))
        ));
        assert_eq!(cache.lru_stats().len, 1);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_resize_requires_pin_or_protect() {
        let mut cache = cache();
        insert(&mut cache, 8, 8);
        assert!(matches!(
            cache.resize_entry(Address(8), 16),
            Err(CacheError::NotPinnedOrProtected(_))
        ));
        cache.pin_entry(Address(8)).unwrap();
        assert!(matches!(
            cache.resize_entry(Address(8), 0),
            Err(CacheError::InvalidResize { .. })
        ));
        cache.resize_entry(Address(8), 24).unwrap();
        assert_eq!(cache.size(), 24);
        assert_eq!(cache.pinned_stats().size, 24);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_move_rekeys_index_and_dirty_set() {
        let mut cache = cache();
        insert(&mut cache, 8, 8);
        insert(&mut cache, 64, 8);
        assert!(matches!(
            cache.move_entry(Address(8), Address(64)),
            Err(CacheError::DuplicateInsert(Address(64)))
        ));
        cache.move_entry(Address(8), Address(128)).unwrap();
        assert!(!cache.contains(Address(8)));
        assert!(cache.entry_status(Address(128)).unwrap().is_dirty);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_payload_access_rules() {
        let mut cache = cache();
        let class = BytesClass::shared();
        insert(&mut cache, 8, 4);
        assert!(matches!(
            cache.payload::<Vec<u8>>(Address(8)),
            Err(CacheError::NotPinnedOrProtected(_))
        ));
        cache.protect(&class, Address(8), &(), ProtectFlags::default()).unwrap();
        cache.payload_mut::<Vec<u8>>(Address(8)).unwrap()[0] = 9;
        assert_eq!(cache.payload::<Vec<u8>>(Address(8)).unwrap()[0], 9);
        assert!(matches!(
            cache.payload::<String>(Address(8)),
            Err(CacheError::PayloadType { .. })
        ));
    }

    #[test]
    fn test_remove_hands_back_payload() {
        let mut cache = cache();
        insert(&mut cache, 8, 4);
        assert!(matches!(
            cache.remove_entry(Address(8)),
            Err(CacheError::RemoveOfLiveEntry { reason: "dirty", .. })
        ));
        cache.flush_entry(Address(8)).unwrap();
        let payload = cache.remove_entry(Address(8)).unwrap();
        assert_eq!(payload.downcast_ref::<Vec<u8>>(), Some(&vec![1u8; 4]));
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_set_max_size_validates() {
        let mut cache = cache();
        assert!(cache.set_max_size(100, 200).is_err());
        cache.set_max_size(100, 50).unwrap();
        assert_eq!(cache.max_size(), 100);
        assert_eq!(cache.stats().max_size, 100);
    }
}
