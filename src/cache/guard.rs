//! Scoped pin and protect guards.
//!
//! A guard borrows the cache mutably for its lifetime and releases the pin or
//! protection when dropped. Both dereference to the cache so callers can keep
//! working with it while the guard is held.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::warn;

use crate::cache::class::{EntryClass, LoadContext};
use crate::cache::entry::{Address, EntryId};
use crate::cache::lifecycle::{Cache, ProtectFlags, UnprotectFlags};
use crate::error::Result;
use crate::store::BackingStore;

/// Holds a client pin until dropped.
pub struct PinGuard<'a, S: BackingStore> {
    cache: &'a mut Cache<S>,
    id: EntryId,
}

impl<S: BackingStore> PinGuard<'_, S> {
    /// Current address of the pinned entry.
    pub fn addr(&self) -> Result<Address> {
        self.cache.addr_of(self.id)
    }
}

impl<S: BackingStore> Deref for PinGuard<'_, S> {
    type Target = Cache<S>;

    fn deref(&self) -> &Self::Target {
        &*self.cache
    }
}

impl<S: BackingStore> DerefMut for PinGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.cache
    }
}

impl<S: BackingStore> Drop for PinGuard<'_, S> {
    fn drop(&mut self) {
        let still_pinned = self
            .cache
            .arena
            .get(self.id)
            .is_some_and(|e| e.pinned_by_client);
        if still_pinned {
            if let Err(e) = self.cache.unpin_id(self.id) {
                warn!(error = %e, "Failed to release pin guard");
            }
        }
    }
}

/// Holds protection on an entry until released or dropped.
pub struct ProtectGuard<'a, S: BackingStore> {
    cache: &'a mut Cache<S>,
    id: EntryId,
    dirtied: bool,
    released: bool,
}

impl<S: BackingStore> ProtectGuard<'_, S> {
    pub fn addr(&self) -> Result<Address> {
        self.cache.addr_of(self.id)
    }

    pub fn payload<T: 'static>(&self) -> Result<&T> {
        let addr = self.cache.addr_of(self.id)?;
        self.cache.payload::<T>(addr)
    }

    /// Mutable access; the entry is unprotected as dirtied.
    pub fn payload_mut<T: 'static>(&mut self) -> Result<&mut T> {
        let addr = self.cache.addr_of(self.id)?;
        self.dirtied = true;
        self.cache.payload_mut::<T>(addr)
    }

    pub fn mark_dirtied(&mut self) {
        self.dirtied = true;
    }

    /// Unprotect with explicit flags. The dirtied state recorded by the guard
    /// is added to them.
    pub fn release(mut self, mut flags: UnprotectFlags) -> Result<()> {
        self.released = true;
        flags.dirtied |= self.dirtied;
        let addr = self.cache.addr_of(self.id)?;
        self.cache.unprotect(addr, flags)
    }
}

impl<S: BackingStore> Deref for ProtectGuard<'_, S> {
    type Target = Cache<S>;

    fn deref(&self) -> &Self::Target {
        &*self.cache
    }
}

impl<S: BackingStore> DerefMut for ProtectGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.cache
    }
}

impl<S: BackingStore> Drop for ProtectGuard<'_, S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let result = self.cache.addr_of(self.id).and_then(|addr| {
            self.cache.unprotect(
                addr,
                UnprotectFlags {
                    dirtied: self.dirtied,
                    ..Default::default()
                },
            )
        });
        if let Err(e) = result {
            warn!(error = %e, "Failed to release protect guard");
        }
    }
}

impl<S: BackingStore> Cache<S> {
    /// Pin `addr` for the lifetime of the returned guard.
    pub fn pin_scoped(&mut self, addr: Address) -> Result<PinGuard<'_, S>> {
        let id = self.id_of(addr)?;
        self.pin_id(id)?;
        Ok(PinGuard { cache: self, id })
    }

    /// Protect `addr`, loading it if needed, for the lifetime of the
    /// returned guard.
    pub fn protect_scoped(
        &mut self,
        class: &Arc<dyn EntryClass>,
        addr: Address,
        ctx: LoadContext<'_>,
        flags: ProtectFlags,
    ) -> Result<ProtectGuard<'_, S>> {
        let id = self.protect(class, addr, ctx, flags)?;
        Ok(ProtectGuard {
            cache: self,
            id,
            dirtied: false,
            released: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::lifecycle::InsertFlags;
    use crate::cache::test_support::BytesClass;
    use crate::config::Config;
    use crate::store::MemStore;

    fn cache_with_clean_entry() -> Cache<MemStore> {
        let mut cache = Cache::new(Config::default(), MemStore::new(4096)).unwrap();
        cache
            .insert_entry(
                &BytesClass::shared(),
                Address(64),
                Box::new(vec![1u8; 8]),
                InsertFlags::default(),
            )
            .unwrap();
        cache.flush_entry(Address(64)).unwrap();
        cache
    }

    #[test]
    fn test_pin_guard_unpins_on_drop() {
        let mut cache = cache_with_clean_entry();
        {
            let guard = cache.pin_scoped(Address(64)).unwrap();
            assert!(guard.entry_status(Address(64)).unwrap().pinned_by_client);
            assert_eq!(guard.pinned_stats().len, 1);
        }
        assert!(!cache.entry_status(Address(64)).unwrap().pinned_by_client);
        assert_eq!(cache.lru_stats().len, 1);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_protect_guard_dirties_on_mutation() {
        let mut cache = cache_with_clean_entry();
        let class = BytesClass::shared();
        {
            let mut guard = cache
                .protect_scoped(&class, Address(64), &(), ProtectFlags::default())
                .unwrap();
            guard.payload_mut::<Vec<u8>>().unwrap()[0] = 42;
        }
        let status = cache.entry_status(Address(64)).unwrap();
        assert!(!status.is_protected);
        assert!(status.is_dirty);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_protect_guard_read_leaves_entry_clean() {
        let mut cache = cache_with_clean_entry();
        let class = BytesClass::shared();
        {
            let guard = cache
                .protect_scoped(&class, Address(64), &(), ProtectFlags::read_only())
                .unwrap();
            assert_eq!(guard.payload::<Vec<u8>>().unwrap()[0], 1);
        }
        assert!(!cache.entry_status(Address(64)).unwrap().is_dirty);
    }

    #[test]
    fn test_release_with_delete() {
        let mut cache = cache_with_clean_entry();
        let class = BytesClass::shared();
        let guard = cache
            .protect_scoped(&class, Address(64), &(), ProtectFlags::default())
            .unwrap();
        guard.release(UnprotectFlags::delete()).unwrap();
        assert!(!cache.contains(Address(64)));
        cache.check_invariants().unwrap();
    }
}
