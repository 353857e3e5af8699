//! Address-ordered set of dirty entries.
//!
//! Flushing in increasing address order keeps backing-store writes mostly
//! sequential, and the ordering is what collective sync points partition
//! across processes. Single-process configurations may disable the set;
//! flush order then falls back to dirty-LRU order.

use std::collections::BTreeMap;

use crate::cache::entry::{Address, EntryId};

#[derive(Debug)]
pub(crate) struct DirtySet {
    enabled: bool,
    entries: BTreeMap<Address, (EntryId, usize)>,
    size: usize,
}

impl DirtySet {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: BTreeMap::new(),
            size: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total bytes of the entries in the set.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Insert a newly dirtied entry. Returns whether it was recorded.
    pub fn insert(&mut self, addr: Address, id: EntryId, size: usize) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some((_, old)) = self.entries.insert(addr, (id, size)) {
            self.size -= old;
        }
        self.size += size;
        true
    }

    pub fn remove(&mut self, addr: Address) -> Option<EntryId> {
        let (id, size) = self.entries.remove(&addr)?;
        self.size -= size;
        Some(id)
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn update_size(&mut self, addr: Address, new_size: usize) {
        if let Some((_, size)) = self.entries.get_mut(&addr) {
            self.size = self.size - *size + new_size;
            *size = new_size;
        }
    }

    /// Re-key an entry that moved from `old` to `new`.
    pub fn rekey(&mut self, old: Address, new: Address) {
        if let Some(value) = self.entries.remove(&old) {
            self.entries.insert(new, value);
        }
    }

    /// Dirty entries in ascending address order.
    pub fn ids(&self) -> impl Iterator<Item = (Address, EntryId)> + '_ {
        self.entries.iter().map(|(addr, (id, _))| (*addr, *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::EntryArena;
    use crate::cache::test_support::entry;

    fn ids(n: usize) -> Vec<EntryId> {
        let mut arena = EntryArena::new();
        (0..n)
            .map(|i| arena.insert(entry(i as u64 * 8, 8, true)))
            .collect()
    }

    #[test]
    fn test_iterates_in_address_order() {
        let ids = ids(3);
        let mut set = DirtySet::new(true);
        set.insert(Address(300), ids[0], 10);
        set.insert(Address(100), ids[1], 20);
        set.insert(Address(200), ids[2], 30);
        let order: Vec<_> = set.ids().map(|(a, _)| a.0).collect();
        assert_eq!(order, vec![100, 200, 300]);
        assert_eq!(set.size(), 60);
        assert_eq!(set.ids().next().map(|(_, id)| id), Some(ids[1]));
    }

    #[test]
    fn test_remove_resize_and_rekey() {
        let ids = ids(2);
        let mut set = DirtySet::new(true);
        set.insert(Address(8), ids[0], 10);
        set.insert(Address(16), ids[1], 10);
        set.update_size(Address(8), 40);
        assert_eq!(set.size(), 50);
        set.rekey(Address(8), Address(64));
        assert!(set.contains(Address(64)));
        assert!(!set.contains(Address(8)));
        assert_eq!(set.remove(Address(64)), Some(ids[0]));
        assert_eq!(set.size(), 10);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_disabled_set_records_nothing() {
        let ids = ids(1);
        let mut set = DirtySet::new(false);
        assert!(!set.insert(Address(8), ids[0], 10));
        assert!(set.is_empty());
        assert!(!set.is_enabled());
    }
}
