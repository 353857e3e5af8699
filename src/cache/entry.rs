//! Cache entry types.
//!
//! An entry is the in-memory representation of a fixed-address byte range
//! in the backing store. Entries live in the cache's [`EntryArena`] and are
//! referred to by [`EntryId`] handles; every list the cache maintains links
//! entries through index-based pointers stored in the entry itself.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::class::EntryClass;

/// Byte address of an entry in the backing store's flat address space.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Address(pub u64);

impl Address {
    /// Address `len` bytes past this one.
    pub fn offset(self, len: usize) -> Address {
        Address(self.0 + len as u64)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(value: u64) -> Self {
        Address(value)
    }
}

/// Flush-ordering class of an entry.
///
/// Rings are flushed from the outermost (lowest ordinal) inward: every entry
/// of an outer ring is durable before any entry of an inner ring is written.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Ring(pub u8);

impl Ring {
    /// Ordinary client metadata.
    pub const USER: Ring = Ring(0);
    /// Free-space manager for raw data.
    pub const RAW_DATA_FSM: Ring = Ring(1);
    /// Free-space manager for metadata.
    pub const METADATA_FSM: Ring = Ring(2);
    /// Superblock extension.
    pub const SUPERBLOCK_EXT: Ring = Ring(3);
    /// The superblock itself, always flushed last.
    pub const SUPERBLOCK: Ring = Ring(4);

    /// Number of rings.
    pub const COUNT: usize = 5;

    /// All rings, outermost first.
    pub fn all() -> impl Iterator<Item = Ring> {
        (0..Self::COUNT as u8).map(Ring)
    }

    /// Index into per-ring arrays.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// Whether the ordinal names a ring the cache tracks.
    pub fn is_valid(self) -> bool {
        self.index() < Self::COUNT
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to an entry in the arena.
///
/// The generation guards against a handle outliving its entry and being
/// used on whatever later reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    slot: u32,
    generation: u32,
}

/// Logical ownership currently granted on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protection {
    #[default]
    None,
    /// Exclusive, not re-entrant.
    Exclusive,
    /// Shared read-only; the count is the number of outstanding holders.
    ReadOnly(u32),
}

impl Protection {
    pub fn is_protected(&self) -> bool {
        !matches!(self, Protection::None)
    }
}

/// Which replacement list an entry's main links currently thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListKind {
    #[default]
    Detached,
    Lru,
    Pinned,
    Protected,
}

/// Intrusive doubly-linked list pointers.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Links {
    pub prev: Option<EntryId>,
    pub next: Option<EntryId>,
}

/// A cached entry.
pub struct CacheEntry {
    pub(crate) addr: Address,
    pub(crate) size: usize,
    pub(crate) ring: Ring,
    pub(crate) class: Arc<dyn EntryClass>,

    /// Client in-memory representation; `None` only transiently while a
    /// callback owns it.
    pub(crate) payload: Option<Box<dyn Any + Send>>,

    /// Serialized image, absent until first generated or loaded.
    pub(crate) image: Option<Vec<u8>>,
    pub(crate) image_up_to_date: bool,

    pub(crate) is_dirty: bool,
    /// Set when the entry was dirtied while protected.
    pub(crate) dirtied: bool,
    pub(crate) protection: Protection,
    pub(crate) pinned_by_client: bool,
    pub(crate) pinned_by_dependency: bool,
    pub(crate) flush_marker: bool,
    pub(crate) flush_in_progress: bool,

    pub(crate) in_index: bool,
    pub(crate) in_dirty_set: bool,

    /// Flush-dependency parents, in creation order.
    pub(crate) parents: Vec<EntryId>,
    pub(crate) n_children: usize,
    pub(crate) n_dirty_children: usize,
    pub(crate) n_unserialized_children: usize,

    pub(crate) list: ListKind,
    /// Links on the list named by `list`.
    pub(crate) main: Links,
    /// Links on the clean or dirty LRU sub-list (LRU members only).
    pub(crate) aux: Links,

    /// Collective sync point: this process writes the entry.
    pub(crate) flush_immediately: bool,
    /// Collective sync point: another process writes it; clear locally.
    pub(crate) clear_on_sync: bool,

    pub(crate) accesses: u64,
}

impl CacheEntry {
    pub(crate) fn new(
        addr: Address,
        size: usize,
        ring: Ring,
        class: Arc<dyn EntryClass>,
        payload: Box<dyn Any + Send>,
    ) -> Self {
        Self {
            addr,
            size,
            ring,
            class,
            payload: Some(payload),
            image: None,
            image_up_to_date: false,
            is_dirty: false,
            dirtied: false,
            protection: Protection::None,
            pinned_by_client: false,
            pinned_by_dependency: false,
            flush_marker: false,
            flush_in_progress: false,
            in_index: false,
            in_dirty_set: false,
            parents: Vec::new(),
            n_children: 0,
            n_dirty_children: 0,
            n_unserialized_children: 0,
            list: ListKind::Detached,
            main: Links::default(),
            aux: Links::default(),
            flush_immediately: false,
            clear_on_sync: false,
            accesses: 0,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ring(&self) -> Ring {
        self.ring
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn is_protected(&self) -> bool {
        self.protection.is_protected()
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.protection, Protection::ReadOnly(_))
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_by_client || self.pinned_by_dependency
    }

    /// Dirty with no current image: parents cannot be serialized yet.
    pub(crate) fn is_unserialized(&self) -> bool {
        self.is_dirty && !self.image_up_to_date
    }

    /// Whether the entry may sit on the main LRU.
    pub(crate) fn belongs_on_lru(&self) -> bool {
        !self.is_protected() && !self.is_pinned()
    }

    /// The list an entry in this state must be on.
    pub(crate) fn expected_list(&self) -> ListKind {
        if self.is_protected() {
            ListKind::Protected
        } else if self.is_pinned() {
            ListKind::Pinned
        } else {
            ListKind::Lru
        }
    }

    pub(crate) fn status(&self) -> EntryStatus {
        EntryStatus {
            addr: self.addr,
            size: self.size,
            ring: self.ring,
            class: self.class.name(),
            is_dirty: self.is_dirty,
            is_protected: self.is_protected(),
            is_read_only: self.is_read_only(),
            read_only_holders: match self.protection {
                Protection::ReadOnly(n) => n,
                _ => 0,
            },
            pinned_by_client: self.pinned_by_client,
            pinned_by_dependency: self.pinned_by_dependency,
            image_up_to_date: self.image_up_to_date,
            flush_marker: self.flush_marker,
            n_parents: self.parents.len(),
            n_children: self.n_children,
            n_dirty_children: self.n_dirty_children,
            n_unserialized_children: self.n_unserialized_children,
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .field("ring", &self.ring)
            .field("class", &self.class.name())
            .field("is_dirty", &self.is_dirty)
            .field("protection", &self.protection)
            .field("pinned_by_client", &self.pinned_by_client)
            .field("pinned_by_dependency", &self.pinned_by_dependency)
            .field("list", &self.list)
            .field("n_parents", &self.parents.len())
            .field("n_children", &self.n_children)
            .finish_non_exhaustive()
    }
}

/// Snapshot of an entry's state, as reported by
/// [`Cache::entry_status`](crate::cache::lifecycle::Cache::entry_status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryStatus {
    pub addr: Address,
    pub size: usize,
    pub ring: Ring,
    pub class: &'static str,
    pub is_dirty: bool,
    pub is_protected: bool,
    pub is_read_only: bool,
    pub read_only_holders: u32,
    pub pinned_by_client: bool,
    pub pinned_by_dependency: bool,
    pub image_up_to_date: bool,
    pub flush_marker: bool,
    pub n_parents: usize,
    pub n_children: usize,
    pub n_dirty_children: usize,
    pub n_unserialized_children: usize,
}

impl EntryStatus {
    pub fn is_pinned(&self) -> bool {
        self.pinned_by_client || self.pinned_by_dependency
    }
}

struct Slot {
    generation: u32,
    entry: Option<CacheEntry>,
}

/// Slab of entries addressed by [`EntryId`]. Free slots are recycled.
#[derive(Default)]
pub(crate) struct EntryArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl EntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn insert(&mut self, entry: CacheEntry) -> EntryId {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let s = &mut self.slots[slot as usize];
            s.generation = s.generation.wrapping_add(1);
            s.entry = Some(entry);
            return EntryId {
                slot,
                generation: s.generation,
            };
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: Some(entry),
        });
        EntryId {
            slot,
            generation: 0,
        }
    }

    pub fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        self.free.push(id.slot);
        self.len -= 1;
        Some(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<&CacheEntry> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn contains(&self, id: EntryId) -> bool {
        self.get(id).is_some()
    }

    /// Borrow an entry that the caller knows is live.
    ///
    /// Internal bookkeeping only ever holds ids of live entries; a dangling
    /// id here is a bug in the cache itself.
    pub fn entry(&self, id: EntryId) -> &CacheEntry {
        match self.get(id) {
            Some(entry) => entry,
            None => panic!("dangling entry id {id:?}"),
        }
    }

    pub fn entry_mut(&mut self, id: EntryId) -> &mut CacheEntry {
        match self.get_mut(id) {
            Some(entry) => entry,
            None => panic!("dangling entry id {id:?}"),
        }
    }

    /// Iterate over all live entries.
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &CacheEntry)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    EntryId {
                        slot: i as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<EntryId> {
        self.iter().map(|(id, _)| id).collect()
    }
}
