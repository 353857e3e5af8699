//! Replacement queues.
//!
//! Every indexed entry threads exactly one of three lists through its main
//! links:
//! - the LRU, most recently used at the head, for entries that are neither
//!   protected nor pinned,
//! - the pinned list, for entries immune to eviction,
//! - the protected list, for entries a client currently owns.
//!
//! LRU members additionally thread a clean or dirty sub-list through their
//! aux links, so eviction can prefer clean entries without scanning past
//! dirty ones. Moving an entry is always unlink-then-relink with the list
//! lengths and byte sizes adjusted at both ends.

use crate::cache::entry::{EntryArena, EntryId, Links, ListKind};

/// Length and byte size of one list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListStats {
    pub len: usize,
    pub size: usize,
}

#[derive(Debug, Default)]
struct ListHead {
    head: Option<EntryId>,
    tail: Option<EntryId>,
    len: usize,
    size: usize,
}

impl ListHead {
    fn stats(&self) -> ListStats {
        ListStats {
            len: self.len,
            size: self.size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkSet {
    Main,
    Aux,
}

fn links(arena: &mut EntryArena, id: EntryId, set: LinkSet) -> &mut Links {
    let entry = arena.entry_mut(id);
    match set {
        LinkSet::Main => &mut entry.main,
        LinkSet::Aux => &mut entry.aux,
    }
}

fn links_ref(arena: &EntryArena, id: EntryId, set: LinkSet) -> Links {
    let entry = arena.entry(id);
    match set {
        LinkSet::Main => entry.main,
        LinkSet::Aux => entry.aux,
    }
}

fn push_front(arena: &mut EntryArena, list: &mut ListHead, id: EntryId, set: LinkSet) {
    let size = arena.entry(id).size;
    let old_head = list.head;
    {
        let l = links(arena, id, set);
        l.prev = None;
        l.next = old_head;
    }
    match old_head {
        Some(h) => links(arena, h, set).prev = Some(id),
        None => list.tail = Some(id),
    }
    list.head = Some(id);
    list.len += 1;
    list.size += size;
}

fn unlink(arena: &mut EntryArena, list: &mut ListHead, id: EntryId, set: LinkSet) {
    let size = arena.entry(id).size;
    let Links { prev, next } = links_ref(arena, id, set);
    match prev {
        Some(p) => links(arena, p, set).next = next,
        None => list.head = next,
    }
    match next {
        Some(n) => links(arena, n, set).prev = prev,
        None => list.tail = prev,
    }
    *links(arena, id, set) = Links::default();
    list.len -= 1;
    list.size -= size;
}

#[derive(Debug, Default)]
pub(crate) struct ReplacementQueues {
    lru: ListHead,
    clean_lru: ListHead,
    dirty_lru: ListHead,
    pinned: ListHead,
    protected: ListHead,
}

impl ReplacementQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn main_list(&mut self, kind: ListKind) -> Option<&mut ListHead> {
        match kind {
            ListKind::Lru => Some(&mut self.lru),
            ListKind::Pinned => Some(&mut self.pinned),
            ListKind::Protected => Some(&mut self.protected),
            ListKind::Detached => None,
        }
    }

    /// Link an unattached entry onto the list its state calls for, at the
    /// most-recently-used end.
    pub fn attach(&mut self, arena: &mut EntryArena, id: EntryId) {
        let (kind, dirty) = {
            let entry = arena.entry(id);
            debug_assert_eq!(entry.list, ListKind::Detached);
            (entry.expected_list(), entry.is_dirty)
        };
        if let Some(list) = self.main_list(kind) {
            push_front(arena, list, id, LinkSet::Main);
        }
        if kind == ListKind::Lru {
            let aux = if dirty {
                &mut self.dirty_lru
            } else {
                &mut self.clean_lru
            };
            push_front(arena, aux, id, LinkSet::Aux);
        }
        arena.entry_mut(id).list = kind;
    }

    /// Unlink an entry from whatever list it is on.
    pub fn detach(&mut self, arena: &mut EntryArena, id: EntryId) {
        let (kind, dirty) = {
            let entry = arena.entry(id);
            (entry.list, entry.is_dirty)
        };
        if let Some(list) = self.main_list(kind) {
            unlink(arena, list, id, LinkSet::Main);
        }
        if kind == ListKind::Lru {
            let aux = if dirty {
                &mut self.dirty_lru
            } else {
                &mut self.clean_lru
            };
            unlink(arena, aux, id, LinkSet::Aux);
        }
        arena.entry_mut(id).list = ListKind::Detached;
    }

    /// Move an entry to the list its current protection/pin state requires.
    pub fn relocate(&mut self, arena: &mut EntryArena, id: EntryId) {
        let entry = arena.entry(id);
        if entry.list == entry.expected_list() {
            return;
        }
        self.detach(arena, id);
        self.attach(arena, id);
    }

    /// Record a use of an LRU entry by moving it to the head.
    pub fn touch(&mut self, arena: &mut EntryArena, id: EntryId) {
        if arena.entry(id).list != ListKind::Lru {
            return;
        }
        self.detach(arena, id);
        self.attach(arena, id);
    }

    /// Called after `is_dirty` went false → true.
    pub fn on_dirty(&mut self, arena: &mut EntryArena, id: EntryId) {
        if arena.entry(id).list != ListKind::Lru {
            return;
        }
        unlink(arena, &mut self.clean_lru, id, LinkSet::Aux);
        push_front(arena, &mut self.dirty_lru, id, LinkSet::Aux);
    }

    /// Called after `is_dirty` went true → false.
    pub fn on_clean(&mut self, arena: &mut EntryArena, id: EntryId) {
        if arena.entry(id).list != ListKind::Lru {
            return;
        }
        unlink(arena, &mut self.dirty_lru, id, LinkSet::Aux);
        push_front(arena, &mut self.clean_lru, id, LinkSet::Aux);
    }

    /// Account for an entry whose size changed from `old_size`.
    pub fn on_size_change(&mut self, arena: &EntryArena, id: EntryId, old_size: usize) {
        let entry = arena.entry(id);
        let new_size = entry.size;
        let dirty = entry.is_dirty;
        let kind = entry.list;
        if let Some(list) = self.main_list(kind) {
            list.size = list.size - old_size + new_size;
        }
        if kind == ListKind::Lru {
            let aux = if dirty {
                &mut self.dirty_lru
            } else {
                &mut self.clean_lru
            };
            aux.size = aux.size - old_size + new_size;
        }
    }

    pub fn lru_tail(&self) -> Option<EntryId> {
        self.lru.tail
    }

    pub fn clean_lru_tail(&self) -> Option<EntryId> {
        self.clean_lru.tail
    }

    pub fn dirty_lru_tail(&self) -> Option<EntryId> {
        self.dirty_lru.tail
    }

    /// Next entry toward the head of the LRU.
    pub fn lru_prev(&self, arena: &EntryArena, id: EntryId) -> Option<EntryId> {
        arena.entry(id).main.prev
    }

    /// Next entry toward the head of the entry's clean/dirty sub-list.
    pub fn aux_prev(&self, arena: &EntryArena, id: EntryId) -> Option<EntryId> {
        arena.entry(id).aux.prev
    }

    pub fn lru_stats(&self) -> ListStats {
        self.lru.stats()
    }

    pub fn clean_lru_stats(&self) -> ListStats {
        self.clean_lru.stats()
    }

    pub fn dirty_lru_stats(&self) -> ListStats {
        self.dirty_lru.stats()
    }

    pub fn pinned_stats(&self) -> ListStats {
        self.pinned.stats()
    }

    pub fn protected_stats(&self) -> ListStats {
        self.protected.stats()
    }

    /// Members of a main list, head (most recent) first.
    pub fn members(&self, arena: &EntryArena, kind: ListKind) -> Vec<EntryId> {
        let head = match kind {
            ListKind::Lru => self.lru.head,
            ListKind::Pinned => self.pinned.head,
            ListKind::Protected => self.protected.head,
            ListKind::Detached => None,
        };
        walk(arena, head, LinkSet::Main)
    }

    /// Members of the clean (`dirty == false`) or dirty LRU sub-list, head
    /// first.
    pub fn aux_members(&self, arena: &EntryArena, dirty: bool) -> Vec<EntryId> {
        let head = if dirty {
            self.dirty_lru.head
        } else {
            self.clean_lru.head
        };
        walk(arena, head, LinkSet::Aux)
    }
}

fn walk(arena: &EntryArena, head: Option<EntryId>, set: LinkSet) -> Vec<EntryId> {
    let mut out = Vec::new();
    let mut cursor = head;
    while let Some(id) = cursor {
        out.push(id);
        cursor = links_ref(arena, id, set).next;
    }
    out
}
