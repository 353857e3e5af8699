//! Flush-dependency graph.
//!
//! A parent may not be written while any child is dirty. Edges are stored on
//! the child (its `parents` list); parents keep counters of their children,
//! of the dirty ones and of the unserialized ones. An entry with at least one
//! child is pinned by the dependency and leaves the LRU until its last child
//! is gone.

use tracing::debug;

use crate::cache::class::NotifyAction;
use crate::cache::entry::{Address, EntryId};
use crate::cache::lifecycle::Cache;
use crate::error::{CacheError, Result};
use crate::store::BackingStore;

impl<S: BackingStore> Cache<S> {
    /// Make `parent` wait for `child`: the parent will not be flushed while
    /// the child is dirty.
    pub fn create_flush_dependency(&mut self, parent: Address, child: Address) -> Result<()> {
        if parent == child {
            return Err(CacheError::CyclicDependency { parent, child });
        }
        let parent_id = self.id_of(parent)?;
        let child_id = self.id_of(child)?;

        let p = self.arena.entry(parent_id);
        let c = self.arena.entry(child_id);
        if p.ring < c.ring {
            return Err(CacheError::RingOrderViolation {
                addr: parent,
                outer: p.ring,
                inner: c.ring,
            });
        }
        if c.parents.contains(&parent_id) {
            return Err(CacheError::DuplicateDependency { parent, child });
        }
        #[cfg(debug_assertions)]
        if self.is_ancestor(child_id, parent_id) {
            return Err(CacheError::CyclicDependency { parent, child });
        }

        let (child_dirty, child_unserialized) = (c.is_dirty, c.is_unserialized());
        self.arena.entry_mut(child_id).parents.push(parent_id);

        let p = self.arena.entry_mut(parent_id);
        p.n_children += 1;
        if child_dirty {
            p.n_dirty_children += 1;
        }
        if child_unserialized {
            p.n_unserialized_children += 1;
        }
        p.pinned_by_dependency = true;
        self.queues.relocate(&mut self.arena, parent_id);

        if child_dirty {
            self.notify(parent_id, NotifyAction::ChildDirtied, Some(child), None)?;
        }
        if child_unserialized {
            self.notify(parent_id, NotifyAction::ChildUnserialized, Some(child), None)?;
        }
        debug!(parent = %parent, child = %child, "Created flush dependency");
        self.apply_effects()
    }

    /// Remove the edge `parent` → `child`.
    pub fn destroy_flush_dependency(&mut self, parent: Address, child: Address) -> Result<()> {
        let parent_id = self.id_of(parent)?;
        let child_id = self.id_of(child)?;
        let c = self.arena.entry(child_id);
        let Some(pos) = c.parents.iter().position(|p| *p == parent_id) else {
            return Err(CacheError::NoSuchDependency { parent, child });
        };
        self.unlink_parent(child_id, parent_id, pos)?;
        debug!(parent = %parent, child = %child, "Destroyed flush dependency");
        self.apply_effects()
    }

    /// Addresses of the entry's flush-dependency parents.
    pub fn parents_of(&self, addr: Address) -> Result<Vec<Address>> {
        let id = self.id_of(addr)?;
        Ok(self
            .arena
            .entry(id)
            .parents
            .iter()
            .map(|p| self.arena.entry(*p).addr)
            .collect())
    }

    /// Drop every parent edge of an entry that is leaving the cache.
    pub(crate) fn detach_from_parents(&mut self, id: EntryId) -> Result<()> {
        while let Some(&parent_id) = self.arena.entry(id).parents.last() {
            let pos = self.arena.entry(id).parents.len() - 1;
            self.unlink_parent(id, parent_id, pos)?;
        }
        Ok(())
    }

    fn unlink_parent(&mut self, child_id: EntryId, parent_id: EntryId, pos: usize) -> Result<()> {
        let c = self.arena.entry_mut(child_id);
        c.parents.remove(pos);
        let (child, child_dirty, child_unserialized) = (c.addr, c.is_dirty, c.is_unserialized());

        let p = self.arena.entry_mut(parent_id);
        p.n_children -= 1;
        if child_dirty {
            p.n_dirty_children -= 1;
        }
        if child_unserialized {
            p.n_unserialized_children -= 1;
        }
        if p.n_children == 0 {
            p.pinned_by_dependency = false;
            self.queues.relocate(&mut self.arena, parent_id);
        }

        if child_dirty {
            self.notify(parent_id, NotifyAction::ChildCleaned, Some(child), None)?;
        }
        if child_unserialized {
            self.notify(parent_id, NotifyAction::ChildSerialized, Some(child), None)?;
        }
        Ok(())
    }

    /// Apply child state changes to every parent's counters, then tell each
    /// parent about them.
    pub(crate) fn propagate_to_parents(
        &mut self,
        child_id: EntryId,
        actions: &[NotifyAction],
    ) -> Result<()> {
        if actions.is_empty() || self.arena.entry(child_id).parents.is_empty() {
            return Ok(());
        }
        let c = self.arena.entry(child_id);
        let child = c.addr;
        let parents = c.parents.clone();

        for parent_id in &parents {
            let p = self.arena.entry_mut(*parent_id);
            for action in actions {
                match action {
                    NotifyAction::ChildDirtied => p.n_dirty_children += 1,
                    NotifyAction::ChildCleaned => p.n_dirty_children -= 1,
                    NotifyAction::ChildUnserialized => p.n_unserialized_children += 1,
                    NotifyAction::ChildSerialized => p.n_unserialized_children -= 1,
                    _ => {}
                }
            }
        }
        for parent_id in parents {
            for action in actions {
                self.notify(parent_id, *action, Some(child), None)?;
            }
        }
        Ok(())
    }

    /// Whether `ancestor` is reachable from `id` by following parent edges.
    #[cfg(debug_assertions)]
    fn is_ancestor(&self, ancestor: EntryId, id: EntryId) -> bool {
        let mut stack = vec![id];
        let mut seen = std::collections::HashSet::new();
        while let Some(next) = stack.pop() {
            if next == ancestor {
                return true;
            }
            if seen.insert(next) {
                stack.extend(self.arena.entry(next).parents.iter().copied());
            }
        }
        false
    }
}
