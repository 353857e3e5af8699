//! Metadata entry cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`entry`]: CacheEntry, Address, Ring and the entry arena
//! - [`class`]: the EntryClass capability trait clients implement
//! - [`index`]: hash index and size accounting
//! - [`queues`]: LRU (with clean/dirty sub-lists), pinned and protected lists
//! - [`dirty_set`]: address-ordered dirty set
//! - [`lifecycle`]: the [`Cache`] coordinator and the entry lifecycle
//! - [`deps`]: flush-dependency graph
//! - [`flush`]: single-entry and whole-cache flush, eviction, make-space
//! - [`evictor`]: victim selection under memory pressure
//! - [`load`]: speculative-size load with checksum retry
//! - [`size_ctl`]: adaptive size controller
//! - [`collective`]: multi-process sync points
//! - [`guard`]: scoped pin and protect guards

pub mod class;
pub mod collective;
pub mod deps;
pub mod dirty_set;
pub mod entry;
pub mod evictor;
pub mod flush;
pub mod guard;
pub mod index;
pub mod lifecycle;
pub mod load;
pub mod queues;
pub mod size_ctl;
pub mod stats;

use std::sync::Arc;

use parking_lot::Mutex;

pub use self::class::{EntryClass, Effects, NotifyAction, NotifyContext, PreSerialize};
pub use self::collective::{partition_candidates, SyncReport};
pub use self::lifecycle::{Cache, InsertFlags, ProtectFlags, UnprotectFlags};
pub use self::entry::{Address, EntryId, EntryStatus, Ring};
pub use self::flush::FlushFlags;
pub use self::guard::{PinGuard, ProtectGuard};
pub use self::stats::CacheStats;

/// Thread-safe handle to a cache. The cache itself is single-threaded;
/// callers serialize access through the lock.
pub type SharedCache<S> = Arc<Mutex<Cache<S>>>;

/// Wrap a cache for sharing between threads.
pub fn new_shared_cache<S: crate::store::BackingStore>(cache: Cache<S>) -> SharedCache<S> {
    Arc::new(Mutex::new(cache))
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::any::Any;
    use std::sync::Arc;

    use super::class::{downcast_payload, ClassResult, EntryClass, LoadContext};
    use super::entry::{Address, CacheEntry, Ring};
    use crate::error::ClassError;

    /// Payload is a `Vec<u8>` that is its own image.
    pub struct BytesClass;

    impl BytesClass {
        pub fn shared() -> Arc<dyn EntryClass> {
            Arc::new(BytesClass)
        }
    }

    impl EntryClass for BytesClass {
        fn id(&self) -> u32 {
            1
        }

        fn name(&self) -> &'static str {
            "bytes"
        }

        fn initial_load_size(&self, _addr: Address, ctx: LoadContext<'_>) -> ClassResult<usize> {
            Ok(ctx.downcast_ref::<usize>().copied().unwrap_or(16))
        }

        fn deserialize(
            &self,
            image: &[u8],
            _addr: Address,
            _ctx: LoadContext<'_>,
        ) -> ClassResult<(Box<dyn Any + Send>, bool)> {
            Ok((Box::new(image.to_vec()), false))
        }

        fn image_len(&self, payload: &(dyn Any + Send)) -> ClassResult<usize> {
            Ok(downcast_payload::<Vec<u8>>(payload, "Vec<u8>")?.len())
        }

        fn serialize(&self, payload: &(dyn Any + Send), image: &mut [u8]) -> ClassResult<()> {
            let bytes = downcast_payload::<Vec<u8>>(payload, "Vec<u8>")?;
            if bytes.len() < image.len() {
                return Err(ClassError::Malformed(format!(
                    "payload of {} bytes cannot fill {} byte image",
                    bytes.len(),
                    image.len()
                )));
            }
            image.copy_from_slice(&bytes[..image.len()]);
            Ok(())
        }
    }

    /// A detached entry for exercising the data structures directly.
    pub fn entry(addr: u64, size: usize, dirty: bool) -> CacheEntry {
        let mut entry = CacheEntry::new(
            Address(addr),
            size,
            Ring::USER,
            BytesClass::shared(),
            Box::new(vec![0u8; size]),
        );
        entry.is_dirty = dirty;
        entry
    }
}
