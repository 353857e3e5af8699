//! Shared fixtures for the integration tests: an in-memory cache and an
//! entry class that records every notification it receives.

#![allow(dead_code)]

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use metadata_cache::cache::class::{
    downcast_payload, downcast_payload_mut, ClassResult, Effects, EntryClass, LoadContext,
    NotifyAction, NotifyContext, PreSerialize,
};
use metadata_cache::{Address, Cache, Config, InsertFlags, MemStore, Ring};

/// Payload of a [`TestClass`] entry. The image is `data` itself.
#[derive(Debug, Clone, Default)]
pub struct Blob {
    pub data: Vec<u8>,
    /// Entries to dirty whenever this one is written.
    pub dirty_on_flush: Vec<Address>,
    /// Requested from `pre_serialize` on the next serialization.
    pub relocate_to: Option<Address>,
    pub resize_to: Option<usize>,
}

impl Blob {
    pub fn new(size: usize, fill: u8) -> Self {
        Self {
            data: vec![fill; size],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub addr: Address,
    pub action: NotifyAction,
    pub child: Option<Address>,
    pub freed_space: Option<usize>,
}

/// Entry class that logs notifications and frees.
#[derive(Default)]
pub struct TestClass {
    events: Mutex<Vec<Event>>,
    frees: Mutex<usize>,
}

impl TestClass {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Actions delivered to `addr`, in order.
    pub fn actions_for(&self, addr: Address) -> Vec<NotifyAction> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.addr == addr)
            .map(|e| e.action)
            .collect()
    }

    /// Addresses that received `action`, in order.
    pub fn addrs_with(&self, action: NotifyAction) -> Vec<Address> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.action == action)
            .map(|e| e.addr)
            .collect()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    pub fn frees(&self) -> usize {
        *self.frees.lock()
    }
}

impl EntryClass for TestClass {
    fn id(&self) -> u32 {
        7
    }

    fn name(&self) -> &'static str {
        "test"
    }

    fn initial_load_size(&self, _addr: Address, ctx: LoadContext<'_>) -> ClassResult<usize> {
        Ok(ctx.downcast_ref::<usize>().copied().unwrap_or(32))
    }

    fn deserialize(
        &self,
        image: &[u8],
        _addr: Address,
        _ctx: LoadContext<'_>,
    ) -> ClassResult<(Box<dyn Any + Send>, bool)> {
        Ok((
            Box::new(Blob {
                data: image.to_vec(),
                ..Default::default()
            }),
            false,
        ))
    }

    fn image_len(&self, payload: &(dyn Any + Send)) -> ClassResult<usize> {
        Ok(downcast_payload::<Blob>(payload, "Blob")?.data.len())
    }

    fn pre_serialize(
        &self,
        _addr: Address,
        _size: usize,
        payload: &mut (dyn Any + Send),
        _effects: &mut Effects,
    ) -> ClassResult<PreSerialize> {
        let blob = downcast_payload_mut::<Blob>(payload, "Blob")?;
        let change = PreSerialize {
            new_addr: blob.relocate_to.take(),
            new_size: blob.resize_to.take(),
        };
        if let Some(size) = change.new_size {
            blob.data.resize(size, 0);
        }
        Ok(change)
    }

    fn serialize(&self, payload: &(dyn Any + Send), image: &mut [u8]) -> ClassResult<()> {
        let blob = downcast_payload::<Blob>(payload, "Blob")?;
        let n = image.len().min(blob.data.len());
        image[..n].copy_from_slice(&blob.data[..n]);
        Ok(())
    }

    fn wants_notify(&self) -> bool {
        true
    }

    fn notify(
        &self,
        action: NotifyAction,
        ctx: NotifyContext<'_>,
        effects: &mut Effects,
    ) -> ClassResult<()> {
        if action == NotifyAction::AfterFlush {
            let blob = downcast_payload::<Blob>(ctx.payload, "Blob")?;
            for addr in &blob.dirty_on_flush {
                effects.mark_dirty(*addr);
            }
        }
        self.events.lock().push(Event {
            addr: ctx.addr,
            action,
            child: ctx.child,
            freed_space: ctx.freed_space,
        });
        Ok(())
    }

    fn free(&self, payload: Box<dyn Any + Send>) -> ClassResult<()> {
        drop(payload);
        *self.frees.lock() += 1;
        Ok(())
    }
}

/// Upcast for the cache API.
pub fn dyn_class(class: &Arc<TestClass>) -> Arc<dyn EntryClass> {
    Arc::clone(class) as Arc<dyn EntryClass>
}

/// A cache over a 64 KiB in-memory store with the given budget.
pub fn new_cache(max_size: usize, min_clean_size: usize) -> Cache<MemStore> {
    let mut config = Config::default();
    config.cache.max_size = max_size;
    config.cache.min_clean_size = min_clean_size;
    Cache::new(config, MemStore::new(64 * 1024)).unwrap()
}

pub fn insert(
    cache: &mut Cache<MemStore>,
    class: &Arc<dyn EntryClass>,
    addr: u64,
    blob: Blob,
    ring: Ring,
) {
    cache
        .insert_entry(
            class,
            Address(addr),
            Box::new(blob),
            InsertFlags {
                ring,
                ..Default::default()
            },
        )
        .unwrap();
}
