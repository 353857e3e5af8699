//! Entry class descriptors.
//!
//! Each kind of metadata a client stores in the cache (object headers,
//! free-space sections, B-tree nodes, ...) implements [`EntryClass`]. The
//! cache only ever talks to payloads through this trait, so it can treat
//! arbitrary record kinds uniformly.

use std::any::Any;
use std::fmt;

use crate::cache::entry::{Address, Ring};
use crate::error::ClassError;

/// Result type for class callbacks.
pub type ClassResult<T> = std::result::Result<T, ClassError>;

/// Opaque client data handed through to load callbacks.
pub type LoadContext<'a> = &'a (dyn Any + Send + Sync);

/// Lifecycle events reported to [`EntryClass::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyAction {
    AfterInsert,
    AfterLoad,
    AfterFlush,
    BeforeEvict,
    EntryDirtied,
    EntryCleaned,
    ChildDirtied,
    ChildCleaned,
    ChildUnserialized,
    ChildSerialized,
}

impl fmt::Display for NotifyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Changes a class asks for just before its entry is serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreSerialize {
    /// The entry must move to this address before being written.
    pub new_addr: Option<Address>,
    /// The entry's image length changes to this many bytes.
    pub new_size: Option<usize>,
}

impl PreSerialize {
    pub fn unchanged() -> Self {
        Self::default()
    }
}

/// Side effects a callback requests on other entries.
///
/// Callbacks run while the cache is mid-operation and cannot call back into
/// it; requests collected here are applied once the callback returns.
#[derive(Debug, Default)]
pub struct Effects {
    pub(crate) dirty: Vec<Address>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the entry at `addr` dirty once the callback returns.
    ///
    /// Addresses not in the cache are ignored.
    pub fn mark_dirty(&mut self, addr: Address) {
        self.dirty.push(addr);
    }

    pub fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }
}

/// View of an entry passed to [`EntryClass::notify`].
pub struct NotifyContext<'a> {
    pub addr: Address,
    pub size: usize,
    pub ring: Ring,
    pub is_dirty: bool,
    /// For child notifications, the address of the child concerned.
    pub child: Option<Address>,
    /// Space the entry occupies in the file, reported on eviction when the
    /// client asked for file space to be released.
    pub freed_space: Option<usize>,
    pub payload: &'a mut (dyn Any + Send),
}

/// Capability set each client entry kind implements.
pub trait EntryClass: Send + Sync {
    /// Stable identifier; entries are only ever accessed through the class
    /// that created them.
    fn id(&self) -> u32;

    /// Human-readable name for logs and errors.
    fn name(&self) -> &'static str;

    /// Best-guess image length for a load of an entry at `addr`.
    fn initial_load_size(&self, addr: Address, ctx: LoadContext<'_>) -> ClassResult<usize>;

    /// Refine the image length from the bytes read so far.
    ///
    /// Return `Ok(None)` when the class does not support speculative loads
    /// or the initial guess was exact.
    fn final_load_size(
        &self,
        _image: &[u8],
        _initial_size: usize,
        _ctx: LoadContext<'_>,
    ) -> ClassResult<Option<usize>> {
        Ok(None)
    }

    /// Whether [`verify_checksum`](Self::verify_checksum) should be consulted
    /// on load.
    fn has_checksum(&self) -> bool {
        false
    }

    /// Integrity predicate over a freshly read image.
    fn verify_checksum(&self, _image: &[u8], _ctx: LoadContext<'_>) -> bool {
        true
    }

    /// Build the in-memory payload from an image. The flag reports whether
    /// deserialization itself dirtied the entry (e.g. an upgrade in place).
    fn deserialize(
        &self,
        image: &[u8],
        addr: Address,
        ctx: LoadContext<'_>,
    ) -> ClassResult<(Box<dyn Any + Send>, bool)>;

    /// Length of the payload's on-disk image.
    fn image_len(&self, payload: &(dyn Any + Send)) -> ClassResult<usize>;

    /// Hook run before serialization; may ask for a size or address change.
    fn pre_serialize(
        &self,
        _addr: Address,
        _size: usize,
        _payload: &mut (dyn Any + Send),
        _effects: &mut Effects,
    ) -> ClassResult<PreSerialize> {
        Ok(PreSerialize::unchanged())
    }

    /// Write the payload's image into `image`, which is exactly the entry's
    /// size.
    fn serialize(&self, payload: &(dyn Any + Send), image: &mut [u8]) -> ClassResult<()>;

    /// Whether this class wants lifecycle notifications.
    fn wants_notify(&self) -> bool {
        false
    }

    /// Lifecycle notification. Only called when
    /// [`wants_notify`](Self::wants_notify) is true.
    fn notify(
        &self,
        _action: NotifyAction,
        _ctx: NotifyContext<'_>,
        _effects: &mut Effects,
    ) -> ClassResult<()> {
        Ok(())
    }

    /// Release the payload when the entry leaves the cache.
    fn free(&self, payload: Box<dyn Any + Send>) -> ClassResult<()> {
        drop(payload);
        Ok(())
    }

    /// File space to release when the entry is discarded with
    /// `free_file_space`. Defaults to the entry's size.
    fn file_space_free_size(&self, _payload: &(dyn Any + Send), size: usize) -> usize {
        size
    }
}

impl fmt::Debug for dyn EntryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryClass")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// Downcast a payload to the type a class manages.
pub fn downcast_payload<'a, T: 'static>(
    payload: &'a (dyn Any + Send),
    expected: &'static str,
) -> ClassResult<&'a T> {
    payload
        .downcast_ref::<T>()
        .ok_or(ClassError::WrongPayload { expected })
}

/// Mutable counterpart of [`downcast_payload`].
pub fn downcast_payload_mut<'a, T: 'static>(
    payload: &'a mut (dyn Any + Send),
    expected: &'static str,
) -> ClassResult<&'a mut T> {
    payload
        .downcast_mut::<T>()
        .ok_or(ClassError::WrongPayload { expected })
}
