//! Error types for the metadata cache.
//!
//! Contract violations (wrong state transitions requested by a client) are
//! reported as distinct [`CacheError`] variants and are never silently
//! corrected. Backing-store failures arrive as [`StoreError`] and client
//! callback failures as [`ClassError`].

use thiserror::Error;

use crate::cache::entry::{Address, Ring};
use crate::store::StoreError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors returned by client entry-class callbacks.
#[derive(Error, Debug)]
pub enum ClassError {
    /// The on-disk image could not be decoded.
    #[error("malformed image: {0}")]
    Malformed(String),

    /// The payload handed to the class is not the type it manages.
    #[error("payload is not a {expected}")]
    WrongPayload { expected: &'static str },

    /// Any other client failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Unified error type for cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("entry {0} is already protected")]
    AlreadyProtected(Address),

    #[error("entry {0} is not protected")]
    NotProtected(Address),

    #[error("entry {0} is already pinned by the client")]
    AlreadyPinned(Address),

    #[error("entry {0} is not pinned by the client")]
    NotPinned(Address),

    #[error("an entry already exists at {0}")]
    DuplicateInsert(Address),

    #[error("entry {0} is protected read-only")]
    ReadOnlyEntry(Address),

    #[error("entry {0} must be pinned or protected")]
    NotPinnedOrProtected(Address),

    #[error("ring {0} is out of range")]
    InvalidRing(Ring),

    #[error("invalid size {size} for entry {addr}")]
    InvalidResize { addr: Address, size: usize },

    /// Remove/expunge of an entry that is dirty, protected, pinned or
    /// still bound by flush dependencies.
    #[error("cannot remove live entry {addr}: {reason}")]
    RemoveOfLiveEntry { addr: Address, reason: &'static str },

    #[error("flush dependency {parent} -> {child} would create a cycle")]
    CyclicDependency { parent: Address, child: Address },

    #[error("flush dependency {parent} -> {child} already exists")]
    DuplicateDependency { parent: Address, child: Address },

    #[error("no flush dependency {parent} -> {child}")]
    NoSuchDependency { parent: Address, child: Address },

    #[error("checksum verification failed for {addr} after {attempts} attempts")]
    ChecksumFailureExhausted { addr: Address, attempts: u32 },

    #[error("read of {len} bytes at {addr} extends past end of allocation {eoa}")]
    ReadPastEndOfAllocation {
        addr: Address,
        len: usize,
        eoa: Address,
    },

    #[error("collective protocol violation at {addr}: {detail}")]
    CollectiveProtocolViolation { addr: Address, detail: String },

    #[error("entry {0} is not in the cache")]
    NotInCache(Address),

    #[error("entry {addr} belongs to class {actual}, not {expected}")]
    ClassMismatch {
        addr: Address,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("entry {0} is protected and cannot be flushed or discarded")]
    EntryProtected(Address),

    #[error("entry {addr} has {count} unserialized flush dependency children")]
    UnserializedChildren { addr: Address, count: usize },

    #[error("writes are not permitted; cannot flush dirty entry {0}")]
    WriteNotPermitted(Address),

    #[error("flushing ring {inner} re-dirtied entry {addr} in outer ring {outer}")]
    RingOrderViolation {
        addr: Address,
        outer: Ring,
        inner: Ring,
    },

    #[error("flush of ring {ring} made no progress with {remaining} entries left")]
    FlushStalled { ring: Ring, remaining: usize },

    #[error("stale entry handle")]
    StaleHandle,

    #[error("payload of entry {addr} is not a {expected}")]
    PayloadType {
        addr: Address,
        expected: &'static str,
    },

    #[error("cache invariant violated: {0}")]
    Invariant(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("entry class callback failed for {addr}: {source}")]
    Class {
        addr: Address,
        #[source]
        source: ClassError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CacheError {
    /// Wrap a class callback failure with the entry it concerned.
    pub(crate) fn class(addr: Address, source: ClassError) -> Self {
        CacheError::Class { addr, source }
    }

    /// Whether this error reports a client contract violation rather than
    /// an I/O or callback failure.
    pub fn is_contract_violation(&self) -> bool {
        !matches!(
            self,
            CacheError::Store(_)
                | CacheError::Class { .. }
                | CacheError::ChecksumFailureExhausted { .. }
                | CacheError::Config(_)
        )
    }
}
