//! metadata-cache: write-back cache for the metadata of self-describing
//! file formats.
//!
//! Entries are byte ranges at fixed addresses in a flat backing store. The
//! cache keeps them in memory, tracks dirtiness, writes them back in a
//! dependency- and ring-respecting order, evicts under a size budget that
//! adapts to the hit rate, and can share flush work between cooperating
//! processes at sync points.

pub mod cache;
pub mod config;
pub mod error;
pub mod store;
pub mod workload;

pub use cache::{
    Address, Cache, CacheStats, EntryClass, EntryStatus, FlushFlags, InsertFlags, ProtectFlags,
    Ring, UnprotectFlags,
};
pub use config::Config;
pub use error::{CacheError, ClassError, Result};
pub use store::{BackingStore, FileStore, MemStore};
