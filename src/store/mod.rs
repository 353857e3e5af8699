//! Backing stores.
//!
//! The cache only needs "read/write N bytes at address A" plus the current
//! end of allocation. [`MemStore`] keeps the image in memory and records
//! every write; [`FileStore`] uses positional I/O on a file.

pub mod file;
pub mod mem;

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::cache::entry::Address;

pub use file::FileStore;
pub use mem::{MemStore, WriteRecord};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("access of {len} bytes at {addr} is out of bounds (end of allocation {eoa})")]
    OutOfBounds {
        addr: Address,
        len: usize,
        eoa: Address,
    },

    #[error("store at {0} is read-only")]
    ReadOnly(PathBuf),

    #[error("injected fault: {0}")]
    Injected(&'static str),
}

/// One element of a vectorized write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub addr: Address,
    pub data: Bytes,
}

/// Running I/O counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoStats {
    pub total_reads: u64,
    pub total_writes: u64,
    pub total_vector_writes: u64,
    pub total_bytes_read: u64,
    pub total_bytes_written: u64,
}

/// Flat byte-addressed storage behind the cache.
pub trait BackingStore: Send + Sync {
    /// Read exactly `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Write all of `data` at `addr`.
    fn write(&self, addr: Address, data: &[u8]) -> Result<(), StoreError>;

    /// Write a batch of images in one call.
    ///
    /// In collective mode every process issues this call at a sync point,
    /// possibly with an empty batch.
    fn write_vector(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        for op in ops {
            self.write(op.addr, &op.data)?;
        }
        Ok(())
    }

    /// First address past the allocated extent.
    fn end_of_allocation(&self) -> Address;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), StoreError> {
        (**self).read(addr, buf)
    }

    fn write(&self, addr: Address, data: &[u8]) -> Result<(), StoreError> {
        (**self).write(addr, data)
    }

    fn write_vector(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        (**self).write_vector(ops)
    }

    fn end_of_allocation(&self) -> Address {
        (**self).end_of_allocation()
    }

    fn sync(&self) -> Result<(), StoreError> {
        (**self).sync()
    }
}

impl<T: BackingStore + ?Sized> BackingStore for Box<T> {
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), StoreError> {
        (**self).read(addr, buf)
    }

    fn write(&self, addr: Address, data: &[u8]) -> Result<(), StoreError> {
        (**self).write(addr, data)
    }

    fn write_vector(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        (**self).write_vector(ops)
    }

    fn end_of_allocation(&self) -> Address {
        (**self).end_of_allocation()
    }

    fn sync(&self) -> Result<(), StoreError> {
        (**self).sync()
    }
}

/// Check that `[addr, addr + len)` lies inside `[0, eoa)`.
pub(crate) fn check_bounds(addr: Address, len: usize, eoa: Address) -> Result<(), StoreError> {
    match addr.0.checked_add(len as u64) {
        Some(end) if end <= eoa.0 => Ok(()),
        _ => Err(StoreError::OutOfBounds { addr, len, eoa }),
    }
}
