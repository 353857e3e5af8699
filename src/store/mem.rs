//! In-memory backing store.

use parking_lot::Mutex;
use tracing::debug;

use super::{check_bounds, BackingStore, IoStats, StoreError, WriteOp};
use crate::cache::entry::Address;

/// A write observed by a [`MemStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub addr: Address,
    pub len: usize,
    /// Index of the vectorized call this write was part of, if any.
    pub vector_call: Option<u64>,
}

#[derive(Debug, Default)]
struct Faults {
    corrupt_reads: u32,
    fail_reads: u32,
    fail_writes: u32,
}

#[derive(Debug)]
struct Inner {
    bytes: Vec<u8>,
    log: Vec<WriteRecord>,
    stats: IoStats,
    faults: Faults,
}

/// Byte image held in memory, with a write log and fault injection.
#[derive(Debug)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    /// A zero-filled store whose end of allocation is `len`.
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0u8; len])
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                bytes,
                log: Vec::new(),
                stats: IoStats::default(),
                faults: Faults::default(),
            }),
        }
    }

    /// Copy `data` into the image directly, bypassing the write log.
    pub fn preload(&self, addr: Address, data: &[u8]) {
        let mut inner = self.inner.lock();
        let start = addr.0 as usize;
        let end = start + data.len();
        if end > inner.bytes.len() {
            inner.bytes.resize(end, 0);
        }
        inner.bytes[start..end].copy_from_slice(data);
    }

    /// Snapshot of `len` bytes at `addr`.
    pub fn contents(&self, addr: Address, len: usize) -> Vec<u8> {
        let inner = self.inner.lock();
        let start = addr.0 as usize;
        inner.bytes[start..start + len].to_vec()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.inner.lock().log.clear();
    }

    pub fn stats(&self) -> IoStats {
        self.inner.lock().stats
    }

    /// Flip the bytes returned by the next `n` reads.
    pub fn corrupt_next_reads(&self, n: u32) {
        self.inner.lock().faults.corrupt_reads = n;
    }

    /// Fail the next `n` read calls.
    pub fn fail_next_reads(&self, n: u32) {
        self.inner.lock().faults.fail_reads = n;
    }

    /// Fail the next `n` write calls.
    pub fn fail_next_writes(&self, n: u32) {
        self.inner.lock().faults.fail_writes = n;
    }

    pub fn set_len(&self, len: usize) {
        self.inner.lock().bytes.resize(len, 0);
    }

    fn write_locked(
        inner: &mut Inner,
        addr: Address,
        data: &[u8],
        vector_call: Option<u64>,
    ) -> Result<(), StoreError> {
        check_bounds(addr, data.len(), Address(inner.bytes.len() as u64))?;
        let start = addr.0 as usize;
        inner.bytes[start..start + data.len()].copy_from_slice(data);
        inner.log.push(WriteRecord {
            addr,
            len: data.len(),
            vector_call,
        });
        inner.stats.total_writes += 1;
        inner.stats.total_bytes_written += data.len() as u64;
        Ok(())
    }
}

impl BackingStore for MemStore {
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_reads > 0 {
            inner.faults.fail_reads -= 1;
            return Err(StoreError::Injected("read failure"));
        }
        check_bounds(addr, buf.len(), Address(inner.bytes.len() as u64))?;
        let start = addr.0 as usize;
        buf.copy_from_slice(&inner.bytes[start..start + buf.len()]);
        if inner.faults.corrupt_reads > 0 {
            inner.faults.corrupt_reads -= 1;
            for b in buf.iter_mut() {
                *b = !*b;
            }
            debug!(addr = %addr, len = buf.len(), "Injected read corruption");
        }
        inner.stats.total_reads += 1;
        inner.stats.total_bytes_read += buf.len() as u64;
        Ok(())
    }

    fn write(&self, addr: Address, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_writes > 0 {
            inner.faults.fail_writes -= 1;
            return Err(StoreError::Injected("write failure"));
        }
        Self::write_locked(&mut inner, addr, data, None)
    }

    fn write_vector(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner.faults.fail_writes > 0 {
            inner.faults.fail_writes -= 1;
            return Err(StoreError::Injected("vector write failure"));
        }
        let call = inner.stats.total_vector_writes;
        inner.stats.total_vector_writes += 1;
        for op in ops {
            Self::write_locked(&mut inner, op.addr, &op.data, Some(call))?;
        }
        Ok(())
    }

    fn end_of_allocation(&self) -> Address {
        Address(self.inner.lock().bytes.len() as u64)
    }
}
