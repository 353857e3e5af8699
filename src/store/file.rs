//! File-backed store using positional I/O.
//!
//! `std::os::unix::fs::FileExt` reads and writes at explicit offsets, so no
//! shared seek position is needed. The end of allocation is tracked
//! separately from the file length: writes past it extend it, reads past it
//! are rejected.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::{check_bounds, BackingStore, IoStats, StoreError};
use crate::cache::entry::Address;

#[derive(Debug)]
pub struct FileStore {
    file: File,
    path: PathBuf,
    writable: bool,
    eoa: AtomicU64,
    stats: Mutex<IoStats>,
}

impl FileStore {
    /// Open an existing file, read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| OpenOptions::new().read(true).open(path).map(|file| (file, false)))?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable,
            eoa: AtomicU64::new(len),
            stats: Mutex::new(IoStats::default()),
        })
    }

    /// Create (or truncate) a file with `len` bytes allocated.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        debug!(path = %path.display(), len, "Created file store");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable: true,
            eoa: AtomicU64::new(len),
            stats: Mutex::new(IoStats::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Extend the allocated extent; never shrinks it.
    pub fn set_end_of_allocation(&self, eoa: Address) {
        self.eoa.fetch_max(eoa.0, Ordering::AcqRel);
    }

    pub fn stats(&self) -> IoStats {
        *self.stats.lock()
    }
}

impl BackingStore for FileStore {
    fn read(&self, addr: Address, buf: &mut [u8]) -> Result<(), StoreError> {
        check_bounds(addr, buf.len(), self.end_of_allocation())?;
        let file_len = self.file.metadata()?.len();
        // Allocated but never written space reads as zeroes.
        let avail = file_len.saturating_sub(addr.0).min(buf.len() as u64) as usize;
        if avail > 0 {
            self.file.read_exact_at(&mut buf[..avail], addr.0)?;
        }
        buf[avail..].fill(0);

        let mut stats = self.stats.lock();
        stats.total_reads += 1;
        stats.total_bytes_read += buf.len() as u64;
        Ok(())
    }

    fn write(&self, addr: Address, data: &[u8]) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::ReadOnly(self.path.clone()));
        }
        self.file.write_all_at(data, addr.0)?;
        self.set_end_of_allocation(addr.offset(data.len()));

        let mut stats = self.stats.lock();
        stats.total_writes += 1;
        stats.total_bytes_written += data.len() as u64;
        Ok(())
    }

    fn end_of_allocation(&self) -> Address {
        Address(self.eoa.load(Ordering::Acquire))
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_file() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::create(tmp.path().join("meta.bin"), 4096).unwrap();

        store.write(Address(512), &[42u8; 128]).unwrap();
        let mut buf = vec![0u8; 128];
        store.read(Address(512), &mut buf).unwrap();
        assert_eq!(buf, vec![42u8; 128]);
        assert_eq!(store.stats().total_bytes_written, 128);
        store.sync().unwrap();
    }

    #[test]
    fn test_write_extends_allocation() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::create(tmp.path().join("meta.bin"), 64).unwrap();
        assert_eq!(store.end_of_allocation(), Address(64));

        let mut buf = [0u8; 16];
        assert!(store.read(Address(64), &mut buf).is_err());

        store.write(Address(64), &[1u8; 16]).unwrap();
        assert_eq!(store.end_of_allocation(), Address(80));
        store.read(Address(64), &mut buf).unwrap();
        assert_eq!(buf, [1u8; 16]);
    }

    #[test]
    fn test_reopen_sees_previous_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("meta.bin");
        {
            let store = FileStore::create(&path, 256).unwrap();
            store.write(Address(8), b"header").unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        let mut buf = [0u8; 6];
        store.read(Address(8), &mut buf).unwrap();
        assert_eq!(&buf, b"header");
        assert_eq!(store.path(), path.as_path());
    }
}
