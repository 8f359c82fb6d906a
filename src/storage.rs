//! Storage Module
//!
//! Block-level collaborator the cache reads entries from and writes them to,
//! plus region allocation for the cache image block.

use crate::entry::Address;
use crate::{CacheError, Result};
use bytes::Bytes;
use fs2::FileExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Block I/O and space management consumed by the cache
pub trait Storage: Send + Sync {
    fn read(&self, address: Address, len: u64) -> Result<Bytes>;

    fn write(&self, address: Address, data: &[u8]) -> Result<()>;

    /// Reserve a region of `len` bytes and return its address
    fn allocate(&self, len: u64) -> Result<Address>;

    fn free(&self, address: Address, len: u64) -> Result<()>;
}

/// I/O counters shared by the storage implementations
#[derive(Debug, Default)]
pub struct StorageMetrics {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_written: AtomicU64,
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
}

impl StorageMetrics {
    pub fn snapshot(&self) -> StorageMetricsSnapshot {
        StorageMetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageMetricsSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub bytes_written: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// First-fit allocator over a growing address space
#[derive(Debug)]
struct RegionAllocator {
    end_of_space: Address,
    free_regions: BTreeMap<Address, u64>,
}

impl RegionAllocator {
    fn new(base: Address) -> Self {
        Self {
            end_of_space: base,
            free_regions: BTreeMap::new(),
        }
    }

    fn allocate(&mut self, len: u64) -> Result<Address> {
        if len == 0 {
            return Err(CacheError::AllocationError(
                "Cannot allocate a zero length region".to_string(),
            ));
        }
        let hit = self
            .free_regions
            .iter()
            .find(|(_, &region_len)| region_len >= len)
            .map(|(&a, &l)| (a, l));
        if let Some((address, region_len)) = hit {
            self.free_regions.remove(&address);
            if region_len > len {
                self.free_regions.insert(address + len, region_len - len);
            }
            return Ok(address);
        }
        let address = self.end_of_space;
        self.end_of_space = address.checked_add(len).ok_or_else(|| {
            CacheError::AllocationError(format!("Address space exhausted allocating {} bytes", len))
        })?;
        Ok(address)
    }

    fn free(&mut self, address: Address, len: u64) {
        if address + len == self.end_of_space {
            self.end_of_space = address;
        } else {
            self.free_regions.insert(address, len);
        }
    }
}

/// In-memory storage keyed by block address, with fault injection for tests
pub struct MemoryStorage {
    blocks: Mutex<HashMap<Address, Bytes>>,
    allocator: Mutex<RegionAllocator>,
    failing_writes: Mutex<HashSet<Address>>,
    write_log: Mutex<Vec<Address>>,
    pub metrics: StorageMetrics,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_base(0)
    }

    /// Allocations start at `base`; addresses below it are left to the caller
    pub fn with_base(base: Address) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            allocator: Mutex::new(RegionAllocator::new(base)),
            failing_writes: Mutex::new(HashSet::new()),
            write_log: Mutex::new(Vec::new()),
            metrics: StorageMetrics::default(),
        }
    }

    /// Make every later write to `address` fail
    pub fn fail_writes_to(&self, address: Address) -> Result<()> {
        lock(&self.failing_writes)?.insert(address);
        Ok(())
    }

    pub fn clear_write_failures(&self) -> Result<()> {
        lock(&self.failing_writes)?.clear();
        Ok(())
    }

    /// Addresses written, in order
    pub fn write_log(&self) -> Result<Vec<Address>> {
        Ok(lock(&self.write_log)?.clone())
    }

    /// Store a block directly, bypassing the write counters
    pub fn preload(&self, address: Address, data: &[u8]) -> Result<()> {
        lock(&self.blocks)?.insert(address, Bytes::copy_from_slice(data));
        Ok(())
    }

    pub fn contains(&self, address: Address) -> Result<bool> {
        Ok(lock(&self.blocks)?.contains_key(&address))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, address: Address, len: u64) -> Result<Bytes> {
        let blocks = lock(&self.blocks)?;
        let block = blocks.get(&address).ok_or_else(|| {
            CacheError::IoError(format!("No block stored at address {}", address))
        })?;
        if (block.len() as u64) < len {
            return Err(CacheError::IoError(format!(
                "Short read at address {}: wanted {} bytes, block has {}",
                address,
                len,
                block.len()
            )));
        }
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        Ok(block.slice(..len as usize))
    }

    fn write(&self, address: Address, data: &[u8]) -> Result<()> {
        if lock(&self.failing_writes)?.contains(&address) {
            return Err(CacheError::IoError(format!(
                "Injected write failure at address {}",
                address
            )));
        }
        lock(&self.blocks)?.insert(address, Bytes::copy_from_slice(data));
        lock(&self.write_log)?.push(address);
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn allocate(&self, len: u64) -> Result<Address> {
        let address = lock(&self.allocator)?.allocate(len)?;
        self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
        debug!("Allocated {} bytes at address {}", len, address);
        Ok(address)
    }

    fn free(&self, address: Address, len: u64) -> Result<()> {
        lock(&self.blocks)?.remove(&address);
        lock(&self.allocator)?.free(address, len);
        self.metrics.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Storage backed by a single file, locked exclusively while open
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<File>,
    allocator: Mutex<RegionAllocator>,
    pub metrics: StorageMetrics,
}

impl FileStorage {
    /// Open or create the file. Allocation begins at the larger of `base`
    /// and the current file length.
    pub fn open(path: &Path, base: Address) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                CacheError::IoError(format!("Failed to open storage file {:?}: {}", path, e))
            })?;

        file.try_lock_exclusive().map_err(|e| {
            CacheError::IoError(format!("Storage file {:?} is locked: {}", path, e))
        })?;

        let len = file
            .metadata()
            .map_err(|e| CacheError::IoError(format!("Failed to stat {:?}: {}", path, e)))?
            .len();

        info!("Opened storage file {:?} ({} bytes)", path, len);
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            allocator: Mutex::new(RegionAllocator::new(base.max(len))),
            metrics: StorageMetrics::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Storage for FileStorage {
    fn read(&self, address: Address, len: u64) -> Result<Bytes> {
        let mut file = lock(&self.file)?;
        let file_len = file.metadata()?.len();
        match address.checked_add(len) {
            Some(end) if end <= file_len => {}
            _ => {
                return Err(CacheError::IoError(format!(
                    "Read of {} bytes at address {} runs past end of file ({} bytes)",
                    len, address, file_len
                )))
            }
        }
        file.seek(SeekFrom::Start(address))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf).map_err(|e| {
            CacheError::IoError(format!(
                "Failed to read {} bytes at address {}: {}",
                len, address, e
            ))
        })?;
        self.metrics.reads.fetch_add(1, Ordering::Relaxed);
        Ok(Bytes::from(buf))
    }

    fn write(&self, address: Address, data: &[u8]) -> Result<()> {
        let mut file = lock(&self.file)?;
        file.seek(SeekFrom::Start(address))?;
        file.write_all(data).map_err(|e| {
            CacheError::IoError(format!(
                "Failed to write {} bytes at address {}: {}",
                data.len(),
                address,
                e
            ))
        })?;
        self.metrics.writes.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn allocate(&self, len: u64) -> Result<Address> {
        let address = lock(&self.allocator)?.allocate(len)?;
        self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(address)
    }

    fn free(&self, address: Address, len: u64) -> Result<()> {
        lock(&self.allocator)?.free(address, len);
        self.metrics.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Ok(file) = self.file.lock() {
            if let Err(e) = file.sync_all() {
                warn!("Failed to sync storage file {:?}: {}", self.path, e);
            }
            let _ = file.unlock();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| CacheError::IoError(format!("Storage lock poisoned: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_storage_read_write() {
        let storage = MemoryStorage::new();
        storage.write(100, b"hello").unwrap();
        assert_eq!(&storage.read(100, 5).unwrap()[..], b"hello");
        assert_eq!(&storage.read(100, 2).unwrap()[..], b"he");
        assert!(storage.read(100, 6).is_err());
        assert!(storage.read(7, 1).is_err());
        assert_eq!(storage.write_log().unwrap(), vec![100]);
        assert_eq!(storage.metrics.snapshot().writes, 1);
    }

    #[test]
    fn test_memory_storage_injected_failure() {
        let storage = MemoryStorage::new();
        storage.fail_writes_to(8).unwrap();
        assert!(matches!(
            storage.write(8, b"x"),
            Err(CacheError::IoError(_))
        ));
        storage.clear_write_failures().unwrap();
        storage.write(8, b"x").unwrap();
    }

    #[test]
    fn test_allocator_reuses_freed_regions() {
        let storage = MemoryStorage::with_base(4096);
        let a = storage.allocate(100).unwrap();
        let b = storage.allocate(50).unwrap();
        assert_eq!(a, 4096);
        assert_eq!(b, 4196);

        storage.free(a, 100).unwrap();
        let c = storage.allocate(60).unwrap();
        assert_eq!(c, a);
        let d = storage.allocate(40).unwrap();
        assert_eq!(d, a + 60);

        assert!(storage.allocate(0).is_err());
    }

    #[test]
    fn test_file_storage_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store.bin");

        {
            let storage = FileStorage::open(&path, 0).unwrap();
            let addr = storage.allocate(4).unwrap();
            storage.write(addr, &[9, 8, 7, 6]).unwrap();
            assert_eq!(&storage.read(addr, 4).unwrap()[..], &[9, 8, 7, 6]);
        }

        let storage = FileStorage::open(&path, 0).unwrap();
        assert_eq!(&storage.read(0, 4).unwrap()[..], &[9, 8, 7, 6]);
        // allocation resumes past the existing data
        assert_eq!(storage.allocate(1).unwrap(), 4);
    }

    #[test]
    fn test_file_storage_exclusive_lock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("locked.bin");
        let _first = FileStorage::open(&path, 0).unwrap();
        assert!(FileStorage::open(&path, 0).is_err());
    }

    #[test]
    fn test_file_storage_rejects_reads_past_end() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("short.bin");
        let storage = FileStorage::open(&path, 0).unwrap();
        storage.write(0, &[1, 2, 3, 4]).unwrap();

        assert!(matches!(
            storage.read(0, 1 << 60),
            Err(CacheError::IoError(_))
        ));
        assert!(matches!(
            storage.read(u64::MAX - 1, 4),
            Err(CacheError::IoError(_))
        ));
        assert!(storage.read(2, 3).is_err());
        assert_eq!(&storage.read(2, 2).unwrap()[..], &[3, 4]);
        assert_eq!(storage.metrics.snapshot().reads, 1);
    }
}
