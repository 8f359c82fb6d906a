use bytes::Bytes;
use mdcache::cache::{MetadataCache, MetadataCacheConfig};
use mdcache::cache_image::{CacheImage, SideMessage, IMAGE_SIGNATURE};
use mdcache::entry::{
    Address, EntryClient, InsertFlags, NotifyAction, ProtectMode, Ring, UnprotectFlags,
};
use mdcache::storage::{FileStorage, MemoryStorage, Storage};
use mdcache::{CacheError, Result};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn payload(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

fn image_config() -> MetadataCacheConfig {
    let mut config = MetadataCacheConfig::fixed(1 << 20, 1 << 18);
    config.image.generate_image = true;
    config
}

/// Stores payloads reversed on disk and records hydration calls
#[derive(Default)]
struct ReversingClient {
    deserialized: Mutex<Vec<Address>>,
}

impl EntryClient for ReversingClient {
    fn type_id(&self) -> u8 {
        7
    }

    fn name(&self) -> &str {
        "reversing"
    }

    fn serialize(&self, _address: Address, _size: u64, payload: &Bytes) -> Result<Bytes> {
        Ok(payload.iter().rev().copied().collect::<Vec<u8>>().into())
    }

    fn deserialize(&self, address: Address, image: &[u8]) -> Result<Bytes> {
        self.deserialized.lock().unwrap().push(address);
        Ok(image.iter().rev().copied().collect::<Vec<u8>>().into())
    }

    fn notify(&self, _action: NotifyAction, _address: Address) -> Result<()> {
        Ok(())
    }
}

#[test]
fn test_file_backed_close_and_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("mdcache.dat");
    let client = Arc::new(ReversingClient::default());

    let side = {
        let storage = Arc::new(FileStorage::open(&path, 1 << 16).unwrap());
        let mut cache = MetadataCache::new(image_config(), storage).unwrap();
        cache.register_client(client.clone());
        cache
            .insert(4096, 7, Bytes::from_static(b"abcdefgh"), InsertFlags::default())
            .unwrap();
        cache
            .insert(8192, 7, Bytes::from_static(b"12345678"), InsertFlags::default())
            .unwrap();
        cache.flush_entry(8192).unwrap();
        cache.close().unwrap().expect("image written")
    };

    // the side message is all a container would persist
    let side = SideMessage::decode(&side.encode()).unwrap();
    let storage = Arc::new(FileStorage::open(&path, 1 << 16).unwrap());
    assert_eq!(&storage.read(side.address, 4).unwrap()[..], IMAGE_SIGNATURE);

    // reopen without writing a new image so close writes entries home
    let config = MetadataCacheConfig::fixed(1 << 20, 1 << 18);
    let mut cache = MetadataCache::new(config, storage.clone()).unwrap();
    cache.register_client(client.clone());
    cache.request_image_load(side).unwrap();

    let data = cache.protect(4096, ProtectMode::ReadOnly).unwrap();
    assert_eq!(&data[..], b"abcdefgh");
    cache.unprotect(4096, UnprotectFlags::default()).unwrap();
    assert_eq!(client.deserialized.lock().unwrap().clone(), vec![4096]);
    assert!(cache.get_entry_status(4096).unwrap().is_dirty);
    assert!(cache.get_entry_status(8192).unwrap().prefetched);

    // flushed before the first close, in serialized form
    assert_eq!(&storage.read(8192, 8).unwrap()[..], b"87654321");
    cache.close().unwrap();
    assert_eq!(&storage.read(4096, 8).unwrap()[..], b"hgfedcba");
}

#[test]
fn test_corrupt_image_leaves_cache_empty() {
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    let mut cache = MetadataCache::new(image_config(), storage.clone()).unwrap();
    for a in 1..=5u64 {
        cache
            .insert(a * 100, 1, payload(16, a as u8), InsertFlags::default())
            .unwrap();
    }
    let side = cache.close().unwrap().unwrap();

    let mut block = storage.read(side.address, side.length).unwrap().to_vec();
    let middle = block.len() / 2;
    block[middle] ^= 0x55;
    storage.preload(side.address, &block).unwrap();

    let mut reopened = MetadataCache::new(image_config(), storage).unwrap();
    reopened.request_image_load(side).unwrap();
    let err = reopened.protect(100, ProtectMode::ReadOnly).unwrap_err();
    assert!(matches!(err, CacheError::DecodeError(_)));
    assert!(err.is_fatal());
    assert_eq!(reopened.entry_count(), 0);
    assert_eq!(reopened.index_size(), 0);
}

#[test]
fn test_high_rings_are_written_not_imaged() {
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    let mut cache = MetadataCache::new(image_config(), storage.clone()).unwrap();
    cache
        .insert(100, 1, payload(16, 1), InsertFlags::default())
        .unwrap();
    cache
        .insert(
            200,
            1,
            payload(16, 2),
            InsertFlags {
                ring: Ring::Superblock,
                ..InsertFlags::default()
            },
        )
        .unwrap();
    let side = cache.close().unwrap().unwrap();

    assert!(!storage.contains(100).unwrap());
    assert!(storage.contains(200).unwrap());

    let block = storage.read(side.address, side.length).unwrap();
    let image = CacheImage::decode(&block).unwrap();
    let addresses: Vec<Address> = image.entries.iter().map(|e| e.address).collect();
    assert_eq!(addresses, vec![100]);
    assert!(image.entries[0].is_dirty);
}

#[test]
fn test_read_only_reopen_never_writes() {
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    let mut cache = MetadataCache::new(image_config(), storage.clone()).unwrap();
    for a in 1..=4u64 {
        cache
            .insert(a * 100, 1, payload(16, a as u8), InsertFlags::default())
            .unwrap();
    }
    let side = cache.close().unwrap().unwrap();
    let writes_before = storage.metrics.snapshot().writes;

    let mut config = image_config();
    config.read_only = true;
    let mut reopened = MetadataCache::new(config, storage.clone()).unwrap();
    reopened.request_image_load(side).unwrap();
    let data = reopened.protect(300, ProtectMode::ReadOnly).unwrap();
    assert_eq!(&data[..], &[3u8; 16][..]);
    reopened
        .unprotect(300, UnprotectFlags::default())
        .unwrap();

    for a in 1..=4u64 {
        let status = reopened.get_entry_status(a * 100).unwrap();
        assert!(!status.is_dirty);
        assert!(status.prefetched_dirty);
    }
    assert!(reopened
        .insert(900, 1, payload(16, 9), InsertFlags::default())
        .is_err());
    assert_eq!(reopened.close().unwrap(), None);
    assert_eq!(storage.metrics.snapshot().writes, writes_before);
    assert_eq!(storage.metrics.snapshot().frees, 0);
}

#[test]
fn test_empty_cache_writes_empty_image() {
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    let mut cache = MetadataCache::new(image_config(), storage.clone()).unwrap();
    let side = cache.close().unwrap().unwrap();

    let mut reopened = MetadataCache::new(image_config(), storage).unwrap();
    reopened.request_image_load(side).unwrap();
    assert!(reopened.evict().is_ok());
    assert_eq!(reopened.entry_count(), 0);
    assert!(reopened.request_image_load(side).is_err());
}

#[test]
fn test_close_refuses_protected_entries() {
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    let mut cache = MetadataCache::new(image_config(), storage).unwrap();
    cache
        .insert(100, 1, payload(16, 1), InsertFlags::default())
        .unwrap();
    cache.protect(100, ProtectMode::Write).unwrap();
    assert!(matches!(
        cache.close(),
        Err(CacheError::InvariantViolation(_))
    ));
    cache.unprotect(100, UnprotectFlags::default()).unwrap();
    assert!(cache.close().unwrap().is_some());
}

#[test]
fn test_corrupt_image_never_exposes_home_data() {
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    storage.preload(100, &[0xee; 16]).unwrap();
    let mut cache = MetadataCache::new(image_config(), storage.clone()).unwrap();
    cache
        .insert(100, 1, payload(16, 0x01), InsertFlags::default())
        .unwrap();
    let side = cache.close().unwrap().unwrap();
    // the newer contents only live in the image
    assert_eq!(&storage.read(100, 16).unwrap()[..], &[0xee; 16][..]);

    let mut block = storage.read(side.address, side.length).unwrap().to_vec();
    block[8] ^= 0x01;
    storage.preload(side.address, &block).unwrap();

    let mut reopened = MetadataCache::new(image_config(), storage).unwrap();
    reopened.request_image_load(side).unwrap();
    for _ in 0..2 {
        let err = reopened
            .protect_or_load(100, 1, 16, Ring::User, ProtectMode::ReadOnly)
            .unwrap_err();
        assert!(matches!(err, CacheError::DecodeError(_)));
    }
    assert!(reopened.image_pending());
    assert!(!reopened.contains(100));
}

#[test]
fn test_oversized_side_message_is_a_decode_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("mdcache.dat");
    let storage = Arc::new(FileStorage::open(&path, 1 << 16).unwrap());
    storage.write(1 << 16, IMAGE_SIGNATURE).unwrap();

    let side = SideMessage {
        address: 1 << 16,
        length: 1 << 60,
    };
    let side = SideMessage::decode(&side.encode()).unwrap();
    let mut cache = MetadataCache::new(image_config(), storage).unwrap();
    cache.request_image_load(side).unwrap();
    for _ in 0..2 {
        let err = cache.protect(4096, ProtectMode::ReadOnly).unwrap_err();
        assert!(matches!(err, CacheError::DecodeError(_)));
    }
    assert!(cache.image_pending());
    assert_eq!(cache.entry_count(), 0);
}
