use bytes::Bytes;
use mdcache::cache::{MetadataCache, MetadataCacheConfig};
use mdcache::cache_image::SideMessage;
use mdcache::coordination::{
    CandidatePartition, CoordinationConfig, SyncObserver, SyncPointOp, WriteStrategy,
};
use mdcache::entry::{Address, FlushFlags, InsertFlags, ProtectMode, UnprotectFlags};
use mdcache::process_group::{LocalProcessGroup, ProcessGroup};
use mdcache::storage::MemoryStorage;
use mdcache::{CacheError, Result};
use std::sync::{Arc, Mutex};
use std::thread;

fn payload(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

#[derive(Default)]
struct RecordingObserver {
    writes: Mutex<Vec<Address>>,
    sync_points: Mutex<Vec<(SyncPointOp, Vec<Address>)>>,
}

impl SyncObserver for RecordingObserver {
    fn write_done(&self, address: Address) {
        self.writes.lock().unwrap().push(address);
    }

    fn sync_point_done(&self, op: SyncPointOp, addresses: &[Address]) {
        self.sync_points
            .lock()
            .unwrap()
            .push((op, addresses.to_vec()));
    }
}

/// Run `body` once per rank on its own thread, each with a coordinated cache
fn run_group<T, F>(
    processes: usize,
    cache_config: MetadataCacheConfig,
    config: CoordinationConfig,
    storage: Arc<MemoryStorage>,
    body: F,
) -> Vec<T>
where
    T: Send,
    F: Fn(&mut MetadataCache, &RecordingObserver, usize) -> T + Sync,
{
    let members = LocalProcessGroup::create(processes).unwrap();
    let body = &body;
    thread::scope(|s| {
        let handles: Vec<_> = members
            .iter()
            .map(|m| {
                let storage = storage.clone();
                let config = config.clone();
                let cache_config = cache_config.clone();
                s.spawn(move || {
                    let observer = Arc::new(RecordingObserver::default());
                    let mut cache = MetadataCache::new(cache_config, storage).unwrap();
                    cache.enable_coordination(Arc::new(m.clone()), config).unwrap();
                    cache.set_sync_observer(observer.clone()).unwrap();
                    body(&mut cache, &observer, m.rank())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn large_cache() -> MetadataCacheConfig {
    MetadataCacheConfig::fixed(1 << 20, 1 << 18)
}

#[test]
fn test_distributed_contiguous_partition() {
    let config = CoordinationConfig {
        partition: CandidatePartition::Contiguous,
        ..CoordinationConfig::default()
    };
    let storage = Arc::new(MemoryStorage::new());
    let writes = run_group(3, large_cache(), config, storage, |cache, observer, _| {
        for a in 1..=7u64 {
            cache
                .insert(a * 10, 1, payload(8, a as u8), InsertFlags::default())
                .unwrap();
        }
        cache.flush(FlushFlags::default()).unwrap();
        let mut writes = observer.writes.lock().unwrap().clone();
        writes.sort_unstable();
        writes
    });
    assert_eq!(writes[0], vec![10, 20, 30]);
    assert_eq!(writes[1], vec![40, 50]);
    assert_eq!(writes[2], vec![60, 70]);
}

#[test]
fn test_every_rank_reports_same_sync_points() {
    let config = CoordinationConfig {
        dirty_bytes_threshold: 2048,
        ..CoordinationConfig::default()
    };
    let storage = Arc::new(MemoryStorage::new());
    let histories = run_group(4, large_cache(), config, storage, |cache, observer, _| {
        for a in 0..20u64 {
            cache
                .insert(1000 + a * 256, 1, payload(256, a as u8), InsertFlags::default())
                .unwrap();
            if a % 3 == 0 {
                cache.protect(1000, ProtectMode::Write).unwrap();
                cache.unprotect(1000, UnprotectFlags::dirtied()).unwrap();
            }
        }
        cache.flush(FlushFlags::default()).unwrap();
        cache.validate_consistency().unwrap();
        observer.sync_points.lock().unwrap().clone()
    });

    assert!(histories[0].len() >= 3);
    for history in &histories[1..] {
        assert_eq!(history, &histories[0]);
    }
}

#[test]
fn test_children_written_before_parents_across_ranks() {
    let storage = Arc::new(MemoryStorage::new());
    run_group(
        2,
        large_cache(),
        CoordinationConfig::default(),
        storage.clone(),
        |cache, _, _| {
            let pinned = InsertFlags {
                pin: true,
                ..InsertFlags::default()
            };
            cache.insert(10, 1, payload(8, 1), pinned).unwrap();
            for child in [20, 30, 40] {
                cache
                    .insert(child, 1, payload(8, 2), InsertFlags::default())
                    .unwrap();
                cache.create_flush_dependency(10, child).unwrap();
            }
            cache.flush(FlushFlags::default()).unwrap();
            assert!(cache.dirty_addresses().is_empty());
            assert_eq!(
                cache.get_entry_status(10).unwrap().flush_dep_ndirty_children,
                0
            );
        },
    );

    let log = storage.write_log().unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log.last(), Some(&10));
}

#[test]
fn test_process_zero_only_min_clean_sync_point() {
    // 4 KiB cache that wants 2 KiB clean
    let cache_config = MetadataCacheConfig::fixed(4096, 2048);
    let config = CoordinationConfig {
        strategy: WriteStrategy::ProcessZeroOnly,
        dirty_bytes_threshold: 1 << 20,
        ..CoordinationConfig::default()
    };
    let storage = Arc::new(MemoryStorage::new());
    let outcomes = run_group(3, cache_config, config, storage, |cache, observer, _| {
        for a in 0..12u64 {
            cache
                .insert(a * 1000, 1, payload(256, a as u8), InsertFlags::default())
                .unwrap();
        }
        cache
            .run_sync_point(SyncPointOp::FlushToMinClean)
            .unwrap();
        cache.validate_consistency().unwrap();
        (
            cache.clean_index_size(),
            cache.dirty_addresses(),
            observer.writes.lock().unwrap().len(),
        )
    });

    // 1 KiB of empty space leaves a 1 KiB shortfall: the four oldest entries
    let (clean, dirty, writes) = &outcomes[0];
    assert_eq!(*clean, 1024);
    assert_eq!(*writes, 4);
    assert_eq!(dirty.len(), 8);
    assert!(!dirty.contains(&0) && !dirty.contains(&3000));
    for (other_clean, other_dirty, writes) in &outcomes[1..] {
        assert_eq!(other_clean, clean);
        assert_eq!(other_dirty, dirty);
        assert_eq!(*writes, 0);
    }
}

#[test]
fn test_write_failure_aborts_every_rank() {
    let storage = Arc::new(MemoryStorage::new());
    // rank 1 owns the second candidate under round-robin
    storage.fail_writes_to(20).unwrap();
    let outcomes: Vec<Result<()>> = run_group(
        2,
        large_cache(),
        CoordinationConfig::default(),
        storage,
        |cache, _, _| {
            cache
                .insert(10, 1, payload(8, 1), InsertFlags::default())
                .unwrap();
            cache
                .insert(20, 1, payload(8, 2), InsertFlags::default())
                .unwrap();
            cache.flush(FlushFlags::default())
        },
    );

    assert!(matches!(outcomes[0], Err(CacheError::CollectiveError(_))));
    assert!(matches!(outcomes[1], Err(CacheError::IoError(_))));
}

#[test]
fn test_coordinated_close_writes_one_image() {
    let mut cache_config = large_cache();
    cache_config.image.generate_image = true;
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    let sides: Vec<Option<SideMessage>> = run_group(
        3,
        cache_config,
        CoordinationConfig::default(),
        storage.clone(),
        |cache, _, _| {
            for a in 1..=9u64 {
                cache
                    .insert(a * 100, 1, payload(32, a as u8), InsertFlags::default())
                    .unwrap();
            }
            let side = cache.close().unwrap();
            assert_eq!(cache.entry_count(), 0);
            side
        },
    );

    let side = sides[0].expect("rank 0 side message");
    for other in &sides[1..] {
        assert_eq!(other, &Some(side));
    }
    assert_eq!(storage.metrics.snapshot().allocations, 1);
    // entries were flushed by the close-time sync point before the image was taken
    for a in 1..=9u64 {
        assert!(storage.contains(a * 100).unwrap());
    }
}

#[test]
fn test_coordination_rejects_read_only_and_populated_caches() {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = MetadataCacheConfig::fixed(1 << 16, 1 << 14);
    config.read_only = true;
    let mut cache = MetadataCache::new(config, storage.clone()).unwrap();
    let group = LocalProcessGroup::create(1).unwrap().remove(0);
    assert!(matches!(
        cache.enable_coordination(Arc::new(group.clone()), CoordinationConfig::default()),
        Err(CacheError::ConfigError(_))
    ));

    let mut cache =
        MetadataCache::new(MetadataCacheConfig::fixed(1 << 16, 1 << 14), storage).unwrap();
    cache
        .insert(1, 1, payload(8, 1), InsertFlags::default())
        .unwrap();
    assert!(cache
        .enable_coordination(Arc::new(group), CoordinationConfig::default())
        .is_err());
    assert!(cache.run_sync_point(SyncPointOp::FlushCache).is_err());
}
