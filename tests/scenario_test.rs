use bytes::Bytes;
use mdcache::cache::{MetadataCache, MetadataCacheConfig};
use mdcache::coordination::{CoordinationConfig, SyncObserver, WriteStrategy};
use mdcache::entry::{Address, FlushFlags, InsertFlags, ProtectMode, UnprotectFlags};
use mdcache::process_group::LocalProcessGroup;
use mdcache::storage::{MemoryStorage, Storage};
use mdcache::CacheError;
use std::sync::{Arc, Mutex};
use std::thread;

fn payload(len: usize, fill: u8) -> Bytes {
    Bytes::from(vec![fill; len])
}

fn test_cache_config() -> MetadataCacheConfig {
    MetadataCacheConfig::fixed(1 << 20, 1 << 18)
}

fn test_cache(storage: Arc<MemoryStorage>) -> MetadataCache {
    MetadataCache::new(test_cache_config(), storage).unwrap()
}

#[derive(Default)]
struct RecordingObserver {
    writes: Mutex<Vec<Address>>,
}

impl SyncObserver for RecordingObserver {
    fn write_done(&self, address: Address) {
        self.writes.lock().unwrap().push(address);
    }
}

struct RankOutcome {
    writes: Vec<Address>,
    clean: Vec<bool>,
}

/// Run the same insert-then-flush sequence on every member of a group
fn run_flush_on_group(
    processes: usize,
    config: CoordinationConfig,
    addresses: &[Address],
) -> Vec<RankOutcome> {
    let members = LocalProcessGroup::create(processes).unwrap();
    let storage = Arc::new(MemoryStorage::new());
    thread::scope(|s| {
        let handles: Vec<_> = members
            .iter()
            .map(|m| {
                let storage = storage.clone();
                let config = config.clone();
                s.spawn(move || {
                    let observer = Arc::new(RecordingObserver::default());
                    let mut cache = test_cache(storage);
                    cache.enable_coordination(Arc::new(m.clone()), config).unwrap();
                    cache.set_sync_observer(observer.clone()).unwrap();
                    for (i, address) in addresses.iter().enumerate() {
                        cache
                            .insert(*address, 1, payload(8, i as u8), InsertFlags::default())
                            .unwrap();
                    }
                    cache.flush(FlushFlags::default()).unwrap();
                    cache.validate_consistency().unwrap();
                    let clean = addresses
                        .iter()
                        .map(|a| !cache.get_entry_status(*a).unwrap().is_dirty)
                        .collect();
                    let writes = observer.writes.lock().unwrap().clone();
                    RankOutcome { writes, clean }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

struct ThresholdOutcome {
    before: Option<u64>,
    after: Option<u64>,
    dirty: Vec<Address>,
}

/// Three 400-byte inserts on two ranks with a 1 KiB dirty-bytes threshold
fn run_threshold_scenario(
    cache_config: MetadataCacheConfig,
    storage: Arc<MemoryStorage>,
) -> Vec<ThresholdOutcome> {
    let members = LocalProcessGroup::create(2).unwrap();
    let config = CoordinationConfig {
        dirty_bytes_threshold: 1024,
        ..CoordinationConfig::default()
    };
    thread::scope(|s| {
        let handles: Vec<_> = members
            .iter()
            .map(|m| {
                let storage = storage.clone();
                let config = config.clone();
                let cache_config = cache_config.clone();
                s.spawn(move || {
                    let mut cache = MetadataCache::new(cache_config, storage).unwrap();
                    cache.enable_coordination(Arc::new(m.clone()), config).unwrap();
                    cache
                        .insert(1000, 1, payload(400, 1), InsertFlags::default())
                        .unwrap();
                    cache
                        .insert(2000, 1, payload(400, 2), InsertFlags::default())
                        .unwrap();
                    let before = cache.coordination_dirty_bytes();
                    cache
                        .insert(3000, 1, payload(400, 3), InsertFlags::default())
                        .unwrap();
                    cache.validate_consistency().unwrap();
                    let mut dirty = cache.dirty_addresses();
                    dirty.sort_unstable();
                    ThresholdOutcome {
                        before,
                        after: cache.coordination_dirty_bytes(),
                        dirty,
                    }
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

#[test]
fn scenario_a_threshold_triggers_sync_point() {
    // min clean equals max, so every dirty byte is short of the clean target
    let storage = Arc::new(MemoryStorage::new());
    let tight = MetadataCacheConfig::fixed(2048, 2048);
    let outcomes = run_threshold_scenario(tight, storage.clone());

    for outcome in outcomes {
        assert_eq!(outcome.before, Some(800));
        assert_eq!(outcome.after, Some(0));
        assert!(outcome.dirty.is_empty());
    }
    for address in [1000, 2000, 3000] {
        assert!(storage.contains(address).unwrap());
    }
}

#[test]
fn scenario_a_threshold_with_clean_space_to_spare() {
    let storage = Arc::new(MemoryStorage::new());
    let outcomes = run_threshold_scenario(test_cache_config(), storage.clone());

    // the counter resets but nothing is short of the clean target
    for outcome in outcomes {
        assert_eq!(outcome.before, Some(800));
        assert_eq!(outcome.after, Some(0));
        assert_eq!(outcome.dirty, vec![1000, 2000, 3000]);
    }
    assert_eq!(storage.metrics.snapshot().writes, 0);
}

#[test]
fn scenario_b_process_zero_only_writes_on_rank_zero() {
    let config = CoordinationConfig {
        strategy: WriteStrategy::ProcessZeroOnly,
        ..CoordinationConfig::default()
    };
    let outcomes = run_flush_on_group(3, config, &[400, 100, 300, 200]);

    assert_eq!(outcomes[0].writes.len(), 4);
    for outcome in &outcomes[1..] {
        assert!(outcome.writes.is_empty());
    }
    for outcome in &outcomes {
        assert!(outcome.clean.iter().all(|c| *c));
    }
}

#[test]
fn scenario_c_distributed_round_robin() {
    let config = CoordinationConfig {
        strategy: WriteStrategy::Distributed,
        ..CoordinationConfig::default()
    };
    let outcomes = run_flush_on_group(3, config, &[60, 30, 10, 50, 20, 40]);

    let mut writes: Vec<Vec<Address>> = outcomes
        .iter()
        .map(|o| {
            let mut w = o.writes.clone();
            w.sort_unstable();
            w
        })
        .collect();
    assert_eq!(writes.remove(0), vec![10, 40]);
    assert_eq!(writes.remove(0), vec![20, 50]);
    assert_eq!(writes.remove(0), vec![30, 60]);
    for outcome in &outcomes {
        assert_eq!(outcome.clean, vec![true; 6]);
    }
}

#[test]
fn scenario_d_parent_waits_for_dirty_children() {
    let storage = Arc::new(MemoryStorage::new());
    let mut cache = test_cache(storage.clone());
    let pinned = InsertFlags {
        pin: true,
        ..InsertFlags::default()
    };
    cache.insert(100, 1, payload(16, 1), pinned).unwrap();
    cache
        .insert(200, 1, payload(16, 2), InsertFlags::default())
        .unwrap();
    cache
        .insert(300, 1, payload(16, 3), InsertFlags::default())
        .unwrap();
    cache.create_flush_dependency(100, 200).unwrap();
    cache.create_flush_dependency(100, 300).unwrap();

    cache.flush_entry(200).unwrap();
    let err = cache.flush_entry(100).unwrap_err();
    assert!(matches!(err, CacheError::DependencyOrder(_)));
    assert!(cache.get_entry_status(100).unwrap().is_dirty);

    cache.flush_entry(300).unwrap();
    cache.flush_entry(100).unwrap();
    assert_eq!(storage.write_log().unwrap(), vec![200, 300, 100]);
    cache.validate_consistency().unwrap();
}

#[test]
fn scenario_e_image_rebuilds_dependency_chain_on_first_access() {
    let storage = Arc::new(MemoryStorage::with_base(1 << 20));
    let mut config = MetadataCacheConfig::fixed(1 << 20, 1 << 18);
    config.image.generate_image = true;
    let mut cache = MetadataCache::new(config.clone(), storage.clone()).unwrap();

    let (root, middle, leaf) = (10_000, 20_000, 30_000);
    for i in 0..47u64 {
        cache
            .insert(100 + i * 64, 1, payload(64, i as u8), InsertFlags::default())
            .unwrap();
    }
    let pinned = InsertFlags {
        pin: true,
        ..InsertFlags::default()
    };
    cache.insert(root, 2, payload(32, 0xaa), pinned).unwrap();
    cache
        .insert(middle, 2, payload(32, 0xbb), InsertFlags::default())
        .unwrap();
    cache
        .insert(leaf, 2, payload(32, 0xcc), InsertFlags::default())
        .unwrap();
    cache.protect(middle, ProtectMode::Write).unwrap();
    cache.create_flush_dependency(middle, leaf).unwrap();
    cache.unprotect(middle, UnprotectFlags::default()).unwrap();
    cache.create_flush_dependency(root, middle).unwrap();
    assert_eq!(cache.entry_count(), 50);

    let side = cache.close().unwrap().expect("image side message");
    assert_eq!(cache.entry_count(), 0);

    let mut reopened = MetadataCache::new(config, storage.clone()).unwrap();
    reopened.request_image_load(side).unwrap();
    assert_eq!(reopened.entry_count(), 0);

    let data = reopened.protect(leaf, ProtectMode::ReadOnly).unwrap();
    assert_eq!(&data[..], &[0xcc; 32][..]);
    assert_eq!(reopened.entry_count(), 50);
    assert_eq!(reopened.flush_dependency_parents(leaf).unwrap(), vec![middle]);
    assert_eq!(reopened.flush_dependency_parents(middle).unwrap(), vec![root]);
    assert_eq!(reopened.flush_dependency_children(root).unwrap(), vec![middle]);
    assert!(reopened.get_entry_status(root).unwrap().is_pinned);
    reopened
        .unprotect(leaf, UnprotectFlags::default())
        .unwrap();
    reopened.validate_consistency().unwrap();

    // the chain still flushes child first
    reopened.flush(FlushFlags::default()).unwrap();
    let log = storage.write_log().unwrap();
    let position = |a: Address| log.iter().position(|w| *w == a).unwrap();
    assert!(position(leaf) < position(middle));
    assert!(position(middle) < position(root));
    assert_eq!(&storage.read(root, 32).unwrap()[..], &[0xaa; 32][..]);
}
