use bytes::Bytes;
use clap::ArgMatches;
use mdcache::{
    cache::MetadataCache,
    cache_image::{CacheImage, SideMessage},
    config::Config,
    coordination::{SyncObserver, SyncPointOp},
    entry::{Address, InsertFlags, ProtectMode, UnprotectFlags},
    logging::LoggerManager,
    process_group::{LocalProcessGroup, ProcessGroup},
    storage::{FileStorage, MemoryStorage, Storage},
    CacheError, Result,
};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// First address handed to simulated entries
const ENTRY_BASE: Address = 4096;

#[derive(Default)]
struct WriteCounter {
    writes: AtomicU64,
    sync_points: AtomicU64,
}

impl SyncObserver for WriteCounter {
    fn write_done(&self, _address: Address) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn sync_point_done(&self, _op: SyncPointOp, _addresses: &[Address]) {
        self.sync_points.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct Workload {
    entries: u64,
    entry_size: u64,
}

#[derive(Debug)]
struct RankReport {
    rank: usize,
    writes: u64,
    sync_points: u64,
    side: Option<SideMessage>,
}

/// Run one rank, aborting the group on failure so peers leave their collectives
fn run_rank(
    group: LocalProcessGroup,
    config: Config,
    storage: Arc<dyn Storage>,
    workload: Workload,
) -> Result<RankReport> {
    let result = run_rank_workload(group.clone(), config, storage, workload);
    if let Err(e) = &result {
        error!("Rank {} failed: {}", group.rank(), e);
        group.abort(&e.to_string());
    }
    result
}

/// Every rank runs the same operation sequence against its own cache
fn run_rank_workload(
    group: LocalProcessGroup,
    config: Config,
    storage: Arc<dyn Storage>,
    workload: Workload,
) -> Result<RankReport> {
    let rank = group.rank();
    let counter = Arc::new(WriteCounter::default());
    let mut cache = MetadataCache::new(config.to_cache_config(), storage)?;
    cache.enable_coordination(Arc::new(group), config.coordination.clone())?;
    cache.set_sync_observer(counter.clone())?;

    let addresses: Vec<Address> = (0..workload.entries)
        .map(|i| ENTRY_BASE + i * workload.entry_size)
        .collect();
    for (i, address) in addresses.iter().enumerate() {
        let payload = Bytes::from(vec![(i % 251) as u8; workload.entry_size as usize]);
        cache.insert(*address, 1, payload, InsertFlags::default())?;
    }
    // re-dirty every other entry so later sync points have work
    for address in addresses.iter().step_by(2) {
        cache.protect(*address, ProtectMode::Write)?;
        cache.unprotect(*address, UnprotectFlags::dirtied())?;
    }

    let side = cache.close()?;
    Ok(RankReport {
        rank,
        writes: counter.writes.load(Ordering::Relaxed),
        sync_points: counter.sync_points.load(Ordering::Relaxed),
        side,
    })
}

async fn simulate(config: Config, matches: &ArgMatches) -> Result<()> {
    if config.cache.read_only {
        return Err(CacheError::ConfigError(
            "simulate needs a writable cache".to_string(),
        ));
    }
    let parse = |name: &str| -> Result<u64> {
        matches
            .get_one::<String>(name)
            .map(String::as_str)
            .unwrap_or_default()
            .parse()
            .map_err(|_| CacheError::ConfigError(format!("--{} must be a number", name)))
    };
    let workload = Workload {
        entries: parse("entries")?,
        entry_size: parse("entry-size")?.max(1),
    };
    let processes = config.coordination.process_count;
    let data_end = ENTRY_BASE + workload.entries * workload.entry_size;
    let storage: Arc<dyn Storage> =
        Arc::new(FileStorage::open(&config.cache.storage_path, data_end)?);

    info!(
        "Simulating {} processes, {} entries of {} bytes, strategy {:?}",
        processes, workload.entries, workload.entry_size, config.coordination.strategy
    );

    let mut handles = Vec::with_capacity(processes);
    for group in LocalProcessGroup::create(processes)? {
        let config = config.clone();
        let storage = storage.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            run_rank(group, config, storage, workload)
        }));
    }

    let mut reports = Vec::with_capacity(processes);
    for outcome in futures::future::join_all(handles).await {
        let report = outcome.map_err(|e| {
            CacheError::InvariantViolation(format!("Simulated process panicked: {}", e))
        })??;
        reports.push(report);
    }
    reports.sort_by_key(|r| r.rank);

    let mut total = 0;
    for report in &reports {
        total += report.writes;
        println!(
            "rank {:>3}: {:>6} writes, {:>4} sync points",
            report.rank, report.writes, report.sync_points
        );
    }
    println!("total: {} writes", total);

    if let Some(out) = matches.get_one::<String>("image-out") {
        let side = reports.first().and_then(|r| r.side).ok_or_else(|| {
            CacheError::InvariantViolation("No cache image was written".to_string())
        })?;
        let block = storage.read(side.address, side.length)?;
        std::fs::write(out, &block)?;
        println!("image: {} bytes written to {}", side.length, out);
    }
    Ok(())
}

#[derive(Serialize)]
struct ImageSummary {
    version: u8,
    block_len: u64,
    entry_count: u32,
    dirty_entries: usize,
    payload_bytes: u64,
    max_dependency_height: u32,
    entries: Vec<EntrySummary>,
}

#[derive(Serialize)]
struct EntrySummary {
    address: Address,
    size: u64,
    type_id: u8,
    ring: String,
    dirty: bool,
    age: u8,
    lru_rank: i32,
    dependency_height: u32,
    parents: Vec<Address>,
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let block = std::fs::read(path)?;
    let (header, image) = CacheImage::decode_with_header(&block)?;
    let summary = ImageSummary {
        version: header.version,
        block_len: header.block_len,
        entry_count: header.entry_count,
        dirty_entries: image.entries.iter().filter(|e| e.is_dirty).count(),
        payload_bytes: image.entries.iter().map(|e| e.size).sum(),
        max_dependency_height: image
            .entries
            .iter()
            .map(|e| e.dependency_height)
            .max()
            .unwrap_or(0),
        entries: image
            .entries
            .iter()
            .map(|e| EntrySummary {
                address: e.address,
                size: e.size,
                type_id: e.type_id,
                ring: format!("{:?}", e.ring),
                dirty: e.is_dirty,
                age: e.age,
                lru_rank: e.lru_rank,
                dependency_height: e.dependency_height,
                parents: e.parents.clone(),
            })
            .collect(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!(
        "image v{}: {} bytes, {} entries ({} dirty), {} payload bytes, max height {}",
        summary.version,
        summary.block_len,
        summary.entry_count,
        summary.dirty_entries,
        summary.payload_bytes,
        summary.max_dependency_height
    );
    for entry in &summary.entries {
        println!(
            "  {:>12} {:>8}B type {:>3} {:<14} {} age {:>3} rank {:>5} height {} parents {:?}",
            entry.address,
            entry.size,
            entry.type_id,
            entry.ring,
            if entry.dirty { "dirty" } else { "clean" },
            entry.age,
            entry.lru_rank,
            entry.dependency_height,
            entry.parents
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Config::build_cli().get_matches();
    let config = Config::from_matches(&matches)?;

    let mut logger = LoggerManager::new(config.logging.clone());
    logger.initialize()?;

    info!(
        "Starting mdcache v{} (built: {})",
        env!("BUILD_VERSION"),
        env!("BUILD_TIMESTAMP")
    );

    let result = match matches.subcommand() {
        Some(("simulate", sub)) => simulate(config, sub).await,
        Some(("inspect", sub)) => {
            let file = sub
                .get_one::<String>("file")
                .ok_or_else(|| CacheError::ConfigError("inspect needs a file".to_string()))?;
            inspect(Path::new(file), sub.get_flag("json"))
        }
        _ => {
            let storage = Arc::new(MemoryStorage::new());
            let cache = MetadataCache::new(config.to_cache_config(), storage)?;
            let stats = cache.get_stats();
            println!(
                "mdcache: max_size={} min_clean_size={} (use `simulate` or `inspect`)",
                stats.max_size, stats.min_clean_size
            );
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("mdcache failed: {}", e);
    }
    result
}
