//! Write Coordination Module
//!
//! Keeps the caches of N cooperating processes consistent when every process
//! issues the same sequence of cache operations. Outside sync points nobody
//! writes; at a sync point either rank 0 writes everything and broadcasts what
//! is now clean, or a broadcast candidate list is partitioned across ranks.

use crate::cache::MetadataCache;
use crate::entry::{Address, FlushFlags, Ring};
use crate::process_group::ProcessGroup;
use crate::{CacheError, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

pub const MIN_DIRTY_BYTES_THRESHOLD: u64 = 1024;
pub const MAX_DIRTY_BYTES_THRESHOLD: u64 = 256 * 1024 * 1024;
pub const DEFAULT_DIRTY_BYTES_THRESHOLD: u64 = 256 * 1024;

/// Who performs physical writes at a sync point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Rank 0 writes; the others mark the broadcast clean list clean
    ProcessZeroOnly,
    /// Every rank writes its share of a broadcast candidate list
    Distributed,
}

/// How candidate positions are assigned to ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidatePartition {
    RoundRobin,
    /// Consecutive blocks; the first `len % size` ranks take one extra
    Contiguous,
}

/// What a sync point must achieve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPointOp {
    /// Write just enough from the LRU tail to reach the minimum clean size
    FlushToMinClean,
    /// Write every dirty, unprotected entry
    FlushCache,
}

/// Test and instrumentation hooks called by the coordination layer
pub trait SyncObserver: Send + Sync {
    fn write_done(&self, address: Address);

    fn sync_point_done(&self, op: SyncPointOp, addresses: &[Address]) {
        let _ = (op, addresses);
    }
}

fn default_strategy() -> WriteStrategy {
    WriteStrategy::Distributed
}

fn default_dirty_bytes_threshold() -> u64 {
    DEFAULT_DIRTY_BYTES_THRESHOLD
}

fn default_partition() -> CandidatePartition {
    CandidatePartition::RoundRobin
}

fn default_process_count() -> usize {
    1
}

fn default_verify_candidates() -> bool {
    true
}

/// Coordination settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationConfig {
    #[serde(default = "default_strategy")]
    pub strategy: WriteStrategy,
    /// Dirty bytes accumulated since the last sync point that trigger the next one
    #[serde(default = "default_dirty_bytes_threshold")]
    pub dirty_bytes_threshold: u64,
    #[serde(default = "default_partition")]
    pub partition: CandidatePartition,
    /// Members of the simulated process group
    #[serde(default = "default_process_count")]
    pub process_count: usize,
    /// Recompute whole-cache candidate lists locally and compare with the broadcast
    #[serde(default = "default_verify_candidates")]
    pub verify_candidates: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            dirty_bytes_threshold: default_dirty_bytes_threshold(),
            partition: default_partition(),
            process_count: default_process_count(),
            verify_candidates: default_verify_candidates(),
        }
    }
}

impl CoordinationConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(MIN_DIRTY_BYTES_THRESHOLD..=MAX_DIRTY_BYTES_THRESHOLD)
            .contains(&self.dirty_bytes_threshold)
        {
            return Err(format!(
                "dirty_bytes_threshold {} outside {}..={}",
                self.dirty_bytes_threshold, MIN_DIRTY_BYTES_THRESHOLD, MAX_DIRTY_BYTES_THRESHOLD
            ));
        }
        if self.process_count == 0 {
            return Err("process_count must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Per-process coordination counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinationStats {
    pub sync_points: u64,
    pub entries_written: u64,
    pub entries_cleared: u64,
    pub broadcasts: u64,
    pub bytes_broadcast: u64,
}

/// Coordination state attached to a cache
pub struct Coordinator {
    group: Arc<dyn ProcessGroup>,
    config: CoordinationConfig,
    pub(crate) write_permitted: bool,
    in_sync_point: bool,
    dirty_bytes: u64,
    /// Rank 0 only: dirtied since the last sync point
    dirtied: BTreeSet<Address>,
    /// Rank 0 only: flushed since the last sync point and still clean
    cleaned: BTreeSet<Address>,
    /// Rank 0 only: candidates of the sync point in progress
    candidates: BTreeSet<Address>,
    observer: Option<Arc<dyn SyncObserver>>,
    stats: CoordinationStats,
}

impl Coordinator {
    fn new(group: Arc<dyn ProcessGroup>, config: CoordinationConfig) -> Self {
        Self {
            group,
            config,
            write_permitted: false,
            in_sync_point: false,
            dirty_bytes: 0,
            dirtied: BTreeSet::new(),
            cleaned: BTreeSet::new(),
            candidates: BTreeSet::new(),
            observer: None,
            stats: CoordinationStats::default(),
        }
    }

    fn is_coordinator(&self) -> bool {
        self.group.rank() == 0
    }

    pub(crate) fn rank(&self) -> usize {
        self.group.rank()
    }

    pub(crate) fn group(&self) -> Arc<dyn ProcessGroup> {
        self.group.clone()
    }
}

/// Candidate list wire form: u64 count followed by that many u64 addresses, little-endian
pub fn encode_address_list(addresses: &[Address]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(8 + addresses.len() * 8);
    buf.put_u64_le(addresses.len() as u64);
    for address in addresses {
        buf.put_u64_le(*address);
    }
    buf.to_vec()
}

pub fn decode_address_list(buf: &[u8]) -> Result<Vec<Address>> {
    let mut cursor = buf;
    if cursor.remaining() < 8 {
        return Err(CacheError::CollectiveError(
            "Address list shorter than its count".to_string(),
        ));
    }
    let count = cursor.get_u64_le() as usize;
    if cursor.remaining() != count.saturating_mul(8) {
        return Err(CacheError::CollectiveError(format!(
            "Address list declares {} entries but carries {} bytes",
            count,
            cursor.remaining()
        )));
    }
    Ok((0..count).map(|_| cursor.get_u64_le()).collect())
}

/// Rank that writes the candidate at `position` of a list of `len`
pub fn assigned_rank(
    partition: CandidatePartition,
    position: usize,
    len: usize,
    size: usize,
) -> usize {
    match partition {
        CandidatePartition::RoundRobin => position % size,
        CandidatePartition::Contiguous => {
            let base = len / size;
            let extra = len % size;
            let big = extra * (base + 1);
            if position < big {
                position / (base + 1)
            } else {
                extra + (position - big) / base.max(1)
            }
        }
    }
}

impl MetadataCache {
    /// Join a process group. Every member must create an identical cache and
    /// then issue the same cache operations in the same order.
    pub fn enable_coordination(
        &mut self,
        group: Arc<dyn ProcessGroup>,
        config: CoordinationConfig,
    ) -> Result<()> {
        config.validate().map_err(|e| {
            CacheError::ConfigError(format!("Invalid coordination configuration: {}", e))
        })?;
        if self.config.read_only {
            return Err(CacheError::ConfigError(
                "Coordination requires a writable cache".to_string(),
            ));
        }
        if !self.index.is_empty() {
            return Err(CacheError::InvariantViolation(format!(
                "Coordination must be enabled on an empty cache ({} entries present)",
                self.index.len()
            )));
        }
        info!(
            "Coordination enabled: rank {}/{} strategy={:?} threshold={} partition={:?}",
            group.rank(),
            group.size(),
            config.strategy,
            config.dirty_bytes_threshold,
            config.partition
        );
        self.coordination = Some(Coordinator::new(group, config));
        Ok(())
    }

    pub fn set_sync_observer(&mut self, observer: Arc<dyn SyncObserver>) -> Result<()> {
        match self.coordination.as_mut() {
            Some(coord) => {
                coord.observer = Some(observer);
                Ok(())
            }
            None => Err(CacheError::InvariantViolation(
                "Sync observer requires a coordinated cache".to_string(),
            )),
        }
    }

    pub fn is_coordinated(&self) -> bool {
        self.coordination.is_some()
    }

    /// Dirty bytes accumulated since the last sync point
    pub fn coordination_dirty_bytes(&self) -> Option<u64> {
        self.coordination.as_ref().map(|c| c.dirty_bytes)
    }

    pub fn coordination_stats(&self) -> Option<CoordinationStats> {
        self.coordination.as_ref().map(|c| c.stats.clone())
    }

    /// Rank 0 bookkeeping sets (dirtied, cleaned) since the last sync point
    pub fn coordination_log(&self) -> Option<(Vec<Address>, Vec<Address>)> {
        self.coordination.as_ref().map(|c| {
            (
                c.dirtied.iter().copied().collect(),
                c.cleaned.iter().copied().collect(),
            )
        })
    }

    fn coordinator_mut(&mut self) -> Result<&mut Coordinator> {
        self.coordination.as_mut().ok_or_else(|| {
            CacheError::InvariantViolation("Cache is not coordinated".to_string())
        })
    }

    // ---------------------------------------------------------------------
    // Entry log
    // ---------------------------------------------------------------------

    pub(crate) fn coord_log_inserted(&mut self, address: Address, size: u64) -> Result<()> {
        let coord = match self.coordination.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        if coord.is_coordinator() {
            if coord.dirtied.contains(&address) || coord.cleaned.contains(&address) {
                return Err(CacheError::InvariantViolation(format!(
                    "Inserted entry {} is already in the coordination log",
                    address
                )));
            }
            coord.dirtied.insert(address);
        }
        coord.dirty_bytes += size;
        Ok(())
    }

    pub(crate) fn coord_log_dirtied(&mut self, address: Address, size: u64) -> Result<()> {
        let coord = match self.coordination.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        if coord.is_coordinator() {
            coord.cleaned.remove(&address);
            coord.dirtied.insert(address);
        }
        coord.dirty_bytes += size;
        Ok(())
    }

    pub(crate) fn coord_log_cleaned(&mut self, address: Address, _size: u64) -> Result<()> {
        if let Some(coord) = self.coordination.as_mut() {
            if coord.is_coordinator() {
                coord.dirtied.remove(&address);
            }
        }
        Ok(())
    }

    pub(crate) fn coord_log_flushed(
        &mut self,
        address: Address,
        was_dirty: bool,
        clear_only: bool,
    ) -> Result<()> {
        let coord = match self.coordination.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        if !coord.is_coordinator() {
            return Ok(());
        }
        if clear_only {
            coord.dirtied.remove(&address);
            coord.cleaned.remove(&address);
        } else if was_dirty {
            coord.dirtied.remove(&address);
            coord.cleaned.insert(address);
        }
        Ok(())
    }

    pub(crate) fn coord_log_deleted(&mut self, address: Address) -> Result<()> {
        if let Some(coord) = self.coordination.as_mut() {
            if coord.is_coordinator() {
                coord.dirtied.remove(&address);
                coord.cleaned.remove(&address);
            }
        }
        Ok(())
    }

    pub(crate) fn coord_log_moved(
        &mut self,
        old: Address,
        new: Address,
        was_dirty: bool,
        size: u64,
    ) -> Result<()> {
        let coord = match self.coordination.as_mut() {
            Some(c) => c,
            None => return Ok(()),
        };
        if coord.is_coordinator() {
            coord.dirtied.remove(&old);
            coord.cleaned.remove(&old);
            coord.dirtied.insert(new);
        }
        if !was_dirty {
            coord.dirty_bytes += size;
        }
        Ok(())
    }

    pub(crate) fn coord_write_done(&mut self, address: Address) {
        if let Some(coord) = self.coordination.as_mut() {
            coord.stats.entries_written += 1;
            if let Some(observer) = &coord.observer {
                observer.write_done(address);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Sync points
    // ---------------------------------------------------------------------

    /// Run a minimum-clean sync point once enough bytes have been dirtied
    pub(crate) fn maybe_run_sync_point(&mut self) -> Result<()> {
        let due = match &self.coordination {
            Some(coord) => {
                !coord.in_sync_point && coord.dirty_bytes >= coord.config.dirty_bytes_threshold
            }
            None => false,
        };
        if due {
            self.run_sync_point(SyncPointOp::FlushToMinClean)?;
        }
        Ok(())
    }

    pub(crate) fn flush_coordinated(&mut self) -> Result<()> {
        self.run_sync_point(SyncPointOp::FlushCache)
    }

    /// Enter a sync point. Every member must call this at the same logical step.
    pub fn run_sync_point(&mut self, op: SyncPointOp) -> Result<()> {
        let coord = self.coordinator_mut()?;
        if coord.in_sync_point {
            return Err(CacheError::InvariantViolation(
                "Sync point entered recursively".to_string(),
            ));
        }
        coord.in_sync_point = true;
        let strategy = coord.config.strategy;
        let group = coord.group.clone();
        debug!(
            "Rank {} entering {:?} sync point ({:?}, {} dirty bytes)",
            group.rank(),
            op,
            strategy,
            coord.dirty_bytes
        );

        let result = match strategy {
            WriteStrategy::ProcessZeroOnly => self.sync_process_zero_only(op, group.as_ref()),
            WriteStrategy::Distributed => self.sync_distributed(op, group.as_ref()),
        };

        let coord = self.coordinator_mut()?;
        coord.in_sync_point = false;
        coord.write_permitted = false;
        match result {
            Ok(addresses) => {
                coord.dirty_bytes = 0;
                coord.stats.sync_points += 1;
                if let Some(observer) = &coord.observer {
                    observer.sync_point_done(op, &addresses);
                }
                self.counters.sync_points += 1;
                info!(
                    "Rank {} completed {:?} sync point: {} entries now clean",
                    group.rank(),
                    op,
                    addresses.len()
                );
                Ok(())
            }
            Err(e) => {
                error!("Rank {} sync point failed: {}", group.rank(), e);
                group.abort(&e.to_string());
                Err(e)
            }
        }
    }

    fn broadcast_addresses(
        &mut self,
        group: &dyn ProcessGroup,
        addresses: &[Address],
    ) -> Result<Vec<Address>> {
        let mut count_buf = (addresses.len() as u64).to_le_bytes().to_vec();
        group.broadcast(&mut count_buf, 0)?;
        let count = match <[u8; 8]>::try_from(count_buf.as_slice()) {
            Ok(bytes) => u64::from_le_bytes(bytes),
            Err(_) => {
                return Err(CacheError::CollectiveError(format!(
                    "Broadcast count has {} bytes",
                    count_buf.len()
                )))
            }
        };
        let mut sent = count_buf.len() as u64;
        let list = if count > 0 {
            let mut buf = encode_address_list(addresses);
            group.broadcast(&mut buf, 0)?;
            sent += buf.len() as u64;
            let list = decode_address_list(&buf)?;
            if list.len() as u64 != count {
                return Err(CacheError::CollectiveError(format!(
                    "Broadcast list has {} entries, count said {}",
                    list.len(),
                    count
                )));
            }
            list
        } else {
            Vec::new()
        };
        let coord = self.coordinator_mut()?;
        coord.stats.broadcasts += if count > 0 { 2 } else { 1 };
        coord.stats.bytes_broadcast += sent;
        Ok(list)
    }

    /// Rank 0 writes; everyone else marks the broadcast clean list clean
    fn sync_process_zero_only(
        &mut self,
        op: SyncPointOp,
        group: &dyn ProcessGroup,
    ) -> Result<Vec<Address>> {
        group.barrier()?;

        if group.rank() == 0 {
            self.coordinator_mut()?.write_permitted = true;
            let flushed = match op {
                SyncPointOp::FlushCache => self.flush_all_rings_for_sync(),
                SyncPointOp::FlushToMinClean => {
                    let nominated = self.nominate_min_clean_entries();
                    nominated
                        .into_iter()
                        .try_for_each(|a| self.flush_single_entry(a, false))
                }
            };
            self.coordinator_mut()?.write_permitted = false;
            flushed?;

            let clean: Vec<Address> = self.coordinator_mut()?.cleaned.iter().copied().collect();
            let list = self.broadcast_addresses(group, &clean)?;
            let coord = self.coordinator_mut()?;
            for address in &list {
                coord.cleaned.remove(address);
                coord.dirtied.remove(address);
            }
            Ok(list)
        } else {
            let list = self.broadcast_addresses(group, &[])?;
            for address in &list {
                self.apply_clean_mark(*address)?;
            }
            Ok(list)
        }
    }

    fn flush_all_rings_for_sync(&mut self) -> Result<()> {
        let flags = FlushFlags {
            ignore_protected: true,
            ..FlushFlags::default()
        };
        for ring in Ring::ALL {
            self.flush_ring(ring, flags)?;
        }
        Ok(())
    }

    /// Mark an entry clean because another rank wrote it
    fn apply_clean_mark(&mut self, address: Address) -> Result<()> {
        let entry = self.index.get(&address).ok_or_else(|| {
            CacheError::CollectiveError(format!(
                "Clean list names entry {} which is not cached on rank {}",
                address,
                self.coordination.as_ref().map(|c| c.group.rank()).unwrap_or(0)
            ))
        })?;
        if !entry.is_dirty || entry.is_protected {
            return Err(CacheError::CollectiveError(format!(
                "Clean list names entry {} which is {}",
                address,
                if entry.is_protected {
                    "protected"
                } else {
                    "already clean"
                }
            )));
        }
        self.set_clean(address)?;
        self.counters.clears += 1;
        self.coordinator_mut()?.stats.entries_cleared += 1;
        Ok(())
    }

    /// Bytes that must be written from the LRU tail to reach the minimum clean size
    fn min_clean_shortfall(&self) -> u64 {
        let available =
            self.max_cache_size.saturating_sub(self.index_size) + self.clean_lru.size();
        self.min_clean_size.saturating_sub(available)
    }

    /// Dirty LRU entries, oldest first, covering the minimum clean shortfall; sorted by address
    pub(crate) fn nominate_min_clean_entries(&self) -> Vec<Address> {
        let needed = self.min_clean_shortfall();
        let mut nominated = 0;
        let mut addresses = Vec::new();
        for address in self.lru.iter_from_tail() {
            if nominated >= needed {
                break;
            }
            if let Some(entry) = self.index.get(&address) {
                if entry.is_dirty && !entry.prefetched_dirty {
                    nominated += entry.size;
                    addresses.push(address);
                }
            }
        }
        addresses.sort_unstable();
        addresses
    }

    /// Every dirty, unprotected entry whose dirty children are all candidates too, sorted
    pub fn flush_cache_candidates(&self) -> Vec<Address> {
        let mut set: BTreeSet<Address> = self
            .dirty_set
            .iter()
            .filter(|a| self.index.get(a).map(|e| !e.is_protected).unwrap_or(false))
            .copied()
            .collect();
        loop {
            let mut dirty_children: HashMap<Address, usize> = HashMap::new();
            for address in &set {
                if let Some(entry) = self.index.get(address) {
                    for parent in &entry.flush_dep_parents {
                        *dirty_children.entry(*parent).or_default() += 1;
                    }
                }
            }
            let blocked: Vec<Address> = set
                .iter()
                .filter(|a| {
                    let have = dirty_children.get(a).copied().unwrap_or(0);
                    self.index
                        .get(a)
                        .map(|e| e.flush_dep_ndirty_children > have)
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            if blocked.is_empty() {
                break;
            }
            for address in blocked {
                set.remove(&address);
            }
        }
        set.into_iter().collect()
    }

    /// Broadcast a candidate list from rank 0 and write this rank's share of it
    fn sync_distributed(
        &mut self,
        op: SyncPointOp,
        group: &dyn ProcessGroup,
    ) -> Result<Vec<Address>> {
        group.barrier()?;

        let local = match op {
            SyncPointOp::FlushCache => self.flush_cache_candidates(),
            SyncPointOp::FlushToMinClean => self.nominate_min_clean_entries(),
        };
        if group.rank() == 0 {
            self.coordinator_mut()?.candidates = local.iter().copied().collect();
        }
        let mut buf = encode_address_list(&local);
        group.broadcast(&mut buf, 0)?;
        let candidates = decode_address_list(&buf)?;
        {
            let coord = self.coordinator_mut()?;
            coord.stats.broadcasts += 1;
            coord.stats.bytes_broadcast += buf.len() as u64;
        }

        let verify = self
            .coordination
            .as_ref()
            .map(|c| c.config.verify_candidates)
            .unwrap_or(false);
        if verify && op == SyncPointOp::FlushCache && candidates != local {
            return Err(CacheError::CollectiveError(format!(
                "Rank {} computed {} candidates but rank 0 broadcast {}",
                group.rank(),
                local.len(),
                candidates.len()
            )));
        }

        self.apply_candidate_list(&candidates, group)?;
        group.barrier()?;

        if group.rank() == 0 {
            let coord = self.coordinator_mut()?;
            for address in &candidates {
                coord.dirtied.remove(address);
                coord.cleaned.remove(address);
            }
            coord.candidates.clear();
        }
        Ok(candidates)
    }

    /// Write this rank's candidates and mark the rest clean, children before parents
    pub(crate) fn apply_candidate_list(
        &mut self,
        candidates: &[Address],
        group: &dyn ProcessGroup,
    ) -> Result<()> {
        for pair in candidates.windows(2) {
            if pair[0] >= pair[1] {
                return Err(CacheError::CollectiveError(format!(
                    "Candidate list not strictly ascending at {} / {}",
                    pair[0], pair[1]
                )));
            }
        }
        for address in candidates {
            let entry = self.index.get(address).ok_or_else(|| {
                CacheError::CollectiveError(format!("Candidate {} is not cached", address))
            })?;
            if !entry.is_dirty || entry.is_protected {
                return Err(CacheError::CollectiveError(format!(
                    "Candidate {} is clean or protected",
                    address
                )));
            }
        }

        let (rank, size) = (group.rank(), group.size());
        let partition = self
            .coordination
            .as_ref()
            .map(|c| c.config.partition)
            .unwrap_or(CandidatePartition::RoundRobin);
        let mine: BTreeSet<Address> = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| assigned_rank(partition, *i, candidates.len(), size) == rank)
            .map(|(_, a)| *a)
            .collect();
        debug!(
            "Rank {} assigned {} of {} candidates",
            rank,
            mine.len(),
            candidates.len()
        );

        let mut remaining: BTreeSet<Address> = candidates.iter().copied().collect();
        self.coordinator_mut()?.write_permitted = true;
        let result = self.apply_passes(&mut remaining, &mine, group);
        self.coordinator_mut()?.write_permitted = false;
        result?;

        if !remaining.is_empty() {
            return Err(CacheError::DependencyOrder(format!(
                "Candidates {:?} still have dirty flush-dependency children",
                remaining
            )));
        }
        Ok(())
    }

    fn apply_passes(
        &mut self,
        remaining: &mut BTreeSet<Address>,
        mine: &BTreeSet<Address>,
        group: &dyn ProcessGroup,
    ) -> Result<()> {
        for ring in Ring::ALL {
            loop {
                let ready: Vec<Address> = remaining
                    .iter()
                    .filter_map(|a| self.index.get(a))
                    .filter(|e| e.ring == ring && e.flush_dep_ndirty_children == 0)
                    .map(|e| e.address)
                    .collect();
                if ready.is_empty() {
                    break;
                }
                for address in ready {
                    remaining.remove(&address);
                    if mine.contains(&address) {
                        self.flush_single_entry(address, false)?;
                    } else {
                        self.flush_single_entry(address, true)?;
                        self.coordinator_mut()?.stats.entries_cleared += 1;
                    }
                }
                // parents written in the next pass must not overtake children written elsewhere
                if !remaining.is_empty() {
                    group.barrier()?;
                }
            }
        }
        Ok(())
    }
}
