//! Metadata Cache Module
//!
//! The entry store: an address-keyed index of entries with LRU, pinned and
//! protected lists, an ordered dirty set, size accounting, eviction and
//! adaptive resizing. Flush dependencies, multi-process coordination and cache
//! images extend `MetadataCache` from their own modules.
//!
//! The store is not internally synchronized; callers serialize access.

use crate::auto_resize::{
    AutoResizeConfig, AutoResizer, DecrMode, ResizeObserver, ResizeReport, ResizeStatus,
};
use crate::cache_image::{ImageConfig, ImageState};
use crate::coordination::Coordinator;
use crate::entry::{
    Address, Entry, EntryClient, EntryStatus, FlushFlags, InsertFlags, NotifyAction,
    PassthroughClient, ProtectMode, Ring, UnprotectFlags, UNDEFINED_ADDRESS,
};
use crate::entry_list::EntryList;
use crate::storage::Storage;
use crate::{CacheError, Result};
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Construction-time settings for a cache
#[derive(Debug, Clone)]
pub struct MetadataCacheConfig {
    pub max_size: u64,
    pub min_clean_size: u64,
    pub evictions_enabled: bool,
    /// The underlying store was opened read-only; nothing may be written
    pub read_only: bool,
    pub auto_resize: AutoResizeConfig,
    pub image: ImageConfig,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        let auto_resize = AutoResizeConfig::default();
        Self {
            max_size: auto_resize.initial_size,
            min_clean_size: auto_resize.min_clean_for(auto_resize.initial_size),
            evictions_enabled: true,
            read_only: false,
            auto_resize,
            image: ImageConfig::default(),
        }
    }
}

impl MetadataCacheConfig {
    /// Fixed-size cache with adaptive resizing switched off
    pub fn fixed(max_size: u64, min_clean_size: u64) -> Self {
        let fraction = if max_size == 0 {
            0.0
        } else {
            min_clean_size as f64 / max_size as f64
        };
        Self {
            max_size,
            min_clean_size,
            auto_resize: AutoResizeConfig::disabled(max_size, fraction),
            ..Self::default()
        }
    }
}

/// Operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub loads: u64,
    pub evictions: u64,
    pub writes: u64,
    pub clears: u64,
    pub moves: u64,
    pub pins: u64,
    pub unpins: u64,
    pub expunges: u64,
    pub size_changes: u64,
    pub flash_increases: u64,
    pub resizes: u64,
    pub sync_points: u64,
    pub images_written: u64,
    pub images_loaded: u64,
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub max_size: u64,
    pub min_clean_size: u64,
    pub index_size: u64,
    pub clean_index_size: u64,
    pub dirty_index_size: u64,
    pub entries_count: usize,
    pub lru_len: usize,
    pub pinned_len: usize,
    pub protected_len: usize,
    pub dirty_set_len: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hit rate over the current epoch
    pub epoch_hit_rate: f64,
    pub insertions: u64,
    pub loads: u64,
    pub evictions: u64,
    pub writes: u64,
    pub clears: u64,
    pub moves: u64,
    pub pins: u64,
    pub unpins: u64,
    pub expunges: u64,
    pub size_changes: u64,
    pub flash_increases: u64,
    pub resizes: u64,
    pub sync_points: u64,
    pub images_written: u64,
    pub images_loaded: u64,
}

impl CacheStats {
    /// Lifetime hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Generic address-keyed metadata cache
pub struct MetadataCache {
    pub(crate) config: MetadataCacheConfig,
    pub(crate) storage: Arc<dyn Storage>,
    clients: HashMap<u8, Arc<dyn EntryClient>>,

    pub(crate) index: HashMap<Address, Entry>,
    /// Unprotected, unpinned entries; head is most recently used
    pub(crate) lru: EntryList,
    pub(crate) clean_lru: EntryList,
    pub(crate) dirty_lru: EntryList,
    pub(crate) pinned: EntryList,
    pub(crate) protected: BTreeSet<Address>,
    pub(crate) protected_size: u64,
    /// Dirty entries ordered by address
    pub(crate) dirty_set: BTreeSet<Address>,
    pub(crate) dirty_set_size: u64,

    pub(crate) max_cache_size: u64,
    pub(crate) min_clean_size: u64,
    pub(crate) index_size: u64,
    pub(crate) clean_index_size: u64,
    pub(crate) dirty_index_size: u64,

    pub(crate) resizer: AutoResizer,
    resize_observer: Option<Arc<dyn ResizeObserver>>,
    resize_in_progress: bool,
    make_space_in_progress: bool,

    pub(crate) coordination: Option<Coordinator>,
    pub(crate) image: ImageState,
    pub(crate) counters: CacheCounters,
}

impl MetadataCache {
    /// Create a cache over the given storage
    pub fn new(config: MetadataCacheConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        if config.max_size == 0 {
            return Err(CacheError::ConfigError(
                "Cache max_size must be greater than zero".to_string(),
            ));
        }
        if config.min_clean_size > config.max_size {
            return Err(CacheError::ConfigError(format!(
                "min_clean_size {} exceeds max_size {}",
                config.min_clean_size, config.max_size
            )));
        }
        if config.auto_resize.is_enabled() && !config.evictions_enabled {
            return Err(CacheError::ConfigError(
                "Automatic resizing requires evictions to be enabled".to_string(),
            ));
        }
        if config.auto_resize.is_enabled() {
            config.auto_resize.validate().map_err(|e| {
                CacheError::ConfigError(format!("Invalid auto-resize configuration: {}", e))
            })?;
        }
        config
            .image
            .validate()
            .map_err(|e| CacheError::ConfigError(format!("Invalid image configuration: {}", e)))?;

        let (max_cache_size, min_clean_size) =
            if config.auto_resize.is_enabled() && config.auto_resize.set_initial_size {
                let max = config.auto_resize.initial_size;
                (max, config.auto_resize.min_clean_for(max))
            } else {
                (config.max_size, config.min_clean_size)
            };

        info!(
            "Metadata cache created: max_size={} min_clean_size={} auto_resize={} read_only={}",
            max_cache_size,
            min_clean_size,
            config.auto_resize.is_enabled(),
            config.read_only
        );

        let resizer = AutoResizer::new(config.auto_resize.clone(), max_cache_size);
        let image = ImageState::new(config.image.clone());
        Ok(Self {
            config,
            storage,
            clients: HashMap::new(),
            index: HashMap::new(),
            lru: EntryList::new(),
            clean_lru: EntryList::new(),
            dirty_lru: EntryList::new(),
            pinned: EntryList::new(),
            protected: BTreeSet::new(),
            protected_size: 0,
            dirty_set: BTreeSet::new(),
            dirty_set_size: 0,
            max_cache_size,
            min_clean_size,
            index_size: 0,
            clean_index_size: 0,
            dirty_index_size: 0,
            resizer,
            resize_observer: None,
            resize_in_progress: false,
            make_space_in_progress: false,
            coordination: None,
            image,
            counters: CacheCounters::default(),
        })
    }

    /// Register the hooks for one entry type
    pub fn register_client(&mut self, client: Arc<dyn EntryClient>) {
        debug!(
            "Registered client '{}' for type {}",
            client.name(),
            client.type_id()
        );
        self.clients.insert(client.type_id(), client);
    }

    pub fn set_resize_observer(&mut self, observer: Arc<dyn ResizeObserver>) {
        self.resize_observer = Some(observer);
    }

    pub(crate) fn client_for(&self, type_id: u8) -> Arc<dyn EntryClient> {
        match self.clients.get(&type_id) {
            Some(client) => client.clone(),
            None => Arc::new(PassthroughClient::new(type_id)),
        }
    }

    pub(crate) fn notify(&self, type_id: u8, action: NotifyAction, address: Address) -> Result<()> {
        match self.clients.get(&type_id) {
            Some(client) => client.notify(action, address),
            None => Ok(()),
        }
    }

    pub(crate) fn entry(&self, address: Address, op: &str) -> Result<&Entry> {
        self.index.get(&address).ok_or_else(|| {
            CacheError::InvariantViolation(format!("{}: address {} not in cache", op, address))
        })
    }

    pub(crate) fn entry_mut(&mut self, address: Address, op: &str) -> Result<&mut Entry> {
        self.index.get_mut(&address).ok_or_else(|| {
            CacheError::InvariantViolation(format!("{}: address {} not in cache", op, address))
        })
    }

    /// Whether physical writes may be issued right now
    pub fn write_permitted(&self) -> bool {
        if self.config.read_only {
            return false;
        }
        match &self.coordination {
            Some(coord) => coord.write_permitted,
            None => true,
        }
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn contains(&self, address: Address) -> bool {
        self.index.contains_key(&address)
    }

    pub fn get_entry_status(&self, address: Address) -> Option<EntryStatus> {
        self.index.get(&address).map(|e| e.status())
    }

    pub fn entry_count(&self) -> usize {
        self.index.len()
    }

    /// All cached addresses in ascending order
    pub fn addresses(&self) -> Vec<Address> {
        let mut addrs: Vec<Address> = self.index.keys().copied().collect();
        addrs.sort_unstable();
        addrs
    }

    /// Addresses currently dirty, ascending
    pub fn dirty_addresses(&self) -> Vec<Address> {
        self.dirty_set.iter().copied().collect()
    }

    /// LRU order from most to least recently used
    pub fn lru_order(&self) -> Vec<Address> {
        self.lru.iter().collect()
    }

    pub fn pinned_addresses(&self) -> Vec<Address> {
        self.pinned.iter().collect()
    }

    pub fn is_protected(&self, address: Address) -> bool {
        self.protected.contains(&address)
    }

    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size
    }

    pub fn min_clean_size(&self) -> u64 {
        self.min_clean_size
    }

    pub fn index_size(&self) -> u64 {
        self.index_size
    }

    pub fn dirty_index_size(&self) -> u64 {
        self.dirty_index_size
    }

    pub fn clean_index_size(&self) -> u64 {
        self.clean_index_size
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    /// Hit rate over the current epoch
    pub fn hit_rate(&self) -> f64 {
        self.resizer.hit_rate()
    }

    pub fn reset_hit_rate_stats(&mut self) {
        self.resizer.reset_hit_rate_stats();
    }

    pub fn auto_resize_config(&self) -> &AutoResizeConfig {
        &self.resizer.config
    }

    /// Install a new resize policy, optionally resetting the cache size to its initial size
    pub fn set_auto_resize_config(&mut self, config: AutoResizeConfig) -> Result<()> {
        config.validate().map_err(|e| {
            CacheError::ConfigError(format!("Invalid auto-resize configuration: {}", e))
        })?;
        if config.is_enabled() && !self.config.evictions_enabled {
            return Err(CacheError::ConfigError(
                "Automatic resizing requires evictions to be enabled".to_string(),
            ));
        }
        let max = if config.set_initial_size {
            config.initial_size
        } else {
            self.max_cache_size.clamp(config.min_size, config.max_size)
        };
        info!(
            "Auto-resize configuration installed: max_size {} -> {}",
            self.max_cache_size, max
        );
        self.max_cache_size = max;
        self.min_clean_size = config.min_clean_for(max);
        self.config.auto_resize = config.clone();
        let epoch = self.resizer.epoch;
        self.resizer = AutoResizer::new(config, max);
        self.resizer.epoch = epoch;
        if self.index_size > self.max_cache_size {
            self.make_space(0)?;
        }
        Ok(())
    }

    pub fn evictions_enabled(&self) -> bool {
        self.config.evictions_enabled
    }

    /// Switch evictions on or off. They stay on while automatic resizing is active.
    pub fn set_evictions_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled && self.resizer.config.is_enabled() {
            return Err(CacheError::ConfigError(
                "Cannot disable evictions while automatic resizing is enabled".to_string(),
            ));
        }
        if enabled == self.config.evictions_enabled {
            return Ok(());
        }
        self.config.evictions_enabled = enabled;
        info!("Evictions {}", if enabled { "enabled" } else { "disabled" });
        if enabled && self.index_size > self.max_cache_size {
            self.make_space(0)?;
        }
        Ok(())
    }

    pub fn get_stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            max_size: self.max_cache_size,
            min_clean_size: self.min_clean_size,
            index_size: self.index_size,
            clean_index_size: self.clean_index_size,
            dirty_index_size: self.dirty_index_size,
            entries_count: self.index.len(),
            lru_len: self.lru.len(),
            pinned_len: self.pinned.len(),
            protected_len: self.protected.len(),
            dirty_set_len: self.dirty_set.len(),
            hits: c.hits,
            misses: c.misses,
            epoch_hit_rate: self.resizer.hit_rate(),
            insertions: c.insertions,
            loads: c.loads,
            evictions: c.evictions,
            writes: c.writes,
            clears: c.clears,
            moves: c.moves,
            pins: c.pins,
            unpins: c.unpins,
            expunges: c.expunges,
            size_changes: c.size_changes,
            flash_increases: c.flash_increases,
            resizes: c.resizes,
            sync_points: c.sync_points,
            images_written: c.images_written,
            images_loaded: c.images_loaded,
        }
    }

    // ---------------------------------------------------------------------
    // List bookkeeping
    // ---------------------------------------------------------------------

    /// Put an unprotected entry on the LRU head or the pinned list
    fn place_unprotected(&mut self, address: Address) {
        let (size, dirty, pinned) = match self.index.get(&address) {
            Some(e) => (e.size, e.is_dirty, e.is_pinned()),
            None => return,
        };
        if pinned {
            self.pinned.push_head(address, size);
        } else {
            self.lru.push_head(address, size);
            if dirty {
                self.dirty_lru.push_head(address, size);
            } else {
                self.clean_lru.push_head(address, size);
            }
        }
    }

    /// Remove an entry from whichever replacement list holds it
    fn remove_from_replacement_lists(&mut self, address: Address) {
        if self.lru.remove(address) {
            self.clean_lru.remove(address);
            self.dirty_lru.remove(address);
        }
        self.pinned.remove(address);
    }

    /// Move an entry between the LRU and the pinned list after its pin state changed
    pub(crate) fn update_pin_placement(&mut self, address: Address) {
        let (protected, pinned) = match self.index.get(&address) {
            Some(e) => (e.is_protected, e.is_pinned()),
            None => return,
        };
        if protected {
            return;
        }
        let on_pinned = self.pinned.contains(address);
        if pinned != on_pinned {
            self.remove_from_replacement_lists(address);
            self.place_unprotected(address);
        }
    }

    fn touch_lru(&mut self, address: Address) {
        if self.lru.move_to_head(address) {
            if !self.clean_lru.move_to_head(address) {
                self.dirty_lru.move_to_head(address);
            }
        }
    }

    /// Transition an entry to dirty. Returns true if it was clean.
    pub(crate) fn set_dirty(&mut self, address: Address) -> Result<bool> {
        let entry = self.entry_mut(address, "mark dirty")?;
        entry.image_up_to_date = false;
        if entry.is_dirty {
            return Ok(false);
        }
        entry.is_dirty = true;
        entry.in_write_set = true;
        let size = entry.size;
        let type_id = entry.type_id;
        let parents = entry.flush_dep_parents.clone();

        self.clean_index_size -= size;
        self.dirty_index_size += size;
        self.dirty_set.insert(address);
        self.dirty_set_size += size;
        if self.clean_lru.remove(address) {
            self.dirty_lru.push_head(address, size);
        }

        for parent in parents {
            let p = self.entry_mut(parent, "mark dirty")?;
            p.flush_dep_ndirty_children += 1;
            let parent_type = p.type_id;
            self.notify(parent_type, NotifyAction::ChildDirtied, parent)?;
        }
        self.notify(type_id, NotifyAction::EntryDirtied, address)?;
        Ok(true)
    }

    /// Transition an entry to clean without writing it. Returns true if it was dirty.
    pub(crate) fn set_clean(&mut self, address: Address) -> Result<bool> {
        let entry = self.entry_mut(address, "mark clean")?;
        if !entry.is_dirty {
            return Ok(false);
        }
        entry.is_dirty = false;
        entry.in_write_set = false;
        entry.flush_marker = false;
        let size = entry.size;
        let type_id = entry.type_id;
        let parents = entry.flush_dep_parents.clone();

        self.dirty_index_size -= size;
        self.clean_index_size += size;
        self.dirty_set.remove(&address);
        self.dirty_set_size -= size;
        if self.dirty_lru.remove(address) {
            self.clean_lru.push_head(address, size);
        }

        for parent in parents {
            let p = self.entry_mut(parent, "mark clean")?;
            if p.flush_dep_ndirty_children == 0 {
                return Err(CacheError::InvariantViolation(format!(
                    "Dirty child count underflow on parent {} of {}",
                    parent, address
                )));
            }
            p.flush_dep_ndirty_children -= 1;
            let parent_type = p.type_id;
            self.notify(parent_type, NotifyAction::ChildCleaned, parent)?;
        }
        self.notify(type_id, NotifyAction::EntryCleaned, address)?;
        Ok(true)
    }

    /// Add a new entry to the index and the size accounting
    pub(crate) fn index_insert(&mut self, entry: Entry) {
        let address = entry.address;
        let size = entry.size;
        if entry.is_dirty {
            self.dirty_index_size += size;
            self.dirty_set.insert(address);
            self.dirty_set_size += size;
        } else {
            self.clean_index_size += size;
        }
        self.index_size += size;
        self.index.insert(address, entry);
    }

    /// Remove an entry from every structure. The entry must have no flush-dependency children.
    pub(crate) fn index_remove(&mut self, address: Address) -> Result<Entry> {
        let entry = self.entry(address, "remove")?;
        if entry.flush_dep_nchildren > 0 {
            return Err(CacheError::InvariantViolation(format!(
                "Cannot remove entry {} while it has {} flush-dependency children",
                address, entry.flush_dep_nchildren
            )));
        }
        let parents = entry.flush_dep_parents.clone();
        for parent in parents {
            self.destroy_flush_dependency(parent, address)?;
        }

        self.remove_from_replacement_lists(address);
        if self.protected.remove(&address) {
            let size = self.entry(address, "remove")?.size;
            self.protected_size -= size;
        }
        let entry = self.index.remove(&address).ok_or_else(|| {
            CacheError::InvariantViolation(format!("remove: address {} not in cache", address))
        })?;
        if entry.is_dirty {
            self.dirty_index_size -= entry.size;
            self.dirty_set.remove(&address);
            self.dirty_set_size -= entry.size;
        } else {
            self.clean_index_size -= entry.size;
        }
        self.index_size -= entry.size;
        Ok(entry)
    }

    /// Evict a clean, unpinned, unprotected entry
    pub(crate) fn evict_entry(&mut self, address: Address) -> Result<()> {
        let entry = self.entry(address, "evict")?;
        if entry.is_dirty {
            return Err(CacheError::InvariantViolation(format!(
                "Cannot evict dirty entry {}",
                address
            )));
        }
        if entry.is_protected || entry.is_pinned() {
            return Err(CacheError::InvariantViolation(format!(
                "Cannot evict protected or pinned entry {}",
                address
            )));
        }
        let type_id = entry.type_id;
        self.notify(type_id, NotifyAction::BeforeEvict, address)?;
        self.index_remove(address)?;
        self.counters.evictions += 1;
        debug!("Evicted entry {}", address);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Entry operations
    // ---------------------------------------------------------------------

    /// Insert a new dirty entry at the LRU head
    pub fn insert(
        &mut self,
        address: Address,
        type_id: u8,
        payload: Bytes,
        flags: InsertFlags,
    ) -> Result<()> {
        self.load_pending_image()?;

        if address == UNDEFINED_ADDRESS {
            return Err(CacheError::InvariantViolation(
                "insert: undefined address".to_string(),
            ));
        }
        if self.index.contains_key(&address) {
            return Err(CacheError::InvariantViolation(format!(
                "insert: address {} already in cache",
                address
            )));
        }
        if self.config.read_only {
            return Err(CacheError::InvariantViolation(format!(
                "insert: cache is read-only (address {})",
                address
            )));
        }
        let size = self.client_for(type_id).image_len(address, &payload);
        if size == 0 {
            return Err(CacheError::InvariantViolation(format!(
                "insert: zero length entry at address {}",
                address
            )));
        }

        self.maybe_flash_increase(size)?;
        if self.config.evictions_enabled && self.index_size + size > self.max_cache_size {
            self.make_space(size)?;
            self.resizer.cache_full = true;
        }

        let mut entry = Entry::new(address, type_id, flags.ring, payload);
        entry.size = size;
        entry.is_dirty = true;
        entry.in_write_set = true;
        entry.pinned_from_client = flags.pin;
        entry.flush_me_last = flags.flush_last;
        entry.last_access_epoch = self.resizer.epoch;
        self.index_insert(entry);
        self.place_unprotected(address);
        if flags.pin {
            self.counters.pins += 1;
        }
        self.counters.insertions += 1;
        self.notify(type_id, NotifyAction::AfterInsert, address)?;
        debug!("Inserted entry {} ({} bytes, type {})", address, size, type_id);

        self.coord_log_inserted(address, size)?;
        self.maybe_run_sync_point()?;
        Ok(())
    }

    /// Protect a cached entry and return its payload
    pub fn protect(&mut self, address: Address, mode: ProtectMode) -> Result<Bytes> {
        self.load_pending_image()?;
        if !self.index.contains_key(&address) {
            return Err(CacheError::InvariantViolation(format!(
                "protect: address {} not in cache",
                address
            )));
        }
        self.protect_existing(address, mode)
    }

    /// Protect an entry, reading it from storage on a miss
    pub fn protect_or_load(
        &mut self,
        address: Address,
        type_id: u8,
        len: u64,
        ring: Ring,
        mode: ProtectMode,
    ) -> Result<Bytes> {
        self.load_pending_image()?;
        if self.index.contains_key(&address) {
            let entry_type = self.entry(address, "protect")?.type_id;
            if entry_type != type_id {
                return Err(CacheError::InvariantViolation(format!(
                    "protect: entry {} has type {}, expected {}",
                    address, entry_type, type_id
                )));
            }
            return self.protect_existing(address, mode);
        }
        if address == UNDEFINED_ADDRESS || len == 0 {
            return Err(CacheError::InvariantViolation(format!(
                "protect: cannot load {} bytes at address {}",
                len, address
            )));
        }

        let image = self.storage.read(address, len)?;
        let payload = self.client_for(type_id).deserialize(address, &image)?;

        self.maybe_flash_increase(len)?;
        if self.config.evictions_enabled && self.index_size + len > self.max_cache_size {
            self.make_space(len)?;
            self.resizer.cache_full = true;
        }

        let mut entry = Entry::new(address, type_id, ring, payload.clone());
        entry.size = len;
        entry.image_up_to_date = true;
        entry.is_protected = true;
        entry.is_read_only = mode == ProtectMode::ReadOnly;
        entry.ro_ref_count = u32::from(mode == ProtectMode::ReadOnly);
        entry.last_access_epoch = self.resizer.epoch;
        entry.accesses = 1;
        self.index_insert(entry);
        self.protected.insert(address);
        self.protected_size += len;

        self.counters.misses += 1;
        self.counters.loads += 1;
        self.notify(type_id, NotifyAction::AfterLoad, address)?;
        debug!("Loaded entry {} ({} bytes) on miss", address, len);

        self.resizer.record_access(false);
        self.after_access()?;
        Ok(payload)
    }

    fn protect_existing(&mut self, address: Address, mode: ProtectMode) -> Result<Bytes> {
        let entry = self.entry(address, "protect")?;
        if entry.is_protected {
            if mode == ProtectMode::ReadOnly && entry.is_read_only {
                let entry = self.entry_mut(address, "protect")?;
                entry.ro_ref_count += 1;
                entry.accesses += 1;
                let payload = entry.payload.clone();
                self.counters.hits += 1;
                self.resizer.record_access(true);
                self.after_access()?;
                return Ok(payload);
            }
            return Err(CacheError::InvariantViolation(format!(
                "protect: entry {} is already protected",
                address
            )));
        }
        if entry.prefetched {
            self.hydrate_prefetched(address)?;
        }

        self.remove_from_replacement_lists(address);
        let epoch = self.resizer.epoch;
        let entry = self.entry_mut(address, "protect")?;
        entry.is_protected = true;
        entry.is_read_only = mode == ProtectMode::ReadOnly;
        entry.ro_ref_count = u32::from(mode == ProtectMode::ReadOnly);
        entry.last_access_epoch = epoch;
        entry.accesses += 1;
        let size = entry.size;
        let payload = entry.payload.clone();
        self.protected.insert(address);
        self.protected_size += size;

        self.counters.hits += 1;
        self.resizer.record_access(true);
        self.after_access()?;
        Ok(payload)
    }

    /// Replace a placeholder's image with content rebuilt by its client
    fn hydrate_prefetched(&mut self, address: Address) -> Result<()> {
        let (type_id, image) = {
            let entry = self.entry(address, "hydrate")?;
            (entry.type_id, entry.payload.clone())
        };
        let payload = self.client_for(type_id).deserialize(address, &image)?;
        let entry = self.entry_mut(address, "hydrate")?;
        entry.payload = payload;
        entry.prefetched = false;
        entry.age = 0;
        entry.image_up_to_date = !entry.is_dirty;
        debug!("Hydrated prefetched entry {}", address);
        Ok(())
    }

    fn after_access(&mut self) -> Result<()> {
        if self.resizer.epoch_complete() {
            self.auto_adjust()?;
        }
        Ok(())
    }

    /// Replace the payload of a write-protected entry. Marks it dirty and resizes it if needed.
    pub fn update_payload(&mut self, address: Address, payload: Bytes) -> Result<()> {
        let entry = self.entry(address, "update payload")?;
        if !entry.is_protected || entry.is_read_only {
            return Err(CacheError::InvariantViolation(format!(
                "update payload: entry {} is not protected for write",
                address
            )));
        }
        let new_size = payload.len() as u64;
        if new_size != entry.size {
            self.resize_entry(address, new_size)?;
        }
        self.entry_mut(address, "update payload")?.payload = payload;
        let was_clean = self.set_dirty(address)?;
        if was_clean {
            let size = self.entry(address, "update payload")?.size;
            self.coord_log_dirtied(address, size)?;
        }
        Ok(())
    }

    /// Release a protected entry
    pub fn unprotect(&mut self, address: Address, flags: UnprotectFlags) -> Result<()> {
        let entry = self.entry(address, "unprotect")?;
        if !entry.is_protected {
            return Err(CacheError::InvariantViolation(format!(
                "unprotect: entry {} is not protected",
                address
            )));
        }
        if flags.pin && flags.unpin {
            return Err(CacheError::InvariantViolation(format!(
                "unprotect: both pin and unpin requested for entry {}",
                address
            )));
        }
        if entry.is_read_only {
            if flags.dirtied || flags.delete || flags.pin || flags.unpin {
                return Err(CacheError::InvariantViolation(format!(
                    "unprotect: read-only entry {} cannot be modified",
                    address
                )));
            }
            if entry.ro_ref_count > 1 {
                self.entry_mut(address, "unprotect")?.ro_ref_count -= 1;
                return Ok(());
            }
        }
        if flags.unpin && !entry.pinned_from_client {
            return Err(CacheError::InvariantViolation(format!(
                "unprotect: entry {} is not pinned",
                address
            )));
        }
        if flags.pin && entry.pinned_from_client {
            return Err(CacheError::InvariantViolation(format!(
                "unprotect: entry {} is already pinned",
                address
            )));
        }
        if flags.delete && flags.pin {
            return Err(CacheError::InvariantViolation(format!(
                "unprotect: cannot pin deleted entry {}",
                address
            )));
        }

        let dirtied_now = if flags.dirtied {
            self.set_dirty(address)?
        } else {
            false
        };

        let entry = self.entry_mut(address, "unprotect")?;
        if flags.pin {
            entry.pinned_from_client = true;
        }
        if flags.unpin {
            entry.pinned_from_client = false;
        }
        entry.is_protected = false;
        entry.is_read_only = false;
        entry.ro_ref_count = 0;
        let size = entry.size;
        self.protected.remove(&address);
        self.protected_size -= size;
        if flags.pin {
            self.counters.pins += 1;
        }
        if flags.unpin {
            self.counters.unpins += 1;
        }

        if flags.delete {
            return self.delete_entry(address, flags.free_space || flags.take_ownership);
        }

        self.place_unprotected(address);
        if dirtied_now {
            self.coord_log_dirtied(address, size)?;
            self.maybe_run_sync_point()?;
        }
        Ok(())
    }

    /// Discard an entry without writing it
    fn delete_entry(&mut self, address: Address, free_space: bool) -> Result<()> {
        let entry = self.entry(address, "delete")?;
        if entry.is_pinned() {
            return Err(CacheError::InvariantViolation(format!(
                "delete: entry {} is pinned",
                address
            )));
        }
        if entry.flush_dep_nchildren > 0 {
            return Err(CacheError::InvariantViolation(format!(
                "delete: entry {} is a flush-dependency parent",
                address
            )));
        }
        if self.set_clean(address)? {
            self.counters.clears += 1;
        }
        let entry = self.index_remove(address)?;
        self.coord_log_deleted(address)?;
        if free_space && !self.config.read_only {
            self.storage.free(address, entry.size)?;
        }
        debug!("Deleted entry {}", address);
        Ok(())
    }

    /// Mark a protected or pinned entry dirty
    pub fn mark_entry_dirty(&mut self, address: Address) -> Result<()> {
        let entry = self.entry(address, "mark dirty")?;
        if !entry.is_protected && !entry.is_pinned() {
            return Err(CacheError::InvariantViolation(format!(
                "mark dirty: entry {} is neither protected nor pinned",
                address
            )));
        }
        if entry.is_read_only {
            return Err(CacheError::InvariantViolation(format!(
                "mark dirty: entry {} is protected read-only",
                address
            )));
        }
        let protected = entry.is_protected;
        let size = entry.size;
        if self.set_dirty(address)? {
            self.coord_log_dirtied(address, size)?;
            if !protected {
                self.maybe_run_sync_point()?;
            }
        }
        Ok(())
    }

    /// Mark a protected or pinned entry clean without writing it
    pub fn mark_entry_clean(&mut self, address: Address) -> Result<()> {
        let entry = self.entry(address, "mark clean")?;
        if !entry.is_protected && !entry.is_pinned() {
            return Err(CacheError::InvariantViolation(format!(
                "mark clean: entry {} is neither protected nor pinned",
                address
            )));
        }
        let size = entry.size;
        if self.set_clean(address)? {
            self.counters.clears += 1;
            self.coord_log_cleaned(address, size)?;
        }
        Ok(())
    }

    /// Set the flush marker used by marked-only flushes
    pub fn mark_for_flush(&mut self, address: Address) -> Result<()> {
        self.entry_mut(address, "mark for flush")?.flush_marker = true;
        Ok(())
    }

    /// Relocate an entry. The entry becomes dirty at its new address.
    pub fn move_entry(&mut self, old_address: Address, new_address: Address) -> Result<()> {
        self.load_pending_image()?;
        if new_address == UNDEFINED_ADDRESS {
            return Err(CacheError::InvariantViolation(
                "move: undefined target address".to_string(),
            ));
        }
        if old_address == new_address {
            return Ok(());
        }
        if self.index.contains_key(&new_address) {
            return Err(CacheError::InvariantViolation(format!(
                "move: target address {} already in cache",
                new_address
            )));
        }
        let entry = self.entry(old_address, "move")?;
        if entry.is_read_only {
            return Err(CacheError::InvariantViolation(format!(
                "move: entry {} is protected read-only",
                old_address
            )));
        }
        let was_dirty = entry.is_dirty;
        let size = entry.size;

        let mut entry = self.index.remove(&old_address).ok_or_else(|| {
            CacheError::InvariantViolation(format!("move: address {} not in cache", old_address))
        })?;
        entry.address = new_address;
        self.index.insert(new_address, entry);

        self.lru.rekey(old_address, new_address);
        self.clean_lru.rekey(old_address, new_address);
        self.dirty_lru.rekey(old_address, new_address);
        self.pinned.rekey(old_address, new_address);
        if self.protected.remove(&old_address) {
            self.protected.insert(new_address);
        }
        if self.dirty_set.remove(&old_address) {
            self.dirty_set.insert(new_address);
        }
        self.rekey_flush_dependencies(old_address, new_address);

        self.set_dirty(new_address)?;
        self.counters.moves += 1;
        debug!("Moved entry {} -> {}", old_address, new_address);

        self.coord_log_moved(old_address, new_address, was_dirty, size)?;
        self.maybe_run_sync_point()?;
        Ok(())
    }

    /// Change the accounted size of a protected or pinned entry
    pub fn resize_entry(&mut self, address: Address, new_size: u64) -> Result<()> {
        if new_size == 0 {
            return Err(CacheError::InvariantViolation(format!(
                "resize: zero size for entry {}",
                address
            )));
        }
        let entry = self.entry(address, "resize")?;
        if !entry.is_protected && !entry.is_pinned() {
            return Err(CacheError::InvariantViolation(format!(
                "resize: entry {} is neither protected nor pinned",
                address
            )));
        }
        let old_size = entry.size;
        if old_size == new_size {
            return Ok(());
        }
        let (was_dirty, protected) = (entry.is_dirty, entry.is_protected);

        if new_size > old_size {
            self.maybe_flash_increase(new_size - old_size)?;
        }

        self.index_size = self.index_size - old_size + new_size;
        if was_dirty {
            self.dirty_index_size = self.dirty_index_size - old_size + new_size;
            self.dirty_set_size = self.dirty_set_size - old_size + new_size;
        } else {
            self.clean_index_size = self.clean_index_size - old_size + new_size;
        }
        if protected {
            self.protected_size = self.protected_size - old_size + new_size;
        }
        self.pinned.update_size(address, new_size);
        self.lru.update_size(address, new_size);
        self.clean_lru.update_size(address, new_size);
        self.dirty_lru.update_size(address, new_size);
        self.entry_mut(address, "resize")?.size = new_size;
        self.counters.size_changes += 1;

        if self.set_dirty(address)? {
            self.coord_log_dirtied(address, new_size)?;
        }
        debug!("Resized entry {}: {} -> {}", address, old_size, new_size);

        if self.config.evictions_enabled && self.index_size > self.max_cache_size {
            self.make_space(0)?;
        }
        Ok(())
    }

    /// Pin an entry that is currently protected
    pub fn pin_protected_entry(&mut self, address: Address) -> Result<()> {
        let entry = self.entry_mut(address, "pin")?;
        if !entry.is_protected {
            return Err(CacheError::InvariantViolation(format!(
                "pin: entry {} is not protected",
                address
            )));
        }
        if entry.pinned_from_client {
            return Err(CacheError::InvariantViolation(format!(
                "pin: entry {} is already pinned",
                address
            )));
        }
        entry.pinned_from_client = true;
        self.counters.pins += 1;
        Ok(())
    }

    /// Release a client pin
    pub fn unpin_entry(&mut self, address: Address) -> Result<()> {
        let entry = self.entry_mut(address, "unpin")?;
        if !entry.pinned_from_client {
            return Err(CacheError::InvariantViolation(format!(
                "unpin: entry {} is not pinned",
                address
            )));
        }
        entry.pinned_from_client = false;
        self.counters.unpins += 1;
        self.update_pin_placement(address);
        Ok(())
    }

    /// Remove an unprotected, unpinned entry without writing it
    pub fn expunge_entry(&mut self, address: Address, free_space: bool) -> Result<()> {
        self.load_pending_image()?;
        let entry = self.entry(address, "expunge")?;
        if entry.is_protected {
            return Err(CacheError::InvariantViolation(format!(
                "expunge: entry {} is protected",
                address
            )));
        }
        self.delete_entry(address, free_space)?;
        self.counters.expunges += 1;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Flushing
    // ---------------------------------------------------------------------

    /// Write (or clear) one entry. Dirty flush-dependency children must be clean first.
    pub(crate) fn flush_single_entry(&mut self, address: Address, clear_only: bool) -> Result<()> {
        let entry = self.entry(address, "flush")?;
        if entry.is_protected {
            return Err(CacheError::InvariantViolation(format!(
                "flush: entry {} is protected",
                address
            )));
        }
        if !entry.is_dirty {
            return Ok(());
        }
        if !clear_only && entry.flush_dep_ndirty_children > 0 {
            return Err(CacheError::DependencyOrder(format!(
                "Entry {} has {} dirty flush-dependency children",
                address, entry.flush_dep_ndirty_children
            )));
        }

        if clear_only {
            self.set_clean(address)?;
            self.counters.clears += 1;
            self.coord_log_flushed(address, true, true)?;
            return Ok(());
        }

        if !self.write_permitted() {
            return Err(CacheError::InvariantViolation(format!(
                "flush: writes are not permitted (entry {})",
                address
            )));
        }
        let (type_id, size, payload) = (entry.type_id, entry.size, entry.payload.clone());
        let image = if entry.prefetched {
            payload
        } else {
            self.client_for(type_id).serialize(address, size, &payload)?
        };
        if image.len() as u64 != size {
            return Err(CacheError::InvariantViolation(format!(
                "flush: client produced {} bytes for entry {} of size {}",
                image.len(),
                address,
                size
            )));
        }
        self.storage.write(address, &image)?;

        self.entry_mut(address, "flush")?.image_up_to_date = true;
        self.set_clean(address)?;
        self.touch_lru(address);
        self.counters.writes += 1;
        self.notify(type_id, NotifyAction::AfterFlush, address)?;
        self.coord_write_done(address);
        self.coord_log_flushed(address, true, false)?;
        debug!("Flushed entry {} ({} bytes)", address, size);
        Ok(())
    }

    /// Flush a single entry
    pub fn flush_entry(&mut self, address: Address) -> Result<()> {
        self.flush_single_entry(address, false)
    }

    /// Flush the cache ring by ring
    pub fn flush(&mut self, flags: FlushFlags) -> Result<()> {
        self.load_pending_image()?;
        if self.is_coordinated() && !flags.clear_only {
            self.flush_coordinated()?;
        }
        if !flags.ignore_protected && !self.protected.is_empty() {
            return Err(CacheError::InvariantViolation(format!(
                "flush: cache has {} protected entries",
                self.protected.len()
            )));
        }
        if flags.invalidate {
            return self.flush_invalidate(flags);
        }
        for ring in Ring::ALL {
            self.flush_ring(ring, flags)?;
        }
        info!(
            "Cache flushed ({} dirty entries remain)",
            self.dirty_set.len()
        );
        Ok(())
    }

    fn flush_eligible(&self, entry: &Entry, ring: Ring, flags: FlushFlags) -> bool {
        entry.ring == ring
            && entry.is_dirty
            && !entry.is_protected
            && (!flags.marked_only || entry.flush_marker)
    }

    /// Flush every eligible dirty entry of one ring, children before parents
    pub(crate) fn flush_ring(&mut self, ring: Ring, flags: FlushFlags) -> Result<()> {
        loop {
            let eligible: Vec<&Entry> = self
                .dirty_set
                .iter()
                .filter_map(|a| self.index.get(a))
                .filter(|e| self.flush_eligible(e, ring, flags))
                .collect();
            // flush-me-last entries go once nothing else in the ring is dirty
            let last_only = eligible.iter().all(|e| e.flush_me_last);
            let ready: Vec<Address> = eligible
                .into_iter()
                .filter(|e| !e.flush_me_last || last_only)
                .filter(|e| e.flush_dep_ndirty_children == 0)
                .map(|e| e.address)
                .collect();
            if ready.is_empty() {
                break;
            }
            for address in ready {
                let still_ready = self
                    .index
                    .get(&address)
                    .map(|e| {
                        self.flush_eligible(e, ring, flags) && e.flush_dep_ndirty_children == 0
                    })
                    .unwrap_or(false);
                if still_ready {
                    self.flush_single_entry(address, flags.clear_only)?;
                }
            }
        }

        let blocked: Vec<Address> = self
            .dirty_set
            .iter()
            .filter_map(|a| self.index.get(a))
            .filter(|e| self.flush_eligible(e, ring, flags))
            .map(|e| e.address)
            .collect();
        if !blocked.is_empty() && !flags.ignore_protected {
            return Err(CacheError::DependencyOrder(format!(
                "Ring {:?}: entries {:?} cannot be flushed before their dirty children",
                ring, blocked
            )));
        }
        Ok(())
    }

    /// Flush and evict everything, ring by ring
    fn flush_invalidate(&mut self, flags: FlushFlags) -> Result<()> {
        let flush_flags = FlushFlags {
            invalidate: false,
            marked_only: false,
            ..flags
        };
        for ring in Ring::ALL {
            loop {
                self.flush_ring(ring, flush_flags)?;
                let evictable: Vec<Address> = self
                    .index
                    .values()
                    .filter(|e| {
                        e.ring == ring
                            && !e.is_protected
                            && !e.is_dirty
                            && !e.pinned_from_client
                            && e.flush_dep_nchildren == 0
                    })
                    .map(|e| e.address)
                    .collect();
                if evictable.is_empty() {
                    break;
                }
                for address in evictable {
                    let type_id = self.entry(address, "invalidate")?.type_id;
                    self.notify(type_id, NotifyAction::BeforeEvict, address)?;
                    self.index_remove(address)?;
                    self.counters.evictions += 1;
                }
            }
            let remaining: Vec<Address> = self
                .index
                .values()
                .filter(|e| e.ring == ring && !e.is_protected)
                .map(|e| e.address)
                .collect();
            if !remaining.is_empty() {
                return Err(CacheError::InvariantViolation(format!(
                    "invalidate: pinned entries {:?} remain in ring {:?}",
                    remaining, ring
                )));
            }
        }
        info!("Cache flushed and invalidated");
        Ok(())
    }

    /// Flush dirty entries (if writes are permitted) and evict everything not pinned or protected
    pub fn evict(&mut self) -> Result<usize> {
        self.load_pending_image()?;
        if self.write_permitted() {
            self.flush(FlushFlags {
                ignore_protected: true,
                ..FlushFlags::default()
            })?;
        }
        let mut evicted = 0;
        loop {
            let victims: Vec<Address> = self
                .index
                .values()
                .filter(|e| e.is_evictable() && !e.is_dirty && e.flush_dep_nchildren == 0)
                .map(|e| e.address)
                .collect();
            if victims.is_empty() {
                break;
            }
            for address in victims {
                self.evict_entry(address)?;
                evicted += 1;
            }
        }
        info!("Evicted {} entries", evicted);
        Ok(evicted)
    }

    /// Evict until the cache is within its maximum size, flushing dirty tail entries when permitted
    pub fn evict_to_budget(&mut self) -> Result<()> {
        self.make_space(0)
    }

    /// Flush dirty LRU entries until the minimum clean size is reached
    pub fn flush_to_min_clean(&mut self) -> Result<()> {
        if !self.write_permitted() {
            return Ok(());
        }
        self.make_space(0)
    }

    /// Make room for `space_needed` bytes, and in passing bring the clean size up to its minimum
    pub(crate) fn make_space(&mut self, space_needed: u64) -> Result<()> {
        if self.make_space_in_progress || !self.config.evictions_enabled {
            return Ok(());
        }
        self.make_space_in_progress = true;
        let result = if self.write_permitted() {
            self.make_space_writing(space_needed)
        } else {
            self.make_space_clean_only(space_needed)
        };
        self.make_space_in_progress = false;
        result
    }

    fn empty_space(&self) -> u64 {
        self.max_cache_size.saturating_sub(self.index_size)
    }

    fn make_space_writing(&mut self, space_needed: u64) -> Result<()> {
        let initial_len = self.lru.len();
        let mut examined = 0;
        let mut cursor = self.lru.tail();
        while let Some(address) = cursor {
            let over_budget = self.index_size + space_needed > self.max_cache_size;
            let short_of_clean = self.empty_space() + self.clean_index_size < self.min_clean_size;
            if !(over_budget || short_of_clean) || examined > 2 * initial_len {
                break;
            }
            let prev = self.lru.prev_of(address);
            let (dirty, prefetched_dirty) = match self.index.get(&address) {
                Some(e) => (e.is_dirty, e.prefetched_dirty),
                None => break,
            };
            if !prefetched_dirty {
                if dirty {
                    self.flush_single_entry(address, false)?;
                } else if over_budget {
                    self.evict_entry(address)?;
                }
            }
            cursor = prev;
            examined += 1;
        }
        Ok(())
    }

    fn make_space_clean_only(&mut self, space_needed: u64) -> Result<()> {
        let initial_len = self.clean_lru.len();
        let mut examined = 0;
        let mut cursor = self.clean_lru.tail();
        while let Some(address) = cursor {
            if self.index_size + space_needed <= self.max_cache_size || examined > initial_len {
                break;
            }
            let prev = self.clean_lru.prev_of(address);
            let prefetched_dirty = self
                .index
                .get(&address)
                .map(|e| e.prefetched_dirty)
                .unwrap_or(true);
            if !prefetched_dirty {
                self.evict_entry(address)?;
            }
            cursor = prev;
            examined += 1;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Adaptive resize
    // ---------------------------------------------------------------------

    fn maybe_flash_increase(&mut self, space_needed: u64) -> Result<()> {
        if let Some(new_max) =
            self.resizer
                .plan_flash_increase(space_needed, self.index_size, self.max_cache_size)
        {
            let hit_rate = self.resizer.hit_rate();
            self.apply_new_max(hit_rate, ResizeStatus::FlashIncrease, new_max);
            self.counters.flash_increases += 1;
            self.resizer.reset_hit_rate_stats();
        }
        Ok(())
    }

    fn apply_new_max(&mut self, hit_rate: f64, status: ResizeStatus, new_max: u64) {
        let old_max = self.max_cache_size;
        let old_min_clean = self.min_clean_size;
        let changed = matches!(
            status,
            ResizeStatus::Increase | ResizeStatus::FlashIncrease | ResizeStatus::Decrease
        );
        if changed {
            self.max_cache_size = new_max;
            self.min_clean_size = self.resizer.config.min_clean_for(new_max);
            self.resizer.on_new_max(new_max, status);
            self.counters.resizes += 1;
            info!(
                "Cache resized ({:?}): hit_rate={:.4} max {} -> {}, min_clean {} -> {}",
                status, hit_rate, old_max, new_max, old_min_clean, self.min_clean_size
            );
        } else {
            debug!("Auto-resize: {:?} at hit rate {:.4}", status, hit_rate);
        }
        if let Some(observer) = &self.resize_observer {
            observer.on_resize(&ResizeReport {
                hit_rate,
                status,
                old_max_size: old_max,
                new_max_size: if changed { new_max } else { old_max },
                old_min_clean_size: old_min_clean,
                new_min_clean_size: self.min_clean_size,
            });
        }
    }

    /// End-of-epoch resize decision
    pub(crate) fn auto_adjust(&mut self) -> Result<()> {
        if self.resize_in_progress {
            return Ok(());
        }
        self.resize_in_progress = true;
        let result = self.auto_adjust_inner();
        self.resize_in_progress = false;
        result
    }

    fn auto_adjust_inner(&mut self) -> Result<()> {
        let hit_rate = self.resizer.hit_rate();
        let max = self.max_cache_size;
        let (mut status, mut new_max) = self.resizer.plan_increase(hit_rate, max);

        if status == ResizeStatus::InSpec {
            match self.resizer.config.decr_mode {
                DecrMode::Off => {}
                DecrMode::Threshold => {
                    (status, new_max) = self.resizer.plan_threshold_decrease(hit_rate, max);
                }
                DecrMode::AgeOut | DecrMode::AgeOutWithThreshold => {
                    if self.resizer.age_out_ready() {
                        if self.resizer.age_out_applies(hit_rate, max) {
                            self.evict_aged_out_entries()?;
                        }
                        (status, new_max) =
                            self.resizer
                                .plan_age_out_decrease(hit_rate, self.index_size, max);
                    }
                }
            }
        }

        self.resizer.epoch += 1;
        self.apply_new_max(hit_rate, status, new_max);
        self.resizer.reset_hit_rate_stats();
        if status == ResizeStatus::Decrease && self.index_size > self.max_cache_size {
            self.make_space(0)?;
        }
        Ok(())
    }

    /// Evict LRU entries untouched for `epochs_before_eviction` epochs
    fn evict_aged_out_entries(&mut self) -> Result<()> {
        let horizon = self.resizer.config.epochs_before_eviction as u64;
        let epoch = self.resizer.epoch;
        let write_permitted = self.write_permitted();
        let candidates: Vec<Address> = self.lru.iter_from_tail().collect();
        let mut evicted = 0;
        for address in candidates {
            let (dirty, prefetched_dirty, last) = match self.index.get(&address) {
                Some(e) => (e.is_dirty, e.prefetched_dirty, e.last_access_epoch),
                None => continue,
            };
            if prefetched_dirty || last + horizon > epoch {
                continue;
            }
            if dirty {
                if !write_permitted {
                    continue;
                }
                self.flush_single_entry(address, false)?;
            }
            self.evict_entry(address)?;
            evicted += 1;
        }
        if evicted > 0 {
            debug!("Age-out evicted {} entries at epoch {}", evicted, epoch);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Consistency
    // ---------------------------------------------------------------------

    /// Recompute all size accounting and list membership and compare with the tracked values
    pub fn validate_consistency(&self) -> Result<()> {
        let mut index_size = 0;
        let mut clean = 0;
        let mut dirty = 0;
        let mut dirty_children: HashMap<Address, usize> = HashMap::new();
        let mut children: HashMap<Address, usize> = HashMap::new();

        for (address, entry) in &self.index {
            if *address != entry.address {
                return Err(CacheError::InvariantViolation(format!(
                    "Index key {} does not match entry address {}",
                    address, entry.address
                )));
            }
            index_size += entry.size;
            if entry.is_dirty {
                dirty += entry.size;
                if !self.dirty_set.contains(address) {
                    return Err(CacheError::InvariantViolation(format!(
                        "Dirty entry {} missing from dirty set",
                        address
                    )));
                }
            } else {
                clean += entry.size;
            }

            let on_lru = self.lru.contains(*address);
            let on_pinned = self.pinned.contains(*address);
            if entry.is_protected {
                if on_lru || on_pinned || !self.protected.contains(address) {
                    return Err(CacheError::InvariantViolation(format!(
                        "Protected entry {} has wrong list membership",
                        address
                    )));
                }
            } else if entry.is_pinned() {
                if on_lru || !on_pinned {
                    return Err(CacheError::InvariantViolation(format!(
                        "Pinned entry {} has wrong list membership",
                        address
                    )));
                }
            } else {
                let sub_ok = if entry.is_dirty {
                    self.dirty_lru.contains(*address) && !self.clean_lru.contains(*address)
                } else {
                    self.clean_lru.contains(*address) && !self.dirty_lru.contains(*address)
                };
                if !on_lru || on_pinned || !sub_ok {
                    return Err(CacheError::InvariantViolation(format!(
                        "Unpinned entry {} has wrong list membership",
                        address
                    )));
                }
            }

            for parent in &entry.flush_dep_parents {
                *children.entry(*parent).or_default() += 1;
                if entry.is_dirty {
                    *dirty_children.entry(*parent).or_default() += 1;
                }
            }
        }

        for (address, entry) in &self.index {
            let expected_children = children.get(address).copied().unwrap_or(0);
            let expected_dirty = dirty_children.get(address).copied().unwrap_or(0);
            if entry.flush_dep_nchildren != expected_children
                || entry.flush_dep_ndirty_children != expected_dirty
            {
                return Err(CacheError::InvariantViolation(format!(
                    "Entry {} child counts {}/{} do not match graph {}/{}",
                    address,
                    entry.flush_dep_nchildren,
                    entry.flush_dep_ndirty_children,
                    expected_children,
                    expected_dirty
                )));
            }
            if entry.flush_dep_ndirty_children > entry.flush_dep_nchildren {
                return Err(CacheError::InvariantViolation(format!(
                    "Entry {} has more dirty children than children",
                    address
                )));
            }
        }

        if index_size != self.index_size
            || clean != self.clean_index_size
            || dirty != self.dirty_index_size
            || dirty != self.dirty_set_size
        {
            return Err(CacheError::InvariantViolation(format!(
                "Size mismatch: index {}/{} clean {}/{} dirty {}/{} dirty set {}",
                index_size,
                self.index_size,
                clean,
                self.clean_index_size,
                dirty,
                self.dirty_index_size,
                self.dirty_set_size
            )));
        }
        if self.dirty_set.len() != self.index.values().filter(|e| e.is_dirty).count() {
            return Err(CacheError::InvariantViolation(
                "Dirty set contains clean or missing entries".to_string(),
            ));
        }
        if self.lru.len() != self.clean_lru.len() + self.dirty_lru.len()
            || self.lru.size() != self.clean_lru.size() + self.dirty_lru.size()
        {
            return Err(CacheError::InvariantViolation(
                "Clean and dirty LRU lists do not partition the LRU".to_string(),
            ));
        }
        let protected_size: u64 = self
            .protected
            .iter()
            .filter_map(|a| self.index.get(a))
            .map(|e| e.size)
            .sum();
        if protected_size != self.protected_size {
            return Err(CacheError::InvariantViolation(format!(
                "Protected size mismatch: calculated {} vs tracked {}",
                protected_size, self.protected_size
            )));
        }
        Ok(())
    }

    /// Drop everything without writing. Used when tearing down a read-only or imaged cache.
    pub(crate) fn discard_all(&mut self) {
        if !self.index.is_empty() {
            warn!("Discarding {} cache entries", self.index.len());
        }
        self.index.clear();
        self.lru.clear();
        self.clean_lru.clear();
        self.dirty_lru.clear();
        self.pinned.clear();
        self.protected.clear();
        self.protected_size = 0;
        self.dirty_set.clear();
        self.dirty_set_size = 0;
        self.index_size = 0;
        self.clean_index_size = 0;
        self.dirty_index_size = 0;
    }
}
