//! Cache Image Module
//!
//! Snapshot of a cache at close written as one checksummed block, and lazy
//! reconstruction of that snapshot as placeholder entries on the next access
//! after reopen.
//!
//! Block layout, little-endian:
//!
//! ```text
//! header   "MDCI" | version u8 | flags u8 | block length u64 | entry count u32
//! entry    type u8 | flags u8 | ring u8 | age u8 | children u16 | dirty children u16
//!          | parents u16 | lru rank i32 | address u64 | size u64
//!          | parent address u64 * parents | payload [size]
//! trailer  CRC-32 of everything before it, u32
//! ```

use crate::cache::MetadataCache;
use crate::coordination::SyncPointOp;
use crate::entry::{Address, Entry, FlushFlags, Ring, UNDEFINED_ADDRESS};
use crate::{CacheError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

pub const IMAGE_SIGNATURE: &[u8; 4] = b"MDCI";
pub const IMAGE_VERSION: u8 = 0;
/// Header flag reserved for a serialized resize status; never accepted
pub const HEADER_FLAG_RESIZE_STATUS: u8 = 0x01;

pub const ENTRY_FLAG_DIRTY: u8 = 0x01;
pub const ENTRY_FLAG_IN_LRU: u8 = 0x02;
pub const ENTRY_FLAG_FD_PARENT: u8 = 0x04;
pub const ENTRY_FLAG_FD_CHILD: u8 = 0x08;
const ENTRY_FLAGS_KNOWN: u8 =
    ENTRY_FLAG_DIRTY | ENTRY_FLAG_IN_LRU | ENTRY_FLAG_FD_PARENT | ENTRY_FLAG_FD_CHILD;

pub const MAX_IMAGE_AGE: u8 = 100;
/// `entry_ageout` value meaning prefetched entries never age out
pub const AGEOUT_NONE: i32 = -1;

const HEADER_LEN: usize = 4 + 1 + 1 + 8 + 4;
const ENTRY_FIXED_LEN: usize = 1 + 1 + 1 + 1 + 2 + 2 + 2 + 4 + 8 + 8;
const CHECKSUM_LEN: usize = 4;
pub const SIDE_MESSAGE_LEN: usize = 16;

fn default_generate_image() -> bool {
    false
}

fn default_max_ring() -> Ring {
    Ring::MetadataFsm
}

fn default_entry_ageout() -> i32 {
    AGEOUT_NONE
}

/// Image generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Write an image when the cache is closed
    #[serde(default = "default_generate_image")]
    pub generate_image: bool,
    /// Highest ring whose entries go into the image
    #[serde(default = "default_max_ring")]
    pub max_ring: Ring,
    /// Images a never-used placeholder may survive; -1 for no limit
    #[serde(default = "default_entry_ageout")]
    pub entry_ageout: i32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            generate_image: default_generate_image(),
            max_ring: default_max_ring(),
            entry_ageout: default_entry_ageout(),
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.entry_ageout != AGEOUT_NONE
            && !(0..=MAX_IMAGE_AGE as i32).contains(&self.entry_ageout)
        {
            return Err(format!(
                "entry_ageout must be -1 or within 0..={}, got {}",
                MAX_IMAGE_AGE, self.entry_ageout
            ));
        }
        Ok(())
    }
}

/// Image bookkeeping held by a cache
#[derive(Debug, Clone)]
pub(crate) struct ImageState {
    pub config: ImageConfig,
    /// Image waiting to be loaded on the next access
    pub pending: Option<SideMessage>,
    pub loaded: bool,
}

impl ImageState {
    pub fn new(config: ImageConfig) -> Self {
        Self {
            config,
            pending: None,
            loaded: false,
        }
    }
}

/// Location of the image block, recorded by the surrounding container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideMessage {
    pub address: Address,
    pub length: u64,
}

impl SideMessage {
    pub fn encode(&self) -> [u8; SIDE_MESSAGE_LEN] {
        let mut buf = [0u8; SIDE_MESSAGE_LEN];
        buf[..8].copy_from_slice(&self.address.to_le_bytes());
        buf[8..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != SIDE_MESSAGE_LEN {
            return Err(CacheError::DecodeError(format!(
                "Side message must be {} bytes, got {}",
                SIDE_MESSAGE_LEN,
                buf.len()
            )));
        }
        let mut cursor = buf;
        let address = cursor.get_u64_le();
        let length = cursor.get_u64_le();
        if address == UNDEFINED_ADDRESS || length == 0 {
            return Err(CacheError::DecodeError(format!(
                "Side message names an invalid block ({}, {} bytes)",
                address, length
            )));
        }
        Ok(Self { address, length })
    }
}

/// One entry of a cache image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEntry {
    pub address: Address,
    pub size: u64,
    pub type_id: u8,
    pub ring: Ring,
    pub age: u8,
    /// 1 is the LRU head; -1 pinned; 0 not on the LRU otherwise
    pub lru_rank: i32,
    pub is_dirty: bool,
    pub dependency_height: u32,
    pub child_count: u16,
    pub dirty_child_count: u16,
    pub parents: Vec<Address>,
    pub payload: Bytes,
}

impl ImageEntry {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.is_dirty {
            flags |= ENTRY_FLAG_DIRTY;
        }
        if self.lru_rank > 0 {
            flags |= ENTRY_FLAG_IN_LRU;
        }
        if self.child_count > 0 {
            flags |= ENTRY_FLAG_FD_PARENT;
        }
        if !self.parents.is_empty() {
            flags |= ENTRY_FLAG_FD_CHILD;
        }
        flags
    }
}

/// Image header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: u8,
    pub flags: u8,
    pub block_len: u64,
    pub entry_count: u32,
}

/// Decoded or about-to-be-encoded cache image, entries in load order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheImage {
    pub entries: Vec<ImageEntry>,
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(CacheError::DecodeError(format!(
            "Image truncated reading {} ({} bytes left, {} needed)",
            what,
            buf.remaining(),
            n
        )));
    }
    Ok(())
}

fn to_u16(value: usize, what: &str, address: Address) -> Result<u16> {
    u16::try_from(value).map_err(|_| {
        CacheError::SerializationError(format!(
            "Entry {} has {} {}, more than an image can record",
            address, value, what
        ))
    })
}

impl CacheImage {
    /// Serialize to a single checksummed block
    pub fn encode(&self) -> Result<Bytes> {
        let body_len: usize = self
            .entries
            .iter()
            .map(|e| ENTRY_FIXED_LEN + e.parents.len() * 8 + e.payload.len())
            .sum();
        let block_len = HEADER_LEN + body_len + CHECKSUM_LEN;
        let entry_count = u32::try_from(self.entries.len()).map_err(|_| {
            CacheError::SerializationError(format!(
                "{} entries do not fit in an image",
                self.entries.len()
            ))
        })?;

        let mut buf = BytesMut::with_capacity(block_len);
        buf.put_slice(IMAGE_SIGNATURE);
        buf.put_u8(IMAGE_VERSION);
        buf.put_u8(0);
        buf.put_u64_le(block_len as u64);
        buf.put_u32_le(entry_count);

        for entry in &self.entries {
            if entry.payload.len() as u64 != entry.size {
                return Err(CacheError::SerializationError(format!(
                    "Entry {} payload is {} bytes, size says {}",
                    entry.address,
                    entry.payload.len(),
                    entry.size
                )));
            }
            buf.put_u8(entry.type_id);
            buf.put_u8(entry.flags());
            buf.put_u8(entry.ring.as_u8());
            buf.put_u8(entry.age);
            buf.put_u16_le(entry.child_count);
            buf.put_u16_le(entry.dirty_child_count);
            buf.put_u16_le(to_u16(entry.parents.len(), "parents", entry.address)?);
            buf.put_i32_le(entry.lru_rank);
            buf.put_u64_le(entry.address);
            buf.put_u64_le(entry.size);
            for parent in &entry.parents {
                buf.put_u64_le(*parent);
            }
            buf.put_slice(&entry.payload);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        Ok(buf.freeze())
    }

    pub fn decode(block: &[u8]) -> Result<CacheImage> {
        Self::decode_with_header(block).map(|(_, image)| image)
    }

    /// Validate and parse a block. Nothing partial is ever returned.
    pub fn decode_with_header(block: &[u8]) -> Result<(ImageHeader, CacheImage)> {
        if block.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(CacheError::DecodeError(format!(
                "Image block of {} bytes is shorter than header and checksum",
                block.len()
            )));
        }
        if &block[..4] != IMAGE_SIGNATURE {
            return Err(CacheError::DecodeError("Bad image signature".to_string()));
        }

        let (body, trailer) = block.split_at(block.len() - CHECKSUM_LEN);
        let mut cursor = &body[4..];
        let version = cursor.get_u8();
        if version != IMAGE_VERSION {
            return Err(CacheError::DecodeError(format!(
                "Unsupported image version {}",
                version
            )));
        }
        let flags = cursor.get_u8();
        if flags & HEADER_FLAG_RESIZE_STATUS != 0 {
            return Err(CacheError::DecodeError(
                "Images carrying a resize status are not supported".to_string(),
            ));
        }
        if flags != 0 {
            return Err(CacheError::DecodeError(format!(
                "Unknown image header flags {:#04x}",
                flags
            )));
        }
        let block_len = cursor.get_u64_le();
        if block_len != block.len() as u64 {
            return Err(CacheError::DecodeError(format!(
                "Image declares {} bytes but block has {}",
                block_len,
                block.len()
            )));
        }
        let mut trailer = trailer;
        let stored = trailer.get_u32_le();
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(CacheError::DecodeError(format!(
                "Image checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }
        let entry_count = cursor.get_u32_le();
        let header = ImageHeader {
            version,
            flags,
            block_len,
            entry_count,
        };

        let mut entries: Vec<ImageEntry> = Vec::new();
        let mut rings: HashMap<Address, Ring> = HashMap::new();
        for index in 0..entry_count {
            let entry = Self::decode_entry(&mut cursor, index, &rings)?;
            rings.insert(entry.address, entry.ring);
            entries.push(entry);
        }
        if cursor.has_remaining() {
            return Err(CacheError::DecodeError(format!(
                "{} bytes of trailing data after {} entries",
                cursor.remaining(),
                entry_count
            )));
        }

        Self::check_child_counts(&entries)?;
        Self::assign_heights(&mut entries);
        Ok((header, CacheImage { entries }))
    }

    fn decode_entry(
        cursor: &mut &[u8],
        index: u32,
        defined: &HashMap<Address, Ring>,
    ) -> Result<ImageEntry> {
        need(cursor, ENTRY_FIXED_LEN, "entry header")?;
        let type_id = cursor.get_u8();
        let flags = cursor.get_u8();
        let ring_byte = cursor.get_u8();
        let age = cursor.get_u8();
        let child_count = cursor.get_u16_le();
        let dirty_child_count = cursor.get_u16_le();
        let parent_count = cursor.get_u16_le() as usize;
        let lru_rank = cursor.get_i32_le();
        let address = cursor.get_u64_le();
        let size = cursor.get_u64_le();

        if flags & !ENTRY_FLAGS_KNOWN != 0 {
            return Err(CacheError::DecodeError(format!(
                "Entry {} has unknown flags {:#04x}",
                index, flags
            )));
        }
        let ring = Ring::from_u8(ring_byte).ok_or_else(|| {
            CacheError::DecodeError(format!("Entry {} has unknown ring {}", index, ring_byte))
        })?;
        if address == UNDEFINED_ADDRESS {
            return Err(CacheError::DecodeError(format!(
                "Entry {} has an undefined address",
                index
            )));
        }
        if size == 0 {
            return Err(CacheError::DecodeError(format!(
                "Entry {} at {} has zero size",
                index, address
            )));
        }
        if defined.contains_key(&address) {
            return Err(CacheError::DecodeError(format!(
                "Address {} appears twice in the image",
                address
            )));
        }
        if age > MAX_IMAGE_AGE {
            return Err(CacheError::DecodeError(format!(
                "Entry {} has age {} above {}",
                address, age, MAX_IMAGE_AGE
            )));
        }
        if dirty_child_count > child_count {
            return Err(CacheError::DecodeError(format!(
                "Entry {} records {} dirty children of {}",
                address, dirty_child_count, child_count
            )));
        }
        let flag_checks = [
            (ENTRY_FLAG_IN_LRU, lru_rank > 0, "in-LRU"),
            (ENTRY_FLAG_FD_PARENT, child_count > 0, "parent"),
            (ENTRY_FLAG_FD_CHILD, parent_count > 0, "child"),
        ];
        for (bit, expected, name) in flag_checks {
            if (flags & bit != 0) != expected {
                return Err(CacheError::DecodeError(format!(
                    "Entry {} {} flag disagrees with its record",
                    address, name
                )));
            }
        }

        need(cursor, parent_count * 8, "parent addresses")?;
        let mut parents = Vec::with_capacity(parent_count);
        for _ in 0..parent_count {
            let parent = cursor.get_u64_le();
            let parent_ring = defined.get(&parent).copied().ok_or_else(|| {
                CacheError::DecodeError(format!(
                    "Entry {} references parent {} before it is defined",
                    address, parent
                ))
            })?;
            if parent_ring < ring {
                return Err(CacheError::DecodeError(format!(
                    "Entry {} in ring {:?} has parent {} in earlier ring {:?}",
                    address, ring, parent, parent_ring
                )));
            }
            if parents.contains(&parent) {
                return Err(CacheError::DecodeError(format!(
                    "Entry {} lists parent {} twice",
                    address, parent
                )));
            }
            parents.push(parent);
        }

        let len = usize::try_from(size).map_err(|_| {
            CacheError::DecodeError(format!("Entry {} size {} too large", address, size))
        })?;
        need(cursor, len, "entry payload")?;
        let payload = Bytes::copy_from_slice(&cursor[..len]);
        cursor.advance(len);

        Ok(ImageEntry {
            address,
            size,
            type_id,
            ring,
            age,
            lru_rank,
            is_dirty: flags & ENTRY_FLAG_DIRTY != 0,
            dependency_height: 0,
            child_count,
            dirty_child_count,
            parents,
            payload,
        })
    }

    fn check_child_counts(entries: &[ImageEntry]) -> Result<()> {
        let mut children: HashMap<Address, (u16, u16)> = HashMap::new();
        for entry in entries {
            for parent in &entry.parents {
                let counts = children.entry(*parent).or_default();
                counts.0 = counts.0.saturating_add(1);
                if entry.is_dirty {
                    counts.1 = counts.1.saturating_add(1);
                }
            }
        }
        for entry in entries {
            let (count, dirty) = children.get(&entry.address).copied().unwrap_or((0, 0));
            if count != entry.child_count || dirty != entry.dirty_child_count {
                return Err(CacheError::DecodeError(format!(
                    "Entry {} records {}/{} children but the image holds {}/{}",
                    entry.address, entry.child_count, entry.dirty_child_count, count, dirty
                )));
            }
        }
        Ok(())
    }

    /// Children always follow their parents, so one reverse pass settles every height
    fn assign_heights(entries: &mut [ImageEntry]) {
        let mut heights: HashMap<Address, u32> = HashMap::new();
        for entry in entries.iter().rev() {
            let height = heights.get(&entry.address).copied().unwrap_or(0);
            for parent in &entry.parents {
                let parent_height = heights.entry(*parent).or_insert(0);
                *parent_height = (*parent_height).max(height + 1);
            }
        }
        for entry in entries.iter_mut() {
            entry.dependency_height = heights.get(&entry.address).copied().unwrap_or(0);
        }
    }
}

impl MetadataCache {
    fn aged_out(&self, entry: &Entry) -> bool {
        let ageout = self.image.config.entry_ageout;
        ageout != AGEOUT_NONE && entry.prefetched && i32::from(entry.age) >= ageout
    }

    /// Build the image the cache would write if it were closed now
    pub fn snapshot_image(&self) -> Result<CacheImage> {
        let max_ring = self.image.config.max_ring;
        let mut selected: BTreeSet<Address> = BTreeSet::new();
        for entry in self.index.values() {
            if entry.ring > max_ring || self.aged_out(entry) {
                continue;
            }
            if entry.is_protected {
                return Err(CacheError::InvariantViolation(format!(
                    "snapshot: entry {} is protected",
                    entry.address
                )));
            }
            selected.insert(entry.address);
        }
        self.prune_image_selection(&mut selected);
        let heights = self.compute_dependency_heights(&selected);

        let lru_ranks: HashMap<Address, i32> = self
            .lru
            .iter()
            .enumerate()
            .map(|(i, a)| (a, i as i32 + 1))
            .collect();
        let mut children: HashMap<Address, (usize, usize)> = HashMap::new();
        for address in &selected {
            let entry = self.entry(*address, "snapshot")?;
            for parent in entry.flush_dep_parents.iter().filter(|p| selected.contains(p)) {
                let counts = children.entry(*parent).or_default();
                counts.0 += 1;
                if entry.is_dirty {
                    counts.1 += 1;
                }
            }
        }

        let mut entries = Vec::with_capacity(selected.len());
        for address in &selected {
            let entry = self.entry(*address, "snapshot")?;
            let payload = if entry.prefetched {
                entry.payload.clone()
            } else {
                self.client_for(entry.type_id)
                    .serialize(entry.address, entry.size, &entry.payload)?
            };
            if payload.len() as u64 != entry.size {
                return Err(CacheError::SerializationError(format!(
                    "Client produced {} bytes for entry {} of size {}",
                    payload.len(),
                    entry.address,
                    entry.size
                )));
            }
            let lru_rank = if entry.is_pinned() {
                -1
            } else {
                lru_ranks.get(address).copied().unwrap_or(0)
            };
            let age = if entry.prefetched {
                entry.age.saturating_add(1).min(MAX_IMAGE_AGE)
            } else {
                0
            };
            let (child_count, dirty_child_count) = children.get(address).copied().unwrap_or((0, 0));
            entries.push(ImageEntry {
                address: entry.address,
                size: entry.size,
                type_id: entry.type_id,
                ring: entry.ring,
                age,
                lru_rank,
                is_dirty: entry.is_dirty,
                dependency_height: heights.get(address).copied().unwrap_or(0),
                child_count: to_u16(child_count, "children", entry.address)?,
                dirty_child_count: to_u16(dirty_child_count, "dirty children", entry.address)?,
                parents: entry
                    .flush_dep_parents
                    .iter()
                    .filter(|p| selected.contains(p))
                    .copied()
                    .collect(),
                payload,
            });
        }

        entries.sort_by(|a, b| {
            b.dependency_height
                .cmp(&a.dependency_height)
                .then(a.lru_rank.cmp(&b.lru_rank))
                .then(a.address.cmp(&b.address))
        });
        Ok(CacheImage { entries })
    }

    fn is_image_writer(&self) -> bool {
        self.coordination
            .as_ref()
            .map(|c| c.rank() == 0)
            .unwrap_or(true)
    }

    fn store_image_block(&self, image: &CacheImage) -> Result<SideMessage> {
        let block = image.encode()?;
        let length = block.len() as u64;
        let address = self.storage.allocate(length)?;
        self.storage.write(address, &block)?;
        Ok(SideMessage { address, length })
    }

    /// Allocate and write the image block; every rank learns where it went
    fn write_image(&mut self, image: &CacheImage) -> Result<SideMessage> {
        let mut side_buf = if self.is_image_writer() {
            match self.store_image_block(image) {
                Ok(side) => side.encode().to_vec(),
                Err(e) => {
                    if let Some(coord) = &self.coordination {
                        coord.group().abort(&e.to_string());
                    }
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };
        if let Some(coord) = &self.coordination {
            coord.group().broadcast(&mut side_buf, 0)?;
        }
        let side = SideMessage::decode(&side_buf)?;
        self.counters.images_written += 1;
        info!(
            "Cache image written: {} entries, {} bytes at {}",
            image.entries.len(),
            side.length,
            side.address
        );
        Ok(side)
    }

    /// Flush and tear down the cache, writing an image first if configured.
    /// Returns the side message of the new image.
    pub fn close(&mut self) -> Result<Option<SideMessage>> {
        self.load_pending_image()?;
        if !self.protected.is_empty() {
            return Err(CacheError::InvariantViolation(format!(
                "close: {} entries are still protected",
                self.protected.len()
            )));
        }
        if self.config.read_only {
            self.discard_all();
            info!("Read-only cache closed");
            return Ok(None);
        }

        let side = if self.image.config.generate_image {
            if self.is_coordinated() {
                self.run_sync_point(SyncPointOp::FlushCache)?;
            }
            let image = self.snapshot_image()?;
            let side = self.write_image(&image)?;
            // imaged entries are recovered from the image, not from their home blocks
            for entry in &image.entries {
                if self.set_clean(entry.address)? {
                    self.counters.clears += 1;
                    self.coord_log_flushed(entry.address, true, true)?;
                }
            }
            Some(side)
        } else {
            None
        };

        let client_pinned: Vec<Address> = self
            .index
            .values()
            .filter(|e| e.pinned_from_client)
            .map(|e| e.address)
            .collect();
        if !client_pinned.is_empty() {
            warn!("Releasing {} client pins at close", client_pinned.len());
        }
        for address in client_pinned {
            self.entry_mut(address, "close")?.pinned_from_client = false;
            self.update_pin_placement(address);
        }

        self.flush(FlushFlags {
            invalidate: true,
            ..FlushFlags::default()
        })?;
        info!("Cache closed");
        Ok(side)
    }

    /// Arrange for an image to be loaded before the next cache access
    pub fn request_image_load(&mut self, side: SideMessage) -> Result<()> {
        if self.image.pending.is_some() || self.image.loaded {
            return Err(CacheError::InvariantViolation(
                "An image has already been requested for this cache".to_string(),
            ));
        }
        debug!(
            "Image load requested: {} bytes at {}",
            side.length, side.address
        );
        self.image.pending = Some(side);
        Ok(())
    }

    pub fn image_pending(&self) -> bool {
        self.image.pending.is_some()
    }

    fn read_image_block(&self, side: SideMessage) -> Result<Vec<u8>> {
        let read = || {
            self.storage
                .read(side.address, side.length)
                .map(|bytes| bytes.to_vec())
                .map_err(|e| {
                    CacheError::DecodeError(format!(
                        "Cannot read {} byte image at {}: {}",
                        side.length, side.address, e
                    ))
                })
        };
        let coord = match &self.coordination {
            Some(coord) => coord,
            None => return read(),
        };
        let group = coord.group();
        let mut block = if group.rank() == 0 {
            match read() {
                Ok(block) => block,
                Err(e) => {
                    group.abort(&e.to_string());
                    return Err(e);
                }
            }
        } else {
            Vec::new()
        };
        group.broadcast(&mut block, 0)?;
        Ok(block)
    }

    /// Load a requested image. Validation happens before anything is installed.
    ///
    /// The request stays pending until every entry is in place, so a failed
    /// load fails again on the next access instead of exposing home data.
    pub(crate) fn load_pending_image(&mut self) -> Result<()> {
        let side = match self.image.pending {
            Some(side) => side,
            None => return Ok(()),
        };
        let block = self.read_image_block(side)?;
        let image = CacheImage::decode(&block)?;
        for entry in &image.entries {
            if self.index.contains_key(&entry.address) {
                return Err(CacheError::DecodeError(format!(
                    "Image entry {} is already cached",
                    entry.address
                )));
            }
        }

        let read_only = self.config.read_only;
        let mut installed = Vec::with_capacity(image.entries.len());
        for image_entry in &image.entries {
            let result = self.install_image_entry(image_entry, read_only);
            if self.index.contains_key(&image_entry.address) {
                installed.push(image_entry.address);
            }
            if let Err(e) = result {
                self.roll_back_image_install(&installed);
                return Err(e);
            }
        }
        let mut installed_dirty = 0u64;
        for image_entry in image.entries.iter().filter(|e| e.is_dirty && !read_only) {
            if let Err(e) = self.coord_log_inserted(image_entry.address, image_entry.size) {
                self.roll_back_image_install(&installed);
                return Err(e);
            }
            installed_dirty += image_entry.size;
        }

        self.image.pending = None;
        self.image.loaded = true;
        self.counters.images_loaded += 1;
        info!(
            "Cache image loaded: {} entries ({} dirty bytes){}",
            installed.len(),
            installed_dirty,
            if read_only { ", read-only" } else { "" }
        );

        if !read_only && self.is_image_writer() {
            self.storage.free(side.address, side.length)?;
            debug!("Freed image block at {}", side.address);
        }
        if self.index_size >= self.max_cache_size {
            self.make_space(0)?;
        }
        Ok(())
    }

    /// Drop entries installed by a failed image load, children first.
    /// Edges are cut directly so no client hooks run during the undo.
    fn roll_back_image_install(&mut self, installed: &[Address]) {
        for address in installed.iter().rev() {
            let (parents, dirty) = match self.index.get_mut(address) {
                Some(entry) => (std::mem::take(&mut entry.flush_dep_parents), entry.is_dirty),
                None => continue,
            };
            for parent in parents {
                if let Some(parent_entry) = self.index.get_mut(&parent) {
                    parent_entry.flush_dep_nchildren =
                        parent_entry.flush_dep_nchildren.saturating_sub(1);
                    if dirty {
                        parent_entry.flush_dep_ndirty_children =
                            parent_entry.flush_dep_ndirty_children.saturating_sub(1);
                    }
                }
            }
            if let Err(e) = self.coord_log_deleted(*address) {
                warn!("Image rollback: {}", e);
            }
            if let Err(e) = self.index_remove(*address) {
                warn!("Image rollback could not drop {}: {}", address, e);
            }
        }
        warn!("Rolled back {} entries from a failed image load", installed.len());
    }

    fn install_image_entry(&mut self, image_entry: &ImageEntry, read_only: bool) -> Result<()> {
        let address = image_entry.address;
        let size = image_entry.size;
        let mut entry = Entry::new(
            address,
            image_entry.type_id,
            image_entry.ring,
            image_entry.payload.clone(),
        );
        entry.size = size;
        entry.prefetched = true;
        entry.age = image_entry.age;
        entry.dependency_height = image_entry.dependency_height;
        entry.last_access_epoch = self.resizer.epoch;
        if image_entry.is_dirty {
            if read_only {
                entry.prefetched_dirty = true;
            } else {
                entry.is_dirty = true;
                entry.in_write_set = true;
            }
        }
        entry.image_up_to_date = !entry.is_dirty;
        let is_parent = image_entry.child_count > 0;
        entry.pinned_from_cache = is_parent;
        let dirty = entry.is_dirty;
        self.index_insert(entry);

        if is_parent {
            self.pinned.push_tail(address, size);
        } else if image_entry.lru_rank > 0 {
            self.lru.push_tail(address, size);
            if dirty {
                self.dirty_lru.push_tail(address, size);
            } else {
                self.clean_lru.push_tail(address, size);
            }
        } else {
            self.lru.push_head(address, size);
            if dirty {
                self.dirty_lru.push_head(address, size);
            } else {
                self.clean_lru.push_head(address, size);
            }
        }

        for parent in &image_entry.parents {
            self.create_flush_dependency(*parent, address)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{create_test_cache, payload};
    use crate::cache::MetadataCacheConfig;
    use crate::entry::{EntryClient, InsertFlags, NotifyAction, ProtectMode, UnprotectFlags};
    use crate::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn image_entry(address: Address, parents: Vec<Address>) -> ImageEntry {
        ImageEntry {
            address,
            size: 4,
            type_id: 1,
            ring: Ring::User,
            age: 0,
            lru_rank: 0,
            is_dirty: false,
            dependency_height: 0,
            child_count: 0,
            dirty_child_count: 0,
            parents,
            payload: Bytes::from_static(b"abcd"),
        }
    }

    fn two_entry_image() -> CacheImage {
        let mut parent = image_entry(10, vec![]);
        parent.child_count = 1;
        parent.lru_rank = -1;
        let mut child = image_entry(20, vec![10]);
        child.lru_rank = 1;
        CacheImage {
            entries: vec![parent, child],
        }
    }

    #[test]
    fn test_side_message_codec() {
        let side = SideMessage {
            address: 4096,
            length: 77,
        };
        let buf = side.encode();
        assert_eq!(buf.len(), SIDE_MESSAGE_LEN);
        assert_eq!(SideMessage::decode(&buf).unwrap(), side);
        assert!(SideMessage::decode(&buf[..15]).is_err());
        let zero = SideMessage {
            address: 1,
            length: 0,
        };
        assert!(SideMessage::decode(&zero.encode()).is_err());
    }

    #[test]
    fn test_empty_image() {
        let block = CacheImage::default().encode().unwrap();
        assert_eq!(block.len(), HEADER_LEN + CHECKSUM_LEN);
        let (header, image) = CacheImage::decode_with_header(&block).unwrap();
        assert_eq!(header.entry_count, 0);
        assert_eq!(header.block_len, block.len() as u64);
        assert!(image.entries.is_empty());
    }

    #[test]
    fn test_decode_recomputes_heights() {
        let block = two_entry_image().encode().unwrap();
        let image = CacheImage::decode(&block).unwrap();
        assert_eq!(image.entries[0].dependency_height, 1);
        assert_eq!(image.entries[1].dependency_height, 0);
        assert_eq!(image.entries[1].parents, vec![10]);
    }

    #[test]
    fn test_decode_rejects_corruption() {
        let block = two_entry_image().encode().unwrap().to_vec();

        let mut bad = block.clone();
        bad[0] = b'X';
        assert!(CacheImage::decode(&bad).is_err());

        let mut bad = block.clone();
        bad[4] = 1;
        assert!(CacheImage::decode(&bad).is_err());

        let mut bad = block.clone();
        bad[5] = HEADER_FLAG_RESIZE_STATUS;
        assert!(CacheImage::decode(&bad).is_err());

        // flip a payload byte: only the checksum catches it
        let mut bad = block.clone();
        let last_payload = bad.len() - CHECKSUM_LEN - 1;
        bad[last_payload] ^= 0xff;
        let err = CacheImage::decode(&bad).unwrap_err();
        assert!(err.to_string().contains("checksum"));

        assert!(CacheImage::decode(&block[..block.len() - 1]).is_err());
        assert!(CacheImage::decode(&block[..10]).is_err());
    }

    #[test]
    fn test_decode_rejects_forward_parent_reference() {
        let mut image = two_entry_image();
        image.entries.reverse();
        let block = image.encode().unwrap();
        let err = CacheImage::decode(&block).unwrap_err();
        assert!(matches!(err, CacheError::DecodeError(_)));
    }

    #[test]
    fn test_decode_rejects_bad_counts() {
        let mut image = two_entry_image();
        image.entries[0].dirty_child_count = 2;
        assert!(CacheImage::decode(&image.encode().unwrap()).is_err());

        let mut image = two_entry_image();
        image.entries[0].child_count = 2;
        assert!(CacheImage::decode(&image.encode().unwrap()).is_err());

        let mut image = two_entry_image();
        image.entries[1].address = UNDEFINED_ADDRESS;
        image.entries[1].parents.clear();
        image.entries[0].child_count = 0;
        assert!(CacheImage::decode(&image.encode().unwrap()).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_data() {
        let image = two_entry_image();
        let block = image.encode().unwrap();
        // re-frame the same body with one extra byte before the checksum
        let mut body = block[..block.len() - CHECKSUM_LEN].to_vec();
        body.push(0);
        let new_len = (body.len() + CHECKSUM_LEN) as u64;
        body[6..14].copy_from_slice(&new_len.to_le_bytes());
        let crc = crc32fast::hash(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        let err = CacheImage::decode(&body).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_image_config_validation() {
        let mut config = ImageConfig::default();
        assert!(config.validate().is_ok());
        config.entry_ageout = 101;
        assert!(config.validate().is_err());
        config.entry_ageout = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_snapshot_orders_parents_first_and_ranks_lru() {
        let (mut cache, _storage) = create_test_cache(1 << 16);
        let pinned = InsertFlags {
            pin: true,
            ..InsertFlags::default()
        };
        cache.insert(1, 1, payload(8, 1), pinned).unwrap();
        cache
            .insert(2, 1, payload(8, 2), InsertFlags::default())
            .unwrap();
        cache
            .insert(3, 1, payload(8, 3), InsertFlags::default())
            .unwrap();
        cache.create_flush_dependency(1, 3).unwrap();

        let image = cache.snapshot_image().unwrap();
        let order: Vec<Address> = image.entries.iter().map(|e| e.address).collect();
        assert_eq!(order, vec![1, 3, 2]);
        assert_eq!(image.entries[0].lru_rank, -1);
        assert_eq!(image.entries[0].child_count, 1);
        assert_eq!(image.entries[0].dirty_child_count, 1);
        // 3 was inserted last so it heads the LRU
        assert_eq!(image.entries[1].lru_rank, 1);
        assert_eq!(image.entries[2].lru_rank, 2);
    }

    #[test]
    fn test_snapshot_respects_max_ring() {
        let (mut cache, _storage) = create_test_cache(1 << 16);
        cache
            .insert(
                1,
                1,
                payload(8, 1),
                InsertFlags {
                    ring: Ring::Superblock,
                    ..InsertFlags::default()
                },
            )
            .unwrap();
        cache
            .insert(2, 1, payload(8, 1), InsertFlags::default())
            .unwrap();
        let image = cache.snapshot_image().unwrap();
        assert_eq!(image.entries.len(), 1);
        assert_eq!(image.entries[0].address, 2);
    }

    fn close_and_reopen(read_only: bool) -> (MetadataCache, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::with_base(1 << 20));
        let mut config = MetadataCacheConfig::fixed(1 << 16, 1 << 14);
        config.image.generate_image = true;
        let mut cache = MetadataCache::new(config.clone(), storage.clone()).unwrap();
        cache
            .insert(100, 1, payload(32, 1), InsertFlags::default())
            .unwrap();
        cache
            .insert(200, 1, payload(32, 2), InsertFlags::default())
            .unwrap();
        cache.flush_entry(200).unwrap();
        let side = cache.close().unwrap().unwrap();
        // dirty imaged entries are not written at close
        assert!(!storage.contains(100).unwrap());

        config.read_only = read_only;
        let mut reopened = MetadataCache::new(config, storage.clone()).unwrap();
        reopened.request_image_load(side).unwrap();
        (reopened, storage)
    }

    #[test]
    fn test_close_and_reload_image() {
        let (mut cache, storage) = close_and_reopen(false);
        assert!(cache.image_pending());
        let data = cache.protect(100, ProtectMode::ReadOnly).unwrap();
        assert_eq!(&data[..], &[1u8; 32][..]);
        cache.unprotect(100, UnprotectFlags::default()).unwrap();

        assert!(!cache.image_pending());
        assert!(cache.get_entry_status(100).unwrap().is_dirty);
        assert!(!cache.get_entry_status(200).unwrap().is_dirty);
        assert!(cache.get_entry_status(200).unwrap().prefetched);
        assert_eq!(storage.metrics.snapshot().frees, 1);
        cache.validate_consistency().unwrap();

        // the placeholder goes into the next image one generation older
        let image = cache.snapshot_image().unwrap();
        let aged = image.entries.iter().find(|e| e.address == 200).unwrap();
        assert_eq!(aged.age, 1);
    }

    #[test]
    fn test_read_only_reload_keeps_logically_dirty_entries() {
        let (mut cache, storage) = close_and_reopen(true);
        cache.evict().unwrap();
        let status = cache.get_entry_status(100).unwrap();
        assert!(!status.is_dirty);
        assert!(status.prefetched_dirty);
        // the clean placeholder was evicted; the logically dirty one stays
        assert!(!cache.contains(200));
        assert_eq!(storage.metrics.snapshot().frees, 0);
        cache.validate_consistency().unwrap();
    }

    #[test]
    fn test_entry_ageout_excludes_stale_placeholders() {
        let (mut cache, _storage) = close_and_reopen(false);
        cache.image.config.entry_ageout = 0;
        cache.load_pending_image().unwrap();
        let image = cache.snapshot_image().unwrap();
        assert!(image.entries.is_empty());
    }

    #[test]
    fn test_image_collision_rejected_atomically() {
        let (cache, storage) = close_and_reopen(false);
        let side = cache.image.pending.unwrap();
        let config = MetadataCacheConfig::fixed(1 << 16, 1 << 14);
        let mut other = MetadataCache::new(config, storage.clone()).unwrap();
        other
            .insert(200, 1, payload(8, 9), InsertFlags::default())
            .unwrap();
        other.request_image_load(side).unwrap();
        let err = other.protect(200, ProtectMode::Write).unwrap_err();
        assert!(matches!(err, CacheError::DecodeError(_)));
        assert_eq!(other.entry_count(), 1);
        assert_eq!(&storage.read(side.address, 4).unwrap()[..], IMAGE_SIGNATURE);
        cache.validate_consistency().unwrap();
    }

    #[test]
    fn test_failed_load_stays_pending() {
        let (mut cache, storage) = close_and_reopen(false);
        let side = cache.image.pending.unwrap();
        let mut block = storage.read(side.address, side.length).unwrap().to_vec();
        let last = block.len() - 1;
        block[last] ^= 0xff;
        storage.preload(side.address, &block).unwrap();
        storage.preload(100, &[0xee; 32]).unwrap();

        for _ in 0..2 {
            let err = cache
                .protect_or_load(100, 1, 32, Ring::User, ProtectMode::ReadOnly)
                .unwrap_err();
            assert!(matches!(err, CacheError::DecodeError(_)));
            assert!(cache.image_pending());
            assert_eq!(cache.entry_count(), 0);
        }
        assert!(cache.close().is_err());
    }

    struct RefusingClient;

    impl EntryClient for RefusingClient {
        fn type_id(&self) -> u8 {
            1
        }

        fn name(&self) -> &str {
            "refusing"
        }

        fn notify(&self, action: NotifyAction, address: Address) -> Result<()> {
            match action {
                NotifyAction::ChildDirtied => Err(CacheError::InvariantViolation(format!(
                    "parent {} refuses dirty children",
                    address
                ))),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn test_failed_install_rolls_back() {
        let mut image = two_entry_image();
        image.entries[0].dirty_child_count = 1;
        image.entries[1].is_dirty = true;
        let block = image.encode().unwrap();
        let storage = Arc::new(MemoryStorage::with_base(1 << 20));
        storage.preload(1 << 20, &block).unwrap();
        let side = SideMessage {
            address: 1 << 20,
            length: block.len() as u64,
        };

        let mut cache =
            MetadataCache::new(MetadataCacheConfig::fixed(1 << 16, 1 << 14), storage).unwrap();
        cache.register_client(Arc::new(RefusingClient));
        cache.request_image_load(side).unwrap();
        let err = cache.protect(10, ProtectMode::ReadOnly).unwrap_err();
        assert!(matches!(err, CacheError::InvariantViolation(_)));
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.index_size(), 0);
        assert!(cache.dirty_addresses().is_empty());
        assert!(cache.image_pending());
        cache.validate_consistency().unwrap();
    }
}
