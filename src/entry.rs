//! Cache Entry Module
//!
//! Entry state, the flag sets accepted by the entry store, and the client hook
//! trait the owning layer implements to give payloads an on-storage form.

use crate::Result;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage address; the unique key of an entry within a cache
pub type Address = u64;

/// Address value that never names a real entry
pub const UNDEFINED_ADDRESS: Address = u64::MAX;

/// Coarse flush ordering domain. Entries in a later ring may depend on entries
/// in an earlier one, so rings are flushed in ascending order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Ring {
    #[default]
    User,
    RawDataFsm,
    MetadataFsm,
    SuperblockExt,
    Superblock,
}

impl Ring {
    pub const ALL: [Ring; 5] = [
        Ring::User,
        Ring::RawDataFsm,
        Ring::MetadataFsm,
        Ring::SuperblockExt,
        Ring::Superblock,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            Ring::User => 1,
            Ring::RawDataFsm => 2,
            Ring::MetadataFsm => 3,
            Ring::SuperblockExt => 4,
            Ring::Superblock => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<Ring> {
        match value {
            1 => Some(Ring::User),
            2 => Some(Ring::RawDataFsm),
            3 => Some(Ring::MetadataFsm),
            4 => Some(Ring::SuperblockExt),
            5 => Some(Ring::Superblock),
            _ => None,
        }
    }
}

/// Access mode requested by protect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectMode {
    /// Exclusive access; the caller may modify the payload
    Write,
    /// Shared, reference counted access
    ReadOnly,
}

/// Flags accepted by insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertFlags {
    pub pin: bool,
    pub flush_last: bool,
    pub ring: Ring,
}

/// Flags accepted by unprotect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnprotectFlags {
    pub dirtied: bool,
    pub delete: bool,
    pub pin: bool,
    pub unpin: bool,
    /// Release the entry's storage region when it is deleted
    pub free_space: bool,
    /// Remove the entry without writing it, handing its payload back to the caller
    pub take_ownership: bool,
}

impl UnprotectFlags {
    pub fn dirtied() -> Self {
        Self {
            dirtied: true,
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }
}

/// Flags accepted by flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushFlags {
    /// Evict every entry after writing it
    pub invalidate: bool,
    /// Mark entries clean without writing them
    pub clear_only: bool,
    /// Only flush entries whose flush marker is set
    pub marked_only: bool,
    /// Skip protected entries instead of failing
    pub ignore_protected: bool,
}

/// Events reported to a client about one of its entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAction {
    AfterInsert,
    AfterLoad,
    AfterFlush,
    BeforeEvict,
    EntryDirtied,
    EntryCleaned,
    ChildDirtied,
    ChildCleaned,
}

/// Per-type hooks supplied by the layer that owns the cached objects.
///
/// The cache treats payloads as opaque; the client decides what bytes go to
/// storage for an entry of a given size and how to rebuild content from them.
pub trait EntryClient: Send + Sync {
    fn type_id(&self) -> u8;

    fn name(&self) -> &str;

    /// Bytes the entry occupies on storage and in the size accounting
    fn image_len(&self, address: Address, payload: &Bytes) -> u64 {
        let _ = address;
        payload.len() as u64
    }

    /// On-storage image of an entry; must be exactly `size` bytes
    fn serialize(&self, address: Address, size: u64, payload: &Bytes) -> Result<Bytes> {
        let _ = address;
        Ok(fit_to_size(payload, size))
    }

    /// Content rebuilt from an on-storage image
    fn deserialize(&self, address: Address, image: &[u8]) -> Result<Bytes> {
        let _ = address;
        Ok(Bytes::copy_from_slice(image))
    }

    fn notify(&self, action: NotifyAction, address: Address) -> Result<()> {
        let _ = (action, address);
        Ok(())
    }
}

/// Client used for type ids nobody registered: payload bytes are the image
#[derive(Debug, Clone)]
pub struct PassthroughClient {
    type_id: u8,
    name: String,
}

impl PassthroughClient {
    pub fn new(type_id: u8) -> Self {
        Self {
            type_id,
            name: format!("opaque-{}", type_id),
        }
    }
}

impl EntryClient for PassthroughClient {
    fn type_id(&self) -> u8 {
        self.type_id
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Zero-pad or truncate a payload to the accounted size
pub fn fit_to_size(payload: &Bytes, size: u64) -> Bytes {
    let size = size as usize;
    if payload.len() == size {
        return payload.clone();
    }
    if payload.len() > size {
        return payload.slice(..size);
    }
    let mut buf = BytesMut::with_capacity(size);
    buf.extend_from_slice(payload);
    buf.resize(size, 0);
    buf.freeze()
}

/// A single cached object
#[derive(Clone)]
pub struct Entry {
    pub address: Address,
    pub size: u64,
    pub type_id: u8,
    pub ring: Ring,
    pub payload: Bytes,

    pub is_dirty: bool,
    pub is_protected: bool,
    pub is_read_only: bool,
    pub ro_ref_count: u32,
    /// Pinned at the owner's request
    pub pinned_from_client: bool,
    /// Pinned because the entry is a flush-dependency parent
    pub pinned_from_cache: bool,
    /// Present in the ordered dirty set
    pub in_write_set: bool,
    pub flush_marker: bool,
    pub flush_me_last: bool,
    /// Serialized image matches the payload
    pub image_up_to_date: bool,

    pub flush_dep_parents: Vec<Address>,
    pub flush_dep_nchildren: usize,
    pub flush_dep_ndirty_children: usize,
    pub dependency_height: u32,

    /// Placeholder materialized from a cache image and not yet hydrated
    pub prefetched: bool,
    /// Recorded dirty in an image loaded read-only; never evicted
    pub prefetched_dirty: bool,
    /// Number of images this placeholder has appeared in
    pub age: u8,
    /// Epoch of the last protect, for age-out
    pub last_access_epoch: u64,
    pub accesses: u64,
}

impl Entry {
    pub fn new(address: Address, type_id: u8, ring: Ring, payload: Bytes) -> Self {
        Self {
            address,
            size: payload.len() as u64,
            type_id,
            ring,
            payload,
            is_dirty: false,
            is_protected: false,
            is_read_only: false,
            ro_ref_count: 0,
            pinned_from_client: false,
            pinned_from_cache: false,
            in_write_set: false,
            flush_marker: false,
            flush_me_last: false,
            image_up_to_date: false,
            flush_dep_parents: Vec::new(),
            flush_dep_nchildren: 0,
            flush_dep_ndirty_children: 0,
            dependency_height: 0,
            prefetched: false,
            prefetched_dirty: false,
            age: 0,
            last_access_epoch: 0,
            accesses: 0,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_from_client || self.pinned_from_cache
    }

    /// May be evicted right now
    pub fn is_evictable(&self) -> bool {
        !self.is_protected && !self.is_pinned() && !self.prefetched_dirty
    }

    pub fn status(&self) -> EntryStatus {
        EntryStatus {
            address: self.address,
            size: self.size,
            type_id: self.type_id,
            ring: self.ring,
            is_dirty: self.is_dirty,
            is_protected: self.is_protected,
            is_read_only: self.is_read_only,
            ro_ref_count: self.ro_ref_count,
            is_pinned: self.is_pinned(),
            is_flush_dep_parent: self.flush_dep_nchildren > 0,
            is_flush_dep_child: !self.flush_dep_parents.is_empty(),
            flush_dep_nchildren: self.flush_dep_nchildren,
            flush_dep_ndirty_children: self.flush_dep_ndirty_children,
            prefetched: self.prefetched,
            prefetched_dirty: self.prefetched_dirty,
            age: self.age,
        }
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("type_id", &self.type_id)
            .field("ring", &self.ring)
            .field("dirty", &self.is_dirty)
            .field("protected", &self.is_protected)
            .field("pinned", &self.is_pinned())
            .field("parents", &self.flush_dep_parents)
            .field("children", &self.flush_dep_nchildren)
            .field("dirty_children", &self.flush_dep_ndirty_children)
            .field("prefetched", &self.prefetched)
            .finish()
    }
}

/// Externally visible snapshot of an entry's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub address: Address,
    pub size: u64,
    pub type_id: u8,
    pub ring: Ring,
    pub is_dirty: bool,
    pub is_protected: bool,
    pub is_read_only: bool,
    pub ro_ref_count: u32,
    pub is_pinned: bool,
    pub is_flush_dep_parent: bool,
    pub is_flush_dep_child: bool,
    pub flush_dep_nchildren: usize,
    pub flush_dep_ndirty_children: usize,
    pub prefetched: bool,
    pub prefetched_dirty: bool,
    pub age: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_byte_mapping() {
        for ring in Ring::ALL {
            assert_eq!(Ring::from_u8(ring.as_u8()), Some(ring));
        }
        assert_eq!(Ring::from_u8(0), None);
        assert_eq!(Ring::from_u8(6), None);
        assert!(Ring::User < Ring::Superblock);
    }

    #[test]
    fn test_fit_to_size() {
        let payload = Bytes::from_static(b"abcdef");
        assert_eq!(fit_to_size(&payload, 6), payload);
        assert_eq!(&fit_to_size(&payload, 3)[..], b"abc");
        assert_eq!(&fit_to_size(&payload, 8)[..], b"abcdef\0\0");
    }

    #[test]
    fn test_new_entry_is_clean_and_evictable() {
        let entry = Entry::new(64, 3, Ring::User, Bytes::from_static(&[1, 2, 3, 4]));
        assert_eq!(entry.size, 4);
        assert!(!entry.is_dirty);
        assert!(entry.is_evictable());

        let status = entry.status();
        assert!(!status.is_flush_dep_parent);
        assert!(!status.is_flush_dep_child);
    }
}
