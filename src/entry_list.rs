//! Keyed doubly linked list of entry addresses.
//!
//! Used for the LRU, its clean and dirty sub-lists, and the pinned list.
//! Links live in a map keyed by address, so removal and move-to-head are O(1)
//! without the entries holding pointers to each other.

use crate::entry::Address;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Links {
    prev: Option<Address>,
    next: Option<Address>,
    size: u64,
}

/// Ordered address list with byte-size accounting. Head is most recently used.
#[derive(Debug, Clone, Default)]
pub struct EntryList {
    links: HashMap<Address, Links>,
    head: Option<Address>,
    tail: Option<Address>,
    size: u64,
}

impl EntryList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Sum of the sizes recorded for all members
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, address: Address) -> bool {
        self.links.contains_key(&address)
    }

    pub fn head(&self) -> Option<Address> {
        self.head
    }

    pub fn tail(&self) -> Option<Address> {
        self.tail
    }

    pub fn prev_of(&self, address: Address) -> Option<Address> {
        self.links.get(&address).and_then(|l| l.prev)
    }

    pub fn next_of(&self, address: Address) -> Option<Address> {
        self.links.get(&address).and_then(|l| l.next)
    }

    /// Insert at the head. Returns false if already present.
    pub fn push_head(&mut self, address: Address, size: u64) -> bool {
        if self.links.contains_key(&address) {
            return false;
        }
        let old_head = self.head;
        self.links.insert(
            address,
            Links {
                prev: None,
                next: old_head,
                size,
            },
        );
        match old_head {
            Some(h) => {
                if let Some(l) = self.links.get_mut(&h) {
                    l.prev = Some(address);
                }
            }
            None => self.tail = Some(address),
        }
        self.head = Some(address);
        self.size += size;
        true
    }

    /// Insert at the tail. Returns false if already present.
    pub fn push_tail(&mut self, address: Address, size: u64) -> bool {
        if self.links.contains_key(&address) {
            return false;
        }
        let old_tail = self.tail;
        self.links.insert(
            address,
            Links {
                prev: old_tail,
                next: None,
                size,
            },
        );
        match old_tail {
            Some(t) => {
                if let Some(l) = self.links.get_mut(&t) {
                    l.next = Some(address);
                }
            }
            None => self.head = Some(address),
        }
        self.tail = Some(address);
        self.size += size;
        true
    }

    /// Unlink an address. Returns false if it was not a member.
    pub fn remove(&mut self, address: Address) -> bool {
        let links = match self.links.remove(&address) {
            Some(l) => l,
            None => return false,
        };
        match links.prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(&p) {
                    l.next = links.next;
                }
            }
            None => self.head = links.next,
        }
        match links.next {
            Some(n) => {
                if let Some(l) = self.links.get_mut(&n) {
                    l.prev = links.prev;
                }
            }
            None => self.tail = links.prev,
        }
        self.size -= links.size;
        true
    }

    pub fn move_to_head(&mut self, address: Address) -> bool {
        let size = match self.links.get(&address) {
            Some(l) => l.size,
            None => return false,
        };
        if self.head == Some(address) {
            return true;
        }
        self.remove(address);
        self.push_head(address, size)
    }

    /// Update the size recorded for a member
    pub fn update_size(&mut self, address: Address, new_size: u64) {
        if let Some(l) = self.links.get_mut(&address) {
            self.size = self.size - l.size + new_size;
            l.size = new_size;
        }
    }

    /// Swap the key of a member in place, keeping its position
    pub fn rekey(&mut self, old: Address, new: Address) -> bool {
        if old == new {
            return self.links.contains_key(&old);
        }
        if self.links.contains_key(&new) {
            return false;
        }
        let links = match self.links.remove(&old) {
            Some(l) => l,
            None => return false,
        };
        match links.prev {
            Some(p) => {
                if let Some(l) = self.links.get_mut(&p) {
                    l.next = Some(new);
                }
            }
            None => self.head = Some(new),
        }
        match links.next {
            Some(n) => {
                if let Some(l) = self.links.get_mut(&n) {
                    l.prev = Some(new);
                }
            }
            None => self.tail = Some(new),
        }
        self.links.insert(new, links);
        true
    }

    /// Addresses from head (most recent) to tail
    pub fn iter(&self) -> EntryListIter<'_> {
        EntryListIter {
            list: self,
            cursor: self.head,
            from_tail: false,
        }
    }

    /// Addresses from tail (least recent) to head
    pub fn iter_from_tail(&self) -> EntryListIter<'_> {
        EntryListIter {
            list: self,
            cursor: self.tail,
            from_tail: true,
        }
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.tail = None;
        self.size = 0;
    }
}

pub struct EntryListIter<'a> {
    list: &'a EntryList,
    cursor: Option<Address>,
    from_tail: bool,
}

impl<'a> Iterator for EntryListIter<'a> {
    type Item = Address;

    fn next(&mut self) -> Option<Address> {
        let current = self.cursor?;
        let links = self.list.links.get(&current)?;
        self.cursor = if self.from_tail {
            links.prev
        } else {
            links.next
        };
        Some(current)
    }
}
