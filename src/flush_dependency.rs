//! Flush Dependency Module
//!
//! Parent/child write-ordering edges between cached entries. A parent may not be
//! written or evicted while any of its children is dirty. Edges live on the
//! child as a list of parent addresses; parents only keep counters.

use crate::cache::MetadataCache;
use crate::entry::{Address, NotifyAction};
use crate::{CacheError, Result};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

impl MetadataCache {
    /// Add the edge `parent -> child`. The parent must be pinned or protected.
    pub fn create_flush_dependency(&mut self, parent: Address, child: Address) -> Result<()> {
        if parent == child {
            return Err(CacheError::InvariantViolation(format!(
                "flush dependency: entry {} cannot depend on itself",
                parent
            )));
        }
        let parent_entry = self.entry(parent, "create flush dependency")?;
        let child_entry = self.entry(child, "create flush dependency")?;
        if !parent_entry.is_pinned() && !parent_entry.is_protected {
            return Err(CacheError::InvariantViolation(format!(
                "flush dependency: parent {} is neither pinned nor protected",
                parent
            )));
        }
        if child_entry.flush_dep_parents.contains(&parent) {
            return Err(CacheError::InvariantViolation(format!(
                "flush dependency: {} -> {} already exists",
                parent, child
            )));
        }
        if parent_entry.ring < child_entry.ring {
            return Err(CacheError::InvariantViolation(format!(
                "flush dependency: parent {} in ring {:?} precedes child {} in ring {:?}",
                parent, parent_entry.ring, child, child_entry.ring
            )));
        }
        if self.is_ancestor(child, parent) {
            return Err(CacheError::InvariantViolation(format!(
                "flush dependency: {} -> {} would create a cycle",
                parent, child
            )));
        }
        let child_dirty = child_entry.is_dirty;

        self.entry_mut(child, "create flush dependency")?
            .flush_dep_parents
            .push(parent);

        let parent_entry = self.entry_mut(parent, "create flush dependency")?;
        let newly_pinned = !parent_entry.pinned_from_cache;
        parent_entry.pinned_from_cache = true;
        parent_entry.flush_dep_nchildren += 1;
        if child_dirty {
            parent_entry.flush_dep_ndirty_children += 1;
        }
        let parent_type = parent_entry.type_id;
        if newly_pinned {
            self.update_pin_placement(parent);
        }
        if child_dirty {
            self.notify(parent_type, NotifyAction::ChildDirtied, parent)?;
        }
        debug!("Created flush dependency {} -> {}", parent, child);
        Ok(())
    }

    /// Remove the edge `parent -> child`. The parent is unpinned once its last child is gone.
    pub fn destroy_flush_dependency(&mut self, parent: Address, child: Address) -> Result<()> {
        self.entry(parent, "destroy flush dependency")?;
        let child_entry = self.entry_mut(child, "destroy flush dependency")?;
        let position = child_entry
            .flush_dep_parents
            .iter()
            .position(|p| *p == parent)
            .ok_or_else(|| {
                CacheError::InvariantViolation(format!(
                    "flush dependency: {} -> {} does not exist",
                    parent, child
                ))
            })?;
        child_entry.flush_dep_parents.remove(position);
        let child_dirty = child_entry.is_dirty;

        let parent_entry = self.entry_mut(parent, "destroy flush dependency")?;
        if parent_entry.flush_dep_nchildren == 0
            || (child_dirty && parent_entry.flush_dep_ndirty_children == 0)
        {
            return Err(CacheError::InvariantViolation(format!(
                "flush dependency: child counters of {} are already zero",
                parent
            )));
        }
        parent_entry.flush_dep_nchildren -= 1;
        if child_dirty {
            parent_entry.flush_dep_ndirty_children -= 1;
        }
        let parent_type = parent_entry.type_id;
        let unpinned = parent_entry.flush_dep_nchildren == 0;
        if unpinned {
            parent_entry.pinned_from_cache = false;
            self.update_pin_placement(parent);
        }
        if child_dirty {
            self.notify(parent_type, NotifyAction::ChildCleaned, parent)?;
        }
        debug!("Destroyed flush dependency {} -> {}", parent, child);
        Ok(())
    }

    /// Parents of an entry, in the order the edges were created
    pub fn flush_dependency_parents(&self, address: Address) -> Result<Vec<Address>> {
        Ok(self
            .entry(address, "flush dependency parents")?
            .flush_dep_parents
            .clone())
    }

    /// Children of an entry, ascending
    pub fn flush_dependency_children(&self, address: Address) -> Result<Vec<Address>> {
        self.entry(address, "flush dependency children")?;
        let mut children: Vec<Address> = self
            .index
            .values()
            .filter(|e| e.flush_dep_parents.contains(&address))
            .map(|e| e.address)
            .collect();
        children.sort_unstable();
        Ok(children)
    }

    /// Whether `ancestor` is reachable from `address` by following parent edges
    fn is_ancestor(&self, ancestor: Address, address: Address) -> bool {
        let mut stack = vec![address];
        let mut seen = BTreeSet::new();
        while let Some(current) = stack.pop() {
            if current == ancestor {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(entry) = self.index.get(&current) {
                stack.extend(entry.flush_dep_parents.iter().copied());
            }
        }
        false
    }

    /// Rewrite every parent reference after an entry changed address
    pub(crate) fn rekey_flush_dependencies(&mut self, old: Address, new: Address) {
        for entry in self.index.values_mut() {
            for parent in entry.flush_dep_parents.iter_mut() {
                if *parent == old {
                    *parent = new;
                }
            }
        }
    }

    /// Shrink an image selection until no dirty entry depends on a dirty entry outside it
    pub(crate) fn prune_image_selection(&self, selected: &mut BTreeSet<Address>) {
        loop {
            let excluded: Vec<Address> = selected
                .iter()
                .filter_map(|a| self.index.get(a))
                .filter(|e| e.is_dirty)
                .filter(|e| {
                    e.flush_dep_parents.iter().any(|p| {
                        !selected.contains(p)
                            && self.index.get(p).map(|pe| pe.is_dirty).unwrap_or(false)
                    })
                })
                .map(|e| e.address)
                .collect();
            if excluded.is_empty() {
                break;
            }
            for address in excluded {
                debug!(
                    "Excluding dirty entry {} from image: a dirty parent is not in the image",
                    address
                );
                selected.remove(&address);
            }
        }
    }

    /// Dependency heights over a selection, ignoring edges that leave it.
    /// Leaves have height 0; a parent sits one above its tallest child.
    pub(crate) fn compute_dependency_heights(
        &self,
        selected: &BTreeSet<Address>,
    ) -> HashMap<Address, u32> {
        let mut heights: HashMap<Address, u32> = selected.iter().map(|a| (*a, 0)).collect();
        let mut has_children: BTreeSet<Address> = BTreeSet::new();
        for address in selected {
            if let Some(entry) = self.index.get(address) {
                for parent in &entry.flush_dep_parents {
                    if selected.contains(parent) {
                        has_children.insert(*parent);
                    }
                }
            }
        }

        let mut stack: Vec<Address> = selected
            .iter()
            .filter(|a| !has_children.contains(a))
            .copied()
            .collect();
        while let Some(address) = stack.pop() {
            let height = heights.get(&address).copied().unwrap_or(0);
            let parents = match self.index.get(&address) {
                Some(entry) => &entry.flush_dep_parents,
                None => continue,
            };
            for parent in parents {
                if let Some(parent_height) = heights.get_mut(parent) {
                    if *parent_height < height + 1 {
                        *parent_height = height + 1;
                        stack.push(*parent);
                    }
                }
            }
        }
        heights
    }
}
