//! Process Group Module
//!
//! The collective-operation collaborator used by coordinated caches: rank,
//! size, barrier and broadcast. `LocalProcessGroup` simulates N cooperating
//! processes with threads inside one OS process.

use crate::{CacheError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tracing::{debug, error};

/// Collective operations shared by all cooperating processes.
///
/// Every member must issue the same collectives in the same order.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Block until every member has entered the barrier
    fn barrier(&self) -> Result<()>;

    /// Replace `buf` on every non-root member with the root's `buf`
    fn broadcast(&self, buf: &mut Vec<u8>, root: usize) -> Result<()>;

    /// Fail every pending and future collective. Called when a member can no
    /// longer follow the shared sequence of operations.
    fn abort(&self, reason: &str) {
        let _ = reason;
    }
}

/// A group of one
#[derive(Debug, Default, Clone)]
pub struct SingleProcessGroup;

impl ProcessGroup for SingleProcessGroup {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, _buf: &mut Vec<u8>, root: usize) -> Result<()> {
        if root != 0 {
            return Err(CacheError::CollectiveError(format!(
                "Broadcast root {} outside a group of 1",
                root
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GroupState {
    arrived: usize,
    generation: u64,
    aborted: Option<String>,
    payload: Option<Vec<u8>>,
}

#[derive(Debug)]
struct SharedGroup {
    size: usize,
    state: Mutex<GroupState>,
    cond: Condvar,
}

/// Thread-backed process group member
#[derive(Debug, Clone)]
pub struct LocalProcessGroup {
    rank: usize,
    shared: Arc<SharedGroup>,
    collectives: Arc<AtomicU64>,
    fail_at: Arc<Mutex<Option<u64>>>,
}

impl LocalProcessGroup {
    /// Create handles for a group of `size` members, one per simulated process
    pub fn create(size: usize) -> Result<Vec<LocalProcessGroup>> {
        if size == 0 {
            return Err(CacheError::ConfigError(
                "Process group size must be at least 1".to_string(),
            ));
        }
        let shared = Arc::new(SharedGroup {
            size,
            state: Mutex::new(GroupState::default()),
            cond: Condvar::new(),
        });
        Ok((0..size)
            .map(|rank| LocalProcessGroup {
                rank,
                shared: shared.clone(),
                collectives: Arc::new(AtomicU64::new(0)),
                fail_at: Arc::new(Mutex::new(None)),
            })
            .collect())
    }

    /// Number of collectives this member has completed
    pub fn collective_count(&self) -> u64 {
        self.collectives.load(Ordering::Relaxed)
    }

    /// Make this member's `n`th collective from now fail, aborting the whole group
    pub fn fail_collective_after(&self, n: u64) -> Result<()> {
        let current = self.collective_count();
        *self
            .fail_at
            .lock()
            .map_err(|e| CacheError::CollectiveError(format!("Group lock poisoned: {}", e)))? =
            Some(current + n);
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, GroupState>> {
        self.shared
            .state
            .lock()
            .map_err(|e| CacheError::CollectiveError(format!("Group lock poisoned: {}", e)))
    }

    fn check_injected_failure(&self, op: &str) -> Result<()> {
        let fail_at = *self
            .fail_at
            .lock()
            .map_err(|e| CacheError::CollectiveError(format!("Group lock poisoned: {}", e)))?;
        if fail_at == Some(self.collective_count()) {
            self.abort(&format!("injected {} failure", op));
            return Err(CacheError::CollectiveError(format!(
                "Injected {} failure on rank {}",
                op, self.rank
            )));
        }
        Ok(())
    }

    fn wait_all(&self) -> Result<()> {
        let mut state = self.state()?;
        if let Some(reason) = &state.aborted {
            return Err(CacheError::CollectiveError(format!(
                "Process group aborted ({})",
                reason
            )));
        }
        state.arrived += 1;
        if state.arrived == self.shared.size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.shared.cond.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        while state.generation == generation && state.aborted.is_none() {
            state = self
                .shared
                .cond
                .wait(state)
                .map_err(|e| CacheError::CollectiveError(format!("Group lock poisoned: {}", e)))?;
        }
        if state.generation == generation {
            if let Some(reason) = &state.aborted {
                return Err(CacheError::CollectiveError(format!(
                    "Process group aborted ({})",
                    reason
                )));
            }
        }
        Ok(())
    }
}

impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self) -> Result<()> {
        self.check_injected_failure("barrier")?;
        self.wait_all()?;
        self.collectives.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn broadcast(&self, buf: &mut Vec<u8>, root: usize) -> Result<()> {
        if root >= self.shared.size {
            return Err(CacheError::CollectiveError(format!(
                "Broadcast root {} outside a group of {}",
                root, self.shared.size
            )));
        }
        self.check_injected_failure("broadcast")?;

        if self.rank == root {
            self.state()?.payload = Some(buf.clone());
        }
        self.wait_all()?;
        if self.rank != root {
            let payload = self.state()?.payload.clone().ok_or_else(|| {
                CacheError::CollectiveError("Broadcast payload missing".to_string())
            })?;
            *buf = payload;
        }
        // nobody leaves until every member has copied the payload
        self.wait_all()?;
        self.collectives.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Rank {} completed broadcast of {} bytes from root {}",
            self.rank,
            buf.len(),
            root
        );
        Ok(())
    }

    fn abort(&self, reason: &str) {
        if let Ok(mut state) = self.shared.state.lock() {
            if state.aborted.is_none() {
                error!("Process group aborted by rank {}: {}", self.rank, reason);
                state.aborted = Some(format!("rank {}: {}", self.rank, reason));
            }
        }
        self.shared.cond.notify_all();
    }
}
