//! Slave Id Cache
//!
//! Ids granted by the master, handed out one at a time until the block is
//! used up. Blocks from an earlier master incarnation are forgotten.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::replication::{IdAllocation, IdType};

/// Cached id blocks per id type
#[derive(Debug, Default)]
pub struct SlaveIdAllocator {
    pools: Mutex<HashMap<IdType, VecDeque<i64>>>,
}

impl SlaveIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<IdType, VecDeque<i64>>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next cached id, if any is left
    pub fn take(&self, id_type: IdType) -> Option<i64> {
        self.pools().get_mut(&id_type).and_then(VecDeque::pop_front)
    }

    /// Replace the cached block with `allocation`
    pub fn fill(&self, id_type: IdType, allocation: &IdAllocation) {
        self.pools().insert(id_type, allocation.ids().collect());
    }

    /// Ids left for a type
    pub fn remaining(&self, id_type: IdType) -> usize {
        self.pools().get(&id_type).map_or(0, VecDeque::len)
    }

    /// Drop every cached block
    pub fn forget(&self) {
        let mut pools = self.pools();
        if !pools.is_empty() {
            tracing::debug!("Forgetting id allocations from previous master");
        }
        pools.clear();
    }
}
