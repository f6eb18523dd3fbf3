//! Destination-to-pool registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::key::DestinationKey;
use crate::lifecycle::Transport;
use crate::pool::Pool;

/// Maps each destination to its pool.
///
/// Lookups take the read lock; only a miss takes the write lock, and it
/// checks again before inserting so concurrent first acquisitions for one
/// destination end up sharing a single pool.
pub(crate) struct PoolRegistry<T: Transport> {
    pools: RwLock<HashMap<DestinationKey, Arc<Pool<T>>>>,
}

impl<T: Transport> PoolRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Get the pool for `key`, creating it with `make` if absent.
    pub(crate) fn get_or_create(
        &self,
        key: &DestinationKey,
        make: impl FnOnce() -> Arc<Pool<T>>,
    ) -> Arc<Pool<T>> {
        {
            let pools = self.pools.read();
            if let Some(pool) = pools.get(key) {
                return Arc::clone(pool);
            }
        }

        let mut pools = self.pools.write();
        // check again since another task may have inserted it
        if let Some(pool) = pools.get(key) {
            return Arc::clone(pool);
        }
        let pool = make();
        pools.insert(key.clone(), Arc::clone(&pool));
        pool
    }

    pub(crate) fn get(&self, key: &DestinationKey) -> Option<Arc<Pool<T>>> {
        self.pools.read().get(key).cloned()
    }

    /// Remove the entry for `key` only if it still maps to `pool`.
    pub(crate) fn remove_if_same(&self, key: &DestinationKey, pool: &Arc<Pool<T>>) -> bool {
        let mut pools = self.pools.write();
        match pools.get(key) {
            Some(current) if Arc::ptr_eq(current, pool) => {
                pools.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<(DestinationKey, Arc<Pool<T>>)> {
        self.pools
            .read()
            .iter()
            .map(|(key, pool)| (key.clone(), Arc::clone(pool)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pools.read().len()
    }
}
