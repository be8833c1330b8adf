//! In-process locking for store collections
//!
//! Threads of one process serialize on a per-collection mutex before they
//! touch any cross-process lock, so they queue in memory instead of
//! spinning on the filesystem. Different collections never block each other.

use crate::store::Collection;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Per-collection lock manager
pub struct CollectionLockManager {
    /// Map from collection to its mutex
    locks: Arc<RwLock<HashMap<Collection, Arc<Mutex<()>>>>>,
}

impl CollectionLockManager {
    pub fn new() -> Self {
        Self {
            locks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the lock for a collection, creating it on first use.
    pub fn get_lock(&self, collection: Collection) -> Arc<Mutex<()>> {
        {
            let map = self.locks.read();
            if let Some(lock) = map.get(&collection) {
                return lock.clone();
            }
        }

        // Another thread may have inserted it between the two guards.
        let mut map = self.locks.write();
        map.entry(collection)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for CollectionLockManager {
    fn default() -> Self {
        Self::new()
    }
}
