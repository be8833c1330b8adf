//! Embedded store backed by sled.
//!
//! sled owns its database directory exclusively, so this backend serves a
//! single long-lived process (or tests). Each collection is a sled tree and
//! critical sections serialize on an in-process mutex per collection.

use super::{validate_id, Collection, DurableStore};
use crate::concurrency::CollectionLockManager;
use crate::error::{RelayError, StorageError};
use std::path::Path;

pub struct SledStore {
    db: sled::Db,
    locks: CollectionLockManager,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        tracing::debug!(path = %path.display(), "Opened sled store");
        Ok(Self::from_db(db))
    }

    /// A throwaway database removed when dropped.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self::from_db(db))
    }

    pub fn from_db(db: sled::Db) -> Self {
        Self {
            db,
            locks: CollectionLockManager::new(),
        }
    }

    fn tree(&self, collection: Collection) -> Result<sled::Tree, StorageError> {
        Ok(self.db.open_tree(collection.as_str())?)
    }
}

impl DurableStore for SledStore {
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_id(id)?;
        Ok(self.tree(collection)?.get(id)?.map(|v| v.to_vec()))
    }

    fn put(&self, collection: Collection, id: &str, bytes: &[u8]) -> Result<(), StorageError> {
        validate_id(id)?;
        self.tree(collection)?.insert(id, bytes)?;
        Ok(())
    }

    fn list(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut records = Vec::new();
        for entry in self.tree(collection)?.iter() {
            let (key, value) = entry?;
            let id = String::from_utf8(key.to_vec()).map_err(|_| StorageError::Corruption {
                collection,
                id: format!("{:?}", key),
                reason: "record key is not UTF-8".to_string(),
            })?;
            records.push((id, value.to_vec()));
        }
        Ok(records)
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<bool, StorageError> {
        validate_id(id)?;
        Ok(self.tree(collection)?.remove(id)?.is_some())
    }

    fn with_lock(
        &self,
        collection: Collection,
        critical: &mut dyn FnMut() -> Result<(), RelayError>,
    ) -> Result<(), RelayError> {
        let lock = self.locks.get_lock(collection);
        let _guard = lock.lock();
        critical()
    }
}
