//! Durable Store
//!
//! The single owner of registrations, messages and conversations. Every
//! backend publishes whole records atomically and offers one exclusive
//! critical section per collection; all read-modify-write transitions in the
//! relay run inside it.

pub mod embedded;
pub mod file;
mod retry;

pub use embedded::SledStore;
pub use file::{FileStore, FileStoreOptions};
pub use retry::RetryPolicy;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{RelayError, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Logical collections held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Registrations,
    Messages,
    Conversations,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::Registrations,
        Collection::Messages,
        Collection::Conversations,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Registrations => "registrations",
            Collection::Messages => "messages",
            Collection::Conversations => "conversations",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte-level store contract shared by all backends.
///
/// `put` and `delete` are atomic per record but do not take the collection
/// lock; callers that read before they write go through [`Table::atomic_update`]
/// or [`Table::locked`].
pub trait DurableStore: Send + Sync {
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, collection: Collection, id: &str, bytes: &[u8]) -> Result<(), StorageError>;
    /// All records of a collection, sorted by id.
    fn list(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
    fn delete(&self, collection: Collection, id: &str) -> Result<bool, StorageError>;
    /// Run `critical` while holding the collection's exclusive lock.
    fn with_lock(
        &self,
        collection: Collection,
        critical: &mut dyn FnMut() -> Result<(), RelayError>,
    ) -> Result<(), RelayError>;
}

/// A record type persisted in exactly one collection.
pub trait Record: Serialize + DeserializeOwned {
    const COLLECTION: Collection;
    /// Human-readable kind used in `NotFound` errors.
    const KIND: &'static str;

    fn id(&self) -> &str;
}

/// What an atomic update does with the record it was handed
#[derive(Debug)]
pub enum Mutation<T> {
    Keep,
    Put(T),
    Delete,
}

/// Typed view of one collection.
pub struct Table<'a, T: Record> {
    store: &'a dyn DurableStore,
    _record: PhantomData<T>,
}

impl<'a, T: Record> Table<'a, T> {
    pub fn new(store: &'a dyn DurableStore) -> Self {
        Self {
            store,
            _record: PhantomData,
        }
    }

    pub fn find(&self, id: &str) -> Result<Option<T>, RelayError> {
        match self.store.get(T::COLLECTION, id)? {
            Some(bytes) => Ok(Some(decode(T::COLLECTION, id, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get(&self, id: &str) -> Result<T, RelayError> {
        self.find(id)?.ok_or_else(|| RelayError::NotFound {
            kind: T::KIND,
            id: id.to_string(),
        })
    }

    pub fn put(&self, record: &T) -> Result<(), RelayError> {
        let bytes = encode(T::COLLECTION, record)?;
        self.store.put(T::COLLECTION, record.id(), &bytes)?;
        Ok(())
    }

    /// Records matching `predicate`, in id order.
    pub fn list(&self, predicate: impl Fn(&T) -> bool) -> Result<Vec<T>, RelayError> {
        let mut records = Vec::new();
        for (id, bytes) in self.store.list(T::COLLECTION)? {
            let record: T = decode(T::COLLECTION, &id, &bytes)?;
            if predicate(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn delete(&self, id: &str) -> Result<bool, RelayError> {
        Ok(self.store.delete(T::COLLECTION, id)?)
    }

    /// Run `critical` with the collection locked against every other writer.
    pub fn locked<R>(
        &self,
        critical: impl FnOnce(&Self) -> Result<R, RelayError>,
    ) -> Result<R, RelayError> {
        let mut critical = Some(critical);
        let mut output = None;
        self.store.with_lock(T::COLLECTION, &mut || {
            if let Some(critical) = critical.take() {
                output = Some(critical(self)?);
            }
            Ok(())
        })?;
        output.ok_or_else(|| {
            RelayError::Storage(StorageError::Backend(format!(
                "critical section for {} did not run",
                T::COLLECTION
            )))
        })
    }

    /// Read, mutate and publish one record as a single locked step.
    ///
    /// `mutate` sees the current record (or `None`) and decides whether to
    /// keep, replace or delete it; its second return value is passed through.
    pub fn atomic_update<R>(
        &self,
        id: &str,
        mutate: impl FnOnce(Option<T>) -> Result<(Mutation<T>, R), RelayError>,
    ) -> Result<R, RelayError> {
        self.locked(|table| {
            let current = table.find(id)?;
            let (mutation, output) = mutate(current)?;
            match mutation {
                Mutation::Keep => {}
                Mutation::Put(record) => {
                    if record.id() != id {
                        return Err(RelayError::InvalidRequest(format!(
                            "atomic update of {} changed id {} to {}",
                            T::COLLECTION,
                            id,
                            record.id()
                        )));
                    }
                    table.put(&record)?;
                }
                Mutation::Delete => {
                    table.delete(id)?;
                }
            }
            Ok(output)
        })
    }
}

fn decode<T: DeserializeOwned>(
    collection: Collection,
    id: &str,
    bytes: &[u8],
) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corruption {
        collection,
        id: id.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Record>(collection: Collection, record: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec_pretty(record).map_err(|e| {
        StorageError::Backend(format!(
            "Failed to serialize {}/{}: {}",
            collection,
            record.id(),
            e
        ))
    })
}

/// Reject ids that are empty or unsafe to use as file names.
pub fn validate_id(id: &str) -> Result<(), StorageError> {
    let valid = !id.is_empty()
        && id.len() <= 200
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidId(id.to_string()))
    }
}

/// Open the backend selected by configuration.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn DurableStore>, RelayError> {
    let data_dir = config.resolve_data_dir()?;
    match config.backend {
        StorageBackend::File => {
            let options = FileStoreOptions::from_config(config);
            Ok(Arc::new(FileStore::open(data_dir, options)?))
        }
        StorageBackend::Sled => Ok(Arc::new(SledStore::open(data_dir.join("relay.sled"))?)),
    }
}
