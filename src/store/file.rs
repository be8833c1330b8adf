//! File-backed store safe for concurrent use by independent processes.
//!
//! Layout: `<root>/<collection>/<id>.json`, one record per file. Records are
//! written to a temp file in the same directory and renamed into place, so a
//! reader sees either the old or the new record. Each collection directory
//! holds a `.lock` file created with exclusive-create semantics while a
//! critical section runs.

use super::retry::RetryPolicy;
use super::{validate_id, Collection, DurableStore};
use crate::concurrency::CollectionLockManager;
use crate::config::StorageConfig;
use crate::error::{RelayError, StorageError};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

const RECORD_EXTENSION: &str = "json";
const LOCK_FILE: &str = ".lock";
const TEMP_PREFIX: &str = ".tmp-";
const LOCK_SPIN: Duration = Duration::from_millis(5);

/// Tuning for [`FileStore`]
#[derive(Debug, Clone, Copy)]
pub struct FileStoreOptions {
    /// Give up acquiring a collection lock after this long
    pub lock_timeout: Duration,
    /// A lock file older than this is assumed abandoned by a dead process
    pub lock_stale: Duration,
    pub retry: RetryPolicy,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            lock_stale: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl FileStoreOptions {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            lock_stale: Duration::from_millis(config.lock_stale_ms),
            retry: RetryPolicy {
                attempts: config.io_retries.saturating_add(1),
                base_delay: Duration::from_millis(config.retry_backoff_ms),
            },
        }
    }
}

/// Directory-per-collection JSON store
pub struct FileStore {
    root: PathBuf,
    options: FileStoreOptions,
    locks: CollectionLockManager,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, options: FileStoreOptions) -> Result<Self, StorageError> {
        let root = root.into();
        for collection in Collection::ALL {
            fs::create_dir_all(root.join(collection.as_str()))?;
        }
        debug!(root = %root.display(), "Opened file store");
        Ok(Self {
            root,
            options,
            locks: CollectionLockManager::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_dir(&self, collection: Collection) -> PathBuf {
        self.root.join(collection.as_str())
    }

    fn record_path(&self, collection: Collection, id: &str) -> Result<PathBuf, StorageError> {
        validate_id(id)?;
        Ok(self
            .collection_dir(collection)
            .join(format!("{}.{}", id, RECORD_EXTENSION)))
    }

    fn acquire_file_lock(&self, collection: Collection) -> Result<LockFileGuard, StorageError> {
        let path = self.collection_dir(collection).join(LOCK_FILE);
        let started = Instant::now();
        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    // Holder pid is informational only.
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(LockFileGuard { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path) {
                        warn!(
                            collection = %collection,
                            lock = %path.display(),
                            "Taking over stale collection lock"
                        );
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(e) => return Err(StorageError::IoError(e)),
                        }
                    }
                    if started.elapsed() >= self.options.lock_timeout {
                        return Err(StorageError::LockTimeout(collection));
                    }
                    std::thread::sleep(LOCK_SPIN);
                }
                Err(e) => return Err(StorageError::IoError(e)),
            }
        }
    }

    fn lock_is_stale(&self, path: &Path) -> bool {
        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => return false,
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age >= self.options.lock_stale)
            .unwrap_or(false)
    }
}

/// Removes the collection lock file when dropped
struct LockFileGuard {
    path: PathBuf,
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release collection lock");
        }
    }
}

impl DurableStore for FileStore {
    fn get(&self, collection: Collection, id: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.record_path(collection, id)?;
        let bytes = self.options.retry.run("read record", || match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })?;
        Ok(bytes)
    }

    fn put(&self, collection: Collection, id: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.record_path(collection, id)?;
        let dir = self.collection_dir(collection);
        self.options.retry.run("write record", || {
            let mut tmp = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .suffix(".partial")
                .tempfile_in(&dir)?;
            tmp.write_all(bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })?;
        Ok(())
    }

    fn list(&self, collection: Collection) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let dir = self.collection_dir(collection);
        let entries = self.options.retry.run("list collection", || fs::read_dir(&dir))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(id) if validate_id(id).is_ok() => id.to_string(),
                _ => {
                    return Err(StorageError::Corruption {
                        collection,
                        id: path.display().to_string(),
                        reason: "record file name is not a valid id".to_string(),
                    })
                }
            };
            let bytes = self.options.retry.run("read record", || match fs::read(&path) {
                Ok(bytes) => Ok(Some(bytes)),
                // Deleted between read_dir and read.
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            })?;
            if let Some(bytes) = bytes {
                records.push((id, bytes));
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<bool, StorageError> {
        let path = self.record_path(collection, id)?;
        let removed = self.options.retry.run("delete record", || match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })?;
        Ok(removed)
    }

    fn with_lock(
        &self,
        collection: Collection,
        critical: &mut dyn FnMut() -> Result<(), RelayError>,
    ) -> Result<(), RelayError> {
        let lock = self.locks.get_lock(collection);
        let _thread_guard = lock.lock();
        let _file_guard = self.acquire_file_lock(collection)?;
        critical()
    }
}
