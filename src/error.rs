//! Error types for the relay.
//!
//! `StorageError` covers everything the durable store can fail with;
//! `RelayError` is what the coordinator, router, janitor and facades return.
//! Wait outcomes such as a timeout or a superseded registration are not
//! errors and live in [`crate::flow::WaitOutcome`].

use crate::store::Collection;
use thiserror::Error;

/// Durable store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A persisted record could not be read back. Never treated as absence.
    #[error("Corrupt record {collection}/{id}: {reason}")]
    Corruption {
        collection: Collection,
        id: String,
        reason: String,
    },

    #[error("Invalid record id: {0:?}")]
    InvalidId(String),

    #[error("Timed out acquiring lock for collection {0}")]
    LockTimeout(Collection),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Io(io) => StorageError::IoError(io),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Relay-level errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl RelayError {
    pub fn registration_not_found(id: &str) -> Self {
        RelayError::NotFound {
            kind: "Registration",
            id: id.to_string(),
        }
    }

    pub fn message_not_found(id: &str) -> Self {
        RelayError::NotFound {
            kind: "Message",
            id: id.to_string(),
        }
    }

    /// True when the persisted state itself is damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(self, RelayError::Storage(StorageError::Corruption { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RelayError::NotFound { .. })
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(err: config::ConfigError) -> Self {
        RelayError::ConfigError(err.to_string())
    }
}
