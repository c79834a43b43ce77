//! Abstract state store trait.
//!
//! The circuit persists one opaque snapshot per block under the key
//! `"<type>:<name>"`. By using a trait, we enable:
//! - In-memory backends for testing and embedded use
//! - File-backed backends for production

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stored data failed an integrity check.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// Another circuit holds the snapshot.
    #[error("State snapshot {snapshot} is in use by {holder}")]
    Locked {
        /// Snapshot path.
        snapshot: String,
        /// Description of the current owner.
        holder: String,
    },
}

/// A persisted block state with the time it was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    /// Exported block state.
    pub state: Value,
    /// Checkpoint time.
    pub timestamp: DateTime<Utc>,
}

impl StoredState {
    /// Creates a stored state captured at `timestamp`.
    #[must_use]
    pub const fn new(state: Value, timestamp: DateTime<Utc>) -> Self {
        Self { state, timestamp }
    }
}

/// Key-value storage for block state snapshots.
///
/// Calls happen only during checkpoints and restores, sequentially.
pub trait StateStore: Send + Sync {
    /// Get the stored state for a key.
    fn get(&self, key: &str) -> Result<Option<StoredState>, StorageError>;

    /// Insert or replace the stored state for a key.
    fn put(&self, key: &str, state: StoredState) -> Result<(), StorageError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// List all stored keys.
    fn keys(&self) -> Result<Vec<String>, StorageError>;
}
