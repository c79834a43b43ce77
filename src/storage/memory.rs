//! In-memory storage backend.
//!
//! Thread-safe in-memory implementation of `StateStore`, intended for
//! embedded usage, tests, and as a reference implementation.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::storage::traits::{StateStore, StorageError, StoredState};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Thread-safe in-memory state store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    state: RwLock<BTreeMap<String, StoredState>>,
}

impl InMemoryStateStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-filled with entries.
    #[must_use]
    pub fn with_entries(entries: impl IntoIterator<Item = (String, StoredState)>) -> Self {
        Self {
            state: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Number of stored entries.
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("state.len"))?.len())
    }

    /// Returns true if the store holds no entries.
    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<StoredState>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state.get"))?;
        Ok(state.get(key).cloned())
    }

    fn put(&self, key: &str, stored: StoredState) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state.put"))?;
        state.insert(key.to_string(), stored);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("state.remove"))?;
        state.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("state.keys"))?;
        Ok(state.keys().cloned().collect())
    }
}
