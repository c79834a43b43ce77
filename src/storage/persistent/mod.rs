//! File-backed state store.
//!
//! Durable storage for block snapshots with:
//! - A snapshot owned by one circuit at a time
//! - CRC32 checksums for corruption detection
//! - Atomic snapshot replacement (write temp, fsync, rename)
//!
//! # Layout
//!
//! ```text
//! <dir>/
//!   states.kyrc        [magic][version] + one framed entry: the whole key -> state map
//!   states.kyrc.lock   owner record (JSON), OS-locked while the store is open
//! ```

mod codec;
mod snapshot_lock;
mod store;

pub use snapshot_lock::LockOwner;
pub use store::FileStateStore;

use std::path::Path;

use super::StorageError;

/// Configuration for the file-backed store.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Whether to fsync the snapshot before renaming it into place.
    pub sync_on_write: bool,
    /// Maximum snapshot size (bytes).
    pub max_snapshot_size: u64,
    /// Label recorded as the snapshot owner, shown to anyone finding it busy.
    pub owner: Option<String>,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_snapshot_size: 16 * 1024 * 1024, // 16 MB
            owner: None,
        }
    }
}

impl PersistentConfig {
    const MIN_SNAPSHOT_SIZE: u64 = 4 * 1024; // 4 KiB minimum, a handful of blocks must fit

    /// Validate the configuration.
    ///
    /// # Errors
    /// `BackendError` if the snapshot limit is too small.
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.max_snapshot_size < Self::MIN_SNAPSHOT_SIZE {
            return Err(StorageError::BackendError(format!(
                "max_snapshot_size must be at least {} bytes (got {})",
                Self::MIN_SNAPSHOT_SIZE,
                self.max_snapshot_size
            )));
        }
        Ok(self)
    }
}

/// Open or create a file-backed state store in the given directory.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another circuit holds the snapshot (`StorageError::Locked`)
/// - If the snapshot is corrupted
///
/// # Example
/// ```rust,ignore
/// use std::sync::Arc;
/// use kyrocircuit::storage::open_store;
///
/// let store = open_store("./state", None)?;
/// circuit.set_persistent_storage(Some(Arc::new(store)), None)?;
/// ```
pub fn open_store(
    path: impl AsRef<Path>,
    config: Option<PersistentConfig>,
) -> Result<FileStateStore, StorageError> {
    let cfg = config.unwrap_or_default().validate()?;
    FileStateStore::open(path.as_ref(), cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_rejects_tiny_snapshot_limit() {
        let cfg = PersistentConfig {
            max_snapshot_size: 16,
            ..PersistentConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("max_snapshot_size"));
    }
}
