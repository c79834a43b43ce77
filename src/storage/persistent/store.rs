//! `StateStore` backed by a snapshot file.
//!
//! The whole key -> state map is kept in memory and rewritten on every
//! mutation. Checkpoints are infrequent and the map is small (one entry
//! per persistent block), so a full rewrite keeps the format trivial.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::storage::traits::{StateStore, StorageError, StoredState};

use super::codec;
use super::snapshot_lock::{LockOwner, SnapshotLock};
use super::PersistentConfig;

const SNAPSHOT_FILE: &str = "states.kyrc";
const SNAPSHOT_TMP: &str = "states.kyrc.tmp";

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::InvalidData {
        StorageError::Corrupted(format!("{context}: {err}"))
    } else {
        StorageError::BackendError(format!("{context}: {err}"))
    }
}

/// File-backed state store. Owns its snapshot while open.
#[derive(Debug)]
pub struct FileStateStore {
    dir: PathBuf,
    config: PersistentConfig,
    entries: RwLock<BTreeMap<String, StoredState>>,
    lock: SnapshotLock,
}

impl FileStateStore {
    /// Open or create a store in `dir`.
    ///
    /// # Errors
    /// - `Locked` if another circuit has the snapshot open
    /// - `Corrupted` if the snapshot fails its integrity checks
    /// - `BackendError` if the directory or the files cannot be used
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| io_err("create store directory", &e))?;
        let lock = SnapshotLock::claim(
            &dir.join(SNAPSHOT_FILE),
            LockOwner::current(config.owner.as_deref()),
        )?;

        // a leftover temp file is an interrupted write; the previous snapshot is intact
        let tmp = dir.join(SNAPSHOT_TMP);
        if tmp.exists() {
            fs::remove_file(&tmp).map_err(|e| io_err("remove stale temp snapshot", &e))?;
        }

        let entries = Self::load(&dir.join(SNAPSHOT_FILE), &config)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            entries: RwLock::new(entries),
            lock,
        })
    }

    /// Directory holding the snapshot.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The owner recorded for this store's snapshot.
    #[must_use]
    pub fn owner(&self) -> &LockOwner {
        self.lock.owner()
    }

    fn load(
        path: &Path,
        config: &PersistentConfig,
    ) -> Result<BTreeMap<String, StoredState>, StorageError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(io_err("open snapshot", &e)),
        };
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader).map_err(|e| io_err("read snapshot header", &e))?;
        let max_len = usize::try_from(config.max_snapshot_size).unwrap_or(usize::MAX);
        codec::decode(&mut reader, max_len).map_err(|e| io_err("decode snapshot", &e))
    }

    fn write_snapshot(&self, entries: &BTreeMap<String, StoredState>) -> Result<(), StorageError> {
        let body = codec::encode(entries).map_err(|e| io_err("encode snapshot", &e))?;
        if body.len() as u64 > self.config.max_snapshot_size {
            return Err(StorageError::BackendError(format!(
                "snapshot size {} exceeds maximum {}",
                body.len(),
                self.config.max_snapshot_size
            )));
        }

        let tmp = self.dir.join(SNAPSHOT_TMP);
        let file = File::create(&tmp).map_err(|e| io_err("create temp snapshot", &e))?;
        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer).map_err(|e| io_err("write snapshot header", &e))?;
        writer
            .write_all(&body)
            .map_err(|e| io_err("write snapshot", &e))?;
        writer.flush().map_err(|e| io_err("flush snapshot", &e))?;
        if self.config.sync_on_write {
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| io_err("sync snapshot", &e))?;
        }
        drop(writer);

        fs::rename(&tmp, self.dir.join(SNAPSHOT_FILE))
            .map_err(|e| io_err("replace snapshot", &e))?;
        if self.config.sync_on_write {
            sync_dir(&self.dir).map_err(|e| io_err("sync store directory", &e))?;
        }
        Ok(())
    }
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    // directory handles cannot be synced here; the rename is flushed with the volume
    Ok(())
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Result<Option<StoredState>, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("file_store.get"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, state: StoredState) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| lock_err("file_store.put"))?;
        let previous = entries.insert(key.to_string(), state);
        if let Err(err) = self.write_snapshot(&entries) {
            // keep memory and disk consistent
            match previous {
                Some(p) => entries.insert(key.to_string(), p),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| lock_err("file_store.remove"))?;
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(err) = self.write_snapshot(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| lock_err("file_store.keys"))?;
        Ok(entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    use crate::value::Value;

    #[test]
    fn test_reopen_sees_previous_writes() {
        let dir = tempdir().unwrap();
        {
            let store = FileStateStore::open(dir.path(), PersistentConfig::default()).unwrap();
            store
                .put("Counter:c", StoredState::new(Value::Int(3), Utc::now()))
                .unwrap();
            store
                .put("Memory:m", StoredState::new(Value::from("x"), Utc::now()))
                .unwrap();
            store.remove("Memory:m").unwrap();
        }

        let store = FileStateStore::open(dir.path(), PersistentConfig::default()).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["Counter:c".to_string()]);
        assert_eq!(store.get("Counter:c").unwrap().unwrap().state, Value::Int(3));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStateStore::open(dir.path(), PersistentConfig::default()).unwrap();
        let err = FileStateStore::open(dir.path(), PersistentConfig::default()).unwrap_err();
        assert!(matches!(err, StorageError::Locked { .. }));
    }

    #[test]
    fn test_store_records_its_owner() {
        let dir = tempdir().unwrap();
        let cfg = PersistentConfig {
            owner: Some("greenhouse".to_string()),
            ..PersistentConfig::default()
        };
        let store = FileStateStore::open(dir.path(), cfg).unwrap();
        assert_eq!(store.owner().label.as_deref(), Some("greenhouse"));
        assert_eq!(store.owner().pid, std::process::id());
    }

    #[test]
    fn test_synced_put_leaves_only_the_snapshot() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::open(dir.path(), PersistentConfig::default()).unwrap();
        store
            .put("Memory:m", StoredState::new(Value::Int(1), Utc::now()))
            .unwrap();

        assert!(dir.path().join(SNAPSHOT_FILE).exists());
        assert!(!dir.path().join(SNAPSHOT_TMP).exists());
        sync_dir(dir.path()).unwrap();
    }

    #[test]
    fn test_oversized_put_is_rolled_back() {
        let dir = tempdir().unwrap();
        let cfg = PersistentConfig {
            max_snapshot_size: 4096,
            ..PersistentConfig::default()
        };
        let store = FileStateStore::open(dir.path(), cfg).unwrap();
        let big = Value::String("x".repeat(8192));
        assert!(store.put("Memory:big", StoredState::new(big, Utc::now())).is_err());
        assert!(store.get("Memory:big").unwrap().is_none());
    }
}
