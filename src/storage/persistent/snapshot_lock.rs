//! Ownership of a snapshot file.
//!
//! A snapshot is written by one circuit at a time. The owner holds an OS
//! lock on `<snapshot>.lock` and records itself there, so a second circuit
//! opening the same snapshot learns who is using it.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Who holds a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Process id of the owner.
    pub pid: u32,
    /// Free-form label, see [`PersistentConfig::owner`](super::PersistentConfig::owner).
    pub label: Option<String>,
    /// When the snapshot was claimed.
    pub since: DateTime<Utc>,
}

impl LockOwner {
    pub(crate) fn current(label: Option<&str>) -> Self {
        Self {
            pid: std::process::id(),
            label: label.map(str::to_string),
            since: Utc::now(),
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.pid)?;
        if let Some(label) = &self.label {
            write!(f, " ({label})")?;
        }
        write!(f, " since {}", self.since.to_rfc3339())
    }
}

/// Held while a `FileStateStore` has its snapshot open.
#[derive(Debug)]
pub(crate) struct SnapshotLock {
    file: File,
    owner: LockOwner,
}

fn lock_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn backend(context: &str, err: &io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

impl SnapshotLock {
    /// Claims `snapshot` for `owner` without waiting.
    ///
    /// # Errors
    /// `Locked` naming the current holder if the snapshot is taken,
    /// `BackendError` if the lock file cannot be used.
    pub(crate) fn claim(snapshot: &Path, owner: LockOwner) -> Result<Self, StorageError> {
        let path = lock_path(snapshot);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| backend("open snapshot lock", &e))?;

        if !try_claim(&file).map_err(|e| backend("lock snapshot", &e))? {
            let holder = fs::read(&path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<LockOwner>(&raw).ok())
                .map_or_else(|| "an unknown owner".to_string(), |o| o.to_string());
            return Err(StorageError::Locked {
                snapshot: snapshot.display().to_string(),
                holder,
            });
        }

        let record = serde_json::to_vec(&owner)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        write_record(&mut file, &record).map_err(|e| backend("record snapshot owner", &e))?;
        tracing::debug!(snapshot = %snapshot.display(), %owner, "snapshot claimed");
        Ok(Self { file, owner })
    }

    pub(crate) fn owner(&self) -> &LockOwner {
        &self.owner
    }
}

impl Drop for SnapshotLock {
    fn drop(&mut self) {
        // the OS lock goes with the handle; a stale record is only informative
        if let Err(err) = self.file.set_len(0) {
            tracing::debug!(error = %err, "could not clear the snapshot owner record");
        }
    }
}

fn write_record(file: &mut File, record: &[u8]) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(record)?;
    file.sync_data()
}

/// Returns false if someone else holds the lock.
#[cfg(unix)]
fn try_claim(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Returns false if someone else holds the lock.
#[cfg(windows)]
fn try_claim(file: &File) -> io::Result<bool> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data and may be zeroed.
    let ok = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if ok != 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(any(unix, windows)))]
fn try_claim(_file: &File) -> io::Result<bool> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "snapshot locking is not supported on this platform",
    ))
}
