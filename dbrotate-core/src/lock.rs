//! Run lock on the local backup root.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::{BackupError, Result};

/// Name of the lock file inside the backup root
pub const LOCK_FILE_NAME: &str = ".dbrotate.lock";

#[derive(Serialize)]
struct LockOwner {
    pid: u32,
    run_id: String,
    acquired_at: String,
}

/// Exclusive lock held for the duration of a run.
///
/// Backed by an OS file lock, so it is released when the process exits for
/// whatever reason; a stale lock file on disk does not block the next run.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock in `root`, creating the directory if needed
    ///
    /// # Errors
    /// `BackupError::Locked` if another run holds it, `BackupError::Io` if
    /// the lock file cannot be opened
    pub fn acquire(root: &Path, run_id: &str) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Err(BackupError::Locked(root.to_path_buf())),
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }

        let owner = LockOwner {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            acquired_at: chrono::Utc::now().to_rfc3339(),
        };
        file.set_len(0)?;
        serde_json::to_writer(&mut file, &owner)?;
        file.flush()?;

        debug!(path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release run lock");
        }
    }
}
