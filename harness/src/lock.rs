//! Worker lock: OS advisory lock for the single-worker guarantee
//!
//! A scoped guard around `File::try_lock`. The lock file records the
//! holder's pid and start time for diagnostics; the actual mutual
//! exclusion comes from the OS advisory lock, which the kernel releases
//! even when the process dies without running destructors.

use std::fs::{File, OpenOptions, TryLockError};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};

/// Contents of the lock file, informational only.
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: chrono::DateTime<Utc>,
}

/// Held advisory lock. Dropping the guard releases the lock and removes
/// the lock file.
#[derive(Debug)]
pub struct WorkerLock {
    file: File,
    path: PathBuf,
}

impl WorkerLock {
    /// Try to acquire the lock, failing immediately when another process
    /// holds it. The error carries the holder's pid when readable.
    pub fn acquire(path: &Path) -> HarnessResult<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                let mut contents = String::new();
                let pid = file
                    .read_to_string(&mut contents)
                    .ok()
                    .and_then(|_| serde_json::from_str::<LockInfo>(&contents).ok())
                    .map(|info| info.pid);
                return Err(HarnessError::LockHeld {
                    path: path.to_path_buf(),
                    pid,
                });
            }
            Err(TryLockError::Error(e)) => return Err(HarnessError::Io(e)),
        }

        let info = LockInfo {
            pid: std::process::id(),
            started_at: Utc::now(),
        };
        file.set_len(0)?;
        file.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        file.flush()?;
        debug!(path = %path.display(), pid = info.pid, "worker lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release worker lock");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock file");
        }
        debug!(path = %self.path.display(), "worker lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");

        {
            let lock = WorkerLock::acquire(&path).unwrap();
            assert!(lock.path().exists());

            // The recorded pid is ours
            let contents = std::fs::read_to_string(&path).unwrap();
            let info: LockInfo = serde_json::from_str(&contents).unwrap();
            assert_eq!(info.pid, std::process::id());
        }

        // Guard dropped: file gone, lock reacquirable
        assert!(!path.exists());
        let _again = WorkerLock::acquire(&path).unwrap();
    }

    #[test]
    fn test_second_acquire_in_process_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");

        let _held = WorkerLock::acquire(&path).unwrap();
        let err = WorkerLock::acquire(&path).unwrap_err();
        assert!(matches!(err, HarnessError::LockHeld { .. }));
    }

    #[test]
    fn test_lock_held_reports_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.lock");

        let _held = WorkerLock::acquire(&path).unwrap();
        match WorkerLock::acquire(&path).unwrap_err() {
            HarnessError::LockHeld { pid, .. } => {
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected LockHeld, got {other}"),
        }
    }
}
