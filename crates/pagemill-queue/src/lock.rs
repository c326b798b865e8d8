//! Advisory lock guarding manifest read-modify-write cycles
//!
//! The lock is a sibling file (`<manifest>.lock`) whose contents are never
//! read. On Unix it is held with `flock(2)`, which the kernel releases when the
//! holder exits, so a crashed worker never leaves the manifest locked. Locks
//! attach to the open file description: two handles opened independently
//! contend even inside one process.
//!
//! Only cooperating processes are excluded; nothing stops a writer that does
//! not take the lock.

use crate::error::{QueueError, Result};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Suffix appended to a manifest path to name its lock file
pub const LOCK_SUFFIX: &str = ".lock";

/// Exclusive lock associated 1:1 with a manifest path
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    path: PathBuf,
    poll_interval: Duration,
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
    acquired_at: Instant,
}

impl AdvisoryLock {
    /// Lock for `manifest`, stored at `<manifest>.lock`
    pub fn for_manifest(manifest: impl AsRef<Path>, poll_interval: Duration) -> Self {
        let mut raw = manifest.as_ref().as_os_str().to_owned();
        raw.push(LOCK_SUFFIX);
        Self {
            path: PathBuf::from(raw),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held or `timeout` elapses
    ///
    /// Polls with a non-blocking attempt, doubling the pause up to ten times the
    /// configured poll interval.
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let started = Instant::now();
        let max_pause = self.poll_interval * 10;
        let mut pause = self.poll_interval;

        loop {
            if let Some(guard) = self.try_acquire()? {
                debug!(lock = %self.path.display(), waited_ms = started.elapsed().as_millis() as u64, "lock acquired");
                return Ok(guard);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(QueueError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }

            trace!(lock = %self.path.display(), "lock busy");
            std::thread::sleep(pause.min(timeout - waited));
            pause = (pause * 2).min(max_pause);
        }
    }

    /// One non-blocking attempt; `Ok(None)` when another holder has it
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        match sys::try_lock(&self.path)? {
            Some(file) => Ok(Some(LockGuard {
                file: Some(file),
                path: self.path.clone(),
                acquired_at: Instant::now(),
            })),
            None => Ok(None),
        }
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly; equivalent to dropping the guard
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            sys::unlock(file, &self.path);
            trace!(
                lock = %self.path.display(),
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                "lock released"
            );
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
}

#[cfg(unix)]
mod sys {
    use super::open_lock_file;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;
    use std::path::Path;

    pub(super) fn try_lock(path: &Path) -> io::Result<Option<File>> {
        let file = open_lock_file(path)?;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(file));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK || code == libc::EINTR => Ok(None),
            _ => Err(err),
        }
    }

    pub(super) fn unlock(file: File, _path: &Path) {
        // SAFETY: as above. Closing the descriptor would release the lock too;
        // unlocking first makes the release independent of other clones.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::path::Path;

    // Exclusive creation of the lock file stands in for flock. A crashed
    // holder leaves the file behind and it has to be removed by hand.
    pub(super) fn try_lock(path: &Path) -> io::Result<Option<File>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub(super) fn unlock(file: File, path: &Path) {
        drop(file);
        let _ = std::fs::remove_file(path);
    }
}
