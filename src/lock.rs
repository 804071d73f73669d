//! Cross-process advisory locks keyed by destination path.
//!
//! A lock is a marker file at `{destination}.lock` holding an exclusive
//! `flock`. The marker's existence and modification time are its only state.
//!
//! Acquisition never waits: a held lock reports [`LockError::Busy`] at once,
//! and the caller serves the original image instead. A marker older than the
//! stale timeout is treated as abandoned by a crashed worker and removed
//! before acquiring.
//!
//! Release happens in [`LockGuard`]'s `Drop`, so it runs exactly once on every
//! exit path including unwinding. The marker is unlinked while the lock is
//! still held and the lock is released when the file closes. A competitor
//! that opened the old marker before the unlink will win its `flock` on a
//! file that no longer sits at the path; the inode check after locking turns
//! that into `Busy`.

use filetime::FileTime;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LockError {
    #[error("another conversion holds the lock")]
    Busy,
    #[error("lock IO error: {0}")]
    Io(#[from] io::Error),
}

/// Marker path for a destination: the destination plus `.lock`.
pub fn marker_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

#[derive(Debug, Clone)]
pub struct LockManager {
    stale_after: Duration,
}

impl LockManager {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    /// Try to take the lock for `destination` without blocking.
    pub fn acquire(&self, destination: &Path) -> Result<LockGuard, LockError> {
        let marker = marker_path(destination);
        self.evict_if_stale(&marker);

        let file = lock_marker(&marker)?;
        if let Err(e) = filetime::set_file_mtime(&marker, FileTime::now()) {
            tracing::debug!(marker = %marker.display(), error = %e, "could not refresh lock mtime");
        }
        Ok(LockGuard {
            file: Some(file),
            marker,
        })
    }

    /// Remove `marker` if it is older than the stale timeout.
    ///
    /// Returns `true` when a marker was evicted.
    pub fn evict_if_stale(&self, marker: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(marker) else {
            return false;
        };
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())
            .unwrap_or_default();
        if age <= self.stale_after {
            return false;
        }
        match std::fs::remove_file(marker) {
            Ok(()) => {
                tracing::warn!(
                    marker = %marker.display(),
                    age_secs = age.as_secs(),
                    "removed stale lock"
                );
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(unix)]
fn lock_marker(marker: &Path) -> Result<File, LockError> {
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(marker)?;
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK => Err(LockError::Busy),
            _ => Err(LockError::Io(err)),
        };
    }

    // The holder we raced may have unlinked the marker between our open and
    // our flock; only the inode currently at the path counts.
    let locked = file.metadata()?;
    match std::fs::metadata(marker) {
        Ok(current) if current.ino() == locked.ino() && current.dev() == locked.dev() => Ok(file),
        _ => Err(LockError::Busy),
    }
}

#[cfg(not(unix))]
fn lock_marker(marker: &Path) -> Result<File, LockError> {
    match OpenOptions::new().create_new(true).write(true).open(marker) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(LockError::Busy),
        Err(e) => Err(LockError::Io(e)),
    }
}

/// A held lock. Dropping it releases the lock and deletes the marker.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    marker: PathBuf,
}

impl LockGuard {
    pub fn marker(&self) -> &Path {
        &self.marker
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.marker)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(marker = %self.marker.display(), error = %e, "could not remove lock marker");
        }
        // Closing the descriptor releases the flock.
        drop(self.file.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn manager() -> LockManager {
        LockManager::new(Duration::from_secs(300))
    }

    #[test]
    fn marker_appends_lock_suffix() {
        assert_eq!(
            marker_path(Path::new("/up/photo.avif")),
            PathBuf::from("/up/photo.avif.lock")
        );
    }

    #[test]
    fn second_acquire_is_busy() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("photo.avif");

        let _held = manager().acquire(&dest).unwrap();
        assert!(matches!(manager().acquire(&dest), Err(LockError::Busy)));
    }

    #[test]
    fn release_removes_marker_and_frees_lock() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("photo.avif");

        let guard = manager().acquire(&dest).unwrap();
        assert!(marker_path(&dest).exists());
        drop(guard);
        assert!(!marker_path(&dest).exists());

        assert!(manager().acquire(&dest).is_ok());
    }

    #[test]
    fn release_runs_during_unwind() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("photo.avif");

        let result = std::panic::catch_unwind(|| {
            let _guard = manager().acquire(&dest).unwrap();
            panic!("conversion blew up");
        });
        assert!(result.is_err());
        assert!(!marker_path(&dest).exists());
    }

    #[test]
    fn unheld_leftover_marker_is_not_busy() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("photo.avif");
        std::fs::write(marker_path(&dest), b"").unwrap();

        assert!(manager().acquire(&dest).is_ok());
    }

    #[test]
    fn stale_marker_is_evicted() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("photo.avif");
        let marker = marker_path(&dest);

        // A holder that will never release, with a marker aged past the timeout.
        let _abandoned = manager().acquire(&dest).unwrap();
        let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 600, 0);
        filetime::set_file_mtime(&marker, old).unwrap();

        let fresh = manager().acquire(&dest);
        assert!(fresh.is_ok(), "stale lock should be reclaimed");
    }

    #[test]
    fn fresh_marker_is_kept() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("photo.avif.lock");
        std::fs::write(&marker, b"").unwrap();

        assert!(!manager().evict_if_stale(&marker));
        assert!(marker.exists());
    }

    #[test]
    fn concurrent_acquires_yield_one_holder() {
        let tmp = TempDir::new().unwrap();
        let dest = Arc::new(tmp.path().join("photo.avif"));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dest = Arc::clone(&dest);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let guard = manager().acquire(&dest);
                    let won = guard.is_ok();
                    // Hold until every thread has tried.
                    std::thread::sleep(Duration::from_millis(100));
                    drop(guard);
                    won
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);
    }
}
