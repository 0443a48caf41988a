//! Per-tape advisory file locks.
//!
//! Writes to a tape are gated by an exclusive OS-level lock (via fs2) on a
//! `.lockfile` sibling, so concurrent sessions sharing a tapes root
//! serialize their writes. The lock is released when the guard drops.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::error::{Error, Result};

/// Delay between lock acquisition attempts.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// An acquired exclusive lock for one tape path.
///
/// The OS lock is released when this guard is dropped.
pub struct TapeLock {
    _file: std::fs::File,
    lock_path: PathBuf,
}

impl TapeLock {
    /// Acquire the lock for `tape_path`, retrying up to `retries` times.
    ///
    /// The lock file is a sibling named `<file>.lockfile`; it is created if
    /// missing and intentionally left in place after release.
    pub fn acquire(tape_path: &Path, retries: u32) -> Result<Self> {
        let lock_path = lockfile_path(tape_path);
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| Error::TapeIo {
                path: tape_path.to_path_buf(),
                op: "mkdir",
                source,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|source| Error::TapeIo {
                path: tape_path.to_path_buf(),
                op: "open lockfile",
                source,
            })?;

        let mut attempts = 0u32;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::debug!(lock = %lock_path.display(), "acquired tape lock");
                    return Ok(Self {
                        _file: file,
                        lock_path,
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if attempts >= retries {
                        return Err(Error::TapeLock {
                            path: tape_path.to_path_buf(),
                        });
                    }
                    attempts += 1;
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(source) => {
                    return Err(Error::TapeIo {
                        path: tape_path.to_path_buf(),
                        op: "lock",
                        source,
                    });
                }
            }
        }
    }

    /// Path of the lock file backing this guard.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

/// Compute the `.lockfile` sibling for a tape path.
#[must_use]
pub fn lockfile_path(tape_path: &Path) -> PathBuf {
    let mut name = tape_path
        .file_name()
        .map_or_else(|| "tape".to_string(), |n| n.to_string_lossy().into_owned());
    name.push_str(".lockfile");
    tape_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lockfile_path_is_a_sibling() {
        let path = Path::new("/tapes/sqlite3/unnamed-1.json5");
        assert_eq!(
            lockfile_path(path),
            Path::new("/tapes/sqlite3/unnamed-1.json5.lockfile")
        );
    }

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let tape = dir.path().join("t.json5");
        let lock = TapeLock::acquire(&tape, 0).unwrap();
        assert!(lock.lock_path().exists());
        drop(lock);
        // Re-acquirable after release.
        let _again = TapeLock::acquire(&tape, 0).unwrap();
    }

    #[test]
    fn contended_lock_exhausts_retry_budget() {
        let dir = TempDir::new().unwrap();
        let tape = dir.path().join("t.json5");
        let _held = TapeLock::acquire(&tape, 0).unwrap();
        let result = TapeLock::acquire(&tape, 1);
        assert!(matches!(result, Err(Error::TapeLock { .. })));
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = TempDir::new().unwrap();
        let tape = dir.path().join("deep/nested/t.json5");
        let lock = TapeLock::acquire(&tape, 0).unwrap();
        assert!(lock.lock_path().exists());
    }
}
