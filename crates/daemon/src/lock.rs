//! Single-instance lock (`spec.md` §5): prevents two daemons from sharing
//! the same `rusb::Context` and driver state by claiming an exclusive
//! advisory lock on a file in the config directory at process start.
//!
//! Grounded in the teacher's... no, not the teacher: nothing under
//! `server/`/`client/`/`common/` takes any kind of process lock. The
//! precedent is `DirLock` (`examples/dennisss-dacha/pkg/common/src/fs/dir_lock.rs`),
//! which holds an exclusive lock via `fs2::FileExt::try_lock_exclusive()`
//! on a `std::fs::File` for as long as the struct lives, releasing it on
//! `Drop`. This keeps that shape: a file opened once, locked once, kept
//! alive only to hold the OS-level lock.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Holds an exclusive advisory lock on `usbipd.lock` in the config
/// directory for the life of the process. Dropping it releases the lock.
pub struct SingleInstanceLock {
    _file: File,
    path: PathBuf,
}

impl SingleInstanceLock {
    /// Acquires the lock at `<config_dir>/usbipd.lock`, creating the file
    /// (and its parent directory) if needed. Fails if another process
    /// already holds it.
    pub fn acquire(config_dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(config_dir)?;
        let path = config_dir.join("usbipd.lock");

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!(
                    "another usbipd instance already holds the lock at {}",
                    path.display()
                ),
            )
        })?;

        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self._file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_in_same_dir_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = SingleInstanceLock::acquire(dir.path()).unwrap();
        let second = SingleInstanceLock::acquire(dir.path());
        assert!(second.is_err());
        drop(first);
        assert!(SingleInstanceLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn creates_missing_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested").join("config");
        let lock = SingleInstanceLock::acquire(&nested).unwrap();
        assert!(lock.path().exists());
    }
}
