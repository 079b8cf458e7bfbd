//! Store directory layout and locking.
//!
//! ```text
//! <store>/
//! ├─ LOCK          # advisory lock held by the owning process
//! └─ journal.log   # append-only journal
//! ```

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";

/// An exclusively locked store directory. The lock is released on drop.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock: File,
}

impl StoreDir {
    /// Opens the directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another process holds the lock and
    /// [`StoreError::NotFound`] if the directory is missing and
    /// `create_if_missing` is false.
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if !create_if_missing {
                return Err(StoreError::not_found(format!(
                    "store directory {}",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(StoreError::constraint(format!(
                "{} is not a directory",
                path.display()
            )));
        }

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| StoreError::Locked)?;

        Ok(Self {
            path: path.to_path_buf(),
            _lock: lock,
        })
    }

    /// Root path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }
}
