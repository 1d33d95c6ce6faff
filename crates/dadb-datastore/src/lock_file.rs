//! Advisory, per-process exclusive lock on a repository file.
//!
//! DADB has no cross-process coordination story, so a second concurrent open
//! is refused outright rather than made to wait.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::StoreError;

pub struct RepoLock {
    path: PathBuf,
    file: File,
}

impl RepoLock {
    /// Acquires an exclusive lock on `<db_path>.lock`, creating it if necessary.
    pub fn acquire(db_path: &Path) -> Result<Self, StoreError> {
        let path = lock_path(db_path);
        let file = File::create(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| StoreError::RepositoryBusy(db_path.to_path_buf()))?;
        log::debug!("acquired repository lock at {}", path.display());
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path(db_path: &Path) -> PathBuf {
    let mut os_string = db_path.as_os_str().to_os_string();
    os_string.push(".lock");
    PathBuf::from(os_string)
}
