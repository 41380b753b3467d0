use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::Path;

use fs4::FileExt;

use crate::error::MigrationError;
use crate::paths::LOCK_FILE;

/// Exclusive advisory lock over a repository, held until dropped.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
}

impl RepoLock {
    /// Takes `<root>/repo.lock` without blocking.
    pub fn acquire(root: &Path) -> Result<Self, MigrationError> {
        let path = root.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| MigrationError::Filesystem {
                context: "cannot open lock file",
                path: path.clone(),
                source,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file }),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                Err(MigrationError::Locked { path: root.to_path_buf() })
            }
            Err(source) => Err(MigrationError::Filesystem {
                context: "cannot lock",
                path,
                source,
            }),
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        // Closing the handle releases the lock as well.
        let _ = FileExt::unlock(&self.file);
    }
}
