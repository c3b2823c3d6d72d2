use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::LockError;

/// Exclusive advisory lock scoped to a merge output path.
///
/// The lock lives on a `.lock` sibling of the output file and is held until
/// the value is dropped. Acquisition never waits: a second merge for the same
/// output fails immediately with [`LockError::AlreadyLocked`].
#[derive(Debug)]
pub struct MergeLock {
    file: File,
    path: PathBuf,
}

impl MergeLock {
    pub fn try_acquire_exclusive(target: &Path) -> Result<Self, LockError> {
        let path = target.with_extension("lock");
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| LockError::Io {
                path: path.clone(),
                source,
            })?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "Acquired merge lock");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(LockError::AlreadyLocked { path })
            }
            Err(source) => Err(LockError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MergeLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release merge lock");
        }
    }
}
