//! Single-instance lock.
//!
//! Directory-based by convention: `create_dir` is atomic on every
//! platform we run on, so whoever creates the lock directory owns the
//! run. The pid file inside is diagnostic only.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

pub struct SingleInstanceLock {
    path: PathBuf,
}

impl SingleInstanceLock {
    /// Acquire the lock or fail if another runner holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock parent {parent:?}"))?;
        }
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                bail!("another paper runner holds the lock at {path:?}");
            }
            Err(e) => {
                return Err(e).with_context(|| format!("create lock dir {path:?}"));
            }
        }
        let _ = fs::write(path.join("pid"), std::process::id().to_string());
        Ok(Self { path })
    }
}

impl Drop for SingleInstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.join("pid"));
        let _ = fs::remove_dir(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("paper_runner.lock");

        let first = SingleInstanceLock::acquire(&lock_path).unwrap();
        let second = SingleInstanceLock::acquire(&lock_path);
        assert!(second.is_err());

        drop(first);
        let third = SingleInstanceLock::acquire(&lock_path);
        assert!(third.is_ok());
    }
}
