//! Exclusive cycle lock
//!
//! A lock file next to the store, created with `create_new`; a second
//! cycle fails fast instead of waiting. The file holds the owner's pid and
//! is removed when the guard drops.

use crate::error::{LiquidityError, Result};
use log::{info, warn};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Guard for the single-writer cycle lock
#[derive(Debug)]
pub struct CycleLock {
    path: PathBuf,
}

impl CycleLock {
    /// Take the lock or fail with `CycleInProgress`
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(LiquidityError::CycleInProgress(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "{}", std::process::id())?;
        info!("Acquired cycle lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pid recorded in an existing lock file
    pub fn holder(path: &Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => info!("Released cycle lock {}", self.path.display()),
            Err(e) => warn!("Failed to remove cycle lock {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails_fast() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cycle.lock");

        let guard = CycleLock::acquire(&path).unwrap();
        assert_eq!(CycleLock::holder(&path), Some(std::process::id()));

        let err = CycleLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LiquidityError::CycleInProgress(_)));
        assert_eq!(err.exit_code(), 3);

        drop(guard);
        assert!(!path.exists());
        let _again = CycleLock::acquire(&path).unwrap();
    }
}
