//! Transient dump artifact management.
//!
//! Dump files carry credentials and row data, so they are created with
//! restrictive permissions and overwritten before deletion during cleanup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::Result;

/// Owner of all temporary artifacts for one run.
#[derive(Debug)]
pub struct TempStore {
    dir: PathBuf,
    files: Mutex<Vec<PathBuf>>,
}

impl TempStore {
    /// Create a store rooted at `dir` (created if missing).
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            files: Mutex::new(Vec::new()),
        })
    }

    /// Reserve a path for a named artifact and register it for cleanup.
    ///
    /// The file itself is created by whoever writes it (usually `pg_dump`);
    /// an empty placeholder is created first so permissions are restrictive
    /// before any content lands.
    pub fn create(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.join(name);
        fs::File::create(&path)?;
        restrict_permissions(&path)?;
        self.files
            .lock()
            .expect("temp file lock poisoned")
            .push(path.clone());
        Ok(path)
    }

    /// Delete every registered artifact, best-effort, overwriting first.
    pub fn cleanup(&self) {
        let files = std::mem::take(&mut *self.files.lock().expect("temp file lock poisoned"));
        for path in files {
            if let Err(e) = shred(&path) {
                warn!("failed to remove temp artifact {:?}: {}", path, e);
            } else {
                debug!("removed temp artifact {:?}", path);
            }
        }
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Overwrite a file with zeros, then remove it. Overwrite failures are not
/// fatal to removal.
fn shred(path: &Path) -> std::io::Result<()> {
    if let Ok(meta) = fs::metadata(path) {
        let len = meta.len() as usize;
        if len > 0 {
            let _ = fs::write(path, vec![0u8; len]);
        }
    }
    fs::remove_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_cleanup_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path().join("run")).unwrap();
        let a = store.create("schema.sql").unwrap();
        let b = store.create("data.sql").unwrap();
        fs::write(&a, "CREATE TABLE t ();").unwrap();
        assert!(a.exists() && b.exists());

        store.cleanup();
        assert!(!a.exists());
        assert!(!b.exists());
    }

    #[cfg(unix)]
    #[test]
    fn artifacts_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path()).unwrap();
        let path = store.create("roles.sql").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempStore::new(dir.path()).unwrap();
        store.create("x.sql").unwrap();
        store.cleanup();
        store.cleanup();
    }
}
