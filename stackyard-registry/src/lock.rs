//! Advisory lock on the registry's sibling lock file.
//!
//! The lock is an exclusive `flock` on `<registry>.lock`, held for the
//! lifetime of a [`RegistryLock`] guard and released on drop. It only
//! coordinates cooperating writers; the consuming runtime reads without it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{io_err, RegistryError};

pub const LOCK_SUFFIX: &str = ".lock";

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// `<registry>.lock` next to the registry file.
pub fn lock_path_for(registry: &Path) -> PathBuf {
    let mut name = registry
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(LOCK_SUFFIX);
    registry.with_file_name(name)
}

/// Held exclusive lock. Dropping the guard releases it.
#[derive(Debug)]
pub struct RegistryLock {
    file: File,
    path: PathBuf,
}

impl RegistryLock {
    /// Wait up to `timeout` for the exclusive lock on `path`.
    ///
    /// Creates the lock file (and its parent directory) if needed.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err(path, e))?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    tracing::trace!(path = %path.display(), "registry lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if is_contended(&err) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(RegistryError::LockTimeout {
                            path: path.to_path_buf(),
                            waited,
                        });
                    }
                    sleep(POLL_INTERVAL.min(timeout - waited));
                }
                Err(err) => return Err(io_err(path, err)),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release registry lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_path_appends_suffix() {
        let path = lock_path_for(Path::new("/var/platform/runtime/graphs.json"));
        assert_eq!(path, PathBuf::from("/var/platform/runtime/graphs.json.lock"));
    }

    #[test]
    fn second_holder_times_out() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("graphs.json.lock");
        let _held = RegistryLock::acquire(&path, Duration::from_secs(1)).expect("first");

        let started = Instant::now();
        let err = RegistryLock::acquire(&path, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout { .. }), "got: {err}");
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn drop_releases_lock() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("graphs.json.lock");
        {
            let held = RegistryLock::acquire(&path, Duration::from_secs(1)).expect("first");
            assert_eq!(held.path(), path.as_path());
        }
        RegistryLock::acquire(&path, Duration::from_millis(100)).expect("re-acquire after drop");
    }
}
