//! Local storage manager: directories, archive copy and extraction.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use crate::error::{io_err, StorageError};

const PARTIAL_SUFFIX: &str = ".partial";

/// Filesystem side effects of provisioning.
///
/// Every operation tolerates re-invocation against state it already
/// produced: creating an existing directory and deleting an absent one both
/// succeed.
pub trait LocalStorage: Send + Sync {
    fn create_dir(&self, path: &Path) -> Result<(), StorageError>;

    /// Copy `src` to `dest` in full. `dest` only appears once the copy is
    /// complete and flushed.
    fn copy_file(&self, src: &Path, dest: &Path) -> Result<u64, StorageError>;

    /// Extract `archive` into `dest`, replacing any previous extraction.
    /// Returns the number of files written.
    fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<usize, StorageError>;

    fn delete_dir(&self, path: &Path) -> Result<(), StorageError>;
}

/// [`LocalStorage`] on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

impl LocalStorage for FsStorage {
    fn create_dir(&self, path: &Path) -> Result<(), StorageError> {
        fs::create_dir_all(path).map_err(|e| io_err(path, e))?;
        tracing::debug!(path = %path.display(), "directory ready");
        Ok(())
    }

    fn copy_file(&self, src: &Path, dest: &Path) -> Result<u64, StorageError> {
        if !src.is_file() {
            return Err(StorageError::MissingArchive {
                path: src.to_path_buf(),
            });
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let partial = partial_path(dest);
        let result = copy_synced(src, &partial);
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = fs::remove_file(&partial);
                return Err(err);
            }
        };
        fs::rename(&partial, dest).map_err(|e| {
            let _ = fs::remove_file(&partial);
            io_err(dest, e)
        })?;
        tracing::debug!(src = %src.display(), dest = %dest.display(), bytes, "archive copied");
        Ok(bytes)
    }

    fn extract_archive(&self, archive: &Path, dest: &Path) -> Result<usize, StorageError> {
        let file = match File::open(archive) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::MissingArchive {
                    path: archive.to_path_buf(),
                })
            }
            Err(e) => return Err(io_err(archive, e)),
        };
        let len = file.metadata().map_err(|e| io_err(archive, e))?.len();
        if len == 0 {
            return Err(StorageError::EmptyArchive {
                path: archive.to_path_buf(),
            });
        }

        let mut zip = ZipArchive::new(file).map_err(|source| StorageError::Archive {
            path: archive.to_path_buf(),
            source,
        })?;
        if zip.is_empty() {
            return Err(StorageError::EmptyArchive {
                path: archive.to_path_buf(),
            });
        }

        self.delete_dir(dest)?;
        fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;

        let mut written = 0;
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index).map_err(|source| StorageError::Archive {
                path: archive.to_path_buf(),
                source,
            })?;
            let relative = entry.enclosed_name().map(Path::to_path_buf).ok_or_else(|| {
                StorageError::Archive {
                    path: archive.to_path_buf(),
                    source: zip::result::ZipError::InvalidArchive("entry escapes extraction root"),
                }
            })?;
            let target = dest.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            let mut out = File::create(&target).map_err(|e| io_err(&target, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| io_err(&target, e))?;
            written += 1;
        }

        tracing::debug!(
            archive = %archive.display(),
            dest = %dest.display(),
            files = written,
            "archive extracted"
        );
        Ok(written)
    }

    fn delete_dir(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_dir_all(path) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "directory removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "directory already absent");
                Ok(())
            }
            Err(e) => Err(io_err(path, e)),
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

fn copy_synced(src: &Path, partial: &Path) -> Result<u64, StorageError> {
    let mut input = File::open(src).map_err(|e| io_err(src, e))?;
    let mut output = File::create(partial).map_err(|e| io_err(partial, e))?;
    let bytes = io::copy(&mut input, &mut output).map_err(|e| io_err(partial, e))?;
    output.sync_all().map_err(|e| io_err(partial, e))?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn create_and_delete_are_idempotent() {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("stacks").join("s1");
        let storage = FsStorage::new();

        storage.create_dir(&target).expect("create");
        storage.create_dir(&target).expect("create again");
        assert!(target.is_dir());

        storage.delete_dir(&target).expect("delete");
        storage.delete_dir(&target).expect("delete absent");
        assert!(!target.exists());
    }

    #[test]
    fn copy_leaves_no_partial_file() {
        let dir = TempDir::new().expect("tempdir");
        let src = dir.path().join("upload.zip");
        fs::write(&src, b"PK-not-really").expect("write");
        let dest = dir.path().join("agents").join("a1").join("agent.zip");

        let bytes = FsStorage.copy_file(&src, &dest).expect("copy");
        assert_eq!(bytes, 13);
        assert_eq!(fs::read(&dest).expect("read"), b"PK-not-really");
        assert!(!partial_path(&dest).exists());
    }

    #[test]
    fn copy_of_missing_source_is_missing_archive() {
        let dir = TempDir::new().expect("tempdir");
        let err = FsStorage
            .copy_file(&dir.path().join("nope.zip"), &dir.path().join("agent.zip"))
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingArchive { .. }), "got: {err}");
        assert!(err.is_invalid_upload());
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/x/agent.zip")),
            PathBuf::from("/x/agent.zip.partial")
        );
    }
}
