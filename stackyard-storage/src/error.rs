//! Error types for stackyard-storage.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from local storage and entry-point detection.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The uploaded archive is not a readable zip, or an entry escapes the
    /// destination directory.
    #[error("invalid archive {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive not found: {path}")]
    MissingArchive { path: PathBuf },

    #[error("archive is empty: {path}")]
    EmptyArchive { path: PathBuf },

    #[error("{entry_file} not found in extracted archive at {root}")]
    EntryPointNotFound { root: PathBuf, entry_file: String },
}

impl StorageError {
    /// Problems with the uploaded content itself, as opposed to the disk.
    pub fn is_invalid_upload(&self) -> bool {
        matches!(
            self,
            StorageError::Archive { .. }
                | StorageError::MissingArchive { .. }
                | StorageError::EmptyArchive { .. }
                | StorageError::EntryPointNotFound { .. }
        )
    }
}

/// Convenience constructor for [`StorageError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.into(),
        source,
    }
}
