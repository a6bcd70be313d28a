//! Error types for stackyard-registry.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// All errors that can arise from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file exists but is not a valid registry document.
    ///
    /// Distinct from [`RegistryError::Io`] so callers can choose between
    /// repairing and rewriting the file.
    #[error("registry at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// Another holder kept the advisory lock past the wait bound.
    #[error("timed out after {waited:?} waiting for registry lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// JSON serialization error (write path).
    #[error("registry JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    /// Lock contention is worth retrying later; corruption and I/O are not
    /// fixed by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::LockTimeout { .. })
    }
}

/// Convenience constructor for [`RegistryError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.into(),
        source,
    }
}
