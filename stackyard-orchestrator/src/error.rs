use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use stackyard_core::{StoreError, UnitId, UnitKind, UnitStatus};
use stackyard_registry::RegistryError;
use stackyard_storage::StorageError;

use crate::lifecycle::Step;

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

/// Classification of a failed lifecycle step.
///
/// "Already exists" and "not found" answers from the control plane are not
/// failures; they arrive as outcomes (`NamespaceCreated`, `NamespaceDeletion`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout or connection failure against an external system.
    TransientExternal,
    /// Registry content is present but malformed.
    CorruptRegistry,
    /// The unit's own input is unusable (missing entry point, empty upload).
    ValidationFailure,
    /// Registry lock not acquired within its bound.
    LockTimeout,
    /// Local filesystem or status store failure.
    Io,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::TransientExternal => "transient_external",
            FailureKind::CorruptRegistry => "corrupt_registry",
            FailureKind::ValidationFailure => "validation_failure",
            FailureKind::LockTimeout => "lock_timeout",
            FailureKind::Io => "io",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("no control plane configured")]
    Unavailable,

    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} answered HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Why a lifecycle step failed.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{step}: {source}")]
    ControlPlane {
        step: Step,
        #[source]
        source: ControlPlaneError,
    },

    #[error("{step}: {source}")]
    Storage {
        step: Step,
        #[source]
        source: StorageError,
    },

    #[error("{step}: {source}")]
    Registry {
        step: Step,
        #[source]
        source: RegistryError,
    },

    #[error("registry failed validation after write: {reason}")]
    RegistryInvalid { reason: String },

    #[error("status store: {0}")]
    Store(#[from] StoreError),

    #[error("entry point not found at {path}")]
    EntryPointMissing { path: PathBuf },

    #[error("{kind} {id} has no parent stack")]
    Orphan { id: UnitId, kind: UnitKind },

    #[error("{step} timed out after {after:?}")]
    Timeout { step: Step, after: Duration },

    #[error("{step} worker panicked: {message}")]
    Panicked { step: Step, message: String },

    #[error("worker pool closed")]
    PoolClosed,
}

impl ProvisionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProvisionError::ControlPlane { .. }
            | ProvisionError::Timeout { .. }
            | ProvisionError::PoolClosed => FailureKind::TransientExternal,
            ProvisionError::Storage { source, .. } if source.is_invalid_upload() => {
                FailureKind::ValidationFailure
            }
            ProvisionError::Storage { .. } => FailureKind::Io,
            ProvisionError::Registry { source, .. } => match source {
                RegistryError::Corrupt { .. } => FailureKind::CorruptRegistry,
                RegistryError::LockTimeout { .. } => FailureKind::LockTimeout,
                RegistryError::Io { .. } | RegistryError::Json(_) => FailureKind::Io,
            },
            ProvisionError::RegistryInvalid { .. } => FailureKind::CorruptRegistry,
            ProvisionError::EntryPointMissing { .. } | ProvisionError::Orphan { .. } => {
                FailureKind::ValidationFailure
            }
            ProvisionError::Store(_) | ProvisionError::Panicked { .. } => FailureKind::Io,
        }
    }

    pub(crate) fn control_plane(step: Step) -> impl FnOnce(ControlPlaneError) -> Self {
        move |source| ProvisionError::ControlPlane { step, source }
    }

    pub(crate) fn storage(step: Step) -> impl FnOnce(StorageError) -> Self {
        move |source| ProvisionError::Storage { step, source }
    }

    pub(crate) fn registry(step: Step) -> impl FnOnce(RegistryError) -> Self {
        move |source| ProvisionError::Registry { step, source }
    }
}

// ---------------------------------------------------------------------------
// Fast path
// ---------------------------------------------------------------------------

/// Synchronous request failures, returned to the caller.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unit {0} not found")]
    NotFound(UnitId),

    #[error("unit {id} is not a {expected}")]
    WrongKind { id: UnitId, expected: UnitKind },

    #[error("an agent named '{name}' already exists in stack {stack_id}")]
    Conflict { stack_id: UnitId, name: String },

    #[error("unit {id} is busy ({status})")]
    Busy { id: UnitId, status: UnitStatus },

    #[error("unit {id} is {status}; only failed units can be retried")]
    NotRetryable { id: UnitId, status: UnitStatus },

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    #[error("failed to stage upload at {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("status store: {0}")]
    Store(#[from] StoreError),

    #[error("task queue is full")]
    QueueFull,

    #[error("task queue is closed")]
    QueueClosed,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Error surface for the daemon runtime and its socket protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] stackyard_core::ConfigError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_split_between_validation_and_io() {
        let upload = ProvisionError::Storage {
            step: Step::ExtractArchive,
            source: StorageError::EmptyArchive {
                path: PathBuf::from("/tmp/a.zip"),
            },
        };
        assert_eq!(upload.kind(), FailureKind::ValidationFailure);

        let disk = ProvisionError::Storage {
            step: Step::AllocateStorage,
            source: StorageError::Io {
                path: PathBuf::from("/var/agent-platform"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
        };
        assert_eq!(disk.kind(), FailureKind::Io);
    }

    #[test]
    fn registry_errors_keep_corruption_and_lock_timeout_apart() {
        let corrupt = ProvisionError::Registry {
            step: Step::RegistryUpsert,
            source: RegistryError::Corrupt {
                path: PathBuf::from("graphs.json"),
                reason: "truncated".to_string(),
            },
        };
        let busy = ProvisionError::Registry {
            step: Step::RegistryUpsert,
            source: RegistryError::LockTimeout {
                path: PathBuf::from("graphs.json.lock"),
                waited: Duration::from_secs(30),
            },
        };
        assert_eq!(corrupt.kind(), FailureKind::CorruptRegistry);
        assert_eq!(busy.kind(), FailureKind::LockTimeout);
    }

    #[test]
    fn timeouts_are_transient() {
        let err = ProvisionError::Timeout {
            step: Step::CreateNamespace,
            after: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), FailureKind::TransientExternal);
        assert_eq!(err.kind().to_string(), "transient_external");
    }
}
