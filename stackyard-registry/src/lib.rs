//! # stackyard-registry
//!
//! Lock-guarded, crash-safe access to the graph registry file shared with the
//! agent runtime.
//!
//! [`GraphRegistry::upsert`] and [`GraphRegistry::remove`] rewrite the whole
//! document under an advisory lock and swap it in with a single rename, so a
//! reader never observes a half-written file.

pub mod error;
pub mod lock;
pub mod registry;

pub use error::RegistryError;
pub use lock::{lock_path_for, RegistryLock};
pub use registry::{GraphMap, GraphRegistry, RegistryDocument, Validation};
