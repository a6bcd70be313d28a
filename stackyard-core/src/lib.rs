//! stackyard core library: domain types, settings, status store, errors.
//!
//! - [`types`]: unit rows, ids and statuses
//! - [`config`]: [`Settings`] (defaults, `config.yaml`, `STACKYARD_*` env)
//! - [`store`]: [`StatusStore`] contract, file and in-memory stores
//! - [`paths`]: state layout under `~/.stackyard`
//! - [`error`]: [`StoreError`], [`ConfigError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod store;
pub mod types;

pub use config::{Environment, Settings};
pub use error::{ConfigError, StoreError};
pub use store::{FileStatusStore, MemoryStatusStore, StatusStore};
pub use types::{namespace_for, ExternalRefs, LogicalId, Unit, UnitId, UnitKind, UnitStatus};
