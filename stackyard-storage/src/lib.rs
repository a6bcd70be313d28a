//! Local storage for provisioned agents.
//!
//! - [`layout`]: where stacks and agents live under the platform root
//! - [`manager`]: [`LocalStorage`] contract and the [`FsStorage`] adapter
//! - [`slug`]: entry-point slug detection in extracted archives

pub mod error;
pub mod layout;
pub mod manager;
pub mod slug;

pub use error::StorageError;
pub use layout::{CodePath, StorageLayout, ARCHIVE_FILE, EXTRACTED_DIR};
pub use manager::{FsStorage, LocalStorage};
pub use slug::{detect_slug, entry_point_exists, find_entry_file};
