//! Control-plane state layout under the operator's home directory.
//!
//! ```text
//! ~/.stackyard/
//!   config.yaml       (optional settings file)
//!   stackyard.sock    (daemon socket)
//!   units/<id>.yaml   (status store rows: mode 0600)
//!   staging/          (uploaded archives awaiting their lifecycle task)
//! ```

use std::path::{Path, PathBuf};

pub const STATE_DIR: &str = ".stackyard";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DAEMON_SOCKET: &str = "stackyard.sock";

pub fn state_root(home: &Path) -> PathBuf {
    home.join(STATE_DIR)
}

pub fn config_path(home: &Path) -> PathBuf {
    state_root(home).join(CONFIG_FILE)
}

pub fn units_dir(home: &Path) -> PathBuf {
    state_root(home).join("units")
}

pub fn staging_dir(home: &Path) -> PathBuf {
    state_root(home).join("staging")
}

pub fn socket_path(home: &Path) -> PathBuf {
    state_root(home).join(DAEMON_SOCKET)
}
