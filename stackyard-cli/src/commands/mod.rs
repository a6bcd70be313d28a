pub mod agent;
pub mod daemon;
pub mod registry;
pub mod stack;
pub mod units;

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::Value;

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// One-line summary of a unit row returned by the daemon.
pub(crate) fn print_accepted(action: &str, unit: &Value) {
    let field = |key: &str| unit.get(key).and_then(Value::as_str).unwrap_or("?");
    println!(
        "{action}: {} {} ({}) status={}",
        field("kind"),
        field("name"),
        field("id"),
        field("status"),
    );
}
