//! Entry-point slug detection for extracted agent archives.
//!
//! `detect_slug(root, entry_file, default)` locates the entry file and names
//! the top-level directory that holds the agent's code:
//!
//! - `foo/graph.py` or `foo/src/graph.py` → `foo`
//! - `graph.py` at the root with exactly one top-level directory `bar/` → `bar`
//! - `graph.py` at the root otherwise → `default`
//! - no `graph.py` anywhere → [`StorageError::EntryPointNotFound`]
//!
//! When several entry files exist, the shallowest wins; ties break on path order.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{io_err, StorageError};

/// Detect the slug of the agent extracted at `root`.
pub fn detect_slug(root: &Path, entry_file: &str, default_slug: &str) -> Result<String, StorageError> {
    let entry = find_entry_file(root, entry_file)?.ok_or_else(|| StorageError::EntryPointNotFound {
        root: root.to_path_buf(),
        entry_file: entry_file.to_string(),
    })?;

    let relative = entry.strip_prefix(root).unwrap_or(&entry);
    let mut components = relative.components();
    let first = components.next();
    let nested = components.next().is_some();

    if nested {
        if let Some(first) = first {
            let slug = first.as_os_str().to_string_lossy().into_owned();
            tracing::debug!(entry = %entry.display(), slug, "entry file nested under top-level directory");
            return Ok(slug);
        }
    }

    let dirs = top_level_dirs(root)?;
    if let [only] = dirs.as_slice() {
        tracing::debug!(slug = %only, "entry file at root beside a single directory");
        return Ok(only.clone());
    }
    tracing::debug!(
        top_level_dirs = dirs.len(),
        slug = default_slug,
        "entry file at root, using default slug"
    );
    Ok(default_slug.to_string())
}

/// Shallowest file named `entry_file` under `root`, if any.
pub fn find_entry_file(root: &Path, entry_file: &str) -> Result<Option<PathBuf>, StorageError> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
            io_err(path, std::io::Error::other(e.to_string()))
        })?;
        if !entry.file_type().is_file() || entry.file_name() != entry_file {
            continue;
        }
        let candidate = (entry.depth(), entry.into_path());
        best = match best {
            Some(current) if current <= candidate => Some(current),
            _ => Some(candidate),
        };
    }
    Ok(best.map(|(_, path)| path))
}

/// Whether the entry file resolves where the runtime will look for it.
pub fn entry_point_exists(extracted: &Path, slug: &str, entry_file: &str) -> bool {
    extracted.join(slug).join(entry_file).is_file()
}

fn top_level_dirs(root: &Path) -> Result<Vec<String>, StorageError> {
    let mut dirs: Vec<String> = fs::read_dir(root)
        .map_err(|e| io_err(root, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"graph = None\n").expect("write");
    }

    #[test]
    fn shallowest_entry_file_wins() {
        let dir = TempDir::new().expect("tempdir");
        touch(dir.path(), "zeta/graph.py");
        touch(dir.path(), "alpha/deep/er/graph.py");
        let found = find_entry_file(dir.path(), "graph.py").expect("walk").expect("found");
        assert_eq!(found, dir.path().join("zeta/graph.py"));
    }

    #[test]
    fn directory_named_like_entry_file_is_ignored() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("graph.py")).expect("mkdir");
        assert!(find_entry_file(dir.path(), "graph.py").expect("walk").is_none());
    }

    #[test]
    fn entry_point_exists_checks_slug_path() {
        let dir = TempDir::new().expect("tempdir");
        touch(dir.path(), "support/graph.py");
        assert!(entry_point_exists(dir.path(), "support", "graph.py"));
        assert!(!entry_point_exists(dir.path(), "agent", "graph.py"));
    }
}
