//! The shared graph registry: one JSON document mapping logical ids to code
//! paths, read by the agent runtime.
//!
//! ## Document
//!
//! ```json
//! { "graphs": { "<stack_id>__<agent_id>": "./graphs/<stack_id>/agents/<agent_id>/extracted/<slug>/graph.py:graph" } }
//! ```
//!
//! Top-level keys other than `graphs` belong to the runtime and are carried
//! through every rewrite untouched.
//!
//! ## `commit`: write protocol
//!
//! 1. Hold the advisory lock (`<registry>.lock`).
//! 2. Merge the change into the in-memory document.
//! 3. Serialize the whole document into a fresh sibling temp file.
//! 4. `fsync` the temp file.
//! 5. Re-parse the temp file from disk.
//! 6. Rename over the canonical path (atomic on POSIX).
//! 7. Best-effort `fsync` of the parent directory.
//! 8. Release the lock (guard drop).
//!
//! A failure before step 6 leaves the canonical file untouched; the temp file
//! is removed when its handle drops.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use stackyard_core::LogicalId;

use crate::error::{io_err, RegistryError};
use crate::lock::{lock_path_for, RegistryLock};

pub const GRAPHS_KEY: &str = "graphs";

pub const DEFAULT_WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READ_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// logical id → code path.
pub type GraphMap = BTreeMap<String, String>;

/// On-disk registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub graphs: GraphMap,
    /// Runtime-owned keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of [`GraphRegistry::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid { reason: String },
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validation::Valid)
    }

    /// `(ok, reason)`; `reason` is empty when valid.
    pub fn into_parts(self) -> (bool, String) {
        match self {
            Validation::Valid => (true, String::new()),
            Validation::Invalid { reason } => (false, reason),
        }
    }

    fn invalid(reason: impl Into<String>) -> Self {
        Validation::Invalid {
            reason: reason.into(),
        }
    }
}

/// Handle to the registry file. Cheap to clone; holds no open descriptors.
#[derive(Debug, Clone)]
pub struct GraphRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    write_lock_timeout: Duration,
    read_lock_timeout: Duration,
}

impl GraphRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            write_lock_timeout: DEFAULT_WRITE_LOCK_TIMEOUT,
            read_lock_timeout: DEFAULT_READ_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeouts(mut self, write: Duration, read: Duration) -> Self {
        self.write_lock_timeout = write;
        self.read_lock_timeout = read;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Current mapping, without the lock.
    ///
    /// A missing or blank file reads as an empty mapping and creates nothing.
    pub fn read(&self) -> Result<GraphMap, RegistryError> {
        Ok(self.load_document()?.graphs)
    }

    /// [`read`](Self::read) under the shorter-bound lock.
    pub fn read_consistent(&self) -> Result<GraphMap, RegistryError> {
        let _lock = RegistryLock::acquire(&self.lock_path, self.read_lock_timeout)?;
        self.read()
    }

    /// The whole document, without the lock.
    pub fn load_document(&self) -> Result<RegistryDocument, RegistryError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryDocument::default())
            }
            Err(e) => return Err(io_err(&self.path, e)),
        };
        parse_document(&self.path, &contents)
    }

    /// Structural check of the file on disk. Never mutates.
    pub fn validate(&self) -> Validation {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Validation::invalid("file does not exist")
            }
            Err(e) => return Validation::invalid(format!("error reading file: {e}")),
        };
        let value: Value = match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(e) => return Validation::invalid(format!("invalid JSON: {e}")),
        };
        let Some(object) = value.as_object() else {
            return Validation::invalid("document is not a JSON object");
        };
        let Some(graphs) = object.get(GRAPHS_KEY) else {
            return Validation::invalid("missing 'graphs' key");
        };
        let Some(graphs) = graphs.as_object() else {
            return Validation::invalid("'graphs' is not an object");
        };
        if let Some((key, _)) = graphs.iter().find(|(_, v)| !v.is_string()) {
            return Validation::invalid(format!("graph entry '{key}' is not a string"));
        }
        Validation::Valid
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Add or overwrite the entry for `id`.
    pub fn upsert(&self, id: &LogicalId, code_path: &str) -> Result<(), RegistryError> {
        self.mutate(|doc| {
            let previous = doc.graphs.insert(id.0.clone(), code_path.to_string());
            previous.as_deref() != Some(code_path)
        })?;
        tracing::info!(logical_id = %id, code_path, "registry entry upserted");
        Ok(())
    }

    /// Remove the entry for `id`. Returns whether it was present.
    pub fn remove(&self, id: &LogicalId) -> Result<bool, RegistryError> {
        let removed = self.mutate(|doc| doc.graphs.remove(id.as_str()).is_some())?;
        if removed {
            tracing::info!(logical_id = %id, "registry entry removed");
        } else {
            tracing::debug!(logical_id = %id, "registry entry absent, nothing to remove");
        }
        Ok(removed)
    }

    /// Create `{"graphs": {}}` if the file is missing or blank.
    ///
    /// Returns whether a file was written. A non-blank file, even a corrupt
    /// one, is never touched.
    pub fn initialize(&self) -> Result<bool, RegistryError> {
        let _lock = RegistryLock::acquire(&self.lock_path, self.write_lock_timeout)?;
        let blank = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents.trim().is_empty(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(io_err(&self.path, e)),
        };
        if !blank {
            return Ok(false);
        }
        self.commit(&RegistryDocument::default())?;
        tracing::info!(path = %self.path.display(), "initialized empty registry");
        Ok(true)
    }

    /// Rewrite a corrupt document as `{"graphs": {}}`.
    ///
    /// Returns whether the file was rewritten; a readable document is left
    /// alone. Operator-invoked repair, never called automatically.
    pub fn reset(&self) -> Result<bool, RegistryError> {
        let _lock = RegistryLock::acquire(&self.lock_path, self.write_lock_timeout)?;
        match self.load_document() {
            Ok(_) if self.path.exists() => return Ok(false),
            Ok(_) | Err(RegistryError::Corrupt { .. }) => {}
            Err(err) => return Err(err),
        }
        self.commit(&RegistryDocument::default())?;
        tracing::warn!(path = %self.path.display(), "registry reset to an empty document");
        Ok(true)
    }

    /// Lock, load, apply `change`, and commit if it reports a modification.
    fn mutate<F>(&self, change: F) -> Result<bool, RegistryError>
    where
        F: FnOnce(&mut RegistryDocument) -> bool,
    {
        let _lock = RegistryLock::acquire(&self.lock_path, self.write_lock_timeout)?;
        let mut doc = self.load_document()?;
        let changed = change(&mut doc);
        if changed {
            self.commit(&doc)?;
        }
        Ok(changed)
    }

    /// Steps 3–7 of the write protocol. Caller must hold the lock.
    fn commit(&self, doc: &RegistryDocument) -> Result<(), RegistryError> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "registry".to_string());
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".tmp")
            .tempfile_in(&dir)
            .map_err(|e| io_err(&dir, e))?;

        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, doc)?;
            writer.write_all(b"\n").map_err(|e| io_err(tmp.path(), e))?;
            writer.flush().map_err(|e| io_err(tmp.path(), e))?;
        }
        tmp.as_file().sync_all().map_err(|e| io_err(tmp.path(), e))?;

        let written = std::fs::read_to_string(tmp.path()).map_err(|e| io_err(tmp.path(), e))?;
        parse_document(tmp.path(), &written)?;

        set_readable_permissions(tmp.path())?;
        tmp.persist(&self.path)
            .map_err(|e| io_err(&self.path, e.error))?;

        sync_dir(&dir);
        tracing::debug!(path = %self.path.display(), entries = doc.graphs.len(), "registry committed");
        Ok(())
    }
}

fn parse_document(path: &Path, contents: &str) -> Result<RegistryDocument, RegistryError> {
    if contents.trim().is_empty() {
        return Ok(RegistryDocument::default());
    }
    serde_json::from_str(contents).map_err(|e| RegistryError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Platforms without directory `fsync` simply skip it.
fn sync_dir(dir: &Path) {
    match File::open(dir).and_then(|d| d.sync_all()) {
        Ok(()) => {}
        Err(err) => {
            tracing::debug!(dir = %dir.display(), error = %err, "directory sync unavailable");
        }
    }
}

/// The runtime reads the registry as a different user.
#[cfg(unix)]
fn set_readable_permissions(path: &Path) -> Result<(), RegistryError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_readable_permissions(_path: &Path) -> Result<(), RegistryError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> GraphRegistry {
        GraphRegistry::new(dir.path().join("runtime").join("graphs.json"))
            .with_lock_timeouts(Duration::from_secs(5), Duration::from_secs(2))
    }

    fn id(s: &str) -> LogicalId {
        LogicalId::from(s)
    }

    #[test]
    fn read_missing_file_is_empty_without_side_effects() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        assert!(reg.read().expect("read").is_empty());
        assert!(!reg.path().exists(), "read must not create the file");
        assert!(!reg.path().parent().expect("parent").exists());
    }

    #[test]
    fn blank_file_reads_as_empty() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        std::fs::create_dir_all(reg.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(reg.path(), "  \n").expect("write");
        assert!(reg.read().expect("read").is_empty());
    }

    #[test]
    fn upsert_then_remove_leaves_no_entry() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        reg.upsert(&id("s__a"), "./graphs/s/agents/a/extracted/x/graph.py:graph")
            .expect("upsert");
        assert!(reg.remove(&id("s__a")).expect("remove"));
        assert!(!reg.read().expect("read").contains_key("s__a"));
        assert!(reg.validate().is_valid());
    }

    #[test]
    fn upsert_overwrites_without_duplicates() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        reg.upsert(&id("s__a"), "p1").expect("first");
        reg.upsert(&id("s__a"), "p2").expect("second");

        let graphs = reg.read().expect("read");
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs.get("s__a").map(String::as_str), Some("p2"));

        let raw = std::fs::read_to_string(reg.path()).expect("raw");
        assert_eq!(raw.matches("s__a").count(), 1, "key must appear once on disk");
    }

    #[test]
    fn remove_absent_entry_is_noop() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        reg.upsert(&id("s__a"), "p1").expect("upsert");
        let before = std::fs::read(reg.path()).expect("before");
        assert!(!reg.remove(&id("s__missing")).expect("remove"));
        assert_eq!(std::fs::read(reg.path()).expect("after"), before);
    }

    #[test]
    fn commit_leaves_no_temp_files() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        for n in 0..5 {
            reg.upsert(&id(&format!("s__{n}")), "p").expect("upsert");
        }
        let leftovers: Vec<_> = std::fs::read_dir(reg.path().parent().expect("parent"))
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "found temp files: {leftovers:?}");
    }

    #[test]
    fn unknown_top_level_keys_survive_mutations() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        std::fs::create_dir_all(reg.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(
            reg.path(),
            r#"{"graphs": {}, "dependencies": ["./shared"], "http": {"port": 8001}}"#,
        )
        .expect("write");

        reg.upsert(&id("s__a"), "p1").expect("upsert");
        reg.remove(&id("s__a")).expect("remove");

        let doc = reg.load_document().expect("load");
        assert_eq!(doc.extra.get("dependencies"), Some(&serde_json::json!(["./shared"])));
        assert_eq!(doc.extra.get("http"), Some(&serde_json::json!({"port": 8001})));
    }

    #[cfg(unix)]
    #[test]
    fn committed_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        reg.upsert(&id("s__a"), "p1").expect("upsert");
        let mode = std::fs::metadata(reg.path()).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn initialize_only_touches_missing_or_blank_files() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        assert!(reg.initialize().expect("init missing"));
        assert!(reg.validate().is_valid());
        assert!(!reg.initialize().expect("init existing"));

        std::fs::write(reg.path(), "{broken").expect("corrupt");
        assert!(!reg.initialize().expect("init corrupt"));
        assert_eq!(std::fs::read_to_string(reg.path()).expect("raw"), "{broken");
    }

    #[test]
    fn reset_repairs_only_corrupt_documents() {
        let dir = TempDir::new().expect("tempdir");
        let reg = registry(&dir);
        reg.upsert(&id("s__a"), "p1").expect("upsert");
        assert!(!reg.reset().expect("reset healthy"));
        assert_eq!(reg.read().expect("read").len(), 1);

        std::fs::write(reg.path(), "{broken").expect("corrupt");
        assert!(reg.reset().expect("reset corrupt"));
        assert!(reg.read().expect("read").is_empty());
        assert!(reg.validate().is_valid());
    }
}
