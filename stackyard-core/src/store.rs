//! Durable per-unit status records.
//!
//! # Storage layout (`FileStatusStore`)
//!
//! ```text
//! <units_dir>/
//!   <unit_id>.yaml        (one row per unit: mode 0600)
//! ```
//!
//! Every write replaces exactly one row file via `.yaml.tmp` + `rename`, so a
//! row is atomic on its own; there is no cross-row transaction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::{io_err, StoreError};
use crate::types::{Unit, UnitId, UnitStatus};

/// Status store contract.
///
/// `get`, `set_status` and `delete` are the lifecycle-task surface;
/// `insert`, `update`, `list` and `children` serve the request boundary and
/// reference bookkeeping.
pub trait StatusStore: Send + Sync {
    fn get(&self, id: UnitId) -> Result<Option<Unit>, StoreError>;

    /// Create a new row. Fails with [`StoreError::Duplicate`] if the id exists.
    fn insert(&self, unit: &Unit) -> Result<(), StoreError>;

    /// Replace an existing row. Fails with [`StoreError::NotFound`] if absent.
    fn update(&self, unit: &Unit) -> Result<(), StoreError>;

    /// Remove a row. Removing an absent row is a no-op.
    fn delete(&self, id: UnitId) -> Result<(), StoreError>;

    /// All rows, ordered by creation time.
    fn list(&self) -> Result<Vec<Unit>, StoreError>;

    /// Set the status of an existing row and return the updated row.
    fn set_status(&self, id: UnitId, status: UnitStatus) -> Result<Unit, StoreError> {
        let mut unit = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        unit.mark(status);
        self.update(&unit)?;
        Ok(unit)
    }

    /// Agents whose parent is `stack_id`.
    fn children(&self, stack_id: UnitId) -> Result<Vec<Unit>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|unit| unit.parent_id == Some(stack_id))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// One YAML document per unit.
#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted at `<home>/.stackyard/units`.
    pub fn at_home(home: &Path) -> Self {
        Self::new(crate::paths::units_dir(home))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<id>.yaml`: pure, no I/O.
    pub fn row_path(&self, id: UnitId) -> PathBuf {
        self.dir.join(format!("{id}.yaml"))
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
            set_dir_permissions(&self.dir)?;
        }
        Ok(())
    }

    fn load_row(&self, path: &Path) -> Result<Unit, StoreError> {
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write flow: serialize → `<id>.yaml.tmp` sibling → `chmod 0600` → `rename`.
    fn save_row(&self, unit: &Unit) -> Result<(), StoreError> {
        self.ensure_dir()?;
        let path = self.row_path(unit.id);
        let tmp = self.dir.join(format!("{}.yaml.tmp", unit.id));

        let yaml = serde_yaml::to_string(unit)?;
        std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
        set_file_permissions(&tmp)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        Ok(())
    }
}

impl StatusStore for FileStatusStore {
    fn get(&self, id: UnitId) -> Result<Option<Unit>, StoreError> {
        let path = self.row_path(id);
        if !path.exists() {
            return Ok(None);
        }
        self.load_row(&path).map(Some)
    }

    fn insert(&self, unit: &Unit) -> Result<(), StoreError> {
        if self.row_path(unit.id).exists() {
            return Err(StoreError::Duplicate(unit.id));
        }
        self.save_row(unit)
    }

    fn update(&self, unit: &Unit) -> Result<(), StoreError> {
        if !self.row_path(unit.id).exists() {
            return Err(StoreError::NotFound(unit.id));
        }
        self.save_row(unit)
    }

    fn delete(&self, id: UnitId) -> Result<(), StoreError> {
        let path = self.row_path(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    fn list(&self) -> Result<Vec<Unit>, StoreError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut entries: Vec<_> = std::fs::read_dir(&self.dir)
            .map_err(|e| io_err(&self.dir, e))?
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .map(|name| name.ends_with(".yaml"))
                    .unwrap_or(false)
            })
            .collect();
        entries.sort_by_key(|e| e.file_name());

        let mut units = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.load_row(&entry.path()) {
                Ok(unit) => units.push(unit),
                // A row deleted between read_dir and read is simply gone.
                Err(StoreError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        }
        units.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(units)
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    rows: Mutex<HashMap<UnitId, Unit>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl StatusStore for MemoryStatusStore {
    fn get(&self, id: UnitId) -> Result<Option<Unit>, StoreError> {
        Ok(self.rows.lock().get(&id).cloned())
    }

    fn insert(&self, unit: &Unit) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&unit.id) {
            return Err(StoreError::Duplicate(unit.id));
        }
        rows.insert(unit.id, unit.clone());
        Ok(())
    }

    fn update(&self, unit: &Unit) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        match rows.get_mut(&unit.id) {
            Some(row) => {
                *row = unit.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(unit.id)),
        }
    }

    fn delete(&self, id: UnitId) -> Result<(), StoreError> {
        self.rows.lock().remove(&id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Unit>, StoreError> {
        let mut units: Vec<Unit> = self.rows.lock().values().cloned().collect();
        units.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(units)
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_store() -> (TempDir, FileStatusStore) {
        let dir = TempDir::new().expect("tempdir");
        let store = FileStatusStore::new(dir.path().join("units"));
        (dir, store)
    }

    #[test]
    fn get_missing_row_is_none() {
        let (_dir, store) = file_store();
        assert!(store.get(UnitId::new()).expect("get").is_none());
        assert!(store.list().expect("list").is_empty());
    }

    #[test]
    fn insert_then_set_status() {
        let (_dir, store) = file_store();
        let stack = Unit::new_stack("payments", None);
        store.insert(&stack).expect("insert");

        let updated = store.set_status(stack.id, UnitStatus::Ready).expect("set_status");
        assert_eq!(updated.status, UnitStatus::Ready);
        let reloaded = store.get(stack.id).expect("get").expect("row");
        assert_eq!(reloaded.status, UnitStatus::Ready);
        assert!(reloaded.updated_at >= stack.updated_at);
    }

    #[test]
    fn insert_twice_is_duplicate() {
        let (_dir, store) = file_store();
        let stack = Unit::new_stack("payments", None);
        store.insert(&stack).expect("insert");
        assert!(matches!(store.insert(&stack), Err(StoreError::Duplicate(_))));
    }

    #[test]
    fn update_missing_row_is_not_found() {
        let (_dir, store) = file_store();
        let stack = Unit::new_stack("payments", None);
        assert!(matches!(store.update(&stack), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.set_status(stack.id, UnitStatus::Failed),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = file_store();
        let stack = Unit::new_stack("payments", None);
        store.insert(&stack).expect("insert");
        store.delete(stack.id).expect("first delete");
        store.delete(stack.id).expect("second delete");
        assert!(store.get(stack.id).expect("get").is_none());
    }

    #[test]
    fn children_filters_by_parent() {
        let (_dir, store) = file_store();
        let stack = Unit::new_stack("payments", None);
        let other = Unit::new_stack("search", None);
        store.insert(&stack).expect("insert");
        store.insert(&other).expect("insert");
        let a = Unit::new_agent(stack.id, "a", None);
        let b = Unit::new_agent(stack.id, "b", None);
        let c = Unit::new_agent(other.id, "c", None);
        for agent in [&a, &b, &c] {
            store.insert(agent).expect("insert agent");
        }

        let mut names: Vec<_> = store
            .children(stack.id)
            .expect("children")
            .into_iter()
            .map(|u| u.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn save_leaves_no_tmp_and_restricts_permissions() {
        let (_dir, store) = file_store();
        let stack = Unit::new_stack("payments", None);
        store.insert(&stack).expect("insert");
        let tmp = store.dir().join(format!("{}.yaml.tmp", stack.id));
        assert!(!tmp.exists(), ".tmp must be gone after save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.row_path(stack.id))
                .expect("metadata")
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn corrupt_row_is_parse_error_with_path() {
        let (_dir, store) = file_store();
        let id = UnitId::new();
        std::fs::create_dir_all(store.dir()).expect("mkdir");
        std::fs::write(store.row_path(id), b"- not: [a unit").expect("write");
        let err = store.get(id).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn memory_store_follows_the_same_contract() {
        let store = MemoryStatusStore::new();
        let stack = Unit::new_stack("payments", None);
        store.insert(&stack).expect("insert");
        assert!(matches!(store.insert(&stack), Err(StoreError::Duplicate(_))));
        store.set_status(stack.id, UnitStatus::Failed).expect("set_status");
        assert_eq!(store.get(stack.id).expect("get").expect("row").status, UnitStatus::Failed);
        store.delete(stack.id).expect("delete");
        assert!(store.is_empty());
    }
}
