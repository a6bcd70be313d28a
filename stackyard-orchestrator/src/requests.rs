//! Synchronous request boundary.
//!
//! Every request validates, writes the unit row with its new in-flight
//! status and dispatches exactly one lifecycle task. The status check before
//! dispatch is what keeps a unit from having two tasks in flight. If the
//! task cannot be queued, the row change is undone.
//!
//! Checks that span more than one row (agent name uniqueness within a stack,
//! no in-flight children when a stack is deleted) run under the admission
//! lock together with the write they guard.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use stackyard_core::{StatusStore, Unit, UnitId, UnitKind, UnitStatus};

use crate::error::RequestError;
use crate::queue::{LifecycleTask, TaskQueue};

const UPLOAD_EXTENSION: &str = "zip";
const MAX_NAME_LEN: usize = 128;

pub struct RequestHandler {
    store: Arc<dyn StatusStore>,
    queue: TaskQueue,
    staging: PathBuf,
    admission: Mutex<()>,
}

impl RequestHandler {
    pub fn new(store: Arc<dyn StatusStore>, queue: TaskQueue, staging: impl Into<PathBuf>) -> Self {
        Self {
            store,
            queue,
            staging: staging.into(),
            admission: Mutex::new(()),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    // -----------------------------------------------------------------------
    // Stacks
    // -----------------------------------------------------------------------

    pub fn request_stack_creation(
        &self,
        name: &str,
        description: Option<String>,
    ) -> Result<Unit, RequestError> {
        let name = check_name(name)?;
        let unit = Unit::new_stack(name, description);
        self.store.insert(&unit)?;

        if let Err(err) = self.queue.dispatch(LifecycleTask::CreateStack { stack_id: unit.id }) {
            self.forget(unit.id);
            return Err(err);
        }
        tracing::info!(stack_id = %unit.id, name = %unit.name, "stack creation requested");
        Ok(unit)
    }

    pub fn request_stack_deletion(&self, stack_id: UnitId) -> Result<Unit, RequestError> {
        let _admission = self.admission.lock();
        let unit = self.expect_unit(stack_id, UnitKind::Stack)?;
        ensure_idle(&unit)?;
        // A child still being created or deleted owns resources the stack
        // teardown would race with.
        if let Some(child) = self
            .store
            .children(stack_id)?
            .into_iter()
            .find(|child| child.status.is_in_flight())
        {
            return Err(RequestError::Busy {
                id: child.id,
                status: child.status,
            });
        }
        let updated = self.transition(&unit, UnitStatus::Deleting)?;

        if let Err(err) = self.queue.dispatch(LifecycleTask::DeleteStack { stack_id }) {
            self.restore(&unit);
            return Err(err);
        }
        tracing::info!(%stack_id, "stack deletion requested");
        Ok(updated)
    }

    /// Start a fresh creation attempt for a failed stack.
    pub fn request_stack_retry(&self, stack_id: UnitId) -> Result<Unit, RequestError> {
        let unit = self.expect_unit(stack_id, UnitKind::Stack)?;
        if unit.status != UnitStatus::Failed {
            return Err(RequestError::NotRetryable {
                id: stack_id,
                status: unit.status,
            });
        }
        let updated = self.transition(&unit, UnitStatus::Creating)?;

        if let Err(err) = self.queue.dispatch(LifecycleTask::CreateStack { stack_id }) {
            self.restore(&unit);
            return Err(err);
        }
        tracing::info!(%stack_id, "stack retry requested");
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub fn request_agent_creation(
        &self,
        stack_id: UnitId,
        name: &str,
        description: Option<String>,
        upload: &Path,
    ) -> Result<Unit, RequestError> {
        let name = check_name(name)?;
        check_upload(upload)?;

        let unit = Unit::new_agent(stack_id, name, description);
        let staged = self.stage_upload(unit.id, upload)?;
        if let Err(err) = self.admit_agent(&unit) {
            discard(&staged);
            return Err(err);
        }

        let task = LifecycleTask::CreateAgent {
            agent_id: unit.id,
            upload: staged.clone(),
        };
        if let Err(err) = self.queue.dispatch(task) {
            self.forget(unit.id);
            discard(&staged);
            return Err(err);
        }
        tracing::info!(agent_id = %unit.id, %stack_id, name = %unit.name, "agent creation requested");
        Ok(unit)
    }

    pub fn request_agent_deletion(&self, agent_id: UnitId) -> Result<Unit, RequestError> {
        let unit = self.expect_unit(agent_id, UnitKind::Agent)?;
        ensure_idle(&unit)?;
        let updated = self.transition(&unit, UnitStatus::Deleting)?;

        if let Err(err) = self.queue.dispatch(LifecycleTask::DeleteAgent { agent_id }) {
            self.restore(&unit);
            return Err(err);
        }
        tracing::info!(%agent_id, "agent deletion requested");
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Updates
    // -----------------------------------------------------------------------

    /// Rename a stack or change its description. Only settled stacks accept
    /// edits; `None` leaves a field untouched.
    pub fn request_stack_update(
        &self,
        stack_id: UnitId,
        name: Option<&str>,
        description: Option<String>,
    ) -> Result<Unit, RequestError> {
        let name = name.map(check_name).transpose()?;
        let _admission = self.admission.lock();
        let mut unit = self.expect_unit(stack_id, UnitKind::Stack)?;
        ensure_idle(&unit)?;

        apply_edit(&mut unit, name, description);
        self.store.update(&unit)?;
        tracing::info!(%stack_id, name = %unit.name, "stack updated");
        Ok(unit)
    }

    /// Rename an agent or change its description. A new name must not be
    /// taken by a sibling.
    pub fn request_agent_update(
        &self,
        agent_id: UnitId,
        name: Option<&str>,
        description: Option<String>,
    ) -> Result<Unit, RequestError> {
        let name = name.map(check_name).transpose()?;
        let _admission = self.admission.lock();
        let mut unit = self.expect_unit(agent_id, UnitKind::Agent)?;
        ensure_idle(&unit)?;

        if let (Some(name), Some(stack_id)) = (name, unit.parent_id) {
            let taken = self
                .store
                .children(stack_id)?
                .iter()
                .any(|sibling| sibling.id != agent_id && sibling.name == name);
            if taken {
                return Err(RequestError::Conflict {
                    stack_id,
                    name: name.to_string(),
                });
            }
        }

        apply_edit(&mut unit, name, description);
        self.store.update(&unit)?;
        tracing::info!(%agent_id, name = %unit.name, "agent updated");
        Ok(unit)
    }

    pub fn units(&self) -> Result<Vec<Unit>, RequestError> {
        Ok(self.store.list()?)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn expect_unit(&self, id: UnitId, kind: UnitKind) -> Result<Unit, RequestError> {
        let unit = self.store.get(id)?.ok_or(RequestError::NotFound(id))?;
        if unit.kind != kind {
            return Err(RequestError::WrongKind { id, expected: kind });
        }
        Ok(unit)
    }

    /// Parent and name checks plus the row insert, as one step.
    fn admit_agent(&self, unit: &Unit) -> Result<(), RequestError> {
        let Some(stack_id) = unit.parent_id else {
            return Err(RequestError::WrongKind {
                id: unit.id,
                expected: UnitKind::Agent,
            });
        };
        let _admission = self.admission.lock();
        let stack = self.expect_unit(stack_id, UnitKind::Stack)?;
        if stack.status == UnitStatus::Deleting {
            return Err(RequestError::Busy {
                id: stack_id,
                status: stack.status,
            });
        }
        if self
            .store
            .children(stack_id)?
            .iter()
            .any(|agent| agent.name == unit.name)
        {
            return Err(RequestError::Conflict {
                stack_id,
                name: unit.name.clone(),
            });
        }
        self.store.insert(unit)?;
        Ok(())
    }

    fn transition(&self, unit: &Unit, status: UnitStatus) -> Result<Unit, RequestError> {
        let mut updated = unit.clone();
        updated.mark(status);
        self.store.update(&updated)?;
        Ok(updated)
    }

    fn restore(&self, previous: &Unit) {
        if let Err(err) = self.store.update(previous) {
            tracing::warn!(unit_id = %previous.id, error = %err, "could not restore row after failed dispatch");
        }
    }

    fn forget(&self, id: UnitId) {
        if let Err(err) = self.store.delete(id) {
            tracing::warn!(unit_id = %id, error = %err, "could not remove row after failed dispatch");
        }
    }

    /// Copy the caller's archive into a staging file the task will own.
    fn stage_upload(&self, agent_id: UnitId, upload: &Path) -> Result<PathBuf, RequestError> {
        fs::create_dir_all(&self.staging).map_err(|source| RequestError::Staging {
            path: self.staging.clone(),
            source,
        })?;
        let staged = self.staging.join(format!("{agent_id}.{UPLOAD_EXTENSION}"));
        fs::copy(upload, &staged).map_err(|source| {
            discard(&staged);
            RequestError::Staging {
                path: staged.clone(),
                source,
            }
        })?;
        Ok(staged)
    }
}

fn check_name(name: &str) -> Result<&str, RequestError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(RequestError::InvalidName("name must not be empty".to_string()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RequestError::InvalidName(format!(
            "name is longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(RequestError::InvalidName(
            "name contains control characters".to_string(),
        ));
    }
    Ok(name)
}

fn check_upload(upload: &Path) -> Result<(), RequestError> {
    let is_zip = upload
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(UPLOAD_EXTENSION))
        .unwrap_or(false);
    if !is_zip {
        return Err(RequestError::InvalidUpload(format!(
            "{} is not a .zip archive",
            upload.display()
        )));
    }
    let meta = fs::metadata(upload).map_err(|err| {
        RequestError::InvalidUpload(format!("cannot read {}: {err}", upload.display()))
    })?;
    if !meta.is_file() {
        return Err(RequestError::InvalidUpload(format!(
            "{} is not a file",
            upload.display()
        )));
    }
    if meta.len() == 0 {
        return Err(RequestError::InvalidUpload(format!(
            "{} is empty",
            upload.display()
        )));
    }
    Ok(())
}

fn apply_edit(unit: &mut Unit, name: Option<&str>, description: Option<String>) {
    if let Some(name) = name {
        unit.name = name.to_string();
    }
    if description.is_some() {
        unit.description = description;
    }
    let status = unit.status;
    unit.mark(status);
}

fn ensure_idle(unit: &Unit) -> Result<(), RequestError> {
    if unit.status.is_in_flight() {
        return Err(RequestError::Busy {
            id: unit.id,
            status: unit.status,
        });
    }
    Ok(())
}

fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %err, "could not remove staged upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_trimmed_and_checked() {
        assert_eq!(check_name("  support  ").expect("ok"), "support");
        assert!(check_name("   ").is_err());
        assert!(check_name("bad\nname").is_err());
        assert!(check_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn upload_needs_zip_extension() {
        let err = check_upload(Path::new("/tmp/agent.tar.gz")).unwrap_err();
        assert!(matches!(err, RequestError::InvalidUpload(_)), "got: {err}");
    }

    #[test]
    fn empty_upload_is_rejected() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("agent.ZIP");
        fs::write(&path, b"").expect("write");
        let err = check_upload(&path).unwrap_err();
        assert!(err.to_string().contains("is empty"), "got: {err}");
    }
}
