//! Lifecycle tasks for stacks and agents.
//!
//! Each public operation runs the ordered steps for one unit, records the
//! final status in the status store and returns a [`TaskReport`]. Nothing is
//! propagated to a caller: failures end as `Failed` rows, one `error!` record
//! and the report.
//!
//! ```text
//! create stack:  namespace → datastore workload → storage root → READY
//! create agent:  dir → copy upload → extract → slug → verify → registry upsert
//!                → validate → READY
//! delete stack:  per agent (registry remove, dir delete) → validate
//!                → namespace delete → stack dir delete → rows removed
//! delete agent:  registry remove → validate → dir delete → row removed
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use stackyard_core::{
    namespace_for, ExternalRefs, LogicalId, Settings, StatusStore, Unit, UnitId, UnitKind,
    UnitStatus,
};
use stackyard_registry::{GraphRegistry, RegistryError, Validation};
use stackyard_storage::{
    detect_slug, entry_point_exists, CodePath, LocalStorage, StorageError, StorageLayout,
};

use crate::control_plane::{
    generate_password, ControlPlane, NamespaceCreated, NamespaceDeletion, WorkloadSpec,
};
use crate::error::{ControlPlaneError, FailureKind, ProvisionError};
use crate::executor::Executor;

// ---------------------------------------------------------------------------
// Steps, operations, reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    LoadUnit,
    SaveUnit,
    RemoveUnit,
    CreateNamespace,
    CreateWorkload,
    AllocateStorage,
    CopyArchive,
    ExtractArchive,
    DetectSlug,
    VerifyEntryPoint,
    RegistryUpsert,
    RegistryValidate,
    RegistryRemove,
    DeleteNamespace,
    DeleteDirectory,
}

impl Step {
    pub fn as_str(self) -> &'static str {
        match self {
            Step::LoadUnit => "load_unit",
            Step::SaveUnit => "save_unit",
            Step::RemoveUnit => "remove_unit",
            Step::CreateNamespace => "create_namespace",
            Step::CreateWorkload => "create_workload",
            Step::AllocateStorage => "allocate_storage",
            Step::CopyArchive => "copy_archive",
            Step::ExtractArchive => "extract_archive",
            Step::DetectSlug => "detect_slug",
            Step::VerifyEntryPoint => "verify_entry_point",
            Step::RegistryUpsert => "registry_upsert",
            Step::RegistryValidate => "registry_validate",
            Step::RegistryRemove => "registry_remove",
            Step::DeleteNamespace => "delete_namespace",
            Step::DeleteDirectory => "delete_directory",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    CreateStack,
    CreateAgent,
    DeleteStack,
    DeleteAgent,
}

impl Operation {
    pub fn is_creation(self) -> bool {
        matches!(self, Operation::CreateStack | Operation::CreateAgent)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::CreateStack => "create_stack",
            Operation::CreateAgent => "create_agent",
            Operation::DeleteStack => "delete_stack",
            Operation::DeleteAgent => "delete_agent",
        })
    }
}

/// Where a unit ended up once its task finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    /// Row recorded with this status.
    Settled { status: UnitStatus },
    /// Row removed by a deletion task.
    Removed,
    /// Row disappeared while the task ran.
    Vanished,
    /// Task did not run its steps.
    Skipped { reason: String },
}

/// A step failure, either fatal to the task or tolerated and logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    pub step: Option<Step>,
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    fn from_error(err: &ProvisionError) -> Self {
        Self {
            step: err.step(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of one lifecycle task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub unit_id: UnitId,
    pub operation: Operation,
    pub outcome: TaskOutcome,
    /// The failure that ended the task, if any.
    pub failure: Option<TaskFailure>,
    /// Failures that were logged and tolerated.
    pub warnings: Vec<TaskFailure>,
}

impl TaskReport {
    fn new(unit_id: UnitId, operation: Operation) -> Self {
        Self {
            unit_id,
            operation,
            outcome: TaskOutcome::Skipped {
                reason: "not started".to_string(),
            },
            failure: None,
            warnings: Vec::new(),
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    pub fn status(&self) -> Option<UnitStatus> {
        match self.outcome {
            TaskOutcome::Settled { status } => Some(status),
            _ => None,
        }
    }

    fn tolerate(&mut self, err: &ProvisionError) {
        self.warnings.push(TaskFailure::from_error(err));
    }
}

impl ProvisionError {
    /// Step the error was raised in, when it carries one.
    pub fn step(&self) -> Option<Step> {
        match self {
            ProvisionError::ControlPlane { step, .. }
            | ProvisionError::Storage { step, .. }
            | ProvisionError::Registry { step, .. }
            | ProvisionError::Timeout { step, .. }
            | ProvisionError::Panicked { step, .. } => Some(*step),
            ProvisionError::RegistryInvalid { .. } => Some(Step::RegistryValidate),
            ProvisionError::EntryPointMissing { .. } => Some(Step::VerifyEntryPoint),
            ProvisionError::Store(_) | ProvisionError::Orphan { .. } | ProvisionError::PoolClosed => {
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-call bounds for each class of external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTimeouts {
    pub namespace: Duration,
    pub workload: Duration,
    pub storage: Duration,
    pub store: Duration,
    pub registry: Duration,
}

impl StepTimeouts {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            namespace: settings.namespace_timeout(),
            workload: settings.workload_timeout(),
            storage: settings.storage_timeout(),
            store: settings.store_timeout(),
            registry: settings.registry_timeout(),
        }
    }
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleOptions {
    /// Tolerate control-plane failures during stack creation.
    pub permissive: bool,
    pub graph_prefix: String,
    pub entry_file: String,
    pub entry_symbol: String,
    pub default_slug: String,
    pub runtime_public_url: String,
    pub chat_ui_base_url: String,
    pub datastore: WorkloadSpec,
    /// Fixed datastore password; generated per stack when unset.
    pub datastore_password: Option<String>,
    pub timeouts: StepTimeouts,
    pub pool_size: usize,
}

impl LifecycleOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            permissive: settings.is_permissive(),
            graph_prefix: settings.graph_prefix.clone(),
            entry_file: settings.entry_file.clone(),
            entry_symbol: settings.entry_symbol.clone(),
            default_slug: settings.default_slug.clone(),
            runtime_public_url: settings.runtime_public_url.clone(),
            chat_ui_base_url: settings.chat_ui_base_url.clone(),
            datastore: WorkloadSpec::datastore(
                settings.control_plane.datastore_image.clone(),
                settings.control_plane.datastore_port,
            ),
            datastore_password: settings.control_plane.datastore_password.clone(),
            timeouts: StepTimeouts::from_settings(settings),
            pool_size: settings.workers.pool_size,
        }
    }

    pub fn api_url(&self) -> String {
        self.runtime_public_url.clone()
    }

    /// Chat UI link preconfigured for one registered graph.
    pub fn ui_url(&self, logical_id: &LogicalId) -> String {
        format!(
            "{}/?apiUrl={}&assistantId={}",
            self.chat_ui_base_url.trim_end_matches('/'),
            self.runtime_public_url,
            logical_id
        )
    }
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs lifecycle tasks against injected collaborators.
pub struct Orchestrator {
    control_plane: Arc<dyn ControlPlane>,
    storage: Arc<dyn LocalStorage>,
    store: Arc<dyn StatusStore>,
    registry: GraphRegistry,
    layout: StorageLayout,
    options: LifecycleOptions,
    executor: Executor,
}

impl Orchestrator {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        storage: Arc<dyn LocalStorage>,
        store: Arc<dyn StatusStore>,
        registry: GraphRegistry,
        layout: StorageLayout,
        options: LifecycleOptions,
    ) -> Self {
        let executor = Executor::new(options.pool_size);
        Self {
            control_plane,
            storage,
            store,
            registry,
            layout,
            options,
            executor,
        }
    }

    pub fn options(&self) -> &LifecycleOptions {
        &self.options
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn registry(&self) -> &GraphRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn StatusStore> {
        self.store.clone()
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Stack creation
    // -----------------------------------------------------------------------

    pub async fn create_stack(&self, stack_id: UnitId) -> TaskReport {
        let mut report = TaskReport::new(stack_id, Operation::CreateStack);
        let Some(unit) = self
            .begin(stack_id, UnitKind::Stack, &[UnitStatus::Creating], &mut report)
            .await
        else {
            return report;
        };

        match self.provision_stack(&unit, &mut report).await {
            Ok(refs) => self.settle_ready(stack_id, refs, report).await,
            Err(err) => self.fail(stack_id, err, report).await,
        }
    }

    async fn provision_stack(
        &self,
        unit: &Unit,
        report: &mut TaskReport,
    ) -> Result<ExternalRefs, ProvisionError> {
        let timeouts = self.options.timeouts;
        let mut refs = unit.refs.clone();
        let namespace = refs
            .namespace
            .clone()
            .unwrap_or_else(|| namespace_for(unit.id));
        refs.namespace = Some(namespace.clone());

        let ns = namespace.clone();
        let created = self
            .control_call(Step::CreateNamespace, timeouts.namespace, move |cp| {
                cp.create_namespace(&ns)
            })
            .await;
        let namespace_ready = match created {
            Ok(NamespaceCreated::Created) => {
                tracing::info!(unit_id = %unit.id, step = %Step::CreateNamespace, %namespace, "namespace created");
                true
            }
            Ok(NamespaceCreated::AlreadyExists) => {
                tracing::debug!(unit_id = %unit.id, step = %Step::CreateNamespace, %namespace, "namespace already exists");
                true
            }
            Err(err) => {
                self.tolerate_control_plane(unit.id, err, report)?;
                false
            }
        };

        if namespace_ready {
            let ns = namespace.clone();
            let password = self
                .options
                .datastore_password
                .clone()
                .unwrap_or_else(generate_password);
            let spec = self.options.datastore.clone().with_password(password);
            let deployed = self
                .control_call(Step::CreateWorkload, timeouts.workload, move |cp| {
                    cp.create_workload(&ns, &spec)
                })
                .await;
            match deployed {
                Ok(()) => tracing::info!(
                    unit_id = %unit.id,
                    step = %Step::CreateWorkload,
                    %namespace,
                    image = %self.options.datastore.image,
                    "datastore workload submitted"
                ),
                Err(err) => self.tolerate_control_plane(unit.id, err, report)?,
            }
        } else {
            tracing::debug!(unit_id = %unit.id, "skipping workload without a namespace");
        }

        let root = self.layout.stack_agents_dir(unit.id);
        let target = root.clone();
        self.storage_call(Step::AllocateStorage, move |storage| storage.create_dir(&target))
            .await?;
        tracing::info!(unit_id = %unit.id, step = %Step::AllocateStorage, path = %root.display(), "stack storage allocated");
        refs.disk_path = Some(self.layout.stack_dir(unit.id));
        Ok(refs)
    }

    /// Permissive mode logs control-plane failures and carries on.
    fn tolerate_control_plane(
        &self,
        unit_id: UnitId,
        err: ProvisionError,
        report: &mut TaskReport,
    ) -> Result<(), ProvisionError> {
        if !self.options.permissive {
            return Err(err);
        }
        tracing::warn!(
            unit_id = %unit_id,
            step = ?err.step(),
            kind = %err.kind(),
            error = %err,
            "control-plane step failed; continuing in permissive mode"
        );
        report.tolerate(&err);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Agent creation
    // -----------------------------------------------------------------------

    /// `upload` is a staging file owned by this task; it is removed on every path.
    pub async fn create_agent(&self, agent_id: UnitId, upload: PathBuf) -> TaskReport {
        let mut report = TaskReport::new(agent_id, Operation::CreateAgent);
        let Some(unit) = self
            .begin(agent_id, UnitKind::Agent, &[UnitStatus::Creating], &mut report)
            .await
        else {
            discard_upload(&upload).await;
            return report;
        };

        let mut created_dir = None;
        let result = self.provision_agent(&unit, &upload, &mut created_dir).await;
        discard_upload(&upload).await;

        match result {
            Ok(refs) => {
                let (logical_id, agent_dir) = (refs.logical_id.clone(), refs.disk_path.clone());
                let mut report = self.settle_ready(agent_id, refs, report).await;
                let adopted = matches!(
                    report.outcome,
                    TaskOutcome::Settled {
                        status: UnitStatus::Ready
                    }
                );
                // Nobody owns the registration or the directory once the row
                // is gone or was moved on without us.
                if !adopted && report.failure.is_none() {
                    if let Some(logical_id) = logical_id {
                        self.unregister(agent_id, logical_id, &mut report).await;
                    }
                    if let Some(dir) = agent_dir {
                        self.cleanup_dir(agent_id, dir).await;
                    }
                }
                report
            }
            Err(err) => {
                if let Some(dir) = created_dir {
                    self.cleanup_dir(agent_id, dir).await;
                }
                self.fail(agent_id, err, report).await
            }
        }
    }

    async fn provision_agent(
        &self,
        unit: &Unit,
        upload: &Path,
        created_dir: &mut Option<PathBuf>,
    ) -> Result<ExternalRefs, ProvisionError> {
        let stack_id = unit.parent_id.ok_or(ProvisionError::Orphan {
            id: unit.id,
            kind: unit.kind,
        })?;
        let agent_id = unit.id;
        let timeouts = self.options.timeouts;

        let agent_dir = self.layout.agent_dir(stack_id, agent_id);
        let target = agent_dir.clone();
        self.storage_call(Step::AllocateStorage, move |storage| storage.create_dir(&target))
            .await?;
        *created_dir = Some(agent_dir.clone());

        let archive = self.layout.agent_archive(stack_id, agent_id);
        let (src, dest) = (upload.to_path_buf(), archive.clone());
        let bytes = self
            .storage_call(Step::CopyArchive, move |storage| storage.copy_file(&src, &dest))
            .await?;
        discard_upload(upload).await;
        tracing::info!(%agent_id, %stack_id, step = %Step::CopyArchive, bytes, "archive copied");

        let extracted = self.layout.extracted_dir(stack_id, agent_id);
        let dest = extracted.clone();
        let files = self
            .storage_call(Step::ExtractArchive, move |storage| {
                storage.extract_archive(&archive, &dest)
            })
            .await?;
        tracing::info!(%agent_id, %stack_id, step = %Step::ExtractArchive, files, "archive extracted");

        let root = extracted.clone();
        let entry_file = self.options.entry_file.clone();
        let default_slug = self.options.default_slug.clone();
        let slug = self
            .executor
            .run(Step::DetectSlug, timeouts.storage, move || {
                detect_slug(&root, &entry_file, &default_slug)
                    .map_err(ProvisionError::storage(Step::DetectSlug))
            })
            .await?;

        let logical_id = LogicalId::for_agent(stack_id, agent_id);
        let root = extracted.clone();
        let (check_slug, entry_file) = (slug.clone(), self.options.entry_file.clone());
        let resolves = self
            .executor
            .run(Step::VerifyEntryPoint, timeouts.storage, move || {
                Ok(entry_point_exists(&root, &check_slug, &entry_file))
            })
            .await?;
        if !resolves {
            return Err(ProvisionError::EntryPointMissing {
                path: self
                    .layout
                    .entry_point(stack_id, agent_id, &slug, &self.options.entry_file),
            });
        }

        let code_path = CodePath::new(
            &self.options.graph_prefix,
            stack_id,
            agent_id,
            &slug,
            &self.options.entry_file,
            &self.options.entry_symbol,
        );
        let (key, value) = (logical_id.clone(), code_path.value.clone());
        self.registry_call(Step::RegistryUpsert, move |registry| registry.upsert(&key, &value))
            .await?;
        tracing::info!(
            %agent_id,
            %stack_id,
            %logical_id,
            step = %Step::RegistryUpsert,
            code_path = %code_path.value,
            "graph registered"
        );

        if let Validation::Invalid { reason } = self.validate_registry().await? {
            return Err(ProvisionError::RegistryInvalid { reason });
        }

        Ok(ExternalRefs {
            namespace: None,
            disk_path: Some(agent_dir),
            api_url: Some(self.options.api_url()),
            ui_url: Some(self.options.ui_url(&logical_id)),
            logical_id: Some(logical_id),
        })
    }

    async fn cleanup_dir(&self, unit_id: UnitId, dir: PathBuf) {
        let target = dir.clone();
        match self
            .storage_call(Step::DeleteDirectory, move |storage| storage.delete_dir(&target))
            .await
        {
            Ok(()) => tracing::info!(%unit_id, path = %dir.display(), "removed directory of failed attempt"),
            Err(err) => tracing::warn!(
                %unit_id,
                path = %dir.display(),
                error = %err,
                "cleanup of failed attempt did not complete"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Stack deletion
    // -----------------------------------------------------------------------

    pub async fn delete_stack(&self, stack_id: UnitId) -> TaskReport {
        let mut report = TaskReport::new(stack_id, Operation::DeleteStack);
        let Some(unit) = self
            .begin(
                stack_id,
                UnitKind::Stack,
                &[UnitStatus::Deleting, UnitStatus::Failed],
                &mut report,
            )
            .await
        else {
            return report;
        };

        let children = match self.children(stack_id).await {
            Ok(children) => children,
            Err(err) => return self.fail(stack_id, err, report).await,
        };

        for child in &children {
            let logical_id = child
                .refs
                .logical_id
                .clone()
                .unwrap_or_else(|| LogicalId::for_agent(stack_id, child.id));
            self.unregister(child.id, logical_id, &mut report).await;
            self.teardown_dir(child.id, self.layout.agent_dir(stack_id, child.id), &mut report)
                .await;
        }
        if !children.is_empty() {
            self.check_registry(stack_id, &mut report).await;
        }

        let namespace = unit
            .refs
            .namespace
            .clone()
            .unwrap_or_else(|| namespace_for(stack_id));
        let ns = namespace.clone();
        let deletion = self
            .control_call(Step::DeleteNamespace, self.options.timeouts.namespace, move |cp| {
                cp.delete_namespace(&ns)
            })
            .await;
        match deletion {
            Ok(NamespaceDeletion::Accepted) => {
                tracing::info!(%stack_id, step = %Step::DeleteNamespace, %namespace, "namespace deletion accepted")
            }
            Ok(NamespaceDeletion::NotFound) => {
                tracing::debug!(%stack_id, step = %Step::DeleteNamespace, %namespace, "namespace already absent")
            }
            Err(err) => {
                tracing::warn!(%stack_id, step = %Step::DeleteNamespace, error = %err, "namespace deletion failed");
                report.tolerate(&err);
            }
        }

        self.teardown_dir(stack_id, self.layout.stack_dir(stack_id), &mut report)
            .await;

        for child in &children {
            if let Err(err) = self.remove_row(child.id).await {
                tracing::warn!(%stack_id, agent_id = %child.id, error = %err, "failed to remove agent row");
                report.tolerate(&err);
            }
        }
        match self.remove_row(stack_id).await {
            Ok(()) => {
                tracing::info!(%stack_id, agents = children.len(), "stack deleted");
                report.outcome = TaskOutcome::Removed;
                report
            }
            Err(err) => self.fail(stack_id, err, report).await,
        }
    }

    // -----------------------------------------------------------------------
    // Agent deletion
    // -----------------------------------------------------------------------

    pub async fn delete_agent(&self, agent_id: UnitId) -> TaskReport {
        let mut report = TaskReport::new(agent_id, Operation::DeleteAgent);
        let Some(unit) = self
            .begin(
                agent_id,
                UnitKind::Agent,
                &[UnitStatus::Deleting, UnitStatus::Failed],
                &mut report,
            )
            .await
        else {
            return report;
        };

        let logical_id = unit
            .refs
            .logical_id
            .clone()
            .or_else(|| unit.parent_id.map(|stack_id| LogicalId::for_agent(stack_id, agent_id)));
        if let Some(logical_id) = logical_id {
            self.unregister(agent_id, logical_id, &mut report).await;
            self.check_registry(agent_id, &mut report).await;
        }

        let dir = unit
            .parent_id
            .map(|stack_id| self.layout.agent_dir(stack_id, agent_id))
            .or_else(|| unit.refs.disk_path.clone());
        if let Some(dir) = dir {
            self.teardown_dir(agent_id, dir, &mut report).await;
        }

        match self.remove_row(agent_id).await {
            Ok(()) => {
                tracing::info!(%agent_id, "agent deleted");
                report.outcome = TaskOutcome::Removed;
                report
            }
            Err(err) => self.fail(agent_id, err, report).await,
        }
    }

    // -----------------------------------------------------------------------
    // Best-effort teardown steps
    // -----------------------------------------------------------------------

    async fn unregister(&self, unit_id: UnitId, logical_id: LogicalId, report: &mut TaskReport) {
        let key = logical_id.clone();
        match self
            .registry_call(Step::RegistryRemove, move |registry| registry.remove(&key))
            .await
        {
            Ok(true) => tracing::info!(%unit_id, %logical_id, step = %Step::RegistryRemove, "graph unregistered"),
            Ok(false) => tracing::debug!(%unit_id, %logical_id, "graph was not registered"),
            Err(err) => {
                tracing::warn!(%unit_id, %logical_id, error = %err, "registry removal failed");
                report.tolerate(&err);
            }
        }
    }

    async fn check_registry(&self, unit_id: UnitId, report: &mut TaskReport) {
        match self.validate_registry().await {
            Ok(Validation::Valid) => {}
            Ok(Validation::Invalid { reason }) => {
                let err = ProvisionError::RegistryInvalid { reason };
                tracing::warn!(%unit_id, error = %err, "registry invalid after removal");
                report.tolerate(&err);
            }
            Err(err) => {
                tracing::warn!(%unit_id, error = %err, "registry validation did not run");
                report.tolerate(&err);
            }
        }
    }

    async fn teardown_dir(&self, unit_id: UnitId, dir: PathBuf, report: &mut TaskReport) {
        let target = dir.clone();
        match self
            .storage_call(Step::DeleteDirectory, move |storage| storage.delete_dir(&target))
            .await
        {
            Ok(()) => tracing::info!(%unit_id, step = %Step::DeleteDirectory, path = %dir.display(), "directory deleted"),
            Err(err) => {
                tracing::warn!(%unit_id, path = %dir.display(), error = %err, "directory deletion failed");
                report.tolerate(&err);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Row handling
    // -----------------------------------------------------------------------

    /// Load the row and check it is in a state this task may act on.
    async fn begin(
        &self,
        id: UnitId,
        kind: UnitKind,
        accepted: &[UnitStatus],
        report: &mut TaskReport,
    ) -> Option<Unit> {
        let unit = match self.load(id).await {
            Ok(Some(unit)) => unit,
            Ok(None) => {
                tracing::warn!(unit_id = %id, operation = %report.operation, "lifecycle anomaly: row missing at task start");
                report.outcome = TaskOutcome::Vanished;
                return None;
            }
            Err(err) => {
                tracing::error!(unit_id = %id, operation = %report.operation, kind = %err.kind(), error = %err, "lifecycle task could not load its row");
                report.failure = Some(TaskFailure::from_error(&err));
                report.outcome = TaskOutcome::Skipped {
                    reason: "row could not be loaded".to_string(),
                };
                return None;
            }
        };

        if unit.kind != kind {
            tracing::warn!(unit_id = %id, operation = %report.operation, found = %unit.kind, "lifecycle anomaly: wrong unit kind");
            report.outcome = TaskOutcome::Skipped {
                reason: format!("unit is a {}", unit.kind),
            };
            return None;
        }
        if !accepted.contains(&unit.status) {
            tracing::warn!(unit_id = %id, operation = %report.operation, found = %unit.status, "lifecycle anomaly: unexpected status at task start");
            report.outcome = TaskOutcome::Skipped {
                reason: format!("unit is {}", unit.status),
            };
            return None;
        }
        if unit.status == UnitStatus::Failed {
            tracing::warn!(unit_id = %id, operation = %report.operation, "lifecycle anomaly: deleting unit was marked failed by an earlier task");
        }
        Some(unit)
    }

    /// Record `Ready` with `refs`, unless the row moved on while we worked.
    async fn settle_ready(&self, id: UnitId, refs: ExternalRefs, mut report: TaskReport) -> TaskReport {
        let mut current = match self.load(id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                tracing::warn!(unit_id = %id, operation = %report.operation, "lifecycle anomaly: row removed before completion");
                report.outcome = TaskOutcome::Vanished;
                return report;
            }
            Err(err) => return self.fail(id, err, report).await,
        };
        if current.status != UnitStatus::Creating {
            tracing::warn!(
                unit_id = %id,
                operation = %report.operation,
                found = %current.status,
                "lifecycle anomaly: not overwriting status with ready"
            );
            report.outcome = TaskOutcome::Settled {
                status: current.status,
            };
            return report;
        }

        current.refs = refs;
        current.mark(UnitStatus::Ready);
        match self.save(current).await {
            Ok(()) => {
                tracing::info!(unit_id = %id, operation = %report.operation, "unit ready");
                report.outcome = TaskOutcome::Settled {
                    status: UnitStatus::Ready,
                };
                report
            }
            Err(err) => self.fail(id, err, report).await,
        }
    }

    /// Log the failure once and record `Failed`.
    async fn fail(&self, id: UnitId, err: ProvisionError, mut report: TaskReport) -> TaskReport {
        tracing::error!(
            unit_id = %id,
            operation = %report.operation,
            kind = %err.kind(),
            step = ?err.step(),
            error = %err,
            "lifecycle task failed"
        );
        report.failure = Some(TaskFailure::from_error(&err));

        let mut current = match self.load(id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                tracing::warn!(unit_id = %id, operation = %report.operation, "lifecycle anomaly: row missing when recording failure");
                report.outcome = TaskOutcome::Vanished;
                return report;
            }
            Err(load_err) => {
                tracing::warn!(unit_id = %id, error = %load_err, "could not load row to record failure");
                report.outcome = TaskOutcome::Skipped {
                    reason: "failure not recorded".to_string(),
                };
                return report;
            }
        };
        if report.operation.is_creation() && current.status == UnitStatus::Deleting {
            tracing::warn!(unit_id = %id, operation = %report.operation, "lifecycle anomaly: failed creation overrides deleting");
        }

        let previous = current.status;
        current.mark(UnitStatus::Failed);
        report.outcome = match self.save(current).await {
            Ok(()) => TaskOutcome::Settled {
                status: UnitStatus::Failed,
            },
            Err(save_err) => {
                tracing::warn!(unit_id = %id, error = %save_err, "could not record failed status");
                TaskOutcome::Settled { status: previous }
            }
        };
        report
    }

    async fn load(&self, id: UnitId) -> Result<Option<Unit>, ProvisionError> {
        let store = self.store.clone();
        self.executor
            .run(Step::LoadUnit, self.options.timeouts.store, move || {
                Ok(store.get(id)?)
            })
            .await
    }

    async fn save(&self, unit: Unit) -> Result<(), ProvisionError> {
        let store = self.store.clone();
        self.executor
            .run(Step::SaveUnit, self.options.timeouts.store, move || {
                Ok(store.update(&unit)?)
            })
            .await
    }

    async fn remove_row(&self, id: UnitId) -> Result<(), ProvisionError> {
        let store = self.store.clone();
        self.executor
            .run(Step::RemoveUnit, self.options.timeouts.store, move || {
                Ok(store.delete(id)?)
            })
            .await
    }

    async fn children(&self, id: UnitId) -> Result<Vec<Unit>, ProvisionError> {
        let store = self.store.clone();
        self.executor
            .run(Step::LoadUnit, self.options.timeouts.store, move || {
                Ok(store.children(id)?)
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Pool adapters
    // -----------------------------------------------------------------------

    async fn control_call<T, F>(&self, step: Step, limit: Duration, call: F) -> Result<T, ProvisionError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ControlPlane) -> Result<T, ControlPlaneError> + Send + 'static,
    {
        let cp = self.control_plane.clone();
        self.executor
            .run(step, limit, move || {
                call(cp.as_ref()).map_err(ProvisionError::control_plane(step))
            })
            .await
    }

    async fn storage_call<T, F>(&self, step: Step, call: F) -> Result<T, ProvisionError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn LocalStorage) -> Result<T, StorageError> + Send + 'static,
    {
        let storage = self.storage.clone();
        self.executor
            .run(step, self.options.timeouts.storage, move || {
                call(storage.as_ref()).map_err(ProvisionError::storage(step))
            })
            .await
    }

    async fn registry_call<T, F>(&self, step: Step, call: F) -> Result<T, ProvisionError>
    where
        T: Send + 'static,
        F: FnOnce(&GraphRegistry) -> Result<T, RegistryError> + Send + 'static,
    {
        let registry = self.registry.clone();
        self.executor
            .run(step, self.options.timeouts.registry, move || {
                call(&registry).map_err(ProvisionError::registry(step))
            })
            .await
    }

    async fn validate_registry(&self) -> Result<Validation, ProvisionError> {
        self.registry_call(Step::RegistryValidate, |registry| Ok(registry.validate()))
            .await
    }
}

async fn discard_upload(upload: &Path) {
    match tokio::fs::remove_file(upload).await {
        Ok(()) => tracing::debug!(path = %upload.display(), "staged upload removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %upload.display(), error = %err, "could not remove staged upload"),
    }
}
