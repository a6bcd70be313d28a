//! Provisioning orchestrator and daemon runtime.
//!
//! - [`lifecycle`]: stack/agent create and delete tasks, [`Orchestrator`]
//! - [`queue`]: task queue and runner
//! - [`requests`]: synchronous fast path that creates rows and dispatches tasks
//! - [`control_plane`]: cluster contract and adapters
//! - [`executor`]: bounded, time-limited pool for blocking calls
//! - [`protocol`] / runtime: unix-socket daemon

pub mod control_plane;
mod error;
pub mod executor;
pub mod lifecycle;
pub mod protocol;
pub mod queue;
pub mod requests;
mod runtime;

pub use control_plane::{
    ControlPlane, HttpControlPlane, NamespaceCreated, NamespaceDeletion, UnavailableControlPlane,
    WorkloadSpec,
};
pub use error::{ControlPlaneError, DaemonError, FailureKind, ProvisionError, RequestError};
pub use executor::Executor;
pub use lifecycle::{
    LifecycleOptions, Operation, Orchestrator, Step, StepTimeouts, TaskFailure, TaskOutcome,
    TaskReport,
};
pub use protocol::{
    request_agent_create, request_agent_delete, request_agent_update, request_stack_create,
    request_stack_delete, request_stack_retry, request_stack_update, request_status,
    request_stop, request_units, send_request, DaemonRequest, DaemonResponse,
};
pub use queue::{LifecycleTask, RunnerSnapshot, RunnerStats, TaskQueue, TaskRunner};
pub use requests::RequestHandler;
pub use runtime::{init_tracing, open_registry, run, start_blocking, Services, LOG_FORMAT_ENV};
