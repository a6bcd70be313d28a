use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use stackyard_core::{paths, FileStatusStore, Settings, StatusStore, UnitId};
use stackyard_registry::{GraphRegistry, Validation};
use stackyard_storage::{FsStorage, StorageLayout};

use crate::control_plane::{self, ControlPlane};
use crate::error::{io_err, DaemonError};
use crate::lifecycle::{LifecycleOptions, Orchestrator};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::queue::{RunnerStats, TaskQueue, TaskRunner};
use crate::requests::RequestHandler;

pub const LOG_FORMAT_ENV: &str = "STACKYARD_LOG_FORMAT";

/// The registry described by `settings`, with its lock bounds applied.
pub fn open_registry(settings: &Settings) -> GraphRegistry {
    GraphRegistry::new(settings.registry_path())
        .with_lock_timeouts(settings.registry_write_lock(), settings.registry_read_lock())
}

/// Everything the daemon wires together: orchestrator, fast path, runner.
pub struct Services {
    pub orchestrator: Arc<Orchestrator>,
    pub requests: Arc<RequestHandler>,
    pub runner: TaskRunner,
}

impl Services {
    /// Connect an orchestrator to a fresh task queue and runner.
    pub fn new(
        orchestrator: Orchestrator,
        staging: impl Into<PathBuf>,
        queue_capacity: usize,
        max_in_flight: usize,
    ) -> Self {
        let orchestrator = Arc::new(orchestrator);
        let (queue, rx) = TaskQueue::channel(queue_capacity);
        let requests = Arc::new(RequestHandler::new(orchestrator.store(), queue, staging));
        let runner = TaskRunner::new(rx, orchestrator.clone(), max_in_flight);
        Self {
            orchestrator,
            requests,
            runner,
        }
    }

    /// Production wiring: file status store, local filesystem, configured control plane.
    pub fn from_settings(home: &Path, settings: &Settings) -> Self {
        let control_plane: Arc<dyn ControlPlane> =
            control_plane::from_settings(&settings.control_plane, settings.workload_timeout()).into();
        let orchestrator = Orchestrator::new(
            control_plane,
            Arc::new(FsStorage::new()),
            Arc::new(FileStatusStore::at_home(home)),
            open_registry(settings),
            StorageLayout::new(settings.platform_root.clone()),
            LifecycleOptions::from_settings(settings),
        );
        Self::new(
            orchestrator,
            paths::staging_dir(home),
            settings.workers.queue_capacity,
            settings.workers.max_in_flight,
        )
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let settings = Settings::load_at(home)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), settings))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf, settings: Settings) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    tracing::info!(
        environment = ?settings.environment,
        permissive = settings.is_permissive(),
        platform_root = %settings.platform_root.display(),
        registry = %settings.registry_path().display(),
        "starting stackyard daemon"
    );

    let services = Services::from_settings(&home, &settings);
    prepare_registry(services.orchestrator.registry());
    report_unsettled(services.orchestrator.store().as_ref());

    let started_at_unix = unix_seconds_now();
    let stats = services.runner.stats();
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let runner_handle = {
        let shutdown = shutdown_tx.clone();
        let runner = services.runner;
        tokio::spawn(async move {
            runner.run(shutdown.subscribe()).await;
            let _ = shutdown.send(());
            Ok::<(), DaemonError>(())
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let context = SocketContext {
            home: home.clone(),
            settings: Arc::new(settings),
            requests: services.requests.clone(),
            registry: services.orchestrator.registry().clone(),
            stats,
            started_at_unix,
        };
        tokio::spawn(async move {
            let result = socket_server_task(context, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (runner_result, socket_result, signal_result) =
        tokio::join!(runner_handle, socket_handle, signal_handle);

    handle_join("task_runner", runner_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

/// Create the registry if absent and report its state. Never repairs.
fn prepare_registry(registry: &GraphRegistry) {
    match registry.initialize() {
        Ok(_) => {}
        Err(err) => tracing::warn!(path = %registry.path().display(), error = %err, "could not initialize registry"),
    }
    if let Validation::Invalid { reason } = registry.validate() {
        tracing::warn!(path = %registry.path().display(), %reason, "registry is invalid; run `stackyard registry repair`");
    }
}

/// Rows left in flight by a previous process stay as they are.
fn report_unsettled(store: &dyn StatusStore) {
    match store.list() {
        Ok(units) => {
            let stuck: Vec<UnitId> = units
                .iter()
                .filter(|unit| unit.status.is_in_flight())
                .map(|unit| unit.id)
                .collect();
            if !stuck.is_empty() {
                tracing::warn!(count = stuck.len(), units = ?stuck, "units left in flight by a previous run");
            }
        }
        Err(err) => tracing::warn!(error = %err, "could not list units at startup"),
    }
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct SocketContext {
    home: PathBuf,
    settings: Arc<Settings>,
    requests: Arc<RequestHandler>,
    registry: GraphRegistry,
    stats: Arc<RunnerStats>,
    started_at_unix: u64,
}

async fn socket_server_task(
    context: SocketContext,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = paths::socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = context.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    context: SocketContext,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let cmd = request.cmd.clone();
        let response = match cmd.as_str() {
            "status" => {
                let context = context.clone();
                match tokio::task::spawn_blocking(move || build_status_payload(&context)).await {
                    Ok(payload) => DaemonResponse::ok(payload),
                    Err(err) => DaemonResponse::error(format!("status join error: {err}")),
                }
            }
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            _ => {
                let requests = context.requests.clone();
                let outcome =
                    tokio::task::spawn_blocking(move || handle_command(&requests, &request)).await;
                match outcome {
                    Ok(Ok(data)) => DaemonResponse::ok(data),
                    Ok(Err(message)) => DaemonResponse::error(message),
                    Err(err) => DaemonResponse::error(format!("request join error: {err}")),
                }
            }
        };

        write_response(&mut writer, &response).await?;
        if cmd == "stop" {
            break;
        }
    }

    Ok(())
}

/// Fast-path commands. Errors come back as the response message.
pub(crate) fn handle_command(
    requests: &RequestHandler,
    request: &DaemonRequest,
) -> Result<Value, String> {
    let unit = match request.cmd.as_str() {
        "units" => {
            let units = requests.units().map_err(|e| e.to_string())?;
            return serde_json::to_value(units).map_err(|e| e.to_string());
        }
        "stack.create" => {
            let name = required(&request.name, "name")?;
            requests.request_stack_creation(name, request.description.clone())
        }
        "stack.delete" => requests.request_stack_deletion(parse_id(&request.id, "id")?),
        "stack.retry" => requests.request_stack_retry(parse_id(&request.id, "id")?),
        "stack.update" => requests.request_stack_update(
            parse_id(&request.id, "id")?,
            request.name.as_deref(),
            request.description.clone(),
        ),
        "agent.create" => {
            let stack_id = parse_id(&request.stack_id, "stack_id")?;
            let name = required(&request.name, "name")?;
            let archive = request
                .archive
                .as_deref()
                .ok_or_else(|| "missing field 'archive'".to_string())?;
            requests.request_agent_creation(stack_id, name, request.description.clone(), archive)
        }
        "agent.delete" => requests.request_agent_deletion(parse_id(&request.id, "id")?),
        "agent.update" => requests.request_agent_update(
            parse_id(&request.id, "id")?,
            request.name.as_deref(),
            request.description.clone(),
        ),
        other => return Err(format!("unknown command '{other}'")),
    };
    let unit = unit.map_err(|e| e.to_string())?;
    serde_json::to_value(unit).map_err(|e| e.to_string())
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, String> {
    value
        .as_deref()
        .ok_or_else(|| format!("missing field '{field}'"))
}

fn parse_id(value: &Option<String>, field: &str) -> Result<UnitId, String> {
    let raw = required(value, field)?;
    raw.parse()
        .map_err(|err| format!("invalid {field} '{raw}': {err}"))
}

fn build_status_payload(context: &SocketContext) -> Value {
    let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
    let units = match context.requests.units() {
        Ok(units) => {
            for unit in &units {
                *by_status.entry(unit.status.to_string()).or_default() += 1;
            }
            json!({ "total": units.len(), "by_status": by_status })
        }
        Err(err) => json!({ "error": err.to_string() }),
    };

    let (registry_valid, registry_reason) = context.registry.validate().into_parts();
    let settings = &context.settings;

    json!({
        "running": true,
        "started_at_unix": context.started_at_unix,
        "socket": paths::socket_path(&context.home).display().to_string(),
        "environment": settings.environment,
        "permissive": settings.is_permissive(),
        "platform_root": settings.platform_root.display().to_string(),
        "registry": {
            "path": context.registry.path().display().to_string(),
            "valid": registry_valid,
            "reason": registry_reason,
        },
        "units": units,
        "tasks": context.stats.snapshot(),
    })
}

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [
        paths::state_root(home),
        paths::units_dir(home),
        paths::staging_dir(home),
    ] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber. `RUST_LOG` filters; `STACKYARD_LOG_FORMAT=json`
/// switches to JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        let _ = fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackyard_core::{MemoryStatusStore, UnitStatus};
    use tempfile::TempDir;

    use crate::control_plane::UnavailableControlPlane;

    fn services(dir: &TempDir) -> Services {
        let orchestrator = Orchestrator::new(
            Arc::new(UnavailableControlPlane),
            Arc::new(FsStorage::new()),
            Arc::new(MemoryStatusStore::new()),
            GraphRegistry::new(dir.path().join("runtime").join("graphs.json")),
            StorageLayout::new(dir.path().join("platform")),
            LifecycleOptions::default(),
        );
        Services::new(orchestrator, dir.path().join("staging"), 8, 2)
    }

    fn command(cmd: &str) -> DaemonRequest {
        DaemonRequest::new(cmd)
    }

    #[tokio::test]
    async fn stack_create_command_returns_creating_row_and_queues_task() {
        let dir = TempDir::new().expect("tempdir");
        let mut services = services(&dir);

        let request = DaemonRequest {
            name: Some("acme".to_string()),
            ..command("stack.create")
        };
        let data = handle_command(&services.requests, &request).expect("create");
        assert_eq!(data["status"], "creating");
        assert_eq!(data["name"], "acme");

        let reports = services.runner.drain().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status(), Some(UnitStatus::Ready), "permissive by default");
    }

    #[test]
    fn missing_fields_and_bad_ids_are_reported() {
        let dir = TempDir::new().expect("tempdir");
        let services = services(&dir);

        let err = handle_command(&services.requests, &command("stack.create")).unwrap_err();
        assert_eq!(err, "missing field 'name'");

        let err = handle_command(&services.requests, &command("stack.delete").with_id("nope"))
            .unwrap_err();
        assert!(err.starts_with("invalid id 'nope'"), "got: {err}");

        let err = handle_command(&services.requests, &command("frobnicate")).unwrap_err();
        assert_eq!(err, "unknown command 'frobnicate'");
    }

    #[tokio::test]
    async fn update_command_edits_a_settled_stack() {
        let dir = TempDir::new().expect("tempdir");
        let mut services = services(&dir);
        let unit = services
            .requests
            .request_stack_creation("acme", None)
            .expect("create");
        services.runner.drain().await;

        let request = DaemonRequest {
            description: Some("team stack".to_string()),
            ..command("stack.update").with_id(unit.id.to_string())
        };
        let data = handle_command(&services.requests, &request).expect("update");
        assert_eq!(data["name"], "acme");
        assert_eq!(data["description"], "team stack");
        assert_eq!(data["status"], "ready");

        let err = handle_command(&services.requests, &command("agent.update")).unwrap_err();
        assert_eq!(err, "missing field 'id'");
    }

    #[test]
    fn delete_of_unknown_unit_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let services = services(&dir);
        let id = UnitId::new();
        let err = handle_command(&services.requests, &command("agent.delete").with_id(id.to_string()))
            .unwrap_err();
        assert_eq!(err, format!("unit {id} not found"));
    }

    #[test]
    fn units_command_lists_rows() {
        let dir = TempDir::new().expect("tempdir");
        let services = services(&dir);
        services
            .requests
            .request_stack_creation("one", None)
            .expect("create");
        let data = handle_command(&services.requests, &command("units")).expect("units");
        assert_eq!(data.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn status_payload_counts_units_by_status() {
        let dir = TempDir::new().expect("tempdir");
        let services = services(&dir);
        services
            .requests
            .request_stack_creation("one", None)
            .expect("create");
        let context = SocketContext {
            home: dir.path().to_path_buf(),
            settings: Arc::new(Settings::default()),
            requests: services.requests.clone(),
            registry: services.orchestrator.registry().clone(),
            stats: services.runner.stats(),
            started_at_unix: 1_000_000,
        };

        let payload = build_status_payload(&context);
        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000_000u64));
        assert_eq!(payload["units"]["total"], json!(1));
        assert_eq!(payload["units"]["by_status"]["creating"], json!(1));
        assert_eq!(payload["registry"]["valid"], json!(false), "registry not created yet");
        assert_eq!(payload["tasks"]["finished"], json!(0));
    }

    #[test]
    fn registry_is_initialized_but_not_repaired() {
        let dir = TempDir::new().expect("tempdir");
        let registry = GraphRegistry::new(dir.path().join("graphs.json"));
        prepare_registry(&registry);
        assert!(registry.validate().is_valid());

        fs::write(registry.path(), "{broken").expect("corrupt");
        prepare_registry(&registry);
        assert_eq!(fs::read_to_string(registry.path()).expect("read"), "{broken");
    }
}
