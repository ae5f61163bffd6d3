use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};

use keel_core::{config, Config, ProjectName, TaskRegistry};
use keel_detector::backend_for;
use keel_sync::{launcher_for, SyncCoordinator};
use keel_worker::{FileChannel, ScriptRenderer, WorkerHandle, WorkerSpec};

use crate::dispatch::BuildDispatcher;
use crate::error::{io_err, DaemonError};
use crate::logging::init_tracing;
use crate::paths::{keel_root, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse, DaemonStatus};
use crate::scheduler::Scheduler;

enum ControlCommand {
    Status,
    Force(ProjectName),
}

struct ControlJob {
    command: ControlCommand,
    respond_to: oneshot::Sender<Result<Value, String>>,
}

/// Static facts reported by `status`.
#[derive(Debug, Clone)]
struct DaemonInfo {
    mode: String,
    pid: u32,
    started_at_unix: u64,
    socket: String,
}

/// Load and validate the configuration, set up tracing, then run the
/// orchestrator on a fresh multi-threaded runtime until it exits.
pub fn start_blocking(config_path: Option<&Path>, home: &Path) -> Result<(), DaemonError> {
    let config = match config_path {
        Some(path) => config::load_from(path)?,
        None => config::load_default_at(home)?,
    };
    init_tracing(&config.log_level, config.log_file_at(home).as_deref())?;

    let report = config.validate();
    for issue in report.warnings() {
        tracing::warn!(issue = %issue, "config warning");
    }
    for issue in report.errors() {
        tracing::error!(issue = %issue, "config error");
    }
    report.into_result()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, home.to_path_buf()))
}

/// Run the orchestrator: start one worker per project, then drive the
/// scheduler loop and the control socket until `stop` or ctrl-c.
pub async fn run(config: Config, home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&config, &home)?;

    let backend = backend_for(&config);
    let backend = tokio::task::spawn_blocking(move || backend.check_connection().map(|()| backend))
        .await
        .map_err(|err| DaemonError::Protocol(format!("connection check join error: {err}")))??;

    let (mut workers, dispatcher) = start_workers(&config, &home)?;
    let mut registry = TaskRegistry::new();
    for task in config.task_registry()?.iter() {
        if dispatcher.has_worker(&task.name) {
            registry.insert(task.clone())?;
        }
    }
    let scheduler = Scheduler::new(
        registry,
        backend,
        SyncCoordinator::new(launcher_for(&config)),
        dispatcher,
    );

    let info = DaemonInfo {
        mode: config.mode.to_string(),
        pid: std::process::id(),
        started_at_unix: unix_seconds_now(),
        socket: socket_path(&home).display().to_string(),
    };
    tracing::info!(
        mode = %info.mode,
        projects = workers.len(),
        poll_interval = ?config.poll_interval(),
        "orchestrator started",
    );

    let (control_tx, control_rx) = mpsc::channel::<ControlJob>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let poll_interval = config.poll_interval();
        let info = info.clone();
        let shutdown_rx = shutdown.subscribe();
        let grace = config.worker_exit_grace();
        tokio::spawn(async move {
            let result = scheduler_task(
                scheduler,
                &mut workers,
                poll_interval,
                info,
                control_rx,
                shutdown_rx,
            )
            .await;
            let _ = shutdown.send(());
            stop_workers(workers, grace).await;
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(home, control_tx, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (scheduler_result, socket_result, signal_result) =
        tokio::join!(scheduler_handle, socket_handle, signal_handle);

    handle_join("scheduler", scheduler_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("orchestrator stopped");
    Ok(())
}

/// Spawn one worker per configured project. Projects whose worker fails to
/// start are left out; no worker at all is fatal.
fn start_workers(
    config: &Config,
    home: &Path,
) -> Result<(Vec<WorkerHandle>, BuildDispatcher<FileChannel>), DaemonError> {
    let renderer = ScriptRenderer::new()?;
    let state_dir = config.state_dir_at(home);
    let mut workers = Vec::new();
    let mut dispatcher = BuildDispatcher::new();

    for project in &config.projects {
        let spec = WorkerSpec::from_config(config, project);
        match WorkerHandle::spawn(&spec, &state_dir, &renderer) {
            Ok(worker) => {
                dispatcher.register(project.name.clone(), worker.channel());
                workers.push(worker);
            }
            Err(err) => {
                tracing::error!(project = %project.name, error = %err, "worker failed to start, project disabled");
            }
        }
    }

    if workers.is_empty() {
        return Err(DaemonError::NoWorkers);
    }
    Ok((workers, dispatcher))
}

/// Ask every worker to exit. A panicked scheduler task drops its workers
/// instead, which kills them without cleanup.
async fn stop_workers(workers: Vec<WorkerHandle>, grace: Duration) {
    let stopped = tokio::task::spawn_blocking(move || {
        for mut worker in workers {
            worker.shutdown(grace);
        }
    })
    .await;
    if let Err(err) = stopped {
        tracing::error!(error = %err, "worker shutdown task failed");
    }
}

async fn scheduler_task(
    mut scheduler: Scheduler<FileChannel>,
    workers: &mut [WorkerHandle],
    poll_interval: Duration,
    info: DaemonInfo,
    mut control_rx: mpsc::Receiver<ControlJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut next_tick = tokio::time::Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep_until(next_tick) => {
                let now = std::time::Instant::now();
                for worker in workers.iter_mut() {
                    if !worker.is_alive() {
                        scheduler.mark_worker_exited(worker.project(), now);
                    }
                }
                // Change detection may block on the backend; keep it off the async workers.
                scheduler = tokio::task::spawn_blocking(move || {
                    scheduler.tick(now);
                    scheduler
                })
                .await
                .map_err(|err| DaemonError::Protocol(format!("scheduler tick join error: {err}")))?;
                next_tick = tokio::time::Instant::now() + scheduler.next_sleep(now, poll_interval);
            }
            job = control_rx.recv() => {
                let Some(job) = job else { break };
                let response = match job.command {
                    ControlCommand::Status => Ok(status_payload(&scheduler, &info)),
                    ControlCommand::Force(project) => match scheduler.force(&project) {
                        Ok(()) => {
                            next_tick = tokio::time::Instant::now();
                            Ok(json!({ "project": project, "forced": true }))
                        }
                        Err(err) => Err(err.to_string()),
                    },
                };
                let _ = job.respond_to.send(response);
            }
        }
    }

    scheduler.shutdown();
    Ok(())
}

fn status_payload(scheduler: &Scheduler<FileChannel>, info: &DaemonInfo) -> Value {
    let status = DaemonStatus {
        running: true,
        mode: info.mode.clone(),
        pid: info.pid,
        started_at_unix: info.started_at_unix,
        socket: info.socket.clone(),
        snapshot: scheduler.snapshot(std::time::Instant::now()),
    };
    serde_json::to_value(status).unwrap_or_else(|err| json!({ "running": true, "error": err.to_string() }))
}

async fn socket_server_task(
    home: PathBuf,
    control_tx: mpsc::Sender<ControlJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let control_tx = control_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, control_tx, shutdown_tx).await {
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
    control_tx: mpsc::Sender<ControlJob>,
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

        let response = match (request.cmd.as_str(), request.project) {
            ("status", _) => control(&control_tx, ControlCommand::Status).await,
            ("force", Some(project)) => {
                control(&control_tx, ControlCommand::Force(ProjectName::from(project))).await
            }
            ("force", None) => DaemonResponse::error("force requires a project"),
            ("stop", _) => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            (other, _) => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

/// Hand a command to the scheduler task and wait for its answer.
async fn control(control_tx: &mpsc::Sender<ControlJob>, command: ControlCommand) -> DaemonResponse {
    let (tx, rx) = oneshot::channel();
    let job = ControlJob {
        command,
        respond_to: tx,
    };
    if control_tx.send(job).await.is_err() {
        return DaemonResponse::error(DaemonError::ChannelClosed("scheduler").to_string());
    }
    match rx.await {
        Ok(Ok(data)) => DaemonResponse::ok(data),
        Ok(Err(message)) => DaemonResponse::error(message),
        Err(_) => DaemonResponse::error(DaemonError::ChannelClosed("scheduler response").to_string()),
    }
}

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

fn ensure_runtime_dirs(config: &Config, home: &Path) -> Result<(), DaemonError> {
    for dir in [keel_root(home), config.state_dir_at(home)] {
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

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}
