//! Launching one sync and watching it from the scheduler.
//!
//! A sync runs as its own tokio task. The scheduler never awaits it: it polls
//! the [`SyncHandle`] once per tick and reads a snapshot of the shared
//! [`SyncProgress`].

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use keel_core::{BackendMode, ChangeToken, Config, P4Settings, ProjectName, SimulationSettings};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::SyncError;
use crate::progress::SyncProgress;

/// Progress counters shared between a sync task and its observers.
pub type SharedProgress = Arc<Mutex<SyncProgress>>;

/// What to sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub project: ProjectName,
    pub depot_path: String,
    pub working_dir: PathBuf,
    /// Change to sync to; `None` syncs to head.
    pub version: Option<ChangeToken>,
}

impl SyncRequest {
    /// `p4 sync` file argument: `<depot_path>@<change>` when a change is known.
    pub fn target(&self) -> String {
        match &self.version {
            Some(version) => format!("{}@{}", self.depot_path, version),
            None => self.depot_path.clone(),
        }
    }
}

/// Starts syncs. Implementations must be called from within a tokio runtime.
pub trait SyncLauncher: Send + Sync {
    fn launch(&self, request: &SyncRequest) -> SyncHandle;
}

/// Live launcher in `mode: live`, simulated ticker otherwise.
pub fn launcher_for(config: &Config) -> Box<dyn SyncLauncher> {
    match config.mode {
        BackendMode::Live => Box::new(P4SyncLauncher::new(config.p4.clone())),
        BackendMode::Simulated => Box::new(SimulatedSyncLauncher::new(config.simulation.clone())),
    }
}

pub(crate) fn lock(progress: &SharedProgress) -> MutexGuard<'_, SyncProgress> {
    progress.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// SyncHandle
// ---------------------------------------------------------------------------

/// Handle on one in-flight sync.
#[derive(Debug)]
pub struct SyncHandle {
    project: ProjectName,
    progress: SharedProgress,
    outcome: oneshot::Receiver<Result<(), SyncError>>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Run the future built by `work` on its own task with fresh progress.
    pub fn spawn<F, Fut>(project: ProjectName, work: F) -> Self
    where
        F: FnOnce(SharedProgress) -> Fut,
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let progress = SharedProgress::default();
        let (tx, outcome) = oneshot::channel();
        let fut = work(progress.clone());
        let task = tokio::spawn(async move {
            let _ = tx.send(fut.await);
        });
        Self {
            project,
            progress,
            outcome,
            task,
        }
    }

    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    /// `None` while the sync is still running.
    pub fn poll(&mut self) -> Option<Result<(), SyncError>> {
        match self.outcome.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(SyncError::Lost)),
        }
    }

    /// Snapshot of the current counters.
    pub fn progress(&self) -> SyncProgress {
        lock(&self.progress).clone()
    }

    /// Abort the sync task. A live `p4 sync` child is killed when its task drops.
    pub fn terminate(&self) {
        self.task.abort();
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ---------------------------------------------------------------------------
// Live: p4 sync
// ---------------------------------------------------------------------------

/// Runs `p4 sync <depot_path>@<change>` in the project's working directory and
/// feeds stdout and stderr into the progress counters line by line.
#[derive(Debug, Clone)]
pub struct P4SyncLauncher {
    settings: P4Settings,
}

impl P4SyncLauncher {
    pub fn new(settings: P4Settings) -> Self {
        Self { settings }
    }
}

impl SyncLauncher for P4SyncLauncher {
    fn launch(&self, request: &SyncRequest) -> SyncHandle {
        let settings = self.settings.clone();
        let request = request.clone();
        SyncHandle::spawn(request.project.clone(), move |progress| {
            run_p4_sync(settings, request, progress)
        })
    }
}

async fn run_p4_sync(
    settings: P4Settings,
    request: SyncRequest,
    progress: SharedProgress,
) -> Result<(), SyncError> {
    let target = request.target();
    tracing::info!(project = %request.project, target = %target, "starting p4 sync");

    let mut child = Command::new(&settings.program)
        .arg("sync")
        .arg(&target)
        .envs(settings.env_pairs())
        .current_dir(&request.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SyncError::Spawn {
            program: settings.program.clone(),
            source,
        })?;

    let stdout = tokio::spawn(pump_lines(child.stdout.take(), progress.clone()));
    let stderr = tokio::spawn(pump_lines(child.stderr.take(), progress));
    let _ = tokio::join!(stdout, stderr);

    let status = child.wait().await?;
    if status.success() {
        Ok(())
    } else {
        Err(SyncError::ExitStatus {
            code: status.code(),
        })
    }
}

async fn pump_lines<R>(reader: Option<R>, progress: SharedProgress)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::trace!(line = %line, "sync output");
        lock(&progress).ingest_line(&line);
    }
}

// ---------------------------------------------------------------------------
// Simulated
// ---------------------------------------------------------------------------

/// Completes one file per tick until `total_files` is reached.
#[derive(Debug, Clone)]
pub struct SimulatedSyncLauncher {
    settings: SimulationSettings,
}

impl SimulatedSyncLauncher {
    pub fn new(settings: SimulationSettings) -> Self {
        Self { settings }
    }
}

impl SyncLauncher for SimulatedSyncLauncher {
    fn launch(&self, request: &SyncRequest) -> SyncHandle {
        let settings = self.settings.clone();
        let depot = request.depot_path.trim_end_matches("/...").to_string();
        SyncHandle::spawn(request.project.clone(), move |progress| {
            simulate(settings, depot, progress)
        })
    }
}

async fn simulate(
    settings: SimulationSettings,
    depot: String,
    progress: SharedProgress,
) -> Result<(), SyncError> {
    lock(&progress).total_files = settings.total_files;

    let mut ticker = tokio::time::interval(settings.tick().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    for n in 1..=settings.total_files {
        ticker.tick().await;
        let file = format!("{depot}/file_{n:04}.dat");
        lock(&progress).record_file(&file, "updating", settings.bytes_per_file);
    }
    Ok(())
}
