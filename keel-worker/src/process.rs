//! Worker process lifecycle: spawn once at startup, shut down once at exit.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use keel_core::{Config, ProjectConfig, ProjectName};

use crate::channel::{ChannelLayout, FileChannel, WorkerChannel};
use crate::error::{io_err, WorkerError};
use crate::protocol::WorkerCommand;
use crate::script::ScriptRenderer;

/// Everything needed to start one project's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub project: ProjectName,
    pub working_dir: PathBuf,
    /// Ordered step scripts, relative to `working_dir`.
    pub build_steps: Vec<String>,
    /// How long a finished build keeps its last COMPLETED/ERROR line visible.
    pub status_hold: Duration,
}

impl WorkerSpec {
    pub fn from_config(config: &Config, project: &ProjectConfig) -> Self {
        Self {
            project: project.name.clone(),
            working_dir: project.working_dir.clone(),
            build_steps: project.build_steps.clone(),
            status_hold: Duration::from_secs(config.status_hold_secs),
        }
    }
}

/// A running worker process plus its channel files.
pub struct WorkerHandle {
    project: ProjectName,
    layout: ChannelLayout,
    channel: FileChannel,
    child: Child,
    stopped: bool,
}

impl WorkerHandle {
    /// Prepare the channel, render the script and start `sh <script>` in the
    /// project's working directory. Output is appended to `worker.log`.
    pub fn spawn(
        spec: &WorkerSpec,
        state_dir: &Path,
        renderer: &ScriptRenderer,
    ) -> Result<Self, WorkerError> {
        let layout = ChannelLayout::for_project(state_dir, &spec.project);
        let channel = layout.prepare()?;
        let script = renderer.write(spec, &layout)?;

        let log_path = layout.log_path();
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| io_err(&log_path, e))?;
        let stderr = stdout.try_clone().map_err(|e| io_err(&log_path, e))?;

        let child = Command::new("sh")
            .arg(&script)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                project: spec.project.0.clone(),
                source,
            })?;

        tracing::info!(
            project = %spec.project,
            pid = child.id(),
            steps = spec.build_steps.len(),
            "worker started",
        );

        Ok(Self {
            project: spec.project.clone(),
            layout,
            channel,
            child,
            stopped: false,
        })
    }

    pub fn project(&self) -> &ProjectName {
        &self.project
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// A handle on the same command/status slots.
    pub fn channel(&self) -> FileChannel {
        self.channel.clone()
    }

    /// `false` once the process has exited.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the worker to exit via the command slot, wait up to `grace`, then
    /// terminate it and remove the channel files.
    pub fn shutdown(&mut self, grace: Duration) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Err(err) = self.channel.send(WorkerCommand::Exit) {
            tracing::warn!(project = %self.project, error = %err, "failed to send EXIT");
        }

        let deadline = Instant::now() + grace;
        let mut exited = false;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                exited = true;
                break;
            }
            sleep(Duration::from_millis(50));
        }

        if !exited {
            tracing::warn!(project = %self.project, "worker did not exit in time, terminating");
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        self.layout.cleanup();
        tracing::info!(project = %self.project, "worker stopped");
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if !self.stopped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
