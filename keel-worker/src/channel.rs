//! Polled two-slot channel between orchestrator and worker.
//!
//! The orchestrator is the only writer of commands; the worker is the only
//! writer of status. Nothing is pushed: the orchestrator polls. Every read must
//! tolerate a missing or half-written slot, so reads never fail. An unreadable
//! status slot is reported as [`WorkerState::Idle`].

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use keel_core::ProjectName;

use crate::error::{io_err, WorkerError};
use crate::protocol::{WorkerCommand, WorkerState};

/// Message-passing seam to one worker: write a command, poll the status.
pub trait WorkerChannel: Send {
    /// Overwrite the command slot with `command`.
    fn send(&self, command: WorkerCommand) -> Result<(), WorkerError>;

    /// Read and classify the status slot. Never fails.
    fn poll(&self) -> WorkerState;

    /// Current content of the command slot, `None` if missing or unrecognised.
    /// The worker resets `BUILD` to `WAIT` once it has picked the command up.
    fn pending_command(&self) -> Option<WorkerCommand>;
}

// ---------------------------------------------------------------------------
// Per-project file layout
// ---------------------------------------------------------------------------

/// Extension of the files the worker writes before renaming them over a slot.
/// Distinct from the orchestrator's `.tmp` so the two writers never share one.
pub(crate) const WORKER_STAGING_EXT: &str = "new";

/// `<state_dir>/<project>/{command,status,worker.sh,worker.log}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    pub dir: PathBuf,
}

impl ChannelLayout {
    pub fn for_project(state_dir: &Path, project: &ProjectName) -> Self {
        Self {
            dir: state_dir.join(&project.0),
        }
    }

    pub fn command_path(&self) -> PathBuf {
        self.dir.join("command")
    }

    pub fn status_path(&self) -> PathBuf {
        self.dir.join("status")
    }

    pub fn script_path(&self) -> PathBuf {
        self.dir.join("worker.sh")
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join("worker.log")
    }

    /// Slot files plus any staging copies a killed worker may have left.
    fn slot_files(&self) -> Vec<PathBuf> {
        let command = self.command_path();
        let status = self.status_path();
        vec![
            command.with_extension("tmp"),
            command.with_extension(WORKER_STAGING_EXT),
            status.with_extension(WORKER_STAGING_EXT),
            command,
            status,
        ]
    }

    /// Create the directory, drop stale slots from a previous run and seed the
    /// command slot with `WAIT`.
    pub fn prepare(&self) -> Result<FileChannel, WorkerError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        for path in self.slot_files() {
            remove_if_exists(&path)?;
        }
        let channel = FileChannel::new(self);
        channel.send(WorkerCommand::Wait)?;
        Ok(channel)
    }

    /// Remove command, status and script files. The worker log is kept.
    pub fn cleanup(&self) {
        for path in self.slot_files().into_iter().chain([self.script_path()]) {
            if let Err(err) = remove_if_exists(&path) {
                tracing::warn!(path = %path.display(), error = %err, "channel cleanup failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// File transport
// ---------------------------------------------------------------------------

/// File-backed [`WorkerChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChannel {
    command_path: PathBuf,
    status_path: PathBuf,
}

impl FileChannel {
    pub fn new(layout: &ChannelLayout) -> Self {
        Self {
            command_path: layout.command_path(),
            status_path: layout.status_path(),
        }
    }

    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }
}

impl WorkerChannel for FileChannel {
    /// Write to a `.tmp` sibling, then rename over the slot, so a reader sees
    /// either the old or the new command and never a partial one.
    fn send(&self, command: WorkerCommand) -> Result<(), WorkerError> {
        let tmp = self.command_path.with_extension("tmp");
        fs::write(&tmp, command.as_str()).map_err(|e| io_err(&tmp, e))?;
        if let Err(err) = fs::rename(&tmp, &self.command_path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&self.command_path, err));
        }
        Ok(())
    }

    fn poll(&self) -> WorkerState {
        match fs::read(&self.status_path) {
            Ok(bytes) => WorkerState::decode(&String::from_utf8_lossy(&bytes)),
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    tracing::debug!(
                        path = %self.status_path.display(),
                        error = %err,
                        "status slot unreadable, treating as idle",
                    );
                }
                WorkerState::Idle
            }
        }
    }

    fn pending_command(&self) -> Option<WorkerCommand> {
        fs::read_to_string(&self.command_path)
            .ok()
            .and_then(|content| WorkerCommand::parse(&content))
    }
}

fn remove_if_exists(path: &Path) -> Result<(), WorkerError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout(tmp: &TempDir) -> ChannelLayout {
        ChannelLayout::for_project(tmp.path(), &ProjectName::from("core"))
    }

    #[test]
    fn prepare_seeds_wait_and_removes_stale_status() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout(&tmp);
        fs::create_dir_all(&layout.dir).expect("mkdir");
        fs::write(layout.status_path(), "RUNNING:old").expect("stale status");

        let channel = layout.prepare().expect("prepare");
        assert_eq!(channel.pending_command(), Some(WorkerCommand::Wait));
        assert!(!layout.status_path().exists());
        assert_eq!(channel.poll(), WorkerState::Idle);
    }

    #[test]
    fn send_overwrites_and_leaves_no_tmp() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout(&tmp);
        let channel = layout.prepare().expect("prepare");
        channel.send(WorkerCommand::Build).expect("build");
        channel.send(WorkerCommand::Exit).expect("exit");
        assert_eq!(
            fs::read_to_string(layout.command_path()).expect("read"),
            "EXIT"
        );
        assert!(!layout.command_path().with_extension("tmp").exists());
    }

    #[test]
    fn repeated_wait_leaves_idle_worker_idle() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout(&tmp);
        let channel = layout.prepare().expect("prepare");
        fs::write(layout.status_path(), "IDLE\n").expect("status");
        for _ in 0..3 {
            channel.send(WorkerCommand::Wait).expect("wait");
            assert_eq!(channel.poll(), WorkerState::Idle);
        }
        assert_eq!(channel.pending_command(), Some(WorkerCommand::Wait));
    }

    #[test]
    fn missing_status_is_idle() {
        let tmp = TempDir::new().expect("tempdir");
        let channel = FileChannel::new(&layout(&tmp));
        assert_eq!(channel.poll(), WorkerState::Idle);
        assert_eq!(channel.pending_command(), None);
    }

    #[test]
    fn cleanup_keeps_log() {
        let tmp = TempDir::new().expect("tempdir");
        let layout = layout(&tmp);
        layout.prepare().expect("prepare");
        fs::write(layout.status_path(), "IDLE").expect("status");
        fs::write(layout.script_path(), "#!/bin/sh").expect("script");
        fs::write(layout.log_path(), "log").expect("log");
        layout.cleanup();
        assert!(!layout.command_path().exists());
        assert!(!layout.status_path().exists());
        assert!(!layout.script_path().exists());
        assert!(layout.log_path().exists());
    }
}
