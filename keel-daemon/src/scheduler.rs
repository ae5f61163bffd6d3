//! The tick driver.
//!
//! One [`Scheduler::tick`] runs change detection for due `Idle` tasks, then the
//! sync coordinator, then the build dispatcher. It owns the task registry; the
//! runtime calls it from a single task so no locking is involved.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use keel_core::{ChangeToken, ProjectName, TaskError, TaskOutcome, TaskRegistry, TaskStatus};
use keel_detector::{check_for_changes, VcsBackend};
use keel_sync::progress::RECENT_ERRORS;
use keel_sync::{SyncCoordinator, SyncProgress};
use keel_worker::{WorkerChannel, WorkerState};
use serde::{Deserialize, Serialize};

use crate::dispatch::BuildDispatcher;

pub struct Scheduler<C: WorkerChannel> {
    registry: TaskRegistry,
    backend: Box<dyn VcsBackend>,
    coordinator: SyncCoordinator,
    dispatcher: BuildDispatcher<C>,
}

impl<C: WorkerChannel> Scheduler<C> {
    pub fn new(
        registry: TaskRegistry,
        backend: Box<dyn VcsBackend>,
        coordinator: SyncCoordinator,
        dispatcher: BuildDispatcher<C>,
    ) -> Self {
        Self {
            registry,
            backend,
            coordinator,
            dispatcher,
        }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn tick(&mut self, now: Instant) -> TickSummary {
        self.detect_changes(now);
        self.coordinator.tick(&mut self.registry, now);
        self.dispatcher.tick(&mut self.registry, now);

        let summary = self.summary();
        summary.log();
        summary
    }

    /// How long to wait before the next tick.
    ///
    /// `poll_interval` while anything is pending or in flight. When every task
    /// is idle, sleep until the earliest due change check, but never less than
    /// `poll_interval`.
    pub fn next_sleep(&self, now: Instant, poll_interval: Duration) -> Duration {
        let busy = self
            .registry
            .iter()
            .any(|task| task.status() != TaskStatus::Idle);
        if busy {
            return poll_interval;
        }
        let mut earliest: Option<Instant> = None;
        for task in self.registry.iter() {
            // No scheduled check means the task is due now.
            let Some(at) = task.next_check_at() else {
                return poll_interval;
            };
            earliest = Some(earliest.map_or(at, |e| e.min(at)));
        }
        earliest.map_or(poll_interval, |at| {
            at.saturating_duration_since(now).max(poll_interval)
        })
    }

    /// Forget the project's synced version and make its change check due now.
    pub fn force(&mut self, project: &ProjectName) -> Result<(), TaskError> {
        let task = self
            .registry
            .get_mut(project)
            .ok_or_else(|| TaskError::UnknownProject(project.clone()))?;
        task.force();
        tracing::info!(project = %project, status = %task.status(), "forced resync requested");
        Ok(())
    }

    /// Record that the project's worker process is gone. See
    /// [`BuildDispatcher::mark_worker_exited`].
    pub fn mark_worker_exited(&mut self, project: &ProjectName, now: Instant) {
        if let Some(task) = self.registry.get_mut(project) {
            self.dispatcher.mark_worker_exited(task, now);
        }
    }

    /// Terminate the active sync. Workers are shut down by the runtime.
    pub fn shutdown(&mut self) {
        self.coordinator.shutdown();
    }

    pub fn snapshot(&self, now: Instant) -> StatusSnapshot {
        let active = self.coordinator.active_project().cloned();
        let progress = self.coordinator.progress();
        let projects = self
            .registry
            .iter()
            .map(|task| {
                let sync = match (&active, &progress) {
                    (Some(name), Some(progress)) if *name == task.name => {
                        Some(SyncSnapshot::from_progress(progress))
                    }
                    _ => None,
                };
                ProjectSnapshot {
                    name: task.name.clone(),
                    status: task.status(),
                    version: task.version.clone(),
                    last_synced_version: task.last_synced_version.clone(),
                    last_outcome: task.last_outcome.clone(),
                    updated_at: task.updated_at,
                    sync_elapsed_secs: task.sync_elapsed(now).map(|d| d.as_secs()),
                    build_elapsed_secs: task.build_elapsed(now).map(|d| d.as_secs()),
                    worker: self.dispatcher.worker_state(&task.name),
                    sync,
                }
            })
            .collect();
        StatusSnapshot { projects }
    }

    fn detect_changes(&mut self, now: Instant) {
        for task in self.registry.iter_mut() {
            if !task.is_check_due(now) {
                continue;
            }
            task.schedule_next_check(now);

            let check = check_for_changes(
                self.backend.as_ref(),
                &task.depot_path,
                task.last_synced_version.as_ref(),
            );
            let latest = match check.latest {
                Some(latest) if check.has_change => latest,
                _ => {
                    tracing::debug!(project = %task.name, "no upstream change");
                    continue;
                }
            };

            tracing::info!(
                project = %task.name,
                latest = %latest,
                synced = ?task.last_synced_version.as_ref().map(|v| v.0.as_str()),
                "upstream change detected",
            );
            if let Err(err) = task.detect_change(latest) {
                tracing::error!(project = %task.name, error = %err, "change detection rejected");
            }
        }
    }

    fn summary(&self) -> TickSummary {
        let syncing = self
            .coordinator
            .active_project()
            .cloned()
            .zip(self.coordinator.progress());
        TickSummary {
            syncing,
            building: self.registry.names_in(TaskStatus::Building),
            pending_sync: self.registry.count(TaskStatus::PendingSync),
            pending_build: self.registry.count(TaskStatus::PendingBuild),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-tick summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct TickSummary {
    pub syncing: Option<(ProjectName, SyncProgress)>,
    pub building: Vec<ProjectName>,
    pub pending_sync: usize,
    pub pending_build: usize,
}

impl TickSummary {
    pub fn is_idle(&self) -> bool {
        self.syncing.is_none()
            && self.building.is_empty()
            && self.pending_sync == 0
            && self.pending_build == 0
    }

    fn log(&self) {
        if self.is_idle() {
            tracing::debug!("all projects idle");
            return;
        }
        let building: Vec<&str> = self.building.iter().map(|n| n.0.as_str()).collect();
        match &self.syncing {
            Some((project, progress)) => tracing::info!(
                syncing = %project,
                files = progress.completed_files,
                total = progress.total_files,
                percent = ?progress.percent().map(f64::round),
                building = ?building,
                pending_sync = self.pending_sync,
                pending_build = self.pending_build,
                "tick",
            ),
            None => tracing::info!(
                building = ?building,
                pending_sync = self.pending_sync,
                pending_build = self.pending_build,
                "tick",
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Status snapshot (served over the control socket)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub projects: Vec<ProjectSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub name: ProjectName,
    pub status: TaskStatus,
    pub version: Option<ChangeToken>,
    pub last_synced_version: Option<ChangeToken>,
    pub last_outcome: Option<TaskOutcome>,
    pub updated_at: DateTime<Utc>,
    pub sync_elapsed_secs: Option<u64>,
    pub build_elapsed_secs: Option<u64>,
    pub worker: Option<WorkerState>,
    pub sync: Option<SyncSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub total_files: u64,
    pub completed_files: u64,
    pub bytes_transferred: u64,
    pub current_file: Option<String>,
    pub current_action: Option<String>,
    pub error_count: usize,
    pub recent_errors: Vec<String>,
}

impl SyncSnapshot {
    pub fn from_progress(progress: &SyncProgress) -> Self {
        Self {
            total_files: progress.total_files,
            completed_files: progress.completed_files,
            bytes_transferred: progress.bytes_transferred,
            current_file: progress.current_file.clone(),
            current_action: progress.current_action.clone(),
            error_count: progress.errors.len(),
            recent_errors: progress.recent_errors(RECENT_ERRORS).to_vec(),
        }
    }
}
