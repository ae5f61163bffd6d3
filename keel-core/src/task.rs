//! Project task lifecycle.
//!
//! ```text
//! Idle         --(change detected)----------> PendingSync
//! PendingSync  --(admitted by coordinator)---> Syncing
//! Syncing      --(sync success)-------------> PendingBuild   last_synced_version := version
//! Syncing      --(sync failure / timeout)---> Idle
//! PendingBuild --(worker idle, admitted)----> Building
//! Building     --(worker finished)----------> Idle           outcome Completed
//! Building     --(worker failed / timeout)--> Idle           outcome BuildFailed
//! ```
//!
//! `Idle` is both the initial and the terminal-success state. Only `Idle` tasks
//! are eligible for change detection. Time is always passed in by the caller so
//! the machine stays deterministic under test.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::types::{ChangeToken, ProjectName};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a [`ProjectTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    PendingSync,
    Syncing,
    PendingBuild,
    Building,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Idle => "idle",
            TaskStatus::PendingSync => "pending-sync",
            TaskStatus::Syncing => "syncing",
            TaskStatus::PendingBuild => "pending-build",
            TaskStatus::Building => "building",
        };
        f.write_str(label)
    }
}

/// Events accepted by the state machine; used in [`TaskError::Transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    ChangeDetected,
    SyncAdmitted,
    SyncSucceeded,
    SyncFailed,
    BuildAdmitted,
    BuildCompleted,
    BuildFailed,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskEvent::ChangeDetected => "change-detected",
            TaskEvent::SyncAdmitted => "sync-admitted",
            TaskEvent::SyncSucceeded => "sync-succeeded",
            TaskEvent::SyncFailed => "sync-failed",
            TaskEvent::BuildAdmitted => "build-admitted",
            TaskEvent::BuildCompleted => "build-completed",
            TaskEvent::BuildFailed => "build-failed",
        };
        f.write_str(label)
    }
}

/// How the most recent cycle of a task ended. `Completed` and the failures are
/// transient states collapsed back into `Idle`; the outcome is kept for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    SyncFailed { reason: String },
    BuildFailed { reason: String },
}

/// Per-project cadence and timeouts, resolved from config overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    pub check_interval: Duration,
    pub sync_timeout: Duration,
    pub build_timeout: Duration,
    /// Quiet period after a build failure before change detection resumes.
    pub retry_cooldown: Duration,
}

impl Default for TaskTiming {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(300),
            sync_timeout: Duration::from_secs(3600),
            build_timeout: Duration::from_secs(10_800),
            retry_cooldown: Duration::ZERO,
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectTask
// ---------------------------------------------------------------------------

/// One configured project and its position in the sync/build lifecycle.
///
/// Created `Idle` at startup and reused across cycles for the life of the process.
#[derive(Debug, Clone)]
pub struct ProjectTask {
    pub name: ProjectName,
    /// Upstream path handed to the version-control backend.
    pub depot_path: String,
    pub working_dir: PathBuf,
    pub timing: TaskTiming,
    /// Last observed upstream token (set on change detection).
    pub version: Option<ChangeToken>,
    /// Token of the last successful sync. Change detection compares against this.
    pub last_synced_version: Option<ChangeToken>,
    pub last_outcome: Option<TaskOutcome>,
    pub sync_started: Option<Instant>,
    pub build_started: Option<Instant>,
    pub updated_at: DateTime<Utc>,
    status: TaskStatus,
    next_check: Option<Instant>,
    retry_after: Option<Instant>,
}

impl ProjectTask {
    pub fn new(
        name: impl Into<ProjectName>,
        depot_path: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        timing: TaskTiming,
    ) -> Self {
        Self {
            name: name.into(),
            depot_path: depot_path.into(),
            working_dir: working_dir.into(),
            timing,
            version: None,
            last_synced_version: None,
            last_outcome: None,
            sync_started: None,
            build_started: None,
            updated_at: Utc::now(),
            status: TaskStatus::Idle,
            next_check: None,
            retry_after: None,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// `true` when the task is `Idle`, its check interval has elapsed and no
    /// failure cooldown is pending.
    pub fn is_check_due(&self, now: Instant) -> bool {
        self.status == TaskStatus::Idle
            && self.next_check.map_or(true, |at| now >= at)
            && self.retry_after.map_or(true, |at| now >= at)
    }

    /// Instant at which this task next becomes eligible for change detection,
    /// or `None` if it is not `Idle`.
    pub fn next_check_at(&self) -> Option<Instant> {
        if self.status != TaskStatus::Idle {
            return None;
        }
        match (self.next_check, self.retry_after) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Push the next change check one interval past `now`.
    pub fn schedule_next_check(&mut self, now: Instant) {
        self.next_check = Some(now + self.timing.check_interval);
    }

    /// Forget the last synced version and make the next check due immediately.
    pub fn force(&mut self) {
        self.last_synced_version = None;
        self.next_check = None;
        self.retry_after = None;
        self.touch();
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// `Idle → PendingSync`, recording the detected upstream token.
    pub fn detect_change(&mut self, version: ChangeToken) -> Result<(), TaskError> {
        self.expect(TaskStatus::Idle, TaskEvent::ChangeDetected)?;
        self.version = Some(version);
        self.set(TaskStatus::PendingSync);
        Ok(())
    }

    /// `PendingSync → Syncing`.
    pub fn admit_sync(&mut self, now: Instant) -> Result<(), TaskError> {
        self.expect(TaskStatus::PendingSync, TaskEvent::SyncAdmitted)?;
        self.sync_started = Some(now);
        self.set(TaskStatus::Syncing);
        Ok(())
    }

    /// `Syncing → PendingBuild`; the detected version becomes the synced version.
    pub fn complete_sync(&mut self) -> Result<(), TaskError> {
        self.expect(TaskStatus::Syncing, TaskEvent::SyncSucceeded)?;
        self.last_synced_version = self.version.clone();
        self.sync_started = None;
        self.set(TaskStatus::PendingBuild);
        Ok(())
    }

    /// `Syncing → Idle`. Detection may retry on the very next tick.
    pub fn fail_sync(&mut self, reason: impl Into<String>) -> Result<(), TaskError> {
        self.expect(TaskStatus::Syncing, TaskEvent::SyncFailed)?;
        self.sync_started = None;
        self.next_check = None;
        self.last_outcome = Some(TaskOutcome::SyncFailed {
            reason: reason.into(),
        });
        self.set(TaskStatus::Idle);
        Ok(())
    }

    /// `PendingBuild → Building`.
    pub fn admit_build(&mut self, now: Instant) -> Result<(), TaskError> {
        self.expect(TaskStatus::PendingBuild, TaskEvent::BuildAdmitted)?;
        self.build_started = Some(now);
        self.set(TaskStatus::Building);
        Ok(())
    }

    /// `Building → Idle` with outcome `Completed`.
    pub fn complete_build(&mut self) -> Result<(), TaskError> {
        self.expect(TaskStatus::Building, TaskEvent::BuildCompleted)?;
        self.build_started = None;
        self.last_outcome = Some(TaskOutcome::Completed);
        self.set(TaskStatus::Idle);
        Ok(())
    }

    /// `Building → Idle` with outcome `BuildFailed`; starts the retry cooldown.
    pub fn fail_build(&mut self, reason: impl Into<String>, now: Instant) -> Result<(), TaskError> {
        self.expect(TaskStatus::Building, TaskEvent::BuildFailed)?;
        self.build_started = None;
        self.last_outcome = Some(TaskOutcome::BuildFailed {
            reason: reason.into(),
        });
        if !self.timing.retry_cooldown.is_zero() {
            self.retry_after = Some(now + self.timing.retry_cooldown);
        }
        self.set(TaskStatus::Idle);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    pub fn sync_elapsed(&self, now: Instant) -> Option<Duration> {
        self.sync_started.map(|at| now.saturating_duration_since(at))
    }

    pub fn build_elapsed(&self, now: Instant) -> Option<Duration> {
        self.build_started.map(|at| now.saturating_duration_since(at))
    }

    /// `true` when `Syncing` for longer than the sync timeout.
    pub fn sync_timed_out(&self, now: Instant) -> bool {
        self.status == TaskStatus::Syncing
            && self
                .sync_elapsed(now)
                .is_some_and(|elapsed| elapsed > self.timing.sync_timeout)
    }

    /// `true` when `Building` for longer than the build timeout.
    pub fn build_timed_out(&self, now: Instant) -> bool {
        self.status == TaskStatus::Building
            && self
                .build_elapsed(now)
                .is_some_and(|elapsed| elapsed > self.timing.build_timeout)
    }

    fn expect(&self, from: TaskStatus, event: TaskEvent) -> Result<(), TaskError> {
        if self.status == from {
            Ok(())
        } else {
            Err(TaskError::Transition {
                project: self.name.clone(),
                from: self.status,
                event,
            })
        }
    }

    fn set(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

/// Ordered set of project tasks keyed by name. Iteration follows configured order.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: Vec<ProjectTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: ProjectTask) -> Result<(), TaskError> {
        if self.get(&task.name).is_some() {
            return Err(TaskError::DuplicateProject(task.name));
        }
        self.tasks.push(task);
        Ok(())
    }

    pub fn get(&self, name: &ProjectName) -> Option<&ProjectTask> {
        self.tasks.iter().find(|t| &t.name == name)
    }

    pub fn get_mut(&mut self, name: &ProjectName) -> Option<&mut ProjectTask> {
        self.tasks.iter_mut().find(|t| &t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProjectTask> {
        self.tasks.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ProjectTask> {
        self.tasks.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The task currently holding the sync slot, if any.
    pub fn syncing(&self) -> Option<&ProjectTask> {
        self.tasks
            .iter()
            .find(|t| t.status() == TaskStatus::Syncing)
    }

    /// First `PendingSync` task in configured order.
    pub fn first_pending_sync(&self) -> Option<&ProjectTask> {
        self.tasks
            .iter()
            .find(|t| t.status() == TaskStatus::PendingSync)
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status() == status).count()
    }

    /// Names of all tasks in the given status, in configured order.
    pub fn names_in(&self, status: TaskStatus) -> Vec<ProjectName> {
        self.tasks
            .iter()
            .filter(|t| t.status() == status)
            .map(|t| t.name.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
