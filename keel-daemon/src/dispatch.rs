//! Build admission and monitoring over each project's worker channel.
//!
//! Builds are not globally limited: every `PendingBuild` task whose worker
//! reports `Idle` is admitted on the same tick. A `Building` task finishes when
//! its worker reports `Idle` again, fails on `Failed`, and times out after the
//! task's build timeout. A timed-out worker is left running; its late status
//! is ignored because the task is no longer `Building`. A worker whose process
//! has exited fails its running build and never receives another one.

use std::collections::HashMap;
use std::time::Instant;

use keel_core::{ProjectName, ProjectTask, TaskRegistry, TaskStatus};
use keel_worker::{WorkerChannel, WorkerCommand, WorkerState};

struct WorkerSlot<C> {
    channel: C,
    last_state: WorkerState,
    /// Set once the current build has been observed running.
    saw_running: bool,
    alive: bool,
    /// A pending build has already been reported as stuck on a dead worker.
    stall_reported: bool,
}

pub struct BuildDispatcher<C: WorkerChannel> {
    workers: HashMap<ProjectName, WorkerSlot<C>>,
}

impl<C: WorkerChannel> Default for BuildDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: WorkerChannel> BuildDispatcher<C> {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    pub fn register(&mut self, project: ProjectName, channel: C) {
        self.workers.insert(
            project,
            WorkerSlot {
                channel,
                last_state: WorkerState::Idle,
                saw_running: false,
                alive: true,
                stall_reported: false,
            },
        );
    }

    pub fn has_worker(&self, project: &ProjectName) -> bool {
        self.workers.contains_key(project)
    }

    /// Fresh read of the project's status slot.
    pub fn worker_state(&self, project: &ProjectName) -> Option<WorkerState> {
        self.workers.get(project).map(|slot| slot.channel.poll())
    }

    /// The worker process for `task` has exited. A running build fails at once;
    /// later pending builds stay pending and are reported.
    pub fn mark_worker_exited(&mut self, task: &mut ProjectTask, now: Instant) {
        let Some(slot) = self.workers.get_mut(&task.name) else {
            return;
        };
        if !slot.alive {
            return;
        }
        slot.alive = false;
        tracing::error!(project = %task.name, status = %task.status(), "worker process exited");

        if task.status() == TaskStatus::Building {
            if let Err(err) = task.fail_build("worker process exited", now) {
                tracing::error!(project = %task.name, error = %err, "build failure rejected");
            }
        }
    }

    pub fn is_worker_alive(&self, project: &ProjectName) -> bool {
        self.workers.get(project).is_some_and(|slot| slot.alive)
    }

    /// Monitor running builds, then admit pending ones.
    pub fn tick(&mut self, registry: &mut TaskRegistry, now: Instant) {
        for task in registry.iter_mut() {
            match task.status() {
                TaskStatus::Building => self.monitor(task, now),
                TaskStatus::PendingBuild => self.admit(task, now),
                _ => {}
            }
        }
    }

    fn admit(&mut self, task: &mut ProjectTask, now: Instant) {
        let Some(slot) = self.workers.get_mut(&task.name) else {
            tracing::warn!(project = %task.name, "no worker for pending build");
            return;
        };
        if !slot.alive {
            if !slot.stall_reported {
                slot.stall_reported = true;
                tracing::warn!(project = %task.name, "worker has exited, pending build cannot run");
            }
            return;
        }

        let state = slot.channel.poll();
        if !state.is_idle() || slot.channel.pending_command() == Some(WorkerCommand::Build) {
            tracing::debug!(project = %task.name, worker = %state, "worker busy, build waits");
            return;
        }

        if let Err(err) = slot.channel.send(WorkerCommand::Build) {
            tracing::error!(project = %task.name, error = %err, "failed to send BUILD");
            return;
        }
        if let Err(err) = task.admit_build(now) {
            tracing::error!(project = %task.name, error = %err, "build admission rejected");
            return;
        }
        slot.last_state = state;
        slot.saw_running = false;
        tracing::info!(
            project = %task.name,
            version = ?task.last_synced_version.as_ref().map(|v| v.0.as_str()),
            "build dispatched",
        );
    }

    fn monitor(&mut self, task: &mut ProjectTask, now: Instant) {
        let Some(slot) = self.workers.get_mut(&task.name) else {
            return;
        };

        // Command slot first: once the worker has consumed BUILD, its status
        // already shows the build.
        let command = slot.channel.pending_command();
        let state = slot.channel.poll();
        if state != slot.last_state {
            log_transition(&task.name, &slot.last_state, &state);
        }

        let result = match &state {
            WorkerState::Running { .. } | WorkerState::Completed { .. } => {
                slot.saw_running = true;
                Ok(())
            }
            WorkerState::Failed { step, code } => {
                let reason = format!(
                    "step {} exited with code {}",
                    step.as_deref().unwrap_or("?"),
                    code.map_or_else(|| "?".to_string(), |c| c.to_string()),
                );
                tracing::error!(project = %task.name, reason = %reason, "build failed");
                task.fail_build(reason, now)
            }
            WorkerState::Idle if slot.saw_running || command != Some(WorkerCommand::Build) => {
                tracing::info!(
                    project = %task.name,
                    elapsed = ?task.build_elapsed(now).unwrap_or_default(),
                    "build completed",
                );
                task.complete_build()
            }
            WorkerState::Idle => Ok(()),
        };
        slot.last_state = state;

        if let Err(err) = result {
            tracing::error!(project = %task.name, error = %err, "build transition rejected");
            return;
        }

        if task.build_timed_out(now) {
            let limit = task.timing.build_timeout;
            tracing::error!(project = %task.name, timeout = ?limit, "build timed out");
            if let Err(err) = task.fail_build(format!("build timed out after {limit:?}"), now) {
                tracing::error!(project = %task.name, error = %err, "build timeout rejected");
            }
        }
    }
}

fn log_transition(project: &ProjectName, from: &WorkerState, to: &WorkerState) {
    match to {
        WorkerState::Running { step: Some(step) } => {
            tracing::info!(project = %project, step = %step, "build step started");
        }
        WorkerState::Running { step: None } => {
            tracing::info!(project = %project, "build started");
        }
        WorkerState::Completed { step } => {
            tracing::info!(project = %project, step = ?step, "build step completed");
        }
        WorkerState::Failed { step, code } => {
            tracing::warn!(project = %project, step = ?step, code = ?code, "build step failed");
        }
        WorkerState::Idle => {
            tracing::info!(project = %project, previous = %from, "worker idle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    use keel_core::{ChangeToken, TaskOutcome, TaskTiming};
    use keel_worker::{ChannelLayout, FileChannel};
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        layout: ChannelLayout,
        registry: TaskRegistry,
        dispatcher: BuildDispatcher<FileChannel>,
    }

    impl Fixture {
        fn new(timing: TaskTiming) -> Self {
            let tmp = TempDir::new().expect("tempdir");
            let name = ProjectName::from("core");
            let layout = ChannelLayout::for_project(tmp.path(), &name);
            let channel = layout.prepare().expect("prepare");
            fs::write(layout.status_path(), "IDLE\n").expect("status");

            let mut registry = TaskRegistry::new();
            let mut task = ProjectTask::new("core", "//depot/core/...", "/work/core", timing);
            let now = Instant::now();
            task.detect_change(ChangeToken::from("10")).expect("detect");
            task.admit_sync(now).expect("admit sync");
            task.complete_sync().expect("sync");
            registry.insert(task).expect("insert");

            let mut dispatcher = BuildDispatcher::new();
            dispatcher.register(name, channel);
            Self {
                _tmp: tmp,
                layout,
                registry,
                dispatcher,
            }
        }

        fn task(&self) -> &ProjectTask {
            self.registry.get(&ProjectName::from("core")).expect("task")
        }

        fn tick(&mut self, now: Instant) {
            self.dispatcher.tick(&mut self.registry, now);
        }

        fn status(&self, content: &str) {
            fs::write(self.layout.status_path(), content).expect("status");
        }

        fn command(&self) -> String {
            fs::read_to_string(self.layout.command_path()).expect("command")
        }

        /// What the worker does when it picks up BUILD.
        fn worker_takes_build(&self) {
            self.status("RUNNING\n");
            fs::write(self.layout.command_path(), "WAIT").expect("command");
        }
    }

    #[test]
    fn idle_worker_gets_build() {
        let mut fx = Fixture::new(TaskTiming::default());
        let now = Instant::now();
        fx.tick(now);
        assert_eq!(fx.task().status(), TaskStatus::Building);
        assert_eq!(fx.task().build_started, Some(now));
        assert_eq!(fx.command(), "BUILD");
    }

    #[test]
    fn busy_worker_defers_build() {
        let mut fx = Fixture::new(TaskTiming::default());
        fx.status("RUNNING:build.sh\n");
        fx.tick(Instant::now());
        assert_eq!(fx.task().status(), TaskStatus::PendingBuild);
        assert_eq!(fx.command(), "WAIT");
    }

    #[test]
    fn unconsumed_build_is_not_completion() {
        let mut fx = Fixture::new(TaskTiming::default());
        fx.tick(Instant::now());
        // Worker has not picked the command up yet: status still IDLE.
        fx.tick(Instant::now());
        assert_eq!(fx.task().status(), TaskStatus::Building);
    }

    #[test]
    fn idle_after_running_completes() {
        let mut fx = Fixture::new(TaskTiming::default());
        fx.tick(Instant::now());
        fx.worker_takes_build();
        fx.tick(Instant::now());
        fx.status("RUNNING\nRUNNING:build.sh\n");
        fx.tick(Instant::now());
        assert_eq!(fx.task().status(), TaskStatus::Building);

        fx.status("IDLE\n");
        fx.tick(Instant::now());
        assert_eq!(fx.task().status(), TaskStatus::Idle);
        assert_eq!(fx.task().last_outcome, Some(TaskOutcome::Completed));
    }

    #[test]
    fn consumed_build_then_idle_completes_without_seeing_running() {
        let mut fx = Fixture::new(TaskTiming::default());
        fx.tick(Instant::now());
        // The whole build happened between two polls.
        fs::write(fx.layout.command_path(), "WAIT").expect("command");
        fx.tick(Instant::now());
        assert_eq!(fx.task().status(), TaskStatus::Idle);
        assert_eq!(fx.task().last_outcome, Some(TaskOutcome::Completed));
    }

    #[test]
    fn error_status_fails_the_build() {
        let mut fx = Fixture::new(TaskTiming::default());
        fx.tick(Instant::now());
        fx.worker_takes_build();
        fx.status("RUNNING\nRUNNING:build.sh\nCOMPLETED:build.sh\nRUNNING:package.sh\nERROR:package.sh:2\n");
        fx.tick(Instant::now());

        assert_eq!(fx.task().status(), TaskStatus::Idle);
        match &fx.task().last_outcome {
            Some(TaskOutcome::BuildFailed { reason }) => {
                assert!(reason.contains("package.sh"), "{reason}");
                assert!(reason.contains('2'), "{reason}");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        // No new BUILD is issued for an Idle task.
        fx.tick(Instant::now());
        assert_eq!(fx.command(), "WAIT");
    }

    #[test]
    fn exited_worker_gets_no_build() {
        let mut fx = Fixture::new(TaskTiming::default());
        let name = ProjectName::from("core");
        let now = Instant::now();
        let task = fx.registry.get_mut(&name).expect("task");
        fx.dispatcher.mark_worker_exited(task, now);
        assert!(!fx.dispatcher.is_worker_alive(&name));

        fx.tick(now);
        fx.tick(now + Duration::from_secs(5));
        assert_eq!(fx.task().status(), TaskStatus::PendingBuild);
        assert_eq!(fx.command(), "WAIT");
    }

    #[test]
    fn worker_exit_fails_running_build() {
        let mut fx = Fixture::new(TaskTiming::default());
        let name = ProjectName::from("core");
        let start = Instant::now();
        fx.tick(start);
        fx.worker_takes_build();
        fx.status("RUNNING:build.sh\n");
        fx.tick(start);
        assert_eq!(fx.task().status(), TaskStatus::Building);

        let task = fx.registry.get_mut(&name).expect("task");
        fx.dispatcher.mark_worker_exited(task, start + Duration::from_secs(1));
        assert_eq!(fx.task().status(), TaskStatus::Idle);
        assert_eq!(
            fx.task().last_outcome,
            Some(TaskOutcome::BuildFailed {
                reason: "worker process exited".into()
            })
        );
    }

    #[test]
    fn build_timeout_resets_task_but_not_worker() {
        let timing = TaskTiming {
            build_timeout: Duration::from_secs(60),
            ..TaskTiming::default()
        };
        let mut fx = Fixture::new(timing);
        let start = Instant::now();
        fx.tick(start);
        fx.worker_takes_build();
        fx.status("RUNNING:build.sh\n");

        fx.tick(start + Duration::from_secs(60));
        assert_eq!(fx.task().status(), TaskStatus::Building);

        fx.tick(start + Duration::from_secs(61));
        assert_eq!(fx.task().status(), TaskStatus::Idle);
        assert!(matches!(
            fx.task().last_outcome,
            Some(TaskOutcome::BuildFailed { .. })
        ));

        // A late IDLE from the worker is ignored.
        fx.status("IDLE\n");
        fx.tick(start + Duration::from_secs(62));
        assert!(matches!(
            fx.task().last_outcome,
            Some(TaskOutcome::BuildFailed { .. })
        ));
        assert_eq!(fx.command(), "WAIT");
    }
}
