//! Global single-flight sync admission.
//!
//! The coordinator owns the only [`SyncHandle`]. Each tick it first settles the
//! active sync (success, failure or timeout) and then, if the slot is free,
//! admits the first `PendingSync` task in configured order. A sync that
//! finishes on one tick frees the slot for the next project on the same tick.

use std::time::Instant;

use keel_core::{ProjectName, TaskRegistry, TaskStatus};

use crate::launcher::{SyncHandle, SyncLauncher, SyncRequest};
use crate::progress::SyncProgress;

pub struct SyncCoordinator {
    launcher: Box<dyn SyncLauncher>,
    active: Option<SyncHandle>,
}

impl SyncCoordinator {
    pub fn new(launcher: Box<dyn SyncLauncher>) -> Self {
        Self {
            launcher,
            active: None,
        }
    }

    /// Project currently holding the sync slot.
    pub fn active_project(&self) -> Option<&ProjectName> {
        self.active.as_ref().map(SyncHandle::project)
    }

    /// Counters of the in-flight sync, if any.
    pub fn progress(&self) -> Option<SyncProgress> {
        self.active.as_ref().map(SyncHandle::progress)
    }

    /// Settle the active sync, then admit the next pending one.
    pub fn tick(&mut self, registry: &mut TaskRegistry, now: Instant) {
        self.settle(registry, now);
        self.admit(registry, now);
    }

    /// Terminate the active sync, leaving its task untouched.
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.active.take() {
            tracing::info!(project = %handle.project(), "terminating active sync");
            handle.terminate();
        }
    }

    fn settle(&mut self, registry: &mut TaskRegistry, now: Instant) {
        let Some(handle) = self.active.as_mut() else {
            return;
        };
        let project = handle.project().clone();

        let Some(task) = registry
            .get_mut(&project)
            .filter(|task| task.status() == TaskStatus::Syncing)
        else {
            tracing::warn!(project = %project, "active sync has no syncing task, dropping it");
            self.active = None;
            return;
        };

        match handle.poll() {
            Some(Ok(())) => {
                let progress = handle.progress();
                if let Err(err) = task.complete_sync() {
                    tracing::error!(project = %project, error = %err, "sync completion rejected");
                } else {
                    tracing::info!(
                        project = %project,
                        version = ?task.version.as_ref().map(|v| v.0.as_str()),
                        files = progress.completed_files,
                        errors = progress.errors.len(),
                        "sync completed",
                    );
                }
                self.active = None;
            }
            Some(Err(reason)) => {
                tracing::warn!(project = %project, error = %reason, "sync failed");
                if let Err(err) = task.fail_sync(reason.to_string()) {
                    tracing::error!(project = %project, error = %err, "sync failure rejected");
                }
                self.active = None;
            }
            None if task.sync_timed_out(now) => {
                let limit = task.timing.sync_timeout;
                tracing::warn!(project = %project, timeout = ?limit, "sync timed out, terminating");
                handle.terminate();
                if let Err(err) = task.fail_sync(format!("sync timed out after {limit:?}")) {
                    tracing::error!(project = %project, error = %err, "sync timeout rejected");
                }
                self.active = None;
            }
            None => {}
        }
    }

    fn admit(&mut self, registry: &mut TaskRegistry, now: Instant) {
        if self.active.is_some() {
            return;
        }
        if let Some(syncing) = registry.syncing() {
            tracing::warn!(project = %syncing.name, "task marked syncing without an active sync");
            return;
        }
        let Some(name) = registry.first_pending_sync().map(|task| task.name.clone()) else {
            return;
        };
        let Some(task) = registry.get_mut(&name) else {
            return;
        };

        if let Err(err) = task.admit_sync(now) {
            tracing::error!(project = %name, error = %err, "sync admission rejected");
            return;
        }
        let request = SyncRequest {
            project: name.clone(),
            depot_path: task.depot_path.clone(),
            working_dir: task.working_dir.clone(),
            version: task.version.clone(),
        };
        tracing::info!(project = %name, target = %request.target(), "sync admitted");
        self.active = Some(self.launcher.launch(&request));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use keel_core::{ChangeToken, ProjectTask, TaskOutcome, TaskTiming};
    use std::time::Duration;

    struct FailingLauncher;

    impl SyncLauncher for FailingLauncher {
        fn launch(&self, request: &SyncRequest) -> SyncHandle {
            SyncHandle::spawn(request.project.clone(), |_| async {
                Err(SyncError::ExitStatus { code: Some(1) })
            })
        }
    }

    /// Never finishes on its own.
    struct StuckLauncher;

    impl SyncLauncher for StuckLauncher {
        fn launch(&self, request: &SyncRequest) -> SyncHandle {
            SyncHandle::spawn(request.project.clone(), |_| std::future::pending())
        }
    }

    fn registry(names: &[&str]) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        for name in names {
            let timing = TaskTiming {
                sync_timeout: Duration::from_secs(60),
                ..TaskTiming::default()
            };
            let task = ProjectTask::new(*name, format!("//depot/{name}/..."), "/tmp", timing);
            registry.insert(task).expect("insert");
        }
        registry
    }

    fn pend(registry: &mut TaskRegistry, name: &str, version: &str) {
        registry
            .get_mut(&ProjectName::from(name))
            .expect("task")
            .detect_change(ChangeToken::from(version))
            .expect("detect");
    }

    fn status(registry: &TaskRegistry, name: &str) -> TaskStatus {
        registry.get(&ProjectName::from(name)).expect("task").status()
    }

    async fn settle_tasks() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn failed_sync_returns_to_idle() {
        let mut registry = registry(&["core"]);
        pend(&mut registry, "core", "v1");
        let mut coordinator = SyncCoordinator::new(Box::new(FailingLauncher));

        coordinator.tick(&mut registry, Instant::now());
        assert_eq!(status(&registry, "core"), TaskStatus::Syncing);

        settle_tasks().await;
        coordinator.tick(&mut registry, Instant::now());
        let task = registry.get(&ProjectName::from("core")).expect("task");
        assert_eq!(task.status(), TaskStatus::Idle);
        assert_eq!(task.last_synced_version, None);
        assert!(matches!(task.last_outcome, Some(TaskOutcome::SyncFailed { .. })));
        assert!(coordinator.active_project().is_none());
    }

    #[tokio::test]
    async fn stuck_sync_times_out() {
        let mut registry = registry(&["core", "tools"]);
        pend(&mut registry, "core", "v1");
        pend(&mut registry, "tools", "v7");
        let mut coordinator = SyncCoordinator::new(Box::new(StuckLauncher));

        let start = Instant::now();
        coordinator.tick(&mut registry, start);
        coordinator.tick(&mut registry, start + Duration::from_secs(60));
        assert_eq!(status(&registry, "core"), TaskStatus::Syncing);

        coordinator.tick(&mut registry, start + Duration::from_secs(61));
        assert_eq!(status(&registry, "core"), TaskStatus::Idle);
        // The freed slot goes to the next pending project on the same tick.
        assert_eq!(status(&registry, "tools"), TaskStatus::Syncing);
        assert_eq!(coordinator.active_project(), Some(&ProjectName::from("tools")));
    }

    #[tokio::test]
    async fn shutdown_terminates_active_sync() {
        let mut registry = registry(&["core"]);
        pend(&mut registry, "core", "v1");
        let mut coordinator = SyncCoordinator::new(Box::new(StuckLauncher));
        coordinator.tick(&mut registry, Instant::now());
        assert!(coordinator.progress().is_some());

        coordinator.shutdown();
        assert!(coordinator.active_project().is_none());
        assert!(coordinator.progress().is_none());
    }
}
