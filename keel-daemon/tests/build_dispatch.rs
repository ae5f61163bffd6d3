//! Build dispatch against a real `sh` worker, ticked at the configured poll cadence.
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};

use keel_core::{config, ChangeToken, Config, ProjectName, TaskOutcome, TaskRegistry, TaskStatus};
use keel_daemon::BuildDispatcher;
use keel_worker::{FileChannel, ScriptRenderer, WorkerHandle, WorkerSpec};
use tempfile::TempDir;

fn load_config(home: &Path, step_body: &str) -> Config {
    let work = home.join("work/core");
    fs::create_dir_all(&work).expect("mkdir work");
    fs::write(work.join("build.sh"), format!("#!/bin/sh\n{step_body}\n")).expect("step");

    let path = home.join(".keel/config.yaml");
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir keel");
    fs::write(
        &path,
        format!(
            "mode: simulated\n\
             poll_interval_secs: 1\n\
             status_hold_secs: 2\n\
             projects:\n  - name: core\n    working_dir: {}\n    build_steps: [build.sh]\n",
            work.display()
        ),
    )
    .expect("write config");
    config::load_from(&path).expect("load")
}

struct Harness {
    worker: WorkerHandle,
    registry: TaskRegistry,
    dispatcher: BuildDispatcher<FileChannel>,
    poll: Duration,
}

impl Harness {
    fn start(home: &Path, config: &Config) -> Self {
        let project = &config.projects[0];
        let renderer = ScriptRenderer::new().expect("renderer");
        let worker = WorkerHandle::spawn(
            &WorkerSpec::from_config(config, project),
            &config.state_dir_at(home),
            &renderer,
        )
        .expect("spawn worker");

        let mut registry = config.task_registry().expect("registry");
        let task = registry.get_mut(&project.name).expect("task");
        task.detect_change(ChangeToken::from("sim-1")).expect("detect");
        task.admit_sync(Instant::now()).expect("admit sync");
        task.complete_sync().expect("sync");

        let mut dispatcher = BuildDispatcher::new();
        dispatcher.register(project.name.clone(), worker.channel());
        Self {
            worker,
            registry,
            dispatcher,
            poll: config.poll_interval(),
        }
    }

    /// Tick once per poll interval until the build leaves `Building`.
    fn run_build(&mut self, timeout: Duration) -> Option<TaskOutcome> {
        let name = ProjectName::from("core");
        let deadline = Instant::now() + timeout;
        loop {
            self.dispatcher.tick(&mut self.registry, Instant::now());
            let task = self.registry.get(&name).expect("task");
            if task.status() == TaskStatus::Idle {
                return task.last_outcome.clone();
            }
            assert!(Instant::now() < deadline, "build still {}", task.status());
            sleep(self.poll);
        }
    }
}

#[test]
fn failing_step_is_recorded_as_build_failure() {
    let home = TempDir::new().expect("tempdir");
    let config = load_config(home.path(), "exit 3");
    assert!(config.validate().is_ok(), "{:?}", config.validate().issues);
    assert!(config.status_hold_secs > config.poll_interval_secs);

    let mut harness = Harness::start(home.path(), &config);
    match harness.run_build(Duration::from_secs(20)) {
        Some(TaskOutcome::BuildFailed { reason }) => {
            assert!(reason.contains("build.sh"), "{reason}");
            assert!(reason.contains('3'), "{reason}");
        }
        other => panic!("expected a build failure, got {other:?}"),
    }
    harness.worker.shutdown(Duration::from_secs(3));
}

#[test]
fn passing_step_completes() {
    let home = TempDir::new().expect("tempdir");
    let config = load_config(home.path(), "echo ok > built.txt");

    let mut harness = Harness::start(home.path(), &config);
    assert_eq!(
        harness.run_build(Duration::from_secs(20)),
        Some(TaskOutcome::Completed)
    );
    assert!(home.path().join("work/core/built.txt").exists());
    harness.worker.shutdown(Duration::from_secs(3));
}
