//! `keel` binary behaviour against an isolated HOME.

use assert_cmd::Command;
use assert_fs::prelude::*;
use predicates::prelude::*;

fn keel(home: &assert_fs::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("keel").expect("keel binary");
    cmd.env("HOME", home.path()).env_remove("RUST_LOG");
    cmd
}

fn write_simulated_config(home: &assert_fs::TempDir, steps: &[&str]) {
    let work = home.child("work/core");
    work.create_dir_all().expect("mkdir");
    work.child("build.sh")
        .write_str("#!/bin/sh\nexit 0\n")
        .expect("step");
    home.child(".keel/config.yaml")
        .write_str(&format!(
            "mode: simulated\nlog_file: ~/.keel/logs/keel.log\nprojects:\n  - name: core\n    working_dir: {}\n    build_steps: [{}]\n",
            work.path().display(),
            steps.join(", "),
        ))
        .expect("config");
}

#[test]
fn check_accepts_a_valid_config() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_simulated_config(&home, &["build.sh"]);

    keel(&home)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("configuration OK"))
        .stdout(predicate::str::contains("simulated"));
}

#[test]
fn check_fails_on_missing_build_step() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_simulated_config(&home, &["build.sh", "package.sh"]);

    keel(&home)
        .arg("check")
        .assert()
        .failure()
        .stdout(predicate::str::contains("package.sh"))
        .stderr(predicate::str::contains("1 error(s)"));
}

#[test]
fn check_json_lists_issues() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_simulated_config(&home, &["build.sh", "package.sh"]);

    let output = keel(&home)
        .args(["check", "--json"])
        .output()
        .expect("run keel");
    assert!(!output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let issues = report["issues"].as_array().expect("issues");
    assert!(issues
        .iter()
        .any(|issue| issue["severity"] == "error" && issue["project"] == "core"));
}

#[test]
fn check_with_explicit_config_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let missing = home.child("nowhere.yaml");

    keel(&home)
        .args(["check", "--config"])
        .arg(missing.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("nowhere.yaml"));
}

#[test]
fn status_reports_not_running() {
    let home = assert_fs::TempDir::new().expect("tempdir");

    keel(&home)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));

    keel(&home)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\": false"));
}

#[test]
fn stop_and_force_without_daemon() {
    let home = assert_fs::TempDir::new().expect("tempdir");

    keel(&home)
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));

    keel(&home)
        .args(["force", "core"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not running"));
}

#[test]
fn logs_tail_the_configured_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_simulated_config(&home, &["build.sh"]);
    home.child(".keel/logs/keel.log")
        .write_str("one\ntwo\nthree\n")
        .expect("log");

    keel(&home)
        .args(["logs", "--lines", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("two\nthree"))
        .stdout(predicate::str::contains("one\ntwo").not());
}

#[test]
fn logs_reject_unknown_project() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_simulated_config(&home, &["build.sh"]);

    keel(&home)
        .args(["logs", "--project", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown project 'nope'"));
}
