//! YAML configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.keel/
//!   config.yaml        (default config location)
//!   workers/<project>/ (default state_dir: channel files, worker script, worker log)
//! ```
//!
//! Every function that derives a path from the home directory has an `_at(home)`
//! form; tests must always use the `_at` form.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::task::{ProjectTask, TaskRegistry, TaskTiming};
use crate::types::ProjectName;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Whether the orchestrator talks to a live Perforce server or simulates one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    #[default]
    Live,
    Simulated,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendMode::Live => write!(f, "live"),
            BackendMode::Simulated => write!(f, "simulated"),
        }
    }
}

/// How to invoke the `p4` command line client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P4Settings {
    #[serde(default = "default_p4_program")]
    pub program: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

impl Default for P4Settings {
    fn default() -> Self {
        Self {
            program: default_p4_program(),
            client: None,
            user: None,
            port: None,
        }
    }
}

impl P4Settings {
    /// `P4CLIENT` / `P4USER` / `P4PORT` pairs for the configured values.
    pub fn env_pairs(&self) -> Vec<(&'static str, &str)> {
        let mut pairs = Vec::new();
        if let Some(client) = self.client.as_deref() {
            pairs.push(("P4CLIENT", client));
        }
        if let Some(user) = self.user.as_deref() {
            pairs.push(("P4USER", user));
        }
        if let Some(port) = self.port.as_deref() {
            pairs.push(("P4PORT", port));
        }
        pairs
    }
}

/// Parameters of the simulated sync ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSettings {
    #[serde(default = "default_sim_total_files")]
    pub total_files: u64,
    #[serde(default = "default_sim_tick_millis")]
    pub tick_millis: u64,
    #[serde(default = "default_sim_bytes_per_file")]
    pub bytes_per_file: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            total_files: default_sim_total_files(),
            tick_millis: default_sim_tick_millis(),
            bytes_per_file: default_sim_bytes_per_file(),
        }
    }
}

impl SimulationSettings {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

/// One configured project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: ProjectName,
    /// Upstream path, e.g. `//depot/core/...`. Required in live mode.
    #[serde(default)]
    pub depot_path: String,
    pub working_dir: PathBuf,
    /// Build step scripts, relative to `working_dir`, run in order.
    #[serde(default)]
    pub build_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_timeout_secs: Option<u64>,
}

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mode: BackendMode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_secs: u64,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    #[serde(default)]
    pub build_retry_cooldown_secs: u64,
    #[serde(default = "default_exit_grace")]
    pub worker_exit_grace_millis: u64,
    #[serde(default = "default_status_hold")]
    pub status_hold_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub p4: P4Settings,
    #[serde(default)]
    pub simulation: SimulationSettings,
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

fn default_p4_program() -> PathBuf {
    PathBuf::from("p4")
}
fn default_sim_total_files() -> u64 {
    150
}
fn default_sim_tick_millis() -> u64 {
    100
}
fn default_sim_bytes_per_file() -> u64 {
    4096
}
fn default_poll_interval() -> u64 {
    5
}
fn default_check_interval() -> u64 {
    300
}
fn default_sync_timeout() -> u64 {
    3600
}
fn default_build_timeout() -> u64 {
    10_800
}
fn default_exit_grace() -> u64 {
    500
}
fn default_status_hold() -> u64 {
    6
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn worker_exit_grace(&self) -> Duration {
        Duration::from_millis(self.worker_exit_grace_millis)
    }

    /// Global defaults overlaid with the project's overrides.
    pub fn timing_for(&self, project: &ProjectConfig) -> TaskTiming {
        TaskTiming {
            check_interval: Duration::from_secs(
                project.check_interval_secs.unwrap_or(self.check_interval_secs),
            ),
            sync_timeout: Duration::from_secs(
                project.sync_timeout_secs.unwrap_or(self.sync_timeout_secs),
            ),
            build_timeout: Duration::from_secs(
                project.build_timeout_secs.unwrap_or(self.build_timeout_secs),
            ),
            retry_cooldown: Duration::from_secs(self.build_retry_cooldown_secs),
        }
    }

    /// Resolve `state_dir`, expanding a leading `~/` against `home`.
    pub fn state_dir_at(&self, home: &Path) -> PathBuf {
        match &self.state_dir {
            Some(dir) => expand_home(dir, home),
            None => keel_root(home).join("workers"),
        }
    }

    /// Resolve `log_file`, expanding a leading `~/` against `home`.
    pub fn log_file_at(&self, home: &Path) -> Option<PathBuf> {
        self.log_file.as_deref().map(|p| expand_home(p, home))
    }

    /// One `Idle` task per configured project, in configured order.
    pub fn task_registry(&self) -> Result<TaskRegistry, crate::TaskError> {
        let mut registry = TaskRegistry::new();
        for project in &self.projects {
            registry.insert(ProjectTask::new(
                project.name.clone(),
                project.depot_path.clone(),
                project.working_dir.clone(),
                self.timing_for(project),
            ))?;
        }
        Ok(registry)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Check the configuration against the filesystem. Never fails; callers
    /// decide what to do with [`ValidationReport::errors`].
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.projects.is_empty() {
            report.error(None, "no projects configured");
        }
        if self.poll_interval_secs == 0 {
            report.error(None, "poll_interval_secs must be greater than zero");
        }
        if self.check_interval_secs == 0 {
            report.error(None, "check_interval_secs must be greater than zero");
        }
        if self.sync_timeout_secs == 0 || self.build_timeout_secs == 0 {
            report.error(None, "sync and build timeouts must be greater than zero");
        }
        if self.status_hold_secs <= self.poll_interval_secs {
            report.error(
                None,
                format!(
                    "status_hold_secs ({}) must be longer than poll_interval_secs ({}); \
                     shorter holds let build results expire unseen",
                    self.status_hold_secs, self.poll_interval_secs
                ),
            );
        }
        if self.mode == BackendMode::Simulated && self.simulation.tick_millis == 0 {
            report.error(None, "simulation.tick_millis must be greater than zero");
        }

        let mut seen = HashSet::new();
        for project in &self.projects {
            let name = Some(&project.name);
            if project.name.0.trim().is_empty() {
                report.error(None, "project with empty name");
                continue;
            }
            if project.name.0.contains(['/', '\\']) || project.name.0 == ".." {
                report.error(name, "project name must not contain path separators");
            }
            if !seen.insert(project.name.clone()) {
                report.error(name, "duplicate project name");
            }

            let timing = self.timing_for(project);
            let interval = timing.check_interval.as_secs();
            if interval == 0 {
                report.error(name, "check_interval_secs must be greater than zero");
            } else if interval < 60 {
                report.warning(
                    name,
                    format!("check interval of {interval}s is short; at least 60s is recommended"),
                );
            }
            if project.sync_timeout_secs.is_some() && timing.sync_timeout.is_zero() {
                report.error(name, "sync_timeout_secs must be greater than zero");
            }
            if project.build_timeout_secs.is_some() && timing.build_timeout.is_zero() {
                report.error(name, "build_timeout_secs must be greater than zero");
            }

            if self.mode == BackendMode::Live {
                if project.depot_path.is_empty() {
                    report.error(name, "missing depot_path");
                } else if !project.depot_path.starts_with("//") {
                    report.warning(
                        name,
                        format!("depot_path '{}' does not start with //", project.depot_path),
                    );
                }
            }

            if !project.working_dir.exists() {
                report.error(
                    name,
                    format!("working_dir does not exist: {}", project.working_dir.display()),
                );
                continue;
            }
            if !project.working_dir.is_dir() {
                report.error(
                    name,
                    format!("working_dir is not a directory: {}", project.working_dir.display()),
                );
                continue;
            }

            if project.build_steps.is_empty() {
                report.warning(name, "no build steps configured");
            }
            for step in &project.build_steps {
                let path = project.working_dir.join(step);
                if !path.exists() {
                    report.error(name, format!("build step not found: {}", path.display()));
                } else if !path.is_file() {
                    report.error(name, format!("build step is not a file: {}", path.display()));
                }
            }
        }

        report
    }
}

// ---------------------------------------------------------------------------
// Validation report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// A single finding from [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    pub severity: Severity,
    pub project: Option<ProjectName>,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "[{project}] {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<ConfigIssue>,
}

impl ValidationReport {
    pub fn errors(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ConfigIssue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }

    /// Add an externally discovered error (e.g. backend connectivity).
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.error(None, message);
    }

    /// `Err(ConfigError::Invalid)` if any error-level issue was recorded.
    pub fn into_result(self) -> Result<Self, ConfigError> {
        let count = self.errors().count();
        let first = self.errors().next().map(|issue| issue.to_string());
        match first {
            Some(first) => Err(ConfigError::Invalid { count, first }),
            None => Ok(self),
        }
    }

    fn error(&mut self, project: Option<&ProjectName>, message: impl Into<String>) {
        self.push(Severity::Error, project, message);
    }

    fn warning(&mut self, project: Option<&ProjectName>, message: impl Into<String>) {
        self.push(Severity::Warning, project, message);
    }

    fn push(&mut self, severity: Severity, project: Option<&ProjectName>, message: impl Into<String>) {
        self.issues.push(ConfigIssue {
            severity,
            project: project.cloned(),
            message: message.into(),
        });
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// `<home>/.keel/`
pub fn keel_root(home: &Path) -> PathBuf {
    home.join(".keel")
}

/// `<home>/.keel/config.yaml`: pure, no I/O.
pub fn default_config_path_at(home: &Path) -> PathBuf {
    keel_root(home).join("config.yaml")
}

/// Load a config file from an explicit path.
///
/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` (with path and
/// line context) if malformed.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load `<home>/.keel/config.yaml`.
pub fn load_default_at(home: &Path) -> Result<Config, ConfigError> {
    load_from(&default_config_path_at(home))
}

fn expand_home(path: &Path, home: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => home.join(rest),
        Err(_) => path.to_path_buf(),
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MINIMAL: &str = "projects:\n  - name: core\n    depot_path: //depot/core/...\n    working_dir: /work/core\n";

    #[test]
    fn defaults_apply_to_minimal_config() {
        let config: Config = serde_yaml::from_str(MINIMAL).expect("parse");
        assert_eq!(config.mode, BackendMode::Live);
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.check_interval_secs, 300);
        assert_eq!(config.build_timeout_secs, 10_800);
        assert_eq!(config.p4.program, PathBuf::from("p4"));
        assert_eq!(config.simulation.total_files, 150);
    }

    #[test]
    fn project_overrides_win_over_globals() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).expect("parse");
        config.projects[0].build_timeout_secs = Some(60);
        config.build_retry_cooldown_secs = 5;
        let timing = config.timing_for(&config.projects[0]);
        assert_eq!(timing.build_timeout, Duration::from_secs(60));
        assert_eq!(timing.sync_timeout, Duration::from_secs(3600));
        assert_eq!(timing.retry_cooldown, Duration::from_secs(5));
    }

    #[test]
    fn state_dir_expands_tilde() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).expect("parse");
        let home = Path::new("/home/ci");
        assert_eq!(config.state_dir_at(home), PathBuf::from("/home/ci/.keel/workers"));
        config.state_dir = Some(PathBuf::from("~/state"));
        assert_eq!(config.state_dir_at(home), PathBuf::from("/home/ci/state"));
    }

    #[test]
    fn env_pairs_skip_unset_values() {
        let settings = P4Settings {
            user: Some("builder".into()),
            ..P4Settings::default()
        };
        assert_eq!(settings.env_pairs(), vec![("P4USER", "builder")]);
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let home = TempDir::new().expect("tempdir");
        let err = load_default_at(home.path()).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }

    #[test]
    fn task_registry_follows_project_order() {
        let yaml = "projects:\n  - name: b\n    working_dir: /b\n  - name: a\n    working_dir: /a\n";
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        let registry = config.task_registry().expect("registry");
        let names: Vec<_> = registry.iter().map(|t| t.name.0.clone()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn into_result_reports_first_error_and_count() {
        let mut report = ValidationReport::default();
        report.warning(None, "just a warning");
        assert!(report.clone().into_result().is_ok());

        report.error(Some(&ProjectName::from("core")), "missing depot_path");
        report.error(None, "no projects configured");
        match report.into_result() {
            Err(ConfigError::Invalid { count, first }) => {
                assert_eq!(count, 2);
                assert_eq!(first, "[core] missing depot_path");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn status_hold_must_outlast_poll_interval() {
        let mut config: Config = serde_yaml::from_str(MINIMAL).expect("parse");
        let hold_errors = |config: &Config| {
            config
                .validate()
                .errors()
                .filter(|i| i.message.contains("status_hold_secs"))
                .count()
        };
        assert_eq!(hold_errors(&config), 0);

        config.status_hold_secs = config.poll_interval_secs;
        assert_eq!(hold_errors(&config), 1);

        config.poll_interval_secs = 10;
        config.status_hold_secs = 6;
        assert_eq!(hold_errors(&config), 1);
    }
}
