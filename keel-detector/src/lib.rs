//! Upstream change detection for `keel-detector`.
//!
//! [`check_for_changes`] asks a [`VcsBackend`] for the most recent change of an
//! upstream path and compares it with the last synced token. Backend failures
//! are logged and reported as "no change" so a flaky server only delays the
//! project's next opportunity.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use keel_core::{BackendMode, ChangeToken, Config, P4Settings};
use thiserror::Error;
use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Upper bound for a single backend query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for the connectivity check.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Result of one change check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCheck {
    pub has_change: bool,
    pub latest: Option<ChangeToken>,
}

impl ChangeCheck {
    pub fn unchanged() -> Self {
        Self {
            has_change: false,
            latest: None,
        }
    }
}

/// Errors from backend queries.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("`{command}` exited with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Version-control backend queries used by the orchestrator.
pub trait VcsBackend: Send + Sync {
    /// Most recent change for `upstream`; `Ok(None)` when the path has no changes.
    fn latest_change(&self, upstream: &str) -> Result<Option<ChangeToken>, DetectError>;

    /// Verify the backend is reachable. Called once at startup in live mode.
    fn check_connection(&self) -> Result<(), DetectError>;
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Compare the backend's latest change for `upstream` with `last_known`.
///
/// The very first check (no `last_known`) counts as a change whenever the
/// backend reports any token. Errors never propagate.
pub fn check_for_changes(
    backend: &dyn VcsBackend,
    upstream: &str,
    last_known: Option<&ChangeToken>,
) -> ChangeCheck {
    match backend.latest_change(upstream) {
        Ok(Some(latest)) => ChangeCheck {
            has_change: Some(&latest) != last_known,
            latest: Some(latest),
        },
        Ok(None) => {
            tracing::debug!(upstream, "no changes reported for path");
            ChangeCheck::unchanged()
        }
        Err(err) => {
            tracing::error!(upstream, error = %err, "change detection failed");
            ChangeCheck::unchanged()
        }
    }
}

/// Backend selected by `config.mode`.
pub fn backend_for(config: &Config) -> Box<dyn VcsBackend> {
    match config.mode {
        BackendMode::Live => Box::new(P4Backend::new(config.p4.clone())),
        BackendMode::Simulated => Box::new(SimulatedBackend::default()),
    }
}

/// Extract the change number from `p4 changes -m 1` output:
/// `Change 12345 on 2024/05/01 by user@client 'description'`.
pub fn parse_changes_output(stdout: &str) -> Option<ChangeToken> {
    let mut parts = stdout.trim().split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("Change"), Some(number)) => Some(ChangeToken::from(number)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Perforce
// ---------------------------------------------------------------------------

/// Live Perforce backend driving the `p4` command line client.
#[derive(Debug, Clone)]
pub struct P4Backend {
    settings: P4Settings,
    query_timeout: Duration,
}

impl P4Backend {
    pub fn new(settings: P4Settings) -> Self {
        Self {
            settings,
            query_timeout: QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.settings.program);
        cmd.args(args).envs(self.settings.env_pairs());
        cmd
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, DetectError> {
        let label = format!("{} {}", self.settings.program.display(), args.join(" "));
        let output = run_with_timeout(self.command(args), &self.settings.program, &label, timeout)?;
        if !output.status.success() {
            return Err(DetectError::CommandFailed {
                command: label,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }
}

impl VcsBackend for P4Backend {
    fn latest_change(&self, upstream: &str) -> Result<Option<ChangeToken>, DetectError> {
        let output = self.run(&["changes", "-m", "1", upstream], self.query_timeout)?;
        Ok(parse_changes_output(&String::from_utf8_lossy(&output.stdout)))
    }

    fn check_connection(&self) -> Result<(), DetectError> {
        self.run(&["info"], CONNECTION_TIMEOUT).map(|_| ())
    }
}

/// Run `cmd` to completion from synchronous code. See [`block_on`].
fn run_with_timeout(
    cmd: Command,
    program: &Path,
    label: &str,
    timeout: Duration,
) -> Result<Output, DetectError> {
    block_on(output_with_timeout(cmd, program, label, timeout))
}

/// Collect the child's output while it runs; kill it if it outlives `timeout`.
async fn output_with_timeout(
    mut cmd: Command,
    program: &Path,
    label: &str,
    timeout: Duration,
) -> Result<Output, DetectError> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DetectError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => Ok(output?),
        Err(_) => {
            tracing::warn!(command = label, after = ?timeout, "backend query timed out");
            Err(DetectError::Timeout {
                command: label.to_string(),
                after: timeout,
            })
        }
    }
}

/// Drive `future` from synchronous code.
///
/// Inside the daemon this runs on a blocking-pool thread of the multi-thread
/// runtime, whose drivers keep running while this thread waits. Anywhere else
/// (`keel check`, plain tests) a throwaway current-thread runtime is built.
fn block_on<F, T>(future: F) -> Result<T, DetectError>
where
    F: Future<Output = Result<T, DetectError>>,
{
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            handle.block_on(future)
        }
        _ => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(future),
    }
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// Backend for running without a server: every query reports a fresh token
/// `sim-<n>`, so every idle project is always considered changed.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    counter: AtomicU64,
}

impl VcsBackend for SimulatedBackend {
    fn latest_change(&self, _upstream: &str) -> Result<Option<ChangeToken>, DetectError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Some(ChangeToken(format!("sim-{n}"))))
    }

    fn check_connection(&self) -> Result<(), DetectError> {
        Ok(())
    }
}
