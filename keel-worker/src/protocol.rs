//! Command and status grammar.
//!
//! Command slot: exactly one of `WAIT`, `BUILD`, `EXIT`, always fully overwritten.
//!
//! Status slot: `IDLE`, or one or more of:
//!
//! ```text
//! RUNNING
//! RUNNING:<step>
//! COMPLETED:<step>
//! ERROR:<step>:<exitcode>
//! ```
//!
//! A worker appends `COMPLETED`/`ERROR` lines after the `RUNNING:<step>` line it
//! wrote for the step, so the slot is classified by its last non-empty line.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A command written by the orchestrator into the command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    Wait,
    Build,
    Exit,
}

impl WorkerCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerCommand::Wait => "WAIT",
            WorkerCommand::Build => "BUILD",
            WorkerCommand::Exit => "EXIT",
        }
    }

    /// Parse command slot content. Surrounding whitespace is ignored.
    pub fn parse(content: &str) -> Option<Self> {
        match content.trim() {
            "WAIT" => Some(WorkerCommand::Wait),
            "BUILD" => Some(WorkerCommand::Build),
            "EXIT" => Some(WorkerCommand::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last observed worker-reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Idle,
    Running {
        step: Option<String>,
    },
    Failed {
        step: Option<String>,
        code: Option<i32>,
    },
    /// Informational: one step finished, more may follow before `IDLE`.
    Completed {
        step: Option<String>,
    },
}

impl WorkerState {
    /// Classify full status slot content. Empty content is `Idle`.
    pub fn decode(content: &str) -> Self {
        content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .map(Self::decode_line)
            .unwrap_or(WorkerState::Idle)
    }

    /// Classify a single status line. Unrecognised text is treated as `Idle`.
    pub fn decode_line(line: &str) -> Self {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("RUNNING") {
            return WorkerState::Running {
                step: tag_value(rest),
            };
        }
        if let Some(rest) = line.strip_prefix("ERROR") {
            let (step, code) = match tag_value(rest) {
                Some(value) => match value.rsplit_once(':') {
                    Some((step, code)) => match code.trim().parse::<i32>() {
                        Ok(code) => (non_empty(step), Some(code)),
                        Err(_) => (Some(value), None),
                    },
                    None => (Some(value), None),
                },
                None => (None, None),
            };
            return WorkerState::Failed { step, code };
        }
        if let Some(rest) = line.strip_prefix("COMPLETED") {
            return WorkerState::Completed {
                step: tag_value(rest),
            };
        }
        WorkerState::Idle
    }

    /// Canonical single-line encoding, as a worker would write it.
    pub fn encode(&self) -> String {
        match self {
            WorkerState::Idle => "IDLE".to_string(),
            WorkerState::Running { step: None } => "RUNNING".to_string(),
            WorkerState::Running { step: Some(step) } => format!("RUNNING:{step}"),
            WorkerState::Completed { step } => {
                format!("COMPLETED:{}", step.as_deref().unwrap_or_default())
            }
            WorkerState::Failed { step, code } => format!(
                "ERROR:{}:{}",
                step.as_deref().unwrap_or_default(),
                code.map(|c| c.to_string()).unwrap_or_default()
            ),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, WorkerState::Idle)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, WorkerState::Failed { .. })
    }

    /// `true` for every non-idle, non-failed state: the worker is mid-build.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            WorkerState::Running { .. } | WorkerState::Completed { .. }
        )
    }

    /// The step named by this state, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            WorkerState::Idle => None,
            WorkerState::Running { step }
            | WorkerState::Completed { step }
            | WorkerState::Failed { step, .. } => step.as_deref(),
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => f.write_str("idle"),
            WorkerState::Running { step: None } => f.write_str("running"),
            WorkerState::Running { step: Some(step) } => write!(f, "running {step}"),
            WorkerState::Completed { step } => {
                write!(f, "completed {}", step.as_deref().unwrap_or("step"))
            }
            WorkerState::Failed { step, code } => {
                write!(f, "failed {}", step.as_deref().unwrap_or("step"))?;
                if let Some(code) = code {
                    write!(f, " (exit {code})")?;
                }
                Ok(())
            }
        }
    }
}

/// `":value"` → `Some("value")`; `""` → `None`.
fn tag_value(rest: &str) -> Option<String> {
    rest.strip_prefix(':').and_then(non_empty)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
