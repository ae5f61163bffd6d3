//! Error types for keel-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::task::{TaskEvent, TaskStatus};
use crate::types::ProjectName;

/// Errors raised while locating, parsing or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Underlying I/O failure, annotated with the offending path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error: includes file path and line context from serde_yaml.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("config not found at {path}")]
    NotFound { path: PathBuf },

    /// Validation found at least one error-level issue.
    #[error("config validation failed with {count} error(s); first: {first}")]
    Invalid { count: usize, first: String },
}

/// Errors raised by the project task state machine and registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    /// An event was applied to a task in a state that does not accept it.
    #[error("project '{project}': cannot apply {event} while {from}")]
    Transition {
        project: ProjectName,
        from: TaskStatus,
        event: TaskEvent,
    },

    #[error("duplicate project '{0}'")]
    DuplicateProject(ProjectName),

    #[error("unknown project '{0}'")]
    UnknownProject(ProjectName),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.into(),
        source,
    }
}
