use std::path::PathBuf;

use thiserror::Error;

/// Error surface for the runtime, the scheduler and the control protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] keel_core::ConfigError),

    #[error("task error: {0}")]
    Task(#[from] keel_core::TaskError),

    #[error("worker error: {0}")]
    Worker(#[from] keel_worker::WorkerError),

    #[error("version control backend unavailable: {0}")]
    Backend(#[from] keel_detector::DetectError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },

    #[error("no project worker could be started")]
    NoWorkers,
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
