//! Error types for keel-sync.

use std::path::PathBuf;

use thiserror::Error;

/// Why a sync did not succeed.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sync exited with code {code:?}")]
    ExitStatus { code: Option<i32> },

    /// The sync task went away without reporting a result (aborted or panicked).
    #[error("sync task ended without a result")]
    Lost,

    #[error("I/O error while syncing: {0}")]
    Io(#[from] std::io::Error),
}
