//! # keel-sync
//!
//! Single-flight synchronisation of project working copies.
//!
//! [`SyncCoordinator::tick`] admits at most one `PendingSync` project at a
//! time, launches its sync through a [`SyncLauncher`] and feeds the sync's
//! output into a [`SyncProgress`]. [`launcher_for`] picks the live `p4 sync`
//! launcher or the simulated ticker from the configuration.

pub mod coordinator;
pub mod error;
pub mod launcher;
pub mod progress;

pub use coordinator::SyncCoordinator;
pub use error::SyncError;
pub use launcher::{
    launcher_for, P4SyncLauncher, SharedProgress, SimulatedSyncLauncher, SyncHandle, SyncLauncher,
    SyncRequest,
};
pub use progress::SyncProgress;
