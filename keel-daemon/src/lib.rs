//! Orchestrator runtime: scheduler loop, build dispatcher and control socket.

pub mod dispatch;
mod error;
pub mod logging;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod scheduler;

pub use dispatch::BuildDispatcher;
pub use error::DaemonError;
pub use logging::init_tracing;
pub use protocol::{
    request_force, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
    DaemonStatus,
};
pub use runtime::{run, start_blocking};
pub use scheduler::{ProjectSnapshot, Scheduler, StatusSnapshot, SyncSnapshot, TickSummary};
