//! # keel-worker
//!
//! The polled command/status contract between the orchestrator and one
//! long-running worker process per project.
//!
//! - [`protocol`]: [`WorkerCommand`] and the tagged-line [`WorkerState`] grammar
//! - [`channel`]: the two-operation [`WorkerChannel`] seam and its file transport
//! - [`script`]: tera-rendered worker script implementing the contract
//! - [`process`]: spawn / shut down the worker process

pub mod channel;
pub mod error;
pub mod process;
pub mod protocol;
pub mod script;

pub use channel::{ChannelLayout, FileChannel, WorkerChannel};
pub use error::WorkerError;
pub use process::{WorkerHandle, WorkerSpec};
pub use protocol::{WorkerCommand, WorkerState};
pub use script::ScriptRenderer;
