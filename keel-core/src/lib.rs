//! Keel core library: domain types, project task state machine, configuration.
//!
//! - [`types`]: newtypes shared by every crate
//! - [`task`]: [`ProjectTask`] lifecycle and the ordered [`TaskRegistry`]
//! - [`config`]: YAML configuration load / validate
//! - [`error`]: [`ConfigError`], [`TaskError`]

pub mod config;
pub mod error;
pub mod task;
pub mod types;

pub use config::{BackendMode, Config, P4Settings, ProjectConfig, SimulationSettings};
pub use error::{ConfigError, TaskError};
pub use task::{ProjectTask, TaskEvent, TaskOutcome, TaskRegistry, TaskStatus, TaskTiming};
pub use types::{ChangeToken, ProjectName};
