//! KDL configuration parsing for Shipyard.
//!
//! This crate handles:
//! - Workflow definitions (`*.kdl` next to the repository)
//! - Server configuration (`shipyard.kdl`)
//! - Variable interpolation and condition expressions
//! - Secret stores backed by the environment

pub mod condition;
pub mod error;
pub mod secrets;
pub mod system;
pub mod variables;
pub mod workflow;

mod kdl_util;

pub use condition::Expr;
pub use error::{ConfigError, ConfigResult};
pub use secrets::{EnvSecretStore, StaticSecretStore};
pub use system::{ExecutorSettings, RepositoryConfig, SchedulerSettings, SystemConfig};
pub use variables::{VariableContext, VariableContextBuilder};
pub use workflow::{load_workflow, parse_workflow};
