//! Core domain types and traits for the Shipyard job orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Workflow, job and step definitions
//! - Repository events that trigger runs
//! - Run records and progress events
//! - Executor, registry and secret store traits

pub mod error;
pub mod event;
pub mod executor;
pub mod id;
pub mod registry;
pub mod run;
pub mod secret;
pub mod workflow;

pub use error::{Error, Result};
pub use id::ResourceId;
