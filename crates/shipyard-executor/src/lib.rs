//! Container execution backends for Shipyard.
//!
//! Provides executor implementations for running workflow steps:
//! - Local Docker (via the Docker Engine API)

pub mod docker;
pub mod git;

pub use docker::LocalDockerExecutor;
pub use shipyard_core::executor::{
    ContainerHandle, ContainerResult, ContainerSpec, ContainerStatus, Executor, GitCloneSpec,
    LogLine, LogStream, VolumeMount,
};
