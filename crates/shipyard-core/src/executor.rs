//! Executor trait and container types.
//!
//! Executors run workflow steps in isolated environments (containers).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{ResourceId, Result};

/// Mount point of the job workspace inside every step container.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Specification for a container to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Unique identifier for this container.
    pub id: ResourceId,
    /// Container image to run.
    pub image: String,
    /// Command to execute.
    pub command: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    pub env: HashMap<String, String>,
    /// Host paths to bind into the container.
    pub volumes: Vec<VolumeMount>,
    /// Git repository to clone before running commands.
    pub git_clone: Option<GitCloneSpec>,
    /// Labels attached to the container (run id, job, step).
    pub labels: HashMap<String, String>,
}

/// Specification for cloning a git repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitCloneSpec {
    pub url: String,
    /// Branch to clone.
    pub branch: Option<String>,
    /// Specific commit SHA to checkout.
    pub sha: Option<String>,
    /// Directory to clone into.
    pub target_dir: String,
    /// Depth for shallow clone (None for full clone).
    pub depth: Option<u32>,
    pub submodules: bool,
    /// Fetch LFS objects after checkout.
    pub lfs: bool,
    /// Access token for private repos.
    pub access_token: Option<String>,
}

/// A volume mount specification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VolumeMount {
    /// Host path or named volume.
    pub source: String,
    /// Path to mount in the container.
    pub mount_path: String,
    pub read_only: bool,
}

/// Handle to a running or completed container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: ResourceId,
    /// Executor-specific identifier (e.g., container ID).
    pub executor_id: String,
    /// Name of the executor running this container.
    pub executor_name: String,
}

/// Status of a container execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Created but not started.
    Pending,
    Running { started_at: DateTime<Utc> },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i64>,
        message: String,
    },
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl ContainerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContainerStatus::Succeeded { .. }
                | ContainerStatus::Failed { .. }
                | ContainerStatus::Cancelled { .. }
        )
    }
}

/// Result of a completed container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerResult {
    pub status: ContainerStatus,
    pub exit_code: Option<i64>,
}

impl ContainerResult {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, ContainerStatus::Succeeded { .. })
    }
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    /// A line produced by Shipyard itself rather than the container.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        }
    }
}

/// Trait for container executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Whether the backend is reachable.
    async fn is_available(&self) -> bool;

    /// Create and start a container.
    async fn spawn(&self, spec: ContainerSpec) -> Result<ContainerHandle>;

    /// Follow the container's log output.
    async fn logs(&self, handle: &ContainerHandle) -> Result<BoxStream<'static, LogLine>>;

    async fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus>;

    /// Wait for a container to exit.
    async fn wait(&self, handle: &ContainerHandle) -> Result<ContainerResult>;

    /// Stop a running container.
    async fn cancel(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove a finished container.
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;
}
