//! Workflow, job and step definitions.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default for the scheduler's job timeout.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A declarative workflow: which events trigger it and which jobs it runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name (e.g., "tools").
    pub name: String,
    /// Repository this workflow is bound to (e.g., "commaai/openpilot").
    /// `None` means any repository.
    pub repository: Option<String>,
    /// Events that start a run.
    pub triggers: Vec<Trigger>,
    /// Environment shared by every job.
    pub env: HashMap<String, String>,
    /// Concurrency group for runs of this workflow.
    pub concurrency: Option<ConcurrencyPolicy>,
    /// Registry logins used by image steps.
    pub registries: Vec<RegistryAuth>,
    /// Declared jobs. Unordered unless `needs` says otherwise.
    pub jobs: Vec<JobDefinition>,
}

impl Workflow {
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

/// What starts a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Trigger {
    /// Push to matching branches or tags.
    Push {
        /// Branch patterns. Empty means every branch.
        branches: Vec<String>,
        /// Tag patterns. Empty means tag pushes do not match.
        tags: Vec<String>,
        /// Path filters. Empty means any change.
        paths: Vec<String>,
    },
    /// Pull request targeting matching base branches.
    PullRequest {
        branches: Vec<String>,
        /// Accepted actions. Empty means opened, synchronize and reopened.
        actions: Vec<String>,
    },
    /// Started through the API or CLI only.
    Manual,
}

/// Runs sharing a group; newer runs may cancel older ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyPolicy {
    /// Group name, interpolated per run (e.g., "tools-${git.ref}").
    pub group: String,
    pub cancel_in_progress: bool,
}

/// Credentials for a container registry host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryAuth {
    /// Registry host (e.g., "ghcr.io").
    pub registry: String,
    pub username: String,
    /// Usually a `${secrets.NAME}` reference.
    pub password: String,
}

/// A job: a named sequence of steps with one timeout and one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    /// Default image for `run` steps.
    pub image: Option<String>,
    /// Jobs that must succeed first.
    pub needs: Vec<String>,
    /// `None` takes the scheduler's default.
    pub timeout: Option<Duration>,
    pub when: Option<Condition>,
    pub env: HashMap<String, String>,
    pub steps: Vec<Step>,
}

impl JobDefinition {
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// A single action within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub when: Option<Condition>,
    pub env: HashMap<String, String>,
    pub action: StepAction,
}

/// What a step does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StepAction {
    /// Run a shell command in a container.
    Run {
        command: String,
        /// Overrides the job image.
        image: Option<String>,
        /// Shell used to run the command.
        shell: String,
    },
    /// Clone the triggering commit into the workspace.
    Checkout {
        lfs: bool,
        submodules: bool,
        depth: Option<u32>,
    },
    /// Pull an image from its registry.
    ImagePull { image: String },
    /// Build an image, optionally seeding the layer cache from a registry.
    ImageBuild {
        /// Context directory, relative to the workspace.
        context: String,
        dockerfile: String,
        tags: Vec<String>,
        cache_from: Vec<String>,
        build_args: HashMap<String, String>,
        target: Option<String>,
    },
    /// Push a local image to its registry.
    ImagePush { image: String },
}

impl StepAction {
    /// Short label used in logs and plans.
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Run { .. } => "run",
            StepAction::Checkout { .. } => "checkout",
            StepAction::ImagePull { .. } => "pull",
            StepAction::ImageBuild { .. } => "build",
            StepAction::ImagePush { .. } => "push",
        }
    }
}

/// Condition for job or step execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Expression to evaluate (e.g., "${git.ref} == 'refs/heads/master'").
    pub expression: String,
}

impl Condition {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
        }
    }
}
