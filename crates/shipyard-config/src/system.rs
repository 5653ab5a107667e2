//! Server configuration parsing.
//!
//! ```kdl
//! server { listen "0.0.0.0:3000" }
//! scheduler {
//!     max-concurrent-runs 2
//!     max-concurrent-jobs 4
//!     queue-capacity 256
//!     default-timeout-minutes 60
//!     max-retained-runs 500
//!     max-log-lines 20000
//! }
//! executor {
//!     workspace-root "/var/lib/shipyard/workspaces"
//!     checkout-image "alpine/git:latest"
//! }
//! secrets { env-prefix "SHIPYARD_SECRET_" }
//! repository "commaai/openpilot" clone-url="https://github.com/commaai/openpilot.git" webhook-secret-env="GITHUB_WEBHOOK_SECRET" {
//!     workflow "workflows/tools.kdl"
//! }
//! ```

use crate::kdl_util::*;
use crate::secrets::DEFAULT_SECRET_PREFIX;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Address the HTTP server binds to.
    pub listen: String,
    pub scheduler: SchedulerSettings,
    pub executor: ExecutorSettings,
    /// Prefix for secrets read from the environment.
    pub secret_prefix: String,
    pub repositories: Vec<RepositoryConfig>,
}

/// Limits enforced by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Runs executing at the same time.
    pub max_concurrent_runs: usize,
    /// Containers executing at the same time, across all runs.
    pub max_concurrent_jobs: usize,
    /// Runs waiting in the queue before new ones are rejected.
    pub queue_capacity: usize,
    /// Timeout for jobs that declare none.
    pub default_timeout: Duration,
    /// Finished runs kept in memory.
    pub max_retained_runs: usize,
    /// Log lines kept per run.
    pub max_log_lines: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 2,
            max_concurrent_jobs: 4,
            queue_capacity: 256,
            default_timeout: shipyard_core::workflow::DEFAULT_JOB_TIMEOUT,
            max_retained_runs: 500,
            max_log_lines: 20_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Host directory holding one workspace per job.
    pub workspace_root: PathBuf,
    /// Image that runs `checkout` steps. It must ship git with the LFS extension.
    pub checkout_image: String,
}

/// Image used for checkouts unless configured otherwise.
pub const DEFAULT_CHECKOUT_IMAGE: &str = "alpine/git:latest";

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("shipyard").join("workspaces"),
            checkout_image: DEFAULT_CHECKOUT_IMAGE.to_string(),
        }
    }
}

/// A repository the server accepts events for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Full name (e.g., "commaai/openpilot").
    pub full_name: String,
    pub clone_url: Option<String>,
    /// Environment variable holding the webhook secret.
    pub webhook_secret_env: Option<String>,
    /// Workflow files bound to this repository.
    pub workflows: Vec<PathBuf>,
}

impl RepositoryConfig {
    /// Webhook secret read from the configured environment variable.
    pub fn webhook_secret(&self) -> Option<String> {
        self.webhook_secret_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|s| !s.is_empty())
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            scheduler: SchedulerSettings::default(),
            executor: ExecutorSettings::default(),
            secret_prefix: DEFAULT_SECRET_PREFIX.to_string(),
            repositories: Vec::new(),
        }
    }
}

impl SystemConfig {
    /// Read a config file. Relative workflow paths resolve against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = parse_system_config(&content)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for repo in &mut config.repositories {
            for workflow in &mut repo.workflows {
                if workflow.is_relative() {
                    *workflow = base.join(&*workflow);
                }
            }
        }
        Ok(config)
    }

    /// Apply `SHIPYARD_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(listen) = lookup("SHIPYARD_LISTEN") {
            self.listen = listen;
        }
        if let Some(jobs) = lookup("SHIPYARD_MAX_CONCURRENT_JOBS") {
            self.scheduler.max_concurrent_jobs =
                parse_positive("SHIPYARD_MAX_CONCURRENT_JOBS", &jobs)?;
        }
        if let Some(runs) = lookup("SHIPYARD_MAX_CONCURRENT_RUNS") {
            self.scheduler.max_concurrent_runs =
                parse_positive("SHIPYARD_MAX_CONCURRENT_RUNS", &runs)?;
        }
        if let Some(root) = lookup("SHIPYARD_WORKSPACE_ROOT") {
            self.executor.workspace_root = PathBuf::from(root);
        }
        Ok(())
    }
}

fn parse_positive(field: &str, value: &str) -> ConfigResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("expected a positive integer, got '{}'", value),
        }),
    }
}

/// Parse server configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                if let Some(listen) = child_string(node, "listen") {
                    config.listen = listen;
                }
            }
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "executor" => {
                if let Some(root) = child_string(node, "workspace-root") {
                    config.executor.workspace_root = PathBuf::from(root);
                }
                if let Some(image) = child_string(node, "checkout-image") {
                    config.executor.checkout_image = image;
                }
            }
            "secrets" => {
                if let Some(prefix) = child_string(node, "env-prefix") {
                    config.secret_prefix = prefix;
                }
            }
            "repository" => config.repositories.push(parse_repository(node)?),
            other => {
                tracing::debug!(node = %other, "Ignoring unknown config node");
            }
        }
    }

    let mut names = std::collections::HashSet::new();
    for repo in &config.repositories {
        if !names.insert(repo.full_name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "repository '{}'",
                repo.full_name
            )));
        }
    }

    Ok(config)
}

fn parse_scheduler(node: &KdlNode, settings: &mut SchedulerSettings) -> ConfigResult<()> {
    let Some(children) = node.children() else {
        return Ok(());
    };

    for child in children.nodes() {
        let key = child.name().value();
        let value = get_first_integer_arg(child).ok_or_else(|| ConfigError::InvalidValue {
            field: format!("scheduler.{}", key),
            message: "expected an integer".to_string(),
        })?;
        if value <= 0 {
            return Err(ConfigError::InvalidValue {
                field: format!("scheduler.{}", key),
                message: "must be greater than zero".to_string(),
            });
        }
        let value = usize::try_from(value).map_err(|_| ConfigError::InvalidValue {
            field: format!("scheduler.{}", key),
            message: "out of range".to_string(),
        })?;

        match key {
            "max-concurrent-runs" => settings.max_concurrent_runs = value,
            "max-concurrent-jobs" => settings.max_concurrent_jobs = value,
            "queue-capacity" => settings.queue_capacity = value,
            "default-timeout-minutes" => {
                settings.default_timeout = Duration::from_secs(value as u64 * 60)
            }
            "max-retained-runs" => settings.max_retained_runs = value,
            "max-log-lines" => settings.max_log_lines = value,
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "scheduler".to_string(),
                    message: format!("unknown setting: {}", other),
                });
            }
        }
    }
    Ok(())
}

fn parse_repository(node: &KdlNode) -> ConfigResult<RepositoryConfig> {
    let full_name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("repository name".to_string()))?;

    if full_name.split('/').count() != 2 {
        return Err(ConfigError::InvalidValue {
            field: "repository".to_string(),
            message: format!("expected owner/name, got '{}'", full_name),
        });
    }

    let workflows = get_string_list_prop(node, "workflow")
        .into_iter()
        .map(PathBuf::from)
        .collect();

    Ok(RepositoryConfig {
        full_name,
        clone_url: get_string_prop(node, "clone-url"),
        webhook_secret_env: get_string_prop(node, "webhook-secret-env"),
        workflows,
    })
}

fn child_string(node: &KdlNode, name: &str) -> Option<String> {
    node.children()?
        .nodes()
        .iter()
        .find(|c| c.name().value() == name)
        .and_then(get_first_string_arg)
}
