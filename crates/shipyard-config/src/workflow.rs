//! Workflow configuration parsing.

use crate::condition::Expr;
use crate::kdl_util::*;
use crate::variables::find_secret_refs;
use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use shipyard_core::workflow::{
    Condition, ConcurrencyPolicy, JobDefinition, RegistryAuth, Step, StepAction, Trigger,
    Workflow,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

const DEFAULT_SHELL: &str = "sh";

/// Read and parse a workflow file.
pub fn load_workflow(path: impl AsRef<Path>) -> ConfigResult<Workflow> {
    let content = std::fs::read_to_string(path.as_ref())?;
    parse_workflow(&content)
}

/// Parse a workflow definition from KDL text.
pub fn parse_workflow(kdl: &str) -> ConfigResult<Workflow> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut repository = None;
    let mut triggers = Vec::new();
    let mut env = HashMap::new();
    let mut concurrency = None;
    let mut registries = Vec::new();
    let mut jobs = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "workflow" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("workflow name".to_string()))?;
            }
            "repository" => {
                repository = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("repository name".to_string()))?,
                );
            }
            "on" => {
                triggers.push(parse_trigger(node)?);
            }
            "env" => {
                env.extend(parse_env_block(node));
            }
            "concurrency" => {
                let group = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("concurrency group".to_string()))?;
                concurrency = Some(ConcurrencyPolicy {
                    group,
                    cancel_in_progress: get_bool_prop(node, "cancel-in-progress").unwrap_or(false),
                });
            }
            "registry" => {
                registries.push(parse_registry(node)?);
            }
            "job" => {
                jobs.push(parse_job(node)?);
            }
            other => {
                tracing::debug!(node = %other, "Ignoring unknown workflow node");
            }
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("workflow name".to_string()));
    }

    let workflow = Workflow {
        name,
        repository,
        triggers,
        env,
        concurrency,
        registries,
        jobs,
    };
    validate_workflow(&workflow)?;
    Ok(workflow)
}

/// Check structural rules that parsing alone does not enforce.
pub fn validate_workflow(workflow: &Workflow) -> ConfigResult<()> {
    if workflow.jobs.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "at least one job in workflow '{}'",
            workflow.name
        )));
    }

    let mut seen = HashSet::new();
    for job in &workflow.jobs {
        if !seen.insert(job.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("job '{}'", job.name)));
        }
    }

    for job in &workflow.jobs {
        for dep in &job.needs {
            if !seen.contains(dep.as_str()) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' needs unknown job '{}'",
                    job.name, dep
                )));
            }
        }

        if job.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidValue {
                field: format!("timeout-minutes of job '{}'", job.name),
                message: "must be greater than zero".to_string(),
            });
        }

        if let Some(when) = &job.when {
            Expr::parse(&when.expression)?;
        }

        let mut step_names = HashSet::new();
        for step in &job.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(ConfigError::Duplicate(format!(
                    "step '{}' in job '{}'",
                    step.name, job.name
                )));
            }
            if let Some(when) = &step.when {
                Expr::parse(&when.expression)?;
            }
            if let StepAction::Run { image: None, .. } = &step.action {
                if job.image.is_none() {
                    return Err(ConfigError::MissingField(format!(
                        "image for step '{}' in job '{}'",
                        step.name, job.name
                    )));
                }
            }
        }
    }

    if let Err(cycle) = detect_cycle(&workflow.jobs) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(())
}

/// Names of every secret a workflow references.
pub fn referenced_secrets(workflow: &Workflow) -> BTreeSet<String> {
    let mut strings: Vec<&str> = Vec::new();
    strings.extend(workflow.env.values().map(String::as_str));
    for registry in &workflow.registries {
        strings.push(&registry.username);
        strings.push(&registry.password);
    }
    for job in &workflow.jobs {
        strings.extend(job.env.values().map(String::as_str));
        for step in &job.steps {
            strings.extend(step.env.values().map(String::as_str));
            match &step.action {
                StepAction::Run { command, .. } => strings.push(command),
                StepAction::ImageBuild { build_args, .. } => {
                    strings.extend(build_args.values().map(String::as_str))
                }
                _ => {}
            }
        }
    }

    strings.into_iter().flat_map(find_secret_refs).collect()
}

fn parse_trigger(node: &KdlNode) -> ConfigResult<Trigger> {
    let trigger_type = get_first_string_arg(node).unwrap_or_default();

    match trigger_type.as_str() {
        "push" => Ok(Trigger::Push {
            branches: get_string_list_prop(node, "branches"),
            tags: get_string_list_prop(node, "tags"),
            paths: get_string_list_prop(node, "paths"),
        }),
        "pull_request" => Ok(Trigger::PullRequest {
            branches: get_string_list_prop(node, "branches"),
            actions: get_string_list_prop(node, "types"),
        }),
        "manual" | "" => Ok(Trigger::Manual),
        _ => Err(ConfigError::InvalidValue {
            field: "trigger type".to_string(),
            message: format!("unknown trigger type: {}", trigger_type),
        }),
    }
}

fn parse_registry(node: &KdlNode) -> ConfigResult<RegistryAuth> {
    let registry = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("registry host".to_string()))?;
    let username = get_string_prop(node, "username").ok_or_else(|| {
        ConfigError::MissingField(format!("username for registry '{}'", registry))
    })?;
    let password = get_string_prop(node, "password").ok_or_else(|| {
        ConfigError::MissingField(format!("password for registry '{}'", registry))
    })?;
    Ok(RegistryAuth {
        registry,
        username,
        password,
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobDefinition> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let timeout = match get_integer_prop(node, "timeout-minutes") {
        Some(minutes) if minutes < 0 => {
            return Err(ConfigError::InvalidValue {
                field: format!("timeout-minutes of job '{}'", name),
                message: "must be greater than zero".to_string(),
            });
        }
        Some(minutes) => {
            let secs = u64::try_from(minutes)
                .ok()
                .and_then(|m| m.checked_mul(60))
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: format!("timeout-minutes of job '{}'", name),
                    message: format!("{} minutes is too large", minutes),
                })?;
            Some(Duration::from_secs(secs))
        }
        None => None,
    };

    let needs = get_string_list_prop(node, "needs");
    let when = get_string_prop(node, "when").map(Condition::new);

    let mut image = None;
    let mut env = HashMap::new();
    let mut steps = Vec::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child);
                }
                "env" => {
                    env.extend(parse_env_block(child));
                }
                "step" => {
                    steps.push(parse_step(child, &name)?);
                }
                // Shorthand for a step holding a single `run`.
                "run" => {
                    let action = parse_action(child, &name)?;
                    steps.push(Step {
                        name: format!("run-{}", steps.len() + 1),
                        when: None,
                        env: HashMap::new(),
                        action,
                    });
                }
                _ => {}
            }
        }
    }

    Ok(JobDefinition {
        name,
        image,
        needs,
        timeout,
        when,
        env,
        steps,
    })
}

fn parse_step(node: &KdlNode, job: &str) -> ConfigResult<Step> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(format!("step name in job '{}'", job)))?;
    let when = get_string_prop(node, "when").map(Condition::new);

    let mut env = HashMap::new();
    let mut action = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "env" => env.extend(parse_env_block(child)),
                "run" | "checkout" | "pull" | "build" | "push" => {
                    if action.is_some() {
                        return Err(ConfigError::Duplicate(format!(
                            "action in step '{}' of job '{}'",
                            name, job
                        )));
                    }
                    action = Some(parse_action(child, job)?);
                }
                _ => {}
            }
        }
    }

    let action = action.ok_or_else(|| {
        ConfigError::MissingField(format!("action for step '{}' in job '{}'", name, job))
    })?;

    Ok(Step {
        name,
        when,
        env,
        action,
    })
}

fn parse_action(node: &KdlNode, job: &str) -> ConfigResult<StepAction> {
    let kind = node.name().value();
    match kind {
        "run" => {
            let command = get_all_string_args(node).join("\n");
            if command.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "command for run step in job '{}'",
                    job
                )));
            }
            Ok(StepAction::Run {
                command,
                image: get_string_prop(node, "image"),
                shell: get_string_prop(node, "shell").unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            })
        }
        "checkout" => {
            let depth = match get_integer_prop(node, "depth") {
                Some(d) if d <= 0 => None,
                Some(d) => Some(u32::try_from(d).map_err(|_| ConfigError::InvalidValue {
                    field: "checkout depth".to_string(),
                    message: format!("{} is out of range", d),
                })?),
                None => None,
            };
            Ok(StepAction::Checkout {
                lfs: get_bool_prop(node, "lfs").unwrap_or(false),
                submodules: get_bool_prop(node, "submodules").unwrap_or(false),
                depth,
            })
        }
        "pull" => Ok(StepAction::ImagePull {
            image: get_first_string_arg(node).ok_or_else(|| {
                ConfigError::MissingField(format!("image for pull step in job '{}'", job))
            })?,
        }),
        "push" => Ok(StepAction::ImagePush {
            image: get_first_string_arg(node).ok_or_else(|| {
                ConfigError::MissingField(format!("image for push step in job '{}'", job))
            })?,
        }),
        "build" => {
            let tags = get_string_list_prop(node, "tag");
            if tags.is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "tag for build step in job '{}'",
                    job
                )));
            }
            let mut build_args = HashMap::new();
            if let Some(children) = node.children() {
                for child in children.nodes() {
                    if child.name().value() == "arg" {
                        let args = get_all_string_args(child);
                        match args.as_slice() {
                            [key, value] => {
                                build_args.insert(key.clone(), value.clone());
                            }
                            _ => {
                                return Err(ConfigError::InvalidValue {
                                    field: "build arg".to_string(),
                                    message: "expected `arg \"NAME\" \"value\"`".to_string(),
                                });
                            }
                        }
                    }
                }
            }
            Ok(StepAction::ImageBuild {
                context: get_first_string_arg(node).unwrap_or_else(|| ".".to_string()),
                dockerfile: get_string_prop(node, "dockerfile")
                    .unwrap_or_else(|| "Dockerfile".to_string()),
                tags,
                cache_from: get_string_list_prop(node, "cache-from"),
                build_args,
                target: get_string_prop(node, "target"),
            })
        }
        other => Err(ConfigError::InvalidValue {
            field: "step action".to_string(),
            message: format!("unknown action: {}", other),
        }),
    }
}

/// Detect cycles in the job dependency graph using DFS.
fn detect_cycle(jobs: &[JobDefinition]) -> Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    let job_map: HashMap<&str, &JobDefinition> =
        jobs.iter().map(|j| (j.name.as_str(), j)).collect();

    for job in jobs {
        if !visited.contains_key(job.name.as_str()) {
            if let Some(cycle) = dfs_detect_cycle(&job.name, &job_map, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    job_map: &HashMap<&'a str, &'a JobDefinition>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(job) = job_map.get(node) {
        for dep in &job.needs {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, job_map, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}
