//! Variable interpolation for workflow definitions.
//!
//! Supports variables like:
//! - `${git.sha}`, `${git.short_sha}`, `${git.ref}`, `${git.branch}`, `${git.tag}`
//! - `${git.message}`, `${git.author}`
//! - `${repo.name}`, `${repo.url}`
//! - `${event.name}`, `${event.action}`, `${event.pr_number}`, `${event.base_branch}`
//! - `${workflow.name}`, `${run.id}`, `${run.number}`
//! - `${job.name}`, `${step.name}`
//! - `${env.VAR_NAME}` - Workflow/job/step environment
//! - `${secrets.SECRET_NAME}` - Secret value (masked in logs)
//! - `${timestamp}`, `${date}`, `${datetime}`

use regex::Regex;
use shipyard_core::event::{EventKind, RepositoryEvent};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Placeholder written in place of secret values.
pub const MASK: &str = "***";

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub repo: RepoContext,
    pub event: EventContext,
    pub workflow: String,
    pub run: RunContext,
    pub job: String,
    pub step: String,
    pub env: HashMap<String, String>,
    /// Secrets (masked in logs).
    pub secrets: HashMap<String, String>,
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub ref_name: String,
    pub branch: String,
    pub tag: Option<String>,
    pub message: String,
    pub author: String,
}

#[derive(Debug, Clone, Default)]
pub struct RepoContext {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct EventContext {
    pub name: String,
    pub action: String,
    pub pr_number: Option<u64>,
    pub base_branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub id: String,
    pub number: u64,
}

// Matches ${name} and ${namespace.name}
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("variable pattern is valid")
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate git, repository and event variables from a repository event.
    pub fn from_event(event: &RepositoryEvent) -> Self {
        let mut ctx = Self::new();
        ctx.git.sha = event.sha.clone();
        ctx.git.short_sha = event.short_sha();
        ctx.git.ref_name = event.git_ref.clone();
        ctx.git.branch = event.branch.clone().unwrap_or_default();
        ctx.git.tag = event.tag.clone();
        ctx.git.message = event.message.clone();
        ctx.git.author = event.actor.clone();

        ctx.repo.name = event.repository.clone();
        ctx.repo.url = event
            .clone_url
            .clone()
            .unwrap_or_else(|| format!("https://github.com/{}.git", event.repository));

        ctx.event.name = event.kind.name().to_string();
        if let EventKind::PullRequest {
            number,
            action,
            base_branch,
            ..
        } = &event.kind
        {
            ctx.event.action = action.clone();
            ctx.event.pr_number = Some(*number);
            ctx.event.base_branch = base_branch.clone();
        }
        ctx
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "ref"] => Some(self.git.ref_name.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "message"] => Some(self.git.message.clone()),
            ["git", "author"] => Some(self.git.author.clone()),

            ["repo", "name"] => Some(self.repo.name.clone()),
            ["repo", "url"] => Some(self.repo.url.clone()),

            ["event", "name"] => Some(self.event.name.clone()),
            ["event", "action"] => Some(self.event.action.clone()),
            ["event", "pr_number"] => self.event.pr_number.map(|n| n.to_string()),
            ["event", "base_branch"] => Some(self.event.base_branch.clone()),

            ["workflow", "name"] => Some(self.workflow.clone()),
            ["run", "id"] => Some(self.run.id.clone()),
            ["run", "number"] => Some(self.run.number.to_string()),
            ["job", "name"] => Some(self.job.clone()),
            ["step", "name"] => Some(self.step.clone()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),
            ["datetime"] => Some(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are kept verbatim.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Layer environment entries on top of the current ones, interpolating
    /// each value against what is already defined.
    pub fn extend_env(&mut self, env: &HashMap<String, String>) {
        let resolved = self.interpolate_map(env);
        self.env.extend(resolved);
    }

    /// Replace every secret value in `line` with [`MASK`]. Longer values go
    /// first so a secret that prefixes another cannot expose its tail.
    pub fn mask(&self, line: &str) -> String {
        let mut values: Vec<&String> = self.secrets.values().filter(|v| !v.is_empty()).collect();
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut masked = line.to_string();
        for value in values {
            masked = masked.replace(value.as_str(), MASK);
        }
        masked
    }
}

/// Names of all `${secrets.NAME}` references in a string.
pub fn find_secret_refs(input: &str) -> Vec<String> {
    VAR_REGEX
        .captures_iter(input)
        .filter_map(|caps| caps[1].strip_prefix("secrets.").map(String::from))
        .collect()
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_event(mut self, event: &RepositoryEvent) -> Self {
        let previous = std::mem::take(&mut self.ctx);
        self.ctx = VariableContext {
            env: previous.env,
            secrets: previous.secrets,
            custom: previous.custom,
            workflow: previous.workflow,
            run: previous.run,
            ..VariableContext::from_event(event)
        };
        self
    }

    pub fn with_git_ref(mut self, git_ref: impl Into<String>) -> Self {
        let git_ref = git_ref.into();
        if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
            self.ctx.git.branch = branch.to_string();
        }
        self.ctx.git.ref_name = git_ref;
        self
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_repository(mut self, name: impl Into<String>) -> Self {
        self.ctx.repo.name = name.into();
        self
    }

    pub fn with_workflow(mut self, name: impl Into<String>) -> Self {
        self.ctx.workflow = name.into();
        self
    }

    pub fn with_run(mut self, id: impl Into<String>, number: u64) -> Self {
        self.ctx.run.id = id.into();
        self.ctx.run.number = number;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890")
            .with_git_ref("refs/heads/master")
            .build();

        let result = ctx.interpolate("Commit ${git.sha} on ${git.branch} (${git.ref})");
        assert_eq!(result, "Commit abc1234567890 on master (refs/heads/master)");
        assert_eq!(ctx.interpolate("${git.short_sha}"), "abc1234");
    }

    #[test]
    fn test_from_push_event() {
        let event = RepositoryEvent::push("commaai/openpilot", "master", "0123456789abcdef");
        let ctx = VariableContext::from_event(&event);

        assert_eq!(ctx.interpolate("${repo.name}"), "commaai/openpilot");
        assert_eq!(ctx.interpolate("${event.name}"), "push");
        assert_eq!(
            ctx.interpolate("${repo.url}"),
            "https://github.com/commaai/openpilot.git"
        );
        // Not a pull request, so the number is left unresolved.
        assert_eq!(ctx.interpolate("${event.pr_number}"), "${event.pr_number}");
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("DOCKER_REGISTRY", "ghcr.io/commaai")
            .with_env("BASE_IMAGE", "openpilot-base")
            .build();

        let result = ctx.interpolate("${env.DOCKER_REGISTRY}/${env.BASE_IMAGE}:latest");
        assert_eq!(result, "ghcr.io/commaai/openpilot-base:latest");
    }

    #[test]
    fn test_extend_env_resolves_against_existing_values() {
        let mut ctx = VariableContextBuilder::new()
            .with_env("DOCKER_REGISTRY", "ghcr.io/commaai")
            .build();
        let mut job_env = HashMap::new();
        job_env.insert(
            "IMAGE".to_string(),
            "${env.DOCKER_REGISTRY}/sim".to_string(),
        );
        ctx.extend_env(&job_env);
        assert_eq!(ctx.env["IMAGE"], "ghcr.io/commaai/sim");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("Unknown: ${unknown.var}"), "Unknown: ${unknown.var}");
    }

    #[test]
    fn test_secret_masking() {
        let ctx = VariableContextBuilder::new()
            .with_secret("REGISTRY_TOKEN", "ghp_supersecret")
            .with_secret("EMPTY", "")
            .build();

        let masked = ctx.mask("login with ghp_supersecret ok");
        assert_eq!(masked, "login with *** ok");
        assert_eq!(ctx.mask("nothing here"), "nothing here");
    }

    #[test]
    fn test_masking_prefers_longer_secrets() {
        let ctx = VariableContextBuilder::new()
            .with_secret("SHORT", "abc")
            .with_secret("LONG", "abcdef")
            .with_secret("OTHER", "xyz")
            .build();
        assert_eq!(ctx.mask("user=abc token=abcdef"), "user=*** token=***");
    }

    #[test]
    fn test_find_secret_refs() {
        let refs = find_secret_refs("${secrets.REGISTRY_USER}:${secrets.REGISTRY_TOKEN}@${git.sha}");
        assert_eq!(refs, vec!["REGISTRY_USER", "REGISTRY_TOKEN"]);
    }

    #[test]
    fn test_builder_with_event_keeps_env() {
        let event = RepositoryEvent::push("commaai/openpilot", "master", "abc");
        let ctx = VariableContextBuilder::new()
            .with_env("CI", "true")
            .with_workflow("tools")
            .with_event(&event)
            .build();
        assert_eq!(ctx.interpolate("${env.CI} ${workflow.name} ${git.branch}"), "true tools master");
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();
        let result = ctx.interpolate(r#"{"sha": "${git.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
