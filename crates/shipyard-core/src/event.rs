//! Repository events that trigger workflow runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of repository event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest {
        number: u64,
        action: String,
        base_branch: String,
        head_branch: String,
        /// Head commits live outside the base repository.
        #[serde(default)]
        from_fork: bool,
    },
    Manual,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest { .. } => "pull_request",
            EventKind::Manual => "manual",
        }
    }
}

/// A normalized repository event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryEvent {
    pub kind: EventKind,
    /// Full repository name (e.g., "commaai/openpilot").
    pub repository: String,
    pub clone_url: Option<String>,
    /// Full git ref (e.g., "refs/heads/master", "refs/pull/12/merge").
    pub git_ref: String,
    pub sha: String,
    pub branch: Option<String>,
    pub tag: Option<String>,
    pub actor: String,
    pub message: String,
    /// Files touched by the event, when the provider reports them.
    pub changed_files: Vec<String>,
    pub received_at: DateTime<Utc>,
}

impl RepositoryEvent {
    /// Build a manual event for a repository and ref.
    pub fn manual(repository: impl Into<String>, git_ref: impl Into<String>, sha: impl Into<String>) -> Self {
        let git_ref = normalize_ref(&git_ref.into());
        let (branch, tag) = split_ref(&git_ref);
        Self {
            kind: EventKind::Manual,
            repository: repository.into(),
            clone_url: None,
            git_ref,
            sha: sha.into(),
            branch,
            tag,
            actor: "manual".to_string(),
            message: String::new(),
            changed_files: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Build a push event, mostly for local planning and tests.
    pub fn push(repository: impl Into<String>, git_ref: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Push,
            actor: "local".to_string(),
            ..Self::manual(repository, git_ref, sha)
        }
    }

    pub fn short_sha(&self) -> String {
        self.sha.chars().take(7).collect()
    }

    /// Pull request whose code comes from another repository.
    pub fn from_fork(&self) -> bool {
        matches!(self.kind, EventKind::PullRequest { from_fork: true, .. })
    }

    /// Parse a GitHub `push` webhook payload.
    pub fn from_github_push(payload: &serde_json::Value) -> Option<Self> {
        let git_ref = payload.get("ref")?.as_str()?.to_string();
        let sha = payload.get("after")?.as_str()?.to_string();
        let repository = payload.get("repository")?;
        let repository_full_name = repository.get("full_name")?.as_str()?.to_string();
        let clone_url = repository
            .get("clone_url")
            .and_then(|u| u.as_str())
            .map(String::from);

        let (branch, tag) = split_ref(&git_ref);

        let mut changed_files = Vec::new();
        if let Some(commits) = payload.get("commits").and_then(|c| c.as_array()) {
            for commit in commits {
                for key in ["added", "modified", "removed"] {
                    let files = commit
                        .get(key)
                        .and_then(|a| a.as_array())
                        .into_iter()
                        .flatten()
                        .filter_map(|v| v.as_str());
                    for file in files {
                        if !changed_files.iter().any(|f| f == file) {
                            changed_files.push(file.to_string());
                        }
                    }
                }
            }
        }

        let message = payload
            .get("head_commit")
            .and_then(|c| c.get("message"))
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();

        let actor = payload
            .get("pusher")
            .and_then(|p| p.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("unknown")
            .to_string();

        Some(Self {
            kind: EventKind::Push,
            repository: repository_full_name,
            clone_url,
            git_ref,
            sha,
            branch,
            tag,
            actor,
            message,
            changed_files,
            received_at: Utc::now(),
        })
    }

    /// Parse a GitHub `pull_request` webhook payload.
    ///
    /// The base repository is the one the run is attributed to; the head
    /// commit is what gets built.
    pub fn from_github_pull_request(payload: &serde_json::Value) -> Option<Self> {
        let action = payload.get("action")?.as_str()?.to_string();
        let pr = payload.get("pull_request")?;
        let number = pr
            .get("number")
            .and_then(|n| n.as_u64())
            .or_else(|| payload.get("number").and_then(|n| n.as_u64()))?;

        let base = pr.get("base")?;
        let head = pr.get("head")?;
        let base_branch = base.get("ref")?.as_str()?.to_string();
        let head_branch = head.get("ref")?.as_str()?.to_string();
        let sha = head.get("sha")?.as_str()?.to_string();

        let repository = payload
            .get("repository")
            .and_then(|r| r.get("full_name"))
            .or_else(|| base.get("repo").and_then(|r| r.get("full_name")))?
            .as_str()?
            .to_string();

        // Forks are cloned from the head repository.
        let head_repo = head.get("repo");
        let clone_url = head_repo
            .and_then(|r| r.get("clone_url"))
            .and_then(|u| u.as_str())
            .map(String::from);
        // A head repository that is gone or named differently is a fork.
        let from_fork = !head_repo
            .and_then(|r| r.get("full_name"))
            .and_then(|n| n.as_str())
            .is_some_and(|name| name.eq_ignore_ascii_case(&repository));

        let actor = pr
            .get("user")
            .and_then(|u| u.get("login"))
            .and_then(|l| l.as_str())
            .unwrap_or("unknown")
            .to_string();

        let message = pr
            .get("title")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        Some(Self {
            kind: EventKind::PullRequest {
                number,
                action,
                base_branch,
                head_branch: head_branch.clone(),
                from_fork,
            },
            repository,
            clone_url,
            git_ref: format!("refs/pull/{}/merge", number),
            sha,
            branch: Some(head_branch),
            tag: None,
            actor,
            message,
            changed_files: Vec::new(),
            received_at: Utc::now(),
        })
    }
}

/// Expand a short branch name to a full ref; full refs pass through.
pub fn normalize_ref(git_ref: &str) -> String {
    if git_ref.starts_with("refs/") {
        git_ref.to_string()
    } else {
        format!("refs/heads/{}", git_ref)
    }
}

/// Split a full ref into (branch, tag).
pub fn split_ref(git_ref: &str) -> (Option<String>, Option<String>) {
    if let Some(branch) = git_ref.strip_prefix("refs/heads/") {
        (Some(branch.to_string()), None)
    } else if let Some(tag) = git_ref.strip_prefix("refs/tags/") {
        (None, Some(tag.to_string()))
    } else {
        (None, None)
    }
}
