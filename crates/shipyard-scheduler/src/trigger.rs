//! Matching repository events against workflow triggers.
//!
//! Branch, tag and path patterns are globs: `*` stays within one path
//! segment, `**` crosses `/`. A pattern starting with `!` excludes what it
//! matches; patterns apply in order and the last match wins.

use globset::GlobBuilder;
use shipyard_core::event::{EventKind, RepositoryEvent};
use shipyard_core::workflow::{Trigger, Workflow};
use tracing::warn;

/// Pull request actions accepted when a trigger lists none.
pub const DEFAULT_PR_ACTIONS: &[&str] = &["opened", "synchronize", "reopened"];

/// Whether the workflow reacts to the event.
pub fn matches(workflow: &Workflow, event: &RepositoryEvent) -> bool {
    if let Some(repository) = &workflow.repository {
        if !repository.eq_ignore_ascii_case(&event.repository) {
            return false;
        }
    }
    workflow
        .triggers
        .iter()
        .any(|trigger| trigger_matches(trigger, event))
}

pub fn trigger_matches(trigger: &Trigger, event: &RepositoryEvent) -> bool {
    match (trigger, &event.kind) {
        (
            Trigger::Push {
                branches,
                tags,
                paths,
            },
            EventKind::Push,
        ) => {
            let ref_matches = match (&event.branch, &event.tag) {
                // Listing only tags means branch pushes are ignored.
                (Some(branch), _) => {
                    (branches.is_empty() && tags.is_empty()) || pattern_list_matches(branches, branch)
                }
                (None, Some(tag)) => pattern_list_matches(tags, tag),
                (None, None) => false,
            };
            ref_matches && paths_match(paths, &event.changed_files)
        }
        (
            Trigger::PullRequest { branches, actions },
            EventKind::PullRequest {
                action,
                base_branch,
                ..
            },
        ) => {
            let action_matches = if actions.is_empty() {
                DEFAULT_PR_ACTIONS.contains(&action.as_str())
            } else {
                actions.iter().any(|a| a == action)
            };
            action_matches && (branches.is_empty() || pattern_list_matches(branches, base_branch))
        }
        (Trigger::Manual, EventKind::Manual) => true,
        _ => false,
    }
}

/// An empty filter or an event without a file list always matches.
fn paths_match(paths: &[String], changed: &[String]) -> bool {
    if paths.is_empty() || changed.is_empty() {
        return true;
    }
    changed.iter().any(|file| pattern_list_matches(paths, file))
}

fn pattern_list_matches(patterns: &[String], value: &str) -> bool {
    let mut matched = false;
    for pattern in patterns {
        match pattern.strip_prefix('!') {
            Some(negated) => {
                if glob_matches(negated, value) {
                    matched = false;
                }
            }
            None => {
                if glob_matches(pattern, value) {
                    matched = true;
                }
            }
        }
    }
    matched
}

pub fn glob_matches(pattern: &str, value: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob.compile_matcher().is_match(value),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "Invalid trigger pattern");
            false
        }
    }
}
