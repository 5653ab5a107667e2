//! Dry-run planning: which jobs and steps an event would run.

use anyhow::{Context, Result};
use shipyard_config::{VariableContext, VariableContextBuilder, condition, load_workflow};
use shipyard_core::event::{EventKind, RepositoryEvent};
use shipyard_core::workflow::{JobDefinition, Workflow};
use shipyard_scheduler::trigger;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

#[derive(Debug, Clone)]
pub enum PlanEvent {
    Push,
    PullRequest { action: String, base: String },
}

#[derive(Debug)]
pub struct Plan {
    /// Whether the workflow's triggers accept the event.
    pub triggered: bool,
    /// Jobs in an order that respects `needs`.
    pub jobs: Vec<JobPlan>,
}

#[derive(Debug)]
pub struct JobPlan {
    pub name: String,
    pub skipped: Option<String>,
    pub steps: Vec<StepPlan>,
}

#[derive(Debug)]
pub struct StepPlan {
    pub name: String,
    pub kind: &'static str,
    pub skipped: Option<String>,
}

pub fn build_event(
    kind: PlanEvent,
    repository: &str,
    git_ref: &str,
    changed_files: Vec<String>,
) -> RepositoryEvent {
    let mut event = RepositoryEvent::push(repository, git_ref, "");
    event.changed_files = changed_files;
    if let PlanEvent::PullRequest { action, base } = kind {
        event.kind = EventKind::PullRequest {
            number: 0,
            action,
            base_branch: base,
            head_branch: event.branch.clone().unwrap_or_default(),
            from_fork: false,
        };
    }
    event
}

/// Evaluate triggers and conditions without running anything. Secrets are
/// unknown at this point and resolve to empty strings.
pub fn plan(workflow: &Workflow, event: &RepositoryEvent) -> Result<Plan> {
    let mut vars = VariableContextBuilder::new()
        .with_event(event)
        .with_workflow(&workflow.name)
        .build();
    vars.extend_env(&workflow.env);

    let mut skipped_jobs: HashSet<String> = HashSet::new();
    let mut jobs = Vec::new();

    for job in execution_order(&workflow.jobs) {
        let mut job_vars = vars.clone();
        job_vars.job = job.name.clone();
        job_vars.extend_env(&job.env);

        let skipped = match job.needs.iter().find(|n| skipped_jobs.contains(*n)) {
            Some(dep) => Some(format!("dependency '{}' is skipped", dep)),
            None => match &job.when {
                Some(when) if !condition::evaluate(&when.expression, &job_vars)? => {
                    Some(format!("condition not met: {}", when.expression))
                }
                _ => None,
            },
        };
        if skipped.is_some() {
            skipped_jobs.insert(job.name.clone());
        }

        let steps = job
            .steps
            .iter()
            .map(|step| {
                let mut step_vars: VariableContext = job_vars.clone();
                step_vars.step = step.name.clone();
                step_vars.extend_env(&step.env);
                let skipped = match &step.when {
                    Some(when) if !condition::evaluate(&when.expression, &step_vars)? => {
                        Some(format!("condition not met: {}", when.expression))
                    }
                    _ => None,
                };
                Ok(StepPlan {
                    name: step.name.clone(),
                    kind: step.action.kind(),
                    skipped,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        jobs.push(JobPlan {
            name: job.name.clone(),
            skipped,
            steps,
        });
    }

    Ok(Plan {
        triggered: trigger::matches(workflow, event),
        jobs,
    })
}

/// Declaration order, with every job after the jobs it needs.
fn execution_order(jobs: &[JobDefinition]) -> Vec<&JobDefinition> {
    let mut remaining: HashMap<&str, usize> = jobs
        .iter()
        .map(|j| (j.name.as_str(), j.needs.len()))
        .collect();
    let mut ready: VecDeque<&JobDefinition> =
        jobs.iter().filter(|j| j.needs.is_empty()).collect();
    let mut order = Vec::with_capacity(jobs.len());

    while let Some(job) = ready.pop_front() {
        order.push(job);
        for dependent in jobs.iter().filter(|j| j.needs.contains(&job.name)) {
            if let Some(count) = remaining.get_mut(dependent.name.as_str()) {
                *count -= 1;
                if *count == 0 {
                    ready.push_back(dependent);
                }
            }
        }
    }
    order
}

pub fn print_plan(
    path: &Path,
    kind: PlanEvent,
    git_ref: &str,
    repository: Option<String>,
    changed_files: Vec<String>,
) -> Result<()> {
    let workflow = load_workflow(path)
        .with_context(|| format!("Failed to load workflow: {}", path.display()))?;
    let repository = repository
        .or_else(|| workflow.repository.clone())
        .unwrap_or_else(|| "local/workspace".to_string());
    let event = build_event(kind, &repository, git_ref, changed_files);
    let plan = plan(&workflow, &event)?;

    println!(
        "Workflow '{}' for {} to {} on {}",
        workflow.name,
        event.kind.name(),
        event.git_ref,
        event.repository
    );
    if !plan.triggered {
        println!("⊘ Not triggered: no trigger matches this event");
        println!("  Jobs below would run on a manual trigger.");
    }

    for job in &plan.jobs {
        match &job.skipped {
            None => println!("\n▶ job {}", job.name),
            Some(reason) => println!("\n⊘ job {} - {}", job.name, reason),
        }
        for step in &job.steps {
            match (&job.skipped, &step.skipped) {
                (None, None) => println!("  ✓ {} [{}]", step.name, step.kind),
                (_, Some(reason)) => println!("  ⊘ {} [{}] - {}", step.name, step.kind, reason),
                (Some(_), None) => println!("  ○ {} [{}]", step.name, step.kind),
            }
        }
    }
    Ok(())
}
