//! Local workflow execution command.

use anyhow::{Context, Result};
use shipyard_config::{EnvSecretStore, load_workflow};
use shipyard_core::event::RepositoryEvent;
use shipyard_core::executor::LogStream;
use shipyard_core::run::{JobState, RunEvent, RunStatus, StepStatus};
use shipyard_core::workflow::Workflow;
use shipyard_executor::LocalDockerExecutor;
use shipyard_registry::DockerRegistryClient;
use shipyard_scheduler::{Scheduler, SchedulerConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Run a workflow against the local checkout using Docker.
pub async fn run_local(
    path: &Path,
    jobs: Vec<String>,
    git_ref: &str,
    sha: &str,
    repository: Option<String>,
) -> Result<()> {
    let workflow = load_workflow(path)
        .with_context(|| format!("Failed to load workflow: {}", path.display()))?;

    println!("Running workflow: {}", workflow.name);
    let workflow = select_jobs(workflow, &jobs)?;
    println!("Jobs: {}", workflow.jobs.len());

    let working_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .context("Failed to resolve working directory")?;
    println!("Working directory: {}", working_dir.display());

    let repository = repository
        .or_else(|| workflow.repository.clone())
        .or_else(|| {
            working_dir
                .file_name()
                .map(|n| format!("local/{}", n.to_string_lossy()))
        })
        .unwrap_or_else(|| "local/workspace".to_string());

    let executor = Arc::new(LocalDockerExecutor::new().context("Failed to connect to Docker")?);
    let registry = Arc::new(DockerRegistryClient::new().context("Failed to connect to Docker")?);
    let secrets = Arc::new(EnvSecretStore::default());

    let scheduler = Scheduler::new(
        SchedulerConfig::default().with_local_workspace(&working_dir),
        executor,
        registry,
        secrets,
    );
    let name = workflow.name.clone();
    scheduler.register(workflow).await?;

    let mut events = scheduler.subscribe();
    let workers = scheduler.start();

    println!("\n--- Starting workflow execution ---\n");
    let run_id = scheduler
        .trigger(&name, RepositoryEvent::manual(repository, git_ref, sha))
        .await?;

    let mut interrupted = false;
    let status = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if signal.is_ok() {
                    println!("\n⊘ Interrupted, cancelling run...");
                    if let Err(e) = scheduler.cancel(run_id).await {
                        println!("  Could not cancel: {}", e);
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) if event.run_id() != run_id => {}
                Ok(RunEvent::RunCompleted { status, .. }) => break status,
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    println!("  ({} events dropped)", skipped);
                }
                Err(RecvError::Closed) => anyhow::bail!("Scheduler stopped unexpectedly"),
            },
        }
    };

    scheduler.shutdown().await;
    for worker in workers {
        worker.await.context("Worker task failed")?;
    }

    let run = scheduler
        .store()
        .get(run_id)
        .await
        .context("Run record disappeared")?;

    println!("\n--- Job Summary ---");
    for job in &run.jobs {
        let status = match &job.state {
            JobState::Succeeded => "✓ succeeded".to_string(),
            JobState::Failed { message } => format!("✗ failed: {}", message),
            JobState::TimedOut { after } => format!("✗ timed out after {}s", after.as_secs()),
            JobState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            JobState::Cancelled => "⊘ cancelled".to_string(),
            JobState::Pending => "○ pending".to_string(),
            JobState::Running => "▶ running".to_string(),
        };
        println!("  {} - {}", job.name, status);
    }

    match status {
        RunStatus::Succeeded => {
            println!("\n✓ Workflow succeeded!");
            Ok(())
        }
        RunStatus::Failed { jobs } => anyhow::bail!("Workflow failed: {}", jobs.join(", ")),
        other => anyhow::bail!("Workflow {}", other.label()),
    }
}

/// Keep only the named jobs. Dependencies on dropped jobs are removed so the
/// remaining jobs still run.
fn select_jobs(mut workflow: Workflow, jobs: &[String]) -> Result<Workflow> {
    if jobs.is_empty() {
        return Ok(workflow);
    }
    if let Some(unknown) = jobs
        .iter()
        .find(|name| !workflow.jobs.iter().any(|j| &j.name == *name))
    {
        anyhow::bail!("No job named '{}' in workflow '{}'", unknown, workflow.name);
    }

    workflow.jobs.retain(|j| jobs.contains(&j.name));
    for job in &mut workflow.jobs {
        job.needs.retain(|n| jobs.contains(n));
    }
    println!("Running selected jobs: {}", jobs.join(", "));
    Ok(workflow)
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::RunQueued { number, .. } => println!("Queued run #{}", number),
        RunEvent::RunStarted { .. } => {}
        RunEvent::JobStarted { job, .. } => println!("▶ Job '{}' started", job),
        RunEvent::StepStarted { job, step, .. } => println!("  [{}] ▶ {}", job, step),
        RunEvent::StepLog { job, line, .. } => {
            let marker = match line.stream {
                LogStream::Stdout => " ",
                LogStream::Stderr => "!",
                LogStream::System => "*",
            };
            println!("  [{}]{} {}", job, marker, line.content);
        }
        RunEvent::StepCompleted { job, result, .. } => match &result.status {
            StepStatus::Succeeded => println!("  [{}] ✓ {}", job, result.name),
            StepStatus::Failed { message } => {
                println!("  [{}] ✗ {}: {}", job, result.name, message)
            }
            StepStatus::Skipped { reason } => {
                println!("  [{}] ⊘ {}: {}", job, result.name, reason)
            }
            StepStatus::Cancelled => println!("  [{}] ⊘ {} cancelled", job, result.name),
        },
        RunEvent::JobCompleted { job, state, .. } => {
            if state.is_success() {
                println!("✓ Job '{}' completed successfully\n", job);
            } else {
                println!("✗ Job '{}' {}\n", job, state.label());
            }
        }
        RunEvent::RunCompleted { .. } => {}
    }
}
