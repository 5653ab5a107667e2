//! Run commands against a Shipyard server.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::ResourceId;
use shipyard_core::executor::{LogLine, LogStream};
use shipyard_core::run::{JobState, RunStatus, StepStatus, WorkflowRun};
use std::time::Duration;

use super::client::ApiClient;

/// Page size for log requests, the most the server hands out at once.
const LOG_PAGE_SIZE: usize = 1000;
const FOLLOW_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct RunSummary {
    id: ResourceId,
    workflow: String,
    number: u64,
    status: RunStatus,
    git_ref: String,
    sha: String,
    event: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct LogPage {
    lines: Vec<RunLogLine>,
    total: usize,
    dropped: usize,
}

#[derive(Debug, Deserialize)]
struct RunLogLine {
    job: String,
    step: String,
    #[serde(flatten)]
    line: LogLine,
}

#[derive(Debug, Default, Serialize)]
struct TriggerRequest {
    repository: Option<String>,
    branch: Option<String>,
    sha: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunIdResponse {
    run_id: ResourceId,
}

fn parse_id(id: &str) -> Result<ResourceId> {
    id.parse()
        .with_context(|| format!("Invalid run ID: {}", id))
}

fn short(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

pub async fn list(client: &ApiClient, workflow: Option<String>, limit: usize) -> Result<()> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(workflow) = workflow {
        query.push(("workflow", workflow));
    }
    let runs: Vec<RunSummary> = client.get("api/v1/runs", &query).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<36}  {:<16} {:>5}  {:<10} {:<12} {:<24} {:<7}  CREATED",
        "ID", "WORKFLOW", "#", "STATUS", "EVENT", "REF", "SHA"
    );
    for run in runs {
        println!(
            "{:<36}  {:<16} {:>5}  {:<10} {:<12} {:<24} {:<7}  {}",
            run.id,
            run.workflow,
            run.number,
            run.status.label(),
            run.event,
            run.git_ref,
            short(&run.sha),
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let run: WorkflowRun = client.get(&format!("api/v1/runs/{}", id), &[]).await?;

    println!("Run {} ({} #{})", run.id, run.workflow, run.number);
    println!("  Status:     {}", run.status.label());
    if let RunStatus::Failed { jobs } = &run.status {
        println!("  Failed:     {}", jobs.join(", "));
    }
    println!("  Event:      {}", run.event.kind.name());
    println!("  Repository: {}", run.event.repository);
    println!("  Ref:        {} ({})", run.event.git_ref, short(&run.event.sha));
    if let Some(group) = &run.concurrency_group {
        println!("  Group:      {}", group);
    }
    println!("  Created:    {}", run.created_at);
    if let (Some(started), Some(finished)) = (run.started_at, run.finished_at) {
        println!("  Duration:   {}s", (finished - started).num_seconds());
    }

    for job in &run.jobs {
        let marker = match &job.state {
            JobState::Succeeded => "✓",
            JobState::Failed { .. } | JobState::TimedOut { .. } => "✗",
            JobState::Skipped { .. } | JobState::Cancelled => "⊘",
            JobState::Running => "▶",
            JobState::Pending => "○",
        };
        let detail = match &job.state {
            JobState::Failed { message } => format!(": {}", message),
            JobState::TimedOut { after } => format!(" after {}s", after.as_secs()),
            JobState::Skipped { reason } => format!(": {}", reason),
            _ => String::new(),
        };
        println!("\n{} {} ({}{})", marker, job.name, job.state.label(), detail);

        for step in &job.steps {
            let marker = match &step.status {
                StepStatus::Succeeded => "✓",
                StepStatus::Failed { .. } => "✗",
                StepStatus::Skipped { .. } | StepStatus::Cancelled => "⊘",
            };
            match step.exit_code {
                Some(code) => println!("  {} {} (exit {})", marker, step.name, code),
                None => println!("  {} {}", marker, step.name),
            }
        }
    }
    Ok(())
}

pub async fn logs(client: &ApiClient, id: &str, job: Option<String>, follow: bool) -> Result<()> {
    let id = parse_id(id)?;
    let run_path = format!("api/v1/runs/{}", id);
    let logs_path = format!("{}/logs", run_path);
    let mut offset = 0;

    loop {
        // Checked before reading so lines written up to the end are drained.
        let finished = if follow {
            let run: WorkflowRun = client.get(&run_path, &[]).await?;
            run.status.is_terminal().then_some(run.status)
        } else {
            None
        };

        let dropped = loop {
            let mut query = vec![
                ("offset", offset.to_string()),
                ("limit", LOG_PAGE_SIZE.to_string()),
            ];
            if let Some(job) = &job {
                query.push(("job", job.clone()));
            }
            let page: LogPage = client.get(&logs_path, &query).await?;
            for entry in &page.lines {
                print_line(entry);
            }
            offset += page.lines.len();
            if page.lines.is_empty() || offset >= page.total {
                break page.dropped;
            }
        };

        if !follow {
            if dropped > 0 {
                println!("({} lines dropped by the server)", dropped);
            }
            return Ok(());
        }
        if let Some(status) = finished {
            println!("-- run {} --", status.label());
            return Ok(());
        }
        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }
}

fn print_line(entry: &RunLogLine) {
    let marker = match entry.line.stream {
        LogStream::Stdout => " ",
        LogStream::Stderr => "!",
        LogStream::System => "*",
    };
    println!("[{}/{}]{} {}", entry.job, entry.step, marker, entry.line.content);
}

pub async fn cancel(client: &ApiClient, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let _: serde_json::Value = client
        .post(&format!("api/v1/runs/{}/cancel", id), &serde_json::json!({}))
        .await?;
    println!("Cancelled run {}", id);
    Ok(())
}

pub async fn trigger(
    client: &ApiClient,
    workflow: &str,
    branch: Option<String>,
    sha: Option<String>,
    repository: Option<String>,
) -> Result<()> {
    let request = TriggerRequest {
        repository,
        branch,
        sha,
    };
    let response: RunIdResponse = client
        .post(&format!("api/v1/workflows/{}/runs", workflow), &request)
        .await?;
    println!("Queued run {} of '{}'", response.run_id, workflow);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_page_decodes_flattened_lines() {
        let json = r#"{
            "lines": [{
                "job": "plotjuggler",
                "step": "run-1",
                "timestamp": "2024-05-01T12:00:00Z",
                "stream": "stderr",
                "content": "warning: deprecated"
            }],
            "total": 12,
            "dropped": 0
        }"#;
        let page: LogPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.total, 12);
        assert_eq!(page.lines[0].job, "plotjuggler");
        assert_eq!(page.lines[0].line.stream, LogStream::Stderr);
    }

    #[test]
    fn test_trigger_request_shape() {
        let json = serde_json::to_value(TriggerRequest {
            branch: Some("release3".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["branch"], "release3");
        assert!(json["repository"].is_null());
    }

    #[test]
    fn test_short_sha() {
        assert_eq!(short("4f2c1d9a8b7e"), "4f2c1d9");
        assert_eq!(short("abc"), "abc");
        assert!(parse_id("not-a-uuid").is_err());
    }
}
