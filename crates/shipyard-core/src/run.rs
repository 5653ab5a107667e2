//! Workflow run records and progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ResourceId;
use crate::event::RepositoryEvent;
use crate::executor::LogLine;

/// One execution of a workflow in response to one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: ResourceId,
    /// Workflow name.
    pub workflow: String,
    /// Run number, incrementing per workflow.
    pub number: u64,
    /// The event that started this run.
    pub event: RepositoryEvent,
    pub status: RunStatus,
    pub jobs: Vec<JobRun>,
    /// Resolved concurrency group, if the workflow declares one.
    pub concurrency_group: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn job(&self, name: &str) -> Option<&JobRun> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn job_mut(&mut self, name: &str) -> Option<&mut JobRun> {
        self.jobs.iter_mut().find(|j| j.name == name)
    }
}

/// Overall run status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    /// Names of the jobs that did not succeed.
    Failed { jobs: Vec<String> },
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed { .. } | RunStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed { .. } => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Progress of a single job within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub name: String,
    pub state: JobState,
    pub steps: Vec<StepResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: JobState::Pending,
            steps: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// State of a job during execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    TimedOut { after: Duration },
    Skipped { reason: String },
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed { .. } => "failed",
            JobState::TimedOut { .. } => "timed_out",
            JobState::Skipped { .. } => "skipped",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
    Cancelled,
}

impl StepStatus {
    pub fn label(&self) -> &'static str {
        match self {
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed { .. } => "failed",
            StepStatus::Skipped { .. } => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

/// Event emitted while a run progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunQueued {
        run_id: ResourceId,
        workflow: String,
        number: u64,
    },
    RunStarted {
        run_id: ResourceId,
    },
    JobStarted {
        run_id: ResourceId,
        job: String,
    },
    StepStarted {
        run_id: ResourceId,
        job: String,
        step: String,
    },
    StepLog {
        run_id: ResourceId,
        job: String,
        step: String,
        line: LogLine,
    },
    StepCompleted {
        run_id: ResourceId,
        job: String,
        result: StepResult,
    },
    JobCompleted {
        run_id: ResourceId,
        job: String,
        state: JobState,
    },
    RunCompleted {
        run_id: ResourceId,
        status: RunStatus,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> ResourceId {
        match self {
            RunEvent::RunQueued { run_id, .. }
            | RunEvent::RunStarted { run_id }
            | RunEvent::JobStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepLog { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::JobCompleted { run_id, .. }
            | RunEvent::RunCompleted { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_terminality() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(
            JobState::TimedOut {
                after: Duration::from_secs(1800)
            }
            .is_terminal()
        );
        assert!(
            JobState::Skipped {
                reason: "condition".to_string()
            }
            .is_terminal()
        );
        assert!(!JobState::Cancelled.is_success());
    }

    #[test]
    fn test_run_status_labels() {
        assert_eq!(RunStatus::Queued.label(), "queued");
        assert!(!RunStatus::Running.is_terminal());
        assert!(
            RunStatus::Failed {
                jobs: vec!["simulator".to_string()]
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_run_event_serializes_with_type_tag() {
        let run_id = ResourceId::new();
        let event = RunEvent::JobCompleted {
            run_id,
            job: "plotjuggler".to_string(),
            state: JobState::Succeeded,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_completed");
        assert_eq!(json["state"]["state"], "succeeded");
        assert_eq!(event.run_id(), run_id);
    }
}
