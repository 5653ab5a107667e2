//! In-memory run records and logs.

use serde::Serialize;
use shipyard_core::executor::LogLine;
use shipyard_core::run::{RunStatus, WorkflowRun};
use shipyard_core::{Error, ResourceId, Result};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// A stored log line with the job and step that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogLine {
    pub job: String,
    pub step: String,
    #[serde(flatten)]
    pub line: LogLine,
}

/// A window into a run's logs.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub lines: Vec<RunLogLine>,
    /// Lines matching the filter, before paging.
    pub total: usize,
    /// Lines discarded after the per-run cap was reached.
    pub dropped: usize,
}

/// Filter for [`RunStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default)]
struct RunLogs {
    lines: Vec<RunLogLine>,
    dropped: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    runs: HashMap<ResourceId, WorkflowRun>,
    /// Insertion order, oldest first.
    order: VecDeque<ResourceId>,
    logs: HashMap<ResourceId, RunLogs>,
    counters: HashMap<String, u64>,
}

/// Run history kept in memory.
#[derive(Debug)]
pub struct RunStore {
    state: RwLock<StoreState>,
    max_runs: usize,
    max_log_lines: usize,
}

impl RunStore {
    pub fn new(max_runs: usize, max_log_lines: usize) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            max_runs,
            max_log_lines,
        }
    }

    /// Next run number for a workflow, starting at 1.
    pub async fn next_number(&self, workflow: &str) -> u64 {
        let mut state = self.state.write().await;
        let counter = state.counters.entry(workflow.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Record a new run, evicting the oldest finished runs past the limit.
    pub async fn insert(&self, run: WorkflowRun) {
        let mut state = self.state.write().await;
        state.order.push_back(run.id);
        state.runs.insert(run.id, run);

        let mut excess = state.runs.len().saturating_sub(self.max_runs);
        if excess == 0 {
            return;
        }

        let StoreState {
            runs, order, logs, ..
        } = &mut *state;
        order.retain(|id| {
            if excess > 0 && runs.get(id).is_some_and(|r| r.status.is_terminal()) {
                runs.remove(id);
                logs.remove(id);
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    pub async fn remove(&self, id: ResourceId) -> Option<WorkflowRun> {
        let mut state = self.state.write().await;
        state.order.retain(|r| *r != id);
        state.logs.remove(&id);
        state.runs.remove(&id)
    }

    pub async fn get(&self, id: ResourceId) -> Option<WorkflowRun> {
        self.state.read().await.runs.get(&id).cloned()
    }

    /// Apply a change to a run under the write lock.
    pub async fn update<R>(&self, id: ResourceId, f: impl FnOnce(&mut WorkflowRun) -> R) -> Result<R> {
        let mut state = self.state.write().await;
        let run = state
            .runs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("run {}", id)))?;
        Ok(f(run))
    }

    /// Runs, newest first.
    pub async fn list(&self, filter: &RunFilter) -> Vec<WorkflowRun> {
        let state = self.state.read().await;
        let runs = state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.runs.get(id))
            .filter(|run| {
                filter
                    .workflow
                    .as_ref()
                    .is_none_or(|name| &run.workflow == name)
            })
            .cloned();

        match filter.limit {
            Some(limit) => runs.take(limit).collect(),
            None => runs.collect(),
        }
    }

    /// Unfinished runs in a concurrency group.
    pub async fn active_in_group(&self, group: &str) -> Vec<ResourceId> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.runs.get(id))
            .filter(|run| {
                !run.status.is_terminal() && run.concurrency_group.as_deref() == Some(group)
            })
            .map(|run| run.id)
            .collect()
    }

    pub async fn count_by_status(&self) -> HashMap<&'static str, usize> {
        let state = self.state.read().await;
        let mut counts = HashMap::new();
        for run in state.runs.values() {
            *counts.entry(run.status.label()).or_insert(0) += 1;
        }
        counts
    }

    /// Append a log line. Past the per-run cap lines are counted, not kept.
    pub async fn append_log(&self, id: ResourceId, job: &str, step: &str, line: LogLine) {
        let mut state = self.state.write().await;
        if !state.runs.contains_key(&id) {
            return;
        }
        let logs = state.logs.entry(id).or_default();
        if logs.lines.len() >= self.max_log_lines {
            logs.dropped += 1;
            return;
        }
        logs.lines.push(RunLogLine {
            job: job.to_string(),
            step: step.to_string(),
            line,
        });
    }

    pub async fn logs(
        &self,
        id: ResourceId,
        job: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<LogPage> {
        let state = self.state.read().await;
        if !state.runs.contains_key(&id) {
            return Err(Error::NotFound(format!("run {}", id)));
        }

        let Some(logs) = state.logs.get(&id) else {
            return Ok(LogPage {
                lines: Vec::new(),
                total: 0,
                dropped: 0,
            });
        };

        let matching: Vec<&RunLogLine> = logs
            .lines
            .iter()
            .filter(|l| job.is_none_or(|j| l.job == j))
            .collect();

        Ok(LogPage {
            total: matching.len(),
            lines: matching
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
            dropped: logs.dropped,
        })
    }
}

/// Mark a queued run cancelled. Returns false if it already left the queue.
pub(crate) fn cancel_queued(run: &mut WorkflowRun) -> bool {
    if run.status != RunStatus::Queued {
        return false;
    }
    let now = chrono::Utc::now();
    run.status = RunStatus::Cancelled;
    run.finished_at = Some(now);
    for job in &mut run.jobs {
        job.state = shipyard_core::run::JobState::Cancelled;
        job.finished_at = Some(now);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shipyard_core::event::RepositoryEvent;
    use shipyard_core::run::{JobRun, JobState};

    fn run(workflow: &str, status: RunStatus) -> WorkflowRun {
        WorkflowRun {
            id: ResourceId::new(),
            workflow: workflow.to_string(),
            number: 1,
            event: RepositoryEvent::push("commaai/openpilot", "master", "abc"),
            status,
            jobs: vec![JobRun::pending("plotjuggler")],
            concurrency_group: Some("tools-refs/heads/master".to_string()),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_numbers_per_workflow() {
        let store = RunStore::new(10, 10);
        assert_eq!(store.next_number("tools").await, 1);
        assert_eq!(store.next_number("tools").await, 2);
        assert_eq!(store.next_number("release").await, 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_filter() {
        let store = RunStore::new(10, 10);
        let a = run("tools", RunStatus::Queued);
        let b = run("release", RunStatus::Queued);
        let c = run("tools", RunStatus::Running);
        for r in [&a, &b, &c] {
            store.insert(r.clone()).await;
        }

        let all = store.list(&RunFilter::default()).await;
        assert_eq!(
            all.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![c.id, b.id, a.id]
        );

        let tools = store
            .list(&RunFilter {
                workflow: Some("tools".to_string()),
                limit: Some(1),
            })
            .await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, c.id);
    }

    #[tokio::test]
    async fn test_eviction_keeps_active_runs() {
        let store = RunStore::new(2, 10);
        let active = run("tools", RunStatus::Running);
        let done = run("tools", RunStatus::Succeeded);
        let newest = run("tools", RunStatus::Queued);
        store.insert(active.clone()).await;
        store.insert(done.clone()).await;
        store.insert(newest.clone()).await;

        assert!(store.get(active.id).await.is_some());
        assert!(store.get(done.id).await.is_none());
        assert!(store.get(newest.id).await.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let store = RunStore::new(2, 10);
        let result = store.update(ResourceId::new(), |_| ()).await;
        assert!(matches!(result.unwrap_err(), Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_logs_are_capped_and_paged() {
        let store = RunStore::new(10, 3);
        let r = run("tools", RunStatus::Running);
        store.insert(r.clone()).await;

        for i in 0..5 {
            let job = if i % 2 == 0 { "plotjuggler" } else { "simulator" };
            store
                .append_log(r.id, job, "test", LogLine::system(format!("line {}", i)))
                .await;
        }

        let page = store.logs(r.id, None, 0, 100).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.dropped, 2);

        let page = store.logs(r.id, Some("plotjuggler"), 1, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.lines.len(), 1);
        assert_eq!(page.lines[0].line.content, "line 2");

        assert!(store.logs(ResourceId::new(), None, 0, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_active_in_group() {
        let store = RunStore::new(10, 10);
        let running = run("tools", RunStatus::Running);
        let finished = run("tools", RunStatus::Cancelled);
        store.insert(running.clone()).await;
        store.insert(finished).await;

        assert_eq!(
            store.active_in_group("tools-refs/heads/master").await,
            vec![running.id]
        );
        assert!(store.active_in_group("other").await.is_empty());
    }

    #[test]
    fn test_cancel_queued() {
        let mut queued = run("tools", RunStatus::Queued);
        assert!(cancel_queued(&mut queued));
        assert_eq!(queued.status, RunStatus::Cancelled);
        assert_eq!(queued.jobs[0].state, JobState::Cancelled);

        let mut running = run("tools", RunStatus::Running);
        assert!(!cancel_queued(&mut running));
        assert_eq!(running.status, RunStatus::Running);
    }
}
