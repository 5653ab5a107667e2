//! Run creation, dispatch and cancellation.

use crate::orchestrator::{OrchestratorSettings, WorkflowOrchestrator};
use crate::queue::{QueuedRun, RunQueue};
use crate::store::{RunStore, cancel_queued};
use crate::trigger;
use crate::worker::Worker;
use chrono::Utc;
use shipyard_config::workflow::validate_workflow;
use shipyard_config::{SchedulerSettings, SystemConfig, VariableContextBuilder};
use shipyard_core::event::RepositoryEvent;
use shipyard_core::executor::Executor;
use shipyard_core::registry::RegistryClient;
use shipyard_core::run::{JobRun, RunEvent, RunStatus, WorkflowRun};
use shipyard_core::secret::SecretStore;
use shipyard_core::workflow::Workflow;
use shipyard_core::{Error, ResourceId, Result};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered run events per subscriber.
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub limits: SchedulerSettings,
    pub workspace_root: PathBuf,
    pub checkout_image: String,
    /// Run every job in this directory instead of a fresh checkout.
    pub local_workspace: Option<PathBuf>,
}

impl SchedulerConfig {
    pub fn from_system(config: &SystemConfig) -> Self {
        Self {
            limits: config.scheduler.clone(),
            workspace_root: config.executor.workspace_root.clone(),
            checkout_image: config.executor.checkout_image.clone(),
            local_workspace: None,
        }
    }

    pub fn with_local_workspace(mut self, dir: impl Into<PathBuf>) -> Self {
        self.local_workspace = Some(dir.into());
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_system(&SystemConfig::default())
    }
}

/// Cancellation tokens of runs that have not finished.
#[derive(Debug, Default)]
pub(crate) struct CancelRegistry {
    tokens: Mutex<HashMap<ResourceId, CancellationToken>>,
}

impl CancelRegistry {
    pub(crate) async fn register(&self, run_id: ResourceId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().await.insert(run_id, token.clone());
        token
    }

    pub(crate) async fn cancel(&self, run_id: ResourceId) -> bool {
        match self.tokens.lock().await.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) async fn cancel_all(&self) {
        for token in self.tokens.lock().await.values() {
            token.cancel();
        }
    }

    pub(crate) async fn remove(&self, run_id: ResourceId) {
        self.tokens.lock().await.remove(&run_id);
    }
}

struct Inner {
    config: SchedulerConfig,
    workflows: RwLock<BTreeMap<String, Arc<Workflow>>>,
    /// Clone URLs by lowercased repository name.
    clone_urls: RwLock<HashMap<String, String>>,
    store: Arc<RunStore>,
    queue: Arc<RunQueue>,
    events: broadcast::Sender<RunEvent>,
    cancels: Arc<CancelRegistry>,
    orchestrator: Arc<WorkflowOrchestrator>,
    executor: Arc<dyn Executor>,
}

/// Accepts events, queues runs and hands them to workers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn Executor>,
        registry: Arc<dyn RegistryClient>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let limits = &config.limits;
        let store = Arc::new(RunStore::new(limits.max_retained_runs, limits.max_log_lines));
        let queue = Arc::new(RunQueue::new(limits.queue_capacity));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let orchestrator = Arc::new(WorkflowOrchestrator::new(
            executor.clone(),
            registry,
            secrets,
            store.clone(),
            events.clone(),
            OrchestratorSettings {
                workspace_root: config.workspace_root.clone(),
                checkout_image: config.checkout_image.clone(),
                default_timeout: limits.default_timeout,
                max_concurrent_jobs: limits.max_concurrent_jobs,
                local_workspace: config.local_workspace.clone(),
            },
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                workflows: RwLock::new(BTreeMap::new()),
                clone_urls: RwLock::new(HashMap::new()),
                store,
                queue,
                events,
                cancels: Arc::new(CancelRegistry::default()),
                orchestrator,
                executor,
            }),
        }
    }

    /// Spawn the workers. They exit after [`Scheduler::shutdown`].
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        let count = self.inner.config.limits.max_concurrent_runs.max(1);
        info!(workers = count, "Starting scheduler");

        (0..count)
            .map(|i| {
                let worker = Worker::new(
                    format!("worker-{}", i),
                    self.inner.queue.clone(),
                    self.inner.store.clone(),
                    self.inner.orchestrator.clone(),
                    self.inner.cancels.clone(),
                );
                tokio::spawn(async move { worker.run().await })
            })
            .collect()
    }

    /// Stop accepting runs and cancel the ones in progress.
    pub async fn shutdown(&self) {
        info!("Shutting down scheduler");
        self.inner.queue.close().await;
        self.inner.cancels.cancel_all().await;
    }

    /// Add a workflow definition.
    pub async fn register(&self, workflow: Workflow) -> Result<()> {
        validate_workflow(&workflow).map_err(|e| Error::InvalidInput(e.to_string()))?;

        let mut workflows = self.inner.workflows.write().await;
        if workflows.contains_key(&workflow.name) {
            return Err(Error::Conflict(format!(
                "workflow '{}' is already registered",
                workflow.name
            )));
        }
        info!(workflow = %workflow.name, jobs = workflow.jobs.len(), "Registered workflow");
        workflows.insert(workflow.name.clone(), Arc::new(workflow));
        Ok(())
    }

    /// Clone URL used for events of this repository that carry none.
    pub async fn register_repository(&self, repository: &str, clone_url: impl Into<String>) {
        self.inner
            .clone_urls
            .write()
            .await
            .insert(repository.to_ascii_lowercase(), clone_url.into());
    }

    pub async fn workflows(&self) -> Vec<Arc<Workflow>> {
        self.inner.workflows.read().await.values().cloned().collect()
    }

    pub async fn workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.inner.workflows.read().await.get(name).cloned()
    }

    /// Queue a run for every workflow the event triggers.
    pub async fn dispatch(&self, event: RepositoryEvent) -> Result<Vec<ResourceId>> {
        let matching: Vec<Arc<Workflow>> = self
            .inner
            .workflows
            .read()
            .await
            .values()
            .filter(|wf| trigger::matches(wf, &event))
            .cloned()
            .collect();

        if matching.is_empty() {
            debug!(
                repository = %event.repository,
                git_ref = %event.git_ref,
                event = event.kind.name(),
                "No workflow matches event"
            );
            return Ok(Vec::new());
        }

        let mut run_ids = Vec::with_capacity(matching.len());
        for workflow in matching {
            run_ids.push(self.create_run(workflow, event.clone()).await?);
        }
        Ok(run_ids)
    }

    /// Queue a run of a named workflow, regardless of its triggers.
    pub async fn trigger(&self, workflow: &str, event: RepositoryEvent) -> Result<ResourceId> {
        let workflow = self
            .workflow(workflow)
            .await
            .ok_or_else(|| Error::NotFound(format!("workflow '{}'", workflow)))?;
        self.create_run(workflow, event).await
    }

    async fn create_run(
        &self,
        workflow: Arc<Workflow>,
        mut event: RepositoryEvent,
    ) -> Result<ResourceId> {
        if event.clone_url.is_none() {
            event.clone_url = self
                .inner
                .clone_urls
                .read()
                .await
                .get(&event.repository.to_ascii_lowercase())
                .cloned();
        }

        let number = self.inner.store.next_number(&workflow.name).await;
        let run_id = ResourceId::new();

        let mut superseded = Vec::new();
        let concurrency_group = match &workflow.concurrency {
            Some(policy) => {
                let vars = VariableContextBuilder::new()
                    .with_event(&event)
                    .with_workflow(&workflow.name)
                    .with_run(run_id.to_string(), number)
                    .build();
                let group = vars.interpolate(&policy.group);
                if policy.cancel_in_progress {
                    superseded = self.inner.store.active_in_group(&group).await;
                }
                Some(group)
            }
            None => None,
        };

        let run = WorkflowRun {
            id: run_id,
            workflow: workflow.name.clone(),
            number,
            event,
            status: RunStatus::Queued,
            jobs: workflow.jobs.iter().map(|j| JobRun::pending(&j.name)).collect(),
            concurrency_group,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        self.inner.store.insert(run).await;

        let cancel = self.inner.cancels.register(run_id).await;
        let queued = QueuedRun {
            run_id,
            workflow: workflow.clone(),
            cancel,
        };
        // Superseded runs are only cancelled once the new run holds a slot.
        if let Err(e) = self.inner.queue.enqueue_replacing(queued, &superseded).await {
            warn!(workflow = %workflow.name, error = %e, "Failed to queue run");
            self.inner.cancels.remove(run_id).await;
            self.inner.store.remove(run_id).await;
            return Err(e);
        }
        for active in superseded {
            info!(run_id = %active, superseded_by = %run_id, "Cancelling superseded run");
            if let Err(e) = self.cancel(active).await {
                debug!(run_id = %active, error = %e, "Superseded run already finished");
            }
        }

        info!(run_id = %run_id, workflow = %workflow.name, number, "Queued run");
        let _ = self.inner.events.send(RunEvent::RunQueued {
            run_id,
            workflow: workflow.name.clone(),
            number,
        });
        Ok(run_id)
    }

    /// Cancel a queued or running run.
    pub async fn cancel(&self, run_id: ResourceId) -> Result<()> {
        let was_queued = self
            .inner
            .store
            .update(run_id, |run| {
                if run.status.is_terminal() {
                    return Err(Error::Conflict(format!(
                        "run {} already finished ({})",
                        run_id,
                        run.status.label()
                    )));
                }
                Ok(cancel_queued(run))
            })
            .await??;

        self.inner.cancels.cancel(run_id).await;
        info!(run_id = %run_id, queued = was_queued, "Cancelled run");

        // Running runs report completion from their worker.
        if was_queued {
            self.inner.queue.remove(run_id).await;
            self.inner.cancels.remove(run_id).await;
            let _ = self.inner.events.send(RunEvent::RunCompleted {
                run_id,
                status: RunStatus::Cancelled,
            });
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    pub fn store(&self) -> &Arc<RunStore> {
        &self.inner.store
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.inner.executor
    }

    /// Runs waiting for a worker.
    pub async fn queue_depth(&self) -> usize {
        self.inner.queue.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockExecutor, MockRegistry};
    use shipyard_config::{StaticSecretStore, parse_workflow};
    use shipyard_core::event::EventKind;
    use std::time::Duration;

    fn scheduler(queue_capacity: usize) -> (Scheduler, tempfile::TempDir) {
        let workspace = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            limits: SchedulerSettings {
                queue_capacity,
                ..SchedulerSettings::default()
            },
            workspace_root: workspace.path().to_path_buf(),
            checkout_image: "alpine/git:latest".to_string(),
            local_workspace: None,
        };
        let scheduler = Scheduler::new(
            config,
            Arc::new(MockExecutor::default()),
            Arc::new(MockRegistry::default()),
            Arc::new(StaticSecretStore::default()),
        );
        (scheduler, workspace)
    }

    const TOOLS: &str = r#"
        workflow "tools"
        repository "commaai/openpilot"
        on "push" branches="master"
        on "pull_request"
        concurrency "tools-${git.ref}" cancel-in-progress=#true
        job "plotjuggler" {
            image "ubuntu:20.04"
            run "echo juggling"
        }
    "#;

    const RELEASE: &str = r#"
        workflow "release"
        repository "commaai/openpilot"
        on "push" tags="v*"
        job "publish" {
            image "alpine"
            run "echo publishing"
        }
    "#;

    async fn with_workflows(queue_capacity: usize) -> (Scheduler, tempfile::TempDir) {
        let (scheduler, dir) = scheduler(queue_capacity);
        scheduler.register(parse_workflow(TOOLS).unwrap()).await.unwrap();
        scheduler.register(parse_workflow(RELEASE).unwrap()).await.unwrap();
        (scheduler, dir)
    }

    fn master_push() -> RepositoryEvent {
        RepositoryEvent::push("commaai/openpilot", "refs/heads/master", "4f2c1d9e")
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates() {
        let (scheduler, _dir) = with_workflows(8).await;
        let err = scheduler
            .register(parse_workflow(TOOLS).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(scheduler.workflows().await.len(), 2);
    }

    #[tokio::test]
    async fn test_dispatch_queues_matching_workflows() {
        let (scheduler, _dir) = with_workflows(8).await;
        scheduler
            .register_repository("commaai/openpilot", "git@github.com:commaai/openpilot.git")
            .await;
        let mut events = scheduler.subscribe();

        let ids = scheduler.dispatch(master_push()).await.unwrap();
        assert_eq!(ids.len(), 1);

        let run = scheduler.store().get(ids[0]).await.unwrap();
        assert_eq!(run.workflow, "tools");
        assert_eq!(run.number, 1);
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.jobs.len(), 1);
        assert_eq!(run.concurrency_group.as_deref(), Some("tools-refs/heads/master"));
        assert_eq!(
            run.event.clone_url.as_deref(),
            Some("git@github.com:commaai/openpilot.git")
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            RunEvent::RunQueued { number: 1, .. }
        ));

        let tag = RepositoryEvent::push("commaai/openpilot", "refs/tags/v0.9.7", "abc");
        let ids = scheduler.dispatch(tag).await.unwrap();
        assert_eq!(scheduler.store().get(ids[0]).await.unwrap().workflow, "release");

        let feature = RepositoryEvent::push("commaai/openpilot", "refs/heads/feature", "abc");
        assert!(scheduler.dispatch(feature).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pull_request_dispatch() {
        let (scheduler, _dir) = with_workflows(8).await;
        let event = RepositoryEvent {
            kind: EventKind::PullRequest {
                number: 31337,
                action: "opened".to_string(),
                base_branch: "master".to_string(),
                head_branch: "feature".to_string(),
                from_fork: false,
            },
            ..RepositoryEvent::push("commaai/openpilot", "refs/pull/31337/merge", "abc")
        };
        let ids = scheduler.dispatch(event).await.unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn test_trigger_unknown_workflow() {
        let (scheduler, _dir) = with_workflows(8).await;
        let err = scheduler
            .trigger("nope", RepositoryEvent::manual("commaai/openpilot", "master", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_manual_trigger_bypasses_filters() {
        let (scheduler, _dir) = with_workflows(8).await;
        let event = RepositoryEvent::manual("commaai/openpilot", "feature", "abc");
        let id = scheduler.trigger("tools", event).await.unwrap();
        let run = scheduler.store().get(id).await.unwrap();
        assert_eq!(run.event.git_ref, "refs/heads/feature");
        assert_eq!(run.status, RunStatus::Queued);
    }

    #[tokio::test]
    async fn test_cancel_queued_run() {
        let (scheduler, _dir) = with_workflows(8).await;
        let id = scheduler.dispatch(master_push()).await.unwrap()[0];
        let mut events = scheduler.subscribe();

        scheduler.cancel(id).await.unwrap();
        let run = scheduler.store().get(id).await.unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(matches!(
            events.try_recv().unwrap(),
            RunEvent::RunCompleted {
                status: RunStatus::Cancelled,
                ..
            }
        ));

        let err = scheduler.cancel(id).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(matches!(
            scheduler.cancel(ResourceId::new()).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_cancel_in_progress_supersedes_group() {
        let (scheduler, _dir) = with_workflows(8).await;
        let first = scheduler.dispatch(master_push()).await.unwrap()[0];
        let second = scheduler.dispatch(master_push()).await.unwrap()[0];

        let store = scheduler.store();
        assert_eq!(store.get(first).await.unwrap().status, RunStatus::Cancelled);
        assert_eq!(store.get(second).await.unwrap().status, RunStatus::Queued);
        assert_eq!(store.get(second).await.unwrap().number, 2);
    }

    #[tokio::test]
    async fn test_supersede_on_full_queue_takes_the_slot() {
        let (scheduler, _dir) = with_workflows(1).await;
        let first = scheduler.dispatch(master_push()).await.unwrap()[0];
        let second = scheduler.dispatch(master_push()).await.unwrap()[0];

        let store = scheduler.store();
        assert_eq!(store.get(first).await.unwrap().status, RunStatus::Cancelled);
        assert_eq!(store.get(second).await.unwrap().status, RunStatus::Queued);
        assert_eq!(scheduler.queue_depth().await, 1);
    }

    #[tokio::test]
    async fn test_rejected_run_leaves_group_alone() {
        let (scheduler, _dir) = with_workflows(1).await;
        let first = scheduler.dispatch(master_push()).await.unwrap()[0];
        // Stand in for a worker picking the run up.
        assert_eq!(scheduler.inner.queue.claim().await.unwrap().run_id, first);
        scheduler
            .store()
            .update(first, |run| run.status = RunStatus::Running)
            .await
            .unwrap();
        scheduler
            .trigger("release", RepositoryEvent::manual("commaai/openpilot", "master", ""))
            .await
            .unwrap();

        let err = scheduler.dispatch(master_push()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(
            scheduler.store().get(first).await.unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn test_cancel_frees_queue_slot() {
        let (scheduler, _dir) = with_workflows(1).await;
        let event = || RepositoryEvent::manual("commaai/openpilot", "master", "");
        let id = scheduler.trigger("release", event()).await.unwrap();
        scheduler.cancel(id).await.unwrap();
        assert_eq!(scheduler.queue_depth().await, 0);
        scheduler.trigger("release", event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_rejects_run() {
        let (scheduler, _dir) = with_workflows(1).await;
        scheduler
            .trigger("release", RepositoryEvent::manual("commaai/openpilot", "master", ""))
            .await
            .unwrap();
        let err = scheduler
            .trigger("release", RepositoryEvent::manual("commaai/openpilot", "master", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let runs = scheduler.store().list(&Default::default()).await;
        assert_eq!(runs.len(), 1);
    }

    #[tokio::test]
    async fn test_workers_execute_runs() {
        let (scheduler, _dir) = with_workflows(8).await;
        let mut events = scheduler.subscribe();
        let workers = scheduler.start();

        let id = scheduler.dispatch(master_push()).await.unwrap()[0];

        let status = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(RunEvent::RunCompleted { run_id, status }) = events.recv().await {
                    if run_id == id {
                        return status;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(status, RunStatus::Succeeded);

        let run = scheduler.store().get(id).await.unwrap();
        assert!(run.started_at.is_some());
        assert!(run.finished_at.is_some());

        let logs = scheduler.store().logs(id, None, 0, 10).await.unwrap();
        assert_eq!(logs.lines[0].line.content, "juggling");

        scheduler.shutdown().await;
        for worker in workers {
            tokio::time::timeout(Duration::from_secs(1), worker)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
