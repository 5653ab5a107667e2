//! Workflow orchestrator - executes the jobs of one run.
//!
//! Jobs start together and compete for the shared job slots; `needs` holds a
//! job back until its dependencies finish. Steps within a job run in order
//! and share one workspace directory mounted at `/workspace`.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::future::join_all;
use shipyard_config::secrets::resolve_secrets;
use shipyard_config::workflow::referenced_secrets;
use shipyard_config::{VariableContext, VariableContextBuilder, condition};
use shipyard_core::event::RepositoryEvent;
use shipyard_core::executor::{
    ContainerHandle, ContainerSpec, ContainerStatus, Executor, GitCloneSpec, LogLine,
    VolumeMount, WORKSPACE_MOUNT,
};
use shipyard_core::registry::{BuildRequest, ImageRef, RegistryClient};
use shipyard_core::run::{JobState, RunEvent, RunStatus, StepResult, StepStatus, WorkflowRun};
use shipyard_core::secret::SecretStore;
use shipyard_core::workflow::{JobDefinition, Step, StepAction, Workflow};
use shipyard_core::{Error, ResourceId, Result};
use shipyard_registry::CredentialResolver;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Secret handed to checkouts as the clone token, when defined.
pub const GIT_TOKEN_SECRET: &str = "GIT_TOKEN";

/// How long to keep reading logs after a container exits.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Parent of the per-run workspace directories.
    pub workspace_root: PathBuf,
    pub checkout_image: String,
    pub default_timeout: Duration,
    /// Containers in flight across all runs.
    pub max_concurrent_jobs: usize,
    /// Use this directory as every job's workspace and skip checkouts.
    pub local_workspace: Option<PathBuf>,
}

/// Data shared by every job of a run.
struct RunScope {
    run_id: ResourceId,
    event: RepositoryEvent,
    vars: VariableContext,
    credentials: CredentialResolver,
    cancel: CancellationToken,
    workspace: PathBuf,
}

/// The step a job is in and the container it waits on.
#[derive(Debug, Default)]
struct ActiveStep {
    step: Option<(String, DateTime<Utc>)>,
    container: Option<ContainerHandle>,
}

type ActiveSlot = Arc<Mutex<ActiveStep>>;

/// Result of one step.
struct StepOutcome {
    status: StepStatus,
    exit_code: Option<i64>,
}

impl StepOutcome {
    fn succeeded(exit_code: Option<i64>) -> Self {
        Self {
            status: StepStatus::Succeeded,
            exit_code,
        }
    }

    fn failed(message: impl Into<String>, exit_code: Option<i64>) -> Self {
        Self {
            status: StepStatus::Failed {
                message: message.into(),
            },
            exit_code,
        }
    }
}

impl From<Result<()>> for StepOutcome {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::succeeded(None),
            Err(e) => Self::failed(e.to_string(), None),
        }
    }
}

/// Writes masked log lines to the store and the event stream.
#[derive(Clone)]
struct LogSink {
    store: Arc<crate::RunStore>,
    events: broadcast::Sender<RunEvent>,
    run_id: ResourceId,
    job: String,
    step: String,
    vars: Arc<VariableContext>,
}

impl LogSink {
    async fn write(&self, mut line: LogLine) {
        line.content = self.vars.mask(&line.content);
        self.store
            .append_log(self.run_id, &self.job, &self.step, line.clone())
            .await;
        let _ = self.events.send(RunEvent::StepLog {
            run_id: self.run_id,
            job: self.job.clone(),
            step: self.step.clone(),
            line,
        });
    }
}

/// Orchestrates the execution of workflow runs.
pub struct WorkflowOrchestrator {
    executor: Arc<dyn Executor>,
    registry: Arc<dyn RegistryClient>,
    secrets: Arc<dyn SecretStore>,
    store: Arc<crate::RunStore>,
    events: broadcast::Sender<RunEvent>,
    job_slots: Arc<Semaphore>,
    settings: OrchestratorSettings,
}

impl WorkflowOrchestrator {
    pub fn new(
        executor: Arc<dyn Executor>,
        registry: Arc<dyn RegistryClient>,
        secrets: Arc<dyn SecretStore>,
        store: Arc<crate::RunStore>,
        events: broadcast::Sender<RunEvent>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            job_slots: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            executor,
            registry,
            secrets,
            store,
            events,
            settings,
        }
    }

    /// Execute a run that a worker has already marked running.
    pub async fn execute(
        &self,
        run_id: ResourceId,
        workflow: Arc<Workflow>,
        cancel: CancellationToken,
    ) -> Result<RunStatus> {
        let run = self
            .store
            .get(run_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("run {}", run_id)))?;

        info!(run_id = %run_id, workflow = %workflow.name, number = run.number, "Starting run");
        self.emit(RunEvent::RunStarted { run_id });

        let scope = self.run_scope(&run, &workflow, cancel).await;

        // Each job publishes its final state for the jobs that need it.
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for job in &workflow.jobs {
            let (tx, rx) = watch::channel(None::<JobState>);
            senders.insert(job.name.clone(), tx);
            receivers.insert(job.name.clone(), rx);
        }

        let jobs: Vec<_> = workflow
            .jobs
            .iter()
            .map(|job| {
                let tx = senders.remove(&job.name);
                let deps: Vec<_> = job
                    .needs
                    .iter()
                    .filter_map(|name| receivers.get(name).map(|rx| (name.clone(), rx.clone())))
                    .collect();
                let scope = &scope;
                async move {
                    let (state, ok) = self.run_job(scope, job, deps).await;
                    if let Some(tx) = tx {
                        let _ = tx.send(Some(state));
                    }
                    (job.name.clone(), ok)
                }
            })
            .collect();
        let outcomes = join_all(jobs).await;

        let status = if scope.cancel.is_cancelled() {
            RunStatus::Cancelled
        } else {
            let failed: Vec<String> = outcomes
                .into_iter()
                .filter(|(_, ok)| !ok)
                .map(|(name, _)| name)
                .collect();
            if failed.is_empty() {
                RunStatus::Succeeded
            } else {
                RunStatus::Failed { jobs: failed }
            }
        };

        let final_status = status.clone();
        self.update_run(run_id, move |run| {
            run.status = final_status;
            run.finished_at = Some(Utc::now());
        })
        .await;

        if self.settings.local_workspace.is_none() {
            if let Err(e) = tokio::fs::remove_dir_all(&scope.workspace).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(run_id = %run_id, error = %e, "Failed to remove run workspace");
                }
            }
        }

        info!(run_id = %run_id, status = status.label(), "Run completed");
        self.emit(RunEvent::RunCompleted {
            run_id,
            status: status.clone(),
        });
        Ok(status)
    }

    async fn run_scope(
        &self,
        run: &WorkflowRun,
        workflow: &Workflow,
        cancel: CancellationToken,
    ) -> RunScope {
        let mut vars = VariableContextBuilder::new()
            .with_event(&run.event)
            .with_workflow(&workflow.name)
            .with_run(run.id.to_string(), run.number)
            .build();

        // Fork code runs with no secrets and clones without the token.
        if run.event.from_fork() {
            info!(run_id = %run.id, repo = %run.event.repository, "Pull request from a fork, withholding secrets");
        } else {
            let mut wanted = referenced_secrets(workflow);
            let has_checkout = workflow
                .jobs
                .iter()
                .flat_map(|j| &j.steps)
                .any(|s| matches!(s.action, StepAction::Checkout { .. }));
            if has_checkout
                && self
                    .secrets
                    .list()
                    .await
                    .is_ok_and(|names| names.iter().any(|n| n == GIT_TOKEN_SECRET))
            {
                wanted.insert(GIT_TOKEN_SECRET.to_string());
            }
            vars.secrets = resolve_secrets(self.secrets.as_ref(), wanted).await;
        }
        vars.extend_env(&workflow.env);

        let credentials = CredentialResolver::from_workflow(&workflow.registries, &vars);
        let workspace = match &self.settings.local_workspace {
            Some(dir) => dir.clone(),
            None => self.settings.workspace_root.join(run.id.to_string()),
        };

        RunScope {
            run_id: run.id,
            event: run.event.clone(),
            vars,
            credentials,
            cancel,
            workspace,
        }
    }

    /// Run one job to completion. The flag says whether the job counts as
    /// successful for the run status.
    async fn run_job(
        &self,
        scope: &RunScope,
        job: &JobDefinition,
        deps: Vec<(String, watch::Receiver<Option<JobState>>)>,
    ) -> (JobState, bool) {
        for (name, mut rx) in deps {
            let state = tokio::select! {
                _ = scope.cancel.cancelled() => {
                    return self.finish_job(scope, job, JobState::Cancelled, false).await;
                }
                state = async { rx.wait_for(Option::is_some).await.ok().and_then(|s| (*s).clone()) } => state,
            };
            if !state.is_some_and(|s| s.is_success()) {
                let reason = format!("dependency '{}' did not succeed", name);
                info!(run_id = %scope.run_id, job = %job.name, %reason, "Skipping job");
                return self
                    .finish_job(scope, job, JobState::Skipped { reason }, false)
                    .await;
            }
        }

        let mut vars = scope.vars.clone();
        vars.job = job.name.clone();
        vars.extend_env(&job.env);

        if let Some(when) = &job.when {
            match condition::evaluate(&when.expression, &vars) {
                Ok(true) => {}
                Ok(false) => {
                    let reason = format!("condition not met: {}", when.expression);
                    info!(run_id = %scope.run_id, job = %job.name, "Job condition not met, skipping");
                    return self
                        .finish_job(scope, job, JobState::Skipped { reason }, true)
                        .await;
                }
                Err(e) => {
                    let state = JobState::Failed {
                        message: e.to_string(),
                    };
                    return self.finish_job(scope, job, state, false).await;
                }
            }
        }

        let _permit = tokio::select! {
            _ = scope.cancel.cancelled() => {
                return self.finish_job(scope, job, JobState::Cancelled, false).await;
            }
            permit = self.job_slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    let state = JobState::Failed { message: "scheduler is shutting down".to_string() };
                    return self.finish_job(scope, job, state, false).await;
                }
            },
        };

        self.update_job(scope.run_id, &job.name, |j| {
            j.state = JobState::Running;
            j.started_at = Some(Utc::now());
        })
        .await;
        info!(run_id = %scope.run_id, job = %job.name, "Starting job");
        self.emit(RunEvent::JobStarted {
            run_id: scope.run_id,
            job: job.name.clone(),
        });

        let workspace = match &self.settings.local_workspace {
            Some(dir) => dir.clone(),
            None => scope.workspace.join(workspace_dir_name(&job.name)),
        };
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            let state = JobState::Failed {
                message: format!("failed to create workspace: {}", e),
            };
            return self.finish_job(scope, job, state, false).await;
        }

        let timeout = job.timeout_or(self.settings.default_timeout);
        let active = ActiveSlot::default();

        let state = tokio::select! {
            _ = scope.cancel.cancelled() => {
                info!(run_id = %scope.run_id, job = %job.name, "Job cancelled");
                self.abort_active(scope, job, &active, StepStatus::Cancelled).await;
                self.skip_unfinished_steps(scope, job, "job cancelled").await;
                JobState::Cancelled
            }
            result = tokio::time::timeout(timeout, self.run_steps(scope, job, &vars, &workspace, &active)) => {
                match result {
                    Ok(state) => state,
                    Err(_) => {
                        warn!(run_id = %scope.run_id, job = %job.name, timeout_secs = timeout.as_secs(), "Job timed out");
                        let status = StepStatus::Failed {
                            message: format!("timed out after {}s", timeout.as_secs()),
                        };
                        self.abort_active(scope, job, &active, status).await;
                        self.skip_unfinished_steps(scope, job, "job timed out").await;
                        JobState::TimedOut { after: timeout }
                    }
                }
            }
        };

        let ok = state.is_success();
        self.finish_job(scope, job, state, ok).await
    }

    async fn run_steps(
        &self,
        scope: &RunScope,
        job: &JobDefinition,
        job_vars: &VariableContext,
        workspace: &Path,
        active: &ActiveSlot,
    ) -> JobState {
        let mut failure: Option<(String, String)> = None;

        for step in &job.steps {
            if let Some((failed_step, _)) = &failure {
                let reason = format!("step '{}' failed", failed_step);
                self.record_step(scope, job, skipped(&step.name, reason))
                    .await;
                continue;
            }

            let mut vars = job_vars.clone();
            vars.step = step.name.clone();
            vars.extend_env(&step.env);

            if let Some(when) = &step.when {
                match condition::evaluate(&when.expression, &vars) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(run_id = %scope.run_id, job = %job.name, step = %step.name, "Step condition not met");
                        let reason = format!("condition not met: {}", when.expression);
                        self.record_step(scope, job, skipped(&step.name, reason))
                            .await;
                        continue;
                    }
                    Err(e) => {
                        failure = Some((step.name.clone(), e.to_string()));
                        self.record_step(
                            scope,
                            job,
                            StepResult {
                                name: step.name.clone(),
                                status: StepStatus::Failed {
                                    message: e.to_string(),
                                },
                                exit_code: None,
                                started_at: None,
                                finished_at: Some(Utc::now()),
                            },
                        )
                        .await;
                        continue;
                    }
                }
            }

            if self.settings.local_workspace.is_some()
                && matches!(step.action, StepAction::Checkout { .. })
            {
                self.record_step(scope, job, skipped(&step.name, "using local workspace"))
                    .await;
                continue;
            }

            let started_at = Utc::now();
            active.lock().await.step = Some((step.name.clone(), started_at));
            info!(
                run_id = %scope.run_id,
                job = %job.name,
                step = %step.name,
                kind = step.action.kind(),
                "Starting step"
            );
            self.emit(RunEvent::StepStarted {
                run_id: scope.run_id,
                job: job.name.clone(),
                step: step.name.clone(),
            });

            let sink = LogSink {
                store: self.store.clone(),
                events: self.events.clone(),
                run_id: scope.run_id,
                job: job.name.clone(),
                step: step.name.clone(),
                vars: Arc::new(vars.clone()),
            };
            let outcome = self
                .run_step(scope, job, step, &vars, workspace, active, &sink)
                .await;
            active.lock().await.step = None;

            if let StepStatus::Failed { message } = &outcome.status {
                warn!(run_id = %scope.run_id, job = %job.name, step = %step.name, error = %message, "Step failed");
                failure = Some((step.name.clone(), message.clone()));
            }

            self.record_step(
                scope,
                job,
                StepResult {
                    name: step.name.clone(),
                    status: outcome.status,
                    exit_code: outcome.exit_code,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                },
            )
            .await;
        }

        match failure {
            None => JobState::Succeeded,
            Some((step, message)) => JobState::Failed {
                message: format!("step '{}': {}", step, message),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        scope: &RunScope,
        job: &JobDefinition,
        step: &Step,
        vars: &VariableContext,
        workspace: &Path,
        active: &ActiveSlot,
        sink: &LogSink,
    ) -> StepOutcome {
        match &step.action {
            StepAction::Run {
                command,
                image,
                shell,
            } => {
                let Some(image) = image.as_ref().or(job.image.as_ref()) else {
                    return StepOutcome::failed("no image for run step", None);
                };
                let mut argv: Vec<String> = shell.split_whitespace().map(String::from).collect();
                argv.push("-c".to_string());
                argv.push(vars.interpolate(command));

                let spec = self.container_spec(
                    scope,
                    job,
                    step,
                    vars,
                    workspace,
                    vars.interpolate(image),
                    argv,
                    None,
                );
                self.run_container(spec, active, sink).await
            }
            StepAction::Checkout {
                lfs,
                submodules,
                depth,
            } => {
                let git = GitCloneSpec {
                    url: vars.repo.url.clone(),
                    branch: Some(scope.event.git_ref.clone()),
                    sha: Some(scope.event.sha.clone()).filter(|s| !s.is_empty()),
                    target_dir: WORKSPACE_MOUNT.to_string(),
                    depth: *depth,
                    submodules: *submodules,
                    lfs: *lfs,
                    access_token: vars.secrets.get(GIT_TOKEN_SECRET).cloned(),
                };
                sink.write(LogLine::system(format!(
                    "Checking out {} at {}",
                    git.url,
                    git.sha.as_deref().unwrap_or(&scope.event.git_ref)
                )))
                .await;

                let spec = self.container_spec(
                    scope,
                    job,
                    step,
                    vars,
                    workspace,
                    self.settings.checkout_image.clone(),
                    Vec::new(),
                    Some(git),
                );
                self.run_container(spec, active, sink).await
            }
            StepAction::ImagePull { image } => self.pull_image(scope, vars, image, sink).await.into(),
            StepAction::ImageBuild {
                context,
                dockerfile,
                tags,
                cache_from,
                build_args,
                target,
            } => {
                let request = match build_request(
                    vars,
                    workspace,
                    context,
                    dockerfile,
                    tags,
                    cache_from,
                    build_args,
                    target.as_deref(),
                ) {
                    Ok(request) => request,
                    Err(e) => return StepOutcome::failed(e.to_string(), None),
                };
                let names: Vec<String> = request.tags.iter().map(ToString::to_string).collect();
                sink.write(LogLine::system(format!("Building {}", names.join(", "))))
                    .await;
                self.registry
                    .build(&request, scope.credentials.all())
                    .await
                    .into()
            }
            StepAction::ImagePush { image } => self.push_image(scope, vars, image, sink).await.into(),
        }
    }

    async fn pull_image(
        &self,
        scope: &RunScope,
        vars: &VariableContext,
        image: &str,
        sink: &LogSink,
    ) -> Result<()> {
        let image = ImageRef::parse(&vars.interpolate(image))?;
        sink.write(LogLine::system(format!("Pulling {}", image))).await;
        self.registry
            .pull(&image, scope.credentials.for_image(&image))
            .await
    }

    async fn push_image(
        &self,
        scope: &RunScope,
        vars: &VariableContext,
        image: &str,
        sink: &LogSink,
    ) -> Result<()> {
        let image = ImageRef::parse(&vars.interpolate(image))?;
        sink.write(LogLine::system(format!("Pushing {}", image))).await;
        self.registry
            .push(&image, scope.credentials.for_image(&image))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn container_spec(
        &self,
        scope: &RunScope,
        job: &JobDefinition,
        step: &Step,
        vars: &VariableContext,
        workspace: &Path,
        image: String,
        command: Vec<String>,
        git_clone: Option<GitCloneSpec>,
    ) -> ContainerSpec {
        let mut env = vars.env.clone();
        let event = &scope.event;
        for (key, value) in [
            ("CI", "true".to_string()),
            ("SHIPYARD", "true".to_string()),
            ("SHIPYARD_RUN_ID", scope.run_id.to_string()),
            ("SHIPYARD_RUN_NUMBER", vars.run.number.to_string()),
            ("SHIPYARD_WORKFLOW", vars.workflow.clone()),
            ("SHIPYARD_JOB", job.name.clone()),
            ("SHIPYARD_REPOSITORY", event.repository.clone()),
            ("SHIPYARD_REF", event.git_ref.clone()),
            ("SHIPYARD_SHA", event.sha.clone()),
            ("SHIPYARD_EVENT", event.kind.name().to_string()),
            ("SHIPYARD_WORKSPACE", WORKSPACE_MOUNT.to_string()),
        ] {
            env.entry(key.to_string()).or_insert(value);
        }

        let labels = HashMap::from([
            ("shipyard.run-id".to_string(), scope.run_id.to_string()),
            ("shipyard.workflow".to_string(), vars.workflow.clone()),
            ("shipyard.job".to_string(), job.name.clone()),
            ("shipyard.step".to_string(), step.name.clone()),
        ]);

        ContainerSpec {
            id: ResourceId::new(),
            image,
            command,
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            env,
            volumes: vec![VolumeMount {
                source: workspace.display().to_string(),
                mount_path: WORKSPACE_MOUNT.to_string(),
                read_only: false,
            }],
            git_clone,
            labels,
        }
    }

    /// Spawn a container, forward its logs and wait for it to exit.
    async fn run_container(
        &self,
        spec: ContainerSpec,
        active: &ActiveSlot,
        sink: &LogSink,
    ) -> StepOutcome {
        // Registered before spawning so an abort mid-spawn still cleans up.
        active.lock().await.container = Some(ContainerHandle {
            id: spec.id,
            executor_id: String::new(),
            executor_name: self.executor.name().to_string(),
        });

        let image = spec.image.clone();
        let handle = match self.executor.spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(handle) = active.lock().await.container.take() {
                    let _ = self.executor.remove(&handle).await;
                }
                return StepOutcome::failed(e.to_string(), None);
            }
        };
        active.lock().await.container = Some(handle.clone());
        debug!(container = %handle.executor_id, image = %image, "Container started");

        let log_task = match self.executor.logs(&handle).await {
            Ok(mut stream) => {
                let sink = sink.clone();
                Some(tokio::spawn(async move {
                    while let Some(line) = stream.next().await {
                        sink.write(line).await;
                    }
                }))
            }
            Err(e) => {
                warn!(container = %handle.executor_id, error = %e, "Failed to follow logs");
                None
            }
        };

        let result = self.executor.wait(&handle).await;

        if let Some(mut task) = log_task {
            if tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut task).await.is_err() {
                debug!(container = %handle.executor_id, "Log stream still open after exit");
                task.abort();
            }
        }

        if let Err(e) = self.executor.remove(&handle).await {
            warn!(container = %handle.executor_id, error = %e, "Failed to remove container");
        }
        active.lock().await.container = None;

        match result {
            Ok(result) if result.succeeded() => StepOutcome::succeeded(result.exit_code),
            Ok(result) => {
                let message = match result.status {
                    ContainerStatus::Failed { message, .. } => message,
                    ContainerStatus::Cancelled { .. } => "container was cancelled".to_string(),
                    other => format!("container ended in unexpected state: {:?}", other),
                };
                StepOutcome::failed(message, result.exit_code)
            }
            Err(e) => StepOutcome::failed(e.to_string(), None),
        }
    }

    /// Stop whatever container the job was waiting on and close out its step.
    async fn abort_active(
        &self,
        scope: &RunScope,
        job: &JobDefinition,
        active: &ActiveSlot,
        status: StepStatus,
    ) {
        let current = std::mem::take(&mut *active.lock().await);

        if let Some(handle) = current.container {
            if let Err(e) = self.executor.cancel(&handle).await {
                warn!(run_id = %scope.run_id, job = %job.name, error = %e, "Failed to stop container");
            }
            if let Err(e) = self.executor.remove(&handle).await {
                warn!(run_id = %scope.run_id, job = %job.name, error = %e, "Failed to remove container");
            }
        }

        if let Some((name, started_at)) = current.step {
            self.record_step(
                scope,
                job,
                StepResult {
                    name,
                    status,
                    exit_code: None,
                    started_at: Some(started_at),
                    finished_at: Some(Utc::now()),
                },
            )
            .await;
        }
    }

    /// Mark steps that never produced a result as skipped.
    async fn skip_unfinished_steps(&self, scope: &RunScope, job: &JobDefinition, reason: &str) {
        let Some(run) = self.store.get(scope.run_id).await else {
            return;
        };
        let done: Vec<String> = run
            .job(&job.name)
            .map(|j| j.steps.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default();

        for step in job.steps.iter().filter(|s| !done.contains(&s.name)) {
            self.record_step(scope, job, skipped(&step.name, reason))
                .await;
        }
    }

    async fn record_step(&self, scope: &RunScope, job: &JobDefinition, result: StepResult) {
        let stored = result.clone();
        self.update_job(scope.run_id, &job.name, move |j| j.steps.push(stored))
            .await;
        self.emit(RunEvent::StepCompleted {
            run_id: scope.run_id,
            job: job.name.clone(),
            result,
        });
    }

    async fn finish_job(
        &self,
        scope: &RunScope,
        job: &JobDefinition,
        state: JobState,
        ok: bool,
    ) -> (JobState, bool) {
        let stored = state.clone();
        self.update_job(scope.run_id, &job.name, move |j| {
            j.state = stored;
            j.finished_at = Some(Utc::now());
        })
        .await;
        info!(run_id = %scope.run_id, job = %job.name, state = state.label(), "Job finished");
        self.emit(RunEvent::JobCompleted {
            run_id: scope.run_id,
            job: job.name.clone(),
            state: state.clone(),
        });
        (state, ok)
    }

    async fn update_job(
        &self,
        run_id: ResourceId,
        job: &str,
        f: impl FnOnce(&mut shipyard_core::run::JobRun),
    ) {
        let result = self
            .store
            .update(run_id, |run| run.job_mut(job).map(f).is_some())
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => error!(run_id = %run_id, job = %job, "Job missing from run record"),
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to update run"),
        }
    }

    async fn update_run(&self, run_id: ResourceId, f: impl FnOnce(&mut WorkflowRun)) {
        if let Err(e) = self.store.update(run_id, f).await {
            warn!(run_id = %run_id, error = %e, "Failed to update run");
        }
    }

    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

fn skipped(name: &str, reason: impl Into<String>) -> StepResult {
    StepResult {
        name: name.to_string(),
        status: StepStatus::Skipped {
            reason: reason.into(),
        },
        exit_code: None,
        started_at: None,
        finished_at: None,
    }
}

fn workspace_dir_name(job: &str) -> String {
    job.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Resolve a path inside the workspace, refusing anything that escapes it.
fn workspace_path(workspace: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(Error::InvalidInput(format!(
            "path '{}' must stay inside the workspace",
            relative.display()
        )));
    }
    Ok(workspace.join(relative))
}

#[allow(clippy::too_many_arguments)]
fn build_request(
    vars: &VariableContext,
    workspace: &Path,
    context: &str,
    dockerfile: &str,
    tags: &[String],
    cache_from: &[String],
    build_args: &HashMap<String, String>,
    target: Option<&str>,
) -> Result<BuildRequest> {
    let parse_all = |refs: &[String]| -> Result<Vec<ImageRef>> {
        refs.iter()
            .map(|r| ImageRef::parse(&vars.interpolate(r)))
            .collect()
    };

    Ok(BuildRequest {
        context: workspace_path(workspace, &vars.interpolate(context))?,
        dockerfile: vars.interpolate(dockerfile),
        tags: parse_all(tags)?,
        cache_from: parse_all(cache_from)?,
        build_args: vars.interpolate_map(build_args),
        target: target.map(|t| vars.interpolate(t)),
    })
}
