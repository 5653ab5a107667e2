//! Scripted executor and registry used by the scheduler tests.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use shipyard_core::executor::*;
use shipyard_core::registry::{BuildRequest, ImageRef, RegistryClient, RegistryCredentials};
use shipyard_core::{Error, ResourceId, Result};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct MockExecutorState {
    pub specs: Vec<ContainerSpec>,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub cancelled: Vec<ResourceId>,
    pub removed: Vec<ResourceId>,
}

/// Executor whose containers behave according to their shell script:
/// `sleep` never exits, `exit N` exits with N, `echo X` prints X, anything
/// else succeeds after a short delay.
#[derive(Debug)]
pub struct MockExecutor {
    pub state: Mutex<MockExecutorState>,
    pub delay: Duration,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::with_delay(Duration::from_millis(10))
    }
}

impl MockExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            state: Mutex::new(MockExecutorState::default()),
            delay,
        }
    }

    pub fn specs(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().specs.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    pub fn cancelled(&self) -> Vec<ResourceId> {
        self.state.lock().unwrap().cancelled.clone()
    }

    pub fn removed(&self) -> Vec<ResourceId> {
        self.state.lock().unwrap().removed.clone()
    }

    fn script(&self, id: &ResourceId) -> Option<ContainerSpec> {
        self.state
            .lock()
            .unwrap()
            .specs
            .iter()
            .find(|s| s.id == *id)
            .cloned()
    }
}

fn script_of(spec: &ContainerSpec) -> String {
    spec.command.last().cloned().unwrap_or_default()
}

#[async_trait]
impl Executor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn spawn(&self, spec: ContainerSpec) -> Result<ContainerHandle> {
        if spec.image.starts_with("missing/") {
            return Err(Error::ExecutionFailed(format!("no such image: {}", spec.image)));
        }
        let mut state = self.state.lock().unwrap();
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);
        let handle = ContainerHandle {
            id: spec.id,
            executor_id: format!("mock-{}", spec.id.short()),
            executor_name: "mock".to_string(),
        };
        state.specs.push(spec);
        Ok(handle)
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<BoxStream<'static, LogLine>> {
        let spec = self
            .script(&handle.id)
            .ok_or_else(|| Error::NotFound(handle.id.to_string()))?;

        let mut lines: Vec<LogLine> = script_of(&spec)
            .lines()
            .filter_map(|l| l.trim().strip_prefix("echo "))
            .map(|text| LogLine {
                timestamp: Utc::now(),
                stream: LogStream::Stdout,
                content: text.trim_matches('\'').to_string(),
            })
            .collect();
        if let Some(git) = &spec.git_clone {
            lines.push(LogLine {
                timestamp: Utc::now(),
                stream: LogStream::Stdout,
                content: format!("checked out {}", git.sha.clone().unwrap_or_default()),
            });
        }
        Ok(Box::pin(stream::iter(lines)))
    }

    async fn status(&self, _handle: &ContainerHandle) -> Result<ContainerStatus> {
        Ok(ContainerStatus::Running {
            started_at: Utc::now(),
        })
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ContainerResult> {
        let spec = self
            .script(&handle.id)
            .ok_or_else(|| Error::NotFound(handle.id.to_string()))?;
        let script = script_of(&spec);

        if script.contains("sleep") {
            futures::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;

        let exit_code = script
            .split_whitespace()
            .skip_while(|w| *w != "exit")
            .nth(1)
            .and_then(|code| code.parse::<i64>().ok())
            .unwrap_or(0);

        let now = Utc::now();
        let status = if exit_code == 0 {
            ContainerStatus::Succeeded {
                started_at: now,
                finished_at: now,
            }
        } else {
            ContainerStatus::Failed {
                started_at: Some(now),
                finished_at: now,
                exit_code: Some(exit_code),
                message: format!("exited with code {}", exit_code),
            }
        };
        Ok(ContainerResult {
            status,
            exit_code: Some(exit_code),
        })
    }

    async fn cancel(&self, handle: &ContainerHandle) -> Result<()> {
        self.state.lock().unwrap().cancelled.push(handle.id);
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.removed.contains(&handle.id) && state.specs.iter().any(|s| s.id == handle.id) {
            state.in_flight -= 1;
        }
        state.removed.push(handle.id);
        Ok(())
    }
}

/// Registry that records operations. Repositories containing "broken" fail.
#[derive(Debug, Default)]
pub struct MockRegistry {
    pub operations: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub fn operations(&self) -> Vec<String> {
        self.operations.lock().unwrap().clone()
    }

    fn record(&self, op: &str, image: &ImageRef, authenticated: bool) -> Result<()> {
        if image.repository.contains("broken") {
            return Err(Error::Registry(format!("{} {}: denied", op, image)));
        }
        let suffix = if authenticated { " (auth)" } else { "" };
        self.operations
            .lock()
            .unwrap()
            .push(format!("{} {}{}", op, image, suffix));
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn pull(&self, image: &ImageRef, credentials: Option<&RegistryCredentials>) -> Result<()> {
        self.record("pull", image, credentials.is_some())
    }

    async fn build(&self, request: &BuildRequest, credentials: &[RegistryCredentials]) -> Result<()> {
        for tag in &request.tags {
            self.record("build", tag, !credentials.is_empty())?;
        }
        Ok(())
    }

    async fn push(&self, image: &ImageRef, credentials: Option<&RegistryCredentials>) -> Result<()> {
        self.record("push", image, credentials.is_some())
    }

    async fn exists_locally(&self, _image: &ImageRef) -> Result<bool> {
        Ok(true)
    }
}
