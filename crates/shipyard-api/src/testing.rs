//! Fixtures for driving the router without Docker.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use shipyard_config::{StaticSecretStore, parse_workflow};
use shipyard_core::executor::*;
use shipyard_core::registry::{BuildRequest, ImageRef, RegistryClient, RegistryCredentials};
use shipyard_core::{Error, Result};
use shipyard_scheduler::{Scheduler, SchedulerConfig};
use std::sync::Arc;

use crate::AppState;

pub const WEBHOOK_SECRET: &str = "It's a Secret to Everybody";

/// Executor that refuses work. Runs stay queued since no worker is started.
pub struct OfflineExecutor {
    pub available: bool,
}

#[async_trait]
impl Executor for OfflineExecutor {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn spawn(&self, _spec: ContainerSpec) -> Result<ContainerHandle> {
        Err(Error::ExecutionFailed("offline".to_string()))
    }

    async fn logs(&self, _handle: &ContainerHandle) -> Result<BoxStream<'static, LogLine>> {
        Ok(Box::pin(stream::empty()))
    }

    async fn status(&self, _handle: &ContainerHandle) -> Result<ContainerStatus> {
        Ok(ContainerStatus::Pending)
    }

    async fn wait(&self, _handle: &ContainerHandle) -> Result<ContainerResult> {
        Err(Error::ExecutionFailed("offline".to_string()))
    }

    async fn cancel(&self, _handle: &ContainerHandle) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _handle: &ContainerHandle) -> Result<()> {
        Ok(())
    }
}

pub struct OfflineRegistry;

#[async_trait]
impl RegistryClient for OfflineRegistry {
    async fn pull(&self, _image: &ImageRef, _credentials: Option<&RegistryCredentials>) -> Result<()> {
        Ok(())
    }

    async fn build(&self, _request: &BuildRequest, _credentials: &[RegistryCredentials]) -> Result<()> {
        Ok(())
    }

    async fn push(&self, _image: &ImageRef, _credentials: Option<&RegistryCredentials>) -> Result<()> {
        Ok(())
    }

    async fn exists_locally(&self, _image: &ImageRef) -> Result<bool> {
        Ok(false)
    }
}

pub const TOOLS: &str = r#"
    workflow "tools"
    repository "commaai/openpilot"
    on "push" branches="master"
    on "pull_request"
    job "plotjuggler" {
        image "ubuntu:20.04"
        run "echo juggling"
    }
    job "simulator" needs="plotjuggler" {
        image "ubuntu:20.04"
        run "echo simulating"
    }
"#;

pub async fn state(available: bool) -> AppState {
    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        Arc::new(OfflineExecutor { available }),
        Arc::new(OfflineRegistry),
        Arc::new(StaticSecretStore::default()),
    );
    scheduler
        .register(parse_workflow(TOOLS).unwrap())
        .await
        .unwrap();
    AppState::new(scheduler)
        .with_repository("commaai/openpilot", Some(WEBHOOK_SECRET.to_string()))
        .with_repository("commaai/panda", None)
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
