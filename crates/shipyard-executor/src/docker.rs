//! Local Docker executor implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::{DateTime, Datelike, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use shipyard_core::executor::*;
use shipyard_core::{Error, ResourceId, Result};
use tracing::{debug, info, warn};

use crate::git::clone_script;

/// Seconds Docker waits after SIGTERM before killing a cancelled container.
const STOP_GRACE_SECS: i64 = 10;

/// Executor backed by the local Docker daemon.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn container_name(id: &ResourceId) -> String {
        format!("shipyard-{}", id)
    }

    /// Pull the image unless it is already present. Locally built images
    /// are never replaced by a registry copy.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image present locally");
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    return Err(Error::ExecutionFailed(format!(
                        "Failed to pull image {}: {}",
                        image, e
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Turn a spec into the container's entrypoint and command.
///
/// With a clone spec the whole thing runs as one `sh -c` script: the clone
/// first, then the user command from the clone directory.
fn build_command(spec: &ContainerSpec) -> (Option<Vec<String>>, Option<Vec<String>>) {
    match &spec.git_clone {
        Some(git) => {
            let mut script = clone_script(git);
            if !spec.command.is_empty() {
                script.push('\n');
                script.push_str(&spec.command.join(" "));
            }
            (
                Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                Some(vec![script]),
            )
        }
        None if spec.command.is_empty() => (None, None),
        None => (None, Some(spec.command.clone())),
    }
}

fn binds(volumes: &[VolumeMount]) -> Option<Vec<String>> {
    if volumes.is_empty() {
        return None;
    }
    Some(
        volumes
            .iter()
            .map(|v| {
                let mode = if v.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", v.source, v.mount_path, mode)
            })
            .collect(),
    )
}

/// Docker reports unset times as `0001-01-01T00:00:00Z`.
fn parse_docker_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .filter(|dt| dt.year() > 1)
}

/// Split a timestamped log chunk into lines.
fn split_log_chunk(stream: LogStream, message: &[u8]) -> Vec<LogLine> {
    String::from_utf8_lossy(message)
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let (timestamp, content) = match line.split_once(' ') {
                Some((ts, rest)) => match DateTime::parse_from_rfc3339(ts) {
                    Ok(dt) => (dt.with_timezone(&Utc), rest),
                    Err(_) => (Utc::now(), line),
                },
                None => (Utc::now(), line),
            };
            LogLine {
                timestamp,
                stream,
                content: content.trim_end().to_string(),
            }
        })
        .collect()
}

fn is_status(err: &DockerError, codes: &[u16]) -> bool {
    matches!(err, DockerError::DockerResponseServerError { status_code, .. } if codes.contains(status_code))
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: ContainerSpec) -> Result<ContainerHandle> {
        let container_name = Self::container_name(&spec.id);
        self.ensure_image(&spec.image).await?;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let (entrypoint, cmd) = build_command(&spec);

        let mut labels = spec.labels.clone();
        labels.insert("shipyard.container".to_string(), spec.id.to_string());

        let host_config = HostConfig {
            binds: binds(&spec.volumes),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint,
            cmd,
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, image = %spec.image, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start container: {}", e)))?;

        Ok(ContainerHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &ContainerHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(&container_name, Some(options))
            .filter_map(|result| async move {
                match result {
                    Ok(LogOutput::StdErr { message }) => {
                        Some(split_log_chunk(LogStream::Stderr, &message))
                    }
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::Console { message })
                    | Ok(LogOutput::StdIn { message }) => {
                        Some(split_log_chunk(LogStream::Stdout, &message))
                    }
                    Err(e) => {
                        warn!(error = %e, "Log stream error");
                        None
                    }
                }
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    async fn status(&self, handle: &ContainerHandle) -> Result<ContainerStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("Container has no state".to_string()))?;

        let started_at = parse_docker_time(state.started_at);

        let status = if state.running.unwrap_or(false) {
            ContainerStatus::Running {
                started_at: started_at.unwrap_or_else(Utc::now),
            }
        } else if started_at.is_none() || state.paused.unwrap_or(false) {
            ContainerStatus::Pending
        } else {
            let finished_at = parse_docker_time(state.finished_at).unwrap_or_else(Utc::now);
            match state.exit_code {
                Some(0) => ContainerStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                },
                exit_code => ContainerStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| match exit_code {
                            Some(code) => format!("exited with code {}", code),
                            None => "exited".to_string(),
                        }),
                },
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<ContainerResult> {
        let container_name = Self::container_name(&handle.id);

        let current = self.status(handle).await?;
        if current.is_terminal() {
            let exit_code = match &current {
                ContainerStatus::Succeeded { .. } => Some(0),
                ContainerStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            return Ok(ContainerResult {
                status: current,
                exit_code,
            });
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));

        // Non-zero exits surface as an error carrying the code.
        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(container = %container_name, error = %e, "Wait error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        debug!(container = %container_name, exit_code = ?exit_code, "Container exited");

        Ok(ContainerResult { status, exit_code })
    }

    async fn cancel(&self, handle: &ContainerHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);
        info!(container = %container_name, "Stopping container");

        match self
            .docker
            .stop_container(
                &container_name,
                Some(StopContainerOptions {
                    t: STOP_GRACE_SECS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped, 404: already gone
            Err(e) if is_status(&e, &[304, 404]) => Ok(()),
            Err(e) => Err(Error::ExecutionFailed(format!(
                "Failed to stop container: {}",
                e
            ))),
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(&container_name, Some(options))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, &[404]) => Ok(()),
            Err(e) => Err(Error::ExecutionFailed(format!(
                "Failed to remove container: {}",
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_test_spec() -> ContainerSpec {
        ContainerSpec {
            id: ResourceId::new(),
            image: "alpine:latest".to_string(),
            command: vec!["echo".to_string(), "hello".to_string()],
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            env: HashMap::from([("FOO".to_string(), "bar".to_string())]),
            volumes: vec![],
            git_clone: None,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_container_name_generation() {
        let id = ResourceId::new();
        let name = LocalDockerExecutor::container_name(&id);
        assert_eq!(name, format!("shipyard-{}", id));
        assert_eq!(name, LocalDockerExecutor::container_name(&id));
        assert_ne!(name, LocalDockerExecutor::container_name(&ResourceId::new()));
    }

    #[test]
    fn test_plain_command_is_passed_through() {
        let spec = make_test_spec();
        let (entrypoint, cmd) = build_command(&spec);
        assert!(entrypoint.is_none());
        assert_eq!(cmd, Some(vec!["echo".to_string(), "hello".to_string()]));
    }

    #[test]
    fn test_empty_command_uses_image_default() {
        let mut spec = make_test_spec();
        spec.command.clear();
        assert_eq!(build_command(&spec), (None, None));
    }

    #[test]
    fn test_clone_runs_before_command() {
        let mut spec = make_test_spec();
        spec.git_clone = Some(GitCloneSpec {
            url: "https://github.com/commaai/openpilot.git".to_string(),
            branch: Some("master".to_string()),
            sha: None,
            target_dir: WORKSPACE_MOUNT.to_string(),
            depth: Some(1),
            submodules: true,
            lfs: true,
            access_token: None,
        });

        let (entrypoint, cmd) = build_command(&spec);
        assert_eq!(
            entrypoint,
            Some(vec!["/bin/sh".to_string(), "-c".to_string()])
        );
        let script = &cmd.unwrap()[0];
        let fetch = script.find("git fetch").unwrap();
        let echo = script.find("echo hello").unwrap();
        assert!(fetch < echo);
        assert!(script.contains("git lfs pull"));
    }

    #[test]
    fn test_binds() {
        assert!(binds(&[]).is_none());
        let binds = binds(&[
            VolumeMount {
                source: "/srv/ws/run-1".to_string(),
                mount_path: "/workspace".to_string(),
                read_only: false,
            },
            VolumeMount {
                source: "/srv/cache".to_string(),
                mount_path: "/cache".to_string(),
                read_only: true,
            },
        ])
        .unwrap();
        assert_eq!(binds[0], "/srv/ws/run-1:/workspace:rw");
        assert_eq!(binds[1], "/srv/cache:/cache:ro");
    }

    #[test]
    fn test_parse_docker_time() {
        assert!(parse_docker_time(Some("0001-01-01T00:00:00Z".to_string())).is_none());
        assert!(parse_docker_time(None).is_none());
        let parsed = parse_docker_time(Some("2024-05-01T12:30:00.123456789Z".to_string()));
        assert_eq!(parsed.unwrap().year(), 2024);
    }

    #[test]
    fn test_split_log_chunk() {
        let lines = split_log_chunk(
            LogStream::Stderr,
            b"2024-05-01T12:30:00.000000001Z first\n2024-05-01T12:30:01Z second  \n",
        );
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].content, "first");
        assert_eq!(lines[1].content, "second");
        assert_eq!(lines[0].stream, LogStream::Stderr);
        assert_eq!(lines[0].timestamp.year(), 2024);

        let plain = split_log_chunk(LogStream::Stdout, b"no timestamp here");
        assert_eq!(plain[0].content, "no timestamp here");
    }
}

/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::collections::HashMap;

    fn shell_spec(script: &str) -> ContainerSpec {
        ContainerSpec {
            id: ResourceId::new(),
            image: "alpine:latest".to_string(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            working_dir: None,
            env: HashMap::new(),
            volumes: vec![],
            git_clone: None,
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_is_available() {
        let executor = LocalDockerExecutor::new().unwrap();
        assert_eq!(executor.name(), "docker");
        assert!(executor.is_available().await);
    }

    #[tokio::test]
    #[ignore]
    async fn test_container_lifecycle() {
        let executor = LocalDockerExecutor::new().unwrap();
        let mut spec = shell_spec("echo $MY_VAR");
        spec.env.insert("MY_VAR".to_string(), "hello_world".to_string());

        let handle = executor.spawn(spec).await.expect("Should spawn container");
        let result = executor.wait(&handle).await.expect("Should wait");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.succeeded());

        let mut logs = executor.logs(&handle).await.expect("Should get logs");
        let mut found = false;
        while let Some(line) = logs.next().await {
            found |= line.content.contains("hello_world");
        }
        assert!(found, "Should find environment variable in output");

        executor.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_failing_container() {
        let executor = LocalDockerExecutor::new().unwrap();
        let handle = executor.spawn(shell_spec("exit 42")).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(42));
        match result.status {
            ContainerStatus::Failed { exit_code, .. } => assert_eq!(exit_code, Some(42)),
            other => panic!("Expected Failed, got {:?}", other),
        }
        executor.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_cancel_and_remove() {
        let executor = LocalDockerExecutor::new().unwrap();
        let handle = executor.spawn(shell_spec("sleep 300")).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let status = executor.status(&handle).await.unwrap();
        assert!(matches!(status, ContainerStatus::Running { .. }));

        executor.cancel(&handle).await.unwrap();
        executor.remove(&handle).await.unwrap();
        assert!(executor.status(&handle).await.is_err());
        // Removing twice is fine.
        executor.remove(&handle).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_workspace_mount() {
        let executor = LocalDockerExecutor::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut spec = shell_spec("echo built > /workspace/out.txt");
        spec.volumes.push(VolumeMount {
            source: dir.path().display().to_string(),
            mount_path: WORKSPACE_MOUNT.to_string(),
            read_only: false,
        });

        let handle = executor.spawn(spec).await.unwrap();
        assert!(executor.wait(&handle).await.unwrap().succeeded());
        executor.remove(&handle).await.unwrap();

        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "built");
    }
}
