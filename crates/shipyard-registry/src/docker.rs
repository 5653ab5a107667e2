//! Registry operations through the local Docker daemon.

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::errors::Error as DockerError;
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions, TagImageOptions};
use bytes::Bytes;
use futures::StreamExt;
use shipyard_core::registry::*;
use shipyard_core::{Error, Result};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::context::archive_context_blocking;

/// Address Docker expects for Docker Hub logins.
const DOCKER_HUB_AUTH_ADDRESS: &str = "https://index.docker.io/v1/";

pub struct DockerRegistryClient {
    docker: Docker,
}

impl DockerRegistryClient {
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn server_address(registry: &str) -> String {
    if registry == DEFAULT_REGISTRY {
        DOCKER_HUB_AUTH_ADDRESS.to_string()
    } else {
        registry.to_string()
    }
}

fn docker_credentials(credentials: &RegistryCredentials) -> DockerCredentials {
    DockerCredentials {
        username: Some(credentials.username.clone()),
        password: Some(credentials.password.clone()),
        serveraddress: Some(server_address(&credentials.registry)),
        ..Default::default()
    }
}

fn build_options(request: &BuildRequest) -> Result<BuildImageOptions<String>> {
    let tag = request
        .tags
        .first()
        .ok_or_else(|| Error::InvalidInput("image build needs at least one tag".to_string()))?;

    Ok(BuildImageOptions {
        dockerfile: request.dockerfile.clone(),
        t: tag.to_string(),
        cachefrom: request.cache_from.iter().map(ToString::to_string).collect(),
        buildargs: request.build_args.clone(),
        target: request.target.clone().unwrap_or_default(),
        rm: true,
        ..Default::default()
    })
}

fn find_credentials<'a>(
    credentials: &'a [RegistryCredentials],
    image: &ImageRef,
) -> Option<&'a RegistryCredentials> {
    credentials.iter().find(|c| c.registry == image.registry)
}

#[async_trait]
impl RegistryClient for DockerRegistryClient {
    async fn pull(
        &self,
        image: &ImageRef,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.name(),
            tag: image.tag.clone(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .create_image(Some(options), None, credentials.map(docker_credentials));
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::Registry(format!("pull {}: {}", image, e)))?;
            if let Some(error) = info.error {
                return Err(Error::Registry(format!("pull {}: {}", image, error)));
            }
            if let Some(status) = info.status {
                debug!(image = %image, status = %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn build(&self, request: &BuildRequest, credentials: &[RegistryCredentials]) -> Result<()> {
        let options = build_options(request)?;

        for cache in &request.cache_from {
            if let Err(e) = self.pull(cache, find_credentials(credentials, cache)).await {
                warn!(image = %cache, error = %e, "Cache image unavailable, building without it");
            }
        }

        let context =
            archive_context_blocking(request.context.clone(), request.dockerfile.clone()).await?;
        let registry_config: HashMap<String, DockerCredentials> = credentials
            .iter()
            .map(|c| (server_address(&c.registry), docker_credentials(c)))
            .collect();

        info!(
            context = %request.context.display(),
            dockerfile = %request.dockerfile,
            tag = %options.t,
            "Building image"
        );

        let mut stream = self.docker.build_image(
            options,
            (!registry_config.is_empty()).then_some(registry_config),
            Some(Bytes::from(context)),
        );
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::Registry(format!("build: {}", e)))?;
            if let Some(error) = info.error {
                return Err(Error::Registry(format!("build: {}", error)));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(line = %line, "Build output");
                }
            }
        }

        // The daemon applies one tag per build; the rest are aliases.
        let primary = request.tags[0].to_string();
        for extra in &request.tags[1..] {
            let options = TagImageOptions {
                repo: extra.name(),
                tag: extra.tag.clone(),
            };
            self.docker
                .tag_image(&primary, Some(options))
                .await
                .map_err(|e| Error::Registry(format!("tag {}: {}", extra, e)))?;
        }

        Ok(())
    }

    async fn push(
        &self,
        image: &ImageRef,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<()> {
        info!(image = %image, "Pushing image");
        let options = PushImageOptions {
            tag: image.tag.clone(),
        };

        let mut stream = self.docker.push_image(
            &image.name(),
            Some(options),
            credentials.map(docker_credentials),
        );
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| Error::Registry(format!("push {}: {}", image, e)))?;
            if let Some(error) = info.error {
                return Err(Error::Registry(format!("push {}: {}", image, error)));
            }
            if let Some(status) = info.status {
                debug!(image = %image, status = %status, "Push progress");
            }
        }
        Ok(())
    }

    async fn exists_locally(&self, image: &ImageRef) -> Result<bool> {
        match self.docker.inspect_image(&image.to_string()).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(Error::Registry(format!("inspect {}: {}", image, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request() -> BuildRequest {
        BuildRequest {
            context: PathBuf::from("."),
            dockerfile: "Dockerfile.openpilot_base".to_string(),
            tags: vec![
                ImageRef::parse("ghcr.io/commaai/openpilot-base:latest").unwrap(),
                ImageRef::parse("ghcr.io/commaai/openpilot-base:abc1234").unwrap(),
            ],
            cache_from: vec![ImageRef::parse("ghcr.io/commaai/openpilot-base:latest").unwrap()],
            build_args: HashMap::from([("BUILDKIT_INLINE_CACHE".to_string(), "1".to_string())]),
            target: None,
        }
    }

    #[test]
    fn test_build_options() {
        let options = build_options(&request()).unwrap();
        assert_eq!(options.t, "ghcr.io/commaai/openpilot-base:latest");
        assert_eq!(options.dockerfile, "Dockerfile.openpilot_base");
        assert_eq!(options.cachefrom, vec!["ghcr.io/commaai/openpilot-base:latest"]);
        assert_eq!(options.buildargs["BUILDKIT_INLINE_CACHE"], "1");
        assert!(options.target.is_empty());
        assert!(options.rm);
    }

    #[test]
    fn test_build_requires_tag() {
        let mut request = request();
        request.tags.clear();
        assert!(matches!(
            build_options(&request).unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_docker_credentials() {
        let creds = RegistryCredentials {
            registry: "docker.io".to_string(),
            username: "bot".to_string(),
            password: "pw".to_string(),
        };
        let docker = docker_credentials(&creds);
        assert_eq!(docker.serveraddress.as_deref(), Some(DOCKER_HUB_AUTH_ADDRESS));
        assert_eq!(docker.username.as_deref(), Some("bot"));

        let ghcr = RegistryCredentials {
            registry: "ghcr.io".to_string(),
            ..creds
        };
        assert_eq!(docker_credentials(&ghcr).serveraddress.as_deref(), Some("ghcr.io"));
    }

    #[tokio::test]
    #[ignore]
    async fn test_pull_and_exists() {
        let client = DockerRegistryClient::new().unwrap();
        let image = ImageRef::parse("alpine:latest").unwrap();
        client.pull(&image, None).await.unwrap();
        assert!(client.exists_locally(&image).await.unwrap());

        let missing = ImageRef::parse("shipyard/does-not-exist:never").unwrap();
        assert!(!client.exists_locally(&missing).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_build_from_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("Dockerfile"),
            "FROM alpine:latest\nCOPY hello.txt /hello.txt\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("hello.txt"), "hi").unwrap();

        let client = DockerRegistryClient::new().unwrap();
        let tag = ImageRef::parse("shipyard-test/hello:latest").unwrap();
        let request = BuildRequest {
            context: dir.path().to_path_buf(),
            dockerfile: "Dockerfile".to_string(),
            tags: vec![tag.clone()],
            cache_from: vec![],
            build_args: HashMap::new(),
            target: None,
        };
        client.build(&request, &[]).await.unwrap();
        assert!(client.exists_locally(&tag).await.unwrap());
    }
}
