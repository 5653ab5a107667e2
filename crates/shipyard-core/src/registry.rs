//! Container registry abstraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::{Error, Result};

/// Registry used when an image reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// A parsed image reference: `[registry/]repository[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() || reference.contains(char::is_whitespace) {
            return Err(Error::InvalidInput(format!(
                "invalid image reference: '{}'",
                reference
            )));
        }

        // Digests are kept as part of the repository; only tags are split.
        let (name, tag) = match reference.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') && !name.contains('@') => {
                (name, tag.to_string())
            }
            _ => (reference, "latest".to_string()),
        };

        // The first component is a registry host if it looks like one.
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        if repository.is_empty() || tag.is_empty() {
            return Err(Error::InvalidInput(format!(
                "invalid image reference: '{}'",
                reference
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
        })
    }

    /// Repository including the registry host, without the tag.
    pub fn name(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            self.repository.clone()
        } else {
            format!("{}/{}", self.registry, self.repository)
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name(), self.tag)
    }
}

/// Login for a registry host.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryCredentials {
    pub registry: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An image build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Context directory on the host.
    pub context: PathBuf,
    /// Dockerfile path relative to the context.
    pub dockerfile: String,
    pub tags: Vec<ImageRef>,
    /// Images whose layers seed the build cache.
    pub cache_from: Vec<ImageRef>,
    pub build_args: HashMap<String, String>,
    pub target: Option<String>,
}

/// Trait for container registry clients.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Pull an image.
    async fn pull(&self, image: &ImageRef, credentials: Option<&RegistryCredentials>)
    -> Result<()>;

    /// Build an image. Cache sources are pulled on a best-effort basis first.
    async fn build(
        &self,
        request: &BuildRequest,
        credentials: &[RegistryCredentials],
    ) -> Result<()>;

    /// Push an image.
    async fn push(&self, image: &ImageRef, credentials: Option<&RegistryCredentials>)
    -> Result<()>;

    /// Whether the image is present locally.
    async fn exists_locally(&self, image: &ImageRef) -> Result<bool>;
}
