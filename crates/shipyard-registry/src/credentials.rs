//! Registry credential resolution.

use shipyard_config::VariableContext;
use shipyard_core::registry::{DEFAULT_REGISTRY, ImageRef, RegistryCredentials};
use shipyard_core::workflow::RegistryAuth;
use tracing::warn;

/// Hostnames Docker Hub is known by.
const DOCKER_HUB_ALIASES: &[&str] = &[DEFAULT_REGISTRY, "index.docker.io", "registry-1.docker.io"];

fn canonical_host(host: &str) -> &str {
    if DOCKER_HUB_ALIASES.contains(&host) {
        DEFAULT_REGISTRY
    } else {
        host
    }
}

/// Maps an image's registry host to the login configured for it.
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    credentials: Vec<RegistryCredentials>,
}

impl CredentialResolver {
    pub fn new(credentials: Vec<RegistryCredentials>) -> Self {
        Self { credentials }
    }

    /// Interpolate a workflow's `registry` entries. Entries that still
    /// reference unknown variables after interpolation are dropped.
    pub fn from_workflow(registries: &[RegistryAuth], ctx: &VariableContext) -> Self {
        let credentials = registries
            .iter()
            .filter_map(|auth| {
                let username = ctx.interpolate(&auth.username);
                let password = ctx.interpolate(&auth.password);
                if username.contains("${") || password.contains("${") || password.is_empty() {
                    warn!(registry = %auth.registry, "Registry credentials unresolved, continuing anonymously");
                    return None;
                }
                Some(RegistryCredentials {
                    registry: canonical_host(&auth.registry).to_string(),
                    username,
                    password,
                })
            })
            .collect();
        Self { credentials }
    }

    pub fn for_host(&self, host: &str) -> Option<&RegistryCredentials> {
        let host = canonical_host(host);
        self.credentials.iter().find(|c| c.registry == host)
    }

    pub fn for_image(&self, image: &ImageRef) -> Option<&RegistryCredentials> {
        self.for_host(&image.registry)
    }

    pub fn all(&self) -> &[RegistryCredentials] {
        &self.credentials
    }
}
