//! Container registry access for Shipyard.
//!
//! - [`DockerRegistryClient`]: pull, build and push through the Docker daemon
//! - [`context`]: build context archives honoring `.dockerignore`
//! - [`CredentialResolver`]: per-host logins from workflow `registry` entries

pub mod context;
pub mod credentials;
pub mod docker;

pub use credentials::CredentialResolver;
pub use docker::DockerRegistryClient;
pub use shipyard_core::registry::{BuildRequest, ImageRef, RegistryClient, RegistryCredentials};
