//! Secret stores.

use async_trait::async_trait;
use shipyard_core::secret::SecretStore;
use shipyard_core::{Error, Result};
use std::collections::HashMap;

/// Prefix for secrets read from the process environment.
pub const DEFAULT_SECRET_PREFIX: &str = "SHIPYARD_SECRET_";

/// Secrets read from environment variables: `REGISTRY_TOKEN` is looked up
/// as `SHIPYARD_SECRET_REGISTRY_TOKEN`.
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EnvSecretStore {
    fn default() -> Self {
        Self::new(DEFAULT_SECRET_PREFIX)
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, name: &str) -> Result<String> {
        std::env::var(format!("{}{}", self.prefix, name))
            .map_err(|_| Error::NotFound(format!("secret '{}'", name)))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = std::env::vars()
            .filter_map(|(key, _)| key.strip_prefix(&self.prefix).map(String::from))
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Fixed in-memory secrets.
#[derive(Debug, Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn get(&self, name: &str) -> Result<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("secret '{}'", name)))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.secrets.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Fetch the named secrets. Missing ones are logged and left out.
pub async fn resolve_secrets(
    store: &dyn SecretStore,
    names: impl IntoIterator<Item = String>,
) -> HashMap<String, String> {
    let mut resolved = HashMap::new();
    for name in names {
        match store.get(&name).await {
            Ok(value) => {
                resolved.insert(name, value);
            }
            Err(e) => {
                tracing::warn!(secret = %name, error = %e, "Secret could not be resolved");
            }
        }
    }
    resolved
}
