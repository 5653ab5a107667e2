//! Secret storage abstraction.

use async_trait::async_trait;

use crate::Result;

/// Read-only secret lookup. Values never appear in logs.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Get a secret by name. Missing secrets are `Error::NotFound`.
    async fn get(&self, name: &str) -> Result<String>;

    /// Names of all known secrets.
    async fn list(&self) -> Result<Vec<String>>;
}
