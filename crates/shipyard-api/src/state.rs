//! Application state.

use shipyard_scheduler::Scheduler;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    /// Repositories accepted by the webhook endpoint, by lowercased name,
    /// with the secret their deliveries must be signed with.
    repositories: Arc<HashMap<String, Option<String>>>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            repositories: Arc::new(HashMap::new()),
        }
    }

    /// Accept webhooks for a repository. Without a secret its deliveries
    /// are taken unsigned.
    pub fn with_repository(mut self, repository: &str, secret: Option<String>) -> Self {
        Arc::make_mut(&mut self.repositories).insert(repository.to_ascii_lowercase(), secret);
        self
    }

    pub fn is_configured(&self, repository: &str) -> bool {
        self.repositories
            .contains_key(&repository.to_ascii_lowercase())
    }

    pub fn webhook_secret(&self, repository: &str) -> Option<&str> {
        self.repositories
            .get(&repository.to_ascii_lowercase())
            .and_then(|secret| secret.as_deref())
    }
}
