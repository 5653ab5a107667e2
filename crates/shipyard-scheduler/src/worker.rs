//! Worker that executes runs from the queue.

use crate::orchestrator::WorkflowOrchestrator;
use crate::queue::{QueuedRun, RunQueue};
use crate::scheduler::CancelRegistry;
use crate::store::RunStore;
use chrono::Utc;
use shipyard_core::run::RunStatus;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A worker that claims and executes runs one at a time.
pub struct Worker {
    id: String,
    queue: Arc<RunQueue>,
    store: Arc<RunStore>,
    orchestrator: Arc<WorkflowOrchestrator>,
    cancels: Arc<CancelRegistry>,
}

impl Worker {
    pub(crate) fn new(
        id: impl Into<String>,
        queue: Arc<RunQueue>,
        store: Arc<RunStore>,
        orchestrator: Arc<WorkflowOrchestrator>,
        cancels: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            store,
            orchestrator,
            cancels,
        }
    }

    /// Run the worker loop until the queue closes.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "Starting worker");

        while let Some(run) = self.queue.claim().await {
            self.process(run).await;
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, queued: QueuedRun) {
        let run_id = queued.run_id;

        // A run cancelled while queued is already terminal; leave it alone.
        let cancel = queued.cancel.clone();
        let started = self
            .store
            .update(run_id, |run| {
                if run.status != RunStatus::Queued || cancel.is_cancelled() {
                    return false;
                }
                run.status = RunStatus::Running;
                run.started_at = Some(Utc::now());
                true
            })
            .await;

        match started {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker_id = %self.id, run_id = %run_id, "Run no longer queued, skipping");
                self.cancels.remove(run_id).await;
                return;
            }
            Err(e) => {
                warn!(worker_id = %self.id, run_id = %run_id, error = %e, "Claimed run is missing");
                self.cancels.remove(run_id).await;
                return;
            }
        }

        info!(worker_id = %self.id, run_id = %run_id, workflow = %queued.workflow.name, "Claimed run");

        match self
            .orchestrator
            .execute(run_id, queued.workflow, queued.cancel)
            .await
        {
            Ok(status) => {
                info!(worker_id = %self.id, run_id = %run_id, status = status.label(), "Run finished")
            }
            Err(e) => warn!(worker_id = %self.id, run_id = %run_id, error = %e, "Run failed to execute"),
        }

        self.cancels.remove(run_id).await;
    }
}
