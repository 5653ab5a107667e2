//! In-memory run queue.

use shipyard_core::workflow::Workflow;
use shipyard_core::{Error, ResourceId, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

/// A run waiting for a worker.
#[derive(Debug, Clone)]
pub struct QueuedRun {
    pub run_id: ResourceId,
    /// Workflow definition as it was when the run was created.
    pub workflow: Arc<Workflow>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<QueuedRun>,
    closed: bool,
}

/// Bounded FIFO of runs waiting to execute.
#[derive(Debug)]
pub struct RunQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl RunQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Add a run to the back of the queue.
    pub async fn enqueue(&self, run: QueuedRun) -> Result<()> {
        self.enqueue_replacing(run, &[]).await
    }

    /// Add a run after dropping `replaced` from the queue. Their slots count
    /// as free, and nothing is dropped when the run is rejected.
    pub async fn enqueue_replacing(&self, run: QueuedRun, replaced: &[ResourceId]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Conflict("run queue is shut down".to_string()));
        }
        let waiting = state
            .pending
            .iter()
            .filter(|r| !replaced.contains(&r.run_id))
            .count();
        if waiting >= self.capacity {
            return Err(Error::Conflict(format!(
                "run queue is full ({} runs waiting)",
                self.capacity
            )));
        }
        state.pending.retain(|r| !replaced.contains(&r.run_id));
        state.pending.push_back(run);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next run. Returns `None` once the queue is closed; runs
    /// still waiting at that point are dropped.
    pub async fn claim(&self) -> Option<QueuedRun> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return None;
                }
                if let Some(run) = state.pending.pop_front() {
                    return Some(run);
                }
            }

            notified.await;
        }
    }

    /// Drop a waiting run. Returns false when no worker would have seen it.
    pub async fn remove(&self, run_id: ResourceId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.pending.len();
        state.pending.retain(|r| r.run_id != run_id);
        state.pending.len() != before
    }

    /// Stop handing out runs and wake every waiting worker.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
