//! Run scheduling for the Shipyard job orchestrator.
//!
//! Matches repository events to workflows, queues runs in memory and
//! executes them on a fixed pool of workers.

pub mod orchestrator;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod trigger;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use orchestrator::{OrchestratorSettings, WorkflowOrchestrator};
pub use queue::{QueuedRun, RunQueue};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{LogPage, RunFilter, RunLogLine, RunStore};
pub use worker::Worker;
