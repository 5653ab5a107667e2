//! CLI command implementations.

pub mod client;
pub mod plan;
pub mod run;
pub mod runs;

use anyhow::Result;
use std::path::Path;

pub fn validate(path: &Path) -> Result<()> {
    match shipyard_config::load_workflow(path) {
        Ok(workflow) => {
            let steps: usize = workflow.jobs.iter().map(|j| j.steps.len()).sum();
            println!(
                "Workflow '{}' is valid ({} jobs, {} steps)",
                workflow.name,
                workflow.jobs.len(),
                steps
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
