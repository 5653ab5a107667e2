//! Shipyard CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "shipyard")]
#[command(about = "Shipyard job orchestrator CLI", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "SHIPYARD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow file
    Validate {
        /// Path to the workflow file
        #[arg(default_value = "shipyard.kdl")]
        path: PathBuf,
    },
    /// Show which jobs and steps an event would run
    Plan {
        /// Path to the workflow file
        path: PathBuf,
        /// Event to simulate
        #[arg(long, value_enum, default_value_t = EventArg::Push)]
        event: EventArg,
        /// Git ref: a branch name, `refs/heads/...` or `refs/tags/...`
        #[arg(long = "ref", default_value = "master")]
        git_ref: String,
        /// Repository full name; defaults to the workflow's
        #[arg(long)]
        repo: Option<String>,
        /// Files touched by the event
        #[arg(long = "changed")]
        changed: Vec<String>,
        /// Pull request action
        #[arg(long, default_value = "opened")]
        action: String,
        /// Pull request base branch
        #[arg(long, default_value = "master")]
        base: String,
    },
    /// Run a workflow locally with Docker
    Run {
        /// Path to the workflow file
        path: PathBuf,
        /// Only run these jobs
        #[arg(long = "job")]
        jobs: Vec<String>,
        #[arg(long = "ref", default_value = "master")]
        git_ref: String,
        #[arg(long, default_value = "")]
        sha: String,
        /// Repository full name; defaults to the workflow's
        #[arg(long)]
        repo: Option<String>,
    },
    /// Manage runs on the server
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Start a run of a workflow on the server
    Trigger {
        /// Workflow name
        workflow: String,
        /// Branch to build
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        sha: Option<String>,
        #[arg(long)]
        repo: Option<String>,
    },
}

#[derive(Subcommand)]
enum RunCommands {
    /// List recent runs
    List {
        /// Workflow name
        #[arg(long)]
        workflow: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value = "10")]
        limit: usize,
    },
    /// Show run details
    Show {
        /// Run ID
        id: String,
    },
    /// Print logs from a run
    Logs {
        /// Run ID
        id: String,
        /// Only this job
        #[arg(long)]
        job: Option<String>,
        /// Keep polling until the run finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Cancel a queued or running run
    Cancel {
        /// Run ID
        id: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EventArg {
    Push,
    #[value(name = "pull_request", alias = "pull-request")]
    PullRequest,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let json = std::env::var("SHIPYARD_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Plan {
            path,
            event,
            git_ref,
            repo,
            changed,
            action,
            base,
        } => {
            let event = match event {
                EventArg::Push => commands::plan::PlanEvent::Push,
                EventArg::PullRequest => commands::plan::PlanEvent::PullRequest { action, base },
            };
            commands::plan::print_plan(&path, event, &git_ref, repo, changed)?;
        }
        Commands::Run {
            path,
            jobs,
            git_ref,
            sha,
            repo,
        } => {
            commands::run::run_local(&path, jobs, &git_ref, &sha, repo).await?;
        }
        Commands::Runs { command } => {
            let client = commands::client::ApiClient::new(&cli.api_url)?;
            match command {
                RunCommands::List { workflow, limit } => {
                    commands::runs::list(&client, workflow, limit).await?;
                }
                RunCommands::Show { id } => {
                    commands::runs::show(&client, &id).await?;
                }
                RunCommands::Logs { id, job, follow } => {
                    commands::runs::logs(&client, &id, job, follow).await?;
                }
                RunCommands::Cancel { id } => {
                    commands::runs::cancel(&client, &id).await?;
                }
            }
        }
        Commands::Trigger {
            workflow,
            branch,
            sha,
            repo,
        } => {
            let client = commands::client::ApiClient::new(&cli.api_url)?;
            commands::runs::trigger(&client, &workflow, branch, sha, repo).await?;
        }
    }

    Ok(())
}
