//! Shipyard API server.

use anyhow::Context;
use clap::Parser;
use shipyard_api::{AppState, routes};
use shipyard_config::{EnvSecretStore, SystemConfig, load_workflow};
use shipyard_executor::LocalDockerExecutor;
use shipyard_registry::DockerRegistryClient;
use shipyard_scheduler::{Scheduler, SchedulerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long running jobs get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "shipyard-server")]
#[command(about = "Shipyard job orchestrator server", long_about = None)]
struct Args {
    /// Server configuration file
    #[arg(long, short, env = "SHIPYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Extra workflow files to register
    #[arg(long = "workflow", short)]
    workflows: Vec<PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("SHIPYARD_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => SystemConfig::default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid environment override")?;

    info!("Connecting to Docker...");
    let executor = Arc::new(LocalDockerExecutor::new().context("Failed to connect to Docker")?);
    let registry =
        Arc::new(DockerRegistryClient::new().context("Failed to connect to Docker")?);
    let secrets = Arc::new(EnvSecretStore::new(config.secret_prefix.clone()));

    let scheduler = Scheduler::new(
        SchedulerConfig::from_system(&config),
        executor,
        registry,
        secrets,
    );
    let mut state = AppState::new(scheduler.clone());

    for repo in &config.repositories {
        if let Some(url) = &repo.clone_url {
            scheduler.register_repository(&repo.full_name, url.clone()).await;
        }
        let secret = repo.webhook_secret();
        if secret.is_none() {
            warn!(repo = %repo.full_name, "No webhook secret; accepting unsigned deliveries");
        }
        state = state.with_repository(&repo.full_name, secret);
        for path in &repo.workflows {
            let mut workflow = load_workflow(path)
                .with_context(|| format!("Failed to load workflow: {}", path.display()))?;
            workflow
                .repository
                .get_or_insert_with(|| repo.full_name.clone());
            scheduler
                .register(workflow)
                .await
                .with_context(|| format!("Failed to register workflow: {}", path.display()))?;
        }
    }
    for path in &args.workflows {
        let workflow = load_workflow(path)
            .with_context(|| format!("Failed to load workflow: {}", path.display()))?;
        scheduler
            .register(workflow)
            .await
            .with_context(|| format!("Failed to register workflow: {}", path.display()))?;
    }

    let workers = scheduler.start();

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.listen);
    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    for worker in workers {
        if tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err() {
            warn!("Worker did not stop in time");
        }
    }
    info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
