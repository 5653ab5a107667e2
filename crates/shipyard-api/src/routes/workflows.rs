//! Workflow endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use shipyard_core::ResourceId;
use shipyard_core::event::RepositoryEvent;
use shipyard_core::workflow::{Trigger, Workflow};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workflows))
        .route("/{name}", get(get_workflow))
        .route("/{name}/runs", post(trigger_run))
}

#[derive(Debug, Serialize)]
struct WorkflowResponse {
    name: String,
    repository: Option<String>,
    triggers: Vec<Trigger>,
    concurrency_group: Option<String>,
    jobs: Vec<JobResponse>,
}

#[derive(Debug, Serialize)]
struct JobResponse {
    name: String,
    image: Option<String>,
    needs: Vec<String>,
    timeout_secs: Option<u64>,
    steps: Vec<StepResponse>,
}

#[derive(Debug, Serialize)]
struct StepResponse {
    name: String,
    kind: &'static str,
}

// Registry logins stay out of responses.
impl From<&Workflow> for WorkflowResponse {
    fn from(workflow: &Workflow) -> Self {
        Self {
            name: workflow.name.clone(),
            repository: workflow.repository.clone(),
            triggers: workflow.triggers.clone(),
            concurrency_group: workflow.concurrency.as_ref().map(|c| c.group.clone()),
            jobs: workflow
                .jobs
                .iter()
                .map(|job| JobResponse {
                    name: job.name.clone(),
                    image: job.image.clone(),
                    needs: job.needs.clone(),
                    timeout_secs: job.timeout.map(|t| t.as_secs()),
                    steps: job
                        .steps
                        .iter()
                        .map(|step| StepResponse {
                            name: step.name.clone(),
                            kind: step.action.kind(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

async fn list_workflows(State(state): State<AppState>) -> Json<Vec<WorkflowResponse>> {
    let workflows = state.scheduler.workflows().await;
    Json(workflows.iter().map(|w| w.as_ref().into()).collect())
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = state
        .scheduler
        .workflow(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("workflow '{}'", name)))?;
    Ok(Json(workflow.as_ref().into()))
}

#[derive(Debug, Default, Deserialize)]
struct TriggerRunRequest {
    /// Required when the workflow is not bound to a repository.
    repository: Option<String>,
    /// Branch name or full ref. Defaults to `master`.
    #[serde(default, alias = "ref")]
    branch: Option<String>,
    #[serde(default)]
    sha: Option<String>,
}

#[derive(Debug, Serialize)]
struct TriggerRunResponse {
    run_id: ResourceId,
}

/// Start a run by hand, ignoring the workflow's triggers.
async fn trigger_run(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<TriggerRunRequest>>,
) -> Result<(StatusCode, Json<TriggerRunResponse>), ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let workflow = state
        .scheduler
        .workflow(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("workflow '{}'", name)))?;

    let repository = request
        .repository
        .or_else(|| workflow.repository.clone())
        .ok_or_else(|| {
            ApiError::BadRequest(format!(
                "workflow '{}' is not bound to a repository; pass one",
                name
            ))
        })?;

    let event = RepositoryEvent::manual(
        repository,
        request.branch.unwrap_or_else(|| "master".to_string()),
        request.sha.unwrap_or_default(),
    );
    let run_id = state.scheduler.trigger(&name, event).await?;

    Ok((StatusCode::ACCEPTED, Json(TriggerRunResponse { run_id })))
}
