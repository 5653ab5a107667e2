//! Run endpoints.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipyard_core::ResourceId;
use shipyard_core::run::{RunStatus, WorkflowRun};
use shipyard_scheduler::{LogPage, RunFilter};

use crate::AppState;
use crate::error::ApiError;

/// Upper bound for `limit` on list and log queries.
pub const MAX_PAGE_SIZE: usize = 1000;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_runs))
        .route("/{id}", get(get_run))
        .route("/{id}/logs", get(get_run_logs))
        .route("/{id}/cancel", post(cancel_run))
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    workflow: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    id: ResourceId,
    workflow: String,
    number: u64,
    status: RunStatus,
    repository: String,
    git_ref: String,
    sha: String,
    event: &'static str,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<WorkflowRun> for RunSummary {
    fn from(run: WorkflowRun) -> Self {
        Self {
            id: run.id,
            workflow: run.workflow,
            number: run.number,
            status: run.status,
            event: run.event.kind.name(),
            repository: run.event.repository,
            git_ref: run.event.git_ref,
            sha: run.event.sha,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
        }
    }
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Json<Vec<RunSummary>> {
    let filter = RunFilter {
        workflow: query.workflow,
        limit: Some(query.limit.unwrap_or(100).min(MAX_PAGE_SIZE)),
    };
    let runs = state.scheduler.store().list(&filter).await;
    Json(runs.into_iter().map(RunSummary::from).collect())
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<WorkflowRun>, ApiError> {
    state
        .scheduler
        .store()
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("run {}", id)))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    job: Option<String>,
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn get_run_logs(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogPage>, ApiError> {
    let limit = query.limit.unwrap_or(MAX_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let page = state
        .scheduler
        .store()
        .logs(id, query.job.as_deref(), query.offset, limit)
        .await?;
    Ok(Json(page))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    run_id: ResourceId,
    cancelled: bool,
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<Json<CancelResponse>, ApiError> {
    state.scheduler.cancel(id).await?;
    Ok(Json(CancelResponse {
        run_id: id,
        cancelled: true,
    }))
}

#[cfg(test)]
mod tests {
    use crate::routes::router;
    use crate::testing::{body_json, state};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use shipyard_core::ResourceId;
    use shipyard_core::event::RepositoryEvent;
    use shipyard_core::executor::LogLine;
    use tower::ServiceExt;

    async fn queued_run(state: &crate::AppState) -> ResourceId {
        state
            .scheduler
            .trigger(
                "tools",
                RepositoryEvent::manual("commaai/openpilot", "master", "4f2c1d9"),
            )
            .await
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_list_and_get_runs() {
        let state = state(true).await;
        let first = queued_run(&state).await;
        let second = queued_run(&state).await;

        let response = router(state.clone())
            .oneshot(get("/api/v1/runs?workflow=tools&limit=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], second.to_string());
        assert_eq!(body[0]["number"], 2);
        assert_eq!(body[0]["status"]["state"], "queued");

        let response = router(state)
            .oneshot(get(&format!("/api/v1/runs/{}", first)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["jobs"][0]["name"], "plotjuggler");
        assert_eq!(body["jobs"][1]["name"], "simulator");
    }

    #[tokio::test]
    async fn test_get_missing_run() {
        let state = state(true).await;
        let response = router(state.clone())
            .oneshot(get(&format!("/api/v1/runs/{}", ResourceId::new())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router(state)
            .oneshot(get("/api/v1/runs/not-a-uuid"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_logs_are_paged_and_filtered() {
        let state = state(true).await;
        let id = queued_run(&state).await;
        let store = state.scheduler.store();
        for i in 0..3 {
            store
                .append_log(id, "plotjuggler", "run-1", LogLine::system(format!("line {}", i)))
                .await;
        }
        store
            .append_log(id, "simulator", "run-1", LogLine::system("sim"))
            .await;

        let response = router(state.clone())
            .oneshot(get(&format!(
                "/api/v1/runs/{}/logs?job=plotjuggler&offset=1&limit=5000",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["lines"].as_array().unwrap().len(), 2);
        assert_eq!(body["lines"][0]["content"], "line 1");
        assert_eq!(body["lines"][0]["job"], "plotjuggler");
    }

    #[tokio::test]
    async fn test_cancel_twice_conflicts() {
        let state = state(true).await;
        let id = queued_run(&state).await;
        let cancel = || {
            Request::post(format!("/api/v1/runs/{}/cancel", id))
                .body(Body::empty())
                .unwrap()
        };

        let response = router(state.clone()).oneshot(cancel()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["cancelled"], true);

        let response = router(state.clone()).oneshot(cancel()).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = router(state)
            .oneshot(get(&format!("/api/v1/runs/{}", id)))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"]["state"], "cancelled");
    }
}
